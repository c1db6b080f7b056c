//! Per-device root context
//!
//! Builds every service once (governor, fetcher, scheduler, network monitor,
//! engine), restores persisted state through the engine, and turns inbound
//! control messages into engine commands.

use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::db;
use crate::db::history::{self, PlayRecord};
use crate::download::{
    BandwidthGovernor, ChunkFetcher, DownloadScheduler, MediaCache, MediaSource, RetryPolicy,
};
use crate::engine::{Engine, EngineCommand};
use crate::error::{Error, Result};
use crate::network::NetworkMonitor;
use crate::playback::AudioOutput;
use crate::status::StatusPublisher;
use crate::task::TaskHandle;
use fleetbox_common::control::{ControlMessage, StatusMessage};
use fleetbox_common::events::{EventBus, FallbackReason, FleetEvent};

const EVENT_BUS_CAPACITY: usize = 256;
const COMMAND_QUEUE: usize = 64;

pub struct Node {
    token: String,
    commands: mpsc::Sender<EngineCommand>,
    status: StatusPublisher,
    bus: EventBus,
    scheduler: DownloadScheduler,
    db: Pool<Sqlite>,
    online: tokio::sync::watch::Receiver<bool>,
    root: CancellationToken,
    tasks: Mutex<Vec<TaskHandle>>,
}

impl Node {
    /// Build the services under `root` and start downloads and playback
    pub async fn start(
        config: &NodeConfig,
        root: &Path,
        source: Arc<dyn MediaSource>,
        output: Arc<dyn AudioOutput>,
        db: Pool<Sqlite>,
    ) -> Result<Self> {
        db::init::init_settings_defaults(&db, config.playback.default_volume).await?;

        let bus = EventBus::new(EVENT_BUS_CAPACITY);
        let status = StatusPublisher::new();
        let cache = MediaCache::new(root);

        let monitor = NetworkMonitor::new(Arc::clone(&source), &config.network);
        let online = monitor.subscribe();

        let governor = BandwidthGovernor::from_config(&config.download);
        let fetcher = ChunkFetcher::new(
            source,
            governor.clone(),
            RetryPolicy::from_config(&config.download),
        );
        let scheduler = DownloadScheduler::new(
            cache,
            fetcher,
            governor,
            config.download.requeue_delay(),
            bus.clone(),
        );
        let dispatcher = scheduler.start();

        let root_token = CancellationToken::new();
        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let engine = Engine::new(
            config,
            output,
            scheduler.clone(),
            db.clone(),
            bus.clone(),
            status.clone(),
            online.clone(),
        );
        let engine = TaskHandle::spawn("playback-engine", &root_token, move |token| {
            engine.run(rx, token)
        });
        let network = monitor.start(&root_token);

        info!(
            root = %root.display(),
            token = %config.device.token,
            "Node started"
        );
        Ok(Self {
            token: config.device.token.clone(),
            commands,
            status,
            bus,
            scheduler,
            db,
            online,
            root: root_token,
            tasks: Mutex::new(vec![engine, network, dispatcher]),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn scheduler(&self) -> &DownloadScheduler {
        &self.scheduler
    }

    /// Whether the media library answered the last reachability check
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Most recent plays, newest first
    pub async fn history(&self, limit: u32) -> Result<Vec<PlayRecord>> {
        history::recent(&self.db, limit).await
    }

    /// Latest status messages, one per kind (and per download owner)
    pub fn snapshot(&self) -> Vec<StatusMessage> {
        self.status.snapshot()
    }

    /// Validate one inbound control message and hand it to the engine
    pub async fn handle_control(&self, message: ControlMessage) -> Result<()> {
        debug!(kind = message.kind(), "Control message received");
        let command = match message {
            ControlMessage::PlaylistPush { playlist } => {
                if playlist.id.trim().is_empty() {
                    return Err(Error::BadRequest("playlist id is empty".to_string()));
                }
                EngineCommand::PushPlaylist(playlist)
            }
            ControlMessage::ScheduleCreated { schedule } => {
                self.validate_schedule(&schedule.id, schedule.validate().err())?;
                EngineCommand::UpsertSchedule(schedule)
            }
            ControlMessage::ScheduleUpdated { schedule } => {
                if let Err(e) = schedule.validate() {
                    // A broken update must not keep the old version playing
                    if !schedule.id.trim().is_empty() {
                        self.send(EngineCommand::DeleteSchedule(schedule.id.clone()))
                            .await?;
                    }
                    self.validate_schedule(&schedule.id, Some(e))?;
                }
                EngineCommand::UpsertSchedule(schedule)
            }
            ControlMessage::ScheduleDeleted { schedule } => {
                EngineCommand::DeleteSchedule(schedule.id)
            }
            ControlMessage::Command { .. } => match message.device_command()? {
                Some(command) => EngineCommand::Device(command),
                None => return Err(Error::BadRequest("not a device command".to_string())),
            },
            ControlMessage::Announcement { announcement } => {
                if let Err(e) = announcement.validate() {
                    warn!(announcement = %announcement.id, "Invalid announcement: {}", e);
                    return Err(Error::BadRequest(e.to_string()));
                }
                EngineCommand::Announce(announcement)
            }
            ControlMessage::DeleteAnnouncement { announcement_id } => {
                if announcement_id.trim().is_empty() {
                    return Err(Error::BadRequest("announcement id is empty".to_string()));
                }
                EngineCommand::DeleteAnnouncement(announcement_id)
            }
        };
        self.send(command).await
    }

    fn validate_schedule(
        &self,
        schedule_id: &str,
        error: Option<fleetbox_common::Error>,
    ) -> Result<()> {
        let Some(error) = error else {
            return Ok(());
        };
        warn!(schedule = %schedule_id, "Invalid schedule: {}", error);
        self.bus.emit_lossy(FleetEvent::ScheduleFallback {
            schedule_id: schedule_id.to_string(),
            reason: FallbackReason::InvalidSchedule,
            error_count: 0,
        });
        Err(Error::ScheduleInvalid(error.to_string()))
    }

    async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::InvalidState("playback engine is not running".to_string()))
    }

    /// Stop the engine (saving the session) and the download dispatcher
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|p| p.into_inner()));
        self.root.cancel();
        self.scheduler.shutdown();
        for task in tasks {
            task.shutdown().await;
        }
        info!("Node stopped");
    }
}
