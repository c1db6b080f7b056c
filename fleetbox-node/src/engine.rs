//! Playback engine
//!
//! One task owns every sequencer together with the priority arbiter, the
//! schedule supervisor, the announcement queue and planner. A single
//! `select!` loop multiplexes:
//!
//! - the 50 ms sequencer tick (crossfade triggers, ramps, preload polling)
//! - the schedule and announcement check interval
//! - the status heartbeat
//! - commands from the control channel
//! - download scheduler events
//! - media library connectivity changes
//!
//! A source that loses the air is faded out on a retiring sequencer; the
//! next source starts only once it is silent.
//!
//! Nothing here blocks, so transition timing is independent of download load.

use sqlx::{Pool, Sqlite};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::db::history::{self, PlayRecord};
use crate::db::settings;
use crate::download::job::{playlist_priorities, schedule_priorities};
use crate::download::{
    DownloadEvent, DownloadScheduler, MediaCache, Owner, Priority, ProgressTracker, SubmitOutcome,
};
use crate::error::Result;
use crate::playback::{
    AnnouncementQueue, AudioOutput, Sequencer, SequencerConfig, SequencerEvent, SequencerState,
    SessionSnapshot,
};
use crate::schedule::{
    AnnouncementPlanner, ArbiterAction, PriorityArbiter, ScheduleSupervisor, SupervisorAction,
};
use crate::status::StatusPublisher;
use fleetbox_common::control::{DeviceCommand, DeviceStatus, PlaybackStatus, PlaylistStatus};
use fleetbox_common::events::{EventBus, FallbackReason, FleetEvent};
use fleetbox_common::time;
use fleetbox_common::model::{Announcement, Playlist, Schedule, SourceKind, Track};

const SOURCES: [SourceKind; 3] = [
    SourceKind::Playlist,
    SourceKind::Schedule,
    SourceKind::Announcement,
];

/// Validated request for the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    /// Replace the base playlist
    PushPlaylist(Playlist),
    /// Create or update a schedule
    UpsertSchedule(Schedule),
    DeleteSchedule(String),
    Announce(Announcement),
    DeleteAnnouncement(String),
    Device(DeviceCommand),
}

/// Engine timing, taken from the node configuration
#[derive(Debug, Clone)]
struct EngineSettings {
    token: String,
    tick: Duration,
    check_interval: Duration,
    status_interval: Duration,
    default_volume: f32,
    history_limit: u32,
    sequencer: SequencerConfig,
}

pub struct Engine {
    settings: EngineSettings,
    output: Arc<dyn AudioOutput>,
    cache: MediaCache,
    scheduler: DownloadScheduler,
    db: Pool<Sqlite>,
    bus: EventBus,
    status: StatusPublisher,

    playlist: Option<Sequencer>,
    schedule: Option<Sequencer>,
    announcement: Option<Sequencer>,
    /// Sequencers fading out after losing the air
    retiring: Vec<Sequencer>,

    arbiter: PriorityArbiter,
    supervisor: ScheduleSupervisor,
    announcements: AnnouncementQueue,
    planner: AnnouncementPlanner,
    progress: ProgressTracker,
    online: watch::Receiver<bool>,

    volume: f32,
    /// Granted source waiting for lower sources to fall silent
    pending: Option<SourceKind>,
    /// Source last reported as audible
    sounding: Option<SourceKind>,
    /// Whether the last finished track played to its end
    last_completed: bool,
}

impl Engine {
    pub fn new(
        config: &NodeConfig,
        output: Arc<dyn AudioOutput>,
        scheduler: DownloadScheduler,
        db: Pool<Sqlite>,
        bus: EventBus,
        status: StatusPublisher,
        online: watch::Receiver<bool>,
    ) -> Self {
        let settings = EngineSettings {
            token: config.device.token.clone(),
            tick: config.playback.tick(),
            check_interval: config.schedule.check_interval(),
            status_interval: Duration::from_secs(config.playback.status_interval_secs.max(1)),
            default_volume: config.playback.default_volume,
            history_limit: config.playback.history_limit,
            sequencer: SequencerConfig::from_config(&config.playback),
        };
        Self {
            progress: ProgressTracker::new(settings.token.clone()),
            volume: settings.default_volume,
            settings,
            output,
            cache: scheduler.cache().clone(),
            scheduler,
            db,
            bus,
            status,
            playlist: None,
            schedule: None,
            announcement: None,
            retiring: Vec::new(),
            arbiter: PriorityArbiter::new(),
            supervisor: ScheduleSupervisor::from_config(&config.schedule),
            announcements: AnnouncementQueue::new(),
            planner: AnnouncementPlanner::new(),
            online,
            pending: None,
            sounding: None,
            last_completed: false,
        }
    }

    /// Restore persisted state, then run until `token` is cancelled
    pub async fn run(mut self, mut commands: mpsc::Receiver<EngineCommand>, token: CancellationToken) {
        let mut downloads = self.scheduler.subscribe();
        let mut connectivity = self.online.clone();
        let mut connectivity_open = true;

        if let Err(e) = self.restore().await {
            warn!("Failed to restore persisted state: {}", e);
        }
        self.publish_status();

        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut check = tokio::time::interval(self.settings.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut heartbeat = tokio::time::interval(self.settings.status_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Playback engine started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => self.on_tick().await,
                _ = check.tick() => {
                    self.check_schedules().await;
                    self.check_announcements().await;
                }
                _ = heartbeat.tick() => {
                    self.publish_status();
                    self.save_session().await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = downloads.recv() => match event {
                    Ok(event) => self.on_download_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Engine lagged behind download events, rescanning");
                        self.rescan_media().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                changed = connectivity.changed(), if connectivity_open => match changed {
                    Ok(()) => {
                        let online = *connectivity.borrow_and_update();
                        self.on_connectivity(online);
                    }
                    Err(_) => connectivity_open = false,
                },
            }
        }

        self.save_session().await;
        for source in SOURCES {
            if let Some(seq) = self.sequencer_mut(source) {
                seq.stop();
            }
        }
        for mut seq in self.retiring.drain(..) {
            seq.stop();
        }
        info!("Playback engine stopped");
    }

    // ========================================================================
    // Restore
    // ========================================================================

    async fn restore(&mut self) -> Result<()> {
        self.volume = settings::get_volume(&self.db, self.settings.default_volume).await?;
        self.supervisor
            .set_manual_pause(settings::get_manual_pause(&self.db).await?);

        for schedule in settings::load_schedules(&self.db).await? {
            self.register_schedule(schedule).await;
        }
        for announcement in settings::load_announcements(&self.db).await? {
            self.register_announcement(announcement).await;
        }

        let session = settings::load_session(&self.db).await?;
        let was_active = settings::load_active_schedule_ids(&self.db).await?;
        if let Some(snapshot) = &session {
            if let Some(id) = &snapshot.schedule_id {
                if was_active.contains(id) && self.supervisor.get(id).is_some() {
                    debug!(schedule = %id, index = snapshot.index, "Resuming schedule position");
                    self.supervisor.resume_at(id, snapshot.index);
                }
            }
        }

        if let Some(playlist) = settings::load_playlist(&self.db).await? {
            let (index, position) = match &session {
                Some(s) if s.source == SourceKind::Playlist && s.playlist_id == playlist.id => {
                    (s.index, s.position_secs)
                }
                _ => (0, 0.0),
            };
            info!(
                playlist = %playlist.id,
                index,
                position,
                manual_pause = self.supervisor.manual_pause(),
                "Restoring playlist"
            );
            self.push_playlist(playlist, index, position).await;
        }
        Ok(())
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::PushPlaylist(playlist) => {
                persist("playlist", settings::save_playlist(&self.db, &playlist).await);
                self.push_playlist(playlist, 0, 0.0).await;
            }
            EngineCommand::UpsertSchedule(schedule) => {
                if self.register_schedule(schedule).await {
                    self.save_schedules().await;
                    self.check_schedules().await;
                }
            }
            EngineCommand::DeleteSchedule(id) => self.delete_schedule(&id).await,
            EngineCommand::Announce(announcement) if announcement.is_scheduled() => {
                if self.register_announcement(announcement).await {
                    self.save_announcements().await;
                }
            }
            EngineCommand::Announce(announcement) => self.announce(announcement).await,
            EngineCommand::DeleteAnnouncement(id) => self.delete_announcement(&id).await,
            EngineCommand::Device(command) => self.device_command(command).await,
        }
        self.publish_status();
    }

    async fn device_command(&mut self, command: DeviceCommand) {
        match command {
            DeviceCommand::SetVolume(volume) => {
                self.volume = volume.clamp(0.0, 1.0);
                for source in SOURCES {
                    let volume = self.volume;
                    if let Some(seq) = self.sequencer_mut(source) {
                        seq.set_volume(volume);
                    }
                }
                info!(volume = self.volume, "Volume changed");
                persist("volume", settings::set_volume(&self.db, self.volume).await);
                self.bus.emit_lossy(FleetEvent::VolumeChanged {
                    volume: self.volume,
                });
            }
            DeviceCommand::Pause => {
                self.set_manual_pause(true).await;
                if let Some(seq) = self.playlist.as_mut() {
                    seq.pause();
                }
                if matches!(self.pending, Some(SourceKind::Playlist | SourceKind::Schedule)) {
                    self.pending = None;
                }
                self.check_schedules().await;
            }
            DeviceCommand::Play => {
                self.set_manual_pause(false).await;
                match self.arbiter.audible() {
                    Some(source) => {
                        self.queue_start(source);
                        self.advance_pending().await;
                    }
                    None if self.playlist.is_some() => {
                        self.ensure_requested(SourceKind::Playlist).await;
                    }
                    None => {}
                }
                self.check_schedules().await;
            }
            DeviceCommand::Restart => {
                self.set_manual_pause(false).await;
                let audible = self.arbiter.audible() == Some(SourceKind::Playlist);
                if let Some(seq) = self.playlist.as_mut() {
                    if audible {
                        seq.restart().await;
                    } else if let Some(playlist) = seq.playlist().cloned() {
                        seq.prepare(playlist, 0, 0.0);
                    }
                }
                if self.playlist.is_some() {
                    self.ensure_requested(SourceKind::Playlist).await;
                }
                self.check_schedules().await;
            }
            DeviceCommand::ResetSchedule(id) => {
                if self.supervisor.reset(&id) {
                    self.check_schedules().await;
                } else {
                    debug!(schedule = %id, "Reset requested for schedule without errors");
                }
            }
        }
    }

    async fn set_manual_pause(&mut self, paused: bool) {
        self.supervisor.set_manual_pause(paused);
        persist("manual pause", settings::set_manual_pause(&self.db, paused).await);
    }

    async fn push_playlist(&mut self, playlist: Playlist, index: usize, position: f64) {
        let owner = Owner::Playlist(playlist.id.clone());
        if let Some(mut old) = self.playlist.take() {
            old.stop();
            if old.owner() != &owner {
                self.forget_owner(old.owner()).await;
            }
        }
        if self.pending == Some(SourceKind::Playlist) {
            self.pending = None;
        }

        info!(playlist = %playlist.id, tracks = playlist.len(), "Playlist received");
        let priorities = playlist_priorities(&playlist, index);
        self.track_downloads(&owner, &playlist.tracks, &priorities).await;

        let mut seq = self.new_sequencer(SourceKind::Playlist, owner);
        seq.prepare(playlist, index, position);
        self.playlist = Some(seq);
        self.ensure_requested(SourceKind::Playlist).await;
    }

    /// Store a schedule and queue its media; false if it was rejected
    async fn register_schedule(&mut self, schedule: Schedule) -> bool {
        if let Err(e) = self.supervisor.upsert(schedule.clone()) {
            warn!(schedule = %schedule.id, "Schedule rejected: {}", e);
            self.bus.emit_lossy(FleetEvent::ScheduleFallback {
                schedule_id: schedule.id.clone(),
                reason: FallbackReason::InvalidSchedule,
                error_count: 0,
            });
            return false;
        }
        let owner = Owner::Schedule(schedule.id.clone());
        let priorities = schedule_priorities(&schedule, time::now());
        self.track_downloads(&owner, &schedule.playlist.tracks, &priorities)
            .await;
        true
    }

    async fn delete_schedule(&mut self, id: &str) {
        let known = self.supervisor.remove(id);
        // Deactivates it first if it is playing
        self.check_schedules().await;
        self.discard_schedule_media(id).await;
        if known {
            info!(schedule = %id, "Schedule deleted");
            self.save_schedules().await;
        }
    }

    async fn announce(&mut self, announcement: Announcement) {
        if !self.announcements.push(announcement.clone()) {
            debug!(announcement = %announcement.id, "Duplicate announcement ignored");
            return;
        }
        let owner = Owner::Announcement(announcement.id.clone());
        match self
            .scheduler
            .submit(announcement.track.clone(), owner, Priority::Immediate)
            .await
        {
            Ok(_) => {
                info!(
                    announcement = %announcement.id,
                    queued = self.announcements.len(),
                    "Announcement queued"
                );
                self.start_next_announcement().await;
            }
            Err(e) => {
                warn!(announcement = %announcement.id, "Announcement dropped: {}", e);
                self.announcements.remove(&announcement.id);
            }
        }
    }

    /// Store a recurring announcement and fetch its file ahead of time
    async fn register_announcement(&mut self, announcement: Announcement) -> bool {
        let id = announcement.id.clone();
        let track = announcement.track.clone();
        if let Err(e) = self.planner.upsert(announcement) {
            warn!(announcement = %id, "Scheduled announcement rejected: {}", e);
            return false;
        }
        let owner = Owner::Announcement(id.clone());
        if let Err(e) = self.scheduler.submit(track, owner, Priority::High).await {
            warn!(announcement = %id, "Cannot queue announcement media: {}", e);
        }
        true
    }

    async fn delete_announcement(&mut self, id: &str) {
        let pending = self
            .announcements
            .pending()
            .find(|a| a.id == id)
            .map(|a| a.track.clone());
        let scheduled = self.planner.remove(id);
        let queued = self.announcements.remove(id);
        let on_air = self.announcements.current() == Some(id);
        let playing = match &self.announcement {
            Some(seq) if on_air => seq.current_track().cloned(),
            _ => None,
        };
        let track = scheduled.map(|a| a.track).or(pending).or(playing);

        if on_air {
            self.finish_announcement().await;
        }
        let owner = Owner::Announcement(id.to_string());
        self.scheduler.cancel_owner(&owner).await;
        if let Some(track) = &track {
            // The file may be shared with another announcement of the same track
            let shared = self.planner.announcements().any(|a| a.track.id == track.id)
                || self.announcements.pending().any(|a| a.track.id == track.id);
            if !shared {
                if let Ok(path) = self.cache.path_for(track, &owner) {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => warn!(announcement = %id, "Failed to remove announcement file: {}", e),
                    }
                    self.scheduler.forget_path(&path);
                }
            }
        }

        let success = track.is_some() || queued || on_air;
        if success {
            info!(announcement = %id, "Announcement deleted");
            self.save_announcements().await;
        } else {
            debug!(announcement = %id, "Delete requested for unknown announcement");
        }
        self.bus.emit_lossy(FleetEvent::AnnouncementDeleted {
            announcement_id: id.to_string(),
            success,
        });
    }

    /// Queue recurring announcements whose time has come
    async fn check_announcements(&mut self) {
        if self.planner.is_empty() {
            return;
        }
        let busy = self.announcement.is_some() || !self.announcements.is_empty();
        let due = self.planner.check(time::now(), time::local_now(), busy);
        for announcement in due {
            self.fire(announcement).await;
        }
    }

    /// A playlist or schedule track played through
    async fn count_song(&mut self) {
        if self.planner.is_empty() {
            return;
        }
        let suppressed = self.supervisor.manual_pause()
            || self.announcement.is_some()
            || !self.announcements.is_empty();
        if suppressed {
            return;
        }
        let due = self.planner.on_song_finished(time::now());
        for announcement in due {
            self.fire(announcement).await;
        }
    }

    async fn fire(&mut self, announcement: Announcement) {
        info!(
            announcement = %announcement.id,
            trigger = ?announcement.schedule_type,
            "Scheduled announcement due"
        );
        self.announce(announcement).await;
    }

    // ========================================================================
    // Arbitration
    // ========================================================================

    fn sequencer(&self, source: SourceKind) -> Option<&Sequencer> {
        match source {
            SourceKind::Playlist => self.playlist.as_ref(),
            SourceKind::Schedule => self.schedule.as_ref(),
            SourceKind::Announcement => self.announcement.as_ref(),
        }
    }

    fn sequencer_mut(&mut self, source: SourceKind) -> Option<&mut Sequencer> {
        match source {
            SourceKind::Playlist => self.playlist.as_mut(),
            SourceKind::Schedule => self.schedule.as_mut(),
            SourceKind::Announcement => self.announcement.as_mut(),
        }
    }

    fn new_sequencer(&self, source: SourceKind, owner: Owner) -> Sequencer {
        Sequencer::new(
            source,
            owner,
            Arc::clone(&self.output),
            self.cache.clone(),
            self.settings.sequencer,
            self.volume,
        )
    }

    /// Fade `seq` out in the background; it is dropped once silent
    fn retire(&mut self, mut seq: Sequencer) {
        if seq.fade_out() {
            debug!(source = ?seq.source(), owner = %seq.owner(), "Fading out");
            self.retiring.push(seq);
        }
    }

    /// Whether the granted source is playing or about to
    fn audible_playing(&self) -> bool {
        match self.arbiter.audible() {
            Some(source) => {
                self.pending == Some(source)
                    || self.sequencer(source).map(|s| s.is_active()).unwrap_or(false)
            }
            None => false,
        }
    }

    /// Request the arbiter for `source`, or start it if already granted
    async fn ensure_requested(&mut self, source: SourceKind) {
        if !self.arbiter.is_requested(source) {
            let playing = self.audible_playing();
            let actions = self.arbiter.request(source, playing);
            self.apply(actions).await;
        } else if self.arbiter.audible() == Some(source) {
            self.queue_start(source);
            self.advance_pending().await;
        } else {
            self.arbiter.set_was_playing(source, true);
        }
    }

    async fn apply(&mut self, actions: Vec<ArbiterAction>) {
        for action in actions {
            match action {
                ArbiterAction::Suspend(source) => {
                    if self.pending == Some(source) {
                        self.pending = None;
                    }
                    if let Some(seq) = self.sequencer_mut(source) {
                        seq.pause();
                    }
                    debug!(?source, "Source suspended");
                }
                ArbiterAction::Start(source) | ArbiterAction::Resume(source) => {
                    self.queue_start(source);
                }
            }
        }
        self.advance_pending().await;
    }

    fn queue_start(&mut self, source: SourceKind) {
        if self.supervisor.manual_pause() && source != SourceKind::Announcement {
            debug!(?source, "Start held by manual pause");
            return;
        }
        self.pending = Some(source);
    }

    /// Start the granted source once every lower one has faded out
    async fn advance_pending(&mut self) {
        let Some(source) = self.pending else {
            return;
        };
        if self.arbiter.audible() != Some(source) {
            self.pending = None;
            return;
        }
        let lower_sounding = SOURCES
            .iter()
            .filter(|s| **s < source)
            .any(|s| self.sequencer(*s).map(is_sounding).unwrap_or(false));
        if lower_sounding || self.retiring.iter().any(is_sounding) {
            return;
        }
        self.pending = None;
        if let Some(seq) = self.sequencer_mut(source) {
            seq.resume().await;
        }
    }

    // ========================================================================
    // Schedules
    // ========================================================================

    async fn check_schedules(&mut self) {
        let actions = self.supervisor.check(time::now());
        self.apply_supervisor(actions).await;
    }

    async fn apply_supervisor(&mut self, actions: Vec<SupervisorAction>) {
        for action in actions {
            match action {
                SupervisorAction::Activate {
                    schedule,
                    start_index,
                } => self.activate_schedule(schedule, start_index).await,
                SupervisorAction::Deactivate {
                    schedule_id,
                    reason,
                } => self.deactivate_schedule(schedule_id, reason).await,
                SupervisorAction::Fallback {
                    schedule_id,
                    error_count,
                } => {
                    self.bus.emit_lossy(FleetEvent::ScheduleFallback {
                        schedule_id,
                        reason: FallbackReason::TooManyErrors,
                        error_count,
                    });
                }
                SupervisorAction::Purge { schedule_id } => {
                    self.discard_schedule_media(&schedule_id).await;
                    self.save_schedules().await;
                }
            }
        }
    }

    async fn activate_schedule(&mut self, schedule: Schedule, start_index: usize) {
        let owner = Owner::Schedule(schedule.id.clone());
        if let Some(old) = self.schedule.take() {
            self.retire(old);
        }

        // Now playing: its tracks become as urgent as the playlist's
        let priorities = playlist_priorities(&schedule.playlist, start_index);
        self.submit_tracks(&owner, &schedule.playlist.tracks, &priorities)
            .await;

        let mut seq = self.new_sequencer(SourceKind::Schedule, owner);
        seq.prepare(schedule.playlist.clone(), start_index, 0.0);
        self.schedule = Some(seq);
        self.bus.emit_lossy(FleetEvent::ScheduleStarted {
            schedule_id: schedule.id.clone(),
        });
        self.ensure_requested(SourceKind::Schedule).await;
        self.save_active_schedules().await;
    }

    async fn deactivate_schedule(&mut self, schedule_id: String, reason: FallbackReason) {
        let matches = self
            .schedule
            .as_ref()
            .map(|s| s.owner().id() == schedule_id)
            .unwrap_or(false);
        if matches {
            if let Some(seq) = self.schedule.take() {
                self.retire(seq);
            }
        }
        if self.pending == Some(SourceKind::Schedule) {
            self.pending = None;
        }
        info!(schedule = %schedule_id, ?reason, "Schedule stopped");
        self.bus.emit_lossy(FleetEvent::ScheduleStopped {
            schedule_id,
            reason,
        });
        let actions = self.arbiter.release(SourceKind::Schedule);
        self.apply(actions).await;
        self.save_active_schedules().await;
    }

    /// Record a schedule playback error, unless the file simply is not here yet
    async fn schedule_track_failed(&mut self, schedule_id: &str, track_id: &str) {
        let Some(seq) = self.schedule.as_ref() else {
            return;
        };
        let Some(playlist) = seq.playlist() else {
            return;
        };
        let Some(index) = playlist.tracks.iter().position(|t| t.id == track_id) else {
            return;
        };
        let present = match self.cache.path_for(&playlist.tracks[index], seq.owner()) {
            Ok(path) => file_present(&path).await,
            Err(_) => false,
        };
        if !present {
            debug!(schedule = %schedule_id, track = %track_id, "Schedule track not downloaded yet");
            return;
        }
        let actions = self
            .supervisor
            .record_error(schedule_id, index, time::now());
        self.apply_supervisor(actions).await;
    }

    async fn discard_schedule_media(&mut self, schedule_id: &str) {
        let owner = Owner::Schedule(schedule_id.to_string());
        self.forget_owner(&owner).await;
        match self.cache.schedule_dir(schedule_id) {
            Ok(dir) => {
                if let Err(e) = self.cache.remove_schedule_dir(schedule_id).await {
                    warn!(schedule = %schedule_id, "Failed to remove schedule media: {}", e);
                }
                self.scheduler.forget_dir(&dir);
            }
            Err(e) => warn!(schedule = %schedule_id, "No media directory: {}", e),
        }
    }

    // ========================================================================
    // Announcements
    // ========================================================================

    /// Start the head of the queue if nothing is playing and its file is ready
    async fn start_next_announcement(&mut self) {
        if self.announcement.is_some() {
            return;
        }
        let Some(next) = self.announcements.pending().next() else {
            return;
        };
        let owner = Owner::Announcement(next.id.clone());
        let ready = self
            .cache
            .path_for(&next.track, &owner)
            .map(|path| self.scheduler.is_verified(&path))
            .unwrap_or(false);
        if !ready {
            return;
        }
        let Some(announcement) = self.announcements.start_next() else {
            return;
        };

        info!(announcement = %announcement.id, "Announcement starting");
        let playlist = Playlist {
            id: announcement.id.clone(),
            name: None,
            tracks: vec![announcement.track],
            looping: false,
        };
        let mut seq = self.new_sequencer(SourceKind::Announcement, owner);
        seq.prepare(playlist, 0, 0.0);
        self.announcement = Some(seq);
        self.bus.emit_lossy(FleetEvent::AnnouncementStarted {
            announcement_id: announcement.id,
        });
        self.ensure_requested(SourceKind::Announcement).await;
    }

    async fn finish_announcement(&mut self) {
        if let Some(seq) = self.announcement.take() {
            self.retire(seq);
        }
        if self.pending == Some(SourceKind::Announcement) {
            self.pending = None;
        }
        if let Some(id) = self.announcements.finish() {
            info!(announcement = %id, "Announcement finished");
            self.bus
                .emit_lossy(FleetEvent::AnnouncementFinished { announcement_id: id });
        }

        // Chain into the next one without letting the pre-empted source back in
        self.start_next_announcement().await;
        if self.announcement.is_none() {
            let actions = self.arbiter.release(SourceKind::Announcement);
            self.apply(actions).await;
        }
    }

    // ========================================================================
    // Tick and sequencer events
    // ========================================================================

    async fn on_tick(&mut self) {
        let now = Instant::now();
        for source in SOURCES {
            if let Some(seq) = self.sequencer_mut(source) {
                seq.tick(now).await;
            }
            self.drain_events(source).await;
        }
        self.tick_retiring(now).await;
        self.advance_pending().await;
        self.note_sounding();
    }

    async fn tick_retiring(&mut self, now: Instant) {
        if self.retiring.is_empty() {
            return;
        }
        let mut finished = Vec::new();
        for seq in self.retiring.iter_mut() {
            seq.tick(now).await;
            let source = seq.source();
            for event in seq.take_events() {
                if let SequencerEvent::TrackFinished {
                    track_id,
                    played_secs,
                    duration,
                    ..
                } = event
                {
                    finished.push((source, track_id, played_secs, duration));
                }
            }
        }
        self.retiring.retain(|seq| seq.is_fading_out());
        for (source, track_id, played_secs, duration) in finished {
            self.record_play(source, &track_id, played_secs, duration).await;
        }
    }

    async fn drain_events(&mut self, source: SourceKind) {
        let Some(seq) = self.sequencer_mut(source) else {
            return;
        };
        let owner = seq.owner().clone();
        let events = seq.take_events();
        for event in events {
            // A handler may have dropped or replaced this sequencer
            if self.sequencer(source).map(|s| s.owner()) != Some(&owner) {
                break;
            }
            self.on_sequencer_event(source, &owner, event).await;
        }
    }

    async fn on_sequencer_event(&mut self, source: SourceKind, owner: &Owner, event: SequencerEvent) {
        match event {
            SequencerEvent::TrackStarted { track_id, index } => {
                self.last_completed = false;
                self.bus.emit_lossy(FleetEvent::TrackStarted {
                    source,
                    track_id,
                    index,
                });
                match source {
                    SourceKind::Playlist | SourceKind::Schedule => {
                        if source == SourceKind::Schedule {
                            self.supervisor.record_success(owner.id());
                        }
                        self.reprioritize(source, index).await;
                    }
                    SourceKind::Announcement => {}
                }
                self.publish_playback();
            }
            SequencerEvent::TrackFinished {
                track_id,
                completed,
                played_secs,
                duration,
            } => {
                self.last_completed = completed;
                self.record_play(source, &track_id, played_secs, duration).await;
                if completed && source != SourceKind::Announcement {
                    self.count_song().await;
                }
                self.publish_playback();
            }
            SequencerEvent::CrossfadeStarted {
                from_track,
                to_track,
                fade_secs,
            } => {
                self.bus.emit_lossy(FleetEvent::CrossfadeStarted {
                    source,
                    from_track,
                    to_track,
                    fade_secs,
                });
            }
            SequencerEvent::HardCut { track_id } => {
                self.bus
                    .emit_lossy(FleetEvent::HardCut { source, track_id });
            }
            SequencerEvent::TrackFailed { track_id, reason } => {
                self.bus.emit_lossy(FleetEvent::TrackSkipped {
                    source,
                    track_id: track_id.clone(),
                    reason,
                });
                match source {
                    SourceKind::Schedule => {
                        self.schedule_track_failed(owner.id(), &track_id).await;
                    }
                    SourceKind::Announcement => self.finish_announcement().await,
                    SourceKind::Playlist => {}
                }
            }
            SequencerEvent::PlaylistEnded => match source {
                SourceKind::Playlist => {
                    let actions = self.arbiter.release(SourceKind::Playlist);
                    self.apply(actions).await;
                }
                SourceKind::Schedule => {
                    let actions = self.supervisor.record_finished(owner.id());
                    self.apply_supervisor(actions).await;
                }
                SourceKind::Announcement => self.finish_announcement().await,
            },
        }
    }

    /// Raise download priority of the tracks right after `index`
    async fn reprioritize(&mut self, source: SourceKind, index: usize) {
        let Some(seq) = self.sequencer(source) else {
            return;
        };
        let Some(playlist) = seq.playlist().cloned() else {
            return;
        };
        let owner = seq.owner().clone();
        let priorities = playlist_priorities(&playlist, index);
        self.submit_tracks(&owner, &playlist.tracks, &priorities).await;
    }

    fn note_sounding(&mut self) {
        let sounding = self.arbiter.audible().filter(|source| {
            self.sequencer(*source)
                .map(|s| s.is_playing())
                .unwrap_or(false)
        });
        if sounding != self.sounding {
            debug!(from = ?self.sounding, to = ?sounding, "Audible source changed");
            self.bus.emit_lossy(FleetEvent::SourceChanged {
                from: self.sounding,
                to: sounding,
            });
            self.sounding = sounding;
            self.publish_status();
        }
    }

    // ========================================================================
    // Downloads
    // ========================================================================

    /// Queue every track of `owner` and start reporting its progress
    async fn track_downloads(&mut self, owner: &Owner, tracks: &[Track], priorities: &[Priority]) {
        let verified = self.submit_tracks(owner, tracks, priorities).await;
        self.progress.track(owner.clone(), tracks, &verified);
        self.publish_download(owner);
    }

    /// Submit tracks; returns the ids already verified on disk
    async fn submit_tracks(
        &mut self,
        owner: &Owner,
        tracks: &[Track],
        priorities: &[Priority],
    ) -> HashSet<String> {
        let mut verified = HashSet::new();
        for (track, priority) in tracks.iter().zip(priorities) {
            match self
                .scheduler
                .submit(track.clone(), owner.clone(), *priority)
                .await
            {
                Ok(SubmitOutcome::AlreadyComplete(_)) => {
                    verified.insert(track.id.clone());
                }
                Ok(_) => {}
                Err(e) => warn!(owner = %owner, track = %track.id, "Cannot queue download: {}", e),
            }
        }
        verified
    }

    async fn forget_owner(&mut self, owner: &Owner) {
        let cancelled = self.scheduler.cancel_owner(owner).await;
        if cancelled > 0 {
            debug!(owner = %owner, cancelled, "Downloads cancelled");
        }
        self.progress.forget(owner);
        self.status.remove_download(&owner.to_string());
    }

    /// Re-derive readiness from the scheduler after missing events
    pub(crate) async fn rescan_media(&mut self) {
        for source in [SourceKind::Playlist, SourceKind::Schedule] {
            let granted = self.arbiter.audible() == Some(source) && !self.supervisor.manual_pause();
            let ready: Vec<String> = match self.sequencer(source) {
                Some(seq) if seq.state() != SequencerState::Idle || granted => {
                    let Some(playlist) = seq.playlist() else {
                        continue;
                    };
                    let candidates: Vec<&Track> = if seq.is_waiting_for_media() {
                        playlist.track(seq.index()).into_iter().collect()
                    } else {
                        playlist.tracks.iter().collect()
                    };
                    candidates
                        .into_iter()
                        .filter(|track| {
                            self.cache
                                .path_for(track, seq.owner())
                                .map(|path| self.scheduler.is_verified(&path))
                                .unwrap_or(false)
                        })
                        .map(|track| track.id.clone())
                        .collect()
                }
                _ => continue,
            };
            for track_id in ready {
                if let Some(seq) = self.sequencer_mut(source) {
                    seq.media_ready(&track_id).await;
                }
            }
        }
        self.start_next_announcement().await;
        self.advance_pending().await;
        self.publish_status();
    }

    fn on_connectivity(&mut self, online: bool) {
        info!(online, "Connectivity changed");
        self.bus.emit_lossy(FleetEvent::ConnectivityChanged { online });
        if online {
            let requeued = self.scheduler.resume_backoff();
            if requeued > 0 {
                debug!(requeued, "Failed downloads retried on reconnect");
            }
        }
        self.publish_status();
    }

    async fn on_download_event(&mut self, event: DownloadEvent) {
        if let Some(owner) = self.progress.apply(&event) {
            self.publish_download(&owner);
        }

        match event {
            DownloadEvent::Completed {
                track_id, owner, ..
            } => match owner {
                Owner::Announcement(_) => self.start_next_announcement().await,
                _ => {
                    for source in [SourceKind::Playlist, SourceKind::Schedule] {
                        let granted =
                            self.arbiter.audible() == Some(source) && !self.supervisor.manual_pause();
                        if let Some(seq) = self.sequencer_mut(source) {
                            let awaiting = seq.state() != SequencerState::Idle || granted;
                            if seq.owner() == &owner && awaiting {
                                seq.media_ready(&track_id).await;
                            }
                        }
                    }
                }
            },
            DownloadEvent::Failed {
                owner: Owner::Announcement(id),
                fatal: true,
                error,
                ..
            } => {
                if self.announcements.remove(&id) {
                    warn!(announcement = %id, "Announcement dropped: {}", error);
                    self.scheduler
                        .cancel_owner(&Owner::Announcement(id))
                        .await;
                    self.start_next_announcement().await;
                }
            }
            _ => {}
        }
    }

    // ========================================================================
    // Status and persistence
    // ========================================================================

    fn publish_status(&self) {
        self.status.publish_device(self.device_status());
        self.publish_playback();
    }

    fn publish_playback(&self) {
        self.status.publish_playback(self.playback_status());
    }

    fn publish_download(&self, owner: &Owner) {
        if let Some(report) = self.progress.report(owner) {
            self.status.publish_download(owner.to_string(), report);
        }
    }

    fn device_status(&self) -> DeviceStatus {
        DeviceStatus {
            token: self.settings.token.clone(),
            is_online: *self.online.borrow(),
            volume: (self.volume * 100.0).round().clamp(0.0, 100.0) as u8,
            playlist_status: self.playlist_status(),
        }
    }

    fn playlist_status(&self) -> PlaylistStatus {
        if self.supervisor.manual_pause() {
            return PlaylistStatus::Paused;
        }
        match self.arbiter.audible() {
            Some(SourceKind::Announcement) => PlaylistStatus::Announcement,
            Some(SourceKind::Schedule) => PlaylistStatus::Schedule,
            Some(SourceKind::Playlist)
                if self.playlist.as_ref().map(|s| s.is_playing()).unwrap_or(false) =>
            {
                PlaylistStatus::Playing
            }
            _ => match &self.playlist {
                Some(seq) if seq.state() != SequencerState::Ended => PlaylistStatus::Paused,
                _ => PlaylistStatus::Idle,
            },
        }
    }

    fn playback_status(&self) -> PlaybackStatus {
        let seq = self
            .arbiter
            .audible()
            .and_then(|source| self.sequencer(source))
            .or(self.playlist.as_ref());
        match seq.map(|s| s.status()) {
            Some(status) => PlaybackStatus {
                is_playing: status.is_playing,
                song_id: status.track_id,
                current_time: status.position,
                duration: status.duration,
                completed: self.last_completed,
            },
            None => PlaybackStatus {
                is_playing: false,
                song_id: None,
                current_time: 0.0,
                duration: 0.0,
                completed: false,
            },
        }
    }

    async fn save_session(&self) {
        let Some(seq) = self.schedule.as_ref().or(self.playlist.as_ref()) else {
            return;
        };
        let Some(playlist) = seq.playlist() else {
            return;
        };
        let status = seq.status();
        let snapshot = SessionSnapshot {
            source: seq.source(),
            playlist_id: playlist.id.clone(),
            schedule_id: match seq.owner() {
                Owner::Schedule(id) => Some(id.clone()),
                _ => None,
            },
            index: status.index,
            position_secs: status.position,
            is_playing: status.is_playing,
            saved_at: time::now(),
        };
        persist("session", settings::save_session(&self.db, &snapshot).await);
    }

    async fn record_play(&self, source: SourceKind, track_id: &str, played_secs: f64, duration: f64) {
        if played_secs <= 0.0 {
            return;
        }
        let record = PlayRecord::new(
            &self.settings.token,
            track_id,
            source,
            played_secs,
            duration,
            time::now(),
        );
        self.bus.emit_lossy(FleetEvent::TrackPlayed {
            source,
            track_id: record.track_id.clone(),
            play_duration: record.play_duration,
            completed: record.completed,
        });
        persist(
            "play history",
            history::record(&self.db, &record, self.settings.history_limit).await,
        );
    }

    async fn save_announcements(&self) {
        let announcements: Vec<Announcement> = self.planner.announcements().cloned().collect();
        persist(
            "announcements",
            settings::save_announcements(&self.db, &announcements).await,
        );
    }

    async fn save_schedules(&self) {
        let schedules: Vec<Schedule> = self.supervisor.schedules().cloned().collect();
        persist("schedules", settings::save_schedules(&self.db, &schedules).await);
    }

    async fn save_active_schedules(&self) {
        let active: Vec<String> = self.supervisor.active_id().map(str::to_string).into_iter().collect();
        persist(
            "active schedules",
            settings::save_active_schedule_ids(&self.db, &active).await,
        );
    }
}

/// Audible, or about to become audible
fn is_sounding(seq: &Sequencer) -> bool {
    matches!(
        seq.state(),
        SequencerState::Loading
            | SequencerState::Playing
            | SequencerState::Crossfading
            | SequencerState::FadingOut
    )
}

async fn file_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn persist(what: &str, result: Result<()>) {
    if let Err(e) = result {
        warn!("Failed to persist {}: {}", what, e);
    }
}
