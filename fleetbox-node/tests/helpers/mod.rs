//! Shared fixtures for fleetbox-node integration tests
//!
//! [`ScriptedSource`] stands in for the media library: files live in memory,
//! faults are queued per remote path, and concurrency is recorded so tests
//! can check the governor's budget.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fleetbox_common::events::EventBus;
use fleetbox_common::model::Track;
use fleetbox_node::download::cache::sha256_hex;
use fleetbox_node::download::governor::ChunkSizer;
use fleetbox_node::download::source::ChunkData;
use fleetbox_node::download::{
    BandwidthGovernor, ChunkFetcher, DownloadScheduler, MediaCache, MediaSource, RetryPolicy,
};
use fleetbox_node::config::NodeConfig;
use fleetbox_node::db;
use fleetbox_node::download::Owner;
use fleetbox_node::error::{Error, Result};
use fleetbox_node::playback::SimulatedOutput;
use fleetbox_node::Node;

/// Failure injected into the next range request for a path
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fault {
    /// Connection reset by peer
    Reset,
    /// Body with a digest that does not match
    Corrupt,
}

#[derive(Default)]
struct Script {
    files: HashMap<String, Bytes>,
    faults: HashMap<String, VecDeque<Fault>>,
    /// Ranges starting at or past this offset hang
    stall_from: HashMap<String, u64>,
}

/// In-memory media library
#[derive(Clone, Default)]
pub struct ScriptedSource {
    script: Arc<Mutex<Script>>,
    delay: Option<Duration>,
    requests: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every range request takes at least `delay`
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn add_file(&self, remote_path: &str, data: &[u8]) {
        self.script
            .lock()
            .unwrap()
            .files
            .insert(remote_path.to_string(), Bytes::copy_from_slice(data));
    }

    pub fn push_faults(&self, remote_path: &str, faults: &[Fault]) {
        self.script
            .lock()
            .unwrap()
            .faults
            .entry(remote_path.to_string())
            .or_default()
            .extend(faults.iter().copied());
    }

    pub fn stall_from(&self, remote_path: &str, offset: u64) {
        self.script
            .lock()
            .unwrap()
            .stall_from
            .insert(remote_path.to_string(), offset);
    }

    pub fn clear_stall(&self, remote_path: &str) {
        self.script.lock().unwrap().stall_from.remove(remote_path);
    }

    /// While offline every request, pings included, is refused
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    fn refuse_if_offline(&self, remote_path: &str) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::from_io(
                remote_path,
                io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
            ));
        }
        Ok(())
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Most range requests ever in flight at once
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    async fn ping(&self) -> Result<()> {
        self.refuse_if_offline("/")
    }

    async fn content_length(&self, remote_path: &str) -> Result<Option<u64>> {
        self.refuse_if_offline(remote_path)?;
        match self.script.lock().unwrap().files.get(remote_path) {
            Some(data) => Ok(Some(data.len() as u64)),
            None => Err(Error::from_status(remote_path, 404)),
        }
    }

    async fn fetch_range(&self, remote_path: &str, start: u64, len: u64) -> Result<ChunkData> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.refuse_if_offline(remote_path)?;
        let (data, fault, stall) = {
            let mut script = self.script.lock().unwrap();
            let data = script
                .files
                .get(remote_path)
                .cloned()
                .ok_or_else(|| Error::from_status(remote_path, 404))?;
            let fault = script
                .faults
                .get_mut(remote_path)
                .and_then(|queue| queue.pop_front());
            let stall = script
                .stall_from
                .get(remote_path)
                .map(|from| start >= *from)
                .unwrap_or(false);
            (data, fault, stall)
        };

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(active, Ordering::SeqCst);
        if stall {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        } else if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        match fault {
            Some(Fault::Reset) => {
                return Err(Error::from_io(
                    "fetch range",
                    io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"),
                ))
            }
            Some(Fault::Corrupt) => {
                let end = (start + len).min(data.len() as u64) as usize;
                return Ok(ChunkData {
                    bytes: data.slice(start as usize..end),
                    digest: Some("00".repeat(32)),
                });
            }
            None => {}
        }

        let end = (start + len).min(data.len() as u64) as usize;
        let bytes = data.slice(start as usize..end);
        let digest = Some(sha256_hex(&bytes));
        Ok(ChunkData { bytes, digest })
    }
}

/// Track whose checksum matches `data`
pub fn track(id: &str, data: &[u8], duration: f64) -> Track {
    Track {
        id: id.to_string(),
        remote_path: format!("/lib/{}.mp3", id),
        local_path: None,
        duration,
        size: data.len() as u64,
        checksum: sha256_hex(data),
        name: None,
        artist: None,
    }
}

/// Deterministic test payload
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Short backoffs, no jitter
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_jitter: Duration::ZERO,
    }
}

/// Governor with a fixed chunk size and no byte-rate cap
pub fn governor(max_concurrent: usize, chunk: u64) -> BandwidthGovernor {
    BandwidthGovernor::new(max_concurrent, 0, ChunkSizer::new(chunk, chunk, chunk))
}

pub struct SchedulerFixture {
    pub dir: TempDir,
    pub source: ScriptedSource,
    pub scheduler: DownloadScheduler,
    pub bus: EventBus,
}

impl SchedulerFixture {
    pub fn new(source: ScriptedSource, max_concurrent: usize, chunk: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new(256);
        let governor = governor(max_concurrent, chunk);
        let fetcher = ChunkFetcher::new(Arc::new(source.clone()), governor.clone(), fast_retry(3));
        let scheduler = DownloadScheduler::new(
            MediaCache::new(dir.path()),
            fetcher,
            governor,
            Duration::from_millis(200),
            bus.clone(),
        );
        Self {
            dir,
            source,
            scheduler,
            bus,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Poll `check` every 20 ms until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub const TOKEN: &str = "dev-1";

/// Node config tuned for fast tests
pub fn node_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.device.token = TOKEN.to_string();
    config.download.max_retries = 2;
    config.download.retry_base_delay_ms = 5;
    config.download.retry_max_delay_ms = 20;
    config.download.retry_jitter_ms = 0;
    config.download.requeue_delay_ms = 200;
    config.playback.status_interval_secs = 1;
    config.schedule.check_interval_secs = 1;
    config.network.check_interval_ms = 50;
    config.network.timeout_ms = 200;
    config
}

/// A running node over a temp root, a scripted library and simulated audio
pub struct NodeFixture {
    pub dir: TempDir,
    pub source: ScriptedSource,
    pub output: SimulatedOutput,
    pub node: Arc<Node>,
}

impl NodeFixture {
    pub async fn start() -> Self {
        Self::start_in(TempDir::new().unwrap(), ScriptedSource::new()).await
    }

    /// Start over an existing root (database and media cache are reused)
    pub async fn start_in(dir: TempDir, source: ScriptedSource) -> Self {
        Self::start_with(&node_config(), dir, source).await
    }

    pub async fn start_with(config: &NodeConfig, dir: TempDir, source: ScriptedSource) -> Self {
        let pool = db::connect(&dir.path().join("fleetbox.db")).await.unwrap();
        let output = SimulatedOutput::new();
        let node = Node::start(
            config,
            dir.path(),
            Arc::new(source.clone()),
            Arc::new(output.clone()),
            pool,
        )
        .await
        .unwrap();
        Self {
            dir,
            source,
            output,
            node: Arc::new(node),
        }
    }

    /// Serve `track` from the scripted library
    pub fn serve(&self, id: &str, duration: f64) -> Track {
        let data = payload(2048, id.len() as u8);
        let t = track(id, &data, duration);
        self.source.add_file(&t.remote_path, &data);
        t
    }

    pub fn media_path(&self, t: &Track, owner: &Owner) -> std::path::PathBuf {
        MediaCache::new(self.dir.path()).path_for(t, owner).unwrap()
    }

    /// Paths of every audible handle
    pub fn audible_paths(&self) -> Vec<std::path::PathBuf> {
        self.output.audible().into_iter().map(|h| h.path).collect()
    }

    pub async fn stop(self) -> (TempDir, ScriptedSource) {
        self.node.shutdown().await;
        (self.dir, self.source)
    }
}
