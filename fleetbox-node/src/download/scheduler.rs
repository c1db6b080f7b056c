//! Download Scheduler
//!
//! Keeps a priority queue of pending track downloads and runs them through
//! the [`ChunkFetcher`] under the [`BandwidthGovernor`]'s concurrency budget.
//!
//! Jobs are keyed by track id, so a track has at most one job in flight no
//! matter how many playlists, schedules or announcements want it. The job
//! fetches into the first owner's cache path; every other owner receives a
//! verified copy once the fetch completes. A failed job is reported, then
//! queued again after a short delay unless all of its owners have been
//! cancelled in the meantime.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::download::cache::{partial_path, MediaCache};
use crate::download::fetcher::{ChunkFetcher, FetchObserver, FetchProgress};
use crate::download::governor::{BandwidthGovernor, DownloadPermit};
use crate::download::job::{DownloadJob, Owner, Priority};
use crate::error::{Error, ErrorClass, Result};
use crate::task::TaskHandle;
use fleetbox_common::events::{EventBus, FleetEvent};
use fleetbox_common::model::{ContentBucket, DownloadStatus, Track};

/// Download lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Queued {
        track_id: String,
        owner: Owner,
    },
    Started {
        track_id: String,
        owner: Owner,
    },
    Progress {
        track_id: String,
        owner: Owner,
        bytes_downloaded: u64,
        total_bytes: u64,
        bytes_per_second: u64,
    },
    /// File verified and in place
    Completed {
        track_id: String,
        owner: Owner,
        path: PathBuf,
    },
    Failed {
        track_id: String,
        owner: Owner,
        error: String,
        retry_count: u32,
        fatal: bool,
    },
    Cancelled {
        track_id: String,
        owner: Owner,
    },
}

/// Result of [`DownloadScheduler::submit`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Verified file already present; nothing queued
    AlreadyComplete(PathBuf),
    Queued(Uuid),
    /// A job for this track already exists; the owner was attached to it and
    /// its priority may have been raised
    Existing(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    /// Failed, waiting out the requeue delay
    Backoff,
}

/// One owner's destination for a shared download
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    owner: Owner,
    path: PathBuf,
}

struct JobEntry {
    job: DownloadJob,
    /// First entry is the fetch destination
    targets: Vec<Target>,
    phase: Phase,
    cancel: CancellationToken,
    /// Sequence of the live heap entry; older entries are stale
    queue_seq: u64,
    /// Bumped whenever the running fetch is abandoned for a new destination
    generation: u64,
}

impl JobEntry {
    fn new(job: DownloadJob, cancel: CancellationToken) -> Self {
        let targets = vec![Target {
            owner: job.owner.clone(),
            path: job.local_path.clone(),
        }];
        Self {
            job,
            targets,
            phase: Phase::Queued,
            cancel,
            queue_seq: 0,
            generation: 0,
        }
    }

    fn owners(&self) -> Vec<Owner> {
        self.targets.iter().map(|t| t.owner.clone()).collect()
    }

    /// Add a destination; false when the owner already had it
    fn attach(&mut self, owner: &Owner, path: &Path) -> bool {
        if self.targets.iter().any(|t| &t.owner == owner) {
            return false;
        }
        self.targets.push(Target {
            owner: owner.clone(),
            path: path.to_path_buf(),
        });
        self.job.owners = self.owners();
        true
    }

    /// Point the fetch at the first remaining target
    fn rehome(&mut self) {
        if let Some(first) = self.targets.first() {
            self.job.owner = first.owner.clone();
            self.job.bucket = first.owner.bucket();
            self.job.local_path = first.path.clone();
            self.job.bytes_downloaded = 0;
        }
        self.job.owners = self.owners();
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueueEntry {
    priority: Priority,
    seq: u64,
    key: String,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first, then oldest submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A job popped for dispatch
struct Dispatch {
    key: String,
    job: DownloadJob,
    cancel: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct SchedulerState {
    /// Live jobs by track id
    jobs: HashMap<String, JobEntry>,
    queue: BinaryHeap<QueueEntry>,
    /// Verified cache files and the track each holds
    verified: HashMap<PathBuf, String>,
    next_seq: u64,
    downloading: usize,
    peak_downloading: usize,
}

impl SchedulerState {
    fn enqueue(&mut self, key: &str, priority: Priority) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(entry) = self.jobs.get_mut(key) {
            entry.queue_seq = seq;
            entry.phase = Phase::Queued;
            entry.job.status = DownloadStatus::Queued;
        }
        self.queue.push(QueueEntry {
            priority,
            seq,
            key: key.to_string(),
        });
    }

    /// Pop the best live queued job and mark it running
    fn pop_next(&mut self) -> Option<Dispatch> {
        while let Some(entry) = self.queue.pop() {
            let Some(job) = self.jobs.get_mut(&entry.key) else {
                continue;
            };
            if job.phase != Phase::Queued || job.queue_seq != entry.seq {
                continue;
            }
            job.phase = Phase::Running;
            job.job.status = DownloadStatus::Downloading;
            let dispatch = Dispatch {
                key: entry.key,
                job: job.job.clone(),
                cancel: job.cancel.clone(),
                generation: job.generation,
            };
            self.downloading += 1;
            self.peak_downloading = self.peak_downloading.max(self.downloading);
            return Some(dispatch);
        }
        None
    }

    /// A verified file holding `track_id`, other than `except`
    fn verified_copy(&self, track_id: &str, except: &Path) -> Option<PathBuf> {
        self.verified
            .iter()
            .find(|(path, id)| id.as_str() == track_id && path.as_path() != except)
            .map(|(path, _)| path.clone())
    }
}

struct Inner {
    state: Mutex<SchedulerState>,
    work: Notify,
    cache: MediaCache,
    fetcher: ChunkFetcher,
    governor: BandwidthGovernor,
    requeue_delay: Duration,
    events: broadcast::Sender<DownloadEvent>,
    bus: EventBus,
    root: CancellationToken,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    /// Owners currently attached to the job for `key` at `generation`
    fn owners_of(&self, key: &str, generation: u64) -> Vec<Owner> {
        self.state()
            .jobs
            .get(key)
            .filter(|entry| entry.generation == generation)
            .map(JobEntry::owners)
            .unwrap_or_default()
    }

    /// Attach `owner` to the live job for the track, or report a verified file
    fn attach(&self, track_id: &str, owner: &Owner, path: &Path, priority: Priority) -> Option<SubmitOutcome> {
        let mut state = self.state();
        if state.verified.contains_key(path) {
            return Some(SubmitOutcome::AlreadyComplete(path.to_path_buf()));
        }
        let (id, attached, raise) = {
            let entry = state.jobs.get_mut(track_id)?;
            let attached = entry.attach(owner, path);
            let raise = entry.phase == Phase::Queued && priority > entry.job.priority;
            if priority > entry.job.priority {
                entry.job.priority = priority;
            }
            (entry.job.id, attached, raise)
        };
        if raise {
            state.enqueue(track_id, priority);
        }
        drop(state);

        if attached {
            debug!(track = %track_id, owner = %owner, "Owner attached to existing download");
            self.emit(DownloadEvent::Queued {
                track_id: track_id.to_string(),
                owner: owner.clone(),
            });
        }
        Some(SubmitOutcome::Existing(id))
    }

    /// Create a fresh job; the caller has checked no job exists for the track
    fn insert_job(&self, state: &mut SchedulerState, track: Track, owner: &Owner, path: PathBuf, priority: Priority) -> Uuid {
        let job = DownloadJob::new(track, owner.clone(), priority, path);
        let id = job.id;
        let key = job.track.id.clone();
        state
            .jobs
            .insert(key.clone(), JobEntry::new(job, self.root.child_token()));
        state.enqueue(&key, priority);
        id
    }
}

/// Priority download queue shared by every content owner
///
/// Cloning shares the same queue.
#[derive(Clone)]
pub struct DownloadScheduler {
    inner: Arc<Inner>,
}

impl DownloadScheduler {
    pub fn new(
        cache: MediaCache,
        fetcher: ChunkFetcher,
        governor: BandwidthGovernor,
        requeue_delay: Duration,
        bus: EventBus,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SchedulerState::default()),
                work: Notify::new(),
                cache,
                fetcher,
                governor,
                requeue_delay,
                events,
                bus,
                root: CancellationToken::new(),
            }),
        }
    }

    /// Start the dispatcher; it runs until `shutdown` or the handle is stopped
    pub fn start(&self) -> TaskHandle {
        let inner = Arc::clone(&self.inner);
        TaskHandle::spawn("download-dispatcher", &self.inner.root, move |token| {
            dispatch_loop(inner, token)
        })
    }

    /// Cancel every job and stop dispatching
    pub fn shutdown(&self) {
        self.inner.root.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn cache(&self) -> &MediaCache {
        &self.inner.cache
    }

    pub fn governor(&self) -> &BandwidthGovernor {
        &self.inner.governor
    }

    /// Queue `track` for `owner` unless a verified copy already exists
    ///
    /// A track never gets a second job: a later owner is attached to the
    /// live one and a higher priority raises it. When another owner already
    /// holds a verified copy, it is copied into place without a download.
    pub async fn submit(&self, track: Track, owner: Owner, priority: Priority) -> Result<SubmitOutcome> {
        let path = self.inner.cache.path_for(&track, &owner)?;

        if let Some(outcome) = self.inner.attach(&track.id, &owner, &path, priority) {
            return Ok(outcome);
        }

        // Hashing happens outside the lock
        if self.inner.cache.is_complete(&track, &path).await? {
            self.inner.state().verified.insert(path.clone(), track.id.clone());
            debug!(track = %track.id, "Verified file already cached");
            return Ok(SubmitOutcome::AlreadyComplete(path));
        }

        let source = self.inner.state().verified_copy(&track.id, &path);
        if let Some(source) = source {
            match self.inner.cache.install_copy(&track, &source, &path).await {
                Ok(()) => {
                    self.inner.state().verified.insert(path.clone(), track.id.clone());
                    debug!(track = %track.id, owner = %owner, "Copied from verified cache file");
                    return Ok(SubmitOutcome::AlreadyComplete(path));
                }
                Err(e) => warn!(track = %track.id, "Cached copy unusable, downloading: {}", e),
            }
        }

        let track_id = track.id.clone();
        let job_id = {
            let mut state = self.inner.state();
            // Another submit may have won the race while we were hashing
            if state.verified.contains_key(&path) {
                return Ok(SubmitOutcome::AlreadyComplete(path));
            }
            if state.jobs.contains_key(&track_id) {
                drop(state);
                return Ok(self
                    .inner
                    .attach(&track_id, &owner, &path, priority)
                    .unwrap_or(SubmitOutcome::AlreadyComplete(path)));
            }
            self.inner.insert_job(&mut state, track, &owner, path, priority)
        };

        debug!(track = %track_id, owner = %owner, ?priority, "Download queued");
        self.inner.emit(DownloadEvent::Queued {
            track_id,
            owner,
        });
        self.inner.work.notify_one();
        Ok(SubmitOutcome::Queued(job_id))
    }

    /// Abort the job for `track_id` for every owner
    ///
    /// Schedule-bucket partial files are discarded; playlist-bucket partials
    /// stay for resume. Returns the number of owners cancelled.
    pub async fn cancel(&self, track_id: &str) -> usize {
        let removed = self.inner.state().jobs.remove(track_id);
        let Some(entry) = removed else {
            return 0;
        };
        entry.cancel.cancel();
        if entry.job.bucket == ContentBucket::Schedule {
            discard(&partial_path(&entry.job.local_path)).await;
        }
        for target in &entry.targets {
            self.report_cancelled(track_id, &target.owner);
        }
        entry.targets.len()
    }

    /// Detach `owner` from every job it holds
    ///
    /// A job with no owners left is aborted. When the fetching owner leaves
    /// while others remain, the download restarts into the next owner's
    /// cache path. Returns the number of jobs the owner was detached from.
    pub async fn cancel_owner(&self, owner: &Owner) -> usize {
        let mut abandoned: Vec<PathBuf> = Vec::new();
        let mut detached: Vec<String> = Vec::new();
        let mut requeue = false;
        {
            let mut state = self.inner.state();
            let keys: Vec<String> = state
                .jobs
                .iter()
                .filter(|(_, entry)| entry.targets.iter().any(|t| &t.owner == owner))
                .map(|(key, _)| key.clone())
                .collect();

            for key in keys {
                let Some(entry) = state.jobs.get_mut(&key) else {
                    continue;
                };
                let was_primary = &entry.job.owner == owner;
                let old_path = entry.job.local_path.clone();
                entry.targets.retain(|t| &t.owner != owner);

                if entry.targets.is_empty() {
                    if let Some(entry) = state.jobs.remove(&key) {
                        entry.cancel.cancel();
                    }
                    if owner.bucket() == ContentBucket::Schedule {
                        abandoned.push(old_path);
                    }
                } else if was_primary {
                    entry.rehome();
                    if entry.phase == Phase::Running {
                        entry.cancel.cancel();
                        entry.cancel = self.inner.root.child_token();
                        entry.generation += 1;
                        let priority = entry.job.priority;
                        state.enqueue(&key, priority);
                        requeue = true;
                    }
                    if owner.bucket() == ContentBucket::Schedule {
                        abandoned.push(old_path);
                    }
                } else {
                    entry.job.owners = entry.owners();
                }
                detached.push(key);
            }
        }

        for path in &abandoned {
            discard(&partial_path(path)).await;
        }
        for track_id in &detached {
            self.report_cancelled(track_id, owner);
        }
        if requeue {
            self.inner.work.notify_one();
        }
        detached.len()
    }

    fn report_cancelled(&self, track_id: &str, owner: &Owner) {
        info!(track = %track_id, owner = %owner, "Download cancelled");
        self.inner.emit(DownloadEvent::Cancelled {
            track_id: track_id.to_string(),
            owner: owner.clone(),
        });
    }

    /// Queue every job waiting out its requeue delay right away
    ///
    /// Used when connectivity returns. Returns the number of jobs requeued.
    pub fn resume_backoff(&self) -> usize {
        let count = {
            let mut state = self.inner.state();
            let waiting: Vec<(String, Priority)> = state
                .jobs
                .iter()
                .filter(|(_, entry)| entry.phase == Phase::Backoff)
                .map(|(key, entry)| (key.clone(), entry.job.priority))
                .collect();
            for (key, priority) in &waiting {
                state.enqueue(key, *priority);
            }
            waiting.len()
        };
        if count > 0 {
            debug!(count, "Failed downloads requeued early");
            self.inner.work.notify_one();
        }
        count
    }

    /// Forget verification of `track_id` and delete its cached files
    pub async fn invalidate(&self, track_id: &str) -> Result<usize> {
        let paths: Vec<PathBuf> = {
            let mut state = self.inner.state();
            let paths: Vec<PathBuf> = state
                .verified
                .iter()
                .filter(|(_, id)| id.as_str() == track_id)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &paths {
                state.verified.remove(path);
            }
            paths
        };

        for path in &paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::from_io("remove invalidated file", e)),
            }
        }
        info!(track = %track_id, files = paths.len(), "Track invalidated");
        Ok(paths.len())
    }

    /// Drop verification records under `dir` (after the directory was removed)
    pub fn forget_dir(&self, dir: &Path) {
        self.inner.state().verified.retain(|path, _| !path.starts_with(dir));
    }

    /// Drop the verification record of one file (after it was deleted)
    pub fn forget_path(&self, path: &Path) {
        self.inner.state().verified.remove(path);
    }

    /// Whether `path` is a verified cache file
    pub fn is_verified(&self, path: &Path) -> bool {
        self.inner.state().verified.contains_key(path)
    }

    /// Snapshot of all live jobs
    pub fn jobs(&self) -> Vec<DownloadJob> {
        self.inner
            .state()
            .jobs
            .values()
            .map(|entry| entry.job.clone())
            .collect()
    }

    pub fn job_for_track(&self, track_id: &str) -> Option<DownloadJob> {
        self.inner
            .state()
            .jobs
            .get(track_id)
            .map(|entry| entry.job.clone())
    }

    /// Jobs currently holding `status=downloading`
    pub fn downloading_count(&self) -> usize {
        self.inner.state().downloading
    }

    /// Highest number of simultaneously downloading jobs ever observed
    pub fn peak_downloading(&self) -> usize {
        self.inner.state().peak_downloading
    }

    /// Track ids of the verified files under `owner_dir`
    pub fn verified_tracks(&self, owner_dir: &Path) -> HashSet<String> {
        self.inner
            .state()
            .verified
            .iter()
            .filter(|(path, _)| path.starts_with(owner_dir))
            .map(|(_, id)| id.clone())
            .collect()
    }
}

async fn dispatch_loop(inner: Arc<Inner>, token: CancellationToken) {
    info!("Download dispatcher started");
    loop {
        let permit = tokio::select! {
            _ = token.cancelled() => break,
            permit = inner.governor.acquire() => permit,
        };

        let next = inner.state().pop_next();
        match next {
            Some(dispatch) => {
                tokio::spawn(run_job(Arc::clone(&inner), dispatch, permit));
            }
            None => {
                drop(permit);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = inner.work.notified() => {}
                }
            }
        }
    }
    info!("Download dispatcher stopped");
}

struct JobObserver<'a> {
    inner: &'a Inner,
    key: &'a str,
    generation: u64,
}

impl FetchObserver for JobObserver<'_> {
    fn on_progress(&self, progress: FetchProgress) {
        let owners = {
            let mut state = self.inner.state();
            match state.jobs.get_mut(self.key) {
                Some(entry) if entry.generation == self.generation => {
                    entry.job.bytes_downloaded = progress.bytes_downloaded;
                    if progress.total_bytes > 0 {
                        entry.job.total_bytes = progress.total_bytes;
                    }
                    entry.owners()
                }
                _ => return,
            }
        };
        for owner in owners {
            self.inner.emit(DownloadEvent::Progress {
                track_id: self.key.to_string(),
                owner,
                bytes_downloaded: progress.bytes_downloaded,
                total_bytes: progress.total_bytes,
                bytes_per_second: progress.bytes_per_second,
            });
        }
    }

    fn on_retry(&self, _retry: u32, error: &Error) {
        let mut state = self.inner.state();
        if let Some(entry) = state.jobs.get_mut(self.key) {
            if entry.generation == self.generation {
                entry.job.last_error = Some(error.to_string());
            }
        }
    }
}

async fn run_job(inner: Arc<Inner>, dispatch: Dispatch, permit: DownloadPermit) {
    let Dispatch {
        key,
        job,
        cancel,
        generation,
    } = dispatch;

    for owner in inner.owners_of(&key, generation) {
        inner.emit(DownloadEvent::Started {
            track_id: key.clone(),
            owner,
        });
    }

    let observer = JobObserver {
        inner: &inner,
        key: &key,
        generation,
    };
    let result = inner
        .fetcher
        .fetch(&job.track, &job.local_path, &cancel, &observer)
        .await;

    {
        let mut state = inner.state();
        state.downloading = state.downloading.saturating_sub(1);
    }
    drop(permit);

    match result {
        Ok(outcome) => {
            let targets = {
                let mut state = inner.state();
                let Some(entry) = state.jobs.remove(&key) else {
                    // Every owner was cancelled while the last chunk landed
                    return;
                };
                if entry.generation != generation {
                    // A restarted fetch for another path is no longer needed
                    entry.cancel.cancel();
                }
                state.verified.insert(job.local_path.clone(), key.clone());
                entry.targets
            };
            inner.bus.emit_lossy(FleetEvent::TrackDownloaded {
                track_id: key.clone(),
                bytes: outcome.bytes,
            });
            install_targets(&inner, &job, targets).await;
        }
        Err(failure) => {
            if cancel.is_cancelled() {
                // cancel()/shutdown already removed and reported the job
                return;
            }

            let fatal = failure.error.class() != ErrorClass::Retryable;
            let message = failure.error.to_string();
            let (retry_count, owners) = {
                let mut state = inner.state();
                let Some(entry) = state.jobs.get_mut(&key) else {
                    return;
                };
                if entry.generation != generation {
                    return;
                }
                // A fatal first attempt still counts as one try
                entry.job.retry_count += failure.retries.max(1);
                entry.job.status = DownloadStatus::Error;
                entry.job.last_error = Some(message.clone());
                entry.phase = Phase::Backoff;
                (entry.job.retry_count, entry.owners())
            };

            warn!(
                track = %key,
                owner = %job.owner,
                retry_count,
                fatal,
                "Download failed, requeue in {:?}: {}",
                inner.requeue_delay,
                message
            );
            inner.bus.emit_lossy(FleetEvent::DownloadFailed {
                track_id: key.clone(),
                error: message.clone(),
                retry_count,
                fatal,
            });
            for owner in owners {
                inner.emit(DownloadEvent::Failed {
                    track_id: key.clone(),
                    owner,
                    error: message.clone(),
                    retry_count,
                    fatal,
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(inner.requeue_delay) => {
                    let requeued = {
                        let mut state = inner.state();
                        let waiting = state
                            .jobs
                            .get(&key)
                            .filter(|entry| entry.generation == generation && entry.phase == Phase::Backoff)
                            .map(|entry| entry.job.priority);
                        match waiting {
                            Some(priority) => {
                                state.enqueue(&key, priority);
                                true
                            }
                            None => false,
                        }
                    };
                    if requeued {
                        debug!(track = %key, "Download requeued");
                        inner.work.notify_one();
                    }
                }
            }
        }
    }
}

/// Give every owner of a finished download its verified file
async fn install_targets(inner: &Inner, job: &DownloadJob, targets: Vec<Target>) {
    let track_id = &job.track.id;
    for target in targets {
        if target.path != job.local_path {
            if let Err(e) = inner
                .cache
                .install_copy(&job.track, &job.local_path, &target.path)
                .await
            {
                warn!(track = %track_id, owner = %target.owner, "Copy for owner failed: {}", e);
                requeue_target(inner, job, target, e.to_string());
                continue;
            }
            inner
                .state()
                .verified
                .insert(target.path.clone(), track_id.clone());
        }
        inner.emit(DownloadEvent::Completed {
            track_id: track_id.clone(),
            owner: target.owner,
            path: target.path,
        });
    }
}

/// Fetch again for an owner whose copy could not be installed
fn requeue_target(inner: &Inner, job: &DownloadJob, target: Target, error: String) {
    let retry_count = {
        let mut state = inner.state();
        if state.jobs.contains_key(&job.track.id) {
            drop(state);
            inner.attach(&job.track.id, &target.owner, &target.path, job.priority);
            return;
        }
        inner.insert_job(&mut state, job.track.clone(), &target.owner, target.path, job.priority);
        let entry = state.jobs.get_mut(&job.track.id);
        entry.map(|e| {
            e.job.retry_count = 1;
            e.job.last_error = Some(error.clone());
            e.job.retry_count
        })
        .unwrap_or(1)
    };
    inner.emit(DownloadEvent::Failed {
        track_id: job.track.id.clone(),
        owner: target.owner,
        error,
        retry_count,
        fatal: false,
    });
    inner.work.notify_one();
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Discarded partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to discard partial file {}: {}", path.display(), e),
    }
}
