//! Audio output capability
//!
//! The engine drives audio only through [`AudioOutput::load`] and the
//! resulting [`AudioHandle`]. The host media layer implements these; the
//! node ships [`SimulatedOutput`], a virtual playback clock on tokio time
//! that runs headless and lets tests observe what is audible.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Lifecycle of one loaded file; `Ended` and `Failed` stand in for the
/// host's `onEnded`/`onError` callbacks
#[derive(Debug, Clone, PartialEq)]
pub enum HandleStatus {
    Loading,
    Ready,
    Playing,
    Paused,
    Ended,
    Failed(String),
}

/// One loaded audio file
pub trait AudioHandle: Send + Sync {
    fn play(&mut self);
    fn pause(&mut self);
    /// Stop and rewind
    fn stop(&mut self);
    fn seek(&mut self, seconds: f64);
    /// Output gain, clamped to 0.0-1.0
    fn set_gain(&mut self, gain: f32);
    fn gain(&self) -> f32;
    /// Playback position in seconds
    fn current_time(&self) -> f64;
    fn duration(&self) -> f64;
    fn status(&self) -> HandleStatus;

    /// Signal level before gain, when the host can meter it
    fn level(&self) -> Option<f32> {
        None
    }

    /// Remaining seconds
    fn remaining(&self) -> f64 {
        (self.duration() - self.current_time()).max(0.0)
    }
}

/// Loads files into playable handles
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Load `path`; `duration_hint` is the catalogue duration in seconds
    async fn load(&self, path: &Path, duration_hint: f64) -> Result<Box<dyn AudioHandle>>;
}

// ============================================================================
// Simulated output
// ============================================================================

#[derive(Debug)]
struct SimState {
    path: PathBuf,
    duration: f64,
    /// Position at `anchor` (or the frozen position when not playing)
    offset: f64,
    anchor: Option<Instant>,
    gain: f32,
    status: HandleStatus,
    level: Option<f32>,
}

impl SimState {
    fn position(&self) -> f64 {
        let elapsed = self
            .anchor
            .map(|anchor| anchor.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        (self.offset + elapsed).min(self.duration)
    }

    fn status(&self) -> HandleStatus {
        if self.status == HandleStatus::Playing && self.position() >= self.duration {
            HandleStatus::Ended
        } else {
            self.status.clone()
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What a handle is doing right now, as seen from outside
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSnapshot {
    pub path: PathBuf,
    pub gain: f32,
    pub position: f64,
    pub status: HandleStatus,
}

impl HandleSnapshot {
    /// Playing with non-zero gain
    pub fn is_audible(&self) -> bool {
        self.status == HandleStatus::Playing && self.gain > 0.0
    }
}

#[derive(Default)]
struct SimRegistry {
    handles: Vec<Weak<Mutex<SimState>>>,
    durations: HashMap<PathBuf, f64>,
    levels: HashMap<PathBuf, f32>,
    broken: HashSet<PathBuf>,
}

/// Virtual audio output driven by tokio time
///
/// Clones share the same registry of live handles.
#[derive(Clone, Default)]
pub struct SimulatedOutput {
    registry: Arc<Mutex<SimRegistry>>,
}

impl SimulatedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, SimRegistry> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Override the duration reported for `path`
    pub fn set_duration(&self, path: impl Into<PathBuf>, seconds: f64) {
        self.registry().durations.insert(path.into(), seconds);
    }

    /// Meter `path` at a fixed level
    pub fn set_level(&self, path: impl Into<PathBuf>, level: f32) {
        self.registry().levels.insert(path.into(), level);
    }

    /// Make loads of `path` fail as undecodable
    pub fn mark_broken(&self, path: impl Into<PathBuf>) {
        self.registry().broken.insert(path.into());
    }

    /// Fail every live handle for `path` (host `onError`)
    pub fn fail_playing(&self, path: &Path, reason: &str) {
        for state in self.live() {
            let mut state = lock(&state);
            if state.path == path {
                state.status = HandleStatus::Failed(reason.to_string());
                state.anchor = None;
            }
        }
    }

    fn live(&self) -> Vec<Arc<Mutex<SimState>>> {
        let mut registry = self.registry();
        registry.handles.retain(|weak| weak.strong_count() > 0);
        registry.handles.iter().filter_map(Weak::upgrade).collect()
    }

    /// Snapshot of every live handle
    pub fn handles(&self) -> Vec<HandleSnapshot> {
        self.live()
            .iter()
            .map(|state| {
                let state = lock(state);
                HandleSnapshot {
                    path: state.path.clone(),
                    gain: state.gain,
                    position: state.position(),
                    status: state.status(),
                }
            })
            .collect()
    }

    /// Handles currently producing sound
    pub fn audible(&self) -> Vec<HandleSnapshot> {
        self.handles().into_iter().filter(|h| h.is_audible()).collect()
    }
}

#[async_trait]
impl AudioOutput for SimulatedOutput {
    async fn load(&self, path: &Path, duration_hint: f64) -> Result<Box<dyn AudioHandle>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => return Err(Error::Playback(format!("empty file {}", path.display()))),
            Err(e) => {
                return Err(Error::Playback(format!(
                    "cannot open {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        let (duration, level) = {
            let registry = self.registry();
            if registry.broken.contains(path) {
                return Err(Error::Playback(format!("cannot decode {}", path.display())));
            }
            let duration = registry.durations.get(path).copied().unwrap_or(duration_hint);
            (duration, registry.levels.get(path).copied())
        };
        if !(duration > 0.0) {
            return Err(Error::Playback(format!("unknown duration for {}", path.display())));
        }

        let state = Arc::new(Mutex::new(SimState {
            path: path.to_path_buf(),
            duration,
            offset: 0.0,
            anchor: None,
            gain: 0.0,
            status: HandleStatus::Ready,
            level,
        }));
        self.registry().handles.push(Arc::downgrade(&state));
        debug!("Loaded {} ({:.1}s)", path.display(), duration);
        Ok(Box::new(SimulatedHandle { state }))
    }
}

/// Handle produced by [`SimulatedOutput`]; dropping it unloads the file
pub struct SimulatedHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }
}

impl AudioHandle for SimulatedHandle {
    fn play(&mut self) {
        let mut state = self.state();
        match state.status() {
            HandleStatus::Ready | HandleStatus::Paused => {
                state.anchor = Some(Instant::now());
                state.status = HandleStatus::Playing;
            }
            _ => {}
        }
    }

    fn pause(&mut self) {
        let mut state = self.state();
        if state.status() == HandleStatus::Playing {
            state.offset = state.position();
            state.anchor = None;
            state.status = HandleStatus::Paused;
        }
    }

    fn stop(&mut self) {
        let mut state = self.state();
        if matches!(state.status, HandleStatus::Failed(_)) {
            return;
        }
        state.offset = 0.0;
        state.anchor = None;
        state.status = HandleStatus::Ready;
    }

    fn seek(&mut self, seconds: f64) {
        let mut state = self.state();
        state.offset = seconds.clamp(0.0, state.duration);
        if state.anchor.is_some() {
            state.anchor = Some(Instant::now());
        }
    }

    fn set_gain(&mut self, gain: f32) {
        self.state().gain = gain.clamp(0.0, 1.0);
    }

    fn gain(&self) -> f32 {
        self.state().gain
    }

    fn current_time(&self) -> f64 {
        self.state().position()
    }

    fn duration(&self) -> f64 {
        self.state().duration
    }

    fn status(&self) -> HandleStatus {
        self.state().status()
    }

    fn level(&self) -> Option<f32> {
        let state = self.state();
        match state.status {
            HandleStatus::Failed(_) => None,
            _ => state.level,
        }
    }
}
