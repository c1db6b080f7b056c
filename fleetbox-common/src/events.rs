//! Event types for the Fleetbox event system
//!
//! Provides the shared [`FleetEvent`] definitions and the [`EventBus`] used to
//! fan them out between the node's services and the SSE endpoint.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::SourceKind;

/// Why a schedule handed control back to the base playlist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// Window closed normally
    ScheduleEnded,
    /// Removed by the fleet server
    ScheduleDeleted,
    /// Error budget exhausted; the schedule stays blocked until reset
    TooManyErrors,
    /// Payload failed validation
    InvalidSchedule,
    /// Playback of the schedule failed; a retry is pending
    PlaybackFailed,
    /// Manual pause overrides activation
    ManualPause,
    /// Superseded by another schedule whose window also contains now
    Superseded,
}

/// Fleetbox event types
///
/// Events are broadcast via [`EventBus`] and serialized for SSE transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FleetEvent {
    /// A track file was fetched and verified
    TrackDownloaded {
        track_id: String,
        bytes: u64,
    },

    /// A download attempt failed
    ///
    /// `fatal` failures are not retried until the owner is resubmitted.
    DownloadFailed {
        track_id: String,
        error: String,
        retry_count: u32,
        fatal: bool,
    },

    /// A track became audible
    TrackStarted {
        source: SourceKind,
        track_id: String,
        index: usize,
    },

    /// A track could not be played and was skipped
    TrackSkipped {
        source: SourceKind,
        track_id: String,
        reason: String,
    },

    CrossfadeStarted {
        source: SourceKind,
        from_track: String,
        to_track: String,
        fade_secs: f64,
    },

    /// Next track was not ready when the transition fired
    HardCut {
        source: SourceKind,
        track_id: String,
    },

    /// The audible source changed
    SourceChanged {
        from: Option<SourceKind>,
        to: Option<SourceKind>,
    },

    ScheduleStarted {
        schedule_id: String,
    },

    ScheduleStopped {
        schedule_id: String,
        reason: FallbackReason,
    },

    /// Emitted once per schedule when it gives up and the playlist takes over
    ScheduleFallback {
        schedule_id: String,
        reason: FallbackReason,
        error_count: u32,
    },

    AnnouncementStarted {
        announcement_id: String,
    },

    AnnouncementFinished {
        announcement_id: String,
    },

    /// Reply to a delete request; `success` is false for unknown ids
    AnnouncementDeleted {
        announcement_id: String,
        success: bool,
    },

    /// A track stopped sounding and was written to the play history
    TrackPlayed {
        source: SourceKind,
        track_id: String,
        /// Whole seconds
        play_duration: u64,
        /// At least 90% of the track was heard
        completed: bool,
    },

    /// The media library became reachable or unreachable
    ConnectivityChanged {
        online: bool,
    },

    /// 0.0-1.0
    VolumeChanged {
        volume: f32,
    },
}

impl FleetEvent {
    /// Event name used for the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            FleetEvent::TrackDownloaded { .. } => "TrackDownloaded",
            FleetEvent::DownloadFailed { .. } => "DownloadFailed",
            FleetEvent::TrackStarted { .. } => "TrackStarted",
            FleetEvent::TrackSkipped { .. } => "TrackSkipped",
            FleetEvent::CrossfadeStarted { .. } => "CrossfadeStarted",
            FleetEvent::HardCut { .. } => "HardCut",
            FleetEvent::SourceChanged { .. } => "SourceChanged",
            FleetEvent::ScheduleStarted { .. } => "ScheduleStarted",
            FleetEvent::ScheduleStopped { .. } => "ScheduleStopped",
            FleetEvent::ScheduleFallback { .. } => "ScheduleFallback",
            FleetEvent::AnnouncementStarted { .. } => "AnnouncementStarted",
            FleetEvent::AnnouncementFinished { .. } => "AnnouncementFinished",
            FleetEvent::AnnouncementDeleted { .. } => "AnnouncementDeleted",
            FleetEvent::TrackPlayed { .. } => "TrackPlayed",
            FleetEvent::ConnectivityChanged { .. } => "ConnectivityChanged",
            FleetEvent::VolumeChanged { .. } => "VolumeChanged",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use fleetbox_common::events::{EventBus, FleetEvent};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(FleetEvent::VolumeChanged { volume: 0.5 });
/// assert_eq!(rx.try_recv().unwrap(), FleetEvent::VolumeChanged { volume: 0.5 });
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FleetEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: FleetEvent,
    ) -> Result<usize, broadcast::error::SendError<FleetEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
