//! Persisted playback position

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fleetbox_common::model::SourceKind;

/// Where playback was when the node last saved it
///
/// Restored at startup so a rebooted device resumes the same playlist near
/// the same place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub source: SourceKind,
    pub playlist_id: String,
    pub schedule_id: Option<String>,
    pub index: usize,
    pub position_secs: f64,
    pub is_playing: bool,
    pub saved_at: DateTime<Utc>,
}
