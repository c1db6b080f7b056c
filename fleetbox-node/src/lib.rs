//! # Fleetbox Node Library
//!
//! On-device media delivery and playback orchestration.
//!
//! **Purpose:** Keep the media a device is told to play on local disk
//! (rate-limited, resumable, checksummed downloads) and decide what is
//! audible at every moment: a base playlist, time-windowed schedules and
//! one-off announcements, with crossfades between tracks.
//!
//! **Architecture:** one [`Node`] per device owns the download scheduler and
//! the playback engine task; the HTTP control API feeds it fleet messages and
//! streams status back.

pub mod api;
pub mod config;
pub mod db;
pub mod download;
pub mod engine;
pub mod error;
pub mod network;
pub mod node;
pub mod playback;
pub mod schedule;
pub mod status;
pub mod task;

pub use error::{Error, Result};
pub use node::Node;
