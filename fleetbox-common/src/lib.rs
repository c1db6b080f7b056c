//! # Fleetbox Common Library
//!
//! Shared code for the Fleetbox playback node and its tooling:
//! - Content model (tracks, playlists, schedules, announcements)
//! - Fleet control channel message types
//! - Event types and the EventBus
//! - Configuration file discovery
//! - Time helpers

pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod model;
pub mod time;

pub use error::{Error, Result};
