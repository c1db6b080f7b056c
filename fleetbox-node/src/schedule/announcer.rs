//! Recurring announcements
//!
//! Decides when a scheduled announcement goes on air. Like the supervisor it
//! is a pure state machine: the engine reports finished songs and clock
//! checks, and queues whatever comes back.
//!
//! - `songs`: after every `songInterval` finished tracks
//! - `minutes`: every `minuteInterval` minutes, the first check fires at once
//! - `specific`: at each local `HH:MM`, once per slot per day
//!
//! Nothing fires inside [`MIN_GAP_SECS`] of the previous firing, and only inside
//! the announcement's date window.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::error::{Error, Result};
use fleetbox_common::model::{Announcement, AnnouncementTrigger};

/// Minimum spacing between two firings
pub const MIN_GAP_SECS: i64 = 5;

#[derive(Debug, Default)]
pub struct AnnouncementPlanner {
    announcements: BTreeMap<String, Announcement>,
    songs_finished: u64,
    last_fired: Option<DateTime<Utc>>,
    minute_fired: HashMap<String, DateTime<Utc>>,
    /// (announcement, slot) -> local day it last played
    slot_fired: HashMap<(String, String), NaiveDate>,
}

impl AnnouncementPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a scheduled announcement; its trigger state restarts
    pub fn upsert(&mut self, announcement: Announcement) -> Result<()> {
        if !announcement.is_scheduled() {
            return Err(Error::BadRequest(format!(
                "announcement {} is not scheduled",
                announcement.id
            )));
        }
        announcement
            .validate()
            .map_err(|e| Error::BadRequest(e.to_string()))?;
        self.forget_state(&announcement.id);
        info!(
            announcement = %announcement.id,
            trigger = ?announcement.schedule_type,
            "Scheduled announcement registered"
        );
        self.announcements
            .insert(announcement.id.clone(), announcement);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Option<Announcement> {
        self.forget_state(id);
        self.announcements.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Announcement> {
        self.announcements.get(id)
    }

    pub fn announcements(&self) -> impl Iterator<Item = &Announcement> {
        self.announcements.values()
    }

    pub fn len(&self) -> usize {
        self.announcements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.announcements.is_empty()
    }

    fn forget_state(&mut self, id: &str) {
        self.minute_fired.remove(id);
        self.slot_fired.retain(|(owner, _), _| owner != id);
    }

    fn gap_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.last_fired
            .map(|last| now - last >= Duration::seconds(MIN_GAP_SECS))
            .unwrap_or(true)
    }

    /// A playlist or schedule track played to its end
    ///
    /// The caller skips this while paused or while an announcement is on
    /// air or queued, so those songs do not count.
    pub fn on_song_finished(&mut self, now: DateTime<Utc>) -> Vec<Announcement> {
        self.songs_finished += 1;
        if !self.gap_elapsed(now) {
            return Vec::new();
        }
        let count = self.songs_finished;
        let due: Vec<Announcement> = self
            .announcements
            .values()
            .filter(|a| a.schedule_type == AnnouncementTrigger::Songs && a.in_window(now))
            .filter(|a| {
                let interval = u64::from(a.song_interval.unwrap_or(0));
                interval > 0 && count % interval == 0
            })
            .cloned()
            .collect();
        if !due.is_empty() {
            debug!(songs = count, due = due.len(), "Song-count announcements due");
            self.last_fired = Some(now);
        }
        due
    }

    /// Clock check; `local` is the device's wall-clock time
    ///
    /// While `busy` (an announcement on air or queued) interval triggers
    /// wait for the next check. Specific-time slots still fire.
    pub fn check(&mut self, now: DateTime<Utc>, local: NaiveDateTime, busy: bool) -> Vec<Announcement> {
        if !self.gap_elapsed(now) {
            return Vec::new();
        }
        let clock = local.format("%H:%M").to_string();
        let today = local.date();
        let mut due = Vec::new();

        for announcement in self.announcements.values() {
            if !announcement.in_window(now) {
                continue;
            }
            match announcement.schedule_type {
                AnnouncementTrigger::Minutes if !busy => {
                    let interval =
                        Duration::minutes(i64::from(announcement.minute_interval.unwrap_or(0)));
                    let elapsed = self
                        .minute_fired
                        .get(&announcement.id)
                        .map(|last| now - *last >= interval)
                        .unwrap_or(true);
                    if elapsed {
                        self.minute_fired.insert(announcement.id.clone(), now);
                        due.push(announcement.clone());
                    }
                }
                AnnouncementTrigger::Specific => {
                    if !announcement.specific_times.iter().any(|t| *t == clock) {
                        continue;
                    }
                    let key = (announcement.id.clone(), clock.clone());
                    if self.slot_fired.get(&key) == Some(&today) {
                        continue;
                    }
                    self.slot_fired.insert(key, today);
                    due.push(announcement.clone());
                }
                _ => {}
            }
        }
        if !due.is_empty() {
            debug!(due = due.len(), clock = %clock, "Timed announcements due");
            self.last_fired = Some(now);
        }
        due
    }
}
