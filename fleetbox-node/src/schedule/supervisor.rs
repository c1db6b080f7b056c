//! Schedule Supervisor
//!
//! Holds the known schedules and decides, on every check, which one (if any)
//! should be active. It is a pure state machine: the engine feeds it time,
//! playback errors and control messages, and applies the returned
//! [`SupervisorAction`]s.
//!
//! ```text
//! Idle -> ScheduleActive -> (Ended | Errored) -> FallbackToPlaylist -> Idle
//! ```

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::config::ScheduleConfig;
use crate::error::{Error, Result};
use fleetbox_common::events::FallbackReason;
use fleetbox_common::model::Schedule;

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorAction {
    /// Start `schedule`'s playlist at `start_index`, superseding the playlist
    Activate {
        schedule: Schedule,
        start_index: usize,
    },
    /// Stop the active schedule and hand control back
    Deactivate {
        schedule_id: String,
        reason: FallbackReason,
    },
    /// The schedule exhausted its error budget; emitted once per schedule
    Fallback {
        schedule_id: String,
        error_count: u32,
    },
    /// Expired schedule removed; its cached media can be deleted
    Purge { schedule_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    ScheduleActive,
    /// A schedule gave up or is waiting out a retry; the playlist plays
    FallbackToPlaylist,
}

#[derive(Debug, Default, Clone)]
struct ErrorState {
    consecutive: u32,
    blocked: bool,
    retry_at: Option<DateTime<Utc>>,
    resume_index: Option<usize>,
}

#[derive(Debug)]
pub struct ScheduleSupervisor {
    schedules: BTreeMap<String, Schedule>,
    /// Schedule currently active, as it was when activated
    active: Option<Schedule>,
    errors: HashMap<String, ErrorState>,
    /// Played to the end of a non-looping program inside its window
    finished: HashSet<String>,
    manual_pause: bool,
    max_errors: u32,
    retry_delay: Duration,
}

impl ScheduleSupervisor {
    pub fn new(max_errors: u32, retry_delay: Duration) -> Self {
        Self {
            schedules: BTreeMap::new(),
            active: None,
            errors: HashMap::new(),
            finished: HashSet::new(),
            manual_pause: false,
            max_errors: max_errors.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Self {
        Self::new(
            config.max_errors,
            Duration::seconds(config.retry_delay_secs as i64),
        )
    }

    pub fn state(&self) -> SupervisorState {
        if self.active.is_some() {
            SupervisorState::ScheduleActive
        } else if self
            .errors
            .values()
            .any(|e| e.blocked || e.retry_at.is_some())
        {
            SupervisorState::FallbackToPlaylist
        } else {
            SupervisorState::Idle
        }
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|s| s.id.as_str())
    }

    pub fn schedules(&self) -> impl Iterator<Item = &Schedule> {
        self.schedules.values()
    }

    pub fn get(&self, id: &str) -> Option<&Schedule> {
        self.schedules.get(id)
    }

    pub fn error_count(&self, id: &str) -> u32 {
        self.errors.get(id).map(|e| e.consecutive).unwrap_or(0)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.errors.get(id).map(|e| e.blocked).unwrap_or(false)
    }

    pub fn manual_pause(&self) -> bool {
        self.manual_pause
    }

    pub fn set_manual_pause(&mut self, paused: bool) {
        if self.manual_pause != paused {
            info!(paused, "Manual pause changed");
        }
        self.manual_pause = paused;
    }

    /// Add or replace a schedule; counts as an external reset
    pub fn upsert(&mut self, schedule: Schedule) -> Result<()> {
        schedule
            .validate()
            .map_err(|e| Error::ScheduleInvalid(e.to_string()))?;
        self.errors.remove(&schedule.id);
        self.finished.remove(&schedule.id);
        debug!(schedule = %schedule.id, "Schedule stored");
        self.schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    /// Forget a schedule; the next check deactivates it if active
    pub fn remove(&mut self, id: &str) -> bool {
        self.errors.remove(id);
        self.finished.remove(id);
        self.schedules.remove(id).is_some()
    }

    /// Clear a schedule's error state so it may activate again
    pub fn reset(&mut self, id: &str) -> bool {
        self.finished.remove(id);
        let had_errors = self.errors.remove(id).is_some();
        if had_errors {
            info!(schedule = %id, "Schedule error state reset");
        }
        had_errors
    }

    /// Resume `id` at `index` the next time it activates
    pub fn resume_at(&mut self, id: &str, index: usize) {
        self.errors.entry(id.to_string()).or_default().resume_index = Some(index);
    }

    /// A track of `id` started; the error streak is over
    pub fn record_success(&mut self, id: &str) {
        if let Some(state) = self.errors.get_mut(id) {
            state.consecutive = 0;
        }
    }

    /// The program of `id` reached its end inside its window
    pub fn record_finished(&mut self, id: &str) -> Vec<SupervisorAction> {
        self.finished.insert(id.to_string());
        self.deactivate_if_active(id, FallbackReason::ScheduleEnded)
    }

    /// A track of `id` failed to play at `failed_index`
    ///
    /// Below the error budget the schedule is released and retried after the
    /// retry delay from the following track. Reaching the budget blocks it
    /// until reset and yields a single [`SupervisorAction::Fallback`].
    pub fn record_error(
        &mut self,
        id: &str,
        failed_index: usize,
        now: DateTime<Utc>,
    ) -> Vec<SupervisorAction> {
        let max_errors = self.max_errors;
        let retry_delay = self.retry_delay;
        let state = self.errors.entry(id.to_string()).or_default();
        if state.blocked {
            return Vec::new();
        }
        state.consecutive += 1;
        let count = state.consecutive;

        if count >= max_errors {
            state.blocked = true;
            state.retry_at = None;
            state.resume_index = None;
            warn!(schedule = %id, errors = count, "Schedule failed too often, falling back to playlist");
            let mut actions = self.deactivate_if_active(id, FallbackReason::TooManyErrors);
            actions.push(SupervisorAction::Fallback {
                schedule_id: id.to_string(),
                error_count: count,
            });
            actions
        } else {
            state.retry_at = Some(now + retry_delay);
            state.resume_index = Some(failed_index + 1);
            warn!(
                schedule = %id,
                errors = count,
                "Schedule playback failed, retrying in {}s",
                retry_delay.num_seconds()
            );
            self.deactivate_if_active(id, FallbackReason::PlaybackFailed)
        }
    }

    fn deactivate_if_active(&mut self, id: &str, reason: FallbackReason) -> Vec<SupervisorAction> {
        if self.active_id() == Some(id) {
            self.active = None;
            vec![SupervisorAction::Deactivate {
                schedule_id: id.to_string(),
                reason,
            }]
        } else {
            Vec::new()
        }
    }

    /// Evaluate every window against `now`
    pub fn check(&mut self, now: DateTime<Utc>) -> Vec<SupervisorAction> {
        let mut actions = Vec::new();

        // Expired schedules go first so a closed window deactivates
        let expired: Vec<String> = self
            .schedules
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();
        for id in expired {
            actions.extend(self.deactivate_if_active(&id, FallbackReason::ScheduleEnded));
            self.schedules.remove(&id);
            self.errors.remove(&id);
            self.finished.remove(&id);
            info!(schedule = %id, "Expired schedule purged");
            actions.push(SupervisorAction::Purge { schedule_id: id });
        }

        if let Some(active) = &self.active {
            if !self.schedules.contains_key(&active.id) {
                let id = active.id.clone();
                actions.extend(self.deactivate_if_active(&id, FallbackReason::ScheduleDeleted));
            }
        }

        if self.manual_pause {
            if let Some(id) = self.active_id().map(str::to_string) {
                actions.extend(self.deactivate_if_active(&id, FallbackReason::ManualPause));
            }
            return actions;
        }

        let candidate = self.candidate(now).cloned();
        match (candidate, self.active.clone()) {
            (Some(next), Some(current)) if next == current => {}
            (Some(next), current) => {
                if let Some(current) = current {
                    actions.extend(
                        self.deactivate_if_active(&current.id, FallbackReason::Superseded),
                    );
                }
                let start_index = self
                    .errors
                    .get_mut(&next.id)
                    .and_then(|e| {
                        e.retry_at = None;
                        e.resume_index.take()
                    })
                    .filter(|i| *i < next.playlist.len())
                    .unwrap_or(0);
                info!(schedule = %next.id, start_index, "Schedule activated");
                self.active = Some(next.clone());
                actions.push(SupervisorAction::Activate {
                    schedule: next,
                    start_index,
                });
            }
            (None, Some(current)) => {
                let reason = if current.contains(now) {
                    FallbackReason::Superseded
                } else {
                    FallbackReason::ScheduleEnded
                };
                actions.extend(self.deactivate_if_active(&current.id, reason));
            }
            (None, None) => {}
        }
        actions
    }

    /// The schedule that should be active at `now`
    ///
    /// Latest start wins; ties go to the greatest id.
    fn candidate(&self, now: DateTime<Utc>) -> Option<&Schedule> {
        self.schedules
            .values()
            .filter(|s| s.contains(now))
            .filter(|s| !self.finished.contains(&s.id))
            .filter(|s| match self.errors.get(&s.id) {
                Some(e) if e.blocked => false,
                Some(e) => e.retry_at.map(|at| now >= at).unwrap_or(true),
                None => true,
            })
            .max_by(|a, b| a.start_date.cmp(&b.start_date).then_with(|| a.id.cmp(&b.id)))
    }
}
