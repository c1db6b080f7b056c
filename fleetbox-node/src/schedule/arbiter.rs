//! Priority Arbiter
//!
//! Decides which content source may be audible. Priority is strict:
//! announcement > schedule > playlist. A higher source pre-empts the audible
//! one; when it releases, the next-highest requesting source resumes, but only
//! if it was playing when it was pre-empted.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use fleetbox_common::model::SourceKind;

/// What the engine must do to the sequencers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbiterAction {
    /// Fade out and pause, keeping position
    Suspend(SourceKind),
    /// Start a source that has not played yet
    Start(SourceKind),
    /// Resume a source that was pre-empted while playing
    Resume(SourceKind),
}

impl ArbiterAction {
    pub fn source(&self) -> SourceKind {
        match self {
            ArbiterAction::Suspend(s) | ArbiterAction::Start(s) | ArbiterAction::Resume(s) => *s,
        }
    }
}

#[derive(Debug, Default)]
pub struct PriorityArbiter {
    /// Sources that currently have content
    requested: BTreeSet<SourceKind>,
    audible: Option<SourceKind>,
    /// Whether a non-audible requested source should play once it is on top
    was_playing: HashMap<SourceKind, bool>,
}

impl PriorityArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The source allowed to be audible
    pub fn audible(&self) -> Option<SourceKind> {
        self.audible
    }

    pub fn is_requested(&self, source: SourceKind) -> bool {
        self.requested.contains(&source)
    }

    /// `source` has content to play
    ///
    /// `audible_playing` tells whether the currently audible source is
    /// actually playing; it decides whether that source resumes later.
    pub fn request(&mut self, source: SourceKind, audible_playing: bool) -> Vec<ArbiterAction> {
        self.requested.insert(source);
        match self.audible {
            None => {
                self.audible = Some(source);
                debug!(?source, "Source granted");
                vec![ArbiterAction::Start(source)]
            }
            Some(current) if current == source => Vec::new(),
            Some(current) if source > current => {
                self.was_playing.insert(current, audible_playing);
                self.audible = Some(source);
                debug!(from = ?current, to = ?source, "Source pre-empted");
                vec![ArbiterAction::Suspend(current), ArbiterAction::Start(source)]
            }
            Some(_) => {
                // Lower than the audible source: plays once everything above releases
                self.was_playing.insert(source, true);
                Vec::new()
            }
        }
    }

    /// `source` has nothing more to play
    pub fn release(&mut self, source: SourceKind) -> Vec<ArbiterAction> {
        self.requested.remove(&source);
        self.was_playing.remove(&source);
        if self.audible != Some(source) {
            return Vec::new();
        }

        self.audible = self.requested.iter().next_back().copied();
        match self.audible {
            Some(next) => {
                let resume = self.was_playing.remove(&next).unwrap_or(false);
                debug!(released = ?source, next = ?next, resume, "Source released");
                if resume {
                    vec![ArbiterAction::Resume(next)]
                } else {
                    Vec::new()
                }
            }
            None => Vec::new(),
        }
    }

    /// Record whether a pre-empted source should resume (e.g. paused by the user)
    pub fn set_was_playing(&mut self, source: SourceKind, playing: bool) {
        if self.requested.contains(&source) && self.audible != Some(source) {
            self.was_playing.insert(source, playing);
        }
    }
}
