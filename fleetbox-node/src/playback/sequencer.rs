//! Playback Sequencer
//!
//! Plays one playlist through two decks: the current track and the preloaded
//! next one. A fixed-cadence [`Sequencer::tick`] samples the current track;
//! when its remaining time drops to the crossfade offset the decks ramp
//! linearly down/up in lockstep and swap. If the next file is not loaded by
//! then, the current track fades out alone and the next one is loaded from
//! scratch (hard cut).
//!
//! One sequencer exists per source (base playlist, active schedule,
//! announcement). The engine owns them and decides which may be audible.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PlaybackConfig;
use crate::download::{MediaCache, Owner};
use crate::error::Result;
use crate::playback::fader::GainRamp;
use crate::playback::output::{AudioHandle, AudioOutput, HandleStatus};
use crate::playback::timing::{LoudnessWindow, TransitionTiming};
use fleetbox_common::model::{Playlist, SourceKind, Track};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    /// Nothing loaded, or waiting for a playable file
    Idle,
    Loading,
    Playing,
    Crossfading,
    /// Current track fading out ahead of a pause or a hard cut
    FadingOut,
    Paused,
    /// Non-looping playlist finished
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterFade {
    Advance,
    Pause,
    /// Release every deck once silent
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SequencerEvent {
    TrackStarted {
        track_id: String,
        index: usize,
    },
    TrackFinished {
        track_id: String,
        /// False when the track was cut short
        completed: bool,
        /// Position reached when the deck stopped
        played_secs: f64,
        /// Track length, from the playlist or else the decoder
        duration: f64,
    },
    CrossfadeStarted {
        from_track: String,
        to_track: String,
        fade_secs: f64,
    },
    /// The next track was not ready; the current one faded out alone
    HardCut {
        track_id: String,
    },
    TrackFailed {
        track_id: String,
        reason: String,
    },
    PlaylistEnded,
}

#[derive(Debug, Clone, Copy)]
pub struct SequencerConfig {
    pub preload_poll: Duration,
    pub preload_timeout: Duration,
}

impl SequencerConfig {
    pub fn from_config(config: &PlaybackConfig) -> Self {
        Self {
            preload_poll: config.preload_poll(),
            preload_timeout: config.preload_timeout(),
        }
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self::from_config(&PlaybackConfig::default())
    }
}

/// A loaded handle with the track it plays and its gain ramp
struct Deck {
    track: Track,
    index: usize,
    handle: Box<dyn AudioHandle>,
    ramp: Option<GainRamp>,
}

impl Deck {
    /// Apply the ramp at `now`; true once no ramp remains
    fn apply_ramp(&mut self, now: Instant) -> bool {
        match self.ramp {
            Some(ramp) => {
                self.handle.set_gain(ramp.gain_at(now));
                if ramp.is_complete_at(now) {
                    self.ramp = None;
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn fade_to(&mut self, gain: f32, duration: Duration, start: Instant) {
        self.ramp = Some(GainRamp::starting_at(start, self.handle.gain(), gain, duration));
    }

    fn is_done(&self) -> bool {
        matches!(self.handle.status(), HandleStatus::Ended | HandleStatus::Failed(_))
    }

    /// Stop the deck and report how far it got
    fn finish(mut self, completed: bool) -> SequencerEvent {
        let played_secs = self.handle.current_time();
        let duration = if self.track.duration > 0.0 {
            self.track.duration
        } else {
            self.handle.duration()
        };
        self.handle.stop();
        SequencerEvent::TrackFinished {
            track_id: self.track.id,
            completed,
            played_secs,
            duration,
        }
    }
}

enum Preload {
    Idle,
    Waiting {
        index: usize,
        path: PathBuf,
        deadline: Instant,
        next_poll: Instant,
    },
    Unavailable {
        index: usize,
    },
}

/// Point-in-time view for status reporting
#[derive(Debug, Clone, PartialEq)]
pub struct SequencerStatus {
    pub state: SequencerState,
    pub track_id: Option<String>,
    pub index: usize,
    pub position: f64,
    pub duration: f64,
    pub is_playing: bool,
}

pub struct Sequencer {
    source: SourceKind,
    owner: Owner,
    output: Arc<dyn AudioOutput>,
    cache: MediaCache,
    config: SequencerConfig,
    playlist: Option<Playlist>,
    index: usize,
    /// Position to seek to when playback next starts from `Idle`
    start_position: f64,
    state: SequencerState,
    after_fade: AfterFade,
    current: Option<Deck>,
    next: Option<Deck>,
    outgoing: Option<Deck>,
    preload: Preload,
    loudness: LoudnessWindow,
    timing: TransitionTiming,
    volume: f32,
    waiting_for_media: bool,
    /// Paused before anything was audible; blocks auto-start
    hold: bool,
    events: Vec<SequencerEvent>,
}

impl Sequencer {
    pub fn new(
        source: SourceKind,
        owner: Owner,
        output: Arc<dyn AudioOutput>,
        cache: MediaCache,
        config: SequencerConfig,
        volume: f32,
    ) -> Self {
        Self {
            source,
            owner,
            output,
            cache,
            config,
            playlist: None,
            index: 0,
            start_position: 0.0,
            state: SequencerState::Idle,
            after_fade: AfterFade::Advance,
            current: None,
            next: None,
            outgoing: None,
            preload: Preload::Idle,
            loudness: LoudnessWindow::new(),
            timing: TransitionTiming::for_duration(0.0),
            volume: volume.clamp(0.0, 1.0),
            waiting_for_media: false,
            hold: false,
            events: Vec::new(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn playlist(&self) -> Option<&Playlist> {
        self.playlist.as_ref()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timing(&self) -> TransitionTiming {
        self.timing
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.current.as_ref().map(|deck| &deck.track)
    }

    pub fn preloaded_track(&self) -> Option<&Track> {
        self.next.as_ref().map(|deck| &deck.track)
    }

    /// Audible or about to be
    pub fn is_playing(&self) -> bool {
        match self.state {
            SequencerState::Loading | SequencerState::Playing | SequencerState::Crossfading => true,
            SequencerState::FadingOut => self.after_fade == AfterFade::Advance,
            _ => false,
        }
    }

    /// Playing, or idle only because its media has not arrived yet
    pub fn is_active(&self) -> bool {
        self.is_playing() || (self.state == SequencerState::Idle && self.waiting_for_media && !self.hold)
    }

    pub fn is_waiting_for_media(&self) -> bool {
        self.state == SequencerState::Idle && self.waiting_for_media
    }

    pub fn status(&self) -> SequencerStatus {
        let deck = self.current.as_ref();
        SequencerStatus {
            state: self.state,
            track_id: deck.map(|d| d.track.id.clone()),
            index: self.index,
            position: deck.map(|d| d.handle.current_time()).unwrap_or(self.start_position),
            duration: deck.map(|d| d.handle.duration()).unwrap_or(0.0),
            is_playing: self.is_playing(),
        }
    }

    /// Drain events produced since the last call
    pub fn take_events(&mut self) -> Vec<SequencerEvent> {
        std::mem::take(&mut self.events)
    }

    fn emit(&mut self, event: SequencerEvent) {
        self.events.push(event);
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Replace the playlist and start at `index`/`position`
    pub async fn load(&mut self, playlist: Playlist, index: usize, position: f64) -> bool {
        self.prepare(playlist, index, position);
        self.hold = false;
        let start = self.index;
        self.start_from(start, position).await
    }

    /// Replace the playlist without starting it; `resume` starts it
    pub fn prepare(&mut self, playlist: Playlist, index: usize, position: f64) {
        self.stop();
        self.index = if index < playlist.len() { index } else { 0 };
        self.start_position = position.max(0.0);
        info!(
            source = ?self.source,
            playlist = %playlist.id,
            tracks = playlist.len(),
            "Playlist loaded"
        );
        self.playlist = Some(playlist);
    }

    /// Reload the playlist from its first track
    pub async fn restart(&mut self) -> bool {
        if self.playlist.is_none() {
            return false;
        }
        self.stop();
        self.hold = false;
        self.start_from(0, 0.0).await
    }

    /// Stop every deck immediately
    pub fn stop(&mut self) {
        for mut deck in [self.current.take(), self.next.take(), self.outgoing.take()]
            .into_iter()
            .flatten()
        {
            deck.handle.stop();
        }
        self.preload = Preload::Idle;
        self.state = SequencerState::Idle;
        self.waiting_for_media = false;
        self.start_position = 0.0;
        self.loudness.clear();
    }

    /// Fade out and pause; returns false if nothing was playing
    pub fn pause(&mut self) -> bool {
        match self.state {
            SequencerState::Playing | SequencerState::Crossfading | SequencerState::FadingOut => {
                let now = Instant::now();
                if let Some(outgoing) = self.outgoing.take() {
                    let event = outgoing.finish(true);
                    self.emit(event);
                }
                let fade = self.timing.fade();
                if let Some(current) = self.current.as_mut() {
                    current.fade_to(0.0, fade, now);
                }
                self.after_fade = AfterFade::Pause;
                self.state = SequencerState::FadingOut;
                debug!(source = ?self.source, "Pausing");
                true
            }
            SequencerState::Idle | SequencerState::Loading => {
                let was_waiting = self.waiting_for_media && !self.hold;
                self.hold = true;
                was_waiting
            }
            SequencerState::Paused | SequencerState::Ended => false,
        }
    }

    /// Fade out, then release every deck
    ///
    /// Returns false when nothing was audible; the sequencer is stopped
    /// right away in that case.
    pub fn fade_out(&mut self) -> bool {
        let audible = matches!(
            self.state,
            SequencerState::Playing | SequencerState::Crossfading | SequencerState::FadingOut
        );
        if !audible {
            self.stop();
            return false;
        }
        self.pause();
        self.after_fade = AfterFade::Stop;
        if let Some(mut next) = self.next.take() {
            next.handle.stop();
        }
        self.preload = Preload::Idle;
        true
    }

    /// Whether a [`fade_out`](Self::fade_out) is still in progress
    pub fn is_fading_out(&self) -> bool {
        self.state == SequencerState::FadingOut && self.after_fade == AfterFade::Stop
    }

    /// Resume with a fade-in; starts an idle playlist from its position
    pub async fn resume(&mut self) -> bool {
        self.hold = false;
        match self.state {
            SequencerState::Paused | SequencerState::FadingOut
                if self.state == SequencerState::Paused || self.after_fade == AfterFade::Pause =>
            {
                let now = Instant::now();
                let fade = self.timing.fade();
                let volume = self.volume;
                match self.current.as_mut() {
                    Some(current) => {
                        current.handle.play();
                        current.fade_to(volume, fade, now);
                        self.state = SequencerState::Playing;
                        debug!(source = ?self.source, "Resumed");
                        true
                    }
                    None => false,
                }
            }
            SequencerState::Idle if self.playlist.is_some() => {
                let (index, position) = (self.index, self.start_position);
                self.start_from(index, position).await
            }
            _ => false,
        }
    }

    pub fn set_volume(&mut self, volume: f32) {
        self.volume = volume.clamp(0.0, 1.0);
        let audible = matches!(
            self.state,
            SequencerState::Playing | SequencerState::Crossfading
        );
        if let Some(current) = self.current.as_mut() {
            match current.ramp {
                Some(ramp) if !ramp.is_fade_out() => current.ramp = Some(ramp.retarget(self.volume)),
                Some(_) => {}
                None if audible => current.handle.set_gain(self.volume),
                None => {}
            }
        }
    }

    pub fn seek(&mut self, seconds: f64) {
        if let Some(current) = self.current.as_mut() {
            current.handle.seek(seconds);
            self.loudness.clear();
        }
    }

    /// A file finished downloading; start or preload it if it was awaited
    pub async fn media_ready(&mut self, track_id: &str) {
        let Some(playlist) = self.playlist.as_ref() else {
            return;
        };
        if !playlist.tracks.iter().any(|t| t.id == track_id) {
            return;
        }

        if self.is_waiting_for_media() && !self.hold {
            info!(source = ?self.source, track = %track_id, "Media arrived, starting playback");
            let (index, position) = (self.index, self.start_position);
            self.start_from(index, position).await;
            return;
        }

        if let Preload::Unavailable { index } = self.preload {
            let awaited = playlist.track(index).map(|t| t.id == track_id).unwrap_or(false);
            if awaited && self.next.is_none() {
                self.request_preload();
            }
        }
    }

    // ========================================================================
    // Tick
    // ========================================================================

    /// Advance ramps, detect transitions and poll the preload
    pub async fn tick(&mut self, now: Instant) {
        match self.state {
            SequencerState::Playing => self.tick_playing(now).await,
            SequencerState::Crossfading => self.tick_crossfading(now).await,
            SequencerState::FadingOut => self.tick_fading_out(now).await,
            _ => {}
        }

        if matches!(
            self.state,
            SequencerState::Playing
                | SequencerState::Crossfading
                | SequencerState::FadingOut
                | SequencerState::Paused
        ) {
            self.poll_preload(now).await;
        }
    }

    async fn tick_playing(&mut self, now: Instant) {
        let Some(current) = self.current.as_mut() else {
            self.state = SequencerState::Idle;
            return;
        };
        current.apply_ramp(now);

        match current.handle.status() {
            HandleStatus::Failed(reason) => {
                self.on_current_failed(reason).await;
                return;
            }
            HandleStatus::Ended => {
                self.on_current_ended(now).await;
                return;
            }
            _ => {}
        }

        if let Some(level) = current.handle.level() {
            self.loudness.push(level);
        }
        let duration = current.handle.duration();
        let remaining = current.handle.remaining();

        let next_level = self.next.as_ref().and_then(|deck| deck.handle.level());
        self.timing = TransitionTiming::adaptive(duration, self.loudness.average(), next_level);

        if remaining <= self.timing.offset_secs && self.next_index().is_some() {
            if self.next.is_some() {
                self.start_crossfade(now);
            } else {
                self.start_hard_cut(now);
            }
        }
    }

    async fn tick_crossfading(&mut self, now: Instant) {
        if let Some(current) = self.current.as_mut() {
            current.apply_ramp(now);
        }

        let done = match self.outgoing.as_mut() {
            Some(outgoing) => outgoing.apply_ramp(now) || outgoing.is_done(),
            None => true,
        };
        if done {
            if let Some(outgoing) = self.outgoing.take() {
                let event = outgoing.finish(true);
                self.emit(event);
            }
            self.state = SequencerState::Playing;
        }

        let failure = match self.current.as_ref().map(|deck| deck.handle.status()) {
            Some(HandleStatus::Failed(reason)) => Some(reason),
            _ => None,
        };
        if let Some(reason) = failure {
            if let Some(mut outgoing) = self.outgoing.take() {
                outgoing.handle.stop();
            }
            self.on_current_failed(reason).await;
        }
    }

    async fn tick_fading_out(&mut self, now: Instant) {
        let Some(current) = self.current.as_mut() else {
            self.state = SequencerState::Idle;
            return;
        };
        let done = current.apply_ramp(now) || current.is_done();
        if !done {
            return;
        }

        match self.after_fade {
            AfterFade::Pause => {
                current.handle.pause();
                self.state = SequencerState::Paused;
                debug!(source = ?self.source, "Paused");
            }
            AfterFade::Stop => {
                if let Some(deck) = self.current.take() {
                    let event = deck.finish(false);
                    self.emit(event);
                }
                self.stop();
                debug!(source = ?self.source, "Faded out and stopped");
            }
            AfterFade::Advance => {
                if let Some(deck) = self.current.take() {
                    let event = deck.finish(false);
                    self.emit(event);
                }
                match self.next_index() {
                    Some(next) => {
                        self.start_from(next, 0.0).await;
                    }
                    None => self.finish_playlist(),
                }
            }
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn start_crossfade(&mut self, now: Instant) {
        let (Some(mut outgoing), Some(mut incoming)) = (self.current.take(), self.next.take()) else {
            return;
        };
        let fade = self.timing.fade();

        outgoing.fade_to(0.0, fade, now);
        incoming.handle.set_gain(0.0);
        incoming.handle.play();
        incoming.ramp = Some(GainRamp::starting_at(now, 0.0, self.volume, fade));

        info!(
            source = ?self.source,
            from = %outgoing.track.id,
            to = %incoming.track.id,
            fade_secs = self.timing.fade_secs,
            offset_secs = self.timing.offset_secs,
            "Crossfade started"
        );
        self.emit(SequencerEvent::CrossfadeStarted {
            from_track: outgoing.track.id.clone(),
            to_track: incoming.track.id.clone(),
            fade_secs: self.timing.fade_secs,
        });

        self.outgoing = Some(outgoing);
        self.state = SequencerState::Crossfading;
        self.activate(incoming);
    }

    fn start_hard_cut(&mut self, now: Instant) {
        let fade = self.timing.fade();
        let Some(current) = self.current.as_mut() else {
            return;
        };
        current.fade_to(0.0, fade, now);
        let track_id = current.track.id.clone();

        warn!(
            source = ?self.source,
            track = %track_id,
            "Next track not ready, fading out for a hard cut"
        );
        self.emit(SequencerEvent::HardCut { track_id });
        self.after_fade = AfterFade::Advance;
        self.state = SequencerState::FadingOut;
    }

    async fn on_current_ended(&mut self, now: Instant) {
        if let Some(deck) = self.current.take() {
            let event = deck.finish(true);
            self.emit(event);
        }

        match self.next_index() {
            Some(next) => match self.take_preloaded(next) {
                Some(deck) => self.promote(deck, now),
                None => {
                    self.start_from(next, 0.0).await;
                }
            },
            None => self.finish_playlist(),
        }
    }

    async fn on_current_failed(&mut self, reason: String) {
        let Some(deck) = self.current.take() else {
            return;
        };
        warn!(source = ?self.source, track = %deck.track.id, "Playback failed: {}", reason);
        self.emit(SequencerEvent::TrackFailed {
            track_id: deck.track.id.clone(),
            reason,
        });
        drop(deck);

        match self.next_index() {
            Some(next) => {
                self.start_from(next, 0.0).await;
            }
            None => self.finish_playlist(),
        }
    }

    fn finish_playlist(&mut self) {
        self.stop();
        self.state = SequencerState::Ended;
        info!(source = ?self.source, "Playlist ended");
        self.emit(SequencerEvent::PlaylistEnded);
    }

    /// Start the first playable track at or after `start`
    ///
    /// Unplayable tracks are reported and skipped, at most one pass over the
    /// playlist. With nothing playable the sequencer idles until
    /// [`Sequencer::media_ready`].
    async fn start_from(&mut self, start: usize, position: f64) -> bool {
        let Some(playlist) = self.playlist.clone() else {
            self.state = SequencerState::Idle;
            return false;
        };
        let len = playlist.len();
        if len == 0 {
            self.state = SequencerState::Idle;
            return false;
        }
        if start >= len && !playlist.looping {
            self.finish_playlist();
            return false;
        }

        let start = start % len;
        let candidates: Vec<usize> = if playlist.looping {
            (0..len).map(|offset| (start + offset) % len).collect()
        } else {
            (start..len).collect()
        };

        self.state = SequencerState::Loading;
        for (attempt, index) in candidates.into_iter().enumerate() {
            let position = if attempt == 0 { position } else { 0.0 };
            let track = &playlist.tracks[index];

            let mut deck = match self.take_preloaded(index) {
                Some(deck) => deck,
                None => match self.open(track).await {
                    Ok(handle) => Deck {
                        track: track.clone(),
                        index,
                        handle,
                        ramp: None,
                    },
                    Err(e) => {
                        warn!(source = ?self.source, track = %track.id, "Skipping track: {}", e);
                        self.emit(SequencerEvent::TrackFailed {
                            track_id: track.id.clone(),
                            reason: e.to_string(),
                        });
                        continue;
                    }
                },
            };

            if position > 0.0 {
                deck.handle.seek(position);
            }
            self.promote(deck, Instant::now());
            self.poll_preload(Instant::now()).await;
            return true;
        }

        info!(
            source = ?self.source,
            playlist = %playlist.id,
            "No playable track yet, waiting for downloads"
        );
        self.index = start;
        self.start_position = position;
        self.state = SequencerState::Idle;
        self.waiting_for_media = true;
        false
    }

    /// Start `deck` with a fade-in and make it current
    fn promote(&mut self, mut deck: Deck, now: Instant) {
        self.timing = TransitionTiming::for_duration(deck.handle.duration());
        deck.handle.set_gain(0.0);
        deck.handle.play();
        deck.ramp = Some(GainRamp::starting_at(now, 0.0, self.volume, self.timing.fade()));
        self.state = SequencerState::Playing;
        self.activate(deck);
    }

    fn activate(&mut self, deck: Deck) {
        info!(
            source = ?self.source,
            track = %deck.track.id,
            index = deck.index,
            "Track started"
        );
        self.index = deck.index;
        self.emit(SequencerEvent::TrackStarted {
            track_id: deck.track.id.clone(),
            index: deck.index,
        });
        self.current = Some(deck);
        self.loudness.clear();
        self.waiting_for_media = false;
        self.start_position = 0.0;
        self.request_preload();
    }

    // ========================================================================
    // Preload
    // ========================================================================

    fn next_index(&self) -> Option<usize> {
        self.playlist.as_ref()?.next_index(self.index)
    }

    fn take_preloaded(&mut self, index: usize) -> Option<Deck> {
        if self.next.as_ref().map(|deck| deck.index) == Some(index) {
            self.next.take()
        } else {
            None
        }
    }

    fn request_preload(&mut self) {
        self.next = None;
        self.preload = Preload::Idle;
        let Some(index) = self.next_index() else {
            return;
        };
        let Some(track) = self.playlist.as_ref().and_then(|p| p.track(index)) else {
            return;
        };
        match self.cache.path_for(track, &self.owner) {
            Ok(path) => {
                let now = Instant::now();
                self.preload = Preload::Waiting {
                    index,
                    path,
                    deadline: now + self.config.preload_timeout,
                    next_poll: now,
                };
            }
            Err(e) => {
                warn!(source = ?self.source, track = %track.id, "Cannot preload: {}", e);
                self.preload = Preload::Unavailable { index };
            }
        }
    }

    async fn poll_preload(&mut self, now: Instant) {
        let (index, path, deadline) = match &self.preload {
            Preload::Waiting {
                index,
                path,
                deadline,
                next_poll,
            } if now >= *next_poll => (*index, path.clone(), *deadline),
            _ => return,
        };

        if !file_present(&path).await {
            if now >= deadline {
                warn!(
                    source = ?self.source,
                    index,
                    "Next track still missing after {:?}",
                    self.config.preload_timeout
                );
                self.preload = Preload::Unavailable { index };
            } else {
                self.preload = Preload::Waiting {
                    index,
                    path,
                    deadline,
                    next_poll: now + self.config.preload_poll,
                };
            }
            return;
        }

        let Some(track) = self.playlist.as_ref().and_then(|p| p.track(index)).cloned() else {
            self.preload = Preload::Idle;
            return;
        };
        match self.output.load(&path, track.duration).await {
            Ok(mut handle) => {
                handle.set_gain(0.0);
                debug!(source = ?self.source, track = %track.id, "Next track preloaded");
                self.next = Some(Deck {
                    track,
                    index,
                    handle,
                    ramp: None,
                });
                self.preload = Preload::Idle;
            }
            Err(e) => {
                warn!(source = ?self.source, track = %track.id, "Preload failed: {}", e);
                self.preload = Preload::Unavailable { index };
            }
        }
    }

    async fn open(&self, track: &Track) -> Result<Box<dyn AudioHandle>> {
        let path = self.cache.path_for(track, &self.owner)?;
        self.output.load(&path, track.duration).await
    }
}

async fn file_present(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}
