//! Playback: audio output seam, gain ramps, crossfade timing, the per-source
//! sequencer and the announcement queue

pub mod announcement;
pub mod fader;
pub mod output;
pub mod sequencer;
pub mod session;
pub mod timing;

pub use announcement::AnnouncementQueue;
pub use output::{AudioHandle, AudioOutput, HandleStatus, SimulatedOutput};
pub use sequencer::{Sequencer, SequencerConfig, SequencerEvent, SequencerState, SequencerStatus};
pub use session::SessionSnapshot;
pub use timing::{LoudnessWindow, TransitionTiming};
