//! Audio output.

pub mod playback;

pub use playback::{AudioSink, CpalAudioSink, PlaybackOutcome};
