//! Client-side spatial audio mixing for earshot voice sessions.
//!
//! The mixer consumes the server message stream of one bridge session and
//! turns per-tick player transforms into stereo gain updates on the media
//! streams of every other peer. The embedding application supplies the media
//! transport through the [`MediaConnector`] and [`GainControl`] traits.

mod gain;
mod mixer;
mod peers;

pub use gain::{stereo_gain, StereoGain, DEAD_LISTENER_VOLUME};
pub use mixer::{Mixer, DEFAULT_DIAL_DELAY};
pub use peers::{GainControl, MediaConnector, MediaError};
