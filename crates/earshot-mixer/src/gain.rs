//! Stereo gain computation for a single listener/speaker pair.

use earshot_proto::{NetConfig, SnapshotEntry};

/// Volume applied to living speakers when the listener is dead and dead
/// players are kept on the global channel.
pub const DEAD_LISTENER_VOLUME: f32 = 0.4;

/// Per-channel gain for one remote speaker, in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoGain {
    pub left: f32,
    pub right: f32,
}

impl StereoGain {
    pub const MUTED: StereoGain = StereoGain { left: 0.0, right: 0.0 };
    pub const FULL: StereoGain = StereoGain { left: 1.0, right: 1.0 };

    const fn both(value: f32) -> StereoGain {
        StereoGain { left: value, right: value }
    }
}

/// Computes the stereo gain the listener should apply to the speaker's
/// audio stream for the current tick.
///
/// Death gating runs before any distance math. Distance and bearing are
/// planar; vertical separation does not attenuate. Bearing is measured
/// against the listener's yaw, so turning in place re-pans every speaker.
pub fn stereo_gain(listener: &SnapshotEntry, speaker: &SnapshotEntry, config: &NetConfig) -> StereoGain {
    // Branch order is load-bearing: the global dead channel beats the
    // dead-listener attenuation, which beats the mute.
    if !config.dead_voice {
        if config.dead_non_proximity && speaker.is_dead && listener.is_dead {
            return StereoGain::FULL;
        }
        if config.dead_non_proximity && !speaker.is_dead && listener.is_dead {
            return StereoGain::both(DEAD_LISTENER_VOLUME);
        }
        if speaker.is_dead {
            return StereoGain::MUTED;
        }
    }

    if !config.use_proximity {
        return StereoGain::FULL;
    }

    let dx = speaker.x - listener.x;
    let dy = speaker.y - listener.y;
    let distance = (dx * dx + dy * dy).sqrt();
    if distance >= config.max_voice_distance {
        return StereoGain::MUTED;
    }

    let scaled = distance / config.max_voice_distance;
    let volume = (-scaled * config.falloff_factor).exp() * (1.0 - scaled);

    if !config.use_panning {
        return StereoGain::both(volume);
    }
    if distance == 0.0 {
        // A co-located speaker has no bearing; keep it centered instead of
        // letting atan2(0, 0) pan it hard to one side.
        return StereoGain::both(volume);
    }

    let theta = (-dx).atan2(dy) - listener.yaw.to_radians();
    let (sin, cos) = (-theta).sin_cos();
    let left = (cos.min(0.0).powi(2) + sin.powi(2)) * volume;
    let right = (cos.max(0.0).powi(2) + sin.powi(2)) * volume;
    StereoGain { left, right }
}
