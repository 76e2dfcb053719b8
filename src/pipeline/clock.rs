//! Presentation clock for audio-video synchronization

use std::time::Duration;
use tokio::time::Instant;

use super::state::PlaybackState;

/// Maps presentation keys onto wall-clock instants
///
/// The clock pairs a key-space origin (in seconds) with the session epoch
/// held in [`PlaybackState`]. A unit whose key is `origin + d` is due at
/// `epoch + paused_total + d`.
///
/// For sequential keys the origin is zero, so frame `k` of a 25 fps stream
/// is due `k / 25` seconds after the epoch. For sender timestamps the
/// origin is the oldest key buffered when playback started.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresentationClock {
    origin: f64,
}

impl PresentationClock {
    pub fn new(origin: f64) -> Self {
        Self { origin }
    }

    /// Offset of a key time from the origin; keys before the origin are due at once
    pub fn offset_of(&self, key_seconds: f64) -> Duration {
        let offset = key_seconds - self.origin;
        if offset.is_finite() && offset > 0.0 {
            Duration::from_secs_f64(offset)
        } else {
            Duration::ZERO
        }
    }

    /// Wall-clock instant at which a unit with this key time is due
    pub fn target(&self, state: &PlaybackState, key_seconds: f64) -> Option<Instant> {
        state.target_instant(self.offset_of(key_seconds))
    }

    /// Current position in key space, `None` before the epoch
    pub fn position(&self, state: &PlaybackState, now: Instant) -> Option<f64> {
        state
            .elapsed(now)
            .map(|elapsed| self.origin + elapsed.as_secs_f64())
    }

    /// Key time below which buffered units are stale
    pub fn stale_cutoff(&self, state: &PlaybackState, now: Instant, horizon: Duration) -> Option<f64> {
        self.position(state, now)
            .map(|position| position - horizon.as_secs_f64())
    }
}

impl Default for PresentationClock {
    fn default() -> Self {
        Self::new(0.0)
    }
}
