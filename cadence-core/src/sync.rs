//! Audio/Video Synchronization
//!
//! One anchor instant stands for "PTS 0". Video reads it to turn a frame's
//! PTS into a wall-clock deadline; audio rewrites it from every frame it
//! hands to the device, which makes audio the master clock.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

/// What the video consumer should do with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Deadline still ahead by this much
    Wait(Duration),
    /// Deadline reached or passed this long ago; show it now
    Late(Duration),
}

#[derive(Debug, Default)]
struct AnchorState {
    anchor: Option<Instant>,
    reanchors: u64,
    last_correction_ms: i64,
    max_correction_ms: i64,
}

/// Shared playback clock anchor
#[derive(Debug, Default)]
pub struct PresentationClock {
    state: Mutex<AnchorState>,
}

impl PresentationClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn anchor(&self) -> Option<Instant> {
        self.state.lock().anchor
    }

    pub fn is_anchored(&self) -> bool {
        self.state.lock().anchor.is_some()
    }

    /// Set the anchor to `now` unless some frame already set it
    pub fn anchor_if_unset(&self, now: Instant) -> Instant {
        *self.state.lock().anchor.get_or_insert(now)
    }

    /// Re-derive the anchor so that `pts_ms` is playing at `now`.
    ///
    /// Called by the audio consumer for every frame it obtains.
    pub fn reanchor(&self, pts_ms: i64, now: Instant) {
        let offset = Duration::from_millis(pts_ms.max(0) as u64);
        let Some(anchor) = now.checked_sub(offset) else {
            tracing::debug!(pts_ms, "PTS predates the monotonic clock, anchoring at now");
            self.anchor_if_unset(now);
            return;
        };

        let mut state = self.state.lock();
        if let Some(previous) = state.anchor {
            let correction = signed_ms(anchor, previous);
            state.last_correction_ms = correction;
            if correction.abs() > state.max_correction_ms.abs() {
                state.max_correction_ms = correction;
            }
            state.reanchors += 1;
        }
        state.anchor = Some(anchor);
    }

    /// Wall-clock instant at which `pts_ms` is due, once anchored
    pub fn deadline(&self, pts_ms: i64) -> Option<Instant> {
        let anchor = self.anchor()?;
        Some(anchor + Duration::from_millis(pts_ms.max(0) as u64))
    }

    pub fn pacing(&self, pts_ms: i64, now: Instant) -> Option<Pacing> {
        let deadline = self.deadline(pts_ms)?;
        Some(if deadline > now {
            Pacing::Wait(deadline - now)
        } else {
            Pacing::Late(now - deadline)
        })
    }

    /// Current playback position in stream milliseconds
    pub fn position_ms(&self, now: Instant) -> Option<i64> {
        let anchor = self.anchor()?;
        Some(signed_ms(now, anchor))
    }

    pub fn stats(&self) -> ClockStats {
        let state = self.state.lock();
        ClockStats {
            anchored: state.anchor.is_some(),
            reanchors: state.reanchors,
            last_correction_ms: state.last_correction_ms,
            max_correction_ms: state.max_correction_ms,
        }
    }
}

/// `a - b` in whole milliseconds, negative when `a` is earlier
fn signed_ms(a: Instant, b: Instant) -> i64 {
    if a >= b {
        (a - b).as_millis() as i64
    } else {
        -((b - a).as_millis() as i64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClockStats {
    pub anchored: bool,
    pub reanchors: u64,
    /// Shift of the last re-anchor; positive means audio ran late
    pub last_correction_ms: i64,
    pub max_correction_ms: i64,
}
