//! Adaptive overshoot learning.
//!
//! After a stop, the room keeps warming from thermal lag. Observing how far
//! the value climbs past the stop point tells us how early the next stop
//! can be, and an exponential moving average keeps single odd cycles from
//! dominating.

use tracing::debug;

use crate::config::{ControlConfig, RoomConfig, LEARNED_OVERSHOOT_MAX};
use crate::engine::round1;
use crate::store::{RoomState, StatePatch};
use crate::types::{Decision, HeatingState};

/// Observes one committed decision for a room and returns the learning
/// patch to commit through the intent processor, or `None` when nothing
/// changed.
pub fn observe(
    room: &RoomConfig,
    state: &RoomState,
    result: &Decision,
    ctl: &ControlConfig,
) -> Option<StatePatch> {
    if !room.adaptive_learning {
        return None;
    }
    let value = result.value?;

    let mut patch = StatePatch::default();

    // A fresh stop (for any reason but an open window) starts a tracking
    // cycle at the stop value.
    if result.changed
        && result.next_state == HeatingState::Off
        && !result.reason.contains("window")
    {
        patch.last_stop_val = Some(Some(value));
        patch.peak_after_stop = Some(Some(value));
    }

    // While off, ratchet the peak and blend the observed overshoot into the
    // learned offset. Excursions past the glitch bound are sensor noise,
    // not thermal lag.
    if result.current_state == HeatingState::Off {
        if let Some(stop_val) = state.last_stop_val {
            let peak = state.peak_after_stop.unwrap_or(stop_val).max(value);
            if state.peak_after_stop != Some(peak) {
                patch.peak_after_stop = Some(Some(peak));
            }

            let overshoot = (peak - stop_val).max(0.0);
            if overshoot < ctl.overshoot_glitch_max {
                let learned = round1(
                    state.learned_overshoot * (1.0 - ctl.overshoot_ema_weight)
                        + overshoot * ctl.overshoot_ema_weight,
                )
                .clamp(0.0, LEARNED_OVERSHOOT_MAX);
                patch.learned_overshoot = Some(learned);
                debug!(
                    room = %result.room_id,
                    overshoot,
                    learned,
                    "overshoot observation blended"
                );
            }
        }
    }

    // Heating again: the tracking cycle is over.
    if result.next_state == HeatingState::Heat && state.last_stop_val.is_some() {
        patch.last_stop_val = Some(None);
    }

    if patch.is_empty() {
        None
    } else {
        Some(patch)
    }
}
