//! Compiles declarative weekly schedules into concrete timed triggers for
//! the external tick source.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::{ControlConfig, RoomConfig, TimeOfDay};
use crate::intent::Intent;
use crate::store::RoomStore;
use crate::types::ScheduleEventKind;

/// Concrete trigger handed to the external scheduler: fire `payload` at
/// `time_of_day` on each of `days`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    #[serde(rename = "timeOfDay")]
    pub time_of_day: TimeOfDay,
    pub days: BTreeSet<u8>,
    pub payload: Intent,
}

/// Compiles one room's schedules.
///
/// Deterministic: the same configuration always yields the same list with
/// the same names, so a reschedule can clear and reinstall without
/// accumulating duplicates.
pub fn compile(room_id: &str, room: &RoomConfig, ctl: &ControlConfig) -> Vec<TriggerSpec> {
    let lead = ctl.preheat_lead_min.min(24 * 60);
    let mut triggers = Vec::new();

    for (index, entry) in room.schedules.iter().enumerate() {
        triggers.push(TriggerSpec {
            name: format!("{room_id}-s{index}-start"),
            time_of_day: entry.start,
            days: entry.days.clone(),
            payload: fire(room_id, ScheduleEventKind::StartHeat),
        });
        triggers.push(TriggerSpec {
            name: format!("{room_id}-s{index}-stop"),
            time_of_day: entry.end,
            days: entry.days.clone(),
            payload: fire(room_id, ScheduleEventKind::StopHeat),
        });

        if room.adaptive_learning {
            let (preheat_time, preheat_days) = shift_back(entry.start, &entry.days, lead);
            triggers.push(TriggerSpec {
                name: format!("{room_id}-s{index}-preheat"),
                time_of_day: preheat_time,
                days: preheat_days,
                payload: fire(room_id, ScheduleEventKind::StartPreheat),
            });
            triggers.push(TriggerSpec {
                name: format!("{room_id}-s{index}-preheat-end"),
                time_of_day: entry.start,
                days: entry.days.clone(),
                payload: fire(room_id, ScheduleEventKind::EndPreheat),
            });
        }
    }

    triggers
}

/// Compiles every room in stable id order; the input to a full reschedule.
pub fn compile_building(store: &RoomStore, ctl: &ControlConfig) -> Vec<TriggerSpec> {
    store
        .rooms()
        .iter()
        .flat_map(|(room_id, config)| compile(room_id, config, ctl))
        .collect()
}

fn fire(room_id: &str, event: ScheduleEventKind) -> Intent {
    Intent::ScheduleFire {
        room_id: room_id.to_string(),
        event,
    }
}

/// Subtracts `lead` minutes from a time of day. Crossing local midnight
/// rolls every weekday in the set back one day (Sunday wraps to Saturday).
fn shift_back(time: TimeOfDay, days: &BTreeSet<u8>, lead: u16) -> (TimeOfDay, BTreeSet<u8>) {
    let minute = time.minute_of_day();
    if minute >= lead {
        (TimeOfDay::from_minute_of_day(minute - lead), days.clone())
    } else {
        let wrapped = 24 * 60 + minute - lead;
        let shifted = days.iter().map(|day| (day + 6) % 7).collect();
        (TimeOfDay::from_minute_of_day(wrapped), shifted)
    }
}
