use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Upper bound the learned overshoot offset may never exceed.
pub const LEARNED_OVERSHOOT_MAX: f32 = 2.0;

/// Minute-resolution time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeOfDay {
    pub hour: u8,
    pub minute: u8,
}

impl TimeOfDay {
    pub fn minute_of_day(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    pub fn from_minute_of_day(minute: u16) -> Self {
        let minute = minute % (24 * 60);
        Self {
            hour: (minute / 60) as u8,
            minute: (minute % 60) as u8,
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for TimeOfDay {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ControlError::Config(format!("invalid time of day `{value}`"));
        let (hour, minute) = value.split_once(':').ok_or_else(invalid)?;
        let hour: u8 = hour.parse().map_err(|_| invalid())?;
        let minute: u8 = minute.parse().map_err(|_| invalid())?;
        if hour > 23 || minute > 59 {
            return Err(invalid());
        }
        Ok(Self { hour, minute })
    }
}

/// `"HH:MM"` (de)serialization for schedule boundaries.
mod time_string {
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TimeOfDay;

    pub fn serialize<S: Serializer>(time: &TimeOfDay, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TimeOfDay, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Target humidex with the dead band around it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetBand {
    pub humidex_target: f32,
    #[serde(default = "default_hysteresis")]
    pub humidex_hysteresis: f32,
}

fn default_hysteresis() -> f32 {
    1.0
}

/// One declarative schedule window. `days` uses Sunday-based numbering
/// (0 = Sunday .. 6 = Saturday); a window whose `end` precedes its `start`
/// spans local midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub days: BTreeSet<u8>,
    #[serde(with = "time_string")]
    pub start: TimeOfDay,
    #[serde(with = "time_string")]
    pub end: TimeOfDay,
    #[serde(flatten)]
    pub band: TargetBand,
}

impl ScheduleEntry {
    pub fn validate(&self) -> bool {
        !self.days.is_empty()
            && self.days.iter().all(|day| *day < 7)
            && self.band.humidex_target.is_finite()
            && self.band.humidex_hysteresis.is_finite()
            && self.band.humidex_hysteresis >= 0.0
    }

    /// Whether this entry covers `minute` on `day`.
    pub fn covers(&self, day: u8, minute: u16) -> bool {
        if !self.days.contains(&day) {
            return false;
        }
        let start = self.start.minute_of_day();
        let end = self.end.minute_of_day();
        if start < end {
            minute >= start && minute < end
        } else {
            minute >= start || minute < end
        }
    }
}

/// Fallback bands applied when no declared schedule matches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DefaultSchedules {
    pub weekday: TargetBand,
    pub weekend: TargetBand,
}

impl DefaultSchedules {
    pub fn band_for(&self, day: u8) -> TargetBand {
        // Sunday-based numbering puts the weekend at 0 and 6.
        if day % 6 == 0 {
            self.weekend
        } else {
            self.weekday
        }
    }
}

/// Per-room configuration, immutable after store initialisation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub heater_entity: String,
    pub temp_sensor: String,
    #[serde(default)]
    pub humidity_sensor: Option<String>,
    #[serde(default)]
    pub window_sensor: Option<String>,
    #[serde(default)]
    pub setpoint_sensor: Option<String>,
    #[serde(default)]
    pub adaptive_learning: bool,
    #[serde(default = "default_preheat_offset")]
    pub preheat_offset: f32,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
}

fn default_preheat_offset() -> f32 {
    2.0
}

impl RoomConfig {
    pub fn sanitize(&mut self) {
        if !self.preheat_offset.is_finite() {
            self.preheat_offset = default_preheat_offset();
        }
        self.preheat_offset = self.preheat_offset.clamp(0.0, 10.0);
        self.schedules.retain(ScheduleEntry::validate);
    }

    /// Highest-target entry active at `day`/`minute`; the first declared
    /// wins ties.
    pub fn active_entry(&self, day: u8, minute: u16) -> Option<&ScheduleEntry> {
        let mut best: Option<&ScheduleEntry> = None;
        for entry in self.schedules.iter().filter(|e| e.covers(day, minute)) {
            match best {
                Some(current) if entry.band.humidex_target <= current.band.humidex_target => {}
                _ => best = Some(entry),
            }
        }
        best
    }
}

/// The whole building as loaded at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildingConfig {
    pub rooms: BTreeMap<String, RoomConfig>,
    #[serde(default)]
    pub default_schedules: Option<DefaultSchedules>,
}

impl BuildingConfig {
    pub fn normalize(&mut self) {
        for room in self.rooms.values_mut() {
            room.sanitize();
        }
    }
}

/// Tunable control constants.
///
/// The force-heat/force-off setpoints are reserved slider extremes coming
/// in over the manual-override channel; they must never be mistaken for a
/// real setpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub window_grace_ms: i64,
    pub preheat_lead_min: u16,
    pub force_heat_setpoint: f32,
    pub force_off_setpoint: f32,
    pub overshoot_glitch_max: f32,
    pub overshoot_ema_weight: f32,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            window_grace_ms: 120_000,
            preheat_lead_min: 20,
            force_heat_setpoint: 30.0,
            force_off_setpoint: 5.0,
            overshoot_glitch_max: 3.0,
            overshoot_ema_weight: 0.1,
        }
    }
}
