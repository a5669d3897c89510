//! Heating decision engine.
//!
//! Pure: reads one room's configuration and committed state plus a single
//! sensor sample and produces the next heating state with a reason. The
//! only state it touches — the window grace timer — comes back as part of
//! the returned patch for the caller to commit.

use chrono::{DateTime, Datelike, FixedOffset, Timelike};

use crate::config::{ControlConfig, DefaultSchedules, RoomConfig, LEARNED_OVERSHOOT_MAX};
use crate::store::{RoomState, StatePatch};
use crate::types::{Decision, ForcedCommand, HeatingState, Sample};

/// A decision plus the state bookkeeping the caller must commit through
/// the intent processor.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub patch: StatePatch,
}

pub fn decide(
    room: &RoomConfig,
    defaults: Option<&DefaultSchedules>,
    state: &RoomState,
    sample: &Sample,
    now: DateTime<FixedOffset>,
    ctl: &ControlConfig,
) -> DecisionOutcome {
    let now_ms = now.timestamp_millis();
    let current = state.heating;

    // Forced event commands bypass every other rule.
    if let Some(command) = sample.command {
        let next = match command {
            ForcedCommand::HeatOn { preheat: true } => HeatingState::Preheat,
            ForcedCommand::HeatOn { preheat: false } => HeatingState::Heat,
            ForcedCommand::HeatOff => HeatingState::Off,
        };
        let decision = Decision {
            room_id: sample.room_id.clone(),
            heater_entity: room.heater_entity.clone(),
            value: None,
            target: None,
            next_state: next,
            current_state: current,
            changed: next != current,
            reason: format!("event:{}", command.kind_str()),
            manual_override: false,
            adaptive: room.adaptive_learning,
            has_external_sensors: false,
            ts: now_ms,
        };
        return DecisionOutcome {
            decision,
            patch: StatePatch::heating(next),
        };
    }

    let has_external_sensors = sample.temperature.is_some() && sample.humidity.is_some();
    let current_val = match (sample.temperature, sample.humidity) {
        (Some(temp), Some(humidity)) => Some(humidex(temp, humidity)),
        // Classic mode: the manual setpoint doubles as the measured value,
        // a bare temperature is the fallback.
        _ => sample.manual_setpoint.or(sample.temperature),
    };

    let day = day_of_week(now);
    let minute = (now.hour() * 60 + now.minute()) as u16;

    let band = room
        .active_entry(day, minute)
        .map(|entry| entry.band)
        .or_else(|| defaults.map(|d| d.band_for(day)));

    let Some(band) = band else {
        // Nothing schedules this room right now; hold whatever we have.
        let decision = Decision {
            room_id: sample.room_id.clone(),
            heater_entity: room.heater_entity.clone(),
            value: current_val,
            target: None,
            next_state: current,
            current_state: current,
            changed: false,
            reason: "no_active_schedule".to_string(),
            manual_override: false,
            adaptive: room.adaptive_learning,
            has_external_sensors,
            ts: now_ms,
        };
        return DecisionOutcome {
            decision,
            patch: StatePatch::default(),
        };
    };

    let mut target = band.humidex_target;
    let hyst = if band.humidex_hysteresis <= 0.0 {
        1.0
    } else {
        band.humidex_hysteresis
    };

    let preheat_active = current == HeatingState::Preheat;
    if preheat_active {
        target += room.preheat_offset;
    }

    let mut reason = String::from("schedule_active");
    let mut manual_override = false;

    if let Some(manual) = sample.manual_setpoint {
        let is_control_cmd = approx_eq(manual, ctl.force_heat_setpoint)
            || approx_eq(manual, ctl.force_off_setpoint);
        if !is_control_cmd && (manual - target).abs() > hyst + 0.5 {
            target = manual;
            reason = String::from("MANUAL_OVERRIDE");
            manual_override = true;
        }
    }

    let mut next = current;
    let mut patch = StatePatch::default();

    if sample.window_open {
        let open_since = state.window_open_since.unwrap_or(now_ms);
        if state.window_open_since.is_none() {
            patch.window_open_since = Some(Some(now_ms));
        }

        if now_ms - open_since >= ctl.window_grace_ms {
            next = HeatingState::Off;
            reason = String::from("window_open");
        } else {
            // Brief openings hold the current state instead of cycling.
            reason = String::from("window_open_grace");
        }
    } else {
        if state.window_open_since.is_some() {
            patch.window_open_since = Some(None);
        }

        match current_val {
            Some(value) if has_external_sensors => {
                if value < target - hyst {
                    next = if preheat_active {
                        HeatingState::Preheat
                    } else {
                        HeatingState::Heat
                    };
                    reason = format!("heating_to_{target}");
                } else {
                    let stop_threshold = if room.adaptive_learning {
                        target - state.learned_overshoot.clamp(0.0, LEARNED_OVERSHOOT_MAX)
                    } else {
                        target + hyst
                    };

                    if value > stop_threshold {
                        next = HeatingState::Off;
                        reason = if room.adaptive_learning {
                            format!("adaptive_stop_at_{stop_threshold:.1}")
                        } else {
                            format!("stop_above_{}", target + hyst)
                        };
                    } else {
                        reason = String::from("within_hysteresis");
                    }
                }
            }
            Some(value) => {
                if value < target - hyst {
                    next = HeatingState::Heat;
                    reason = format!("heating_to_{target}_classic");
                } else if value > target + hyst {
                    next = HeatingState::Off;
                    reason = format!("stop_above_{target}_classic");
                } else {
                    reason = String::from("within_hysteresis_classic");
                }
            }
            None => {
                reason = String::from("no_sample");
            }
        }
    }

    // Periodic-tick safety net: a missed start edge leaves a scheduled room
    // cold; restart it as long as the window is shut.
    if sample.is_tick
        && next == HeatingState::Off
        && current == HeatingState::Off
        && !sample.window_open
    {
        next = if preheat_active {
            HeatingState::Preheat
        } else {
            HeatingState::Heat
        };
        reason = String::from("tick_schedule_correction");
    }

    patch.heating = Some(next);

    let decision = Decision {
        room_id: sample.room_id.clone(),
        heater_entity: room.heater_entity.clone(),
        value: current_val,
        target: Some(target),
        next_state: next,
        current_state: current,
        changed: next != current,
        reason,
        manual_override,
        adaptive: room.adaptive_learning,
        has_external_sensors,
        ts: now_ms,
    };

    DecisionOutcome { decision, patch }
}

/// Humidex-style apparent temperature from dry-bulb temperature and
/// relative humidity, via the dew point.
pub fn humidex(temp: f32, humidity: f32) -> f32 {
    let dew_point = temp - (100.0 - humidity) / 5.0;
    let vapor = 6.112 * 10f32.powf(7.5 * dew_point / (237.7 + dew_point));
    round1(temp + 0.5555 * (vapor - 10.0))
}

pub(crate) fn round1(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

fn day_of_week(now: DateTime<FixedOffset>) -> u8 {
    now.weekday().num_days_from_sunday() as u8
}

fn approx_eq(a: f32, b: f32) -> bool {
    (a - b).abs() < f32::EPSILON
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{ScheduleEntry, TargetBand};

    // Wednesday 2026-01-07 09:00 (+01:00); day 3 in Sunday-based numbering.
    fn wednesday_morning() -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, 7, 9, 0, 0)
            .unwrap()
    }

    fn room(adaptive: bool) -> RoomConfig {
        RoomConfig {
            heater_entity: "climate.living".to_string(),
            temp_sensor: "sensor.living_temp".to_string(),
            humidity_sensor: Some("sensor.living_hum".to_string()),
            window_sensor: Some("binary.living_window".to_string()),
            setpoint_sensor: None,
            adaptive_learning: adaptive,
            preheat_offset: 2.0,
            schedules: vec![ScheduleEntry {
                days: (0..7).collect(),
                start: "06:00".parse().unwrap(),
                end: "22:00".parse().unwrap(),
                band: TargetBand {
                    humidex_target: 21.0,
                    humidex_hysteresis: 1.0,
                },
            }],
        }
    }

    fn state(heating: HeatingState) -> RoomState {
        RoomState {
            heating,
            window_open_since: None,
            manual_override: None,
            learned_overshoot: 0.0,
            last_stop_val: None,
            peak_after_stop: None,
            toggles: 0,
            last_change: 0,
        }
    }

    fn sample(temp: Option<f32>, humidity: Option<f32>, manual: Option<f32>) -> Sample {
        Sample {
            room_id: "living".to_string(),
            temperature: temp,
            humidity,
            manual_setpoint: manual,
            window_open: false,
            is_tick: false,
            command: None,
        }
    }

    fn ctl() -> ControlConfig {
        ControlConfig::default()
    }

    #[test]
    fn humidex_sample_below_band_starts_heating() {
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Off),
            &sample(Some(19.0), Some(50.0), None),
            wednesday_morning(),
            &ctl(),
        );

        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert!(outcome.decision.changed);
        assert!(outcome.decision.reason.starts_with("heating_to_21"));
        assert!(outcome.decision.has_external_sensors);
        assert_eq!(outcome.decision.target, Some(21.0));
        assert_eq!(outcome.patch.heating, Some(HeatingState::Heat));
    }

    #[test]
    fn classic_mode_hysteresis_band() {
        let mut plain = room(false);
        plain.humidity_sensor = None;

        // 19.9 < 20: start.
        let outcome = decide(
            &plain,
            None,
            &state(HeatingState::Off),
            &sample(Some(19.9), None, None),
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert_eq!(outcome.decision.reason, "heating_to_21_classic");

        // 22.1 > 22: stop.
        let outcome = decide(
            &plain,
            None,
            &state(HeatingState::Heat),
            &sample(Some(22.1), None, None),
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Off);
        assert_eq!(outcome.decision.reason, "stop_above_21_classic");

        // 21.0 inside the band: hold, no flapping.
        let outcome = decide(
            &plain,
            None,
            &state(HeatingState::Heat),
            &sample(Some(21.0), None, None),
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert!(!outcome.decision.changed);
        assert_eq!(outcome.decision.reason, "within_hysteresis_classic");
    }

    #[test]
    fn window_grace_holds_then_forces_off() {
        let now = wednesday_morning();
        let mut heating = state(HeatingState::Heat);
        heating.window_open_since = Some(now.timestamp_millis() - 119_000);

        let mut open_sample = sample(Some(19.0), Some(50.0), None);
        open_sample.window_open = true;

        let outcome = decide(&room(false), None, &heating, &open_sample, now, &ctl());
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert!(!outcome.decision.changed);
        assert_eq!(outcome.decision.reason, "window_open_grace");

        heating.window_open_since = Some(now.timestamp_millis() - 121_000);
        let outcome = decide(&room(false), None, &heating, &open_sample, now, &ctl());
        assert_eq!(outcome.decision.next_state, HeatingState::Off);
        assert_eq!(outcome.decision.reason, "window_open");
    }

    #[test]
    fn window_bookkeeping_flows_through_the_patch() {
        let now = wednesday_morning();

        // Open without a recorded timestamp: the engine starts the timer.
        let mut open_sample = sample(Some(19.0), Some(50.0), None);
        open_sample.window_open = true;
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Heat),
            &open_sample,
            now,
            &ctl(),
        );
        assert_eq!(
            outcome.patch.window_open_since,
            Some(Some(now.timestamp_millis()))
        );
        assert_eq!(outcome.decision.reason, "window_open_grace");

        // Closed again: the timer is cleared.
        let mut closed = state(HeatingState::Heat);
        closed.window_open_since = Some(now.timestamp_millis() - 30_000);
        let outcome = decide(
            &room(false),
            None,
            &closed,
            &sample(Some(19.0), Some(50.0), None),
            now,
            &ctl(),
        );
        assert_eq!(outcome.patch.window_open_since, Some(None));
    }

    #[test]
    fn manual_setpoint_replaces_target_outside_band() {
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Off),
            &sample(Some(19.0), Some(50.0), Some(25.0)),
            wednesday_morning(),
            &ctl(),
        );

        assert!(outcome.decision.manual_override);
        assert_eq!(outcome.decision.target, Some(25.0));
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
    }

    #[test]
    fn reserved_setpoints_never_override() {
        for sentinel in [30.0, 5.0] {
            let outcome = decide(
                &room(false),
                None,
                &state(HeatingState::Off),
                &sample(Some(19.0), Some(50.0), Some(sentinel)),
                wednesday_morning(),
                &ctl(),
            );
            assert!(!outcome.decision.manual_override);
            assert_eq!(outcome.decision.target, Some(21.0));
            assert!(!outcome.decision.reason.contains("MANUAL_OVERRIDE"));
        }
    }

    #[test]
    fn adaptive_stop_uses_learned_overshoot() {
        let mut heating = state(HeatingState::Heat);
        heating.learned_overshoot = 0.5;

        // Humidex 22.0: not past the classic stop at 22, but past 21 - 0.5.
        let outcome = decide(
            &room(true),
            None,
            &heating,
            &sample(Some(20.4), Some(52.0), None),
            wednesday_morning(),
            &ctl(),
        );

        assert_eq!(outcome.decision.next_state, HeatingState::Off);
        assert_eq!(outcome.decision.reason, "adaptive_stop_at_20.5");
    }

    #[test]
    fn preheat_raises_the_target() {
        let outcome = decide(
            &room(true),
            None,
            &state(HeatingState::Preheat),
            &sample(Some(20.0), Some(50.0), None),
            wednesday_morning(),
            &ctl(),
        );

        // 21 + 2 preheat offset; humidex 21.3 is still short of 23 - 1.
        assert_eq!(outcome.decision.target, Some(23.0));
        assert_eq!(outcome.decision.next_state, HeatingState::Preheat);
        assert!(outcome.decision.reason.starts_with("heating_to_23"));
    }

    #[test]
    fn tick_restarts_a_cold_scheduled_room() {
        // Humidex 20.5 sits inside the 21 +/- 1 band.
        let mut tick_sample = sample(Some(19.5), Some(50.0), None);
        tick_sample.is_tick = true;

        // Within hysteresis while off: a plain sample holds off...
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Off),
            &sample(Some(19.5), Some(50.0), None),
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Off);

        // ...but the tick safety net restarts it.
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Off),
            &tick_sample,
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert_eq!(outcome.decision.reason, "tick_schedule_correction");
    }

    #[test]
    fn tick_does_not_restart_with_window_open() {
        let mut tick_sample = sample(Some(19.5), Some(50.0), None);
        tick_sample.is_tick = true;
        tick_sample.window_open = true;

        let mut off = state(HeatingState::Off);
        off.window_open_since = Some(wednesday_morning().timestamp_millis() - 300_000);

        let outcome = decide(&room(false), None, &off, &tick_sample, wednesday_morning(), &ctl());
        assert_eq!(outcome.decision.next_state, HeatingState::Off);
        assert_eq!(outcome.decision.reason, "window_open");
    }

    #[test]
    fn forced_command_bypasses_control() {
        let mut forced = sample(None, None, None);
        forced.command = Some(ForcedCommand::HeatOn { preheat: true });

        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Off),
            &forced,
            wednesday_morning(),
            &ctl(),
        );

        assert_eq!(outcome.decision.next_state, HeatingState::Preheat);
        assert_eq!(outcome.decision.reason, "event:HEAT_ON");
        assert!(outcome.decision.changed);
        assert_eq!(outcome.patch.heating, Some(HeatingState::Preheat));

        forced.command = Some(ForcedCommand::HeatOff);
        let outcome = decide(
            &room(false),
            None,
            &state(HeatingState::Heat),
            &forced,
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.next_state, HeatingState::Off);
        assert_eq!(outcome.decision.reason, "event:HEAT_OFF");
    }

    #[test]
    fn default_band_covers_unscheduled_hours() {
        let mut bare = room(false);
        bare.schedules.clear();
        let defaults = DefaultSchedules {
            weekday: TargetBand {
                humidex_target: 19.0,
                humidex_hysteresis: 1.0,
            },
            weekend: TargetBand {
                humidex_target: 21.0,
                humidex_hysteresis: 1.0,
            },
        };

        let outcome = decide(
            &bare,
            Some(&defaults),
            &state(HeatingState::Off),
            &sample(Some(16.0), Some(50.0), None),
            wednesday_morning(),
            &ctl(),
        );
        assert_eq!(outcome.decision.target, Some(19.0));
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
    }

    #[test]
    fn no_schedule_and_no_defaults_holds_state() {
        let mut bare = room(false);
        bare.schedules.clear();

        let outcome = decide(
            &bare,
            None,
            &state(HeatingState::Heat),
            &sample(Some(16.0), Some(50.0), None),
            wednesday_morning(),
            &ctl(),
        );

        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert!(!outcome.decision.changed);
        assert_eq!(outcome.decision.reason, "no_active_schedule");
        assert!(outcome.patch.is_empty());
    }

    #[test]
    fn humidex_matches_reference_points() {
        // 19 C at 50% RH: dew point 9 C, humidex ~19.8.
        assert_eq!(humidex(19.0, 50.0), 19.8);
        // Dry air pulls the apparent temperature below the dry-bulb reading.
        assert!(humidex(21.0, 20.0) < 21.0);
        assert!(humidex(25.0, 90.0) > 25.0);
    }
}
