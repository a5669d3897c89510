use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::BuildingConfig;
use crate::error::ControlError;
use crate::store::{RoomState, RoomStore, StatePatch};
use crate::types::{PollRequest, SampleKind, ScheduleEventKind};

/// Canonical intent envelope. Every mutation of the room store enters
/// through exactly one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Intent {
    #[serde(rename = "INIT")]
    Init { config: BuildingConfig },
    #[serde(rename = "WINDOW")]
    Window {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "isOpen")]
        is_open: bool,
    },
    #[serde(rename = "MANUAL_OVERRIDE")]
    ManualOverride {
        #[serde(rename = "roomId")]
        room_id: String,
        value: f32,
    },
    #[serde(rename = "SCHEDULE_FIRE")]
    ScheduleFire {
        #[serde(rename = "roomId")]
        room_id: String,
        event: ScheduleEventKind,
    },
    #[serde(rename = "STATE_PATCH")]
    StatePatch {
        #[serde(rename = "roomId")]
        room_id: String,
        patch: StatePatch,
    },
    #[serde(rename = "TICK")]
    Tick,
}

/// Downstream effect of a processed intent.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Ready,
    Poll(Vec<PollRequest>),
    StateCommitted { room_id: String, state: RoomState },
}

/// The only writer of [`RoomStore`].
pub struct IntentProcessor {
    store: Arc<RoomStore>,
    clock: Arc<dyn Clock>,
}

impl IntentProcessor {
    pub fn new(store: Arc<RoomStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Applies one canonical intent.
    ///
    /// A configuration failure on `INIT` is fatal; every other failure
    /// drops the intent with a warning and leaves the store untouched.
    pub fn apply(&self, intent: Intent) -> Result<Vec<Effect>, ControlError> {
        match intent {
            Intent::Init { config } => {
                self.store.init(config)?;
                Ok(vec![Effect::Ready])
            }
            Intent::Window { room_id, is_open } => drop_on_error(self.window(&room_id, is_open)),
            Intent::ManualOverride { room_id, value } => {
                drop_on_error(self.manual_override(&room_id, value))
            }
            Intent::ScheduleFire { room_id, event } => {
                drop_on_error(self.schedule_fire(&room_id, event))
            }
            Intent::StatePatch { room_id, patch } => {
                drop_on_error(self.state_patch(&room_id, &patch))
            }
            Intent::Tick => Ok(vec![Effect::Poll(self.poll_requests())]),
        }
    }

    fn window(&self, room_id: &str, is_open: bool) -> Result<Vec<Effect>, ControlError> {
        let view = self.store.get(room_id)?;
        let mut patch = StatePatch::default();

        if is_open {
            // A repeated open keeps the first timestamp so the grace window
            // measures the full open duration.
            if view.state.window_open_since.is_none() {
                patch.window_open_since = Some(Some(self.clock.now_ms()));
            }
        } else {
            patch.window_open_since = Some(None);
        }

        if patch.is_empty() {
            return Ok(Vec::new());
        }
        self.commit(room_id, &patch)
    }

    fn manual_override(&self, room_id: &str, value: f32) -> Result<Vec<Effect>, ControlError> {
        if !value.is_finite() {
            return Err(ControlError::MalformedIntent(format!(
                "non-finite manual override `{value}` for room `{room_id}`"
            )));
        }
        let patch = StatePatch {
            manual_override: Some(Some(value)),
            ..StatePatch::default()
        };
        self.commit(room_id, &patch)
    }

    fn schedule_fire(
        &self,
        room_id: &str,
        event: ScheduleEventKind,
    ) -> Result<Vec<Effect>, ControlError> {
        debug!(room = room_id, event = event.as_str(), "schedule fire");
        self.commit(room_id, &StatePatch::heating(event.heating_state()))
    }

    fn state_patch(&self, room_id: &str, patch: &StatePatch) -> Result<Vec<Effect>, ControlError> {
        self.commit(room_id, patch)
    }

    fn commit(&self, room_id: &str, patch: &StatePatch) -> Result<Vec<Effect>, ControlError> {
        let state = self.store.patch(room_id, patch)?;
        Ok(vec![Effect::StateCommitted {
            room_id: room_id.to_string(),
            state,
        }])
    }

    /// One poll request per room per configured sensor: temperature always,
    /// humidity and manual setpoint when the room has them.
    fn poll_requests(&self) -> Vec<PollRequest> {
        let mut poll = Vec::new();
        for (room_id, config) in self.store.rooms() {
            poll.push(PollRequest {
                sample_type: SampleKind::Temperature,
                room_id: room_id.clone(),
                entity_id: config.temp_sensor.clone(),
            });
            if let Some(entity) = &config.humidity_sensor {
                poll.push(PollRequest {
                    sample_type: SampleKind::Humidity,
                    room_id: room_id.clone(),
                    entity_id: entity.clone(),
                });
            }
            if let Some(entity) = &config.setpoint_sensor {
                poll.push(PollRequest {
                    sample_type: SampleKind::ManualSetpoint,
                    room_id: room_id.clone(),
                    entity_id: entity.clone(),
                });
            }
        }
        poll
    }
}

fn drop_on_error(result: Result<Vec<Effect>, ControlError>) -> Result<Vec<Effect>, ControlError> {
    match result {
        Ok(effects) => Ok(effects),
        Err(err) => {
            warn!("intent dropped: {err}");
            Ok(Vec::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use chrono::{DateTime, Duration, FixedOffset, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::RoomConfig;
    use crate::types::HeatingState;

    struct StepClock(Mutex<DateTime<FixedOffset>>);

    impl StepClock {
        fn new() -> Self {
            let start = FixedOffset::east_opt(3600)
                .unwrap()
                .with_ymd_and_hms(2026, 1, 7, 9, 0, 0)
                .unwrap();
            Self(Mutex::new(start))
        }

        fn advance_secs(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now = *now + Duration::seconds(secs);
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> DateTime<FixedOffset> {
            *self.0.lock().unwrap()
        }
    }

    fn room(heater: &str, temp: &str, humidity: Option<&str>, setpoint: Option<&str>) -> RoomConfig {
        RoomConfig {
            heater_entity: heater.to_string(),
            temp_sensor: temp.to_string(),
            humidity_sensor: humidity.map(str::to_string),
            window_sensor: None,
            setpoint_sensor: setpoint.map(str::to_string),
            adaptive_learning: false,
            preheat_offset: 2.0,
            schedules: Vec::new(),
        }
    }

    fn setup() -> (Arc<StepClock>, Arc<RoomStore>, IntentProcessor) {
        let clock = Arc::new(StepClock::new());
        let store = Arc::new(RoomStore::new(clock.clone()));
        let processor = IntentProcessor::new(Arc::clone(&store), clock.clone());

        let mut rooms = BTreeMap::new();
        rooms.insert(
            "living".to_string(),
            room(
                "climate.living",
                "sensor.living_temp",
                Some("sensor.living_hum"),
                None,
            ),
        );
        rooms.insert(
            "bath".to_string(),
            room("climate.bath", "sensor.bath_temp", None, Some("number.bath_setpoint")),
        );
        let effects = processor
            .apply(Intent::Init {
                config: BuildingConfig {
                    rooms,
                    default_schedules: None,
                },
            })
            .unwrap();
        assert_eq!(effects, vec![Effect::Ready]);

        (clock, store, processor)
    }

    #[test]
    fn window_open_keeps_first_timestamp() {
        let (clock, store, processor) = setup();
        let t0 = clock.now_ms();

        processor
            .apply(Intent::Window {
                room_id: "living".to_string(),
                is_open: true,
            })
            .unwrap();
        assert_eq!(
            store.get("living").unwrap().state.window_open_since,
            Some(t0)
        );

        // A second open event a minute later must not restart the timer.
        clock.advance_secs(60);
        let effects = processor
            .apply(Intent::Window {
                room_id: "living".to_string(),
                is_open: true,
            })
            .unwrap();
        assert_eq!(effects, Vec::new());
        assert_eq!(
            store.get("living").unwrap().state.window_open_since,
            Some(t0)
        );

        processor
            .apply(Intent::Window {
                room_id: "living".to_string(),
                is_open: false,
            })
            .unwrap();
        assert_eq!(store.get("living").unwrap().state.window_open_since, None);
    }

    #[test]
    fn unknown_room_is_dropped_without_mutation() {
        let (_clock, store, processor) = setup();

        let effects = processor
            .apply(Intent::Window {
                room_id: "attic".to_string(),
                is_open: true,
            })
            .unwrap();
        assert_eq!(effects, Vec::new());

        let effects = processor
            .apply(Intent::ManualOverride {
                room_id: "attic".to_string(),
                value: 22.0,
            })
            .unwrap();
        assert_eq!(effects, Vec::new());

        assert_eq!(store.get("living").unwrap().state.toggles, 0);
    }

    #[test]
    fn non_finite_override_is_dropped() {
        let (_clock, store, processor) = setup();

        let effects = processor
            .apply(Intent::ManualOverride {
                room_id: "living".to_string(),
                value: f32::NAN,
            })
            .unwrap();
        assert_eq!(effects, Vec::new());
        assert_eq!(store.get("living").unwrap().state.manual_override, None);

        processor
            .apply(Intent::ManualOverride {
                room_id: "living".to_string(),
                value: 23.5,
            })
            .unwrap();
        assert_eq!(
            store.get("living").unwrap().state.manual_override,
            Some(23.5)
        );
    }

    #[test]
    fn schedule_fire_maps_event_kinds_to_heating() {
        let (_clock, store, processor) = setup();

        for (event, expected) in [
            (ScheduleEventKind::StartHeat, HeatingState::Heat),
            (ScheduleEventKind::StartPreheat, HeatingState::Preheat),
            (ScheduleEventKind::EndPreheat, HeatingState::Off),
            (ScheduleEventKind::StopHeat, HeatingState::Off),
        ] {
            processor
                .apply(Intent::ScheduleFire {
                    room_id: "living".to_string(),
                    event,
                })
                .unwrap();
            assert_eq!(store.get("living").unwrap().state.heating, expected);
        }

        // heat -> preheat -> off -> off: three committed changes.
        assert_eq!(store.get("living").unwrap().state.toggles, 3);
    }

    #[test]
    fn tick_polls_every_configured_sensor() {
        let (_clock, _store, processor) = setup();

        let effects = processor.apply(Intent::Tick).unwrap();
        let Some(Effect::Poll(requests)) = effects.first() else {
            panic!("tick must produce a poll effect");
        };

        assert_eq!(
            requests,
            &vec![
                PollRequest {
                    sample_type: SampleKind::Temperature,
                    room_id: "bath".to_string(),
                    entity_id: "sensor.bath_temp".to_string(),
                },
                PollRequest {
                    sample_type: SampleKind::ManualSetpoint,
                    room_id: "bath".to_string(),
                    entity_id: "number.bath_setpoint".to_string(),
                },
                PollRequest {
                    sample_type: SampleKind::Temperature,
                    room_id: "living".to_string(),
                    entity_id: "sensor.living_temp".to_string(),
                },
                PollRequest {
                    sample_type: SampleKind::Humidity,
                    room_id: "living".to_string(),
                    entity_id: "sensor.living_hum".to_string(),
                },
            ]
        );
    }

    #[test]
    fn sample_to_commit_round_trip() {
        let clock = Arc::new(StepClock::new());
        let store = Arc::new(RoomStore::new(clock.clone()));
        let processor = IntentProcessor::new(Arc::clone(&store), clock.clone());

        let mut living = room(
            "climate.living",
            "sensor.living_temp",
            Some("sensor.living_hum"),
            None,
        );
        living.schedules.push(crate::config::ScheduleEntry {
            days: (0..7).collect(),
            start: "06:00".parse().unwrap(),
            end: "22:00".parse().unwrap(),
            band: crate::config::TargetBand {
                humidex_target: 21.0,
                humidex_hysteresis: 1.0,
            },
        });
        let mut rooms = BTreeMap::new();
        rooms.insert("living".to_string(), living);
        processor
            .apply(Intent::Init {
                config: BuildingConfig {
                    rooms,
                    default_schedules: None,
                },
            })
            .unwrap();

        let view = store.get("living").unwrap();
        let sample = crate::types::Sample {
            room_id: "living".to_string(),
            temperature: Some(19.0),
            humidity: Some(50.0),
            manual_setpoint: None,
            window_open: false,
            is_tick: false,
            command: None,
        };
        let outcome = crate::engine::decide(
            &view.config,
            None,
            &view.state,
            &sample,
            clock.now(),
            &crate::config::ControlConfig::default(),
        );

        assert!(outcome.decision.changed);
        assert_eq!(outcome.decision.next_state, HeatingState::Heat);
        assert!(outcome.decision.reason.starts_with("heating_to_21"));

        processor
            .apply(Intent::StatePatch {
                room_id: "living".to_string(),
                patch: outcome.patch,
            })
            .unwrap();

        let committed = store.get("living").unwrap().state;
        assert_eq!(committed.heating, HeatingState::Heat);
        assert_eq!(committed.toggles, 1);
    }

    #[test]
    fn intent_envelope_round_trips() {
        let intent = Intent::ScheduleFire {
            room_id: "living".to_string(),
            event: ScheduleEventKind::StartPreheat,
        };
        let raw = serde_json::to_string(&intent).unwrap();
        assert_eq!(
            raw,
            r#"{"kind":"SCHEDULE_FIRE","roomId":"living","event":"START_PREHEAT"}"#
        );
        assert_eq!(serde_json::from_str::<Intent>(&raw).unwrap(), intent);
    }
}
