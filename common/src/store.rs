use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::clock::Clock;
use crate::config::{BuildingConfig, DefaultSchedules, RoomConfig, LEARNED_OVERSHOOT_MAX};
use crate::error::ControlError;
use crate::types::{EntityKind, HeatingState};

/// Mutable per-room state, owned by [`RoomStore`] and mutated only through
/// [`RoomStore::patch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    pub heating: HeatingState,
    pub window_open_since: Option<i64>,
    pub manual_override: Option<f32>,
    pub learned_overshoot: f32,
    pub last_stop_val: Option<f32>,
    pub peak_after_stop: Option<f32>,
    pub toggles: u64,
    #[serde(rename = "lastChange")]
    pub last_change: i64,
}

impl RoomState {
    fn initial(now_ms: i64) -> Self {
        Self {
            heating: HeatingState::Off,
            window_open_since: None,
            manual_override: None,
            learned_overshoot: 0.0,
            last_stop_val: None,
            peak_after_stop: None,
            toggles: 0,
            last_change: now_ms,
        }
    }
}

/// Merge patch for [`RoomState`].
///
/// `None` leaves a field untouched; for the clearable fields `Some(None)`
/// clears and `Some(Some(v))` sets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heating: Option<HeatingState>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub window_open_since: Option<Option<i64>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub manual_override: Option<Option<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learned_overshoot: Option<f32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub last_stop_val: Option<Option<f32>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub peak_after_stop: Option<Option<f32>>,
}

impl StatePatch {
    pub fn heating(state: HeatingState) -> Self {
        Self {
            heating: Some(state),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// An explicit `null` must clear the field rather than leave it untouched.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

struct RoomSlot {
    config: Arc<RoomConfig>,
    state: Mutex<RoomState>,
}

/// A room's configuration with a snapshot of its committed state.
#[derive(Debug, Clone)]
pub struct RoomView {
    pub config: Arc<RoomConfig>,
    pub state: RoomState,
}

/// Canonical owner of all room configuration and state.
///
/// Patches to the same room serialize on that room's lock; different rooms
/// never contend with each other.
pub struct RoomStore {
    clock: Arc<dyn Clock>,
    rooms: RwLock<HashMap<String, Arc<RoomSlot>>>,
    entities: RwLock<HashMap<String, (String, EntityKind)>>,
    default_schedules: RwLock<Option<DefaultSchedules>>,
}

impl RoomStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rooms: RwLock::new(HashMap::new()),
            entities: RwLock::new(HashMap::new()),
            default_schedules: RwLock::new(None),
        }
    }

    /// Installs the room set, keeping the state of rooms that already exist
    /// and seeding defaults for the rest, and rebuilds the entity lookup.
    pub fn init(&self, mut config: BuildingConfig) -> Result<(), ControlError> {
        config.normalize();
        if config.rooms.is_empty() {
            return Err(ControlError::Config("no rooms configured".to_string()));
        }

        let now_ms = self.clock.now_ms();
        let room_count = config.rooms.len();
        let mut rooms = HashMap::with_capacity(room_count);
        let mut entities = HashMap::new();

        {
            let previous = read_lock(&self.rooms);
            for (room_id, room) in config.rooms {
                let state = previous
                    .get(&room_id)
                    .map(|slot| lock(&slot.state).clone())
                    .unwrap_or_else(|| RoomState::initial(now_ms));
                index_entities(&mut entities, &room_id, &room);
                rooms.insert(
                    room_id,
                    Arc::new(RoomSlot {
                        config: Arc::new(room),
                        state: Mutex::new(state),
                    }),
                );
            }
        }

        *write_lock(&self.rooms) = rooms;
        *write_lock(&self.entities) = entities;
        *write_lock(&self.default_schedules) = config.default_schedules;

        info!(rooms = room_count, "room store initialised");
        Ok(())
    }

    pub fn get(&self, room_id: &str) -> Result<RoomView, ControlError> {
        let slot = self.slot(room_id)?;
        let state = lock(&slot.state).clone();
        Ok(RoomView {
            config: Arc::clone(&slot.config),
            state,
        })
    }

    /// Merges `patch` into the room's state and returns the committed
    /// result. `toggles` advances exactly when the patch carries a heating
    /// value different from the current one.
    pub fn patch(&self, room_id: &str, patch: &StatePatch) -> Result<RoomState, ControlError> {
        let slot = self.slot(room_id)?;
        let mut state = lock(&slot.state);

        if let Some(next) = patch.heating {
            if next != state.heating {
                state.toggles += 1;
            }
            state.heating = next;
        }
        if let Some(window) = patch.window_open_since {
            state.window_open_since = window;
        }
        if let Some(value) = patch.manual_override {
            state.manual_override = value;
        }
        if let Some(value) = patch.learned_overshoot {
            state.learned_overshoot = value.clamp(0.0, LEARNED_OVERSHOOT_MAX);
        }
        if let Some(value) = patch.last_stop_val {
            state.last_stop_val = value;
        }
        if let Some(value) = patch.peak_after_stop {
            state.peak_after_stop = value;
        }
        state.last_change = self.clock.now_ms();

        Ok(state.clone())
    }

    /// Room ids in stable order.
    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = read_lock(&self.rooms).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Room configurations in stable id order.
    pub fn rooms(&self) -> Vec<(String, Arc<RoomConfig>)> {
        let guard = read_lock(&self.rooms);
        let mut rooms: Vec<(String, Arc<RoomConfig>)> = guard
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(&slot.config)))
            .collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms
    }

    pub fn default_schedules(&self) -> Option<DefaultSchedules> {
        *read_lock(&self.default_schedules)
    }

    /// Reverse lookup from a configured entity id to its room and role.
    pub fn room_for_entity(&self, entity_id: &str) -> Option<(String, EntityKind)> {
        read_lock(&self.entities).get(entity_id).cloned()
    }

    fn slot(&self, room_id: &str) -> Result<Arc<RoomSlot>, ControlError> {
        read_lock(&self.rooms)
            .get(room_id)
            .cloned()
            .ok_or_else(|| ControlError::UnknownRoom(room_id.to_string()))
    }
}

fn index_entities(
    entities: &mut HashMap<String, (String, EntityKind)>,
    room_id: &str,
    room: &RoomConfig,
) {
    let mut add = |entity: &str, kind: EntityKind| {
        entities.insert(entity.to_string(), (room_id.to_string(), kind));
    };

    add(&room.heater_entity, EntityKind::Heater);
    add(&room.temp_sensor, EntityKind::Temperature);
    if let Some(entity) = &room.humidity_sensor {
        add(entity, EntityKind::Humidity);
    }
    if let Some(entity) = &room.window_sensor {
        add(entity, EntityKind::Window);
    }
    if let Some(entity) = &room.setpoint_sensor {
        add(entity, EntityKind::Setpoint);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
