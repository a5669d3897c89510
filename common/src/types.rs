use serde::{Deserialize, Serialize};

use crate::error::ControlError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeatingState {
    Off,
    Heat,
    Preheat,
}

impl HeatingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Heat => "heat",
            Self::Preheat => "preheat",
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Payload kind of a compiled schedule trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleEventKind {
    StartHeat,
    StartPreheat,
    StopHeat,
    EndPreheat,
}

impl ScheduleEventKind {
    pub fn heating_state(self) -> HeatingState {
        match self {
            Self::StartHeat => HeatingState::Heat,
            Self::StartPreheat => HeatingState::Preheat,
            Self::StopHeat | Self::EndPreheat => HeatingState::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StartHeat => "START_HEAT",
            Self::StartPreheat => "START_PREHEAT",
            Self::StopHeat => "STOP_HEAT",
            Self::EndPreheat => "END_PREHEAT",
        }
    }
}

impl std::str::FromStr for ScheduleEventKind {
    type Err = ControlError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "START_HEAT" => Ok(Self::StartHeat),
            "START_PREHEAT" => Ok(Self::StartPreheat),
            "STOP_HEAT" => Ok(Self::StopHeat),
            "END_PREHEAT" => Ok(Self::EndPreheat),
            other => Err(ControlError::UnknownScheduleEvent(other.to_string())),
        }
    }
}

/// Direct command bypassing the control ladder, e.g. from a wall switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForcedCommand {
    HeatOn {
        #[serde(default)]
        preheat: bool,
    },
    HeatOff,
}

impl ForcedCommand {
    pub fn kind_str(self) -> &'static str {
        match self {
            Self::HeatOn { .. } => "HEAT_ON",
            Self::HeatOff => "HEAT_OFF",
        }
    }
}

/// Role a configured entity plays for its room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Heater,
    Temperature,
    Humidity,
    Window,
    Setpoint,
}

/// Sensor kind requested by a tick-driven poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    Temperature,
    Humidity,
    ManualSetpoint,
}

/// One entry of the poll-request list a `TICK` produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollRequest {
    #[serde(rename = "sampleType")]
    pub sample_type: SampleKind,
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "entityId")]
    pub entity_id: String,
}

/// Everything the decision engine sees about a room at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub temperature: Option<f32>,
    pub humidity: Option<f32>,
    #[serde(rename = "manualSetpoint")]
    pub manual_setpoint: Option<f32>,
    #[serde(rename = "windowOpen", default)]
    pub window_open: bool,
    #[serde(rename = "isTick", default)]
    pub is_tick: bool,
    #[serde(default)]
    pub command: Option<ForcedCommand>,
}

/// The decision payload downstream actuation and telemetry consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(rename = "heaterEntity")]
    pub heater_entity: String,
    pub value: Option<f32>,
    pub target: Option<f32>,
    #[serde(rename = "nextState")]
    pub next_state: HeatingState,
    #[serde(rename = "currentState")]
    pub current_state: HeatingState,
    pub changed: bool,
    pub reason: String,
    #[serde(rename = "manualOverride")]
    pub manual_override: bool,
    pub adaptive: bool,
    #[serde(rename = "hasExternalSensors")]
    pub has_external_sensors: bool,
    pub ts: i64,
}
