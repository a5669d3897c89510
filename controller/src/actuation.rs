//! Translates engine decisions into downstream actuation payloads.

use serde::Serialize;

use heating_common::{ControlConfig, Decision, HeatingState};

/// Climate command for the heater behind a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClimateCommand {
    pub action: &'static str,
    #[serde(rename = "entityId")]
    pub entity_id: String,
    #[serde(rename = "hvacMode")]
    pub hvac_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

/// Builds the climate command for a changed decision; unchanged decisions
/// produce no actuation.
pub fn climate_command(decision: &Decision, ctl: &ControlConfig) -> Option<ClimateCommand> {
    if !decision.changed {
        return None;
    }

    let command = match decision.next_state {
        HeatingState::Heat => ClimateCommand {
            action: "climate.set_temperature",
            entity_id: decision.heater_entity.clone(),
            hvac_mode: "heat",
            temperature: decision.target,
        },
        // Preheat pushes the force-heat setpoint so the heater runs flat
        // out until the preheat window ends.
        HeatingState::Preheat => ClimateCommand {
            action: "climate.set_temperature",
            entity_id: decision.heater_entity.clone(),
            hvac_mode: "heat",
            temperature: Some(ctl.force_heat_setpoint),
        },
        HeatingState::Off => ClimateCommand {
            action: "climate.set_hvac_mode",
            entity_id: decision.heater_entity.clone(),
            hvac_mode: "off",
            temperature: None,
        },
    };
    Some(command)
}

/// Retained state document published per room after every decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomStateDoc {
    pub active: bool,
    pub phase: &'static str,
    pub target: Option<f32>,
    pub value: Option<f32>,
    pub reason: String,
    pub manual_override: bool,
    pub adaptive: bool,
    pub sensors: &'static str,
    pub ts: i64,
}

pub fn state_document(decision: &Decision) -> RoomStateDoc {
    RoomStateDoc {
        active: decision.next_state.is_active(),
        phase: decision.next_state.as_str(),
        target: decision.target,
        value: decision.value,
        reason: decision.reason.clone(),
        manual_override: decision.manual_override,
        adaptive: decision.adaptive,
        sensors: if decision.has_external_sensors {
            "humidex"
        } else {
            "classic"
        },
        ts: decision.ts,
    }
}
