//! MQTT topic layout shared by the controller and the sensor publishers.

/// Entity-keyed sensor readings arrive under this prefix; the entity id is
/// the remainder of the topic.
pub const TOPIC_SENSOR_PREFIX: &str = "heating/sensor";

/// Tick-driven poll requests for external samplers.
pub const TOPIC_POLL_REQUESTS: &str = "heating/poll";

pub fn sensor_topic(entity_id: &str) -> String {
    format!("{TOPIC_SENSOR_PREFIX}/{entity_id}")
}

/// Retained per-room decision state document.
pub fn room_state_topic(room_id: &str) -> String {
    format!("heating/{room_id}/state")
}

/// Climate command derived from a changed decision.
pub fn climate_command_topic(room_id: &str) -> String {
    format!("heating/{room_id}/climate/set")
}

pub fn entity_from_sensor_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_SENSOR_PREFIX)?
        .strip_prefix('/')
        .filter(|entity| !entity.is_empty())
}
