use std::time::Duration;

use anyhow::Context;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use tracing::{info, warn};

use heating_common::topics;

/// Publishes simulated readings for one room's entity pair; used to drive
/// a controller against a live broker.
pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("heating-sensor", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, mut eventloop) = AsyncClient::new(mqtt_options, 32);

    tokio::spawn(async move {
        loop {
            if let Err(err) = eventloop.poll().await {
                warn!("sensor mqtt poll error: {err}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    });

    let temp_entity =
        std::env::var("HEATING_TEMP_ENTITY").unwrap_or_else(|_| "sensor.sim_temp".to_string());
    let humidity_entity =
        std::env::var("HEATING_HUMIDITY_ENTITY").unwrap_or_else(|_| "sensor.sim_hum".to_string());

    info!("sensor publisher started");

    let mut tick: u64 = 0;
    let mut interval = tokio::time::interval(Duration::from_secs(30));

    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        // Hardware integration point: replace the simulated readings with a
        // real probe.
        let temperature = 19.0 + ((tick % 8) as f32 * 0.2);
        let humidity = 45.0 + ((tick % 6) as f32 * 0.5);

        mqtt.publish(
            topics::sensor_topic(&temp_entity),
            QoS::AtLeastOnce,
            true,
            format!("{temperature:.1}"),
        )
        .await
        .context("failed to publish temperature")?;
        mqtt.publish(
            topics::sensor_topic(&humidity_entity),
            QoS::AtLeastOnce,
            true,
            format!("{humidity:.1}"),
        )
        .await
        .context("failed to publish humidity")?;
    }
}
