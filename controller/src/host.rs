use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Datelike, Timelike};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use heating_common::{
    compiler, engine, learner, topics, BuildingConfig, Clock, ControlConfig, DecisionOutcome,
    Effect, EntityKind, Intent, IntentProcessor, RoomConfig, RoomState, RoomStore, Sample,
    SystemClock, TriggerSpec,
};

use crate::actuation;

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const TICK_INTERVAL: Duration = Duration::from_secs(300);
const TRIGGER_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// On-disk configuration: the building plus optional control overrides.
#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(flatten)]
    building: BuildingConfig,
    #[serde(default)]
    control: ControlConfig,
}

/// Latest raw readings per room, assembled into engine samples.
#[derive(Debug, Clone, Default)]
struct LatestReadings {
    temperature: Option<f32>,
    humidity: Option<f32>,
    manual_setpoint: Option<f32>,
}

#[derive(Clone)]
struct AppState {
    store: Arc<RoomStore>,
    processor: Arc<IntentProcessor>,
    clock: Arc<dyn Clock>,
    ctl: Arc<ControlConfig>,
    readings: Arc<Mutex<HashMap<String, LatestReadings>>>,
    triggers: Arc<Mutex<Vec<TriggerSpec>>>,
    mqtt: AsyncClient,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct RoomStatus {
    #[serde(rename = "roomId")]
    room_id: String,
    config: RoomConfig,
    state: RoomState,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path =
        std::env::var("HEATING_CONFIG").unwrap_or_else(|_| "./heating.json".to_string());
    let config = load_file_config(&config_path)
        .with_context(|| format!("failed to load building config from {config_path}"))?;

    let timezone = std::env::var("HEATING_TZ").unwrap_or_else(|_| "Europe/Berlin".to_string());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(&timezone)?);

    let store = Arc::new(RoomStore::new(Arc::clone(&clock)));
    let processor = Arc::new(IntentProcessor::new(Arc::clone(&store), Arc::clone(&clock)));
    processor
        .apply(Intent::Init {
            config: config.building,
        })
        .context("failed to initialise room store")?;

    let ctl = Arc::new(config.control);
    let triggers = compiler::compile_building(&store, &ctl);
    info!(count = triggers.len(), "schedule triggers compiled");

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("heating-controller", mqtt_host, mqtt_port);
    if let Ok(user) = std::env::var("MQTT_USER") {
        let pass = std::env::var("MQTT_PASS").unwrap_or_default();
        mqtt_options.set_credentials(user, pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        store,
        processor,
        clock,
        ctl,
        readings: Arc::new(Mutex::new(HashMap::new())),
        triggers: Arc::new(Mutex::new(triggers)),
        mqtt,
    };

    subscribe_sensor_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_trigger_loop(app_state.clone());
    spawn_tick_loop(app_state.clone());

    let app = Router::new()
        .route("/api/rooms", get(handle_get_rooms))
        .route("/api/rooms/{id}", get(handle_get_room))
        .route("/api/rooms/{id}/override", post(handle_override))
        .route("/api/rooms/{id}/window", post(handle_window))
        .route("/api/triggers", get(handle_get_triggers))
        .route("/api/reschedule", post(handle_reschedule))
        .with_state(app_state);

    let port = std::env::var("HEATING_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("invalid listen address")?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn load_file_config(path: &str) -> anyhow::Result<FileConfig> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}

async fn subscribe_sensor_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    mqtt.subscribe(
        format!("{}/#", topics::TOPIC_SENSOR_PREFIX),
        QoS::AtMostOnce,
    )
    .await
    .context("failed to subscribe to sensor topics")?;
    Ok(())
}

fn spawn_mqtt_loop(app: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    handle_mqtt_message(&app, &message.topic, message.payload.to_vec()).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(app: &AppState, topic: &str, payload: Vec<u8>) {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            topic,
            bytes = payload.len(),
            "dropping oversized mqtt payload"
        );
        return;
    }
    let Ok(message) = String::from_utf8(payload) else {
        warn!(topic, "dropping non-utf8 mqtt payload");
        return;
    };
    let Some(entity_id) = topics::entity_from_sensor_topic(topic) else {
        return;
    };
    let Some((room_id, kind)) = app.store.room_for_entity(entity_id) else {
        warn!(entity = entity_id, "reading for unmapped entity dropped");
        return;
    };

    let value = message.trim();
    match kind {
        EntityKind::Window => {
            let is_open = matches!(value, "on" | "open" | "true");
            apply_intent(
                app,
                Intent::Window {
                    room_id: room_id.clone(),
                    is_open,
                },
            );
            run_decision(app, &room_id, false).await;
        }
        EntityKind::Setpoint => {
            let Ok(setpoint) = value.parse::<f32>() else {
                warn!(entity = entity_id, value, "unparseable setpoint dropped");
                return;
            };
            apply_intent(
                app,
                Intent::ManualOverride {
                    room_id: room_id.clone(),
                    value: setpoint,
                },
            );
            run_decision(app, &room_id, false).await;
        }
        EntityKind::Temperature => {
            let Ok(temp) = value.parse::<f32>() else {
                warn!(entity = entity_id, value, "unparseable temperature dropped");
                return;
            };
            if !temp.is_finite() || !(-40.0..=60.0).contains(&temp) {
                warn!(entity = entity_id, temp, "temperature out of range");
                return;
            }
            lock(&app.readings).entry(room_id.clone()).or_default().temperature = Some(temp);
            run_decision(app, &room_id, false).await;
        }
        EntityKind::Humidity => {
            let Ok(humidity) = value.parse::<f32>() else {
                warn!(entity = entity_id, value, "unparseable humidity dropped");
                return;
            };
            if !humidity.is_finite() || !(0.0..=100.0).contains(&humidity) {
                warn!(entity = entity_id, humidity, "humidity out of range");
                return;
            }
            lock(&app.readings).entry(room_id.clone()).or_default().humidity = Some(humidity);
            run_decision(app, &room_id, false).await;
        }
        // State echoes from the actuator are outputs, not inputs.
        EntityKind::Heater => {}
    }
}

fn spawn_trigger_loop(app: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TRIGGER_SCAN_INTERVAL);
        let mut last_slot: Option<(u8, u16)> = None;

        loop {
            interval.tick().await;

            let now = app.clock.now();
            let day = now.weekday().num_days_from_sunday() as u8;
            let minute = (now.hour() * 60 + now.minute()) as u16;
            if last_slot == Some((day, minute)) {
                continue;
            }
            last_slot = Some((day, minute));

            let due: Vec<Intent> = {
                let triggers = lock(&app.triggers);
                triggers
                    .iter()
                    .filter(|t| {
                        t.days.contains(&day) && t.time_of_day.minute_of_day() == minute
                    })
                    .map(|t| t.payload.clone())
                    .collect()
            };

            for intent in due {
                debug!(?intent, "schedule trigger fired");
                apply_intent(&app, intent);
            }
        }
    });
}

fn spawn_tick_loop(app: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK_INTERVAL);

        loop {
            interval.tick().await;

            match app.processor.apply(Intent::Tick) {
                Ok(effects) => {
                    for effect in effects {
                        if let Effect::Poll(requests) = effect {
                            publish_poll_requests(&app, &requests).await;
                        }
                    }
                }
                Err(err) => warn!("tick failed: {err}"),
            }

            for room_id in app.store.room_ids() {
                run_decision(&app, &room_id, true).await;
            }
        }
    });
}

async fn publish_poll_requests(app: &AppState, requests: &[heating_common::PollRequest]) {
    match serde_json::to_vec(requests) {
        Ok(body) => {
            if let Err(err) = app
                .mqtt
                .publish(topics::TOPIC_POLL_REQUESTS, QoS::AtMostOnce, false, body)
                .await
            {
                warn!("poll request publish failed: {err}");
            }
        }
        Err(err) => warn!("poll request serialization failed: {err}"),
    }
}

fn apply_intent(app: &AppState, intent: Intent) {
    if let Err(err) = app.processor.apply(intent) {
        warn!("intent failed: {err}");
    }
}

/// Runs the engine for one room if it has enough of a sample, commits the
/// result through the processor, feeds the learner, and actuates.
async fn run_decision(app: &AppState, room_id: &str, is_tick: bool) {
    let Some(outcome) = evaluate_room(app, room_id, is_tick) else {
        return;
    };
    publish_decision(app, outcome).await;
}

fn evaluate_room(app: &AppState, room_id: &str, is_tick: bool) -> Option<DecisionOutcome> {
    let view = match app.store.get(room_id) {
        Ok(view) => view,
        Err(err) => {
            warn!("decision skipped: {err}");
            return None;
        }
    };
    let readings = lock(&app.readings)
        .get(room_id)
        .cloned()
        .unwrap_or_default();

    // The engine only runs once a value is known for the room.
    if readings.temperature.is_none()
        && readings.manual_setpoint.is_none()
        && view.state.manual_override.is_none()
    {
        return None;
    }

    let sample = Sample {
        room_id: room_id.to_string(),
        temperature: readings.temperature,
        humidity: readings.humidity,
        manual_setpoint: view.state.manual_override.or(readings.manual_setpoint),
        window_open: view.state.window_open_since.is_some(),
        is_tick,
        command: None,
    };

    let defaults = app.store.default_schedules();
    Some(engine::decide(
        &view.config,
        defaults.as_ref(),
        &view.state,
        &sample,
        app.clock.now(),
        &app.ctl,
    ))
}

async fn publish_decision(app: &AppState, outcome: DecisionOutcome) {
    let DecisionOutcome { decision, patch } = outcome;

    if !patch.is_empty() {
        apply_intent(
            app,
            Intent::StatePatch {
                room_id: decision.room_id.clone(),
                patch,
            },
        );
    }

    if let Ok(view) = app.store.get(&decision.room_id) {
        if let Some(learn_patch) = learner::observe(&view.config, &view.state, &decision, &app.ctl)
        {
            apply_intent(
                app,
                Intent::StatePatch {
                    room_id: decision.room_id.clone(),
                    patch: learn_patch,
                },
            );
        }
    }

    if let Some(command) = actuation::climate_command(&decision, &app.ctl) {
        match serde_json::to_vec(&command) {
            Ok(body) => {
                if let Err(err) = app
                    .mqtt
                    .publish(
                        topics::climate_command_topic(&decision.room_id),
                        QoS::AtLeastOnce,
                        false,
                        body,
                    )
                    .await
                {
                    warn!("climate command publish failed: {err}");
                }
            }
            Err(err) => warn!("climate command serialization failed: {err}"),
        }
    }

    let doc = actuation::state_document(&decision);
    match serde_json::to_vec(&doc) {
        Ok(body) => {
            if let Err(err) = app
                .mqtt
                .publish(
                    topics::room_state_topic(&decision.room_id),
                    QoS::AtLeastOnce,
                    true,
                    body,
                )
                .await
            {
                warn!("room state publish failed: {err}");
            }
        }
        Err(err) => warn!("room state serialization failed: {err}"),
    }

    info!(
        room = %decision.room_id,
        next = decision.next_state.as_str(),
        reason = %decision.reason,
        changed = decision.changed,
        "decision committed"
    );
}

async fn handle_get_rooms(State(app): State<AppState>) -> impl IntoResponse {
    let mut rooms = Vec::new();
    for room_id in app.store.room_ids() {
        if let Ok(view) = app.store.get(&room_id) {
            rooms.push(RoomStatus {
                room_id,
                config: (*view.config).clone(),
                state: view.state,
            });
        }
    }
    Json(rooms)
}

async fn handle_get_room(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    match app.store.get(&id) {
        Ok(view) => Json(RoomStatus {
            room_id: id,
            config: (*view.config).clone(),
            state: view.state,
        })
        .into_response(),
        Err(err) => error_response(StatusCode::NOT_FOUND, &err.to_string()),
    }
}

async fn handle_override(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(value) = value.parse::<f32>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid setpoint value");
    };

    apply_intent(
        &app,
        Intent::ManualOverride {
            room_id: id.clone(),
            value,
        },
    );
    run_decision(&app, &id, false).await;
    handle_get_room(State(app), Path(id)).await
}

async fn handle_window(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> axum::response::Response {
    let Some(open) = params.get("open") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'open' parameter");
    };
    let is_open = matches!(open.as_str(), "true" | "1" | "on");

    apply_intent(
        &app,
        Intent::Window {
            room_id: id.clone(),
            is_open,
        },
    );
    run_decision(&app, &id, false).await;
    handle_get_room(State(app), Path(id)).await
}

async fn handle_get_triggers(State(app): State<AppState>) -> impl IntoResponse {
    let triggers = lock(&app.triggers).clone();
    Json(triggers)
}

async fn handle_reschedule(State(app): State<AppState>) -> impl IntoResponse {
    let compiled = compiler::compile_building(&app.store, &app.ctl);
    let installed = compiled.len();
    *lock(&app.triggers) = compiled;
    info!(installed, "schedule triggers recompiled");
    Json(serde_json::json!({ "installed": installed }))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
