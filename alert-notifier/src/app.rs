use std::sync::Arc;

use alert_common::alert::{round_confidence, AlertSummary, NewAlert, StreamKey};
use alert_common::health::HealthRegistry;
use alert_common::store::AlertStore;
use axum::{
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;
use crate::registry::StreamRegistry;
use crate::subscriber::serve_subscriber;

/// How many alerts `GET /alerts` returns.
const RECENT_ALERTS_LIMIT: i64 = 50;

/// Cameras picked from when simulating a detection.
const SIMULATED_CAMERAS: [&str; 3] = ["CAM_001_Entrance", "CAM_002_Lobby", "CAM_003_Parking"];

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub alerts: Arc<dyn AlertStore>,
    pub liveness: HealthRegistry,
    pub subscriber_buffer_size: usize,
    pub shutdown: CancellationToken,
}

pub fn create_router(state: AppState) -> Router {
    let subscriber_routes = Router::new()
        .route("/ws", get(subscribe_general))
        .route("/ws/:video_id", get(subscribe_stream));

    let api_routes = Router::new()
        .route("/alerts", get(get_alerts))
        .route("/simulate-detection", post(simulate_detection));

    let health_routes = Router::new()
        .route("/", get(index))
        .route("/_liveness", get(liveness))
        .route("/_readiness", get(readiness));

    Router::new()
        .merge(subscriber_routes)
        .merge(api_routes)
        .merge(health_routes)
        .with_state(state)
}

async fn index() -> &'static str {
    "alert notifier"
}

async fn liveness(State(state): State<AppState>) -> Response {
    state.liveness.get_status().into_response()
}

async fn readiness(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    state
        .alerts
        .ping()
        .await
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;

    Ok("ok")
}

async fn subscribe_general(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    upgrade(ws, state, StreamKey::general())
}

async fn subscribe_stream(
    ws: WebSocketUpgrade,
    Path(video_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    upgrade(ws, state, StreamKey::from(video_id.as_str()))
}

fn upgrade(ws: WebSocketUpgrade, state: AppState, stream: StreamKey) -> Response {
    ws.on_upgrade(move |socket: WebSocket| async move {
        let (sink, inbound) = socket.split();
        serve_subscriber(
            sink,
            inbound,
            state.registry,
            stream,
            state.subscriber_buffer_size,
            state.shutdown,
        )
        .await;
    })
}

async fn get_alerts(State(state): State<AppState>) -> Result<Json<Vec<AlertSummary>>, ApiError> {
    let alerts = state.alerts.recent_alerts(RECENT_ALERTS_LIMIT).await?;
    Ok(Json(alerts))
}

#[derive(Debug, Default, Deserialize)]
pub struct SimulateParams {
    pub video_id: Option<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatedDetection {
    pub message: String,
    pub alert_id: i64,
}

/// Record a random detection, seeding sample blacklisted persons on an empty database.
/// The notification it enqueues reaches subscribers through the poller like any other alert.
async fn simulate_detection(
    State(state): State<AppState>,
    Query(params): Query<SimulateParams>,
) -> Result<Json<SimulatedDetection>, ApiError> {
    let mut persons = state.alerts.blacklisted_persons(3).await?;
    if persons.is_empty() {
        state.alerts.seed_blacklisted_persons().await?;
        persons = state.alerts.blacklisted_persons(3).await?;
    }

    let alert = {
        let mut rng = rand::thread_rng();
        let person = persons
            .choose(&mut rng)
            .ok_or(ApiError::NoBlacklistedPersons)?;
        let camera = SIMULATED_CAMERAS
            .choose(&mut rng)
            .copied()
            .unwrap_or(SIMULATED_CAMERAS[0]);

        NewAlert {
            person_id: person.id,
            camera_location: camera.to_owned(),
            video_id: params.video_id,
            confidence_score: round_confidence(rng.gen_range(75.0..=99.9)),
        }
    };

    let alert_id = state.alerts.insert_alert(alert).await?;
    tracing::info!(alert_id, "simulated detection");

    Ok(Json(SimulatedDetection {
        message: "Detection simulated".to_owned(),
        alert_id,
    }))
}
