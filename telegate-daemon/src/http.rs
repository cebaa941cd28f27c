// Telegate - Instrument telemetry gateway
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Webhook receiver plus health and status endpoints

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use telegate::{RawFrame, WorkerStatus};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// What the status endpoint knows about one sensor
#[derive(Debug)]
pub struct SensorEntry {
    pub protocol: &'static str,
    pub shape: &'static str,
    pub source: String,
    pub status: watch::Receiver<WorkerStatus>,
}

/// Application state shared across handlers
#[derive(Debug)]
pub struct AppState {
    pub started: Instant,
    pub sensors: BTreeMap<String, SensorEntry>,
    /// Frame inlets of push sensors
    pub push: HashMap<String, mpsc::Sender<RawFrame>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            sensors: BTreeMap::new(),
            push: HashMap::new(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/push/:sensorid", post(push_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Hand one payload to the sensor's push worker.
async fn push_handler(
    State(state): State<Arc<AppState>>,
    Path(sensorid): Path<String>,
    body: Bytes,
) -> StatusCode {
    let Some(inlet) = state.push.get(&sensorid) else {
        return StatusCode::NOT_FOUND;
    };
    match inlet.send(RawFrame::now(body.to_vec())).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(_) => {
            debug!(sensor = %sensorid, "push worker gone, payload refused");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    version: String,
    uptime_secs: u64,
    sensors: Vec<SensorStatus>,
}

#[derive(Debug, Serialize)]
struct SensorStatus {
    sensorid: String,
    protocol: &'static str,
    shape: &'static str,
    source: String,
    #[serde(flatten)]
    worker: WorkerStatus,
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let sensors = state
        .sensors
        .iter()
        .map(|(id, entry)| SensorStatus {
            sensorid: id.clone(),
            protocol: entry.protocol,
            shape: entry.shape,
            source: entry.source.clone(),
            worker: *entry.status.borrow(),
        })
        .collect();
    Json(StatusResponse {
        version: telegate::VERSION.to_string(),
        uptime_secs: state.started.elapsed().as_secs(),
        sensors,
    })
}
