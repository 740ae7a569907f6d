//! HTTP control API for the delivery engine.
//!
//! The rendering layer and the upstream transcript feed talk to the engine
//! through these routes. Runs on port 8768 (configurable) using axum.

use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{NarrationMode, NarrationSettings};
use crate::engine::{EngineHandle, TranscriptUpdate};
use crate::history::{generate_report, list_dates};
use crate::merge::{group_for_render, RenderUnit};
use crate::pacing::ProcessorState;
use crate::playback::{HaltOutcome, PlaybackState};

#[derive(Clone)]
pub struct ApiState {
    pub engine: EngineHandle,
    pub history_dir: Option<PathBuf>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct NarrationRequest {
    enabled: bool,
    #[serde(default)]
    mode: Option<NarrationMode>,
}

#[derive(Serialize)]
struct StatusResponse {
    thread_id: Option<String>,
    processor: ProcessorState,
    playback: PlaybackState,
    narration: NarrationSettings,
    audio_unlocked: bool,
    visible: usize,
    queued: usize,
    should_show_loading: bool,
    watchdog_corrections: u64,
}

#[derive(Serialize)]
struct TranscriptView<'a> {
    should_show_loading: bool,
    units: Vec<RenderUnit<'a>>,
}

#[derive(Serialize)]
struct HistoryDates {
    dates: Vec<String>,
}

#[derive(Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/transcript", get(handle_get_transcript).post(handle_post_transcript))
        .route("/unlock", post(handle_unlock))
        .route("/speech/stop", post(handle_stop))
        .route("/narration", post(handle_narration))
        .route("/history", get(handle_history_dates))
        .route("/history/{date}", get(handle_history))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return;
        }
    };
    info!("Control API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let s = state.engine.snapshot();
    Json(StatusResponse {
        thread_id: s.thread_id,
        processor: s.processor,
        playback: s.playback,
        narration: s.narration,
        audio_unlocked: s.audio_unlocked,
        visible: s.visible.len(),
        queued: s.queue_len,
        should_show_loading: s.should_show_loading,
        watchdog_corrections: s.watchdog_corrections,
    })
}

async fn handle_get_transcript(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let snapshot = state.engine.snapshot();
    let view = TranscriptView {
        should_show_loading: snapshot.should_show_loading,
        units: group_for_render(&snapshot.visible),
    };
    Json(serde_json::to_value(&view).unwrap_or_default())
}

async fn handle_post_transcript(
    State(state): State<ApiState>,
    Json(update): Json<TranscriptUpdate>,
) -> (StatusCode, Json<SimpleResponse>) {
    let count = update.messages.len();
    match state.engine.update_transcript(update) {
        Ok(()) => {
            info!("HTTP /transcript: {count} message(s)");
            (StatusCode::ACCEPTED, Json(SimpleResponse::ok("accepted")))
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SimpleResponse::err(e.to_string())),
        ),
    }
}

async fn handle_unlock(State(state): State<ApiState>) -> Json<SimpleResponse> {
    if state.engine.unlock_audio() {
        Json(SimpleResponse::ok("unlocked"))
    } else {
        Json(SimpleResponse::ok("already_unlocked"))
    }
}

async fn handle_stop(State(state): State<ApiState>) -> Json<SimpleResponse> {
    let status = match state.engine.fade_out_and_stop() {
        HaltOutcome::Halted => "stopping",
        HaltOutcome::NothingPlaying => "idle",
        HaltOutcome::Skipped => "locked",
    };
    Json(SimpleResponse::ok(status))
}

async fn handle_narration(
    State(state): State<ApiState>,
    Json(req): Json<NarrationRequest>,
) -> (StatusCode, Json<SimpleResponse>) {
    let current = state.engine.snapshot().narration;
    let settings = NarrationSettings {
        enabled: req.enabled,
        mode: req.mode.unwrap_or(current.mode),
    };
    match state.engine.set_narration(settings) {
        Ok(()) => (StatusCode::OK, Json(SimpleResponse::ok("ok"))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SimpleResponse::err(e.to_string())),
        ),
    }
}

async fn handle_history_dates(
    State(state): State<ApiState>,
) -> Result<Json<HistoryDates>, (StatusCode, String)> {
    match &state.history_dir {
        Some(dir) => Ok(Json(HistoryDates {
            dates: list_dates(dir),
        })),
        None => Err((StatusCode::NOT_FOUND, "Narration history is disabled.".into())),
    }
}

async fn handle_history(
    State(state): State<ApiState>,
    Path(date): Path<String>,
) -> (StatusCode, String) {
    if date.is_empty() || !date.chars().all(|c| c.is_ascii_digit() || c == '-') {
        return (StatusCode::BAD_REQUEST, format!("Invalid date: {date}"));
    }
    match &state.history_dir {
        Some(dir) => (StatusCode::OK, generate_report(dir, &date)),
        None => (StatusCode::NOT_FOUND, "Narration history is disabled.".into()),
    }
}
