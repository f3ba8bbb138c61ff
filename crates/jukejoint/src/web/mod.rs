//! HTTP and WebSocket surface.

pub mod device_ws;
pub mod house;
pub mod observer_ws;
pub mod reqlog;

use crate::auth::AuthAdapter;
use crate::bridge::ObserverBridge;
use crate::bus::EventBus;
use crate::media::MediaStore;
use crate::pipeline::GenerationPipeline;
use crate::room::RoomManager;
use crate::scheduler::Schedulers;
use crate::store::{Store, StoreError};
use crate::sync::RoomEventSync;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::ReaderStream;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub manager: Arc<RoomManager>,
    pub sync: RoomEventSync,
    pub bridge: ObserverBridge,
    pub schedulers: Schedulers,
    pub pipeline: GenerationPipeline,
    pub media: Arc<MediaStore>,
    pub auth: Arc<dyn AuthAdapter>,
    pub bus: EventBus,
    pub reqlog: Arc<reqlog::RequestLog>,
    pub started_at: Instant,
}

/// Error envelope for every JSON endpoint.
pub enum ApiError {
    Unauthorized,
    NotFound(String),
    BadRequest(String),
    UnprocessableEntity(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::UnprocessableEntity(m) => (StatusCode::UNPROCESSABLE_ENTITY, m),
            ApiError::Internal(e) => {
                warn!(error = %format!("{e:#}"), "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::InvalidTransition { .. } => ApiError::UnprocessableEntity(err.to_string()),
            StoreError::Db(_) => ApiError::Internal(err.into()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

pub fn router(state: AppState, allowed_origins: &[String]) -> Router {
    let cors = cors_layer(allowed_origins);

    Router::new()
        .route("/health", get(health))
        .route("/api/worker/status", get(worker_status))
        .route("/now-playing", get(house::now_playing))
        .route("/house/commands", post(house::commands))
        .route("/house/sessions", get(house::sessions))
        .route("/media/{file}", get(media_file))
        .route("/ws/room", any(device_ws::handler))
        .route("/ws/events", any(observer_ws::handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            reqlog::track,
        ))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %o, "invalid allowed origin, ignored");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static("x-user-id")])
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queues = state.schedulers.status();
    let (pending, active): (usize, usize) = queues
        .iter()
        .fold((0, 0), |(p, a), q| (p + q.pending.len(), a + q.active.len()));

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "rooms": state.manager.rooms().len(),
        "observers": state.bridge.observer_count(),
        "jobs": {
            "pending": pending,
            "active": active,
        },
    }))
}

async fn worker_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "endpoints": state.schedulers.status(),
        "pipeline": {
            "in_flight": state.pipeline.in_flight(),
        },
        "bus": {
            "next_sequence": state.bus.next_sequence(),
        },
    }))
}

async fn media_file(State(state): State<AppState>, Path(file): Path<String>) -> Response {
    let Some(path) = state.media.resolve(&file) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    };

    match tokio::fs::File::open(&path).await {
        Ok(file) => {
            let stream = ReaderStream::new(file);
            let body = Body::from_stream(stream);
            ([(header::CONTENT_TYPE, mime)], body).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
