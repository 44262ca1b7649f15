//! HTTP surface
//!
//! Thin over the core: handlers parse requests, call into the orchestrator
//! and stores, and translate the shared error kinds to status codes. The
//! response shapes are exactly the records the pipeline produces.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Multipart, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use runbox_core::{run_id, Error, RunRecord, RunRequest, StoredFile};
use runbox_storage::{unix_now, ArtifactStore, RunStore};

use crate::auth::{require_bearer, Tenant};
use crate::orchestrator::Orchestrator;
use crate::ratelimit::RateLimiter;
use crate::stream::{Frame, Progress, StreamHub};

/// Shared service state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<ArtifactStore>,
    pub runs: Arc<RunStore>,
    pub hub: Arc<StreamHub>,
    pub limiter: Arc<RateLimiter>,
    pub tenants: Arc<HashMap<String, Tenant>>,
    pub public_base_url: String,
}

/// Transport-side wrapper mapping the shared error kinds onto status codes
/// and `{"error": <kind>}` bodies.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::Forbidden => StatusCode::FORBIDDEN,
            Error::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Error::Sandbox(_) | Error::Io(_) | Error::Serde(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.kind() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/files", post(upload_file))
        .route("/v1/runs", post(create_run))
        .route("/v1/runs/:id", get(get_run))
        .route("/v1/runs/stream", post(create_stream_run))
        .route("/v1/runs/:id/stream", get(subscribe_run))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/files/:id", get(download_file))
        .merge(protected)
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn upload_file(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    mut multipart: Multipart,
) -> ApiResult<Json<StoredFile>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let name = field
            .file_name()
            .unwrap_or("upload.bin")
            .to_string();
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| Error::Validation(format!("invalid multipart body: {e}")))?;

        let stored = state.store.store_upload(&name, &content_type, &bytes).await?;
        info!(tenant = %tenant.label, file_id = %stored.id, size = stored.size, "file uploaded");
        return Ok(Json(stored));
    }
    Err(Error::Validation("multipart field `file` missing".to_string()).into())
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    payload: String,
    #[serde(default)]
    sig: String,
}

async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let request_path = format!("/v1/files/{id}");
    state
        .store
        .signer()
        .verify(&request_path, &query.payload, &query.sig, unix_now())?;

    let file = state.store.resolve(&id).await?;
    let handle = tokio::fs::File::open(&file.path)
        .await
        .map_err(Error::from)?;
    let body = Body::from_stream(ReaderStream::new(handle));
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, file.content_type)
        .header(header::CONTENT_LENGTH, file.size)
        .body(body)
        .map_err(|e| Error::Sandbox(format!("failed to build response: {e}")))?;
    Ok(response)
}

/// Parse the run submission out of a raw JSON value so malformed bodies are
/// a 400 validation error, not a transport rejection.
fn parse_run_request(value: serde_json::Value) -> Result<RunRequest, Error> {
    serde_json::from_value(value)
        .map_err(|e| Error::Validation(format!("invalid run request: {e}")))
}

async fn create_run(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<RunRecord>> {
    state.limiter.check(&tenant).await?;
    let request = parse_run_request(body)?;
    info!(tenant = %tenant.label, language = %request.language, "run submitted");
    let record = state.orchestrator.create_run(request).await?;
    Ok(Json(record))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<RunRecord>> {
    let record = state
        .runs
        .get(&id)
        .await
        .ok_or_else(|| Error::NotFound(format!("unknown run {id}")))?;
    Ok(Json(record))
}

async fn create_stream_run(
    State(state): State<AppState>,
    Extension(tenant): Extension<Arc<Tenant>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    state.limiter.check(&tenant).await?;
    let request = parse_run_request(body)?;
    state.orchestrator.precheck(&request)?;

    let id = run_id();
    state.hub.register(&id).await;
    info!(tenant = %tenant.label, run_id = %id, language = %request.language, "streaming run admitted");

    let orchestrator = Arc::clone(&state.orchestrator);
    let hub = Arc::clone(&state.hub);
    let run_id = id.clone();
    tokio::spawn(async move {
        let progress = Progress::new(Arc::clone(&hub), run_id.clone());
        match orchestrator
            .execute(run_id.clone(), request, Some(progress))
            .await
        {
            Ok(record) => hub.finish(&run_id, Frame::Complete { record }).await,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "streaming run failed");
                hub.finish(
                    &run_id,
                    Frame::Error {
                        error: e.kind().to_string(),
                    },
                )
                .await;
            }
        }
    });

    let hint = format!(
        "{}/v1/runs/{}/stream",
        state.public_base_url.trim_end_matches('/'),
        id
    );
    Ok(Json(json!({ "id": id, "status": "starting", "hint": hint })))
}

async fn subscribe_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let frames = state.hub.subscribe(&id).await?;
    Ok(ws.on_upgrade(move |socket| pump_frames(socket, id, frames)))
}

async fn pump_frames(
    mut socket: WebSocket,
    run_id: String,
    mut frames: tokio::sync::mpsc::UnboundedReceiver<Frame>,
) {
    let connected = Frame::Connected {
        run_id: run_id.clone(),
        timestamp: Utc::now(),
    };
    if send_frame(&mut socket, &connected).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    // terminal frame delivered; close shortly after
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // subscriber went away; the run keeps going
                    None | Some(Err(_)) => break,
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_else(|_| String::from("{}"));
    socket.send(Message::Text(text)).await
}
