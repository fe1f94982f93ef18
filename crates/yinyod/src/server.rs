//! HTTP API server for the orchestrator.
//!
//! All per-run routes sit behind two middleware layers: traffic metering
//! (outer) and the created-check plus bearer-token authentication (inner).
//! Handlers translate typed command errors to HTTP exactly once, here.

use crate::app::{App, CommandError};
use crate::metered;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use yinyo_core::{DefaultAndMax, Event, Hello, StartRunOptions};

/// Server-wide settings: quota bounds and the image runs execute in.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub default_max_run_time: i64,
    pub max_run_time: i64,
    pub default_memory: i64,
    pub max_memory: i64,
    pub runner_image: String,
    pub version: String,
}

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub app: App,
    pub config: ServerConfig,
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Build an error response with the canonical JSON error body.
fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::to_string(&ErrorResponse {
        error: message.to_string(),
    })
    .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body,
    )
        .into_response()
}

impl IntoResponse for CommandError {
    fn into_response(self) -> Response {
        match &self {
            Self::NotFound => error_response(StatusCode::NOT_FOUND, &self.to_string()),
            Self::NotAllowed(_) => error_response(StatusCode::UNAUTHORIZED, &self.to_string()),
            Self::ArchiveFormat(_) => error_response(StatusCode::BAD_REQUEST, &self.to_string()),
            Self::AppNotAvailable => error_response(StatusCode::BAD_REQUEST, &self.to_string()),
            Self::AlreadyStarted => error_response(StatusCode::CONFLICT, &self.to_string()),
            Self::Internal(detail) => {
                error!(error = %detail, "internal error");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    let per_run = Router::new()
        .route("/runs/{id}/app", get(get_app).put(put_app))
        .route("/runs/{id}/cache", get(get_cache).put(put_cache))
        .route("/runs/{id}/output", get(get_output).put(put_output))
        .route("/runs/{id}/exit-data", get(get_exit_data))
        .route("/runs/{id}/start", post(start_run))
        .route("/runs/{id}/events", get(get_events).post(create_event))
        .route("/runs/{id}", delete(delete_run))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            authenticate,
        ));

    // Requests from the public internet come in through the load
    // balancer, which sets X-Forwarded-For; everything else is
    // in-cluster traffic.
    let trace = TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<Body>| {
        let source = if request.headers().contains_key("x-forwarded-for") {
            "external"
        } else {
            "internal"
        };
        tracing::info_span!(
            "request",
            source,
            method = %request.method(),
            uri = %request.uri(),
        )
    });

    Router::new()
        .route("/", get(hello))
        .route("/runs", post(create_run))
        .merge(per_run)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            metered::record_traffic,
        ))
        .layer(trace)
        .with_state(state)
}

/// Start the HTTP server. Blocks until the listener fails.
pub async fn start_server(state: Arc<AppState>, addr: SocketAddr) -> eyre::Result<()> {
    let router = create_router(state);
    info!("Yinyo is ready and waiting on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// Created-check and bearer-token authentication for per-run routes.
///
/// Order matters: an unknown run is a 404 before the token is looked at,
/// a missing or mangled header is a 403, and only then is the token
/// compared (in constant time) against the stored one.
async fn authenticate(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    match state.app.is_run_created(&id).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(StatusCode::NOT_FOUND, &format!("run {id}: not found"));
        }
        Err(err) => return err.into_response(),
    }

    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(supplied) = supplied else {
        return error_response(
            StatusCode::FORBIDDEN,
            "Expected Authorization header with bearer token",
        );
    };

    let expected = match state.app.get_token_cached(&id).await {
        Ok(token) => token,
        Err(err) => {
            error!(run_id = %id, error = %err, "failed to load run token");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error");
        }
    };

    if supplied.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        warn!(run_id = %id, "incorrect run token");
        return error_response(StatusCode::FORBIDDEN, "Forbidden");
    }

    next.run(request).await
}

// --- Request/query types ---

#[derive(Debug, Deserialize, Default)]
struct CreateRunQuery {
    #[serde(default)]
    name_prefix: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GetEventsQuery {
    #[serde(default)]
    last_id: Option<String>,
}

// --- Handlers ---

/// GET / - anonymous greeting with the server's limits.
async fn hello(State(state): State<Arc<AppState>>) -> Json<Hello> {
    let config = &state.config;
    Json(Hello {
        message: "Hello from Yinyo!".to_string(),
        max_run_time: DefaultAndMax {
            default: config.default_max_run_time,
            max: config.max_run_time,
        },
        memory: DefaultAndMax {
            default: config.default_memory,
            max: config.max_memory,
        },
        version: config.version.clone(),
        runner_image: config.runner_image.clone(),
    })
}

/// POST /runs - allocate a run id and token.
async fn create_run(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CreateRunQuery>,
) -> Result<Response, CommandError> {
    let created = state
        .app
        .create_run(
            query.name_prefix.as_deref().unwrap_or(""),
            query.api_key.as_deref(),
        )
        .await?;
    info!(run_id = %created.run_name, "created run");
    Ok(Json(created).into_response())
}

fn blob_response(stream: crate::blobstore::ByteStream, content_type: &str) -> Response {
    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(stream),
    )
        .into_response()
}

/// GET /runs/{id}/app - download the scraper source archive.
async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, CommandError> {
    let stream = state.app.get_app(&id).await?;
    Ok(blob_response(stream, "application/gzip"))
}

/// PUT /runs/{id}/app - upload the scraper source archive.
async fn put_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CommandError> {
    state.app.put_app(&id, body).await?;
    Ok(StatusCode::OK)
}

/// GET /runs/{id}/cache - download the build cache.
async fn get_cache(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, CommandError> {
    let stream = state.app.get_cache(&id).await?;
    Ok(blob_response(stream, "application/gzip"))
}

/// PUT /runs/{id}/cache - upload the build cache.
async fn put_cache(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CommandError> {
    state.app.put_cache(&id, body).await?;
    Ok(StatusCode::OK)
}

/// GET /runs/{id}/output - download the scraper output.
async fn get_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, CommandError> {
    let stream = state.app.get_output(&id).await?;
    Ok(blob_response(stream, "application/octet-stream"))
}

/// PUT /runs/{id}/output - upload the scraper output.
async fn put_output(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, CommandError> {
    state.app.put_output(&id, body).await?;
    Ok(StatusCode::OK)
}

/// GET /runs/{id}/exit-data - aggregated exit codes and usage.
async fn get_exit_data(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, CommandError> {
    let exit_data = state.app.get_exit_data(&id).await?;
    Ok(Json(exit_data).into_response())
}

/// POST /runs/{id}/start - clamp quotas and dispatch the container job.
async fn start_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, Response> {
    let mut options: StartRunOptions = serde_json::from_slice(&body).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "JSON in body not correctly formatted",
        )
    })?;

    let config = &state.config;
    if options.max_run_time == 0 {
        options.max_run_time = config.default_max_run_time;
    } else if options.max_run_time > config.max_run_time {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "max_run_time should not be larger than {}",
                config.max_run_time
            ),
        ));
    }
    if options.memory == 0 {
        options.memory = config.default_memory;
    } else if options.memory > config.max_memory {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("memory should not be larger than {}", config.max_memory),
        ));
    }

    state
        .app
        .start_run(&id, &config.runner_image, &options)
        .await
        .map_err(IntoResponse::into_response)?;
    info!(run_id = %id, "started run");
    Ok(StatusCode::OK)
}

/// GET /runs/{id}/events - tail the run's event stream as line-delimited
/// JSON, flushing each event as it is produced, until the `last` event.
async fn get_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<GetEventsQuery>,
) -> Response {
    let mut last_id = query.last_id.unwrap_or_default();
    if last_id.is_empty() {
        last_id = "0".to_string();
    }

    let (tx, rx) = mpsc::channel::<Result<String, std::io::Error>>(16);
    tokio::spawn(async move {
        loop {
            let event = match state.app.get_event(&id, &last_id).await {
                Ok(event) => event,
                Err(err) => {
                    warn!(run_id = %id, error = %err, "event tail ended");
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    return;
                }
            };
            last_id.clone_from(&event.id);
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(err) => {
                    let _ = tx.send(Err(std::io::Error::other(err.to_string()))).await;
                    return;
                }
            };
            line.push('\n');
            // A failed send means the reader hung up; stop tailing.
            if tx.send(Ok(line)).await.is_err() {
                return;
            }
            if event.is_last() {
                return;
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "application/ld+json")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// POST /runs/{id}/events - append an event; the response echoes it with
/// the stream-assigned id.
async fn create_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Response, Response> {
    let event: Event = serde_json::from_slice(&body).map_err(|_| {
        error_response(
            StatusCode::BAD_REQUEST,
            "JSON in body not correctly formatted",
        )
    })?;
    let stamped = state
        .app
        .create_event(&id, event)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(stamped).into_response())
}

/// DELETE /runs/{id} - remove the job, artifacts, events and metadata.
async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, CommandError> {
    state.app.delete_run(&id).await?;
    info!(run_id = %id, "deleted run");
    Ok(StatusCode::OK)
}
