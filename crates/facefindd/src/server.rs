//! HTTP API.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`    | `/health`   | Liveness and version |
//! | `GET`    | `/stats`    | Index size and model identity |
//! | `POST`   | `/search`   | Multipart `file` field or raw image body, `?limit=N` |
//! | `POST`   | `/register` | `?photos_dir=&overwrite=` and/or JSON `{photos_dir?, overwrite?}` |
//! | `DELETE` | `/faces`    | `?path=` removes one record |
//!
//! Errors are JSON: `{ "error": { "code": "...", "message": "..." } }`.
//! A query photo without exactly one face is not an error; it answers 200
//! with `success: false`.

use crate::engine::{EngineError, EngineHandle};
use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection, DefaultBodyLimit, FromRequest, Multipart, Query, Request, State,
    },
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use facefind_core::guard::{self, UploadOutcome};
use facefind_core::{
    Config, ExtractionError, FaceRepository, OverwritePolicy, QueryResult, RegistrationError,
    RegistrationReport, RepositoryError, SearchError, SearchOutcome,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: EngineHandle,
    pub repository: Arc<dyn FaceRepository>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.files.max_upload_bytes().saturating_mul(2);
    let cors = cors_layer(&state.config.server.allowed_origins);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/search", post(handle_search))
        .route("/register", post(handle_register))
        .route("/faces", delete(handle_delete))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .with_state(state)
}

/// Serve until the process receives ctrl-c.
pub async fn run(state: AppState) -> anyhow::Result<()> {
    let bind = state.config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(bind = %bind, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(parsed))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize, Debug)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Search(SearchError::InvalidLimit) => AppError::bad_request(e.to_string()),
            EngineError::Search(
                SearchError::ModelMismatch { .. }
                | SearchError::Repository(
                    RepositoryError::DimensionMismatch { .. } | RepositoryError::ModelMismatch { .. },
                ),
            ) => AppError::new(StatusCode::CONFLICT, "model_mismatch", e.to_string()),
            EngineError::Search(SearchError::Extraction(ref inner)) => match inner {
                ExtractionError::Decode(_) => {
                    AppError::new(StatusCode::UNSUPPORTED_MEDIA_TYPE, "unsupported_file_type", e.to_string())
                }
                ExtractionError::ModelUnavailable(_) => {
                    AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
                }
                ExtractionError::Inference(_) => AppError::internal(e.to_string()),
            },
            EngineError::Registration(RegistrationError::NotADirectory(_)) => {
                AppError::bad_request(e.to_string())
            }
            EngineError::ChannelClosed | EngineError::Spawn(_) => {
                AppError::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
            }
            other => {
                tracing::error!(error = %other, "request failed");
                AppError::internal("request failed; check the daemon log")
            }
        }
    }
}

/// Run `fut`, answering 408 once `limit` elapses. The engine thread still
/// finishes the job.
async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, AppError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AppError::from),
        Err(_) => Err(AppError::new(
            StatusCode::REQUEST_TIMEOUT,
            "timeout",
            format!("request exceeded {}s", limit.as_secs_f32()),
        )),
    }
}

fn query_error(rejection: QueryRejection) -> AppError {
    AppError::bad_request(rejection.body_text())
}

/// Body extraction failures keep their status; oversized bodies use the
/// upload error code.
fn upload_error(status: StatusCode, message: String) -> AppError {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::new(status, "file_too_large", message)
    } else {
        AppError::bad_request(message)
    }
}

/// The query photo and its declared content type: the `file` field of a
/// multipart form, or the whole body otherwise.
async fn read_upload(state: &AppState, request: Request) -> Result<(String, Bytes), AppError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !content_type.starts_with("multipart/form-data") {
        let body = Bytes::from_request(request, state)
            .await
            .map_err(|e| upload_error(e.status(), e.body_text()))?;
        return Ok((content_type, body));
    }

    let mut form = Multipart::from_request(request, state)
        .await
        .map_err(|e| upload_error(e.status(), e.body_text()))?;
    while let Some(field) = form
        .next_field()
        .await
        .map_err(|e| upload_error(e.status(), e.body_text()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let declared = field.content_type().unwrap_or_default().to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| upload_error(e.status(), e.body_text()))?;
        return Ok((declared, bytes));
    }
    Err(AppError::bad_request("multipart form has no `file` field"))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /stats ============

#[derive(Serialize, Deserialize, Debug)]
pub struct StatsResponse {
    pub faces: usize,
    pub embedding_model: Option<String>,
    pub detector_backend: Option<String>,
    pub dimension: Option<usize>,
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, AppError> {
    let repo = state.repository.clone();
    let stats = tokio::task::spawn_blocking(move || -> Result<StatsResponse, AppError> {
        let faces = repo.count().map_err(|e| AppError::internal(e.to_string()))?;
        let provenance = repo.provenance().map_err(|e| AppError::internal(e.to_string()))?;
        Ok(StatsResponse {
            faces,
            embedding_model: provenance.as_ref().map(|p| p.embedding_model.clone()),
            detector_backend: provenance.as_ref().map(|p| p.detector_backend.clone()),
            dimension: provenance.map(|p| p.dimension),
        })
    })
    .await
    .map_err(|e| AppError::internal(e.to_string()))??;
    Ok(Json(stats))
}

// ============ POST /search ============

#[derive(Deserialize, Debug, Default)]
pub struct SearchParams {
    pub limit: Option<usize>,
}

#[derive(Serialize, Debug)]
pub struct SearchResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<QueryResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

async fn handle_search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
    request: Request,
) -> Result<Json<SearchResponse>, AppError> {
    let Query(params) = params.map_err(query_error)?;
    let matching = &state.config.matching;
    let limit = params.limit.unwrap_or(matching.default_limit);
    if limit == 0 || limit > matching.max_limit {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {}",
            matching.max_limit
        )));
    }

    let (declared, body) = read_upload(&state, request).await?;
    let files = &state.config.files;
    match guard::validate_upload(&body, &declared, files.max_upload_bytes(), &files.allowed_formats) {
        UploadOutcome::Accepted(format) => {
            tracing::debug!(%format, bytes = body.len(), limit, "search upload accepted");
        }
        UploadOutcome::TooLarge { size, max } => {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "file_too_large",
                format!("upload is {size} bytes, max {max}"),
            ));
        }
        UploadOutcome::UnsupportedType { declared } => {
            return Err(AppError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "unsupported_file_type",
                format!("content is not an accepted image (declared {declared:?})"),
            ));
        }
    }

    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let outcome = with_timeout(timeout, state.engine.search(body.to_vec(), limit)).await?;
    Ok(Json(match outcome {
        SearchOutcome::Matches(matches) => SearchResponse {
            success: true,
            matches: Some(matches),
            error: None,
        },
        SearchOutcome::Rejected(failure) => SearchResponse {
            success: false,
            matches: None,
            error: Some(ErrorDetail {
                code: failure.code().to_string(),
                message: failure.to_string(),
            }),
        },
    }))
}

// ============ POST /register ============

#[derive(Deserialize, Debug, Default)]
pub struct RegisterRequest {
    pub photos_dir: Option<PathBuf>,
    pub overwrite: Option<OverwritePolicy>,
}

/// Parameters come from the query string, a JSON body, or both; body
/// fields win.
async fn handle_register(
    State(state): State<AppState>,
    query: Result<Query<RegisterRequest>, QueryRejection>,
    body: Bytes,
) -> Result<Json<RegistrationReport>, AppError> {
    let Query(query) = query.map_err(query_error)?;
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        query
    } else {
        let json: RegisterRequest = serde_json::from_slice(&body)
            .map_err(|e| AppError::bad_request(format!("invalid JSON body: {e}")))?;
        RegisterRequest {
            photos_dir: json.photos_dir.or(query.photos_dir),
            overwrite: json.overwrite.or(query.overwrite),
        }
    };

    let storage = &state.config.storage;
    let directory = request
        .photos_dir
        .unwrap_or_else(|| storage.event_photos.clone());
    if !guard::validate_path(&directory, &storage.allowed_directories) {
        return Err(AppError::new(
            StatusCode::FORBIDDEN,
            "path_not_allowed",
            "access to directory not allowed",
        ));
    }
    let policy = request.overwrite.unwrap_or(storage.overwrite);

    let timeout = Duration::from_secs(state.config.server.register_timeout_secs);
    let report = with_timeout(timeout, state.engine.register(directory, policy)).await?;
    Ok(Json(report))
}

// ============ DELETE /faces ============

#[derive(Deserialize, Debug)]
pub struct DeleteParams {
    pub path: String,
}

#[derive(Serialize, Debug)]
pub struct DeleteResponse {
    pub deleted: bool,
}

async fn handle_delete(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<DeleteResponse>, AppError> {
    if params.path.trim().is_empty() {
        return Err(AppError::bad_request("path must not be empty"));
    }
    let repo = state.repository.clone();
    let deleted = tokio::task::spawn_blocking(move || repo.delete(&params.path))
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
        .map_err(|e| AppError::internal(e.to_string()))?;
    Ok(Json(DeleteResponse { deleted }))
}
