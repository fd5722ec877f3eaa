//! Axum Handlers for the REST API
//!
//! Question extraction from study material and read-only views of live sessions.
//! It uses `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, ExtractQuestionsPayload, ExtractedQuestions, SessionStatus},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Splits an optional `data:<mime>;base64,` prefix off an encoded image.
fn split_data_url(encoded: &str) -> (Option<&str>, &str) {
    match encoded.strip_prefix("data:").and_then(|rest| rest.split_once(',')) {
        Some((meta, data)) => (meta.strip_suffix(";base64"), data),
        None => (None, encoded),
    }
}

/// Extract the numbered questions printed on a page of study material.
#[utoipa::path(
    post,
    path = "/questions/extract",
    request_body = ExtractQuestionsPayload,
    responses(
        (status = 200, description = "Questions found on the page", body = ExtractedQuestions),
        (status = 400, description = "Bad request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn extract_questions(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExtractQuestionsPayload>,
) -> Result<Json<ExtractedQuestions>, ApiError> {
    let (url_mime, data) = split_data_url(payload.image_base64.trim());
    let image = STANDARD
        .decode(data)
        .map_err(|e| ApiError::BadRequest(format!("image_base64 is not valid base64: {e}")))?;
    if image.is_empty() {
        return Err(ApiError::BadRequest("image_base64 is empty".to_string()));
    }
    let mime_type = payload
        .mime_type
        .as_deref()
        .or(url_mime)
        .unwrap_or("image/png");

    let questions = state.gateway.extract_questions(&image, mime_type).await?;
    info!(count = questions.len(), "Extracted questions from material");
    Ok(Json(questions.into()))
}

/// List all live study sessions.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "List of live sessions", body = [SessionStatus]),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SessionStatus>>, ApiError> {
    let mut statuses = Vec::new();
    for (id, session) in state.sessions.list().await {
        // A session that ended between listing and asking is simply skipped.
        if let Ok(snapshot) = session.handle.snapshot().await {
            statuses.push(SessionStatus::from_snapshot(id, session.started_at, snapshot));
        }
    }
    Ok(Json(statuses))
}

/// Get a live study session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session status", body = SessionStatus),
        (status = 404, description = "Session not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let not_found = || ApiError::NotFound(format!("Session with id '{}' not found", id));
    let session = state.sessions.get(&id).await.ok_or_else(not_found)?;
    let snapshot = session.handle.snapshot().await.map_err(|_| not_found())?;

    Ok((
        StatusCode::OK,
        Json(SessionStatus::from_snapshot(id, session.started_at, snapshot)),
    ))
}
