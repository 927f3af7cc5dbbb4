use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;

use murmur_types::api::{
    Claims, EditMessageRequest, MarkReadBatchRequest, MarkReadResponse, SendMessageRequest,
};
use murmur_types::models::{ChatId, MessageId};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Cursor: only messages with a smaller id are returned.
    pub before: Option<MessageId>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .services
        .pipeline
        .history(chat_id, claims.sub, query.before, query.limit)
        .await?;
    Ok(Json(messages))
}

/// HTTP sends have no gateway connection to confirm on; the response body
/// already carries the assigned id.
pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .services
        .pipeline
        .submit(chat_id, claims.sub, &req.content, req.correlation_id, None)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .services
        .pipeline
        .edit(message_id, &req.content, claims.sub)
        .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state.services.pipeline.delete(message_id, claims.sub).await?;
    Ok(Json(message))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let marked = state.services.pipeline.mark_read(message_id, claims.sub).await?;
    let marked = if marked { vec![message_id] } else { vec![] };
    Ok(Json(MarkReadResponse { marked }))
}

pub async fn mark_read_batch(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadBatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let marked = state
        .services
        .pipeline
        .mark_many_read(&req.message_ids, claims.sub)
        .await?;
    Ok(Json(MarkReadResponse { marked }))
}

pub async fn get_readers(
    State(state): State<AppState>,
    Path(message_id): Path<MessageId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let readers = state.services.pipeline.readers(message_id, claims.sub).await?;
    Ok(Json(readers))
}
