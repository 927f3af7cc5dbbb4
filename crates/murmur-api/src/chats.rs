use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use murmur_core::NewGroup;
use murmur_types::api::{ChatDetailsResponse, Claims, CreateDirectChatRequest, CreateGroupRequest};
use murmur_types::models::ChatId;

use crate::error::ApiError;
use crate::state::AppState;

/// Active chats of the caller with unread counts, most recent first.
pub async fn list_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let chats = state.services.groups.list_chats(claims.sub).await?;
    Ok(Json(chats))
}

/// 201 when the chat was created, 200 when it already existed.
pub async fn create_direct_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDirectChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (chat, created) = state
        .services
        .groups
        .create_direct_chat(claims.sub, req.user_id)
        .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(chat)))
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state
        .services
        .groups
        .create_group(
            claims.sub,
            NewGroup {
                title: req.title,
                description: req.description,
                member_ids: req.member_ids,
                settings: req.settings,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(chat)))
}

pub async fn get_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let (chat, participants) = state.services.groups.chat_details(chat_id, claims.sub).await?;
    Ok(Json(ChatDetailsResponse { chat, participants }))
}
