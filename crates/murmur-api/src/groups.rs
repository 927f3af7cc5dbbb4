use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use murmur_core::GroupInfo;
use murmur_types::api::{
    AddMembersRequest, AddMembersResponse, Claims, JoinLinkResponse, TransferOwnershipRequest,
    UpdateGroupInfoRequest, UpdateRoleRequest,
};
use murmur_types::models::{ChatId, GroupSettings, UserId};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn add_members(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddMembersRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let added = state
        .services
        .groups
        .add_members(chat_id, claims.sub, &req.user_ids)
        .await?;
    Ok(Json(AddMembersResponse { added }))
}

pub async fn remove_member(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(ChatId, UserId)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .groups
        .remove_member(chat_id, claims.sub, user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_group(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.services.groups.leave_group(chat_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_member_role(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(ChatId, UserId)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .groups
        .update_member_role(chat_id, claims.sub, user_id, req.role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn transfer_ownership(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<TransferOwnershipRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .services
        .groups
        .transfer_ownership(chat_id, claims.sub, req.new_owner_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_info(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateGroupInfoRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state
        .services
        .groups
        .update_info(
            chat_id,
            claims.sub,
            GroupInfo {
                title: req.title,
                description: req.description,
                avatar_url: req.avatar_url,
            },
        )
        .await?;
    Ok(Json(chat))
}

pub async fn update_settings(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
    Json(settings): Json<GroupSettings>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state
        .services
        .groups
        .update_settings(chat_id, claims.sub, settings)
        .await?;
    Ok(Json(chat))
}

pub async fn regenerate_join_link(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let join_link = state
        .services
        .groups
        .regenerate_join_link(chat_id, claims.sub)
        .await?;
    Ok(Json(JoinLinkResponse { join_link }))
}

pub async fn join_via_link(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let chat = state.services.groups.join_via_link(&token, claims.sub).await?;
    Ok(Json(chat))
}

pub async fn delete_group(
    State(state): State<AppState>,
    Path(chat_id): Path<ChatId>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    state.services.groups.delete_group(chat_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}
