pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use murmur_api::middleware::require_auth;
use murmur_api::{AppState, AppStateInner, chats, groups, messages};
use murmur_core::ChatServices;
use murmur_gateway::auth::validate_token;
use murmur_gateway::{Gateway, GatewayConfig, handle_connection};

/// Assemble the HTTP API and the `/gateway` WebSocket route over one set of
/// core services.
pub fn build_app(services: ChatServices, gateway_config: GatewayConfig) -> Router {
    let app_state: AppState = Arc::new(AppStateInner {
        services: services.clone(),
        jwt_secret: gateway_config.jwt_secret.clone(),
    });
    let gateway = Gateway::new(services, gateway_config);

    let protected_routes = Router::new()
        .route("/chats", get(chats::list_chats))
        .route("/chats/direct", post(chats::create_direct_chat))
        .route("/chats/group", post(chats::create_group))
        .route(
            "/chats/{chat_id}",
            get(chats::get_chat)
                .patch(groups::update_info)
                .delete(groups::delete_group),
        )
        .route(
            "/chats/{chat_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route("/chats/{chat_id}/members", post(groups::add_members))
        .route("/chats/{chat_id}/members/{user_id}", delete(groups::remove_member))
        .route("/chats/{chat_id}/members/{user_id}/role", put(groups::update_member_role))
        .route("/chats/{chat_id}/leave", post(groups::leave_group))
        .route("/chats/{chat_id}/owner", post(groups::transfer_ownership))
        .route("/chats/{chat_id}/settings", put(groups::update_settings))
        .route("/chats/{chat_id}/join-link", post(groups::regenerate_join_link))
        .route("/join/{token}", post(groups::join_via_link))
        .route(
            "/messages/{message_id}",
            patch(messages::edit_message).delete(messages::delete_message),
        )
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .route("/messages/{message_id}/reads", get(messages::get_readers))
        .route("/messages/read", post(messages::mark_read_batch))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(gateway);

    Router::new()
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: Option<String>,
}

/// With `?token=` the socket is authenticated at upgrade time; without it
/// the client has to send `Identify` first.
async fn ws_upgrade(
    State(gateway): State<Gateway>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match query.token {
        Some(token) => match validate_token(&gateway.config().jwt_secret, &token) {
            Ok(claims) => Some(claims),
            Err(e) => {
                warn!("Gateway upgrade rejected: {}", e);
                return StatusCode::UNAUTHORIZED.into_response();
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| handle_connection(socket, gateway, claims))
}
