use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use tracing::{debug, error};

use murmur_gateway::auth::validate_token;

use crate::state::AppState;

/// Validate the bearer token, refresh the cached identity, and expose the
/// claims to handlers as an `Extension`.
pub async fn require_auth(
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = validate_token(&state.jwt_secret, bearer.token()).map_err(|e| {
        debug!("Rejected bearer token: {}", e);
        StatusCode::UNAUTHORIZED
    })?;

    let (id, username) = (claims.sub, claims.username.clone());
    state
        .services
        .store
        .call(move |db| db.upsert_user(id, &username, None))
        .await
        .map_err(|e| {
            error!("Failed to cache identity of user {}: {}", id, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}
