use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use murmur_core::ChatError;
use murmur_types::api::ErrorBody;

/// HTTP face of `ChatError`: a stable status and code, details only logged.
#[derive(Debug)]
pub struct ApiError(pub ChatError);

impl From<ChatError> for ApiError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::NotParticipant | ChatError::PermissionDenied => StatusCode::FORBIDDEN,
            ChatError::NotFound => StatusCode::NOT_FOUND,
            ChatError::InvalidState(_) => StatusCode::CONFLICT,
            ChatError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ChatError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self.0 {
            ChatError::Transient(e) => error!("Request failed: {:#}", e),
            other => debug!("Request rejected: {}", other),
        }

        let body = ErrorBody {
            error: self.0.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
