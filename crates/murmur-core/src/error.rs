use thiserror::Error;

/// Outcome taxonomy for every core operation. Everything except `Transient`
/// is an expected control-flow result and is never retried.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("actor is not an active participant of the chat")]
    NotParticipant,

    #[error("role or chat policy does not allow this action")]
    PermissionDenied,

    #[error("chat, message or participant not found")]
    NotFound,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("transient failure: {0}")]
    Transient(#[from] anyhow::Error),
}

impl ChatError {
    /// Stable code shown to clients. Never carries internal detail.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::NotParticipant | ChatError::PermissionDenied => "forbidden",
            ChatError::NotFound => "not_found",
            ChatError::InvalidState(_) => "invalid_state",
            ChatError::InvalidInput(_) => "invalid_input",
            ChatError::Transient(_) => "internal",
        }
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(e: tokio::task::JoinError) -> Self {
        ChatError::Transient(anyhow::anyhow!("blocking store task failed: {}", e))
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
