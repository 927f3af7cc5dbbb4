use std::sync::Arc;

use murmur_db::Database;
use murmur_types::models::{Chat, ChatId, Participant, UserId};

use crate::error::{ChatError, ChatResult};

/// Async handle on the membership store. Every call runs on the blocking
/// pool so SQLite never stalls the runtime.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn call<F, T>(&self, f: F) -> ChatResult<T>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let out = tokio::task::spawn_blocking(move || f(&db)).await??;
        Ok(out)
    }

    /// The chat plus the actor's participant row, if any.
    pub async fn membership(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> ChatResult<(Chat, Option<Participant>)> {
        let (chat, participant) = self
            .call(move |db| Ok((db.get_chat(chat_id)?, db.get_participant(chat_id, user_id)?)))
            .await?;
        let chat = chat.ok_or(ChatError::NotFound)?;
        Ok((chat, participant))
    }

    pub async fn active_ids(&self, chat_id: ChatId) -> ChatResult<Vec<UserId>> {
        self.call(move |db| db.active_participant_ids(chat_id)).await
    }
}
