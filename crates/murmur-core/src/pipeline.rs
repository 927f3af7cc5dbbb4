use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use murmur_db::ReadOutcome;
use murmur_types::events::GatewayEvent;
use murmur_types::models::{
    Chat, ChatId, ConnectionId, Message, MessageId, ReadReceipt, UserId,
};

use crate::error::{ChatError, ChatResult};
use crate::notify::{Notifier, PushNotification};
use crate::permissions::{self, Action};
use crate::registry::ConnectionRegistry;
use crate::store::Store;

const PUSH_BODY_CHARS: usize = 100;
const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 200;
const MAX_READ_BATCH: usize = 500;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_message_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_message_len: 4000,
        }
    }
}

/// Fan-out report for one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Live connections the event was queued on.
    pub delivered: usize,
    /// Offline participants that got a push request.
    pub pushed: usize,
}

/// Validates, persists and fans out messages; owns the edit, delete and
/// read-receipt transitions.
#[derive(Clone)]
pub struct MessagePipeline {
    store: Store,
    registry: ConnectionRegistry,
    notifier: Arc<dyn Notifier>,
    config: PipelineConfig,
}

impl MessagePipeline {
    pub fn new(
        store: Store,
        registry: ConnectionRegistry,
        notifier: Arc<dyn Notifier>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            config,
        }
    }

    /// Persist a message from an active participant. Does not fan out.
    pub async fn send(&self, chat_id: ChatId, sender_id: UserId, content: &str) -> ChatResult<Message> {
        let content = self.validate_content(content)?;

        let (chat, participant) = self.store.membership(chat_id, sender_id).await?;
        permissions::authorize(&chat, participant.as_ref(), Action::SendMessage)?;

        let now = Utc::now();
        let message = self
            .store
            .call(move |db| db.insert_message(chat_id, sender_id, &content, now))
            .await?
            .ok_or(ChatError::NotFound)?;

        debug!("User {} sent message {} to chat {}", sender_id, message.id, chat_id);
        Ok(message)
    }

    /// Entry point for clients: persist, confirm the correlation id to the
    /// originating connection only, then fan out to everyone.
    pub async fn submit(
        &self,
        chat_id: ChatId,
        sender_id: UserId,
        content: &str,
        correlation_id: Option<String>,
        origin: Option<ConnectionId>,
    ) -> ChatResult<Message> {
        let message = self.send(chat_id, sender_id, content).await?;

        if let (Some(correlation_id), Some(origin)) = (correlation_id, origin) {
            self.registry
                .send_to_connection(
                    origin,
                    GatewayEvent::MessageCorrelationConfirmation {
                        correlation_id,
                        message_id: message.id,
                    },
                )
                .await;
        }

        // The message is committed; a fan-out failure must not turn into a
        // failed send.
        if let Err(e) = self.broadcast(&message).await {
            warn!("Fan-out of message {} failed: {}", message.id, e);
        }

        Ok(message)
    }

    /// Push `NewMessage` to every live connection of every active
    /// participant, and one push request per offline participant other than
    /// the sender.
    pub async fn broadcast(&self, message: &Message) -> ChatResult<Delivery> {
        let chat_id = message.chat_id;
        let (chat, recipients) = self
            .store
            .call(move |db| Ok((db.get_chat(chat_id)?, db.active_participant_ids(chat_id)?)))
            .await?;
        let chat = chat.ok_or(ChatError::NotFound)?;

        let fan = self
            .registry
            .fan_out(
                &recipients,
                &GatewayEvent::NewMessage {
                    message: message.clone(),
                },
            )
            .await;

        let mut pushed = 0;
        for user_id in fan.offline.iter().copied().filter(|u| *u != message.sender_id) {
            self.notifier.send_push(push_for(&chat, message, user_id));
            pushed += 1;
        }

        debug!(
            "Message {} fanned out to {} connections, {} push requests",
            message.id, fan.delivered, pushed
        );
        Ok(Delivery {
            delivered: fan.delivered,
            pushed,
        })
    }

    /// Mark one message read. Returns true only for the first mark by this
    /// reader; the sender's live connections are told about it then.
    pub async fn mark_read(&self, message_id: MessageId, reader_id: UserId) -> ChatResult<bool> {
        let now = Utc::now();
        let outcome = self
            .store
            .call(move |db| db.mark_read(message_id, reader_id, now))
            .await?;

        match outcome {
            ReadOutcome::Marked(receipt) => {
                self.notify_read(&receipt).await;
                Ok(true)
            }
            ReadOutcome::MissingMessage => Err(ChatError::NotFound),
            ReadOutcome::AlreadyRead | ReadOutcome::OwnMessage | ReadOutcome::NotParticipant => {
                debug!("Read of message {} by {} was a no-op", message_id, reader_id);
                Ok(false)
            }
        }
    }

    /// Batched `mark_read` in one store round trip. Invalid ids are skipped;
    /// the ids actually marked are returned.
    pub async fn mark_many_read(&self, message_ids: &[MessageId], reader_id: UserId) -> ChatResult<Vec<MessageId>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }
        if message_ids.len() > MAX_READ_BATCH {
            return Err(ChatError::InvalidInput("too many message ids"));
        }

        let ids = message_ids.to_vec();
        let now = Utc::now();
        let receipts = self
            .store
            .call(move |db| db.mark_read_batch(&ids, reader_id, now))
            .await?;

        for receipt in &receipts {
            self.notify_read(receipt).await;
        }
        Ok(receipts.iter().map(|r| r.message_id).collect())
    }

    /// Only the sender may edit, and only while the message is not deleted.
    pub async fn edit(&self, message_id: MessageId, new_content: &str, editor_id: UserId) -> ChatResult<Message> {
        let content = self.validate_content(new_content)?;

        let existing = self
            .store
            .call(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound)?;
        if existing.sender_id != editor_id {
            return Err(ChatError::PermissionDenied);
        }
        if existing.is_deleted {
            return Err(ChatError::InvalidState("message is deleted"));
        }

        let now = Utc::now();
        let updated = self
            .store
            .call(move |db| db.edit_message(message_id, &content, now))
            .await?
            // lost a race with a delete
            .ok_or(ChatError::InvalidState("message is deleted"))?;

        self.broadcast_update(&updated).await;
        Ok(updated)
    }

    /// The sender may delete; in groups the Owner may delete anyone's message.
    pub async fn delete(&self, message_id: MessageId, deleter_id: UserId) -> ChatResult<Message> {
        let existing = self
            .store
            .call(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound)?;
        if existing.is_deleted {
            return Err(ChatError::InvalidState("message is already deleted"));
        }

        if existing.sender_id != deleter_id {
            let (chat, participant) = self.store.membership(existing.chat_id, deleter_id).await?;
            if !permissions::can_delete_message(&chat, participant.as_ref(), deleter_id, &existing) {
                return Err(ChatError::PermissionDenied);
            }
            info!(
                "Owner {} deleted message {} of user {} in chat {}",
                deleter_id, message_id, existing.sender_id, chat.id
            );
        }

        let now = Utc::now();
        let deleted = self
            .store
            .call(move |db| db.tombstone_message(message_id, now))
            .await?
            .ok_or(ChatError::InvalidState("message is already deleted"))?;

        self.broadcast_update(&deleted).await;
        Ok(deleted)
    }

    /// Relay a typing indicator to the other participants.
    pub async fn set_typing(&self, chat_id: ChatId, user_id: UserId, is_typing: bool) -> ChatResult<()> {
        let (_, participant) = self.store.membership(chat_id, user_id).await?;
        if !participant.is_some_and(|p| p.is_active) {
            return Err(ChatError::NotParticipant);
        }

        let others: Vec<UserId> = self
            .store
            .active_ids(chat_id)
            .await?
            .into_iter()
            .filter(|u| *u != user_id)
            .collect();

        self.registry
            .fan_out(
                &others,
                &GatewayEvent::UserTyping {
                    chat_id,
                    user_id,
                    is_typing,
                },
            )
            .await;
        Ok(())
    }

    /// Newest-first page of a chat, for active participants.
    pub async fn history(
        &self,
        chat_id: ChatId,
        viewer_id: UserId,
        before: Option<MessageId>,
        limit: Option<u32>,
    ) -> ChatResult<Vec<Message>> {
        let (_, participant) = self.store.membership(chat_id, viewer_id).await?;
        if !participant.is_some_and(|p| p.is_active) {
            return Err(ChatError::NotParticipant);
        }

        let limit = limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT);
        self.store
            .call(move |db| db.list_messages(chat_id, before, limit))
            .await
    }

    /// Read receipts of a message, for active participants of its chat.
    pub async fn readers(&self, message_id: MessageId, viewer_id: UserId) -> ChatResult<Vec<ReadReceipt>> {
        let message = self
            .store
            .call(move |db| db.get_message(message_id))
            .await?
            .ok_or(ChatError::NotFound)?;

        let (_, participant) = self.store.membership(message.chat_id, viewer_id).await?;
        if !participant.is_some_and(|p| p.is_active) {
            return Err(ChatError::NotParticipant);
        }

        self.store.call(move |db| db.readers_of(message_id)).await
    }

    async fn notify_read(&self, receipt: &ReadReceipt) {
        let delivered = self
            .registry
            .send_to_user(
                receipt.sender_id,
                &GatewayEvent::MessageRead {
                    chat_id: receipt.chat_id,
                    message_id: receipt.message_id,
                    reader_id: receipt.reader_id,
                    read_at: receipt.read_at,
                },
            )
            .await;
        debug!(
            "Read of message {} by {} sent to {} connections of {}",
            receipt.message_id, receipt.reader_id, delivered, receipt.sender_id
        );
    }

    /// `MessageUpdated` to the same audience as a new message, no pushes.
    async fn broadcast_update(&self, message: &Message) {
        let recipients = match self.store.active_ids(message.chat_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not resolve audience for message {}: {}", message.id, e);
                return;
            }
        };
        self.registry
            .fan_out(
                &recipients,
                &GatewayEvent::MessageUpdated {
                    message: message.clone(),
                },
            )
            .await;
    }

    fn validate_content(&self, content: &str) -> ChatResult<String> {
        if content.trim().is_empty() {
            return Err(ChatError::InvalidInput("message is empty"));
        }
        if content.chars().count() > self.config.max_message_len {
            return Err(ChatError::InvalidInput("message is too long"));
        }
        Ok(content.to_string())
    }
}

fn push_for(chat: &Chat, message: &Message, user_id: UserId) -> PushNotification {
    let title = if chat.is_group {
        chat.title.clone().unwrap_or_else(|| message.sender_username.clone())
    } else {
        message.sender_username.clone()
    };

    let body = if chat.is_group {
        format!("{}: {}", message.sender_username, message.content)
    } else {
        message.content.clone()
    };

    let mut data = HashMap::new();
    data.insert("type".to_string(), "new_message".to_string());
    data.insert("chatId".to_string(), message.chat_id.to_string());
    data.insert("messageId".to_string(), message.id.to_string());

    PushNotification {
        user_id,
        title,
        body: body.chars().take(PUSH_BODY_CHARS).collect(),
        data,
    }
}
