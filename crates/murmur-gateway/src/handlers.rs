use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use tracing::debug;

use murmur_core::{ChatError, ChatResult, ChatServices};
use murmur_types::events::GatewayCommand;
use murmur_types::models::{ConnectionId, UserId};

/// Identity of an authenticated gateway connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub username: String,
    pub connection_id: ConnectionId,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ChatResult<()>> + Send + 'a>>;

pub type Handler = for<'a> fn(&'a ChatServices, &'a Session, GatewayCommand) -> HandlerFuture<'a>;

/// Command name -> handler. Built once and shared by every connection.
pub struct HandlerTable {
    handlers: HashMap<&'static str, Handler>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        let mut handlers: HashMap<&'static str, Handler> = HashMap::new();
        handlers.insert("identify", identify);
        handlers.insert("send_message", send_message);
        handlers.insert("mark_read", mark_read);
        handlers.insert("mark_read_batch", mark_read_batch);
        handlers.insert("set_typing", set_typing);
        Self { handlers }
    }

    pub async fn dispatch(&self, services: &ChatServices, session: &Session, cmd: GatewayCommand) -> ChatResult<()> {
        match self.handlers.get(cmd.name()) {
            Some(handler) => handler(services, session, cmd).await,
            None => Err(ChatError::InvalidInput("unknown command")),
        }
    }
}

/// Correlation id a failure reply should carry, if the command had one.
pub fn correlation_of(cmd: &GatewayCommand) -> Option<String> {
    match cmd {
        GatewayCommand::SendMessage { correlation_id, .. } => correlation_id.clone(),
        _ => None,
    }
}

fn identify<'a>(_: &'a ChatServices, session: &'a Session, _: GatewayCommand) -> HandlerFuture<'a> {
    Box::pin(async move {
        debug!("Connection {} sent Identify after authenticating", session.connection_id);
        Ok(())
    })
}

fn send_message<'a>(services: &'a ChatServices, session: &'a Session, cmd: GatewayCommand) -> HandlerFuture<'a> {
    Box::pin(async move {
        let GatewayCommand::SendMessage { chat_id, content, correlation_id } = cmd else {
            return Err(ChatError::InvalidInput("unexpected command"));
        };
        services
            .pipeline
            .submit(chat_id, session.user_id, &content, correlation_id, Some(session.connection_id))
            .await?;
        Ok(())
    })
}

fn mark_read<'a>(services: &'a ChatServices, session: &'a Session, cmd: GatewayCommand) -> HandlerFuture<'a> {
    Box::pin(async move {
        let GatewayCommand::MarkRead { message_id } = cmd else {
            return Err(ChatError::InvalidInput("unexpected command"));
        };
        services.pipeline.mark_read(message_id, session.user_id).await?;
        Ok(())
    })
}

fn mark_read_batch<'a>(services: &'a ChatServices, session: &'a Session, cmd: GatewayCommand) -> HandlerFuture<'a> {
    Box::pin(async move {
        let GatewayCommand::MarkReadBatch { message_ids } = cmd else {
            return Err(ChatError::InvalidInput("unexpected command"));
        };
        services.pipeline.mark_many_read(&message_ids, session.user_id).await?;
        Ok(())
    })
}

fn set_typing<'a>(services: &'a ChatServices, session: &'a Session, cmd: GatewayCommand) -> HandlerFuture<'a> {
    Box::pin(async move {
        let GatewayCommand::SetTyping { chat_id, is_typing } = cmd else {
            return Err(ChatError::InvalidInput("unexpected command"));
        };
        services.pipeline.set_typing(chat_id, session.user_id, is_typing).await
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use murmur_core::{CoreConfig, LogNotifier, NewGroup};
    use murmur_db::Database;
    use murmur_types::events::GatewayEvent;

    use super::*;

    fn services() -> ChatServices {
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.upsert_user(1, "ana", None).unwrap();
        db.upsert_user(2, "ben", None).unwrap();
        ChatServices::new(db, Arc::new(LogNotifier), CoreConfig::default())
    }

    fn session(user_id: UserId) -> Session {
        Session {
            user_id,
            username: format!("user{}", user_id),
            connection_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn every_command_has_a_handler() {
        let table = HandlerTable::new();
        for name in ["identify", "send_message", "mark_read", "mark_read_batch", "set_typing"] {
            assert!(table.handlers.contains_key(name), "{}", name);
        }
    }

    #[test]
    fn only_send_message_carries_a_correlation_id() {
        let send = GatewayCommand::SendMessage {
            chat_id: Uuid::new_v4(),
            content: "hi".into(),
            correlation_id: Some("c-9".into()),
        };
        assert_eq!(correlation_of(&send).as_deref(), Some("c-9"));
        assert_eq!(correlation_of(&GatewayCommand::MarkRead { message_id: 1 }), None);
    }

    #[tokio::test]
    async fn send_message_confirms_to_the_issuing_connection() {
        let services = services();
        let chat = services
            .groups
            .create_group(
                1,
                NewGroup {
                    title: "pair".into(),
                    member_ids: vec![2],
                    ..NewGroup::default()
                },
            )
            .await
            .unwrap();

        let session = session(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        services.registry.register(1, session.connection_id, tx).await;

        let table = HandlerTable::new();
        table
            .dispatch(
                &services,
                &session,
                GatewayCommand::SendMessage {
                    chat_id: chat.id,
                    content: "yo".into(),
                    correlation_id: Some("c-1".into()),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            GatewayEvent::MessageCorrelationConfirmation { .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), GatewayEvent::NewMessage { .. }));
    }

    #[tokio::test]
    async fn failures_surface_as_chat_errors() {
        let services = services();
        let table = HandlerTable::new();

        let result = table
            .dispatch(
                &services,
                &session(2),
                GatewayCommand::SetTyping {
                    chat_id: Uuid::new_v4(),
                    is_typing: true,
                },
            )
            .await;
        assert!(matches!(result, Err(ChatError::NotFound)));
    }
}
