pub mod error;
pub mod groups;
pub mod notify;
pub mod permissions;
pub mod pipeline;
pub mod presence;
pub mod registry;
pub mod store;

use std::sync::Arc;

use murmur_db::Database;

pub use error::{ChatError, ChatResult};
pub use groups::{GroupInfo, GroupManager, NewGroup};
pub use notify::{LogNotifier, Notifier, PushNotification, WebhookNotifier};
pub use pipeline::{Delivery, MessagePipeline, PipelineConfig};
pub use presence::Presence;
pub use registry::{ConnectionRegistry, EventSender};
pub use store::Store;

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub max_message_len: usize,
    pub default_max_members: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_message_len: PipelineConfig::default().max_message_len,
            default_max_members: murmur_types::models::DEFAULT_MAX_MEMBERS,
        }
    }
}

/// The core services wired to one shared registry and store. Built once per
/// process and handed to the HTTP and gateway layers.
#[derive(Clone)]
pub struct ChatServices {
    pub store: Store,
    pub registry: ConnectionRegistry,
    pub pipeline: MessagePipeline,
    pub groups: GroupManager,
    pub presence: Presence,
}

impl ChatServices {
    pub fn new(db: Arc<Database>, notifier: Arc<dyn Notifier>, config: CoreConfig) -> Self {
        let store = Store::new(db);
        let registry = ConnectionRegistry::new();

        let pipeline = MessagePipeline::new(
            store.clone(),
            registry.clone(),
            notifier,
            PipelineConfig {
                max_message_len: config.max_message_len,
            },
        );
        let groups = GroupManager::new(store.clone(), registry.clone(), config.default_max_members);
        let presence = Presence::new(store.clone(), registry.clone());

        Self {
            store,
            registry,
            pipeline,
            groups,
            presence,
        }
    }
}
