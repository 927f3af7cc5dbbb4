use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use murmur_db::{AddParticipants, SettingsUpdate};
use murmur_types::events::GatewayEvent;
use murmur_types::models::{
    Chat, ChatId, ChatSummary, GroupSettings, Participant, Role, UserId,
};

use crate::error::{ChatError, ChatResult};
use crate::permissions::{self, Action};
use crate::registry::ConnectionRegistry;
use crate::store::Store;

const JOIN_TOKEN_BYTES: usize = 18;

/// Input for `create_group`.
#[derive(Debug, Clone, Default)]
pub struct NewGroup {
    pub title: String,
    pub description: Option<String>,
    pub member_ids: Vec<UserId>,
    pub settings: Option<GroupSettings>,
}

/// Partial update of the descriptive fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct GroupInfo {
    pub title: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
}

/// Multi-step membership changes: authorize, mutate in one store
/// transaction, then broadcast a named event.
#[derive(Clone)]
pub struct GroupManager {
    store: Store,
    registry: ConnectionRegistry,
    default_max_members: u32,
}

impl GroupManager {
    pub fn new(store: Store, registry: ConnectionRegistry, default_max_members: u32) -> Self {
        Self {
            store,
            registry,
            default_max_members,
        }
    }

    // -- Creation --

    pub async fn create_group(&self, creator_id: UserId, group: NewGroup) -> ChatResult<Chat> {
        let title = group.title.trim().to_string();
        if title.is_empty() {
            return Err(ChatError::InvalidInput("group title is empty"));
        }

        let mut settings = group.settings.unwrap_or_else(|| GroupSettings {
            max_members: self.default_max_members,
            ..GroupSettings::default()
        });
        if settings.max_members == 0 {
            return Err(ChatError::InvalidInput("max members must be positive"));
        }
        // links are only minted through regenerate_join_link
        settings.join_link = None;

        let mut member_ids: Vec<UserId> = Vec::new();
        for id in group.member_ids {
            if id != creator_id && !member_ids.contains(&id) {
                member_ids.push(id);
            }
        }
        self.ensure_users_exist(&member_ids).await?;

        if member_ids.len() as u32 + 1 > settings.max_members {
            return Err(ChatError::InvalidState("group is over capacity"));
        }

        let chat = Chat {
            id: Uuid::new_v4(),
            is_group: true,
            title: Some(title),
            description: group.description.filter(|d| !d.trim().is_empty()),
            avatar_url: None,
            owner_id: Some(creator_id),
            created_at: Utc::now(),
            settings,
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
        };

        let mut members = vec![(creator_id, Role::Owner)];
        members.extend(member_ids.iter().map(|id| (*id, Role::Member)));

        let row = chat.clone();
        self.store
            .call(move |db| db.create_chat(&row, &members))
            .await?;

        info!(
            "User {} created group {} with {} members",
            creator_id,
            chat.id,
            member_ids.len() + 1
        );

        let mut audience = member_ids;
        audience.push(creator_id);
        self.registry
            .fan_out(&audience, &GatewayEvent::ChatCreated { chat: chat.clone() })
            .await;
        Ok(chat)
    }

    /// Find-or-create the direct chat between two users. The bool is true
    /// when the chat was created by this call.
    pub async fn create_direct_chat(&self, user_id: UserId, other_id: UserId) -> ChatResult<(Chat, bool)> {
        if user_id == other_id {
            return Err(ChatError::InvalidInput("cannot start a chat with yourself"));
        }
        self.ensure_users_exist(&[other_id]).await?;

        let candidate = Chat {
            id: Uuid::new_v4(),
            is_group: false,
            title: None,
            description: None,
            avatar_url: None,
            owner_id: None,
            created_at: Utc::now(),
            settings: GroupSettings {
                max_members: 2,
                ..GroupSettings::default()
            },
            last_message_id: None,
            last_message_preview: None,
            last_message_at: None,
        };

        let (chat, created) = self
            .store
            .call(move |db| db.get_or_create_direct_chat(&candidate, user_id, other_id))
            .await?;

        if created {
            info!("Direct chat {} created between {} and {}", chat.id, user_id, other_id);
            self.registry
                .fan_out(&[user_id, other_id], &GatewayEvent::ChatCreated { chat: chat.clone() })
                .await;
        }
        Ok((chat, created))
    }

    // -- Membership --

    /// Whole-batch capacity policy: if the new members do not all fit,
    /// nothing is added. Returns the ids actually added.
    pub async fn add_members(&self, chat_id: ChatId, actor_id: UserId, user_ids: &[UserId]) -> ChatResult<Vec<UserId>> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::AddMember)?;

        if user_ids.is_empty() {
            return Ok(vec![]);
        }
        self.ensure_users_exist(user_ids).await?;

        let ids = user_ids.to_vec();
        let max = chat.settings.max_members;
        let now = Utc::now();
        let outcome = self
            .store
            .call(move |db| db.add_participants(chat_id, &ids, max, now))
            .await?;

        let added = match outcome {
            AddParticipants::Added(added) => added,
            AddParticipants::OverCapacity { active, requested, max } => {
                info!(
                    "Rejected adding {} members to chat {} ({} active, max {})",
                    requested, chat_id, active, max
                );
                return Err(ChatError::InvalidState("group is over capacity"));
            }
        };

        if !added.is_empty() {
            info!("User {} added {:?} to chat {}", actor_id, added, chat_id);
            self.announce(
                chat_id,
                &[],
                GatewayEvent::MembersAdded {
                    chat_id,
                    added_by: actor_id,
                    user_ids: added.clone(),
                },
            )
            .await;
        }
        Ok(added)
    }

    pub async fn remove_member(&self, chat_id: ChatId, actor_id: UserId, target_id: UserId) -> ChatResult<()> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::RemoveMember)?;

        let target = self.active_participant(chat_id, target_id).await?;
        if !permissions::can_target(Action::RemoveMember, &target) {
            return Err(ChatError::InvalidState("the owner cannot be removed"));
        }

        let now = Utc::now();
        let removed = self
            .store
            .call(move |db| db.deactivate_participant(chat_id, target_id, now))
            .await?;
        if !removed {
            return Err(ChatError::NotFound);
        }

        info!("User {} removed {} from chat {}", actor_id, target_id, chat_id);
        self.announce(
            chat_id,
            &[target_id],
            GatewayEvent::MemberRemoved {
                chat_id,
                user_id: target_id,
                removed_by: actor_id,
            },
        )
        .await;
        Ok(())
    }

    /// The Owner has to transfer ownership before leaving.
    pub async fn leave_group(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<()> {
        let (chat, participant) = self.store.membership(chat_id, user_id).await?;
        let participant = participant
            .filter(|p| p.is_active)
            .ok_or(ChatError::NotParticipant)?;

        if !chat.is_group {
            return Err(ChatError::InvalidState("direct chats cannot be left"));
        }
        if participant.role == Role::Owner {
            return Err(ChatError::InvalidState("owner must transfer ownership before leaving"));
        }
        if !chat.settings.allow_members_to_leave {
            return Err(ChatError::PermissionDenied);
        }

        let now = Utc::now();
        let left = self
            .store
            .call(move |db| db.deactivate_participant(chat_id, user_id, now))
            .await?;
        if !left {
            return Err(ChatError::NotParticipant);
        }

        info!("User {} left chat {}", user_id, chat_id);
        self.announce(chat_id, &[user_id], GatewayEvent::MemberLeft { chat_id, user_id })
            .await;
        Ok(())
    }

    pub async fn update_member_role(
        &self,
        chat_id: ChatId,
        actor_id: UserId,
        target_id: UserId,
        role: Role,
    ) -> ChatResult<()> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::ChangeRole)?;

        if !permissions::can_assign(role) {
            return Err(ChatError::InvalidState("ownership moves only through transfer"));
        }

        let target = self.active_participant(chat_id, target_id).await?;
        if !permissions::can_target(Action::ChangeRole, &target) {
            return Err(ChatError::InvalidState("the owner's role cannot be changed"));
        }

        let changed = self
            .store
            .call(move |db| db.set_participant_role(chat_id, target_id, role))
            .await?;
        if !changed {
            return Err(ChatError::NotFound);
        }

        info!("User {} set role of {} in chat {} to {}", actor_id, target_id, chat_id, role);
        self.announce(
            chat_id,
            &[],
            GatewayEvent::MemberRoleUpdated {
                chat_id,
                user_id: target_id,
                role,
            },
        )
        .await;
        Ok(())
    }

    /// New owner becomes Owner, the previous owner becomes Admin, and the
    /// chat's owner pointer moves, all in one transaction.
    pub async fn transfer_ownership(&self, chat_id: ChatId, actor_id: UserId, new_owner_id: UserId) -> ChatResult<()> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::TransferOwnership)?;

        if new_owner_id == actor_id {
            return Err(ChatError::InvalidState("already the owner"));
        }
        self.active_participant(chat_id, new_owner_id)
            .await
            .map_err(|_| ChatError::InvalidState("new owner must be an active participant"))?;

        let moved = self
            .store
            .call(move |db| db.transfer_ownership(chat_id, actor_id, new_owner_id))
            .await?;
        if !moved {
            // membership changed between the check and the transaction
            return Err(ChatError::InvalidState("ownership could not be transferred"));
        }

        info!("Ownership of chat {} moved from {} to {}", chat_id, actor_id, new_owner_id);
        self.announce(
            chat_id,
            &[],
            GatewayEvent::OwnershipTransferred {
                chat_id,
                previous_owner_id: actor_id,
                new_owner_id,
            },
        )
        .await;
        Ok(())
    }

    /// Add `user_id` through a group's public join link. Joining a group
    /// one is already active in is a no-op.
    pub async fn join_via_link(&self, token: &str, user_id: UserId) -> ChatResult<Chat> {
        let link = token.to_string();
        let chat = self
            .store
            .call(move |db| db.get_chat_by_join_link(&link))
            .await?
            .ok_or(ChatError::NotFound)?;

        if !chat.is_group || !chat.settings.is_public {
            return Err(ChatError::PermissionDenied);
        }

        let chat_id = chat.id;
        let max = chat.settings.max_members;
        let now = Utc::now();
        let outcome = self
            .store
            .call(move |db| db.add_participants(chat_id, &[user_id], max, now))
            .await?;

        match outcome {
            AddParticipants::Added(added) if added.is_empty() => Ok(chat),
            AddParticipants::Added(added) => {
                info!("User {} joined chat {} via link", user_id, chat_id);
                self.announce(
                    chat_id,
                    &[],
                    GatewayEvent::MembersAdded {
                        chat_id,
                        added_by: user_id,
                        user_ids: added,
                    },
                )
                .await;
                Ok(chat)
            }
            AddParticipants::OverCapacity { .. } => Err(ChatError::InvalidState("group is over capacity")),
        }
    }

    // -- Group info and policy --

    pub async fn update_info(&self, chat_id: ChatId, actor_id: UserId, info: GroupInfo) -> ChatResult<Chat> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::EditInfo)?;

        if info.title.is_none() && info.description.is_none() && info.avatar_url.is_none() {
            return Err(ChatError::InvalidInput("nothing to update"));
        }
        let title = match info.title {
            Some(t) if t.trim().is_empty() => {
                return Err(ChatError::InvalidInput("group title is empty"));
            }
            other => other.map(|t| t.trim().to_string()),
        };

        let (description, avatar_url) = (info.description, info.avatar_url);
        let updated = self
            .store
            .call(move |db| {
                db.update_chat_info(chat_id, title.as_deref(), description.as_deref(), avatar_url.as_deref())
            })
            .await?
            .ok_or(ChatError::NotFound)?;

        info!("User {} updated info of chat {}", actor_id, chat_id);
        self.announce(
            chat_id,
            &[],
            GatewayEvent::GroupInfoUpdated {
                chat_id,
                title: updated.title.clone(),
                description: updated.description.clone(),
                avatar_url: updated.avatar_url.clone(),
            },
        )
        .await;
        Ok(updated)
    }

    /// Replace the policy toggles. The join link is not touched here.
    pub async fn update_settings(&self, chat_id: ChatId, actor_id: UserId, settings: GroupSettings) -> ChatResult<Chat> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::UpdateSettings)?;

        if settings.max_members == 0 {
            return Err(ChatError::InvalidInput("max members must be positive"));
        }

        let outcome = self
            .store
            .call(move |db| db.update_chat_settings(chat_id, &settings))
            .await?;
        let updated = match outcome {
            SettingsUpdate::Applied(chat) => chat,
            SettingsUpdate::BelowActiveCount(active) => {
                info!("Rejected max members below {} active in chat {}", active, chat_id);
                return Err(ChatError::InvalidState("max members below active participant count"));
            }
        };

        info!("User {} updated settings of chat {}", actor_id, chat_id);
        self.announce(
            chat_id,
            &[],
            GatewayEvent::GroupSettingsUpdated {
                chat_id,
                settings: updated.settings.clone(),
            },
        )
        .await;
        Ok(updated)
    }

    /// Mint a fresh join link, invalidating the previous one, and make the
    /// group public.
    pub async fn regenerate_join_link(&self, chat_id: ChatId, actor_id: UserId) -> ChatResult<String> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::UpdateSettings)?;

        let token = URL_SAFE_NO_PAD.encode(rand::random::<[u8; JOIN_TOKEN_BYTES]>());
        let link = token.clone();
        let updated = self
            .store
            .call(move |db| {
                db.set_join_link(chat_id, &link)?;
                db.get_chat(chat_id)
            })
            .await?
            .ok_or(ChatError::NotFound)?;

        info!("User {} regenerated the join link of chat {}", actor_id, chat_id);
        self.announce(
            chat_id,
            &[],
            GatewayEvent::GroupSettingsUpdated {
                chat_id,
                settings: updated.settings,
            },
        )
        .await;
        Ok(token)
    }

    /// `GroupDeleted` goes out before the purge so clients can still
    /// resolve the chat.
    pub async fn delete_group(&self, chat_id: ChatId, actor_id: UserId) -> ChatResult<()> {
        let (chat, actor) = self.store.membership(chat_id, actor_id).await?;
        permissions::authorize(&chat, actor.as_ref(), Action::DeleteGroup)?;

        self.announce(chat_id, &[], GatewayEvent::GroupDeleted { chat_id }).await;

        let deleted = self
            .store
            .call(move |db| db.delete_chat_cascade(chat_id))
            .await?;
        if !deleted {
            return Err(ChatError::NotFound);
        }

        info!("User {} deleted chat {}", actor_id, chat_id);
        Ok(())
    }

    // -- Reads --

    /// The chat and its active participants, for active participants only.
    pub async fn chat_details(&self, chat_id: ChatId, viewer_id: UserId) -> ChatResult<(Chat, Vec<Participant>)> {
        let (chat, viewer) = self.store.membership(chat_id, viewer_id).await?;
        if !viewer.is_some_and(|p| p.is_active) {
            return Err(ChatError::NotParticipant);
        }

        let participants = self
            .store
            .call(move |db| db.list_participants(chat_id, true))
            .await?;
        Ok((chat, participants))
    }

    pub async fn list_chats(&self, user_id: UserId) -> ChatResult<Vec<ChatSummary>> {
        self.store.call(move |db| db.list_chats_for_user(user_id)).await
    }

    // -- Helpers --

    async fn active_participant(&self, chat_id: ChatId, user_id: UserId) -> ChatResult<Participant> {
        self.store
            .call(move |db| db.get_participant(chat_id, user_id))
            .await?
            .filter(|p| p.is_active)
            .ok_or(ChatError::NotFound)
    }

    async fn ensure_users_exist(&self, ids: &[UserId]) -> ChatResult<()> {
        let wanted = ids.to_vec();
        let known = self
            .store
            .call(move |db| db.existing_user_ids(&wanted))
            .await?;
        if ids.iter().all(|id| known.contains(id)) {
            Ok(())
        } else {
            Err(ChatError::NotFound)
        }
    }

    /// Fan `event` out to the chat's active participants plus `extra`.
    /// The mutation is already committed, so audience lookup failures are
    /// logged rather than returned.
    async fn announce(&self, chat_id: ChatId, extra: &[UserId], event: GatewayEvent) {
        let mut audience = match self.store.active_ids(chat_id).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!("Could not resolve audience for chat {}: {}", chat_id, e);
                return;
            }
        };
        audience.extend_from_slice(extra);
        self.registry.fan_out(&audience, &event).await;
    }
}
