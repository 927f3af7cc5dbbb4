//! Pure authorization decisions over (chat, actor, action).
//!
//! Admin is an operational role: it may add members and edit info when the
//! chat restricts those to admins, but never removes members, changes roles,
//! touches settings, deletes the group or moves ownership. Those need Owner.

use murmur_types::models::{Chat, Message, Participant, Role, UserId};

use crate::error::{ChatError, ChatResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    AddMember,
    RemoveMember,
    ChangeRole,
    EditInfo,
    UpdateSettings,
    DeleteGroup,
    TransferOwnership,
    SendMessage,
}

impl Action {
    pub const ALL: [Action; 8] = [
        Action::AddMember,
        Action::RemoveMember,
        Action::ChangeRole,
        Action::EditInfo,
        Action::UpdateSettings,
        Action::DeleteGroup,
        Action::TransferOwnership,
        Action::SendMessage,
    ];

    /// Actions reserved for the Owner.
    pub fn owner_only(&self) -> bool {
        matches!(
            self,
            Action::RemoveMember
                | Action::ChangeRole
                | Action::UpdateSettings
                | Action::DeleteGroup
                | Action::TransferOwnership
        )
    }
}

/// Whether `actor` may perform `action` in `chat`. `None` or an inactive
/// row always denies.
pub fn can_perform(chat: &Chat, actor: Option<&Participant>, action: Action) -> bool {
    let Some(actor) = actor.filter(|p| p.is_active && p.chat_id == chat.id) else {
        return false;
    };

    // direct chats have no governance at all
    if !chat.is_group {
        return action == Action::SendMessage;
    }

    if actor.role == Role::Owner {
        return true;
    }

    let settings = &chat.settings;
    match action {
        Action::RemoveMember
        | Action::ChangeRole
        | Action::UpdateSettings
        | Action::DeleteGroup
        | Action::TransferOwnership => false,
        Action::AddMember => !settings.only_admins_can_add || actor.role.is_admin(),
        Action::EditInfo => !settings.only_admins_can_edit_info || actor.role.is_admin(),
        Action::SendMessage => !settings.only_admins_can_send || actor.role.is_admin(),
    }
}

/// Whether `target` may be the subject of `action`. The Owner can never be
/// removed or have their role changed by anyone.
pub fn can_target(action: Action, target: &Participant) -> bool {
    match action {
        Action::RemoveMember | Action::ChangeRole => target.is_active && target.role != Role::Owner,
        _ => true,
    }
}

/// Owner is only reachable through ownership transfer.
pub fn can_assign(role: Role) -> bool {
    role != Role::Owner
}

/// The sender may always delete; in groups the Owner may too.
pub fn can_delete_message(chat: &Chat, actor: Option<&Participant>, actor_id: UserId, message: &Message) -> bool {
    if message.sender_id == actor_id {
        return true;
    }
    chat.is_group
        && actor.is_some_and(|p| p.is_active && p.user_id == actor_id && p.role == Role::Owner)
}

/// `can_perform` with the denial split into the two forbidden flavours.
pub fn authorize(chat: &Chat, actor: Option<&Participant>, action: Action) -> ChatResult<()> {
    match actor {
        Some(p) if p.is_active => {
            if can_perform(chat, Some(p), action) {
                Ok(())
            } else {
                Err(ChatError::PermissionDenied)
            }
        }
        _ => Err(ChatError::NotParticipant),
    }
}
