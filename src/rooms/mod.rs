use serde::{Deserialize, Serialize};

pub use log::{Reconciled, RoomLog};
pub use message::{
    Attachment, AttachmentKind, Message, MessageId, MessagePatch, MessageRow, MessageStatus,
    SharedItem,
};
pub use store::{Draft, MessageStore, SendReport, UploadSummary};

mod log;
mod message;
mod store;

/// Denormalized snapshot of a user, attached to messages as `sender`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    #[serde(alias = "username", alias = "full_name")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Profile {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    Direct,
    Group,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub room_type: RoomType,
    #[serde(default)]
    pub participants: Vec<Profile>,
}

impl Room {
    pub fn new(id: &str, room_type: RoomType) -> Self {
        Self {
            id: id.to_string(),
            room_type,
            participants: Vec::new(),
        }
    }

    pub fn with_participants(mut self, participants: Vec<Profile>) -> Self {
        self.participants = participants;
        self
    }

    /// Roster lookup used to resolve senders without a network round trip
    pub fn participant(&self, user_id: &str) -> Option<&Profile> {
        self.participants.iter().find(|p| p.id == user_id)
    }
}
