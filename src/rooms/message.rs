use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Profile;
use crate::codec;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    /// Locally generated while the write is in flight
    Temporary(Uuid),
    /// Assigned by the server
    Server(String),
}

impl MessageId {
    pub fn temporary() -> Self {
        MessageId::Temporary(Uuid::new_v4())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, MessageId::Temporary(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Temporary(id) => write!(f, "temp-{}", id),
            MessageId::Server(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
}

impl AttachmentKind {
    /// Guess from a mime type, falling back to a generic file
    pub fn from_mime(mime_type: Option<&str>) -> Self {
        match mime_type {
            Some(mime) if mime.starts_with("image/") => AttachmentKind::Image,
            _ => AttachmentKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "mime_type")]
    pub mime_type: Option<String>,
}

/// Reference to a notebook, task, flashcard deck or reviewer shared into a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedItem {
    pub item_type: String,
    pub item_id: String,
    pub item_title: String,
    pub permission_level: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub room_id: String,
    pub sender_id: String,
    /// Decoded human text, never the raw wire string
    pub content: String,
    pub attachments: Option<Vec<Attachment>>,
    pub shared_item: Option<SharedItem>,
    pub created_at: DateTime<Utc>,
    /// Only set for messages sent from this session
    pub status: Option<MessageStatus>,
    pub sender: Option<Profile>,
}

impl Message {
    /// Build the local entry shown the moment a send starts
    pub fn optimistic(
        room_id: &str,
        sender: &Profile,
        text: &str,
        attachments: Option<Vec<Attachment>>,
        shared_item: Option<SharedItem>,
    ) -> Self {
        Self {
            id: MessageId::temporary(),
            room_id: room_id.to_string(),
            sender_id: sender.id.clone(),
            content: text.trim().to_string(),
            attachments: attachments.filter(|a| !a.is_empty()),
            shared_item,
            created_at: Utc::now(),
            status: Some(MessageStatus::Sending),
            sender: Some(sender.clone()),
        }
    }

    pub fn is_sending(&self) -> bool {
        self.status == Some(MessageStatus::Sending)
    }
}

/// A message row as the server returns it, before decoding
#[derive(Debug, Clone, Deserialize)]
pub struct MessageRow {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub room_id: String,
    #[serde(deserialize_with = "string_or_number")]
    pub sender_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessageRow {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Decode the wire content and produce a confirmed message
    pub fn into_message(self) -> Message {
        let decoded = codec::decode(self.content.as_deref().unwrap_or_default());
        Message {
            id: MessageId::Server(self.id),
            room_id: self.room_id,
            sender_id: self.sender_id,
            content: decoded.text,
            attachments: decoded.attachments.filter(|a| !a.is_empty()),
            shared_item: decoded.shared_item,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            status: None,
            sender: None,
        }
    }
}

/// Changed fields of an existing row, as delivered by an UPDATE event
#[derive(Debug, Clone, Deserialize)]
pub struct MessagePatch {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl MessagePatch {
    pub fn from_value(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn id(&self) -> MessageId {
        MessageId::Server(self.id.clone())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
