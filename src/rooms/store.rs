use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    Message, MessageId, MessagePatch, MessageRow, MessageStatus, Profile, Reconciled, Room,
    RoomLog, SharedItem,
};
use crate::attachments::{check_size_limit, AttachmentUploader, PendingUpload};
use crate::codec;
use crate::error::{ChatError, GatewayError, ValidationError};
use crate::remote::{ApiRequest, RequestGateway};

/// Everything the user submitted for one send
#[derive(Debug, Clone)]
pub struct Draft {
    pub room_id: String,
    pub sender: Profile,
    pub text: String,
    pub attachments: Vec<PendingUpload>,
    pub shared_item: Option<SharedItem>,
}

impl Draft {
    pub fn text(room_id: &str, sender: &Profile, text: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            sender: sender.clone(),
            text: text.to_string(),
            attachments: Vec::new(),
            shared_item: None,
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<PendingUpload>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_shared_item(mut self, item: SharedItem) -> Self {
        self.shared_item = Some(item);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadSummary {
    pub succeeded: usize,
    pub requested: usize,
}

impl UploadSummary {
    pub fn is_partial(&self) -> bool {
        self.succeeded < self.requested
    }
}

/// Outcome of a send that got as far as the optimistic entry
#[derive(Debug, Clone, PartialEq)]
pub struct SendReport {
    /// Server id once confirmed, otherwise the temporary id
    pub message_id: MessageId,
    pub status: MessageStatus,
    pub upload: Option<UploadSummary>,
    /// Why the write did not confirm, if it did not
    pub error: Option<GatewayError>,
}

impl SendReport {
    pub fn is_failed(&self) -> bool {
        self.status == MessageStatus::Failed
    }
}

/// Per-room message logs plus the send pipeline.
///
/// Every change to a log goes through `update`, which holds the lock only for
/// the duration of a synchronous closure. Logs of rooms that are no longer open
/// are kept so that late results still land where they were aimed.
#[derive(Clone)]
pub struct MessageStore {
    rooms: Arc<RwLock<HashMap<String, RoomLog>>>,
    gateway: Arc<RequestGateway>,
    uploader: AttachmentUploader,
}

impl MessageStore {
    pub fn new(gateway: Arc<RequestGateway>, uploader: AttachmentUploader) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            gateway,
            uploader,
        }
    }

    /// Run `f` against the log of `room_id`, creating the log on first use
    pub fn update<R>(&self, room_id: &str, f: impl FnOnce(&mut RoomLog) -> R) -> R {
        let mut rooms = self.rooms.write();
        f(rooms.entry(room_id.to_string()).or_default())
    }

    pub fn messages(&self, room_id: &str) -> Vec<Message> {
        self.rooms
            .read()
            .get(room_id)
            .map(|log| log.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn message(&self, room_id: &str, id: &MessageId) -> Option<Message> {
        self.rooms
            .read()
            .get(room_id)
            .and_then(|log| log.get(id).cloned())
    }

    pub fn reconcile(&self, confirmed: Message) -> Reconciled {
        let room_id = confirmed.room_id.clone();
        let outcome = self.update(&room_id, |log| log.reconcile(confirmed));
        if let Reconciled::Confirmed { temporary_id, .. } = &outcome {
            debug!(room_id = %room_id, temporary_id = %temporary_id, "Optimistic message confirmed");
        }
        outcome
    }

    pub fn apply_patch(&self, room_id: &str, patch: &MessagePatch) -> bool {
        self.update(room_id, |log| log.apply_patch(patch))
    }

    pub fn set_sender(&self, room_id: &str, id: &MessageId, profile: Profile) -> bool {
        self.update(room_id, |log| log.set_sender(id, profile))
    }

    /// Fetch recent history for `room` and merge it into the log
    pub async fn load_history(&self, room: &Room) -> Result<usize, GatewayError> {
        let rows: Vec<serde_json::Value> = self
            .gateway
            .send_json(ApiRequest::get(format!("/rooms/{}/messages", room.id)))
            .await?;

        let mut loaded = 0;
        for value in rows {
            let row = match MessageRow::from_value(value) {
                Ok(row) => row,
                Err(e) => {
                    debug!(room_id = %room.id, error = %e, "Skipping unparseable history row");
                    continue;
                }
            };
            let mut message = row.into_message();
            message.sender = room.participant(&message.sender_id).cloned();
            self.reconcile(message);
            loaded += 1;
        }

        info!(room_id = %room.id, loaded, "Loaded room history");
        Ok(loaded)
    }

    /// Validate, upload, show optimistically, then persist.
    ///
    /// Validation and upload failures return an error and leave the log
    /// untouched. Once the optimistic entry exists the call always returns a
    /// report; a failed write is reported there with the entry marked failed.
    pub async fn send(&self, draft: Draft) -> Result<SendReport, ChatError> {
        let Draft {
            room_id,
            sender,
            text,
            attachments: pending,
            shared_item,
        } = draft;

        if text.trim().is_empty() && pending.is_empty() && shared_item.is_none() {
            return Err(ValidationError::EmptyMessage.into());
        }
        if shared_item.is_some() && !pending.is_empty() {
            return Err(ValidationError::SharedItemWithAttachments.into());
        }
        check_size_limit(&pending)?;

        let (attachments, upload) = if pending.is_empty() {
            (Vec::new(), None)
        } else {
            let report = self.uploader.upload_all(&room_id, &sender.id, pending).await?;
            let summary = UploadSummary {
                succeeded: report.succeeded(),
                requested: report.requested(),
            };
            (report.attachments, Some(summary))
        };

        let content = match &shared_item {
            Some(item) => codec::encode_shared(text.trim(), item),
            None => codec::encode(text.trim(), &attachments),
        };
        let optimistic = Message::optimistic(
            &room_id,
            &sender,
            &text,
            Some(attachments),
            shared_item,
        );
        let temporary_id = optimistic.id.clone();
        self.update(&room_id, |log| log.push_optimistic(optimistic));
        debug!(room_id = %room_id, message_id = %temporary_id, "Optimistic message added");

        let request = ApiRequest::post(
            format!("/rooms/{}/messages", room_id),
            json!({
                "room_id": room_id,
                "sender_id": sender.id,
                "content": content,
            }),
        );
        let response = self
            .gateway
            .send_json::<serde_json::Value>(request)
            .await
            .and_then(|value| {
                MessageRow::from_value(value)
                    .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
            });

        match response {
            Ok(row) => {
                let confirmed = row.into_message();
                let message_id = confirmed.id.clone();
                self.reconcile(confirmed);
                Ok(SendReport {
                    message_id,
                    status: MessageStatus::Sent,
                    upload,
                    error: None,
                })
            }
            // The row was written but its echo is unreadable; the push event can still confirm it
            Err(e @ GatewayError::InvalidResponse(_)) => {
                warn!(room_id = %room_id, error = %e, "Message persisted with unreadable response");
                Ok(SendReport {
                    message_id: temporary_id,
                    status: MessageStatus::Sending,
                    upload,
                    error: Some(e),
                })
            }
            Err(e) => {
                warn!(room_id = %room_id, message_id = %temporary_id, error = %e, "Message write failed");
                let failed = self
                    .update(&room_id, |log| log.fail_send(&temporary_id, &sender.id, &text))
                    .unwrap_or(temporary_id);
                Ok(SendReport {
                    message_id: failed,
                    status: MessageStatus::Failed,
                    upload,
                    error: Some(e),
                })
            }
        }
    }
}
