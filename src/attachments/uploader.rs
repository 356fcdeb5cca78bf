use chrono::Utc;
use futures::future::join_all;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{LocalRef, PendingUpload, StorageSink};
use crate::error::UploadError;
use crate::rooms::Attachment;

/// Successful subset of a batch, in the order the files were given
#[derive(Debug, Clone, PartialEq)]
pub struct UploadReport {
    pub attachments: Vec<Attachment>,
    requested: usize,
}

impl UploadReport {
    pub fn succeeded(&self) -> usize {
        self.attachments.len()
    }

    pub fn requested(&self) -> usize {
        self.requested
    }

    pub fn is_partial(&self) -> bool {
        self.succeeded() < self.requested
    }
}

#[derive(Clone)]
pub struct AttachmentUploader {
    sink: Arc<dyn StorageSink>,
    context: String,
}

impl AttachmentUploader {
    pub fn new(sink: Arc<dyn StorageSink>, context: &str) -> Self {
        Self {
            sink,
            context: context.trim_matches('/').to_string(),
        }
    }

    /// Upload a batch for `sender_id` in `room_id`.
    ///
    /// Every ephemeral reference is read into memory before the first upload
    /// starts, so a reference that goes away mid-batch cannot take later items
    /// down with it. Individual failures are logged and skipped; the call only
    /// fails when nothing at all could be uploaded.
    pub async fn upload_all(
        &self,
        room_id: &str,
        sender_id: &str,
        pending: Vec<PendingUpload>,
    ) -> Result<UploadReport, UploadError> {
        let requested = pending.len();
        if requested == 0 {
            return Ok(UploadReport {
                attachments: Vec::new(),
                requested,
            });
        }

        let staged = join_all(pending.iter().map(|upload| async move {
            match &upload.source {
                LocalRef::Durable(url) => Staged::Durable(url.clone()),
                _ => Staged::Payload(upload.materialize().await),
            }
        }))
        .await;

        let timestamp = Utc::now().timestamp_millis();
        let uploads = pending
            .into_iter()
            .zip(staged)
            .enumerate()
            .map(|(index, (upload, staged))| {
                self.upload_one(room_id, sender_id, timestamp, index, upload, staged)
            });

        let mut attachments = Vec::with_capacity(requested);
        for (index, result) in join_all(uploads).await.into_iter().enumerate() {
            match result {
                Ok(attachment) => attachments.push(attachment),
                Err(e) => warn!(index, room_id, error = %e, "Attachment upload failed, continuing"),
            }
        }

        if attachments.is_empty() {
            return Err(UploadError::NothingUploaded { requested });
        }
        if attachments.len() < requested {
            warn!(
                succeeded = attachments.len(),
                requested, "Only part of the attachment batch was uploaded"
            );
        }

        Ok(UploadReport {
            attachments,
            requested,
        })
    }

    async fn upload_one(
        &self,
        room_id: &str,
        sender_id: &str,
        timestamp: i64,
        index: usize,
        upload: PendingUpload,
        staged: Staged,
    ) -> Result<Attachment, UploadError> {
        let bytes = match staged {
            Staged::Durable(url) => return Ok(into_attachment(upload, url)),
            Staged::Payload(bytes) => bytes?,
        };

        let path = self.destination_path(room_id, sender_id, timestamp, index, &upload.name);
        let url = self
            .sink
            .store(&path, bytes, upload.mime_type.as_deref())
            .await?;
        debug!(index, path = %path, "Attachment uploaded");

        Ok(into_attachment(upload, url))
    }

    /// `{context}/{room_id}/{sender_id}_{timestamp}_{index}_{random}_{name}`
    fn destination_path(
        &self,
        room_id: &str,
        sender_id: &str,
        timestamp: i64,
        index: usize,
        name: &str,
    ) -> String {
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| char::from(c).to_ascii_lowercase())
            .collect();
        format!(
            "{}/{}/{}_{}_{}_{}_{}",
            self.context,
            sanitize_name(room_id),
            sanitize_name(sender_id),
            timestamp,
            index,
            suffix,
            sanitize_name(name)
        )
    }
}

/// Result of the materialize phase for one item
enum Staged {
    Durable(String),
    Payload(Result<Vec<u8>, UploadError>),
}

fn into_attachment(upload: PendingUpload, url: String) -> Attachment {
    Attachment {
        url,
        kind: upload.kind,
        name: upload.name,
        size: upload.size,
        mime_type: upload.mime_type,
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches(|c| c == '_' || c == '.').is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}
