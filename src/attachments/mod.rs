use std::path::{Path, PathBuf};
use tokio::fs;

use crate::error::{UploadError, ValidationError};
use crate::rooms::AttachmentKind;

pub use sink::{GatewaySink, StorageSink};
pub use uploader::{AttachmentUploader, UploadReport};

mod sink;
mod uploader;

/// Per-file ceiling, checked before the uploader runs
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Where an attachment's bytes currently live
#[derive(Debug, Clone, PartialEq)]
pub enum LocalRef {
    /// Already uploaded; passed through untouched
    Durable(String),
    File(PathBuf),
    Memory(Vec<u8>),
}

/// An attachment picked by the user but not uploaded yet
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpload {
    pub source: LocalRef,
    pub name: String,
    pub kind: AttachmentKind,
    pub size: Option<u64>,
    pub mime_type: Option<String>,
}

impl PendingUpload {
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        let mime_type = mime_guess::from_path(path).first().map(|m| m.to_string());

        Ok(Self {
            source: LocalRef::File(path.to_path_buf()),
            kind: AttachmentKind::from_mime(mime_type.as_deref()),
            name,
            size: Some(metadata.len()),
            mime_type,
        })
    }

    pub fn from_bytes(name: &str, bytes: Vec<u8>, mime_type: Option<&str>) -> Self {
        let mime_type = mime_type
            .map(str::to_string)
            .or_else(|| mime_guess::from_path(name).first().map(|m| m.to_string()));
        Self {
            kind: AttachmentKind::from_mime(mime_type.as_deref()),
            name: name.to_string(),
            size: Some(bytes.len() as u64),
            mime_type,
            source: LocalRef::Memory(bytes),
        }
    }

    /// Read the bytes behind an ephemeral reference
    pub(crate) async fn materialize(&self) -> Result<Vec<u8>, UploadError> {
        match &self.source {
            LocalRef::Memory(bytes) => Ok(bytes.clone()),
            LocalRef::File(path) => fs::read(path).await.map_err(|e| UploadError::Unreadable {
                name: self.name.clone(),
                reason: e.to_string(),
            }),
            LocalRef::Durable(url) => Err(UploadError::Unreadable {
                name: self.name.clone(),
                reason: format!("{} is already uploaded", url),
            }),
        }
    }
}

/// Reject any file over the size ceiling before an upload is attempted
pub fn check_size_limit(pending: &[PendingUpload]) -> Result<(), ValidationError> {
    for upload in pending {
        let size = match (&upload.source, upload.size) {
            (LocalRef::Memory(bytes), _) => Some(bytes.len() as u64),
            (_, size) => size,
        };
        if let Some(size) = size.filter(|s| *s > MAX_ATTACHMENT_BYTES) {
            return Err(ValidationError::AttachmentTooLarge {
                name: upload.name.clone(),
                size,
                limit: MAX_ATTACHMENT_BYTES,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn from_path_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diagram.png");
        tokio::fs::write(&path, b"\x89PNG....").await.unwrap();

        let pending = PendingUpload::from_path(&path).await.unwrap();

        assert_eq!(pending.name, "diagram.png");
        assert_eq!(pending.kind, AttachmentKind::Image);
        assert_eq!(pending.mime_type.as_deref(), Some("image/png"));
        assert_eq!(pending.size, Some(8));
        assert_eq!(pending.materialize().await.unwrap(), b"\x89PNG....".to_vec());
    }

    #[test]
    fn size_limit_is_enforced_per_file() {
        let small = PendingUpload::from_bytes("a.txt", vec![0; 16], None);
        assert!(check_size_limit(&[small.clone()]).is_ok());

        let mut big = PendingUpload::from_bytes("big.pdf", Vec::new(), None);
        big.source = LocalRef::File("/tmp/big.pdf".into());
        big.size = Some(MAX_ATTACHMENT_BYTES + 1);

        let err = check_size_limit(&[small, big]).unwrap_err();
        assert!(matches!(err, ValidationError::AttachmentTooLarge { ref name, .. } if name == "big.pdf"));
    }

    #[test]
    fn kind_follows_mime_type() {
        assert_eq!(PendingUpload::from_bytes("x.jpg", vec![], None).kind, AttachmentKind::Image);
        assert_eq!(PendingUpload::from_bytes("x.pdf", vec![], None).kind, AttachmentKind::File);
        assert_eq!(
            PendingUpload::from_bytes("blob", vec![], Some("image/webp")).kind,
            AttachmentKind::Image
        );
    }
}
