use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::UploadError;
use crate::remote::{ApiRequest, RequestGateway};

/// Object storage: takes bytes and a destination path, returns a durable URL
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, UploadError>;
}

#[derive(Deserialize)]
struct StoredObject {
    url: String,
}

/// Storage reached over HTTP through the request gateway
pub struct GatewaySink {
    gateway: Arc<RequestGateway>,
}

impl GatewaySink {
    pub fn new(gateway: Arc<RequestGateway>) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl StorageSink for GatewaySink {
    async fn store(
        &self,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<String, UploadError> {
        let request = ApiRequest::put_bytes(
            format!("/storage/{}", path),
            bytes,
            content_type.unwrap_or("application/octet-stream"),
        );

        let rejected = |reason: String| UploadError::Rejected {
            path: path.to_string(),
            reason,
        };
        let response = self
            .gateway
            .send(request)
            .await
            .map_err(|e| rejected(e.to_string()))?;
        let stored: StoredObject = response.json().map_err(|e| rejected(e.to_string()))?;

        Ok(stored.url)
    }
}
