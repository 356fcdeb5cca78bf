use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{GatewayError, NetworkError};

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Binary { bytes: Vec<u8>, content_type: String },
}

/// One logical call to the remote API, independent of which base URL serves it
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: RequestBody,
    /// Overrides the gateway's retry budget for this call
    pub max_retries: Option<u32>,
    pub authenticated: bool,
    pub(crate) auth_retried: bool,
    pub(crate) failover_attempted: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: RequestBody::Empty,
            max_retries: None,
            authenticated: true,
            auth_retried: false,
            failover_attempted: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        let mut request = Self::new(Method::POST, path);
        request.body = RequestBody::Json(body);
        request
    }

    pub fn put_bytes(path: impl Into<String>, bytes: Vec<u8>, content_type: &str) -> Self {
        let mut request = Self::new(Method::PUT, path);
        request.body = RequestBody::Binary {
            bytes,
            content_type: content_type.to_string(),
        };
        request
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, GatewayError> {
        serde_json::from_slice(&self.body).map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

/// Executes a single HTTP exchange. Any HTTP status is a response; only a
/// missing response is an error.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(
        &self,
        base_url: &str,
        request: &ApiRequest,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<ApiResponse, NetworkError>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("roomchat/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(
        &self,
        base_url: &str,
        request: &ApiRequest,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<ApiResponse, NetworkError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .timeout(timeout);

        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Binary { bytes, content_type } => builder
                .header(CONTENT_TYPE, content_type.as_str())
                .body(bytes.clone()),
        };

        let response = builder.send().await.map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(classify)?;

        Ok(ApiResponse::new(status, body.to_vec()))
    }
}

fn classify(err: reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        NetworkError::Timeout
    } else {
        NetworkError::NoResponse(err.to_string())
    }
}
