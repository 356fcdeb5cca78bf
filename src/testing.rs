//! Scripted collaborators shared by the unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::attachments::StorageSink;
use crate::error::{NetworkError, UploadError};
use crate::remote::{
    ApiRequest, ApiResponse, HttpTransport, Notice, RequestBody, RequestGateway, Session,
    SessionStore,
};

/// One exchange seen by `MockTransport`
#[derive(Debug, Clone)]
pub struct Call {
    pub base_url: String,
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
    pub timeout: Duration,
}

type Responder = Arc<dyn Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync>;

struct Route {
    method: Method,
    path: String,
    delay: Option<Duration>,
    respond: Responder,
}

/// Route-based transport. Unrouted calls answer 404.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<Call>>,
}

impl MockTransport {
    pub fn on<F>(&self, method: Method, path: &str, respond: F)
    where
        F: Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync + 'static,
    {
        self.route(method, path, None, respond);
    }

    /// Like `on`, but the response only arrives after `delay`
    pub fn on_delayed<F>(&self, method: Method, path: &str, delay: Duration, respond: F)
    where
        F: Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync + 'static,
    {
        self.route(method, path, Some(delay), respond);
    }

    fn route<F>(&self, method: Method, path: &str, delay: Option<Duration>, respond: F)
    where
        F: Fn(&Call) -> Result<ApiResponse, NetworkError> + Send + Sync + 'static,
    {
        self.routes.lock().push(Route {
            method,
            path: path.to_string(),
            delay,
            respond: Arc::new(respond),
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: &Method, path: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| &c.method == method && c.path == path)
            .count()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(
        &self,
        base_url: &str,
        request: &ApiRequest,
        bearer: Option<&str>,
        timeout: Duration,
    ) -> Result<ApiResponse, NetworkError> {
        let call = Call {
            base_url: base_url.to_string(),
            method: request.method.clone(),
            path: request.path.clone(),
            bearer: bearer.map(str::to_string),
            body: request.body.clone(),
            timeout,
        };
        self.calls.lock().push(call.clone());

        let route = self
            .routes
            .lock()
            .iter()
            .find(|r| r.method == call.method && r.path == call.path)
            .map(|r| (r.delay, r.respond.clone()));

        match route {
            Some((delay, respond)) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                respond(&call)
            }
            None => Ok(ApiResponse::new(404, "no route")),
        }
    }
}

pub fn json_response(status: u16, body: serde_json::Value) -> ApiResponse {
    ApiResponse::new(status, body.to_string())
}

/// Gateway against `https://api.test`, signed in as `u1`
pub fn test_gateway(
    transport: Arc<MockTransport>,
) -> (Arc<RequestGateway>, mpsc::UnboundedReceiver<Notice>) {
    let session = SessionStore::in_memory(Some(Session {
        user_id: "u1".into(),
        access_token: "token-1".into(),
        refresh_token: Some("refresh-1".into()),
    }));
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let gateway = RequestGateway::new(transport, "https://api.test", session, notice_tx);
    (Arc::new(gateway), notice_rx)
}

/// Storage sink that keeps uploads in memory and fails for chosen file names
#[derive(Default)]
pub struct RecordingSink {
    failing: Vec<String>,
    stored: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingSink {
    pub fn failing_on(names: &[&str]) -> Self {
        Self {
            failing: names.iter().map(|n| format!("_{}", n)).collect(),
            stored: Mutex::new(Vec::new()),
        }
    }

    pub fn stored(&self) -> Vec<(String, Vec<u8>)> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl StorageSink for RecordingSink {
    async fn store(
        &self,
        path: &str,
        bytes: Vec<u8>,
        _content_type: Option<&str>,
    ) -> Result<String, UploadError> {
        if self.failing.iter().any(|suffix| path.ends_with(suffix.as_str())) {
            return Err(UploadError::Rejected {
                path: path.to_string(),
                reason: "scripted failure".into(),
            });
        }
        self.stored.lock().push((path.to_string(), bytes));
        Ok(format!("https://storage.test/{}", path))
    }
}
