use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ApiRequest, RequestGateway};
use crate::error::GatewayError;
use crate::rooms::MessageRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEventKind {
    Insert,
    Update,
}

/// A row-level change notification, still in its raw shape
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub room_id: String,
    pub kind: PushEventKind,
    pub record: serde_json::Value,
}

pub struct PushSubscription {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<PushEvent>,
}

/// Publish/subscribe service keyed by room id
#[async_trait]
pub trait PushService: Send + Sync {
    async fn subscribe(&self, room_id: &str) -> Result<PushSubscription, GatewayError>;
    async fn unsubscribe(&self, subscription_id: &str);
}

/// In-process hub, used for loopback sessions and tests
#[derive(Clone, Default)]
pub struct LocalPushHub {
    subscribers: Arc<Mutex<HashMap<String, (String, mpsc::UnboundedSender<PushEvent>)>>>,
}

impl LocalPushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver to every live subscriber of `room_id`; returns how many received it
    pub fn publish(&self, room_id: &str, kind: PushEventKind, record: serde_json::Value) -> usize {
        let event = PushEvent {
            room_id: room_id.to_string(),
            kind,
            record,
        };
        let subscribers = self.subscribers.lock();
        subscribers
            .values()
            .filter(|(room, _)| room == room_id)
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn subscriber_count(&self, room_id: &str) -> usize {
        self.subscribers
            .lock()
            .values()
            .filter(|(room, _)| room == room_id)
            .count()
    }
}

#[async_trait]
impl PushService for LocalPushHub {
    async fn subscribe(&self, room_id: &str) -> Result<PushSubscription, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();
        self.subscribers
            .lock()
            .insert(id.clone(), (room_id.to_string(), tx));
        Ok(PushSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        self.subscribers.lock().remove(subscription_id);
    }
}

/// Push service over plain HTTP: polls a room's recent messages and emits
/// inserts for unseen rows and updates for rows whose `updated_at` moved.
pub struct PollingPushService {
    gateway: Arc<RequestGateway>,
    interval: Duration,
    pollers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PollingPushService {
    const PAGE_SIZE: usize = 50;

    pub fn new(gateway: Arc<RequestGateway>, interval: Duration) -> Self {
        Self {
            gateway,
            interval,
            pollers: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PushService for PollingPushService {
    async fn subscribe(&self, room_id: &str) -> Result<PushSubscription, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4().to_string();

        let gateway = self.gateway.clone();
        let interval = self.interval;
        let path = format!("/rooms/{}/messages?limit={}", room_id, Self::PAGE_SIZE);
        let room_id = room_id.to_string();
        let handle = tokio::spawn(async move {
            let mut seen: HashMap<String, Option<DateTime<Utc>>> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }
                // The next tick is the retry
                let request = ApiRequest::get(path.clone()).with_retries(0);
                let rows: Vec<serde_json::Value> = match gateway.send_json(request).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(room_id = %room_id, error = %e, "Message poll failed");
                        continue;
                    }
                };
                for event in diff_rows(&room_id, rows, &mut seen) {
                    if tx.send(event).is_err() {
                        return;
                    }
                }
            }
            debug!(room_id = %room_id, "Poller stopped");
        });

        self.pollers.lock().insert(id.clone(), handle);
        Ok(PushSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, subscription_id: &str) {
        if let Some(handle) = self.pollers.lock().remove(subscription_id) {
            handle.abort();
        }
    }
}

fn diff_rows(
    room_id: &str,
    rows: Vec<serde_json::Value>,
    seen: &mut HashMap<String, Option<DateTime<Utc>>>,
) -> Vec<PushEvent> {
    let mut events = Vec::new();
    for record in rows {
        let Ok(row) = MessageRow::from_value(record.clone()) else {
            debug!("Skipping unparseable polled row");
            continue;
        };
        let kind = match seen.insert(row.id.clone(), row.updated_at) {
            None => PushEventKind::Insert,
            Some(previous) if previous != row.updated_at => PushEventKind::Update,
            Some(_) => continue,
        };
        events.push(PushEvent {
            room_id: room_id.to_string(),
            kind,
            record,
        });
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{json_response, test_gateway, MockTransport};
    use reqwest::Method;
    use serde_json::json;

    #[tokio::test]
    async fn hub_delivers_only_to_matching_room() {
        let hub = LocalPushHub::new();
        let mut r1 = hub.subscribe("r1").await.unwrap();
        let mut r2 = hub.subscribe("r2").await.unwrap();

        assert_eq!(hub.publish("r1", PushEventKind::Insert, json!({"id": 1})), 1);

        assert_eq!(r1.events.recv().await.unwrap().record, json!({"id": 1}));
        assert!(r2.events.try_recv().is_err());

        hub.unsubscribe(&r1.id).await;
        assert_eq!(hub.subscriber_count("r1"), 0);
        assert_eq!(hub.publish("r1", PushEventKind::Insert, json!({"id": 2})), 0);
    }

    #[test]
    fn diff_emits_inserts_then_updates() {
        let mut seen = HashMap::new();
        let row = json!({"id": 1, "room_id": "r1", "sender_id": "u1", "content": "a"});
        let first = diff_rows("r1", vec![row.clone()], &mut seen);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, PushEventKind::Insert);

        assert!(diff_rows("r1", vec![row], &mut seen).is_empty());

        let edited = json!({
            "id": 1, "room_id": "r1", "sender_id": "u1", "content": "b",
            "updated_at": "2024-05-01T10:00:00Z"
        });
        let second = diff_rows("r1", vec![edited], &mut seen);
        assert_eq!(second[0].kind, PushEventKind::Update);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_emits_rows_and_stops_on_unsubscribe() {
        let transport = Arc::new(MockTransport::default());
        transport.on(Method::GET, "/rooms/r1/messages?limit=50", |_| {
            Ok(json_response(
                200,
                json!([{"id": 5, "room_id": "r1", "sender_id": "u2", "content": "yo"}]),
            ))
        });
        let (gateway, _notices) = test_gateway(transport.clone());
        let service = PollingPushService::new(gateway, Duration::from_secs(2));

        let mut subscription = service.subscribe("r1").await.unwrap();
        let event = subscription.events.recv().await.unwrap();
        assert_eq!(event.kind, PushEventKind::Insert);
        assert_eq!(event.room_id, "r1");

        service.unsubscribe(&subscription.id).await;
        assert!(subscription.events.recv().await.is_none());
    }
}
