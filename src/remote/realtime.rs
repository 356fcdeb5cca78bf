use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ProfileDirectory, PushEvent, PushEventKind, PushService};
use crate::error::GatewayError;
use crate::rooms::{MessageId, MessagePatch, MessageRow, MessageStore, Profile, Room};

/// What the listener treats as current. Replaced on every room or user
/// change and read fresh for each event.
#[derive(Debug, Clone, Default)]
pub struct BridgeContext {
    pub room: Option<Room>,
    pub user: Option<Profile>,
}

impl BridgeContext {
    fn is_active(&self, room_id: &str) -> bool {
        self.room.as_ref().map(|r| r.id == room_id).unwrap_or(false)
    }
}

struct ActiveSubscription {
    id: String,
    room_id: String,
    listener: JoinHandle<()>,
}

/// Keeps exactly one push subscription open, for the room on screen, and
/// feeds its events into the message store.
pub struct RealtimeBridge {
    push: Arc<dyn PushService>,
    store: MessageStore,
    profiles: ProfileDirectory,
    context: Arc<RwLock<BridgeContext>>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl RealtimeBridge {
    pub fn new(push: Arc<dyn PushService>, store: MessageStore, profiles: ProfileDirectory) -> Self {
        Self {
            push,
            store,
            profiles,
            context: Arc::new(RwLock::new(BridgeContext::default())),
            active: Mutex::new(None),
        }
    }

    pub fn context(&self) -> BridgeContext {
        self.context.read().clone()
    }

    pub fn set_user(&self, user: Option<Profile>) {
        self.context.write().user = user;
    }

    pub async fn active_room(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|s| s.room_id.clone())
    }

    /// Switch the live subscription to `room`. The previous one is torn down
    /// before the new one is requested.
    pub async fn open_room(&self, room: Room) -> Result<(), GatewayError> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.teardown(previous).await;
        }

        self.context.write().room = Some(room.clone());
        let subscription = match self.push.subscribe(&room.id).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.context.write().room = None;
                return Err(e);
            }
        };

        let mut events = subscription.events;
        let context = self.context.clone();
        let store = self.store.clone();
        let profiles = self.profiles.clone();
        let listener = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                handle_event(&context, &store, &profiles, event);
            }
        });

        info!(room_id = %room.id, subscription = %subscription.id, "Subscribed to room");
        *active = Some(ActiveSubscription {
            id: subscription.id,
            room_id: room.id,
            listener,
        });
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(previous) = self.active.lock().await.take() {
            self.teardown(previous).await;
        }
        self.context.write().room = None;
    }

    async fn teardown(&self, subscription: ActiveSubscription) {
        subscription.listener.abort();
        self.push.unsubscribe(&subscription.id).await;
        debug!(room_id = %subscription.room_id, "Unsubscribed from room");
    }
}

fn handle_event(
    context: &Arc<RwLock<BridgeContext>>,
    store: &MessageStore,
    profiles: &ProfileDirectory,
    event: PushEvent,
) {
    let current = context.read().clone();
    let Some(room) = current.room.filter(|r| r.id == event.room_id) else {
        debug!(room_id = %event.room_id, "Discarding event for inactive room");
        return;
    };

    match event.kind {
        PushEventKind::Insert => {
            let mut message = match MessageRow::from_value(event.record) {
                Ok(row) => row.into_message(),
                Err(e) => {
                    warn!(room_id = %room.id, error = %e, "Unparseable insert event");
                    return;
                }
            };
            if message.room_id != room.id {
                return;
            }

            message.sender = room
                .participant(&message.sender_id)
                .cloned()
                .or_else(|| current.user.filter(|u| u.id == message.sender_id));
            let sender_id = message.sender_id.clone();
            let index = store.reconcile(message).index();

            let unresolved = store.update(&room.id, |log| {
                log.messages()
                    .get(index)
                    .filter(|m| m.sender.is_none())
                    .map(|m| m.id.clone())
            });
            if let Some(id) = unresolved {
                resolve_sender(context.clone(), store.clone(), profiles.clone(), room.id, id, sender_id);
            }
        }
        PushEventKind::Update => match MessagePatch::from_value(event.record) {
            Ok(patch) => {
                if !store.apply_patch(&room.id, &patch) {
                    debug!(room_id = %room.id, message_id = %patch.id, "Update for unknown message ignored");
                }
            }
            Err(e) => warn!(room_id = %room.id, error = %e, "Unparseable update event"),
        },
    }
}

/// Fetch a sender missing from the roster and patch it in, unless the user
/// has moved to another room in the meantime.
fn resolve_sender(
    context: Arc<RwLock<BridgeContext>>,
    store: MessageStore,
    profiles: ProfileDirectory,
    room_id: String,
    message_id: MessageId,
    sender_id: String,
) {
    tokio::spawn(async move {
        let profile = match profiles.fetch(&sender_id).await {
            Ok(profile) => profile,
            Err(e) => {
                warn!(sender_id = %sender_id, error = %e, "Sender profile lookup failed");
                return;
            }
        };
        let still_active = context.read().is_active(&room_id);
        if still_active {
            store.set_sender(&room_id, &message_id, profile);
        } else {
            debug!(room_id = %room_id, "Dropping sender lookup for inactive room");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentUploader;
    use crate::remote::LocalPushHub;
    use crate::rooms::{Draft, Message, MessageStatus, RoomType};
    use crate::testing::{json_response, test_gateway, MockTransport, RecordingSink};
    use reqwest::Method;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        hub: LocalPushHub,
        store: MessageStore,
        bridge: RealtimeBridge,
        transport: Arc<MockTransport>,
    }

    fn fixture() -> Fixture {
        let transport = Arc::new(MockTransport::default());
        let (gateway, _notices) = test_gateway(transport.clone());
        let uploader = AttachmentUploader::new(Arc::new(RecordingSink::default()), "chat-attachments");
        let store = MessageStore::new(gateway.clone(), uploader);
        let hub = LocalPushHub::new();
        let bridge = RealtimeBridge::new(
            Arc::new(hub.clone()),
            store.clone(),
            ProfileDirectory::new(gateway),
        );
        Fixture {
            hub,
            store,
            bridge,
            transport,
        }
    }

    fn room(id: &str) -> Room {
        Room::new(id, RoomType::Group).with_participants(vec![Profile::new("u2", "Lin")])
    }

    async fn eventually(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn insert_resolves_sender_from_roster() {
        let f = fixture();
        f.bridge.open_room(room("r1")).await.unwrap();

        f.hub.publish(
            "r1",
            PushEventKind::Insert,
            json!({"id": 10, "room_id": "r1", "sender_id": "u2", "content": "hey"}),
        );

        eventually(|| f.store.messages("r1").len() == 1).await;
        let message = &f.store.messages("r1")[0];
        assert_eq!(message.sender.as_ref().map(|p| p.display_name.as_str()), Some("Lin"));
        assert!(message.status.is_none());
        assert_eq!(f.transport.calls().len(), 0);
    }

    #[tokio::test]
    async fn unknown_sender_is_fetched_and_patched() {
        let f = fixture();
        f.transport.on(Method::GET, "/profiles/u9", |_| {
            Ok(json_response(200, json!({"id": "u9", "display_name": "Mo"})))
        });
        f.bridge.open_room(room("r1")).await.unwrap();

        f.hub.publish(
            "r1",
            PushEventKind::Insert,
            json!({"id": 11, "room_id": "r1", "sender_id": "u9", "content": "hi all"}),
        );

        eventually(|| {
            f.store
                .messages("r1")
                .first()
                .and_then(|m| m.sender.clone())
                .is_some()
        })
        .await;
        assert_eq!(f.store.messages("r1")[0].sender, Some(Profile::new("u9", "Mo")));
    }

    #[tokio::test(start_paused = true)]
    async fn late_profile_after_room_switch_is_discarded() {
        let f = fixture();
        f.transport.on_delayed(Method::GET, "/profiles/u9", Duration::from_millis(50), |_| {
            Ok(json_response(200, json!({"id": "u9", "display_name": "Mo"})))
        });
        f.bridge.open_room(room("r1")).await.unwrap();
        f.hub.publish(
            "r1",
            PushEventKind::Insert,
            json!({"id": 12, "room_id": "r1", "sender_id": "u9", "content": "late"}),
        );
        eventually(|| f.transport.count(&Method::GET, "/profiles/u9") == 1).await;

        f.bridge.open_room(room("r2")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let messages = f.store.messages("r1");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].sender.is_none());
    }

    #[tokio::test]
    async fn switching_rooms_keeps_one_subscription() {
        let f = fixture();
        f.bridge.open_room(room("r1")).await.unwrap();
        f.bridge.open_room(room("r2")).await.unwrap();

        assert_eq!(f.hub.subscriber_count("r1"), 0);
        assert_eq!(f.hub.subscriber_count("r2"), 1);
        assert_eq!(f.bridge.active_room().await.as_deref(), Some("r2"));

        f.bridge.close().await;
        assert_eq!(f.hub.subscriber_count("r2"), 0);
        assert!(f.bridge.context().room.is_none());
    }

    #[tokio::test]
    async fn send_finishing_after_room_switch_lands_in_its_room() {
        let f = fixture();
        f.transport.on_delayed(
            Method::POST,
            "/rooms/r1/messages",
            Duration::from_millis(30),
            |_| {
                Ok(json_response(
                    201,
                    json!({"id": 5, "room_id": "r1", "sender_id": "u1", "content": "first"}),
                ))
            },
        );
        f.bridge.open_room(room("r1")).await.unwrap();

        let send = tokio::spawn({
            let store = f.store.clone();
            async move { store.send(Draft::text("r1", &Profile::new("u1", "Ada"), "first")).await }
        });
        eventually(|| f.store.messages("r1").len() == 1).await;
        assert!(f.store.messages("r1")[0].is_sending());

        f.bridge.open_room(room("r2")).await.unwrap();
        let report = send.await.unwrap().unwrap();

        assert_eq!(f.bridge.active_room().await.as_deref(), Some("r2"));
        assert_eq!(report.message_id, MessageId::Server("5".into()));
        let messages = f.store.messages("r1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, Some(MessageStatus::Sent));
        assert!(f.store.messages("r2").is_empty());
    }

    #[tokio::test]
    async fn events_for_inactive_room_are_dropped() {
        let f = fixture();
        let context = Arc::new(RwLock::new(BridgeContext {
            room: Some(room("r2")),
            user: None,
        }));
        let profiles = ProfileDirectory::new(test_gateway(f.transport.clone()).0);

        handle_event(
            &context,
            &f.store,
            &profiles,
            PushEvent {
                room_id: "r1".into(),
                kind: PushEventKind::Insert,
                record: json!({"id": 1, "room_id": "r1", "sender_id": "u2", "content": "stale"}),
            },
        );

        assert!(f.store.messages("r1").is_empty());
    }

    #[tokio::test]
    async fn insert_confirms_own_optimistic_message() {
        let f = fixture();
        let me = Profile::new("u1", "Ada");
        f.bridge.set_user(Some(me.clone()));
        f.bridge.open_room(room("r1")).await.unwrap();
        f.store.update("r1", |log| {
            log.push_optimistic(Message::optimistic("r1", &me, "on my way", None, None))
        });

        f.hub.publish(
            "r1",
            PushEventKind::Insert,
            json!({"id": 77, "room_id": "r1", "sender_id": "u1", "content": "on my way"}),
        );

        eventually(|| !f.store.messages("r1")[0].is_sending()).await;
        let messages = f.store.messages("r1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, MessageId::Server("77".into()));
        assert_eq!(messages[0].status, Some(MessageStatus::Sent));
        assert_eq!(messages[0].sender, Some(me));
    }

    #[tokio::test]
    async fn update_patches_existing_and_never_creates() {
        let f = fixture();
        f.bridge.open_room(room("r1")).await.unwrap();
        f.hub.publish(
            "r1",
            PushEventKind::Insert,
            json!({"id": 20, "room_id": "r1", "sender_id": "u2", "content": "draft"}),
        );
        eventually(|| f.store.messages("r1").len() == 1).await;

        f.hub.publish("r1", PushEventKind::Update, json!({"id": 20, "content": "final"}));
        f.hub.publish("r1", PushEventKind::Update, json!({"id": 99, "content": "ghost"}));

        eventually(|| f.store.messages("r1")[0].content == "final").await;
        assert_eq!(f.store.messages("r1").len(), 1);
    }
}
