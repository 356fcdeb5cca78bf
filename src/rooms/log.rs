use super::{Message, MessageId, MessagePatch, MessageStatus, Profile};
use crate::codec;

/// What `RoomLog::reconcile` did with a confirmed record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// The id was already present; fields were refreshed in place
    Refreshed { index: usize },
    /// An optimistic entry was replaced by the confirmed record
    Confirmed { index: usize, temporary_id: MessageId },
    /// No local counterpart; the record was appended
    Appended { index: usize },
}

impl Reconciled {
    pub fn index(&self) -> usize {
        match self {
            Reconciled::Refreshed { index }
            | Reconciled::Confirmed { index, .. }
            | Reconciled::Appended { index } => *index,
        }
    }
}

/// Ordered messages of one room. Display order is append order; confirmations
/// replace entries in place and never re-sort.
#[derive(Debug, Clone, Default)]
pub struct RoomLog {
    messages: Vec<Message>,
}

impl RoomLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn sending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.is_sending()).count()
    }

    pub fn push_optimistic(&mut self, message: Message) -> usize {
        debug_assert!(message.id.is_temporary() && message.is_sending());
        self.messages.push(message);
        self.messages.len() - 1
    }

    pub fn reconcile(&mut self, confirmed: Message) -> Reconciled {
        // Same id seen before: refresh, never duplicate
        if let Some(index) = self.position(&confirmed.id) {
            refresh(&mut self.messages[index], confirmed);
            return Reconciled::Refreshed { index };
        }

        // Earliest unmatched optimistic entry with the same sender and text
        let matched = self.messages.iter().position(|m| {
            m.is_sending()
                && m.room_id == confirmed.room_id
                && m.sender_id == confirmed.sender_id
                && m.content.trim() == confirmed.content.trim()
        });

        if let Some(index) = matched {
            let local = std::mem::replace(&mut self.messages[index], confirmed);
            let entry = &mut self.messages[index];
            entry.sender = local.sender.or(entry.sender.take());
            if entry.attachments.is_none() {
                entry.attachments = local.attachments;
            }
            if entry.shared_item.is_none() {
                entry.shared_item = local.shared_item;
            }
            entry.status = Some(MessageStatus::Sent);
            return Reconciled::Confirmed {
                index,
                temporary_id: local.id,
            };
        }

        self.messages.push(confirmed);
        Reconciled::Appended {
            index: self.messages.len() - 1,
        }
    }

    /// Only a message still sending can fail; confirmed messages stay sent
    pub fn mark_failed(&mut self, id: &MessageId) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) if message.is_sending() => {
                message.status = Some(MessageStatus::Failed);
                true
            }
            _ => false,
        }
    }

    /// Fail the entry of a send whose write was rejected. A confirmation for
    /// an identical message may already have consumed `id`; the entries are
    /// interchangeable, so the latest remaining sending twin fails instead.
    pub fn fail_send(&mut self, id: &MessageId, sender_id: &str, content: &str) -> Option<MessageId> {
        if self.mark_failed(id) {
            return Some(id.clone());
        }
        let twin = self.messages.iter_mut().rev().find(|m| {
            m.is_sending() && m.sender_id == sender_id && m.content.trim() == content.trim()
        })?;
        twin.status = Some(MessageStatus::Failed);
        Some(twin.id.clone())
    }

    /// Merge an UPDATE into an existing entry. Unknown ids are ignored.
    pub fn apply_patch(&mut self, patch: &MessagePatch) -> bool {
        let Some(index) = self.position(&patch.id()) else {
            return false;
        };
        let message = &mut self.messages[index];

        if let Some(raw) = &patch.content {
            let decoded = codec::decode(raw);
            message.content = decoded.text;
            if let Some(attachments) = decoded.attachments.filter(|a| !a.is_empty()) {
                message.attachments = Some(attachments);
            }
            if decoded.shared_item.is_some() {
                message.shared_item = decoded.shared_item;
            }
        }
        if let Some(created_at) = patch.created_at {
            message.created_at = created_at;
        }
        true
    }

    pub fn set_sender(&mut self, id: &MessageId, profile: Profile) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.sender = Some(profile);
                true
            }
            None => false,
        }
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }
}

fn refresh(existing: &mut Message, incoming: Message) {
    existing.content = incoming.content;
    existing.created_at = incoming.created_at;
    if incoming.attachments.is_some() {
        existing.attachments = incoming.attachments;
    }
    if incoming.shared_item.is_some() {
        existing.shared_item = incoming.shared_item;
    }
    if incoming.sender.is_some() {
        existing.sender = incoming.sender;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::{Attachment, AttachmentKind};
    use chrono::Utc;

    fn ada() -> Profile {
        Profile::new("u1", "Ada")
    }

    fn confirmed(id: &str, sender_id: &str, content: &str) -> Message {
        Message {
            id: MessageId::Server(id.to_string()),
            room_id: "r1".into(),
            sender_id: sender_id.into(),
            content: content.into(),
            attachments: None,
            shared_item: None,
            created_at: Utc::now(),
            status: None,
            sender: None,
        }
    }

    #[test]
    fn same_confirmation_twice_is_idempotent() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "hi", None, None));

        let first = log.reconcile(confirmed("42", "u1", "hi"));
        let second = log.reconcile(confirmed("42", "u1", "hi"));

        assert!(matches!(first, Reconciled::Confirmed { index: 0, .. }));
        assert_eq!(second, Reconciled::Refreshed { index: 0 });
        assert_eq!(log.len(), 1);
        let message = log.get(&MessageId::Server("42".into())).unwrap();
        assert_eq!(message.status, Some(MessageStatus::Sent));
        assert_eq!(message.sender, Some(ada()));
    }

    #[test]
    fn identical_sends_consume_distinct_entries_in_either_order() {
        for order in [["1", "2"], ["2", "1"]] {
            let mut log = RoomLog::new();
            let a = log.push_optimistic(Message::optimistic("r1", &ada(), "same", None, None));
            let b = log.push_optimistic(Message::optimistic("r1", &ada(), "same", None, None));
            assert_eq!((a, b), (0, 1));

            let first = log.reconcile(confirmed(order[0], "u1", "same"));
            let second = log.reconcile(confirmed(order[1], "u1", "same"));

            assert_eq!(first.index(), 0);
            assert_eq!(second.index(), 1);
            assert_eq!(log.len(), 2);
            assert_eq!(log.sending_count(), 0);
            assert!(log.messages().iter().all(|m| m.status == Some(MessageStatus::Sent)));
            assert_ne!(log.messages()[0].id, log.messages()[1].id);
        }
    }

    #[test]
    fn foreign_messages_are_appended_without_status() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "mine", None, None));

        let outcome = log.reconcile(confirmed("9", "u2", "mine"));

        assert_eq!(outcome, Reconciled::Appended { index: 1 });
        assert_eq!(log.sending_count(), 1);
        assert!(log.messages()[1].status.is_none());
    }

    #[test]
    fn different_text_does_not_match() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "one", None, None));
        let outcome = log.reconcile(confirmed("5", "u1", "two"));
        assert!(matches!(outcome, Reconciled::Appended { .. }));
        assert_eq!(log.sending_count(), 1);
    }

    #[test]
    fn confirmation_keeps_uploaded_attachments_when_content_has_none() {
        let attachment = Attachment {
            url: "https://cdn.test/a.png".into(),
            kind: AttachmentKind::Image,
            name: "a.png".into(),
            size: None,
            mime_type: None,
        };
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "", Some(vec![attachment.clone()]), None));

        log.reconcile(confirmed("7", "u1", ""));

        assert_eq!(log.messages()[0].attachments, Some(vec![attachment]));
    }

    #[test]
    fn failed_messages_stay_failed_and_are_not_matched() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "oops", None, None));
        let temp_id = log.messages()[0].id.clone();

        assert!(log.mark_failed(&temp_id));
        assert!(!log.mark_failed(&temp_id));
        assert_eq!(log.messages()[0].status, Some(MessageStatus::Failed));

        let outcome = log.reconcile(confirmed("3", "u1", "oops"));
        assert!(matches!(outcome, Reconciled::Appended { .. }));
    }

    #[test]
    fn failed_send_falls_back_to_identical_twin() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "same", None, None));
        log.push_optimistic(Message::optimistic("r1", &ada(), "same", None, None));
        let first = log.messages()[0].id.clone();
        let second = log.messages()[1].id.clone();

        // The second send's confirmation takes the earliest entry
        log.reconcile(confirmed("2", "u1", "same"));

        assert_eq!(log.fail_send(&first, "u1", "same"), Some(second.clone()));
        assert_eq!(log.get(&second).unwrap().status, Some(MessageStatus::Failed));
        assert_eq!(log.sending_count(), 0);
        assert_eq!(log.fail_send(&first, "u1", "same"), None);
    }

    #[test]
    fn sent_messages_cannot_fail() {
        let mut log = RoomLog::new();
        log.push_optimistic(Message::optimistic("r1", &ada(), "hi", None, None));
        log.reconcile(confirmed("42", "u1", "hi"));
        assert!(!log.mark_failed(&MessageId::Server("42".into())));
        assert_eq!(log.messages()[0].status, Some(MessageStatus::Sent));
    }

    #[test]
    fn patches_merge_but_never_create() {
        let mut log = RoomLog::new();
        log.reconcile(confirmed("1", "u2", "before"));

        let patch: MessagePatch =
            serde_json::from_value(serde_json::json!({"id": 1, "content": "after"})).unwrap();
        assert!(log.apply_patch(&patch));
        assert_eq!(log.messages()[0].content, "after");

        let unknown: MessagePatch =
            serde_json::from_value(serde_json::json!({"id": "nope", "content": "x"})).unwrap();
        assert!(!log.apply_patch(&unknown));
        assert_eq!(log.len(), 1);
    }
}
