use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, warn};

use tally_types::events::SyncEvent;
use tally_types::models::{GroupId, Message, MessageId, now_timestamp};

use crate::events::EventBus;

/// Hand-off of freshly created messages from one surface to another, before
/// any server round trip. Entries are consumed exactly once by
/// [`drain_pending_messages`](Self::drain_pending_messages).
pub struct PendingBuffer {
    inner: Mutex<HashMap<GroupId, Vec<Message>>>,
    events: EventBus,
}

impl PendingBuffer {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Buffer a message for `group_id` and signal that the group has
    /// something to drain. A missing id or timestamp is filled in.
    pub fn add_pending_message(&self, group_id: GroupId, mut msg: Message) {
        if msg.id.as_str().is_empty() {
            msg.id = MessageId::local();
        }
        if msg.created_at.trim().is_empty() {
            msg.created_at = now_timestamp();
        }

        {
            let Ok(mut inner) = self.inner.lock() else {
                warn!("Pending buffer lock poisoned, dropping message {}", msg.id);
                return;
            };
            let list = inner.entry(group_id).or_default();
            if list.iter().any(|m| m.id == msg.id) {
                debug!("Message {} already pending for group {}", msg.id, group_id);
            } else {
                list.push(msg);
            }
        }

        self.events.publish(SyncEvent::PendingReady { group_id });
    }

    /// Take everything buffered for `group_id`. Entries without text or a
    /// split are discarded.
    pub fn drain_pending_messages(&self, group_id: GroupId) -> Vec<Message> {
        let taken = match self.inner.lock() {
            Ok(mut inner) => inner.remove(&group_id).unwrap_or_default(),
            Err(e) => {
                warn!("Pending buffer lock poisoned: {}", e);
                return Vec::new();
            }
        };
        let total = taken.len();
        let usable: Vec<Message> = taken.into_iter().filter(Message::has_payload).collect();
        if usable.len() < total {
            debug!("Dropped {} empty pending messages for group {}", total - usable.len(), group_id);
        }
        usable
    }

    pub fn has_pending(&self, group_id: GroupId) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.get(&group_id).is_some_and(|l| !l.is_empty()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::models::{MessageKind, SyncStatus, UserSummary};

    fn bare(id: &str, text: Option<&str>) -> Message {
        Message {
            id: MessageId::new(id),
            group_id: 7,
            sender: UserSummary::unknown(),
            kind: MessageKind::Text,
            text: text.map(str::to_string),
            split: None,
            created_at: String::new(),
            status: SyncStatus::Pending,
            attempts: 0,
        }
    }

    #[test]
    fn drain_returns_each_message_once() {
        let buffer = PendingBuffer::new(EventBus::default());
        buffer.add_pending_message(7, bare("a", Some("hi")));
        assert!(buffer.has_pending(7));

        let first = buffer.drain_pending_messages(7);
        assert_eq!(first.len(), 1);
        assert!(buffer.drain_pending_messages(7).is_empty());
        assert!(!buffer.has_pending(7));
    }

    #[test]
    fn fills_missing_id_and_timestamp() {
        let buffer = PendingBuffer::new(EventBus::default());
        buffer.add_pending_message(7, bare("", Some("hi")));
        let drained = buffer.drain_pending_messages(7);
        assert!(drained[0].id.as_str().starts_with("local-"));
        assert!(drained[0].created_at_ms().is_some());
    }

    #[test]
    fn same_id_is_buffered_once() {
        let buffer = PendingBuffer::new(EventBus::default());
        buffer.add_pending_message(7, bare("a", Some("hi")));
        buffer.add_pending_message(7, bare("a", Some("hi again")));
        buffer.add_pending_message(8, bare("a", Some("other group")));
        let drained = buffer.drain_pending_messages(7);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].text.as_deref(), Some("hi"));
        assert_eq!(buffer.drain_pending_messages(8).len(), 1);
    }

    #[test]
    fn empty_messages_are_not_delivered() {
        let buffer = PendingBuffer::new(EventBus::default());
        buffer.add_pending_message(7, bare("a", None));
        buffer.add_pending_message(7, bare("b", Some("")));
        buffer.add_pending_message(7, bare("c", Some("ok")));
        let drained = buffer.drain_pending_messages(7);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id.as_str(), "c");
    }

    #[tokio::test]
    async fn signal_carries_only_the_group() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let buffer = PendingBuffer::new(events);
        buffer.add_pending_message(7, bare("a", Some("hi")));
        match rx.recv().await.unwrap() {
            SyncEvent::PendingReady { group_id } => assert_eq!(group_id, 7),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
