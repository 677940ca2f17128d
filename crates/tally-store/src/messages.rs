use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use tally_types::models::{GroupId, Message, MessageId, sort_timeline};

use crate::kv::KvStore;

fn key_for(group_id: GroupId) -> String {
    format!("local_msgs_{}", group_id)
}

/// Per-group durable cache of the merged message timeline.
///
/// Writes are keyed by message id so a reconciliation pass and a resend pass
/// touching the same group can interleave without losing each other's work.
pub struct LocalMessageStore {
    kv: Arc<dyn KvStore>,
    // serializes read-modify-write cycles on a group key
    write_lock: Mutex<()>,
}

impl LocalMessageStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    /// Cached timeline for a group, ordered by `created_at`.
    pub fn get(&self, group_id: GroupId) -> Result<Vec<Message>> {
        let mut list = self.load(group_id)?;
        sort_timeline(&mut list);
        Ok(list)
    }

    /// Append a message unless one with the same id is already cached.
    /// Returns whether the message was inserted.
    pub fn add(&self, group_id: GroupId, msg: &Message) -> Result<bool> {
        self.mutate(group_id, |list| {
            if list.iter().any(|m| m.id == msg.id) {
                return false;
            }
            list.push(msg.clone());
            true
        })
    }

    /// Replace by id only if the message is still cached. Returns whether it
    /// was found. Used by writers that must not resurrect a removed echo.
    pub fn update(&self, group_id: GroupId, msg: &Message) -> Result<bool> {
        self.mutate(group_id, |list| match list.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => {
                *existing = msg.clone();
                true
            }
            None => false,
        })
    }

    /// Returns whether anything was removed.
    pub fn remove(&self, group_id: GroupId, id: &MessageId) -> Result<bool> {
        self.mutate(group_id, |list| {
            let before = list.len();
            list.retain(|m| &m.id != id);
            list.len() != before
        })
    }

    /// Swap one cached message for another in a single write.
    pub fn replace(&self, group_id: GroupId, old_id: &MessageId, msg: &Message) -> Result<()> {
        self.mutate(group_id, |list| {
            list.retain(|m| &m.id != old_id && m.id != msg.id);
            list.push(msg.clone());
            true
        })?;
        Ok(())
    }

    /// Overwrite the cached timeline.
    ///
    /// An empty list never replaces a non-empty cache; a transient empty
    /// response must not wipe history. Use [`clear`](Self::clear) to empty
    /// a group deliberately. Returns whether the cache was written.
    pub fn replace_all(&self, group_id: GroupId, msgs: &[Message]) -> Result<bool> {
        let _guard = self.lock()?;
        if msgs.is_empty() && !self.load(group_id)?.is_empty() {
            warn!("Refusing to overwrite cached timeline of group {} with an empty list", group_id);
            return Ok(false);
        }
        self.save(group_id, msgs)?;
        debug!("Cached {} messages for group {}", msgs.len(), group_id);
        Ok(true)
    }

    pub fn clear(&self, group_id: GroupId) -> Result<()> {
        let _guard = self.lock()?;
        self.kv.remove(&key_for(group_id))
    }

    fn mutate<F>(&self, group_id: GroupId, f: F) -> Result<bool>
    where
        F: FnOnce(&mut Vec<Message>) -> bool,
    {
        let _guard = self.lock()?;
        let mut list = self.load(group_id)?;
        let changed = f(&mut list);
        if changed {
            self.save(group_id, &list)?;
        }
        Ok(changed)
    }

    fn load(&self, group_id: GroupId) -> Result<Vec<Message>> {
        let Some(raw) = self.kv.get(&key_for(group_id))? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<Message>>(&raw) {
            Ok(list) => Ok(list),
            Err(e) => {
                warn!("Discarding unreadable message cache for group {}: {}", group_id, e);
                Ok(Vec::new())
            }
        }
    }

    fn save(&self, group_id: GroupId, msgs: &[Message]) -> Result<()> {
        let raw = serde_json::to_string(msgs).context("encoding message cache")?;
        self.kv.set(&key_for(group_id), &raw)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|e| anyhow!("Message store lock poisoned: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKv, SqliteKv};
    use tally_types::models::{MessageKind, SyncStatus, UserSummary};

    fn msg(id: &str, created_at: &str, text: &str) -> Message {
        Message {
            id: id.into(),
            group_id: 7,
            sender: UserSummary { id: 1, name: "Ana".into(), email: "ana@example.com".into() },
            kind: MessageKind::Text,
            text: Some(text.into()),
            split: None,
            created_at: created_at.into(),
            status: SyncStatus::Synced,
            attempts: 0,
        }
    }

    fn store() -> LocalMessageStore {
        LocalMessageStore::new(Arc::new(SqliteKv::open_in_memory().unwrap()))
    }

    #[test]
    fn add_is_idempotent_on_id() {
        let store = store();
        let m = msg("501", "2024-01-01T10:00:00Z", "hi");
        assert!(store.add(7, &m).unwrap());
        let once = store.get(7).unwrap();

        let mut dup = m.clone();
        dup.text = Some("changed".into());
        assert!(!store.add(7, &dup).unwrap());

        let twice = store.get(7).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.len(), 1);
        assert_eq!(twice[0].text.as_deref(), Some("hi"));
    }

    #[test]
    fn get_returns_sorted_timeline() {
        let store = store();
        store.add(7, &msg("2", "2024-01-01T10:00:05Z", "b")).unwrap();
        store.add(7, &msg("1", "2024-01-01T10:00:00Z", "a")).unwrap();
        store.add(7, &msg("0", "garbage", "z")).unwrap();
        let ids: Vec<String> = store.get(7).unwrap().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[test]
    fn groups_are_isolated() {
        let store = store();
        store.add(7, &msg("1", "2024-01-01T10:00:00Z", "a")).unwrap();
        assert!(store.get(8).unwrap().is_empty());
    }

    #[test]
    fn remove_and_replace() {
        let store = store();
        let local = msg("local-1", "2024-01-01T10:00:00Z", "a");
        store.add(7, &local).unwrap();
        store.add(7, &msg("2", "2024-01-01T10:00:01Z", "b")).unwrap();

        let server = msg("900", "2024-01-01T10:00:02Z", "a");
        store.replace(7, &local.id, &server).unwrap();
        let ids: Vec<String> = store.get(7).unwrap().iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, vec!["2", "900"]);

        assert!(store.remove(7, &"2".into()).unwrap());
        assert!(!store.remove(7, &"2".into()).unwrap());
        assert_eq!(store.get(7).unwrap().len(), 1);
    }

    #[test]
    fn update_never_inserts() {
        let store = store();
        let mut m = msg("local-1", "2024-01-01T10:00:00Z", "a");
        assert!(!store.update(7, &m).unwrap());
        assert!(store.get(7).unwrap().is_empty());

        store.add(7, &m).unwrap();
        m.status = SyncStatus::Failed;
        assert!(store.update(7, &m).unwrap());
        assert_eq!(store.get(7).unwrap()[0].status, SyncStatus::Failed);
    }

    #[test]
    fn replace_all_refuses_empty_overwrite() {
        let store = store();
        store.add(7, &msg("1", "2024-01-01T10:00:00Z", "a")).unwrap();
        assert!(!store.replace_all(7, &[]).unwrap());
        assert_eq!(store.get(7).unwrap().len(), 1);

        let next = vec![msg("5", "2024-01-01T10:00:00Z", "x"), msg("6", "2024-01-01T10:00:01Z", "y")];
        assert!(store.replace_all(7, &next).unwrap());
        assert_eq!(store.get(7).unwrap().len(), 2);

        store.clear(7).unwrap();
        assert!(store.get(7).unwrap().is_empty());
        assert!(store.replace_all(7, &[]).unwrap());
    }

    #[test]
    fn corrupt_cache_reads_as_empty() {
        let kv = Arc::new(MemoryKv::new());
        kv.set("local_msgs_7", "{not json").unwrap();
        let store = LocalMessageStore::new(kv);
        assert!(store.get(7).unwrap().is_empty());
        store.add(7, &msg("1", "2024-01-01T10:00:00Z", "a")).unwrap();
        assert_eq!(store.get(7).unwrap().len(), 1);
    }
}
