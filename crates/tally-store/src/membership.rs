use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::warn;

use tally_types::models::{GroupId, UserId};

use crate::kv::KvStore;

fn key_for_groups(user_id: UserId) -> String {
    format!("user_{}_groups", user_id)
}

fn key_for_seen_groups(user_id: UserId) -> String {
    format!("user_{}_groups_seen", user_id)
}

/// Remembered group id sets, used to notice membership changes.
pub struct MembershipSnapshotStore {
    kv: Arc<dyn KvStore>,
}

impl MembershipSnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    // -- Groups the user belongs to --

    pub fn last_group_ids(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        self.read_ids(&key_for_groups(user_id))
    }

    pub fn set_last_group_ids(&self, user_id: UserId, ids: &[GroupId]) -> Result<()> {
        self.write_ids(&key_for_groups(user_id), ids)
    }

    // -- Groups the user has opened (drives the NEW badge) --

    pub fn seen_group_ids(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        self.read_ids(&key_for_seen_groups(user_id))
    }

    pub fn add_seen_group(&self, user_id: UserId, group_id: GroupId) -> Result<()> {
        let mut seen = self.seen_group_ids(user_id)?;
        if !seen.contains(&group_id) {
            seen.push(group_id);
            self.write_ids(&key_for_seen_groups(user_id), &seen)?;
        }
        Ok(())
    }

    fn read_ids(&self, key: &str) -> Result<Vec<i64>> {
        let Some(raw) = self.kv.get(key)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                warn!("Ignoring unreadable id set under {}: {}", key, e);
                Ok(Vec::new())
            }
        }
    }

    fn write_ids(&self, key: &str, ids: &[i64]) -> Result<()> {
        let raw = serde_json::to_string(ids).context("encoding id set")?;
        self.kv.set(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> MembershipSnapshotStore {
        MembershipSnapshotStore::new(Arc::new(MemoryKv::new()))
    }

    #[test]
    fn group_snapshot_is_overwritten_wholesale() {
        let store = store();
        assert!(store.last_group_ids(1).unwrap().is_empty());
        store.set_last_group_ids(1, &[3, 4]).unwrap();
        store.set_last_group_ids(1, &[4, 5]).unwrap();
        assert_eq!(store.last_group_ids(1).unwrap(), vec![4, 5]);
        assert!(store.last_group_ids(2).unwrap().is_empty());
    }

    #[test]
    fn seen_groups_accumulate_without_duplicates() {
        let store = store();
        store.add_seen_group(1, 9).unwrap();
        store.add_seen_group(1, 9).unwrap();
        store.add_seen_group(1, 10).unwrap();
        assert_eq!(store.seen_group_ids(1).unwrap(), vec![9, 10]);
        assert!(store.seen_group_ids(2).unwrap().is_empty());
    }
}
