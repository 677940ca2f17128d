use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, warn};

use tally_types::models::{GroupId, UserId};

use crate::kv::KvStore;

/// split id -> users who marked their share as paid
type SettlementState = BTreeMap<String, Vec<UserId>>;

fn key_for(group_id: GroupId) -> String {
    format!("local_settlements_{}", group_id)
}

/// Purely local "who has paid" ledger. Never sent to the server.
pub struct LocalSettlementStore {
    kv: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl LocalSettlementStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_paid(&self, group_id: GroupId, split_id: i64, user_id: UserId) -> Result<bool> {
        let state = self.load(group_id)?;
        Ok(state
            .get(&split_id.to_string())
            .is_some_and(|users| users.contains(&user_id)))
    }

    pub fn paid_users(&self, group_id: GroupId, split_id: i64) -> Result<Vec<UserId>> {
        let state = self.load(group_id)?;
        Ok(state.get(&split_id.to_string()).cloned().unwrap_or_default())
    }

    pub fn mark_paid(&self, group_id: GroupId, split_id: i64, user_id: UserId) -> Result<()> {
        self.mutate(group_id, |state| {
            let users = state.entry(split_id.to_string()).or_default();
            if !users.contains(&user_id) {
                users.push(user_id);
            }
        })
    }

    pub fn unmark_paid(&self, group_id: GroupId, split_id: i64, user_id: UserId) -> Result<()> {
        self.mutate(group_id, |state| {
            if let Some(users) = state.get_mut(&split_id.to_string()) {
                users.retain(|id| *id != user_id);
            }
        })
    }

    /// Move paid flags recorded under a provisional split id to the id the
    /// server issued. Flags already present under the target are kept.
    pub fn migrate_split(&self, group_id: GroupId, from_split: i64, to_split: i64) -> Result<usize> {
        if from_split == to_split {
            return Ok(0);
        }
        let mut moved = 0;
        self.mutate(group_id, |state| {
            let Some(users) = state.remove(&from_split.to_string()) else {
                return;
            };
            let target = state.entry(to_split.to_string()).or_default();
            for user in users {
                if !target.contains(&user) {
                    target.push(user);
                    moved += 1;
                }
            }
        })?;
        if moved > 0 {
            debug!(
                "Moved {} settlement flags in group {} from split {} to {}",
                moved, group_id, from_split, to_split
            );
        }
        Ok(moved)
    }

    fn mutate<F>(&self, group_id: GroupId, f: F) -> Result<()>
    where
        F: FnOnce(&mut SettlementState),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| anyhow!("Settlement store lock poisoned: {}", e))?;
        let mut state = self.load(group_id)?;
        f(&mut state);
        let raw = serde_json::to_string(&state).context("encoding settlements")?;
        self.kv.set(&key_for(group_id), &raw)
    }

    fn load(&self, group_id: GroupId) -> Result<SettlementState> {
        let Some(raw) = self.kv.get(&key_for(group_id))? else {
            return Ok(SettlementState::new());
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Discarding unreadable settlements for group {}: {}", group_id, e);
                Ok(SettlementState::new())
            }
        }
    }
}
