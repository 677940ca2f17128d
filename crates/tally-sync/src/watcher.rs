use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_store::MembershipSnapshotStore;
use tally_types::events::SyncEvent;
use tally_types::models::{GroupId, UserId};

use crate::backend::GroupBackend;
use crate::context::SyncContext;
use crate::events::EventBus;
use crate::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nobody is signed in; nothing was fetched.
    NoSession,
    Checked { new_ids: Vec<GroupId> },
}

/// Polls the user's group list and announces groups that were not there
/// on the previous check.
pub struct GroupWatcher {
    backend: Arc<dyn GroupBackend>,
    snapshots: Arc<MembershipSnapshotStore>,
    session: Session,
    events: EventBus,
    interval: Duration,
    user_id: Option<UserId>,
    running: Mutex<Option<CancellationToken>>,
}

impl GroupWatcher {
    /// `user_id` overrides the id read from the session token.
    pub fn new(ctx: &SyncContext, user_id: Option<UserId>) -> Self {
        Self {
            backend: ctx.backend.clone(),
            snapshots: ctx.snapshots.clone(),
            session: ctx.session.clone(),
            events: ctx.events.clone(),
            interval: ctx.policy.watch_interval,
            user_id,
            running: Mutex::new(None),
        }
    }

    fn resolve_user(&self) -> UserId {
        self.user_id
            .or_else(|| self.session.claims().and_then(|c| c.resolved_user_id()))
            .unwrap_or(-1)
    }

    /// One check. The snapshot is only rewritten when new ids show up.
    pub async fn tick(&self) -> Result<TickOutcome> {
        if self.session.token().is_none() {
            return Ok(TickOutcome::NoSession);
        }
        let user_id = self.resolve_user();

        let latest = self
            .backend
            .list_group_ids()
            .await
            .context("fetching group ids")?;
        let previous = self.snapshots.last_group_ids(user_id)?;
        let new_ids: Vec<GroupId> = latest
            .iter()
            .filter(|id| !previous.contains(id))
            .copied()
            .collect();

        if !new_ids.is_empty() {
            self.snapshots.set_last_group_ids(user_id, &latest)?;
            self.events.publish(SyncEvent::NewGroups {
                count: new_ids.len(),
                ids: new_ids.clone(),
            });
        }
        Ok(TickOutcome::Checked { new_ids })
    }

    /// Start polling on a background task, first check immediately. Returns
    /// false when the watcher is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let Ok(mut running) = self.running.lock() else {
            warn!("Group watcher state poisoned, not starting");
            return false;
        };
        if running.as_ref().is_some_and(|t| !t.is_cancelled()) {
            return false;
        }
        let token = CancellationToken::new();
        *running = Some(token.clone());

        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(watcher.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Group watcher started, every {:?}", watcher.interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    result = watcher.tick() => match result {
                        Ok(TickOutcome::NoSession) => debug!("No session, group check skipped"),
                        Ok(TickOutcome::Checked { new_ids }) if !new_ids.is_empty() => {
                            info!("Added to {} new groups: {:?}", new_ids.len(), new_ids);
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Group check failed: {:#}", e),
                    },
                }
            }

            debug!("Group watcher stopped");
        });
        true
    }

    pub fn stop(&self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(token) = running.take() {
                token.cancel();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| r.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }
}
