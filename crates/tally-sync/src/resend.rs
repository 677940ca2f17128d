use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_store::{LocalMessageStore, LocalSettlementStore};
use tally_types::events::SyncEvent;
use tally_types::models::{GroupId, Message, MessageId, MessageKind, SyncStatus, sort_timeline};

use crate::backend::GroupBackend;
use crate::context::SyncContext;
use crate::error::{BackendError, BackendResult};
use crate::events::EventBus;
use crate::policy::SyncPolicy;
use crate::reconcile::merge_by_id;

/// In-memory timeline of one group, shared by the loader and the worker.
/// Holding the lock covers both the memory change and the matching durable
/// write, so the two never interleave for a group.
pub type SharedTimeline = Arc<tokio::sync::Mutex<Vec<Message>>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Pending echoes still inside their backoff window.
    pub deferred: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass was already running.
    Skipped,
    Completed(PassReport),
}

/// Redelivers local echoes of one group that never reached the server.
pub struct ResendWorker {
    group_id: GroupId,
    backend: Arc<dyn GroupBackend>,
    messages: Arc<LocalMessageStore>,
    settlements: Arc<LocalSettlementStore>,
    events: EventBus,
    policy: SyncPolicy,
    timeline: SharedTimeline,
    in_flight: tokio::sync::Mutex<()>,
    next_attempt: Mutex<HashMap<MessageId, Instant>>,
    cancel: CancellationToken,
}

impl ResendWorker {
    pub fn new(ctx: &SyncContext, group_id: GroupId, timeline: SharedTimeline, cancel: CancellationToken) -> Self {
        Self {
            group_id,
            backend: ctx.backend.clone(),
            messages: ctx.messages.clone(),
            settlements: ctx.settlements.clone(),
            events: ctx.events.clone(),
            policy: ctx.policy.clone(),
            timeline,
            in_flight: tokio::sync::Mutex::new(()),
            next_attempt: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    /// Try every pending echo whose backoff has elapsed, one at a time.
    pub async fn run_pass(&self) -> PassOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Resend pass already running for group {}", self.group_id);
            return PassOutcome::Skipped;
        };

        let candidates: Vec<Message> = {
            let timeline = self.timeline.lock().await;
            timeline
                .iter()
                .filter(|m| m.status == SyncStatus::Pending)
                .cloned()
                .collect()
        };

        let mut report = PassReport::default();
        let now = Instant::now();
        for echo in candidates {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if !self.is_due(&echo.id, now) {
                report.deferred += 1;
                continue;
            }

            report.attempted += 1;
            match self.deliver(&echo).await {
                Ok(server) => {
                    self.apply_delivered(&echo, server).await;
                    report.delivered += 1;
                }
                Err(e) => {
                    debug!("Resend of {} in group {} failed: {}", echo.id, self.group_id, e);
                    self.apply_failed(&echo).await;
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                "Resend pass for group {}: {} delivered, {} failed, {} deferred",
                self.group_id, report.delivered, report.failed, report.deferred
            );
        }
        PassOutcome::Completed(report)
    }

    /// Put failed echoes back in the queue with a fresh attempt budget.
    pub async fn reset_failed(&self) -> usize {
        let mut timeline = self.timeline.lock().await;
        let mut reset = 0;
        for msg in timeline.iter_mut().filter(|m| m.status == SyncStatus::Failed) {
            msg.status = SyncStatus::Pending;
            msg.attempts = 0;
            self.forget(&msg.id);
            if let Err(e) = self.messages.update(self.group_id, msg) {
                warn!("Failed to persist reset of {}: {:#}", msg.id, e);
            }
            reset += 1;
        }
        reset
    }

    /// Hold off the first attempt of a new echo for one backoff step.
    pub fn defer_first_attempt(&self, id: &MessageId) {
        let at = Instant::now() + self.policy.backoff_for(1);
        if let Ok(mut next) = self.next_attempt.lock() {
            next.insert(id.clone(), at);
        }
    }

    /// Drop scheduling state for an echo that no longer needs delivery.
    pub fn forget(&self, id: &MessageId) {
        if let Ok(mut next) = self.next_attempt.lock() {
            next.remove(id);
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn is_due(&self, id: &MessageId, now: Instant) -> bool {
        self.next_attempt
            .lock()
            .map(|next| next.get(id).is_none_or(|at| *at <= now))
            .unwrap_or(true)
    }

    async fn deliver(&self, echo: &Message) -> BackendResult<Message> {
        match echo.kind {
            MessageKind::Text => {
                let text = echo.text.as_deref().map(str::trim).unwrap_or("");
                if text.is_empty() {
                    return Err(BackendError::UnexpectedShape("echo has no text".into()));
                }
                self.backend.send_text(self.group_id, text).await
            }
            MessageKind::Split => {
                let draft = echo
                    .split_draft()
                    .ok_or_else(|| BackendError::UnexpectedShape("echo has no split".into()))?;
                self.backend.create_split(self.group_id, &draft).await
            }
        }
    }

    async fn apply_delivered(&self, echo: &Message, server: Message) {
        {
            let mut timeline = self.timeline.lock().await;
            timeline.retain(|m| m.id != echo.id);
            merge_by_id(&mut timeline, std::slice::from_ref(&server));
            sort_timeline(&mut timeline);
            if let Err(e) = self.messages.replace(self.group_id, &echo.id, &server) {
                warn!("Failed to persist delivery of {}: {:#}", echo.id, e);
            }
        }
        self.forget(&echo.id);

        if self.policy.migrate_settlements {
            carry_settlements(&self.settlements, self.group_id, echo, &server);
        }

        self.events.publish(SyncEvent::EchoSynced {
            group_id: self.group_id,
            local_id: echo.id.clone(),
            server_id: server.id,
        });
    }

    async fn apply_failed(&self, echo: &Message) {
        let mut timeline = self.timeline.lock().await;
        let Some(current) = timeline.iter_mut().find(|m| m.id == echo.id) else {
            // reconciled away while the send was in flight
            self.forget(&echo.id);
            return;
        };

        current.attempts += 1;
        let attempts = current.attempts;
        if attempts >= self.policy.max_attempts {
            current.status = SyncStatus::Failed;
            self.forget(&echo.id);
            warn!(
                "Giving up on {} in group {} after {} attempts",
                echo.id, self.group_id, attempts
            );
        } else {
            let at = Instant::now() + self.policy.backoff_for(attempts);
            if let Ok(mut next) = self.next_attempt.lock() {
                next.insert(echo.id.clone(), at);
            }
        }

        let snapshot = current.clone();
        if let Err(e) = self.messages.update(self.group_id, &snapshot) {
            warn!("Failed to persist attempt count of {}: {:#}", echo.id, e);
        }
        drop(timeline);

        if snapshot.status == SyncStatus::Failed {
            self.events.publish(SyncEvent::EchoFailed {
                group_id: self.group_id,
                local_id: snapshot.id,
                attempts,
            });
        }
    }
}

/// Move paid flags recorded under an echo's split id to the split id of the
/// message that replaced it.
pub(crate) fn carry_settlements(
    settlements: &LocalSettlementStore,
    group_id: GroupId,
    echo: &Message,
    server: &Message,
) {
    let (Some(local), Some(remote)) = (&echo.split, &server.split) else {
        return;
    };
    if let Err(e) = settlements.migrate_split(group_id, local.id, remote.id) {
        warn!("Failed to migrate settlements of split {}: {:#}", local.id, e);
    }
}
