use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tally_types::api::{ReadMarker, SplitDraft};
use tally_types::events::SyncEvent;
use tally_types::models::{GroupId, Message, SyncStatus, UserSummary, sort_timeline};

use crate::context::SyncContext;
use crate::reconcile::{reconcile, same_sender};
use crate::resend::{PassOutcome, PassReport, ResendWorker, SharedTimeline, carry_settlements};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub cached: usize,
    pub drained: usize,
    pub fetched: usize,
    pub matched: usize,
    pub total: usize,
    /// The server could not be reached; the timeline is cache only.
    pub fetch_failed: bool,
    pub persisted: bool,
    /// The resend pass run after the merge, when echoes were left over.
    pub resend: Option<PassReport>,
}

/// Counts one running load until dropped.
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn enter(loads: &'a AtomicUsize) -> Self {
        loads.fetch_add(1, Ordering::SeqCst);
        Self(loads)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One open group: its in-memory timeline, the resend worker for its echoes
/// and the load/send operations a surface drives.
pub struct GroupTimeline {
    group_id: GroupId,
    ctx: SyncContext,
    timeline: SharedTimeline,
    loads: AtomicUsize,
    worker: Arc<ResendWorker>,
    cancel: CancellationToken,
}

impl GroupTimeline {
    pub fn open(ctx: &SyncContext, group_id: GroupId) -> Self {
        let timeline: SharedTimeline = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let worker = ResendWorker::new(ctx, group_id, timeline.clone(), cancel.child_token());
        Self {
            group_id,
            ctx: ctx.clone(),
            timeline,
            loads: AtomicUsize::new(0),
            worker: Arc::new(worker),
            cancel,
        }
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.timeline.lock().await.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.loads.load(Ordering::SeqCst) > 0
    }

    pub fn worker(&self) -> &Arc<ResendWorker> {
        &self.worker
    }

    /// Show what is known locally, then merge in the server's list.
    ///
    /// The durable cache is only overwritten with a non-empty merged list,
    /// and only after the in-memory merge is complete.
    pub async fn load(&self) -> LoadReport {
        let loading = LoadingGuard::enter(&self.loads);
        let mut report = LoadReport::default();

        // local first
        let cached = self.ctx.messages.get(self.group_id).unwrap_or_else(|e| {
            warn!("Reading cached timeline of group {} failed: {:#}", self.group_id, e);
            Vec::new()
        });
        let drained = self.ctx.pending.drain_pending_messages(self.group_id);
        report.cached = cached.len();
        report.drained = drained.len();
        {
            let mut timeline = self.timeline.lock().await;
            for msg in cached.iter().chain(drained.iter()) {
                if !timeline.iter().any(|m| m.id == msg.id) {
                    timeline.push(msg.clone());
                }
            }
            sort_timeline(&mut timeline);
        }
        for msg in &drained {
            if let Err(e) = self.ctx.messages.add(self.group_id, msg) {
                warn!("Caching pending message {} failed: {:#}", msg.id, e);
            }
        }

        // then the server
        let server = match self.ctx.backend.list_messages(self.group_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!("Fetching messages of group {} failed, showing cache: {}", self.group_id, e);
                report.fetch_failed = true;
                Vec::new()
            }
        };
        report.fetched = server.len();

        let provisional = {
            let mut timeline = self.timeline.lock().await;
            let outcome = reconcile(&timeline, &server, &self.ctx.policy);
            let confirmed: Vec<(Message, &Message)> = outcome
                .matched
                .iter()
                .filter_map(|(local, server_id)| {
                    let echo = timeline.iter().find(|m| &m.id == local)?;
                    let copy = server.iter().find(|m| &m.id == server_id)?;
                    Some((echo.clone(), copy))
                })
                .collect();
            *timeline = outcome.merged;
            report.matched = outcome.matched.len();
            report.total = timeline.len();

            for (echo, copy) in &confirmed {
                debug!("Echo {} confirmed as {} in group {}", echo.id, copy.id, self.group_id);
                self.worker.forget(&echo.id);
                if let Err(e) = self.ctx.messages.remove(self.group_id, &echo.id) {
                    warn!("Dropping confirmed echo {} from cache failed: {:#}", echo.id, e);
                }
                if self.ctx.policy.migrate_settlements {
                    carry_settlements(&self.ctx.settlements, self.group_id, echo, copy);
                }
            }
            if !timeline.is_empty() {
                report.persisted = self
                    .ctx
                    .messages
                    .replace_all(self.group_id, &timeline)
                    .unwrap_or_else(|e| {
                        warn!("Caching timeline of group {} failed: {:#}", self.group_id, e);
                        false
                    });
            }
            timeline.iter().any(|m| m.status == SyncStatus::Pending)
        };

        drop(loading);
        self.ctx.events.publish(SyncEvent::TimelineUpdated {
            group_id: self.group_id,
            len: report.total,
        });
        info!(
            "Loaded group {}: {} messages ({} fetched, {} echoes confirmed)",
            self.group_id, report.total, report.fetched, report.matched
        );

        if provisional && !self.cancel.is_cancelled() {
            if let PassOutcome::Completed(pass) = self.worker.run_pass().await {
                report.resend = Some(pass);
            }
        }
        report
    }

    /// Send a text, falling back to a pending local echo when the server
    /// does not confirm it. Blank text is ignored.
    pub async fn send_text(&self, text: &str) -> Option<Message> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        match self.ctx.backend.send_text(self.group_id, text).await {
            Ok(msg) => {
                self.accept(msg.clone()).await;
                Some(msg)
            }
            Err(e) => {
                warn!("Text to group {} not delivered, keeping local echo: {}", self.group_id, e);
                let echo = Message::local_text(self.group_id, self.ctx.session.sender(), text);
                Some(self.keep_echo(echo).await)
            }
        }
    }

    /// Create a split; see [`send_text`](Self::send_text) for the fallback.
    pub async fn create_split(&self, draft: &SplitDraft) -> Message {
        match self.ctx.backend.create_split(self.group_id, draft).await {
            Ok(msg) => {
                self.accept(msg.clone()).await;
                msg
            }
            Err(e) => {
                warn!("Split for group {} not delivered, keeping local echo: {}", self.group_id, e);
                let echo = Message::local_split(self.group_id, self.ctx.session.sender(), draft);
                self.keep_echo(echo).await
            }
        }
    }

    /// Consumer side of the pending hand-off. Returns whether the message
    /// was new to this timeline.
    pub async fn accept_incoming(&self, msg: Message) -> bool {
        self.accept(msg).await
    }

    /// Drain the pending buffer into the timeline, e.g. on `PendingReady`.
    pub async fn drain_pending(&self) -> usize {
        if !self.ctx.pending.has_pending(self.group_id) {
            return 0;
        }
        let mut added = 0;
        for msg in self.ctx.pending.drain_pending_messages(self.group_id) {
            if self.accept(msg).await {
                added += 1;
            }
        }
        added
    }

    /// Mark the group read up to its newest server message and remember it
    /// as seen for the current user.
    pub async fn mark_read(&self) -> Option<ReadMarker> {
        if let Some(user_id) = self.ctx.session.claims().and_then(|c| c.resolved_user_id()) {
            if let Err(e) = self.ctx.snapshots.add_seen_group(user_id, self.group_id) {
                warn!("Recording group {} as seen failed: {:#}", self.group_id, e);
            }
        }

        let last = {
            let timeline = self.timeline.lock().await;
            timeline
                .iter()
                .rev()
                .filter(|m| !m.is_provisional())
                .find_map(|m| m.id.as_number())
        };
        match self.ctx.backend.mark_read(self.group_id, last).await {
            Ok(marker) => marker,
            Err(e) => {
                debug!("Marking group {} read failed: {}", self.group_id, e);
                None
            }
        }
    }

    /// Who has seen the newest confirmed message sent by the current user.
    pub async fn seen_by_latest_own(&self) -> Vec<UserSummary> {
        let me = self.ctx.session.sender();
        let target = {
            let timeline = self.timeline.lock().await;
            timeline
                .iter()
                .rev()
                .filter(|m| !m.is_provisional() && same_sender(&m.sender, &me))
                .find_map(|m| m.id.as_number())
        };
        let Some(message_id) = target else {
            return Vec::new();
        };
        self.ctx
            .backend
            .seen_by(self.group_id, message_id)
            .await
            .unwrap_or_else(|e| {
                debug!("Seen-by lookup for {} failed: {}", message_id, e);
                Vec::new()
            })
    }

    pub async fn retry_failed(&self) -> usize {
        self.worker.reset_failed().await
    }

    /// Redeliver pending echoes unless a load is in progress.
    pub async fn run_resend(&self) -> PassOutcome {
        if self.is_loading() {
            debug!("Group {} is loading, resend deferred", self.group_id);
            return PassOutcome::Skipped;
        }
        self.worker.run_pass().await
    }

    /// Stop background delivery for this group.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    async fn accept(&self, msg: Message) -> bool {
        let added = {
            let mut timeline = self.timeline.lock().await;
            if timeline.iter().any(|m| m.id == msg.id) {
                false
            } else {
                timeline.push(msg.clone());
                sort_timeline(&mut timeline);
                true
            }
        };
        if let Err(e) = self.ctx.messages.add(self.group_id, &msg) {
            warn!("Caching message {} failed: {:#}", msg.id, e);
        }
        added
    }

    async fn keep_echo(&self, echo: Message) -> Message {
        self.worker.defer_first_attempt(&echo.id);
        self.accept(echo.clone()).await;
        echo
    }
}
