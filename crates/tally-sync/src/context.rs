use std::sync::Arc;

use tally_store::{LocalMessageStore, LocalSettlementStore, MembershipSnapshotStore};

use crate::backend::GroupBackend;
use crate::events::EventBus;
use crate::pending::PendingBuffer;
use crate::policy::SyncPolicy;
use crate::session::Session;

/// Shared handles every per-group component is built from.
#[derive(Clone)]
pub struct SyncContext {
    pub backend: Arc<dyn GroupBackend>,
    pub messages: Arc<LocalMessageStore>,
    pub settlements: Arc<LocalSettlementStore>,
    pub snapshots: Arc<MembershipSnapshotStore>,
    pub pending: Arc<PendingBuffer>,
    pub session: Session,
    pub events: EventBus,
    pub policy: SyncPolicy,
}
