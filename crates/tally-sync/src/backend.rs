use async_trait::async_trait;

use tally_types::api::{ReadMarker, SplitDraft};
use tally_types::models::{GroupId, Message, UserSummary};

use crate::error::BackendResult;

/// The group messaging API as the sync core sees it.
///
/// Implementations return errors instead of inventing fallback data; the
/// callers decide how to degrade.
#[async_trait]
pub trait GroupBackend: Send + Sync {
    /// Latest messages of a group in whatever order the server returns them.
    async fn list_messages(&self, group_id: GroupId) -> BackendResult<Vec<Message>>;

    async fn send_text(&self, group_id: GroupId, text: &str) -> BackendResult<Message>;

    async fn create_split(&self, group_id: GroupId, draft: &SplitDraft) -> BackendResult<Message>;

    async fn mark_read(&self, group_id: GroupId, message_id: Option<i64>) -> BackendResult<Option<ReadMarker>>;

    async fn seen_by(&self, group_id: GroupId, message_id: i64) -> BackendResult<Vec<UserSummary>>;

    /// Ids of every group the signed-in user belongs to.
    async fn list_group_ids(&self) -> BackendResult<Vec<GroupId>>;
}
