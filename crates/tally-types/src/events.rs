use serde::{Deserialize, Serialize};

use crate::models::{GroupId, MessageId};

/// Events published by the sync core to whatever surface is listening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SyncEvent {
    /// The signed-in user was added to groups not seen before
    NewGroups { ids: Vec<GroupId>, count: usize },

    /// Messages were buffered for a group; a mounted consumer should drain
    PendingReady { group_id: GroupId },

    /// A group timeline finished a load and merge pass
    TimelineUpdated { group_id: GroupId, len: usize },

    /// A local echo was delivered and replaced by the server copy
    EchoSynced {
        group_id: GroupId,
        local_id: MessageId,
        server_id: MessageId,
    },

    /// A local echo ran out of delivery attempts
    EchoFailed {
        group_id: GroupId,
        local_id: MessageId,
        attempts: u32,
    },
}

impl SyncEvent {
    /// Returns the group_id if this event is scoped to a single group.
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::PendingReady { group_id }
            | Self::TimelineUpdated { group_id, .. }
            | Self::EchoSynced { group_id, .. }
            | Self::EchoFailed { group_id, .. } => Some(*group_id),
            Self::NewGroups { .. } => None,
        }
    }
}
