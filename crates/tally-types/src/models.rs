use std::fmt;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::api::SplitDraft;

pub type GroupId = i64;
pub type UserId = i64;

/// Identity of a message within a group.
///
/// Servers hand out numeric ids, some backends stringify them, and local
/// echoes get a `local-<uuid>` id. All of them are kept as strings so they
/// compare the same way regardless of which JSON type they arrived as.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for a message created on this device.
    pub fn local() -> Self {
        Self(format!("local-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric form of a server id, for endpoints keyed by integer message id.
    pub fn as_number(&self) -> Option<i64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Int(i64),
            Float(f64),
            Str(String),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Int(n) => Self(n.to_string()),
            RawId::Float(f) if f.fract() == 0.0 => Self((f as i64).to_string()),
            RawId::Float(f) => Self(f.to_string()),
            RawId::Str(s) => Self(s),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: String,
}

impl UserSummary {
    /// Placeholder used when a payload carries no usable sender.
    pub fn unknown() -> Self {
        Self {
            id: -1,
            name: "Unknown".to_string(),
            email: String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Split,
}

/// Delivery state of a message, stored alongside it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Created locally, not yet confirmed by the server.
    Pending,
    /// Server-confirmed.
    #[default]
    Synced,
    /// Gave up after too many delivery attempts; waits for a manual retry.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub user_id: UserId,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Split {
    pub id: i64,
    pub title: String,
    pub total_amount: f64,
    pub currency: String,
    #[serde(default)]
    pub involved_user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<Vec<Share>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_by_user_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub group_id: GroupId,
    pub sender: UserSummary,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<Split>,
    pub created_at: String,
    #[serde(default)]
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl Message {
    /// Optimistic text message awaiting delivery.
    pub fn local_text(group_id: GroupId, sender: UserSummary, text: &str) -> Self {
        Self {
            id: MessageId::local(),
            group_id,
            sender,
            kind: MessageKind::Text,
            text: Some(text.to_string()),
            split: None,
            created_at: now_timestamp(),
            status: SyncStatus::Pending,
            attempts: 0,
        }
    }

    /// Optimistic split message. The split id is synthesized from the clock
    /// until the server issues a real one.
    pub fn local_split(group_id: GroupId, sender: UserSummary, draft: &SplitDraft) -> Self {
        Self {
            id: MessageId::local(),
            group_id,
            sender,
            kind: MessageKind::Split,
            text: None,
            split: Some(draft.to_split(Utc::now().timestamp_millis())),
            created_at: now_timestamp(),
            status: SyncStatus::Pending,
            attempts: 0,
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.status != SyncStatus::Synced
    }

    /// True when the message carries something worth rendering.
    pub fn has_payload(&self) -> bool {
        self.split.is_some() || self.text.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn created_at_ms(&self) -> Option<i64> {
        parse_timestamp(&self.created_at).map(|t| t.timestamp_millis())
    }

    /// Ordering key: unparsable timestamps sort as earliest.
    pub fn sort_key(&self) -> i64 {
        self.created_at_ms().unwrap_or(i64::MIN)
    }

    /// Draft that recreates this split on the server.
    pub fn split_draft(&self) -> Option<SplitDraft> {
        self.split.as_ref().map(SplitDraft::from_split)
    }
}

/// Parse a message timestamp. Accepts RFC 3339 and the naive
/// `YYYY-MM-DD HH:MM:SS` form some backends emit, which is taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|ndt| ndt.and_utc())
}

pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Stable sort by parsed `created_at`, ascending.
pub fn sort_timeline(messages: &mut [Message]) {
    messages.sort_by_key(Message::sort_key);
}
