//! Lenient decoding of server payloads.
//!
//! Backends in the field disagree on envelopes and field names. Anything
//! missing is filled with a placeholder instead of failing the whole
//! response; only a message without an id is dropped, since it cannot be
//! deduplicated.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;

use tally_types::api::SplitDraft;
use tally_types::models::{
    GroupId, Message, MessageId, MessageKind, Share, Split, SyncStatus, UserSummary, now_timestamp,
};

/// Pull the list out of a bare array, `{items: [...]}` or `{content: [...]}`.
pub fn extract_list(body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut obj) => ["items", "content"]
            .into_iter()
            .find_map(|key| match obj.remove(key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}

/// Decode every usable message of a list, logging what had to be skipped.
pub fn decode_messages(items: &[Value], group_id: GroupId) -> Vec<Message> {
    let messages: Vec<Message> = items.iter().filter_map(|v| decode_message(v, group_id)).collect();
    let skipped = items.len() - messages.len();
    if skipped > 0 {
        warn!("Skipped {} undecodable messages for group {}", skipped, group_id);
    }
    messages
}

pub fn decode_message(value: &Value, group_id: GroupId) -> Option<Message> {
    let obj = value.as_object()?;
    let id = obj.get("id").and_then(message_id)?;

    let split = obj.get("split").and_then(|s| decode_split(s, None, stable_split_id(&id)));
    let kind = match obj.get("type").and_then(Value::as_str).map(str::to_ascii_lowercase) {
        Some(t) if t == "split" => MessageKind::Split,
        Some(t) if t == "text" => MessageKind::Text,
        _ if split.is_some() => MessageKind::Split,
        _ => MessageKind::Text,
    };

    Some(Message {
        id,
        group_id: obj.get("groupId").and_then(as_i64).unwrap_or(group_id),
        sender: obj.get("sender").and_then(|s| decode_user(s, 0)).unwrap_or_else(UserSummary::unknown),
        kind,
        text: first_str(obj, &["text", "message", "content"]),
        split,
        created_at: obj
            .get("createdAt")
            .or_else(|| obj.get("created_at"))
            .or_else(|| obj.get("timestamp"))
            .map(timestamp_string)
            .unwrap_or_default(),
        status: SyncStatus::Synced,
        attempts: 0,
    })
}

/// Decode a user reference. Bare numbers are accepted as ids. `index` gives
/// users without any id a distinct negative placeholder.
pub fn decode_user(value: &Value, index: usize) -> Option<UserSummary> {
    if let Some(id) = as_i64(value) {
        return Some(UserSummary {
            id,
            name: format!("User #{}", id),
            email: String::new(),
        });
    }
    let obj = value.as_object()?;
    let id = ["id", "userId", "uid"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(as_i64))
        .unwrap_or(-(index as i64 + 1));
    let email = first_str(obj, &["email", "emailAddress", "username"]).unwrap_or_default();
    let name = first_str(obj, &["name", "fullName", "displayName"])
        .or_else(|| (!email.is_empty()).then(|| email.clone()))
        .unwrap_or_else(|| format!("User #{}", id));
    Some(UserSummary { id, name, email })
}

/// Decode a split. Fields the server left out come from `fallback` (the
/// draft that was sent), then from neutral defaults; a missing id becomes
/// `default_id`.
pub fn decode_split(value: &Value, fallback: Option<&SplitDraft>, default_id: i64) -> Option<Split> {
    let obj = value.as_object()?;
    let id = obj.get("id").and_then(as_i64).unwrap_or(default_id);
    let title = first_str(obj, &["title"])
        .or_else(|| fallback.map(|d| d.title.clone()))
        .unwrap_or_default();
    let total_amount = obj
        .get("totalAmount")
        .and_then(as_f64)
        .or_else(|| fallback.map(|d| d.total_amount))
        .unwrap_or(0.0);
    let currency = first_str(obj, &["currency"])
        .or_else(|| fallback.map(|d| d.currency.clone()))
        .unwrap_or_default();
    let involved_user_ids = obj
        .get("involvedUserIds")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(as_i64).collect())
        .or_else(|| fallback.map(|d| d.involved_user_ids.clone()))
        .unwrap_or_default();
    let shares = obj
        .get("shares")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(decode_share).collect())
        .or_else(|| fallback.and_then(|d| d.shares.clone()));

    Some(Split {
        id,
        title,
        total_amount,
        currency,
        involved_user_ids,
        shares,
        paid_by_user_id: obj.get("paidByUserId").and_then(as_i64),
    })
}

/// Build the message for a split-create response. `split_shaped` is the
/// envelope `{id, createdAt, sender, split: {...}}`; otherwise the whole
/// object is read as a flat split.
pub fn split_message_from_response(
    data: &Value,
    group_id: GroupId,
    draft: &SplitDraft,
) -> Option<Message> {
    let obj = data.as_object()?;
    let split_value = match obj.get("split") {
        Some(inner @ Value::Object(_)) => inner,
        _ => data,
    };
    let now_ms = Utc::now().timestamp_millis();
    let mut split = decode_split(split_value, Some(draft), now_ms)?;
    if std::ptr::eq(split_value, data) {
        // a flat response's `id` is the message id, not the split id
        split.id = obj.get("splitId").and_then(as_i64).unwrap_or(now_ms);
    }

    Some(Message {
        id: obj
            .get("id")
            .and_then(message_id)
            .unwrap_or_else(|| MessageId::new(format!("srv-{}", Utc::now().timestamp_millis()))),
        group_id,
        sender: obj.get("sender").and_then(|s| decode_user(s, 0)).unwrap_or_else(UserSummary::unknown),
        kind: MessageKind::Split,
        text: None,
        split: Some(split),
        created_at: obj
            .get("createdAt")
            .map(timestamp_string)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(now_timestamp),
        status: SyncStatus::Synced,
        attempts: 0,
    })
}

/// True when a create response carries a split at all.
pub fn is_split_shaped(data: &Value) -> bool {
    data.get("type").and_then(Value::as_str) == Some("split")
        || data.get("split").is_some_and(Value::is_object)
}

/// Split id for a listed split the server sent without one. Derived from the
/// message id so every reload keys settlements the same way.
fn stable_split_id(id: &MessageId) -> i64 {
    if let Some(n) = id.as_number() {
        return n;
    }
    // FNV-1a over the id text, kept positive
    let hash = id
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3));
    (hash >> 1) as i64
}

fn decode_share(value: &Value) -> Option<Share> {
    Some(Share {
        user_id: value.get("userId").and_then(as_i64)?,
        amount: value.get("amount").and_then(as_f64).unwrap_or(0.0),
    })
}

fn message_id(value: &Value) -> Option<MessageId> {
    match value {
        Value::Number(n) => Some(MessageId::new(
            n.as_i64().map(|i| i.to_string()).unwrap_or_else(|| n.to_string()),
        )),
        Value::String(s) if !s.trim().is_empty() => Some(MessageId::new(s.trim())),
        _ => None,
    }
}

/// Numbers, or strings holding an integer.
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

fn first_str(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Timestamps arrive as strings or epoch milliseconds.
fn timestamp_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
            .unwrap_or_default(),
        _ => String::new(),
    }
}
