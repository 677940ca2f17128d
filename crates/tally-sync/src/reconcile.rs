//! Matching local echoes against the server's list.
//!
//! Everything here is pure; callers apply the outcome to memory first and
//! only then to the durable cache.

use std::collections::HashSet;

use tally_types::models::{Message, MessageId, MessageKind, UserSummary, sort_timeline};

use crate::policy::SyncPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// Previous state minus matched echoes, plus the server list, deduplicated
    /// by id and sorted.
    pub merged: Vec<Message>,
    /// `(local id, server id)` for every echo the server confirmed.
    pub matched: Vec<(MessageId, MessageId)>,
}

/// Merge `server` into `previous`, dropping every provisional message of
/// `previous` that the server list already contains.
///
/// Each server message absorbs at most one echo. An echo with several
/// candidates takes the closest in time, the earliest in the list on a tie.
pub fn reconcile(previous: &[Message], server: &[Message], policy: &SyncPolicy) -> ReconcileOutcome {
    let mut claimed: HashSet<usize> = HashSet::new();
    let mut matched = Vec::new();

    for echo in previous.iter().filter(|m| m.is_provisional()) {
        let best = server
            .iter()
            .enumerate()
            .filter(|(i, _)| !claimed.contains(i))
            .filter_map(|(i, srv)| match_distance(echo, srv, policy).map(|d| (d, i)))
            .min();
        if let Some((_, i)) = best {
            claimed.insert(i);
            matched.push((echo.id.clone(), server[i].id.clone()));
        }
    }

    let dropped: HashSet<&MessageId> = matched.iter().map(|(local, _)| local).collect();
    let mut merged: Vec<Message> = previous
        .iter()
        .filter(|m| !dropped.contains(&m.id))
        .cloned()
        .collect();
    merge_by_id(&mut merged, server);
    sort_timeline(&mut merged);

    ReconcileOutcome { merged, matched }
}

/// Insert or overwrite in place by id; later entries win.
pub fn merge_by_id(into: &mut Vec<Message>, incoming: &[Message]) {
    for msg in incoming {
        match into.iter_mut().find(|m| m.id == msg.id) {
            Some(existing) => *existing = msg.clone(),
            None => into.push(msg.clone()),
        }
    }
}

/// Time distance in ms when `server` is the confirmed copy of `echo`.
/// Unparsable timestamps satisfy the window but rank behind parsable ones.
fn match_distance(echo: &Message, server: &Message, policy: &SyncPolicy) -> Option<u64> {
    if echo.kind != server.kind || !same_sender(&echo.sender, &server.sender) {
        return None;
    }

    let distance = match (echo.created_at_ms(), server.created_at_ms()) {
        (Some(a), Some(b)) => a.abs_diff(b),
        _ => u64::MAX,
    };
    if distance != u64::MAX && distance >= policy.match_window.as_millis() as u64 {
        return None;
    }

    let same_payload = match echo.kind {
        MessageKind::Text => trimmed(echo.text.as_deref()) == trimmed(server.text.as_deref()),
        MessageKind::Split => match (&echo.split, &server.split) {
            (Some(a), Some(b)) => {
                a.title.trim() == b.title.trim()
                    && (a.total_amount - b.total_amount).abs() < policy.amount_tolerance
            }
            _ => false,
        },
    };
    same_payload.then_some(distance)
}

/// Same person by positive id, or by email ignoring case.
pub(crate) fn same_sender(a: &UserSummary, b: &UserSummary) -> bool {
    if a.id > 0 && a.id == b.id {
        return true;
    }
    let (ea, eb) = (a.email.trim(), b.email.trim());
    !ea.is_empty() && ea.eq_ignore_ascii_case(eb)
}

fn trimmed(text: Option<&str>) -> &str {
    text.map(str::trim).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::api::SplitDraft;
    use tally_types::models::SyncStatus;

    fn user(id: i64, email: &str) -> UserSummary {
        UserSummary { id, name: format!("u{}", id), email: email.into() }
    }

    fn text(id: &str, sender: UserSummary, body: &str, at: &str, status: SyncStatus) -> Message {
        Message {
            id: id.into(),
            group_id: 7,
            sender,
            kind: MessageKind::Text,
            text: Some(body.into()),
            split: None,
            created_at: at.into(),
            status,
            attempts: 0,
        }
    }

    fn echo(id: &str, body: &str, at: &str) -> Message {
        text(id, user(1, "ana@example.com"), body, at, SyncStatus::Pending)
    }

    fn server(id: &str, body: &str, at: &str) -> Message {
        text(id, user(1, "ana@example.com"), body, at, SyncStatus::Synced)
    }

    fn ids(list: &[Message]) -> Vec<&str> {
        list.iter().map(|m| m.id.as_str()).collect()
    }

    #[test]
    fn echo_replaced_by_server_copy() {
        let prev = vec![echo("local-a", "hi", "2024-01-01T10:00:00.000Z")];
        let srv = vec![server("501", "hi", "2024-01-01T10:00:05.000Z")];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(ids(&out.merged), vec!["501"]);
        assert_eq!(out.matched, vec![("local-a".into(), "501".into())]);
    }

    #[test]
    fn settle_up_ninety_seconds_later() {
        let prev = vec![echo("local-123", "Settle up?", "2024-01-01T10:00:00Z")];
        let srv = vec![server("900", " Settle up? ", "2024-01-01T10:01:30Z")];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(ids(&out.merged), vec!["900"]);
        assert_eq!(out.merged[0].status, SyncStatus::Synced);
    }

    #[test]
    fn window_is_strict() {
        let prev = vec![echo("local-a", "hi", "2024-01-01T10:00:00.000Z")];
        let at_edge = vec![server("501", "hi", "2024-01-01T10:02:00.000Z")];
        let out = reconcile(&prev, &at_edge, &SyncPolicy::default());
        assert!(out.matched.is_empty());
        assert_eq!(ids(&out.merged), vec!["local-a", "501"]);

        let inside = vec![server("501", "hi", "2024-01-01T10:01:59.999Z")];
        assert_eq!(reconcile(&prev, &inside, &SyncPolicy::default()).matched.len(), 1);
    }

    #[test]
    fn unparsable_time_still_matches() {
        let prev = vec![echo("local-a", "hi", "")];
        let srv = vec![server("501", "hi", "2024-01-01T10:00:00Z")];
        assert_eq!(reconcile(&prev, &srv, &SyncPolicy::default()).matched.len(), 1);
    }

    #[test]
    fn sender_must_match_by_id_or_email() {
        let prev = vec![echo("local-a", "hi", "2024-01-01T10:00:00Z")];

        let other = vec![text("501", user(2, "bo@example.com"), "hi", "2024-01-01T10:00:01Z", SyncStatus::Synced)];
        assert!(reconcile(&prev, &other, &SyncPolicy::default()).matched.is_empty());

        let by_email = vec![text("502", user(-1, "ANA@example.com"), "hi", "2024-01-01T10:00:01Z", SyncStatus::Synced)];
        assert_eq!(reconcile(&prev, &by_email, &SyncPolicy::default()).matched.len(), 1);

        // an unknown id on both sides is not a match by itself
        let anon = |id: &str, status| text(id, user(-1, ""), "hi", "2024-01-01T10:00:00Z", status);
        let out = reconcile(&[anon("local-b", SyncStatus::Pending)], &[anon("503", SyncStatus::Synced)], &SyncPolicy::default());
        assert!(out.matched.is_empty());
    }

    #[test]
    fn burst_of_identical_texts_maps_one_to_one() {
        let prev = vec![
            echo("local-1", "ok", "2024-01-01T10:00:00Z"),
            echo("local-2", "ok", "2024-01-01T10:00:10Z"),
        ];
        let srv = vec![
            server("11", "ok", "2024-01-01T10:00:11Z"),
            server("10", "ok", "2024-01-01T10:00:01Z"),
        ];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(
            out.matched,
            vec![("local-1".into(), "10".into()), ("local-2".into(), "11".into())]
        );
        assert_eq!(ids(&out.merged), vec!["10", "11"]);
    }

    #[test]
    fn surplus_echo_stays_provisional() {
        let prev = vec![
            echo("local-1", "ok", "2024-01-01T10:00:00Z"),
            echo("local-2", "ok", "2024-01-01T10:00:01Z"),
        ];
        let srv = vec![server("10", "ok", "2024-01-01T10:00:02Z")];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(out.matched, vec![("local-1".into(), "10".into())]);
        assert_eq!(ids(&out.merged), vec!["local-2", "10"]);
        assert!(out.merged[0].is_provisional());
    }

    #[test]
    fn split_needs_title_and_amount() {
        let draft = SplitDraft {
            title: "Taxi".into(),
            total_amount: 42.0,
            currency: "INR".into(),
            involved_user_ids: vec![1, 2],
            shares: None,
        };
        let mut local = Message::local_split(7, user(1, ""), &draft);
        local.created_at = "2024-01-01T10:00:00Z".into();

        let mut srv = local.clone();
        srv.id = "77".into();
        srv.status = SyncStatus::Synced;
        srv.split.as_mut().unwrap().id = 5;
        srv.split.as_mut().unwrap().total_amount = 42.005;
        assert_eq!(reconcile(&[local.clone()], &[srv.clone()], &SyncPolicy::default()).matched.len(), 1);

        srv.split.as_mut().unwrap().total_amount = 43.0;
        assert!(reconcile(&[local.clone()], &[srv.clone()], &SyncPolicy::default()).matched.is_empty());

        let mut as_text = srv.clone();
        as_text.kind = MessageKind::Text;
        assert!(reconcile(&[local], &[as_text], &SyncPolicy::default()).matched.is_empty());
    }

    #[test]
    fn merge_is_deduplicated_and_ordered() {
        let prev = vec![
            server("2", "old copy", "2024-01-01T10:00:02Z"),
            server("1", "a", "2024-01-01T10:00:01Z"),
        ];
        let srv = vec![
            server("3", "c", "2024-01-01T10:00:03Z"),
            server("2", "new copy", "2024-01-01T10:00:02Z"),
        ];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(ids(&out.merged), vec!["1", "2", "3"]);
        assert_eq!(out.merged[1].text.as_deref(), Some("new copy"));
        assert!(out.matched.is_empty());
    }

    #[test]
    fn synced_messages_are_never_dropped() {
        let prev = vec![server("1", "hi", "2024-01-01T10:00:00Z")];
        let srv = vec![server("2", "hi", "2024-01-01T10:00:01Z")];
        let out = reconcile(&prev, &srv, &SyncPolicy::default());
        assert_eq!(ids(&out.merged), vec!["1", "2"]);
    }
}
