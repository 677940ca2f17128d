use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{Value, json};
use tracing::{debug, warn};

use tally_types::api::{ReadMarker, SplitDraft};
use tally_types::models::{GroupId, Message, UserSummary, now_timestamp};

use crate::backend::GroupBackend;
use crate::error::{BackendError, BackendResult};
use crate::policy::SyncPolicy;
use crate::session::Session;
use crate::wire;

const LIST_QUERY: [(&str, &str); 3] = [("page", "0"), ("size", "50"), ("sort", "createdAt,desc")];

/// [`GroupBackend`] over the REST API, tolerant of the response shapes the
/// deployed backends actually produce.
pub struct RestBackend {
    http: Client,
    base_url: String,
    session: Session,
    policy: SyncPolicy,
    default_timeout: Duration,
}

impl RestBackend {
    pub fn new(
        base_url: &str,
        session: Session,
        policy: SyncPolicy,
        default_timeout: Duration,
    ) -> BackendResult<Self> {
        let http = Client::builder().timeout(default_timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
            policy,
            default_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.session.token() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> BackendResult<Value> {
        let req = self.authorized(self.http.get(self.url(path)).query(query));
        self.execute(req, self.default_timeout).await
    }

    async fn post_json(&self, path: &str, body: &Value, timeout: Duration) -> BackendResult<Value> {
        let req = self
            .authorized(self.http.post(self.url(path)).json(body))
            .timeout(timeout);
        self.execute(req, timeout).await
    }

    async fn execute(&self, req: RequestBuilder, timeout: Duration) -> BackendResult<Value> {
        let resp = req
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(BackendError::Status(status.as_u16()));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| BackendError::from_reqwest(e, timeout))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| BackendError::UnexpectedShape(e.to_string()))
    }

    fn decode_message_list(&self, body: Value, group_id: GroupId) -> Vec<Message> {
        match wire::extract_list(body) {
            Some(items) => wire::decode_messages(&items, group_id),
            None => {
                warn!("Unrecognised message list shape for group {}", group_id);
                Vec::new()
            }
        }
    }

    /// Responses to our own sends often omit who sent them and when.
    fn complete_own(&self, mut msg: Message) -> Message {
        if msg.sender.id <= 0 && msg.sender.email.is_empty() {
            msg.sender = self.session.sender();
        }
        if msg.created_at.is_empty() {
            msg.created_at = now_timestamp();
        }
        msg
    }
}

#[async_trait]
impl GroupBackend for RestBackend {
    async fn list_messages(&self, group_id: GroupId) -> BackendResult<Vec<Message>> {
        let path = format!("/api/v1/groups/{}/messages", group_id);
        let body = self.get_json(&path, &LIST_QUERY).await?;
        let msgs = self.decode_message_list(body, group_id);
        if !msgs.is_empty() {
            return Ok(msgs);
        }

        // some backends reject or ignore the paging params
        match self.get_json(&path, &[]).await {
            Ok(body) => Ok(self.decode_message_list(body, group_id)),
            Err(e) => {
                debug!("Unpaged message fetch for group {} failed: {}", group_id, e);
                Ok(Vec::new())
            }
        }
    }

    async fn send_text(&self, group_id: GroupId, text: &str) -> BackendResult<Message> {
        let path = format!("/api/v1/groups/{}/messages", group_id);
        let bodies = [
            json!({ "type": "text", "text": text }),
            json!({ "text": text }),
            json!({ "message": text }),
            json!({ "content": text }),
        ];

        let mut last_err = None;
        for body in &bodies {
            match self.post_json(&path, body, self.policy.text_send_timeout).await {
                Ok(data) => {
                    let mut msg = wire::decode_message(&data, group_id).ok_or_else(|| {
                        BackendError::UnexpectedShape("text send response has no message id".into())
                    })?;
                    if !msg.has_payload() {
                        msg.text = Some(text.to_string());
                    }
                    return Ok(self.complete_own(msg));
                }
                Err(e) if e.is_shape_rejection() => {
                    debug!("Text body rejected by group {}: {}", group_id, e);
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(BackendError::Status(400)))
    }

    async fn create_split(&self, group_id: GroupId, draft: &SplitDraft) -> BackendResult<Message> {
        let path = format!("/api/v1/groups/{}/messages", group_id);
        let timeout = self.policy.split_send_timeout;

        let wrapped = json!({ "type": "split", "split": draft });
        match self.post_json(&path, &wrapped, timeout).await {
            Ok(data) if wire::is_split_shaped(&data) => {
                return wire::split_message_from_response(&data, group_id, draft)
                    .map(|m| self.complete_own(m))
                    .ok_or_else(|| BackendError::UnexpectedShape("split response is not an object".into()));
            }
            Ok(_) => debug!("Split response for group {} not split-shaped, retrying flat", group_id),
            Err(e) if e.is_shape_rejection() => debug!("Wrapped split rejected by group {}: {}", group_id, e),
            Err(e) => return Err(e),
        }

        let flat = json!(draft);
        let data = self.post_json(&path, &flat, timeout).await?;
        wire::split_message_from_response(&data, group_id, draft)
            .map(|m| self.complete_own(m))
            .ok_or_else(|| BackendError::UnexpectedShape("split response is not an object".into()))
    }

    async fn mark_read(&self, group_id: GroupId, message_id: Option<i64>) -> BackendResult<Option<ReadMarker>> {
        let path = format!("/api/v1/groups/{}/messages/read", group_id);
        let body = match message_id {
            Some(id) => json!({ "messageId": id }),
            None => json!({}),
        };
        let data = self.post_json(&path, &body, self.default_timeout).await?;
        Ok(decode_read_marker(&data, group_id))
    }

    async fn seen_by(&self, group_id: GroupId, message_id: i64) -> BackendResult<Vec<UserSummary>> {
        let path = format!("/api/v1/groups/{}/messages/{}/seen", group_id, message_id);
        let body = self.get_json(&path, &[]).await?;
        let items = wire::extract_list(body)
            .ok_or_else(|| BackendError::UnexpectedShape("seen-by response is not a list".into()))?;
        Ok(items
            .iter()
            .enumerate()
            .filter_map(|(i, v)| wire::decode_user(v, i))
            .collect())
    }

    async fn list_group_ids(&self) -> BackendResult<Vec<GroupId>> {
        if self.session.token().is_none() {
            return Err(BackendError::Unauthenticated);
        }
        let body = self.get_json("/api/v1/groups", &[]).await?;
        decode_group_ids(body)
    }
}

fn decode_read_marker(data: &Value, group_id: GroupId) -> Option<ReadMarker> {
    let last_read_message_id = data.get("lastReadMessageId").and_then(wire::as_i64)?;
    Some(ReadMarker {
        group_id: data.get("groupId").and_then(wire::as_i64).unwrap_or(group_id),
        last_read_message_id,
    })
}

/// Groups arrive as bare ids or as objects carrying an `id`.
fn decode_group_ids(body: Value) -> BackendResult<Vec<GroupId>> {
    let items = wire::extract_list(body)
        .ok_or_else(|| BackendError::UnexpectedShape("group list is not a list".into()))?;
    let mut seen = HashSet::new();
    Ok(items
        .iter()
        .filter_map(|g| wire::as_i64(g).or_else(|| g.get("id").and_then(wire::as_i64)))
        .filter(|id| seen.insert(*id))
        .collect())
}
