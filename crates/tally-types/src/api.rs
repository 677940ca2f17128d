use serde::{Deserialize, Serialize};

use crate::models::{GroupId, Share, Split, UserId, UserSummary};

// -- Splits --

/// What a user fills in when creating a split, before any id exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitDraft {
    pub title: String,
    pub total_amount: f64,
    pub currency: String,
    pub involved_user_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shares: Option<Vec<Share>>,
}

impl SplitDraft {
    pub fn to_split(&self, id: i64) -> Split {
        Split {
            id,
            title: self.title.clone(),
            total_amount: self.total_amount,
            currency: self.currency.clone(),
            involved_user_ids: self.involved_user_ids.clone(),
            shares: self.shares.clone(),
            paid_by_user_id: None,
        }
    }

    /// Rebuild a draft from a stored split, filling the same defaults the
    /// split form uses for blank fields.
    pub fn from_split(split: &Split) -> Self {
        let title = split.title.trim();
        let currency = split.currency.trim();
        Self {
            title: if title.is_empty() { "Split".into() } else { title.into() },
            total_amount: if split.total_amount.is_finite() { split.total_amount } else { 0.0 },
            currency: if currency.is_empty() { "INR".into() } else { currency.into() },
            involved_user_ids: split.involved_user_ids.clone(),
            shares: split.shares.clone(),
        }
    }
}

// -- Read markers --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadMarker {
    pub group_id: GroupId,
    pub last_read_message_id: i64,
}

// -- Session --

/// The parts of the bearer token payload this client cares about.
/// Backends disagree on where the user id lives, so all three spellings
/// are accepted and either numbers or numeric strings work.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    #[serde(default)]
    pub user_id: Option<LooseNumber>,
    #[serde(default)]
    pub sub: Option<LooseNumber>,
    #[serde(default)]
    pub id: Option<LooseNumber>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
}

impl SessionClaims {
    pub fn resolved_user_id(&self) -> Option<UserId> {
        [&self.user_id, &self.sub, &self.id]
            .into_iter()
            .flatten()
            .find_map(|v| v.as_i64())
    }

    /// Sender to stamp on local echoes.
    pub fn as_sender(&self) -> UserSummary {
        let id = self.resolved_user_id().unwrap_or(-1);
        let email = self
            .email
            .clone()
            .or_else(|| self.sub.as_ref().and_then(|s| s.as_text()))
            .unwrap_or_default();
        let name = self
            .name
            .clone()
            .or_else(|| self.full_name.clone())
            .or_else(|| (!email.is_empty()).then(|| email.clone()))
            .unwrap_or_else(|| if id > 0 { format!("User #{}", id) } else { "You".into() });
        UserSummary { id, name, email }
    }
}

/// A claim that may be a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseNumber {
    Int(i64),
    Float(f64),
    Text(String),
}

impl LooseNumber {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(*f as i64),
            Self::Float(_) => None,
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// String claims that are not numbers, e.g. an email in `sub`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Text(s) if s.trim().parse::<i64>().is_err() => Some(s.clone()),
            _ => None,
        }
    }
}
