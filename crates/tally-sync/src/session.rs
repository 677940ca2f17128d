use std::sync::{Arc, RwLock};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64URL;
use tracing::debug;

use tally_types::api::SessionClaims;
use tally_types::models::UserSummary;

/// Bearer token of the signed-in user, shared by every component.
/// Token refresh happens elsewhere; this only holds the latest value.
#[derive(Clone, Default)]
pub struct Session {
    token: Arc<RwLock<Option<String>>>,
}

impl Session {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token.filter(|t| !t.is_empty()))),
        }
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().ok().and_then(|t| t.clone())
    }

    pub fn set_token(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token.into());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut slot) = self.token.write() {
            *slot = None;
        }
    }

    pub fn claims(&self) -> Option<SessionClaims> {
        self.token().as_deref().and_then(decode_claims)
    }

    /// Who local echoes are attributed to.
    pub fn sender(&self) -> UserSummary {
        self.claims().unwrap_or_default().as_sender()
    }
}

/// Read the JWT payload without checking the signature. The claims are only
/// used to key per-user local storage and label local echoes.
pub fn decode_claims(token: &str) -> Option<SessionClaims> {
    let payload = token.split('.').nth(1)?;
    let bytes = B64URL
        .decode(payload.trim_end_matches('='))
        .map_err(|e| debug!("Token payload is not base64url: {}", e))
        .ok()?;
    serde_json::from_slice(&bytes)
        .map_err(|e| debug!("Token payload is not JSON claims: {}", e))
        .ok()
}
