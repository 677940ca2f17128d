use std::time::Duration;

use thiserror::Error;

/// Failures at the REST boundary. Callers treat every variant as
/// "the server did not confirm this", so none of them is fatal.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned status {0}")]
    Status(u16),

    #[error("unexpected response shape: {0}")]
    UnexpectedShape(String),

    #[error("no session token")]
    Unauthenticated,
}

impl BackendError {
    pub(crate) fn from_reqwest(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Transport(e)
        }
    }

    /// The server understood the request but rejected its body, so another
    /// body shape may still succeed.
    pub fn is_shape_rejection(&self) -> bool {
        matches!(self, Self::Status(400 | 415 | 422))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;
