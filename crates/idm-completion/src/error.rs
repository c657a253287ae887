use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompletionError {
    /// Upstream answered with a non-2xx status.
    #[error("completion API returned {status}: {body}")]
    Upstream { status: u16, body: String },

    /// No response at all: connection refused, DNS failure, timeout.
    #[error("completion API unreachable: {0}")]
    Network(String),

    #[error("invalid completion API key: {0}")]
    InvalidKey(String),

    #[error("completion failed: {0}")]
    Internal(String),
}

impl CompletionError {
    /// Only a missing response is worth retrying. An upstream rejection will
    /// most likely be rejected again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl From<reqwest::Error> for CompletionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Self::Network(e.to_string())
        } else {
            Self::Internal(e.to_string())
        }
    }
}
