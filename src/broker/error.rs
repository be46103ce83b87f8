//! Broker error taxonomy

use thiserror::Error;

/// Errors surfaced by the broker boundary
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Connection could not be established; the request never left
    #[error("Broker unreachable: {0}")]
    Connect(String),
    /// Network failure or 5xx; safe to retry
    #[error("Transient broker error: {0}")]
    Transient(String),
    /// Call exceeded its timeout
    #[error("Broker request timed out")]
    Timeout,
    /// Access token expired or was revoked
    #[error("Authentication expired: {0}")]
    AuthExpired(String),
    /// Credentials rejected outright
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    /// Provider request budget exceeded
    #[error("Rate limited: {0}")]
    RateLimited(String),
    /// Order or request refused by the broker
    #[error("Rejected [{code}]: {message}")]
    Rejected { code: String, message: String },
    /// Broker has no record of the requested entity
    #[error("Not found: {0}")]
    NotFound(String),
    /// Response could not be decoded
    #[error("Malformed response: {0}")]
    Decode(String),
    /// Retry cap reached
    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<BrokerError>,
    },
}

impl BrokerError {
    /// Whether the transport may retry this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Connect(_)
                | BrokerError::Transient(_)
                | BrokerError::Timeout
                | BrokerError::RateLimited(_)
        )
    }

    /// Whether a retry is safe for a request that may create state
    ///
    /// Only failures that guarantee the broker never acted qualify.
    pub fn is_safe_to_resend(&self) -> bool {
        matches!(self, BrokerError::Connect(_) | BrokerError::RateLimited(_))
    }

    /// Whether the error is a timeout, directly or as the last retry cause
    pub fn is_timeout(&self) -> bool {
        match self {
            BrokerError::Timeout => true,
            BrokerError::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        BrokerError::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrokerError::Timeout
        } else if e.is_connect() {
            BrokerError::Connect(e.to_string())
        } else if e.is_decode() {
            BrokerError::Decode(e.to_string())
        } else {
            BrokerError::Transient(e.to_string())
        }
    }
}
