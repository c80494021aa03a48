use std::time::Duration;
use thiserror::Error;

/// Why a request to the chat backend did not produce a usable response.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }
}

/// Failures of a single chat turn. All of them degrade to a fallback reply.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Malformed backend payload: {0}")]
    Parse(String),
}
