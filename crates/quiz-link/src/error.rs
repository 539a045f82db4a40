use std::time::Duration;

use thiserror::Error;

use crate::signaling::SignalingError;

/// Failure taxonomy for the link. Most variants are reported through logs and
/// status transitions rather than returned to callers; see `PeerLink`.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The data channel is not open; the operation was deferred, not failed.
    #[error("transport not ready")]
    TransportNotReady,
    #[error("negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("message {id} dropped after {attempts} attempts")]
    DeliveryExhausted { id: String, attempts: u32 },
    #[error("duplicate message {0} suppressed")]
    DuplicateSuppressed(String),
    #[error("logical key {0} already complete")]
    StaleOperation(String),
    #[error("signaling error: {0}")]
    Signaling(#[from] SignalingError),
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("envelope codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("session not established within {0:?}")]
    EstablishTimeout(Duration),
    #[error("session closed")]
    Closed,
}

impl LinkError {
    pub fn negotiation(err: impl std::fmt::Display) -> Self {
        LinkError::NegotiationFailed(err.to_string())
    }
}

pub type LinkResult<T> = Result<T, LinkError>;

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> LinkError {
    LinkError::Setup(err.to_string())
}
