use thiserror::Error;

use crate::frame::{CallResponse, CallStatus, ValidationError};

/// Failures reported to whoever issued a call. None of them are fatal: each
/// maps onto a structured [`CallResponse`] the caller receives instead of a
/// reply from the target peer.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("malformed request: {source}")]
    InvalidArgument {
        call_id: String,
        method: String,
        #[source]
        source: ValidationError,
    },
    /// The target has no live connection, or writing to the chosen one failed.
    #[error("peer offline")]
    PeerOffline { call_id: String, method: String },
    #[error("call timeout")]
    CallTimeout { call_id: String, method: String },
}

impl RelayError {
    pub fn status(&self) -> CallStatus {
        match self {
            RelayError::InvalidArgument { .. } => CallStatus::InvalidArgument,
            RelayError::PeerOffline { .. } => CallStatus::Unavailable,
            RelayError::CallTimeout { .. } => CallStatus::DeadlineExceeded,
        }
    }

    pub fn to_response(&self) -> CallResponse {
        match self {
            RelayError::InvalidArgument { .. } => CallResponse::malformed(),
            RelayError::PeerOffline { call_id, method } => {
                CallResponse::peer_offline(call_id.as_str(), method.as_str())
            }
            RelayError::CallTimeout { call_id, method } => {
                CallResponse::call_timeout(call_id.as_str(), method.as_str())
            }
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::InvalidArgument { .. } => "invalid_argument",
            RelayError::PeerOffline { .. } => "peer_offline",
            RelayError::CallTimeout { .. } => "timeout",
        }
    }
}
