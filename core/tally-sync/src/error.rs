//! Error types for the sync layer.

use crate::descriptor::DecodeError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// Session-level variants end the session with a single `Failed` event.
/// `LockedRecord` is entity-level and only ever shows up as a skip count.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A scanned or pasted connection token could not be used.
    #[error("invalid connection code: {0}")]
    DescriptorDecode(#[from] DecodeError),

    /// The answer carries a different pairing code than the offer.
    #[error("pairing code mismatch")]
    PairingMismatch,

    /// No direct connection was established within the session timeout.
    #[error("connection timed out")]
    ConnectionTimeout,

    /// The direct channel failed and could not be recovered.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A received payload could not be reassembled or parsed.
    #[error("payload decode error: {0}")]
    PayloadDecode(String),

    /// A locked record refused an incoming overwrite.
    #[error("record is locked: {0}")]
    LockedRecord(String),

    /// The transfer was cancelled by either side.
    #[error("transfer cancelled")]
    Cancelled,

    /// The operation is not valid in the current state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    /// The peer sent something that violates the protocol, or reported an error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store failure.
    #[error("storage error: {0}")]
    Store(tally_store::StoreError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The orchestrator task is gone.
    #[error("channel closed")]
    ChannelClosed,
}

impl From<tally_store::StoreError> for SyncError {
    fn from(err: tally_store::StoreError) -> Self {
        match err {
            tally_store::StoreError::Locked(id) => Self::LockedRecord(id),
            other => Self::Store(other),
        }
    }
}

impl SyncError {
    pub(crate) fn invalid_state(operation: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            state: state.to_string(),
        }
    }

    /// Short machine-readable kind, sent to the peer in `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DescriptorDecode(_) => "descriptor_decode",
            Self::PairingMismatch => "pairing_mismatch",
            Self::ConnectionTimeout => "connection_timeout",
            Self::TransportFailure(_) => "transport_failure",
            Self::PayloadDecode(_) => "payload_decode",
            Self::LockedRecord(_) => "locked_record",
            Self::Cancelled => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::Protocol(_) => "protocol",
            Self::Store(_) => "store",
            Self::Serialization(_) => "serialization",
            Self::ChannelClosed => "channel_closed",
        }
    }
}
