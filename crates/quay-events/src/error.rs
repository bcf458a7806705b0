//! Event bus error primitives.

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::payloads::EventId;

/// Error emitted when event publishing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBusError {
    /// No subscriber was attached when the event was delivered.
    NoSubscribers {
        /// Identifier assigned to the event.
        event_id: EventId,
        /// Event kind string for filtering in logs.
        event_kind: &'static str,
    },
}

impl EventBusError {
    /// Identifier assigned to the event when the failure occurred.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::NoSubscribers { event_id, .. } => *event_id,
        }
    }

    /// Event kind string associated with the failed delivery.
    #[must_use]
    pub const fn event_kind(&self) -> &'static str {
        match self {
            Self::NoSubscribers { event_kind, .. } => event_kind,
        }
    }
}

impl Display for EventBusError {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        formatter.write_str("event had no live subscribers")
    }
}

impl std::error::Error for EventBusError {}

/// Result wrapper for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Failure to parse a textual info hash.
#[derive(Debug, Error, PartialEq)]
pub enum InfoHashParseError {
    /// Input was not valid hexadecimal.
    #[error("info hash is not valid hex")]
    InvalidHex {
        /// Decoder failure.
        #[source]
        source: hex::FromHexError,
    },
    /// Input decoded to the wrong number of bytes.
    #[error("info hash must be {expected} bytes, got {actual}")]
    InvalidLength {
        /// Required byte length.
        expected: usize,
        /// Decoded byte length.
        actual: usize,
    },
}
