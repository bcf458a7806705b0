#![forbid(unsafe_code)]
#![warn(
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    rustdoc::broken_intra_doc_links,
    missing_docs
)]

//! Core event bus for the quay scheduler.
//!
//! The bus provides a typed event enum, sequential identifiers, and support for
//! replaying recent events when subscribers reconnect. Internally it uses
//! `tokio::broadcast` with a bounded buffer; when the channel overflows, the
//! oldest events are dropped.
//!
//! Layout: `payloads.rs` (identifiers, states, events), `routing.rs` (`EventBus`),
//! `topics.rs` (kind discriminators), `error.rs` (bus and parse errors).

pub mod error;
pub mod payloads;
pub mod routing;
pub mod topics;

pub use error::{EventBusError, EventBusResult, InfoHashParseError};
pub use payloads::{
    DEFAULT_REPLAY_CAPACITY, Event, EventEnvelope, EventId, INFO_HASH_LEN, InfoHash,
    TransferState,
};
pub use routing::{EventBus, EventStream};
pub use topics::event_kind;
