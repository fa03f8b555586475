//! Wire protocol: JSON frames exchanged between clients and relay nodes
//!
//! Every frame is one JSON object with a `type` tag. `signed_data` frames wrap
//! an inner payload that is itself tagged (`hello`, `public_chat`, `chat`,
//! `fileTransfer`).

pub mod payload;
pub mod wire;

pub use payload::{ClientInfo, FileTransfer, Hello, Payload, PrivateChat, PublicChat, SignedEnvelope};
pub use wire::{NodeDescriptor, RosterEntry, WireMessage};

use thiserror::Error;

/// Protocol (de)serialization errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Unknown payload type")]
    UnknownPayload,
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}
