// chatrelay core: federated chat relay
//
// Clients hold their own keys and talk to one relay node. Nodes verify and
// route signed envelopes, gossip rosters to their neighbours, and never see
// private message plaintext.

pub mod blob;
pub mod crypto;
pub mod protocol;
pub mod relay;
pub mod transport;

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use blob::{BlobError, BlobStore, MemoryBlobStore};
pub use crypto::{ClientKeys, CryptoError};
pub use protocol::{NodeDescriptor, Payload, ProtocolError, RosterEntry, SignedEnvelope, WireMessage};
pub use relay::{
    AuthError, ChatBody, ChatClient, ClientError, ClientRegistry, ClientSession, Dispatch,
    EnvelopeRouter, NeighbourhoodDirectory, RelayNode, RelayNodeConfig,
};
pub use transport::{ConnectionHandle, ConnectionId, FrameHandler, TransportError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Why an inbound frame was dropped. None of these close the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Parse error: {0}")]
    Parse(#[from] ProtocolError),
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Routing error: {0}")]
    Routing(String),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Wall clock in unix milliseconds
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
