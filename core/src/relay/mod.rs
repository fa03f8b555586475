//! Relay Network
//!
//! Each node keeps a registry of its own clients and a directory of
//! neighbouring nodes. Signed envelopes are verified once per hop and
//! forwarded byte for byte.

pub mod client;
pub mod directory;
pub mod registry;
pub mod router;
pub mod server;

pub use client::{ChatBody, ChatClient, ClientError, ClientSession, RecipientCache, ResolvedRecipient};
pub use directory::{NeighbourhoodDirectory, PeerLink};
pub use registry::{ClientProfile, ClientRecord, ClientRegistry};
pub use router::{AuthError, Dispatch, EnvelopeRouter, ReplayGuard, SeenCache, DEFAULT_SEEN_CAPACITY};
pub use server::{RelayNode, RelayNodeConfig, RelayNodeStats};
