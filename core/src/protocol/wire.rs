//! Top-level frames

use serde::{Deserialize, Serialize};

use super::payload::SignedEnvelope;
use super::ProtocolError;

/// One entry of a node roster: the shareable projection of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(rename = "client-id")]
    pub client_id: String,
    /// Base64 Ed25519 signing key (the identity)
    #[serde(rename = "public-key")]
    pub public_key: String,
    /// Base64 X25519 key used to wrap session keys for this client
    #[serde(
        rename = "encryption-key",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encryption_key: Option<String>,
    /// Unauthenticated display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// What a node says about itself in a `client_list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub address: String,
    #[serde(rename = "serverId")]
    pub server_id: String,
    pub clients: Vec<RosterEntry>,
}

/// Every frame a relay node or client may receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Signed, replay-protected envelope around a [`super::Payload`]
    SignedData(SignedEnvelope),
    /// Roster broadcast (node → peers and local clients)
    ClientUpdate { clients: Vec<RosterEntry> },
    /// Ask a peer node for its roster
    ClientUpdateRequest,
    /// Ask a node which clients live where
    ClientListRequest,
    ClientList { servers: Vec<NodeDescriptor> },
    /// First frame on a node → node link
    ServerHello {
        /// Advertised address of the sending node
        sender: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
    Heartbeat,
    /// Client going offline; also fanned out to local clients as a notice
    Disconnect {
        #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

impl WireMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Human-readable message type, for logs
    pub fn message_type(&self) -> &'static str {
        match self {
            WireMessage::SignedData(_) => "signed_data",
            WireMessage::ClientUpdate { .. } => "client_update",
            WireMessage::ClientUpdateRequest => "client_update_request",
            WireMessage::ClientListRequest => "client_list_request",
            WireMessage::ClientList { .. } => "client_list",
            WireMessage::ServerHello { .. } => "server_hello",
            WireMessage::Heartbeat => "heartbeat",
            WireMessage::Disconnect { .. } => "disconnect",
            WireMessage::Unknown => "unknown",
        }
    }
}
