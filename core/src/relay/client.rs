//! Chat Client: builds signed frames and opens private chats
//!
//! [`ChatClient`] holds the client identity, its replay counter, and a cache of
//! where other clients live. [`ClientSession`] is the WebSocket link to the
//! home relay node.

use std::collections::HashMap;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::blob::{BlobError, BlobStore};
use crate::crypto::{
    decode_encryption_public_key, decrypt_session, encrypt_session, generate_session_key,
    unwrap_key, wrap_key, ClientKeys, CryptoError,
};
use crate::protocol::{
    ClientInfo, FileTransfer, Hello, NodeDescriptor, Payload, PrivateChat, ProtocolError,
    PublicChat, RosterEntry, SignedEnvelope, WireMessage,
};
use crate::transport::websocket::dial_url;
use crate::transport::TransportError;
use crate::unix_millis;

/// Client-side failures
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Blob store error: {0}")]
    Blob(#[from] BlobError),
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),
    #[error("Recipient {0} has not published an encryption key")]
    NoEncryptionKey(String),
    #[error("Private chat is addressed to another client")]
    NotForUs,
}

/// Plaintext of a private chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBody {
    /// Client ids of sender and recipient
    pub participants: Vec<String>,
    pub message: String,
}

/// A client and the node hosting it, as learned from `client_list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRecipient {
    pub client_id: String,
    pub public_key: String,
    pub encryption_key: Option<String>,
    pub username: Option<String>,
    /// Hosting node address
    pub address: String,
    pub server_id: String,
}

impl ResolvedRecipient {
    fn new(entry: &RosterEntry, address: &str, server_id: &str) -> Self {
        Self {
            client_id: entry.client_id.clone(),
            public_key: entry.public_key.clone(),
            encryption_key: entry.encryption_key.clone(),
            username: entry.username.clone(),
            address: address.to_string(),
            server_id: server_id.to_string(),
        }
    }
}

/// Where other clients live
#[derive(Debug, Default)]
pub struct RecipientCache {
    entries: HashMap<String, ResolvedRecipient>,
    /// (address, server id) of our own node: the first `client_list` descriptor
    home: Option<(String, String)>,
}

impl RecipientCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything with a fresh `client_list`. First descriptor wins
    /// when a client id shows up under several nodes.
    pub fn apply_client_list(&mut self, servers: &[NodeDescriptor]) {
        self.entries.clear();
        self.home = servers
            .first()
            .map(|d| (d.address.clone(), d.server_id.clone()));

        for descriptor in servers {
            for entry in &descriptor.clients {
                self.entries
                    .entry(entry.client_id.clone())
                    .or_insert_with(|| {
                        ResolvedRecipient::new(entry, &descriptor.address, &descriptor.server_id)
                    });
            }
        }
    }

    /// Apply our home node's `client_update`: its roster is now exactly `clients`.
    pub fn apply_local_update(&mut self, clients: &[RosterEntry]) {
        let Some((address, server_id)) = self.home.clone() else {
            return;
        };

        self.entries.retain(|id, r| {
            r.address != address || clients.iter().any(|e| &e.client_id == id)
        });
        for entry in clients {
            self.entries.insert(
                entry.client_id.clone(),
                ResolvedRecipient::new(entry, &address, &server_id),
            );
        }
    }

    pub fn remove(&mut self, client_id: &str) -> Option<ResolvedRecipient> {
        self.entries.remove(client_id)
    }

    pub fn get(&self, client_id: &str) -> Option<&ResolvedRecipient> {
        self.entries.get(client_id)
    }

    pub fn home_address(&self) -> Option<&str> {
        self.home.as_ref().map(|(address, _)| address.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything a client sends, built and signed locally.
pub struct ChatClient {
    keys: ClientKeys,
    display_name: Option<String>,
    counter: u64,
    recipients: RecipientCache,
}

impl ChatClient {
    /// The counter starts at the current unix time in milliseconds so it keeps
    /// increasing across restarts of the same identity.
    pub fn new(keys: ClientKeys, display_name: Option<String>) -> Self {
        Self {
            keys,
            display_name,
            counter: unix_millis(),
            recipients: RecipientCache::new(),
        }
    }

    pub fn keys(&self) -> &ClientKeys {
        &self.keys
    }

    pub fn client_id(&self) -> String {
        self.keys.client_id()
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn recipients(&self) -> &RecipientCache {
        &self.recipients
    }

    fn seal(&mut self, payload: Payload) -> Result<WireMessage, ClientError> {
        self.counter += 1;
        let envelope = SignedEnvelope::seal(&payload, self.counter, self.keys.signing_key())?;
        Ok(WireMessage::SignedData(envelope))
    }

    pub fn hello(&mut self) -> Result<WireMessage, ClientError> {
        self.seal(Payload::Hello(Hello {
            public_key: self.keys.public_key_b64(),
            encryption_key: Some(self.keys.encryption_key_b64()),
            display_name: self.display_name.clone(),
        }))
    }

    pub fn public_chat(&mut self, message: &str) -> Result<WireMessage, ClientError> {
        self.seal(Payload::PublicChat(PublicChat {
            sender: self.keys.public_key_b64(),
            display_name: self.display_name.clone(),
            message: message.to_string(),
        }))
    }

    /// Encrypt `message` for `recipient_id`, who must be in the recipient cache.
    pub fn private_chat(
        &mut self,
        recipient_id: &str,
        message: &str,
        ttl: Duration,
    ) -> Result<WireMessage, ClientError> {
        let recipient = self
            .recipients
            .get(recipient_id)
            .cloned()
            .ok_or_else(|| ClientError::UnknownRecipient(recipient_id.to_string()))?;
        let encryption_key = recipient
            .encryption_key
            .as_deref()
            .ok_or_else(|| ClientError::NoEncryptionKey(recipient_id.to_string()))?;
        let recipient_key = decode_encryption_public_key(encryption_key)?;

        let body = ChatBody {
            participants: vec![self.client_id(), recipient.client_id.clone()],
            message: message.to_string(),
        };
        let plaintext = serde_json::to_vec(&body)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;

        let session_key = generate_session_key();
        let (iv, ciphertext) = encrypt_session(&plaintext, &session_key)?;
        let wrapped = wrap_key(&session_key, &recipient_key)?;

        self.seal(Payload::PrivateChat(PrivateChat {
            destination_servers: vec![recipient.address],
            iv: BASE64.encode(iv),
            symm_keys: vec![BASE64.encode(wrapped)],
            chat: BASE64.encode(ciphertext),
            client_info: ClientInfo {
                client_id: recipient.client_id,
                server_id: recipient.server_id,
            },
            sender_client_id: self.client_id(),
            time_to_die: unix_millis()
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)),
        }))
    }

    /// Announce a file already stored at `file_link`; `to: None` shares with everyone.
    pub fn file_transfer(
        &mut self,
        file_name: &str,
        file_link: &str,
        to: Option<&str>,
    ) -> Result<WireMessage, ClientError> {
        let destination_server = to
            .and_then(|id| self.recipients.get(id))
            .map(|r| r.address.clone());

        self.seal(Payload::FileTransfer(FileTransfer {
            file_name: file_name.to_string(),
            from: self.client_id(),
            to: to.map(str::to_string),
            destination_server,
            file_link: file_link.to_string(),
            timestamp: unix_millis(),
        }))
    }

    /// Upload `bytes` to `store`, then build the matching `fileTransfer`.
    pub async fn share_file(
        &mut self,
        store: &dyn BlobStore,
        file_name: &str,
        bytes: Vec<u8>,
        to: Option<&str>,
    ) -> Result<WireMessage, ClientError> {
        let link = store.put(file_name, bytes).await?;
        self.file_transfer(file_name, &link, to)
    }

    pub fn heartbeat(&self) -> WireMessage {
        WireMessage::Heartbeat
    }

    pub fn disconnect(&self) -> WireMessage {
        WireMessage::Disconnect {
            user_id: Some(self.client_id()),
        }
    }

    pub fn client_list_request(&self) -> WireMessage {
        WireMessage::ClientListRequest
    }

    /// Keep the recipient cache in step with what the home node tells us.
    pub fn observe(&mut self, message: &WireMessage) {
        match message {
            WireMessage::ClientList { servers } => self.recipients.apply_client_list(servers),
            WireMessage::ClientUpdate { clients } => self.recipients.apply_local_update(clients),
            WireMessage::Disconnect {
                user_id: Some(client_id),
            } => {
                self.recipients.remove(client_id);
            }
            _ => {}
        }
    }

    /// Decrypt a private chat addressed to us.
    pub fn open_private_chat(&self, chat: &PrivateChat) -> Result<ChatBody, ClientError> {
        if chat.client_info.client_id != self.client_id() {
            return Err(ClientError::NotForUs);
        }

        let iv = BASE64
            .decode(&chat.iv)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        let ciphertext = BASE64
            .decode(&chat.chat)
            .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;

        // Any one of the wrapped keys may be ours
        let session_key = chat
            .symm_keys
            .iter()
            .filter_map(|k| BASE64.decode(k).ok())
            .find_map(|wrapped| unwrap_key(&wrapped, self.keys.encryption_secret()).ok())
            .ok_or(CryptoError::UnwrapFailed)?;

        let plaintext = decrypt_session(&iv, &ciphertext, &session_key)?;
        let body = serde_json::from_slice(&plaintext)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(body)
    }
}

/// WebSocket link from a client to its home node
pub struct ClientSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ClientSession {
    pub async fn connect(address: &str) -> Result<Self, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(dial_url(address))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self { ws })
    }

    pub async fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let frame = message
            .to_json()
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        self.ws
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))
    }

    /// Next frame from the node; `None` once the link is closed.
    pub async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        while let Some(inbound) = self.ws.next().await {
            match inbound.map_err(|e| TransportError::NetworkError(e.to_string()))? {
                Message::Text(text) => {
                    return WireMessage::from_json(&text)
                        .map(Some)
                        .map_err(|e| TransportError::SerializationError(e.to_string()));
                }
                Message::Close(_) => return Ok(None),
                _ => continue,
            }
        }
        Ok(None)
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))
    }
}
