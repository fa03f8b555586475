//! Envelope Validator / Router
//!
//! Every inbound frame, from a client or a peer node, goes through
//! [`EnvelopeRouter::handle_frame`]: parse, authenticate, then dispatch.
//! Signed envelopes are forwarded as the exact bytes received so downstream
//! nodes can verify the sender's signature.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::directory::NeighbourhoodDirectory;
use super::registry::{ClientProfile, ClientRegistry};
use crate::crypto::decode_signing_public_key;
use crate::protocol::{FileTransfer, Payload, PrivateChat, ProtocolError, SignedEnvelope, WireMessage};
use crate::transport::{ConnectionHandle, FrameHandler};
use crate::{unix_millis, RelayError};

/// Default capacity of the `(sender, counter)` duplicate cache
pub const DEFAULT_SEEN_CAPACITY: usize = 4096;

/// Envelope authentication failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Bad signature")]
    BadSignature,
    #[error("Invalid sender key: {0}")]
    InvalidKey(String),
    #[error("Counter {counter} not above last seen {last}")]
    StaleCounter { counter: u64, last: u64 },
    #[error("Envelope expired")]
    Expired,
    #[error("Duplicate envelope")]
    Duplicate,
    #[error("Unknown sender: {0}")]
    UnknownSender(String),
    #[error("Envelope does not come from this connection's client")]
    SenderMismatch,
    #[error("Connection has not sent hello")]
    NotRegistered,
    #[error("{0} is only accepted from peer nodes")]
    NotPeer(&'static str),
}

/// Highest counter accepted per sender key.
#[derive(Debug, Default)]
pub struct ReplayGuard {
    last: HashMap<String, u64>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `counter` only if it is strictly above the sender's last one.
    pub fn check_and_record(&mut self, sender_key: &str, counter: u64) -> Result<(), AuthError> {
        match self.last.get_mut(sender_key) {
            Some(last) if counter <= *last => Err(AuthError::StaleCounter {
                counter,
                last: *last,
            }),
            Some(last) => {
                *last = counter;
                Ok(())
            }
            None => {
                self.last.insert(sender_key.to_string(), counter);
                Ok(())
            }
        }
    }

    pub fn last_counter(&self, sender_key: &str) -> Option<u64> {
        self.last.get(sender_key).copied()
    }
}

/// Bounded FIFO of recently accepted `(sender key, counter)` pairs.
///
/// Catches the second copy of a flooded envelope arriving over another link.
#[derive(Debug)]
pub struct SeenCache {
    capacity: usize,
    order: VecDeque<(String, u64)>,
    entries: HashSet<(String, u64)>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            entries: HashSet::new(),
        }
    }

    pub fn contains(&self, sender_key: &str, counter: u64) -> bool {
        self.entries.contains(&(sender_key.to_string(), counter))
    }

    pub fn insert(&mut self, sender_key: &str, counter: u64) {
        let key = (sender_key.to_string(), counter);
        if !self.entries.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// What the router did with a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// `hello` accepted
    Registered { client_id: String },
    /// Flooded to local clients and peers
    Broadcast { local: usize, peers: usize },
    /// Handed to a local client
    Delivered { client_id: String },
    /// Relayed to this many peer nodes
    Forwarded { nodes: usize },
    /// A reply went back on the arrival connection
    Replied,
    RosterUpdated { clients: usize },
    PeerLinked { address: String },
    Heartbeat,
    Disconnected { client_id: Option<String> },
    /// Unknown frame type
    Ignored,
}

/// Authenticates and routes frames for one relay node.
///
/// Lock order is registry, then directory. Parsing and signature checks run
/// outside both.
pub struct EnvelopeRouter {
    registry: Arc<RwLock<ClientRegistry>>,
    directory: Arc<RwLock<NeighbourhoodDirectory>>,
    replay: Mutex<ReplayGuard>,
    seen: Mutex<SeenCache>,
}

impl EnvelopeRouter {
    pub fn new(
        registry: Arc<RwLock<ClientRegistry>>,
        directory: Arc<RwLock<NeighbourhoodDirectory>>,
        seen_capacity: usize,
    ) -> Self {
        Self {
            registry,
            directory,
            replay: Mutex::new(ReplayGuard::new()),
            seen: Mutex::new(SeenCache::new(seen_capacity)),
        }
    }

    pub fn registry(&self) -> &Arc<RwLock<ClientRegistry>> {
        &self.registry
    }

    pub fn directory(&self) -> &Arc<RwLock<NeighbourhoodDirectory>> {
        &self.directory
    }

    /// Process one inbound frame from `connection`.
    pub fn handle_frame(&self, connection: &ConnectionHandle, raw: &str) -> Result<Dispatch, RelayError> {
        let message = WireMessage::from_json(raw)?;
        self.registry.write().touch(connection.id());

        match message {
            WireMessage::SignedData(envelope) => self.handle_signed(connection, raw, envelope),
            WireMessage::ClientListRequest => {
                let roster = self.registry.read().export_roster();
                self.directory
                    .read()
                    .handle_client_list_request(connection, roster)?;
                Ok(Dispatch::Replied)
            }
            WireMessage::ClientUpdate { clients } => {
                let count = clients.len();
                if !self
                    .directory
                    .write()
                    .update_peer_roster(connection.id(), clients)
                {
                    return Err(AuthError::NotPeer("client_update").into());
                }
                debug!(conn = %connection.id(), clients = count, "Peer roster updated");
                Ok(Dispatch::RosterUpdated { clients: count })
            }
            WireMessage::ClientUpdateRequest => {
                if !self.directory.read().is_peer(connection.id()) {
                    return Err(AuthError::NotPeer("client_update_request").into());
                }
                let clients = self.registry.read().export_roster();
                connection.send(&WireMessage::ClientUpdate { clients })?;
                Ok(Dispatch::Replied)
            }
            WireMessage::ServerHello { sender, node_id } => {
                if self
                    .registry
                    .read()
                    .lookup_by_connection(connection.id())
                    .is_some()
                {
                    return Err(RelayError::Routing(
                        "server_hello on a client connection".to_string(),
                    ));
                }
                let linked = self
                    .directory
                    .write()
                    .add_peer(&sender, node_id.clone(), connection.clone());
                if linked {
                    info!(conn = %connection.id(), address = %sender, node_id = ?node_id, "Peer linked");
                    // Answer so the dialing side learns our node id
                    let reply = {
                        let directory = self.directory.read();
                        WireMessage::ServerHello {
                            sender: directory.own_address().to_string(),
                            node_id: Some(directory.node_id().to_string()),
                        }
                    };
                    connection.send(&reply)?;
                }
                Ok(Dispatch::PeerLinked { address: sender })
            }
            WireMessage::Heartbeat => Ok(Dispatch::Heartbeat),
            WireMessage::Disconnect { .. } => {
                let client_id = self.take_offline(connection);
                Ok(Dispatch::Disconnected { client_id })
            }
            WireMessage::ClientList { .. } => Ok(Dispatch::Ignored),
            WireMessage::Unknown => {
                debug!(conn = %connection.id(), "Ignoring unknown frame type");
                Ok(Dispatch::Ignored)
            }
        }
    }

    fn handle_signed(
        &self,
        connection: &ConnectionHandle,
        raw: &str,
        envelope: SignedEnvelope,
    ) -> Result<Dispatch, RelayError> {
        let payload = envelope.payload()?;
        let from_peer = self.directory.read().is_peer(connection.id());
        if from_peer && matches!(payload, Payload::Hello(_)) {
            return Err(RelayError::Routing("hello on a peer link".to_string()));
        }

        let sender_key = self.declared_key(&payload)?;
        let verifying_key =
            decode_signing_public_key(&sender_key).map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        envelope
            .verify(&verifying_key)
            .map_err(|_| AuthError::BadSignature)?;

        if let Payload::PrivateChat(chat) = &payload {
            if chat.is_expired(unix_millis()) {
                return Err(AuthError::Expired.into());
            }
        }
        if !from_peer {
            self.check_origin(connection, &payload, &sender_key)?;
        }

        if self.seen.lock().contains(&sender_key, envelope.counter) {
            return Err(AuthError::Duplicate.into());
        }
        self.replay
            .lock()
            .check_and_record(&sender_key, envelope.counter)?;
        self.seen.lock().insert(&sender_key, envelope.counter);

        match payload {
            Payload::Hello(hello) => {
                let profile = ClientProfile {
                    encryption_key: hello.encryption_key,
                    display_name: hello.display_name,
                };
                let client_id =
                    self.registry
                        .write()
                        .register(&verifying_key, profile, connection.clone());
                info!(conn = %connection.id(), client_id = %client_id, "Client registered");
                self.broadcast_roster();
                Ok(Dispatch::Registered { client_id })
            }
            Payload::PublicChat(_) => Ok(self.flood(connection, raw)),
            Payload::PrivateChat(chat) => self.route_private(raw, &chat),
            Payload::FileTransfer(transfer) => match transfer.to.as_deref() {
                Some(_) => self.route_file(raw, &transfer),
                None => Ok(self.flood(connection, raw)),
            },
            Payload::Unknown => Err(ProtocolError::UnknownPayload.into()),
        }
    }

    /// Base64 signing key the envelope claims to be signed with.
    fn declared_key(&self, payload: &Payload) -> Result<String, RelayError> {
        match payload {
            Payload::Hello(hello) => Ok(hello.public_key.clone()),
            Payload::PublicChat(chat) => Ok(chat.sender.clone()),
            Payload::PrivateChat(chat) => Ok(self.key_for_client(&chat.sender_client_id)?),
            Payload::FileTransfer(transfer) => Ok(self.key_for_client(&transfer.from)?),
            Payload::Unknown => Err(ProtocolError::UnknownPayload.into()),
        }
    }

    fn key_for_client(&self, client_id: &str) -> Result<String, AuthError> {
        let local = self
            .registry
            .read()
            .lookup_by_id(client_id)
            .map(|r| r.public_key.clone());
        local
            .or_else(|| {
                self.directory
                    .read()
                    .remote_entry(client_id)
                    .map(|e| e.public_key.clone())
            })
            .ok_or_else(|| AuthError::UnknownSender(client_id.to_string()))
    }

    /// A client connection may only speak for the identity it registered.
    fn check_origin(
        &self,
        connection: &ConnectionHandle,
        payload: &Payload,
        sender_key: &str,
    ) -> Result<(), AuthError> {
        let registry = self.registry.read();
        match registry.lookup_by_connection(connection.id()) {
            Some(record) if record.public_key == sender_key => Ok(()),
            Some(_) => Err(AuthError::SenderMismatch),
            None if matches!(payload, Payload::Hello(_)) => Ok(()),
            None => Err(AuthError::NotRegistered),
        }
    }

    /// Deliver to every other local client and every peer except the arrival link.
    fn flood(&self, arrival: &ConnectionHandle, raw: &str) -> Dispatch {
        let locals = self.registry.read().local_connections();
        let local = locals
            .iter()
            .filter(|c| c.id() != arrival.id())
            .filter(|c| c.send_raw(raw).is_ok())
            .count();

        let peers = self
            .directory
            .read()
            .peer_connections_except(arrival.id())
            .iter()
            .filter(|c| c.send_raw(raw).is_ok())
            .count();

        Dispatch::Broadcast { local, peers }
    }

    fn deliver_local(&self, client_id: &str, raw: &str) -> Result<Dispatch, RelayError> {
        let connection = self
            .registry
            .read()
            .lookup_by_id(client_id)
            .filter(|r| r.online)
            .and_then(|r| r.connection.clone())
            .ok_or_else(|| RelayError::Routing(format!("{} is not connected here", client_id)))?;

        connection.send_raw(raw)?;
        Ok(Dispatch::Delivered {
            client_id: client_id.to_string(),
        })
    }

    fn route_private(&self, raw: &str, chat: &PrivateChat) -> Result<Dispatch, RelayError> {
        let is_local = {
            let directory = self.directory.read();
            chat.client_info.server_id == directory.node_id()
                || chat.destination_servers.iter().any(|d| directory.is_own(d))
        };
        if is_local {
            return self.deliver_local(&chat.client_info.client_id, raw);
        }

        let directory = self.directory.read();
        let mut nodes = 0;
        for destination in &chat.destination_servers {
            if directory.relay_to_node(destination, raw) {
                nodes += 1;
            } else {
                debug!(destination = %destination, "No link to destination node");
            }
        }
        if nodes == 0 {
            return Err(RelayError::Routing(format!(
                "no known peer among {:?}",
                chat.destination_servers
            )));
        }
        Ok(Dispatch::Forwarded { nodes })
    }

    fn route_file(&self, raw: &str, transfer: &FileTransfer) -> Result<Dispatch, RelayError> {
        let Some(recipient) = transfer.to.as_deref() else {
            return Err(RelayError::Routing("file transfer without recipient".to_string()));
        };

        let hosted_here = self
            .registry
            .read()
            .lookup_by_id(recipient)
            .map(|r| r.online)
            .unwrap_or(false);
        if hosted_here {
            return self.deliver_local(recipient, raw);
        }

        let directory = self.directory.read();
        let destination = transfer
            .destination_server
            .clone()
            .filter(|d| !directory.is_own(d))
            .or_else(|| directory.locate(recipient).map(str::to_string))
            .ok_or_else(|| RelayError::Routing(format!("cannot locate {}", recipient)))?;

        if directory.relay_to_node(&destination, raw) {
            Ok(Dispatch::Forwarded { nodes: 1 })
        } else {
            Err(RelayError::Routing(format!("no link to {}", destination)))
        }
    }

    /// Mark the client on `connection` offline and tell everyone.
    fn take_offline(&self, connection: &ConnectionHandle) -> Option<String> {
        let client_id = self.registry.write().mark_offline(connection.id())?;
        info!(conn = %connection.id(), client_id = %client_id, "Client offline");

        let notice = WireMessage::Disconnect {
            user_id: Some(client_id.clone()),
        };
        for local in self.registry.read().local_connections() {
            let _ = local.send(&notice);
        }
        self.broadcast_roster();
        Some(client_id)
    }

    /// Push this node's current roster to every peer and local client.
    pub fn broadcast_roster(&self) -> usize {
        let (roster, locals) = {
            let registry = self.registry.read();
            (registry.export_roster(), registry.local_connections())
        };
        match self.directory.read().broadcast_roster(roster, &locals) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Roster broadcast failed: {}", e);
                0
            }
        }
    }

    /// Forget whatever was bound to a closed connection.
    pub fn connection_closed(&self, connection: &ConnectionHandle) {
        self.take_offline(connection);
        if let Some(link) = self.directory.write().remove_connection(connection.id()) {
            info!(conn = %connection.id(), address = %link.address, "Peer link closed");
        }
    }
}

impl FrameHandler for EnvelopeRouter {
    fn on_frame(&self, connection: &ConnectionHandle, frame: &str) {
        match self.handle_frame(connection, frame) {
            Ok(dispatch) => debug!(conn = %connection.id(), ?dispatch, "Frame handled"),
            Err(RelayError::Auth(AuthError::Duplicate)) => {
                debug!(conn = %connection.id(), "Dropped duplicate envelope")
            }
            Err(e) => warn!(conn = %connection.id(), "Dropped frame: {}", e),
        }
    }

    fn on_close(&self, connection: &ConnectionHandle) {
        self.connection_closed(connection);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ClientKeys;
    use crate::protocol::{Hello, PublicChat};
    use crate::transport::Outbound;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn router() -> EnvelopeRouter {
        let registry = Arc::new(RwLock::new(ClientRegistry::new()));
        let directory = Arc::new(RwLock::new(NeighbourhoodDirectory::new("127.0.0.1:3000", "n1")));
        EnvelopeRouter::new(registry, directory, DEFAULT_SEEN_CAPACITY)
    }

    fn signed(payload: Payload, counter: u64, keys: &ClientKeys) -> String {
        let envelope = SignedEnvelope::seal(&payload, counter, keys.signing_key()).unwrap();
        WireMessage::SignedData(envelope).to_json().unwrap()
    }

    fn hello(keys: &ClientKeys, counter: u64) -> String {
        signed(
            Payload::Hello(Hello {
                public_key: keys.public_key_b64(),
                encryption_key: Some(keys.encryption_key_b64()),
                display_name: None,
            }),
            counter,
            keys,
        )
    }

    fn public_chat(keys: &ClientKeys, counter: u64, message: &str) -> String {
        signed(
            Payload::PublicChat(PublicChat {
                sender: keys.public_key_b64(),
                display_name: None,
                message: message.to_string(),
            }),
            counter,
            keys,
        )
    }

    fn frames(rx: &mut UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn test_replay_guard_strictly_increasing() {
        let mut guard = ReplayGuard::new();
        assert!(guard.check_and_record("k", 5).is_ok());
        assert_eq!(
            guard.check_and_record("k", 5),
            Err(AuthError::StaleCounter { counter: 5, last: 5 })
        );
        assert!(guard.check_and_record("k", 4).is_err());
        assert!(guard.check_and_record("k", 6).is_ok());
        assert!(guard.check_and_record("other", 1).is_ok());
        assert_eq!(guard.last_counter("k"), Some(6));
    }

    #[test]
    fn test_seen_cache_evicts_oldest() {
        let mut seen = SeenCache::new(2);
        seen.insert("a", 1);
        seen.insert("a", 2);
        seen.insert("a", 2);
        assert_eq!(seen.len(), 2);

        seen.insert("a", 3);
        assert!(!seen.contains("a", 1));
        assert!(seen.contains("a", 2));
        assert!(seen.contains("a", 3));
    }

    #[test]
    fn test_hello_registers_and_broadcasts_roster() {
        let router = router();
        let keys = ClientKeys::generate();
        let (conn, mut rx) = ConnectionHandle::new("c");

        let dispatch = router.handle_frame(&conn, &hello(&keys, 1)).unwrap();
        assert_eq!(
            dispatch,
            Dispatch::Registered {
                client_id: keys.client_id()
            }
        );

        let sent = frames(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("client_update"));
    }

    #[test]
    fn test_malformed_frame_is_parse_error() {
        let router = router();
        let (conn, _rx) = ConnectionHandle::new("c");
        assert!(matches!(
            router.handle_frame(&conn, "{not json"),
            Err(RelayError::Parse(_))
        ));
        assert_eq!(
            router.handle_frame(&conn, r#"{"type":"mystery"}"#).unwrap(),
            Dispatch::Ignored
        );
    }

    #[test]
    fn test_replayed_envelope_rejected() {
        let router = router();
        let keys = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c");
        router.handle_frame(&conn, &hello(&keys, 1)).unwrap();

        let chat = public_chat(&keys, 5, "hi");
        assert!(router.handle_frame(&conn, &chat).is_ok());
        assert_eq!(
            router.handle_frame(&conn, &chat),
            Err(RelayError::Auth(AuthError::Duplicate))
        );

        let older = public_chat(&keys, 3, "signed earlier, arrived later");
        assert!(matches!(
            router.handle_frame(&conn, &older),
            Err(RelayError::Auth(AuthError::StaleCounter { .. }))
        ));
    }

    #[test]
    fn test_unregistered_connection_cannot_chat() {
        let router = router();
        let keys = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c");

        assert_eq!(
            router.handle_frame(&conn, &public_chat(&keys, 1, "hi")),
            Err(RelayError::Auth(AuthError::NotRegistered))
        );
    }

    #[test]
    fn test_connection_cannot_speak_for_another_client() {
        let router = router();
        let alice = ClientKeys::generate();
        let mallory = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c");
        router.handle_frame(&conn, &hello(&mallory, 1)).unwrap();

        // Validly signed by alice, but sent on mallory's connection
        assert_eq!(
            router.handle_frame(&conn, &public_chat(&alice, 1, "hi")),
            Err(RelayError::Auth(AuthError::SenderMismatch))
        );
        assert_eq!(
            router.handle_frame(&conn, &hello(&alice, 2)),
            Err(RelayError::Auth(AuthError::SenderMismatch))
        );
    }

    #[test]
    fn test_forged_signature_rejected() {
        let router = router();
        let alice = ClientKeys::generate();
        let mallory = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c");

        // Claims alice's key, signed by mallory
        let forged = signed(
            Payload::Hello(Hello {
                public_key: alice.public_key_b64(),
                encryption_key: None,
                display_name: None,
            }),
            1,
            &mallory,
        );
        assert_eq!(
            router.handle_frame(&conn, &forged),
            Err(RelayError::Auth(AuthError::BadSignature))
        );
        assert_eq!(router.registry().read().len(), 0);
    }

    #[test]
    fn test_peer_only_frames_rejected_from_clients() {
        let router = router();
        let (conn, mut rx) = ConnectionHandle::new("c");

        assert_eq!(
            router.handle_frame(&conn, r#"{"type":"client_update","clients":[]}"#),
            Err(RelayError::Auth(AuthError::NotPeer("client_update")))
        );
        assert_eq!(
            router.handle_frame(&conn, r#"{"type":"client_update_request"}"#),
            Err(RelayError::Auth(AuthError::NotPeer("client_update_request")))
        );
        assert!(frames(&mut rx).is_empty());
    }

    #[test]
    fn test_server_hello_links_peer_and_answers_update_request() {
        let router = router();
        let (link, mut rx) = ConnectionHandle::new("p");

        let dispatch = router
            .handle_frame(&link, r#"{"type":"server_hello","sender":"127.0.0.1:3001","node_id":"n2"}"#)
            .unwrap();
        assert_eq!(
            dispatch,
            Dispatch::PeerLinked {
                address: "127.0.0.1:3001".to_string()
            }
        );
        assert!(router.directory().read().is_peer(link.id()));

        router
            .handle_frame(&link, r#"{"type":"client_update_request"}"#)
            .unwrap();
        let sent: Vec<WireMessage> = frames(&mut rx)
            .iter()
            .map(|f| WireMessage::from_json(f).unwrap())
            .collect();
        assert_eq!(
            sent,
            vec![
                WireMessage::ServerHello {
                    sender: "127.0.0.1:3000".to_string(),
                    node_id: Some("n1".to_string()),
                },
                WireMessage::ClientUpdate { clients: vec![] },
            ]
        );
    }

    #[test]
    fn test_server_hello_answered_once_per_link() {
        let router = router();
        let (link, mut rx) = ConnectionHandle::new("p");
        let hello = r#"{"type":"server_hello","sender":"127.0.0.1:3001","node_id":"n2"}"#;

        router.handle_frame(&link, hello).unwrap();
        assert_eq!(frames(&mut rx).len(), 1);

        // A reply to our own hello on a known link is not answered again
        router.handle_frame(&link, hello).unwrap();
        assert!(frames(&mut rx).is_empty());
    }

    #[test]
    fn test_hello_on_peer_link_leaves_counter_unused() {
        let router = router();
        let keys = ClientKeys::generate();
        let (link, _rx_link) = ConnectionHandle::new("p");
        let (conn, _rx) = ConnectionHandle::new("c");
        router
            .handle_frame(&link, r#"{"type":"server_hello","sender":"127.0.0.1:3001"}"#)
            .unwrap();

        let frame = hello(&keys, 7);
        assert!(matches!(
            router.handle_frame(&link, &frame),
            Err(RelayError::Routing(_))
        ));
        assert_eq!(router.replay.lock().last_counter(&keys.public_key_b64()), None);

        // The same hello still registers over a client connection
        assert_eq!(
            router.handle_frame(&conn, &frame).unwrap(),
            Dispatch::Registered {
                client_id: keys.client_id()
            }
        );
    }

    #[test]
    fn test_private_chat_for_own_node_id_is_delivered_locally() {
        let router = router();
        let alice = ClientKeys::generate();
        let bob = ClientKeys::generate();
        let (a, _rx_a) = ConnectionHandle::new("a");
        let (b, mut rx_b) = ConnectionHandle::new("b");
        router.handle_frame(&a, &hello(&alice, 1)).unwrap();
        router.handle_frame(&b, &hello(&bob, 1)).unwrap();
        frames(&mut rx_b);

        // Addressed by an address this node does not advertise
        let chat = signed(
            Payload::PrivateChat(PrivateChat {
                destination_servers: vec!["192.0.2.10:3000".to_string()],
                iv: String::new(),
                symm_keys: vec![],
                chat: String::new(),
                client_info: crate::protocol::ClientInfo {
                    client_id: bob.client_id(),
                    server_id: "n1".to_string(),
                },
                sender_client_id: alice.client_id(),
                time_to_die: unix_millis() + 60_000,
            }),
            2,
            &alice,
        );

        assert_eq!(
            router.handle_frame(&a, &chat).unwrap(),
            Dispatch::Delivered {
                client_id: bob.client_id()
            }
        );
        assert_eq!(frames(&mut rx_b), vec![chat]);
    }

    #[test]
    fn test_disconnect_then_close_broadcasts_once() {
        let router = router();
        let alice = ClientKeys::generate();
        let bob = ClientKeys::generate();
        let (a, _rx_a) = ConnectionHandle::new("a");
        let (b, mut rx_b) = ConnectionHandle::new("b");
        router.handle_frame(&a, &hello(&alice, 1)).unwrap();
        router.handle_frame(&b, &hello(&bob, 1)).unwrap();
        frames(&mut rx_b);

        let dispatch = router
            .handle_frame(&a, r#"{"type":"disconnect"}"#)
            .unwrap();
        assert_eq!(
            dispatch,
            Dispatch::Disconnected {
                client_id: Some(alice.client_id())
            }
        );
        router.connection_closed(&a);

        let received = frames(&mut rx_b);
        assert_eq!(received.len(), 2);
        assert!(received[0].contains("disconnect"));
        assert!(received[0].contains(&alice.client_id()));
        assert!(received[1].contains("client_update"));
    }
}
