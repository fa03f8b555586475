//! Neighbourhood Directory: the node's peer links and their cached rosters
//!
//! Peers are keyed by their normalized advertised address. Each link caches
//! the last `client_update` received on it, which is how this node learns
//! where remote clients live.

use std::collections::HashMap;

use crate::protocol::{NodeDescriptor, ProtocolError, RosterEntry, WireMessage};
use crate::transport::{normalize_address, ConnectionHandle, ConnectionId, TransportError};

/// One node → node link
///
/// Two nodes that dial each other at the same time end up with two
/// connections; both stay in `connections` and either may carry frames.
/// The first one is used for sending.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub address: String,
    pub node_id: Option<String>,
    pub connections: Vec<ConnectionHandle>,
    /// Last roster the peer sent us
    pub roster: Vec<RosterEntry>,
}

impl PeerLink {
    /// Connection frames to this peer are sent on
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connections.first()
    }

    fn carries(&self, connection: ConnectionId) -> bool {
        self.connections.iter().any(|c| c.id() == connection)
    }

    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            address: self.address.clone(),
            server_id: self
                .node_id
                .clone()
                .unwrap_or_else(|| self.address.clone()),
            clients: self.roster.clone(),
        }
    }
}

#[derive(Debug)]
pub struct NeighbourhoodDirectory {
    own_address: String,
    node_id: String,
    /// address → link
    peers: HashMap<String, PeerLink>,
    /// connection → address
    by_connection: HashMap<ConnectionId, String>,
}

impl NeighbourhoodDirectory {
    pub fn new(own_address: &str, node_id: impl Into<String>) -> Self {
        Self {
            own_address: normalize_address(own_address),
            node_id: node_id.into(),
            peers: HashMap::new(),
            by_connection: HashMap::new(),
        }
    }

    pub fn own_address(&self) -> &str {
        &self.own_address
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Whether `target` (address or node id) names this node.
    pub fn is_own(&self, target: &str) -> bool {
        target == self.node_id || normalize_address(target) == self.own_address
    }

    /// Register `connection` as a link to the node at `address`.
    ///
    /// Returns `true` when the connection was not linked before. A connection
    /// that is already linked only records `node_id`. A new connection joins
    /// the existing link for the same address or node id, if there is one.
    pub fn add_peer(
        &mut self,
        address: &str,
        node_id: Option<String>,
        connection: ConnectionHandle,
    ) -> bool {
        if let Some(key) = self.by_connection.get(&connection.id()) {
            if let (Some(link), Some(id)) = (self.peers.get_mut(key), node_id) {
                link.node_id = Some(id);
            }
            return false;
        }

        let address = normalize_address(address);
        let key = if self.peers.contains_key(&address) {
            address
        } else {
            node_id
                .as_deref()
                .and_then(|id| self.peers.values().find(|l| l.node_id.as_deref() == Some(id)))
                .map(|l| l.address.clone())
                .unwrap_or(address)
        };

        self.by_connection.insert(connection.id(), key.clone());
        let link = self.peers.entry(key.clone()).or_insert_with(|| PeerLink {
            address: key,
            node_id: None,
            connections: Vec::new(),
            roster: Vec::new(),
        });
        if node_id.is_some() {
            link.node_id = node_id;
        }
        link.connections.push(connection);
        true
    }

    /// Drop `connection` from its link.
    ///
    /// The peer and its cached roster are forgotten, and returned, once its
    /// last connection is gone.
    pub fn remove_connection(&mut self, connection: ConnectionId) -> Option<PeerLink> {
        let address = self.by_connection.remove(&connection)?;
        let link = self.peers.get_mut(&address)?;
        link.connections.retain(|c| c.id() != connection);
        if link.connections.is_empty() {
            self.peers.remove(&address)
        } else {
            None
        }
    }

    pub fn is_peer(&self, connection: ConnectionId) -> bool {
        self.by_connection.contains_key(&connection)
    }

    pub fn peer(&self, address: &str) -> Option<&PeerLink> {
        self.peers.get(&normalize_address(address))
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Replace the roster cached for the peer on `connection`.
    pub fn update_peer_roster(&mut self, connection: ConnectionId, roster: Vec<RosterEntry>) -> bool {
        let Some(address) = self.by_connection.get(&connection) else {
            return false;
        };
        match self.peers.get_mut(address) {
            Some(link) => {
                link.roster = roster;
                true
            }
            None => false,
        }
    }

    /// Every open peer connection, standby links included
    pub fn peer_connections(&self) -> Vec<ConnectionHandle> {
        self.peers
            .values()
            .flat_map(|l| l.connections.iter().cloned())
            .collect()
    }

    /// One connection per peer, skipping the peer behind `connection`.
    pub fn peer_connections_except(&self, connection: ConnectionId) -> Vec<ConnectionHandle> {
        self.peers
            .values()
            .filter(|l| !l.carries(connection))
            .filter_map(|l| l.connection().cloned())
            .collect()
    }

    fn find_peer(&self, target: &str) -> Option<&PeerLink> {
        self.peers
            .get(&normalize_address(target))
            .or_else(|| {
                self.peers
                    .values()
                    .find(|l| l.node_id.as_deref() == Some(target))
            })
    }

    /// Forward `frame` unchanged to the peer named by address or node id.
    ///
    /// Best-effort: `false` when there is no such link or it has closed.
    pub fn relay_to_node(&self, target: &str, frame: &str) -> bool {
        self.find_peer(target)
            .and_then(PeerLink::connection)
            .map_or(false, |c| c.send_raw(frame).is_ok())
    }

    /// Address of the peer whose roster lists `client_id`.
    pub fn locate(&self, client_id: &str) -> Option<&str> {
        self.peers
            .values()
            .find(|l| l.roster.iter().any(|e| e.client_id == client_id))
            .map(|l| l.address.as_str())
    }

    pub fn remote_entry(&self, client_id: &str) -> Option<&RosterEntry> {
        self.peers
            .values()
            .flat_map(|l| l.roster.iter())
            .find(|e| e.client_id == client_id)
    }

    pub fn own_descriptor(&self, own_roster: Vec<RosterEntry>) -> NodeDescriptor {
        NodeDescriptor {
            address: self.own_address.clone(),
            server_id: self.node_id.clone(),
            clients: own_roster,
        }
    }

    /// This node first, then every peer ordered by address.
    pub fn client_list(&self, own_roster: Vec<RosterEntry>) -> Vec<NodeDescriptor> {
        let mut peers: Vec<&PeerLink> = self.peers.values().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));

        std::iter::once(self.own_descriptor(own_roster))
            .chain(peers.into_iter().map(PeerLink::descriptor))
            .collect()
    }

    /// Send `client_update` to every peer and every local client.
    ///
    /// Returns how many links accepted the frame.
    pub fn broadcast_roster(
        &self,
        roster: Vec<RosterEntry>,
        local_clients: &[ConnectionHandle],
    ) -> Result<usize, ProtocolError> {
        let frame = WireMessage::ClientUpdate { clients: roster }.to_json()?;

        let sent = self
            .peers
            .values()
            .filter_map(PeerLink::connection)
            .chain(local_clients.iter())
            .filter(|c| c.send_raw(frame.as_str()).is_ok())
            .count();
        Ok(sent)
    }

    pub fn handle_client_list_request(
        &self,
        requester: &ConnectionHandle,
        own_roster: Vec<RosterEntry>,
    ) -> Result<(), TransportError> {
        requester.send(&WireMessage::ClientList {
            servers: self.client_list(own_roster),
        })
    }
}
