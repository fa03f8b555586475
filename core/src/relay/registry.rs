//! Client Registry: per-node bookkeeping of directly-connected clients
//!
//! The signing public key is the uniqueness key; the client id is derived from
//! it. Records survive disconnects as offline entries so a reconnect reuses the
//! same slot instead of creating a duplicate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ed25519_dalek::VerifyingKey;

use crate::crypto::{encode_signing_public_key, fingerprint};
use crate::protocol::RosterEntry;
use crate::transport::{ConnectionHandle, ConnectionId};

/// Mutable, unauthenticated profile fields sent with `hello`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientProfile {
    pub encryption_key: Option<String>,
    pub display_name: Option<String>,
}

/// One client known to this node
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Base64 signing public key
    pub public_key: String,
    pub client_id: String,
    pub profile: ClientProfile,
    /// Live connection, `None` once offline
    pub connection: Option<ConnectionHandle>,
    pub online: bool,
    pub last_seen: Instant,
}

impl ClientRecord {
    pub fn roster_entry(&self) -> RosterEntry {
        RosterEntry {
            client_id: self.client_id.clone(),
            public_key: self.public_key.clone(),
            encryption_key: self.profile.encryption_key.clone(),
            username: self.profile.display_name.clone(),
        }
    }
}

/// Authoritative registry of this node's clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    /// public key → record
    records: HashMap<String, ClientRecord>,
    /// client id → public key
    by_id: HashMap<String, String>,
    /// connection → public key (online records only)
    by_connection: HashMap<ConnectionId, String>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a client and bind it to `connection`.
    ///
    /// Re-registering a known key replaces the connection and marks it online;
    /// it never creates a second record.
    pub fn register(
        &mut self,
        public_key: &VerifyingKey,
        profile: ClientProfile,
        connection: ConnectionHandle,
    ) -> String {
        let encoded = encode_signing_public_key(public_key);
        let client_id = fingerprint(public_key.as_bytes());
        let connection_id = connection.id();

        if let Some(existing) = self.records.get_mut(&encoded) {
            if let Some(previous) = existing.connection.take() {
                if previous.id() != connection_id {
                    self.by_connection.remove(&previous.id());
                }
            }
            existing.connection = Some(connection);
            existing.online = true;
            existing.profile = profile;
            existing.last_seen = Instant::now();
        } else {
            self.records.insert(
                encoded.clone(),
                ClientRecord {
                    public_key: encoded.clone(),
                    client_id: client_id.clone(),
                    profile,
                    connection: Some(connection),
                    online: true,
                    last_seen: Instant::now(),
                },
            );
            self.by_id.insert(client_id.clone(), encoded.clone());
        }

        self.by_connection.insert(connection_id, encoded);
        client_id
    }

    /// Mark the client bound to `connection` offline.
    ///
    /// Returns its client id, or `None` when the connection is not the
    /// client's current one (e.g. a stale close after a reconnect).
    pub fn mark_offline(&mut self, connection: ConnectionId) -> Option<String> {
        let key = self.by_connection.remove(&connection)?;
        let record = self.records.get_mut(&key)?;

        if record.connection.as_ref().map(|c| c.id()) != Some(connection) {
            return None;
        }
        record.connection = None;
        record.online = false;
        Some(record.client_id.clone())
    }

    pub fn lookup_by_id(&self, client_id: &str) -> Option<&ClientRecord> {
        self.by_id.get(client_id).and_then(|key| self.records.get(key))
    }

    pub fn lookup_by_key(&self, public_key: &str) -> Option<&ClientRecord> {
        self.records.get(public_key)
    }

    pub fn lookup_by_connection(&self, connection: ConnectionId) -> Option<&ClientRecord> {
        self.by_connection
            .get(&connection)
            .and_then(|key| self.records.get(key))
    }

    /// Online clients, ordered by client id.
    pub fn export_roster(&self) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> = self
            .records
            .values()
            .filter(|r| r.online)
            .map(ClientRecord::roster_entry)
            .collect();
        roster.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        roster
    }

    pub fn local_connections(&self) -> Vec<ConnectionHandle> {
        self.records
            .values()
            .filter(|r| r.online)
            .filter_map(|r| r.connection.clone())
            .collect()
    }

    /// Record liveness for the client on `connection`.
    pub fn touch(&mut self, connection: ConnectionId) -> bool {
        let Some(key) = self.by_connection.get(&connection) else {
            return false;
        };
        match self.records.get_mut(key) {
            Some(record) => {
                record.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Online connections that have been silent for longer than `timeout`.
    pub fn stale_connections(&self, timeout: Duration, now: Instant) -> Vec<ConnectionHandle> {
        self.records
            .values()
            .filter(|r| r.online && now.saturating_duration_since(r.last_seen) > timeout)
            .filter_map(|r| r.connection.clone())
            .collect()
    }

    /// Total records, online or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn online_count(&self) -> usize {
        self.by_connection.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ClientKeys;

    fn profile(name: &str) -> ClientProfile {
        ClientProfile {
            encryption_key: None,
            display_name: Some(name.to_string()),
        }
    }

    #[test]
    fn test_register_returns_fingerprint() {
        let mut registry = ClientRegistry::new();
        let keys = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c1");

        let id = registry.register(&keys.verifying_key(), profile("alice"), conn.clone());

        assert_eq!(id, keys.client_id());
        let record = registry.lookup_by_id(&id).unwrap();
        assert!(record.online);
        assert_eq!(record.public_key, keys.public_key_b64());
        assert_eq!(registry.lookup_by_connection(conn.id()).unwrap().client_id, id);
    }

    #[test]
    fn test_reconnect_keeps_single_record() {
        let mut registry = ClientRegistry::new();
        let keys = ClientKeys::generate();
        let (first, _rx1) = ConnectionHandle::new("c1");
        let (second, _rx2) = ConnectionHandle::new("c2");

        let id1 = registry.register(&keys.verifying_key(), profile("alice"), first.clone());
        registry.mark_offline(first.id());
        let id2 = registry.register(&keys.verifying_key(), profile("alice2"), second.clone());

        assert_eq!(id1, id2);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.export_roster().len(), 1);

        let record = registry.lookup_by_id(&id1).unwrap();
        assert!(record.online);
        assert_eq!(record.connection.as_ref().unwrap().id(), second.id());
        assert_eq!(record.profile.display_name.as_deref(), Some("alice2"));
    }

    #[test]
    fn test_reconnect_without_close_replaces_connection() {
        let mut registry = ClientRegistry::new();
        let keys = ClientKeys::generate();
        let (first, _rx1) = ConnectionHandle::new("c1");
        let (second, _rx2) = ConnectionHandle::new("c2");

        registry.register(&keys.verifying_key(), profile("alice"), first.clone());
        registry.register(&keys.verifying_key(), profile("alice"), second.clone());

        // The superseded connection closing later must not take the client offline
        assert_eq!(registry.mark_offline(first.id()), None);
        assert!(registry.lookup_by_id(&keys.client_id()).unwrap().online);
        assert_eq!(registry.online_count(), 1);
    }

    #[test]
    fn test_mark_offline() {
        let mut registry = ClientRegistry::new();
        let keys = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c1");

        let id = registry.register(&keys.verifying_key(), profile("alice"), conn.clone());
        assert_eq!(registry.mark_offline(conn.id()), Some(id.clone()));

        let record = registry.lookup_by_id(&id).unwrap();
        assert!(!record.online);
        assert!(record.connection.is_none());
        assert!(registry.export_roster().is_empty());
        assert!(registry.local_connections().is_empty());

        // Second close is a no-op
        assert_eq!(registry.mark_offline(conn.id()), None);
    }

    #[test]
    fn test_export_roster_sorted_and_online_only() {
        let mut registry = ClientRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let keys = ClientKeys::generate();
            let (conn, rx) = ConnectionHandle::new("c");
            registry.register(&keys.verifying_key(), ClientProfile::default(), conn.clone());
            handles.push((conn, rx));
        }
        registry.mark_offline(handles[0].0.id());

        let roster = registry.export_roster();
        assert_eq!(roster.len(), 4);
        assert!(roster.windows(2).all(|w| w[0].client_id <= w[1].client_id));
    }

    #[test]
    fn test_stale_connections() {
        let mut registry = ClientRegistry::new();
        let keys = ClientKeys::generate();
        let (conn, _rx) = ConnectionHandle::new("c1");
        registry.register(&keys.verifying_key(), ClientProfile::default(), conn.clone());

        let now = Instant::now();
        assert!(registry
            .stale_connections(Duration::from_secs(30), now)
            .is_empty());

        let later = now + Duration::from_secs(31);
        let stale = registry.stale_connections(Duration::from_secs(30), later);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id(), conn.id());

        assert!(registry.touch(conn.id()));
        let (unknown, _rx2) = ConnectionHandle::new("c2");
        assert!(!registry.touch(unknown.id()));
    }
}
