//! Relay Node: binds the listener, dials neighbours, and sweeps idle clients

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::directory::NeighbourhoodDirectory;
use super::registry::ClientRegistry;
use super::router::{EnvelopeRouter, DEFAULT_SEEN_CAPACITY};
use crate::protocol::WireMessage;
use crate::transport::{
    accept_loop, dial, normalize_address, ConnectionHandle, FrameHandler, TransportError,
};
use crate::RelayError;

/// Relay node configuration
#[derive(Debug, Clone)]
pub struct RelayNodeConfig {
    /// Socket address to listen on
    pub listen_addr: String,
    /// Address peers and clients use to reach us; defaults to the bound address
    pub advertised_address: Option<String>,
    /// Stable node id; a random one is generated when absent
    pub node_id: Option<String>,
    /// Peer addresses dialed on start
    pub neighbours: Vec<String>,
    /// Close client connections silent for longer than this (disabled when `None`)
    pub heartbeat_timeout: Option<Duration>,
    /// How often the idle sweeper runs
    pub sweep_interval: Duration,
    /// Capacity of the duplicate envelope cache
    pub seen_cache_capacity: usize,
    /// Inbound frames larger than this are dropped
    pub max_frame_bytes: usize,
}

impl Default for RelayNodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:3000".to_string(),
            advertised_address: None,
            node_id: None,
            neighbours: Vec::new(),
            heartbeat_timeout: None,
            sweep_interval: Duration::from_secs(10),
            seen_cache_capacity: DEFAULT_SEEN_CAPACITY,
            max_frame_bytes: 1024 * 1024, // 1 MiB
        }
    }
}

/// Point-in-time counts for a relay node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayNodeStats {
    pub clients_known: usize,
    pub clients_online: usize,
    pub peers: usize,
}

/// One relay node in the federation
pub struct RelayNode {
    config: RelayNodeConfig,
    router: Arc<EnvelopeRouter>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    address: String,
    node_id: String,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayNode {
    /// Bind the listener. Nothing is accepted until [`RelayNode::start`].
    pub async fn bind(config: RelayNodeConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|e| TransportError::BindFailed(format!("{}: {}", config.listen_addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let address = match config.advertised_address.as_deref() {
            Some(advertised) => normalize_address(advertised),
            None => announced_address(local_addr),
        };
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let registry = Arc::new(RwLock::new(ClientRegistry::new()));
        let directory = Arc::new(RwLock::new(NeighbourhoodDirectory::new(&address, node_id.clone())));
        let router = Arc::new(EnvelopeRouter::new(
            registry,
            directory,
            config.seen_cache_capacity,
        ));

        info!(%local_addr, address = %address, node_id = %node_id, "Relay node bound");

        Ok(Self {
            config,
            router,
            listener: Mutex::new(Some(listener)),
            local_addr,
            address,
            node_id,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start accepting, start the idle sweeper, and dial configured neighbours.
    ///
    /// A neighbour that cannot be reached is logged and skipped.
    pub async fn start(&self) -> Result<(), RelayError> {
        let listener = self
            .listener
            .lock()
            .take()
            .ok_or_else(|| RelayError::Routing("relay node already started".to_string()))?;

        let handler: Arc<dyn FrameHandler> = self.router.clone();
        let accept = tokio::spawn(accept_loop(listener, handler, self.config.max_frame_bytes));
        self.tasks.lock().push(accept);

        if let Some(timeout) = self.config.heartbeat_timeout {
            let sweeper = tokio::spawn(sweep_idle(
                Arc::clone(&self.router),
                timeout,
                self.config.sweep_interval,
            ));
            self.tasks.lock().push(sweeper);
        }

        for neighbour in &self.config.neighbours {
            if let Err(e) = self.connect_peer(neighbour).await {
                warn!(neighbour = %neighbour, "Could not reach neighbour: {}", e);
            }
        }
        Ok(())
    }

    /// Dial `address` and set it up as a peer link.
    ///
    /// Sends `server_hello`, our roster, then asks for theirs. The peer answers
    /// with its own `server_hello`, which fills in its node id.
    pub async fn connect_peer(&self, address: &str) -> Result<ConnectionHandle, RelayError> {
        let handler: Arc<dyn FrameHandler> = self.router.clone();
        let link = dial(address, handler, self.config.max_frame_bytes).await?;

        self.router
            .directory()
            .write()
            .add_peer(address, None, link.clone());

        link.send(&WireMessage::ServerHello {
            sender: self.address.clone(),
            node_id: Some(self.node_id.clone()),
        })?;
        let clients = self.router.registry().read().export_roster();
        link.send(&WireMessage::ClientUpdate { clients })?;
        link.send(&WireMessage::ClientUpdateRequest)?;

        info!(conn = %link.id(), peer = %normalize_address(address), "Peer connected");
        Ok(link)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Advertised address
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &RelayNodeConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<EnvelopeRouter> {
        &self.router
    }

    pub fn stats(&self) -> RelayNodeStats {
        let (clients_known, clients_online) = {
            let registry = self.router.registry().read();
            (registry.len(), registry.online_count())
        };
        RelayNodeStats {
            clients_known,
            clients_online,
            peers: self.router.directory().read().peer_count(),
        }
    }

    /// Stop background tasks and close every open link.
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let clients = self.router.registry().read().local_connections();
        let peers = self.router.directory().read().peer_connections();
        for connection in clients.iter().chain(peers.iter()) {
            connection.close();
        }
        info!(node_id = %self.node_id, "Relay node shut down");
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Address to announce when none is configured.
///
/// A wildcard bind is not reachable as such, so the loopback address on the
/// same port stands in for it.
fn announced_address(local_addr: SocketAddr) -> String {
    if !local_addr.ip().is_unspecified() {
        return local_addr.to_string();
    }
    let loopback: IpAddr = match local_addr {
        SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
        SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
    };
    let announced = SocketAddr::new(loopback, local_addr.port()).to_string();
    warn!(
        %local_addr,
        announced = %announced,
        "No advertised address set; peers on other hosts need --advertise"
    );
    announced
}

/// Close client connections that have gone quiet for longer than `timeout`.
async fn sweep_idle(router: Arc<EnvelopeRouter>, timeout: Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let stale = router
            .registry()
            .read()
            .stale_connections(timeout, Instant::now());
        for connection in stale {
            debug!(conn = %connection.id(), "Closing idle client connection");
            connection.close();
        }
    }
}
