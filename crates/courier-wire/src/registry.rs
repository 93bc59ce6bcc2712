//! Tracks the nodes a [`WireNode`](crate::WireNode) talks to.
//!
//! Each entry records the role a remote node announced during the handshake,
//! so envelopes addressed by role can be routed to a concrete connection.

use chrono::{DateTime, Utc};
use courier_types::Role;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

/// Connection state of a remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Handshake completed, connection open.
    Connected,
    /// Connection lost; the entry is kept until removed.
    Disconnected,
}

/// A single known remote node.
#[derive(Debug, Clone)]
pub struct WirePeer {
    /// Unique node ID of the peer.
    pub node_id: String,
    /// Role the peer announced.
    pub role: Role,
    /// Socket address of the connection.
    pub address: SocketAddr,
    pub state: PeerState,
    /// When the handshake completed.
    pub connected_at: DateTime<Utc>,
    /// Protocol version negotiated during handshake.
    pub protocol_version: u32,
}

/// Thread-safe registry of remote nodes.
#[derive(Debug, Clone)]
pub struct WireRegistry {
    peers: Arc<RwLock<HashMap<String, WirePeer>>>,
}

impl WireRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register or update a peer after a successful handshake.
    pub fn add_peer(&self, entry: WirePeer) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(entry.node_id.clone(), entry);
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&self, node_id: &str) -> Option<WirePeer> {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(node_id)
    }

    /// Mark a peer as no longer routable, keeping its entry.
    pub fn mark_disconnected(&self, node_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = peers.get_mut(node_id) {
            entry.state = PeerState::Disconnected;
        }
    }

    /// Look up a peer by node ID, whatever its state.
    pub fn get_peer(&self, node_id: &str) -> Option<WirePeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.get(node_id).cloned()
    }

    /// Connected peers, ordered by node ID.
    pub fn connected_peers(&self) -> Vec<WirePeer> {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        let mut connected: Vec<WirePeer> = peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect();
        connected.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        connected
    }

    /// Connected peers playing `role`, ordered by node ID.
    pub fn find_by_role(&self, role: &Role) -> Vec<WirePeer> {
        self.connected_peers()
            .into_iter()
            .filter(|p| p.role == *role)
            .collect()
    }

    /// Number of connected peers.
    pub fn connected_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count()
    }

    /// Total number of peers (including disconnected).
    pub fn total_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }
}

impl Default for WireRegistry {
    fn default() -> Self {
        Self::new()
    }
}
