//! Peer management for P2P networking
//!
//! Tracks connected peers and routes outgoing messages to their writer
//! tasks. Sends never block: a peer whose queue is full misses the message.

use crate::network::message::{Message, NodeInfo};
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

/// Maximum number of connected peers
pub const MAX_PEERS: usize = 8;

/// Outgoing queue length per peer
pub const PEER_QUEUE_SIZE: usize = 256;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Send queue full")]
    QueueFull,
    #[error("Max peers reached")]
    MaxPeersReached,
    #[error("Invalid handshake")]
    InvalidHandshake,
    #[error("Handshake timed out")]
    HandshakeTimeout,
}

/// Peer connection state
#[derive(Debug, Clone, PartialEq)]
pub enum PeerState {
    Connecting,
    Connected,
}

/// Information about a connected peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub state: PeerState,
    /// Peer's latest block index, as last announced
    pub height: u64,
    pub latest_hash: String,
    pub mempool_size: usize,
    /// Whether we dialed this peer
    pub outbound: bool,
}

impl PeerInfo {
    pub fn new(addr: SocketAddr, outbound: bool) -> Self {
        Self {
            addr,
            state: PeerState::Connecting,
            height: 0,
            latest_hash: String::new(),
            mempool_size: 0,
            outbound,
        }
    }

    pub fn update_from_info(&mut self, info: &NodeInfo) {
        self.height = info.chain_height;
        self.latest_hash = info.latest_block_hash.clone();
        self.mempool_size = info.mempool_size;
        self.state = PeerState::Connected;
    }
}

/// Handle for sending messages to a peer
#[derive(Clone)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    pub tx: mpsc::Sender<Message>,
}

impl PeerHandle {
    /// Queue a message without waiting
    pub fn send(&self, msg: Message) -> Result<(), PeerError> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PeerError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PeerError::Disconnected,
        })
    }
}

/// Manages all peer connections
#[derive(Default)]
pub struct PeerManager {
    peers: RwLock<HashMap<SocketAddr, PeerInfo>>,
    handles: RwLock<HashMap<SocketAddr, PeerHandle>>,
}

impl PeerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new peer
    pub async fn add_peer(
        &self,
        addr: SocketAddr,
        handle: PeerHandle,
        outbound: bool,
    ) -> Result<(), PeerError> {
        let mut peers = self.peers.write().await;

        if peers.len() >= MAX_PEERS && !peers.contains_key(&addr) {
            log::warn!("Rejecting peer {}: {} peers connected", addr, peers.len());
            return Err(PeerError::MaxPeersReached);
        }

        peers.insert(addr, PeerInfo::new(addr, outbound));
        self.handles.write().await.insert(addr, handle);

        log::info!("Added peer: {} (outbound: {})", addr, outbound);
        Ok(())
    }

    /// Remove a peer
    pub async fn remove_peer(&self, addr: &SocketAddr) {
        let removed = self.peers.write().await.remove(addr).is_some();
        self.handles.write().await.remove(addr);

        if removed {
            log::info!("Removed peer: {}", addr);
        }
    }

    /// Record the chain summary a peer sent us
    pub async fn update_peer(&self, addr: &SocketAddr, info: &NodeInfo) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(addr) {
            peer.update_from_info(info);
            log::info!(
                "Peer {} at height {} ({} pending)",
                addr,
                info.chain_height,
                info.mempool_size
            );
        }
    }

    /// Raise a peer's known height after it announced a block
    pub async fn note_height(&self, addr: &SocketAddr, height: u64) {
        if let Some(peer) = self.peers.write().await.get_mut(addr) {
            peer.height = peer.height.max(height);
        }
    }

    /// Get peer count
    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Broadcast a message to all peers
    pub async fn broadcast(&self, msg: Message) {
        let handles = self.handles.read().await;
        for (addr, handle) in handles.iter() {
            if let Err(e) = handle.send(msg.clone()) {
                log::warn!("Failed to send {} to {}: {}", msg.type_name(), addr, e);
            }
        }
    }

    /// Broadcast a message to all peers except one
    pub async fn broadcast_except(&self, msg: Message, except: &SocketAddr) {
        let handles = self.handles.read().await;
        for (addr, handle) in handles.iter().filter(|(addr, _)| *addr != except) {
            if let Err(e) = handle.send(msg.clone()) {
                log::warn!("Failed to relay {} to {}: {}", msg.type_name(), addr, e);
            }
        }
    }

    /// Send a message to a specific peer
    pub async fn send_to(&self, addr: &SocketAddr, msg: Message) -> Result<(), PeerError> {
        let handles = self.handles.read().await;
        match handles.get(addr) {
            Some(handle) => handle.send(msg),
            None => Err(PeerError::Disconnected),
        }
    }

    /// Get the handshaken peer with the highest chain
    pub async fn get_best_peer(&self) -> Option<(SocketAddr, u64)> {
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|(_, p)| p.state == PeerState::Connected)
            .max_by_key(|(_, p)| p.height)
            .map(|(addr, p)| (*addr, p.height))
    }
}
