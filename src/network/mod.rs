//! P2P networking module
//!
//! This module provides:
//! - Length-prefixed JSON message framing
//! - TCP server and handshake handling
//! - Peer registry and relay
//! - Partial and full chain synchronization
//! - Node orchestration

pub mod message;
pub mod node;
pub mod peer;
pub mod server;
pub mod sync;

pub use message::{Message, NodeInfo, MAGIC};
pub use node::{Node, NodeConfig, NodeError, NodeStatus};
pub use peer::{PeerError, PeerHandle, PeerInfo, PeerManager, PeerState, MAX_PEERS};
pub use server::{connect_to_peer, handle_connection, MessageCodec, Server, MAX_FRAME_SIZE};
pub use sync::{SyncConfig, SyncManager, SyncMode, SyncStatus};
