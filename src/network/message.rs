//! Network message types for P2P communication
//!
//! Every frame carries one JSON envelope `{"type": ..., "data": ...}`.

use crate::core::{Block, Transaction};
use serde::{Deserialize, Serialize};

/// Magic bytes for message framing
pub const MAGIC: [u8; 4] = [0x50, 0x4F, 0x57, 0x4C]; // "POWL"

/// Chain summary exchanged in the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Index of the sender's latest block
    pub chain_height: u64,
    pub latest_block_hash: String,
    pub mempool_size: usize,
    /// Unix milliseconds at the sender
    pub timestamp: i64,
}

/// Network message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Announce a newly mined or accepted block
    NewBlock { block: Block },

    /// Announce a signed transaction
    Transaction { transaction: Transaction },

    /// Ask for the full chain
    RequestChain,

    /// Full chain response
    ReceiveChain { chain: Vec<Block> },

    /// Ask for the peer's latest block
    RequestLatest,

    /// Ask for blocks starting at `from_index`
    #[serde(rename_all = "camelCase")]
    RequestBlocksFrom { from_index: u64 },

    /// Batch of blocks plus the sender's height
    #[serde(rename_all = "camelCase")]
    ReceiveBlocks {
        blocks: Vec<Block>,
        from_index: u64,
        total_height: u64,
    },

    /// Opening message from the dialing side
    Handshake(NodeInfo),

    /// Listener's answer to a handshake
    HandshakeAck(NodeInfo),
}

impl Message {
    /// Serialize message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize message from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::NewBlock { .. } => "NEW_BLOCK",
            Message::Transaction { .. } => "TRANSACTION",
            Message::RequestChain => "REQUEST_CHAIN",
            Message::ReceiveChain { .. } => "RECEIVE_CHAIN",
            Message::RequestLatest => "REQUEST_LATEST",
            Message::RequestBlocksFrom { .. } => "REQUEST_BLOCKS_FROM",
            Message::ReceiveBlocks { .. } => "RECEIVE_BLOCKS",
            Message::Handshake(_) => "HANDSHAKE",
            Message::HandshakeAck(_) => "HANDSHAKE_ACK",
        }
    }

    /// The handshake payload, if this is either handshake message
    pub fn node_info(&self) -> Option<&NodeInfo> {
        match self {
            Message::Handshake(info) | Message::HandshakeAck(info) => Some(info),
            _ => None,
        }
    }
}
