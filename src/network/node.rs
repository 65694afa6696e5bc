//! P2P Node implementation
//!
//! The node owns the shared engine and wires it to the network. Connection
//! tasks feed one mpsc channel; a single dispatch loop applies every
//! inbound message, so peer traffic never touches the engine concurrently
//! with itself. Mining runs on a blocking worker and only takes the write
//! lock to append the sealed block.

use crate::config::ChainConfig;
use crate::core::{Block, Blockchain, BlockchainError, Transaction, TransactionError};
use crate::mining::{Miner, MiningStats};
use crate::network::message::{Message, NodeInfo};
use crate::network::peer::{PeerError, PeerManager};
use crate::network::server::{connect_to_peer, handle_connection, Server};
use crate::network::sync::{SyncConfig, SyncManager};
use crate::storage::{Storage, StorageConfig, StorageError};
use chrono::Utc;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;

/// Inbound message queue length
const MESSAGE_QUEUE_SIZE: usize = 1000;

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Blockchain error: {0}")]
    Blockchain(#[from] BlockchainError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),
    #[error("Mining failed: {0}")]
    Mining(String),
    #[error("Node is already running")]
    AlreadyRunning,
}

/// P2P Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Interface to listen on
    pub host: String,
    /// Port to listen on, 0 for any free port
    pub port: u16,
    /// Initial peers to connect to
    pub bootstrap_peers: Vec<String>,
    /// Data directory for the chain snapshot
    pub data_dir: PathBuf,
    pub chain: ChainConfig,
    pub sync: SyncConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8333,
            bootstrap_peers: Vec::new(),
            data_dir: PathBuf::from(".blockchain_data"),
            chain: ChainConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Node status information
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub listen_addr: Option<SocketAddr>,
    pub height: u64,
    pub latest_hash: String,
    pub difficulty: u32,
    pub peers: usize,
    pub pending_tx: usize,
    pub syncing: bool,
}

/// The main P2P node
pub struct Node {
    pub config: NodeConfig,
    pub blockchain: Arc<RwLock<Blockchain>>,
    pub peer_manager: Arc<PeerManager>,
    pub sync: Arc<SyncManager>,
    pub storage: Arc<Storage>,
    message_tx: mpsc::Sender<(SocketAddr, Message)>,
    message_rx: Mutex<Option<mpsc::Receiver<(SocketAddr, Message)>>>,
    shutdown_tx: watch::Sender<bool>,
    listen_addr: RwLock<Option<SocketAddr>>,
}

impl Node {
    /// Create a node, restoring the chain from `data_dir` when a snapshot
    /// exists. A snapshot from a different genesis is an error.
    pub fn new(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let storage = Arc::new(Storage::new(StorageConfig {
            data_dir: config.data_dir.clone(),
            ..Default::default()
        })?);

        let blockchain = Arc::new(RwLock::new(
            storage.load_blockchain(config.chain.clone())?,
        ));
        let peer_manager = Arc::new(PeerManager::new());
        let sync = SyncManager::new(
            blockchain.clone(),
            peer_manager.clone(),
            config.sync.clone(),
        );

        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            blockchain,
            peer_manager,
            sync,
            storage,
            message_tx,
            message_rx: Mutex::new(Some(message_rx)),
            shutdown_tx,
            listen_addr: RwLock::new(None),
        }))
    }

    /// Bind the listener
    pub async fn listen(&self) -> Result<Server, NodeError> {
        let server = Server::bind(&self.config.host, self.config.port).await?;
        *self.listen_addr.write().await = Some(server.local_addr());
        Ok(server)
    }

    /// Bind and run until shutdown
    pub async fn start(self: Arc<Self>) -> Result<(), NodeError> {
        let server = self.listen().await?;
        self.run(server).await
    }

    /// Accept peers, dial the bootstrap list and dispatch messages until
    /// `shutdown` is called.
    pub async fn run(self: Arc<Self>, server: Server) -> Result<(), NodeError> {
        let mut message_rx = self
            .message_rx
            .lock()
            .await
            .take()
            .ok_or(NodeError::AlreadyRunning)?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        log::info!("Node started on {}", server.local_addr());

        let acceptor = Arc::clone(&self);
        let mut accept_shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = server.accept() => match accepted {
                        Ok((stream, addr)) => {
                            log::info!("Incoming connection from {}", addr);
                            acceptor.spawn_connection(stream, addr, false);
                        }
                        Err(e) => log::error!("Accept error: {}", e),
                    },
                    _ = accept_shutdown.changed() => break,
                }
            }
        });

        for peer_addr in &self.config.bootstrap_peers {
            if let Err(e) = self.connect_to(peer_addr).await {
                log::warn!("Bootstrap peer {} unreachable: {}", peer_addr, e);
            }
        }

        loop {
            tokio::select! {
                received = message_rx.recv() => match received {
                    Some((from, msg)) => self.handle_message(from, msg).await,
                    None => break,
                },
                _ = shutdown_rx.changed() => {
                    log::info!("Node shutting down...");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Dial a peer and start the handshake
    pub async fn connect_to(self: &Arc<Self>, addr: &str) -> Result<SocketAddr, NodeError> {
        log::info!("Connecting to peer: {}", addr);
        let (stream, peer_addr) = connect_to_peer(addr).await?;
        self.spawn_connection(stream, peer_addr, true);
        Ok(peer_addr)
    }

    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, outbound: bool) {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let local_info = node.node_info().await;
            if let Err(e) = handle_connection(
                stream,
                addr,
                node.peer_manager.clone(),
                local_info,
                node.message_tx.clone(),
                outbound,
                node.config.sync.handshake_timeout,
            )
            .await
            {
                log::warn!("Connection error with {}: {}", addr, e);
            }
            node.sync.peer_disconnected(&addr).await;
        });
    }

    /// Chain summary sent in handshakes
    pub async fn node_info(&self) -> NodeInfo {
        let chain = self.blockchain.read().await;
        NodeInfo {
            chain_height: chain.height(),
            latest_block_hash: chain.latest_block().hash.clone(),
            mempool_size: chain.mempool().len(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Handle incoming messages
    async fn handle_message(&self, from: SocketAddr, msg: Message) {
        log::debug!("Received {} from {}", msg.type_name(), from);

        match msg {
            Message::Handshake(info) => {
                self.peer_manager.update_peer(&from, &info).await;
                let reply = Message::HandshakeAck(self.node_info().await);
                self.reply(&from, reply).await;
                self.sync_if_behind(from, info.chain_height).await;
            }

            Message::HandshakeAck(info) => {
                self.peer_manager.update_peer(&from, &info).await;
                self.sync_if_behind(from, info.chain_height).await;
            }

            Message::NewBlock { block } => self.handle_new_block(from, block).await,

            Message::Transaction { transaction } => {
                let id = transaction.id();
                let result = self
                    .blockchain
                    .write()
                    .await
                    .add_transaction(transaction.clone());
                match result {
                    Ok(()) => {
                        self.peer_manager
                            .broadcast_except(Message::Transaction { transaction }, &from)
                            .await;
                    }
                    Err(
                        TransactionError::DuplicateTransaction(_) | TransactionError::DoubleSpend(_),
                    ) => log::debug!("Already have transaction {}", id),
                    Err(e) => log::warn!("Rejected transaction {} from {}: {}", id, from, e),
                }
            }

            Message::RequestChain => {
                let chain = self.blockchain.read().await.blocks().to_vec();
                self.reply(&from, Message::ReceiveChain { chain }).await;
            }

            Message::ReceiveChain { chain } => {
                if self.sync.handle_chain(from, chain).await {
                    self.persist().await;
                    let block = self.blockchain.read().await.latest_block().clone();
                    self.peer_manager
                        .broadcast_except(Message::NewBlock { block }, &from)
                        .await;
                }
            }

            Message::RequestLatest => {
                let block = self.blockchain.read().await.latest_block().clone();
                self.reply(&from, Message::NewBlock { block }).await;
            }

            Message::RequestBlocksFrom { from_index } => {
                let blocks = self.sync.get_blocks(from_index).await;
                let total_height = self.blockchain.read().await.height();
                self.reply(
                    &from,
                    Message::ReceiveBlocks {
                        blocks,
                        from_index,
                        total_height,
                    },
                )
                .await;
            }

            Message::ReceiveBlocks {
                blocks,
                total_height,
                ..
            } => {
                self.peer_manager.note_height(&from, total_height).await;
                if self.sync.handle_blocks(from, blocks, total_height).await > 0 {
                    self.persist().await;
                }
            }
        }
    }

    async fn handle_new_block(&self, from: SocketAddr, block: Block) {
        self.peer_manager.note_height(&from, block.index).await;

        let mut chain = self.blockchain.write().await;
        let local_height = chain.height();

        if block.index <= local_height {
            log::debug!("Ignoring stale block {} from {}", block.index, from);
            return;
        }

        if block.index > local_height + 1 {
            drop(chain);
            log::info!(
                "Block {} from {} is ahead of local height {}",
                block.index,
                from,
                local_height
            );
            self.sync.start_sync(from, block.index, false).await;
            return;
        }

        match chain.receive_block(block.clone()) {
            Ok(()) => {
                drop(chain);
                log::info!("Accepted block {} from {}", block.index, from);
                self.persist().await;
                self.peer_manager
                    .broadcast_except(Message::NewBlock { block }, &from)
                    .await;
            }
            Err(e) => {
                drop(chain);
                log::warn!("Rejected block {} from {}: {}", block.index, from, e);
                self.sync.start_sync(from, block.index, true).await;
            }
        }
    }

    /// Sync from the highest known peer once `peer` reports a longer chain
    async fn sync_if_behind(&self, peer: SocketAddr, peer_height: u64) {
        let (peer, peer_height) = match self.peer_manager.get_best_peer().await {
            Some((best, height)) if height > peer_height => (best, height),
            _ => (peer, peer_height),
        };
        let local_height = self.blockchain.read().await.height();
        if peer_height > local_height {
            self.sync.start_sync(peer, peer_height, false).await;
        }
    }

    async fn reply(&self, to: &SocketAddr, msg: Message) {
        let name = msg.type_name();
        if let Err(e) = self.peer_manager.send_to(to, msg).await {
            log::warn!("Failed to send {} to {}: {}", name, to, e);
        }
    }

    /// Save the chain. Runs under the read lock so saves cannot reorder.
    async fn persist(&self) {
        let chain = self.blockchain.read().await;
        if let Err(e) = self.storage.save(&chain.snapshot()) {
            log::error!("Failed to save blockchain: {}", e);
        }
    }

    /// Mine one block off the engine lock, then append, persist and
    /// announce it.
    pub async fn mine_block(&self, miner_address: &str) -> Result<(Block, MiningStats), NodeError> {
        let template = self
            .blockchain
            .read()
            .await
            .create_block_template(miner_address);

        let (block, stats) = tokio::task::spawn_blocking(move || Miner::mine_template(template))
            .await
            .map_err(|e| NodeError::Mining(e.to_string()))?;

        self.blockchain
            .write()
            .await
            .submit_mined_block(block.clone())?;

        self.persist().await;
        self.peer_manager
            .broadcast(Message::NewBlock {
                block: block.clone(),
            })
            .await;

        Ok((block, stats))
    }

    /// Queue a transaction locally and announce it
    pub async fn submit_transaction(&self, tx: Transaction) -> Result<(), NodeError> {
        self.blockchain.write().await.add_transaction(tx.clone())?;
        self.peer_manager
            .broadcast(Message::Transaction { transaction: tx })
            .await;
        Ok(())
    }

    /// Mine every `interval` while transactions are pending
    pub fn auto_mine(self: &Arc<Self>, miner_address: String, interval: Duration) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pending = node.blockchain.read().await.mempool().len();
                        if pending == 0 {
                            continue;
                        }
                        if let Err(e) = node.mine_block(&miner_address).await {
                            log::warn!("Auto-mining failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }

    /// Get node status
    pub async fn status(&self) -> NodeStatus {
        let (height, latest_hash, difficulty, pending_tx) = {
            let chain = self.blockchain.read().await;
            (
                chain.height(),
                chain.latest_block().hash.clone(),
                chain.difficulty(),
                chain.mempool().len(),
            )
        };

        NodeStatus {
            listen_addr: *self.listen_addr.read().await,
            height,
            latest_hash,
            difficulty,
            peers: self.peer_manager.peer_count().await,
            pending_tx,
            syncing: self.sync.is_syncing().await,
        }
    }

    /// Stop the dispatch loop, the acceptor and auto-mining
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}
