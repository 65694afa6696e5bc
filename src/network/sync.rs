//! Chain synchronization with peers
//!
//! At most one sync runs at a time. A sync is either partial (ask for the
//! missing range with `REQUEST_BLOCKS_FROM`) or full (ask for the whole
//! chain). Every request arms a timeout; a timeout or an invalid response
//! counts as a failed attempt, retried after a cooldown until the retry
//! budget is spent, after which the sync is abandoned.

use crate::core::{Block, Blockchain, BlockchainError};
use crate::network::message::Message;
use crate::network::peer::PeerManager;
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

/// Largest gap still closed with a partial sync
pub const PARTIAL_SYNC_MAX_GAP: u64 = 50;

/// Sync tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_retries: u32,
    pub sync_timeout: Duration,
    pub retry_cooldown: Duration,
    /// Cap on blocks served per `RECEIVE_BLOCKS`
    pub max_blocks_per_response: usize,
    pub handshake_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sync_timeout: Duration::from_secs(30),
            retry_cooldown: Duration::from_secs(5),
            max_blocks_per_response: 50,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Partial,
    Full,
}

#[derive(Debug)]
struct SyncState {
    syncing: bool,
    peer: Option<SocketAddr>,
    mode: SyncMode,
    attempts: u32,
    /// Bumped on every request and reset; stale timers compare against it
    generation: u64,
    started_at: Option<Instant>,
}

impl SyncState {
    fn idle() -> Self {
        Self {
            syncing: false,
            peer: None,
            mode: SyncMode::Partial,
            attempts: 0,
            generation: 0,
            started_at: None,
        }
    }

    fn is_active_with(&self, peer: &SocketAddr) -> bool {
        self.syncing && self.peer.as_ref() == Some(peer)
    }

    fn reset(&mut self) {
        self.syncing = false;
        self.peer = None;
        self.attempts = 0;
        self.started_at = None;
        self.generation += 1;
    }
}

/// Snapshot of the sync state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStatus {
    pub syncing: bool,
    pub peer: Option<SocketAddr>,
    pub mode: SyncMode,
    pub attempts: u32,
}

/// Chain synchronization manager
pub struct SyncManager {
    blockchain: Arc<RwLock<Blockchain>>,
    peer_manager: Arc<PeerManager>,
    config: SyncConfig,
    state: Mutex<SyncState>,
}

impl SyncManager {
    pub fn new(
        blockchain: Arc<RwLock<Blockchain>>,
        peer_manager: Arc<PeerManager>,
        config: SyncConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            blockchain,
            peer_manager,
            config,
            state: Mutex::new(SyncState::idle()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Check if currently syncing
    pub async fn is_syncing(&self) -> bool {
        self.state.lock().await.syncing
    }

    pub async fn status(&self) -> SyncStatus {
        let state = self.state.lock().await;
        SyncStatus {
            syncing: state.syncing,
            peer: state.peer,
            mode: state.mode,
            attempts: state.attempts,
        }
    }

    /// Sync from `peer`, which reported `peer_height`.
    ///
    /// Returns false when nothing was started: the peer is not ahead, or a
    /// sync that has not timed out is already in flight. `force_full` skips
    /// the partial path.
    pub async fn start_sync(
        self: &Arc<Self>,
        peer: SocketAddr,
        peer_height: u64,
        force_full: bool,
    ) -> bool {
        let local_height = self.blockchain.read().await.height();
        if peer_height <= local_height && !force_full {
            return false;
        }

        {
            let mut state = self.state.lock().await;
            if state.syncing {
                let fresh = state
                    .started_at
                    .map(|t| t.elapsed() < self.config.sync_timeout)
                    .unwrap_or(false);
                if fresh {
                    log::debug!("Sync already in flight with {:?}", state.peer);
                    return false;
                }
                log::warn!("Replacing stalled sync with {:?}", state.peer);
            }

            let behind = peer_height.saturating_sub(local_height);
            let mode = if !force_full && local_height > 0 && behind <= PARTIAL_SYNC_MAX_GAP {
                SyncMode::Partial
            } else {
                SyncMode::Full
            };

            log::info!(
                "Starting {:?} sync with {} (local {}, peer {})",
                mode,
                peer,
                local_height,
                peer_height
            );

            state.syncing = true;
            state.peer = Some(peer);
            state.mode = mode;
            state.attempts = 0;
        }

        self.send_request().await;
        true
    }

    /// Issue the request for the current sync and arm its timeout
    async fn send_request(self: &Arc<Self>) {
        let local_height = self.blockchain.read().await.height();

        let (peer, mode, generation) = {
            let mut state = self.state.lock().await;
            let Some(peer) = state.peer.filter(|_| state.syncing) else {
                return;
            };
            state.generation += 1;
            state.started_at = Some(Instant::now());
            (peer, state.mode, state.generation)
        };

        let msg = match mode {
            SyncMode::Partial => Message::RequestBlocksFrom {
                from_index: local_height + 1,
            },
            SyncMode::Full => Message::RequestChain,
        };

        if let Err(e) = self.peer_manager.send_to(&peer, msg).await {
            log::warn!("Failed to request sync from {}: {}", peer, e);
            self.abandon(generation).await;
            return;
        }

        let this = Arc::clone(self);
        let timeout = self.config.sync_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.on_timeout(generation).await;
        });
    }

    async fn on_timeout(self: &Arc<Self>, generation: u64) {
        let expired = {
            let state = self.state.lock().await;
            state.syncing && state.generation == generation
        };
        if expired {
            self.fail("timed out").await;
        }
    }

    async fn abandon(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation == generation {
            log::warn!("Abandoning sync with {:?}", state.peer);
            state.reset();
        }
    }

    /// Count a failed attempt; retry after the cooldown or give up
    async fn fail(self: &Arc<Self>, reason: &str) {
        let generation = {
            let mut state = self.state.lock().await;
            if !state.syncing {
                return;
            }
            state.attempts += 1;
            if state.attempts >= self.config.max_retries {
                log::warn!(
                    "Sync with {:?} {}; giving up after {} attempts",
                    state.peer,
                    reason,
                    state.attempts
                );
                state.reset();
                return;
            }

            log::warn!(
                "Sync with {:?} {} (attempt {}/{}), retrying in {:?}",
                state.peer,
                reason,
                state.attempts,
                self.config.max_retries,
                self.config.retry_cooldown
            );
            state.generation += 1;
            state.started_at = Some(Instant::now());
            state.generation
        };

        tokio::spawn(Arc::clone(self).retry_after_cooldown(generation));
    }

    // Boxed: timeouts, failures and retries schedule each other.
    fn retry_after_cooldown(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        async move {
            tokio::time::sleep(self.config.retry_cooldown).await;
            let current = {
                let state = self.state.lock().await;
                state.syncing && state.generation == generation
            };
            if current {
                self.send_request().await;
            }
        }
        .boxed()
    }

    async fn complete(&self, peer: &SocketAddr) {
        let mut state = self.state.lock().await;
        if state.is_active_with(peer) {
            log::info!("Sync with {} complete", peer);
            state.reset();
        }
    }

    /// Drop the sync if its peer went away
    pub async fn peer_disconnected(&self, peer: &SocketAddr) {
        let mut state = self.state.lock().await;
        if state.is_active_with(peer) {
            log::warn!("Sync peer {} disconnected", peer);
            state.reset();
        }
    }

    /// Apply a `RECEIVE_BLOCKS` batch. Returns how many blocks were appended.
    pub async fn handle_blocks(
        self: &Arc<Self>,
        from: SocketAddr,
        blocks: Vec<Block>,
        total_height: u64,
    ) -> usize {
        if blocks.is_empty() {
            self.complete(&from).await;
            return 0;
        }

        let mut chain = self.blockchain.write().await;
        let mut appended = 0;
        let mut forked = false;
        let mut invalid = None;

        for block in blocks {
            if block.index <= chain.height() {
                continue;
            }
            if block.index != chain.height() + 1 || block.previous_hash != chain.latest_block().hash
            {
                forked = true;
                break;
            }
            let index = block.index;
            if let Err(e) = chain.receive_block(block) {
                log::warn!("Synced block {} from {} rejected: {}", index, from, e);
                invalid = Some(e);
                break;
            }
            appended += 1;
        }

        let local_height = chain.height();
        drop(chain);

        log::info!(
            "Synced {} blocks from {}, height now {}",
            appended,
            from,
            local_height
        );

        if forked {
            log::info!("Blocks from {} do not link, requesting full chain", from);
            self.switch_to_full(from).await;
        } else if invalid.is_some() {
            self.fail("sent an invalid block").await;
        } else if local_height < total_height {
            let active = self.state.lock().await.is_active_with(&from);
            if active {
                self.send_request().await;
            } else {
                self.start_sync(from, total_height, false).await;
            }
        } else {
            self.complete(&from).await;
        }

        appended
    }

    async fn switch_to_full(self: &Arc<Self>, peer: SocketAddr) {
        {
            let mut state = self.state.lock().await;
            if !state.is_active_with(&peer) {
                state.syncing = true;
                state.peer = Some(peer);
                state.attempts = 0;
            }
            state.mode = SyncMode::Full;
        }
        self.send_request().await;
    }

    /// Apply a `RECEIVE_CHAIN` response. Returns true when the local chain
    /// was replaced.
    pub async fn handle_chain(self: &Arc<Self>, from: SocketAddr, chain: Vec<Block>) -> bool {
        let result = self.blockchain.write().await.receive_chain(chain);

        match result {
            Ok(()) => {
                self.complete(&from).await;
                true
            }
            Err(BlockchainError::ChainNotLonger { .. }) => {
                self.complete(&from).await;
                false
            }
            Err(e) => {
                log::warn!("Chain from {} rejected: {}", from, e);
                let active = self.state.lock().await.is_active_with(&from);
                if active {
                    self.fail("sent an invalid chain").await;
                }
                false
            }
        }
    }

    /// Blocks served for a `REQUEST_BLOCKS_FROM`
    pub async fn get_blocks(&self, from_index: u64) -> Vec<Block> {
        self.blockchain
            .read()
            .await
            .get_blocks_from(from_index, self.config.max_blocks_per_response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::PeerHandle;
    use tokio::sync::mpsc;

    const MINER: &str = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";

    fn peer_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 9000))
    }

    const OTHER_MINER: &str = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn mined_by(miner: &str, blocks: usize) -> Blockchain {
        let mut chain = Blockchain::with_difficulty(1);
        for _ in 0..blocks {
            chain.mine_block(miner).unwrap();
        }
        chain
    }

    fn mined(blocks: usize) -> Blockchain {
        mined_by(MINER, blocks)
    }

    async fn setup(
        local: Blockchain,
        config: SyncConfig,
    ) -> (Arc<SyncManager>, Arc<RwLock<Blockchain>>, mpsc::Receiver<Message>) {
        let blockchain = Arc::new(RwLock::new(local));
        let peers = Arc::new(PeerManager::new());
        let (tx, rx) = mpsc::channel(16);
        peers
            .add_peer(peer_addr(), PeerHandle { addr: peer_addr(), tx }, true)
            .await
            .unwrap();
        let sync = SyncManager::new(blockchain.clone(), peers, config);
        (sync, blockchain, rx)
    }

    #[tokio::test]
    async fn test_sync_manager_creation() {
        let (sync, _, _) = setup(Blockchain::with_difficulty(1), SyncConfig::default()).await;
        assert!(!sync.is_syncing().await);
        assert!(!sync.start_sync(peer_addr(), 0, false).await);
    }

    #[tokio::test]
    async fn test_fresh_node_requests_full_chain() {
        let (sync, _, mut rx) = setup(Blockchain::with_difficulty(1), SyncConfig::default()).await;

        assert!(sync.start_sync(peer_addr(), 5, false).await);
        assert!(matches!(rx.try_recv(), Ok(Message::RequestChain)));
        assert_eq!(sync.status().await.mode, SyncMode::Full);

        // one sync at a time
        assert!(!sync.start_sync(peer_addr(), 6, false).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_partial_sync_appends_missing_blocks() {
        let mut remote = mined(1);
        let local = remote.clone();
        remote.mine_block(MINER).unwrap();
        remote.mine_block(MINER).unwrap();

        let (sync, chain, mut rx) = setup(local, SyncConfig::default()).await;
        assert!(sync.start_sync(peer_addr(), remote.height(), false).await);
        match rx.try_recv() {
            Ok(Message::RequestBlocksFrom { from_index }) => assert_eq!(from_index, 2),
            other => panic!("unexpected {:?}", other),
        }

        let appended = sync
            .handle_blocks(peer_addr(), remote.get_blocks_from(2, 50), remote.height())
            .await;

        assert_eq!(appended, 2);
        assert_eq!(chain.read().await.height(), 3);
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_forked_batch_falls_back_to_full_chain() {
        let remote = mined_by(OTHER_MINER, 3);
        let (sync, chain, mut rx) = setup(mined(1), SyncConfig::default()).await;

        sync.start_sync(peer_addr(), 3, false).await;
        let _ = rx.try_recv();

        let appended = sync
            .handle_blocks(peer_addr(), remote.get_blocks_from(2, 50), 3)
            .await;
        assert_eq!(appended, 0);
        assert!(matches!(rx.try_recv(), Ok(Message::RequestChain)));

        assert!(sync.handle_chain(peer_addr(), remote.blocks().to_vec()).await);
        assert_eq!(chain.read().await.latest_block().hash, remote.latest_block().hash);
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_shorter_chain_completes_without_replacing() {
        let local = mined(2);
        let head = local.latest_block().hash.clone();
        let (sync, chain, _rx) = setup(local, SyncConfig::default()).await;

        sync.start_sync(peer_addr(), 0, true).await;
        assert!(!sync.handle_chain(peer_addr(), mined(1).blocks().to_vec()).await);
        assert_eq!(chain.read().await.latest_block().hash, head);
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_timeouts_retry_then_abandon() {
        let config = SyncConfig {
            max_retries: 2,
            sync_timeout: Duration::from_millis(50),
            retry_cooldown: Duration::from_millis(10),
            ..SyncConfig::default()
        };
        let (sync, _, mut rx) = setup(Blockchain::with_difficulty(1), config).await;

        sync.start_sync(peer_addr(), 4, false).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        let mut requests = 0;
        while rx.try_recv().is_ok() {
            requests += 1;
        }
        assert_eq!(requests, 2);
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_stalled_sync_is_replaced() {
        let config = SyncConfig {
            max_retries: 5,
            sync_timeout: Duration::from_millis(50),
            retry_cooldown: Duration::from_secs(30),
            ..SyncConfig::default()
        };
        let (sync, _, mut rx) = setup(Blockchain::with_difficulty(1), config).await;

        assert!(sync.start_sync(peer_addr(), 4, false).await);
        assert!(matches!(rx.try_recv(), Ok(Message::RequestChain)));
        assert!(!sync.start_sync(peer_addr(), 4, false).await);

        // timed out and now waiting out a long cooldown
        tokio::time::sleep(Duration::from_millis(200)).await;
        let status = sync.status().await;
        assert!(status.syncing);
        assert_eq!(status.attempts, 1);
        assert!(rx.try_recv().is_err());

        assert!(sync.start_sync(peer_addr(), 5, false).await);
        assert!(matches!(rx.try_recv(), Ok(Message::RequestChain)));
        let status = sync.status().await;
        assert!(status.syncing);
        assert_eq!(status.attempts, 0);
    }

    #[tokio::test]
    async fn test_invalid_chain_counts_as_failure() {
        let mut tampered = mined(3).blocks().to_vec();
        tampered[2].hash = "f".repeat(64);
        let (sync, chain, _rx) = setup(Blockchain::with_difficulty(1), SyncConfig::default()).await;

        sync.start_sync(peer_addr(), 3, false).await;
        assert!(!sync.handle_chain(peer_addr(), tampered).await);
        assert_eq!(chain.read().await.height(), 0);

        let status = sync.status().await;
        assert!(status.syncing);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn test_disconnect_clears_sync() {
        let (sync, _, _rx) = setup(Blockchain::with_difficulty(1), SyncConfig::default()).await;
        sync.start_sync(peer_addr(), 2, false).await;
        sync.peer_disconnected(&peer_addr()).await;
        assert!(!sync.is_syncing().await);
    }

    #[tokio::test]
    async fn test_get_blocks_is_capped() {
        let config = SyncConfig {
            max_blocks_per_response: 2,
            ..SyncConfig::default()
        };
        let (sync, _, _rx) = setup(mined(4), config).await;
        let blocks = sync.get_blocks(1).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].index, 1);
    }
}
