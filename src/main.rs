//! Ledger node command-line front-end
//!
//! Runs a node, creates key pairs, submits transactions to a running node
//! and inspects the local chain snapshot.

use clap::{Parser, Subcommand, ValueEnum};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use pow_ledger::config::ChainConfig;
use pow_ledger::core::{Block, Blockchain, HistoryKind, Transaction};
use pow_ledger::crypto::KeyPair;
use pow_ledger::network::{Message, MessageCodec, Node, NodeConfig, NodeInfo, SyncConfig};
use pow_ledger::storage::Storage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "blockchain")]
#[command(version)]
#[command(about = "Proof-of-work ledger node", long_about = None)]
struct Cli {
    /// Data directory for the chain snapshot
    #[arg(short, long, default_value = ".blockchain_data", global = true)]
    data_dir: PathBuf,

    /// Pin the difficulty (leading zero hex digits) instead of retargeting
    #[arg(long, global = true)]
    difficulty: Option<u32>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a P2P node
    Start {
        /// Interface to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "8333")]
        port: u16,

        /// Comma-separated peer addresses to connect to
        #[arg(long)]
        peers: Option<String>,

        /// Mine pending transactions to this address
        #[arg(long)]
        mine: Option<String>,

        /// Seconds between auto-mining rounds
        #[arg(long, default_value = "10")]
        interval: u64,
    },

    /// Generate a key pair
    Keygen,

    /// Sign a transfer and submit it to a running node
    Send {
        /// Node address (host:port)
        #[arg(short, long)]
        node: String,

        /// Sender's private key (hex)
        #[arg(short = 'k', long)]
        private_key: String,

        /// Recipient's address
        #[arg(short, long)]
        to: String,

        /// Amount to send
        #[arg(short, long)]
        amount: u64,

        /// Fee paid to the miner
        #[arg(short, long, default_value = "1")]
        fee: u64,
    },

    /// Display chain statistics
    Stats,

    /// Show the confirmed balance of an address
    Balance {
        /// Address to look up
        #[arg(short, long)]
        address: String,
    },

    /// List confirmed transactions of an address
    History {
        /// Address to look up
        #[arg(short, long)]
        address: String,

        /// Only show one kind of entry
        #[arg(short = 't', long = "type", value_enum)]
        kind: Option<HistoryFilter>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum HistoryFilter {
    Sent,
    Received,
    #[value(alias = "mining_reward")]
    Mining,
}

impl HistoryFilter {
    fn matches(self, kind: HistoryKind) -> bool {
        matches!(
            (self, kind),
            (HistoryFilter::Sent, HistoryKind::Sent)
                | (HistoryFilter::Received, HistoryKind::Received)
                | (HistoryFilter::Mining, HistoryKind::MiningReward)
        )
    }
}

fn main() -> CliResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let chain_config = match cli.difficulty {
        Some(difficulty) => ChainConfig::with_difficulty(difficulty),
        None => ChainConfig::default(),
    };

    match cli.command {
        Commands::Start {
            host,
            port,
            peers,
            mine,
            interval,
        } => {
            let bootstrap_peers = peers
                .map(|p| {
                    p.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();

            let config = NodeConfig {
                host,
                port,
                bootstrap_peers,
                data_dir: cli.data_dir,
                chain: chain_config,
                sync: SyncConfig::default(),
            };
            cmd_start(config, mine, Duration::from_secs(interval.max(1)))
        }
        Commands::Keygen => cmd_keygen(),
        Commands::Send {
            node,
            private_key,
            to,
            amount,
            fee,
        } => cmd_send(&node, &private_key, &to, amount, fee),
        Commands::Stats => cmd_stats(&load_chain(&cli.data_dir, chain_config)?),
        Commands::Balance { address } => {
            cmd_balance(&load_chain(&cli.data_dir, chain_config)?, &address)
        }
        Commands::History { address, kind } => {
            cmd_history(&load_chain(&cli.data_dir, chain_config)?, &address, kind)
        }
    }
}

fn load_chain(data_dir: &Path, config: ChainConfig) -> CliResult<Blockchain> {
    let storage = Storage::in_dir(data_dir)?;
    Ok(storage.load_blockchain(config)?)
}

fn cmd_start(config: NodeConfig, miner: Option<String>, interval: Duration) -> CliResult<()> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let node = Node::new(config)?;
        let server = node.listen().await?;
        println!("🌐 Node listening on {}", server.local_addr());

        if let Some(address) = miner {
            println!("⛏️  Auto-mining to {} every {:?}", address, interval);
            node.auto_mine(address, interval);
        }

        let signal_node = node.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            println!("\n📴 Shutting down node...");
            signal_node.shutdown();
        });

        node.run(server).await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })
}

fn cmd_keygen() -> CliResult<()> {
    let key_pair = KeyPair::generate();

    println!("🔑 New key pair");
    println!("   ├─ Address: {}", key_pair.address());
    println!("   ├─ Public key: {}", key_pair.public_key_hex());
    println!("   └─ Private key: {}", key_pair.private_key_hex());
    println!("\n⚠️  Store the private key yourself; it is not saved anywhere.");

    Ok(())
}

fn cmd_send(node: &str, private_key: &str, to: &str, amount: u64, fee: u64) -> CliResult<()> {
    let key_pair = KeyPair::from_private_key_hex(private_key)?;
    let mut tx = Transaction::new(&key_pair.address(), to, amount, fee);
    tx.sign(&key_pair)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let stream = TcpStream::connect(node).await?;
        let mut framed = Framed::new(stream, MessageCodec);

        let genesis = Block::genesis();
        framed
            .send(Message::Handshake(NodeInfo {
                chain_height: 0,
                latest_block_hash: genesis.hash,
                mempool_size: 0,
                timestamp: chrono::Utc::now().timestamp_millis(),
            }))
            .await?;

        match tokio::time::timeout(Duration::from_secs(5), framed.next()).await {
            Ok(Some(Ok(Message::HandshakeAck(info)))) => {
                log::debug!("Node at height {}", info.chain_height);
            }
            _ => return Err("node did not acknowledge the handshake".into()),
        }

        framed
            .send(Message::Transaction {
                transaction: tx.clone(),
            })
            .await?;
        Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
    })?;

    println!("📤 Submitted transaction {}", tx.id());
    println!("   ├─ From: {}", tx.from);
    println!("   ├─ To: {}", tx.to);
    println!("   └─ Amount: {} (fee {})", tx.amount, tx.fee);

    Ok(())
}

fn cmd_stats(chain: &Blockchain) -> CliResult<()> {
    let stats = chain.stats();

    println!("⛓️  Blockchain Info");
    println!("   ├─ Height: {}", chain.height());
    println!("   ├─ Total blocks: {}", stats.total_blocks);
    println!("   ├─ Total transactions: {}", stats.total_transactions);
    println!("   ├─ Total coins: {}", stats.total_coins);
    println!("   ├─ Difficulty: {}", stats.difficulty);
    println!("   ├─ Block reward: {}", chain.get_block_reward());
    println!("   ├─ Avg block time: {:.1}s", stats.avg_block_time);
    println!("   ├─ Spent transactions: {}", stats.spent_tx_count);
    println!("   ├─ Valid: {}", chain.is_chain_valid());
    println!("   └─ Latest hash: {}", chain.latest_block().hash);

    Ok(())
}

fn cmd_balance(chain: &Blockchain, address: &str) -> CliResult<()> {
    println!("💰 Balance for {}", address);
    println!("   └─ Confirmed: {} coins", chain.get_balance(address));

    Ok(())
}

fn cmd_history(chain: &Blockchain, address: &str, filter: Option<HistoryFilter>) -> CliResult<()> {
    let history: Vec<_> = chain
        .get_transaction_history(address)
        .into_iter()
        .filter(|entry| filter.map_or(true, |f| f.matches(entry.kind)))
        .collect();

    if history.is_empty() {
        println!("📭 No transactions found for {}", address);
        return Ok(());
    }

    println!("📜 Transaction history for {}", address);
    println!("   Total: {} transaction(s)\n", history.len());

    for (i, entry) in history.iter().enumerate() {
        let (symbol, sign) = match entry.kind {
            HistoryKind::Sent => ("➜", "-"),
            HistoryKind::Received => ("⬅", "+"),
            HistoryKind::MiningReward => ("⛏", "+"),
        };
        println!("{}. [Block #{}] {} {:?}", i + 1, entry.block_index, symbol, entry.kind);
        println!("   ├─ From: {}", entry.from);
        println!("   ├─ To: {}", entry.to);
        println!("   ├─ Amount: {}{} coins", sign, entry.amount);
        if entry.fee > 0 {
            println!("   ├─ Fee: {} coins", entry.fee);
        }
        println!("   └─ Hash: {}", entry.hash);
    }

    Ok(())
}
