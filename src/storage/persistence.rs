//! Chain snapshot persistence
//!
//! Saves and loads the `ChainSnapshot` (blocks plus difficulty) as JSON.
//! Writes go to a temporary file that is renamed over the snapshot, so a
//! crash mid-write never leaves a truncated chain on disk.

use crate::config::ChainConfig;
use crate::core::{Blockchain, BlockchainError, ChainSnapshot};
use std::fs;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(#[from] BlockchainError),
}

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub snapshot_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".blockchain_data"),
            snapshot_file: "blockchain.json".to_string(),
        }
    }
}

/// Snapshot storage manager
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(config: StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self { config })
    }

    /// Storage rooted at `data_dir` with the default file name
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::new(StorageConfig {
            data_dir: data_dir.into(),
            ..Default::default()
        })
    }

    /// Get the snapshot file path
    pub fn snapshot_path(&self) -> PathBuf {
        self.config.data_dir.join(&self.config.snapshot_file)
    }

    /// Write a snapshot to disk
    pub fn save(&self, snapshot: &ChainSnapshot) -> Result<(), StorageError> {
        save_to_file(snapshot, &self.snapshot_path())
    }

    /// Read the snapshot, `None` when nothing was saved yet
    pub fn load(&self) -> Result<Option<ChainSnapshot>, StorageError> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        load_from_file(&path).map(Some)
    }

    /// Restore the chain from disk, or start a fresh one.
    ///
    /// A snapshot that fails validation is an error: in particular a
    /// `GenesisMismatch` means the data directory belongs to another network.
    pub fn load_blockchain(&self, config: ChainConfig) -> Result<Blockchain, StorageError> {
        match self.load()? {
            Some(snapshot) => {
                log::info!("Loading existing blockchain from {}", self.snapshot_path().display());
                Ok(Blockchain::from_snapshot(snapshot, config)?)
            }
            None => {
                log::info!("Creating new blockchain...");
                let chain = Blockchain::new(config);
                self.save(&chain.snapshot())?;
                Ok(chain)
            }
        }
    }

    /// Check if a saved snapshot exists
    pub fn exists(&self) -> bool {
        self.snapshot_path().exists()
    }
}

/// Save a snapshot to a specific file path (temp file + rename)
pub fn save_to_file(snapshot: &ChainSnapshot, path: &Path) -> Result<(), StorageError> {
    let temp_path = path.with_extension("tmp");
    {
        let file = fs::File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, snapshot)?;
        writer.flush()?;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Load a snapshot from a specific file path
pub fn load_from_file(path: &Path) -> Result<ChainSnapshot, StorageError> {
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Block;

    #[test]
    fn test_save_load_snapshot() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();
        assert!(storage.load().unwrap().is_none());

        let mut blockchain = Blockchain::with_difficulty(1);
        blockchain.mine_block(&"a".repeat(64)).unwrap();

        storage.save(&blockchain.snapshot()).unwrap();
        assert!(storage.exists());
        assert!(!storage.snapshot_path().with_extension("tmp").exists());

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.blocks, blockchain.blocks());
        assert_eq!(loaded.difficulty, 1);
    }

    #[test]
    fn test_load_blockchain_creates_fresh_chain() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();

        let chain = storage
            .load_blockchain(ChainConfig::with_difficulty(1))
            .unwrap();
        assert_eq!(chain.height(), 0);
        assert!(storage.exists());
    }

    #[test]
    fn test_load_blockchain_restores_state() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();

        let mut blockchain = Blockchain::with_difficulty(1);
        blockchain.mine_block(&"a".repeat(64)).unwrap();
        storage.save(&blockchain.snapshot()).unwrap();

        let restored = storage
            .load_blockchain(ChainConfig::with_difficulty(1))
            .unwrap();
        assert_eq!(restored.height(), 1);
        assert_eq!(restored.get_balance(&"a".repeat(64)), 16);
    }

    #[test]
    fn test_foreign_genesis_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();

        let mut genesis = Block::genesis();
        genesis.timestamp = 42;
        genesis.hash = genesis.calculate_hash();
        storage
            .save(&ChainSnapshot {
                blocks: vec![genesis],
                difficulty: 1,
            })
            .unwrap();

        assert!(matches!(
            storage.load_blockchain(ChainConfig::with_difficulty(1)),
            Err(StorageError::InvalidSnapshot(BlockchainError::GenesisMismatch))
        ));
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::in_dir(temp_dir.path()).unwrap();
        fs::write(storage.snapshot_path(), b"{not json").unwrap();

        assert!(matches!(
            storage.load(),
            Err(StorageError::SerializationError(_))
        ));
    }
}
