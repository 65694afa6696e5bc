//! Transaction handling for the ledger
//!
//! Implements an account-based transaction model: a transfer moves `amount`
//! coins from one address to another and pays `fee` to whoever mines it.
//! Coinbase transactions mint the block reward and carry no signature.

use crate::crypto::{
    address_from_public_key_hex, decode_canonical_hex, public_key_from_hex, sha256_hex,
    verify_signature, KeyError, KeyPair,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Sender marker used by coinbase transactions
pub const COINBASE_SENDER: &str = "COINBASE";

// =============================================================================
// Error Types
// =============================================================================

/// Reasons a transaction submission is rejected.
///
/// All of these are recoverable: a rejected transaction never enters the
/// mempool and leaves the ledger state untouched.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(u64),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Duplicate transaction: {0}")]
    DuplicateTransaction(String),
    #[error("Double spend: transaction {0} is already confirmed")]
    DoubleSpend(String),
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Insufficient balance: need {needed}, available {available}")]
    InsufficientBalance { needed: u64, available: i64 },
    #[error("Mempool full ({0} transactions)")]
    MempoolFull(usize),
    #[error("Transaction too large: {0} bytes (max: {1})")]
    TransactionTooLarge(usize, usize),
    #[error("Crypto error: {0}")]
    Crypto(#[from] KeyError),
}

// =============================================================================
// Transaction
// =============================================================================

/// Kind of transaction, serialized as the `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    #[default]
    Transfer,
    Coinbase,
}

/// A ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Sender address, or `COINBASE` for minted coins
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Coins moved to the recipient
    pub amount: u64,
    /// Coins paid to the miner
    #[serde(default)]
    pub fee: u64,
    /// Creation time (Unix milliseconds)
    pub timestamp: i64,
    #[serde(rename = "type", default)]
    pub kind: TransactionType,
    /// Compressed secp256k1 public key of the sender (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<String>,
    /// Compact ECDSA signature over `calculate_hash()` (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Identifier derived at signing time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
}

impl Transaction {
    /// Create an unsigned transfer stamped with the current time
    pub fn new(from: &str, to: &str, amount: u64, fee: u64) -> Self {
        Self::with_timestamp(from, to, amount, fee, Utc::now().timestamp_millis())
    }

    /// Create an unsigned transfer with an explicit timestamp
    pub fn with_timestamp(from: &str, to: &str, amount: u64, fee: u64, timestamp: i64) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            amount,
            fee,
            timestamp,
            kind: TransactionType::Transfer,
            sender_public_key: None,
            signature: None,
            txid: None,
        }
    }

    /// Create a coinbase (mining reward) transaction for block `height`
    pub fn coinbase(to: &str, amount: u64, height: u64) -> Self {
        Self {
            from: COINBASE_SENDER.to_string(),
            to: to.to_string(),
            amount,
            fee: 0,
            timestamp: Utc::now().timestamp_millis(),
            kind: TransactionType::Coinbase,
            sender_public_key: None,
            signature: None,
            txid: Some(coinbase_commitment(to, amount, height)),
        }
    }

    /// Whether this transaction mints coins
    pub fn is_coinbase(&self) -> bool {
        self.kind == TransactionType::Coinbase
    }

    /// Hash of the signed payload (`from|to|amount|fee|timestamp`)
    pub fn calculate_hash(&self) -> String {
        let data = format!(
            "{}|{}|{}|{}|{}",
            self.from, self.to, self.amount, self.fee, self.timestamp
        );
        sha256_hex(data.as_bytes())
    }

    /// Sign the payload and derive the transaction id.
    ///
    /// The id covers the signature, so it cannot be known before signing.
    pub fn sign(&mut self, key_pair: &KeyPair) -> Result<(), TransactionError> {
        let message = hex::decode(self.calculate_hash()).map_err(|_| KeyError::InvalidSignature)?;
        let signature = hex::encode(key_pair.sign(&message)?);

        self.txid = Some(derive_txid(&self.calculate_hash(), &signature));
        self.sender_public_key = Some(key_pair.public_key_hex());
        self.signature = Some(signature);
        Ok(())
    }

    /// Check the signature and the derived id.
    ///
    /// Coinbase transactions are always valid here; their amount is checked
    /// during block validation instead. A transfer is valid only when its
    /// public key derives the `from` address, the signature verifies, and
    /// the stored `txid` matches the signed data. Key and signature must be
    /// lowercase hex so each signed transfer has exactly one id.
    pub fn is_valid(&self) -> bool {
        if self.is_coinbase() {
            return true;
        }

        let (public_key_hex, signature_hex) = match (&self.sender_public_key, &self.signature) {
            (Some(key), Some(sig)) => (key, sig),
            _ => return false,
        };

        match self.verify_with(public_key_hex, signature_hex) {
            Ok(valid) => valid,
            Err(e) => {
                log::debug!("Signature check failed for {}: {}", self.id(), e);
                false
            }
        }
    }

    fn verify_with(&self, public_key_hex: &str, signature_hex: &str) -> Result<bool, KeyError> {
        if address_from_public_key_hex(public_key_hex)? != self.from {
            return Ok(false);
        }

        let hash = self.calculate_hash();
        if self.txid.as_deref() != Some(derive_txid(&hash, signature_hex).as_str()) {
            return Ok(false);
        }

        let public_key = public_key_from_hex(public_key_hex)?;
        let message = hex::decode(&hash).map_err(|_| KeyError::InvalidSignature)?;
        let signature = decode_canonical_hex(signature_hex).ok_or(KeyError::InvalidSignature)?;
        verify_signature(&public_key, &message, &signature)
    }

    /// Amount the sender must cover: `amount + fee`
    pub fn total_cost(&self) -> u64 {
        self.amount.saturating_add(self.fee)
    }

    /// Identity used by the mempool, the spent set and the merkle tree.
    ///
    /// Falls back to the payload hash for transactions that were never signed.
    pub fn id(&self) -> String {
        self.txid.clone().unwrap_or_else(|| self.calculate_hash())
    }

    /// Content equality used for duplicate detection
    pub fn same_content(&self, other: &Transaction) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.amount == other.amount
            && self.timestamp == other.timestamp
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Transaction id: hash of the signed payload hash and the signature
pub fn derive_txid(payload_hash: &str, signature_hex: &str) -> String {
    sha256_hex(format!("{}|{}", payload_hash, signature_hex).as_bytes())
}

/// Commitment hash for a coinbase paying `amount` to `to` at `height`.
///
/// This is the first merkle leaf of every block that carries a coinbase.
pub fn coinbase_commitment(to: &str, amount: u64, height: u64) -> String {
    sha256_hex(format!("{}|{}|{}", to, amount, height).as_bytes())
}
