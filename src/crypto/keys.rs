//! ECDSA signing primitives for the ledger
//!
//! Signing and verification use the secp256k1 curve. The ledger only
//! needs two operations from this module: `sign(hash, key)` and
//! `verify(hash, signature, public_key)`. Key generation and storage
//! belong to the wallet front-end; `KeyPair` exists so callers can hold a
//! key while signing.

use rand::rngs::OsRng;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use thiserror::Error;

use super::hash::{sha256, sha256_hex};

/// Length of a ledger address in hex characters
pub const ADDRESS_LENGTH: usize = 64;

/// Errors that can occur during key operations
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Secp256k1 error: {0}")]
    Secp256k1Error(#[from] secp256k1::Error),
}

/// A key pair consisting of a private key and its corresponding public key
#[derive(Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from an existing secret key
    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Self {
            secret_key,
            public_key,
        }
    }

    /// Create a key pair from a hex-encoded private key
    pub fn from_private_key_hex(hex_key: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_key).map_err(|_| KeyError::InvalidPrivateKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPrivateKey)?;
        Ok(Self::from_secret_key(secret_key))
    }

    /// Get the private key as a hex string
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Get the public key as a hex string (compressed format)
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Ledger address owned by this key
    pub fn address(&self) -> String {
        public_key_to_address(&self.public_key)
    }

    /// Sign a message hash with the private key
    pub fn sign(&self, message_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
        sign_message(&self.secret_key, message_hash)
    }

    /// Verify a signature against this key pair's public key
    pub fn verify(&self, message_hash: &[u8], signature: &[u8]) -> Result<bool, KeyError> {
        verify_signature(&self.public_key, message_hash, signature)
    }
}

/// Convert a public key to a ledger address (SHA-256 hex of the compressed key)
pub fn public_key_to_address(public_key: &PublicKey) -> String {
    sha256_hex(&public_key.serialize())
}

/// Derive the address for a hex-encoded public key
pub fn address_from_public_key_hex(hex_key: &str) -> Result<String, KeyError> {
    Ok(public_key_to_address(&public_key_from_hex(hex_key)?))
}

/// Check the fixed-length lowercase hex address format
pub fn is_valid_address(address: &str) -> bool {
    address.len() == ADDRESS_LENGTH && address.bytes().all(is_lower_hex_digit)
}

fn is_lower_hex_digit(b: u8) -> bool {
    matches!(b, b'0'..=b'9' | b'a'..=b'f')
}

/// Decode hex that is already in canonical (lowercase) form.
///
/// Signed fields feed into transaction ids as text, so a second spelling of
/// the same bytes would be a second id.
pub fn decode_canonical_hex(value: &str) -> Option<Vec<u8>> {
    if !value.bytes().all(is_lower_hex_digit) {
        return None;
    }
    hex::decode(value).ok()
}

/// Parse a compressed public key from canonical hex
pub fn public_key_from_hex(hex_key: &str) -> Result<PublicKey, KeyError> {
    let bytes = decode_canonical_hex(hex_key).ok_or(KeyError::InvalidPublicKey)?;
    let public_key = PublicKey::from_slice(&bytes).map_err(|_| KeyError::InvalidPublicKey)?;
    if public_key.serialize()[..] != bytes[..] {
        return Err(KeyError::InvalidPublicKey);
    }
    Ok(public_key)
}

/// Sign a message hash with a secret key
pub fn sign_message(secret_key: &SecretKey, message_hash: &[u8]) -> Result<Vec<u8>, KeyError> {
    let secp = Secp256k1::new();

    // Ensure message hash is 32 bytes
    let hash = if message_hash.len() == 32 {
        message_hash.to_vec()
    } else {
        sha256(message_hash)
    };

    let message = Message::from_digest_slice(&hash)?;
    let signature = secp.sign_ecdsa(&message, secret_key);
    Ok(signature.serialize_compact().to_vec())
}

/// Verify a signature against a public key
pub fn verify_signature(
    public_key: &PublicKey,
    message_hash: &[u8],
    signature: &[u8],
) -> Result<bool, KeyError> {
    let secp = Secp256k1::new();

    let hash = if message_hash.len() == 32 {
        message_hash.to_vec()
    } else {
        sha256(message_hash)
    };

    let message = Message::from_digest_slice(&hash)?;
    let sig = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|_| KeyError::InvalidSignature)?;

    Ok(secp.verify_ecdsa(&message, &sig, public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let kp = KeyPair::generate();
        let message_hash = sha256(b"ledger entry");

        let signature = kp.sign(&message_hash).unwrap();
        assert!(kp.verify(&message_hash, &signature).unwrap());

        let other = sha256(b"another entry");
        assert!(!kp.verify(&other, &signature).unwrap());
    }

    #[test]
    fn test_key_pair_from_hex() {
        let kp1 = KeyPair::generate();
        let kp2 = KeyPair::from_private_key_hex(&kp1.private_key_hex()).unwrap();
        assert_eq!(kp1.public_key_hex(), kp2.public_key_hex());
        assert_eq!(kp1.address(), kp2.address());
    }

    #[test]
    fn test_address_format() {
        let kp = KeyPair::generate();
        let address = kp.address();
        assert!(is_valid_address(&address));
        assert_eq!(
            address_from_public_key_hex(&kp.public_key_hex()).unwrap(),
            address
        );
    }

    #[test]
    fn test_invalid_address_format() {
        assert!(!is_valid_address("COINBASE"));
        assert!(!is_valid_address(&"g".repeat(64)));
        assert!(!is_valid_address(&"a".repeat(63)));
        assert!(!is_valid_address(&"aB".repeat(32)));
        assert!(!is_valid_address(&KeyPair::generate().address().to_uppercase()));
    }

    #[test]
    fn test_public_key_must_be_canonical() {
        let kp = KeyPair::generate();
        assert!(public_key_from_hex(&kp.public_key_hex()).is_ok());
        assert!(public_key_from_hex(&kp.public_key_hex().to_uppercase()).is_err());

        let uncompressed = hex::encode(kp.public_key.serialize_uncompressed());
        assert!(public_key_from_hex(&uncompressed).is_err());
    }

    #[test]
    fn test_decode_canonical_hex() {
        assert_eq!(decode_canonical_hex("00ff"), Some(vec![0, 255]));
        assert_eq!(decode_canonical_hex("00FF"), None);
        assert_eq!(decode_canonical_hex("0"), None);
    }

    #[test]
    fn test_bad_key_material() {
        assert!(KeyPair::from_private_key_hex("zz").is_err());
        assert!(public_key_from_hex("00").is_err());
    }
}
