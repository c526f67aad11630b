//! Signing and Trust
//!
//! Ed25519 signing for handshake nonces and rcon commands, plus the
//! trust-on-first-use pinned-key store: one file per known remote host,
//! named by a hash of the host address. Absence means "not yet trusted",
//! presence means "must match exactly".

use std::fs;
use std::path::{Path, PathBuf};

use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::wire::SignedMessage;

/// Key generation / loading failures.
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The system RNG refused to produce key material.
    #[error("key generation failed")]
    KeyGeneration,

    /// Stored key material did not parse.
    #[error("invalid key material")]
    BadKey,
}

/// Trust failures force an immediate disconnect: they indicate a potential
/// active attacker, not a flaky link.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The remote host presented a key that differs from the pinned one.
    #[error("pinned key mismatch for {address}")]
    KeyMismatch {
        /// The remote address whose pin failed.
        address: String,
    },

    /// The pin store could not be read or written.
    #[error("key store i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a successful pin check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    /// First contact: the key was saved as the pin.
    PinnedNow,
    /// The key matched an existing pin.
    Known,
}

/// A process-local Ed25519 signing identity.
pub struct Identity {
    key_pair: Ed25519KeyPair,
    public_key: String,
}

impl Identity {
    /// Generate a fresh key pair.
    pub fn generate() -> Result<Self, SecurityError> {
        let rng = SystemRandom::new();
        let pkcs8 =
            Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| SecurityError::KeyGeneration)?;
        let key_pair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| SecurityError::BadKey)?;
        let public_key = base64::encode(key_pair.public_key().as_ref());
        Ok(Self {
            key_pair,
            public_key,
        })
    }

    /// This identity's base64 public key.
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Sign a payload, producing the wire envelope.
    pub fn sign(&self, payload: &[u8]) -> SignedMessage {
        let signature = self.key_pair.sign(payload);
        SignedMessage {
            payload: payload.to_vec(),
            signature: base64::encode(signature.as_ref()),
            public_key: self.public_key.clone(),
        }
    }
}

/// Verify an envelope against the key it carries.
pub fn verify(message: &SignedMessage) -> bool {
    verify_with_key(message, &message.public_key)
}

/// Verify an envelope against an explicit base64 public key. The envelope's
/// own key field must also match, so a swapped-key envelope fails.
pub fn verify_with_key(message: &SignedMessage, public_key_b64: &str) -> bool {
    if message.public_key != public_key_b64 {
        return false;
    }
    let key_bytes = match base64::decode(public_key_b64) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let sig_bytes = match base64::decode(&message.signature) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    UnparsedPublicKey::new(&ED25519, key_bytes)
        .verify(&message.payload, &sig_bytes)
        .is_ok()
}

/// Trust-on-first-use pin store: `hosts/<hex sha256(address)>.sig` under a
/// local data directory, file body = the base64 public key.
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    /// Open a store rooted at `root` (created lazily on first pin).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn pin_path(&self, address: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(address.as_bytes());
        let digest = hasher.finalize();
        self.root
            .join("hosts")
            .join(format!("{}.sig", hex::encode(digest)))
    }

    /// Check a remote host's key against its pin, saving it on first contact.
    pub fn check_or_pin(
        &self,
        address: &str,
        public_key_b64: &str,
    ) -> Result<TrustStatus, TrustError> {
        let path = self.pin_path(address);
        match fs::read_to_string(&path) {
            Ok(pinned) => {
                if pinned.trim() == public_key_b64 {
                    Ok(TrustStatus::Known)
                } else {
                    Err(TrustError::KeyMismatch {
                        address: address.to_string(),
                    })
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, public_key_b64)?;
                Ok(TrustStatus::PinnedNow)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Remove a pin (operator action after a legitimate key rotation).
    pub fn forget(&self, address: &str) -> Result<(), TrustError> {
        let path = self.pin_path(address);
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}
