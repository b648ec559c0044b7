//! Channel sealing for inter-host traffic.
//!
//! Nodes of an encrypted domain share one [`Keypair`]. Payloads on
//! global channels are sealed with XChaCha20-Poly1305 under a key
//! derived from the private half; the 24-byte nonce is prepended to
//! the ciphertext. The keypair persists on disk as a JSON record of
//! the two byte strings.

use crate::error::NetError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 24;

const SEAL_KEY_CONTEXT: &str = "weft/v1/channel-seal";
const PUBLIC_KEY_CONTEXT: &str = "weft/v1/public-fingerprint";

/// Domain keypair: a 32-byte secret and its public fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keypair {
    pub public_key: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl Keypair {
    /// Generate a fresh keypair from OS randomness.
    pub fn generate() -> Self {
        let mut private_key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut private_key);
        let public_key = derive(PUBLIC_KEY_CONTEXT, &private_key).to_vec();
        Self {
            public_key,
            private_key,
        }
    }

    /// Load a keypair record from disk. A missing file surfaces as the
    /// underlying not-found I/O error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, NetError> {
        let bytes = fs::read(path)?;
        let keypair: Keypair = serde_json::from_slice(&bytes)
            .map_err(|e| NetError::Keypair(format!("malformed keypair file: {e}")))?;
        if keypair.private_key.len() != KEY_LEN {
            return Err(NetError::Keypair(format!(
                "private key must be {KEY_LEN} bytes, got {}",
                keypair.private_key.len()
            )));
        }
        Ok(keypair)
    }

    /// Persist the keypair record, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), NetError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| NetError::Keypair(format!("keypair serialization: {e}")))?;
        fs::write(path, bytes)?;
        Ok(())
    }
}

fn derive(context: &str, material: &[u8]) -> [u8; KEY_LEN] {
    blake3::derive_key(context, material)
}

/// Seal a payload: random nonce prepended to ciphertext-plus-tag.
pub fn seal(keypair: &Keypair, plaintext: &[u8]) -> Result<Vec<u8>, NetError> {
    let key = derive(SEAL_KEY_CONTEXT, &keypair.private_key);
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| NetError::Seal("bad key length".to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| NetError::Seal("encryption failed".to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed payload. Tag mismatch means a forged or foreign
/// message; callers log and drop it.
pub fn open(keypair: &Keypair, sealed: &[u8]) -> Result<Vec<u8>, NetError> {
    if sealed.len() < NONCE_LEN {
        return Err(NetError::Seal(format!(
            "sealed payload too short: {} bytes",
            sealed.len()
        )));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

    let key = derive(SEAL_KEY_CONTEXT, &keypair.private_key);
    let cipher = XChaCha20Poly1305::new_from_slice(&key)
        .map_err(|_| NetError::Seal("bad key length".to_string()))?;

    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| NetError::Seal("authentication failed".to_string()))
}
