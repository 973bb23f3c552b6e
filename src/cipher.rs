//! Per-chunk authenticated encryption.
//!
//! Each chunk is sealed independently under a key derived from the session
//! secret and a fresh 8-byte salt, so chunks can travel in any order and a
//! resumed transfer never reuses a key. Wire form: `nonce || ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use thiserror::Error;

pub const SALT_LEN: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Upper bound on ciphertext growth; the server sizes its body cap with this
/// in mind.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

// scrypt parameters for the per-chunk KDF: N=32768 (2^15), r=16, p=1, 32-byte key.
const SCRYPT_LOG_N: u8 = 15;
const SCRYPT_R: u32 = 16;
const SCRYPT_P: u32 = 1;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("key derivation failed")]
    Kdf,
    #[error("ciphertext too short")]
    Truncated,
    #[error("encryption failed")]
    Seal,
    #[error("decryption failed")]
    Open,
}

/// AEAD selection; both sides must be configured with the same choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CipherKind {
    #[default]
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl std::str::FromStr for CipherKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AES256" => Ok(CipherKind::Aes256Gcm),
            "C20P1305" => Ok(CipherKind::ChaCha20Poly1305),
            other => anyhow::bail!("unknown cipher {other:?} (expected AES256 or C20P1305)"),
        }
    }
}

impl std::fmt::Display for CipherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CipherKind::Aes256Gcm => "AES256",
            CipherKind::ChaCha20Poly1305 => "C20P1305",
        })
    }
}

pub fn gen_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derives a per-chunk key from the session secret and a chunk salt.
/// Memory-hard on purpose; callers on async paths run this on a blocking
/// thread.
pub fn derive_key(secret: &[u8], salt: &[u8]) -> Result<[u8; 32], CipherError> {
    let params =
        scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32).map_err(|_| CipherError::Kdf)?;
    let mut key = [0u8; 32];
    scrypt::scrypt(secret, salt, &params, &mut key).map_err(|_| CipherError::Kdf)?;
    Ok(key)
}

/// Seals `plaintext` under `key` with a fresh random nonce.
pub fn seal(kind: CipherKind, key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let ciphertext = match kind {
        CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CipherError::Seal)?
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Seal)?,
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CipherError::Seal)?
            .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CipherError::Seal)?,
    };

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Opens a sealed chunk. Any truncation or bit flip fails the tag check.
pub fn open(kind: CipherKind, key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CipherError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CipherError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    match kind {
        CipherKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
            .map_err(|_| CipherError::Open)?
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Open),
        CipherKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| CipherError::Open)?
            .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Open),
    }
}
