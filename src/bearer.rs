//! Bearer token checks.
//!
//! The comparison hashes both sides with SHA-512 before a constant-time
//! equality, so neither token length nor content leaks through timing.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;

pub const BEARER_PREFIX: &str = "Bearer ";

/// Constant-time string comparison via SHA-512 digests.
pub fn secure_compare(given: &str, actual: &str) -> bool {
    let given = Sha512::digest(given.as_bytes());
    let actual = Sha512::digest(actual.as_bytes());
    given.as_slice().ct_eq(actual.as_slice()).into()
}

/// Checks an `Authorization` header value against the configured token.
/// An empty configured token disables the check.
pub fn authorized(header: Option<&str>, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    match header {
        Some(value) => secure_compare(value, &format!("{BEARER_PREFIX}{token}")),
        None => false,
    }
}

/// Random URL-safe bearer token.
pub fn generate_token() -> String {
    let mut raw = [0u8; 15];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}
