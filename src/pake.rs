//! Session key agreement.
//!
//! A SPAKE2 exchange over Ed25519 turns a short shared codephrase into a
//! strong per-session secret without ever transmitting the codephrase. The
//! client plays role A, the server role B; each side sends one public
//! message and derives the same key locally. Mismatched codephrases complete
//! the exchange but land on divergent keys, so every later chunk decryption
//! fails.

use anyhow::{anyhow, Result};
use rand::RngCore;
use spake2::{Ed25519Group, Identity, Password, Spake2};

const CLIENT_ID: &[u8] = b"gulp-client";
const SERVER_ID: &[u8] = b"gulp-server";

/// In-flight key agreement state; consumed by [`Handshake::finish`].
pub struct Handshake {
    state: Spake2<Ed25519Group>,
}

impl Handshake {
    pub fn finish(self, inbound: &[u8]) -> Result<Vec<u8>> {
        self.state
            .finish(inbound)
            .map_err(|e| anyhow!("key agreement failed: {e}"))
    }
}

/// Starts the client side; returns the state and the public bytes to send.
pub fn start_client(code: &str) -> (Handshake, Vec<u8>) {
    let (state, outbound) = Spake2::<Ed25519Group>::start_a(
        &Password::new(code.as_bytes()),
        &Identity::new(CLIENT_ID),
        &Identity::new(SERVER_ID),
    );
    (Handshake { state }, outbound)
}

/// Starts the server side; returns the state and the public bytes to reply.
pub fn start_server(code: &str) -> (Handshake, Vec<u8>) {
    let (state, outbound) = Spake2::<Ed25519Group>::start_b(
        &Password::new(code.as_bytes()),
        &Identity::new(CLIENT_ID),
        &Identity::new(SERVER_ID),
    );
    (Handshake { state }, outbound)
}

/// Opaque session identifier: 8 random bytes as uppercase hex.
pub fn session_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02X}")).collect()
}
