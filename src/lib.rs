//! Gulp Library
//!
//! Resumable, authenticated, end-to-end encrypted file transfer over HTTP.
//! Files move as fixed-size chunks that are independently addressable,
//! verifiable, and skipped when the receiver already holds matching bytes.

pub mod bearer;
pub mod chunk;
pub mod cipher;
pub mod pake;
pub mod progress;
pub mod retry;
pub mod session;
pub mod throttle;
pub mod wire;

pub mod cli;
pub mod client;
pub mod server;
