//! Command-line argument surface.

use std::path::PathBuf;

use clap::Parser;

use crate::chunk::DEFAULT_CHUNK_SIZE;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gulp",
    version,
    about = "Resumable, authenticated, end-to-end encrypted file transfer over HTTP"
)]
pub struct Args {
    /// Server url to connect to (client mode)
    #[arg(short = 'u', long)]
    pub url: Option<String>,

    /// Local file to upload; omit to download instead
    #[arg(short = 'f', long)]
    pub file: Option<PathBuf>,

    /// Store the file under another name on the remote side
    #[arg(short = 'r', long)]
    pub rename: Option<String>,

    /// Listen port; a value above zero starts server mode
    #[arg(short = 'p', long, default_value_t = 0)]
    pub port: u16,

    /// Bearer token; "auto" makes the server generate one
    #[arg(short = 'b', long, default_value = "")]
    pub bearer: String,

    /// Chunk size in bytes; zero disables chunking
    #[arg(short = 'c', long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: u64,

    /// Parallel chunk workers; zero or less means serial
    #[arg(short = 't', long, default_value_t = 0)]
    pub workers: i32,

    /// Codephrase for the session key agreement; prompted when empty
    #[arg(short = 'P', long, default_value = "")]
    pub code: String,

    /// Chunk cipher: AES256 or C20P1305
    #[arg(short = 'C', long, default_value = "AES256")]
    pub cipher: String,

    /// Rate limit in bytes per second; zero means unlimited
    #[arg(short = 'L', long, default_value_t = 0)]
    pub rate_limit: u64,

    /// Directory files are stored in
    #[arg(long, default_value = "./.gulp")]
    pub root: PathBuf,
}
