//! gulp command-line driver: one binary, server or client by flags.

use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gulp::bearer;
use gulp::cli::Args;
use gulp::client::{self, ClientOpt};
use gulp::progress::{human_bytes, BarProgress};
use gulp::server::{self, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if args.port > 0 {
        run_server(args).await
    } else {
        run_client(args).await
    }
}

async fn run_server(args: Args) -> Result<()> {
    let token = if args.bearer == "auto" {
        let token = bearer::generate_token();
        tracing::info!(token = %token, "generated bearer token");
        token
    } else {
        args.bearer.clone()
    };
    let code = if args.code.is_empty() {
        read_code()?
    } else {
        args.code.clone()
    };
    let cfg = ServerConfig {
        root: args.root.clone(),
        bearer: token,
        code,
        chunk_size: args.chunk_size,
        cipher: args.cipher.parse()?,
        rate_limit: args.rate_limit,
    };
    server::serve(cfg, args.port).await
}

async fn run_client(args: Args) -> Result<()> {
    let url = args.url.clone().context("-u <url> is required in client mode")?;
    let mut opt = ClientOpt::new(url);
    opt.file = args.file.clone();
    opt.rename = args.rename.clone();
    opt.root = args.root.clone();
    opt.chunk_size = args.chunk_size;
    opt.workers = args.workers;
    opt.bearer = args.bearer.clone();
    opt.cipher = args.cipher.parse()?;
    opt.rate_limit = args.rate_limit;
    opt.progress = Arc::new(BarProgress::new());

    // chunking disabled: a single plain push, no session or encryption
    if args.file.is_some() && args.chunk_size == 0 {
        let report = client::push_plain(opt).await?;
        tracing::info!(size = %human_bytes(report.total_size), "push complete");
        return Ok(());
    }

    opt.code = if args.code.is_empty() {
        read_code()?
    } else {
        args.code.clone()
    };
    let report = if args.file.is_some() {
        client::upload(opt).await?
    } else {
        client::download(opt).await?
    };
    if report.incomplete > 0 {
        bail!(
            "{} of {} chunks did not complete; run again to resume",
            report.incomplete,
            report.parts
        );
    }
    tracing::info!(
        size = %human_bytes(report.total_size),
        parts = report.parts,
        "transfer complete"
    );
    Ok(())
}

fn read_code() -> Result<String> {
    use std::io::{BufRead, Write};
    eprint!("Codephrase: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read codephrase")?;
    let code = line.trim().to_string();
    ensure!(!code.is_empty(), "empty codephrase");
    Ok(code)
}
