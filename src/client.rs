//! Client-side transfer engine.
//!
//! A transfer job handshakes once, enumerates chunks, and then either walks
//! them in order (serial mode) or feeds a fixed pool of workers through a
//! bounded queue (parallel mode). Every chunk is probed by fingerprint
//! first, so a re-run of an interrupted transfer only moves what is missing.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, ensure, Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::TryStreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::StatusCode;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::chunk::{self, ChunkRange, DEFAULT_CHUNK_SIZE};
use crate::cipher::{self, CipherKind};
use crate::pake;
use crate::progress::{NoopProgress, Progress};
use crate::retry::retry;
use crate::throttle::{Limit, Shaped};
use crate::wire::{self, Gulp};

/// Per-invocation transfer options.
pub struct ClientOpt {
    pub url: String,
    /// Local file to upload; downloads land under `root` instead.
    pub file: Option<PathBuf>,
    /// Remote filename override for uploads.
    pub rename: Option<String>,
    /// Directory downloaded files are written into.
    pub root: PathBuf,
    pub chunk_size: u64,
    /// Worker count; zero or negative means serial.
    pub workers: i32,
    pub bearer: String,
    pub code: String,
    pub cipher: CipherKind,
    /// Bytes per second; zero means unlimited.
    pub rate_limit: u64,
    pub progress: Arc<dyn Progress>,
}

impl ClientOpt {
    pub fn new(url: impl Into<String>) -> Self {
        ClientOpt {
            url: url.into(),
            file: None,
            rename: None,
            root: PathBuf::from("./.gulp"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: 0,
            bearer: String::new(),
            code: String::new(),
            cipher: CipherKind::default(),
            rate_limit: 0,
            progress: Arc::new(NoopProgress),
        }
    }
}

/// Outcome of a transfer run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub total_size: u64,
    pub parts: u64,
    /// Chunks abandoned after retries; a later run resumes them.
    pub incomplete: u64,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

/// Chunked upload of `opt.file` to the server root URL.
pub async fn upload(opt: ClientOpt) -> Result<TransferReport> {
    let path = opt.file.clone().context("upload requires a local file")?;
    let mut client = Client::new(&opt, Direction::Up)?;
    client.total_size = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    client.remote_name = remote_name(&path, &opt.rename)?;
    client.path = path;
    client.handshake(&opt.code).await?;

    tracing::info!(
        session = %client.id,
        file = %client.path.display(),
        size = client.total_size,
        "upload started"
    );
    let report = Arc::new(client).drive().await?;
    tracing::info!(incomplete = report.incomplete, "upload finished");
    Ok(report)
}

/// Chunked download of the file named by `opt.url` into `opt.root`.
pub async fn download(opt: ClientOpt) -> Result<TransferReport> {
    let mut client = Client::new(&opt, Direction::Down)?;
    client.handshake(&opt.code).await?;

    // First request carries no range; the server advertises the total size
    // through a synthesized first chunk range plus the filename.
    let resp = client
        .http
        .get(&client.url)
        .header(AUTHORIZATION, client.bearer_header())
        .header(
            wire::CONTENT_GULP,
            Gulp::default().session(&client.id).encode(),
        )
        .send()
        .await
        .context("download probe")?;
    ensure!(
        resp.status() == StatusCode::OK,
        "nothing to download at {} (status {})",
        client.url,
        resp.status()
    );
    let advertised = Gulp::from_headers(resp.headers())?;
    let range = advertised
        .range
        .context("server advertised no content range")?;
    client.total_size = ChunkRange::parse(&range)?.total_size;

    let filename = resp
        .headers()
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(wire::parse_disposition)
        .context("server advertised no filename")?;
    let filename = Path::new(&filename)
        .file_name()
        .context("server advertised an empty filename")?
        .to_string_lossy()
        .into_owned();
    tokio::fs::create_dir_all(&opt.root)
        .await
        .with_context(|| format!("create {}", opt.root.display()))?;
    client.path = opt.root.join(&filename);
    client.remote_name = filename;
    if client.total_size == 0 {
        tokio::fs::File::create(&client.path).await?;
    }

    tracing::info!(
        session = %client.id,
        file = %client.path.display(),
        size = client.total_size,
        "download started"
    );
    let report = Arc::new(client).drive().await?;
    tracing::info!(incomplete = report.incomplete, "download finished");
    Ok(report)
}

/// Non-chunked direct push: the raw file body lands at `<root>/<name>` on
/// the server. No session, no encryption; the fallback when chunking is
/// disabled.
pub async fn push_plain(opt: ClientOpt) -> Result<TransferReport> {
    let path = opt.file.clone().context("push requires a local file")?;
    let total_size = tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    let name = remote_name(&path, &opt.rename)?;
    let url = fix_url(&opt.url)?;

    opt.progress.start(total_size);
    let file = tokio::fs::File::open(&path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let shaped = Shaped::new(file, Limit::per_sec(opt.rate_limit));
    let resp = reqwest::Client::new()
        .post(&url)
        .header(
            AUTHORIZATION,
            format!("{}{}", crate::bearer::BEARER_PREFIX, opt.bearer),
        )
        .header(wire::CONTENT_GULP, Gulp::default().filename(&name).encode())
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(reqwest::Body::wrap_stream(ReaderStream::new(shaped)))
        .send()
        .await
        .context("direct push")?;
    ensure!(
        resp.status() == StatusCode::OK,
        "direct push failed with status {}",
        resp.status()
    );
    opt.progress.add(total_size);
    opt.progress.finish();
    Ok(TransferReport {
        total_size,
        parts: 1,
        incomplete: 0,
    })
}

struct Client {
    http: reqwest::Client,
    url: String,
    id: String,
    path: PathBuf,
    remote_name: String,
    chunk_size: u64,
    total_size: u64,
    workers: i32,
    bearer: String,
    cipher: CipherKind,
    limit: Limit,
    progress: Arc<dyn Progress>,
    session_key: Vec<u8>,
    direction: Direction,
    incomplete: AtomicU64,
}

impl Client {
    fn new(opt: &ClientOpt, direction: Direction) -> Result<Client> {
        Ok(Client {
            http: reqwest::Client::new(),
            url: fix_url(&opt.url)?,
            id: pake::session_id(),
            path: PathBuf::new(),
            remote_name: String::new(),
            chunk_size: opt.chunk_size.max(1),
            total_size: 0,
            workers: opt.workers,
            bearer: opt.bearer.clone(),
            cipher: opt.cipher,
            limit: Limit::per_sec(opt.rate_limit),
            progress: Arc::clone(&opt.progress),
            session_key: Vec::new(),
            direction,
            incomplete: AtomicU64::new(0),
        })
    }

    fn bearer_header(&self) -> String {
        format!("{}{}", crate::bearer::BEARER_PREFIX, self.bearer)
    }

    /// One POST carrying our public bytes; the reply header carries the
    /// server's. Both sides then hold the same session key, assuming the
    /// codephrases matched.
    async fn handshake(&mut self, code: &str) -> Result<()> {
        ensure!(!code.is_empty(), "a codephrase is required for chunked transfers");
        let (state, outbound) = pake::start_client(code);
        let gulp = Gulp::default()
            .session(&self.id)
            .curve(URL_SAFE_NO_PAD.encode(&outbound));
        let resp = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, self.bearer_header())
            .header(wire::CONTENT_GULP, gulp.encode())
            .send()
            .await
            .context("handshake request")?;
        ensure!(
            resp.status() == StatusCode::OK,
            "handshake failed with status {}",
            resp.status()
        );
        let reply = Gulp::from_headers(resp.headers())?;
        let curve = reply.curve.context("handshake reply carried no key material")?;
        let inbound = URL_SAFE_NO_PAD
            .decode(curve.as_bytes())
            .context("decode handshake reply")?;
        self.session_key = state.finish(&inbound)?;
        Ok(())
    }

    async fn drive(self: &Arc<Self>) -> Result<TransferReport> {
        let parts = chunk::part_count(self.total_size, self.chunk_size);
        self.progress.start(self.total_size);

        if self.workers <= 0 {
            for index in 0..parts {
                self.transfer_chunk(index)
                    .await
                    .with_context(|| format!("chunk {index}"))?;
            }
        } else {
            let (tx, rx) = mpsc::channel::<u64>(self.workers as usize);
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            let mut workers = Vec::with_capacity(self.workers as usize);
            for _ in 0..self.workers {
                let job = Arc::clone(self);
                let rx = Arc::clone(&rx);
                workers.push(tokio::spawn(async move {
                    loop {
                        let index = rx.lock().await.recv().await;
                        let Some(index) = index else { break };
                        if let Err(err) = retry(|| job.transfer_chunk(index)).await {
                            // chunks are independently resumable, so a spent
                            // retry budget is logged rather than fatal
                            tracing::warn!(chunk = index, error = %err, "chunk abandoned");
                            job.incomplete.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }));
            }
            for index in 0..parts {
                tx.send(index).await.context("chunk queue closed")?;
            }
            drop(tx);
            for worker in workers {
                worker.await.context("worker panicked")?;
            }
        }

        self.progress.finish();
        Ok(TransferReport {
            total_size: self.total_size,
            parts,
            incomplete: self.incomplete.load(Ordering::Relaxed),
        })
    }

    async fn transfer_chunk(&self, index: u64) -> Result<()> {
        // a zero-length tail chunk is never transmitted
        if chunk::part_size(self.total_size, self.chunk_size, index) == 0 {
            return Ok(());
        }
        let range = ChunkRange::nth(index, self.chunk_size, self.total_size);
        match self.direction {
            Direction::Up => self.upload_chunk(&range).await,
            Direction::Down => self.download_chunk(&range).await,
        }
    }

    /// Returns true when the server already holds matching bytes.
    async fn probe(&self, range: &ChunkRange, data: &[u8]) -> Result<bool> {
        let gulp = Gulp::default()
            .session(&self.id)
            .range(range.to_header())
            .checksum(chunk::fingerprint(data));
        let resp = self
            .http
            .get(&self.url)
            .header(AUTHORIZATION, self.bearer_header())
            .header(wire::CONTENT_GULP, gulp.encode())
            .header(CONTENT_DISPOSITION, wire::format_disposition(&self.remote_name))
            .send()
            .await
            .context("chunk probe")?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => Ok(true),
            StatusCode::OK => Ok(false),
            status => bail!("chunk probe failed with status {status}"),
        }
    }

    async fn upload_chunk(&self, range: &ChunkRange) -> Result<()> {
        let data = chunk::read_range(&self.path, range.from, range.to).await?;
        ensure!(
            data.len() as u64 == range.part_size(),
            "{} shrank while uploading",
            self.path.display()
        );
        if self.probe(range, &data).await? {
            self.progress.add(range.part_size());
            return Ok(());
        }

        let salt = cipher::gen_salt();
        let key = self.chunk_key(&salt).await?;
        let sealed = cipher::seal(self.cipher, &key, &data)?;
        let gulp = Gulp::default()
            .session(&self.id)
            .range(range.to_header())
            .salt(URL_SAFE_NO_PAD.encode(salt));
        let resp = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, self.bearer_header())
            .header(wire::CONTENT_GULP, gulp.encode())
            .header(CONTENT_DISPOSITION, wire::format_disposition(&self.remote_name))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(self.shaped_body(sealed))
            .send()
            .await
            .context("chunk upload")?;
        let status = resp.status();
        let echo = resp.text().await.unwrap_or_default();
        ensure!(
            status == StatusCode::OK,
            "chunk upload failed with status {status}: {}",
            echo.trim()
        );
        // the response body echoes the range as the acknowledgement
        ensure!(
            echo == range.to_header(),
            "server acknowledged {:?}, expected {:?}",
            echo,
            range.to_header()
        );
        self.progress.add(range.part_size());
        Ok(())
    }

    async fn download_chunk(&self, range: &ChunkRange) -> Result<()> {
        let local = chunk::fingerprint_range(&self.path, range.from, range.to).await?;
        let mut gulp = Gulp::default().session(&self.id).range(range.to_header());
        if let Some(sum) = local {
            gulp = gulp.checksum(sum);
        }
        let resp = self
            .http
            .get(&self.url)
            .header(AUTHORIZATION, self.bearer_header())
            .header(wire::CONTENT_GULP, gulp.encode())
            .send()
            .await
            .context("chunk download")?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => {
                self.progress.add(range.part_size());
                return Ok(());
            }
            StatusCode::OK => {}
            status => bail!("chunk download failed with status {status}"),
        }

        let reply = Gulp::from_headers(resp.headers())?;
        let salt: [u8; cipher::SALT_LEN] = URL_SAFE_NO_PAD
            .decode(reply.salt.context("chunk reply carried no salt")?.as_bytes())
            .context("decode chunk salt")?
            .as_slice()
            .try_into()
            .context("bad chunk salt length")?;
        let sealed = self.read_shaped_body(resp).await?;
        let key = self.chunk_key(&salt).await?;
        let plain = cipher::open(self.cipher, &key, &sealed)?;
        ensure!(
            plain.len() as u64 == range.part_size(),
            "server sent {} bytes for a {} byte chunk",
            plain.len(),
            range.part_size()
        );
        chunk::write_range(&self.path, range, Cursor::new(plain)).await?;
        self.progress.add(range.part_size());
        Ok(())
    }

    /// scrypt is memory-hard by design; keep it off the async workers.
    async fn chunk_key(&self, salt: &[u8; cipher::SALT_LEN]) -> Result<[u8; 32]> {
        let secret = self.session_key.clone();
        let salt = *salt;
        let key = tokio::task::spawn_blocking(move || cipher::derive_key(&secret, &salt))
            .await
            .context("key derivation task")??;
        Ok(key)
    }

    fn shaped_body(&self, data: Vec<u8>) -> reqwest::Body {
        if self.limit.is_unlimited() {
            reqwest::Body::from(data)
        } else {
            reqwest::Body::wrap_stream(ReaderStream::new(Shaped::new(
                Cursor::new(data),
                self.limit,
            )))
        }
    }

    async fn read_shaped_body(&self, resp: reqwest::Response) -> Result<Vec<u8>> {
        if self.limit.is_unlimited() {
            return Ok(resp.bytes().await.context("read response body")?.to_vec());
        }
        let stream = Box::pin(resp.bytes_stream().map_err(std::io::Error::other));
        let mut shaped = Shaped::new(StreamReader::new(stream), self.limit);
        let mut buf = Vec::new();
        shaped
            .read_to_end(&mut buf)
            .await
            .context("read response body")?;
        Ok(buf)
    }
}

fn remote_name(path: &Path, rename: &Option<String>) -> Result<String> {
    if let Some(name) = rename {
        ensure!(!name.is_empty(), "empty remote filename");
        return Ok(name.clone());
    }
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("file path has no filename component")
}

fn fix_url(raw: &str) -> Result<String> {
    let url = raw.trim();
    ensure!(!url.is_empty(), "no server url given");
    if url.contains("://") {
        Ok(url.to_string())
    } else {
        Ok(format!("http://{url}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_url() {
        assert_eq!(fix_url("localhost:2110").unwrap(), "http://localhost:2110");
        assert_eq!(
            fix_url("http://example.com/f.bin").unwrap(),
            "http://example.com/f.bin"
        );
        assert!(fix_url("  ").is_err());
    }

    #[test]
    fn test_remote_name() {
        assert_eq!(
            remote_name(Path::new("/tmp/a/b.bin"), &None).unwrap(),
            "b.bin"
        );
        assert_eq!(
            remote_name(Path::new("/tmp/a/b.bin"), &Some("c.bin".into())).unwrap(),
            "c.bin"
        );
        assert!(remote_name(Path::new("/"), &None).is_err());
    }
}
