//! HTTP server: request classification, middleware, and chunk handlers.
//!
//! Everything chunk-level flows through the root path and is disambiguated
//! by method plus the `Content-Gulp` header; plain downloads, the file
//! listing, the index page, and the multipart fallback hang off the same
//! single handler. Bearer auth and access logging wrap the whole router.

use std::io::Cursor;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, ensure, Context, Result};
use axum::body::{Body, HttpBody};
use axum::extract::{ConnectInfo, FromRequest, Multipart, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use futures_util::TryStreamExt;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio_util::io::{ReaderStream, StreamReader};
use walkdir::WalkDir;

use crate::bearer;
use crate::chunk::{self, ChunkRange, DEFAULT_CHUNK_SIZE};
use crate::cipher::{self, CipherKind};
use crate::pake;
use crate::progress::human_bytes;
use crate::session::{MemorySessionStore, SessionStore, DEFAULT_TTL, SWEEP_INTERVAL};
use crate::throttle::{Limit, Shaped};
use crate::wire::{self, Gulp};

/// Extra request body room beyond the chunk size, covering AEAD overhead.
const BODY_SLACK: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Directory all files live under; joins are contained within it.
    pub root: PathBuf,
    /// Bearer token; empty disables the check.
    pub bearer: String,
    /// PAKE codephrase shared with clients.
    pub code: String,
    /// Chunk size used for body caps and download advertisements.
    pub chunk_size: u64,
    pub cipher: CipherKind,
    /// Bytes per second per request body or response; zero means unlimited.
    pub rate_limit: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            root: PathBuf::from("./.gulp"),
            bearer: String::new(),
            code: String::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            cipher: CipherKind::default(),
            rate_limit: 0,
        }
    }
}

pub struct ServerState {
    cfg: ServerConfig,
    sessions: Arc<dyn SessionStore>,
}

impl ServerState {
    pub fn new(cfg: ServerConfig, sessions: Arc<dyn SessionStore>) -> Self {
        ServerState { cfg, sessions }
    }

    fn body_cap(&self) -> u64 {
        if self.cfg.chunk_size > 0 {
            self.cfg.chunk_size + BODY_SLACK
        } else {
            u64::MAX - 1
        }
    }

    fn limit(&self) -> Limit {
        Limit::per_sec(self.cfg.rate_limit)
    }

    fn advertised_chunk_size(&self) -> u64 {
        if self.cfg.chunk_size > 0 {
            self.cfg.chunk_size
        } else {
            DEFAULT_CHUNK_SIZE
        }
    }
}

/// Binds `0.0.0.0:<port>` and serves until shutdown.
pub async fn serve(cfg: ServerConfig, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("bind port {port}"))?;
    serve_listener(listener, cfg).await
}

/// Serves on an already-bound listener; tests bind an ephemeral port first.
pub async fn serve_listener(listener: tokio::net::TcpListener, cfg: ServerConfig) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.root)
        .await
        .with_context(|| format!("create root {}", cfg.root.display()))?;

    let sessions = Arc::new(MemorySessionStore::new(DEFAULT_TTL));
    Arc::clone(&sessions).spawn_sweeper(SWEEP_INTERVAL);
    let state = Arc::new(ServerState::new(cfg, sessions));

    let addr = listener.local_addr().context("listener address")?;
    tracing::info!(%addr, root = %state.cfg.root.display(), "listening");

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("serve")?;
    Ok(())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            bearer_guard,
        ))
        .layer(middleware::from_fn(access_log))
        .with_state(state)
}

async fn bearer_guard(
    State(state): State<Arc<ServerState>>,
    req: Request,
    next: Next,
) -> Response {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if bearer::authorized(value, &state.cfg.bearer) {
        next.run(req).await
    } else {
        (StatusCode::UNAUTHORIZED, "Not Authorized\n").into_response()
    }
}

async fn access_log(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|c| c.0.to_string())
        .unwrap_or_else(|| "-".to_string());
    let referer = header_str(req.headers(), header::REFERER);
    let user_agent = header_str(req.headers(), header::USER_AGENT);

    let resp = next.run(req).await;

    let bytes = HttpBody::size_hint(resp.body()).exact().unwrap_or(0);
    tracing::info!(
        remote = %remote,
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        bytes,
        referer = %referer,
        user_agent = %user_agent,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

async fn handle(State(state): State<Arc<ServerState>>, req: Request) -> Response {
    match route(&state, req).await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::error!(error = %err, "request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")).into_response()
        }
    }
}

/// Classifies a request; first match wins.
async fn route(state: &Arc<ServerState>, req: Request) -> Result<Response> {
    let gulp = Gulp::from_headers(req.headers())?;
    let method = req.method().clone();
    let path = percent_encoding::percent_decode_str(req.uri().path())
        .decode_utf8()
        .context("request path is not valid UTF-8")?
        .into_owned();

    if method == Method::POST {
        if let Some(name) = gulp.filename.clone() {
            return direct_push(state, name, req).await;
        }
    }
    if method == Method::POST {
        if let (Some(session), Some(curve)) = (gulp.session.as_deref(), gulp.curve.as_deref()) {
            return serve_pake(state, session, curve).await;
        }
    }
    if path == "/" && gulp.session.is_some() && gulp.range.is_some() {
        return serve_chunk(state, method, &gulp, req).await;
    }
    if method == Method::GET && path == "/" {
        return serve_root(state, req.headers()).await;
    }
    if method == Method::GET {
        return serve_download(state, &path, &gulp).await;
    }
    if method == Method::POST && path == "/" {
        return serve_multipart(state, req).await;
    }
    Ok(StatusCode::NOT_FOUND.into_response())
}

/// PAKE step: ingest the client's public bytes, reply with ours, and store
/// the derived session key. A garbled curve point fails here; a merely wrong
/// codephrase completes but derives a key no chunk will decrypt under.
async fn serve_pake(state: &ServerState, session: &str, curve: &str) -> Result<Response> {
    let inbound = URL_SAFE_NO_PAD
        .decode(curve.as_bytes())
        .context("decode handshake key material")?;

    let (handshake, outbound) = pake::start_server(&state.cfg.code);
    let key = handshake.finish(&inbound)?;
    state.sessions.put(session, key);
    tracing::info!(session = %session, "handshake complete");

    let mut resp = StatusCode::OK.into_response();
    let reply = Gulp::default().curve(URL_SAFE_NO_PAD.encode(&outbound));
    resp.headers_mut().insert(
        wire::CONTENT_GULP,
        HeaderValue::from_str(&reply.encode()).context("encode handshake reply")?,
    );
    Ok(resp)
}

/// Chunk probe (`GET`) and chunk upload (`POST`) on the root path.
async fn serve_chunk(
    state: &ServerState,
    method: Method,
    gulp: &Gulp,
    req: Request,
) -> Result<Response> {
    let (Some(session), Some(range)) = (gulp.session.as_deref(), gulp.range.as_deref()) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let Some(secret) = state.sessions.get(session) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let range = ChunkRange::parse(range)?;
    let filename = req
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(wire::parse_disposition)
        .context("missing filename in Content-Disposition")?;
    let full = contain(&state.cfg.root, &filename);

    if method == Method::GET {
        // probe: a matching fingerprint means the client can skip this chunk
        if let Some(sum) = gulp.checksum.as_deref() {
            if chunk::fingerprint_range(&full, range.from, range.to).await?.as_deref() == Some(sum)
            {
                tracing::info!(
                    file = %filename,
                    session = %session,
                    range = %range.to_header(),
                    "chunk already present"
                );
                return Ok(StatusCode::NOT_MODIFIED.into_response());
            }
        }
        return Ok(StatusCode::OK.into_response());
    }

    if method == Method::POST {
        let salt = URL_SAFE_NO_PAD
            .decode(gulp.salt.as_deref().context("missing chunk salt")?.as_bytes())
            .context("decode chunk salt")?;
        let sealed = read_body(state, req.into_body()).await?;
        let key = derive_key_blocking(secret, salt).await?;
        let plain = cipher::open(state.cfg.cipher, &key, &sealed)?;
        ensure!(
            plain.len() as u64 == range.part_size(),
            "chunk body is {} bytes, range wants {}",
            plain.len(),
            range.part_size()
        );
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        chunk::write_range(&full, &range, Cursor::new(plain)).await?;
        tracing::info!(
            file = %filename,
            session = %session,
            range = %range.to_header(),
            "received chunk"
        );
        return Ok((StatusCode::OK, range.to_header()).into_response());
    }

    Ok(StatusCode::NOT_FOUND.into_response())
}

/// Chunked or plain download of a named file.
async fn serve_download(state: &ServerState, path: &str, gulp: &Gulp) -> Result<Response> {
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }
    let full = contain(&state.cfg.root, name);
    let meta = match tokio::fs::metadata(&full).await {
        Ok(m) if m.is_file() => m,
        _ => return Ok(StatusCode::NOT_FOUND.into_response()),
    };
    let filename = full
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let Some(session) = gulp.session.as_deref() else {
        // plain unencrypted download
        let file = tokio::fs::File::open(&full).await?;
        let body = Body::from_stream(ReaderStream::new(Shaped::new(file, state.limit())));
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, meta.len())
            .header(
                header::CONTENT_DISPOSITION,
                wire::format_disposition(&filename),
            )
            .body(body)?);
    };
    let Some(secret) = state.sessions.get(session) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };

    let Some(range) = gulp.range.as_deref() else {
        // no range yet: advertise the total size via a synthesized first
        // chunk range plus the filename
        let first = ChunkRange::nth(0, state.advertised_chunk_size(), meta.len());
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(
                wire::CONTENT_GULP,
                Gulp::default().range(first.to_header()).encode(),
            )
            .header(
                header::CONTENT_DISPOSITION,
                wire::format_disposition(&filename),
            )
            .body(Body::empty())?);
    };
    let range = ChunkRange::parse(range)?;

    if let Some(sum) = gulp.checksum.as_deref() {
        if chunk::fingerprint_range(&full, range.from, range.to).await?.as_deref() == Some(sum) {
            tracing::info!(
                file = %filename,
                session = %session,
                range = %range.to_header(),
                "chunk already present"
            );
            return Ok(StatusCode::NOT_MODIFIED.into_response());
        }
    }

    let data = chunk::read_range(&full, range.from, range.to).await?;
    let salt = cipher::gen_salt();
    let key = derive_key_blocking(secret, salt.to_vec()).await?;
    let sealed = cipher::seal(state.cfg.cipher, &key, &data)?;
    tracing::info!(
        file = %filename,
        session = %session,
        range = %range.to_header(),
        "sending chunk"
    );

    let reply = Gulp::default()
        .range(range.to_header())
        .salt(URL_SAFE_NO_PAD.encode(salt));
    let body = if state.limit().is_unlimited() {
        Body::from(sealed)
    } else {
        Body::from_stream(ReaderStream::new(Shaped::new(
            Cursor::new(sealed),
            state.limit(),
        )))
    };
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            wire::format_disposition(&filename),
        )
        .header(wire::CONTENT_GULP, reply.encode())
        .body(body)?)
}

/// `GET /`: JSON listing for API clients, the embedded index page otherwise.
async fn serve_root(state: &ServerState, headers: &HeaderMap) -> Result<Response> {
    let wants_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));
    if !wants_json {
        return Ok(Html(INDEX_HTML).into_response());
    }
    let root = state.cfg.root.clone();
    let entries = tokio::task::spawn_blocking(move || list_entries(&root))
        .await
        .context("listing task")??;
    Ok(Json(entries).into_response())
}

/// Raw-body push to `<root>/<name>`; the client's path when chunking is off.
async fn direct_push(state: &ServerState, name: String, req: Request) -> Result<Response> {
    let name = Path::new(&name)
        .file_name()
        .context("empty push filename")?
        .to_string_lossy()
        .into_owned();
    let full = contain(&state.cfg.root, &name);

    let cap = state.body_cap();
    let stream = Box::pin(req.into_body().into_data_stream().map_err(std::io::Error::other));
    let mut reader =
        Shaped::new(StreamReader::new(stream), state.limit()).take(cap.saturating_add(1));
    let mut file = tokio::fs::File::create(&full)
        .await
        .with_context(|| format!("create {}", full.display()))?;
    let size = tokio::io::copy(&mut reader, &mut file)
        .await
        .with_context(|| format!("write {}", full.display()))?;
    ensure!(size <= cap, "request body exceeds {} byte limit", cap);
    file.sync_all().await?;

    tracing::info!(file = %full.display(), size, "received direct push");
    Ok(Json(Entry { name, size }).into_response())
}

#[derive(Debug, Serialize)]
struct UploadSummary {
    files: Vec<String>,
    file_sizes: Vec<String>,
    total_size: String,
    start: String,
    end: String,
    cost: String,
    limit_size: String,
}

/// Legacy multipart form upload; browsers post the index page's form here.
async fn serve_multipart(state: &ServerState, req: Request) -> Result<Response> {
    let is_multipart = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));
    if !is_multipart {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let started = Instant::now();
    let start_stamp = chrono::Utc::now();
    let cap = state.body_cap();
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|e| anyhow!("parse multipart form: {e}"))?;

    let mut files = Vec::new();
    let mut file_sizes = Vec::new();
    let mut total = 0u64;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| anyhow!("read multipart field: {e}"))?
    {
        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let Some(name) = Path::new(&name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
        else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| anyhow!("read multipart field: {e}"))?;
        ensure!(
            data.len() as u64 <= cap,
            "form file exceeds {} byte limit",
            cap
        );
        let full = contain(&state.cfg.root, &name);
        tokio::fs::write(&full, &data)
            .await
            .with_context(|| format!("write {}", full.display()))?;
        tracing::info!(file = %full.display(), size = data.len(), "received form upload");
        total += data.len() as u64;
        file_sizes.push(human_bytes(data.len() as u64));
        files.push(name);
    }

    Ok(Json(UploadSummary {
        files,
        file_sizes,
        total_size: human_bytes(total),
        start: start_stamp.to_rfc3339(),
        end: chrono::Utc::now().to_rfc3339(),
        cost: format!("{:.1?}", started.elapsed()),
        limit_size: if state.cfg.chunk_size > 0 {
            human_bytes(cap)
        } else {
            "unlimited".to_string()
        },
    })
    .into_response())
}

/// File entry in the JSON listing.
#[derive(Debug, Serialize)]
pub struct Entry {
    pub name: String,
    pub size: u64,
}

fn list_entries(root: &Path) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in WalkDir::new(root) {
        let item = item?;
        if !item.file_type().is_file() {
            continue;
        }
        let meta = item.metadata()?;
        entries.push(Entry {
            name: item.file_name().to_string_lossy().into_owned(),
            size: meta.len(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

/// Reads the request body under the configured cap, rate-shaped.
async fn read_body(state: &ServerState, body: Body) -> Result<Vec<u8>> {
    let cap = state.body_cap();
    let stream = Box::pin(body.into_data_stream().map_err(std::io::Error::other));
    let mut reader =
        Shaped::new(StreamReader::new(stream), state.limit()).take(cap.saturating_add(1));
    let mut buf = Vec::new();
    reader
        .read_to_end(&mut buf)
        .await
        .context("read request body")?;
    ensure!(
        buf.len() as u64 <= cap,
        "request body exceeds {} byte limit",
        cap
    );
    Ok(buf)
}

async fn derive_key_blocking(secret: Vec<u8>, salt: Vec<u8>) -> Result<[u8; 32]> {
    let key = tokio::task::spawn_blocking(move || cipher::derive_key(&secret, &salt))
        .await
        .context("key derivation task")??;
    Ok(key)
}

/// Joins `p` under `root`, discarding parent/absolute components so the
/// result cannot escape the root.
fn contain(root: &Path, p: impl AsRef<Path>) -> PathBuf {
    let mut joined = root.to_path_buf();
    for comp in p.as_ref().components() {
        match comp {
            Component::Normal(s) => joined.push(s),
            Component::ParentDir | Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    joined
}

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8">
<title>gulp</title>
<style>
body { font-family: sans-serif; max-width: 40em; margin: 2em auto; }
input[type=submit] { margin-top: 1em; }
</style>
</head>
<body>
<h1>gulp</h1>
<p>Drop files here or use the gulp client for resumable encrypted transfers.</p>
<form method="post" action="/" enctype="multipart/form-data">
<input type="file" name="file" multiple>
<br>
<input type="submit" value="Upload">
</form>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contain_blocks_traversal() {
        let root = Path::new("/srv/files");
        assert_eq!(contain(root, "a.txt"), PathBuf::from("/srv/files/a.txt"));
        assert_eq!(
            contain(root, "../../etc/passwd"),
            PathBuf::from("/srv/files/etc/passwd")
        );
        assert_eq!(
            contain(root, "/etc/passwd"),
            PathBuf::from("/srv/files/etc/passwd")
        );
        assert_eq!(contain(root, "./x/./y"), PathBuf::from("/srv/files/x/y"));
    }

    #[test]
    fn test_list_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), b"12345").unwrap();
        std::fs::write(dir.path().join("a.bin"), b"1").unwrap();
        let entries = list_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a.bin");
        assert_eq!(entries[0].size, 1);
        assert_eq!(entries[1].name, "b.bin");
        assert_eq!(entries[1].size, 5);
    }

    #[test]
    fn test_body_cap_tracks_chunk_size() {
        let state = ServerState::new(
            ServerConfig {
                chunk_size: 1024,
                ..ServerConfig::default()
            },
            Arc::new(MemorySessionStore::default()),
        );
        assert_eq!(state.body_cap(), 1024 + BODY_SLACK);
    }
}
