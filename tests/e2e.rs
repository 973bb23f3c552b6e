use std::net::SocketAddr;
use std::path::Path;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use gulp::chunk::ChunkRange;
use gulp::cipher::{self, CipherKind};
use gulp::client::{self, ClientOpt};
use gulp::pake;
use gulp::server::{serve_listener, ServerConfig};
use gulp::wire::{self, Gulp};

fn write_file(path: &Path, size: usize) -> Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut f = std::fs::File::create(path)?;
    let mut buf = vec![0u8; 1024 * 64];
    let mut remaining = size;
    let mut val: u8 = 0;
    while remaining > 0 {
        for b in buf.iter_mut() {
            *b = val;
            val = val.wrapping_add(1);
        }
        let n = remaining.min(buf.len());
        f.write_all(&buf[..n])?;
        remaining -= n;
    }
    Ok(())
}

async fn spawn_server(cfg: ServerConfig) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = serve_listener(listener, cfg).await;
    });
    addr
}

fn client_opt(addr: SocketAddr, code: &str) -> ClientOpt {
    let mut opt = ClientOpt::new(format!("http://{addr}/"));
    opt.code = code.to_string();
    opt
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_download_roundtrip_ragged_tail() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;

    let source = cli_src.path().join("ragged.bin");
    write_file(&source, 25_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    // upload: 3 chunks, the last one short
    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(source.clone());
    opt.chunk_size = 10_000;
    let report = client::upload(opt).await?;
    assert_eq!(report.parts, 3);
    assert_eq!(report.incomplete, 0);

    let uploaded = std::fs::read(srv_root.path().join("ragged.bin"))?;
    assert_eq!(uploaded, std::fs::read(&source)?);

    // download into a fresh directory
    let mut opt = client_opt(addr, "sesame");
    opt.url = format!("http://{addr}/ragged.bin");
    opt.root = cli_dst.path().to_path_buf();
    opt.chunk_size = 10_000;
    let report = client::download(opt).await?;
    assert_eq!(report.total_size, 25_000);

    let downloaded = std::fs::read(cli_dst.path().join("ragged.bin"))?;
    assert_eq!(downloaded, std::fs::read(&source)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_chunk_and_exact_boundary() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;

    let small = cli_src.path().join("small.bin");
    write_file(&small, 1_000)?;
    let exact = cli_src.path().join("exact.bin");
    write_file(&exact, 20_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(small.clone());
    opt.chunk_size = 10_000;
    let report = client::upload(opt).await?;
    assert_eq!(report.parts, 1);

    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(exact.clone());
    opt.chunk_size = 10_000;
    let report = client::upload(opt).await?;
    assert_eq!(report.parts, 2);

    assert_eq!(
        std::fs::read(srv_root.path().join("small.bin"))?,
        std::fs::read(&small)?
    );
    assert_eq!(
        std::fs::read(srv_root.path().join("exact.bin"))?,
        std::fs::read(&exact)?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_upload_four_workers() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;

    let source = cli_src.path().join("big.bin");
    write_file(&source, 1024 * 1024)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 64 * 1024,
        cipher: CipherKind::ChaCha20Poly1305,
        ..ServerConfig::default()
    })
    .await;
    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(source.clone());
    opt.chunk_size = 64 * 1024;
    opt.workers = 4;
    opt.cipher = CipherKind::ChaCha20Poly1305;
    let report = client::upload(opt).await?;
    assert_eq!(report.parts, 16);
    assert_eq!(report.incomplete, 0);

    assert_eq!(
        std::fs::read(srv_root.path().join("big.bin"))?,
        std::fs::read(&source)?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reupload_is_idempotent_and_repairs_corruption() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;

    let source = cli_src.path().join("steady.bin");
    write_file(&source, 25_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    let upload = |workers: i32| {
        let mut opt = client_opt(addr, "sesame");
        opt.file = Some(source.clone());
        opt.chunk_size = 10_000;
        opt.workers = workers;
        client::upload(opt)
    };

    upload(0).await?;
    let stored = srv_root.path().join("steady.bin");
    let first = std::fs::read(&stored)?;

    // second pass: every chunk probes to 304, content unchanged
    let report = upload(0).await?;
    assert_eq!(report.incomplete, 0);
    assert_eq!(std::fs::read(&stored)?, first);

    // corrupt the middle chunk on the server; a re-run repairs exactly that
    // range via the fingerprint probe
    let mut damaged = first.clone();
    for b in &mut damaged[12_000..18_000] {
        *b ^= 0xFF;
    }
    std::fs::write(&stored, &damaged)?;
    upload(0).await?;
    assert_eq!(std::fs::read(&stored)?, std::fs::read(&source)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn download_resume_repairs_local_damage() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_dst = tempfile::tempdir()?;

    let served = srv_root.path().join("pull.bin");
    write_file(&served, 25_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    let download = || {
        let mut opt = client_opt(addr, "sesame");
        opt.url = format!("http://{addr}/pull.bin");
        opt.root = cli_dst.path().to_path_buf();
        opt.chunk_size = 10_000;
        client::download(opt)
    };

    download().await?;
    let local = cli_dst.path().join("pull.bin");
    assert_eq!(std::fs::read(&local)?, std::fs::read(&served)?);

    // damage one local chunk; the next run re-fetches only mismatched ranges
    let mut damaged = std::fs::read(&local)?;
    for b in &mut damaged[0..10_000] {
        *b ^= 0x55;
    }
    std::fs::write(&local, &damaged)?;
    download().await?;
    assert_eq!(std::fs::read(&local)?, std::fs::read(&served)?);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_bearer_is_rejected_before_handlers() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let source = cli_src.path().join("secret.bin");
    write_file(&source, 1_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        bearer: "letmein".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    let http = reqwest::Client::new();
    for auth in [None, Some("Bearer wrong"), Some("letmein")] {
        let mut req = http.get(format!("http://{addr}/"));
        if let Some(a) = auth {
            req = req.header("Authorization", a);
        }
        assert_eq!(req.send().await?.status(), 401, "auth {auth:?}");
    }

    // wrong token never reaches the handshake handler
    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(source.clone());
    opt.chunk_size = 10_000;
    opt.bearer = "wrong".into();
    assert!(client::upload(opt).await.is_err());
    assert!(!srv_root.path().join("secret.bin").exists());

    // correct token goes through
    let mut opt = client_opt(addr, "sesame");
    opt.file = Some(source.clone());
    opt.chunk_size = 10_000;
    opt.bearer = "letmein".into();
    client::upload(opt).await?;
    assert!(srv_root.path().join("secret.bin").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn codephrase_mismatch_decrypts_nothing() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let source = cli_src.path().join("coded.bin");
    write_file(&source, 1_000)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "alpha".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    // the exchange itself completes; the keys diverge and the chunk upload
    // fails server-side
    let mut opt = client_opt(addr, "beta");
    opt.file = Some(source.clone());
    opt.chunk_size = 10_000;
    assert!(client::upload(opt).await.is_err());
    assert!(!srv_root.path().join("coded.bin").exists());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tampered_ciphertext_is_rejected_then_retry_succeeds() -> Result<()> {
    let srv_root = tempfile::tempdir()?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;
    let url = format!("http://{addr}/");
    let http = reqwest::Client::new();

    // handshake by hand so the ciphertext can be tampered with in flight
    let id = pake::session_id();
    let (state, outbound) = pake::start_client("sesame");
    let resp = http
        .post(&url)
        .header(
            wire::CONTENT_GULP,
            Gulp::default()
                .session(&id)
                .curve(URL_SAFE_NO_PAD.encode(&outbound))
                .encode(),
        )
        .send()
        .await?;
    assert_eq!(resp.status(), 200);
    let reply = Gulp::parse(resp.headers()[wire::CONTENT_GULP].to_str()?)?;
    let key = state.finish(&URL_SAFE_NO_PAD.decode(reply.curve.unwrap())?)?;

    let data = vec![7u8; 1_000];
    let range = ChunkRange {
        from: 0,
        to: 1_000,
        total_size: 1_000,
    };
    let salt = cipher::gen_salt();
    let chunk_key = cipher::derive_key(&key, &salt)?;
    let sealed = cipher::seal(CipherKind::Aes256Gcm, &chunk_key, &data)?;

    let gulp = Gulp::default()
        .session(&id)
        .range(range.to_header())
        .salt(URL_SAFE_NO_PAD.encode(salt));
    let post = |body: Vec<u8>| {
        http.post(&url)
            .header(wire::CONTENT_GULP, gulp.encode())
            .header(
                "Content-Disposition",
                wire::format_disposition("tampered.bin"),
            )
            .header("Content-Type", "application/octet-stream")
            .body(body)
            .send()
    };

    // flip one ciphertext byte: the AEAD tag check fails and nothing lands
    let mut flipped = sealed.clone();
    flipped[sealed.len() / 2] ^= 0x01;
    let resp = post(flipped).await?;
    assert_eq!(resp.status(), 500);
    assert!(!srv_root.path().join("tampered.bin").exists());

    // the intact body goes through and echoes the range
    let resp = post(sealed).await?;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await?, range.to_header());
    assert_eq!(std::fs::read(srv_root.path().join("tampered.bin"))?, data);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_push_listing_and_download() -> Result<()> {
    let srv_root = tempfile::tempdir()?;
    let cli_src = tempfile::tempdir()?;
    let source = cli_src.path().join("plain.bin");
    write_file(&source, 4_096)?;

    let addr = spawn_server(ServerConfig {
        root: srv_root.path().to_path_buf(),
        code: "sesame".into(),
        chunk_size: 10_000,
        ..ServerConfig::default()
    })
    .await;

    // non-chunked direct push: no session, no encryption
    let mut opt = client_opt(addr, "");
    opt.file = Some(source.clone());
    opt.chunk_size = 0;
    let report = client::push_plain(opt).await?;
    assert_eq!(report.total_size, 4_096);
    assert_eq!(
        std::fs::read(srv_root.path().join("plain.bin"))?,
        std::fs::read(&source)?
    );

    let http = reqwest::Client::new();

    // JSON listing
    let listing: serde_json::Value = http
        .get(format!("http://{addr}/"))
        .header("Accept", "application/json")
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listing[0]["name"], "plain.bin");
    assert_eq!(listing[0]["size"], 4_096);

    // HTML index for browsers
    let index = http
        .get(format!("http://{addr}/"))
        .send()
        .await?
        .text()
        .await?;
    assert!(index.contains("<form"));

    // plain sessionless download streams the raw bytes
    let body = http
        .get(format!("http://{addr}/plain.bin"))
        .send()
        .await?
        .bytes()
        .await?;
    assert_eq!(body.to_vec(), std::fs::read(&source)?);

    // unknown files are 404
    let resp = http.get(format!("http://{addr}/missing.bin")).send().await?;
    assert_eq!(resp.status(), 404);
    Ok(())
}
