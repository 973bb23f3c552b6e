//! Chunk addressing and chunk-level file I/O.
//!
//! A chunk is a contiguous byte range of a file, addressed on the wire as
//! `bytes FROM-TO/TOTAL`. Writes land in a sparse file preallocated to its
//! final size, so chunks can arrive in any order.

use std::io::SeekFrom;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

/// Default transfer chunk size (10 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RangeError {
    #[error("malformed range {0:?}")]
    Malformed(String),
    #[error("inverted range {0:?}")]
    Inverted(String),
}

/// A chunk's byte range within a file of known total size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub from: u64,
    pub to: u64,
    pub total_size: u64,
}

impl ChunkRange {
    /// Range of the `index`-th chunk.
    pub fn nth(index: u64, chunk_size: u64, total_size: u64) -> Self {
        let from = index * chunk_size;
        let to = from + part_size(total_size, chunk_size, index);
        ChunkRange {
            from,
            to,
            total_size,
        }
    }

    pub fn part_size(&self) -> u64 {
        self.to - self.from
    }

    /// Wire form, e.g. `bytes 0-10000/25000`.
    pub fn to_header(&self) -> String {
        format!("bytes {}-{}/{}", self.from, self.to, self.total_size)
    }

    pub fn parse(s: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(s.to_string());
        let rest = s.trim();
        let rest = rest.strip_prefix("bytes").unwrap_or(rest).trim_start();
        let (from_to, total) = rest.split_once('/').ok_or_else(malformed)?;
        let (from, to) = from_to.split_once('-').ok_or_else(malformed)?;
        let from: u64 = from.trim().parse().map_err(|_| malformed())?;
        let to: u64 = to.trim().parse().map_err(|_| malformed())?;
        let total_size: u64 = total.trim().parse().map_err(|_| malformed())?;
        if from > to || to > total_size {
            return Err(RangeError::Inverted(s.to_string()));
        }
        Ok(ChunkRange {
            from,
            to,
            total_size,
        })
    }
}

/// Number of chunks needed to cover `total_size`.
pub fn part_count(total_size: u64, chunk_size: u64) -> u64 {
    total_size.div_ceil(chunk_size)
}

/// Size of the `index`-th chunk; the tail chunk may be short, and indices
/// past the end are zero-sized.
pub fn part_size(total_size: u64, chunk_size: u64, index: u64) -> u64 {
    let offset = index.saturating_mul(chunk_size);
    if offset >= total_size {
        0
    } else {
        chunk_size.min(total_size - offset)
    }
}

/// Compact base64-url content fingerprint of a byte slice. A resume hint,
/// not an authenticity check.
pub fn fingerprint(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(blake3::hash(data).as_bytes())
}

/// Reads `[from, to)` from `path`. A missing file reads as empty, and a
/// short read at end-of-file returns what is available.
pub async fn read_range(path: &Path, from: u64, to: u64) -> Result<Vec<u8>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
    };
    file.seek(SeekFrom::Start(from))
        .await
        .with_context(|| format!("seek {} to {from}", path.display()))?;

    let want = (to - from) as usize;
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = file
            .read(&mut buf[filled..])
            .await
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

/// Fingerprint of `[from, to)` of `path`, or `None` when the file is missing
/// or the range is not fully present. Callers treat `None` as a mismatch.
pub async fn fingerprint_range(path: &Path, from: u64, to: u64) -> Result<Option<String>> {
    let data = read_range(path, from, to).await?;
    if (data.len() as u64) < to - from {
        return Ok(None);
    }
    Ok(Some(fingerprint(&data)))
}

/// Writes `reader` into `path` at the chunk's offset. The file is created if
/// absent and truncated to the declared total size first, which preallocates
/// a sparse file and is idempotent across chunks. Returns bytes written.
pub async fn write_range(
    path: &Path,
    range: &ChunkRange,
    mut reader: impl AsyncRead + Unpin,
) -> Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;

    let len = file
        .metadata()
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    if len != range.total_size {
        file.set_len(range.total_size)
            .await
            .with_context(|| format!("truncate {} to {}", path.display(), range.total_size))?;
    }

    file.seek(SeekFrom::Start(range.from))
        .await
        .with_context(|| format!("seek {} to {}", path.display(), range.from))?;
    let written = tokio::io::copy(&mut reader, &mut file)
        .await
        .with_context(|| format!("write {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(written)
}
