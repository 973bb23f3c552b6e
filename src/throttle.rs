//! Token-bucket rate shaping for async byte streams.
//!
//! `Shaped` wraps any `AsyncRead`/`AsyncWrite` and keeps its throughput under
//! a bytes-per-second ceiling: each transfer debits the bucket, and when the
//! bucket goes negative the next call parks on a timer until tokens refill.
//! Dropping the wrapper (a closed connection) releases the waiter with it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Duration, Instant, Sleep};

/// A throughput ceiling. `bytes_per_sec == 0` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub bytes_per_sec: u64,
    pub burst: u64,
}

impl Limit {
    /// Ceiling with a one-second burst allowance.
    pub fn per_sec(bytes_per_sec: u64) -> Self {
        Limit {
            bytes_per_sec,
            burst: bytes_per_sec,
        }
    }

    pub fn unlimited() -> Self {
        Limit {
            bytes_per_sec: 0,
            burst: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }
}

#[derive(Debug)]
struct Bucket {
    rate: f64,
    burst: f64,
    available: f64,
    refilled: Instant,
}

impl Bucket {
    fn new(limit: Limit) -> Self {
        Bucket {
            rate: limit.bytes_per_sec as f64,
            burst: limit.burst.max(1) as f64,
            // start empty: a fresh stream does not get a free burst
            available: 0.0,
            refilled: Instant::now(),
        }
    }

    /// Debits `n` bytes and returns how long the stream must pause before
    /// the next transfer, if the bucket is now overdrawn.
    fn debit(&mut self, n: usize) -> Option<Duration> {
        let now = Instant::now();
        let refill = now.duration_since(self.refilled).as_secs_f64() * self.rate;
        self.available = (self.available + refill).min(self.burst);
        self.refilled = now;
        self.available -= n as f64;
        if self.available >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.available / self.rate))
        }
    }
}

/// Rate-shaped wrapper around an async reader or writer.
#[derive(Debug)]
pub struct Shaped<S> {
    inner: S,
    bucket: Option<Bucket>,
    delay: Option<Pin<Box<Sleep>>>,
}

impl<S> Shaped<S> {
    pub fn new(inner: S, limit: Limit) -> Self {
        Shaped {
            inner,
            bucket: (!limit.is_unlimited()).then(|| Bucket::new(limit)),
            delay: None,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn poll_delay(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(delay) = self.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            self.delay = None;
        }
        Poll::Ready(())
    }

    fn debit(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(bucket) = self.bucket.as_mut() {
            if let Some(wait) = bucket.debit(n) {
                self.delay = Some(Box::pin(tokio::time::sleep(wait)));
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Shaped<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.debit(buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Shaped<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_delay(cx));
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.debit(n);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
