use chrono::{DateTime, TimeZone, Utc};
use std::io::{self, Read, Seek, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

const UNSET: i64 = i64::MIN;

#[derive(Debug)]
struct Counters {
    bytes_read: AtomicU64,
    first_read_us: AtomicI64,
    last_read_us: AtomicI64,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            bytes_read: AtomicU64::new(0),
            first_read_us: AtomicI64::new(UNSET),
            last_read_us: AtomicI64::new(UNSET),
        }
    }
}

/// Shared view of a [`ReadTimingStream`]'s counters.
///
/// Cloning is cheap and the handle stays valid after the stream itself
/// was moved into the application or unwrapped. Updates are plain relaxed
/// stores: a reader racing a read may see the byte count and timestamps
/// from different calls.
#[derive(Debug, Clone, Default)]
pub struct ReadStatsHandle(Arc<Counters>);

impl ReadStatsHandle {
    fn touch(&self) {
        let now = Utc::now().timestamp_micros();
        let _ = self.0.first_read_us.compare_exchange(
            UNSET,
            now,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
        self.0.last_read_us.store(now, Ordering::Relaxed);
    }

    fn add(&self, n: usize) {
        self.0.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn get(&self) -> ReadStats {
        ReadStats {
            bytes_read: self.0.bytes_read.load(Ordering::Relaxed),
            first_read: from_micros(self.0.first_read_us.load(Ordering::Relaxed)),
            last_read: from_micros(self.0.last_read_us.load(Ordering::Relaxed)),
        }
    }
}

fn from_micros(us: i64) -> Option<DateTime<Utc>> {
    if us == UNSET {
        return None;
    }
    let secs = us.div_euclid(1_000_000);
    let nanos = (us.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// Point-in-time copy of the read counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadStats {
    pub bytes_read: u64,
    pub first_read: Option<DateTime<Utc>>,
    pub last_read: Option<DateTime<Utc>>,
}

impl ReadStats {
    /// Time between the first and the most recent read call.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.first_read, self.last_read) {
            (Some(first), Some(last)) => Some(last - first),
            _ => None,
        }
    }

    pub fn has_read(&self) -> bool {
        self.first_read.is_some()
    }
}

/// Pass-through reader that records how many bytes were read and when.
///
/// Every read call stamps the last-read time (and the first-read time on
/// the first call) before delegating; bytes are only counted for calls
/// that return successfully. Errors from the wrapped source are returned
/// untouched.
///
/// Besides reading, the wrapper forwards [`Seek`] and exposes the wrapped
/// value through [`get_ref`](Self::get_ref), [`get_mut`](Self::get_mut)
/// and [`into_inner`](Self::into_inner).
#[derive(Debug)]
pub struct ReadTimingStream<R> {
    inner: R,
    stats: ReadStatsHandle,
}

impl<R> ReadTimingStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            stats: ReadStatsHandle::default(),
        }
    }

    pub fn stats(&self) -> ReadStats {
        self.stats.get()
    }

    pub fn stats_handle(&self) -> ReadStatsHandle {
        self.stats.clone()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Reading through this reference bypasses the counters.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ReadTimingStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stats.touch();
        let n = self.inner.read(buf)?;
        self.stats.add(n);
        Ok(n)
    }
}

impl<R: Seek> Seek for ReadTimingStream<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ReadTimingStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.stats.touch();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.stats.add(buf.filled().len() - before);
        Poll::Ready(Ok(()))
    }
}
