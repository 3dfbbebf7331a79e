//! Shaped connection: a stream whose writes are paced by two token buckets.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and the registry
//! - Compute the connection's fair share of the aggregate cap
//! - Split writes into share-sized chunks and pay for each chunk, first from
//!   the connection's own bucket, then from the listener's aggregate bucket
//! - Deregister from the listener on close
//!
//! # Write Loop
//! ```text
//! remaining bytes
//!     → share()           (min(round(aggregate / active), conn_limit))
//!     → write chunk       (not gated)
//!     → wait local bucket
//!     → wait global bucket
//!     → repeat until remaining = 0
//! ```
//!
//! Through `AsyncWrite` the same steps run across calls: `poll_write`
//! returns once its chunk is on the wire, and the local and global waits of
//! that chunk gate the next `poll_write`, `poll_flush` or `poll_shutdown`.
//!
//! # Design Decisions
//! - Tokens are paid after the chunk is on the wire, so unsent data is never
//!   buffered; short bursts may run ahead of the nominal rate
//! - A change of the per-connection limit resets the local bucket, dropping
//!   any debt built up under the old rate
//! - Reads and socket metadata pass through unshaped

use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant, Sleep};

use crate::net::bucket::{DeadlineExceeded, TokenBucket};
use crate::net::listener::Shaper;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a shaped write stopped early.
#[derive(Debug, thiserror::Error)]
pub enum WriteErrorKind {
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    /// A token wait could not finish before the write deadline.
    #[error("token wait would exceed the write deadline")]
    DeadlineExceeded,
}

/// A failed shaped write, with the number of bytes already on the wire.
#[derive(Debug, thiserror::Error)]
#[error("shaped write stopped after {written} bytes")]
pub struct WriteError {
    /// Bytes that reached the transport before the failure.
    pub written: usize,
    /// What went wrong.
    #[source]
    pub kind: WriteErrorKind,
}

impl WriteError {
    fn io(written: usize, e: io::Error) -> Self {
        Self {
            written,
            kind: WriteErrorKind::Io(e),
        }
    }

    fn deadline(written: usize) -> Self {
        Self {
            written,
            kind: WriteErrorKind::DeadlineExceeded,
        }
    }

    /// True if the shaping layer gave up on the deadline.
    pub fn is_deadline(&self) -> bool {
        matches!(self.kind, WriteErrorKind::DeadlineExceeded)
    }
}

impl From<WriteError> for io::Error {
    fn from(e: WriteError) -> Self {
        match e.kind {
            WriteErrorKind::Io(e) => e,
            WriteErrorKind::DeadlineExceeded => deadline_io_error(),
        }
    }
}

fn deadline_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, DeadlineExceeded)
}

/// Payment owed for the last chunk sent through `poll_write`.
#[derive(Debug)]
enum WriteState {
    /// Nothing owed.
    Idle,
    /// `written` bytes are on the wire, paying the local bucket.
    Local { written: usize, sleep: Pin<Box<Sleep>> },
    /// `written` bytes are on the wire, paying the global bucket.
    Global { written: usize, sleep: Pin<Box<Sleep>> },
}

/// A stream accepted by a [`ShapedListener`](crate::net::ShapedListener).
///
/// Writes are paced; reads are not. Use [`write`](Self::write) for a shaped
/// write that reports the exact byte count on failure, or the
/// [`AsyncWrite`] impl to hand the connection to generic code. The
/// `AsyncWrite` impl reports a chunk as soon as it is on the wire and pays
/// for it before the next write, flush or shutdown proceeds.
#[derive(Debug)]
pub struct ShapedConnection<S> {
    id: ConnectionId,
    shaper: Shaper,
    /// Per-connection bucket; rate tracks the listener's `conn_limit`.
    local: TokenBucket,
    inner: S,
    write_deadline: Option<Instant>,
    state: WriteState,
    /// Deadline failure to report on the next `poll_write`.
    deferred: Option<io::Error>,
    registered: bool,
}

impl<S> ShapedConnection<S> {
    /// Wrap `inner` and register it with `shaper`.
    pub(crate) fn new(inner: S, shaper: Shaper) -> Self {
        let id = ConnectionId::new();
        let local = TokenBucket::drained(shaper.conn_limit());
        shaper.register(id);

        Self {
            id,
            shaper,
            local,
            inner,
            write_deadline: None,
            state: WriteState::Idle,
            deferred: None,
            registered: true,
        }
    }

    /// This connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shaping state of the listener that accepted this connection.
    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    /// Rate the local bucket is currently configured with.
    pub fn local_rate(&self) -> u64 {
        self.local.rate()
    }

    /// Bound the token waits of later writes. `None` waits indefinitely.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// The current write deadline.
    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream. Writes made through it are not shaped.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Number of bytes the next chunk may carry.
    ///
    /// The aggregate cap is split evenly over the active connections and
    /// capped by the per-connection limit. A changed per-connection limit is
    /// applied to the local bucket here, which is then drained.
    pub fn share(&mut self) -> usize {
        let aggregate = self.shaper.aggregate_limit();
        let conn_limit = self.shaper.conn_limit();
        // A closed connection that still writes counts itself.
        let active = self.shaper.active_count().max(1);

        if self.local.rate() != conn_limit {
            let now = Instant::now();
            self.local.reconfigure(conn_limit, conn_limit, now);
            self.local.drain(now);
            tracing::debug!(connection_id = %self.id, conn_limit, "Local bucket reset to new per-connection limit");
        }

        let fair = (aggregate as f64 / active as f64).round() as u64;
        // At least one byte per chunk, or the write loop would never end.
        let share = fair.min(conn_limit).max(1);
        tracing::trace!(connection_id = %self.id, share, active, "Share computed");
        usize::try_from(share).unwrap_or(usize::MAX)
    }

    /// Pay `n` bytes to the local bucket; returns when they are paid for.
    fn reserve_local(&mut self, n: usize) -> Result<Instant, DeadlineExceeded> {
        let now = Instant::now();
        let ready_at = self.local.reserve(n as u64, now, self.write_deadline)?;
        metrics::record_throttle_wait("local", ready_at.saturating_duration_since(now));
        Ok(ready_at)
    }

    /// Pay `n` bytes to the listener's aggregate bucket.
    fn reserve_global(&self, n: usize) -> Result<Instant, DeadlineExceeded> {
        let now = Instant::now();
        let ready_at = self.shaper.global().reserve(n as u64, self.write_deadline)?;
        metrics::record_throttle_wait("global", ready_at.saturating_duration_since(now));
        Ok(ready_at)
    }

    fn deadline_exceeded(&self, written: usize) {
        metrics::record_deadline_exceeded();
        tracing::warn!(connection_id = %self.id, written, "Write deadline exceeded while waiting for tokens");
    }

    /// Reserve local tokens for `n` bytes just written by `poll_write`.
    fn start_payment(&mut self, n: usize) {
        match self.reserve_local(n) {
            Ok(ready_at) => {
                self.state = WriteState::Local {
                    written: n,
                    sleep: Box::pin(sleep_until(ready_at)),
                };
            }
            Err(DeadlineExceeded) => {
                self.deadline_exceeded(n);
                self.deferred = Some(deadline_io_error());
            }
        }
    }

    /// Drive the payment of the last chunk to completion.
    ///
    /// Nothing new may be written until this is ready. The payment survives
    /// a dropped write, so a cancelled caller cannot skip it.
    fn poll_payment(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.state {
                WriteState::Idle => {
                    return Poll::Ready(match self.deferred.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    });
                }
                WriteState::Local { written, ref mut sleep } => {
                    ready!(sleep.as_mut().poll(cx));

                    match self.reserve_global(written) {
                        Ok(ready_at) => {
                            self.state = WriteState::Global {
                                written,
                                sleep: Box::pin(sleep_until(ready_at)),
                            };
                        }
                        Err(DeadlineExceeded) => {
                            self.state = WriteState::Idle;
                            self.deadline_exceeded(written);
                            return Poll::Ready(Err(deadline_io_error()));
                        }
                    }
                }
                WriteState::Global { written, ref mut sleep } => {
                    ready!(sleep.as_mut().poll(cx));

                    self.state = WriteState::Idle;
                    metrics::record_bytes_written(written);
                }
            }
        }
    }

    fn deregister(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        self.shaper.deregister(self.id);
        tracing::debug!(
            connection_id = %self.id,
            active_connections = self.shaper.active_count(),
            "Connection closed"
        );
    }
}

impl<S: AsyncWrite + Unpin> ShapedConnection<S> {
    /// Write the whole of `buf`, chunk by chunk, at the shaped rate.
    ///
    /// An empty buffer returns `Ok(0)` without touching either bucket. On
    /// failure the error carries the number of bytes already written.
    /// Dropping the future stops the write; bytes already sent stay paid for.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        if buf.is_empty() {
            return Ok(0);
        }
        // A chunk sent through `AsyncWrite` may still be owed.
        if poll_fn(|cx| self.poll_payment(cx)).await.is_err() {
            return Err(WriteError::deadline(0));
        }

        let mut written = 0;

        while written < buf.len() {
            let end = buf.len().min(written.saturating_add(self.share()));

            let n = match self.inner.write(&buf[written..end]).await {
                Ok(0) => return Err(WriteError::io(written, io::ErrorKind::WriteZero.into())),
                Ok(n) => n,
                Err(e) => return Err(WriteError::io(written, e)),
            };
            written += n;

            let local_ready = self.reserve_local(n).map_err(|_| {
                self.deadline_exceeded(written);
                WriteError::deadline(written)
            })?;
            sleep_until(local_ready).await;

            let global_ready = self.reserve_global(n).map_err(|_| {
                self.deadline_exceeded(written);
                WriteError::deadline(written)
            })?;
            sleep_until(global_ready).await;

            metrics::record_bytes_written(n);
        }

        Ok(written)
    }

    /// Deregister from the listener, then shut the stream down.
    ///
    /// Taking `self` makes a second close impossible.
    pub async fn close(mut self) -> io::Result<()> {
        self.deregister();
        self.inner.shutdown().await
    }
}

impl ShapedConnection<TcpStream> {
    /// Address of the remote peer.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    /// Local address of the socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Set `TCP_NODELAY`.
    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.inner.set_nodelay(nodelay)
    }

    /// Get `TCP_NODELAY`.
    pub fn nodelay(&self) -> io::Result<bool> {
        self.inner.nodelay()
    }
}

impl<S> Drop for ShapedConnection<S> {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ShapedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ShapedConnection<S> {
    /// Pay for the previous chunk, then send one new chunk.
    ///
    /// The returned count always belongs to `buf`. A deadline failure while
    /// paying is returned as `TimedOut` before anything new is written.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_payment(cx))?;

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let end = buf.len().min(this.share());
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[..end]))?;
        if n > 0 {
            this.start_payment(n);
        }
        Poll::Ready(Ok(n))
    }

    /// Waits for the pending payment, so `write_all` followed by `flush`
    /// completes at the shaped rate.
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_payment(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    /// Shut the write side down; once done, the connection no longer counts
    /// against the aggregate share.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_payment(cx))?;
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        this.deregister();
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    use crate::net::listener::Limits;

    fn shaper(aggregate: u64, conn: u64) -> Shaper {
        Shaper::new(Limits::new(aggregate, conn).unwrap())
    }

    /// Attach `count` in-memory connections; the peers keep them writable.
    fn attach(shaper: &Shaper, count: usize) -> Vec<(ShapedConnection<DuplexStream>, DuplexStream)> {
        (0..count)
            .map(|_| {
                let (ours, theirs) = duplex(64 * 1024);
                (shaper.attach(ours), theirs)
            })
            .collect()
    }

    fn assert_about(elapsed: Duration, want: Duration) {
        let low = want.mul_f64(0.95);
        let high = want.mul_f64(1.05);
        assert!(
            elapsed >= low && elapsed <= high,
            "elapsed {:?} not within 5% of {:?}",
            elapsed,
            want
        );
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[tokio::test(start_paused = true)]
    async fn share_cases() {
        struct Case {
            name: &'static str,
            aggregate: u64,
            conn: u64,
            active: usize,
            want: usize,
        }

        let cases = [
            Case { name: "conn", aggregate: 100, conn: 50, active: 1, want: 50 },
            Case { name: "common", aggregate: 50, conn: 100, active: 1, want: 50 },
            Case { name: "equal", aggregate: 100, conn: 50, active: 2, want: 50 },
            Case { name: "common share", aggregate: 100, conn: 50, active: 4, want: 25 },
            Case { name: "rounded", aggregate: 100, conn: 100, active: 3, want: 33 },
            Case { name: "rounded half up", aggregate: 5, conn: 100, active: 2, want: 3 },
            Case { name: "never zero", aggregate: 1, conn: 100, active: 3, want: 1 },
        ];

        for case in cases {
            let shaper = shaper(case.aggregate, case.conn);
            let mut conns = attach(&shaper, case.active);
            assert_eq!(conns[0].0.share(), case.want, "case {}", case.name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_connection_local_bucket_is_drained() {
        let shaper = shaper(1_000, 200);
        let (conn, _peer) = attach(&shaper, 1).pop().unwrap();

        assert_eq!(conn.local_rate(), 200);
        assert_eq!(conn.local.clone().available(Instant::now()), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn conn_limit_change_applies_on_next_share() {
        let shaper = shaper(1_000, 200);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        assert_eq!(conn.share(), 200);

        // Build up debt under the old rate.
        conn.local.reserve(1_000, Instant::now(), None).unwrap();

        shaper.set_conn_limit(50).unwrap();
        assert_eq!(conn.local_rate(), 200);
        assert_eq!(conn.share(), 50);
        assert_eq!(conn.local_rate(), 50);
        assert_eq!(conn.local.available(Instant::now()), 0.0);

        shaper.set_conn_limit(500).unwrap();
        assert_eq!(conn.share(), 500);
        assert_eq!(conn.local_rate(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_change_applies_on_next_share() {
        let shaper = shaper(100, 100);
        let mut conns = attach(&shaper, 2);
        assert_eq!(conns[0].0.share(), 50);

        shaper.set_aggregate_limit(40).unwrap();
        assert_eq!(conns[0].0.share(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_a_connection_raises_the_others_share() {
        let shaper = shaper(100, 100);
        let mut conns = attach(&shaper, 2);
        assert_eq!(conns[0].0.share(), 50);

        let (closed, _peer) = conns.pop().unwrap();
        closed.close().await.unwrap();

        assert_eq!(shaper.active_count(), 1);
        assert_eq!(conns[0].0.share(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_write_touches_nothing() {
        let shaper = shaper(300, 200);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        shaper.set_conn_limit(100).unwrap();

        assert_eq!(conn.write(&[]).await.unwrap(), 0);

        // The pending conn limit change was not picked up: no share was computed.
        assert_eq!(conn.local_rate(), 200);
        assert_eq!(shaper.global().available(), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_connection_is_held_to_conn_limit() {
        let shaper = shaper(300, 200);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();

        let start = Instant::now();
        assert_eq!(conn.write(&[0u8; 1_000]).await.unwrap(), 1_000);
        assert_about(start.elapsed(), Duration::from_secs(5));

        let mut received = vec![0u8; 1_000];
        peer.read_exact(&mut received).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn two_connections_split_the_aggregate() {
        let shaper = shaper(400, 500);
        let mut conns = attach(&shaper, 2);
        let (mut b, _peer_b) = conns.pop().unwrap();
        let (mut a, _peer_a) = conns.pop().unwrap();

        assert_eq!(a.share(), 200);

        let start = Instant::now();
        let (ra, rb) = tokio::join!(a.write(&[1u8; 1_000]), b.write(&[2u8; 1_000]));
        assert_eq!(ra.unwrap(), 1_000);
        assert_eq!(rb.unwrap(), 1_000);

        // 2000 bytes through a 400 B/s aggregate.
        assert_about(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_reports_bytes_on_the_wire() {
        let shaper = shaper(1_000, 200);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(500)));

        let start = Instant::now();
        let err = conn.write(&[0u8; 400]).await.unwrap_err();

        assert!(err.is_deadline());
        assert_eq!(err.written, 200);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(io::Error::from(err).kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_passes_through() {
        let shaper = shaper(1_000, 200);
        let (mut conn, peer) = attach(&shaper, 1).pop().unwrap();
        drop(peer);

        let err = conn.write(&[0u8; 100]).await.unwrap_err();
        assert_eq!(err.written, 0);
        assert!(matches!(err.kind, WriteErrorKind::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[tokio::test(start_paused = true)]
    async fn async_write_paces_write_all() {
        let shaper = shaper(300, 200);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();

        let start = Instant::now();
        AsyncWriteExt::write_all(&mut conn, &[7u8; 1_000]).await.unwrap();
        // The last chunk is still owed; flush pays for it.
        assert_about(start.elapsed(), Duration::from_secs(4));
        AsyncWriteExt::flush(&mut conn).await.unwrap();
        assert_about(start.elapsed(), Duration::from_secs(5));

        let mut received = vec![0u8; 1_000];
        peer.read_exact(&mut received).await.unwrap();
        assert!(received.iter().all(|&b| b == 7));
    }

    #[tokio::test(start_paused = true)]
    async fn async_write_defers_deadline_error() {
        let shaper = shaper(1_000, 200);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        conn.set_write_deadline(Some(Instant::now() + Duration::from_millis(500)));

        let n = AsyncWriteExt::write(&mut conn, &[0u8; 400]).await.unwrap();
        assert_eq!(n, 200);

        let err = AsyncWriteExt::write(&mut conn, &[0u8; 200]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn write_after_cancelled_async_write_sends_its_own_bytes() {
        let shaper = shaper(1_000, 100);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(1_500),
            AsyncWriteExt::write_all(&mut conn, &[1u8; 300]),
        )
        .await;
        assert!(cancelled.is_err());

        // Shorter than the chunk still being paid for.
        let n = AsyncWriteExt::write(&mut conn, &[2u8; 10]).await.unwrap();
        assert_eq!(n, 10);
        AsyncWriteExt::flush(&mut conn).await.unwrap();

        let mut received = vec![0u8; 210];
        peer.read_exact(&mut received).await.unwrap();
        assert!(received[..200].iter().all(|&b| b == 1));
        assert!(received[200..].iter().all(|&b| b == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_async_write_owes_only_bytes_on_the_wire() {
        let shaper = shaper(1_000, 100);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();
        let start = Instant::now();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(1_500),
            AsyncWriteExt::write_all(&mut conn, &[1u8; 300]),
        )
        .await;
        assert!(cancelled.is_err());

        // 200 bytes sent, 150 refilled.
        let local = conn.local.clone().available(Instant::now());
        assert!((local + 50.0).abs() < 1.0, "local tokens {local}");

        AsyncWriteExt::write_all(&mut conn, &[2u8; 100]).await.unwrap();
        AsyncWriteExt::flush(&mut conn).await.unwrap();
        assert_about(start.elapsed(), Duration::from_secs(3));

        let mut received = vec![0u8; 300];
        peer.read_exact(&mut received).await.unwrap();
        assert!(received[..200].iter().all(|&b| b == 1));
        assert!(received[200..].iter().all(|&b| b == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_write_keeps_debt_for_sent_bytes() {
        let shaper = shaper(1_000, 100);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();
        let start = Instant::now();

        let cancelled = tokio::time::timeout(Duration::from_millis(1_500), conn.write(&[1u8; 300])).await;
        assert!(cancelled.is_err());

        let local = conn.local.clone().available(Instant::now());
        assert!((local + 50.0).abs() < 1.0, "local tokens {local}");

        assert_eq!(conn.write(&[2u8; 100]).await.unwrap(), 100);
        // The next chunk queues behind the 50 bytes still owed.
        assert_about(start.elapsed(), Duration::from_secs(3));

        let mut received = vec![0u8; 300];
        peer.read_exact(&mut received).await.unwrap();
        assert!(received[..200].iter().all(|&b| b == 1));
        assert!(received[200..].iter().all(|&b| b == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn inherent_write_settles_async_write_payment() {
        let shaper = shaper(1_000, 100);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        let start = Instant::now();

        assert_eq!(AsyncWriteExt::write(&mut conn, &[1u8; 100]).await.unwrap(), 100);
        assert_eq!(start.elapsed(), Duration::ZERO);

        // Waits 1s for the chunk above, then 1s for its own.
        assert_eq!(conn.write(&[2u8; 100]).await.unwrap(), 100);
        assert_about(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_are_not_shaped() {
        let shaper = shaper(10, 10);
        let (mut conn, mut peer) = attach(&shaper, 1).pop().unwrap();

        peer.write_all(&[3u8; 4_096]).await.unwrap();

        let start = Instant::now();
        let mut buf = vec![0u8; 4_096];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_deregisters() {
        let shaper = shaper(1_000, 200);
        let (mut conn, _peer) = attach(&shaper, 1).pop().unwrap();
        assert_eq!(shaper.active_count(), 1);

        AsyncWriteExt::shutdown(&mut conn).await.unwrap();
        assert_eq!(shaper.active_count(), 0);

        drop(conn);
        assert_eq!(shaper.active_count(), 0);
    }
}
