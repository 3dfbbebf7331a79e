//! TCP listener that shapes the outbound traffic of everything it accepts.
//!
//! # Responsibilities
//! - Bind to an address, accept TCP connections
//! - Own the aggregate token bucket shared by every accepted connection
//! - Keep the registry of active connections used for fair sharing
//! - Expose runtime mutators for both caps
//!
//! # Design Decisions
//! - The shaping state lives in a cloneable [`Shaper`] so the caps stay
//!   adjustable after the listener has been handed to a server
//! - Connections hold the [`Shaper`], never the socket: closing the listener
//!   leaves accepted connections untouched
//! - The aggregate limit is read back from the global bucket, so the two can
//!   never disagree

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::net::bucket::{SharedBucket, TokenBucket};
use crate::net::connection::{ConnectionId, ShapedConnection};
use crate::observability::metrics;

/// Error type for invalid caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimitError {
    /// The aggregate limit was zero.
    #[error("aggregate limit must be greater than zero")]
    ZeroAggregate,
    /// The per-connection limit was zero.
    #[error("per-connection limit must be greater than zero")]
    ZeroConn,
}

/// Validated pair of caps, in bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    aggregate: u64,
    conn: u64,
}

impl Limits {
    /// Validate an aggregate cap and a default per-connection cap.
    pub fn new(aggregate: u64, conn: u64) -> Result<Self, LimitError> {
        if aggregate == 0 {
            return Err(LimitError::ZeroAggregate);
        }
        if conn == 0 {
            return Err(LimitError::ZeroConn);
        }
        Ok(Self { aggregate, conn })
    }

    /// Total bytes per second across all connections.
    pub fn aggregate(&self) -> u64 {
        self.aggregate
    }

    /// Bytes per second for any single connection.
    pub fn conn(&self) -> u64 {
        self.conn
    }
}

/// Shared shaping state of one listener.
///
/// Cheap to clone; every clone observes and mutates the same caps.
#[derive(Debug, Clone)]
pub struct Shaper {
    inner: Arc<ShaperInner>,
}

#[derive(Debug)]
struct ShaperInner {
    /// Aggregate bucket; its rate is the aggregate limit.
    global: SharedBucket,
    /// Default per-connection limit.
    conn_limit: AtomicU64,
    /// Connections currently accepted and not yet closed.
    active: RwLock<HashSet<ConnectionId>>,
}

impl Shaper {
    /// Create the shaping state. The aggregate bucket starts drained.
    pub fn new(limits: Limits) -> Self {
        metrics::set_limits(limits.aggregate, limits.conn);
        Self {
            inner: Arc::new(ShaperInner {
                global: SharedBucket::new(TokenBucket::drained(limits.aggregate)),
                conn_limit: AtomicU64::new(limits.conn),
                active: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Current aggregate limit in bytes per second.
    pub fn aggregate_limit(&self) -> u64 {
        self.inner.global.rate()
    }

    /// Current default per-connection limit in bytes per second.
    pub fn conn_limit(&self) -> u64 {
        self.inner.conn_limit.load(Ordering::Acquire)
    }

    /// Snapshot of both caps.
    pub fn limits(&self) -> Limits {
        Limits {
            aggregate: self.aggregate_limit(),
            conn: self.conn_limit(),
        }
    }

    /// Change the aggregate limit.
    ///
    /// The aggregate bucket is reconfigured in place; connections use the new
    /// value from their next chunk on. Waits already in progress are kept.
    pub fn set_aggregate_limit(&self, limit: u64) -> Result<(), LimitError> {
        if limit == 0 {
            return Err(LimitError::ZeroAggregate);
        }
        self.apply_aggregate_limit(limit);
        Ok(())
    }

    /// Change the default per-connection limit.
    ///
    /// Each connection notices the change at its next chunk and resets its
    /// own bucket then.
    pub fn set_conn_limit(&self, limit: u64) -> Result<(), LimitError> {
        if limit == 0 {
            return Err(LimitError::ZeroConn);
        }
        self.apply_conn_limit(limit);
        Ok(())
    }

    /// Apply both caps at once. Returns false if neither changed.
    pub fn set_limits(&self, limits: Limits) -> bool {
        let aggregate = self.apply_aggregate_limit(limits.aggregate);
        let conn = self.apply_conn_limit(limits.conn);
        aggregate || conn
    }

    /// `limit` must be non-zero.
    fn apply_aggregate_limit(&self, limit: u64) -> bool {
        if self.inner.global.rate() == limit {
            return false;
        }
        self.inner.global.reconfigure(limit, limit);
        metrics::set_limits(limit, self.conn_limit());
        tracing::info!(aggregate_limit = limit, "Aggregate limit changed");
        true
    }

    /// `limit` must be non-zero.
    fn apply_conn_limit(&self, limit: u64) -> bool {
        if self.inner.conn_limit.swap(limit, Ordering::AcqRel) == limit {
            return false;
        }
        metrics::set_limits(self.aggregate_limit(), limit);
        tracing::info!(conn_limit = limit, "Per-connection limit changed");
        true
    }

    /// Number of registered connections.
    pub fn active_count(&self) -> usize {
        self.read_active().len()
    }

    /// Wrap a stream as a registered shaped connection.
    pub(crate) fn attach<S>(&self, stream: S) -> ShapedConnection<S> {
        ShapedConnection::new(stream, self.clone())
    }

    pub(crate) fn global(&self) -> &SharedBucket {
        &self.inner.global
    }

    pub(crate) fn register(&self, id: ConnectionId) {
        let count = {
            let mut active = self.write_active();
            active.insert(id);
            active.len()
        };
        metrics::set_active_connections(count);
    }

    /// Returns false if `id` was not registered.
    pub(crate) fn deregister(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut active = self.write_active();
            (active.remove(&id), active.len())
        };
        metrics::set_active_connections(count);
        removed
    }

    fn read_active(&self) -> RwLockReadGuard<'_, HashSet<ConnectionId>> {
        self.inner.active.read().expect("connection registry lock poisoned")
    }

    fn write_active(&self) -> RwLockWriteGuard<'_, HashSet<ConnectionId>> {
        self.inner.active.write().expect("connection registry lock poisoned")
    }
}

/// A TCP listener whose accepted connections share an aggregate cap.
#[derive(Debug)]
pub struct ShapedListener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Shaping state handed to every accepted connection.
    shaper: Shaper,
}

impl ShapedListener {
    /// Bind to `addr` and shape accepted connections with `limits`.
    pub async fn bind<A: ToSocketAddrs>(addr: A, limits: Limits) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, limits))
    }

    /// Shape connections accepted from an already bound listener.
    pub fn from_listener(listener: TcpListener, limits: Limits) -> Self {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(
                address = %addr,
                aggregate_limit = limits.aggregate,
                conn_limit = limits.conn,
                "Shaped listener bound"
            );
        }
        Self {
            inner: listener,
            shaper: Shaper::new(limits),
        }
    }

    /// Accept a connection and register it for fair sharing.
    ///
    /// Transport errors are returned unchanged.
    pub async fn accept(&self) -> io::Result<(ShapedConnection<TcpStream>, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        let conn = self.shaper.attach(stream);

        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %addr,
            active_connections = self.shaper.active_count(),
            "Connection accepted"
        );

        Ok((conn, addr))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Handle to the shaping state, usable after the listener is moved.
    pub fn shaper(&self) -> &Shaper {
        &self.shaper
    }

    /// See [`Shaper::set_aggregate_limit`].
    pub fn set_aggregate_limit(&self, limit: u64) -> Result<(), LimitError> {
        self.shaper.set_aggregate_limit(limit)
    }

    /// See [`Shaper::set_conn_limit`].
    pub fn set_conn_limit(&self, limit: u64) -> Result<(), LimitError> {
        self.shaper.set_conn_limit(limit)
    }

    /// Number of accepted connections that are still open.
    pub fn active_count(&self) -> usize {
        self.shaper.active_count()
    }

    /// Close the listening socket. Accepted connections stay open.
    pub fn close(self) {
        let addr = self.inner.local_addr().ok();
        drop(self.inner);
        tracing::info!(address = ?addr, "Shaped listener closed");
    }
}

impl axum::serve::Listener for ShapedListener {
    type Io = ShapedConnection<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match ShapedListener::accept(self).await {
                Ok(accepted) => return accepted,
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        ShapedListener::local_addr(self)
    }
}

/// Errors tied to a single incoming connection are skipped; anything else
/// (e.g. running out of file descriptors) backs off before retrying.
async fn handle_accept_error(e: io::Error) {
    if is_connection_error(&e) {
        tracing::debug!(error = %e, "Connection failed during accept");
        return;
    }

    tracing::error!(error = %e, "Accept error");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
