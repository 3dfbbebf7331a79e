//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, register with the shared Shaper)
//!     → connection.rs (fair share, chunked writes)
//!     → bucket.rs (per-connection bucket, then aggregate bucket)
//!     → Hand off to HTTP layer (or any AsyncRead + AsyncWrite consumer)
//!
//! Connection lifetime:
//!     accept → registered → close / shutdown / drop → deregistered
//! ```
//!
//! # Design Decisions
//! - Only writes are shaped; reads pass straight through
//! - Caps change at runtime without touching open connections
//! - Fair share is recomputed per chunk from the live connection count

pub mod bucket;
pub mod connection;
pub mod listener;

pub use bucket::{DeadlineExceeded, SharedBucket, TokenBucket};
pub use connection::{ConnectionId, ShapedConnection, WriteError, WriteErrorKind};
pub use listener::{LimitError, Limits, ShapedListener, Shaper};
