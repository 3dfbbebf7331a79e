//! Bandwidth shaping for TCP listeners.
//!
//! [`net::ShapedListener`] wraps a TCP listener so that every accepted
//! connection writes at no more than a per-connection cap, while all of
//! them together stay under an aggregate cap split fairly between the open
//! connections. Both caps can be changed while connections are running.
//!
//! The remaining modules build a small download server on top of it.

// Core
pub mod net;

// Demo server
pub mod admin;
pub mod config;
pub mod http;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use net::{Limits, ShapedConnection, ShapedListener, Shaper};
