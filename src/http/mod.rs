//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! ShapedListener (paced TCP connections)
//!     → server.rs (Axum setup, /download and /health)
//!     → response body written through ShapedConnection
//!     → Send to client at the shaped rate
//! ```

pub mod server;

pub use server::{AppState, HttpServer};
