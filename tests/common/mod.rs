//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use bwshaper::config::ServerConfig;
use bwshaper::http::{AppState, HttpServer};
use bwshaper::lifecycle::Shutdown;
use bwshaper::net::{Limits, ShapedListener, Shaper};

/// Bind a shaped listener on an ephemeral loopback port.
pub async fn bind_shaped(aggregate: u64, conn: u64) -> ShapedListener {
    ShapedListener::bind("127.0.0.1:0", Limits::new(aggregate, conn).unwrap())
        .await
        .unwrap()
}

/// Accept connections forever; each one gets `len` bytes and is closed.
///
/// Writes start only once `wait_for` connections are registered, so tests
/// can line up concurrent downloads.
pub fn spawn_payload_server(listener: ShapedListener, len: usize, wait_for: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else { break };
            tokio::spawn(async move {
                while conn.shaper().active_count() < wait_for {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                let payload = vec![7u8; len];
                let _ = conn.write(&payload).await;
                let _ = conn.close().await;
            });
        }
    })
}

/// Connect, read until EOF, and report the byte count and elapsed time.
pub async fn download(addr: SocketAddr) -> (usize, Duration) {
    let start = Instant::now();
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    (buf.len(), start.elapsed())
}

/// Assert `elapsed` lies in `[min, max]` seconds.
pub fn assert_between(elapsed: Duration, min: f64, max: f64) {
    let secs = elapsed.as_secs_f64();
    assert!(
        secs >= min && secs <= max,
        "expected between {min}s and {max}s, took {secs:.3}s"
    );
}

/// A running download server and the handles to drive it.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub shutdown: Shutdown,
    pub config_tx: mpsc::UnboundedSender<ServerConfig>,
    pub task: JoinHandle<Result<(), std::io::Error>>,
}

/// Start an [`HttpServer`] on an ephemeral port.
pub async fn start_http_server(config: ServerConfig) -> TestServer {
    let limits = config.shaping.limits().unwrap();
    let listener = ShapedListener::bind("127.0.0.1:0", limits).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(config, listener.shaper().clone());
    let state = server.state();
    let shutdown = Shutdown::new();
    let (config_tx, config_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(server.run(listener, config_rx, shutdown.subscribe()));

    TestServer { addr, state, shutdown, config_tx, task }
}

/// Start the admin API for `state` on an ephemeral port.
pub async fn start_admin(state: AppState, shutdown: &Shutdown) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let rx = shutdown.subscribe();
    tokio::spawn(bwshaper::admin::serve(listener, state, rx));
    addr
}

/// Accept one connection and hand it to `f`, sending back its result.
pub fn accept_one<F, Fut, T>(listener: ShapedListener, f: F) -> oneshot::Receiver<T>
where
    F: FnOnce(bwshaper::ShapedConnection<TcpStream>, Shaper) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let shaper = listener.shaper().clone();
        let (conn, _) = listener.accept().await.unwrap();
        let _ = tx.send(f(conn, shaper).await);
    });
    rx
}
