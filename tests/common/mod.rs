//! Shared utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::routing::any;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use flowtap::lifecycle::Shutdown;
use flowtap::proxy::{Engine, Options, Upstream};

/// Start a mock backend that answers every request with a fixed 200 body.
/// Returns the bound address.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        // Drain the request head before answering.
                        let mut buf = [0u8; 8192];
                        let _ = socket.read(&mut buf).await;
                        let response_str = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.len(),
                            response
                        );
                        let _ = socket.write_all(response_str.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a backend that echoes the request body back as the response body.
#[allow(dead_code)]
pub async fn start_echo_backend() -> SocketAddr {
    async fn echo(body: Bytes) -> Bytes {
        body
    }

    let app = axum::Router::new()
        .route("/", any(echo))
        .route("/{*path}", any(echo));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Spawn a proxy engine serving on an ephemeral port.
pub async fn spawn_proxy(opts: Options) -> (Arc<Engine>, SocketAddr, Shutdown) {
    let engine = Arc::new(Engine::new(opts).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let rx = shutdown.subscribe();
    let serve_engine = engine.clone();
    tokio::spawn(async move {
        let _ = serve_engine.serve(listener, rx).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (engine, addr, shutdown)
}

#[allow(dead_code)]
pub fn upstream(name: &str, prefix: &str, addr: SocketAddr) -> Upstream {
    Upstream {
        name: name.to_string(),
        prefix: prefix.to_string(),
        target: format!("http://{addr}"),
    }
}

#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}
