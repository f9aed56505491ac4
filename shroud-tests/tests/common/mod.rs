#![allow(dead_code)]

use std::time::Duration;

use axum::Router;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

/// Serves the given router on an ephemeral loopback port and returns its
/// base URL.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("mock upstream address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

/// Reads one chunk from the stream, or `None` when nothing arrives within
/// the timeout.
pub async fn read_chunk<R>(stream: &mut R, timeout: Duration) -> Option<String>
where
    R: AsyncReadExt + Unpin,
{
    let mut buffer = vec![0u8; 16384];
    match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
        Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buffer[..n]).into_owned()),
        _ => None,
    }
}
