use log::{debug, info};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::assets::CONNECT_RETRY_INTERVAL_MS;

/// Connect to `addr`, retrying until `timeout` elapses
///
/// Returns the last connection error once the deadline passes. There is no
/// reconnect once a stream is handed to a session.
pub async fn connect_with_retry(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let deadline = Instant::now() + timeout;
    let retry = Duration::from_millis(CONNECT_RETRY_INTERVAL_MS);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                info!("Connected to {} (attempt {})", addr, attempts);
                return Ok(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, format!("connecting to {addr}")),
        };

        if Instant::now() + retry > deadline {
            return Err(io::Error::new(
                error.kind(),
                format!("{addr}: gave up after {attempts} attempts: {error}"),
            ));
        }
        debug!("Connecting to {} failed: {}, retrying", addr, error);
        tokio::time::sleep(retry).await;
    }
}
