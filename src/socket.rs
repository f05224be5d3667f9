//! Socket helpers shared by the hybrid transport and the CLI.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::LengthDelimitedCodec;

/// Maximum direct-delivery frame size. Messages above the backend size
/// limit are rejected before framing, so this is only a hard stop
/// against corrupt length prefixes.
const MAX_FRAME_BYTES: usize = 128 * 1024 * 1024;

/// Builds the length-delimited codec used for direct TCP delivery.
pub(crate) fn message_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

/// Binds a listener on the given host, letting the OS pick a port when
/// `port` is 0.
pub(crate) async fn bind_listener(
    host: &str,
    port: u16,
) -> std::io::Result<(TcpListener, SocketAddr)> {
    let listener = TcpListener::bind((host, port)).await?;
    let addr = listener.local_addr()?;
    Ok((listener, addr))
}

/// Repeatedly attempts to connect to `addr` until it succeeds or the
/// timeout elapses. Used to wait for a freshly spawned server to come
/// up.
pub async fn wait_connection(addr: &str, timeout: Duration) -> std::io::Result<TcpStream> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(err);
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_connection_succeeds_once_listener_is_up() {
        let (listener, addr) = bind_listener("127.0.0.1", 0).await.unwrap();
        let accept = tokio::spawn(async move { listener.accept().await });
        let stream = wait_connection(&addr.to_string(), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(stream.peer_addr().is_ok());
        accept.abort();
    }

    #[tokio::test]
    async fn wait_connection_times_out_without_listener() {
        let result = wait_connection("127.0.0.1:1", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
