use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("timed out")]
    Timeout,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handshake rejected: {0:02x?}")]
    Handshake(Vec<u8>),
    #[error("proxy refused: {0}")]
    Proxy(#[from] tokio_socks::Error),
}

/// Three-byte no-auth handshake against a local SOCKS5 listener. Verifies
/// the listener speaks SOCKS5 without opening a tunnel; returns the elapsed
/// milliseconds.
pub async fn handshake_probe(proxy_port: u16, limit: Duration) -> Result<f64, SocksError> {
    let start = Instant::now();
    let mut stream = timeout(limit, TcpStream::connect(("127.0.0.1", proxy_port)))
        .await
        .map_err(|_| SocksError::Timeout)??;

    stream.write_all(&[0x05, 0x01, 0x00]).await?;

    let mut reply = [0u8; 2];
    timeout(limit, stream.read_exact(&mut reply))
        .await
        .map_err(|_| SocksError::Timeout)??;

    if reply[0] != 0x05 {
        return Err(SocksError::Handshake(reply.to_vec()));
    }
    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

/// Opens a CONNECT tunnel through the engine's local listener to
/// `host:port`. The returned stream relays bytes transparently.
pub async fn connect(
    proxy_port: u16,
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<Socks5Stream<TcpStream>, SocksError> {
    let stream = timeout(
        limit,
        Socks5Stream::connect(("127.0.0.1", proxy_port), (host, port)),
    )
    .await
    .map_err(|_| SocksError::Timeout)??;
    Ok(stream)
}

/// CONNECT-only reachability check; returns elapsed milliseconds.
pub async fn connect_probe(
    proxy_port: u16,
    host: &str,
    port: u16,
    limit: Duration,
) -> Result<f64, SocksError> {
    let start = Instant::now();
    let _stream = connect(proxy_port, host, port, limit).await?;
    Ok(start.elapsed().as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_handshake_probe_accepts_socks5_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0x05, 0x01, 0x00]);
            sock.write_all(&[0x05, 0x00]).await.unwrap();
        });

        let latency = handshake_probe(port, Duration::from_secs(2)).await.unwrap();
        assert!(latency >= 0.0);
    }

    #[tokio::test]
    async fn test_handshake_probe_rejects_wrong_version() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&[0x04, 0x00]).await.unwrap();
        });

        assert!(matches!(
            handshake_probe(port, Duration::from_secs(2)).await,
            Err(SocksError::Handshake(_))
        ));
    }

    #[tokio::test]
    async fn test_handshake_probe_refused_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(
            handshake_probe(port, Duration::from_secs(2))
                .await
                .is_err()
        );
    }
}
