use std::time::{Duration, Instant};

use sha2::{Digest, Sha224};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

use crate::node::{Credentials, Node};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_ATTEMPTS: u32 = 3;
const RETRY_SPACING: Duration = Duration::from_secs(1);

/// Protocol-aware liveness check that bypasses the engine: connect straight
/// to the node's own server:port and poke it. A reply, or silence after a
/// successful connect, both count as reachable; an RST does not.
pub struct DirectProber {
    connect_timeout: Duration,
}

impl DirectProber {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    /// Returns the best elapsed milliseconds over up to three attempts, or
    /// `None` if the node never answered.
    pub async fn probe(&self, node: &Node) -> Option<f64> {
        let payload = probe_payload(&node.credentials);
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.tcp_probe(&node.server, node.port, &payload).await {
                Some(latency) => {
                    log::debug!(
                        "direct probe of {} succeeded on attempt {attempt}: {latency:.0}ms",
                        node.endpoint()
                    );
                    return Some(latency);
                }
                None if attempt < RETRY_ATTEMPTS => sleep(RETRY_SPACING).await,
                None => {}
            }
        }
        log::debug!(
            "direct probe of {} failed after {RETRY_ATTEMPTS} attempts",
            node.endpoint()
        );
        None
    }

    async fn tcp_probe(&self, server: &str, port: u16, payload: &[u8]) -> Option<f64> {
        let start = Instant::now();
        let mut stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((server, port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                log::debug!("direct probe connect {server}:{port} failed: {e}");
                return None;
            }
            Err(_) => {
                log::debug!("direct probe connect {server}:{port} timed out");
                return None;
            }
        };

        if let Err(e) = stream.write_all(payload).await {
            log::debug!("direct probe write to {server}:{port} failed: {e}");
            return None;
        }

        let mut buf = [0u8; 1024];
        match timeout(READ_TIMEOUT, stream.read(&mut buf)).await {
            // Any reply means the peer is alive; a timeout after a clean
            // connect still means the handshake went through.
            Ok(Ok(_)) | Err(_) => Some(start.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) => {
                log::debug!("direct probe read from {server}:{port} failed: {e}");
                None
            }
        }
    }
}

fn probe_payload(credentials: &Credentials) -> Vec<u8> {
    match credentials {
        // A TLS-shaped trojan hello: hex(SHA-224(password)) CRLF then a
        // minimal request stub.
        Credentials::Trojan { password } => {
            let digest = Sha224::digest(password.as_bytes());
            let mut payload = hex_string(&digest).into_bytes();
            payload.extend_from_slice(b"\r\n");
            payload.extend_from_slice(&[
                0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]);
            payload
        }
        Credentials::Shadowsocks { .. } => {
            vec![0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        }
        Credentials::Vmess { .. } | Credentials::Vless { .. } => vec![0u8; 16],
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Transport;
    use tokio::net::TcpListener;

    fn ss_node(server: &str, port: u16) -> Node {
        Node {
            name: "probe-test".to_string(),
            server: server.to_string(),
            port,
            credentials: Credentials::Shadowsocks {
                method: "aes-256-gcm".to_string(),
                password: "pw".to_string(),
            },
            transport: Transport::Tcp,
            tls: None,
            origin_uri: String::new(),
        }
    }

    #[test]
    fn test_trojan_payload_shape() {
        let payload = probe_payload(&Credentials::Trojan {
            password: "secret".to_string(),
        });
        // 56 hex chars of SHA-224, CRLF, 10-byte stub.
        assert_eq!(payload.len(), 56 + 2 + 10);
        assert!(payload[..56].iter().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(&payload[56..58], b"\r\n");

        let other = probe_payload(&Credentials::Trojan {
            password: "different".to_string(),
        });
        assert_ne!(payload[..56], other[..56]);
    }

    #[test]
    fn test_vmess_payload_is_silent_sixteen_bytes() {
        let payload = probe_payload(&Credentials::Vmess {
            uuid: "u".to_string(),
            alter_id: 0,
            security: "auto".to_string(),
        });
        assert_eq!(payload, vec![0u8; 16]);
    }

    #[tokio::test]
    async fn test_probe_succeeds_against_replying_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await;
            let _ = sock.write_all(b"hello").await;
        });

        let prober = DirectProber::new(Duration::from_secs(2));
        let latency = prober.probe(&ss_node("127.0.0.1", port)).await;
        assert!(latency.is_some());
        assert!(latency.unwrap() >= 0.0);
    }

    #[tokio::test]
    async fn test_probe_fails_against_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = DirectProber::new(Duration::from_millis(500));
        assert!(prober.probe(&ss_node("127.0.0.1", port)).await.is_none());
    }
}
