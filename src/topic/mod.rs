//! Request/response client for the game server's topic protocol.

pub mod codec;

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

pub use codec::{CodecError, TopicParams};

/// Largest datagram we accept back from the game server.
const MAX_REPLY: usize = 65_535;

/// Send and receive timeout used when nothing else is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TopicError {
    #[error("topic endpoint {endpoint} is unreachable: {source}")]
    Unreachable {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("no topic reply from {endpoint} within {timeout:?}")]
    Timeout { endpoint: String, timeout: Duration },
    #[error("malformed topic reply from {endpoint}: {source}")]
    Malformed {
        endpoint: String,
        #[source]
        source: CodecError,
    },
    #[error("failed to encode topic request: {0}")]
    Encode(#[from] CodecError),
}

/// A decoded reply plus how long it took to arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct TopicReply {
    pub params: TopicParams,
    pub latency: Duration,
}

impl TopicReply {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

/// Stateless; every query uses a fresh socket so concurrent callers never
/// see each other's replies.
#[derive(Debug, Clone)]
pub struct TopicClient {
    host: String,
}

impl Default for TopicClient {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl TopicClient {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Send one topic request to `port`. `timeout` bounds the send and the
    /// wait for the reply separately.
    pub async fn query(
        &self,
        port: u16,
        params: &TopicParams,
        timeout: Duration,
    ) -> Result<TopicReply, TopicError> {
        let endpoint = format!("{}:{}", self.host, port);
        let packet = codec::encode_request(params)?;
        let unreachable = |source: io::Error| TopicError::Unreachable {
            endpoint: endpoint.clone(),
            source,
        };

        let target: SocketAddr = tokio::net::lookup_host(&endpoint)
            .await
            .map_err(unreachable)?
            .next()
            .ok_or_else(|| {
                unreachable(io::Error::new(
                    io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;
        let bind: SocketAddr = if target.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind).await.map_err(unreachable)?;
        socket.connect(target).await.map_err(unreachable)?;

        let started = Instant::now();
        match tokio::time::timeout(timeout, socket.send(&packet)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(unreachable(e)),
            Err(_) => {
                return Err(TopicError::Timeout {
                    endpoint: endpoint.clone(),
                    timeout,
                })
            }
        }
        trace!(%endpoint, bytes = packet.len(), "topic request sent");

        let mut buf = vec![0u8; MAX_REPLY];
        let len = match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => len,
            // Connected UDP sockets surface ICMP port-unreachable as a recv error.
            Ok(Err(e)) => return Err(unreachable(e)),
            Err(_) => {
                return Err(TopicError::Timeout {
                    endpoint: endpoint.clone(),
                    timeout,
                })
            }
        };
        let latency = started.elapsed();

        let params = codec::decode_reply(&buf[..len]).map_err(|source| TopicError::Malformed {
            endpoint: endpoint.clone(),
            source,
        })?;
        debug!(%endpoint, latency_ms = latency.as_millis() as u64, "topic reply");
        Ok(TopicReply { params, latency })
    }
}

/// Commands the watchdog sends to a session.
pub mod commands {
    use std::time::Duration;

    use super::TopicParams;

    fn params(pairs: &[(&str, String)]) -> TopicParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    pub fn health() -> TopicParams {
        params(&[("health", "1".to_string())])
    }

    pub fn shutdown() -> TopicParams {
        params(&[("command", "shutdown".to_string())])
    }

    pub fn swap(new_port: u16, grace: Duration) -> TopicParams {
        params(&[
            ("command", "swap".to_string()),
            ("port", new_port.to_string()),
            ("grace", grace.as_secs().to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_server(reply: Vec<u8>) -> (u16, tokio::task::JoinHandle<TopicParams>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let (len, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&reply, from).await.unwrap();
            codec::decode_request(&buf[..len]).unwrap()
        });
        (port, task)
    }

    #[tokio::test]
    async fn query_round_trip() {
        let mut reply = TopicParams::new();
        reply.insert("state".into(), "running".into());
        let (port, server) = echo_server(codec::encode_reply(&reply).unwrap()).await;

        let client = TopicClient::new("127.0.0.1");
        let got = client
            .query(port, &commands::health(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(got.get("state"), Some("running"));
        assert_eq!(server.await.unwrap()["health"], "1");
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();

        let started = Instant::now();
        let err = TopicClient::default()
            .query(port, &commands::health(), Duration::from_millis(100))
            .await
            .unwrap_err();
        match err {
            TopicError::Timeout { timeout, .. } => assert_eq!(timeout, Duration::from_millis(100)),
            other => panic!("expected a timeout, got {other}"),
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        drop(socket);
    }

    #[test]
    fn default_timeout_is_five_seconds() {
        assert_eq!(DEFAULT_TIMEOUT, Duration::from_secs(5));
        let cfg = crate::config::model::WatchdogConfig::default();
        assert_eq!(Duration::from_millis(cfg.topic_timeout_ms), DEFAULT_TIMEOUT);
    }

    #[tokio::test]
    async fn garbage_reply_is_malformed() {
        let (port, _server) = echo_server(b"nope".to_vec()).await;
        let err = TopicClient::default()
            .query(port, &commands::health(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, TopicError::Malformed { .. }));
    }

    #[test]
    fn swap_command_carries_port_and_grace() {
        let p = commands::swap(1338, Duration::from_secs(10));
        assert_eq!(p["command"], "swap");
        assert_eq!(p["port"], "1338");
        assert_eq!(p["grace"], "10");
    }
}
