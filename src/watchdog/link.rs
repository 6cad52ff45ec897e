use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::topic::{commands, TopicClient, TopicError, TopicReply};

/// Outcome of one health probe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthProbeResult {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(with = "millis")]
    pub latency: Duration,
    pub game_state: Option<String>,
    pub players: Option<u32>,
    pub error: Option<String>,
}

impl HealthProbeResult {
    pub fn from_reply(reply: &TopicReply) -> Self {
        Self {
            at: Utc::now(),
            success: true,
            latency: reply.latency,
            game_state: reply.get("state").map(str::to_string),
            players: reply.get("players").and_then(|p| p.parse().ok()),
            error: None,
        }
    }

    pub fn from_error(error: &TopicError, latency: Duration) -> Self {
        Self {
            at: Utc::now(),
            success: false,
            latency,
            game_state: None,
            players: None,
            error: Some(error.to_string()),
        }
    }
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// How the watchdog talks to a running session.
#[async_trait]
pub trait SessionLink: Send + Sync {
    async fn probe(&self, port: u16, timeout: Duration) -> Result<TopicReply, TopicError>;

    /// Ask the session to shut down on its own.
    async fn request_shutdown(&self, port: u16, timeout: Duration) -> Result<(), TopicError>;

    /// Tell the session on `port` that clients should move to `new_port`
    /// within `grace`.
    async fn announce_swap(
        &self,
        port: u16,
        new_port: u16,
        grace: Duration,
        timeout: Duration,
    ) -> Result<(), TopicError>;
}

/// [`SessionLink`] over the topic protocol.
#[derive(Debug, Clone, Default)]
pub struct TopicLink {
    client: TopicClient,
}

impl TopicLink {
    pub fn new(client: TopicClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SessionLink for TopicLink {
    async fn probe(&self, port: u16, timeout: Duration) -> Result<TopicReply, TopicError> {
        self.client.query(port, &commands::health(), timeout).await
    }

    async fn request_shutdown(&self, port: u16, timeout: Duration) -> Result<(), TopicError> {
        self.client
            .query(port, &commands::shutdown(), timeout)
            .await
            .map(|_| ())
    }

    async fn announce_swap(
        &self,
        port: u16,
        new_port: u16,
        grace: Duration,
        timeout: Duration,
    ) -> Result<(), TopicError> {
        self.client
            .query(port, &commands::swap(new_port, grace), timeout)
            .await
            .map(|_| ())
    }
}
