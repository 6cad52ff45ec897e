//! Discord bot: gateway websocket for inbound messages, REST for sends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::{ChatProvider, ProviderMessage};
use crate::config::model::DiscordConfig;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;

/// GUILD_MESSAGES | DIRECT_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 9) | (1 << 12) | (1 << 15);
const MAX_MESSAGE_CHARS: usize = 2000;
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

fn identify(token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": token,
            "intents": INTENTS,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "warden",
                "device": "warden",
            },
        },
    })
}

fn heartbeat(seq: Option<u64>) -> WsMessage {
    WsMessage::Text(json!({ "op": OP_HEARTBEAT, "d": seq }).to_string().into())
}

/// `MESSAGE_CREATE` payload to provider message. Messages from bots
/// (including ourselves) are dropped.
pub(crate) fn message_from_dispatch(d: &Value, self_id: Option<&str>) -> Option<ProviderMessage> {
    let author = d.get("author")?;
    if author.get("bot").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let author_id = author.get("id").and_then(Value::as_str);
    if self_id.is_some() && author_id == self_id {
        return None;
    }
    let text = d.get("content").and_then(Value::as_str)?;
    if text.is_empty() {
        return None;
    }
    Some(ProviderMessage {
        channel: d.get("channel_id").and_then(Value::as_str)?.to_string(),
        author: author
            .get("username")
            .and_then(Value::as_str)
            .or(author_id)
            .unwrap_or("unknown")
            .to_string(),
        text: text.to_string(),
        private: d.get("guild_id").map_or(true, Value::is_null),
    })
}

fn truncate(text: &str) -> String {
    text.chars().take(MAX_MESSAGE_CHARS).collect()
}

async fn next_payload<S>(stream: &mut S) -> anyhow::Result<GatewayPayload>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                return serde_json::from_str(&text).context("malformed gateway payload")
            }
            Some(Ok(WsMessage::Close(frame))) => {
                bail!("gateway closed the connection: {:?}", frame)
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e).context("gateway read failed"),
            None => bail!("gateway connection ended"),
        }
    }
}

struct GatewaySession {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DiscordProvider {
    id: String,
    config: DiscordConfig,
    http: reqwest::Client,
    user_id: Mutex<Option<String>>,
    connected: Arc<AtomicBool>,
    session: Mutex<Option<GatewaySession>>,
}

impl DiscordProvider {
    pub fn new(id: impl Into<String>, config: DiscordConfig) -> Self {
        Self {
            id: id.into(),
            config,
            http: reqwest::Client::new(),
            user_id: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChatProvider for DiscordProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn bot_mention(&self) -> Option<String> {
        self.user_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|id| format!("<@{}>", id))
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ProviderMessage>> {
        self.disconnect().await;

        let (ws, _) = tokio_tungstenite::connect_async(self.config.gateway_url.as_str())
            .await
            .with_context(|| format!("failed to reach Discord gateway {}", self.config.gateway_url))?;
        let (mut sink, mut stream) = ws.split();

        let hello = next_payload(&mut stream).await?;
        if hello.op != OP_HELLO {
            bail!("expected gateway hello, got op {}", hello.op);
        }
        let interval = hello
            .d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .context("gateway hello without heartbeat_interval")?;

        sink.send(WsMessage::Text(identify(&self.config.token).to_string().into()))
            .await
            .context("failed to identify with gateway")?;

        let ready = tokio::time::timeout(READY_TIMEOUT, async {
            loop {
                let payload = next_payload(&mut stream).await?;
                match (payload.op, payload.t.as_deref()) {
                    (OP_DISPATCH, Some("READY")) => return Ok(payload),
                    (OP_INVALID_SESSION, _) => bail!("gateway rejected the identify"),
                    _ => {}
                }
            }
        })
        .await
        .context("timed out waiting for gateway READY")??;

        let self_id = ready
            .d
            .pointer("/user/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        *self.user_id.lock().unwrap_or_else(|e| e.into_inner()) = self_id.clone();

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let connected = self.connected.clone();
        connected.store(true, Ordering::SeqCst);
        let provider = self.id.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut seq = ready.s;
            let mut ticker = tokio::time::interval(Duration::from_millis(interval.max(1)));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    _ = ticker.tick() => {
                        if sink.send(heartbeat(seq)).await.is_err() {
                            break;
                        }
                    }
                    payload = next_payload(&mut stream) => {
                        let payload = match payload {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(provider = %provider, error = %e, "Discord gateway lost");
                                break;
                            }
                        };
                        if payload.s.is_some() {
                            seq = payload.s;
                        }
                        match payload.op {
                            OP_DISPATCH if payload.t.as_deref() == Some("MESSAGE_CREATE") => {
                                if let Some(msg) = message_from_dispatch(&payload.d, self_id.as_deref()) {
                                    if in_tx.send(msg).is_err() {
                                        break;
                                    }
                                }
                            }
                            OP_HEARTBEAT => {
                                if sink.send(heartbeat(seq)).await.is_err() {
                                    break;
                                }
                            }
                            OP_RECONNECT | OP_INVALID_SESSION => {
                                info!(provider = %provider, op = payload.op, "gateway asked us to reconnect");
                                break;
                            }
                            _ => {}
                        }
                    }
                }
            }
            connected.store(false, Ordering::SeqCst);
            debug!(provider = %provider, "Discord gateway session ended");
        });

        info!(provider = %self.id, "Discord gateway ready");
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(GatewaySession { cancel, task });
        Ok(in_rx)
    }

    async fn disconnect(&self) {
        let session = self.session.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.connected.store(false, Ordering::SeqCst);
        if let Some(session) = session {
            session.cancel.cancel();
            let mut task = session.task;
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
    }

    async fn join(&self, _channel: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        if !self.connected() {
            bail!("Discord provider '{}' is not connected", self.id);
        }
        let url = format!(
            "{}/channels/{}/messages",
            self.config.api_base.trim_end_matches('/'),
            channel
        );
        self.http
            .post(&url)
            .header("Authorization", format!("Bot {}", self.config.token))
            .json(&json!({ "content": truncate(text) }))
            .send()
            .await
            .with_context(|| format!("failed to post to Discord channel {}", channel))?
            .error_for_status()
            .with_context(|| format!("Discord rejected message to channel {}", channel))?;
        Ok(())
    }
}
