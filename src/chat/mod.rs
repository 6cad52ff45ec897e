//! Routes messages between logical channels and the chat providers serving them.

pub mod channels;
pub mod discord;
pub mod irc;
pub mod provider;

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use futures_util::future::join_all;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::model::{ChatChannelConfig, ChatConfig, ProviderConfig};

pub use channels::ChannelMap;
pub use discord::DiscordProvider;
pub use irc::IrcProvider;
pub use provider::{ChatProvider, ProviderMessage};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no chat channel named '{0}'")]
    UnknownChannel(String),
    #[error("no chat provider named '{0}'")]
    UnknownProvider(String),
    #[error("chat provider '{0}' is already registered")]
    DuplicateProvider(String),
    #[error("chat provider '{0}' is disconnected")]
    Disconnected(String),
    #[error("chat provider '{provider}' failed: {source:#}")]
    Transport {
        provider: String,
        source: anyhow::Error,
    },
}

/// An inbound message after channel mapping and command detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub provider: String,
    /// Native channel to reply to.
    pub channel: String,
    /// `None` for private messages and unmapped channels.
    pub logical_channel: Option<String>,
    pub author: String,
    pub text: String,
    pub private: bool,
    /// Text with the mention marker stripped, when the message addresses the bot.
    pub command: Option<String>,
}

impl Message {
    pub fn is_command(&self) -> bool {
        self.command.is_some()
    }
}

/// Receives messages tagged as commands. Returning text sends it back to
/// the channel the command came from.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Option<String>;
}

/// Recognise text addressed to the bot. Private messages are always commands.
pub fn command_text(text: &str, mention: Option<&str>, private: bool) -> Option<String> {
    let trimmed = text.trim_start();
    if let Some(mention) = mention.filter(|m| !m.is_empty()) {
        // The name must end there: "@wardenbot" is not "@warden".
        let addressed = trimmed
            .get(..mention.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(mention))
            && trimmed[mention.len()..]
                .chars()
                .next()
                .map_or(true, |c| c.is_whitespace() || c == ':' || c == ',');
        if addressed {
            let rest = trimmed[mention.len()..]
                .trim_start_matches([':', ','])
                .trim();
            return Some(rest.to_string());
        }
    }
    if private {
        Some(trimmed.trim_end().to_string())
    } else {
        None
    }
}

/// Instantiate the providers named in configuration.
pub fn providers_from_config(config: &ChatConfig) -> Vec<Arc<dyn ChatProvider>> {
    config
        .providers
        .iter()
        .map(|(id, provider)| -> Arc<dyn ChatProvider> {
            match provider {
                ProviderConfig::Irc(cfg) => Arc::new(IrcProvider::new(id.clone(), cfg.clone())),
                ProviderConfig::Discord(cfg) => {
                    Arc::new(DiscordProvider::new(id.clone(), cfg.clone()))
                }
            }
        })
        .collect()
}

struct ProviderEntry {
    provider: Arc<dyn ChatProvider>,
    cancel: CancellationToken,
}

struct Inner {
    providers: DashMap<String, ProviderEntry>,
    channels: RwLock<ChannelMap>,
    inbound_tx: mpsc::UnboundedSender<Message>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    reconnect_min: Duration,
    reconnect_max: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// Shared by every instance that reports through chat.
#[derive(Clone)]
pub struct ChatBridge {
    inner: Arc<Inner>,
}

impl ChatBridge {
    pub fn new(channels: &[ChatChannelConfig], reconnect_min: Duration, reconnect_max: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                providers: DashMap::new(),
                channels: RwLock::new(ChannelMap::from_configs(channels)),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                reconnect_min,
                reconnect_max: reconnect_max.max(reconnect_min),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn from_config(config: &ChatConfig) -> Self {
        Self::new(
            &config.channels,
            Duration::from_millis(config.reconnect_min_ms),
            Duration::from_millis(config.reconnect_max_ms),
        )
    }

    fn channels(&self) -> ChannelMap {
        self.inner
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.providers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, provider: &str) -> bool {
        self.inner
            .providers
            .get(provider)
            .is_some_and(|e| e.provider.connected())
    }

    /// Start keeping `provider` connected. Must be called within a tokio runtime.
    pub fn register_provider(&self, provider: Arc<dyn ChatProvider>) -> Result<(), ChatError> {
        let id = provider.id().to_string();
        let cancel = self.inner.shutdown.child_token();
        match self.inner.providers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ChatError::DuplicateProvider(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ProviderEntry {
                    provider: provider.clone(),
                    cancel: cancel.clone(),
                });
            }
        }
        info!(provider = %id, "chat provider registered");
        self.inner
            .tracker
            .spawn(pump(self.inner.clone(), provider, cancel));
        Ok(())
    }

    pub async fn unregister_provider(&self, id: &str) -> Result<(), ChatError> {
        let (_, entry) = self
            .inner
            .providers
            .remove(id)
            .ok_or_else(|| ChatError::UnknownProvider(id.to_string()))?;
        entry.cancel.cancel();
        entry.provider.disconnect().await;
        info!(provider = %id, "chat provider unregistered");
        Ok(())
    }

    /// Replace the channel mapping and join any newly mapped native channels.
    pub async fn set_channels(&self, configs: &[ChatChannelConfig]) {
        let map = ChannelMap::from_configs(configs);
        let old = std::mem::replace(
            &mut *self.inner.channels.write().unwrap_or_else(|e| e.into_inner()),
            map.clone(),
        );
        let providers: Vec<Arc<dyn ChatProvider>> = self
            .inner
            .providers
            .iter()
            .map(|e| e.provider.clone())
            .collect();
        for provider in providers {
            if !provider.connected() {
                continue;
            }
            let known = old.natives_for(provider.id());
            for native in map.natives_for(provider.id()) {
                if known.contains(&native) {
                    continue;
                }
                if let Err(e) = provider.join(&native).await {
                    warn!(provider = %provider.id(), channel = %native, error = %e, "failed to join chat channel");
                }
            }
        }
    }

    /// The merged inbound stream. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<UnboundedReceiverStream<Message>> {
        self.inner
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(UnboundedReceiverStream::new)
    }

    /// Send to every provider serving `logical`. Returns how many deliveries
    /// succeeded; per-provider failures are logged.
    pub async fn broadcast(&self, logical: &str, text: &str) -> Result<usize, ChatError> {
        let targets = self
            .channels()
            .targets(logical)
            .ok_or_else(|| ChatError::UnknownChannel(logical.to_string()))?;
        let sends = targets.iter().map(|(provider, native)| async move {
            match self.send_to(provider, native, text).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(channel = %logical, error = %e, "chat delivery dropped");
                    false
                }
            }
        });
        Ok(join_all(sends).await.into_iter().filter(|ok| *ok).count())
    }

    pub async fn broadcast_watchdog(&self, text: &str) -> usize {
        let channels = self.channels().watchdog_channels();
        self.broadcast_all(&channels, text).await
    }

    pub async fn broadcast_admin(&self, text: &str) -> usize {
        let channels = self.channels().admin_channels();
        self.broadcast_all(&channels, text).await
    }

    /// Broadcast to several logical channels, skipping unknown ones.
    pub async fn broadcast_all(&self, logical: &[String], text: &str) -> usize {
        let mut delivered = 0;
        for channel in logical {
            match self.broadcast(channel, text).await {
                Ok(n) => delivered += n,
                Err(e) => debug!(error = %e, "skipping chat channel"),
            }
        }
        delivered
    }

    pub async fn send_to(&self, provider: &str, channel: &str, text: &str) -> Result<(), ChatError> {
        let target = self
            .inner
            .providers
            .get(provider)
            .map(|e| e.provider.clone())
            .ok_or_else(|| ChatError::UnknownProvider(provider.to_string()))?;
        if !target.connected() {
            return Err(ChatError::Disconnected(provider.to_string()));
        }
        target
            .send(channel, text)
            .await
            .map_err(|source| ChatError::Transport {
                provider: provider.to_string(),
                source,
            })
    }

    /// Deliver command-tagged messages from `inbound` to `handler` and send
    /// replies back where they came from. Returns when the stream ends.
    pub async fn route_commands(
        &self,
        mut inbound: UnboundedReceiverStream<Message>,
        handler: Arc<dyn CommandHandler>,
    ) {
        while let Some(message) = inbound.next().await {
            if !message.is_command() {
                continue;
            }
            debug!(provider = %message.provider, author = %message.author, "chat command");
            if let Some(reply) = handler.handle(&message).await {
                if let Err(e) = self.send_to(&message.provider, &message.channel, &reply).await {
                    warn!(error = %e, "failed to reply to chat command");
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn tag(&self, provider: &dyn ChatProvider, msg: ProviderMessage) -> Message {
        let logical = self
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .logical_for(provider.id(), &msg.channel)
            .map(str::to_string);
        let private = msg.private || logical.is_none();
        let command = command_text(&msg.text, provider.bot_mention().as_deref(), private);
        Message {
            provider: provider.id().to_string(),
            channel: msg.channel,
            logical_channel: logical,
            author: msg.author,
            text: msg.text,
            private,
            command,
        }
    }
}

/// Keep one provider connected and forward what it receives.
async fn pump(inner: Arc<Inner>, provider: Arc<dyn ChatProvider>, cancel: CancellationToken) {
    let id = provider.id().to_string();
    loop {
        let connect = (|| async { provider.connect().await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(inner.reconnect_min)
                    .with_max_delay(inner.reconnect_max)
                    .with_max_times(usize::MAX)
                    .with_jitter(),
            )
            .notify(|err: &anyhow::Error, dur: Duration| {
                warn!(provider = %id, error = %err, "chat connect failed, retrying in {:?}", dur);
            });
        let mut rx = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connect => match result {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(provider = %id, error = %e, "chat provider gave up connecting");
                    tokio::time::sleep(inner.reconnect_max).await;
                    continue;
                }
            },
        };

        let natives = inner
            .channels
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .natives_for(&id);
        for native in natives {
            if let Err(e) = provider.join(&native).await {
                warn!(provider = %id, channel = %native, error = %e, "failed to join chat channel");
            }
        }
        info!(provider = %id, "chat provider connected");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    provider.disconnect().await;
                    return;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => {
                        let message = inner.tag(provider.as_ref(), msg);
                        if inner.inbound_tx.send(message).is_err() {
                            debug!(provider = %id, "inbound stream dropped");
                        }
                    }
                    None => break,
                },
            }
        }
        warn!(provider = %id, "chat provider disconnected, reconnecting");
        tokio::time::sleep(inner.reconnect_min).await;
    }
    provider.disconnect().await;
}
