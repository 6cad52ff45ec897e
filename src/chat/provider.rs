use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message as a provider saw it, before the bridge maps it to a logical channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    /// Native channel id. For private messages this is whatever the provider
    /// needs to reply (a nick on IRC, a DM channel id on Discord).
    pub channel: String,
    pub author: String,
    pub text: String,
    pub private: bool,
}

/// One connection to one chat backend.
///
/// `connect` hands back the receive side of the provider's inbound queue.
/// The provider closes that queue when the connection drops, which is how
/// the bridge learns it must reconnect.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Marker that addresses the bot, known once connected.
    fn bot_mention(&self) -> Option<String>;

    fn connected(&self) -> bool;

    async fn connect(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ProviderMessage>>;

    async fn disconnect(&self);

    /// Start receiving messages from a native channel. Providers that see
    /// every channel they have access to treat this as a no-op.
    async fn join(&self, channel: &str) -> anyhow::Result<()>;

    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()>;
}
