use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WardenConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceConfig>,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Daily rolling log files written by `warden run`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Defaults to `<state_dir>/logs`.
    #[serde(default)]
    pub directory: Option<String>,
    #[serde(default)]
    pub disable: bool,
    /// Minimum level written to the files.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            disable: false,
            level: default_log_level(),
        }
    }
}

fn default_state_dir() -> String {
    ".warden".to_string()
}

fn default_job_concurrency() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_topic_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    #[serde(default = "default_job_concurrency")]
    pub job_concurrency: usize,
    #[serde(default = "default_true")]
    pub reattach: bool,
    /// Refuse to claim a port something else on the host is bound to.
    #[serde(default = "default_true")]
    pub verify_ports: bool,
    #[serde(default = "default_topic_host")]
    pub topic_host: String,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            job_concurrency: default_job_concurrency(),
            reattach: true,
            verify_ports: true,
            topic_host: default_topic_host(),
            watchdog: WatchdogConfig::default(),
        }
    }
}

fn default_probe_interval_ms() -> u64 {
    1000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_restart_ceiling() -> u32 {
    5
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30000
}

fn default_topic_timeout_ms() -> u64 {
    crate::topic::DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_swap_grace_secs() -> u64 {
    10
}

fn default_deploy_probe_attempts() -> u32 {
    10
}

fn default_startup_settle_ms() -> u64 {
    250
}

fn default_terminate_grace_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct WatchdogConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_restart_ceiling")]
    pub restart_ceiling: u32,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_topic_timeout_ms")]
    pub topic_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_swap_grace_secs")]
    pub swap_grace_secs: u64,
    #[serde(default = "default_deploy_probe_attempts")]
    pub deploy_probe_attempts: u32,
    #[serde(default = "default_startup_settle_ms")]
    pub startup_settle_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: default_probe_interval_ms(),
            failure_threshold: default_failure_threshold(),
            restart_ceiling: default_restart_ceiling(),
            restart_window_secs: default_restart_window_secs(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            topic_timeout_ms: default_topic_timeout_ms(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            swap_grace_secs: default_swap_grace_secs(),
            deploy_probe_attempts: default_deploy_probe_attempts(),
            startup_settle_ms: default_startup_settle_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
        }
    }
}

/// Per-instance watchdog overrides; unset fields inherit `[engine.watchdog]`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct WatchdogOverrides {
    pub probe_interval_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub restart_ceiling: Option<u32>,
    pub restart_window_secs: Option<u64>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub topic_timeout_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub swap_grace_secs: Option<u64>,
    pub deploy_probe_attempts: Option<u32>,
    pub startup_settle_ms: Option<u64>,
    pub terminate_grace_ms: Option<u64>,
}

impl WatchdogConfig {
    pub fn merged(&self, overrides: Option<&WatchdogOverrides>) -> WatchdogConfig {
        let Some(o) = overrides else {
            return self.clone();
        };
        WatchdogConfig {
            probe_interval_ms: o.probe_interval_ms.unwrap_or(self.probe_interval_ms),
            failure_threshold: o.failure_threshold.unwrap_or(self.failure_threshold),
            restart_ceiling: o.restart_ceiling.unwrap_or(self.restart_ceiling),
            restart_window_secs: o.restart_window_secs.unwrap_or(self.restart_window_secs),
            initial_backoff_ms: o.initial_backoff_ms.unwrap_or(self.initial_backoff_ms),
            max_backoff_ms: o.max_backoff_ms.unwrap_or(self.max_backoff_ms),
            topic_timeout_ms: o.topic_timeout_ms.unwrap_or(self.topic_timeout_ms),
            shutdown_grace_secs: o.shutdown_grace_secs.unwrap_or(self.shutdown_grace_secs),
            swap_grace_secs: o.swap_grace_secs.unwrap_or(self.swap_grace_secs),
            deploy_probe_attempts: o
                .deploy_probe_attempts
                .unwrap_or(self.deploy_probe_attempts),
            startup_settle_ms: o.startup_settle_ms.unwrap_or(self.startup_settle_ms),
            terminate_grace_ms: o.terminate_grace_ms.unwrap_or(self.terminate_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InstanceConfig {
    /// Initial compiled artifact, relative to the config file's directory.
    pub artifact: String,
    /// Executable that runs the artifact. When absent the artifact itself is executed.
    #[serde(default)]
    pub runner: Option<String>,
    /// Supports `{artifact}`, `{port}` and `{instance}` placeholders.
    #[serde(default)]
    pub args: Vec<String>,
    /// Active/Staged port pair.
    pub ports: [u16; 2],
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub artifacts_dir: Option<String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub high_priority: bool,
    #[serde(default)]
    pub capture_output: bool,
    #[serde(default)]
    pub chat_channels: Vec<String>,
    #[serde(default)]
    pub watchdog: Option<WatchdogOverrides>,
}

fn default_reconnect_min_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    60000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ChatConfig {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub channels: Vec<ChatChannelConfig>,
    #[serde(default = "default_reconnect_min_ms")]
    pub reconnect_min_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            providers: BTreeMap::new(),
            channels: Vec::new(),
            reconnect_min_ms: default_reconnect_min_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Irc(IrcConfig),
    Discord(DiscordConfig),
}

fn default_irc_realname() -> String {
    "warden".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct IrcConfig {
    /// `host:port`
    pub server: String,
    pub nickname: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_irc_realname")]
    pub realname: String,
}

fn default_discord_gateway() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".to_string()
}

fn default_discord_api() -> String {
    "https://discord.com/api/v10".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct DiscordConfig {
    pub token: String,
    #[serde(default = "default_discord_gateway")]
    pub gateway_url: String,
    #[serde(default = "default_discord_api")]
    pub api_base: String,
}

/// One logical chat destination and the native channel it maps to on each provider.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChatChannelConfig {
    #[serde(alias = "logicalChannelId")]
    pub id: String,
    #[serde(default, alias = "providerChannelIds")]
    pub providers: BTreeMap<String, String>,
    #[serde(default, alias = "isAdminChannel")]
    pub admin: bool,
    #[serde(default, alias = "isWatchdogChannel")]
    pub watchdog: bool,
}
