#![allow(dead_code)]
use std::collections::HashSet;
use std::net::{TcpListener, UdpSocket as StdUdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use warden::chat::provider::{ChatProvider, ProviderMessage};
use warden::topic::codec;
use warden::topic::{TopicError, TopicParams, TopicReply};
use warden::watchdog::link::SessionLink;

pub struct TestProject {
    pub dir: TempDir,
    pub config_path: PathBuf,
}

impl TestProject {
    pub fn new(config_toml: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("warden.toml");
        std::fs::write(&config_path, config_toml).unwrap();
        Self { dir, config_path }
    }

    /// Create an empty artifact file relative to the project directory.
    pub fn artifact(&self, relative: &str) -> PathBuf {
        let path = self.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "").unwrap();
        path
    }
}

/// Ports free for both TCP and UDP at the time of the call.
pub fn free_ports(count: usize) -> Vec<u16> {
    let mut held = Vec::new();
    let mut ports = Vec::new();
    while ports.len() < count {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = tcp.local_addr().unwrap().port();
        if let Ok(udp) = StdUdpSocket::bind(("127.0.0.1", port)) {
            ports.push(port);
            held.push((tcp, udp));
        }
    }
    drop(held);
    ports
}

/// Engine section with timings short enough for tests.
pub fn fast_engine_toml(state_dir: &str, reattach: bool) -> String {
    format!(
        r#"
[engine]
state_dir = "{state_dir}"
job_concurrency = 3
reattach = {reattach}
verify_ports = false

[engine.watchdog]
probe_interval_ms = 50
failure_threshold = 2
restart_ceiling = 3
restart_window_secs = 60
initial_backoff_ms = 20
max_backoff_ms = 100
topic_timeout_ms = 100
shutdown_grace_secs = 1
swap_grace_secs = 0
deploy_probe_attempts = 5
startup_settle_ms = 50
terminate_grace_ms = 500
"#
    )
}

pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// -----------------------------------------------------------------------
// Fake game server
// -----------------------------------------------------------------------

/// Answers topic queries on one UDP port the way a game session would.
pub struct FakeGameServer {
    pub port: u16,
    received: Arc<Mutex<Vec<TopicParams>>>,
    silent: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeGameServer {
    pub async fn bind(port: u16) -> Self {
        let socket = UdpSocket::bind(("127.0.0.1", port)).await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let silent = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn({
            let received = received.clone();
            let silent = silent.clone();
            async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                        break;
                    };
                    let Ok(params) = codec::decode_request(&buf[..len]) else {
                        continue;
                    };
                    received.lock().unwrap().push(params);
                    if silent.load(Ordering::SeqCst) {
                        continue;
                    }
                    let mut reply = TopicParams::new();
                    reply.insert("state".into(), "running".into());
                    reply.insert("players".into(), "0".into());
                    let packet = codec::encode_reply(&reply).unwrap();
                    let _ = socket.send_to(&packet, peer).await;
                }
            }
        });
        Self {
            port,
            received,
            silent,
            task,
        }
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<TopicParams> {
        self.received.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter_map(|p| p.get("command").cloned())
            .collect()
    }
}

impl Drop for FakeGameServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// -----------------------------------------------------------------------
// Scripted link
// -----------------------------------------------------------------------

/// Healthy unless the port has been marked down.
#[derive(Default)]
pub struct ScriptedLink {
    down: Mutex<HashSet<u16>>,
    pub shutdowns: Mutex<Vec<u16>>,
    pub swaps: Mutex<Vec<(u16, u16)>>,
}

impl ScriptedLink {
    pub fn set_down(&self, port: u16, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(port);
        } else {
            set.remove(&port);
        }
    }
}

#[async_trait]
impl SessionLink for ScriptedLink {
    async fn probe(&self, port: u16, timeout: Duration) -> Result<TopicReply, TopicError> {
        if self.down.lock().unwrap().contains(&port) {
            return Err(TopicError::Timeout {
                endpoint: format!("127.0.0.1:{}", port),
                timeout,
            });
        }
        Ok(TopicReply {
            params: TopicParams::new(),
            latency: Duration::from_millis(1),
        })
    }

    async fn request_shutdown(&self, port: u16, _timeout: Duration) -> Result<(), TopicError> {
        self.shutdowns.lock().unwrap().push(port);
        Ok(())
    }

    async fn announce_swap(
        &self,
        port: u16,
        new_port: u16,
        _grace: Duration,
        _timeout: Duration,
    ) -> Result<(), TopicError> {
        self.swaps.lock().unwrap().push((port, new_port));
        Ok(())
    }
}

// -----------------------------------------------------------------------
// In-memory chat provider
// -----------------------------------------------------------------------

/// Records everything sent; `inject` delivers an inbound message.
pub struct MemoryProvider {
    id: String,
    connected: AtomicBool,
    inbound: Mutex<Option<mpsc::UnboundedSender<ProviderMessage>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub joined: Mutex<Vec<String>>,
}

impl MemoryProvider {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            connected: AtomicBool::new(false),
            inbound: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
        })
    }

    pub fn inject(&self, channel: &str, author: &str, text: &str) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(ProviderMessage {
                channel: channel.to_string(),
                author: author.to_string(),
                text: text.to_string(),
                private: false,
            });
        }
    }

    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl ChatProvider for MemoryProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn bot_mention(&self) -> Option<String> {
        Some("warden".to_string())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ProviderMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
    }

    async fn join(&self, channel: &str) -> anyhow::Result<()> {
        self.joined.lock().unwrap().push(channel.to_string());
        Ok(())
    }

    async fn send(&self, channel: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((channel.to_string(), text.to_string()));
        Ok(())
    }
}
