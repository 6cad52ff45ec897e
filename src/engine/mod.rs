//! The instance orchestration engine: one watchdog per configured instance,
//! a shared job manager and a shared chat bridge, behind a single control
//! surface.

pub mod artifacts;
pub mod commands;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::chat::{providers_from_config, ChatBridge, ChatProvider, CommandHandler};
use crate::config::model::{EngineConfig, InstanceConfig, WardenConfig};
use crate::config::{resolve_path, LoadedConfig};
use crate::events::{EventBus, LifecycleEvent};
use crate::jobs::{FileJobStore, Job, JobError, JobId, JobManager, JobStatus, JobStore};
use crate::ports::PortAllocator;
use crate::state::SessionRecord;
use crate::topic::TopicClient;
use crate::watchdog::link::{SessionLink, TopicLink};
use crate::watchdog::policy::WatchdogSettings;
use crate::watchdog::session::LaunchPlan;
use crate::watchdog::{Watchdog, WatchdogError, WatchdogOptions, WatchdogStatus};

use self::artifacts::{ArtifactResolver, DirectoryResolver};
use self::commands::BuiltinCommands;

/// How long shutdown waits for in-flight jobs to notice cancellation.
const JOB_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no instance named '{0}'")]
    UnknownInstance(String),
    #[error("instance '{0}' already exists")]
    DuplicateInstance(String),
    #[error("invalid instance '{instance}': {reason}")]
    InvalidInstance { instance: String, reason: String },
    #[error("cannot resolve artifact '{request}' for '{instance}': {source:#}")]
    Artifact {
        instance: String,
        request: String,
        source: anyhow::Error,
    },
    #[error("failed to prepare state directory {}: {source}", path.display())]
    StateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    #[error(transparent)]
    Jobs(#[from] JobError),
}

/// Collaborators the engine is built with.
pub struct EngineDeps {
    pub job_store: Arc<dyn JobStore>,
    pub artifacts: Arc<dyn ArtifactResolver>,
    pub providers: Vec<Arc<dyn ChatProvider>>,
    /// Receives chat commands; the built-in `status`/`version` handler when `None`.
    pub command_handler: Option<Arc<dyn CommandHandler>>,
    pub link: Arc<dyn SessionLink>,
}

impl EngineDeps {
    /// File-backed job store, directory artifact resolver, configured chat
    /// providers and the UDP topic link.
    pub fn from_config(loaded: &LoadedConfig) -> Self {
        let config = &loaded.config;
        Self {
            job_store: Arc::new(FileJobStore::new(&loaded.state_dir())),
            artifacts: Arc::new(DirectoryResolver::from_config(config, &loaded.base_dir)),
            providers: providers_from_config(&config.chat),
            command_handler: None,
            link: Arc::new(TopicLink::new(TopicClient::new(
                config.engine.topic_host.clone(),
            ))),
        }
    }
}

struct Instance {
    config: InstanceConfig,
    watchdog: Watchdog,
}

struct Inner {
    settings: EngineConfig,
    base_dir: PathBuf,
    state_dir: PathBuf,
    instances: RwLock<BTreeMap<String, Arc<Instance>>>,
    allocator: PortAllocator,
    events: EventBus,
    jobs: JobManager,
    chat: ChatBridge,
    artifacts: Arc<dyn ArtifactResolver>,
    link: Arc<dyn SessionLink>,
    pending_providers: Mutex<Vec<Arc<dyn ChatProvider>>>,
    command_handler: Option<Arc<dyn CommandHandler>>,
    started: AtomicBool,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Build the engine and its instances without starting anything. Jobs
    /// left unfinished by a previous run are reconciled here. Must be
    /// called within a tokio runtime.
    pub fn new(config: WardenConfig, base_dir: &Path, deps: EngineDeps) -> Result<Self, EngineError> {
        let state_dir = resolve_path(base_dir, &config.engine.state_dir);
        std::fs::create_dir_all(&state_dir).map_err(|source| EngineError::StateDir {
            path: state_dir.clone(),
            source,
        })?;

        let events = EventBus::default();
        let jobs = JobManager::open(deps.job_store, config.engine.job_concurrency, events.clone())?;
        let chat = ChatBridge::from_config(&config.chat);

        let engine = Self {
            inner: Arc::new(Inner {
                allocator: PortAllocator::new(config.engine.verify_ports),
                settings: config.engine.clone(),
                base_dir: base_dir.to_path_buf(),
                state_dir,
                instances: RwLock::new(BTreeMap::new()),
                events,
                jobs,
                chat,
                artifacts: deps.artifacts,
                link: deps.link,
                pending_providers: Mutex::new(deps.providers),
                command_handler: deps.command_handler,
                started: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };
        for (id, cfg) in config.instances {
            engine.add_instance(&id, cfg)?;
        }
        Ok(engine)
    }

    pub fn state_dir(&self) -> &Path {
        &self.inner.state_dir
    }

    pub fn chat(&self) -> &ChatBridge {
        &self.inner.chat
    }

    pub fn jobs(&self) -> &JobManager {
        &self.inner.jobs
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub fn instances(&self) -> Vec<String> {
        self.read_instances().keys().cloned().collect()
    }

    fn read_instances(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<Instance>>> {
        self.inner.instances.read().unwrap_or_else(|e| e.into_inner())
    }

    fn instance(&self, id: &str) -> Result<Arc<Instance>, EngineError> {
        self.read_instances()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    pub fn watchdog(&self, id: &str) -> Result<Watchdog, EngineError> {
        Ok(self.instance(id)?.watchdog.clone())
    }

    pub fn instance_status(&self, id: &str) -> Result<WatchdogStatus, EngineError> {
        Ok(self.instance(id)?.watchdog.status())
    }

    pub fn add_instance(&self, id: &str, config: InstanceConfig) -> Result<(), EngineError> {
        let mut instances = self.inner.instances.write().unwrap_or_else(|e| e.into_inner());
        if instances.contains_key(id) {
            return Err(EngineError::DuplicateInstance(id.to_string()));
        }
        let invalid = |reason: String| EngineError::InvalidInstance {
            instance: id.to_string(),
            reason,
        };
        if config.artifact.trim().is_empty() {
            return Err(invalid("artifact is empty".to_string()));
        }
        if config.ports[0] == config.ports[1] {
            return Err(invalid(format!("port {} is used for both sessions", config.ports[0])));
        }
        for (other, inst) in instances.iter() {
            if let Some(port) = config.ports.iter().find(|p| inst.config.ports.contains(*p)) {
                return Err(invalid(format!("port {} is already used by '{}'", port, other)));
            }
        }

        let merged = self
            .inner
            .settings
            .watchdog
            .merged(config.watchdog.as_ref());
        let watchdog = Watchdog::new(WatchdogOptions {
            instance: id.to_string(),
            plan: LaunchPlan::from_config(&config, &self.inner.base_dir),
            settings: WatchdogSettings::from_config(&merged),
            ports: config.ports,
            allocator: self.inner.allocator.clone(),
            link: self.inner.link.clone(),
            events: self.inner.events.clone(),
            state_dir: Some(self.inner.state_dir.clone()),
        });
        debug!(instance = %id, ports = ?config.ports, "instance added");
        instances.insert(id.to_string(), Arc::new(Instance { config, watchdog }));
        Ok(())
    }

    /// Stop an instance, cancel its jobs and forget it.
    pub async fn remove_instance(&self, id: &str) -> Result<(), EngineError> {
        self.stop_instance(id).await?;
        self.inner
            .instances
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        info!(instance = %id, "instance removed");
        Ok(())
    }

    /// Start with `artifact`, or with the artifact the instance last ran,
    /// or with its configured artifact.
    pub async fn start_instance(&self, id: &str, artifact: Option<PathBuf>) -> Result<(), EngineError> {
        let inst = self.instance(id)?;
        let artifact = artifact
            .or_else(|| inst.watchdog.current_artifact())
            .unwrap_or_else(|| resolve_path(&self.inner.base_dir, &inst.config.artifact));
        inst.watchdog.start(artifact).await?;
        Ok(())
    }

    /// Cancel the instance's jobs, then stop its watchdog.
    pub async fn stop_instance(&self, id: &str) -> Result<(), EngineError> {
        let inst = self.instance(id)?;
        let cancelled = self.inner.jobs.cancel_instance(id);
        if !cancelled.is_empty() {
            info!(instance = %id, jobs = ?cancelled, "cancelled jobs of stopping instance");
        }
        let grace = inst.watchdog.settings().shutdown_grace;
        inst.watchdog.stop(grace).await?;
        Ok(())
    }

    /// Resolve `request` to an artifact and swap it in.
    pub async fn deploy(&self, id: &str, request: &str) -> Result<PathBuf, EngineError> {
        let inst = self.instance(id)?;
        let artifact = self
            .inner
            .artifacts
            .resolve(id, request)
            .map_err(|source| EngineError::Artifact {
                instance: id.to_string(),
                request: request.to_string(),
                source,
            })?;
        inst.watchdog.deploy(artifact.clone()).await?;
        Ok(artifact)
    }

    /// Run a deploy as a tracked job of kind `deploy`.
    pub fn deploy_job(&self, id: &str, request: &str) -> Result<JobId, EngineError> {
        let engine = self.clone();
        let instance = id.to_string();
        let request = request.to_string();
        self.submit_job(id, "deploy", move |ctx| async move {
            ctx.checkpoint()?;
            let artifact = engine.deploy(&instance, &request).await?;
            debug!(job = ctx.id(), artifact = %artifact.display(), "deploy job finished");
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn submit_job<F, Fut>(&self, instance: &str, kind: &str, work: F) -> Result<JobId, EngineError>
    where
        F: FnOnce(crate::jobs::JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.instance(instance)?;
        Ok(self.inner.jobs.submit(instance, kind, work)?)
    }

    pub fn cancel_job(&self, id: JobId) -> Result<JobStatus, EngineError> {
        Ok(self.inner.jobs.cancel(id)?)
    }

    pub fn job_status(&self, id: JobId) -> Result<Job, EngineError> {
        Ok(self.inner.jobs.get(id)?)
    }

    pub fn list_jobs(&self, instance: Option<&str>) -> Vec<Job> {
        self.inner.jobs.list(instance)
    }

    // -----------------------------------------------------------------------
    // Run / shutdown
    // -----------------------------------------------------------------------

    /// Connect chat, start relaying events, then reattach or autostart
    /// instances. Calling it twice does nothing.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let chat = &self.inner.chat;
        let providers = std::mem::take(
            &mut *self
                .inner
                .pending_providers
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for provider in providers {
            if let Err(e) = chat.register_provider(provider) {
                warn!(error = %e, "skipping chat provider");
            }
        }

        let events = self.subscribe();
        self.inner
            .tracker
            .spawn(relay(self.clone(), events, self.inner.cancel.clone()));

        if let Some(inbound) = chat.take_inbound() {
            let handler = self
                .inner
                .command_handler
                .clone()
                .unwrap_or_else(|| Arc::new(BuiltinCommands::new(self)) as Arc<dyn CommandHandler>);
            let chat = chat.clone();
            let cancel = self.inner.cancel.clone();
            self.inner.tracker.spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = chat.route_commands(inbound, handler) => {}
                }
            });
        }

        let instances: Vec<(String, Arc<Instance>)> = self
            .read_instances()
            .iter()
            .map(|(id, inst)| (id.clone(), inst.clone()))
            .collect();
        for (id, inst) in instances {
            if self.inner.settings.reattach {
                if let Some(record) = SessionRecord::load(&self.inner.state_dir, &id) {
                    match inst.watchdog.adopt(&record).await {
                        Ok(true) => continue,
                        Ok(false) => {}
                        Err(e) => warn!(instance = %id, error = %e, "failed to reattach"),
                    }
                }
            }
            if inst.config.autostart {
                if let Err(e) = self.start_instance(&id, None).await {
                    warn!(instance = %id, error = %e, "autostart failed");
                }
            }
        }
        info!(instances = self.read_instances().len(), "engine started");
    }

    /// Start, wait for `shutdown`, then shut down.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.start().await;
        shutdown.cancelled().await;
        self.shutdown().await;
    }

    /// Detach from (with `reattach`) or stop every instance, drain jobs and
    /// disconnect chat.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        let instances: Vec<Arc<Instance>> = self.read_instances().values().cloned().collect();
        let reattach = self.inner.settings.reattach;
        join_all(instances.iter().map(|inst| async move {
            if reattach {
                inst.watchdog.detach().await;
            } else {
                let grace = inst.watchdog.settings().shutdown_grace;
                if let Err(e) = inst.watchdog.stop(grace).await {
                    warn!(instance = %inst.watchdog.instance(), error = %e, "stop failed during shutdown");
                }
            }
        }))
        .await;

        self.inner.jobs.shutdown(JOB_DRAIN_TIMEOUT).await;
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.chat.shutdown().await;
        info!("engine stopped");
    }

    async fn relay_event(&self, event: &LifecycleEvent) {
        let Some(text) = event.render() else {
            return;
        };
        let channels = self
            .instance(event.instance())
            .map(|inst| inst.config.chat_channels.clone())
            .unwrap_or_default();
        let chat = &self.inner.chat;
        if channels.is_empty() {
            chat.broadcast_watchdog(&text).await;
        } else {
            chat.broadcast_all(&channels, &text).await;
        }
        if matches!(event, LifecycleEvent::InstanceOffline { fatal: true, .. }) {
            chat.broadcast_admin(&text).await;
        }
    }
}

async fn relay(engine: Engine, mut events: broadcast::Receiver<LifecycleEvent>, cancel: CancellationToken) {
    loop {
        // Events already emitted are relayed before the cancellation is seen.
        let event = tokio::select! {
            biased;
            event = events.recv() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Ok(event) => engine.relay_event(&event).await,
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event relay fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::jobs::MemoryJobStore;
    use crate::topic::{TopicError, TopicReply};
    use async_trait::async_trait;
    use tempfile::TempDir;

    pub(crate) struct SilentLink;

    #[async_trait]
    impl SessionLink for SilentLink {
        async fn probe(&self, _port: u16, timeout: Duration) -> Result<TopicReply, TopicError> {
            Err(TopicError::Timeout {
                endpoint: "test".to_string(),
                timeout,
            })
        }
        async fn request_shutdown(&self, _port: u16, _timeout: Duration) -> Result<(), TopicError> {
            Ok(())
        }
        async fn announce_swap(
            &self,
            _port: u16,
            _new_port: u16,
            _grace: Duration,
            _timeout: Duration,
        ) -> Result<(), TopicError> {
            Ok(())
        }
    }

    pub(crate) fn deps() -> EngineDeps {
        EngineDeps {
            job_store: Arc::new(MemoryJobStore::default()),
            artifacts: Arc::new(DirectoryResolver::default()),
            providers: Vec::new(),
            command_handler: None,
            link: Arc::new(SilentLink),
        }
    }

    pub(crate) fn config(tmp: &TempDir) -> WardenConfig {
        let source = format!(
            r#"
            [engine]
            state_dir = "{}"
            verify_ports = false

            [instances.main]
            artifact = "game.dmb"
            ports = [41101, 41102]

            [instances.test]
            artifact = "game.dmb"
            ports = [41103, 41104]
            "#,
            tmp.path().join("state").display()
        );
        toml::from_str(&source).unwrap()
    }

    pub(crate) fn test_engine() -> (TempDir, Engine) {
        let tmp = TempDir::new().unwrap();
        let engine = Engine::new(config(&tmp), tmp.path(), deps()).unwrap();
        (tmp, engine)
    }
}
