//! Per-instance supervisor: keeps one active session alive, probes its
//! health, restarts it on crashes and swaps in staged sessions on deploy.
//!
//! All decisions are made by [`machine::Machine`]; this module only runs
//! the side effects. Shared state lives behind a plain mutex that is never
//! held across an `.await`.

pub mod link;
pub mod machine;
pub mod policy;
pub mod session;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, LifecycleEvent};
use crate::platform;
use crate::ports::{PortAllocator, PortError};
use crate::process::{ProcessError, ProcessHandle};
use crate::state::SessionRecord;

use self::link::{HealthProbeResult, SessionLink};
use self::machine::{Action, Machine, Step, TransitionError, Trigger, WatchdogState};
use self::policy::WatchdogSettings;
use self::session::{LaunchPlan, Session, SessionRole, SessionSummary, SwapRecord};

const MAX_SWAP_HISTORY: usize = 32;

#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("instance '{0}' is already running")]
    AlreadyRunning(String),
    #[error("instance '{0}' has no active session")]
    NoActiveSession(String),
    #[error("instance '{instance}' is {state}: {reason}")]
    InvalidState {
        instance: String,
        state: WatchdogState,
        reason: &'static str,
    },
    #[error(transparent)]
    Spawn(#[from] ProcessError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("deploy failed: {0}")]
    DeployFailed(String),
}

/// Point-in-time view of a watchdog.
#[derive(Debug, Clone, Serialize)]
pub struct WatchdogStatus {
    pub instance: String,
    pub state: WatchdogState,
    pub artifact: Option<PathBuf>,
    pub active: Option<SessionSummary>,
    pub staged: Option<SessionSummary>,
    pub consecutive_failures: u32,
    pub restarts_in_window: usize,
    pub deploying: bool,
    pub last_probe: Option<HealthProbeResult>,
    pub swaps: Vec<SwapRecord>,
}

pub struct WatchdogOptions {
    pub instance: String,
    pub plan: LaunchPlan,
    pub settings: WatchdogSettings,
    /// `[primary, alternate]`; the first start uses the primary port.
    pub ports: [u16; 2],
    pub allocator: PortAllocator,
    pub link: Arc<dyn SessionLink>,
    pub events: EventBus,
    /// Where session records are kept for reattaching; `None` disables them.
    pub state_dir: Option<PathBuf>,
}

struct Inner {
    instance: String,
    plan: LaunchPlan,
    settings: WatchdogSettings,
    ports: [u16; 2],
    allocator: PortAllocator,
    link: Arc<dyn SessionLink>,
    events: EventBus,
    state_dir: Option<PathBuf>,
    next_session: AtomicU64,
    core: Mutex<Core>,
}

struct Core {
    machine: Machine,
    active: Option<Session>,
    staged: Option<Session>,
    active_port: u16,
    artifact: Option<PathBuf>,
    /// Cancelled when the instance stops; scopes the probe loop, exit
    /// watchers, restarts and in-flight deploys.
    monitor: Option<CancellationToken>,
    last_probe: Option<HealthProbeResult>,
    swaps: Vec<SwapRecord>,
    deploying: bool,
    /// Active session that was told to hand over to a staged one. Its exit
    /// and failed probes are expected until the swap completes.
    retiring: Option<u64>,
}

/// Everything a give-up takes out of [`Core`]. The sessions are dropped
/// while the lock is held, so their port leases are free as soon as the
/// fatal state is visible; only the processes are reaped afterwards.
struct Teardown {
    handles: Vec<Arc<ProcessHandle>>,
    monitor: Option<CancellationToken>,
}

impl Core {
    fn fire(
        &mut self,
        trigger: Trigger,
        now: Instant,
    ) -> Result<(Step, Option<Teardown>), TransitionError> {
        let step = self.machine.fire(trigger, now)?;
        let teardown = (step.action == Action::GiveUp).then(|| {
            self.retiring = None;
            let handles = [self.active.take(), self.staged.take()]
                .into_iter()
                .flatten()
                .map(|session| session.handle.clone())
                .collect();
            Teardown {
                handles,
                monitor: self.monitor.take(),
            }
        });
        Ok((step, teardown))
    }

    fn is_retiring(&self, session_id: u64) -> bool {
        self.retiring == Some(session_id)
    }
}

#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("instance", &self.inner.instance)
            .field("state", &self.state())
            .finish()
    }
}

enum Promotion {
    Promoted {
        old: Option<Session>,
        id: u64,
        handle: Arc<ProcessHandle>,
        record: SessionRecord,
    },
    Aborted(Option<Session>),
}

impl Watchdog {
    pub fn new(opts: WatchdogOptions) -> Self {
        let machine = Machine::new(opts.settings.crash.clone());
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    machine,
                    active: None,
                    staged: None,
                    active_port: opts.ports[0],
                    artifact: None,
                    monitor: None,
                    last_probe: None,
                    swaps: Vec::new(),
                    deploying: false,
                    retiring: None,
                }),
                instance: opts.instance,
                plan: opts.plan,
                settings: opts.settings,
                ports: opts.ports,
                allocator: opts.allocator,
                link: opts.link,
                events: opts.events,
                state_dir: opts.state_dir,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> WatchdogState {
        self.core().machine.state()
    }

    /// The artifact the active session runs (or last ran).
    pub fn current_artifact(&self) -> Option<PathBuf> {
        self.core().artifact.clone()
    }

    pub fn status(&self) -> WatchdogStatus {
        let core = self.core();
        WatchdogStatus {
            instance: self.inner.instance.clone(),
            state: core.machine.state(),
            artifact: core.artifact.clone(),
            active: core.active.as_ref().map(Session::summary),
            staged: core.staged.as_ref().map(Session::summary),
            consecutive_failures: core.machine.consecutive_failures(),
            restarts_in_window: core.machine.restarts_in_window(Instant::now()),
            deploying: core.deploying,
            last_probe: core.last_probe.clone(),
            swaps: core.swaps.clone(),
        }
    }

    fn alternate(&self, port: u16) -> u16 {
        if port == self.inner.ports[0] {
            self.inner.ports[1]
        } else {
            self.inner.ports[0]
        }
    }

    fn invalid(&self, state: WatchdogState, reason: &'static str) -> WatchdogError {
        WatchdogError::InvalidState {
            instance: self.inner.instance.clone(),
            state,
            reason,
        }
    }

    // -----------------------------------------------------------------------
    // Start / adopt
    // -----------------------------------------------------------------------

    pub async fn start(&self, artifact: PathBuf) -> Result<(), WatchdogError> {
        {
            let mut core = self.core();
            core.machine
                .fire(Trigger::Start, Instant::now())
                .map_err(|_| WatchdogError::AlreadyRunning(self.inner.instance.clone()))?;
            core.artifact = Some(artifact.clone());
        }
        info!(
            instance = %self.inner.instance,
            artifact = %artifact.display(),
            "starting instance"
        );

        let port = self.inner.ports[0];
        match self.launch(SessionRole::Active, port, &artifact).await {
            Ok(session) => self.activate(session, Trigger::Launched).await,
            Err(e) => {
                let _ = self.core().machine.fire(Trigger::LaunchFailed, Instant::now());
                error!(instance = %self.inner.instance, error = %e, "instance failed to start");
                Err(e)
            }
        }
    }

    /// Take over a session recorded by a previous run. Returns `Ok(false)`
    /// when the recorded process is no longer alive.
    pub async fn adopt(&self, record: &SessionRecord) -> Result<bool, WatchdogError> {
        if !platform::is_process_alive(record.pid) {
            info!(instance = %self.inner.instance, pid = record.pid, "recorded session is gone");
            self.clear_record();
            return Ok(false);
        }
        {
            let mut core = self.core();
            core.machine
                .fire(Trigger::Start, Instant::now())
                .map_err(|_| WatchdogError::AlreadyRunning(self.inner.instance.clone()))?;
            core.artifact = Some(record.artifact.clone());
        }

        let lease = match self.inner.allocator.claim_adopted(record.port, &self.inner.instance) {
            Ok(lease) => lease,
            Err(e) => {
                let _ = self.core().machine.fire(Trigger::LaunchFailed, Instant::now());
                return Err(e.into());
            }
        };
        let handle = Arc::new(
            ProcessHandle::adopt(record.pid, record.launched_at)
                .with_terminate_grace(self.inner.settings.terminate_grace),
        );
        if self.inner.plan.high_priority {
            handle.elevate_priority();
        }
        let session = Session {
            id: self.inner.next_session.fetch_add(1, Ordering::SeqCst),
            role: SessionRole::Active,
            port: record.port,
            artifact: record.artifact.clone(),
            handle,
            _lease: lease,
        };
        info!(
            instance = %self.inner.instance,
            pid = record.pid,
            port = record.port,
            "reattached to running session"
        );
        self.activate(session, Trigger::Launched).await?;
        Ok(true)
    }

    async fn launch(
        &self,
        role: SessionRole,
        port: u16,
        artifact: &Path,
    ) -> Result<Session, WatchdogError> {
        let lease = self.inner.allocator.claim(port, &self.inner.instance)?;
        let spec = self.inner.plan.spec(
            &self.inner.instance,
            artifact,
            port,
            self.inner.settings.startup_settle,
        );
        let handle = Arc::new(
            ProcessHandle::launch(&spec)?.with_terminate_grace(self.inner.settings.terminate_grace),
        );
        if let Err(e) = handle.startup().await {
            if let Ok(output) = handle.read_combined_output() {
                if !output.is_empty() {
                    warn!(instance = %self.inner.instance, port, "session output:\n{}", output.trim_end());
                }
            }
            handle.terminate().await;
            return Err(e.into());
        }
        if self.inner.plan.high_priority {
            handle.elevate_priority();
        }

        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        info!(
            instance = %self.inner.instance,
            session = id,
            pid = handle.pid(),
            port,
            role = ?role,
            "session launched"
        );
        Ok(Session {
            id,
            role,
            port,
            artifact: artifact.to_path_buf(),
            handle,
            _lease: lease,
        })
    }

    /// Install `session` as the active one if the machine accepts `trigger`;
    /// otherwise the session is terminated.
    async fn activate(&self, session: Session, trigger: Trigger) -> Result<(), WatchdogError> {
        let outcome = {
            let mut core = self.core();
            match core.machine.fire(trigger, Instant::now()) {
                Ok(step) if step.action == Action::Monitor => {
                    let fresh = trigger == Trigger::Launched;
                    if fresh {
                        if let Some(old) = core.monitor.replace(CancellationToken::new()) {
                            old.cancel();
                        }
                    }
                    let token = core
                        .monitor
                        .get_or_insert_with(CancellationToken::new)
                        .clone();
                    core.active_port = session.port;
                    let watched = (
                        session.id,
                        session.handle.clone(),
                        session.port,
                        session.record(&self.inner.instance),
                    );
                    core.active = Some(session);
                    Ok((token, fresh, watched))
                }
                Ok(step) => Err((session, step.to)),
                Err(e) => Err((session, e.state)),
            }
        };

        match outcome {
            Ok((token, fresh, (id, handle, port, record))) => {
                if fresh {
                    tokio::spawn(self.clone().probe_loop(token.clone()));
                }
                tokio::spawn(self.clone().watch_exit(id, handle, token));
                self.persist(&record);
                info!(instance = %self.inner.instance, port, "instance online");
                self.inner.events.emit(LifecycleEvent::InstanceOnline {
                    instance: self.inner.instance.clone(),
                    port,
                });
                Ok(())
            }
            Err((session, state)) => {
                debug!(instance = %self.inner.instance, %state, "discarding session launched during state change");
                session.handle.terminate().await;
                Err(self.invalid(state, "the instance changed state while the session launched"))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    async fn probe_loop(self, token: CancellationToken) {
        let settings = &self.inner.settings;
        let mut ticker = tokio::time::interval(settings.probe_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let target = {
                let core = self.core();
                if core.machine.state().is_running() {
                    core.active
                        .as_ref()
                        .filter(|s| !core.is_retiring(s.id))
                        .map(|s| (s.id, s.port))
                } else {
                    None
                }
            };
            let Some((session_id, port)) = target else {
                continue;
            };

            let started = Instant::now();
            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.inner.link.probe(port, settings.topic_timeout) => result,
            };
            let probe = match &result {
                Ok(reply) => HealthProbeResult::from_reply(reply),
                Err(e) => HealthProbeResult::from_error(e, started.elapsed()),
            };
            let trigger = if probe.success {
                Trigger::ProbeSucceeded
            } else {
                Trigger::ProbeFailed
            };

            let (step, failures) = {
                let mut core = self.core();
                // The session was replaced or told to retire while we waited.
                if core.active.as_ref().map(|s| s.id) != Some(session_id)
                    || core.is_retiring(session_id)
                {
                    continue;
                }
                core.last_probe = Some(probe);
                let step = core.fire(trigger, Instant::now());
                (step, core.machine.consecutive_failures())
            };

            match &result {
                Ok(reply) => debug!(
                    instance = %self.inner.instance,
                    port,
                    latency_ms = reply.latency.as_millis() as u64,
                    state = reply.get("state").unwrap_or("-"),
                    "health probe ok"
                ),
                Err(e) => warn!(
                    instance = %self.inner.instance,
                    port,
                    failures,
                    error = %e,
                    "health probe failed"
                ),
            }

            if let Ok((step, teardown)) = step {
                let reason = match &result {
                    Ok(_) => String::new(),
                    Err(_) => format!("{} consecutive failed health probes", failures),
                };
                self.execute(step, teardown, &token, reason);
            }
        }
        debug!(instance = %self.inner.instance, "probe loop stopped");
    }

    async fn watch_exit(self, session_id: u64, handle: Arc<ProcessHandle>, token: CancellationToken) {
        let code = tokio::select! {
            _ = token.cancelled() => return,
            code = handle.exited() => code,
        };
        let step = {
            let mut core = self.core();
            // Only the active session's exit matters; retired sessions exit on purpose.
            if core.active.as_ref().map(|s| s.id) != Some(session_id) {
                return;
            }
            if core.is_retiring(session_id) {
                debug!(instance = %self.inner.instance, pid = handle.pid(), "retiring session exited");
                return;
            }
            core.fire(Trigger::ProcessExited, Instant::now())
        };
        warn!(
            instance = %self.inner.instance,
            pid = handle.pid(),
            code = ?code,
            "session exited unexpectedly"
        );
        if let Ok((step, teardown)) = step {
            let reason = match code {
                Some(code) => format!("process exited with code {}", code),
                None => "process exited".to_string(),
            };
            self.execute(step, teardown, &token, reason);
        }
    }

    fn execute(
        &self,
        step: Step,
        teardown: Option<Teardown>,
        token: &CancellationToken,
        reason: String,
    ) {
        if step.crashed {
            warn!(
                instance = %self.inner.instance,
                from = %step.from,
                to = %step.to,
                %reason,
                "crash detected"
            );
        }
        match step.action {
            Action::Restart { delay } => {
                if let WatchdogState::Restarting { attempt } = step.to {
                    self.inner.events.emit(LifecycleEvent::InstanceRestarting {
                        instance: self.inner.instance.clone(),
                        attempt,
                        reason,
                    });
                }
                tokio::spawn(self.clone().recover(delay, token.clone()));
            }
            Action::GiveUp => {
                if let Some(teardown) = teardown {
                    self.give_up(teardown, reason);
                }
            }
            Action::None | Action::Monitor | Action::Shutdown => {}
        }
    }

    async fn recover(self, mut delay: Duration, token: CancellationToken) {
        loop {
            let (dead, port, artifact) = {
                let mut core = self.core();
                (core.active.take(), core.active_port, core.artifact.clone())
            };
            if let Some(dead) = dead {
                debug!(instance = %self.inner.instance, pid = dead.handle.pid(), "discarding dead session");
                dead.handle.terminate().await;
            }
            let Some(artifact) = artifact else {
                return;
            };

            if !delay.is_zero() {
                info!(
                    instance = %self.inner.instance,
                    delay_ms = delay.as_millis() as u64,
                    "waiting before restart"
                );
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.launch(SessionRole::Active, port, &artifact).await {
                Ok(session) => {
                    if token.is_cancelled() {
                        session.handle.terminate().await;
                        return;
                    }
                    if let Err(e) = self.activate(session, Trigger::RestartSucceeded).await {
                        debug!(instance = %self.inner.instance, error = %e, "restart abandoned");
                    }
                    return;
                }
                Err(e) => {
                    warn!(instance = %self.inner.instance, error = %e, "restart failed");
                    let step = self.core().fire(Trigger::RestartFailed, Instant::now());
                    match step {
                        Ok((
                            Step {
                                action: Action::Restart { delay: next },
                                to: WatchdogState::Restarting { attempt },
                                ..
                            },
                            _,
                        )) => {
                            self.inner.events.emit(LifecycleEvent::InstanceRestarting {
                                instance: self.inner.instance.clone(),
                                attempt,
                                reason: e.to_string(),
                            });
                            delay = next;
                        }
                        Ok((_, Some(teardown))) => {
                            self.give_up(teardown, format!("restart failed: {}", e));
                            return;
                        }
                        _ => return,
                    }
                }
            }
        }
    }

    /// Runs right after the machine went fatal. The record and the event are
    /// handled before returning so a following start cannot race them.
    fn give_up(&self, teardown: Teardown, reason: String) {
        if let Some(token) = teardown.monitor {
            token.cancel();
        }
        if !teardown.handles.is_empty() {
            tokio::spawn(async move {
                for handle in teardown.handles {
                    handle.terminate().await;
                }
            });
        }
        error!(
            instance = %self.inner.instance,
            %reason,
            "restart limit reached, instance stays offline until started again"
        );
        self.clear_record();
        self.inner.events.emit(LifecycleEvent::InstanceOffline {
            instance: self.inner.instance.clone(),
            fatal: true,
        });
    }

    // -----------------------------------------------------------------------
    // Stop / detach
    // -----------------------------------------------------------------------

    /// Ask the active session to shut down, wait up to `grace`, then make
    /// sure it is gone. Stopping an offline instance does nothing.
    pub async fn stop(&self, grace: Duration) -> Result<(), WatchdogError> {
        let (active, staged, monitor) = {
            let mut core = self.core();
            let step = core
                .machine
                .fire(Trigger::Stop, Instant::now())
                .map_err(|e| self.invalid(e.state, "cannot stop from this state"))?;
            if step.action != Action::Shutdown {
                return Ok(());
            }
            (core.active.take(), core.staged.take(), core.monitor.take())
        };
        info!(instance = %self.inner.instance, "stopping instance");

        if let Some(token) = monitor {
            token.cancel();
        }
        if let Some(staged) = staged {
            staged.handle.terminate().await;
        }
        if let Some(active) = active {
            let timeout = self.inner.settings.topic_timeout;
            match self.inner.link.request_shutdown(active.port, timeout).await {
                Ok(()) => debug!(instance = %self.inner.instance, "graceful shutdown requested"),
                Err(e) => warn!(instance = %self.inner.instance, error = %e, "graceful shutdown request failed"),
            }
            if tokio::time::timeout(grace, active.handle.exited()).await.is_err() {
                warn!(
                    instance = %self.inner.instance,
                    grace_secs = grace.as_secs(),
                    "session did not exit within grace period, terminating"
                );
            }
            active.handle.terminate().await;
        }

        let _ = self.core().machine.fire(Trigger::Stopped, Instant::now());
        self.clear_record();
        info!(instance = %self.inner.instance, "instance offline");
        self.inner.events.emit(LifecycleEvent::InstanceOffline {
            instance: self.inner.instance.clone(),
            fatal: false,
        });
        Ok(())
    }

    /// Stop supervising without killing the active session, leaving its
    /// record behind so the next run can adopt it. Staged sessions are
    /// always terminated.
    pub async fn detach(&self) {
        let (active, staged, monitor) = {
            let mut core = self.core();
            match core.machine.fire(Trigger::Stop, Instant::now()) {
                Ok(step) if step.action == Action::Shutdown => {}
                _ => return,
            }
            (core.active.take(), core.staged.take(), core.monitor.take())
        };
        if let Some(token) = monitor {
            token.cancel();
        }
        if let Some(staged) = staged {
            staged.handle.terminate().await;
        }
        if let Some(active) = active {
            info!(
                instance = %self.inner.instance,
                pid = active.handle.pid(),
                "detached from running session"
            );
            active.handle.dispose();
        }
        let _ = self.core().machine.fire(Trigger::Stopped, Instant::now());
    }

    // -----------------------------------------------------------------------
    // Deploy / swap
    // -----------------------------------------------------------------------

    /// Launch `artifact` on the alternate port, wait for it to answer health
    /// probes, then swap it in. The active session is untouched on failure.
    pub async fn deploy(&self, artifact: PathBuf) -> Result<(), WatchdogError> {
        let (active_port, token) = {
            let mut core = self.core();
            let state = core.machine.state();
            match state {
                WatchdogState::Offline { .. } => {
                    return Err(WatchdogError::NoActiveSession(self.inner.instance.clone()))
                }
                s if s.is_running() => {}
                s => return Err(self.invalid(s, "deploy needs a running session")),
            }
            if core.deploying {
                return Err(self.invalid(state, "a deployment is already in progress"));
            }
            let Some(token) = core.monitor.clone() else {
                return Err(WatchdogError::NoActiveSession(self.inner.instance.clone()));
            };
            core.deploying = true;
            (core.active_port, token)
        };
        let _guard = DeployGuard(self);

        let staged_port = self.alternate(active_port);
        info!(
            instance = %self.inner.instance,
            artifact = %artifact.display(),
            staged_port,
            "deploying"
        );
        self.inner.events.emit(LifecycleEvent::DeployStarted {
            instance: self.inner.instance.clone(),
            artifact: artifact.clone(),
        });

        match self.swap_in(&artifact, active_port, staged_port, &token).await {
            Ok(port) => {
                info!(instance = %self.inner.instance, port, "deploy complete");
                self.inner.events.emit(LifecycleEvent::DeploySucceeded {
                    instance: self.inner.instance.clone(),
                    port,
                    artifact,
                });
                Ok(())
            }
            Err(e) => {
                warn!(instance = %self.inner.instance, error = %e, "deploy failed");
                self.inner.events.emit(LifecycleEvent::DeployFailed {
                    instance: self.inner.instance.clone(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn swap_in(
        &self,
        artifact: &Path,
        active_port: u16,
        staged_port: u16,
        token: &CancellationToken,
    ) -> Result<u16, WatchdogError> {
        let session = self
            .launch(SessionRole::Staged, staged_port, artifact)
            .await
            .map_err(|e| WatchdogError::DeployFailed(format!("staged session did not start: {}", e)))?;
        let staged_id = session.id;
        let staged_handle = session.handle.clone();
        self.core().staged = Some(session);

        if let Err(reason) = self.await_staged_health(staged_port, &staged_handle, token).await {
            let staged = self.take_staged(staged_id);
            if let Some(staged) = staged {
                staged.handle.terminate().await;
            }
            return Err(WatchdogError::DeployFailed(reason));
        }

        let retiring = {
            let mut core = self.core();
            let id = core.active.as_ref().map(|s| s.id);
            core.retiring = id;
            id
        };
        let settings = &self.inner.settings;
        if let Err(e) = self
            .inner
            .link
            .announce_swap(active_port, staged_port, settings.swap_grace, settings.topic_timeout)
            .await
        {
            warn!(instance = %self.inner.instance, error = %e, "swap notice not acknowledged");
        }
        // Connected clients get the grace window to move over.
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep(settings.swap_grace) => {}
        }

        let promotion = {
            let mut core = self.core();
            if core.retiring == retiring {
                core.retiring = None;
            }
            let still_ours = core.staged.as_ref().map(|s| s.id) == Some(staged_id);
            if !still_ours || token.is_cancelled() || !core.machine.state().is_running() {
                Promotion::Aborted(if still_ours { core.staged.take() } else { None })
            } else if let Some(mut staged) = core.staged.take() {
                staged.role = SessionRole::Active;
                let old = core.active.take();
                core.swaps.push(SwapRecord {
                    at: Utc::now(),
                    from_port: old.as_ref().map(|s| s.port).unwrap_or(active_port),
                    to_port: staged.port,
                    artifact: staged.artifact.clone(),
                });
                if core.swaps.len() > MAX_SWAP_HISTORY {
                    core.swaps.remove(0);
                }
                core.active_port = staged.port;
                core.artifact = Some(staged.artifact.clone());
                let _ = core.machine.fire(Trigger::Swapped, Instant::now());
                let promoted = Promotion::Promoted {
                    old,
                    id: staged.id,
                    handle: staged.handle.clone(),
                    record: staged.record(&self.inner.instance),
                };
                core.active = Some(staged);
                promoted
            } else {
                Promotion::Aborted(None)
            }
        };

        match promotion {
            Promotion::Aborted(staged) => {
                if let Some(staged) = staged {
                    staged.handle.terminate().await;
                }
                Err(WatchdogError::DeployFailed(
                    "instance left the running state during deployment".to_string(),
                ))
            }
            Promotion::Promoted {
                old,
                id,
                handle,
                record,
            } => {
                tokio::spawn(self.clone().watch_exit(id, handle, token.clone()));
                self.persist(&record);
                if let Some(old) = old {
                    debug!(instance = %self.inner.instance, pid = old.handle.pid(), "retiring previous session");
                    old.handle.terminate().await;
                }
                Ok(staged_port)
            }
        }
    }

    fn take_staged(&self, id: u64) -> Option<Session> {
        let mut core = self.core();
        if core.staged.as_ref().map(|s| s.id) == Some(id) {
            core.staged.take()
        } else {
            None
        }
    }

    async fn await_staged_health(
        &self,
        port: u16,
        handle: &ProcessHandle,
        token: &CancellationToken,
    ) -> Result<(), String> {
        let settings = &self.inner.settings;
        let attempts = settings.deploy_probe_attempts;
        for attempt in 1..=attempts {
            if handle.has_exited() {
                return Err("staged session exited before becoming healthy".to_string());
            }
            let result = tokio::select! {
                _ = token.cancelled() => return Err("instance stopped during deployment".to_string()),
                result = self.inner.link.probe(port, settings.topic_timeout) => result,
            };
            match result {
                Ok(_) => {
                    info!(instance = %self.inner.instance, port, attempt, "staged session healthy");
                    return Ok(());
                }
                Err(e) => debug!(
                    instance = %self.inner.instance,
                    port,
                    attempt,
                    error = %e,
                    "staged session not healthy yet"
                ),
            }
            if attempt < attempts {
                tokio::select! {
                    _ = token.cancelled() => return Err("instance stopped during deployment".to_string()),
                    _ = tokio::time::sleep(settings.probe_interval) => {}
                }
            }
        }
        Err(format!(
            "staged session did not pass a health probe in {} attempts",
            attempts
        ))
    }

    // -----------------------------------------------------------------------
    // Session records
    // -----------------------------------------------------------------------

    fn persist(&self, record: &SessionRecord) {
        if let Some(dir) = &self.inner.state_dir {
            if let Err(e) = record.save(dir) {
                warn!(instance = %self.inner.instance, error = %e, "failed to save session record");
            }
        }
    }

    fn clear_record(&self) {
        if let Some(dir) = &self.inner.state_dir {
            if let Err(e) = SessionRecord::remove(dir, &self.inner.instance) {
                warn!(instance = %self.inner.instance, error = %e, "failed to remove session record");
            }
        }
    }
}

struct DeployGuard<'a>(&'a Watchdog);

impl Drop for DeployGuard<'_> {
    fn drop(&mut self) {
        self.0.core().deploying = false;
    }
}
