//! Ownership of a single OS process: spawn or adopt, observe startup and
//! exit, capture output, and terminate gracefully-then-forcefully.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::platform::{self, ProcessGroupHandle, SignalOutcome};

/// How long `terminate` waits after the graceful request before killing.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How often an adopted process is checked for liveness.
const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {}: {source}", executable.display())]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("process {pid} exited during startup (exit code {code:?})")]
    ExitedDuringStartup { pid: u32, code: Option<i32> },
    #[error("invalid process state: {0}")]
    InvalidState(&'static str),
}

/// Everything needed to start one process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub capture_output: bool,
    /// The process must stay alive this long before startup counts as complete.
    pub startup_settle: Duration,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            capture_output: false,
            startup_settle: Duration::ZERO,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn startup_settle(mut self, settle: Duration) -> Self {
        self.startup_settle = settle;
        self
    }
}

#[derive(Debug, Default)]
struct CapturedOutput {
    stdout: String,
    stderr: String,
    combined: String,
}

/// A running (or finished) OS process.
///
/// Exit is observed by a background task that owns the child, so waiting
/// on [`ProcessHandle::exited`] never holds a lock. Dropping the handle does
/// not kill the process.
pub struct ProcessHandle {
    pid: u32,
    adopted: bool,
    launched_at: DateTime<Utc>,
    spawned: Instant,
    startup_settle: Duration,
    terminate_grace: Duration,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    force_kill: Arc<Notify>,
    output: Option<Arc<Mutex<CapturedOutput>>>,
    group: Mutex<Option<ProcessGroupHandle>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("adopted", &self.adopted)
            .field("exit", &*self.exit_rx.borrow())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn a new process. Must be called from within a tokio runtime.
    pub fn launch(spec: &LaunchSpec) -> Result<Self, ProcessError> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&spec.env);
        cmd.stdin(std::process::Stdio::null());
        if spec.capture_output {
            cmd.stdout(std::process::Stdio::piped());
            cmd.stderr(std::process::Stdio::piped());
        } else {
            cmd.stdout(std::process::Stdio::null());
            cmd.stderr(std::process::Stdio::null());
        }
        // The game server must outlive us when we detach.
        cmd.kill_on_drop(false);
        platform::configure_process_group(&mut cmd);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            executable: spec.executable.clone(),
            source,
        })?;
        let pid = child.id().ok_or(ProcessError::InvalidState(
            "process exited before its pid could be read",
        ))?;
        let group = platform::post_spawn_setup(Some(pid));
        debug!(pid, executable = %spec.executable.display(), "process spawned");

        let mut readers = Vec::new();
        let output = if spec.capture_output {
            let buffers = Arc::new(Mutex::new(CapturedOutput::default()));
            if let Some(stdout) = child.stdout.take() {
                readers.push(spawn_reader(stdout, pid, false, buffers.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(spawn_reader(stderr, pid, true, buffers.clone()));
            }
            Some(buffers)
        } else {
            None
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let force_kill = Arc::new(Notify::new());
        let kill_signal = force_kill.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_signal.notified() => {
                    if let Err(e) = child.start_kill() {
                        debug!(pid, error = %e, "start_kill failed");
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, error = %e, "wait() failed");
                    None
                }
            };
            trace!(pid, ?code, "process exited");
            exit_tx.send_replace(Some(code));
        });

        Ok(Self {
            pid,
            adopted: false,
            launched_at: Utc::now(),
            spawned: Instant::now(),
            startup_settle: spec.startup_settle,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            exit_rx,
            force_kill,
            output,
            group: Mutex::new(group),
            readers: Mutex::new(readers),
            disposed: AtomicBool::new(false),
        })
    }

    /// Wrap a process started by someone else (e.g. a previous run of this
    /// server). Startup is already complete and the exit code is unknowable.
    pub fn adopt(pid: u32, launched_at: DateTime<Utc>) -> Self {
        let (exit_tx, exit_rx) = watch::channel(None);
        let force_kill = Arc::new(Notify::new());
        let kill_signal = force_kill.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ADOPTED_POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = kill_signal.notified() => {
                        platform::force_kill(pid, false, None);
                    }
                }
                if !platform::is_process_alive(pid) {
                    break;
                }
            }
            exit_tx.send_replace(Some(None));
        });

        Self {
            pid,
            adopted: true,
            launched_at,
            spawned: Instant::now(),
            startup_settle: Duration::ZERO,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            exit_rx,
            force_kill,
            output: None,
            group: Mutex::new(None),
            readers: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_adopted(&self) -> bool {
        self.adopted
    }

    pub fn launched_at(&self) -> DateTime<Utc> {
        self.launched_at
    }

    /// `Some(code)` once the process has exited; the inner code is `None`
    /// when it was killed by a signal or was adopted.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Resolves once the process has exited, yielding its exit code.
    pub async fn exited(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(|status| status.is_some()).await {
            Ok(status) => (*status).flatten(),
            // The watcher task is gone, which only happens at runtime shutdown.
            Err(_) => None,
        };
        code
    }

    /// Resolves once startup has completed: immediately for adopted
    /// processes, otherwise after the settle interval if the process is
    /// still alive.
    pub async fn startup(&self) -> Result<(), ProcessError> {
        if self.adopted {
            return Ok(());
        }
        let remaining = self.startup_settle.saturating_sub(self.spawned.elapsed());
        tokio::select! {
            code = self.exited() => Err(ProcessError::ExitedDuringStartup { pid: self.pid, code }),
            _ = tokio::time::sleep(remaining) => {
                match self.exit_status() {
                    Some(code) => Err(ProcessError::ExitedDuringStartup { pid: self.pid, code }),
                    None => Ok(()),
                }
            }
        }
    }

    /// Ask the process to exit, wait up to the terminate grace, then kill it.
    /// Errors are logged, never returned: callers only care that it is gone.
    pub async fn terminate(&self) {
        if self.has_exited() {
            return;
        }
        let group = !self.adopted;
        match platform::request_graceful_exit(self.pid, group) {
            SignalOutcome::Sent => {
                if tokio::time::timeout(self.terminate_grace, self.exited())
                    .await
                    .is_ok()
                {
                    debug!(pid = self.pid, "process exited after graceful request");
                    return;
                }
                warn!(
                    pid = self.pid,
                    grace_ms = self.terminate_grace.as_millis() as u64,
                    "process did not exit in time, killing",
                );
            }
            SignalOutcome::Gone => {
                debug!(pid = self.pid, "process already gone");
            }
            SignalOutcome::Failed(e) => {
                warn!(pid = self.pid, error = %e, "graceful termination failed, killing");
            }
        }

        {
            let group_handle = self.group.lock().unwrap_or_else(|e| e.into_inner());
            platform::force_kill(self.pid, group, group_handle.as_ref());
        }
        self.force_kill.notify_one();
        if tokio::time::timeout(Duration::from_secs(5), self.exited())
            .await
            .is_err()
        {
            warn!(pid = self.pid, "process still not reaped after kill");
        }
    }

    /// Best effort: failure is logged, not returned.
    pub fn elevate_priority(&self) {
        match platform::elevate_priority(self.pid) {
            Ok(()) => trace!(pid = self.pid, "raised process priority"),
            Err(e) => warn!(pid = self.pid, error = %e, "unable to raise process priority"),
        }
    }

    pub fn read_stdout(&self) -> Result<String, ProcessError> {
        self.read(|o| o.stdout.clone())
    }

    pub fn read_stderr(&self) -> Result<String, ProcessError> {
        self.read(|o| o.stderr.clone())
    }

    pub fn read_combined_output(&self) -> Result<String, ProcessError> {
        self.read(|o| o.combined.clone())
    }

    fn read(&self, f: impl FnOnce(&CapturedOutput) -> String) -> Result<String, ProcessError> {
        let output = self.output.as_ref().ok_or(ProcessError::InvalidState(
            "output capture was not requested at launch",
        ))?;
        let guard = output.lock().unwrap_or_else(|e| e.into_inner());
        Ok(f(&guard))
    }

    /// Release OS resources held for this process without waiting for it
    /// or killing it. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let readers = std::mem::take(&mut *self.readers.lock().unwrap_or_else(|e| e.into_inner()));
        for reader in readers {
            reader.abort();
        }
        drop(self.group.lock().unwrap_or_else(|e| e.into_inner()).take());
        trace!(pid = self.pid, "process handle disposed");
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_reader<R>(
    stream: R,
    pid: u32,
    is_stderr: bool,
    buffers: Arc<Mutex<CapturedOutput>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let text = line.trim_end_matches(['\r', '\n']);
                    debug!(pid, stderr = is_stderr, "{}", text);
                    let mut out = buffers.lock().unwrap_or_else(|e| e.into_inner());
                    let target = if is_stderr { &mut out.stderr } else { &mut out.stdout };
                    target.push_str(text);
                    target.push('\n');
                    out.combined.push_str(text);
                    out.combined.push('\n');
                }
                Err(e) => {
                    warn!(pid, error = %e, "output read error");
                    break;
                }
            }
        }
    })
}
