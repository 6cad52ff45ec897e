use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::model::InstanceConfig;
use crate::config::resolve_path;
use crate::ports::PortLease;
use crate::process::{LaunchSpec, ProcessHandle};
use crate::state::SessionRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Active,
    Staged,
}

/// How sessions of one instance are launched.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub runner: Option<PathBuf>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub capture_output: bool,
    pub high_priority: bool,
}

impl LaunchPlan {
    /// Relative paths are resolved against `base_dir` (the config file's directory).
    pub fn from_config(cfg: &InstanceConfig, base_dir: &Path) -> Self {
        let resolve = |p: &str| resolve_path(base_dir, p);
        Self {
            // Bare names like "DreamDaemon" are looked up on PATH.
            runner: cfg.runner.as_deref().map(|r| {
                if r.contains('/') || r.contains('\\') {
                    resolve(r)
                } else {
                    PathBuf::from(r)
                }
            }),
            args: cfg.args.clone(),
            working_dir: cfg.working_dir.as_deref().map(resolve),
            env: cfg.env.clone(),
            capture_output: cfg.capture_output,
            high_priority: cfg.high_priority,
        }
    }

    pub fn spec(&self, instance: &str, artifact: &Path, port: u16, settle: Duration) -> LaunchSpec {
        let artifact_str = artifact.to_string_lossy();
        let port_str = port.to_string();
        let template: Vec<String> = if self.args.is_empty() {
            match self.runner {
                Some(_) => vec!["{artifact}".to_string(), "{port}".to_string()],
                None => vec!["{port}".to_string()],
            }
        } else {
            self.args.clone()
        };
        let args = template
            .iter()
            .map(|a| {
                a.replace("{artifact}", &artifact_str)
                    .replace("{port}", &port_str)
                    .replace("{instance}", instance)
            })
            .collect();

        let mut env = self.env.clone();
        env.insert("WARDEN_INSTANCE".to_string(), instance.to_string());
        env.insert("WARDEN_PORT".to_string(), port_str.clone());

        LaunchSpec {
            executable: self
                .runner
                .clone()
                .unwrap_or_else(|| artifact.to_path_buf()),
            args,
            working_dir: self.working_dir.clone(),
            env,
            capture_output: self.capture_output,
            startup_settle: settle,
        }
    }
}

/// One process bound to a port and artifact. Dropping the session releases
/// its port claim; it does not kill the process.
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub role: SessionRole,
    pub port: u16,
    pub artifact: PathBuf,
    pub handle: Arc<ProcessHandle>,
    pub(crate) _lease: PortLease,
}

impl Session {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            role: self.role,
            port: self.port,
            artifact: self.artifact.clone(),
            pid: self.handle.pid(),
            adopted: self.handle.is_adopted(),
            launched_at: self.handle.launched_at(),
        }
    }

    pub fn record(&self, instance: &str) -> SessionRecord {
        SessionRecord {
            instance: instance.to_string(),
            pid: self.handle.pid(),
            port: self.port,
            artifact: self.artifact.clone(),
            launched_at: self.handle.launched_at(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: u64,
    pub role: SessionRole,
    pub port: u16,
    pub artifact: PathBuf,
    pub pid: u32,
    pub adopted: bool,
    pub launched_at: DateTime<Utc>,
}

/// One promotion of a staged session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwapRecord {
    pub at: DateTime<Utc>,
    pub from_port: u16,
    pub to_port: u16,
    pub artifact: PathBuf,
}
