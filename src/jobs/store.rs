use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::model::{Job, JobId};
use crate::state::{lock_exclusive, write_atomic};

/// Durable home of job records. Calls are short and synchronous; the job
/// manager makes them while holding its own bookkeeping lock.
pub trait JobStore: Send + Sync {
    fn save_job_status(&self, job: &Job) -> anyhow::Result<()>;

    /// Every record, finished or not.
    fn load_jobs(&self) -> anyhow::Result<Vec<Job>>;

    fn remove_job(&self, id: JobId) -> anyhow::Result<()>;

    /// Records that were not finished when last saved.
    fn load_pending_jobs(&self) -> anyhow::Result<Vec<Job>> {
        Ok(self
            .load_jobs()?
            .into_iter()
            .filter(|j| !j.status.is_terminal())
            .collect())
    }
}

/// Jobs kept in `<state_dir>/jobs.json`.
pub struct FileJobStore {
    path: PathBuf,
}

impl FileJobStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("jobs.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> anyhow::Result<BTreeMap<JobId, Job>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read job store {}: {}",
                    self.path.display(),
                    e
                ))
            }
        };
        let jobs: Vec<Job> = serde_json::from_str(&content).map_err(|e| {
            anyhow::anyhow!("failed to parse job store {}: {}", self.path.display(), e)
        })?;
        Ok(jobs.into_iter().map(|j| (j.id, j)).collect())
    }

    fn write(&self, jobs: &BTreeMap<JobId, Job>) -> anyhow::Result<()> {
        let list: Vec<&Job> = jobs.values().collect();
        write_atomic(&self.path, &serde_json::to_string_pretty(&list)?)
    }
}

impl JobStore for FileJobStore {
    fn save_job_status(&self, job: &Job) -> anyhow::Result<()> {
        let _lock = lock_exclusive(&self.path);
        let mut jobs = self.read()?;
        jobs.insert(job.id, job.clone());
        self.write(&jobs)
    }

    fn load_jobs(&self) -> anyhow::Result<Vec<Job>> {
        let _lock = lock_exclusive(&self.path);
        Ok(self.read()?.into_values().collect())
    }

    fn remove_job(&self, id: JobId) -> anyhow::Result<()> {
        let _lock = lock_exclusive(&self.path);
        let mut jobs = self.read()?;
        if jobs.remove(&id).is_some() {
            self.write(&jobs)?;
        }
        Ok(())
    }
}

/// Non-durable store for tests and embedders that persist elsewhere.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn with_jobs(jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into_iter().map(|j| (j.id, j)).collect()),
        }
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }
}

impl JobStore for MemoryJobStore {
    fn save_job_status(&self, job: &Job) -> anyhow::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        Ok(())
    }

    fn load_jobs(&self) -> anyhow::Result<Vec<Job>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    fn remove_job(&self, id: JobId) -> anyhow::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }
}
