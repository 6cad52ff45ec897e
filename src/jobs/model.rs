use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type JobId = u64;

/// Error recorded for jobs found unfinished when the server starts.
pub const INTERRUPTED_MESSAGE: &str = "job interrupted by server restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub instance_id: String,
    pub kind: String,
    pub status: JobStatus,
    /// `None` while progress is indeterminate.
    pub progress_percent: Option<u8>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn queued(id: JobId, instance_id: &str, kind: &str) -> Self {
        Self {
            id,
            instance_id: instance_id.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Queued,
            progress_percent: None,
            started_at: Utc::now(),
            ended_at: None,
            error_message: None,
        }
    }

    /// Move to a terminal status, stamping the end time.
    pub fn finish(&mut self, status: JobStatus, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.ended_at = Some(Utc::now());
        self.error_message = error;
        if status == JobStatus::Succeeded {
            self.progress_percent = Some(100);
        }
    }
}
