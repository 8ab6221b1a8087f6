use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FramevecError, FramevecResult};

/// Frame rate assumed when the sampler diagnostics carry none.
pub const DEFAULT_FPS: f64 = 24.0;
pub const FPS_FILE_NAME: &str = "fps.txt";

pub const CONVERTING_MESSAGE: &str = "Converting to SVG";
pub const CONVERTED_MESSAGE: &str = "Frames converted to SVG successfully";
pub const CONVERSION_FAILED_MESSAGE: &str = "Error converting frames to SVG";
pub const EXTRACTION_FAILED_MESSAGE: &str = "Error extracting frames";
pub const IMPORTED_MESSAGE: &str = "SVGs uploaded successfully";
pub const INTERRUPTED_MESSAGE: &str = "Job ended unexpectedly";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parses an id taken from a request path. Anything that is not a UUID
    /// cannot name a job, so it reads as "not found".
    pub fn parse(raw: &str) -> FramevecResult<Self> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .map_err(|_| FramevecError::not_found(format!("job not found: {raw}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = FramevecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Final state of a conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Failed,
}

/// A conversion that is still running. Finished jobs are only tracked on
/// disk, through their output directory.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub started_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            started_at: Utc::now(),
        }
    }

    pub fn elapsed(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

/// One record of a job's progress stream.
///
/// `Success` and `Failure` are terminal: they always report 100 and close the
/// stream. Serialized through [`ProgressRecord`] so every variant shares the
/// `{"progress", "message", "videoId"?}` wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(into = "ProgressRecord")]
pub enum ProgressEvent {
    Progress { progress: f64, message: String },
    Success { job_id: JobId, message: String },
    Failure { message: String },
}

impl ProgressEvent {
    pub fn converting(completed: usize, total: usize) -> Self {
        let progress = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
        };
        Self::Progress {
            progress,
            message: CONVERTING_MESSAGE.to_string(),
        }
    }

    pub fn success(job_id: JobId, message: impl Into<String>) -> Self {
        Self::Success {
            job_id,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    pub fn progress(&self) -> f64 {
        match self {
            Self::Progress { progress, .. } => *progress,
            Self::Success { .. } | Self::Failure { .. } => 100.0,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Progress { message, .. }
            | Self::Success { message, .. }
            | Self::Failure { message } => message,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Success { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub progress: f64,
    pub message: String,
    #[serde(rename = "videoId", default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

impl From<ProgressEvent> for ProgressRecord {
    fn from(event: ProgressEvent) -> Self {
        let progress = event.progress();
        match event {
            ProgressEvent::Progress { message, .. } | ProgressEvent::Failure { message } => Self {
                progress,
                message,
                video_id: None,
            },
            ProgressEvent::Success { job_id, message } => Self {
                progress,
                message,
                video_id: Some(job_id.to_string()),
            },
        }
    }
}
