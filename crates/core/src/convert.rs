//! Per-frame raster → vector conversion with progress reporting.
//!
//! Every frame becomes an independent task. Tasks never wait on each other; a
//! single coordinator loop collects completions in arrival order, owns the
//! completed-count, and is the only writer of progress events. Concurrency is
//! bounded by a semaphore shared with every other job in the process.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ToolsConfig;
use crate::error::{FramevecError, FramevecResult};
use crate::job::ProgressEvent;
use crate::runtime::run_tool;

/// Converts one raster image into one vector image.
#[async_trait]
pub trait VectorConverter: Send + Sync {
    async fn convert(&self, input: &Path, output: &Path) -> FramevecResult<()>;
}

#[derive(Debug, Clone)]
pub struct PotraceConverter {
    binary: String,
    timeout: Duration,
}

impl PotraceConverter {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(tools.potrace.clone(), tools.timeout())
    }
}

#[async_trait]
impl VectorConverter for PotraceConverter {
    async fn convert(&self, input: &Path, output: &Path) -> FramevecResult<()> {
        let args = [
            OsStr::new("-s"),
            OsStr::new("-o"),
            output.as_os_str(),
            input.as_os_str(),
        ];
        let result = run_tool(&self.binary, args, self.timeout)
            .await
            .map_err(|err| FramevecError::conversion(err.to_string()))?;

        let stderr = String::from_utf8_lossy(&result.stderr);
        for line in stderr.lines() {
            debug!(target: "potrace_stderr", "{}", line);
        }
        Ok(())
    }
}

pub fn vector_frame_name(index: usize) -> String {
    format!("frame_{index:04}.svg")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Kept,
    /// The converter produced whitespace only; the output was deleted.
    Discarded,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    pub total: usize,
    pub kept: usize,
    pub discarded: usize,
    pub failed: usize,
}

impl FanOutReport {
    pub fn succeeded(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, outcome: &FrameOutcome) {
        match outcome {
            FrameOutcome::Kept => self.kept += 1,
            FrameOutcome::Discarded => self.discarded += 1,
            FrameOutcome::Failed(_) => self.failed += 1,
        }
    }
}

/// Whitespace-only output, counting Unicode spaces and a byte-order mark.
fn is_blank_svg(bytes: &[u8]) -> bool {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c.is_whitespace() || c == '\u{FEFF}')
        .is_empty()
}

async fn convert_frame(
    converter: &dyn VectorConverter,
    input: &Path,
    output: &Path,
) -> FrameOutcome {
    if let Err(err) = converter.convert(input, output).await {
        return FrameOutcome::Failed(err.to_string());
    }

    let bytes = match tokio::fs::read(output).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return FrameOutcome::Failed(format!("failed to read {}: {err}", output.display()))
        }
    };

    if !is_blank_svg(&bytes) {
        return FrameOutcome::Kept;
    }

    if let Err(err) = tokio::fs::remove_file(output).await {
        warn!(output = %output.display(), error = %err, "Failed to delete empty vector frame");
    }
    FrameOutcome::Discarded
}

#[derive(Clone)]
pub struct FanOut {
    converter: Arc<dyn VectorConverter>,
    permits: Arc<Semaphore>,
}

impl FanOut {
    pub fn new(converter: Arc<dyn VectorConverter>, permits: Arc<Semaphore>) -> Self {
        Self { converter, permits }
    }

    /// Convert `frames` (names inside `scratch_dir`) into `job_dir`, emitting
    /// one progress event per finished frame.
    ///
    /// The output name derives from the frame's position in `frames`. A
    /// dropped event receiver does not stop the conversion.
    pub async fn run(
        &self,
        scratch_dir: &Path,
        frames: &[String],
        job_dir: &Path,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> FanOutReport {
        let total = frames.len();
        let mut report = FanOutReport {
            total,
            ..FanOutReport::default()
        };
        let mut tasks = JoinSet::new();

        for (index, frame) in frames.iter().enumerate() {
            let input = scratch_dir.join(frame);
            let output: PathBuf = job_dir.join(vector_frame_name(index));
            let converter = Arc::clone(&self.converter);
            let permits = Arc::clone(&self.permits);

            tasks.spawn(async move {
                let outcome = match permits.acquire_owned().await {
                    Ok(_permit) => convert_frame(converter.as_ref(), &input, &output).await,
                    Err(_) => FrameOutcome::Failed("conversion pool closed".to_string()),
                };
                (index, input, outcome)
            });
        }

        let mut completed = 0;
        let mut receiver_gone = false;
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok((index, input, outcome)) => {
                    match &outcome {
                        FrameOutcome::Failed(reason) => warn!(
                            index,
                            input = %input.display(),
                            error = %reason,
                            "Frame conversion failed"
                        ),
                        FrameOutcome::Discarded => {
                            debug!(index, "Discarded empty vector frame")
                        }
                        FrameOutcome::Kept => {}
                    }
                    outcome
                }
                Err(err) => {
                    warn!(error = %err, "Frame conversion task aborted");
                    FrameOutcome::Failed(err.to_string())
                }
            };
            report.record(&outcome);

            completed += 1;
            if !receiver_gone
                && events
                    .send(ProgressEvent::converting(completed, total))
                    .await
                    .is_err()
            {
                debug!("Progress receiver dropped; continuing conversion without events");
                receiver_gone = true;
            }
        }

        info!(
            total = report.total,
            kept = report.kept,
            discarded = report.discarded,
            failed = report.failed,
            "Fan-out finished"
        );
        report
    }
}
