use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::convert::{FanOut, FanOutReport};
use crate::extract::{extract_frames, FrameSampler};
use crate::job::{
    JobId, JobStatus, ProgressEvent, CONVERSION_FAILED_MESSAGE, CONVERTED_MESSAGE,
    EXTRACTION_FAILED_MESSAGE,
};
use crate::workspace::Workspace;

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub job_id: JobId,
    pub job_dir: PathBuf,
    pub video: PathBuf,
    pub stride: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    pub status: JobStatus,
    pub fps: Option<f64>,
    pub report: Option<FanOutReport>,
}

/// Extraction followed by fan-out for one uploaded video.
#[derive(Clone)]
pub struct Pipeline {
    workspace: Workspace,
    sampler: Arc<dyn FrameSampler>,
    fan_out: FanOut,
}

impl Pipeline {
    pub fn new(workspace: Workspace, sampler: Arc<dyn FrameSampler>, fan_out: FanOut) -> Self {
        Self {
            workspace,
            sampler,
            fan_out,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Run one job to completion. Exactly one terminal event is sent, after
    /// the job's scratch space has been cleared.
    pub async fn run_conversion_job(
        &self,
        request: ConversionRequest,
        events: mpsc::Sender<ProgressEvent>,
    ) -> ConversionOutcome {
        let ConversionRequest {
            job_id,
            job_dir,
            video,
            stride,
        } = request;

        let scratch_dir = match self.workspace.job_scratch(job_id) {
            Ok(dir) => dir,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "Failed to create job scratch");
                send_terminal(&events, ProgressEvent::failure(EXTRACTION_FAILED_MESSAGE)).await;
                return ConversionOutcome {
                    status: JobStatus::Failed,
                    fps: None,
                    report: None,
                };
            }
        };

        let extraction =
            match extract_frames(self.sampler.as_ref(), &video, stride, &scratch_dir, &job_dir)
                .await
            {
                Ok(extraction) => extraction,
                Err(err) => {
                    error!(job_id = %job_id, error = %err, "Frame extraction failed");
                    self.workspace.clear_scratch(job_id);
                    send_terminal(&events, ProgressEvent::failure(EXTRACTION_FAILED_MESSAGE))
                        .await;
                    return ConversionOutcome {
                        status: JobStatus::Failed,
                        fps: None,
                        report: None,
                    };
                }
            };

        let report = self
            .fan_out
            .run(&scratch_dir, &extraction.frames, &job_dir, &events)
            .await;
        self.workspace.clear_scratch(job_id);

        let (status, terminal) = if report.succeeded() {
            (
                JobStatus::Completed,
                ProgressEvent::success(job_id, CONVERTED_MESSAGE),
            )
        } else {
            (
                JobStatus::Failed,
                ProgressEvent::failure(CONVERSION_FAILED_MESSAGE),
            )
        };
        send_terminal(&events, terminal).await;

        info!(
            job_id = %job_id,
            status = ?status,
            fps = extraction.fps,
            frames = report.total,
            kept = report.kept,
            "Conversion job finished"
        );

        ConversionOutcome {
            status,
            fps: Some(extraction.fps),
            report: Some(report),
        }
    }
}

async fn send_terminal(events: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    if events.send(event).await.is_err() {
        warn!("Progress receiver dropped before the terminal event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::tests::StubConverter;
    use crate::extract::tests::StubSampler;
    use crate::job::{CONVERTING_MESSAGE, FPS_FILE_NAME};
    use crate::output::list_frame_files;
    use tempfile::tempdir;
    use tokio::sync::Semaphore;

    struct Harness {
        _temp: tempfile::TempDir,
        workspace: Workspace,
        pipeline: Pipeline,
    }

    fn harness(sampler: StubSampler, converter: StubConverter) -> Harness {
        let temp = tempdir().unwrap();
        let workspace = Workspace::new(temp.path().join("frames"), temp.path().join("out"));
        workspace.initialize().unwrap();
        let fan_out = FanOut::new(Arc::new(converter), Arc::new(Semaphore::new(4)));
        let pipeline = Pipeline::new(workspace.clone(), Arc::new(sampler), fan_out);
        Harness {
            _temp: temp,
            workspace,
            pipeline,
        }
    }

    async fn run(harness: &Harness, stride: u32) -> (JobId, ConversionOutcome, Vec<ProgressEvent>) {
        let (job_id, job_dir) = harness.workspace.new_job().unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let request = ConversionRequest {
            job_id,
            job_dir,
            video: PathBuf::from("in.mp4"),
            stride,
        };

        let outcome = harness.pipeline.run_conversion_job(request, tx).await;
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (job_id, outcome, events)
    }

    #[tokio::test]
    async fn successful_job_ends_with_single_success_event() {
        let harness = harness(
            StubSampler::new(3, "Video: h264, 640x480, 25 fps, 25 tbr"),
            StubConverter::default(),
        );

        let (job_id, outcome, events) = run(&harness, 2).await;

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.fps, Some(25.0));
        assert_eq!(events.len(), 4);
        assert!(events[..3]
            .iter()
            .all(|e| e.message() == CONVERTING_MESSAGE && !e.is_terminal()));
        let last = events.last().unwrap();
        assert_eq!(last, &ProgressEvent::success(job_id, CONVERTED_MESSAGE));
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);

        let job_dir = harness.workspace.job_dir(job_id);
        assert_eq!(
            list_frame_files(&job_dir).unwrap(),
            ["frame_0000.svg", "frame_0001.svg", "frame_0002.svg"]
        );
        assert_eq!(
            std::fs::read_to_string(job_dir.join(FPS_FILE_NAME)).unwrap(),
            "25"
        );
    }

    #[tokio::test]
    async fn extraction_failure_emits_failure_without_conversion() {
        let harness = harness(StubSampler::failing(), StubConverter::default());

        let (job_id, outcome, events) = run(&harness, 1).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert!(outcome.report.is_none());
        assert_eq!(events, [ProgressEvent::failure(EXTRACTION_FAILED_MESSAGE)]);
        assert!(!harness.workspace.scratch_dir(job_id).exists());
    }

    #[tokio::test]
    async fn any_failed_frame_fails_the_job() {
        let harness = harness(
            StubSampler::new(4, ""),
            StubConverter::failing_on(&["frame_0003.bmp"]),
        );

        let (job_id, outcome, events) = run(&harness, 1).await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.report.as_ref().unwrap().failed, 1);
        assert_eq!(
            events.last().unwrap(),
            &ProgressEvent::failure(CONVERSION_FAILED_MESSAGE)
        );
        assert_eq!(events.len(), 5);
        assert_eq!(
            list_frame_files(&harness.workspace.job_dir(job_id))
                .unwrap()
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn scratch_is_cleared_after_success() {
        let harness = harness(StubSampler::new(2, ""), StubConverter::default());

        let (job_id, outcome, _events) = run(&harness, 1).await;

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.fps, Some(crate::job::DEFAULT_FPS));
        assert!(!harness.workspace.scratch_dir(job_id).exists());
    }

    #[tokio::test]
    async fn zero_frames_still_succeeds() {
        let harness = harness(StubSampler::new(0, ""), StubConverter::default());

        let (job_id, outcome, events) = run(&harness, 1).await;

        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(events, [ProgressEvent::success(job_id, CONVERTED_MESSAGE)]);
    }
}
