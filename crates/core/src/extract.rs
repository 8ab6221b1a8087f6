use std::ffi::OsString;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::ToolsConfig;
use crate::error::{FramevecError, FramevecResult};
use crate::job::{DEFAULT_FPS, FPS_FILE_NAME};
use crate::output::{format_fps, natural_cmp};
use crate::runtime::run_tool;

pub const RASTER_FRAME_PATTERN: &str = "frame_%04d.bmp";

/// Decodes a video into numbered raster frames.
#[async_trait]
pub trait FrameSampler: Send + Sync {
    /// Write every `stride`-th decoded frame of `video` into `scratch_dir` and
    /// return the tool's diagnostic text.
    async fn sample(&self, video: &Path, stride: u32, scratch_dir: &Path) -> FramevecResult<String>;
}

#[derive(Debug, Clone)]
pub struct FfmpegSampler {
    binary: String,
    timeout: Duration,
}

impl FfmpegSampler {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(tools.ffmpeg.clone(), tools.timeout())
    }
}

fn sampler_args(video: &Path, stride: u32, scratch_dir: &Path) -> Vec<OsString> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        video.as_os_str().to_owned(),
        "-vf".into(),
        format!("select='not(mod(n\\,{stride}))'").into(),
        "-vsync".into(),
        "vfr".into(),
        scratch_dir.join(RASTER_FRAME_PATTERN).into_os_string(),
    ]
}

#[async_trait]
impl FrameSampler for FfmpegSampler {
    async fn sample(&self, video: &Path, stride: u32, scratch_dir: &Path) -> FramevecResult<String> {
        let output = run_tool(
            &self.binary,
            sampler_args(video, stride, scratch_dir),
            self.timeout,
        )
        .await
        .map_err(|err| FramevecError::extraction(err.to_string()))?;

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        for line in stderr.lines() {
            debug!(target: "ffmpeg_stderr", "{}", line);
        }
        Ok(stderr)
    }
}

fn fps_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r", (\d+(?:\.\d+)?) fps,").expect("fps pattern is valid"))
}

/// First `<number> fps` figure in sampler diagnostics, or [`DEFAULT_FPS`].
pub fn parse_fps(diagnostics: &str) -> f64 {
    let parsed = fps_pattern()
        .captures(diagnostics)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|fps| fps.is_finite() && *fps > 0.0);

    match parsed {
        Some(fps) => fps,
        None => {
            warn!("could not determine source frame rate, defaulting to {DEFAULT_FPS}");
            DEFAULT_FPS
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    /// Raster frame file names inside the scratch directory, natural order.
    pub frames: Vec<String>,
    pub fps: f64,
}

impl Extraction {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

fn list_raster_frames(scratch_dir: &Path) -> FramevecResult<Vec<String>> {
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(scratch_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            frames.push(name);
        }
    }
    frames.sort_by(|a, b| natural_cmp(a, b));
    Ok(frames)
}

/// Sample `video` into `scratch_dir` and persist the recovered frame rate
/// under `job_dir`.
pub async fn extract_frames(
    sampler: &dyn FrameSampler,
    video: &Path,
    stride: u32,
    scratch_dir: &Path,
    job_dir: &Path,
) -> FramevecResult<Extraction> {
    if stride == 0 {
        return Err(FramevecError::validation(
            "frameSkip must be a positive integer",
        ));
    }

    let diagnostics = sampler.sample(video, stride, scratch_dir).await?;
    let fps = parse_fps(&diagnostics);
    tokio::fs::write(job_dir.join(FPS_FILE_NAME), format_fps(fps)).await?;

    let frames = list_raster_frames(scratch_dir)?;
    info!(
        video = %video.display(),
        stride,
        fps,
        frame_count = frames.len(),
        "Extracted raster frames"
    );

    Ok(Extraction { frames, fps })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Writes `frames` blank rasters and reports a fixed diagnostic line.
    pub(crate) struct StubSampler {
        pub frames: usize,
        pub diagnostics: String,
        pub fail: bool,
        pub calls: AtomicUsize,
    }

    impl StubSampler {
        pub(crate) fn new(frames: usize, diagnostics: &str) -> Self {
            Self {
                frames,
                diagnostics: diagnostics.to_string(),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(0, "")
            }
        }
    }

    #[async_trait]
    impl FrameSampler for StubSampler {
        async fn sample(
            &self,
            _video: &Path,
            _stride: u32,
            scratch_dir: &Path,
        ) -> FramevecResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FramevecError::extraction("ffmpeg exited with status 1"));
            }
            for index in 1..=self.frames {
                std::fs::write(scratch_dir.join(format!("frame_{index:04}.bmp")), b"BM")?;
            }
            Ok(self.diagnostics.clone())
        }
    }

    const FFMPEG_STREAM_LINE: &str = "  Stream #0:0(und): Video: h264 (High), yuv420p, 1280x720, 2500 kb/s, 29.97 fps, 29.97 tbr, 30k tbn (default)";

    #[test]
    fn parse_fps_reads_first_stream_rate() {
        assert_eq!(parse_fps(FFMPEG_STREAM_LINE), 29.97);
        assert_eq!(parse_fps("Video: vp9, 640x480, 25 fps, 25 tbr"), 25.0);
        assert_eq!(
            parse_fps("a, 30 fps, b\nStream #0:1: Video: x, 60 fps, 60 tbr"),
            30.0
        );
    }

    #[test]
    fn parse_fps_defaults_when_absent_or_degenerate() {
        assert_eq!(parse_fps(""), DEFAULT_FPS);
        assert_eq!(parse_fps("Audio: aac, 44100 Hz, stereo"), DEFAULT_FPS);
        assert_eq!(parse_fps("Video: x, 0 fps, 0 tbr"), DEFAULT_FPS);
    }

    #[test]
    fn sampler_args_select_every_nth_frame_into_scratch() {
        let args = sampler_args(Path::new("in.mp4"), 3, Path::new("/scratch/job"));
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "select='not(mod(n\\,3))'");
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "in.mp4");
        assert!(args.windows(2).any(|w| w[0] == "-vsync" && w[1] == "vfr"));
        assert_eq!(
            Path::new(args.last().unwrap()),
            Path::new("/scratch/job").join(RASTER_FRAME_PATTERN)
        );
    }

    #[tokio::test]
    async fn extract_frames_persists_fps_and_lists_frames() {
        let temp = tempdir().unwrap();
        let scratch = temp.path().join("scratch");
        let job = temp.path().join("job");
        std::fs::create_dir_all(&scratch).unwrap();
        std::fs::create_dir_all(&job).unwrap();
        let sampler = StubSampler::new(12, FFMPEG_STREAM_LINE);

        let extraction = extract_frames(&sampler, Path::new("in.mp4"), 2, &scratch, &job)
            .await
            .unwrap();

        assert_eq!(extraction.frame_count(), 12);
        assert_eq!(extraction.frames[1], "frame_0002.bmp");
        assert_eq!(extraction.frames[11], "frame_0012.bmp");
        assert_eq!(extraction.fps, 29.97);
        assert_eq!(
            std::fs::read_to_string(job.join(FPS_FILE_NAME)).unwrap(),
            "29.97"
        );
    }

    #[tokio::test]
    async fn zero_stride_is_rejected_before_sampling() {
        let temp = tempdir().unwrap();
        let sampler = StubSampler::new(3, "");

        let err = extract_frames(&sampler, Path::new("in.mp4"), 0, temp.path(), temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, FramevecError::Validation(_)));
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sampler_failure_aborts_without_fps_file() {
        let temp = tempdir().unwrap();
        let sampler = StubSampler::failing();

        let err = extract_frames(&sampler, Path::new("in.mp4"), 1, temp.path(), temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, FramevecError::Extraction(_)));
        assert!(!temp.path().join(FPS_FILE_NAME).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ffmpeg_sampler_surfaces_non_zero_exit_as_extraction_error() {
        let sampler = FfmpegSampler::new("false", Duration::from_secs(5));
        let temp = tempdir().unwrap();

        let err = sampler
            .sample(Path::new("missing.mp4"), 1, temp.path())
            .await
            .unwrap_err();

        assert!(matches!(err, FramevecError::Extraction(_)));
    }
}
