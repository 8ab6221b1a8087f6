use std::path::{Path as StdPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tracing::{error, info, warn};

mod stream;
mod upload;

pub use stream::{progress_sse, progress_stream, single_event_sse};
pub use upload::{parse_frame_skip, stage_multipart, StagedUpload};

use crate::archive::import_archive;
use crate::config::{AppConfig, ResolvedPaths};
use crate::convert::{FanOut, PotraceConverter, VectorConverter};
use crate::error::FramevecError;
use crate::extract::{FfmpegSampler, FrameSampler};
use crate::job::{Job, JobId, JobStatus, ProgressEvent, IMPORTED_MESSAGE};
use crate::output::{format_fps, JobOutputs};
use crate::pipeline::{ConversionOutcome, ConversionRequest, Pipeline};
use crate::workspace::Workspace;

const PROGRESS_CHANNEL_CAPACITY: usize = 64;
const VIDEO_FIELD: &str = "video";
const FRAME_SKIP_FIELD: &str = "frameSkip";
const ARCHIVE_FIELD: &str = "svgZip";

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    paths: ResolvedPaths,
    workspace: Workspace,
    outputs: JobOutputs,
    pipeline: Pipeline,
    /// Running conversions only; an entry is removed when its job finishes.
    jobs: DashMap<JobId, Job>,
}

impl AppState {
    /// Build the state and prepare the on-disk layout. Scratch left by other
    /// processes is not touched; see [`Workspace::purge_scratch`].
    pub fn new(
        config: AppConfig,
        data_dir: PathBuf,
        sampler: Arc<dyn FrameSampler>,
        converter: Arc<dyn VectorConverter>,
    ) -> Result<Self> {
        let paths = config.resolve_paths(&data_dir);
        let workspace = Workspace::new(paths.scratch_dir.clone(), paths.output_dir.clone());
        workspace
            .initialize()
            .context("failed to initialize job workspace")?;
        std::fs::create_dir_all(&paths.upload_dir).with_context(|| {
            format!(
                "failed to create upload directory: {}",
                paths.upload_dir.display()
            )
        })?;

        let permits = Arc::new(Semaphore::new(config.tools.concurrency()));
        let fan_out = FanOut::new(converter, permits);
        let pipeline = Pipeline::new(workspace.clone(), sampler, fan_out);

        info!(
            data_dir = %data_dir.display(),
            max_concurrency = config.tools.concurrency(),
            "Application state ready"
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                outputs: JobOutputs::new(workspace.clone()),
                workspace,
                pipeline,
                jobs: DashMap::new(),
                paths,
                config,
            }),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn paths(&self) -> &ResolvedPaths {
        &self.inner.paths
    }

    pub fn workspace(&self) -> &Workspace {
        &self.inner.workspace
    }

    pub fn is_job_active(&self, id: JobId) -> bool {
        self.inner.jobs.contains_key(&id)
    }

    pub fn active_job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Allocate a job for `video` and run the pipeline on a background task.
    /// The job runs to completion even if the returned receiver is dropped.
    /// `staged` is deleted once the pipeline is done with it.
    pub fn spawn_conversion(
        &self,
        video: PathBuf,
        stride: u32,
        staged: Option<StagedUpload>,
    ) -> Result<(JobId, mpsc::Receiver<ProgressEvent>, JoinHandle<ConversionOutcome>), FramevecError>
    {
        let (job_id, job_dir) = self.inner.workspace.new_job()?;
        self.inner.jobs.insert(job_id, Job::new(job_id));

        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let request = ConversionRequest {
            job_id,
            job_dir,
            video,
            stride,
        };
        info!(job_id = %job_id, video = %request.video.display(), stride, "Conversion job accepted");

        let state = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = state.inner.pipeline.run_conversion_job(request, tx).await;
            if let Some(staged) = staged {
                staged.remove().await;
            }
            state.finish_job(job_id, outcome.status, outcome.fps);
            outcome
        });

        Ok((job_id, rx, handle))
    }

    fn finish_job(&self, id: JobId, status: JobStatus, fps: Option<f64>) {
        let Some((_, job)) = self.inner.jobs.remove(&id) else {
            warn!(job_id = %id, "Finished job was not registered");
            return;
        };
        info!(
            job_id = %job.id,
            ?status,
            fps,
            elapsed_ms = job.elapsed().num_milliseconds(),
            "Conversion job finished"
        );
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub fn app_router(state: AppState) -> Router {
    app_router_with_static(state, None)
}

pub fn app_router_with_static(state: AppState, static_dir: Option<&StdPath>) -> Router {
    let body_limit = state.config().server.max_upload_bytes();

    let api = Router::new()
        .route("/api/health", get(health))
        .route("/upload", post(upload_video))
        .route("/upload-zip", post(upload_zip))
        .route("/svg/{job_id}", get(list_frames))
        .route("/svg/{job_id}/fps.txt", get(get_frame_rate))
        .route("/svg/{job_id}/{file}", get(get_frame))
        .route("/download/{job_id}", get(download_job))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state);

    match static_dir {
        Some(dir) => {
            let index = dir.join("index.html");
            api.fallback_service(ServeDir::new(dir).fallback(ServeFile::new(index)))
        }
        None => api,
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("API route not found: /api/{path}"))
}

async fn upload_video(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let staged = stage_multipart(multipart, &state.paths().upload_dir, VIDEO_FIELD).await?;

    let stride = match parse_frame_skip(staged.field(FRAME_SKIP_FIELD)) {
        Ok(stride) => stride,
        Err(err) => {
            staged.remove().await;
            return Err(err);
        }
    };
    let Some(video) = staged.file().map(StdPath::to_path_buf) else {
        staged.remove().await;
        return Err(AppError::BadRequest(format!(
            "missing `{VIDEO_FIELD}` file field"
        )));
    };
    info!(
        original_name = staged.original_name().unwrap_or("<unnamed>"),
        stride,
        "Received video upload"
    );

    // A failed allocation never reaches the pipeline, so the staged file is
    // cleaned up here instead.
    match state.spawn_conversion(video.clone(), stride, Some(staged)) {
        Ok((_job_id, rx, _handle)) => Ok(progress_sse(rx).into_response()),
        Err(err) => {
            if let Err(remove_err) = tokio::fs::remove_file(&video).await {
                warn!(error = %remove_err, "Failed to delete staged upload");
            }
            Err(err.into())
        }
    }
}

async fn upload_zip(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Response, AppError> {
    let staged = stage_multipart(multipart, &state.paths().upload_dir, ARCHIVE_FIELD).await?;
    let Some(archive) = staged.file().map(StdPath::to_path_buf) else {
        staged.remove().await;
        return Err(AppError::BadRequest(format!(
            "missing `{ARCHIVE_FIELD}` file field"
        )));
    };

    let workspace = state.workspace().clone();
    let imported = tokio::task::spawn_blocking(move || import_archive(&workspace, &archive)).await;
    staged.remove().await;

    let (job_id, frames) = match imported {
        Ok(Ok(imported)) => imported,
        Ok(Err(err)) => {
            warn!(error = %err, "Archive import rejected");
            return Err(err.into());
        }
        Err(err) => return Err(AppError::Internal(format!("archive import task failed: {err}"))),
    };

    info!(job_id = %job_id, frames = frames.len(), "Archive imported");
    Ok(single_event_sse(ProgressEvent::success(job_id, IMPORTED_MESSAGE)).into_response())
}

async fn list_frames(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    let id = JobId::parse(&job_id)?;
    Ok(Json(state.inner.outputs.list_frames(id)?))
}

async fn get_frame_rate(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let id = JobId::parse(&job_id)?;
    let fps = state.inner.outputs.frame_rate(id).await?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format_fps(fps),
    )
        .into_response())
}

async fn get_frame(
    State(state): State<AppState>,
    Path((job_id, file)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let id = JobId::parse(&job_id)?;
    let bytes = state.inner.outputs.read_frame(id, &file).await?;
    let mime = mime_guess::from_path(&file).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.as_ref())], bytes).into_response())
}

async fn download_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Response, AppError> {
    let id = JobId::parse(&job_id)?;
    let archive = state.inner.outputs.download_archive(id).await?;
    let body = Body::from_stream(ReaderStream::new(archive.file));
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (header::CONTENT_LENGTH, archive.len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{id}.zip\""),
            ),
        ],
        body,
    )
        .into_response())
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(ErrorResponse { error: message });
        (status, body).into_response()
    }
}

impl From<FramevecError> for AppError {
    fn from(err: FramevecError) -> Self {
        match err {
            FramevecError::Validation(msg) => AppError::BadRequest(msg),
            FramevecError::NotFound(msg) => AppError::NotFound(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// State backed by the real external tools named in `config`.
pub fn app_state_with_config(config: AppConfig, data_dir: PathBuf) -> Result<AppState> {
    let sampler: Arc<dyn FrameSampler> = Arc::new(FfmpegSampler::from_config(&config.tools));
    let converter: Arc<dyn VectorConverter> =
        Arc::new(PotraceConverter::from_config(&config.tools));
    AppState::new(config, data_dir, sampler, converter)
}
