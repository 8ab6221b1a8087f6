//! Read side of finished jobs: frame listing, frame rate, raw frame bytes and
//! the on-demand zip download.

use std::cmp::Ordering;
use std::fs;
use std::io::{self, Seek};
use std::iter::Peekable;
use std::path::{Component, Path};
use std::str::Chars;

use crate::archive;
use crate::error::{FramevecError, FramevecResult};
use crate::job::{JobId, FPS_FILE_NAME};
use crate::workspace::Workspace;

pub const FRAME_EXTENSION: &str = "svg";

/// Numeric-aware string ordering: digit runs compare by value, so `frame_2`
/// sorts before `frame_10`. Other characters compare case-insensitively and
/// exact equality breaks remaining ties.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();

    loop {
        let (l, r) = match (left.peek(), right.peek()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(&l), Some(&r)) => (l, r),
        };

        if l.is_ascii_digit() && r.is_ascii_digit() {
            let l_run = take_digit_run(&mut left);
            let r_run = take_digit_run(&mut right);
            let ord = compare_digit_runs(&l_run, &r_run);
            if ord != Ordering::Equal {
                return ord;
            }
            continue;
        }

        let ord = l.to_lowercase().cmp(r.to_lowercase());
        if ord != Ordering::Equal {
            return ord;
        }
        left.next();
        right.next();
    }
}

fn take_digit_run(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        run.push(c);
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trimmed = a.trim_start_matches('0');
    let b_trimmed = b.trim_start_matches('0');
    a_trimmed
        .len()
        .cmp(&b_trimmed.len())
        .then_with(|| a_trimmed.cmp(b_trimmed))
}

pub fn is_frame_file(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(FRAME_EXTENSION))
}

/// Allow-list for names served out of a job directory: a single plain path
/// component that is either a frame or the frame-rate file.
pub fn is_servable_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    single_normal
        && !name.contains(['/', '\\'])
        && (is_frame_file(name) || name == FPS_FILE_NAME)
}

/// Frame files directly inside `dir`, in natural order.
pub fn list_frame_files(dir: &Path) -> io::Result<Vec<String>> {
    let mut frames = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_frame_file(name) {
                frames.push(name.to_string());
            }
        }
    }
    frames.sort_by(|a, b| natural_cmp(a, b));
    Ok(frames)
}

pub fn format_fps(fps: f64) -> String {
    format!("{fps}")
}

/// A finalized job zip, positioned at its start.
#[derive(Debug)]
pub struct JobArchive {
    pub file: tokio::fs::File,
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct JobOutputs {
    workspace: Workspace,
}

impl JobOutputs {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    pub fn list_frames(&self, id: JobId) -> FramevecResult<Vec<String>> {
        let dir = self.workspace.existing_job_dir(id)?;
        Ok(list_frame_files(&dir)?)
    }

    pub async fn frame_rate(&self, id: JobId) -> FramevecResult<f64> {
        let path = self.workspace.job_dir(id).join(FPS_FILE_NAME);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(FramevecError::not_found("FPS file not found"));
            }
            Err(err) => return Err(err.into()),
        };
        raw.trim().parse::<f64>().map_err(|err| {
            FramevecError::Other(anyhow::anyhow!(
                "invalid frame rate in {}: {err}",
                path.display()
            ))
        })
    }

    pub async fn read_frame(&self, id: JobId, name: &str) -> FramevecResult<Vec<u8>> {
        if !is_servable_name(name) {
            return Err(FramevecError::validation(format!(
                "invalid frame name: {name}"
            )));
        }
        let dir = self.workspace.existing_job_dir(id)?;
        match tokio::fs::read(dir.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(FramevecError::not_found(
                format!("frame not found: {name}"),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Zip every top-level file of the job into an unnamed temp file under the
    /// scratch root, rebuilt on each call. The file is gone once dropped.
    pub async fn download_archive(&self, id: JobId) -> FramevecResult<JobArchive> {
        let dir = self.workspace.existing_job_dir(id)?;
        let scratch_root = self.workspace.scratch_root().to_path_buf();
        let (file, len) = tokio::task::spawn_blocking(move || -> FramevecResult<_> {
            let out = tempfile::tempfile_in(&scratch_root)?;
            let mut file = archive::write_job_archive(&dir, out)?;
            let len = file.stream_position()?;
            file.rewind()?;
            Ok((file, len))
        })
        .await
        .map_err(|err| FramevecError::Other(anyhow::anyhow!("archive task failed: {err}")))??;

        Ok(JobArchive {
            file: tokio::fs::File::from_std(file),
            len,
        })
    }
}
