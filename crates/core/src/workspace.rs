use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{FramevecError, FramevecResult};
use crate::job::JobId;

/// Filesystem layout for jobs: a scratch root holding raw frames per running
/// job, and an output root holding one directory per job id.
#[derive(Debug, Clone)]
pub struct Workspace {
    scratch_root: PathBuf,
    output_root: PathBuf,
}

impl Workspace {
    pub fn new(scratch_root: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            output_root: output_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Create both roots. Existing scratch directories are left alone, since
    /// another process may be converting out of the same data directory.
    pub fn initialize(&self) -> FramevecResult<()> {
        fs::create_dir_all(&self.scratch_root)?;
        fs::create_dir_all(&self.output_root)?;
        debug!(
            scratch_root = %self.scratch_root.display(),
            output_root = %self.output_root.display(),
            "Workspace initialized"
        );
        Ok(())
    }

    /// Delete everything under the scratch root. Only safe before any job of
    /// this process has started; the server calls it once at startup.
    pub fn purge_scratch(&self) -> usize {
        let removed = purge_dir_contents(&self.scratch_root);
        info!(
            scratch_root = %self.scratch_root.display(),
            removed,
            "Purged leftover scratch frames"
        );
        removed
    }

    pub fn new_job(&self) -> FramevecResult<(JobId, PathBuf)> {
        let id = JobId::new();
        let dir = self.job_dir(id);
        fs::create_dir_all(&dir)?;
        debug!(job_id = %id, job_dir = %dir.display(), "Allocated job directory");
        Ok((id, dir))
    }

    pub fn job_dir(&self, id: JobId) -> PathBuf {
        self.output_root.join(id.to_string())
    }

    pub fn existing_job_dir(&self, id: JobId) -> FramevecResult<PathBuf> {
        let dir = self.job_dir(id);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(FramevecError::not_found(format!("job not found: {id}")))
        }
    }

    pub fn scratch_dir(&self, id: JobId) -> PathBuf {
        self.scratch_root.join(id.to_string())
    }

    /// Create the job's private scratch directory.
    pub fn job_scratch(&self, id: JobId) -> FramevecResult<PathBuf> {
        let dir = self.scratch_dir(id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Best-effort removal of a job's scratch frames. Errors are logged only.
    pub fn clear_scratch(&self, id: JobId) {
        let dir = self.scratch_dir(id);
        if !dir.exists() {
            return;
        }

        let removed = purge_dir_contents(&dir);
        if let Err(err) = fs::remove_dir(&dir) {
            warn!(job_id = %id, dir = %dir.display(), error = %err, "Failed to remove scratch directory");
        }
        debug!(job_id = %id, removed, "Cleared job scratch");
    }
}

/// Delete every entry below `dir`, returning how many were removed.
fn purge_dir_contents(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "Failed to read directory for cleanup");
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let result = match entry.file_type() {
            Ok(kind) if kind.is_dir() => fs::remove_dir_all(&path),
            _ => fs::remove_file(&path),
        };
        match result {
            Ok(()) => removed += 1,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to delete scratch entry");
            }
        }
    }
    removed
}
