use std::collections::HashMap;
use std::path::{Path, PathBuf};

use axum::extract::Multipart;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::AppError;

/// A multipart body whose file part was streamed to disk.
#[derive(Debug)]
pub struct StagedUpload {
    file: Option<PathBuf>,
    original_name: Option<String>,
    fields: HashMap<String, String>,
}

impl StagedUpload {
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn original_name(&self) -> Option<&str> {
        self.original_name.as_deref()
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Delete the staged file, if any. Errors are logged only.
    pub async fn remove(self) {
        let Some(path) = self.file else {
            return;
        };
        if let Err(err) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %err, "Failed to delete staged upload");
        }
    }
}

/// Stream `file_field` into a fresh file under `upload_dir` and keep every
/// other part as text. Unknown file parts are drained and dropped.
pub async fn stage_multipart(
    mut multipart: Multipart,
    upload_dir: &Path,
    file_field: &str,
) -> Result<StagedUpload, AppError> {
    let mut staged = StagedUpload {
        file: None,
        original_name: None,
        fields: HashMap::new(),
    };

    let result = read_parts(&mut multipart, upload_dir, file_field, &mut staged).await;
    if let Err(err) = result {
        staged.remove().await;
        return Err(err);
    }
    Ok(staged)
}

async fn read_parts(
    multipart: &mut Multipart,
    upload_dir: &Path,
    file_field: &str,
    staged: &mut StagedUpload,
) -> Result<(), AppError> {
    while let Some(mut field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();

        if name == file_field && staged.file.is_none() {
            tokio::fs::create_dir_all(upload_dir).await.map_err(|e| {
                AppError::Internal(format!("failed to create upload directory: {e}"))
            })?;
            let path = upload_dir.join(Uuid::new_v4().to_string());
            staged.original_name = field.file_name().map(str::to_string);
            staged.file = Some(path.clone());

            let mut out = tokio::fs::File::create(&path)
                .await
                .map_err(|e| AppError::Internal(format!("failed to stage upload: {e}")))?;
            let mut written: u64 = 0;
            while let Some(chunk) = field.chunk().await.map_err(bad_multipart)? {
                out.write_all(&chunk)
                    .await
                    .map_err(|e| AppError::Internal(format!("failed to stage upload: {e}")))?;
                written += chunk.len() as u64;
            }
            out.flush()
                .await
                .map_err(|e| AppError::Internal(format!("failed to stage upload: {e}")))?;
            debug!(field = %name, path = %path.display(), bytes = written, "Staged upload");
            continue;
        }

        if field.file_name().is_some() {
            while field.chunk().await.map_err(bad_multipart)?.is_some() {}
            continue;
        }

        let value = field.text().await.map_err(bad_multipart)?;
        staged.fields.insert(name, value);
    }
    Ok(())
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> AppError {
    AppError::BadRequest(format!("invalid multipart body: {}", err.body_text()))
}

/// Parse the sampling stride. Only positive integers are accepted.
pub fn parse_frame_skip(raw: Option<&str>) -> Result<u32, AppError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing frameSkip".to_string()))?;
    match raw.parse::<u32>() {
        Ok(stride) if stride >= 1 => Ok(stride),
        _ => Err(AppError::BadRequest(format!(
            "frameSkip must be a positive integer, got {raw:?}"
        ))),
    }
}
