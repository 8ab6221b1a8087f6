pub type FramevecResult<T> = Result<T, FramevecError>;

#[derive(thiserror::Error, Debug)]
pub enum FramevecError {
    /// The frame sampler failed; the job aborts before any conversion.
    #[error("frame extraction failed: {0}")]
    Extraction(String),

    /// One frame failed to convert. Never aborts sibling frames.
    #[error("frame conversion failed: {0}")]
    ConversionTask(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FramevecError {
    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::Extraction(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        Self::ConversionTask(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn archive(msg: impl Into<String>) -> Self {
        Self::Archive(msg.into())
    }
}

impl From<zip::result::ZipError> for FramevecError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(io) => Self::Io(io),
            other => Self::Archive(other.to_string()),
        }
    }
}
