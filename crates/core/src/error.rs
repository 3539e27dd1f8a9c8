use crate::models::{JobStatus, Stage};
use thiserror::Error;
use uuid::Uuid;

/// Synchronous, user-facing rejection raised before any job exists.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file is empty: {0}")]
    EmptyFile(String),

    #[error("file is {size} bytes which exceeds the {limit} byte limit")]
    Oversize { size: u64, limit: u64 },

    #[error("unsupported mime type: {0}")]
    UnsupportedMime(String),

    #[error("estimated {pages} pages which exceeds the {limit} page limit")]
    TooManyPages { pages: u32, limit: u32 },

    #[error("file content does not match its declared type: {0}")]
    CorruptContent(String),

    #[error("requested page {page} is outside the document ({pages} pages)")]
    PageOutOfRange { page: u32, pages: u32 },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("all extraction engines were exhausted: {0}")]
    ExtractionExhausted(String),

    #[error("{stage} stage exceeded its {budget_secs}s budget")]
    StageTimeout { stage: Stage, budget_secs: u64 },

    #[error("job {job_id} status is {found:?}, expected {expected:?}")]
    OrchestrationConflict {
        job_id: Uuid,
        expected: JobStatus,
        found: JobStatus,
    },

    #[error("store operation failed: {0}")]
    Persistence(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("engine failure: {0}")]
    Engine(String),

    #[error("invalid chunking config: {0}")]
    ChunkConfig(String),
}

impl PipelineError {
    /// Persistence failures are retried with backoff; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Persistence(_))
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
