use crate::error::PipelineError;
use crate::models::{Job, JobStatus};
use async_trait::async_trait;
use uuid::Uuid;

/// Durable key-value store for job records, keyed by job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<(), PipelineError>;

    async fn load_job(&self, id: Uuid) -> Result<Job, PipelineError>;

    /// Status-checked write: succeeds only while the stored record still has
    /// `expected` status, otherwise returns `OrchestrationConflict`. This is
    /// the single-writer-per-stage discipline; no distributed lock.
    async fn save_job_if_status(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<(), PipelineError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError>;
}

/// Object storage for raw uploaded bytes. Stages read from here rather than
/// accepting bytes repeatedly.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError>;

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, PipelineError>;
}
