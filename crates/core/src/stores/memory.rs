use crate::error::PipelineError;
use crate::models::{Job, JobStatus};
use crate::traits::{BlobStore, JobStore};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// In-memory store backing the quick path and tests. The job mutex makes the
/// status-checked write atomic.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&job.id) {
            return Err(PipelineError::Persistence(format!(
                "job already exists: {}",
                job.id
            )));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: Uuid) -> Result<Job, PipelineError> {
        self.jobs
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(PipelineError::JobNotFound(id))
    }

    async fn save_job_if_status(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<(), PipelineError> {
        let mut jobs = self.jobs.lock().await;
        let current = jobs
            .get(&job.id)
            .ok_or(PipelineError::JobNotFound(job.id))?;

        if current.status != expected {
            return Err(PipelineError::OrchestrationConflict {
                job_id: job.id,
                expected,
                found: current.status,
            });
        }

        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs: Vec<Job> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        self.blobs
            .lock()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        self.blobs
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| PipelineError::Persistence(format!("blob not found: {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_checked_write_rejects_stale_writers() {
        let store = MemoryStore::new();
        let mut job = Job::new("lease.pdf", 10, "application/pdf", "blob-1");
        store.create_job(&job).await.unwrap();

        job.status = JobStatus::Classify;
        store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap();

        // A writer that still believes the job is QUEUED must conflict.
        job.status = JobStatus::Ocr;
        let error = store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PipelineError::OrchestrationConflict {
                expected: JobStatus::Queued,
                found: JobStatus::Classify,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn blobs_round_trip() {
        let store = MemoryStore::new();
        store.put_blob("key", b"%PDF-1.4").await.unwrap();
        assert_eq!(store.get_blob("key").await.unwrap(), b"%PDF-1.4");
        assert!(store.get_blob("missing").await.is_err());
    }
}
