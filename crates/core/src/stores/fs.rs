use crate::error::PipelineError;
use crate::models::{Job, JobStatus};
use crate::traits::{BlobStore, JobStore};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Filesystem-backed durable store: one JSON file per job record under
/// `jobs/`, raw uploads under `blobs/`. Writes go through a temp file and
/// rename so a crash never leaves a half-written record.
pub struct FsStore {
    jobs_dir: PathBuf,
    blobs_dir: PathBuf,
    // Serializes the read-check-write of the status-checked save.
    write_lock: Mutex<()>,
}

impl FsStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let root = root.as_ref();
        let jobs_dir = root.join("jobs");
        let blobs_dir = root.join("blobs");
        fs::create_dir_all(&jobs_dir).await?;
        fs::create_dir_all(&blobs_dir).await?;
        Ok(Self {
            jobs_dir,
            blobs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.jobs_dir.join(format!("{id}.json"))
    }

    async fn write_job(&self, job: &Job) -> Result<(), PipelineError> {
        let path = self.job_path(job.id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(job)?;
        fs::write(&tmp, payload)
            .await
            .map_err(|error| PipelineError::Persistence(error.to_string()))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|error| PipelineError::Persistence(error.to_string()))?;
        Ok(())
    }

    async fn read_job(&self, id: Uuid) -> Result<Job, PipelineError> {
        let path = self.job_path(id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(PipelineError::JobNotFound(id));
            }
            Err(error) => return Err(PipelineError::Persistence(error.to_string())),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl JobStore for FsStore {
    async fn create_job(&self, job: &Job) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        if fs::try_exists(self.job_path(job.id)).await.unwrap_or(false) {
            return Err(PipelineError::Persistence(format!(
                "job already exists: {}",
                job.id
            )));
        }
        self.write_job(job).await
    }

    async fn load_job(&self, id: Uuid) -> Result<Job, PipelineError> {
        self.read_job(id).await
    }

    async fn save_job_if_status(
        &self,
        job: &Job,
        expected: JobStatus,
    ) -> Result<(), PipelineError> {
        let _guard = self.write_lock.lock().await;
        let current = self.read_job(job.id).await?;
        if current.status != expected {
            return Err(PipelineError::OrchestrationConflict {
                job_id: job.id,
                expected,
                found: current.status,
            });
        }
        self.write_job(job).await
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, PipelineError> {
        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.jobs_dir)
            .await
            .map_err(|error| PipelineError::Persistence(error.to_string()))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| PipelineError::Persistence(error.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)
                .await
                .map_err(|error| PipelineError::Persistence(error.to_string()))?;
            jobs.push(serde_json::from_slice(&bytes)?);
        }

        jobs.sort_by_key(|job: &Job| job.created_at);
        Ok(jobs)
    }
}

#[async_trait]
impl BlobStore for FsStore {
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), PipelineError> {
        fs::write(self.blobs_dir.join(key), bytes)
            .await
            .map_err(|error| PipelineError::Persistence(error.to_string()))
    }

    async fn get_blob(&self, key: &str) -> Result<Vec<u8>, PipelineError> {
        fs::read(self.blobs_dir.join(key))
            .await
            .map_err(|error| PipelineError::Persistence(format!("blob not found: {key} ({error})")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn jobs_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let job = Job::new("lease.pdf", 12, "application/pdf", "blob-1");
        {
            let store = FsStore::open(dir.path()).await.unwrap();
            store.create_job(&job).await.unwrap();
        }

        let store = FsStore::open(dir.path()).await.unwrap();
        let loaded = store.load_job(job.id).await.unwrap();
        assert_eq!(loaded.filename, "lease.pdf");
        assert_eq!(loaded.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn status_mismatch_is_a_conflict() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let mut job = Job::new("lease.pdf", 12, "application/pdf", "blob-1");
        store.create_job(&job).await.unwrap();

        job.status = JobStatus::Classify;
        store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap();

        let error = store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PipelineError::OrchestrationConflict { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_job_is_reported_as_missing() {
        let dir = tempdir().unwrap();
        let store = FsStore::open(dir.path()).await.unwrap();
        let error = store.load_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(error, PipelineError::JobNotFound(_)));
    }
}
