use crate::engines::{EngineInput, MIME_DOCX, MIME_PDF, MIME_TEXT};
use crate::error::{PipelineError, Result};
use crate::models::{Job, JobStatus, StatusView, SummariseResult};
use crate::orchestrator::DocumentPipeline;
use crate::report::{render_html, render_report, render_text};
use crate::traits::{BlobStore, JobStore};
use std::path::{Path, PathBuf};
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// What the caller gets back from a submission.
#[derive(Debug)]
pub enum SubmissionOutcome {
    /// Processed synchronously; the job is terminal.
    Quick { job: Job },
    /// Queued (or demoted from the quick path); the caller polls by id.
    Background {
        job_id: Uuid,
        message: String,
        alternatives: Vec<String>,
    },
    /// Targeted extraction; no job record was created.
    SinglePage {
        page: u32,
        engine: String,
        text: String,
    },
}

#[derive(Debug)]
pub struct SkippedFile {
    pub path: PathBuf,
    pub reason: String,
}

/// Best-effort folder ingestion result.
#[derive(Debug, Default)]
pub struct FolderOutcome {
    pub submitted: Vec<Uuid>,
    pub skipped: Vec<SkippedFile>,
}

/// Content type from the file extension; `None` means the file is not a
/// document we handle.
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("pdf") => Some(MIME_PDF),
        Some("docx") => Some(MIME_DOCX),
        Some("txt") => Some(MIME_TEXT),
        Some("png") => Some("image/png"),
        Some("jpg") | Some("jpeg") => Some("image/jpeg"),
        _ => None,
    }
}

pub fn content_checksum(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn background_alternatives() -> Vec<String> {
    vec![
        "Poll the job status until it reaches READY".to_string(),
        "Request a single page for an immediate targeted answer".to_string(),
    ]
}

impl<S: JobStore, B: BlobStore> DocumentPipeline<S, B> {
    /// Validates, stores, and routes one document. Invalid input is rejected
    /// here and never produces a job record.
    pub async fn submit(
        &self,
        filename: &str,
        bytes: &[u8],
        mime_type: &str,
        requested_page: Option<u32>,
        force_background: bool,
    ) -> Result<SubmissionOutcome> {
        crate::router::validate(filename, bytes, mime_type, self.limits())?;

        match crate::router::route(
            bytes,
            mime_type,
            requested_page,
            force_background,
            self.limits(),
        ) {
            crate::router::RouteDecision::SinglePage(page) => {
                let input = EngineInput {
                    bytes,
                    mime_type,
                    filename,
                };
                let extract = self.page(&input, page).await?;
                Ok(SubmissionOutcome::SinglePage {
                    page: extract.page,
                    engine: extract.engine,
                    text: extract.text,
                })
            }
            crate::router::RouteDecision::Quick => {
                let job = self.enqueue(filename, bytes, mime_type).await?;
                let id = job.id;
                info!(%id, filename, "processing on the quick path");
                match timeout(self.limits().quick_budget, self.run_job(id)).await {
                    Ok(done) => Ok(SubmissionOutcome::Quick { job: done? }),
                    Err(_) => {
                        // The quick budget ran out mid-stage. The record keeps
                        // the stage it reached; a worker resumes from there.
                        warn!(%id, "quick budget exhausted, demoting to background");
                        Ok(SubmissionOutcome::Background {
                            job_id: id,
                            message: format!(
                                "the document needs more than {}s, processing continues in the background",
                                self.limits().quick_budget.as_secs()
                            ),
                            alternatives: background_alternatives(),
                        })
                    }
                }
            }
            crate::router::RouteDecision::Background => {
                let job = self.enqueue(filename, bytes, mime_type).await?;
                info!(id = %job.id, filename, "queued for background processing");
                Ok(SubmissionOutcome::Background {
                    job_id: job.id,
                    message: "the document was queued for background processing".to_string(),
                    alternatives: background_alternatives(),
                })
            }
        }
    }

    async fn enqueue(&self, filename: &str, bytes: &[u8], mime_type: &str) -> Result<Job> {
        let mut job = Job::new(filename, bytes.len() as u64, mime_type, &Uuid::new_v4().to_string());
        job.sha256 = Some(content_checksum(bytes));
        self.blobs().put_blob(&job.blob_key, bytes).await?;
        self.store().create_job(&job).await?;
        Ok(job)
    }

    async fn page(
        &self,
        input: &EngineInput<'_>,
        page: u32,
    ) -> Result<crate::engines::PageExtract> {
        self.chain().run_page(input, page).await
    }

    /// Walks a folder and submits every recognized document for background
    /// processing. Unreadable or invalid files are reported, not fatal.
    pub async fn submit_folder(&self, root: impl AsRef<Path>) -> Result<FolderOutcome> {
        let mut outcome = FolderOutcome::default();

        for entry in WalkDir::new(root.as_ref()).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(error) => {
                    outcome.skipped.push(SkippedFile {
                        path: error.path().unwrap_or(Path::new("?")).to_path_buf(),
                        reason: error.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();

            let Some(mime_type) = mime_for_path(&path) else {
                outcome.skipped.push(SkippedFile {
                    path,
                    reason: "unrecognized file extension".to_string(),
                });
                continue;
            };
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    outcome.skipped.push(SkippedFile {
                        path,
                        reason: format!("unreadable: {error}"),
                    });
                    continue;
                }
            };
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("document")
                .to_string();

            if let Err(error) = crate::router::validate(&filename, &bytes, mime_type, self.limits())
            {
                outcome.skipped.push(SkippedFile {
                    path,
                    reason: error.to_string(),
                });
                continue;
            }

            match self.enqueue(&filename, &bytes, mime_type).await {
                Ok(job) => outcome.submitted.push(job.id),
                Err(error) => outcome.skipped.push(SkippedFile {
                    path,
                    reason: format!("enqueue failed: {error}"),
                }),
            }
        }

        info!(
            submitted = outcome.submitted.len(),
            skipped = outcome.skipped.len(),
            "folder submission complete"
        );
        Ok(outcome)
    }

    /// Polling view of one job.
    pub async fn status(&self, id: Uuid) -> Result<StatusView> {
        Ok(self.store().load_job(id).await?.status_view())
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        self.store().list_jobs().await
    }

    /// Re-renders the report from the persisted stage outputs. Rendering is
    /// deterministic, so this reproduces the original output exactly.
    pub async fn rerender(&self, id: Uuid) -> Result<SummariseResult> {
        let job = self.store().load_job(id).await?;
        if job.status != JobStatus::Ready {
            return Err(PipelineError::Engine(format!(
                "job {id} is {} and has no report",
                job.status
            )));
        }
        let per_page = job
            .ocr
            .as_ref()
            .map(|result| result.per_page.clone())
            .unwrap_or_default();
        let report = render_report(job.fields(), &per_page, self.citations());
        Ok(SummariseResult {
            rendered_text: render_text(&report),
            rendered_html: render_html(&report),
            report,
        })
    }

    /// Runs every non-terminal job to completion, oldest first.
    pub async fn run_pending(&self) -> Result<Vec<Job>> {
        let mut finished = Vec::new();
        for job in self.store().list_jobs().await? {
            if job.status.is_terminal() {
                continue;
            }
            finished.push(self.run_job(job.id).await?);
        }
        Ok(finished)
    }
}
