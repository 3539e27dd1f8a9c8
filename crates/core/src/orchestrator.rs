use crate::chunking::{build_chunks, ChunkingConfig};
use crate::citations::CitationFinder;
use crate::classify::classify;
use crate::engines::{EngineInput, ExtractionChain};
use crate::error::{PipelineError, Result};
use crate::fields::FieldExtractor;
use crate::models::{
    ChunkResult, ExtractResult, Job, JobStatus, OcrResult, PipelineLimits, Stage, SummariseResult,
};
use crate::report::{render_html, render_report, render_text};
use crate::traits::{BlobStore, JobStore};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PERSIST_RETRIES: u32 = 3;
const PERSIST_BASE_DELAY: Duration = Duration::from_millis(100);

fn stage_for(status: JobStatus) -> Option<Stage> {
    match status {
        JobStatus::Classify => Some(Stage::Classify),
        JobStatus::Ocr => Some(Stage::Ocr),
        JobStatus::Extract => Some(Stage::Extract),
        JobStatus::Chunk => Some(Stage::Chunk),
        JobStatus::Summarise => Some(Stage::Summarise),
        _ => None,
    }
}

/// Drives jobs through the stage order against pluggable stores. One
/// pipeline instance serves many jobs; all per-job state lives in the store.
///
/// Concurrency control is optimistic: every stage write is status-checked,
/// and a conflict means another writer (or a cancellation) got there first,
/// so the loop reloads and re-decides instead of holding any lock.
pub struct DocumentPipeline<S, B> {
    store: Arc<S>,
    blobs: Arc<B>,
    chain: Arc<ExtractionChain>,
    fields: FieldExtractor,
    citations: CitationFinder,
    chunking: ChunkingConfig,
    limits: PipelineLimits,
}

impl<S: JobStore, B: BlobStore> DocumentPipeline<S, B> {
    pub fn new(
        store: Arc<S>,
        blobs: Arc<B>,
        chain: Arc<ExtractionChain>,
        limits: PipelineLimits,
    ) -> Result<Self> {
        Ok(Self {
            store,
            blobs,
            chain,
            fields: FieldExtractor::new()?,
            citations: CitationFinder::new()?,
            chunking: ChunkingConfig::default(),
            limits,
        })
    }

    pub fn with_chunking(mut self, chunking: ChunkingConfig) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn blobs(&self) -> &Arc<B> {
        &self.blobs
    }

    pub fn chain(&self) -> &Arc<ExtractionChain> {
        &self.chain
    }

    pub fn citations(&self) -> &CitationFinder {
        &self.citations
    }

    pub fn limits(&self) -> &PipelineLimits {
        &self.limits
    }

    /// Runs one job to a terminal state under the job ceiling. A job that
    /// overruns the ceiling is forced to FAILED rather than left dangling.
    pub async fn run_job(&self, id: Uuid) -> Result<Job> {
        match timeout(self.limits.job_budget, self.advance_to_completion(id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(%id, "job exceeded its ceiling, forcing FAILED");
                self.force_fail(id).await
            }
        }
    }

    /// The stage loop. Each iteration reloads the record, performs the stage
    /// named by the current status, and advances with a status-checked write.
    /// Stages whose output already exists are skipped, so a resumed job never
    /// redoes completed work.
    pub async fn advance_to_completion(&self, id: Uuid) -> Result<Job> {
        loop {
            let mut job = self.store.load_job(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }

            let current = job.status;
            let Some(stage) = stage_for(current) else {
                // QUEUED: claim the job by moving it into CLASSIFY.
                job.status = JobStatus::Classify;
                job.updated_at = Utc::now();
                self.persist(&job, current).await?;
                continue;
            };

            match self.execute_stage(&mut job, stage).await {
                Ok(()) => {
                    if let Some(next) = current.next_in_order() {
                        job.status = next;
                    }
                }
                Err(error) if stage.is_fatal() => {
                    warn!(%id, %stage, %error, "fatal stage failure");
                    job.status = JobStatus::Failed;
                    job.error_message = Some(error.to_string());
                    job.failed_stage = Some(stage);
                }
                Err(error) => {
                    // Enrichment stages degrade the report, not the job.
                    warn!(%id, %stage, %error, "non-fatal stage failure, continuing");
                    if let Some(next) = current.next_in_order() {
                        job.status = next;
                    }
                }
            }

            job.updated_at = Utc::now();
            self.persist(&job, current).await?;
        }
    }

    async fn execute_stage(&self, job: &mut Job, stage: Stage) -> Result<()> {
        match stage {
            Stage::Classify => {
                if job.classify.is_some() {
                    debug!(id = %job.id, "classify output present, skipping");
                    return Ok(());
                }
                let bytes = self.blobs.get_blob(&job.blob_key).await?;
                job.classify = Some(classify(&job.filename, &bytes, &job.mime_type));
            }
            Stage::Ocr => {
                if job.ocr.is_some() {
                    debug!(id = %job.id, "ocr output present, skipping");
                    return Ok(());
                }
                let bytes = self.blobs.get_blob(&job.blob_key).await?;
                let input = EngineInput {
                    bytes: &bytes,
                    mime_type: &job.mime_type,
                    filename: &job.filename,
                };
                let outcome = self.chain.run(&input).await?;
                info!(id = %job.id, engine = %outcome.engine, chars = outcome.output.text.len(),
                      "text extracted");
                job.ocr = Some(OcrResult {
                    text: outcome.output.text,
                    per_page: outcome.output.per_page,
                    engine: outcome.engine,
                    attempts: outcome.attempts,
                });
            }
            Stage::Extract => {
                if job.extract.is_some() {
                    debug!(id = %job.id, "extract output present, skipping");
                    return Ok(());
                }
                let text = job
                    .extracted_text()
                    .ok_or_else(|| PipelineError::Engine("no extracted text on record".into()))?;
                job.extract = Some(ExtractResult {
                    fields: self.fields.extract(text),
                });
            }
            Stage::Chunk => {
                if job.chunk.is_some() {
                    debug!(id = %job.id, "chunk output present, skipping");
                    return Ok(());
                }
                let per_page = job
                    .ocr
                    .as_ref()
                    .map(|result| result.per_page.clone())
                    .unwrap_or_default();
                job.chunk = Some(ChunkResult {
                    chunks: build_chunks(&per_page, self.chunking)?,
                });
            }
            Stage::Summarise => {
                if job.summarise.is_some() {
                    debug!(id = %job.id, "summarise output present, skipping");
                    return Ok(());
                }
                let per_page = job
                    .ocr
                    .as_ref()
                    .map(|result| result.per_page.clone())
                    .unwrap_or_default();
                let report = render_report(job.fields(), &per_page, &self.citations);
                job.summarise = Some(SummariseResult {
                    rendered_text: render_text(&report),
                    rendered_html: render_html(&report),
                    report,
                });
            }
        }
        Ok(())
    }

    /// Status-checked save. A conflict means a competing writer advanced or
    /// cancelled the job; that is not an error for the loop, which reloads
    /// and re-decides.
    async fn persist(&self, job: &Job, expected: JobStatus) -> Result<()> {
        let mut delay = PERSIST_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match self.store.save_job_if_status(job, expected).await {
                Ok(()) => return Ok(()),
                Err(PipelineError::OrchestrationConflict { found, .. }) => {
                    warn!(id = %job.id, %expected, %found, "save conflict, will reload");
                    return Ok(());
                }
                Err(error) if error.is_retryable() && attempt < PERSIST_RETRIES => {
                    attempt += 1;
                    warn!(id = %job.id, %error, attempt, "save failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Marks an over-ceiling job FAILED at whatever stage it reached.
    async fn force_fail(&self, id: Uuid) -> Result<Job> {
        let mut job = self.store.load_job(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        let current = job.status;
        let budget_secs = self.limits.job_budget.as_secs();
        let message = match stage_for(current) {
            Some(stage) => PipelineError::StageTimeout { stage, budget_secs }.to_string(),
            None => format!("job exceeded its {budget_secs}s ceiling before starting"),
        };
        job.failed_stage = stage_for(current);
        job.status = JobStatus::Failed;
        job.error_message = Some(message);
        job.updated_at = Utc::now();
        self.persist(&job, current).await?;
        self.store.load_job(id).await
    }

    /// Cooperative cancellation: takes effect at the next stage boundary. A
    /// terminal job is returned unchanged.
    pub async fn cancel(&self, id: Uuid) -> Result<Job> {
        loop {
            let mut job = self.store.load_job(id).await?;
            if job.status.is_terminal() {
                return Ok(job);
            }
            let current = job.status;
            job.status = JobStatus::Cancelled;
            job.updated_at = Utc::now();
            match self.store.save_job_if_status(&job, current).await {
                Ok(()) => return Ok(job),
                Err(PipelineError::OrchestrationConflict { .. }) => continue,
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::{
        EngineOutcome, EngineOutput, ExtractionEngine, NativeTextEngine, PageRasterizer, MIME_TEXT,
    };
    use crate::models::DocumentKind;
    use crate::stores::MemoryStore;
    use async_trait::async_trait;

    const LEASE_TEXT: &str = "THIS LEASE is made between Grosvenor Estates Limited (the \
        Landlord) and Jane Example (the Tenant) of the premises at 12 Example Street, London \
        for a term of 99 years commencing on 25 December 1986 at a rent of one peppercorn per \
        annum. The tenant covenants to repair the premises as set out in Schedule 5, \
        paragraph 8.1.";

    struct NoImagePages;

    #[async_trait]
    impl PageRasterizer for NoImagePages {
        async fn rasterize(
            &self,
            _bytes: &[u8],
            _first_page: u32,
            _max_pages: u32,
            _dpi: u32,
        ) -> Result<Vec<Vec<u8>>> {
            Ok(Vec::new())
        }
    }

    struct RejectingEngine;

    #[async_trait]
    impl ExtractionEngine for RejectingEngine {
        fn name(&self) -> &'static str {
            "rejecting"
        }
        fn supports(&self, _input: &EngineInput<'_>) -> bool {
            true
        }
        async fn attempt(&self, _input: &EngineInput<'_>) -> Result<EngineOutcome> {
            Ok(EngineOutcome::Rejected("nothing readable".to_string()))
        }
    }

    struct SlowEngine;

    #[async_trait]
    impl ExtractionEngine for SlowEngine {
        fn name(&self) -> &'static str {
            "slow"
        }
        fn supports(&self, _input: &EngineInput<'_>) -> bool {
            true
        }
        async fn attempt(&self, _input: &EngineInput<'_>) -> Result<EngineOutcome> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(EngineOutcome::Extracted(EngineOutput {
                text: LEASE_TEXT.to_string(),
                per_page: vec![LEASE_TEXT.to_string()],
            }))
        }
    }

    fn chain_with(engines: Vec<Arc<dyn ExtractionEngine>>, limits: &PipelineLimits) -> Arc<ExtractionChain> {
        Arc::new(ExtractionChain::new(
            engines,
            Arc::new(NoImagePages),
            limits.clone(),
        ))
    }

    async fn seed_job(store: &MemoryStore, text: &str) -> Job {
        let job = Job::new("flat_7_lease.txt", text.len() as u64, MIME_TEXT, "blob-1");
        store.put_blob("blob-1", text.as_bytes()).await.unwrap();
        store.create_job(&job).await.unwrap();
        job
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        engines: Vec<Arc<dyn ExtractionEngine>>,
        limits: PipelineLimits,
    ) -> DocumentPipeline<MemoryStore, MemoryStore> {
        let chain = chain_with(engines, &limits);
        DocumentPipeline::new(Arc::clone(&store), store, chain, limits).unwrap()
    }

    #[tokio::test]
    async fn a_job_runs_to_ready_with_all_stage_outputs() {
        let store = Arc::new(MemoryStore::new());
        let job = seed_job(&store, LEASE_TEXT).await;
        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(NativeTextEngine)],
            PipelineLimits::default(),
        );

        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Ready);
        assert!(done.classify.is_some());
        assert!(done.ocr.is_some());
        assert!(done.extract.is_some());
        assert!(done.chunk.is_some());
        let summarise = done.summarise.unwrap();
        assert!(!summarise.rendered_text.is_empty());
        assert!(summarise
            .report
            .sections
            .iter()
            .any(|section| section.title == "Executive Summary"));
    }

    #[tokio::test]
    async fn exhausted_extraction_fails_the_job_at_ocr() {
        let store = Arc::new(MemoryStore::new());
        let job = seed_job(&store, "unreadable").await;
        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(RejectingEngine)],
            PipelineLimits::default(),
        );

        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.failed_stage, Some(Stage::Ocr));
        assert!(done.error_message.unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn a_resumed_stage_keeps_its_existing_output() {
        let store = Arc::new(MemoryStore::new());
        let mut job = seed_job(&store, LEASE_TEXT).await;

        // Simulate a worker that crashed after writing CLASSIFY output but
        // while the status still named the stage.
        job.status = JobStatus::Classify;
        job.classify = Some(crate::models::ClassifyResult {
            kind: DocumentKind::Deed,
            estimated_pages: 777,
            filename_hints: vec!["marker".to_string()],
        });
        store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap();

        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(NativeTextEngine)],
            PipelineLimits::default(),
        );
        let done = pipeline.run_job(job.id).await.unwrap();

        assert_eq!(done.status, JobStatus::Ready);
        let classify = done.classify.unwrap();
        assert_eq!(classify.estimated_pages, 777);
        assert_eq!(classify.kind, DocumentKind::Deed);
    }

    #[tokio::test]
    async fn chunking_failure_does_not_fail_the_job() {
        let store = Arc::new(MemoryStore::new());
        let job = seed_job(&store, LEASE_TEXT).await;
        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(NativeTextEngine)],
            PipelineLimits::default(),
        )
        .with_chunking(ChunkingConfig {
            max_chars: 10,
            overlap_chars: 10,
            min_chars: 1,
        });

        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Ready);
        assert!(done.chunk.is_none());
        assert!(done.summarise.is_some());
    }

    #[tokio::test]
    async fn a_cancelled_job_is_left_untouched() {
        let store = Arc::new(MemoryStore::new());
        let mut job = seed_job(&store, LEASE_TEXT).await;
        job.status = JobStatus::Cancelled;
        store
            .save_job_if_status(&job, JobStatus::Queued)
            .await
            .unwrap();

        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(NativeTextEngine)],
            PipelineLimits::default(),
        );
        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
        assert!(done.ocr.is_none());
    }

    #[tokio::test]
    async fn the_job_ceiling_forces_failed() {
        let store = Arc::new(MemoryStore::new());
        let job = seed_job(&store, LEASE_TEXT).await;
        let mut limits = PipelineLimits::default();
        limits.job_budget = Duration::from_millis(50);
        let pipeline = pipeline(Arc::clone(&store), vec![Arc::new(SlowEngine)], limits);

        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.failed_stage, Some(Stage::Ocr));
        assert!(done.error_message.unwrap().contains("exceeded"));
    }

    #[tokio::test]
    async fn cancel_is_effective_between_stages() {
        let store = Arc::new(MemoryStore::new());
        let job = seed_job(&store, LEASE_TEXT).await;
        let pipeline = pipeline(
            Arc::clone(&store),
            vec![Arc::new(NativeTextEngine)],
            PipelineLimits::default(),
        );

        let cancelled = pipeline.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let done = pipeline.run_job(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Cancelled);
    }
}
