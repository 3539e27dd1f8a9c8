use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Lifecycle of a document job. Transitions are monotonic along the stage
/// order; READY, FAILED and CANCELLED are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Classify,
    Ocr,
    Extract,
    Chunk,
    Summarise,
    Ready,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Ready | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The single forward status in the stage order, if any.
    pub fn next_in_order(&self) -> Option<JobStatus> {
        match self {
            JobStatus::Queued => Some(JobStatus::Classify),
            JobStatus::Classify => Some(JobStatus::Ocr),
            JobStatus::Ocr => Some(JobStatus::Extract),
            JobStatus::Extract => Some(JobStatus::Chunk),
            JobStatus::Chunk => Some(JobStatus::Summarise),
            JobStatus::Summarise => Some(JobStatus::Ready),
            JobStatus::Ready | JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// Declared transition graph: one forward edge per state, FAILED from any
    /// non-terminal state, CANCELLED from any pending (non-terminal) state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == JobStatus::Failed || next == JobStatus::Cancelled {
            return true;
        }
        self.next_in_order() == Some(next)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Classify => "CLASSIFY",
            JobStatus::Ocr => "OCR",
            JobStatus::Extract => "EXTRACT",
            JobStatus::Chunk => "CHUNK",
            JobStatus::Summarise => "SUMMARISE",
            JobStatus::Ready => "READY",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// A pipeline stage. The status of a running job names the stage currently
/// in progress, so a crashed job resumes from the recorded stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Classify,
    Ocr,
    Extract,
    Chunk,
    Summarise,
}

impl Stage {
    pub fn status(&self) -> JobStatus {
        match self {
            Stage::Classify => JobStatus::Classify,
            Stage::Ocr => JobStatus::Ocr,
            Stage::Extract => JobStatus::Extract,
            Stage::Chunk => JobStatus::Chunk,
            Stage::Summarise => JobStatus::Summarise,
        }
    }

    /// Text acquisition and summarisation abort the job on failure; the
    /// enrichment stages log and continue.
    pub fn is_fatal(&self) -> bool {
        match self {
            Stage::Ocr | Stage::Extract | Stage::Summarise => true,
            Stage::Classify | Stage::Chunk => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.status(), f)
    }
}

/// Diagnostic record for one engine tried against one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub engine: String,
    pub priority: usize,
    pub succeeded: bool,
    pub text_len: usize,
    pub duration_ms: u64,
    pub rejection: Option<String>,
}

/// How a field value came to be.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldOrigin {
    Matched,
    Derived,
    NotFound,
}

/// Lease terms the field extractor targets. Every key appears in the
/// extraction output, matched or not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    PropertyAddress,
    Lessor,
    Lessee,
    TitleReference,
    TermStart,
    TermEnd,
    TermYears,
    RentTerms,
    GroundRentTerms,
    ServiceChargePercent,
    ApportionmentBasis,
    RepairsSummary,
    AlterationsSummary,
    SublettingSummary,
    InsuranceSummary,
}

impl FieldKey {
    pub const ALL: [FieldKey; 15] = [
        FieldKey::PropertyAddress,
        FieldKey::Lessor,
        FieldKey::Lessee,
        FieldKey::TitleReference,
        FieldKey::TermStart,
        FieldKey::TermEnd,
        FieldKey::TermYears,
        FieldKey::RentTerms,
        FieldKey::GroundRentTerms,
        FieldKey::ServiceChargePercent,
        FieldKey::ApportionmentBasis,
        FieldKey::RepairsSummary,
        FieldKey::AlterationsSummary,
        FieldKey::SublettingSummary,
        FieldKey::InsuranceSummary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::PropertyAddress => "property_address",
            FieldKey::Lessor => "lessor",
            FieldKey::Lessee => "lessee",
            FieldKey::TitleReference => "title_reference",
            FieldKey::TermStart => "term_start",
            FieldKey::TermEnd => "term_end",
            FieldKey::TermYears => "term_years",
            FieldKey::RentTerms => "rent_terms",
            FieldKey::GroundRentTerms => "ground_rent_terms",
            FieldKey::ServiceChargePercent => "service_charge_percent",
            FieldKey::ApportionmentBasis => "apportionment_basis",
            FieldKey::RepairsSummary => "repairs_summary",
            FieldKey::AlterationsSummary => "alterations_summary",
            FieldKey::SublettingSummary => "subletting_summary",
            FieldKey::InsuranceSummary => "insurance_summary",
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One confidence-scored extracted lease term.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub key: FieldKey,
    pub value: String,
    pub confidence: f32,
    pub origin: FieldOrigin,
}

/// A pin-cite: a structured cross-reference located in the source text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Zero-based page index, when per-page text was available.
    pub page: Option<u32>,
    /// Character offset of the reference within its page (or the full text).
    pub offset: usize,
    /// Canonical reference, e.g. "Schedule 5, paragraph 8.1".
    pub reference: String,
    /// Source text surrounding the reference.
    pub snippet: String,
}

/// Three-band reduction of a confidence score for display.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.8 {
            ConfidenceBand::High
        } else if score >= 0.5 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn glyph(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "🟢",
            ConfidenceBand::Medium => "🟠",
            ConfidenceBand::Low => "🔴",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "High confidence",
            ConfidenceBand::Medium => "Medium confidence",
            ConfidenceBand::Low => "Low confidence",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSection {
    pub title: String,
    pub body: String,
    pub band: ConfidenceBand,
    pub citations: Vec<Citation>,
}

/// Ordered report derived purely from fields and citations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Report {
    pub sections: Vec<ReportSection>,
}

/// One indexed slice of per-page text produced by the CHUNK stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunk {
    pub index: u64,
    pub page: u32,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Lease,
    Deed,
    Other,
}

/// Typed output of the CLASSIFY stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyResult {
    pub kind: DocumentKind,
    pub estimated_pages: u32,
    pub filename_hints: Vec<String>,
}

/// Typed output of the OCR stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    pub per_page: Vec<String>,
    pub engine: String,
    pub attempts: Vec<ExtractionAttempt>,
}

/// Typed output of the EXTRACT stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResult {
    pub fields: Vec<Field>,
}

/// Typed output of the CHUNK stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResult {
    pub chunks: Vec<TextChunk>,
}

/// Typed output of the SUMMARISE stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummariseResult {
    pub report: Report,
    pub rendered_text: String,
    pub rendered_html: String,
}

/// A unit of work tracking one document through the pipeline. Mutated only
/// by orchestrator stages; content fields are immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub blob_key: String,
    /// Hex sha-256 of the uploaded bytes, set at submission.
    pub sha256: Option<String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub failed_stage: Option<Stage>,
    pub classify: Option<ClassifyResult>,
    pub ocr: Option<OcrResult>,
    pub extract: Option<ExtractResult>,
    pub chunk: Option<ChunkResult>,
    pub summarise: Option<SummariseResult>,
}

impl Job {
    pub fn new(filename: &str, size_bytes: u64, mime_type: &str, blob_key: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            size_bytes,
            mime_type: mime_type.to_string(),
            blob_key: blob_key.to_string(),
            sha256: None,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            error_message: None,
            failed_stage: None,
            classify: None,
            ocr: None,
            extract: None,
            chunk: None,
            summarise: None,
        }
    }

    pub fn extracted_text(&self) -> Option<&str> {
        self.ocr.as_ref().map(|result| result.text.as_str())
    }

    pub fn fields(&self) -> &[Field] {
        self.extract
            .as_ref()
            .map(|result| result.fields.as_slice())
            .unwrap_or_default()
    }

    pub fn report(&self) -> Option<&Report> {
        self.summarise.as_ref().map(|result| &result.report)
    }

    /// Polling view: what status reads expose (report only when READY).
    pub fn status_view(&self) -> StatusView {
        StatusView {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            error_message: self.error_message.clone(),
            failed_stage: self.failed_stage,
            report: if self.status == JobStatus::Ready {
                self.report().cloned()
            } else {
                None
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusView {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub failed_stage: Option<Stage>,
    pub report: Option<Report>,
}

/// Tunable budgets and heuristic thresholds. The gate constants are
/// empirical, not contractual; callers may override any of them.
#[derive(Debug, Clone)]
pub struct PipelineLimits {
    pub max_file_bytes: u64,
    pub max_pages: u32,
    pub quick_max_bytes: u64,
    pub quick_max_pages: u32,
    pub quick_budget: Duration,
    pub engine_budget: Duration,
    pub job_budget: Duration,
    /// Quality gate: minimum acceptable extracted text length.
    pub min_text_chars: usize,
    /// Quality gate: minimum alphabetic character ratio.
    pub min_alpha_ratio: f32,
    /// Quality gate: at least one of these must appear (empty list disables).
    pub domain_keywords: Vec<String>,
    /// A structural extraction shorter than this triggers rasterization.
    pub raster_trigger_chars: usize,
    /// Pages rasterized at most per document.
    pub raster_max_pages: u32,
    pub raster_dpi: u32,
}

impl Default for PipelineLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            max_pages: 300,
            quick_max_bytes: 5 * 1024 * 1024,
            quick_max_pages: 30,
            quick_budget: Duration::from_secs(180),
            engine_budget: Duration::from_secs(60),
            job_budget: Duration::from_secs(600),
            min_text_chars: 50,
            min_alpha_ratio: 0.55,
            domain_keywords: [
                "lease",
                "tenant",
                "landlord",
                "lessor",
                "lessee",
                "demise",
                "rent",
                "covenant",
                "premises",
                "property",
            ]
            .iter()
            .map(|keyword| keyword.to_string())
            .collect(),
            raster_trigger_chars: 50,
            raster_max_pages: 180,
            raster_dpi: 150,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: [JobStatus; 9] = [
        JobStatus::Queued,
        JobStatus::Classify,
        JobStatus::Ocr,
        JobStatus::Extract,
        JobStatus::Chunk,
        JobStatus::Summarise,
        JobStatus::Ready,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    #[test]
    fn forward_transitions_follow_the_declared_order() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Classify));
        assert!(JobStatus::Classify.can_transition_to(JobStatus::Ocr));
        assert!(JobStatus::Ocr.can_transition_to(JobStatus::Extract));
        assert!(JobStatus::Extract.can_transition_to(JobStatus::Chunk));
        assert!(JobStatus::Chunk.can_transition_to(JobStatus::Summarise));
        assert!(JobStatus::Summarise.can_transition_to(JobStatus::Ready));

        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Ocr));
        assert!(!JobStatus::Ocr.can_transition_to(JobStatus::Classify));
        assert!(!JobStatus::Extract.can_transition_to(JobStatus::Ready));
    }

    #[test]
    fn terminal_states_admit_no_transition() {
        for terminal in [JobStatus::Ready, JobStatus::Failed, JobStatus::Cancelled] {
            for next in ALL_STATUSES {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} should be rejected"
                );
            }
        }
    }

    #[test]
    fn any_pending_state_may_fail_or_cancel() {
        for status in ALL_STATUSES {
            if status.is_terminal() {
                continue;
            }
            assert!(status.can_transition_to(JobStatus::Failed));
            assert!(status.can_transition_to(JobStatus::Cancelled));
        }
    }

    #[test]
    fn status_serializes_in_screaming_case() {
        let serialized = serde_json::to_string(&JobStatus::Ocr).unwrap();
        assert_eq!(serialized, "\"OCR\"");
        let back: JobStatus = serde_json::from_str("\"SUMMARISE\"").unwrap();
        assert_eq!(back, JobStatus::Summarise);
    }

    #[test]
    fn failure_policy_is_asymmetric() {
        assert!(Stage::Ocr.is_fatal());
        assert!(Stage::Extract.is_fatal());
        assert!(Stage::Summarise.is_fatal());
        assert!(!Stage::Classify.is_fatal());
        assert!(!Stage::Chunk.is_fatal());
    }

    #[test]
    fn status_view_hides_report_until_ready() {
        let mut job = Job::new("lease.pdf", 42, "application/pdf", "blob-1");
        job.summarise = Some(SummariseResult {
            report: Report { sections: vec![] },
            rendered_text: String::new(),
            rendered_html: String::new(),
        });

        assert!(job.status_view().report.is_none());
        job.status = JobStatus::Ready;
        assert!(job.status_view().report.is_some());
    }

    #[test]
    fn confidence_bands_cut_at_declared_thresholds() {
        assert_eq!(ConfidenceBand::from_score(0.9), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::from_score(0.8), ConfidenceBand::High);
        assert_eq!(ConfidenceBand::from_score(0.79), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_score(0.5), ConfidenceBand::Medium);
        assert_eq!(ConfidenceBand::from_score(0.3), ConfidenceBand::Low);
    }
}
