pub mod chunking;
pub mod citations;
pub mod classify;
pub mod engines;
pub mod error;
pub mod fields;
pub mod models;
pub mod orchestrator;
pub mod report;
pub mod router;
pub mod stores;
pub mod submit;
pub mod traits;

pub use chunking::{build_chunks, chunk_by_paragraph, normalize_whitespace, ChunkingConfig};
pub use citations::{CitationFinder, DEFAULT_TOP_K};
pub use classify::{classify, estimate_page_count, filename_hints};
pub use engines::{
    quality_gate, ChainOutcome, DocAiEngine, EngineInput, EngineOutcome, EngineOutput,
    ExtractionChain, ExtractionEngine, LocalOcrEngine, NativeTextEngine, OcrServiceEngine,
    PageExtract, PageRasterizer, PdftoppmRasterizer, VisionEngine, MIME_DOCX, MIME_PDF, MIME_TEXT,
};
pub use error::{PipelineError, Result, ValidationError};
pub use fields::{FieldExtractor, PEPPERCORN_VALUE};
pub use models::{
    Citation, ClassifyResult, ConfidenceBand, DocumentKind, ExtractionAttempt, Field, FieldKey,
    FieldOrigin, Job, JobStatus, OcrResult, PipelineLimits, Report, ReportSection, Stage,
    StatusView, SummariseResult, TextChunk,
};
pub use orchestrator::DocumentPipeline;
pub use report::{render_html, render_report, render_text};
pub use router::{route, validate, RouteDecision};
pub use stores::{FsStore, MemoryStore};
pub use submit::{mime_for_path, FolderOutcome, SkippedFile, SubmissionOutcome};
pub use traits::{BlobStore, JobStore};
