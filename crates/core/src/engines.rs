use crate::error::{PipelineError, Result};
use crate::models::{ExtractionAttempt, PipelineLimits};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_TEXT: &str = "text/plain";

/// One document offered to an engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineInput<'a> {
    pub bytes: &'a [u8],
    pub mime_type: &'a str,
    pub filename: &'a str,
}

#[derive(Debug, Clone)]
pub struct EngineOutput {
    pub text: String,
    pub per_page: Vec<String>,
}

/// An engine either produced text or declined with a reason. Infrastructure
/// failures surface as `PipelineError` instead.
#[derive(Debug, Clone)]
pub enum EngineOutcome {
    Extracted(EngineOutput),
    Rejected(String),
}

/// A text-extraction strategy. Engines are tried strictly in priority order
/// by the chain; none may assume it runs first.
#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, input: &EngineInput<'_>) -> bool;

    /// Reads the embedded text layer rather than the rendered page. A
    /// near-empty result from a structural engine triggers rasterization.
    fn structural(&self) -> bool {
        false
    }

    /// Whether the engine can read a single rasterized page image.
    fn reads_page_images(&self) -> bool {
        false
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome>;

    async fn attempt_page_image(&self, _png: &[u8]) -> Result<EngineOutcome> {
        Ok(EngineOutcome::Rejected(
            "engine cannot read page images".to_string(),
        ))
    }
}

/// Heuristic acceptance check applied to every attempt. Returns the
/// rejection reason when the text is implausible.
pub fn quality_gate(text: &str, limits: &PipelineLimits) -> std::result::Result<(), String> {
    let trimmed = text.trim();
    let char_count = trimmed.chars().count();
    if char_count < limits.min_text_chars {
        return Err(format!(
            "text too short: {char_count} chars below the {} char minimum",
            limits.min_text_chars
        ));
    }

    let visible: Vec<char> = trimmed.chars().filter(|ch| !ch.is_whitespace()).collect();
    let alphabetic = visible.iter().filter(|ch| ch.is_alphabetic()).count();
    let ratio = alphabetic as f32 / visible.len().max(1) as f32;
    if ratio < limits.min_alpha_ratio {
        return Err(format!(
            "alphabetic ratio {ratio:.2} below the {:.2} threshold",
            limits.min_alpha_ratio
        ));
    }

    if !limits.domain_keywords.is_empty() {
        let lowered = trimmed.to_lowercase();
        let hit = limits
            .domain_keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()));
        if !hit {
            return Err("no domain keyword present in extracted text".to_string());
        }
    }

    Ok(())
}

/// Reads the embedded text layer of a PDF (or decodes plain text). Cheapest
/// and most structural engine; always first in the chain.
#[derive(Default)]
pub struct NativeTextEngine;

impl NativeTextEngine {
    pub fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>> {
        let document =
            Document::load_mem(bytes).map_err(|error| PipelineError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, _page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| PipelineError::PdfParse(error.to_string()))?;
            pages.push(text.trim().to_string());
        }
        Ok(pages)
    }

    pub fn page_count(bytes: &[u8]) -> Option<u32> {
        Document::load_mem(bytes)
            .ok()
            .map(|document| document.get_pages().len() as u32)
    }
}

#[async_trait]
impl ExtractionEngine for NativeTextEngine {
    fn name(&self) -> &'static str {
        "native-text"
    }

    fn supports(&self, input: &EngineInput<'_>) -> bool {
        input.mime_type == MIME_PDF || input.mime_type == MIME_TEXT
    }

    fn structural(&self) -> bool {
        true
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        if input.mime_type == MIME_TEXT {
            return match std::str::from_utf8(input.bytes) {
                Ok(text) => Ok(EngineOutcome::Extracted(EngineOutput {
                    text: text.trim().to_string(),
                    per_page: vec![text.trim().to_string()],
                })),
                Err(error) => Ok(EngineOutcome::Rejected(format!(
                    "not valid utf-8 text: {error}"
                ))),
            };
        }

        match Self::extract_pdf_pages(input.bytes) {
            Ok(per_page) => {
                let text = per_page
                    .iter()
                    .filter(|page| !page.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n\n");
                Ok(EngineOutcome::Extracted(EngineOutput { text, per_page }))
            }
            Err(error) => Ok(EngineOutcome::Rejected(format!(
                "no readable text layer: {error}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct RemoteDocRequest {
    filename: String,
    mime_type: String,
    content_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteDocResponse {
    text: Option<String>,
    pages: Option<Vec<RemoteDocPage>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteDocPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

fn pages_from_response(payload: &RemoteDocResponse) -> Option<EngineOutput> {
    if let Some(listed) = &payload.pages {
        let mut per_page: Vec<(u32, String)> = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref()?.trim().to_string();
                if text.is_empty() {
                    None
                } else {
                    Some((page.page.unwrap_or(1), text))
                }
            })
            .collect();
        if !per_page.is_empty() {
            per_page.sort_by_key(|(number, _)| *number);
            let pages: Vec<String> = per_page.into_iter().map(|(_, text)| text).collect();
            return Some(EngineOutput {
                text: pages.join("\n\n"),
                per_page: pages,
            });
        }
    }

    if let Some(raw) = &payload.text {
        // Form feed is the conventional page delimiter in flat OCR output.
        let pages: Vec<String> = raw
            .split('\u{000c}')
            .map(|chunk| chunk.trim().to_string())
            .filter(|chunk| !chunk.is_empty())
            .collect();
        if !pages.is_empty() {
            return Some(EngineOutput {
                text: pages.join("\n\n"),
                per_page: pages,
            });
        }
    }

    None
}

/// Cloud document-AI reader: layout-aware managed OCR behind a JSON endpoint.
pub struct DocAiEngine {
    client: Arc<Client>,
    endpoint: Url,
    api_key: Option<String>,
}

impl DocAiEngine {
    pub fn new(client: Arc<Client>, endpoint: Url, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    async fn post_document(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        let payload = RemoteDocRequest {
            filename: input.filename.to_string(),
            mime_type: input.mime_type.to_string(),
            content_base64: STANDARD.encode(input.bytes),
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(EngineOutcome::Rejected(format!(
                "document-AI endpoint returned {}",
                response.status()
            )));
        }

        let payload: RemoteDocResponse = response.json().await?;
        match pages_from_response(&payload) {
            Some(output) => Ok(EngineOutcome::Extracted(output)),
            None => Ok(EngineOutcome::Rejected(
                "document-AI response contained no readable text".to_string(),
            )),
        }
    }
}

#[async_trait]
impl ExtractionEngine for DocAiEngine {
    fn name(&self) -> &'static str {
        "docai"
    }

    fn supports(&self, _input: &EngineInput<'_>) -> bool {
        true
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        self.post_document(input).await
    }
}

#[derive(Debug, Clone, Serialize)]
struct VisionRequest {
    model: String,
    messages: Vec<VisionMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Clone, Serialize)]
struct VisionMessage {
    role: String,
    content: Vec<VisionContent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum VisionContent {
    Text { text: String },
    ImageUrl { image_url: VisionImageUrl },
}

#[derive(Debug, Clone, Serialize)]
struct VisionImageUrl {
    url: String,
    detail: String,
}

#[derive(Debug, Clone, Deserialize)]
struct VisionResponse {
    choices: Vec<VisionChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct VisionChoice {
    message: VisionChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct VisionChoiceMessage {
    content: Option<String>,
}

const VISION_PROMPT: &str = "Extract ALL text from this document. Preserve the \
structure: headings, clause numbers, schedules, and paragraph numbering. \
Return only the transcribed text.";

/// General vision-model reader speaking the chat-completions wire shape.
/// Also serves rasterized page images during the scanned-document fallback.
pub struct VisionEngine {
    client: Arc<Client>,
    endpoint: Url,
    api_key: Option<String>,
    model: String,
}

impl VisionEngine {
    pub fn new(
        client: Arc<Client>,
        endpoint: Url,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint,
            api_key,
            model: model.into(),
        }
    }

    async fn transcribe(&self, data_url: String) -> Result<EngineOutcome> {
        let payload = VisionRequest {
            model: self.model.clone(),
            messages: vec![VisionMessage {
                role: "user".to_string(),
                content: vec![
                    VisionContent::Text {
                        text: VISION_PROMPT.to_string(),
                    },
                    VisionContent::ImageUrl {
                        image_url: VisionImageUrl {
                            url: data_url,
                            detail: "high".to_string(),
                        },
                    },
                ],
            }],
            max_tokens: 4000,
            temperature: 0.0,
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(EngineOutcome::Rejected(format!(
                "vision endpoint returned {}",
                response.status()
            )));
        }

        let payload: VisionResponse = response.json().await?;
        let text = payload
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        if text.is_empty() {
            return Ok(EngineOutcome::Rejected(
                "vision model returned empty text".to_string(),
            ));
        }
        Ok(EngineOutcome::Extracted(EngineOutput {
            per_page: vec![text.clone()],
            text,
        }))
    }
}

#[async_trait]
impl ExtractionEngine for VisionEngine {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn supports(&self, _input: &EngineInput<'_>) -> bool {
        true
    }

    fn reads_page_images(&self) -> bool {
        true
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        let data_url = format!(
            "data:{};base64,{}",
            input.mime_type,
            STANDARD.encode(input.bytes)
        );
        self.transcribe(data_url).await
    }

    async fn attempt_page_image(&self, png: &[u8]) -> Result<EngineOutcome> {
        let data_url = format!("data:image/png;base64,{}", STANDARD.encode(png));
        self.transcribe(data_url).await
    }
}

#[derive(Debug, Clone, Serialize)]
struct OcrServiceRequest {
    mime_type: String,
    content_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrServiceResponse {
    text: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Managed OCR service: robust on noisy scans, priced per page, so it sits
/// behind the cheaper readers.
pub struct OcrServiceEngine {
    client: Arc<Client>,
    endpoint: Url,
    api_key: Option<String>,
}

impl OcrServiceEngine {
    pub fn new(client: Arc<Client>, endpoint: Url, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            api_key,
        }
    }

    async fn recognize(&self, mime_type: &str, bytes: &[u8]) -> Result<EngineOutcome> {
        let payload = OcrServiceRequest {
            mime_type: mime_type.to_string(),
            content_base64: STANDARD.encode(bytes),
        };

        let mut request = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Ok(EngineOutcome::Rejected(format!(
                "ocr service returned {}",
                response.status()
            )));
        }

        let payload: OcrServiceResponse = response.json().await?;
        if let Some(confidence) = payload.confidence {
            debug!(confidence, "ocr service reported recognition confidence");
        }
        let text = payload.text.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            return Ok(EngineOutcome::Rejected(
                "ocr service found no text".to_string(),
            ));
        }
        Ok(EngineOutcome::Extracted(EngineOutput {
            per_page: vec![text.clone()],
            text,
        }))
    }
}

#[async_trait]
impl ExtractionEngine for OcrServiceEngine {
    fn name(&self) -> &'static str {
        "ocr-service"
    }

    fn supports(&self, _input: &EngineInput<'_>) -> bool {
        true
    }

    fn reads_page_images(&self) -> bool {
        true
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        self.recognize(input.mime_type, input.bytes).await
    }

    async fn attempt_page_image(&self, png: &[u8]) -> Result<EngineOutcome> {
        self.recognize("image/png", png).await
    }
}

const LOCAL_OCR_MAX_BYTES: u64 = 10 * 1024 * 1024;

/// Last-resort local OCR via an external `tesseract` binary. Free but slow,
/// and only offered images under a size cap.
#[derive(Default)]
pub struct LocalOcrEngine;

impl LocalOcrEngine {
    async fn recognize_file(&self, bytes: &[u8], extension: &str) -> Result<EngineOutcome> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(format!("page.{extension}"));
        tokio::fs::write(&path, bytes).await?;

        let output = Command::new("tesseract")
            .arg(&path)
            .arg("stdout")
            .arg("-l")
            .arg("eng")
            .output()
            .await
            .map_err(|error| PipelineError::Engine(format!("tesseract not runnable: {error}")))?;

        if !output.status.success() {
            return Ok(EngineOutcome::Rejected(format!(
                "tesseract exited with {}",
                output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Ok(EngineOutcome::Rejected(
                "tesseract found no text".to_string(),
            ));
        }
        Ok(EngineOutcome::Extracted(EngineOutput {
            per_page: vec![text.clone()],
            text,
        }))
    }
}

#[async_trait]
impl ExtractionEngine for LocalOcrEngine {
    fn name(&self) -> &'static str {
        "local-ocr"
    }

    fn supports(&self, input: &EngineInput<'_>) -> bool {
        input.mime_type.starts_with("image/") && (input.bytes.len() as u64) < LOCAL_OCR_MAX_BYTES
    }

    fn reads_page_images(&self) -> bool {
        true
    }

    async fn attempt(&self, input: &EngineInput<'_>) -> Result<EngineOutcome> {
        let extension = input.mime_type.strip_prefix("image/").unwrap_or("png");
        self.recognize_file(input.bytes, extension).await
    }

    async fn attempt_page_image(&self, png: &[u8]) -> Result<EngineOutcome> {
        self.recognize_file(png, "png").await
    }
}

/// Renders PDF pages to PNG for the vision/OCR-class engines. Pluggable so
/// tests can substitute a fake.
#[async_trait]
pub trait PageRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        bytes: &[u8],
        first_page: u32,
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<Vec<u8>>>;
}

/// External `pdftoppm` renderer.
#[derive(Default)]
pub struct PdftoppmRasterizer;

#[async_trait]
impl PageRasterizer for PdftoppmRasterizer {
    async fn rasterize(
        &self,
        bytes: &[u8],
        first_page: u32,
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<Vec<u8>>> {
        let dir = tempfile::tempdir()?;
        let input_path = dir.path().join("input.pdf");
        tokio::fs::write(&input_path, bytes).await?;

        let last_page = first_page.saturating_add(max_pages.saturating_sub(1));
        let status = Command::new("pdftoppm")
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg(first_page.to_string())
            .arg("-l")
            .arg(last_page.to_string())
            .arg(&input_path)
            .arg(dir.path().join("page"))
            .status()
            .await
            .map_err(|error| PipelineError::Engine(format!("pdftoppm not runnable: {error}")))?;

        if !status.success() {
            return Err(PipelineError::Engine(format!(
                "pdftoppm exited with {status}"
            )));
        }

        let mut paths: Vec<_> = std::fs::read_dir(dir.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("png"))
            .collect();
        paths.sort();

        let mut pages = Vec::with_capacity(paths.len());
        for path in paths {
            pages.push(tokio::fs::read(&path).await?);
        }
        Ok(pages)
    }
}

/// Result of a whole-document chain run.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub engine: String,
    pub output: EngineOutput,
    pub attempts: Vec<ExtractionAttempt>,
}

/// Result of a single-page targeted extraction.
#[derive(Debug, Clone)]
pub struct PageExtract {
    pub page: u32,
    pub engine: String,
    pub text: String,
}

/// Drives the engines in strict priority order with first-success semantics
/// and per-attempt time boxes. Clients are constructed once and passed in.
pub struct ExtractionChain {
    engines: Vec<Arc<dyn ExtractionEngine>>,
    rasterizer: Arc<dyn PageRasterizer>,
    limits: PipelineLimits,
}

impl ExtractionChain {
    pub fn new(
        engines: Vec<Arc<dyn ExtractionEngine>>,
        rasterizer: Arc<dyn PageRasterizer>,
        limits: PipelineLimits,
    ) -> Self {
        Self {
            engines,
            rasterizer,
            limits,
        }
    }

    /// Default engine order for a given set of remote clients: cheapest and
    /// most structural first, most robust OCR last.
    pub fn with_default_engines(
        remote: Vec<Arc<dyn ExtractionEngine>>,
        limits: PipelineLimits,
    ) -> Self {
        let mut engines: Vec<Arc<dyn ExtractionEngine>> = vec![Arc::new(NativeTextEngine)];
        engines.extend(remote);
        engines.push(Arc::new(LocalOcrEngine));
        Self::new(engines, Arc::new(PdftoppmRasterizer), limits)
    }

    pub async fn run(&self, input: &EngineInput<'_>) -> Result<ChainOutcome> {
        let mut attempts: Vec<ExtractionAttempt> = Vec::new();
        let mut raster_tried = false;

        for (priority, engine) in self.engines.iter().enumerate() {
            if !engine.supports(input) {
                continue;
            }

            if let Some(output) = self
                .timed_attempt(engine.as_ref(), input, priority, &mut attempts)
                .await
            {
                return Ok(ChainOutcome {
                    engine: engine.name().to_string(),
                    output,
                    attempts,
                });
            }

            // An image-only scan presents as a structural "success" with
            // almost no text; rasterize and re-offer before spending more
            // whole-document attempts.
            let structural_text_len = attempts
                .last()
                .filter(|attempt| attempt.engine == engine.name())
                .map(|attempt| attempt.text_len)
                .unwrap_or(0);
            if engine.structural()
                && !raster_tried
                && input.mime_type == MIME_PDF
                && structural_text_len < self.limits.raster_trigger_chars
            {
                raster_tried = true;
                if let Some(outcome) = self.raster_pass(input, &mut attempts).await {
                    return Ok(outcome);
                }
            }
        }

        let tried: Vec<String> = attempts
            .iter()
            .map(|attempt| attempt.engine.clone())
            .collect();
        Err(PipelineError::ExtractionExhausted(format!(
            "no engine passed the quality gate (tried: {})",
            tried.join(", ")
        )))
    }

    /// Targeted single-page extraction: native text layer first, then the
    /// rasterized page offered to the image-capable engines.
    pub async fn run_page(&self, input: &EngineInput<'_>, page: u32) -> Result<PageExtract> {
        if input.mime_type == MIME_PDF {
            // Bounds are checked before any engine or rasterizer runs, even
            // when the text layer is unreadable.
            let page_ceiling = crate::classify::estimate_page_count(input.bytes, input.mime_type);
            if page == 0 || page > page_ceiling {
                return Err(crate::error::ValidationError::PageOutOfRange {
                    page,
                    pages: page_ceiling,
                }
                .into());
            }

            if let Ok(pages) = NativeTextEngine::extract_pdf_pages(input.bytes) {
                if let Some(text) = pages.get(page as usize - 1) {
                    if quality_gate(text, &self.limits).is_ok() {
                        return Ok(PageExtract {
                            page,
                            engine: NativeTextEngine.name().to_string(),
                            text: text.clone(),
                        });
                    }
                }
            }

            let images = self
                .rasterizer
                .rasterize(input.bytes, page, 1, self.limits.raster_dpi)
                .await?;
            let image = images.first().ok_or_else(|| {
                PipelineError::Engine(format!("rasterizer produced no image for page {page}"))
            })?;

            for engine in self.engines.iter().filter(|e| e.reads_page_images()) {
                let attempt =
                    tokio::time::timeout(self.limits.engine_budget, engine.attempt_page_image(image))
                        .await;
                match attempt {
                    Ok(Ok(EngineOutcome::Extracted(output))) if !output.text.is_empty() => {
                        return Ok(PageExtract {
                            page,
                            engine: engine.name().to_string(),
                            text: output.text,
                        });
                    }
                    Ok(Ok(EngineOutcome::Rejected(reason))) => {
                        debug!(engine = engine.name(), reason, "page attempt rejected");
                    }
                    Ok(Err(error)) => {
                        warn!(engine = engine.name(), %error, "page attempt failed");
                    }
                    Err(_) => {
                        warn!(engine = engine.name(), "page attempt timed out");
                    }
                    _ => {}
                }
            }

            return Err(PipelineError::ExtractionExhausted(format!(
                "no engine could read page {page}"
            )));
        }

        // Non-PDF inputs have no page structure; run the full chain.
        let outcome = self.run(input).await?;
        Ok(PageExtract {
            page,
            engine: outcome.engine,
            text: outcome.output.text,
        })
    }

    async fn timed_attempt(
        &self,
        engine: &dyn ExtractionEngine,
        input: &EngineInput<'_>,
        priority: usize,
        attempts: &mut Vec<ExtractionAttempt>,
    ) -> Option<EngineOutput> {
        let started = Instant::now();
        let result = tokio::time::timeout(self.limits.engine_budget, engine.attempt(input)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let (text_len, rejection, output) = match result {
            Err(_) => (
                0,
                Some(format!(
                    "timed out after {}s",
                    self.limits.engine_budget.as_secs()
                )),
                None,
            ),
            Ok(Err(error)) => (0, Some(error.to_string()), None),
            Ok(Ok(EngineOutcome::Rejected(reason))) => (0, Some(reason), None),
            Ok(Ok(EngineOutcome::Extracted(output))) => {
                match quality_gate(&output.text, &self.limits) {
                    Ok(()) => (output.text.len(), None, Some(output)),
                    Err(reason) => (output.text.len(), Some(reason), None),
                }
            }
        };

        let succeeded = output.is_some();
        attempts.push(ExtractionAttempt {
            engine: engine.name().to_string(),
            priority,
            succeeded,
            text_len,
            duration_ms,
            rejection: rejection.clone(),
        });

        if let Some(reason) = rejection {
            debug!(engine = engine.name(), reason, "engine attempt rejected");
        }
        output
    }

    async fn raster_pass(
        &self,
        input: &EngineInput<'_>,
        attempts: &mut Vec<ExtractionAttempt>,
    ) -> Option<ChainOutcome> {
        let images = match self
            .rasterizer
            .rasterize(
                input.bytes,
                1,
                self.limits.raster_max_pages,
                self.limits.raster_dpi,
            )
            .await
        {
            Ok(images) if !images.is_empty() => images,
            Ok(_) => {
                warn!("rasterizer produced no pages");
                return None;
            }
            Err(error) => {
                warn!(%error, "rasterization failed");
                return None;
            }
        };

        for (priority, engine) in self
            .engines
            .iter()
            .enumerate()
            .filter(|(_, e)| e.reads_page_images())
        {
            let started = Instant::now();
            let mut per_page = Vec::with_capacity(images.len());
            for image in &images {
                let page_text = match tokio::time::timeout(
                    self.limits.engine_budget,
                    engine.attempt_page_image(image),
                )
                .await
                {
                    Ok(Ok(EngineOutcome::Extracted(output))) => output.text,
                    _ => String::new(),
                };
                per_page.push(page_text);
            }

            let text = per_page
                .iter()
                .filter(|page| !page.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join("\n\n");
            let engine_label = format!("raster+{}", engine.name());
            let gate = quality_gate(&text, &self.limits);
            let succeeded = gate.is_ok();

            attempts.push(ExtractionAttempt {
                engine: engine_label.clone(),
                priority,
                succeeded,
                text_len: text.len(),
                duration_ms: started.elapsed().as_millis() as u64,
                rejection: gate.clone().err(),
            });

            if succeeded {
                return Some(ChainOutcome {
                    engine: engine_label,
                    output: EngineOutput { text, per_page },
                    attempts: std::mem::take(attempts),
                });
            }
            if let Err(reason) = gate {
                debug!(engine = engine.name(), reason, "raster pass rejected");
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lease_text() -> String {
        "This lease is made between the landlord and the tenant in respect of \
         the demised premises, at the rent reserved by this lease."
            .to_string()
    }

    struct FakeEngine {
        name: &'static str,
        structural: bool,
        page_reader: bool,
        whole_doc: Option<String>,
        page_text: Option<String>,
        calls: AtomicUsize,
    }

    impl FakeEngine {
        fn whole(name: &'static str, text: Option<String>) -> Self {
            Self {
                name,
                structural: false,
                page_reader: false,
                whole_doc: text,
                page_text: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionEngine for FakeEngine {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, _input: &EngineInput<'_>) -> bool {
            true
        }

        fn structural(&self) -> bool {
            self.structural
        }

        fn reads_page_images(&self) -> bool {
            self.page_reader
        }

        async fn attempt(&self, _input: &EngineInput<'_>) -> Result<EngineOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.whole_doc {
                Some(text) => Ok(EngineOutcome::Extracted(EngineOutput {
                    text: text.clone(),
                    per_page: vec![text.clone()],
                })),
                None => Ok(EngineOutcome::Rejected("nothing readable".to_string())),
            }
        }

        async fn attempt_page_image(&self, _png: &[u8]) -> Result<EngineOutcome> {
            match &self.page_text {
                Some(text) => Ok(EngineOutcome::Extracted(EngineOutput {
                    text: text.clone(),
                    per_page: vec![text.clone()],
                })),
                None => Ok(EngineOutcome::Rejected(
                    "engine cannot read page images".to_string(),
                )),
            }
        }
    }

    struct FakeRasterizer {
        pages: usize,
    }

    #[async_trait]
    impl PageRasterizer for FakeRasterizer {
        async fn rasterize(
            &self,
            _bytes: &[u8],
            _first_page: u32,
            max_pages: u32,
            _dpi: u32,
        ) -> Result<Vec<Vec<u8>>> {
            Ok(vec![vec![0u8; 8]; self.pages.min(max_pages as usize)])
        }
    }

    fn input_pdf(bytes: &[u8]) -> EngineInput<'_> {
        EngineInput {
            bytes,
            mime_type: MIME_PDF,
            filename: "scan.pdf",
        }
    }

    #[test]
    fn gate_rejects_short_text() {
        let limits = PipelineLimits::default();
        assert!(quality_gate("lease", &limits).is_err());
    }

    #[test]
    fn gate_rejects_non_alphabetic_noise() {
        let limits = PipelineLimits::default();
        let noise = "0101 1010 %%%% ####  12345 67890 !!!! lease 0000 1111 2222 3333 4444";
        assert!(quality_gate(noise, &limits).is_err());
    }

    #[test]
    fn gate_rejects_text_without_domain_keywords() {
        let limits = PipelineLimits::default();
        let off_topic = "The quick brown fox jumps over the lazy dog again and again and again.";
        assert!(quality_gate(off_topic, &limits).is_err());
    }

    #[test]
    fn gate_length_floor_counts_characters_not_bytes() {
        let limits = PipelineLimits::default();
        let accented = "lease çàéè çàéè çàéè çàéè çàéè çàéè çàéè";
        assert!(accented.len() >= limits.min_text_chars);
        assert!(accented.chars().count() < limits.min_text_chars);
        assert!(quality_gate(accented, &limits).is_err());
    }

    #[test]
    fn gate_accepts_plausible_lease_text() {
        let limits = PipelineLimits::default();
        assert!(quality_gate(&lease_text(), &limits).is_ok());
    }

    #[tokio::test]
    async fn first_passing_engine_wins_and_chain_stops() {
        let first = Arc::new(FakeEngine::whole("alpha", Some(lease_text())));
        let second = Arc::new(FakeEngine::whole("beta", Some(lease_text())));
        let second_handle = Arc::clone(&second);

        let chain = ExtractionChain::new(
            vec![first, second],
            Arc::new(FakeRasterizer { pages: 0 }),
            PipelineLimits::default(),
        );

        let bytes = b"irrelevant";
        let outcome = chain.run(&input_pdf(bytes)).await.unwrap();
        assert_eq!(outcome.engine, "alpha");
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(second_handle.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_structural_result_reaches_the_raster_fallback() {
        let structural = Arc::new(FakeEngine {
            name: "native-fake",
            structural: true,
            page_reader: false,
            whole_doc: Some(String::new()),
            page_text: None,
            calls: AtomicUsize::new(0),
        });
        let vision = Arc::new(FakeEngine {
            name: "vision-fake",
            structural: false,
            page_reader: true,
            whole_doc: None,
            page_text: Some(lease_text()),
            calls: AtomicUsize::new(0),
        });

        let chain = ExtractionChain::new(
            vec![structural, vision],
            Arc::new(FakeRasterizer { pages: 2 }),
            PipelineLimits::default(),
        );

        let bytes = b"%PDF-1.4 image-only";
        let outcome = chain.run(&input_pdf(bytes)).await.unwrap();
        assert_eq!(outcome.engine, "raster+vision-fake");
        assert_eq!(outcome.output.per_page.len(), 2);
        assert!(outcome
            .attempts
            .iter()
            .any(|attempt| attempt.engine == "native-fake" && !attempt.succeeded));
    }

    #[tokio::test]
    async fn exhausted_chain_is_a_distinct_error() {
        let only = Arc::new(FakeEngine::whole("alpha", None));
        let chain = ExtractionChain::new(
            vec![only],
            Arc::new(FakeRasterizer { pages: 0 }),
            PipelineLimits::default(),
        );

        let bytes = b"nothing";
        let error = chain.run(&input_pdf(bytes)).await.unwrap_err();
        assert!(matches!(error, PipelineError::ExtractionExhausted(_)));
    }

    #[tokio::test]
    async fn hung_engine_is_time_boxed_and_chain_continues() {
        struct HangingEngine;

        #[async_trait]
        impl ExtractionEngine for HangingEngine {
            fn name(&self) -> &'static str {
                "hanging"
            }
            fn supports(&self, _input: &EngineInput<'_>) -> bool {
                true
            }
            async fn attempt(&self, _input: &EngineInput<'_>) -> Result<EngineOutcome> {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                unreachable!("attempt should have been cancelled");
            }
        }

        let mut limits = PipelineLimits::default();
        limits.engine_budget = std::time::Duration::from_millis(20);

        let chain = ExtractionChain::new(
            vec![
                Arc::new(HangingEngine),
                Arc::new(FakeEngine::whole("backup", Some(lease_text()))),
            ],
            Arc::new(FakeRasterizer { pages: 0 }),
            limits,
        );

        let bytes = b"doc";
        let outcome = chain.run(&input_pdf(bytes)).await.unwrap();
        assert_eq!(outcome.engine, "backup");
        let hung = &outcome.attempts[0];
        assert_eq!(hung.engine, "hanging");
        assert!(hung.rejection.as_deref().unwrap_or("").contains("timed out"));
    }

    #[tokio::test]
    async fn page_requests_outside_the_document_are_rejected_up_front() {
        let chain = ExtractionChain::new(
            vec![Arc::new(FakeEngine::whole("alpha", None))],
            Arc::new(FakeRasterizer { pages: 1 }),
            PipelineLimits::default(),
        );

        // Unparseable scan: no text layer, so only the page estimate bounds
        // the request.
        let bytes = b"%PDF-1.4 image-only";
        for page in [0u32, 40] {
            let error = chain.run_page(&input_pdf(bytes), page).await.unwrap_err();
            assert!(matches!(
                error,
                PipelineError::Validation(
                    crate::error::ValidationError::PageOutOfRange { .. }
                )
            ));
        }
    }

    #[tokio::test]
    async fn plain_text_documents_use_the_native_reader() {
        let chain = ExtractionChain::new(
            vec![Arc::new(NativeTextEngine)],
            Arc::new(FakeRasterizer { pages: 0 }),
            PipelineLimits::default(),
        );

        let text = lease_text();
        let input = EngineInput {
            bytes: text.as_bytes(),
            mime_type: MIME_TEXT,
            filename: "lease.txt",
        };
        let outcome = chain.run(&input).await.unwrap();
        assert_eq!(outcome.engine, "native-text");
        assert_eq!(outcome.output.text, text);
    }
}
