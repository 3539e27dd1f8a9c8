use crate::engines::{NativeTextEngine, MIME_PDF};
use crate::models::{ClassifyResult, DocumentKind};
use tracing::debug;

// Rough bytes-per-page for documents whose structure cannot be read.
const BYTES_PER_PAGE_ESTIMATE: u64 = 3_500;

const LEASE_HINTS: [&str; 5] = ["lease", "underlease", "sublease", "tenancy", "demise"];
const DEED_HINTS: [&str; 4] = ["deed", "transfer", "tr1", "conveyance"];

/// Page count from the document structure when readable, otherwise a size
/// heuristic. Never returns zero.
pub fn estimate_page_count(bytes: &[u8], mime_type: &str) -> u32 {
    if mime_type == MIME_PDF {
        if let Some(pages) = NativeTextEngine::page_count(bytes) {
            return pages.max(1);
        }
    }
    ((bytes.len() as u64 / BYTES_PER_PAGE_ESTIMATE) + 1) as u32
}

/// Lowercased filename tokens that look like document-type markers.
pub fn filename_hints(filename: &str) -> Vec<String> {
    let lowered = filename.to_lowercase();
    LEASE_HINTS
        .iter()
        .chain(DEED_HINTS.iter())
        .filter(|hint| lowered.contains(*hint))
        .map(|hint| hint.to_string())
        .collect()
}

/// Cheap pre-OCR triage from the filename and any readable text layer. Wrong
/// answers are tolerable; this stage is advisory and non-fatal.
pub fn classify(filename: &str, bytes: &[u8], mime_type: &str) -> ClassifyResult {
    let hints = filename_hints(filename);
    let estimated_pages = estimate_page_count(bytes, mime_type);

    let mut kind = kind_from_hints(&hints);

    if kind == DocumentKind::Other {
        if let Some(peek) = peek_text(bytes, mime_type) {
            let lowered = peek.to_lowercase();
            if LEASE_HINTS.iter().any(|hint| lowered.contains(hint)) {
                kind = DocumentKind::Lease;
            } else if DEED_HINTS.iter().any(|hint| lowered.contains(hint)) {
                kind = DocumentKind::Deed;
            }
        }
    }

    debug!(?kind, estimated_pages, "classified document");
    ClassifyResult {
        kind,
        estimated_pages,
        filename_hints: hints,
    }
}

fn kind_from_hints(hints: &[String]) -> DocumentKind {
    if hints.iter().any(|hint| LEASE_HINTS.contains(&hint.as_str())) {
        DocumentKind::Lease
    } else if hints.iter().any(|hint| DEED_HINTS.contains(&hint.as_str())) {
        DocumentKind::Deed
    } else {
        DocumentKind::Other
    }
}

/// First pages of the native text layer, capped; empty on scanned documents.
fn peek_text(bytes: &[u8], mime_type: &str) -> Option<String> {
    if mime_type != MIME_PDF {
        return std::str::from_utf8(bytes)
            .ok()
            .map(|text| text.chars().take(4_000).collect());
    }
    let pages = NativeTextEngine::extract_pdf_pages(bytes).ok()?;
    let peek: String = pages
        .iter()
        .take(3)
        .flat_map(|page| page.chars())
        .take(4_000)
        .collect();
    if peek.trim().is_empty() {
        None
    } else {
        Some(peek)
    }
}
