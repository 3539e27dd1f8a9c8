use crate::classify::estimate_page_count;
use crate::engines::{MIME_DOCX, MIME_PDF, MIME_TEXT};
use crate::error::ValidationError;
use crate::models::PipelineLimits;

const PDF_MAGIC: &[u8] = b"%PDF-";

const ACCEPTED_MIME_TYPES: [&str; 5] =
    [MIME_PDF, MIME_DOCX, MIME_TEXT, "image/png", "image/jpeg"];

/// Where a submission goes after validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Processed synchronously inside the caller's request, under the quick
    /// budget.
    Quick,
    /// Persisted and processed by a worker; the caller polls.
    Background,
    /// Targeted extraction of one page, no job record.
    SinglePage(u32),
}

/// Pre-job validation. Failing here is a synchronous rejection; no job
/// record is ever created for invalid input.
pub fn validate(
    filename: &str,
    bytes: &[u8],
    mime_type: &str,
    limits: &PipelineLimits,
) -> Result<(), ValidationError> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyFile(filename.to_string()));
    }
    if bytes.len() as u64 > limits.max_file_bytes {
        return Err(ValidationError::Oversize {
            size: bytes.len() as u64,
            limit: limits.max_file_bytes,
        });
    }
    if !ACCEPTED_MIME_TYPES.contains(&mime_type) {
        return Err(ValidationError::UnsupportedMime(mime_type.to_string()));
    }
    if mime_type == MIME_PDF && !bytes.starts_with(PDF_MAGIC) {
        return Err(ValidationError::CorruptContent(format!(
            "{filename} declares {MIME_PDF} but lacks the PDF header"
        )));
    }

    let pages = estimate_page_count(bytes, mime_type);
    if pages > limits.max_pages {
        return Err(ValidationError::TooManyPages {
            pages,
            limit: limits.max_pages,
        });
    }
    Ok(())
}

/// Routing for an already-validated submission. An explicit page request
/// short-circuits to targeted extraction; otherwise small documents take the
/// quick path unless the caller forces background, and everything else is
/// queued.
pub fn route(
    bytes: &[u8],
    mime_type: &str,
    requested_page: Option<u32>,
    force_background: bool,
    limits: &PipelineLimits,
) -> RouteDecision {
    if let Some(page) = requested_page {
        return RouteDecision::SinglePage(page);
    }
    if force_background {
        return RouteDecision::Background;
    }
    let pages = estimate_page_count(bytes, mime_type);
    if bytes.len() as u64 <= limits.quick_max_bytes && pages <= limits.quick_max_pages {
        RouteDecision::Quick
    } else {
        RouteDecision::Background
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> PipelineLimits {
        PipelineLimits::default()
    }

    #[test]
    fn empty_files_are_rejected() {
        let error = validate("empty.pdf", b"", MIME_PDF, &limits()).unwrap_err();
        assert!(matches!(error, ValidationError::EmptyFile(_)));
    }

    #[test]
    fn oversize_files_are_rejected() {
        let mut small = limits();
        small.max_file_bytes = 8;
        let error = validate("big.pdf", b"%PDF-1.4 xxxx", MIME_PDF, &small).unwrap_err();
        assert!(matches!(error, ValidationError::Oversize { .. }));
    }

    #[test]
    fn unknown_mime_types_are_rejected() {
        let error = validate("movie.mp4", b"data", "video/mp4", &limits()).unwrap_err();
        assert!(matches!(error, ValidationError::UnsupportedMime(_)));
    }

    #[test]
    fn a_renamed_non_pdf_is_rejected_before_any_job_exists() {
        let error = validate("lease.pdf", b"PK\x03\x04 zipfile", MIME_PDF, &limits()).unwrap_err();
        assert!(matches!(error, ValidationError::CorruptContent(_)));
    }

    #[test]
    fn small_documents_take_the_quick_path() {
        let bytes = b"%PDF-1.4 small";
        assert_eq!(
            route(bytes, MIME_PDF, None, false, &limits()),
            RouteDecision::Quick
        );
    }

    #[test]
    fn large_documents_are_queued() {
        let mut tight = limits();
        tight.quick_max_bytes = 4;
        let bytes = b"%PDF-1.4 larger than four bytes";
        assert_eq!(
            route(bytes, MIME_PDF, None, false, &tight),
            RouteDecision::Background
        );
    }

    #[test]
    fn the_background_override_skips_the_quick_path() {
        let bytes = b"%PDF-1.4 small";
        assert_eq!(
            route(bytes, MIME_PDF, None, true, &limits()),
            RouteDecision::Background
        );
    }

    #[test]
    fn an_explicit_page_request_wins_over_size() {
        let bytes = b"%PDF-1.4 tiny";
        assert_eq!(
            route(bytes, MIME_PDF, Some(7), true, &limits()),
            RouteDecision::SinglePage(7)
        );
    }
}
