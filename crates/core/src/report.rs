use crate::citations::CitationFinder;
use crate::models::{
    Citation, ConfidenceBand, Field, FieldKey, FieldOrigin, Report, ReportSection,
};

/// Sentence used when a section's fields were all absent from the text.
const FALLBACK_BODY: &str = "Not stated in the extracted text.";

const LEGEND_BODY: &str = "🟢 High confidence (0.80 and above)\n\
                           🟠 Medium confidence (0.50 to 0.79)\n\
                           🔴 Low confidence (below 0.50)";

const DISCLAIMER_BODY: &str = "This report was generated automatically from the document text. \
                               It is not legal advice. Verify all terms against the original \
                               lease before relying on them.";

/// Fixed report layout. Section order is part of the output contract; two
/// renders of the same inputs are byte-identical.
struct SectionSpec {
    title: &'static str,
    keywords: &'static [&'static str],
    fields: &'static [FieldKey],
}

const SECTIONS: &[SectionSpec] = &[
    SectionSpec {
        title: "Basic Property Details",
        keywords: &["property", "premises", "title"],
        fields: &[
            FieldKey::PropertyAddress,
            FieldKey::TitleReference,
            FieldKey::Lessor,
            FieldKey::Lessee,
            FieldKey::TermStart,
            FieldKey::TermEnd,
            FieldKey::TermYears,
        ],
    },
    SectionSpec {
        title: "Repairs",
        keywords: &["repair", "maintain", "decorate"],
        fields: &[FieldKey::RepairsSummary],
    },
    SectionSpec {
        title: "Service Charge",
        keywords: &["service charge", "apportion"],
        fields: &[FieldKey::ServiceChargePercent, FieldKey::ApportionmentBasis],
    },
    SectionSpec {
        title: "Ground Rent",
        keywords: &["ground rent", "rent"],
        fields: &[FieldKey::GroundRentTerms, FieldKey::RentTerms],
    },
    SectionSpec {
        title: "Demised Premises",
        keywords: &["demise", "demised"],
        fields: &[FieldKey::PropertyAddress],
    },
    SectionSpec {
        title: "Rights and Access",
        keywords: &["right of way", "access", "easement", "common parts"],
        fields: &[],
    },
    SectionSpec {
        title: "Use Restrictions",
        keywords: &["permitted use", "use", "restriction", "nuisance"],
        fields: &[],
    },
    SectionSpec {
        title: "Alterations",
        keywords: &["alteration", "consent", "improvement"],
        fields: &[FieldKey::AlterationsSummary],
    },
    SectionSpec {
        title: "Subletting and Assignment",
        keywords: &["underlet", "sublet", "assign"],
        fields: &[FieldKey::SublettingSummary],
    },
    SectionSpec {
        title: "Insurance",
        keywords: &["insure", "insurance"],
        fields: &[FieldKey::InsuranceSummary],
    },
    SectionSpec {
        title: "Forfeiture",
        keywords: &["forfeit", "re-enter", "re-entry"],
        fields: &[],
    },
];

fn field_label(key: FieldKey) -> &'static str {
    match key {
        FieldKey::PropertyAddress => "Property address",
        FieldKey::Lessor => "Lessor",
        FieldKey::Lessee => "Lessee",
        FieldKey::TitleReference => "Title reference",
        FieldKey::TermStart => "Term start",
        FieldKey::TermEnd => "Term end",
        FieldKey::TermYears => "Term length (years)",
        FieldKey::RentTerms => "Rent",
        FieldKey::GroundRentTerms => "Ground rent",
        FieldKey::ServiceChargePercent => "Service charge share (%)",
        FieldKey::ApportionmentBasis => "Apportionment basis",
        FieldKey::RepairsSummary => "Repairing obligations",
        FieldKey::AlterationsSummary => "Alterations",
        FieldKey::SublettingSummary => "Subletting and assignment",
        FieldKey::InsuranceSummary => "Insurance",
    }
}

fn lookup<'a>(fields: &'a [Field], key: FieldKey) -> Option<&'a Field> {
    fields
        .iter()
        .find(|field| field.key == key && field.origin != FieldOrigin::NotFound)
}

fn field_line(field: &Field) -> String {
    format!(
        "{} {}: {}",
        ConfidenceBand::from_score(field.confidence).glyph(),
        field_label(field.key),
        field.value
    )
}

fn executive_summary(fields: &[Field]) -> (String, ConfidenceBand) {
    let mut sentences: Vec<String> = Vec::new();
    let mut confidences: Vec<f32> = Vec::new();

    if let Some(address) = lookup(fields, FieldKey::PropertyAddress) {
        sentences.push(format!("Lease of {}.", address.value));
        confidences.push(address.confidence);
    }
    match (
        lookup(fields, FieldKey::TermYears),
        lookup(fields, FieldKey::TermStart),
    ) {
        (Some(years), Some(start)) => {
            sentences.push(format!(
                "Term of {} years from {}.",
                years.value, start.value
            ));
            confidences.push(years.confidence.min(start.confidence));
        }
        (Some(years), None) => {
            sentences.push(format!("Term of {} years.", years.value));
            confidences.push(years.confidence);
        }
        _ => {}
    }
    if let Some(ground_rent) = lookup(fields, FieldKey::GroundRentTerms) {
        sentences.push(format!("Ground rent: {}.", ground_rent.value));
        confidences.push(ground_rent.confidence);
    }
    if let Some(charge) = lookup(fields, FieldKey::ServiceChargePercent) {
        sentences.push(format!("Service charge share: {}%.", charge.value));
        confidences.push(charge.confidence);
    }

    if sentences.is_empty() {
        return (FALLBACK_BODY.to_string(), ConfidenceBand::Low);
    }
    let worst = confidences.iter().copied().fold(f32::MAX, f32::min);
    (sentences.join(" "), ConfidenceBand::from_score(worst))
}

fn build_section(
    spec: &SectionSpec,
    fields: &[Field],
    pages: &[String],
    finder: &CitationFinder,
) -> ReportSection {
    let citations: Vec<Citation> = finder.find(pages, spec.keywords);

    let present: Vec<&Field> = spec
        .fields
        .iter()
        .filter_map(|key| lookup(fields, *key))
        .collect();

    let (body, band) = if present.is_empty() {
        let band = if citations.is_empty() {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Medium
        };
        (FALLBACK_BODY.to_string(), band)
    } else {
        let worst = present
            .iter()
            .map(|field| field.confidence)
            .fold(f32::MAX, f32::min);
        let lines: Vec<String> = present.iter().map(|field| field_line(field)).collect();
        (lines.join("\n"), ConfidenceBand::from_score(worst))
    };

    ReportSection {
        title: spec.title.to_string(),
        body,
        band,
        citations,
    }
}

/// Assembles the full report in the fixed section order.
pub fn render_report(fields: &[Field], pages: &[String], finder: &CitationFinder) -> Report {
    let mut sections = Vec::with_capacity(SECTIONS.len() + 3);

    let (summary_body, summary_band) = executive_summary(fields);
    sections.push(ReportSection {
        title: "Executive Summary".to_string(),
        body: summary_body,
        band: summary_band,
        citations: Vec::new(),
    });

    for spec in SECTIONS {
        sections.push(build_section(spec, fields, pages, finder));
    }

    sections.push(ReportSection {
        title: "Confidence Legend".to_string(),
        body: LEGEND_BODY.to_string(),
        band: ConfidenceBand::High,
        citations: Vec::new(),
    });
    sections.push(ReportSection {
        title: "Disclaimer".to_string(),
        body: DISCLAIMER_BODY.to_string(),
        band: ConfidenceBand::High,
        citations: Vec::new(),
    });

    Report { sections }
}

/// Plain-text rendering, suitable for terminals and file export.
pub fn render_text(report: &Report) -> String {
    let mut out = String::from("LEASE REPORT\n============\n");
    for section in &report.sections {
        out.push('\n');
        out.push_str(&section.title);
        out.push('\n');
        out.push_str(&"-".repeat(section.title.len()));
        out.push('\n');
        out.push_str(&section.body);
        out.push('\n');
        if !section.citations.is_empty() {
            let refs: Vec<&str> = section
                .citations
                .iter()
                .map(|citation| citation.reference.as_str())
                .collect();
            out.push_str(&format!("See: {}\n", refs.join("; ")));
        }
    }
    out
}

fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Minimal self-contained HTML rendering.
pub fn render_html(report: &Report) -> String {
    let mut out = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>Lease Report</title></head>\n<body>\n<h1>Lease Report</h1>\n",
    );
    for section in &report.sections {
        out.push_str("<section>\n");
        out.push_str(&format!(
            "<h2>{} {}</h2>\n",
            section.band.glyph(),
            escape_html(&section.title)
        ));
        for line in section.body.lines() {
            out.push_str(&format!("<p>{}</p>\n", escape_html(line)));
        }
        if !section.citations.is_empty() {
            out.push_str("<ul>\n");
            for citation in &section.citations {
                out.push_str(&format!(
                    "<li>{}: {}</li>\n",
                    escape_html(&citation.reference),
                    escape_html(&citation.snippet)
                ));
            }
            out.push_str("</ul>\n");
        }
        out.push_str("</section>\n");
    }
    out.push_str("</body>\n</html>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldExtractor;

    fn sample_pages() -> Vec<String> {
        vec![
            "THIS LEASE is made between Grosvenor Estates Limited (the Landlord) and Jane \
             Example (the Tenant) of the premises at 12 Example Street, London for a term of \
             99 years commencing on 25 December 1986 at a rent of one peppercorn per annum."
                .to_string(),
            "The tenant covenants to repair and keep the premises in good repair as set out \
             in Schedule 5, paragraph 8.1. The service charge is apportioned on a fair \
             proportion basis under Clause 4, being 2.5% of the landlord's expenditure."
                .to_string(),
        ]
    }

    fn build_report() -> Report {
        let extractor = FieldExtractor::new().unwrap();
        let finder = CitationFinder::new().unwrap();
        let pages = sample_pages();
        let text = pages.join("\n\n");
        let fields = extractor.extract(&text);
        render_report(&fields, &pages, &finder)
    }

    #[test]
    fn sections_appear_in_the_fixed_order() {
        let report = build_report();
        let titles: Vec<&str> = report
            .sections
            .iter()
            .map(|section| section.title.as_str())
            .collect();
        assert_eq!(titles.first(), Some(&"Executive Summary"));
        assert_eq!(titles.get(1), Some(&"Basic Property Details"));
        assert_eq!(titles[titles.len() - 2], "Confidence Legend");
        assert_eq!(titles[titles.len() - 1], "Disclaimer");
        let repairs = titles.iter().position(|title| *title == "Repairs").unwrap();
        let insurance = titles
            .iter()
            .position(|title| *title == "Insurance")
            .unwrap();
        assert!(repairs < insurance);
    }

    #[test]
    fn double_render_is_byte_identical() {
        let first = build_report();
        let second = build_report();
        assert_eq!(first, second);
        assert_eq!(render_text(&first), render_text(&second));
        assert_eq!(render_html(&first), render_html(&second));
    }

    #[test]
    fn missing_topics_fall_back_to_the_stock_sentence() {
        let extractor = FieldExtractor::new().unwrap();
        let finder = CitationFinder::new().unwrap();
        let fields = extractor.extract("");
        let report = render_report(&fields, &[], &finder);

        let forfeiture = report
            .sections
            .iter()
            .find(|section| section.title == "Forfeiture")
            .unwrap();
        assert_eq!(forfeiture.body, FALLBACK_BODY);
        assert_eq!(forfeiture.band, ConfidenceBand::Low);
    }

    #[test]
    fn repairs_section_carries_its_pin_cite() {
        let report = build_report();
        let repairs = report
            .sections
            .iter()
            .find(|section| section.title == "Repairs")
            .unwrap();
        assert!(repairs
            .citations
            .iter()
            .any(|citation| citation.reference == "Schedule 5, paragraph 8.1"));
    }

    #[test]
    fn html_escapes_markup_in_values() {
        let report = Report {
            sections: vec![ReportSection {
                title: "Basic Property Details".to_string(),
                body: "<script>alert(1)</script>".to_string(),
                band: ConfidenceBand::High,
                citations: vec![],
            }],
        };
        let html = render_html(&report);
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }
}
