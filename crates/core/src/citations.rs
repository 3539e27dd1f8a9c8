use crate::error::Result;
use crate::models::Citation;
use regex::{Regex, RegexBuilder};

const SNIPPET_RADIUS: usize = 110;
const SCORE_WINDOW: usize = 240;
pub const DEFAULT_TOP_K: usize = 3;

/// Locates pin-cites (clause and schedule cross-references) in extracted
/// text and ranks them against a topic's keywords. Ranking is deterministic:
/// score first, then page and offset as tie-breakers.
pub struct CitationFinder {
    schedule_para: Regex,
    para_of_schedule: Regex,
    clause: Regex,
    schedule: Regex,
    top_k: usize,
}

fn pattern(source: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(source)
        .case_insensitive(true)
        .build()?)
}

impl CitationFinder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            schedule_para: pattern(
                r"schedule\s+(?P<sched>\d{1,2})\s*,?\s*paragraph\s+(?P<para>\d{1,3}(?:\.\d{1,3})*)",
            )?,
            para_of_schedule: pattern(
                r"paragraph\s+(?P<para>\d{1,3}(?:\.\d{1,3})*)\s+of\s+(?:the\s+)?(?:\w+\s+)?schedule\s+(?P<sched>\d{1,2})",
            )?,
            clause: pattern(r"clause\s+(?P<clause>\d{1,3}(?:\.\d{1,3})*)")?,
            schedule: pattern(r"schedule\s+(?P<sched>\d{1,2})\b")?,
            top_k: DEFAULT_TOP_K,
        })
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Scans per-page text and returns the best `top_k` citations for the
    /// given topic keywords. Pages are zero-indexed in the result.
    pub fn find(&self, pages: &[String], keywords: &[&str]) -> Vec<Citation> {
        let mut candidates: Vec<(u32, Citation)> = Vec::new();

        for (page_index, page) in pages.iter().enumerate() {
            for candidate in self.scan_page(page, page_index as u32) {
                let score = keyword_score(page, candidate.offset, keywords);
                if score == 0 && !keywords.is_empty() {
                    continue;
                }
                candidates.push((score, candidate));
            }
        }

        candidates.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .cmp(score_a)
                .then(a.page.cmp(&b.page))
                .then(a.offset.cmp(&b.offset))
        });
        candidates
            .into_iter()
            .take(self.top_k)
            .map(|(_, citation)| citation)
            .collect()
    }

    /// All references on one page with the whole text treated as page 0.
    pub fn find_in_text(&self, text: &str, keywords: &[&str]) -> Vec<Citation> {
        self.find(std::slice::from_ref(&text.to_string()), keywords)
    }

    fn scan_page(&self, page: &str, page_index: u32) -> Vec<Citation> {
        let mut found: Vec<Citation> = Vec::new();
        let mut covered: Vec<(usize, usize)> = Vec::new();

        // Compound forms first so a bare "Schedule n" inside them is not
        // double-counted.
        for captures in self.schedule_para.captures_iter(page) {
            if let (Some(whole), Some(sched), Some(para)) =
                (captures.get(0), captures.name("sched"), captures.name("para"))
            {
                covered.push((whole.start(), whole.end()));
                found.push(make_citation(
                    page,
                    page_index,
                    whole.start(),
                    whole.end(),
                    format!("Schedule {}, paragraph {}", sched.as_str(), para.as_str()),
                ));
            }
        }
        for captures in self.para_of_schedule.captures_iter(page) {
            if let (Some(whole), Some(sched), Some(para)) =
                (captures.get(0), captures.name("sched"), captures.name("para"))
            {
                covered.push((whole.start(), whole.end()));
                found.push(make_citation(
                    page,
                    page_index,
                    whole.start(),
                    whole.end(),
                    format!("Schedule {}, paragraph {}", sched.as_str(), para.as_str()),
                ));
            }
        }
        for captures in self.clause.captures_iter(page) {
            if let (Some(whole), Some(clause)) = (captures.get(0), captures.name("clause")) {
                found.push(make_citation(
                    page,
                    page_index,
                    whole.start(),
                    whole.end(),
                    format!("Clause {}", clause.as_str()),
                ));
            }
        }
        for captures in self.schedule.captures_iter(page) {
            if let (Some(whole), Some(sched)) = (captures.get(0), captures.name("sched")) {
                let overlaps = covered
                    .iter()
                    .any(|(start, end)| whole.start() >= *start && whole.start() < *end);
                if overlaps {
                    continue;
                }
                found.push(make_citation(
                    page,
                    page_index,
                    whole.start(),
                    whole.end(),
                    format!("Schedule {}", sched.as_str()),
                ));
            }
        }

        found
    }
}

fn make_citation(
    page: &str,
    page_index: u32,
    start: usize,
    end: usize,
    reference: String,
) -> Citation {
    Citation {
        page: Some(page_index),
        offset: start,
        reference,
        snippet: snippet_around(page, start, end),
    }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn snippet_around(text: &str, start: usize, end: usize) -> String {
    let from = floor_boundary(text, start.saturating_sub(SNIPPET_RADIUS));
    let to = ceil_boundary(text, (end + SNIPPET_RADIUS).min(text.len()));
    text[from..to].split_whitespace().collect::<Vec<_>>().join(" ")
}

/// How many topic keywords occur within a window around the reference.
fn keyword_score(text: &str, offset: usize, keywords: &[&str]) -> u32 {
    let from = floor_boundary(text, offset.saturating_sub(SCORE_WINDOW));
    let to = ceil_boundary(text, (offset + SCORE_WINDOW).min(text.len()));
    let window = text[from..to].to_lowercase();

    keywords
        .iter()
        .map(|keyword| window.matches(&keyword.to_lowercase()).count() as u32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finder() -> CitationFinder {
        CitationFinder::new().unwrap()
    }

    #[test]
    fn compound_schedule_references_are_canonicalized() {
        let pages = vec![
            "The tenant covenants as set out in Schedule 5, paragraph 8.1 to repair the premises."
                .to_string(),
        ];
        let citations = finder().find(&pages, &["repair"]);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].reference, "Schedule 5, paragraph 8.1");
        assert_eq!(citations[0].page, Some(0));
    }

    #[test]
    fn inverted_form_canonicalizes_to_the_same_reference() {
        let pages =
            vec!["repair obligations appear in paragraph 8.1 of the Fifth Schedule 5".to_string()];
        let citations = finder().find(&pages, &["repair"]);
        assert_eq!(citations[0].reference, "Schedule 5, paragraph 8.1");
    }

    #[test]
    fn keyword_scoring_ranks_the_on_topic_reference_first() {
        let pages = vec![
            "Clause 2 deals with rent and rent review and more rent detail.".to_string(),
            "Clause 9 addresses insurance of the building.".to_string(),
        ];
        let citations = finder().find(&pages, &["rent"]);
        assert_eq!(citations[0].reference, "Clause 2");
        assert_eq!(citations[0].page, Some(0));
    }

    #[test]
    fn off_topic_references_are_dropped() {
        let pages = vec!["Clause 4 concerns alterations only.".to_string()];
        let citations = finder().find(&pages, &["insurance"]);
        assert!(citations.is_empty());
    }

    #[test]
    fn results_are_capped_and_stable() {
        let page = "repair Clause 1. repair Clause 2. repair Clause 3. repair Clause 4."
            .to_string();
        let finder = finder();
        let first = finder.find(std::slice::from_ref(&page), &["repair"]);
        let second = finder.find(std::slice::from_ref(&page), &["repair"]);
        assert_eq!(first.len(), DEFAULT_TOP_K);
        assert_eq!(first, second);
    }

    #[test]
    fn bare_schedule_inside_a_compound_reference_is_not_duplicated() {
        let pages = vec!["service charge in Schedule 7, paragraph 2".to_string()];
        let citations = finder().find(&pages, &["service charge"]);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].reference, "Schedule 7, paragraph 2");
    }
}
