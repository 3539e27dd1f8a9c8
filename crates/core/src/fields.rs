use crate::error::Result;
use crate::models::{Field, FieldKey, FieldOrigin};
use chrono::{Datelike, Months, NaiveDate};
use regex::{Regex, RegexBuilder};

pub const NOT_FOUND_VALUE: &str = "Not found";
pub const NOT_FOUND_CONFIDENCE: f32 = 0.3;
pub const BASE_CONFIDENCE: f32 = 0.7;
pub const SPECIFIC_CONFIDENCE: f32 = 0.85;
pub const PLAUSIBLE_CONFIDENCE: f32 = 0.9;
pub const DERIVED_CONFIDENCE: f32 = 0.6;

/// Matches spanning more than this many characters read as anchored in
/// drafting language rather than a stray hit.
const SPECIFICITY_CHARS: usize = 25;

/// Canonical rendering of the nominal ground rent found in long leases.
pub const PEPPERCORN_VALUE: &str = "One peppercorn per year (if demanded)";

/// One field's matching strategy. `specific` patterns anchor on lease
/// drafting conventions and are tried before the `loose` fallbacks;
/// confidence comes from the matched span and the `plausible` post-check
/// on the captured value.
struct FieldRule {
    key: FieldKey,
    specific: Vec<Regex>,
    loose: Vec<Regex>,
    plausible: Option<fn(&str) -> bool>,
}

fn pattern(source: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(source)
        .case_insensitive(true)
        .build()?)
}

const ROAD_SUFFIXES: [&str; 12] = [
    "street", "road", "lane", "avenue", "close", "court", "gardens", "place", "square",
    "terrace", "drive", "way",
];

fn plausible_address(value: &str) -> bool {
    let lowered = value.to_lowercase();
    value.chars().any(|ch| ch.is_ascii_digit())
        && ROAD_SUFFIXES.iter().any(|suffix| lowered.contains(suffix))
}

const CORPORATE_SUFFIXES: [&str; 4] = ["limited", "ltd", "plc", "llp"];

fn plausible_party(value: &str) -> bool {
    value
        .to_lowercase()
        .split_whitespace()
        .any(|word| CORPORATE_SUFFIXES.contains(&word.trim_matches('.')))
}

fn plausible_title(value: &str) -> bool {
    let prefix_len = value.chars().take_while(|ch| ch.is_ascii_alphabetic()).count();
    (1..=3).contains(&prefix_len) && value[prefix_len..].chars().all(|ch| ch.is_ascii_digit())
}

fn plausible_date(value: &str) -> bool {
    parse_long_date(value).is_some()
}

// Long residential leases run 99 years or more; shorter terms are kept but
// trusted less.
fn plausible_years(value: &str) -> bool {
    value.parse::<u32>().map(|n| (99..=999).contains(&n)).unwrap_or(false)
}

fn plausible_money(value: &str) -> bool {
    value.contains('£') || value.contains("pound")
}

fn plausible_percent(value: &str) -> bool {
    value
        .trim_end_matches('%')
        .trim()
        .parse::<f32>()
        .map(|n| n > 0.0 && n <= 100.0)
        .unwrap_or(false)
}

/// Parses "24 June 1987" and "24th June 1987" style dates.
pub fn parse_long_date(value: &str) -> Option<NaiveDate> {
    let mut parts = value.split_whitespace();
    let day_raw = parts.next()?;
    let month = parts.next()?;
    let year = parts.next()?;
    let day: String = day_raw.chars().take_while(|ch| ch.is_ascii_digit()).collect();
    let normalized = format!("{day} {month} {year}");
    NaiveDate::parse_from_str(&normalized, "%d %B %Y")
        .or_else(|_| NaiveDate::parse_from_str(&normalized, "%d %b %Y"))
        .ok()
}

pub fn format_long_date(date: NaiveDate) -> String {
    format!("{} {} {}", date.day(), date.format("%B"), date.year())
}

/// Rule-driven extractor producing one confidence-scored `Field` per key in
/// `FieldKey::ALL`, matched or not.
pub struct FieldExtractor {
    rules: Vec<FieldRule>,
    peppercorn: Regex,
}

impl FieldExtractor {
    pub fn new() -> Result<Self> {
        let rules = vec![
            FieldRule {
                key: FieldKey::PropertyAddress,
                specific: vec![
                    pattern(r"(?:known\s+as|situate\s+at|being)\s+(?:the\s+property\s+)?(?P<value>\d[^\n.;()]{8,110})")?,
                ],
                loose: vec![
                    pattern(r"(?:premises|property|flat|apartment)\s+at\s+(?P<value>[^\n.;()]{8,110})")?,
                ],
                plausible: Some(plausible_address),
            },
            FieldRule {
                key: FieldKey::Lessor,
                specific: vec![
                    pattern(r"between\s+(?P<value>[^\n(]{3,80}?)\s*\(\s*(?:1|the\s+(?:landlord|lessor))\s*\)")?,
                ],
                loose: vec![
                    pattern(r"(?:landlord|lessor)\s*[:\-]\s*(?P<value>[^\n,;(]{3,80})")?,
                ],
                plausible: Some(plausible_party),
            },
            FieldRule {
                key: FieldKey::Lessee,
                specific: vec![
                    pattern(r"and\s+(?P<value>[^\n(]{3,80}?)\s*\(\s*(?:2|the\s+(?:tenant|lessee))\s*\)")?,
                ],
                loose: vec![
                    pattern(r"(?:tenant|lessee)\s*[:\-]\s*(?P<value>[^\n,;(]{3,80})")?,
                ],
                plausible: Some(plausible_party),
            },
            FieldRule {
                key: FieldKey::TitleReference,
                specific: vec![
                    pattern(r"title\s+(?:number|no\.?)\s*[:\-]?\s*(?P<value>[A-Z]{1,3}\s?\d{3,8})")?,
                ],
                loose: vec![
                    pattern(r"registered\s+(?:at\s+.{0,40}\s+)?under\s+(?:title\s+)?(?P<value>[A-Z]{1,3}\s?\d{3,8})")?,
                ],
                plausible: Some(plausible_title),
            },
            FieldRule {
                key: FieldKey::TermStart,
                specific: vec![
                    pattern(r"commencing\s+on\s+(?:and\s+including\s+)?(?P<value>\d{1,2}(?:st|nd|rd|th)?\s+\w+\s+\d{4})")?,
                ],
                loose: vec![
                    pattern(r"from\s+(?:and\s+including\s+)?(?P<value>\d{1,2}(?:st|nd|rd|th)?\s+\w+\s+\d{4})")?,
                ],
                plausible: Some(plausible_date),
            },
            FieldRule {
                key: FieldKey::TermEnd,
                specific: vec![
                    pattern(r"(?:expiring|ending)\s+on\s+(?:and\s+including\s+)?(?P<value>\d{1,2}(?:st|nd|rd|th)?\s+\w+\s+\d{4})")?,
                ],
                loose: vec![
                    pattern(r"until\s+(?P<value>\d{1,2}(?:st|nd|rd|th)?\s+\w+\s+\d{4})")?,
                ],
                plausible: Some(plausible_date),
            },
            FieldRule {
                key: FieldKey::TermYears,
                specific: vec![
                    pattern(r"term\s+of\s+(?P<value>\d{1,4})\s+years")?,
                ],
                loose: vec![
                    pattern(r"for\s+(?P<value>\d{1,4})\s+years")?,
                ],
                plausible: Some(plausible_years),
            },
            FieldRule {
                key: FieldKey::RentTerms,
                specific: vec![
                    pattern(r"(?:initial\s+|annual\s+|yearly\s+)rent\s+of\s+(?P<value>£\s?[\d,]+(?:\.\d{2})?[^\n.;]{0,60})")?,
                ],
                loose: vec![
                    pattern(r"rent\s+(?:of|reserved\s+(?:is|shall\s+be))\s+(?P<value>£\s?[\d,]+(?:\.\d{2})?[^\n.;]{0,60})")?,
                ],
                plausible: Some(plausible_money),
            },
            FieldRule {
                key: FieldKey::GroundRentTerms,
                specific: vec![
                    pattern(r"ground\s+rent\s+of\s+(?P<value>£\s?[\d,]+(?:\.\d{2})?[^\n.;]{0,60})")?,
                ],
                loose: vec![
                    pattern(r"ground\s+rent[^\n.;]{0,20}?(?P<value>£\s?[\d,]+(?:\.\d{2})?[^\n.;]{0,60})")?,
                ],
                plausible: Some(plausible_money),
            },
            FieldRule {
                key: FieldKey::ServiceChargePercent,
                specific: vec![
                    pattern(r"service\s+charge[^\n]{0,80}?(?P<value>\d{1,3}(?:\.\d{1,4})?)\s*(?:%|per\s*cent)")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>\d{1,3}(?:\.\d{1,4})?)\s*(?:%|per\s*cent)[^\n]{0,60}?service\s+charge")?,
                ],
                plausible: Some(plausible_percent),
            },
            FieldRule {
                key: FieldKey::ApportionmentBasis,
                specific: vec![
                    pattern(r"apportion(?:ed|ment)[^\n.;]{0,40}?(?:on|by|according\s+to)\s+(?P<value>[^\n.;]{5,100})")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>(?:a\s+)?(?:fair|due|rateable|equal)\s+proportion[^\n.;]{0,80})")?,
                ],
                plausible: None,
            },
            FieldRule {
                key: FieldKey::RepairsSummary,
                specific: vec![
                    pattern(r"(?P<value>[^\n.]{0,40}\bto\s+(?:keep|repair|maintain)\b[^\n.]{0,40}\brepair\b[^\n.]{0,120})")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\brepair(?:s|ing)?\b[^\n.]{0,160})")?,
                ],
                plausible: None,
            },
            FieldRule {
                key: FieldKey::AlterationsSummary,
                specific: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\bnot\s+to\s+(?:make|carry\s+out)\b[^\n.]{0,40}\balteration[^\n.]{0,120})")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\balteration(?:s)?\b[^\n.]{0,160})")?,
                ],
                plausible: None,
            },
            FieldRule {
                key: FieldKey::SublettingSummary,
                specific: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\bnot\s+to\s+(?:assign|underlet|sublet|sub-let|part\s+with\s+possession)\b[^\n.]{0,160})")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\b(?:assign|underlet|sublet|sub-let)\w*\b[^\n.]{0,160})")?,
                ],
                plausible: None,
            },
            FieldRule {
                key: FieldKey::InsuranceSummary,
                specific: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\bto\s+insure\b[^\n.]{0,160})")?,
                ],
                loose: vec![
                    pattern(r"(?P<value>[^\n.]{0,60}\binsur(?:e|es|ed|ance)\b[^\n.]{0,160})")?,
                ],
                plausible: None,
            },
        ];

        Ok(Self {
            rules,
            peppercorn: pattern(r"(?:rent\s+of\s+)?(?:one|a)\s+peppercorn")?,
        })
    }

    /// `extract`, seeded with values from a simpler upstream parser. A rule
    /// match always wins; baseline values only fill keys that would
    /// otherwise be not-found, and never above the base rung.
    pub fn extract_with_baseline(&self, text: &str, baseline: &[Field]) -> Vec<Field> {
        self.extract(text)
            .into_iter()
            .map(|field| {
                if field.origin != FieldOrigin::NotFound {
                    return field;
                }
                match baseline
                    .iter()
                    .find(|seed| seed.key == field.key && seed.origin != FieldOrigin::NotFound)
                {
                    Some(seed) => Field {
                        key: seed.key,
                        value: seed.value.clone(),
                        confidence: seed.confidence.min(BASE_CONFIDENCE),
                        origin: seed.origin,
                    },
                    None => field,
                }
            })
            .collect()
    }

    /// Runs every rule against the full text, then fills in derived and
    /// not-found entries so the output always covers `FieldKey::ALL`.
    pub fn extract(&self, text: &str) -> Vec<Field> {
        let mut matched: Vec<Field> = Vec::new();

        for rule in &self.rules {
            if rule.key == FieldKey::GroundRentTerms && self.peppercorn.is_match(text) {
                matched.push(Field {
                    key: FieldKey::GroundRentTerms,
                    value: PEPPERCORN_VALUE.to_string(),
                    confidence: PLAUSIBLE_CONFIDENCE,
                    origin: FieldOrigin::Matched,
                });
                continue;
            }
            if let Some(field) = apply_rule(rule, text) {
                matched.push(field);
            }
        }

        let mut fields = Vec::with_capacity(FieldKey::ALL.len());
        for key in FieldKey::ALL {
            if let Some(field) = matched.iter().find(|field| field.key == key) {
                fields.push(field.clone());
                continue;
            }
            if key == FieldKey::TermEnd {
                if let Some(derived) = derive_term_end(&matched) {
                    fields.push(derived);
                    continue;
                }
            }
            fields.push(Field {
                key,
                value: NOT_FOUND_VALUE.to_string(),
                confidence: NOT_FOUND_CONFIDENCE,
                origin: FieldOrigin::NotFound,
            });
        }
        fields
    }
}

fn apply_rule(rule: &FieldRule, text: &str) -> Option<Field> {
    for regex in rule.specific.iter().chain(rule.loose.iter()) {
        let Some(captures) = regex.captures(text) else {
            continue;
        };
        let Some(raw) = captures.name("value") else {
            continue;
        };
        let value = tidy(raw.as_str());
        if value.is_empty() {
            continue;
        }

        // Any hit earns the base rung. A long matched span shows the
        // pattern anchored on drafting language; the field's plausibility
        // check vouches for the value itself.
        let span = captures.get(0).map_or(0, |m| m.as_str().chars().count());
        let mut confidence = BASE_CONFIDENCE;
        if span > SPECIFICITY_CHARS {
            confidence = SPECIFIC_CONFIDENCE;
        }
        if let Some(check) = rule.plausible {
            if check(&value) {
                confidence = PLAUSIBLE_CONFIDENCE;
            }
        }

        return Some(Field {
            key: rule.key,
            value,
            confidence,
            origin: FieldOrigin::Matched,
        });
    }
    None
}

/// An expiry date computed from the commencement date plus the term length,
/// inclusive of the first day.
fn derive_term_end(matched: &[Field]) -> Option<Field> {
    let start = matched
        .iter()
        .find(|field| field.key == FieldKey::TermStart)
        .and_then(|field| parse_long_date(&field.value))?;
    let years: u32 = matched
        .iter()
        .find(|field| field.key == FieldKey::TermYears)
        .and_then(|field| field.value.parse().ok())?;

    let end = start
        .checked_add_months(Months::new(years.checked_mul(12)?))?
        .pred_opt()?;
    Some(Field {
        key: FieldKey::TermEnd,
        value: format_long_date(end),
        confidence: DERIVED_CONFIDENCE,
        origin: FieldOrigin::Derived,
    })
}

fn tidy(raw: &str) -> String {
    let collapsed: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|ch: char| ch == ',' || ch == ';' || ch == ':' || ch.is_whitespace())
        .to_string()
}
