//! Source-coverage post-pass (spec §4.4 "Source-coverage post-pass"),
//! grounded on `original_source/app/core/source_coverage.py`. Applied by
//! the worker after the loop finishes, not by the loop itself.

use once_cell::sync::Lazy;
use regex::Regex;

use runfabric_types::Citation;

static NUMBER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\d[\d.,]*\s*(%|€|eur|usd|\$|m€|k€|million[s]?|milliard[s]?|tonnes?|kg|km)").unwrap()
});
static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d{1,2}/\d{1,2}/\d{2,4}\b|\b\d{4}-\d{2}-\d{2}\b|\b(janvier|février|mars|avril|mai|juin|juillet|août|septembre|octobre|novembre|décembre)\s+\d{4}\b",
    )
    .unwrap()
});
static CITATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[(?:source|réf|ref)[^\]]*\]|\[\d+\]").unwrap());
static DISCLAIMER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)à confirmer|à vérifier|sous réserve|non vérifié|sans source").unwrap()
});

const REACTIVE_DISCLAIMER: &str =
    "\n\n_Certaines informations ci-dessus n'ont pas pu être vérifiées par une source documentaire._";
const NON_REACTIVE_DISCLAIMER: &str =
    "\n\n_Certains passages de cette réponse ne sont pas rattachés à une source précise ; merci de les vérifier._";

fn count_claims(text: &str) -> usize {
    NUMBER_PATTERN.find_iter(text).count() + DATE_PATTERN.find_iter(text).count()
}

fn has_disclaimer(text: &str) -> bool {
    DISCLAIMER_PATTERN.is_match(text)
}

fn has_citation_marker(text: &str) -> bool {
    CITATION_PATTERN.is_match(text)
}

#[derive(Debug, Clone)]
pub struct SourceCoverageResult {
    pub coverage_adequate: bool,
    pub disclaimer: Option<String>,
    pub uncited_paragraphs: Vec<String>,
}

impl SourceCoverageResult {
    pub fn needs_disclaimer(&self) -> bool {
        !self.coverage_adequate && self.disclaimer.is_some()
    }

    fn adequate() -> Self {
        Self { coverage_adequate: true, disclaimer: None, uncited_paragraphs: vec![] }
    }
}

/// Reactive-profile heuristic: response-wide, cheap, no paragraph walk.
pub fn check_source_coverage_heuristic(response_text: &str, citations_count: usize) -> SourceCoverageResult {
    let claims = count_claims(response_text);
    if claims == 0 || citations_count > 0 || has_disclaimer(response_text) {
        return SourceCoverageResult::adequate();
    }
    SourceCoverageResult {
        coverage_adequate: false,
        disclaimer: Some(REACTIVE_DISCLAIMER.to_string()),
        uncited_paragraphs: vec![],
    }
}

/// Non-reactive profile: per-paragraph analysis, replaces the
/// `ensure_source_coverage` plan step.
pub fn analyze_source_coverage(response_text: &str, _citations: &[Citation]) -> SourceCoverageResult {
    let mut uncited = Vec::new();
    for paragraph in response_text.split('\n') {
        let trimmed = paragraph.trim();
        if trimmed.is_empty() || count_claims(trimmed) == 0 {
            continue;
        }
        if has_citation_marker(trimmed) || has_disclaimer(trimmed) {
            continue;
        }
        uncited.push(trimmed.chars().take(100).collect::<String>());
    }

    if uncited.is_empty() {
        return SourceCoverageResult::adequate();
    }
    SourceCoverageResult {
        coverage_adequate: false,
        disclaimer: Some(NON_REACTIVE_DISCLAIMER.to_string()),
        uncited_paragraphs: uncited,
    }
}
