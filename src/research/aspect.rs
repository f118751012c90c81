//! Aspect extraction: the distinct facets of a question that a complete
//! answer must cover. LLM-preferred with a pattern-driven fallback; never
//! fails; the worst case is a single synthetic aspect for the whole
//! question.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::llm::{GenerateOptions, LlmClient};
use crate::research::prompts;

/// Aspects at or above this importance are core: the loop will not stop
/// early while one remains uncovered.
pub const CORE_IMPORTANCE: f64 = 0.8;

/// Maximum display length of an aspect name.
pub const MAX_NAME_CHARS: usize = 120;

const STOP_WORDS: &[&str] = &[
    "what", "which", "where", "when", "does", "have", "with", "that", "this", "from", "about",
    "some", "there", "their", "they", "your", "been", "were", "how", "could", "would", "should",
    "shall", "will", "into", "also", "just", "like", "make", "using", "used", "need", "want",
    "find", "know", "tell", "many", "much", "very", "really", "please", "help", "more", "most",
    "only", "between", "compare", "versus", "explain", "describe", "why",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectType {
    Definition,
    Comparison,
    Process,
    Causal,
    Evaluation,
    Application,
    Temporal,
    Other,
}

impl AspectType {
    fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "definition" => Self::Definition,
            "comparison" => Self::Comparison,
            "process" => Self::Process,
            "causal" => Self::Causal,
            "evaluation" => Self::Evaluation,
            "application" => Self::Application,
            "temporal" => Self::Temporal,
            _ => Self::Other,
        }
    }
}

/// One facet of the research question.
#[derive(Debug, Clone, Serialize)]
pub struct Aspect {
    /// Display name, original casing, unique per run (case-insensitive).
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AspectType,
    /// [0, 1]; >= [`CORE_IMPORTANCE`] marks the aspect core.
    pub importance: f64,
    /// Lowercased, deduplicated matching terms.
    pub keywords: Vec<String>,
}

impl Aspect {
    pub fn new(
        name: impl Into<String>,
        kind: AspectType,
        importance: f64,
        keywords: Vec<String>,
    ) -> Self {
        Self {
            name: truncate_chars(&name.into(), MAX_NAME_CHARS),
            kind,
            importance: importance.clamp(0.0, 1.0),
            keywords: normalize_keywords(keywords),
        }
    }

    /// Canonical lookup key: trimmed, lowercased.
    pub fn canonical(&self) -> String {
        canonical(&self.name)
    }

    pub fn is_core(&self) -> bool {
        self.importance >= CORE_IMPORTANCE
    }
}

pub fn canonical(name: &str) -> String {
    name.trim().to_lowercase()
}

pub fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.trim().to_string()
    } else {
        s.chars().take(max).collect::<String>().trim_end().to_string()
    }
}

fn normalize_keywords(keywords: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    keywords
        .into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

/// Extract matching terms from free text. Handles hyphenated phrases and
/// filters stop words. Order-preserving, capped at 6 terms.
pub fn keywords_from(text: &str) -> Vec<String> {
    let mut keywords = Vec::new();

    for word in text.split_whitespace() {
        // Strip punctuation
        let clean: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        if clean.is_empty() {
            continue;
        }

        // Keep hyphenated terms as-is (e.g., "multi-head")
        if clean.contains('-') || clean.contains('_') {
            keywords.push(clean.to_lowercase());
            // Also add the parts individually
            for part in clean.split(|c: char| c == '-' || c == '_') {
                if part.len() > 2 && !STOP_WORDS.contains(&part.to_lowercase().as_str()) {
                    keywords.push(part.to_lowercase());
                }
            }
        } else if clean.len() > 2 && !STOP_WORDS.contains(&clean.to_lowercase().as_str()) {
            keywords.push(clean.to_lowercase());
        }
    }

    // Deduplicate while preserving order
    let mut seen = std::collections::HashSet::new();
    keywords.retain(|k| seen.insert(k.clone()));
    keywords.truncate(6);
    keywords
}

/// Outcome of aspect extraction.
pub struct Extraction {
    pub aspects: Vec<Aspect>,
    /// True when the heuristic path produced the aspects (LLM absent,
    /// failed, or returned nothing usable).
    pub fallback: bool,
}

/// Extract the facet list for a question. Prefers the LLM; falls back to
/// pattern heuristics. Never fails.
pub async fn extract(question: &str, llm: Option<&dyn LlmClient>) -> Extraction {
    if let Some(llm) = llm {
        let options = GenerateOptions {
            temperature: 0.2,
            max_tokens: 512,
        };
        match llm
            .generate(prompts::ASPECT_SYSTEM_PROMPT, question, &options)
            .await
        {
            Ok(reply) => {
                let aspects = parse_llm_aspects(&reply);
                if !aspects.is_empty() {
                    debug!(count = aspects.len(), "aspects extracted via LLM");
                    return Extraction {
                        aspects,
                        fallback: false,
                    };
                }
                warn!("LLM aspect reply had no valid entries, using heuristic");
            }
            Err(e) => {
                warn!(error = %e, "LLM aspect extraction failed, using heuristic");
            }
        }
    }

    Extraction {
        aspects: extract_heuristic(question),
        fallback: true,
    }
}

#[derive(Deserialize)]
struct RawAspect {
    name: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    keywords: Vec<String>,
}

/// Parse the LLM's JSON array. Malformed entries are dropped silently;
/// duplicates (case-insensitive) keep the first occurrence.
pub fn parse_llm_aspects(reply: &str) -> Vec<Aspect> {
    let json = match (reply.find('['), reply.rfind(']')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Vec::new(),
    };

    let raw: Vec<RawAspect> = match serde_json::from_str(json) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "aspect JSON did not parse");
            return Vec::new();
        }
    };

    let mut seen = std::collections::HashSet::new();
    let mut aspects = Vec::new();
    for entry in raw {
        let name = entry.name.trim();
        if name.is_empty() {
            continue;
        }
        let mut keywords = entry.keywords;
        if keywords.iter().all(|k| k.trim().is_empty()) {
            // An aspect with no matching terms could never be covered.
            keywords = keywords_from(name);
        }
        let aspect = Aspect::new(
            name,
            AspectType::parse(entry.kind.as_deref().unwrap_or("other")),
            entry.importance.unwrap_or(0.6),
            keywords,
        );
        if aspect.keywords.is_empty() {
            continue;
        }
        if seen.insert(aspect.canonical()) {
            aspects.push(aspect);
        }
        if aspects.len() == 10 {
            break;
        }
    }

    sort_by_importance(&mut aspects);
    aspects
}

/// Pattern-driven extraction used when no LLM is available.
pub fn extract_heuristic(question: &str) -> Vec<Aspect> {
    let trimmed = question.trim();
    let lower = trimmed.to_lowercase();

    let mut aspects = Vec::new();

    if let Some((left, right)) = split_comparison(trimmed) {
        let mut comparison_kw = vec!["comparison".to_string(), "difference".to_string()];
        comparison_kw.extend(keywords_from(&left));
        comparison_kw.extend(keywords_from(&right));
        aspects.push(Aspect::new(
            format!("Definition of {}", left),
            AspectType::Definition,
            1.0,
            keywords_from(&left),
        ));
        aspects.push(Aspect::new(
            format!("Definition of {}", right),
            AspectType::Definition,
            1.0,
            keywords_from(&right),
        ));
        aspects.push(Aspect::new(
            format!("Comparison of {} and {}", left, right),
            AspectType::Comparison,
            1.0,
            comparison_kw,
        ));
    } else {
        let topic = strip_question_phrases(trimmed);
        let topic_kw = keywords_from(&topic);

        if !topic_kw.is_empty() {
            if contains_any(&lower, &["advantage", "disadvantage", "pros", "cons", "best", "worst"])
            {
                aspects.push(Aspect::new(
                    format!("Advantages and disadvantages of {}", topic),
                    AspectType::Evaluation,
                    1.0,
                    topic_kw.clone(),
                ));
            }
            if lower.starts_with("how") || contains_any(&lower, &["steps", "mechanism", "process"])
            {
                aspects.push(Aspect::new(
                    format!("How {} works", topic),
                    AspectType::Process,
                    1.0,
                    topic_kw.clone(),
                ));
            }
            if lower.starts_with("why") || contains_any(&lower, &["cause", "reason"]) {
                aspects.push(Aspect::new(
                    format!("Why {} matters", topic),
                    AspectType::Causal,
                    1.0,
                    topic_kw.clone(),
                ));
            }
            if contains_any(&lower, &["history", "future", "trend", "evolution"])
                || lower.starts_with("when")
            {
                aspects.push(Aspect::new(
                    format!("History and outlook of {}", topic),
                    AspectType::Temporal,
                    1.0,
                    topic_kw.clone(),
                ));
            }
            if contains_any(&lower, &["application", "use case", "used for"]) {
                aspects.push(Aspect::new(
                    format!("Applications of {}", topic),
                    AspectType::Application,
                    1.0,
                    topic_kw.clone(),
                ));
            }
            if aspects.is_empty() && (lower.starts_with("what is") || lower.starts_with("what are"))
            {
                aspects.push(Aspect::new(
                    format!("Definition of {}", topic),
                    AspectType::Definition,
                    1.0,
                    topic_kw.clone(),
                ));
            }
        }
    }

    // Generic fallback: one core aspect covering the whole question.
    if aspects.is_empty() {
        let name = trimmed.trim_end_matches(['?', '.', '!']).to_string();
        let keywords = keywords_from(trimmed);
        if !keywords.is_empty() {
            aspects.push(Aspect::new(name, AspectType::Other, 1.0, keywords));
        }
    }

    dedup_by_canonical(&mut aspects);
    sort_by_importance(&mut aspects);
    aspects
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Split a comparison question into its two sides, if it is one.
///
/// Byte offsets found in the lowercased text are applied to the original,
/// so this only runs on ASCII questions; anything else falls through to
/// the generic patterns.
fn split_comparison(question: &str) -> Option<(String, String)> {
    if !question.is_ascii() {
        return None;
    }
    let lower = question.to_lowercase();

    let split_at = |marker: &str| -> Option<(String, String)> {
        let idx = lower.find(marker)?;
        let left = clean_side(&question[..idx]);
        let right = clean_side(&question[idx + marker.len()..]);
        if left.is_empty() || right.is_empty() {
            None
        } else {
            Some((left, right))
        }
    };

    if let Some(rest) = lower.find("difference between ") {
        let tail = &question[rest + "difference between ".len()..];
        let tail_lower = tail.to_lowercase();
        if let Some(and_idx) = tail_lower.find(" and ") {
            let left = clean_side(&tail[..and_idx]);
            let right = clean_side(&tail[and_idx + " and ".len()..]);
            if !left.is_empty() && !right.is_empty() {
                return Some((left, right));
            }
        }
    }

    if let Some(pair) = split_at(" versus ") {
        return Some(pair);
    }
    if let Some(pair) = split_at(" vs ") {
        return Some(pair);
    }
    if let Some(pair) = split_at(" vs. ") {
        return Some(pair);
    }

    if let Some(idx) = lower.find("compare ") {
        let tail = &question[idx + "compare ".len()..];
        let tail_lower = tail.to_lowercase();
        for marker in [" and ", " with ", " to "] {
            if let Some(m) = tail_lower.find(marker) {
                let left = clean_side(&tail[..m]);
                let right = clean_side(&tail[m + marker.len()..]);
                if !left.is_empty() && !right.is_empty() {
                    return Some((left, right));
                }
            }
        }
    }

    None
}

/// Strip interrogative scaffolding from one side of a comparison.
fn clean_side(side: &str) -> String {
    let mut s = side.trim().trim_end_matches(['?', '.', ',']).trim().to_string();
    let lower = s.to_lowercase();
    for prefix in ["compare ", "what is ", "what are ", "the "] {
        if lower.starts_with(prefix) && s.is_char_boundary(prefix.len()) {
            s = s[prefix.len()..].trim().to_string();
            break;
        }
    }
    s
}

/// Reduce a question to its topic by stripping leading interrogatives and
/// trailing filler.
pub fn strip_question_phrases(question: &str) -> String {
    let mut s = question.trim().trim_end_matches(['?', '.', '!']).to_string();

    let prefixes = [
        "what are the advantages and disadvantages of ",
        "what are the pros and cons of ",
        "advantages and disadvantages of ",
        "pros and cons of ",
        "what is the definition of ",
        "definition of ",
        "comparison between ",
        "comparison of ",
        "applications of ",
        "what is ",
        "what are ",
        "how does ",
        "how do ",
        "how ",
        "why is ",
        "why are ",
        "why do ",
        "why ",
        "when did ",
        "when ",
        "explain ",
        "describe ",
        "tell me about ",
        "the ",
        "a ",
        "an ",
    ];

    loop {
        let lower = s.to_lowercase();
        let mut stripped = false;
        for prefix in prefixes {
            if lower.starts_with(prefix)
                && s.len() > prefix.len()
                && s.is_char_boundary(prefix.len())
            {
                s = s[prefix.len()..].trim_start().to_string();
                stripped = true;
                break;
            }
        }
        if !stripped {
            break;
        }
    }

    for suffix in [" work", " works", " worked", " important", " matter", " matters"] {
        let lower = s.to_lowercase();
        if lower.ends_with(suffix)
            && s.len() >= suffix.len()
            && s.is_char_boundary(s.len() - suffix.len())
        {
            s.truncate(s.len() - suffix.len());
            s = s.trim_end().to_string();
        }
    }

    s.trim().to_string()
}

fn dedup_by_canonical(aspects: &mut Vec<Aspect>) {
    let mut seen = std::collections::HashSet::new();
    aspects.retain(|a| seen.insert(a.canonical()));
}

/// Importance-descending, ties broken by appearance order (stable sort).
fn sort_by_importance(aspects: &mut [Aspect]) {
    aspects.sort_by(|a, b| {
        b.importance
            .partial_cmp(&a.importance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}
