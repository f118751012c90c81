//! Question complexity analysis: a pure function from question text to a
//! score in [0, 1] and a hop target.

use serde::Serialize;

/// Signals detected in the question text. Each contributes a fixed weight
/// to the complexity score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Indicators {
    /// Coordinator count: "and"/"or"/"vs", comma-joined clauses, extra "?".
    pub multi_aspect: u32,
    pub comparison: bool,
    pub causal: bool,
    pub process: bool,
    pub evaluation: bool,
    pub temporal: bool,
    /// Token count normalized into [0, 1].
    pub length_factor: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Complexity {
    /// Weighted indicator sum, clipped to [0, 1].
    pub score: f64,
    /// Hop target derived from the score, clamped to [min_hops, max_hops].
    pub estimated_hops: u32,
    pub confidence: f64,
    pub reasoning: &'static str,
    pub indicators: Indicators,
}

const COMPARISON_TERMS: &[&str] = &["compare", "difference", "vs", "versus"];
const CAUSAL_TERMS: &[&str] = &["why", "cause", "reason"];
const PROCESS_TERMS: &[&str] = &["how", "steps", "mechanism"];
const EVALUATION_TERMS: &[&str] = &[
    "best",
    "worst",
    "pros",
    "cons",
    "advantages",
    "disadvantages",
];
const TEMPORAL_TERMS: &[&str] = &["when", "history", "future", "trend"];

/// Word count at which `length_factor` saturates.
const LENGTH_SATURATION: f64 = 20.0;

fn contains_term(words: &[&str], terms: &[&str]) -> bool {
    words.iter().any(|w| terms.contains(w))
}

/// Count coordinators that suggest the question bundles several facets.
fn count_coordinators(question: &str, words: &[&str]) -> u32 {
    let mut count = 0u32;
    count += words.iter().filter(|w| matches!(**w, "and" | "or" | "vs")).count() as u32;
    count += question.matches(',').count() as u32;
    // A single trailing "?" is normal; each additional one is a facet signal.
    count += (question.matches('?').count().saturating_sub(1)) as u32;
    count
}

/// Analyze a question's complexity. Deterministic and side-effect free.
pub fn analyze(question: &str, min_hops: u32, max_hops: u32) -> Complexity {
    let lower = question.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| !w.is_empty())
        .collect();

    let indicators = Indicators {
        multi_aspect: count_coordinators(&lower, &words),
        comparison: contains_term(&words, COMPARISON_TERMS),
        causal: contains_term(&words, CAUSAL_TERMS),
        process: contains_term(&words, PROCESS_TERMS),
        evaluation: contains_term(&words, EVALUATION_TERMS),
        temporal: contains_term(&words, TEMPORAL_TERMS),
        length_factor: (words.len() as f64 / LENGTH_SATURATION).min(1.0),
    };

    let mut score = 0.0;
    score += 0.15 * indicators.multi_aspect.min(3) as f64;
    if indicators.comparison {
        score += 0.4;
    }
    if indicators.causal {
        score += 0.2;
    }
    if indicators.process {
        score += 0.2;
    }
    if indicators.evaluation {
        score += 0.3;
    }
    if indicators.temporal {
        score += 0.15;
    }
    score += 0.2 * indicators.length_factor;
    let score = score.min(1.0);

    let (reasoning, confidence) = if score < 0.2 {
        ("simple, focused question requiring minimal decomposition", 0.9)
    } else if score < 0.4 {
        ("moderately simple question with one or two facets", 0.8)
    } else if score < 0.6 {
        ("complex question with multiple facets or comparisons", 0.7)
    } else if score < 0.8 {
        ("highly complex question requiring multiple perspectives", 0.6)
    } else {
        ("very complex question with many interconnected facets", 0.5)
    };

    let raw_hops: u32 = if score < 0.2 {
        3
    } else if score < 0.6 {
        7
    } else {
        10
    };
    let estimated_hops = raw_hops.clamp(min_hops, max_hops);

    Complexity {
        score,
        estimated_hops,
        confidence,
        reasoning,
        indicators,
    }
}
