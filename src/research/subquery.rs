//! Sub-query generation: one focused retrieval query per targeted aspect.
//! LLM-preferred with per-aspect template fallback, plus the up-front batch
//! generator used in non-adaptive mode.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::llm::{GenerateOptions, LlmClient};
use crate::research::aspect::{self, Aspect, AspectType};
use crate::research::prompts;

/// Hard bound on sub-query length, in characters.
pub const MAX_QUERY_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrigin {
    Llm,
    Template,
}

/// A retrieval query paired with the aspect it targets (display name).
/// `aspect` is `None` only for the degenerate first hop and for batch mode.
#[derive(Debug, Clone)]
pub struct PlannedQuery {
    pub text: String,
    pub aspect: Option<String>,
    pub origin: QueryOrigin,
}

/// Collapse whitespace and bound the length.
pub fn normalize_query(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    aspect::truncate_chars(&collapsed, MAX_QUERY_CHARS)
}

/// Generate sub-queries for the given target aspects (already ordered
/// importance-descending; the first `max` are taken). One LLM call covers
/// the whole batch; any aspect the reply misses falls back to its
/// template. Never returns fewer queries than targets taken.
pub async fn plan_for_aspects(
    question: &str,
    targets: &[&Aspect],
    llm: Option<&dyn LlmClient>,
    max: usize,
) -> Vec<PlannedQuery> {
    let chosen: Vec<&Aspect> = targets.iter().take(max.max(1)).copied().collect();
    if chosen.is_empty() {
        return Vec::new();
    }

    let mut llm_pairs: HashMap<String, String> = HashMap::new();
    if let Some(llm) = llm {
        let aspect_lines: Vec<String> = chosen
            .iter()
            .map(|a| {
                format!(
                    "- {} ({:?}, {})",
                    a.name,
                    a.kind,
                    if a.is_core() { "core" } else { "optional" }
                )
            })
            .collect();
        let user_prompt = format!(
            "Main question: {}\n\nAspects to cover:\n{}",
            question,
            aspect_lines.join("\n")
        );
        let options = GenerateOptions {
            temperature: 0.3,
            max_tokens: 256,
        };
        match llm
            .generate(prompts::SUBQUERY_SYSTEM_PROMPT, &user_prompt, &options)
            .await
        {
            Ok(reply) => llm_pairs = parse_llm_pairs(&reply),
            Err(e) => warn!(error = %e, "LLM sub-query generation failed, using templates"),
        }
    }

    chosen
        .into_iter()
        .map(|a| match llm_pairs.remove(&a.canonical()) {
            Some(query) if !query.is_empty() => PlannedQuery {
                text: normalize_query(&query),
                aspect: Some(a.name.clone()),
                origin: QueryOrigin::Llm,
            },
            _ => {
                debug!(aspect = %a.name, "no LLM pair, using template");
                PlannedQuery {
                    text: template_for(a),
                    aspect: Some(a.name.clone()),
                    origin: QueryOrigin::Template,
                }
            }
        })
        .collect()
}

/// Parse `aspect name :: query` lines from the LLM reply. Keys are
/// canonical aspect names; malformed lines are skipped.
pub fn parse_llm_pairs(reply: &str) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    for line in reply.lines() {
        let Some((name, query)) = line.split_once("::") else {
            continue;
        };
        // Tolerate list markers the model sometimes adds.
        let name = name.trim().trim_start_matches(['-', '*', ' ']);
        let name = name
            .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
            .trim();
        let query = query.trim();
        if name.is_empty() || query.is_empty() {
            continue;
        }
        pairs.insert(aspect::canonical(name), query.to_string());
    }
    pairs
}

/// Template sub-query by aspect type.
pub fn template_for(aspect: &Aspect) -> String {
    let topic = topic_of(&aspect.name);
    let query = match aspect.kind {
        AspectType::Definition => format!("What is {}?", topic),
        AspectType::Comparison => format!("What are the differences in {}?", topic),
        AspectType::Process => format!("How does {} work?", topic),
        AspectType::Causal => format!("Why is {} important?", topic),
        AspectType::Evaluation => format!("What are the pros and cons of {}?", topic),
        AspectType::Application => format!("What are the applications of {}?", topic),
        AspectType::Temporal => format!("How has {} developed over time?", topic),
        AspectType::Other => {
            let name = aspect.name.trim();
            if name.ends_with('?') {
                name.to_string()
            } else {
                format!("{}?", name)
            }
        }
    };
    normalize_query(&query)
}

/// Derive the bare topic from an aspect name by stripping leading phrases
/// ("definition of", "comparison between", ...).
fn topic_of(name: &str) -> String {
    let topic = aspect::strip_question_phrases(name);
    if topic.is_empty() {
        name.trim().trim_end_matches('?').to_string()
    } else {
        topic
    }
}

/// A candidate sub-query scored against the main question.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredQuery {
    pub text: String,
    /// 70% key-term overlap with the main question, 30% new-term diversity.
    pub relevance: f64,
}

/// Score and order candidate sub-queries by relevance to the main question.
pub fn score_subqueries(question: &str, candidates: &[String]) -> Vec<ScoredQuery> {
    let main_terms: std::collections::HashSet<String> =
        aspect::keywords_from(question).into_iter().collect();

    let mut scored: Vec<ScoredQuery> = candidates
        .iter()
        .map(|candidate| {
            let terms: std::collections::HashSet<String> =
                aspect::keywords_from(candidate).into_iter().collect();
            let overlap = if main_terms.is_empty() {
                0.0
            } else {
                terms.intersection(&main_terms).count() as f64 / main_terms.len() as f64
            };
            let new_terms = terms.difference(&main_terms).count() as f64;
            let diversity = (new_terms / 5.0).min(1.0);
            ScoredQuery {
                text: candidate.clone(),
                relevance: 0.7 * overlap + 0.3 * diversity,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scored
}

/// Generate `count` sub-queries up front for batch mode. One LLM call; on
/// failure or absence, deterministic variations of the question's key
/// terms.
pub async fn plan_batch(
    question: &str,
    count: usize,
    llm: Option<&dyn LlmClient>,
) -> Vec<PlannedQuery> {
    if let Some(llm) = llm {
        let user_prompt = format!(
            "Main question: {}\n\nWrite {} distinct search queries.",
            question, count
        );
        let options = GenerateOptions {
            temperature: 0.4,
            max_tokens: 512,
        };
        match llm
            .generate(prompts::BATCH_SUBQUERY_SYSTEM_PROMPT, &user_prompt, &options)
            .await
        {
            Ok(reply) => {
                let candidates: Vec<String> = reply
                    .lines()
                    .map(|l| {
                        l.trim()
                            .trim_start_matches(['-', '*'])
                            .trim_start_matches(|c: char| {
                                c.is_ascii_digit() || c == '.' || c == ')'
                            })
                            .trim()
                            .to_string()
                    })
                    .filter(|l| !l.is_empty())
                    .map(|l| normalize_query(&l))
                    .collect();
                if !candidates.is_empty() {
                    // Most relevant first, then cap at the requested count.
                    return score_subqueries(question, &candidates)
                        .into_iter()
                        .take(count)
                        .map(|sq| PlannedQuery {
                            text: sq.text,
                            aspect: None,
                            origin: QueryOrigin::Llm,
                        })
                        .collect();
                }
                warn!("LLM batch reply had no usable lines, using variations");
            }
            Err(e) => warn!(error = %e, "LLM batch generation failed, using variations"),
        }
    }

    fallback_variations(question, count)
        .into_iter()
        .map(|text| PlannedQuery {
            text,
            aspect: None,
            origin: QueryOrigin::Template,
        })
        .collect()
}

/// Deterministic question variations used when no LLM is available.
pub fn fallback_variations(question: &str, count: usize) -> Vec<String> {
    let terms = aspect::keywords_from(question).join(" ");
    let base = if terms.is_empty() {
        question.trim().trim_end_matches('?').to_string()
    } else {
        terms
    };

    let mut variations = vec![
        question.trim().to_string(),
        format!("what is {}", base),
        format!("how does {} work", base),
        format!("examples of {}", base),
        format!("applications of {}", base),
        format!("benefits of {}", base),
        format!("challenges of {}", base),
        format!("future of {}", base),
    ];

    let mut seen = std::collections::HashSet::new();
    variations.retain(|v| seen.insert(v.to_lowercase()));
    variations.truncate(count.max(1));
    variations.iter().map(|v| normalize_query(v)).collect()
}
