//! Final answer synthesis: LLM-backed when possible, deterministic
//! concatenation otherwise, plus citation assembly. Always produces an
//! answer; a run with zero evidence still gets an honest one.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, warn};

use crate::llm::{GenerateOptions, LlmClient};
use crate::research::aspect::{keywords_from, truncate_chars};
use crate::research::coverage::AspectCoverage;
use crate::research::prompts;
use crate::research::HopRecord;
use crate::retriever::Passage;

/// Patterns that indicate the LLM refused to engage or produced a non-answer.
const REFUSAL_PATTERNS: &[&str] = &[
    "i don't have the ability",
    "i cannot access",
    "i apologize",
    "i'm unable to",
    "i can't access",
    "don't have access",
    "as an ai language model",
    "the provided findings do not",
    "no mention of",
    "there is no mention",
];

/// Approximate snippet length for citations, in characters.
const SNIPPET_CHARS: usize = 240;

/// How far the snippet window starts before the first keyword hit.
const SNIPPET_LEAD_CHARS: usize = 40;

#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub id: String,
    pub title: String,
    pub filename: String,
    /// Highest similarity score seen for this passage across all hops.
    pub score: f64,
    pub snippet: String,
}

/// Deduplicate passages across all hops by id, first-seen order, keeping
/// the highest score. The snippet centers on the first hit of the hop's
/// sub-query terms.
pub fn build_citations(hops: &[HopRecord]) -> Vec<Citation> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: std::collections::HashMap<String, Citation> = std::collections::HashMap::new();

    for hop in hops {
        let terms = keywords_from(&hop.sub_query);
        for passage in &hop.passages {
            match by_id.get_mut(&passage.id) {
                Some(existing) => {
                    if passage.score > existing.score {
                        existing.score = passage.score;
                    }
                }
                None => {
                    order.push(passage.id.clone());
                    by_id.insert(
                        passage.id.clone(),
                        Citation {
                            id: passage.id.clone(),
                            title: passage.title.clone(),
                            filename: passage.filename.clone(),
                            score: passage.score,
                            snippet: snippet_around(&passage.text, &terms),
                        },
                    );
                }
            }
        }
    }

    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// A window of roughly [`SNIPPET_CHARS`] characters around the first
/// keyword hit; the text head when nothing hits.
fn snippet_around(text: &str, terms: &[String]) -> String {
    let lower = text.to_lowercase();
    let hit = terms
        .iter()
        .filter_map(|t| lower.find(t.as_str()))
        .min()
        .unwrap_or(0);

    // Lowercasing can shift byte offsets for non-ASCII text; snap back to
    // the nearest valid boundary.
    let mut start = hit.saturating_sub(SNIPPET_LEAD_CHARS).min(text.len());
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }

    let window: String = text[start..].chars().take(SNIPPET_CHARS).collect();
    let mut snippet = window.trim().to_string();
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if text[start..].chars().count() > SNIPPET_CHARS {
        snippet.push_str("...");
    }
    snippet
}

/// Extractive summary of a hop's passages: sentences ranked by term
/// overlap with the sub-query, top two per passage, three overall.
pub fn summarize_passages(passages: &[Passage], sub_query: &str) -> String {
    if passages.is_empty() {
        return "No relevant information found for this sub-query.".to_string();
    }

    let query_terms: HashSet<String> = keywords_from(sub_query).into_iter().collect();
    let mut selected: Vec<String> = Vec::new();

    for passage in passages {
        let mut scored: Vec<(usize, &str)> = split_sentences(&passage.text)
            .into_iter()
            .map(|s| {
                let words: HashSet<String> = keywords_from(s).into_iter().collect();
                (words.intersection(&query_terms).count(), s)
            })
            .filter(|(overlap, _)| *overlap > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));
        selected.extend(scored.into_iter().take(2).map(|(_, s)| s.to_string()));
    }

    let mut seen = HashSet::new();
    selected.retain(|s| seen.insert(s.clone()));
    selected.truncate(3);

    if selected.is_empty() {
        // Nothing overlapped; fall back to the head of the best passage.
        return truncate_chars(&passages[0].text, 200);
    }
    selected.join(" ")
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.len() > 10)
        .collect()
}

/// Synthesize the final answer. Returns the answer and whether the
/// deterministic fallback was used in place of the LLM.
pub async fn synthesize(
    question: &str,
    hops: &[HopRecord],
    coverage: Option<&AspectCoverage>,
    citations: &[Citation],
    llm: Option<&dyn LlmClient>,
) -> (String, bool) {
    if let Some(llm) = llm {
        let user_prompt = build_synthesis_prompt(question, hops, coverage, citations);
        let options = GenerateOptions {
            temperature: 0.3,
            max_tokens: 1500,
        };
        match llm
            .generate(prompts::SYNTHESIS_SYSTEM_PROMPT, &user_prompt, &options)
            .await
        {
            Ok(answer) if !looks_broken(&answer) => {
                debug!(answer_len = answer.len(), "LLM synthesis complete");
                return (answer.trim().to_string(), false);
            }
            Ok(_) => warn!("LLM synthesis looked like a refusal, using deterministic synthesis"),
            Err(e) => warn!(error = %e, "LLM synthesis failed, using deterministic synthesis"),
        }
        return (synthesize_deterministic(question, hops, coverage, citations), true);
    }

    (synthesize_deterministic(question, hops, coverage, citations), true)
}

fn looks_broken(answer: &str) -> bool {
    let lower = answer.to_lowercase();
    answer.trim().is_empty() || REFUSAL_PATTERNS.iter().any(|p| lower.contains(p))
}

fn build_synthesis_prompt(
    question: &str,
    hops: &[HopRecord],
    coverage: Option<&AspectCoverage>,
    citations: &[Citation],
) -> String {
    let index_of: std::collections::HashMap<&str, usize> = citations
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i + 1))
        .collect();

    let mut prompt = format!("Main question: {}\n\nFindings:\n", question);
    for hop in hops {
        prompt.push_str(&format!("Hop {}: {}\n", hop.hop, hop.sub_query));
        for passage in &hop.passages {
            if let Some(n) = index_of.get(passage.id.as_str()) {
                let label = if !passage.title.is_empty() {
                    &passage.title
                } else if !passage.filename.is_empty() {
                    &passage.filename
                } else {
                    &passage.id
                };
                prompt.push_str(&format!("  [#{}] {} (score {:.2})\n", n, label, passage.score));
            }
        }
        prompt.push_str(&format!("  Summary: {}\n", hop.summary));
    }

    if let Some(cov) = coverage.filter(|c| !c.is_empty()) {
        prompt.push_str("\nFacet coverage:\n");
        for snap in cov.snapshot() {
            prompt.push_str(&format!(
                "- {} ({}, {:.0}% covered)\n",
                snap.name,
                if snap.importance >= crate::research::aspect::CORE_IMPORTANCE {
                    "core"
                } else {
                    "optional"
                },
                snap.score * 100.0
            ));
        }
    }

    prompt.push_str("\nWrite the final answer, citing passages as [#n].");
    prompt
}

/// Deterministic synthesis: one paragraph per covered aspect built from the
/// top passage of the hop that first covered it; uncovered aspects are
/// called out rather than papered over.
pub fn synthesize_deterministic(
    question: &str,
    hops: &[HopRecord],
    coverage: Option<&AspectCoverage>,
    citations: &[Citation],
) -> String {
    let total_passages: usize = hops.iter().map(|h| h.passages.len()).sum();

    if total_passages == 0 {
        let mut answer = format!(
            "No supporting passages were retrieved for \"{}\". The corpus may not cover this topic.",
            question
        );
        if let Some(cov) = coverage.filter(|c| !c.is_empty()) {
            let names: Vec<&str> = cov.aspects().iter().map(|a| a.name.as_str()).collect();
            answer.push_str(&format!("\n\nUncovered facets: {}.", names.join("; ")));
        }
        return answer;
    }

    let index_of: std::collections::HashMap<&str, usize> = citations
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i + 1))
        .collect();

    let mut parts = vec![format!(
        "Based on the retrieved passages, here is what was found about \"{}\":",
        question
    )];

    match coverage.filter(|c| !c.is_empty()) {
        Some(cov) => {
            let mut not_covered: Vec<&str> = Vec::new();
            for aspect in cov.aspects() {
                let Some(hop_no) = cov.covered_at_hop(&aspect.canonical()) else {
                    not_covered.push(&aspect.name);
                    continue;
                };
                let Some(hop) = hops.iter().find(|h| h.hop == hop_no) else {
                    not_covered.push(&aspect.name);
                    continue;
                };
                let Some(top) = hop
                    .passages
                    .iter()
                    .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
                else {
                    not_covered.push(&aspect.name);
                    continue;
                };
                let reference = index_of
                    .get(top.id.as_str())
                    .map(|n| format!(" [#{}]", n))
                    .unwrap_or_default();
                parts.push(format!(
                    "{}: {}{}",
                    aspect.name,
                    truncate_chars(&top.text, 300),
                    reference
                ));
            }
            if !not_covered.is_empty() {
                parts.push(format!("Not fully covered: {}.", not_covered.join("; ")));
            }
        }
        None => {
            // No aspects were extracted; fall back to the per-hop summaries.
            for hop in hops {
                if !hop.passages.is_empty() {
                    parts.push(format!("{}. {}", hop.hop, hop.summary));
                }
            }
        }
    }

    parts.join("\n\n")
}
