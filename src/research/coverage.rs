//! Per-aspect coverage tracking. Scores are monotonic non-decreasing; an
//! aspect counts as covered once its score crosses the configured
//! threshold, and the hop that first crossed it is recorded permanently.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use tracing::debug;

use crate::research::aspect::Aspect;
use crate::retriever::Passage;

/// Read-only per-aspect view included in result metadata.
#[derive(Debug, Clone, Serialize)]
pub struct AspectSnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: crate::research::aspect::AspectType,
    pub importance: f64,
    pub score: f64,
    pub covered_at_hop: Option<u32>,
}

/// Mutable coverage state for one research run. Owned exclusively by the
/// loop; nothing outside mutates it.
#[derive(Debug, Clone)]
pub struct AspectCoverage {
    aspects: Vec<Aspect>,
    /// Canonical aspect name -> score in [0, 1].
    scores: HashMap<String, f64>,
    /// Canonical aspect name -> earliest hop that crossed the threshold.
    covered_at: HashMap<String, u32>,
    cover_threshold: f64,
}

impl AspectCoverage {
    pub fn new(aspects: Vec<Aspect>, cover_threshold: f64) -> Self {
        let scores = aspects.iter().map(|a| (a.canonical(), 0.0)).collect();
        Self {
            aspects,
            scores,
            covered_at: HashMap::new(),
            cover_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.aspects.is_empty()
    }

    pub fn aspects(&self) -> &[Aspect] {
        &self.aspects
    }

    pub fn contains(&self, canonical_name: &str) -> bool {
        self.scores.contains_key(canonical_name)
    }

    pub fn score_of(&self, canonical_name: &str) -> f64 {
        self.scores.get(canonical_name).copied().unwrap_or(0.0)
    }

    pub fn covered_at_hop(&self, canonical_name: &str) -> Option<u32> {
        self.covered_at.get(canonical_name).copied()
    }

    /// Fold one hop's passages into the coverage map. Returns the per-aspect
    /// score deltas (only aspects that moved), keyed by display name.
    ///
    /// Idempotent: applying the same passages twice is a no-op the second
    /// time, because scores only ever take the max of old and new.
    pub fn update(&mut self, passages: &[Passage], hop: u32) -> BTreeMap<String, f64> {
        let mut delta = BTreeMap::new();
        if passages.is_empty() {
            return delta;
        }

        for aspect in &self.aspects {
            let key = aspect.canonical();
            let previous = self.scores.get(&key).copied().unwrap_or(0.0);
            let from_hop = aspect_score_from_hop(aspect, passages);
            let new = previous.max(from_hop).clamp(0.0, 1.0);

            if new > previous {
                self.scores.insert(key.clone(), new);
                delta.insert(aspect.name.clone(), new - previous);
            }
            if new >= self.cover_threshold && !self.covered_at.contains_key(&key) {
                self.covered_at.insert(key, hop);
                debug!(aspect = %aspect.name, hop, score = new, "aspect covered");
            }
        }

        delta
    }

    /// Aspects below `threshold`, importance-descending (appearance order on
    /// ties; the aspect list is already sorted that way).
    pub fn uncovered(&self, threshold: f64) -> Vec<&Aspect> {
        self.aspects
            .iter()
            .filter(|a| self.score_of(&a.canonical()) < threshold)
            .collect()
    }

    /// Uncovered aspects with core importance, against the configured
    /// cover threshold.
    pub fn uncovered_core(&self) -> Vec<&Aspect> {
        self.aspects
            .iter()
            .filter(|a| a.is_core() && self.score_of(&a.canonical()) < self.cover_threshold)
            .collect()
    }

    /// Fraction of aspects at or above the cover threshold.
    pub fn percentage(&self) -> f64 {
        if self.aspects.is_empty() {
            return 0.0;
        }
        let covered = self
            .aspects
            .iter()
            .filter(|a| self.score_of(&a.canonical()) >= self.cover_threshold)
            .count();
        covered as f64 / self.aspects.len() as f64
    }

    /// Importance-weighted mean score: sum(importance * score) / sum(importance).
    pub fn weighted(&self) -> f64 {
        let total: f64 = self.aspects.iter().map(|a| a.importance).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let sum: f64 = self
            .aspects
            .iter()
            .map(|a| a.importance * self.score_of(&a.canonical()))
            .sum();
        sum / total
    }

    pub fn snapshot(&self) -> Vec<AspectSnapshot> {
        self.aspects
            .iter()
            .map(|a| AspectSnapshot {
                name: a.name.clone(),
                kind: a.kind,
                importance: a.importance,
                score: self.score_of(&a.canonical()),
                covered_at_hop: self.covered_at_hop(&a.canonical()),
            })
            .collect()
    }
}

/// Fraction of the aspect's keywords appearing (as substrings) in the
/// passage text or title, both lowercased.
pub fn keyword_hits(aspect: &Aspect, passage: &Passage) -> f64 {
    if aspect.keywords.is_empty() {
        return 0.0;
    }
    let text = passage.text.to_lowercase();
    let title = passage.title.to_lowercase();
    let hits = aspect
        .keywords
        .iter()
        .filter(|k| text.contains(k.as_str()) || title.contains(k.as_str()))
        .count();
    hits as f64 / aspect.keywords.len().max(1) as f64
}

/// Blend keyword overlap with the retriever's similarity score. Zero
/// keyword hits mean zero: a high-similarity passage that mentions none
/// of the aspect's terms must not count as coverage.
pub fn doc_score(aspect: &Aspect, passage: &Passage) -> f64 {
    let hits = keyword_hits(aspect, passage);
    if hits > 0.0 {
        0.5 * hits + 0.5 * passage.score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Best doc_score across a hop's passages.
pub fn aspect_score_from_hop(aspect: &Aspect, passages: &[Passage]) -> f64 {
    passages
        .iter()
        .map(|p| doc_score(aspect, p))
        .fold(0.0, f64::max)
}
