//! The multi-hop research loop: decompose a question into aspects, hop
//! through {plan sub-query -> retrieve -> update coverage -> decide} until
//! the core aspects are covered or the budget runs out, then synthesize a
//! cited answer.

pub mod aspect;
pub mod complexity;
pub mod coverage;
pub mod prompts;
pub mod stopping;
pub mod subquery;
pub mod synthesis;

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ResearchError, Result};
use crate::llm::LlmClient;
use crate::retriever::{Passage, Retriever};

use aspect::Aspect;
use coverage::{AspectCoverage, AspectSnapshot};
use stopping::{Budgets, StopReason};
use subquery::{PlannedQuery, QueryOrigin};

/// Questions longer than this are rejected.
pub const MAX_QUESTION_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Each hop targets the most important currently-uncovered aspect.
    AspectGuided,
    /// All sub-queries generated up front from the complexity estimate.
    Batch,
}

/// Per-run configuration. No process-wide state exists; everything the
/// loop needs arrives here.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Passages requested from the retriever per sub-query.
    pub per_sub_k: usize,
    pub min_hops: u32,
    pub max_hops: u32,
    /// Coverage score at which an aspect counts as covered.
    pub cover_threshold: f64,
    /// Average passage score at which the no-aspect fallback stops.
    pub quality_threshold: f64,
    /// Aspect-guided mode when true, batch mode when false.
    pub adaptive: bool,
    /// Sub-queries planned per LLM call; >1 targets distinct aspects and
    /// still retrieves sequentially, one hop each.
    pub subqueries_per_hop: usize,
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<tokio::time::Instant>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            per_sub_k: 3,
            min_hops: 3,
            max_hops: 10,
            cover_threshold: 0.5,
            quality_threshold: 0.5,
            adaptive: true,
            subqueries_per_hop: 1,
            cancel: None,
            deadline: None,
        }
    }
}

/// One hop's output.
#[derive(Debug, Clone, Serialize)]
pub struct HopRecord {
    /// 1-based.
    pub hop: u32,
    pub sub_query: String,
    /// Display name of the aspect this hop was planned for; `None` only for
    /// the degenerate no-aspect case and batch mode.
    pub target_aspect: Option<String>,
    pub origin: QueryOrigin,
    /// Ordered by score descending.
    pub passages: Vec<Passage>,
    /// Extractive summary of the passages, for synthesis and hosts.
    pub summary: String,
    /// Aspect score changes this hop caused (display name -> delta).
    pub coverage_delta: BTreeMap<String, f64>,
    /// Retriever failure for this hop, if any. The hop still counts.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetadata {
    pub mode: Mode,
    pub complexity_score: f64,
    pub complexity_reasoning: String,
    pub estimated_hops: u32,
    pub actual_hops: u32,
    pub early_stop: bool,
    pub stop_reason: StopReason,
    pub weighted_coverage: f64,
    pub coverage_percentage: f64,
    pub extractor_fallback: bool,
    pub synth_fallback: bool,
    pub retrieval_errors: u32,
    pub cancelled: bool,
    /// Hops whose sub-query came from the LLM rather than a template.
    pub llm_subqueries: u32,
    pub elapsed_ms: u64,
}

/// Final output of one research run. Nothing here is persisted by the
/// engine; that is the host's business.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchResult {
    pub question: String,
    pub answer: String,
    pub citations: Vec<synthesis::Citation>,
    pub hops: Vec<HopRecord>,
    pub coverage: Vec<AspectSnapshot>,
    pub metadata: RunMetadata,
}

/// Drives research runs. Stateless between runs; the retriever and LLM are
/// shared, everything else lives on the stack of `run`.
pub struct ResearchEngine {
    retriever: Arc<dyn Retriever>,
    llm: Option<Arc<dyn LlmClient>>,
}

impl ResearchEngine {
    pub fn new(retriever: Arc<dyn Retriever>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            retriever,
            llm: Some(llm),
        }
    }

    /// Heuristics-only engine: template sub-queries, deterministic synthesis.
    pub fn without_llm(retriever: Arc<dyn Retriever>) -> Self {
        Self {
            retriever,
            llm: None,
        }
    }

    /// Run one research question to completion. Always returns a result
    /// unless the input itself is invalid; dependency failures degrade the
    /// run and are flagged in metadata.
    pub async fn run(&self, question: &str, options: &RunOptions) -> Result<ResearchResult> {
        let question = validate_question(question)?;
        validate_options(options)?;

        let started = Instant::now();
        let complexity = complexity::analyze(&question, options.min_hops, options.max_hops);
        info!(
            complexity = complexity.score,
            estimated_hops = complexity.estimated_hops,
            adaptive = options.adaptive,
            "starting research run"
        );

        if options.adaptive {
            self.run_aspect_guided(&question, options, &complexity, started)
                .await
        } else {
            self.run_batch(&question, options, &complexity, started).await
        }
    }

    async fn run_aspect_guided(
        &self,
        question: &str,
        options: &RunOptions,
        complexity: &complexity::Complexity,
        started: Instant,
    ) -> Result<ResearchResult> {
        let llm = self.llm.as_deref();

        let extraction = aspect::extract(question, llm).await;
        let cov = AspectCoverage::new(extraction.aspects, options.cover_threshold);
        info!(
            aspects = cov.aspects().len(),
            fallback = extraction.fallback,
            "aspects extracted"
        );
        for a in cov.aspects() {
            debug!(
                aspect = %a.name,
                kind = ?a.kind,
                importance = a.importance,
                "aspect"
            );
        }

        let budgets = Budgets {
            min_hops: options.min_hops,
            max_hops: options.max_hops,
            quality_threshold: options.quality_threshold,
        };

        let mut state = LoopState::new(extraction.fallback);
        let mut cov = cov;
        let mut pending: VecDeque<PlannedQuery> = VecDeque::new();

        while (state.hops.len() as u32) < options.max_hops {
            let hop_no = state.hops.len() as u32 + 1;

            // Cancellation is honored between hops, never before hop 1:
            // even a token that fired before the run yields a one-hop
            // partial result.
            if !state.hops.is_empty() && interrupted(options) {
                state.cancel(hop_no - 1);
                break;
            }

            if pending.is_empty() {
                pending = self.plan(question, &cov, options, hop_no, llm).await;
            }
            let Some(planned) = pending.pop_front() else {
                if state.hops.is_empty() {
                    return Err(ResearchError::DependencyUnavailable {
                        reason: "no sub-query could be generated for the first hop".to_string(),
                    });
                }
                warn!(hop = hop_no, "planner produced nothing, stopping");
                break;
            };

            if let Some(name) = &planned.aspect {
                if !cov.contains(&aspect::canonical(name)) {
                    return Err(ResearchError::Invariant {
                        details: format!("planned aspect {:?} is not tracked by coverage", name),
                    });
                }
            }

            let record = self.execute_hop(hop_no, planned, options, &mut cov, &mut state).await;
            let decision = stopping::decide(
                hop_no,
                &record.passages,
                (!cov.is_empty()).then_some(&cov),
                &budgets,
            );
            info!(
                hop = hop_no,
                aspect = record.target_aspect.as_deref().unwrap_or("-"),
                passages = record.passages.len(),
                weighted = cov.weighted(),
                stop = decision.stop,
                reason = %decision.reason,
                "hop complete"
            );
            state.hops.push(record);

            if decision.stop {
                state.stop_reason = decision.reason;
                break;
            }
        }

        self.finish(question, options, complexity, started, Mode::AspectGuided, cov, state)
            .await
    }

    async fn run_batch(
        &self,
        question: &str,
        options: &RunOptions,
        complexity: &complexity::Complexity,
        started: Instant,
    ) -> Result<ResearchResult> {
        let llm = self.llm.as_deref();

        // Aspects are still extracted so coverage bookkeeping and the
        // synthesizer behave identically in both modes.
        let extraction = aspect::extract(question, llm).await;
        let mut cov = AspectCoverage::new(extraction.aspects, options.cover_threshold);

        let planned = subquery::plan_batch(question, complexity.estimated_hops as usize, llm).await;
        info!(subqueries = planned.len(), "batch plan ready");

        let mut state = LoopState::new(extraction.fallback);
        state.stop_reason = StopReason::BatchComplete;

        for planned in planned.into_iter().take(options.max_hops as usize) {
            let hop_no = state.hops.len() as u32 + 1;
            // Same rule as the adaptive loop: hop 1 always runs.
            if !state.hops.is_empty() && interrupted(options) {
                state.cancel(hop_no - 1);
                break;
            }
            let record = self.execute_hop(hop_no, planned, options, &mut cov, &mut state).await;
            state.hops.push(record);
        }

        self.finish(question, options, complexity, started, Mode::Batch, cov, state)
            .await
    }

    /// Pick the next sub-queries from current coverage. Always returns at
    /// least one query when any planning input exists.
    async fn plan(
        &self,
        question: &str,
        cov: &AspectCoverage,
        options: &RunOptions,
        hop_no: u32,
        llm: Option<&dyn LlmClient>,
    ) -> VecDeque<PlannedQuery> {
        if cov.is_empty() {
            // Degenerate case: no aspects. First hop is the question itself;
            // later hops cycle deterministic variations (or ask the LLM).
            let planned = if hop_no == 1 {
                PlannedQuery {
                    text: subquery::normalize_query(question),
                    aspect: None,
                    origin: QueryOrigin::Template,
                }
            } else {
                self.generic_query(question, hop_no, llm).await
            };
            return VecDeque::from([planned]);
        }

        let uncovered = cov.uncovered(options.cover_threshold);
        let targets: Vec<&Aspect> = if uncovered.is_empty() {
            // Everything is covered but the budget demands another hop:
            // re-query the weakest aspect.
            weakest_aspect(cov).into_iter().collect()
        } else {
            uncovered
        };
        debug!(hop = hop_no, candidates = targets.len(), "planning sub-queries");

        subquery::plan_for_aspects(question, &targets, llm, options.subqueries_per_hop)
            .await
            .into()
    }

    async fn generic_query(
        &self,
        question: &str,
        hop_no: u32,
        llm: Option<&dyn LlmClient>,
    ) -> PlannedQuery {
        if llm.is_some() {
            if let Some(planned) = subquery::plan_batch(question, 1, llm).await.pop() {
                if planned.origin == QueryOrigin::Llm {
                    return planned;
                }
            }
        }
        let variations = subquery::fallback_variations(question, 8);
        let text = variations[(hop_no as usize - 1) % variations.len()].clone();
        PlannedQuery {
            text,
            aspect: None,
            origin: QueryOrigin::Template,
        }
    }

    /// One retrieval plus coverage update. Retriever failures become a
    /// zero-passage hop; the hop counter still advances.
    async fn execute_hop(
        &self,
        hop_no: u32,
        planned: PlannedQuery,
        options: &RunOptions,
        cov: &mut AspectCoverage,
        state: &mut LoopState,
    ) -> HopRecord {
        if planned.origin == QueryOrigin::Llm {
            state.llm_subqueries += 1;
        }
        debug!(hop = hop_no, sub_query = %planned.text, "retrieving");

        let (mut passages, error) = match self
            .retriever
            .retrieve(&planned.text, options.per_sub_k)
            .await
        {
            Ok(passages) => (passages, None),
            Err(e) => {
                warn!(hop = hop_no, error = %e, "retrieval failed, recording empty hop");
                state.retrieval_errors += 1;
                (Vec::new(), Some(e.to_string()))
            }
        };
        passages.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let summary = synthesis::summarize_passages(&passages, &planned.text);
        let coverage_delta = cov.update(&passages, hop_no);

        HopRecord {
            hop: hop_no,
            sub_query: planned.text,
            target_aspect: planned.aspect,
            origin: planned.origin,
            passages,
            summary,
            coverage_delta,
            error,
        }
    }

    async fn finish(
        &self,
        question: &str,
        options: &RunOptions,
        complexity: &complexity::Complexity,
        started: Instant,
        mode: Mode,
        cov: AspectCoverage,
        state: LoopState,
    ) -> Result<ResearchResult> {
        let citations = synthesis::build_citations(&state.hops);
        let cov_ref = (!cov.is_empty()).then_some(&cov);

        // After cancellation no further LLM calls are made; synthesis runs
        // deterministically on whatever the hops gathered.
        let llm = if state.cancelled {
            None
        } else {
            self.llm.as_deref()
        };
        let (answer, synth_fallback) =
            synthesis::synthesize(question, &state.hops, cov_ref, &citations, llm).await;

        let actual_hops = state.hops.len() as u32;
        let metadata = RunMetadata {
            mode,
            complexity_score: complexity.score,
            complexity_reasoning: complexity.reasoning.to_string(),
            estimated_hops: complexity.estimated_hops,
            actual_hops,
            early_stop: actual_hops < options.max_hops,
            stop_reason: state.stop_reason,
            weighted_coverage: cov.weighted(),
            coverage_percentage: cov.percentage(),
            extractor_fallback: state.extractor_fallback,
            synth_fallback: synth_fallback && !state.cancelled,
            retrieval_errors: state.retrieval_errors,
            cancelled: state.cancelled,
            llm_subqueries: state.llm_subqueries,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            actual_hops,
            citations = citations.len(),
            weighted = metadata.weighted_coverage,
            reason = %metadata.stop_reason,
            "research run finished"
        );

        Ok(ResearchResult {
            question: question.to_string(),
            answer,
            citations,
            hops: state.hops,
            coverage: cov.snapshot(),
            metadata,
        })
    }
}

/// Mutable loop bookkeeping, separate from coverage.
struct LoopState {
    hops: Vec<HopRecord>,
    retrieval_errors: u32,
    llm_subqueries: u32,
    cancelled: bool,
    extractor_fallback: bool,
    stop_reason: StopReason,
}

impl LoopState {
    fn new(extractor_fallback: bool) -> Self {
        Self {
            hops: Vec::new(),
            retrieval_errors: 0,
            llm_subqueries: 0,
            cancelled: false,
            extractor_fallback,
            stop_reason: StopReason::MaxHops,
        }
    }

    fn cancel(&mut self, hop_no: u32) {
        info!(hop = hop_no, "run cancelled, returning partial result");
        self.cancelled = true;
        self.stop_reason = StopReason::Cancelled;
    }
}

fn interrupted(options: &RunOptions) -> bool {
    if options
        .cancel
        .as_ref()
        .map(|c| c.is_cancelled())
        .unwrap_or(false)
    {
        return true;
    }
    options
        .deadline
        .map(|d| tokio::time::Instant::now() >= d)
        .unwrap_or(false)
}

/// Lowest-scoring aspect; ties keep aspect order.
fn weakest_aspect(cov: &AspectCoverage) -> Option<&Aspect> {
    cov.aspects().iter().min_by(|a, b| {
        cov.score_of(&a.canonical())
            .partial_cmp(&cov.score_of(&b.canonical()))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn validate_question(question: &str) -> Result<String> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(ResearchError::InvalidQuestion {
            reason: "question is empty".to_string(),
        });
    }
    if trimmed.chars().count() > MAX_QUESTION_CHARS {
        return Err(ResearchError::InvalidQuestion {
            reason: format!(
                "question is {} chars, limit is {}",
                trimmed.chars().count(),
                MAX_QUESTION_CHARS
            ),
        });
    }
    Ok(trimmed.to_string())
}

fn validate_options(options: &RunOptions) -> Result<()> {
    if options.per_sub_k == 0 {
        return Err(ResearchError::InvalidOptions {
            reason: "per_sub_k must be at least 1".to_string(),
        });
    }
    if options.min_hops == 0 {
        return Err(ResearchError::InvalidOptions {
            reason: "min_hops must be at least 1".to_string(),
        });
    }
    if options.min_hops > options.max_hops {
        return Err(ResearchError::InvalidOptions {
            reason: format!(
                "min_hops {} exceeds max_hops {}",
                options.min_hops, options.max_hops
            ),
        });
    }
    if options.subqueries_per_hop == 0 {
        return Err(ResearchError::InvalidOptions {
            reason: "subqueries_per_hop must be at least 1".to_string(),
        });
    }
    for (name, value) in [
        ("cover_threshold", options.cover_threshold),
        ("quality_threshold", options.quality_threshold),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(ResearchError::InvalidOptions {
                reason: format!("{} must be within [0, 1], got {}", name, value),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Opt-in log output for debugging a failing scenario:
    /// `RUST_LOG=magellan=debug cargo test -- --nocapture`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    /// Returns the passages of the first rule whose needle appears in the
    /// query (case-insensitive); records every query it sees.
    struct ScriptedRetriever {
        rules: Vec<(&'static str, Vec<Passage>)>,
        calls: Mutex<Vec<String>>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl ScriptedRetriever {
        fn new(rules: Vec<(&'static str, Vec<Passage>)>) -> Self {
            Self {
                rules,
                calls: Mutex::new(Vec::new()),
                cancel_after: None,
            }
        }

        fn cancelling_after(mut self, calls: usize, token: CancellationToken) -> Self {
            self.cancel_after = Some((calls, token));
            self
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Retriever for ScriptedRetriever {
        async fn retrieve(&self, query: &str, _top_k: usize) -> anyhow::Result<Vec<Passage>> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(query.to_string());
            if let Some((n, token)) = &self.cancel_after {
                if calls.len() >= *n {
                    token.cancel();
                }
            }
            let q = query.to_lowercase();
            for (needle, passages) in &self.rules {
                if q.contains(needle) {
                    return Ok(passages.clone());
                }
            }
            Ok(Vec::new())
        }
    }

    struct FailingRetriever;

    #[async_trait]
    impl Retriever for FailingRetriever {
        async fn retrieve(&self, _query: &str, _top_k: usize) -> anyhow::Result<Vec<Passage>> {
            Err(anyhow::anyhow!("vector index offline"))
        }
    }

    struct FailingLlm;

    #[async_trait]
    impl LlmClient for FailingLlm {
        async fn generate(
            &self,
            _system_prompt: &str,
            _user_prompt: &str,
            _options: &crate::llm::GenerateOptions,
        ) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("model endpoint unreachable"))
        }
    }

    fn python_passages() -> Vec<Passage> {
        vec![
            Passage::new("p1", "Python is a high-level programming language.", 0.9)
                .with_title("Python overview"),
            Passage::new("p2", "Python emphasizes readability and batteries included.", 0.6),
            Passage::new("p3", "Python has a large package ecosystem.", 0.4),
        ]
    }

    fn attention_rules() -> Vec<(&'static str, Vec<Passage>)> {
        vec![
            (
                "difference",
                vec![Passage::new(
                    "c1",
                    "The key difference: self-attention is a single mechanism while \
                     multi-head attention runs several in parallel for comparison.",
                    0.9,
                )],
            ),
            (
                "multi-head",
                vec![Passage::new(
                    "m1",
                    "Multi-head attention runs several attention heads in parallel.",
                    0.45,
                )],
            ),
            (
                "self-attention",
                vec![Passage::new(
                    "s1",
                    "Self-attention lets each position attend to every other position in the sequence.",
                    0.6,
                )],
            ),
        ]
    }

    fn options(min_hops: u32, max_hops: u32) -> RunOptions {
        RunOptions {
            min_hops,
            max_hops,
            ..Default::default()
        }
    }

    // A simple definition question is covered in one hop.
    #[tokio::test]
    async fn test_simple_definition_single_hop() {
        init_tracing();
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let result = engine
            .run("What is Python?", &options(1, 10))
            .await
            .unwrap();

        assert_eq!(result.metadata.actual_hops, 1);
        assert_eq!(result.metadata.stop_reason, StopReason::CoreAspectsCovered);
        assert!(result.metadata.early_stop);
        assert_eq!(result.citations.len(), 3);
        assert_eq!(result.metadata.coverage_percentage, 1.0);
        assert_eq!(result.coverage[0].covered_at_hop, Some(1));
        assert_eq!(retriever.call_count(), 1);
    }

    // A comparison question takes three hops, one per aspect, in importance order.
    #[tokio::test]
    async fn test_comparison_three_hops_distinct_aspects() {
        let retriever = Arc::new(ScriptedRetriever::new(attention_rules()));
        let engine = ResearchEngine::without_llm(retriever);

        let result = engine
            .run("Compare self-attention vs multi-head attention", &options(3, 10))
            .await
            .unwrap();

        assert_eq!(result.metadata.actual_hops, 3);
        assert_eq!(result.metadata.stop_reason, StopReason::CoreAspectsCovered);
        assert!(result.metadata.early_stop);
        assert!(result.metadata.weighted_coverage >= 0.7);

        let targets: Vec<&str> = result
            .hops
            .iter()
            .map(|h| h.target_aspect.as_deref().unwrap())
            .collect();
        assert_eq!(targets.len(), 3);
        let mut distinct = targets.clone();
        distinct.sort();
        distinct.dedup();
        assert_eq!(distinct.len(), 3);
        assert!(targets[0].starts_with("Definition of"));
    }

    // An uncoverable aspect is retried until max_hops, then reported.
    #[tokio::test]
    async fn test_uncoverable_aspect_retried_until_max_hops() {
        let rules = vec![
            ("multi-head", Vec::new()),
            (
                "self-attention",
                vec![Passage::new(
                    "s1",
                    "Self-attention lets each position attend to every other position.",
                    0.6,
                )],
            ),
        ];
        let retriever = Arc::new(ScriptedRetriever::new(rules));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let result = engine
            .run("Compare self-attention vs multi-head attention", &options(1, 4))
            .await
            .unwrap();

        assert_eq!(result.metadata.actual_hops, 4);
        assert_eq!(result.metadata.stop_reason, StopReason::MaxHops);
        assert!(!result.metadata.early_stop);
        assert_eq!(retriever.call_count(), 4);

        // Hops 2..4 keep retrying the same highest-importance uncovered aspect.
        let retried: Vec<&str> = result.hops[1..]
            .iter()
            .map(|h| h.target_aspect.as_deref().unwrap())
            .collect();
        assert!(retried.iter().all(|t| *t == retried[0]));
        assert!(retried[0].contains("multi-head"));

        let uncovered: Vec<&AspectSnapshot> = result
            .coverage
            .iter()
            .filter(|s| s.covered_at_hop.is_none())
            .collect();
        assert!(!uncovered.is_empty());
        assert!(result.answer.contains("Not fully covered"));
    }

    // min_hops = max_hops forces the full budget even when covered early.
    #[tokio::test]
    async fn test_budget_override_runs_exactly_five_hops() {
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let result = engine
            .run("What is Python?", &options(5, 5))
            .await
            .unwrap();

        assert_eq!(result.metadata.actual_hops, 5);
        assert_eq!(retriever.call_count(), 5);
        assert_eq!(result.metadata.stop_reason, StopReason::MaxHops);
        assert!(!result.metadata.early_stop);
        // Covered on hop 1, yet the loop kept going.
        assert_eq!(result.coverage[0].covered_at_hop, Some(1));
    }

    // Cancellation mid-run returns a partial result.
    #[tokio::test]
    async fn test_cancellation_after_two_hops() {
        let token = CancellationToken::new();
        let retriever = Arc::new(
            ScriptedRetriever::new(Vec::new()).cancelling_after(2, token.clone()),
        );
        let engine = ResearchEngine::without_llm(retriever);

        let mut opts = options(3, 7);
        opts.cancel = Some(token);
        let result = engine
            .run("Compare self-attention vs multi-head attention", &opts)
            .await
            .unwrap();

        assert_eq!(result.metadata.actual_hops, 2);
        assert!(result.metadata.cancelled);
        assert_eq!(result.metadata.stop_reason, StopReason::Cancelled);
        assert!(result.metadata.early_stop);
        assert!(!result.answer.is_empty());
    }

    // LLM outage: every call fails, heuristics carry the whole run.
    #[tokio::test]
    async fn test_llm_outage_degrades_gracefully() {
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::new(retriever, Arc::new(FailingLlm));

        let result = engine
            .run("What is Python?", &options(1, 10))
            .await
            .unwrap();

        assert!(result.metadata.extractor_fallback);
        assert!(result.metadata.synth_fallback);
        assert_eq!(result.metadata.llm_subqueries, 0);
        assert_eq!(result.metadata.stop_reason, StopReason::CoreAspectsCovered);
        assert!(!result.answer.is_empty());
    }

    #[tokio::test]
    async fn test_min_max_one_runs_exactly_one_hop() {
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let result = engine.run("What is Python?", &options(1, 1)).await.unwrap();
        assert_eq!(result.metadata.actual_hops, 1);
        assert_eq!(result.metadata.stop_reason, StopReason::MaxHops);
        assert_eq!(retriever.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_retriever_terminates_with_no_evidence_answer() {
        let retriever = Arc::new(ScriptedRetriever::new(Vec::new()));
        let engine = ResearchEngine::without_llm(retriever);

        let result = engine.run("What is Python?", &options(2, 4)).await.unwrap();
        assert_eq!(result.metadata.actual_hops, 4);
        assert_eq!(result.metadata.stop_reason, StopReason::MaxHops);
        assert!(result.citations.is_empty());
        assert!(result.answer.contains("No supporting passages"));
    }

    #[tokio::test]
    async fn test_retriever_errors_become_empty_hops() {
        let engine = ResearchEngine::without_llm(Arc::new(FailingRetriever));

        let result = engine.run("What is Python?", &options(1, 2)).await.unwrap();
        assert_eq!(result.metadata.actual_hops, 2);
        assert_eq!(result.metadata.retrieval_errors, 2);
        assert!(result.hops.iter().all(|h| h.error.is_some()));
        assert!(result.hops.iter().all(|h| h.passages.is_empty()));
        assert!(!result.answer.is_empty());
    }

    #[tokio::test]
    async fn test_no_aspects_uses_main_question_and_quality_stop() {
        // All content words are stop words, so extraction yields nothing.
        let retriever = Arc::new(ScriptedRetriever::new(vec![(
            "why",
            vec![Passage::new("w1", "Because reasons, thoroughly explained.", 0.8)],
        )]));
        let engine = ResearchEngine::without_llm(retriever);

        let result = engine.run("Why?", &options(1, 5)).await.unwrap();
        assert!(result.coverage.is_empty());
        assert_eq!(result.metadata.actual_hops, 1);
        assert_eq!(result.hops[0].sub_query, "Why?");
        assert_eq!(result.hops[0].target_aspect, None);
        assert_eq!(result.metadata.stop_reason, StopReason::SufficientQuality);
    }

    #[tokio::test]
    async fn test_batch_mode_runs_planned_queries() {
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let mut opts = options(3, 10);
        opts.adaptive = false;
        let result = engine.run("What is Python?", &opts).await.unwrap();

        assert_eq!(result.metadata.mode, Mode::Batch);
        assert_eq!(result.metadata.actual_hops, 3);
        assert_eq!(result.metadata.stop_reason, StopReason::BatchComplete);
        assert!(result.hops.iter().all(|h| h.target_aspect.is_none()));
        // Same three passages every hop; citations must still dedup.
        assert_eq!(result.citations.len(), 3);
    }

    #[tokio::test]
    async fn test_subqueries_per_hop_batch_targets_distinct_aspects() {
        let retriever = Arc::new(ScriptedRetriever::new(attention_rules()));
        let engine = ResearchEngine::without_llm(retriever);

        let mut opts = options(1, 10);
        opts.subqueries_per_hop = 2;
        let result = engine
            .run("Compare self-attention vs multi-head attention", &opts)
            .await
            .unwrap();

        assert!(result.metadata.actual_hops >= 2);
        assert_ne!(result.hops[0].target_aspect, result.hops[1].target_aspect);
    }

    #[tokio::test]
    async fn test_deterministic_across_runs() {
        let retriever = Arc::new(ScriptedRetriever::new(attention_rules()));
        let engine = ResearchEngine::without_llm(retriever);
        let opts = options(3, 10);
        let question = "Compare self-attention vs multi-head attention";

        let first = engine.run(question, &opts).await.unwrap();
        let second = engine.run(question, &opts).await.unwrap();

        assert_eq!(first.answer, second.answer);
        assert_eq!(
            serde_json::to_value(&first.hops).unwrap(),
            serde_json::to_value(&second.hops).unwrap()
        );
        assert_eq!(
            serde_json::to_value(&first.citations).unwrap(),
            serde_json::to_value(&second.citations).unwrap()
        );
    }

    #[tokio::test]
    async fn test_coverage_scores_stay_in_unit_interval() {
        let retriever = Arc::new(ScriptedRetriever::new(attention_rules()));
        let engine = ResearchEngine::without_llm(retriever);

        let result = engine
            .run("Compare self-attention vs multi-head attention", &options(3, 10))
            .await
            .unwrap();

        assert!(result.metadata.weighted_coverage >= 0.0);
        assert!(result.metadata.weighted_coverage <= 1.0);
        for snap in &result.coverage {
            assert!(snap.score >= 0.0 && snap.score <= 1.0);
        }
    }

    #[tokio::test]
    async fn test_template_subqueries_contain_target_keywords() {
        let retriever = Arc::new(ScriptedRetriever::new(attention_rules()));
        let engine = ResearchEngine::without_llm(retriever);

        let result = engine
            .run("Compare self-attention vs multi-head attention", &options(3, 10))
            .await
            .unwrap();

        for hop in &result.hops {
            let Some(target) = &hop.target_aspect else { continue };
            let aspect = result
                .coverage
                .iter()
                .find(|s| s.name == *target)
                .expect("target aspect must be tracked");
            // Template-origin queries must carry at least one aspect keyword;
            // the snapshot has no keywords, so re-derive them from the name.
            let query = hop.sub_query.to_lowercase();
            let name_terms = aspect::keywords_from(&aspect.name);
            assert!(
                name_terms.iter().any(|k| query.contains(k)),
                "hop {} query {:?} has no keyword of {:?}",
                hop.hop,
                hop.sub_query,
                aspect.name
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_question_rejected() {
        let engine = ResearchEngine::without_llm(Arc::new(ScriptedRetriever::new(Vec::new())));

        let err = engine.run("   ", &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidQuestion { .. }));

        let long = "x".repeat(MAX_QUESTION_CHARS + 1);
        let err = engine.run(&long, &RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidQuestion { .. }));
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let engine = ResearchEngine::without_llm(Arc::new(ScriptedRetriever::new(Vec::new())));

        let mut opts = RunOptions::default();
        opts.min_hops = 8;
        opts.max_hops = 2;
        let err = engine.run("What is Python?", &opts).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidOptions { .. }));

        let mut opts = RunOptions::default();
        opts.per_sub_k = 0;
        let err = engine.run("What is Python?", &opts).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidOptions { .. }));

        let mut opts = RunOptions::default();
        opts.cover_threshold = 1.5;
        let err = engine.run("What is Python?", &opts).await.unwrap_err();
        assert!(matches!(err, ResearchError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_deadline_behaves_like_cancellation() {
        let retriever = Arc::new(ScriptedRetriever::new(vec![("python", python_passages())]));
        let engine = ResearchEngine::without_llm(retriever.clone());

        let mut opts = options(3, 10);
        opts.deadline = Some(tokio::time::Instant::now() - std::time::Duration::from_secs(1));
        let result = engine.run("What is Python?", &opts).await.unwrap();

        assert!(result.metadata.cancelled);
        // An already-expired deadline still gets hop 1 before the loop
        // gives up.
        assert!(result.metadata.actual_hops >= 1);
        assert_eq!(retriever.call_count(), result.metadata.actual_hops as usize);
        assert_eq!(result.metadata.stop_reason, StopReason::Cancelled);
        assert!(!result.answer.is_empty());
    }
}
