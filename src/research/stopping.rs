//! Stopping oracle: pure decision ladder evaluated after every hop.

use serde::Serialize;

use crate::research::coverage::AspectCoverage;
use crate::retriever::Passage;

/// Weighted coverage required (together with all core aspects covered) to
/// stop before the hop budget runs out.
pub const WEIGHTED_STOP_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxHops,
    BelowMinHops,
    CoreAspectsCovered,
    CoreAspectsUncovered,
    SufficientQuality,
    GatheringMore,
    BatchComplete,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MaxHops => "max_hops",
            Self::BelowMinHops => "below_min_hops",
            Self::CoreAspectsCovered => "core_aspects_covered",
            Self::CoreAspectsUncovered => "core_aspects_uncovered",
            Self::SufficientQuality => "sufficient_quality",
            Self::GatheringMore => "gathering_more",
            Self::BatchComplete => "batch_complete",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub stop: bool,
    pub reason: StopReason,
}

impl Decision {
    fn stop(reason: StopReason) -> Self {
        Self { stop: true, reason }
    }
    fn go(reason: StopReason) -> Self {
        Self { stop: false, reason }
    }
}

/// Hop budgets and quality thresholds for one run.
#[derive(Debug, Clone, Copy)]
pub struct Budgets {
    pub min_hops: u32,
    pub max_hops: u32,
    pub quality_threshold: f64,
}

/// Decide whether to keep hopping. First matching rule fires; coverage is
/// never mutated here.
///
/// Ladder:
/// 1. hop budget exhausted -> stop
/// 2. below minimum hops -> continue
/// 3. all core aspects covered and weighted coverage high enough -> stop
/// 4. core aspects still uncovered -> continue
/// 5. (no aspects) last hop's average passage quality sufficient -> stop
/// 6. otherwise -> continue
pub fn decide(
    hop: u32,
    last_passages: &[Passage],
    coverage: Option<&AspectCoverage>,
    budgets: &Budgets,
) -> Decision {
    if hop >= budgets.max_hops {
        return Decision::stop(StopReason::MaxHops);
    }
    if hop < budgets.min_hops {
        return Decision::go(StopReason::BelowMinHops);
    }

    if let Some(cov) = coverage.filter(|c| !c.is_empty()) {
        if cov.uncovered_core().is_empty() && cov.weighted() >= WEIGHTED_STOP_THRESHOLD {
            return Decision::stop(StopReason::CoreAspectsCovered);
        }
        if !cov.uncovered_core().is_empty() {
            return Decision::go(StopReason::CoreAspectsUncovered);
        }
    } else if !last_passages.is_empty() {
        let avg: f64 =
            last_passages.iter().map(|p| p.score).sum::<f64>() / last_passages.len() as f64;
        if avg >= budgets.quality_threshold {
            return Decision::stop(StopReason::SufficientQuality);
        }
    }

    Decision::go(StopReason::GatheringMore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::research::aspect::{Aspect, AspectType};
    use crate::retriever::Passage;

    fn budgets(min: u32, max: u32) -> Budgets {
        Budgets {
            min_hops: min,
            max_hops: max,
            quality_threshold: 0.5,
        }
    }

    fn coverage_with(scores: &[(&str, f64, f64)]) -> AspectCoverage {
        // (name, importance, score); score applied via a synthetic passage.
        let aspects: Vec<Aspect> = scores
            .iter()
            .map(|(name, importance, _)| {
                Aspect::new(*name, AspectType::Definition, *importance, vec![name.to_string()])
            })
            .collect();
        let mut cov = AspectCoverage::new(aspects, 0.5);
        for (hop, (name, _, score)) in scores.iter().enumerate() {
            if *score > 0.0 {
                // doc_score = 0.5*1.0 + 0.5*p  =>  p = 2*score - 1
                let p = (2.0 * score - 1.0).clamp(0.0, 1.0);
                cov.update(
                    &[Passage::new(format!("p{}", hop), name.to_string(), p)],
                    hop as u32 + 1,
                );
            }
        }
        cov
    }

    #[test]
    fn test_max_hops_beats_everything() {
        let cov = coverage_with(&[("a", 1.0, 0.0)]);
        let d = decide(10, &[], Some(&cov), &budgets(3, 10));
        assert!(d.stop);
        assert_eq!(d.reason, StopReason::MaxHops);
    }

    #[test]
    fn test_below_min_hops_continues_even_when_covered() {
        let cov = coverage_with(&[("a", 1.0, 1.0)]);
        let d = decide(1, &[], Some(&cov), &budgets(3, 10));
        assert!(!d.stop);
        assert_eq!(d.reason, StopReason::BelowMinHops);
    }

    #[test]
    fn test_core_covered_stops() {
        let cov = coverage_with(&[("a", 1.0, 0.9), ("b", 0.6, 0.6)]);
        let d = decide(3, &[], Some(&cov), &budgets(3, 10));
        assert!(d.stop);
        assert_eq!(d.reason, StopReason::CoreAspectsCovered);
    }

    #[test]
    fn test_core_uncovered_continues() {
        let cov = coverage_with(&[("a", 1.0, 0.0), ("b", 0.6, 0.9)]);
        let d = decide(3, &[], Some(&cov), &budgets(3, 10));
        assert!(!d.stop);
        assert_eq!(d.reason, StopReason::CoreAspectsUncovered);
    }

    #[test]
    fn test_core_covered_but_weighted_low_continues() {
        // Core barely covered, optional at zero: weighted drags below 0.7.
        let cov = coverage_with(&[("a", 1.0, 0.55), ("b", 1.0, 0.55), ("c", 0.9, 0.0)]);
        // c is core and uncovered, so rule 4 fires.
        let d = decide(3, &[], Some(&cov), &budgets(3, 10));
        assert!(!d.stop);
    }

    #[test]
    fn test_quality_fallback_without_aspects() {
        let passages = vec![
            Passage::new("1", "x", 0.8),
            Passage::new("2", "y", 0.6),
        ];
        let d = decide(3, &passages, None, &budgets(3, 10));
        assert!(d.stop);
        assert_eq!(d.reason, StopReason::SufficientQuality);
    }

    #[test]
    fn test_quality_fallback_below_threshold_continues() {
        let passages = vec![Passage::new("1", "x", 0.2)];
        let d = decide(3, &passages, None, &budgets(3, 10));
        assert!(!d.stop);
        assert_eq!(d.reason, StopReason::GatheringMore);
    }

    #[test]
    fn test_no_passages_no_aspects_continues() {
        let d = decide(3, &[], None, &budgets(3, 10));
        assert!(!d.stop);
        assert_eq!(d.reason, StopReason::GatheringMore);
    }

    #[test]
    fn test_min_equals_max_one_hop() {
        let d = decide(1, &[], None, &budgets(1, 1));
        assert!(d.stop);
        assert_eq!(d.reason, StopReason::MaxHops);
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(StopReason::MaxHops.to_string(), "max_hops");
        assert_eq!(
            StopReason::CoreAspectsCovered.to_string(),
            "core_aspects_covered"
        );
        assert_eq!(StopReason::Cancelled.to_string(), "cancelled");
    }
}
