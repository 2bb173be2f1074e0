//! Context quality gate and the per-query state machine.
//!
//! The gate scores a resolved result set by the mean fused score of its
//! top `top_n` entries. Raw RRF scores are tiny and depend on `k_const`,
//! so they are divided by the best attainable score (rank 1 in both
//! lists) before averaging; the aggregate therefore lies in `[0, 1]` and
//! thresholds are portable across `k_const` settings.
//!
//! ```text
//! Received -> Retrieving -> Fusing -> QualityCheck -> Ready
//!                                          |
//!                                          v
//!                              FallbackRetrieving -> Fusing -> QualityCheck -> Ready
//! ```
//!
//! Fallback is entered at most once per query.

use serde::Serialize;

use crate::fusion::max_fused_score;
use crate::models::ResolvedChunk;

/// Decision of [`QualityGate::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityVerdict {
    pub accepted: bool,
    pub aggregate_score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    top_n: usize,
    score_ceiling: f64,
}

impl QualityGate {
    /// A gate over raw scores, scaled by `score_ceiling`.
    pub fn new(top_n: usize, score_ceiling: f64) -> Self {
        Self {
            top_n: top_n.max(1),
            score_ceiling,
        }
    }

    /// A gate for two-source RRF scores at `k_const`.
    pub fn for_rrf(top_n: usize, k_const: u32) -> Self {
        Self::new(top_n, max_fused_score(k_const, 2))
    }

    pub fn evaluate(&self, resolved: &[ResolvedChunk], threshold: f64) -> QualityVerdict {
        let aggregate_score = self.aggregate(resolved);
        QualityVerdict {
            accepted: !resolved.is_empty() && aggregate_score >= threshold,
            aggregate_score,
        }
    }

    /// Mean normalized score of the top `top_n` results; 0 when empty.
    pub fn aggregate(&self, resolved: &[ResolvedChunk]) -> f64 {
        let top = &resolved[..resolved.len().min(self.top_n)];
        if top.is_empty() || self.score_ceiling <= 0.0 {
            return 0.0;
        }
        let sum: f64 = top.iter().map(|r| r.fused_score / self.score_ceiling).sum();
        sum / top.len() as f64
    }
}

/// Lifecycle of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    Retrieving,
    Fusing,
    QualityCheck,
    FallbackRetrieving,
    Ready { low_confidence: bool },
}

impl QueryState {
    pub fn can_transition_to(&self, next: QueryState) -> bool {
        use QueryState::*;
        matches!(
            (self, next),
            (Received, Retrieving)
                | (Retrieving, Fusing)
                | (FallbackRetrieving, Fusing)
                | (Fusing, QualityCheck)
                | (QualityCheck, FallbackRetrieving)
                | (QualityCheck, Ready { .. })
        )
    }
}

/// Recorded path of a query through [`QueryState`].
#[derive(Debug, Clone, Serialize)]
pub struct QueryTrace {
    states: Vec<QueryState>,
}

impl Default for QueryTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryTrace {
    pub fn new() -> Self {
        Self {
            states: vec![QueryState::Received],
        }
    }

    pub fn current(&self) -> QueryState {
        *self.states.last().unwrap_or(&QueryState::Received)
    }

    /// Move to `next`. Illegal moves, including a second fallback, are
    /// rejected and leave the trace unchanged.
    pub fn advance(&mut self, next: QueryState) -> bool {
        if !self.current().can_transition_to(next) {
            return false;
        }
        if next == QueryState::FallbackRetrieving && self.fallback_count() > 0 {
            return false;
        }
        tracing::debug!(from = ?self.current(), to = ?next, "query state");
        self.states.push(next);
        true
    }

    pub fn fallback_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| **s == QueryState::FallbackRetrieving)
            .count()
    }

    pub fn states(&self) -> &[QueryState] {
        &self.states
    }
}
