//! Pipeline stages
//!
//! A request walks `Embedding → Retrieving → Fusing → Reranking →
//! Synthesizing → Done`. Reranking and synthesis may be skipped, and `Failed`
//! is reachable from every non-terminal stage.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Recommendation pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Embedding,
    Retrieving,
    Fusing,
    Reranking,
    Synthesizing,
    Done,
    Failed,
}

impl PipelineStage {
    /// Stages reachable from this one
    pub fn allowed_transitions(&self) -> &'static [PipelineStage] {
        use PipelineStage::*;
        match self {
            Embedding => &[Retrieving, Failed],
            Retrieving => &[Fusing, Failed],
            Fusing => &[Reranking, Synthesizing, Done, Failed],
            Reranking => &[Synthesizing, Done, Failed],
            Synthesizing => &[Done, Failed],
            Done | Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: PipelineStage) -> bool {
        self.allowed_transitions().contains(&target)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }

    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Embedding => "embedding",
            PipelineStage::Retrieving => "retrieving",
            PipelineStage::Fusing => "fusing",
            PipelineStage::Reranking => "reranking",
            PipelineStage::Synthesizing => "synthesizing",
            PipelineStage::Done => "done",
            PipelineStage::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded stage entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub stage: PipelineStage,
    /// Milliseconds since the request started
    pub entered_at_ms: u64,
}

/// Ordered record of the stages a request went through
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTrace {
    transitions: Vec<StageTransition>,
    #[serde(skip, default = "Instant::now")]
    started: Instant,
}

impl Default for StageTrace {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTrace {
    /// Trace positioned at `Embedding`
    pub fn new() -> Self {
        Self {
            transitions: vec![StageTransition {
                stage: PipelineStage::Embedding,
                entered_at_ms: 0,
            }],
            started: Instant::now(),
        }
    }

    pub fn current(&self) -> PipelineStage {
        self.transitions
            .last()
            .map(|t| t.stage)
            .unwrap_or_default()
    }

    /// Move to `next`; illegal transitions are rejected and not recorded
    pub fn advance(&mut self, next: PipelineStage) -> bool {
        let current = self.current();
        if !current.can_transition_to(next) {
            tracing::error!(from = %current, to = %next, "Illegal pipeline transition");
            return false;
        }
        self.transitions.push(StageTransition {
            stage: next,
            entered_at_ms: self.started.elapsed().as_millis() as u64,
        });
        true
    }

    /// Move to `Failed` unless already terminal
    pub fn fail(&mut self) {
        if !self.current().is_terminal() {
            self.advance(PipelineStage::Failed);
        }
    }

    pub fn stages(&self) -> Vec<PipelineStage> {
        self.transitions.iter().map(|t| t.stage).collect()
    }

    pub fn transitions(&self) -> &[StageTransition] {
        &self.transitions
    }

    pub fn contains(&self, stage: PipelineStage) -> bool {
        self.transitions.iter().any(|t| t.stage == stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions() {
        use PipelineStage::*;
        assert!(Embedding.can_transition_to(Retrieving));
        assert!(Retrieving.can_transition_to(Fusing));
        assert!(Fusing.can_transition_to(Reranking));
        assert!(Fusing.can_transition_to(Synthesizing));
        assert!(Reranking.can_transition_to(Synthesizing));
        assert!(Synthesizing.can_transition_to(Done));
    }

    #[test]
    fn test_no_backward_or_skipped_retrieval() {
        use PipelineStage::*;
        assert!(!Embedding.can_transition_to(Fusing));
        assert!(!Fusing.can_transition_to(Retrieving));
        assert!(!Synthesizing.can_transition_to(Reranking));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Embedding));
    }

    #[test]
    fn test_failed_reachable_from_non_terminal() {
        use PipelineStage::*;
        for stage in [Embedding, Retrieving, Fusing, Reranking, Synthesizing] {
            assert!(stage.can_transition_to(Failed), "{} -> failed", stage);
        }
    }

    #[test]
    fn test_trace_rejects_illegal_step() {
        let mut trace = StageTrace::new();
        assert!(!trace.advance(PipelineStage::Synthesizing));
        assert_eq!(trace.current(), PipelineStage::Embedding);

        assert!(trace.advance(PipelineStage::Retrieving));
        assert!(trace.advance(PipelineStage::Fusing));
        assert!(trace.advance(PipelineStage::Done));
        assert_eq!(
            trace.stages(),
            vec![
                PipelineStage::Embedding,
                PipelineStage::Retrieving,
                PipelineStage::Fusing,
                PipelineStage::Done
            ]
        );
    }

    #[test]
    fn test_fail_is_idempotent_on_terminal() {
        let mut trace = StageTrace::new();
        trace.fail();
        trace.fail();
        assert_eq!(trace.stages(), vec![PipelineStage::Embedding, PipelineStage::Failed]);
    }
}
