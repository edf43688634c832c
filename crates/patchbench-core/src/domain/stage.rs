//! Per-evaluation stage machine.
//!
//! `Pending → BuildingBase → BuildingEnvironment → BuildingInstance →
//! ApplyingPatch → Running → Parsing → Finished(status)`.
//!
//! Stages advance one step at a time. Any non-terminal stage may jump straight
//! to `Finished` when the evaluation ends early.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{DomainError, Result};
use super::verdict::VerdictStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "status", rename_all = "snake_case")]
pub enum EvaluationStage {
    Pending,
    BuildingBase,
    BuildingEnvironment,
    BuildingInstance,
    ApplyingPatch,
    Running,
    Parsing,
    Finished(VerdictStatus),
}

impl EvaluationStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished(_))
    }

    fn ordinal(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::BuildingBase => 1,
            Self::BuildingEnvironment => 2,
            Self::BuildingInstance => 3,
            Self::ApplyingPatch => 4,
            Self::Running => 5,
            Self::Parsing => 6,
            Self::Finished(_) => 7,
        }
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_advance_to(self, next: EvaluationStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Finished(_) => true,
            _ => next.ordinal() == self.ordinal() + 1,
        }
    }
}

impl fmt::Display for EvaluationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::BuildingBase => f.write_str("building_base"),
            Self::BuildingEnvironment => f.write_str("building_environment"),
            Self::BuildingInstance => f.write_str("building_instance"),
            Self::ApplyingPatch => f.write_str("applying_patch"),
            Self::Running => f.write_str("running"),
            Self::Parsing => f.write_str("parsing"),
            Self::Finished(status) => write!(f, "finished({status})"),
        }
    }
}

/// Tracks the current stage and the stages visited so far.
#[derive(Debug, Clone)]
pub struct StageTracker {
    current: EvaluationStage,
    history: Vec<EvaluationStage>,
}

impl Default for StageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StageTracker {
    pub fn new() -> Self {
        Self {
            current: EvaluationStage::Pending,
            history: vec![EvaluationStage::Pending],
        }
    }

    pub fn current(&self) -> EvaluationStage {
        self.current
    }

    pub fn history(&self) -> &[EvaluationStage] {
        &self.history
    }

    pub fn visited(&self, stage: EvaluationStage) -> bool {
        self.history.contains(&stage)
    }

    pub fn advance(&mut self, next: EvaluationStage) -> Result<()> {
        if !self.current.can_advance_to(next) {
            return Err(DomainError::IllegalTransition {
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    /// Move to `Finished(status)`. No-op if already terminal.
    pub fn finish(&mut self, status: VerdictStatus) -> EvaluationStage {
        if !self.current.is_terminal() {
            self.current = EvaluationStage::Finished(status);
            self.history.push(self.current);
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_happy_path() {
        let mut t = StageTracker::new();
        for stage in [
            EvaluationStage::BuildingBase,
            EvaluationStage::BuildingEnvironment,
            EvaluationStage::BuildingInstance,
            EvaluationStage::ApplyingPatch,
            EvaluationStage::Running,
            EvaluationStage::Parsing,
            EvaluationStage::Finished(VerdictStatus::Pass),
        ] {
            t.advance(stage).unwrap();
        }
        assert!(t.current().is_terminal());
        assert_eq!(t.history().len(), 8);
    }

    #[test]
    fn test_skipping_a_stage_is_illegal() {
        let mut t = StageTracker::new();
        t.advance(EvaluationStage::BuildingBase).unwrap();
        let err = t.advance(EvaluationStage::BuildingInstance).unwrap_err();
        assert!(matches!(err, DomainError::IllegalTransition { .. }));
        assert_eq!(t.current(), EvaluationStage::BuildingBase);
    }

    #[test]
    fn test_early_finish_from_patch_stage() {
        let mut t = StageTracker::new();
        t.advance(EvaluationStage::BuildingBase).unwrap();
        t.advance(EvaluationStage::BuildingEnvironment).unwrap();
        t.advance(EvaluationStage::BuildingInstance).unwrap();
        t.advance(EvaluationStage::ApplyingPatch).unwrap();
        t.finish(VerdictStatus::PatchConflict);

        assert!(!t.visited(EvaluationStage::Running));
        assert!(!t.visited(EvaluationStage::Parsing));
        assert_eq!(
            t.current(),
            EvaluationStage::Finished(VerdictStatus::PatchConflict)
        );
    }

    #[test]
    fn test_terminal_is_sticky() {
        let mut t = StageTracker::new();
        t.finish(VerdictStatus::Error);
        assert_eq!(t.finish(VerdictStatus::Pass), EvaluationStage::Finished(VerdictStatus::Error));
        assert!(t.advance(EvaluationStage::BuildingBase).is_err());
    }
}
