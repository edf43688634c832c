//! Domain models for patchbench.
//!
//! Canonical definitions for the core entities:
//! - `LayerIdentity`: what uniquely identifies a buildable layer
//! - `DataPointDescriptor`: one evaluation input
//! - `Verdict`: the terminal outcome of one evaluation
//! - `EvaluationStage`: the per-evaluation state machine

pub mod descriptor;
pub mod digest;
pub mod error;
pub mod identity;
pub mod stage;
pub mod verdict;

// Re-export main types and errors
pub use descriptor::{DataPointDescriptor, ExpectedTests};
pub use error::{DomainError, Result};
pub use identity::{
    BaseIdentity, EnvironmentIdentity, InstanceIdentity, LayerIdentity, LayerKey, LayerKind,
};
pub use stage::{EvaluationStage, StageTracker};
pub use verdict::{TestSetOutcome, TestStatus, TestsStatus, Verdict, VerdictStatus};
