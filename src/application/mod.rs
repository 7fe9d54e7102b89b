//! Application layer: Use cases and services.
//!
//! This module orchestrates domain logic with ports to implement the use
//! cases of the decision core: serving decisions, producing bundles and
//! evaluating them before release.

mod decision;
mod evaluation;
mod review_writer;
pub mod training;

pub use decision::{DecisionService, DriftStats};
pub use evaluation::{
    evaluate_scores, EvaluationReport, EvaluationService, GateViolation, RegressionGate,
};
pub use review_writer::DEFAULT_REVIEW_CAPACITY;
