//! Domain layer: Core decisioning types and logic.
//!
//! Pure, synchronous code over immutable state. Every type here is `Send + Sync`
//! and free of I/O; artifacts are serializable and validated on construction.

pub mod calibration;
mod decision;
pub mod ensemble;
mod instance;
pub mod metrics;
pub mod policy;
mod profiles;
mod schema;
pub mod snapshot;
pub mod transformer;

pub use calibration::{
    Breakpoint, Calibrated, CalibrationError, CalibrationMap, ClampSide, IsotonicCalibrator,
};
pub use decision::{Decision, ReviewCase};
pub use ensemble::{
    Architecture, Ensemble, EnsembleError, EnsembleScore, MemberScore, ModelArtifact, PredictError,
    Scorer,
};
pub use instance::{FeatureVector, FieldValue, RawInstance};
pub use metrics::{
    CalibrationReport, ClassificationMetrics, DecisionMatrix, MetricsError, OutcomeCosts,
    PolicyReport, ReliabilityBin,
};
pub use policy::{
    binary_entropy, CostIndex, PolicyEngine, PolicyError, PolicyOutcome, PolicyThresholds, Verdict,
};
pub use profiles::{age_bin, BankingProfile, CensusProfile};
pub use schema::{
    DomainProfile, DomainSchema, DomainTag, FieldKind, FieldSpec, Imputation, SchemaError,
};
pub use snapshot::{BundleMetadata, ModelSnapshot, Scored, SnapshotError};
pub use transformer::{FeatureParams, FeatureTransformer, TransformerState, UNKNOWN_CODE};
