//! # Kairos
//!
//! Risk-aware decision core for high-stakes binary classification.
//!
//! A raw instance flows through domain feature engineering, a frozen feature
//! transformer, a weighted ensemble of tree models and an isotonic calibrator
//! into a policy engine that returns ACCEPT, REJECT or ABSTAIN together with
//! its uncertainty and a cost-risk index.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: pure pipeline types (transformer, ensemble, calibration, policy)
//! - `ports`: trait definitions for bundle storage and the review queue
//! - `adapters`: concrete implementations (tree scorers, signed bundles, SQLite)
//! - `application`: decision, training and evaluation services
//! - `config`: environment and policy-file configuration

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{Decision, RawInstance, Verdict};

/// Result type for Kairos operations
pub type Result<T> = std::result::Result<T, KairosError>;

/// Main error type for Kairos
#[derive(Debug, thiserror::Error)]
pub enum KairosError {
    #[error("Invalid instance: {0}")]
    Schema(#[from] domain::SchemaError),

    #[error("Ensemble failure: {0}")]
    Ensemble(#[from] domain::EnsembleError),

    #[error("Calibration failure: {0}")]
    Calibration(#[from] domain::CalibrationError),

    #[error("Policy failure: {0}")]
    Policy(#[from] domain::PolicyError),

    #[error("Inconsistent model snapshot: {0}")]
    Snapshot(#[from] domain::SnapshotError),

    #[error("Bundle failure: {0}")]
    Bundle(#[from] adapters::BundleError),

    #[error("Review queue failure: {0}")]
    ReviewStore(#[from] adapters::ReviewStoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] domain::MetricsError),

    #[error("Refusing rollback from serial {live} to {offered}")]
    Rollback { live: u64, offered: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl KairosError {
    /// Whether the failure is attributable to the request rather than the
    /// service. Everything else is an internal error.
    #[must_use]
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::Schema(_) | Self::Ensemble(_))
    }
}

impl From<std::convert::Infallible> for KairosError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}
