//! Immutable model snapshot.
//!
//! A `ModelSnapshot` is the unit of hot reload: transformer state, ensemble and
//! calibration map are produced by the same training run and are only ever
//! swapped together.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::calibration::{Calibrated, CalibrationMap};
use super::ensemble::{Ensemble, EnsembleError, EnsembleScore};
use super::instance::{FeatureVector, RawInstance};
use super::schema::{DomainProfile, DomainTag};
use super::transformer::{schema_hash, TransformerState};

/// Consistency failures between the parts of a snapshot.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SnapshotError {
    #[error("Transformer layout hash mismatch: recorded {recorded}, computed {computed}")]
    LayoutTampered { recorded: String, computed: String },

    #[error(
        "Transformer was fitted for a different {domain} schema \
         (expected {expected}, found {found})"
    )]
    DomainSchemaMismatch {
        domain: DomainTag,
        expected: String,
        found: String,
    },

    #[error("Bundle metadata schema hash {metadata} does not match transformer {transformer}")]
    MetadataMismatch {
        metadata: String,
        transformer: String,
    },

    #[error("Transformer emits {transformer} features but ensemble expects {ensemble}")]
    WidthMismatch { transformer: usize, ensemble: usize },
}

/// Identity of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub bundle_version: String,
    pub domain: DomainTag,
    pub schema_hash: String,
    /// Monotonic release counter for anti-rollback.
    pub serial: u64,
    /// Unix seconds.
    pub created_at: i64,
}

/// Output of the scoring half of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub features: FeatureVector,
    pub ensemble: EnsembleScore,
    pub calibrated: Calibrated,
}

/// Everything a decision needs from one training run.
#[derive(Debug, Clone)]
pub struct ModelSnapshot {
    metadata: BundleMetadata,
    transformer: TransformerState,
    ensemble: Ensemble,
    calibration: CalibrationMap,
}

impl ModelSnapshot {
    /// Assemble a snapshot, checking that its parts belong together.
    ///
    /// # Errors
    /// `SnapshotError` when the transformer layout was altered, belongs to
    /// another domain, disagrees with the metadata, or does not match the
    /// ensemble input width.
    pub fn new(
        metadata: BundleMetadata,
        transformer: TransformerState,
        ensemble: Ensemble,
        calibration: CalibrationMap,
    ) -> Result<Self, SnapshotError> {
        let computed = transformer.computed_schema_hash();
        if computed != transformer.schema_hash() {
            return Err(SnapshotError::LayoutTampered {
                recorded: transformer.schema_hash().to_string(),
                computed,
            });
        }

        let expected = schema_hash(&metadata.domain.profile().schema());
        if expected != transformer.schema_hash() {
            return Err(SnapshotError::DomainSchemaMismatch {
                domain: metadata.domain,
                expected,
                found: transformer.schema_hash().to_string(),
            });
        }

        if metadata.schema_hash != transformer.schema_hash() {
            return Err(SnapshotError::MetadataMismatch {
                metadata: metadata.schema_hash.clone(),
                transformer: transformer.schema_hash().to_string(),
            });
        }

        if transformer.len() != ensemble.n_features() {
            return Err(SnapshotError::WidthMismatch {
                transformer: transformer.len(),
                ensemble: ensemble.n_features(),
            });
        }

        Ok(Self {
            metadata,
            transformer,
            ensemble,
            calibration,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn transformer(&self) -> &TransformerState {
        &self.transformer
    }

    #[must_use]
    pub fn ensemble(&self) -> &Ensemble {
        &self.ensemble
    }

    #[must_use]
    pub fn calibration(&self) -> &CalibrationMap {
        &self.calibration
    }

    #[must_use]
    pub fn profile(&self) -> &'static dyn DomainProfile {
        self.metadata.domain.profile()
    }

    /// Same snapshot with ensemble weights overridden.
    ///
    /// # Errors
    /// Propagates ensemble validation failures.
    pub fn with_weight_overrides(
        &self,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self, EnsembleError> {
        Ok(Self {
            ensemble: self.ensemble.with_weight_overrides(overrides)?,
            ..self.clone()
        })
    }

    /// Engineering, transformation, ensemble and calibration for one instance.
    ///
    /// # Errors
    /// Schema violations and ensemble member failures.
    pub fn score(&self, raw: &RawInstance) -> crate::Result<Scored> {
        let engineered = self.profile().engineer(raw)?;
        let features = self.transformer.transform(&engineered)?;
        let ensemble = self.ensemble.score(&features)?;
        let calibrated = self.calibration.calibrate(ensemble.raw_score);
        Ok(Scored {
            features,
            ensemble,
            calibrated,
        })
    }
}
