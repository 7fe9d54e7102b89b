//! Ensemble consensus scoring.
//!
//! An `Ensemble` owns N independently trained artifacts (architectures x folds).
//! Every member sees the same feature vector; the consensus is the weighted mean
//! of member probabilities. A single failing member fails the whole call; the
//! ensemble never drops a member and renormalises, since the calibrator was
//! fitted on the full consensus.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::instance::FeatureVector;

/// Failure inside a single scorer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PredictError {
    #[error("Input width mismatch: expected {expected}, got {got}")]
    WidthMismatch { expected: usize, got: usize },

    #[error("Malformed model: {0}")]
    Malformed(String),
}

/// A trained binary classifier producing a probability in `[0, 1]`.
pub trait Scorer: Send + Sync + fmt::Debug {
    /// Expected input width.
    fn n_features(&self) -> usize;

    /// Probability of the positive class.
    ///
    /// # Errors
    /// Returns `PredictError` on malformed input or model state.
    fn predict(&self, features: &[f64]) -> Result<f64, PredictError>;
}

/// Model family of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "lightgbm")]
    LightGbm,
    #[serde(rename = "catboost")]
    CatBoost,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LightGbm => write!(f, "lightgbm"),
            Self::CatBoost => write!(f, "catboost"),
        }
    }
}

/// One trained member of the ensemble.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    id: String,
    architecture: Architecture,
    fold: u32,
    weight: f64,
    scorer: Arc<dyn Scorer>,
}

impl ModelArtifact {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        architecture: Architecture,
        fold: u32,
        weight: f64,
        scorer: Arc<dyn Scorer>,
    ) -> Self {
        Self {
            id: id.into(),
            architecture,
            fold,
            weight,
            scorer,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn architecture(&self) -> Architecture {
        self.architecture
    }

    #[must_use]
    pub fn fold(&self) -> u32 {
        self.fold
    }

    #[must_use]
    pub fn weight(&self) -> f64 {
        self.weight
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.scorer.n_features()
    }
}

/// Errors from ensemble registration and scoring.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnsembleError {
    #[error("Ensemble has no members")]
    Empty,

    #[error("Duplicate artifact id '{0}'")]
    DuplicateArtifact(String),

    #[error("Artifact '{artifact_id}' has invalid weight {weight} (must be finite and > 0)")]
    InvalidWeight { artifact_id: String, weight: f64 },

    #[error("Artifact '{artifact_id}' expects {got} features, ensemble expects {expected}")]
    WidthMismatch {
        artifact_id: String,
        expected: usize,
        got: usize,
    },

    #[error("Total ensemble weight {0} is not finite")]
    WeightTotalOverflow(f64),

    #[error("Weight override references unknown artifact '{0}'")]
    UnknownArtifact(String),

    #[error("Ensemble member '{artifact_id}' failed: {reason}")]
    MemberFailed { artifact_id: String, reason: String },
}

/// Prediction of a single member, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberScore {
    pub artifact_id: String,
    pub prediction: f64,
    pub weight: f64,
}

/// Consensus output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleScore {
    /// Weighted mean of member predictions, in `[0, 1]`.
    pub raw_score: f64,
    /// Weighted standard deviation of member predictions.
    pub disagreement: f64,
    pub members: Vec<MemberScore>,
}

/// Weighted ensemble of artifacts with equal input width.
#[derive(Debug, Clone)]
pub struct Ensemble {
    members: Vec<ModelArtifact>,
    n_features: usize,
}

impl Ensemble {
    /// Register members.
    ///
    /// # Errors
    /// Rejects an empty member list, duplicate ids, non-finite or non-positive
    /// weights, a weight total that overflows, and members whose input widths
    /// differ.
    pub fn new(members: Vec<ModelArtifact>) -> Result<Self, EnsembleError> {
        let first = members.first().ok_or(EnsembleError::Empty)?;
        let n_features = first.n_features();

        let mut ids = BTreeSet::new();
        for member in &members {
            if !ids.insert(member.id.as_str()) {
                return Err(EnsembleError::DuplicateArtifact(member.id.clone()));
            }
            if !member.weight.is_finite() || member.weight <= 0.0 {
                return Err(EnsembleError::InvalidWeight {
                    artifact_id: member.id.clone(),
                    weight: member.weight,
                });
            }
            if member.n_features() != n_features {
                return Err(EnsembleError::WidthMismatch {
                    artifact_id: member.id.clone(),
                    expected: n_features,
                    got: member.n_features(),
                });
            }
        }

        let total: f64 = members.iter().map(|m| m.weight).sum();
        if !total.is_finite() {
            return Err(EnsembleError::WeightTotalOverflow(total));
        }

        Ok(Self {
            members,
            n_features,
        })
    }

    /// Copy of this ensemble with some member weights replaced.
    ///
    /// # Errors
    /// Fails on unknown artifact ids or invalid weights.
    pub fn with_weight_overrides(
        &self,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self, EnsembleError> {
        if let Some(unknown) = overrides
            .keys()
            .find(|id| !self.members.iter().any(|m| &m.id == *id))
        {
            return Err(EnsembleError::UnknownArtifact(unknown.clone()));
        }
        let members = self
            .members
            .iter()
            .map(|m| {
                let mut m = m.clone();
                if let Some(w) = overrides.get(&m.id) {
                    m.weight = *w;
                }
                m
            })
            .collect();
        Self::new(members)
    }

    #[must_use]
    pub fn members(&self) -> &[ModelArtifact] {
        &self.members
    }

    #[must_use]
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    /// Score one feature vector.
    ///
    /// # Errors
    /// `EnsembleError::MemberFailed` naming the first member that errors,
    /// receives the wrong width, or returns a value outside `[0, 1]`.
    pub fn score(&self, features: &FeatureVector) -> Result<EnsembleScore, EnsembleError> {
        let x = features.as_slice();
        let mut scores = Vec::with_capacity(self.members.len());

        for member in &self.members {
            let failed = |reason: String| EnsembleError::MemberFailed {
                artifact_id: member.id.clone(),
                reason,
            };
            if x.len() != member.n_features() {
                return Err(failed(
                    PredictError::WidthMismatch {
                        expected: member.n_features(),
                        got: x.len(),
                    }
                    .to_string(),
                ));
            }
            let p = member
                .scorer
                .predict(x)
                .map_err(|e| failed(e.to_string()))?;
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(failed(format!("prediction {p} outside [0, 1]")));
            }
            scores.push(MemberScore {
                artifact_id: member.id.clone(),
                prediction: p,
                weight: member.weight,
            });
        }

        let total: f64 = scores.iter().map(|s| s.weight).sum();
        let raw_score = scores.iter().map(|s| s.weight * s.prediction).sum::<f64>() / total;
        let variance = scores
            .iter()
            .map(|s| s.weight * (s.prediction - raw_score).powi(2))
            .sum::<f64>()
            / total;

        Ok(EnsembleScore {
            // Rounding can push the mean a few ulps past the unit interval.
            raw_score: raw_score.clamp(0.0, 1.0),
            disagreement: variance.sqrt(),
            members: scores,
        })
    }
}
