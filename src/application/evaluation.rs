//! Evaluation service: offline quality checks for a model snapshot.
//!
//! Runs a labelled holdout through the full pipeline and reports
//! classification metrics, calibration quality before and after calibration,
//! and what the policy would have cost. `RegressionGate` turns the report
//! into a release decision.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::metrics::{reliability, DEFAULT_BINS};
use crate::domain::{
    CalibrationMap, CalibrationReport, ClassificationMetrics, ModelSnapshot, OutcomeCosts,
    PolicyEngine, PolicyReport, RawInstance, Verdict,
};

/// Everything measured on one holdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub samples: usize,
    /// Metrics of the calibrated probability at 0.5.
    pub classification: ClassificationMetrics,
    /// Reliability of the raw ensemble score.
    pub raw_calibration: CalibrationReport,
    /// Reliability of the calibrated probability.
    pub calibration: CalibrationReport,
    pub policy: PolicyReport,
}

/// Offline evaluator bound to one snapshot and policy.
pub struct EvaluationService {
    snapshot: Arc<ModelSnapshot>,
    policy: PolicyEngine,
    costs: OutcomeCosts,
    n_bins: usize,
}

impl EvaluationService {
    #[must_use]
    pub fn new(snapshot: Arc<ModelSnapshot>, policy: PolicyEngine) -> Self {
        Self {
            snapshot,
            policy,
            costs: OutcomeCosts::default(),
            n_bins: DEFAULT_BINS,
        }
    }

    #[must_use]
    pub fn with_costs(mut self, costs: OutcomeCosts) -> Self {
        self.costs = costs;
        self
    }

    #[must_use]
    pub fn with_bins(mut self, n_bins: usize) -> Self {
        self.n_bins = n_bins;
        self
    }

    /// Evaluate a labelled holdout through the full pipeline.
    ///
    /// # Errors
    /// The first instance that fails to score, or metric errors on empty or
    /// mismatched input.
    pub fn evaluate(
        &self,
        holdout: &[RawInstance],
        labels: &[bool],
    ) -> crate::Result<EvaluationReport> {
        let raw_scores = holdout
            .iter()
            .map(|raw| Ok(self.snapshot.score(raw)?.ensemble.raw_score))
            .collect::<crate::Result<Vec<f64>>>()?;
        evaluate_scores(
            self.snapshot.calibration(),
            &self.policy,
            &self.costs,
            self.n_bins,
            &raw_scores,
            labels,
        )
    }
}

/// Evaluate precomputed raw ensemble scores.
///
/// # Errors
/// Metric errors on empty or mismatched input, or a policy contract
/// violation.
pub fn evaluate_scores(
    calibration: &CalibrationMap,
    policy: &PolicyEngine,
    costs: &OutcomeCosts,
    n_bins: usize,
    raw_scores: &[f64],
    labels: &[bool],
) -> crate::Result<EvaluationReport> {
    let probabilities: Vec<f64> = raw_scores
        .iter()
        .map(|s| calibration.calibrate(*s).probability)
        .collect();
    let verdicts = probabilities
        .iter()
        .map(|p| Ok(policy.decide(*p, None)?.verdict))
        .collect::<crate::Result<Vec<Verdict>>>()?;

    let report = EvaluationReport {
        samples: raw_scores.len(),
        classification: ClassificationMetrics::compute(&probabilities, labels, 0.5)?,
        raw_calibration: reliability(raw_scores, labels, n_bins)?,
        calibration: reliability(&probabilities, labels, n_bins)?,
        policy: PolicyReport::compute(&verdicts, labels, costs)?,
    };

    tracing::info!(
        "Evaluated {} samples: ECE {:.4} -> {:.4}, coverage {:.3}, precision(covered) {:.3}",
        report.samples,
        report.raw_calibration.ece,
        report.calibration.ece,
        report.policy.coverage,
        report.policy.precision_covered
    );
    Ok(report)
}

/// A failed release criterion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateViolation {
    pub metric: &'static str,
    pub value: f64,
    pub limit: f64,
}

/// Release thresholds a candidate bundle must meet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionGate {
    /// Minimum precision on covered (non-abstained) cases.
    pub min_precision: f64,
    /// Maximum ECE of the calibrated probability.
    pub max_ece: f64,
}

impl Default for RegressionGate {
    fn default() -> Self {
        Self {
            min_precision: 0.95,
            max_ece: 0.02,
        }
    }
}

impl RegressionGate {
    /// Every violated criterion; empty when the report passes.
    #[must_use]
    pub fn check(&self, report: &EvaluationReport) -> Vec<GateViolation> {
        let mut violations = Vec::new();
        if report.policy.precision_covered < self.min_precision {
            violations.push(GateViolation {
                metric: "precision_covered",
                value: report.policy.precision_covered,
                limit: self.min_precision,
            });
        }
        if report.calibration.ece > self.max_ece {
            violations.push(GateViolation {
                metric: "ece",
                value: report.calibration.ece,
                limit: self.max_ece,
            });
        }
        for v in &violations {
            tracing::warn!(
                "Regression gate failed: {} = {:.4} (limit {:.4})",
                v.metric,
                v.value,
                v.limit
            );
        }
        violations
    }

    #[must_use]
    pub fn passes(&self, report: &EvaluationReport) -> bool {
        self.check(report).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::snapshot::tests::census_snapshot;
    use crate::domain::{IsotonicCalibrator, PolicyThresholds};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    /// Raw scores uniform on [0, 1] with true positive rate `s^2`.
    fn synthetic(rng: &mut ChaCha20Rng, n: usize) -> (Vec<f64>, Vec<bool>) {
        (0..n)
            .map(|_| {
                let s: f64 = rng.gen();
                (s, rng.gen::<f64>() < s * s)
            })
            .unzip()
    }

    #[test]
    fn test_isotonic_calibration_meets_ece_target() {
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        let (fit_scores, fit_labels) = synthetic(&mut rng, 50_000);
        let (scores, labels) = synthetic(&mut rng, 50_000);

        let map = IsotonicCalibrator::fit(&fit_scores, &fit_labels).expect("fit");
        let report = evaluate_scores(
            &map,
            &PolicyEngine::default(),
            &OutcomeCosts::default(),
            DEFAULT_BINS,
            &scores,
            &labels,
        )
        .expect("evaluate");

        assert!(report.raw_calibration.ece > 0.1, "raw ECE {}", report.raw_calibration.ece);
        assert!(report.calibration.ece < 0.02, "calibrated ECE {}", report.calibration.ece);
        assert!(report.calibration.brier < report.raw_calibration.brier);
        assert_eq!(report.samples, 50_000);
        assert_eq!(report.policy.matrix.total(), 50_000);
    }

    #[test]
    fn test_gate() {
        let mut rng = ChaCha20Rng::seed_from_u64(11);
        let (fit_scores, fit_labels) = synthetic(&mut rng, 20_000);
        let (scores, labels) = synthetic(&mut rng, 20_000);
        let map = IsotonicCalibrator::fit(&fit_scores, &fit_labels).expect("fit");

        let strict = PolicyEngine::default()
            .with_thresholds(PolicyThresholds::new(0.05, 0.9).expect("valid"));
        let costs = OutcomeCosts::default();
        let report = evaluate_scores(&map, &strict, &costs, DEFAULT_BINS, &scores, &labels)
            .expect("evaluate");
        let gate = RegressionGate {
            min_precision: 0.9,
            max_ece: 0.05,
        };
        assert!(gate.passes(&report), "{:?}", gate.check(&report));

        let impossible = RegressionGate {
            min_precision: 1.01,
            max_ece: 0.0,
        };
        let violations = impossible.check(&report);
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].metric, "precision_covered");
    }

    #[test]
    fn test_evaluate_holdout_through_pipeline() {
        let snapshot = Arc::new(census_snapshot());
        let service = EvaluationService::new(snapshot, PolicyEngine::default());
        let holdout = vec![RawInstance::new().with("age", 30.0); 4];
        let labels = [true, false, true, true];

        let report = service.evaluate(&holdout, &labels).expect("evaluate");
        // Constant members: every instance scores 0.65 and abstains.
        assert_eq!(report.policy.matrix.abstained(), 4);
        assert_eq!(report.policy.coverage, 0.0);
        assert!((report.policy.total_cost - 8.0).abs() < 1e-12);
        assert!(!RegressionGate::default().passes(&report));

        assert!(service.evaluate(&holdout, &labels[..2]).is_err());
    }
}
