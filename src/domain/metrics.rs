//! Offline evaluation metrics.
//!
//! Reliability (ECE / MCE / Brier), standard classification metrics and batch
//! policy reports. None of this runs on the decision path.

use serde::{Deserialize, Serialize};

use super::policy::Verdict;

/// Default number of reliability bins.
pub const DEFAULT_BINS: usize = 10;

/// Clipping used for log loss.
const LOG_LOSS_EPS: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("Cannot compute metrics on an empty set")]
    Empty,

    #[error("Length mismatch: {left} predictions, {right} labels")]
    LengthMismatch { left: usize, right: usize },

    #[error("Number of bins must be > 0")]
    InvalidBins,

    #[error("Probability at index {index} is outside [0, 1]")]
    InvalidProbability { index: usize },
}

fn check_lengths(left: usize, right: usize) -> Result<(), MetricsError> {
    if left != right {
        return Err(MetricsError::LengthMismatch { left, right });
    }
    if left == 0 {
        return Err(MetricsError::Empty);
    }
    Ok(())
}

fn check_probabilities(probabilities: &[f64]) -> Result<(), MetricsError> {
    match probabilities
        .iter()
        .position(|p| !(0.0..=1.0).contains(p))
    {
        Some(index) => Err(MetricsError::InvalidProbability { index }),
        None => Ok(()),
    }
}

fn label(y: bool) -> f64 {
    if y {
        1.0
    } else {
        0.0
    }
}

/// One bucket of a reliability diagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityBin {
    /// Inclusive lower edge.
    pub lower: f64,
    /// Exclusive upper edge (inclusive for the last bin).
    pub upper: f64,
    pub count: usize,
    /// Mean predicted probability, 0 for empty bins.
    pub mean_predicted: f64,
    /// Observed positive rate, 0 for empty bins.
    pub observed_rate: f64,
}

impl ReliabilityBin {
    #[must_use]
    pub fn gap(&self) -> f64 {
        (self.observed_rate - self.mean_predicted).abs()
    }
}

/// Calibration quality of a set of probabilities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Expected calibration error.
    pub ece: f64,
    /// Maximum calibration error over non-empty bins.
    pub mce: f64,
    pub brier: f64,
    pub samples: usize,
    pub bins: Vec<ReliabilityBin>,
}

/// Equal-width reliability analysis.
///
/// Bin `k` covers `[k/n, (k+1)/n)`; the last bin is closed at 1.
///
/// # Errors
/// Fails on empty or mismatched input, `n_bins == 0`, or probabilities
/// outside `[0, 1]`.
pub fn reliability(
    probabilities: &[f64],
    outcomes: &[bool],
    n_bins: usize,
) -> Result<CalibrationReport, MetricsError> {
    check_lengths(probabilities.len(), outcomes.len())?;
    if n_bins == 0 {
        return Err(MetricsError::InvalidBins);
    }
    check_probabilities(probabilities)?;

    let mut sum_pred = vec![0.0; n_bins];
    let mut sum_obs = vec![0.0; n_bins];
    let mut counts = vec![0usize; n_bins];
    for (p, y) in probabilities.iter().zip(outcomes) {
        let k = ((p * n_bins as f64) as usize).min(n_bins - 1);
        sum_pred[k] += p;
        sum_obs[k] += label(*y);
        counts[k] += 1;
    }

    let n = probabilities.len() as f64;
    let bins: Vec<ReliabilityBin> = (0..n_bins)
        .map(|k| {
            let count = counts[k];
            let (mean_predicted, observed_rate) = if count == 0 {
                (0.0, 0.0)
            } else {
                (sum_pred[k] / count as f64, sum_obs[k] / count as f64)
            };
            ReliabilityBin {
                lower: k as f64 / n_bins as f64,
                upper: (k + 1) as f64 / n_bins as f64,
                count,
                mean_predicted,
                observed_rate,
            }
        })
        .collect();

    let ece = bins
        .iter()
        .map(|b| (b.count as f64 / n) * b.gap())
        .sum();
    let mce = bins
        .iter()
        .filter(|b| b.count > 0)
        .map(ReliabilityBin::gap)
        .fold(0.0, f64::max);
    let brier = probabilities
        .iter()
        .zip(outcomes)
        .map(|(p, y)| (p - label(*y)).powi(2))
        .sum::<f64>()
        / n;

    Ok(CalibrationReport {
        ece,
        mce,
        brier,
        samples: probabilities.len(),
        bins,
    })
}

/// Standard binary metrics at a fixed threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationMetrics {
    pub threshold: f64,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub log_loss: f64,
    /// `None` when only one class is present.
    pub roc_auc: Option<f64>,
}

impl ClassificationMetrics {
    /// Metrics predicting positive when `p >= threshold`.
    ///
    /// Precision and recall are 0 when their denominator is 0.
    ///
    /// # Errors
    /// Fails on empty or mismatched input or invalid probabilities.
    pub fn compute(
        probabilities: &[f64],
        outcomes: &[bool],
        threshold: f64,
    ) -> Result<Self, MetricsError> {
        check_lengths(probabilities.len(), outcomes.len())?;
        check_probabilities(probabilities)?;

        let (mut tp, mut fp, mut tn, mut fn_) = (0usize, 0usize, 0usize, 0usize);
        for (p, y) in probabilities.iter().zip(outcomes) {
            match (*p >= threshold, *y) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        let n = probabilities.len();
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let log_loss = probabilities
            .iter()
            .zip(outcomes)
            .map(|(p, y)| {
                let p = p.clamp(LOG_LOSS_EPS, 1.0 - LOG_LOSS_EPS);
                if *y {
                    -p.ln()
                } else {
                    -(1.0 - p).ln()
                }
            })
            .sum::<f64>()
            / n as f64;

        Ok(Self {
            threshold,
            accuracy: ratio(tp + tn, n),
            precision,
            recall,
            f1,
            log_loss,
            roc_auc: roc_auc(probabilities, outcomes),
        })
    }
}

/// Area under the ROC curve via the rank-sum statistic, ties averaged.
#[must_use]
pub fn roc_auc(probabilities: &[f64], outcomes: &[bool]) -> Option<f64> {
    let positives = outcomes.iter().filter(|y| **y).count();
    let negatives = outcomes.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    let mut order: Vec<usize> = (0..probabilities.len()).collect();
    order.sort_by(|a, b| probabilities[*a].total_cmp(&probabilities[*b]));

    let mut rank_sum = 0.0;
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && probabilities[order[j + 1]] == probabilities[order[i]] {
            j += 1;
        }
        // Ranks are 1-based; tied run [i, j] shares the average rank.
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        rank_sum += order[i..=j]
            .iter()
            .filter(|idx| outcomes[**idx])
            .count() as f64
            * avg_rank;
        i = j + 1;
    }

    let pos = positives as f64;
    Some((rank_sum - pos * (pos + 1.0) / 2.0) / (pos * negatives as f64))
}

/// Per-outcome costs for batch policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeCosts {
    /// ACCEPT on a negative case.
    pub false_accept: f64,
    /// REJECT on a positive case.
    pub false_reject: f64,
    pub abstain: f64,
}

impl Default for OutcomeCosts {
    fn default() -> Self {
        Self {
            false_accept: 10.0,
            false_reject: 5.0,
            abstain: 2.0,
        }
    }
}

/// 3 verdicts x 2 labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionMatrix {
    pub accept_positive: usize,
    pub accept_negative: usize,
    pub reject_positive: usize,
    pub reject_negative: usize,
    pub abstain_positive: usize,
    pub abstain_negative: usize,
}

impl DecisionMatrix {
    pub fn record(&mut self, verdict: Verdict, positive: bool) {
        let cell = match (verdict, positive) {
            (Verdict::Accept, true) => &mut self.accept_positive,
            (Verdict::Accept, false) => &mut self.accept_negative,
            (Verdict::Reject, true) => &mut self.reject_positive,
            (Verdict::Reject, false) => &mut self.reject_negative,
            (Verdict::Abstain, true) => &mut self.abstain_positive,
            (Verdict::Abstain, false) => &mut self.abstain_negative,
        };
        *cell += 1;
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.covered() + self.abstained()
    }

    #[must_use]
    pub fn covered(&self) -> usize {
        self.accept_positive + self.accept_negative + self.reject_positive + self.reject_negative
    }

    #[must_use]
    pub fn abstained(&self) -> usize {
        self.abstain_positive + self.abstain_negative
    }
}

/// Outcome of running the policy over a labelled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyReport {
    pub matrix: DecisionMatrix,
    pub coverage: f64,
    pub abstention_rate: f64,
    /// Accuracy on non-abstained cases (ACCEPT = positive, REJECT = negative).
    pub accuracy_covered: f64,
    /// Share of positives among accepted cases.
    pub precision_covered: f64,
    pub total_cost: f64,
    pub avg_cost: f64,
}

impl PolicyReport {
    /// # Errors
    /// Fails on empty or mismatched input.
    pub fn compute(
        verdicts: &[Verdict],
        outcomes: &[bool],
        costs: &OutcomeCosts,
    ) -> Result<Self, MetricsError> {
        check_lengths(verdicts.len(), outcomes.len())?;

        let mut matrix = DecisionMatrix::default();
        for (v, y) in verdicts.iter().zip(outcomes) {
            matrix.record(*v, *y);
        }

        let n = matrix.total() as f64;
        let covered = matrix.covered();
        let accepted = matrix.accept_positive + matrix.accept_negative;
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        let total_cost = matrix.accept_negative as f64 * costs.false_accept
            + matrix.reject_positive as f64 * costs.false_reject
            + matrix.abstained() as f64 * costs.abstain;

        Ok(Self {
            matrix,
            coverage: covered as f64 / n,
            abstention_rate: matrix.abstained() as f64 / n,
            accuracy_covered: ratio(matrix.accept_positive + matrix.reject_negative, covered),
            precision_covered: ratio(matrix.accept_positive, accepted),
            total_cost,
            avg_cost: total_cost / n,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reliability_bins_and_ece() {
        let probs = [0.05, 0.15, 0.95, 1.0];
        let outcomes = [false, true, true, true];
        let report = reliability(&probs, &outcomes, 10).expect("report");

        assert_eq!(report.bins.len(), 10);
        assert_eq!(report.bins[0].count, 1);
        assert_eq!(report.bins[1].count, 1);
        // 1.0 lands in the closed last bin together with 0.95.
        assert_eq!(report.bins[9].count, 2);

        let expected_ece = 0.25 * 0.05 + 0.25 * 0.85 + 0.5 * (1.0 - 0.975);
        assert!((report.ece - expected_ece).abs() < 1e-12);
        assert!((report.mce - 0.85).abs() < 1e-12);
        let expected_brier = (0.05f64.powi(2) + 0.85f64.powi(2) + 0.05f64.powi(2) + 0.0) / 4.0;
        assert!((report.brier - expected_brier).abs() < 1e-12);
    }

    #[test]
    fn test_perfect_calibration_has_zero_ece() {
        let probs = [0.0, 0.0, 1.0, 1.0];
        let outcomes = [false, false, true, true];
        let report = reliability(&probs, &outcomes, DEFAULT_BINS).expect("report");
        assert_eq!(report.ece, 0.0);
        assert_eq!(report.brier, 0.0);
    }

    #[test]
    fn test_reliability_errors() {
        assert_eq!(reliability(&[], &[], 10), Err(MetricsError::Empty));
        assert_eq!(reliability(&[0.5], &[true], 0), Err(MetricsError::InvalidBins));
        assert_eq!(
            reliability(&[0.5, 1.5], &[true, false], 10),
            Err(MetricsError::InvalidProbability { index: 1 })
        );
        assert!(matches!(
            reliability(&[0.5], &[true, false], 10),
            Err(MetricsError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_classification_metrics() {
        let probs = [0.9, 0.8, 0.3, 0.6, 0.1];
        let outcomes = [true, true, true, false, false];
        let m = ClassificationMetrics::compute(&probs, &outcomes, 0.5).expect("metrics");

        assert!((m.accuracy - 0.6).abs() < 1e-12);
        assert!((m.precision - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.recall - 2.0 / 3.0).abs() < 1e-12);
        assert!((m.f1 - 2.0 / 3.0).abs() < 1e-12);
        // Positives 0.9, 0.8, 0.3 vs negatives 0.6, 0.1: 5 of 6 pairs ordered.
        assert!((m.roc_auc.expect("both classes") - 5.0 / 6.0).abs() < 1e-12);
        assert!(m.log_loss > 0.0);
    }

    #[test]
    fn test_auc_ties_and_single_class() {
        assert_eq!(roc_auc(&[0.5, 0.5], &[true, false]), Some(0.5));
        assert_eq!(roc_auc(&[0.2, 0.7], &[true, true]), None);
    }

    #[test]
    fn test_policy_report() {
        let verdicts = [
            Verdict::Accept,
            Verdict::Accept,
            Verdict::Reject,
            Verdict::Reject,
            Verdict::Abstain,
        ];
        let outcomes = [true, false, true, false, true];
        let report =
            PolicyReport::compute(&verdicts, &outcomes, &OutcomeCosts::default()).expect("report");

        assert_eq!(report.matrix.total(), 5);
        assert_eq!(report.matrix.accept_negative, 1);
        assert!((report.coverage - 0.8).abs() < 1e-12);
        assert!((report.abstention_rate - 0.2).abs() < 1e-12);
        assert!((report.accuracy_covered - 0.5).abs() < 1e-12);
        assert!((report.precision_covered - 0.5).abs() < 1e-12);
        // 10 (false accept) + 5 (false reject) + 2 (abstain)
        assert_eq!(report.total_cost, 17.0);
        assert!((report.avg_cost - 3.4).abs() < 1e-12);
    }
}
