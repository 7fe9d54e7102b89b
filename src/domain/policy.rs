//! Policy decision engine.
//!
//! Pure mapping from a calibrated probability (and optional ensemble
//! disagreement) to a tri-state verdict, an entropy-based uncertainty and a
//! cost-risk index. Thresholds are configuration: swapping them changes only the
//! final comparison, never the probability.
//!
//! Bands are half-open:
//!
//! ```text
//! [0, tau_low)        REJECT
//! [tau_low, tau_high) ABSTAIN
//! [tau_high, 1]       ACCEPT
//! ```

use std::f64::consts::LN_2;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Policy configuration and contract failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy contract violation: {0}")]
    ContractViolation(String),

    #[error("Invalid thresholds: require 0 <= tau_low < tau_high <= 1 (got {tau_low}, {tau_high})")]
    InvalidThresholds { tau_low: f64, tau_high: f64 },

    #[error("Invalid cost parameter '{name}': {value}")]
    InvalidCostParameter { name: &'static str, value: f64 },
}

/// Tri-state business verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accept,
    Reject,
    Abstain,
}

impl Verdict {
    #[must_use]
    pub fn is_covered(self) -> bool {
        !matches!(self, Self::Abstain)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => write!(f, "ACCEPT"),
            Self::Reject => write!(f, "REJECT"),
            Self::Abstain => write!(f, "ABSTAIN"),
        }
    }
}

/// Validated `tau_low < tau_high` pair in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdsRepr")]
pub struct PolicyThresholds {
    tau_low: f64,
    tau_high: f64,
}

#[derive(Deserialize)]
struct ThresholdsRepr {
    tau_low: f64,
    tau_high: f64,
}

impl TryFrom<ThresholdsRepr> for PolicyThresholds {
    type Error = PolicyError;

    fn try_from(r: ThresholdsRepr) -> Result<Self, Self::Error> {
        Self::new(r.tau_low, r.tau_high)
    }
}

impl PolicyThresholds {
    /// # Errors
    /// `PolicyError::InvalidThresholds` unless `0 <= tau_low < tau_high <= 1`.
    pub fn new(tau_low: f64, tau_high: f64) -> Result<Self, PolicyError> {
        let valid = tau_low.is_finite()
            && tau_high.is_finite()
            && (0.0..=1.0).contains(&tau_low)
            && (0.0..=1.0).contains(&tau_high)
            && tau_low < tau_high;
        if !valid {
            return Err(PolicyError::InvalidThresholds { tau_low, tau_high });
        }
        Ok(Self { tau_low, tau_high })
    }

    #[must_use]
    pub fn tau_low(&self) -> f64 {
        self.tau_low
    }

    #[must_use]
    pub fn tau_high(&self) -> f64 {
        self.tau_high
    }

    /// Verdict for an already validated probability.
    #[must_use]
    pub fn classify(&self, probability: f64) -> Verdict {
        if probability < self.tau_low {
            Verdict::Reject
        } else if probability >= self.tau_high {
            Verdict::Accept
        } else {
            Verdict::Abstain
        }
    }
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            tau_low: 0.2,
            tau_high: 0.8,
        }
    }
}

/// Cost-risk index attached to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CostIndex {
    /// `intercept + a*p + b*(H/ln 2) + c*disagreement`.
    Linear {
        intercept: f64,
        probability_weight: f64,
        uncertainty_weight: f64,
        disagreement_weight: f64,
    },
    /// Expected cost of the chosen verdict.
    ExpectedLoss {
        false_accept: f64,
        false_reject: f64,
        abstain: f64,
    },
}

impl Default for CostIndex {
    fn default() -> Self {
        Self::Linear {
            intercept: 0.0,
            probability_weight: 0.0,
            uncertainty_weight: 100.0,
            disagreement_weight: 0.0,
        }
    }
}

impl CostIndex {
    /// # Errors
    /// `PolicyError::InvalidCostParameter` for non-finite parameters or
    /// negative expected-loss costs.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let check = |name: &'static str, value: f64, non_negative: bool| {
            if !value.is_finite() || (non_negative && value < 0.0) {
                Err(PolicyError::InvalidCostParameter { name, value })
            } else {
                Ok(())
            }
        };
        match *self {
            Self::Linear {
                intercept,
                probability_weight,
                uncertainty_weight,
                disagreement_weight,
            } => {
                check("intercept", intercept, false)?;
                check("probability_weight", probability_weight, false)?;
                check("uncertainty_weight", uncertainty_weight, false)?;
                check("disagreement_weight", disagreement_weight, false)
            }
            Self::ExpectedLoss {
                false_accept,
                false_reject,
                abstain,
            } => {
                check("false_accept", false_accept, true)?;
                check("false_reject", false_reject, true)?;
                check("abstain", abstain, true)
            }
        }
    }

    fn evaluate(&self, verdict: Verdict, probability: f64, entropy: f64, disagreement: f64) -> f64 {
        match *self {
            Self::Linear {
                intercept,
                probability_weight,
                uncertainty_weight,
                disagreement_weight,
            } => {
                intercept
                    + probability_weight * probability
                    + uncertainty_weight * (entropy / LN_2)
                    + disagreement_weight * disagreement
            }
            Self::ExpectedLoss {
                false_accept,
                false_reject,
                abstain,
            } => match verdict {
                Verdict::Accept => (1.0 - probability) * false_accept,
                Verdict::Reject => probability * false_reject,
                Verdict::Abstain => abstain,
            },
        }
    }
}

/// Binary entropy in nats, `H(0) = H(1) = 0`.
#[must_use]
pub fn binary_entropy(p: f64) -> f64 {
    let term = |x: f64| if x > 0.0 { -x * x.ln() } else { 0.0 };
    term(p) + term(1.0 - p)
}

/// Output of a single policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PolicyOutcome {
    pub verdict: Verdict,
    /// Binary entropy of the probability, natural log.
    pub uncertainty: f64,
    pub cost_risk: f64,
}

/// Thresholds plus cost model.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct PolicyEngine {
    thresholds: PolicyThresholds,
    cost: CostIndex,
}

impl PolicyEngine {
    /// # Errors
    /// Fails when the cost model carries invalid parameters.
    pub fn new(thresholds: PolicyThresholds, cost: CostIndex) -> Result<Self, PolicyError> {
        cost.validate()?;
        Ok(Self { thresholds, cost })
    }

    #[must_use]
    pub fn thresholds(&self) -> PolicyThresholds {
        self.thresholds
    }

    #[must_use]
    pub fn cost(&self) -> CostIndex {
        self.cost
    }

    /// Same cost model, new thresholds.
    #[must_use]
    pub fn with_thresholds(&self, thresholds: PolicyThresholds) -> Self {
        Self {
            thresholds,
            cost: self.cost,
        }
    }

    /// Decide on a calibrated probability.
    ///
    /// # Errors
    /// `PolicyError::ContractViolation` when `probability` is NaN or outside
    /// `[0, 1]`, or `disagreement` is negative or non-finite.
    pub fn decide(
        &self,
        probability: f64,
        disagreement: Option<f64>,
    ) -> Result<PolicyOutcome, PolicyError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(PolicyError::ContractViolation(format!(
                "probability {probability} outside [0, 1]"
            )));
        }
        let disagreement = disagreement.unwrap_or(0.0);
        if !disagreement.is_finite() || disagreement < 0.0 {
            return Err(PolicyError::ContractViolation(format!(
                "disagreement {disagreement} must be finite and non-negative"
            )));
        }

        let verdict = self.thresholds.classify(probability);
        let uncertainty = binary_entropy(probability);
        let cost_risk = self
            .cost
            .evaluate(verdict, probability, uncertainty, disagreement);

        Ok(PolicyOutcome {
            verdict,
            uncertainty,
            cost_risk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PolicyEngine {
        PolicyEngine::new(
            PolicyThresholds::new(0.2, 0.8).expect("valid"),
            CostIndex::default(),
        )
        .expect("valid engine")
    }

    #[test]
    fn test_boundaries_are_half_open() {
        let e = engine();
        let eps = 1e-9;
        let verdict = |p| e.decide(p, None).expect("valid").verdict;

        assert_eq!(verdict(0.2 - eps), Verdict::Reject);
        assert_eq!(verdict(0.2), Verdict::Abstain);
        assert_eq!(verdict(0.5), Verdict::Abstain);
        assert_eq!(verdict(0.8 - eps), Verdict::Abstain);
        assert_eq!(verdict(0.8), Verdict::Accept);
        assert_eq!(verdict(0.8 + eps), Verdict::Accept);
        assert_eq!(verdict(0.0), Verdict::Reject);
        assert_eq!(verdict(1.0), Verdict::Accept);
    }

    #[test]
    fn test_entropy() {
        assert_eq!(binary_entropy(0.0), 0.0);
        assert_eq!(binary_entropy(1.0), 0.0);
        assert!((binary_entropy(0.5) - LN_2).abs() < 1e-15);
        let p: f64 = 0.3;
        let expected = -p * p.ln() - (1.0 - p) * (1.0 - p).ln();
        assert_eq!(binary_entropy(p), expected);
    }

    #[test]
    fn test_default_cost_is_scaled_uncertainty() {
        let outcome = engine().decide(0.5, None).expect("valid");
        assert!((outcome.cost_risk - 100.0).abs() < 1e-9);
        let outcome = engine().decide(1.0, Some(0.0)).expect("valid");
        assert_eq!(outcome.cost_risk, 0.0);
    }

    #[test]
    fn test_expected_loss_cost() {
        let e = PolicyEngine::new(
            PolicyThresholds::default(),
            CostIndex::ExpectedLoss {
                false_accept: 10.0,
                false_reject: 5.0,
                abstain: 2.0,
            },
        )
        .expect("valid");

        assert_eq!(e.decide(0.9, None).expect("ok").cost_risk, (1.0 - 0.9) * 10.0);
        assert_eq!(e.decide(0.1, None).expect("ok").cost_risk, 0.1 * 5.0);
        assert_eq!(e.decide(0.5, None).expect("ok").cost_risk, 2.0);
    }

    #[test]
    fn test_contract_violations() {
        let e = engine();
        assert!(matches!(e.decide(f64::NAN, None), Err(PolicyError::ContractViolation(_))));
        assert!(matches!(e.decide(1.01, None), Err(PolicyError::ContractViolation(_))));
        assert!(matches!(e.decide(-0.01, None), Err(PolicyError::ContractViolation(_))));
        assert!(matches!(e.decide(0.5, Some(-1.0)), Err(PolicyError::ContractViolation(_))));
        assert!(matches!(
            e.decide(0.5, Some(f64::INFINITY)),
            Err(PolicyError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_threshold_validation() {
        assert!(PolicyThresholds::new(0.8, 0.2).is_err());
        assert!(PolicyThresholds::new(0.5, 0.5).is_err());
        assert!(PolicyThresholds::new(-0.1, 0.5).is_err());
        assert!(PolicyThresholds::new(0.1, 1.5).is_err());
        assert!(PolicyThresholds::new(0.0, 1.0).is_ok());
        let inverted = r#"{"tau_low":0.9,"tau_high":0.1}"#;
        assert!(serde_json::from_str::<PolicyThresholds>(inverted).is_err());
    }

    #[test]
    fn test_swapping_thresholds_keeps_cost_model() {
        let e = engine().with_thresholds(PolicyThresholds::new(0.4, 0.6).expect("valid"));
        assert_eq!(e.decide(0.3, None).expect("ok").verdict, Verdict::Reject);
        assert_eq!(e.cost(), CostIndex::default());
    }

    #[test]
    fn test_verdict_wire_format() {
        assert_eq!(serde_json::to_string(&Verdict::Abstain).expect("ser"), "\"ABSTAIN\"");
        assert_eq!(Verdict::Accept.to_string(), "ACCEPT");
    }

    #[test]
    fn test_invalid_cost_rejected() {
        let err = PolicyEngine::new(
            PolicyThresholds::default(),
            CostIndex::ExpectedLoss {
                false_accept: -1.0,
                false_reject: 5.0,
                abstain: 2.0,
            },
        )
        .expect_err("negative cost");
        assert_eq!(
            err,
            PolicyError::InvalidCostParameter {
                name: "false_accept",
                value: -1.0
            }
        );
    }
}
