//! Decisions and review cases.

use serde::{Deserialize, Serialize};

use super::instance::RawInstance;
use super::policy::Verdict;

/// Result of one pass through the decision pipeline.
///
/// Fully determined by the input instance, the model snapshot and the policy
/// configuration: it carries no id or timestamp of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    /// Calibrated probability of the positive class.
    pub probability: f64,
    /// Uncalibrated ensemble consensus.
    pub raw_score: f64,
    /// Binary entropy of `probability`, natural log.
    pub uncertainty: f64,
    /// Weighted standard deviation across ensemble members.
    pub disagreement: f64,
    pub cost_risk: f64,
    /// Version of the model bundle that produced this decision.
    pub bundle_version: String,
}

impl Decision {
    #[must_use]
    pub fn needs_review(&self) -> bool {
        self.verdict == Verdict::Abstain
    }
}

/// Abstained case routed to human review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCase {
    /// Unique identifier (UUID v4)
    pub id: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub bundle_version: String,
    /// Instance exactly as received, before engineering.
    pub instance: RawInstance,
    pub probability: f64,
    pub uncertainty: f64,
}

impl ReviewCase {
    #[must_use]
    pub fn new(decision: &Decision, instance: RawInstance) -> Self {
        Self {
            id: uuid_v4(),
            created_at: chrono::Utc::now(),
            bundle_version: decision.bundle_version.clone(),
            instance,
            probability: decision.probability,
            uncertainty: decision.uncertainty,
        }
    }
}

/// Random UUID v4 from a CSPRNG.
fn uuid_v4() -> String {
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let mut bytes: [u8; 16] = rng.gen();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;

    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
