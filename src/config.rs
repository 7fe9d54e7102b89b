//! Service configuration.
//!
//! Everything is read from `KAIROS_*` environment variables, optionally layered
//! over a JSON policy file. Values are validated here: a malformed threshold,
//! cost parameter or weight override is a startup error, never a silent
//! fallback to the default.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `KAIROS_BUNDLE_DIR` | bundle directory (default `bundle`) |
//! | `KAIROS_POLICY_FILE` | JSON `PolicyConfig`, applied before the variables below |
//! | `KAIROS_TAU_LOW`, `KAIROS_TAU_HIGH` | policy thresholds |
//! | `KAIROS_COST_MODEL` | `linear` or `expected_loss` |
//! | `KAIROS_COST_*` | parameters of the selected cost model |
//! | `KAIROS_WEIGHT_OVERRIDES` | `artifact=weight,artifact=weight` |
//! | `KAIROS_REVIEW_DB` | SQLite review queue path; unset disables the queue |
//! | `KAIROS_LOG_MODE` | `stderr` (default) or `file` |
//! | `KAIROS_LOG_FILE` | log path in file mode |

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::{CostIndex, OutcomeCosts, PolicyEngine, PolicyError, PolicyThresholds};

pub const BUNDLE_DIR_ENV: &str = "KAIROS_BUNDLE_DIR";
pub const POLICY_FILE_ENV: &str = "KAIROS_POLICY_FILE";
pub const TAU_LOW_ENV: &str = "KAIROS_TAU_LOW";
pub const TAU_HIGH_ENV: &str = "KAIROS_TAU_HIGH";
pub const COST_MODEL_ENV: &str = "KAIROS_COST_MODEL";
pub const WEIGHT_OVERRIDES_ENV: &str = "KAIROS_WEIGHT_OVERRIDES";
pub const REVIEW_DB_ENV: &str = "KAIROS_REVIEW_DB";
pub const LOG_MODE_ENV: &str = "KAIROS_LOG_MODE";
pub const LOG_FILE_ENV: &str = "KAIROS_LOG_FILE";

const DEFAULT_BUNDLE_DIR: &str = "bundle";
const DEFAULT_LOG_FILE: &str = "kairos.log";

const LINEAR_PARAMS: [&str; 4] = [
    "KAIROS_COST_INTERCEPT",
    "KAIROS_COST_PROBABILITY_WEIGHT",
    "KAIROS_COST_UNCERTAINTY_WEIGHT",
    "KAIROS_COST_DISAGREEMENT_WEIGHT",
];
const EXPECTED_LOSS_PARAMS: [&str; 3] = [
    "KAIROS_COST_FALSE_ACCEPT",
    "KAIROS_COST_FALSE_REJECT",
    "KAIROS_COST_ABSTAIN",
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {var}: '{value}' ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{var} does not apply to the '{model}' cost model")]
    CostParameterMismatch { var: &'static str, model: &'static str },

    #[error("Failed to read policy file {path:?}: {source}")]
    PolicyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid policy file {path:?}: {source}")]
    PolicyJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl ConfigError {
    fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            var,
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Reloadable decision policy: thresholds, cost model and weight overrides.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub thresholds: PolicyThresholds,
    #[serde(default)]
    pub cost: CostIndex,
    /// Artifact id -> replacement ensemble weight.
    #[serde(default)]
    pub weight_overrides: BTreeMap<String, f64>,
}

impl PolicyConfig {
    /// Policy part of the process environment, for reloads that keep the bundle.
    ///
    /// # Errors
    /// Any malformed variable or policy file.
    pub fn from_env() -> Result<Self, ConfigError> {
        policy_from_lookup(&|key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    }

    /// Read a JSON policy file.
    ///
    /// # Errors
    /// I/O, JSON and validation failures.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::PolicyFile {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::PolicyJson {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Invalid cost parameters or non-positive weight overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cost.validate()?;
        for (id, weight) in &self.weight_overrides {
            if !weight.is_finite() || *weight <= 0.0 {
                return Err(ConfigError::invalid(
                    WEIGHT_OVERRIDES_ENV,
                    &format!("{id}={weight}"),
                    "weights must be finite and positive",
                ));
            }
        }
        Ok(())
    }

    /// Policy engine for these thresholds and costs.
    ///
    /// # Errors
    /// Invalid cost parameters.
    pub fn engine(&self) -> Result<PolicyEngine, PolicyError> {
        PolicyEngine::new(self.thresholds, self.cost)
    }
}

/// Where the binaries send their logs. Stdout is reserved for JSON output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogMode {
    #[default]
    Stderr,
    File,
}

impl std::str::FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            other => Err(format!("unknown log mode '{other}'")),
        }
    }
}

/// Complete configuration of a decision service process.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub bundle_dir: PathBuf,
    pub policy: PolicyConfig,
    pub review_db: Option<PathBuf>,
    pub log_mode: LogMode,
    pub log_file: PathBuf,
}

impl ServiceConfig {
    /// Load from the process environment.
    ///
    /// # Errors
    /// Any malformed variable or policy file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    ///
    /// # Errors
    /// Any malformed variable or policy file.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bundle_dir =
            get(BUNDLE_DIR_ENV).map_or_else(|| PathBuf::from(DEFAULT_BUNDLE_DIR), PathBuf::from);
        let policy = policy_from_lookup(&get)?;
        let review_db = get(REVIEW_DB_ENV).map(PathBuf::from);
        let log_mode = match get(LOG_MODE_ENV) {
            Some(v) => v
                .parse()
                .map_err(|reason: String| ConfigError::invalid(LOG_MODE_ENV, &v, reason))?,
            None => LogMode::default(),
        };
        let log_file =
            get(LOG_FILE_ENV).map_or_else(|| PathBuf::from(DEFAULT_LOG_FILE), PathBuf::from);

        Ok(Self {
            bundle_dir,
            policy,
            review_db,
            log_mode,
            log_file,
        })
    }
}

/// Policy from `KAIROS_POLICY_FILE` (if set) overlaid with the threshold,
/// cost and weight variables.
///
/// # Errors
/// Any malformed variable or policy file.
pub fn policy_from_lookup<F>(get: &F) -> Result<PolicyConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut policy = match get(POLICY_FILE_ENV) {
        Some(path) => PolicyConfig::load(Path::new(&path))?,
        None => PolicyConfig::default(),
    };

    let tau_low = get(TAU_LOW_ENV)
        .map(|v| parse_f64(TAU_LOW_ENV, &v))
        .transpose()?;
    let tau_high = get(TAU_HIGH_ENV)
        .map(|v| parse_f64(TAU_HIGH_ENV, &v))
        .transpose()?;
    if tau_low.is_some() || tau_high.is_some() {
        policy.thresholds = PolicyThresholds::new(
            tau_low.unwrap_or(policy.thresholds.tau_low()),
            tau_high.unwrap_or(policy.thresholds.tau_high()),
        )?;
    }

    policy.cost = cost_from_lookup(get, policy.cost)?;

    if let Some(spec) = get(WEIGHT_OVERRIDES_ENV) {
        policy.weight_overrides.extend(parse_weight_overrides(&spec)?);
    }

    policy.validate()?;
    Ok(policy)
}

fn cost_from_lookup<F>(get: &F, base: CostIndex) -> Result<CostIndex, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut cost = match get(COST_MODEL_ENV).as_deref() {
        None => base,
        Some("linear") => match base {
            CostIndex::Linear { .. } => base,
            CostIndex::ExpectedLoss { .. } => CostIndex::default(),
        },
        Some("expected_loss") => match base {
            CostIndex::ExpectedLoss { .. } => base,
            CostIndex::Linear { .. } => {
                let costs = OutcomeCosts::default();
                CostIndex::ExpectedLoss {
                    false_accept: costs.false_accept,
                    false_reject: costs.false_reject,
                    abstain: costs.abstain,
                }
            }
        },
        Some(other) => {
            return Err(ConfigError::invalid(
                COST_MODEL_ENV,
                other,
                "expected 'linear' or 'expected_loss'",
            ))
        }
    };

    let read = |var: &'static str| get(var).map(|v| parse_f64(var, &v)).transpose();

    match &mut cost {
        CostIndex::Linear {
            intercept,
            probability_weight,
            uncertainty_weight,
            disagreement_weight,
        } => {
            if let Some(var) = EXPECTED_LOSS_PARAMS.iter().copied().find(|v| get(v).is_some()) {
                return Err(ConfigError::CostParameterMismatch { var, model: "linear" });
            }
            let slots = [intercept, probability_weight, uncertainty_weight, disagreement_weight];
            for (var, slot) in LINEAR_PARAMS.into_iter().zip(slots) {
                if let Some(v) = read(var)? {
                    *slot = v;
                }
            }
        }
        CostIndex::ExpectedLoss {
            false_accept,
            false_reject,
            abstain,
        } => {
            if let Some(var) = LINEAR_PARAMS.iter().copied().find(|v| get(v).is_some()) {
                return Err(ConfigError::CostParameterMismatch {
                    var,
                    model: "expected_loss",
                });
            }
            let slots = [false_accept, false_reject, abstain];
            for (var, slot) in EXPECTED_LOSS_PARAMS.into_iter().zip(slots) {
                if let Some(v) = read(var)? {
                    *slot = v;
                }
            }
        }
    }

    cost.validate()?;
    Ok(cost)
}

fn parse_f64(var: &'static str, value: &str) -> Result<f64, ConfigError> {
    let parsed: f64 = value
        .parse()
        .map_err(|_| ConfigError::invalid(var, value, "not a number"))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(ConfigError::invalid(var, value, "must be finite"))
    }
}

/// Parse `id=weight,id=weight`.
///
/// # Errors
/// `ConfigError::Invalid` on a malformed pair, a duplicate id or a weight
/// that is not finite and positive.
pub fn parse_weight_overrides(spec: &str) -> Result<BTreeMap<String, f64>, ConfigError> {
    let mut overrides = BTreeMap::new();
    for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (id, weight) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::invalid(WEIGHT_OVERRIDES_ENV, pair, "expected id=weight"))?;
        let id = id.trim();
        if id.is_empty() {
            return Err(ConfigError::invalid(WEIGHT_OVERRIDES_ENV, pair, "empty artifact id"));
        }
        let weight = parse_f64(WEIGHT_OVERRIDES_ENV, weight.trim())?;
        if weight <= 0.0 {
            return Err(ConfigError::invalid(
                WEIGHT_OVERRIDES_ENV,
                pair,
                "weights must be positive",
            ));
        }
        if overrides.insert(id.to_string(), weight).is_some() {
            return Err(ConfigError::invalid(WEIGHT_OVERRIDES_ENV, pair, "duplicate artifact id"));
        }
    }
    Ok(overrides)
}
