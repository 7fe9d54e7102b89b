//! Declared input schemas and per-domain profiles.
//!
//! The transformer itself is schema-agnostic: it operates over whatever ordered
//! field list it is fitted with. Domain knowledge (which fields exist, which
//! derived features are computed) lives behind the `DomainProfile` trait, one
//! implementation per decisioning domain, selected by an explicit `DomainTag`.

use std::collections::BTreeSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::instance::RawInstance;
use super::profiles::{BankingProfile, CensusProfile};

/// Errors raised while validating raw input against a schema.
///
/// These are caller-visible: the serving layer reports them back with the
/// offending field name.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    #[error("Field '{field}' has wrong type: expected {expected}, got {found}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("Field '{field}' is not a finite number")]
    NonFinite { field: String },

    #[error("Field '{field}' has no observed values to compute the {statistic}")]
    NoObservations {
        field: String,
        statistic: &'static str,
    },

    #[error("Constant imputation value for '{field}' is not finite")]
    InvalidImputation { field: String },

    #[error("Duplicate field '{0}' in schema")]
    DuplicateField(String),

    #[error("Schema declares no fields")]
    EmptySchema,

    #[error("Cannot fit a transformer on an empty training set")]
    EmptyTrainingSet,
}

impl SchemaError {
    /// Name of the offending field, when the error concerns one.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::MissingField { field }
            | Self::WrongType { field, .. }
            | Self::NonFinite { field }
            | Self::NoObservations { field, .. }
            | Self::InvalidImputation { field } => Some(field),
            Self::DuplicateField(field) => Some(field),
            Self::EmptySchema | Self::EmptyTrainingSet => None,
        }
    }
}

/// How a missing numeric value is filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "value", rename_all = "snake_case")]
pub enum Imputation {
    /// Median of the observed training values.
    Median,
    /// Mean of the observed training values.
    Mean,
    /// Fixed value.
    Constant(f64),
    /// No imputation rule: a missing value is a schema violation.
    Required,
}

/// Kind of a declared input field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Numeric { imputation: Imputation },
    Categorical,
}

impl FieldKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Numeric { .. } => "numeric",
            Self::Categorical => "categorical",
        }
    }
}

/// A single declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Numeric field imputed with the training median.
    #[must_use]
    pub fn numeric(name: impl Into<String>) -> Self {
        Self::numeric_with(name, Imputation::Median)
    }

    #[must_use]
    pub fn numeric_with(name: impl Into<String>, imputation: Imputation) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Numeric { imputation },
        }
    }

    #[must_use]
    pub fn categorical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Categorical,
        }
    }
}

/// Ordered set of declared fields for one decisioning domain.
///
/// Declaration order is the output order of the feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSchema {
    fields: Vec<FieldSpec>,
}

impl DomainSchema {
    /// Build a schema, rejecting empty and duplicate declarations.
    ///
    /// # Errors
    /// Returns `SchemaError::EmptySchema` or `SchemaError::DuplicateField`.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::EmptySchema);
        }
        let mut seen = BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField(field.name.clone()));
            }
        }
        Ok(Self { fields })
    }

    /// Built-in profile schemas; their field lists are constants checked by tests.
    pub(crate) fn from_static(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Explicit domain selector carried by bundles and requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainTag {
    /// UCI Adult style demographic attributes.
    Census,
    /// Home Credit style financial-ratio attributes.
    Banking,
}

impl DomainTag {
    /// The profile implementing this domain.
    #[must_use]
    pub fn profile(self) -> &'static dyn DomainProfile {
        static CENSUS: CensusProfile = CensusProfile;
        static BANKING: BankingProfile = BankingProfile;
        match self {
            Self::Census => &CENSUS,
            Self::Banking => &BANKING,
        }
    }
}

impl std::fmt::Display for DomainTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Census => write!(f, "census"),
            Self::Banking => write!(f, "banking"),
        }
    }
}

impl FromStr for DomainTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "census" | "adult" => Ok(Self::Census),
            "banking" | "home_credit" => Ok(Self::Banking),
            other => Err(format!("Unknown domain '{other}' (expected census or banking)")),
        }
    }
}

/// Capability interface: "transformable to a feature vector".
///
/// A profile declares the domain's input schema (raw plus engineered fields)
/// and derives engineered fields deterministically from a raw instance. The
/// output of `engineer` is what the frozen transformer consumes, both at fit
/// time and at serve time.
pub trait DomainProfile: Send + Sync {
    fn tag(&self) -> DomainTag;

    /// Declared schema, in feature-vector order.
    fn schema(&self) -> DomainSchema;

    /// Add engineered fields to a copy of `raw`.
    ///
    /// # Errors
    /// Returns `SchemaError::WrongType` / `SchemaError::NonFinite` when an input
    /// used by a derivation is malformed.
    fn engineer(&self, raw: &RawInstance) -> Result<RawInstance, SchemaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_rejects_duplicates() {
        let err = DomainSchema::new(vec![FieldSpec::numeric("a"), FieldSpec::categorical("a")])
            .expect_err("duplicate must fail");
        assert_eq!(err, SchemaError::DuplicateField("a".into()));
        assert_eq!(err.field(), Some("a"));
    }

    #[test]
    fn test_schema_rejects_empty() {
        assert_eq!(DomainSchema::new(vec![]), Err(SchemaError::EmptySchema));
    }

    #[test]
    fn test_domain_tag_parsing() {
        assert_eq!("census".parse::<DomainTag>(), Ok(DomainTag::Census));
        assert_eq!("Home_Credit".parse::<DomainTag>(), Ok(DomainTag::Banking));
        assert!("fraud".parse::<DomainTag>().is_err());
        assert_eq!(DomainTag::Banking.profile().tag(), DomainTag::Banking);
    }

    #[test]
    fn test_field_kind_serde() {
        let spec = FieldSpec::numeric_with("x", Imputation::Constant(1.5));
        let json = serde_json::to_string(&spec).expect("serialize");
        let back: FieldSpec = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, spec);
    }
}
