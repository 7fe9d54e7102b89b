//! Feature transformation contract.
//!
//! `FeatureTransformer::fit` freezes every statistic the mapping needs into a
//! `TransformerState`. `TransformerState::transform` is the only code path that
//! turns a raw instance into a `FeatureVector`, at training export and at serve
//! time alike, so the two can never diverge.
//!
//! # Encoding
//!
//! - Numeric: missing values take the frozen fill statistic, then
//!   `(x - mean) / scale` where `scale` is the population standard deviation
//!   (1.0 when the training column had zero variance).
//! - Categorical: ordinal code in the sorted list of categories seen at fit;
//!   missing and unseen values both map to `UNKNOWN_CODE`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::instance::{FeatureVector, FieldValue, RawInstance};
use super::schema::{DomainSchema, FieldKind, Imputation, SchemaError};

/// Code emitted for missing or never-seen categorical values.
pub const UNKNOWN_CODE: f64 = -1.0;

const LAYOUT_DOMAIN: &str = "kairos-layout-v2\n";

/// Frozen per-feature parameters, in output order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeatureParams {
    Numeric {
        name: String,
        /// `None` for required fields: a missing value is rejected.
        fill: Option<f64>,
        mean: f64,
        scale: f64,
    },
    Categorical {
        name: String,
        /// Sorted; the index is the emitted code.
        categories: Vec<String>,
    },
}

impl FeatureParams {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Numeric { name, .. } | Self::Categorical { name, .. } => name,
        }
    }

    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Numeric { .. } => "numeric",
            Self::Categorical { .. } => "categorical",
        }
    }

    fn encode(&self, value: Option<&FieldValue>) -> Result<f64, SchemaError> {
        match self {
            Self::Numeric {
                name,
                fill,
                mean,
                scale,
            } => {
                let x = match read_numeric(name, value)? {
                    Some(x) => x,
                    None => fill.ok_or_else(|| SchemaError::MissingField {
                        field: name.clone(),
                    })?,
                };
                Ok((x - mean) / scale)
            }
            Self::Categorical { name, categories } => {
                let code = read_categorical(name, value)?
                    .and_then(|v| categories.binary_search_by(|c| c.as_str().cmp(v)).ok())
                    .map_or(UNKNOWN_CODE, |idx| idx as f64);
                Ok(code)
            }
        }
    }
}

fn read_numeric(field: &str, value: Option<&FieldValue>) -> Result<Option<f64>, SchemaError> {
    match value {
        None | Some(FieldValue::Missing) => Ok(None),
        Some(FieldValue::Number(v)) if v.is_finite() => Ok(Some(*v)),
        Some(FieldValue::Number(_)) => Err(SchemaError::NonFinite {
            field: field.to_string(),
        }),
        Some(other) => Err(SchemaError::WrongType {
            field: field.to_string(),
            expected: "number",
            found: other.type_name(),
        }),
    }
}

fn read_categorical<'a>(
    field: &str,
    value: Option<&'a FieldValue>,
) -> Result<Option<&'a str>, SchemaError> {
    match value {
        None | Some(FieldValue::Missing) => Ok(None),
        Some(FieldValue::Text(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(SchemaError::WrongType {
            field: field.to_string(),
            expected: "text",
            found: other.type_name(),
        }),
    }
}

/// SHA-256 over the ordered `(name, kind)` layout, lowercase hex.
///
/// Every string is length-prefixed, so no choice of field names can make two
/// different layouts hash the same input.
#[must_use]
pub fn layout_hash<'a>(layout: impl IntoIterator<Item = (&'a str, &'static str)>) -> String {
    fn put(hasher: &mut Sha256, part: &str) {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }

    let mut hasher = Sha256::new();
    hasher.update(LAYOUT_DOMAIN.as_bytes());
    for (name, kind) in layout {
        put(&mut hasher, name);
        put(&mut hasher, kind);
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Schema hash a transformer fitted on `schema` would carry.
#[must_use]
pub fn schema_hash(schema: &DomainSchema) -> String {
    layout_hash(
        schema
            .fields()
            .iter()
            .map(|f| (f.name.as_str(), f.kind.label())),
    )
}

/// Frozen transformation parameters. Immutable after fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformerState {
    features: Vec<FeatureParams>,
    schema_hash: String,
}

impl TransformerState {
    /// Map a raw instance to its feature vector.
    ///
    /// Fields not declared in the layout are ignored.
    ///
    /// # Errors
    /// Returns `SchemaError` naming the first malformed field, or a missing
    /// required field.
    pub fn transform(&self, raw: &RawInstance) -> Result<FeatureVector, SchemaError> {
        let values = self
            .features
            .iter()
            .map(|p| p.encode(raw.get(p.name())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FeatureVector::new(values))
    }

    #[must_use]
    pub fn features(&self) -> &[FeatureParams] {
        &self.features
    }

    /// Output width.
    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Recorded schema hash.
    #[must_use]
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    /// Hash recomputed from the stored layout.
    #[must_use]
    pub fn computed_schema_hash(&self) -> String {
        layout_hash(self.features.iter().map(|p| (p.name(), p.kind_label())))
    }

    /// Whether the recorded hash matches the stored layout.
    #[must_use]
    pub fn verify_schema_hash(&self) -> bool {
        self.computed_schema_hash() == self.schema_hash
    }
}

/// Fitter for `TransformerState`.
pub struct FeatureTransformer;

impl FeatureTransformer {
    /// Fit frozen parameters over a training set.
    ///
    /// # Errors
    /// - `SchemaError::EmptyTrainingSet` if `instances` is empty.
    /// - `SchemaError::NoObservations` when a median/mean field is never observed.
    /// - `SchemaError::MissingField` when a required field is absent in training.
    /// - Type errors as in `transform`.
    pub fn fit(
        schema: &DomainSchema,
        instances: &[RawInstance],
    ) -> Result<TransformerState, SchemaError> {
        if instances.is_empty() {
            return Err(SchemaError::EmptyTrainingSet);
        }

        let mut features = Vec::with_capacity(schema.len());
        for field in schema.fields() {
            let params = match field.kind {
                FieldKind::Numeric { imputation } => {
                    fit_numeric(&field.name, imputation, instances)?
                }
                FieldKind::Categorical => fit_categorical(&field.name, instances)?,
            };
            features.push(params);
        }

        let hash = schema_hash(schema);
        tracing::debug!(
            "Fitted transformer over {} instances ({} features, schema {})",
            instances.len(),
            features.len(),
            &hash[..12]
        );

        Ok(TransformerState {
            features,
            schema_hash: hash,
        })
    }
}

fn fit_numeric(
    name: &str,
    imputation: Imputation,
    instances: &[RawInstance],
) -> Result<FeatureParams, SchemaError> {
    let mut observed = Vec::with_capacity(instances.len());
    let mut missing = 0usize;
    for raw in instances {
        match read_numeric(name, raw.get(name))? {
            Some(v) => observed.push(v),
            None => missing += 1,
        }
    }

    let no_observations = |statistic| SchemaError::NoObservations {
        field: name.to_string(),
        statistic,
    };
    let fill = match imputation {
        Imputation::Median => Some(median(&observed).ok_or_else(|| no_observations("median"))?),
        Imputation::Mean => Some(mean(&observed).ok_or_else(|| no_observations("mean"))?),
        Imputation::Constant(c) if c.is_finite() => Some(c),
        Imputation::Constant(_) => {
            return Err(SchemaError::InvalidImputation {
                field: name.to_string(),
            })
        }
        Imputation::Required => {
            if missing > 0 {
                return Err(SchemaError::MissingField {
                    field: name.to_string(),
                });
            }
            None
        }
    };

    // Scaling statistics cover the imputed column.
    let mut column = observed;
    if let Some(fill) = fill {
        column.extend(std::iter::repeat(fill).take(missing));
    }
    let mu = mean(&column).unwrap_or(0.0);
    let var = column.iter().map(|x| (x - mu).powi(2)).sum::<f64>() / column.len() as f64;
    let std = var.sqrt();
    let scale = if std.is_finite() && std > 0.0 { std } else { 1.0 };

    Ok(FeatureParams::Numeric {
        name: name.to_string(),
        fill,
        mean: mu,
        scale,
    })
}

fn fit_categorical(name: &str, instances: &[RawInstance]) -> Result<FeatureParams, SchemaError> {
    let mut seen = BTreeSet::new();
    for raw in instances {
        if let Some(v) = read_categorical(name, raw.get(name))? {
            seen.insert(v.to_string());
        }
    }
    Ok(FeatureParams::Categorical {
        name: name.to_string(),
        categories: seen.into_iter().collect(),
    })
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
