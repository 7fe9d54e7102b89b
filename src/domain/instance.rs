//! Raw input instances and transformed feature vectors.
//!
//! A `RawInstance` is whatever the serving layer decoded from the wire: a bag of
//! named, loosely typed values. A `FeatureVector` is the fixed-length numeric
//! representation the ensemble consumes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single raw input value.
///
/// Serialized untagged so that plain JSON objects (`{"age": 39, "sex": "Male",
/// "occupation": null}`) decode directly. Booleans, arrays and objects decode
/// into `Other` and are rejected by the transformer with the field named.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Numeric value
    Number(f64),
    /// Categorical / free-text value
    Text(String),
    /// Explicitly absent value (`null`)
    Missing,
    /// Any other JSON value; never valid for a declared field
    Other(serde_json::Value),
}

impl FieldValue {
    /// Short type name used in validation errors.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Number(_) => "number",
            Self::Text(_) => "text",
            Self::Missing => "missing",
            Self::Other(serde_json::Value::Bool(_)) => "boolean",
            Self::Other(serde_json::Value::Array(_)) => "array",
            Self::Other(serde_json::Value::Object(_)) => "object",
            Self::Other(_) => "unsupported",
        }
    }

    #[must_use]
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Raw instance as received from the serving layer.
///
/// Fields not declared by the domain schema are ignored by the transformer.
/// A field that is absent from the map is treated exactly like `FieldValue::Missing`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawInstance {
    fields: BTreeMap<String, FieldValue>,
}

impl RawInstance {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Builder-style explicit missing value.
    #[must_use]
    pub fn with_missing(mut self, name: impl Into<String>) -> Self {
        self.fields.insert(name.into(), FieldValue::Missing);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Look up a field; `None` when absent.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Whether the field is absent or explicitly missing.
    #[must_use]
    pub fn is_missing(&self, name: &str) -> bool {
        self.get(name).map_or(true, FieldValue::is_missing)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
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

impl FromIterator<(String, FieldValue)> for RawInstance {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Ordered, fixed-length numeric feature vector.
///
/// Length and order are defined by the `TransformerState` that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f64>);

impl FeatureVector {
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}
