//! Built-in domain profiles.
//!
//! Each profile reproduces the feature engineering applied before the frozen
//! transformer, so training export and serving derive identical columns.

use super::instance::{FieldValue, RawInstance};
use super::schema::{DomainProfile, DomainSchema, DomainTag, FieldSpec, SchemaError};

/// Read an optional finite number from `raw`.
///
/// Absent and `null` values are `Ok(None)`; text and non-finite numbers are errors.
fn number(raw: &RawInstance, field: &str) -> Result<Option<f64>, SchemaError> {
    match raw.get(field) {
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

/// Store an engineered value. Non-finite results (division by zero) become 0.
fn put(out: &mut RawInstance, field: &str, value: Option<f64>) {
    let value = match value {
        Some(v) if v.is_finite() => FieldValue::Number(v),
        Some(_) => FieldValue::Number(0.0),
        None => FieldValue::Missing,
    };
    out.insert(field, value);
}

fn both(a: Option<f64>, b: Option<f64>, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    Some(f(a?, b?))
}

// ─── Census (UCI Adult) ─────────────────────────────────────────────────────

const CENSUS_NUMERIC: [&str; 5] = [
    "age",
    "education_num",
    "capital_gain",
    "capital_loss",
    "hours_per_week",
];

const CENSUS_ENGINEERED: [&str; 6] = [
    "capital_net",
    "age_bin",
    "hours_per_edu",
    "hrs_edu",
    "age_edu",
    "cap_gain_tax",
];

const CENSUS_CATEGORICAL: [&str; 7] = [
    "workclass",
    "marital_status",
    "occupation",
    "relationship",
    "race",
    "sex",
    "native_country",
];

const AGE_BIN_EDGES: [f64; 9] = [0.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 100.0];

/// Index of the right-closed age bin containing `age`.
///
/// The first bin also includes its lower edge; ages outside `[0, 100]` fall
/// into bin 0.
#[must_use]
pub fn age_bin(age: f64) -> f64 {
    if age == AGE_BIN_EDGES[0] {
        return 0.0;
    }
    AGE_BIN_EDGES
        .windows(2)
        .position(|edge| age > edge[0] && age <= edge[1])
        .map_or(0.0, |idx| idx as f64)
}

/// UCI Adult style demographic profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct CensusProfile;

impl DomainProfile for CensusProfile {
    fn tag(&self) -> DomainTag {
        DomainTag::Census
    }

    fn schema(&self) -> DomainSchema {
        let fields = CENSUS_NUMERIC
            .iter()
            .chain(CENSUS_ENGINEERED.iter())
            .map(|name| FieldSpec::numeric(*name))
            .chain(CENSUS_CATEGORICAL.iter().map(|name| FieldSpec::categorical(*name)))
            .collect();
        DomainSchema::from_static(fields)
    }

    fn engineer(&self, raw: &RawInstance) -> Result<RawInstance, SchemaError> {
        let age = number(raw, "age")?;
        let edu = number(raw, "education_num")?;
        let gain = number(raw, "capital_gain")?;
        let loss = number(raw, "capital_loss")?;
        let hours = number(raw, "hours_per_week")?;

        let mut out = raw.clone();
        put(&mut out, "capital_net", both(gain, loss, |g, l| g - l));
        put(&mut out, "age_bin", age.map(age_bin));
        put(&mut out, "hours_per_edu", both(hours, edu, |h, e| h / (e + 1.0)));
        put(&mut out, "hrs_edu", both(hours, edu, |h, e| h * e));
        put(&mut out, "age_edu", both(age, edu, |a, e| a * e));
        put(&mut out, "cap_gain_tax", both(gain, age, |g, a| g * (a / 100.0)));
        Ok(out)
    }
}

// ─── Banking (Home Credit) ──────────────────────────────────────────────────

const BANKING_NUMERIC: [&str; 10] = [
    "AMT_INCOME_TOTAL",
    "AMT_CREDIT",
    "AMT_ANNUITY",
    "AMT_GOODS_PRICE",
    "REGION_RATING_CLIENT",
    "DAYS_BIRTH",
    "DAYS_EMPLOYED",
    "EXT_SOURCE_1",
    "EXT_SOURCE_2",
    "EXT_SOURCE_3",
];

const BANKING_ENGINEERED: [&str; 7] = [
    "CREDIT_INCOME_PERCENT",
    "ANNUITY_INCOME_PERCENT",
    "GOODS_PRICE_PERCENT",
    "AGE_YEARS",
    "EMPLOYMENT_YEARS",
    "EXT_SOURCES_MEAN",
    "EXT_SOURCES_PROD",
];

const BANKING_CATEGORICAL: [&str; 3] =
    ["NAME_EDUCATION_TYPE", "NAME_INCOME_TYPE", "OCCUPATION_TYPE"];

const EXT_SOURCES: [&str; 3] = ["EXT_SOURCE_1", "EXT_SOURCE_2", "EXT_SOURCE_3"];

/// Home Credit style financial-ratio profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct BankingProfile;

impl DomainProfile for BankingProfile {
    fn tag(&self) -> DomainTag {
        DomainTag::Banking
    }

    fn schema(&self) -> DomainSchema {
        let fields = BANKING_NUMERIC
            .iter()
            .chain(BANKING_ENGINEERED.iter())
            .map(|name| FieldSpec::numeric(*name))
            .chain(BANKING_CATEGORICAL.iter().map(|name| FieldSpec::categorical(*name)))
            .collect();
        DomainSchema::from_static(fields)
    }

    fn engineer(&self, raw: &RawInstance) -> Result<RawInstance, SchemaError> {
        let income = number(raw, "AMT_INCOME_TOTAL")?;
        let credit = number(raw, "AMT_CREDIT")?;
        let annuity = number(raw, "AMT_ANNUITY")?;
        let goods = number(raw, "AMT_GOODS_PRICE")?;
        let days_birth = number(raw, "DAYS_BIRTH")?;
        let days_employed = number(raw, "DAYS_EMPLOYED")?;

        let mut scores = Vec::with_capacity(EXT_SOURCES.len());
        for name in EXT_SOURCES {
            if let Some(v) = number(raw, name)? {
                scores.push(v);
            }
        }

        let mut out = raw.clone();
        put(&mut out, "CREDIT_INCOME_PERCENT", both(credit, income, |c, i| c / i));
        put(&mut out, "ANNUITY_INCOME_PERCENT", both(annuity, income, |a, i| a / i));
        put(&mut out, "GOODS_PRICE_PERCENT", both(goods, income, |g, i| g / i));
        put(&mut out, "AGE_YEARS", days_birth.map(|d| d / -365.0));
        put(&mut out, "EMPLOYMENT_YEARS", days_employed.map(|d| d / -365.0));

        let (mean, prod) = if scores.is_empty() {
            (None, None)
        } else {
            let sum: f64 = scores.iter().sum();
            (
                Some(sum / scores.len() as f64),
                Some(scores.iter().product()),
            )
        };
        put(&mut out, "EXT_SOURCES_MEAN", mean);
        put(&mut out, "EXT_SOURCES_PROD", prod);
        Ok(out)
    }
}
