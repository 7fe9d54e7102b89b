//! Training-side helpers.
//!
//! Producing a bundle means fitting the transformer on engineered training
//! rows, scoring a held-out set through the ensemble, fitting the calibrator
//! on those scores and freezing all three into one snapshot. Tree building
//! itself happens elsewhere; members arrive here as serialized models.

use crate::domain::{
    BundleMetadata, CalibrationMap, DomainTag, Ensemble, FeatureTransformer, IsotonicCalibrator,
    ModelSnapshot, RawInstance, SchemaError, TransformerState,
};

/// Apply the domain's feature engineering to every row.
///
/// # Errors
/// The first row that fails engineering.
pub fn engineer_all(
    domain: DomainTag,
    raws: &[RawInstance],
) -> Result<Vec<RawInstance>, SchemaError> {
    let profile = domain.profile();
    raws.iter().map(|raw| profile.engineer(raw)).collect()
}

/// Fit the frozen transformer for `domain` on raw training rows.
///
/// # Errors
/// Engineering and fitting failures.
pub fn fit_transformer(
    domain: DomainTag,
    raws: &[RawInstance],
) -> Result<TransformerState, SchemaError> {
    let engineered = engineer_all(domain, raws)?;
    let state = FeatureTransformer::fit(&domain.profile().schema(), &engineered)?;
    tracing::info!(
        "Fitted {} transformer on {} rows ({} features)",
        domain,
        raws.len(),
        state.len()
    );
    Ok(state)
}

/// Uncalibrated ensemble scores for raw rows.
///
/// # Errors
/// Schema violations and ensemble member failures.
pub fn raw_scores(
    domain: DomainTag,
    transformer: &TransformerState,
    ensemble: &Ensemble,
    raws: &[RawInstance],
) -> crate::Result<Vec<f64>> {
    let profile = domain.profile();
    raws.iter()
        .map(|raw| {
            let features = transformer.transform(&profile.engineer(raw)?)?;
            Ok(ensemble.score(&features)?.raw_score)
        })
        .collect()
}

/// Fit the isotonic calibration map on a labelled held-out set.
///
/// # Errors
/// Scoring failures and calibration fit failures.
pub fn fit_calibration(
    domain: DomainTag,
    transformer: &TransformerState,
    ensemble: &Ensemble,
    holdout: &[RawInstance],
    labels: &[bool],
) -> crate::Result<CalibrationMap> {
    let scores = raw_scores(domain, transformer, ensemble, holdout)?;
    let map = IsotonicCalibrator::fit(&scores, labels)?;
    let (lo, hi) = map.domain();
    tracing::info!(
        "Fitted calibration on {} held-out rows ({} breakpoints, range [{lo:.4}, {hi:.4}])",
        holdout.len(),
        map.breakpoints().len()
    );
    Ok(map)
}

/// Freeze the parts of one training run into a snapshot.
///
/// # Errors
/// `KairosError::Snapshot` when the parts do not belong together.
pub fn assemble_snapshot(
    bundle_version: impl Into<String>,
    serial: u64,
    domain: DomainTag,
    transformer: TransformerState,
    ensemble: Ensemble,
    calibration: CalibrationMap,
) -> crate::Result<ModelSnapshot> {
    let metadata = BundleMetadata {
        bundle_version: bundle_version.into(),
        domain,
        schema_hash: transformer.schema_hash().to_string(),
        serial,
        created_at: chrono::Utc::now().timestamp(),
    };
    Ok(ModelSnapshot::new(metadata, transformer, ensemble, calibration)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::trees::tests::stump;
    use crate::domain::{Architecture, ModelArtifact};
    use crate::KairosError;
    use std::sync::Arc;

    fn census_rows() -> Vec<RawInstance> {
        (0..40)
            .map(|i| {
                let age = 20.0 + f64::from(i);
                RawInstance::new()
                    .with("age", age)
                    .with("education_num", f64::from(i % 16))
                    .with("capital_gain", if i % 5 == 0 { 5000.0 } else { 0.0 })
                    .with("capital_loss", 0.0)
                    .with("hours_per_week", 30.0 + f64::from(i % 20))
                    .with("workclass", if i % 2 == 0 { "Private" } else { "Self-emp-inc" })
                    .with("marital_status", "Never-married")
                    .with("occupation", if i % 3 == 0 { "Sales" } else { "Craft-repair" })
                    .with("relationship", "Not-in-family")
                    .with("race", "White")
                    .with("sex", if i % 2 == 0 { "Female" } else { "Male" })
                    .with("native_country", "United-States")
            })
            .collect()
    }

    fn stump_ensemble(width: usize) -> Ensemble {
        Ensemble::new(vec![ModelArtifact::new(
            "lgb-0",
            Architecture::LightGbm,
            0,
            1.0,
            Arc::new(stump(width, 0.0)),
        )])
        .expect("ensemble")
    }

    #[test]
    fn test_fit_transformer_engineers_first() {
        let rows = census_rows();
        let state = fit_transformer(DomainTag::Census, &rows).expect("fit");

        let engineered = engineer_all(DomainTag::Census, &rows).expect("engineer");
        let schema = DomainTag::Census.profile().schema();
        let direct = FeatureTransformer::fit(&schema, &engineered).expect("fit");
        assert_eq!(state, direct);
        assert!(state.features().iter().any(|f| f.name() == "capital_net"));
    }

    #[test]
    fn test_assembled_snapshot_scores() {
        let rows = census_rows();
        let (train, holdout) = rows.split_at(20);
        let transformer = fit_transformer(DomainTag::Census, train).expect("fit");
        let ensemble = stump_ensemble(transformer.len());

        let labels: Vec<bool> = holdout.iter().enumerate().map(|(i, _)| i % 3 != 0).collect();
        let calibration =
            fit_calibration(DomainTag::Census, &transformer, &ensemble, holdout, &labels)
                .expect("calibrate");
        let snapshot = assemble_snapshot(
            "census-train",
            1,
            DomainTag::Census,
            transformer,
            ensemble,
            calibration,
        )
        .expect("snapshot");

        let scored = snapshot.score(&holdout[0]).expect("score");
        assert!((0.0..=1.0).contains(&scored.calibrated.probability));
        assert_eq!(snapshot.metadata().schema_hash, snapshot.transformer().schema_hash());
    }

    #[test]
    fn test_training_errors_propagate() {
        assert!(matches!(
            fit_transformer(DomainTag::Banking, &[]),
            Err(SchemaError::EmptyTrainingSet)
        ));

        let rows = census_rows();
        let transformer = fit_transformer(DomainTag::Census, &rows).expect("fit");
        let ensemble = stump_ensemble(transformer.len());
        let err = fit_calibration(DomainTag::Census, &transformer, &ensemble, &rows, &[true])
            .expect_err("length mismatch");
        assert!(matches!(err, KairosError::Calibration(_)));
    }
}
