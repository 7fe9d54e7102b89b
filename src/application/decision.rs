//! Decision service: Orchestrates the serving pipeline.
//!
//! This service coordinates:
//! - Domain feature engineering and frozen transformation
//! - Ensemble scoring and calibration
//! - Policy evaluation
//! - Review emission for abstained cases (handed off to a background writer)
//! - Atomic snapshot and policy hot reload

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use super::review_writer::{ReviewWriter, DEFAULT_REVIEW_CAPACITY};
use crate::config::PolicyConfig;
use crate::domain::{
    BundleMetadata, ClampSide, Decision, ModelSnapshot, PolicyEngine, RawInstance, ReviewCase,
    Verdict,
};
use crate::ports::{BundleStore, ReviewSink};
use crate::KairosError;

/// Counters for signals that hint at data drift or a degraded review path.
#[derive(Debug, Default)]
struct DriftCounters {
    decisions: AtomicU64,
    abstained: AtomicU64,
    clamped_below: AtomicU64,
    clamped_above: AtomicU64,
    review_failures: Arc<AtomicU64>,
}

/// Point-in-time copy of the drift counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriftStats {
    pub decisions: u64,
    pub abstained: u64,
    /// Raw scores below the calibration range.
    pub clamped_below: u64,
    /// Raw scores above the calibration range.
    pub clamped_above: u64,
    pub review_failures: u64,
}

/// Loaded snapshot plus the weight overrides applied on top of it.
struct LiveModel {
    base: Arc<ModelSnapshot>,
    effective: Arc<ModelSnapshot>,
    overrides: BTreeMap<String, f64>,
}

impl LiveModel {
    fn build(base: Arc<ModelSnapshot>, overrides: BTreeMap<String, f64>) -> crate::Result<Self> {
        let effective = if overrides.is_empty() {
            Arc::clone(&base)
        } else {
            Arc::new(base.with_weight_overrides(&overrides)?)
        };
        Ok(Self {
            base,
            effective,
            overrides,
        })
    }
}

/// Service turning raw instances into decisions.
///
/// # Hot reload
///
/// The model snapshot and the policy engine each sit behind their own
/// `RwLock<Arc<_>>`. A request clones both `Arc`s up front and finishes on
/// them, so a concurrent reload never changes a decision halfway through.
///
/// # Reviews
///
/// Abstained cases go through a bounded channel to a writer thread that owns
/// the sink calls. `decide` never waits on the sink; a full queue drops the
/// case and counts it in `DriftStats::review_failures`.
pub struct DecisionService<R>
where
    R: ReviewSink + 'static,
{
    model: RwLock<LiveModel>,
    policy: RwLock<Arc<PolicyEngine>>,
    reviews: Arc<R>,
    writer: ReviewWriter,
    drift: DriftCounters,
}

impl<R> DecisionService<R>
where
    R: ReviewSink + 'static,
{
    /// Create a service with no weight overrides.
    pub fn new(snapshot: ModelSnapshot, policy: PolicyEngine, reviews: Arc<R>) -> Self {
        Self::with_review_capacity(snapshot, policy, reviews, DEFAULT_REVIEW_CAPACITY)
    }

    /// Create a service whose review queue holds at most `capacity` pending cases.
    pub fn with_review_capacity(
        snapshot: ModelSnapshot,
        policy: PolicyEngine,
        reviews: Arc<R>,
        capacity: usize,
    ) -> Self {
        let base = Arc::new(snapshot);
        let drift = DriftCounters::default();
        let writer = ReviewWriter::spawn(
            Arc::clone(&reviews),
            capacity,
            Arc::clone(&drift.review_failures),
        );
        Self {
            model: RwLock::new(LiveModel {
                effective: Arc::clone(&base),
                base,
                overrides: BTreeMap::new(),
            }),
            policy: RwLock::new(Arc::new(policy)),
            reviews,
            writer,
            drift,
        }
    }

    /// Create a service from a snapshot and a policy configuration.
    ///
    /// # Errors
    /// Invalid cost parameters or weight overrides.
    pub fn with_config(
        snapshot: ModelSnapshot,
        config: &PolicyConfig,
        reviews: Arc<R>,
    ) -> crate::Result<Self> {
        let service = Self::new(snapshot, config.engine()?, reviews);
        service.apply_policy_config(config)?;
        Ok(service)
    }

    /// Snapshot currently serving requests (weight overrides applied).
    #[must_use]
    pub fn snapshot(&self) -> Arc<ModelSnapshot> {
        let model = self.model.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&model.effective)
    }

    /// Policy engine currently serving requests.
    #[must_use]
    pub fn policy(&self) -> Arc<PolicyEngine> {
        let policy = self.policy.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&policy)
    }

    #[must_use]
    pub fn metadata(&self) -> BundleMetadata {
        self.snapshot().metadata().clone()
    }

    #[must_use]
    pub fn reviews(&self) -> &R {
        &self.reviews
    }

    /// Wait until every review case emitted so far has reached the sink.
    ///
    /// Returns `false` if the review writer is not running.
    pub fn flush_reviews(&self) -> bool {
        self.writer.flush()
    }

    /// Run the full pipeline on one instance.
    ///
    /// # Errors
    /// - `KairosError::Schema` for malformed instances
    /// - `KairosError::Ensemble` when a member fails
    /// - `KairosError::Policy` on an internal contract violation
    pub fn decide(&self, raw: &RawInstance) -> crate::Result<Decision> {
        let snapshot = self.snapshot();
        let policy = self.policy();
        self.decide_with(&snapshot, &policy, raw)
    }

    /// Decide a batch against a single snapshot and policy.
    ///
    /// Failures are reported per instance.
    pub fn decide_batch(&self, raws: &[RawInstance]) -> Vec<crate::Result<Decision>> {
        let snapshot = self.snapshot();
        let policy = self.policy();
        raws.iter()
            .map(|raw| self.decide_with(&snapshot, &policy, raw))
            .collect()
    }

    fn decide_with(
        &self,
        snapshot: &ModelSnapshot,
        policy: &PolicyEngine,
        raw: &RawInstance,
    ) -> crate::Result<Decision> {
        let scored = snapshot.score(raw)?;

        if let Some(side) = scored.calibrated.clamp {
            let (lo, hi) = snapshot.calibration().domain();
            tracing::warn!(
                "Raw score {:.6} outside calibration range [{lo:.6}, {hi:.6}] ({side:?})",
                scored.ensemble.raw_score
            );
            let counter = match side {
                ClampSide::Below => &self.drift.clamped_below,
                ClampSide::Above => &self.drift.clamped_above,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }

        let outcome =
            policy.decide(scored.calibrated.probability, Some(scored.ensemble.disagreement))?;

        let decision = Decision {
            verdict: outcome.verdict,
            probability: scored.calibrated.probability,
            raw_score: scored.ensemble.raw_score,
            uncertainty: outcome.uncertainty,
            disagreement: scored.ensemble.disagreement,
            cost_risk: outcome.cost_risk,
            bundle_version: snapshot.metadata().bundle_version.clone(),
        };

        self.drift.decisions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Decision {} p={:.4} raw={:.4} H={:.4} bundle={}",
            decision.verdict,
            decision.probability,
            decision.raw_score,
            decision.uncertainty,
            decision.bundle_version
        );

        if decision.verdict == Verdict::Abstain {
            self.drift.abstained.fetch_add(1, Ordering::Relaxed);
            self.writer.submit(ReviewCase::new(&decision, raw.clone()));
        }

        Ok(decision)
    }

    /// Replace the model snapshot.
    ///
    /// Current weight overrides are re-applied to the new snapshot. A snapshot
    /// with a lower serial than the live one is refused unless `force` is set.
    ///
    /// # Errors
    /// `KairosError::Rollback`, or an ensemble error when the current
    /// overrides do not fit the new members.
    pub fn swap_snapshot(&self, snapshot: ModelSnapshot, force: bool) -> crate::Result<()> {
        let mut model = self.model.write().unwrap_or_else(PoisonError::into_inner);

        let live = model.base.metadata().serial;
        let offered = snapshot.metadata().serial;
        if offered < live {
            if !force {
                tracing::error!("Refusing bundle rollback from serial {live} to {offered}");
                return Err(KairosError::Rollback { live, offered });
            }
            tracing::warn!("Forced bundle rollback from serial {live} to {offered}");
        }

        let next = LiveModel::build(Arc::new(snapshot), model.overrides.clone())?;
        tracing::info!(
            "Swapped model snapshot: {} (serial {}) -> {} (serial {})",
            model.base.metadata().bundle_version,
            live,
            next.base.metadata().bundle_version,
            offered
        );
        *model = next;
        Ok(())
    }

    /// Load a snapshot from `store` and swap it in.
    ///
    /// # Errors
    /// Load failures, plus everything `swap_snapshot` refuses. The live
    /// snapshot is untouched on error.
    pub fn reload_from<S>(&self, store: &S, force: bool) -> crate::Result<BundleMetadata>
    where
        S: BundleStore,
        KairosError: From<S::Error>,
    {
        let snapshot = store.load_snapshot()?;
        let metadata = snapshot.metadata().clone();
        self.swap_snapshot(snapshot, force)?;
        Ok(metadata)
    }

    /// Replace the policy engine. The model snapshot is untouched.
    pub fn set_policy(&self, engine: PolicyEngine) {
        let thresholds = engine.thresholds();
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(engine);
        tracing::info!(
            "Policy updated: tau_low={}, tau_high={}",
            thresholds.tau_low(),
            thresholds.tau_high()
        );
    }

    /// Apply thresholds, cost model and weight overrides together.
    ///
    /// Everything is validated before anything is swapped.
    ///
    /// # Errors
    /// Invalid cost parameters, or overrides naming unknown artifacts or
    /// carrying invalid weights.
    pub fn apply_policy_config(&self, config: &PolicyConfig) -> crate::Result<()> {
        let engine = config.engine()?;
        {
            let mut model = self.model.write().unwrap_or_else(PoisonError::into_inner);
            if model.overrides != config.weight_overrides {
                let next =
                    LiveModel::build(Arc::clone(&model.base), config.weight_overrides.clone())?;
                for (id, weight) in &next.overrides {
                    tracing::warn!("Ensemble weight override: {id} -> {weight}");
                }
                *model = next;
            }
        }
        self.set_policy(engine);
        Ok(())
    }

    #[must_use]
    pub fn drift_stats(&self) -> DriftStats {
        DriftStats {
            decisions: self.drift.decisions.load(Ordering::Relaxed),
            abstained: self.drift.abstained.load(Ordering::Relaxed),
            clamped_below: self.drift.clamped_below.load(Ordering::Relaxed),
            clamped_above: self.drift.clamped_above.load(Ordering::Relaxed),
            review_failures: self.drift.review_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::bundle::tests::{signed_options, signing_key, write_census_bundle};
    use crate::adapters::{FsBundleStore, SqliteReviewQueue};
    use crate::domain::ensemble::tests::constant;
    use crate::domain::snapshot::tests::{census_metadata, census_snapshot, census_training};
    use crate::domain::{
        binary_entropy, Breakpoint, CalibrationMap, DomainTag, Ensemble, FeatureTransformer,
        PolicyThresholds,
    };
    use crate::ports::{DiscardReviews, ReviewPage};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn applicant() -> RawInstance {
        RawInstance::new()
            .with("age", 37.0)
            .with("education_num", 13.0)
            .with("capital_gain", 0.0)
            .with("capital_loss", 0.0)
            .with("hours_per_week", 45.0)
            .with("workclass", "Private")
            .with("marital_status", "Married-civ-spouse")
            .with("occupation", "Exec-managerial")
            .with("relationship", "Husband")
            .with("race", "White")
            .with("sex", "Male")
            .with("native_country", "United-States")
    }

    fn service() -> DecisionService<SqliteReviewQueue> {
        DecisionService::new(
            census_snapshot(),
            PolicyEngine::default(),
            Arc::new(SqliteReviewQueue::in_memory().expect("queue")),
        )
    }

    #[derive(Debug)]
    struct FailingReviews;

    impl ReviewSink for FailingReviews {
        type Error = std::io::Error;

        fn submit(&self, _case: &ReviewCase) -> Result<(), Self::Error> {
            Err(std::io::Error::other("queue offline"))
        }

        fn load_recent(&self, _limit: usize) -> Result<Vec<ReviewCase>, Self::Error> {
            Ok(Vec::new())
        }

        fn load_paginated(&self, offset: usize, limit: usize) -> Result<ReviewPage, Self::Error> {
            Ok(ReviewPage::new(Vec::new(), 0, offset, limit))
        }

        fn count(&self) -> Result<usize, Self::Error> {
            Ok(0)
        }

        fn resolve(&self, _id: &str) -> Result<bool, Self::Error> {
            Ok(false)
        }
    }

    /// Sink that takes `delay` per write and records what it received.
    #[derive(Debug)]
    struct SlowReviews {
        delay: Duration,
        received: Mutex<Vec<ReviewCase>>,
    }

    impl SlowReviews {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                received: Mutex::new(Vec::new()),
            }
        }

        fn received(&self) -> usize {
            self.received.lock().map(|r| r.len()).unwrap_or(0)
        }
    }

    impl ReviewSink for SlowReviews {
        type Error = std::io::Error;

        fn submit(&self, case: &ReviewCase) -> Result<(), Self::Error> {
            std::thread::sleep(self.delay);
            self.received
                .lock()
                .map_err(|_| std::io::Error::other("poisoned"))?
                .push(case.clone());
            Ok(())
        }

        fn load_recent(&self, limit: usize) -> Result<Vec<ReviewCase>, Self::Error> {
            let received = self.received.lock().map_err(|_| std::io::Error::other("poisoned"))?;
            Ok(received.iter().rev().take(limit).cloned().collect())
        }

        fn load_paginated(&self, offset: usize, limit: usize) -> Result<ReviewPage, Self::Error> {
            Ok(ReviewPage::new(Vec::new(), self.count()?, offset, limit))
        }

        fn count(&self) -> Result<usize, Self::Error> {
            Ok(self.received())
        }

        fn resolve(&self, _id: &str) -> Result<bool, Self::Error> {
            Ok(false)
        }
    }

    #[test]
    fn test_weighted_consensus_abstains_and_queues_review() {
        let service = service();
        let decision = service.decide(&applicant()).expect("decide");

        assert!((decision.raw_score - 0.65).abs() < 1e-12);
        assert_eq!(decision.probability, decision.raw_score);
        assert_eq!(decision.verdict, Verdict::Abstain);
        assert_eq!(decision.bundle_version, "census-test");

        assert!(service.flush_reviews());
        let queued = service.reviews().load_recent(10).expect("load");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].instance, applicant());
        assert_eq!(queued[0].probability, decision.probability);

        let stats = service.drift_stats();
        assert_eq!(stats.decisions, 1);
        assert_eq!(stats.abstained, 1);
    }

    #[test]
    fn test_decisions_are_deterministic() {
        let service = service();
        let a = service.decide(&applicant()).expect("decide");
        let b = service.decide(&applicant()).expect("decide");
        assert_eq!(a, b);
        assert_eq!(a.probability.to_bits(), b.probability.to_bits());
        assert_eq!(a.cost_risk.to_bits(), b.cost_risk.to_bits());
    }

    #[test]
    fn test_unknown_category_still_decides() {
        let service = service();
        let raw = applicant()
            .with("occupation", "Astronaut")
            .with("native_country", "Atlantis");
        assert!(service.decide(&raw).is_ok());
    }

    #[test]
    fn test_schema_error_is_caller_visible() {
        let service = service();
        let err = service
            .decide(&applicant().with("age", "forty"))
            .expect_err("wrong type");
        assert!(matches!(err, KairosError::Schema(_)));
        assert!(err.is_caller_visible());
        assert_eq!(service.drift_stats().decisions, 0);
    }

    #[test]
    fn test_json_boolean_field_is_named_in_error() {
        let service = service();
        let raw: RawInstance =
            serde_json::from_str(r#"{"age": true, "sex": "Male"}"#).expect("decode");
        let err = service.decide(&raw).expect_err("boolean age");
        assert!(err.is_caller_visible());
        match err {
            KairosError::Schema(schema) => assert_eq!(schema.field(), Some("age")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_end_to_end_with_imputed_field() {
        let temp = tempdir().expect("tempdir");
        let key = signing_key();
        write_census_bundle(temp.path(), 1, Some(&key));
        let snapshot = FsBundleStore::new(temp.path(), signed_options(&key))
            .load_snapshot()
            .expect("load");
        let service =
            DecisionService::new(snapshot, PolicyEngine::default(), Arc::new(DiscardReviews));

        let mut raw = applicant();
        raw.remove("hours_per_week");
        let decision = service.decide(&raw).expect("decide");

        let p = decision.probability;
        assert!((0.0..=1.0).contains(&decision.raw_score));
        assert!((0.0..=1.0).contains(&p));
        assert_eq!(decision.verdict, PolicyThresholds::default().classify(p));
        let expected = -p * p.ln() - (1.0 - p) * (1.0 - p).ln();
        assert_eq!(decision.uncertainty, expected);
        assert_eq!(decision.uncertainty, binary_entropy(p));
    }

    #[test]
    fn test_reload_from_disk_is_bit_identical() {
        let temp = tempdir().expect("tempdir");
        let key = signing_key();
        write_census_bundle(temp.path(), 1, Some(&key));
        let store = FsBundleStore::new(temp.path(), signed_options(&key));
        let service = DecisionService::new(
            store.load_snapshot().expect("load"),
            PolicyEngine::default(),
            Arc::new(DiscardReviews),
        );

        let before = service.decide(&applicant()).expect("decide");
        let metadata = service.reload_from(&store, false).expect("reload");
        let after = service.decide(&applicant()).expect("decide");

        assert_eq!(metadata.serial, 1);
        assert_eq!(before.raw_score.to_bits(), after.raw_score.to_bits());
        assert_eq!(before.probability.to_bits(), after.probability.to_bits());
    }

    #[test]
    fn test_reload_refuses_rollback_unless_forced() {
        let newer = tempdir().expect("tempdir");
        let older = tempdir().expect("tempdir");
        let key = signing_key();
        write_census_bundle(newer.path(), 3, Some(&key));
        write_census_bundle(older.path(), 2, Some(&key));

        let service = DecisionService::new(
            FsBundleStore::new(newer.path(), signed_options(&key))
                .load_snapshot()
                .expect("load"),
            PolicyEngine::default(),
            Arc::new(DiscardReviews),
        );
        let old_store = FsBundleStore::new(older.path(), signed_options(&key));

        assert!(matches!(
            service.reload_from(&old_store, false),
            Err(KairosError::Rollback { live: 3, offered: 2 })
        ));
        assert_eq!(service.metadata().serial, 3);

        service.reload_from(&old_store, true).expect("forced");
        assert_eq!(service.metadata().serial, 2);
    }

    #[test]
    fn test_policy_reload_keeps_snapshot() {
        let service = service();
        let before = service.snapshot();

        let thresholds = PolicyThresholds::new(0.1, 0.6).expect("valid");
        service.set_policy(PolicyEngine::default().with_thresholds(thresholds));
        let decision = service.decide(&applicant()).expect("decide");

        assert_eq!(decision.verdict, Verdict::Accept);
        assert!(Arc::ptr_eq(&before, &service.snapshot()));
    }

    #[test]
    fn test_weight_overrides() {
        let service = service();
        let mut config = PolicyConfig::default();
        config.weight_overrides.insert("cat-0".into(), 1.0);
        service.apply_policy_config(&config).expect("apply");

        let decision = service.decide(&applicant()).expect("decide");
        assert!((decision.raw_score - 0.5).abs() < 1e-12);

        let mut bad = PolicyConfig::default();
        bad.thresholds = PolicyThresholds::new(0.4, 0.45).expect("valid");
        bad.weight_overrides.insert("xgb-9".into(), 1.0);
        assert!(service.apply_policy_config(&bad).is_err());
        // Nothing from the rejected config was applied.
        assert_eq!(service.policy().thresholds(), PolicyThresholds::default());
        let decision = service.decide(&applicant()).expect("decide");
        assert!((decision.raw_score - 0.5).abs() < 1e-12);

        // Overrides survive a snapshot swap.
        service.swap_snapshot(census_snapshot(), false).expect("swap");
        let decision = service.decide(&applicant()).expect("decide");
        assert!((decision.raw_score - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_calibration_clamp_is_counted() {
        let schema = DomainTag::Census.profile().schema();
        let transformer = FeatureTransformer::fit(&schema, &census_training()).expect("fit");
        let width = transformer.len();
        let ensemble = Ensemble::new(vec![constant("lgb-0", 0.9, 1.0, width)]).expect("ensemble");
        let calibration = CalibrationMap::new(vec![
            Breakpoint {
                raw: 0.1,
                probability: 0.05,
            },
            Breakpoint {
                raw: 0.5,
                probability: 0.7,
            },
        ])
        .expect("map");
        let metadata = census_metadata(&transformer);
        let snapshot =
            ModelSnapshot::new(metadata, transformer, ensemble, calibration).expect("snapshot");
        let service =
            DecisionService::new(snapshot, PolicyEngine::default(), Arc::new(DiscardReviews));

        let decision = service.decide(&applicant()).expect("decide");
        assert_eq!(decision.probability, 0.7);
        assert_eq!(service.drift_stats().clamped_above, 1);
        assert_eq!(service.drift_stats().clamped_below, 0);
    }

    #[test]
    fn test_review_failure_does_not_fail_decision() {
        let service = DecisionService::new(
            census_snapshot(),
            PolicyEngine::default(),
            Arc::new(FailingReviews),
        );
        let decision = service.decide(&applicant()).expect("decide");
        assert_eq!(decision.verdict, Verdict::Abstain);
        assert!(service.flush_reviews());
        assert_eq!(service.drift_stats().review_failures, 1);
    }

    #[test]
    fn test_slow_review_sink_does_not_delay_decisions() {
        let sink = Arc::new(SlowReviews::new(Duration::from_millis(300)));
        let service =
            DecisionService::new(census_snapshot(), PolicyEngine::default(), Arc::clone(&sink));

        let started = Instant::now();
        let first = service.decide(&applicant()).expect("decide");
        let second = service.decide(&applicant()).expect("decide");
        let elapsed = started.elapsed();

        assert_eq!(first.verdict, Verdict::Abstain);
        assert_eq!(second.verdict, Verdict::Abstain);
        assert!(elapsed < Duration::from_millis(250), "decide waited on the sink: {elapsed:?}");

        assert!(service.flush_reviews());
        assert_eq!(sink.received(), 2);
        assert_eq!(service.drift_stats().review_failures, 0);
    }

    #[test]
    fn test_full_review_queue_drops_and_counts() {
        let sink = Arc::new(SlowReviews::new(Duration::from_millis(200)));
        let service = DecisionService::with_review_capacity(
            census_snapshot(),
            PolicyEngine::default(),
            Arc::clone(&sink),
            1,
        );

        // One case in the sink at most, one in the channel; the rest are dropped.
        for _ in 0..4 {
            service.decide(&applicant()).expect("decide");
        }
        let dropped = service.drift_stats().review_failures;
        assert!(dropped >= 2, "dropped {dropped}");

        assert!(service.flush_reviews());
        assert_eq!(sink.received() as u64 + dropped, 4);
        assert_eq!(service.drift_stats().abstained, 4);
    }

    #[test]
    fn test_pending_reviews_are_written_on_drop() {
        let sink = Arc::new(SlowReviews::new(Duration::from_millis(20)));
        let service =
            DecisionService::new(census_snapshot(), PolicyEngine::default(), Arc::clone(&sink));
        for _ in 0..3 {
            service.decide(&applicant()).expect("decide");
        }
        drop(service);
        assert_eq!(sink.received(), 3);
    }

    #[test]
    fn test_batch_reports_per_instance() {
        let service = service();
        let batch = [applicant(), applicant().with("age", f64::NAN), applicant()];
        let results = service.decide_batch(&batch);
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(KairosError::Schema(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_concurrent_decisions_during_reload() {
        let service = DecisionService::new(
            census_snapshot(),
            PolicyEngine::default(),
            Arc::new(DiscardReviews),
        );
        let expected = service.decide(&applicant()).expect("decide");

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let decision = service.decide(&applicant()).expect("decide");
                        assert_eq!(decision.raw_score.to_bits(), expected.raw_score.to_bits());
                    }
                });
            }
            scope.spawn(|| {
                for _ in 0..10 {
                    service.swap_snapshot(census_snapshot(), false).expect("swap");
                }
            });
        });

        assert_eq!(service.drift_stats().decisions, 201);
    }
}
