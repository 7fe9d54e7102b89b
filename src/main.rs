//! Kairos: JSON-lines decision CLI.
//!
//! ```text
//! kairos [serve]              read requests on stdin, write responses on stdout
//! kairos evaluate <holdout>   evaluate a labelled JSON-lines holdout and apply
//!                             the regression gate
//! ```
//!
//! A request line is either a bare instance object, which is decided, or an
//! object with an `op` field: `decide`, `decide_batch`, `reload`,
//! `reload_policy`, `stats`, `reviews` or `resolve`.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kairos::adapters::sanitize::SanitizingMakeWriter;
use kairos::adapters::{FsBundleStore, LoadOptions, SqliteReviewQueue};
use kairos::application::{DecisionService, DriftStats, EvaluationService, RegressionGate};
use kairos::config::{LogMode, PolicyConfig, ServiceConfig};
use kairos::domain::{BundleMetadata, ReviewCase};
use kairos::ports::{BundleStore, DiscardReviews, ReviewSink};
use kairos::{Decision, KairosError, RawInstance};

const DEFAULT_PAGE: usize = 20;

fn default_page() -> usize {
    DEFAULT_PAGE
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Decide {
        instance: RawInstance,
    },
    DecideBatch {
        instances: Vec<RawInstance>,
    },
    Reload {
        #[serde(default)]
        force: bool,
    },
    ReloadPolicy,
    Stats,
    Reviews {
        #[serde(default)]
        offset: usize,
        #[serde(default = "default_page")]
        limit: usize,
    },
    Resolve {
        id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum Response {
    Decision {
        decision: Decision,
    },
    Batch {
        results: Vec<Response>,
    },
    Reloaded {
        bundle: BundleMetadata,
    },
    PolicyUpdated {
        tau_low: f64,
        tau_high: f64,
    },
    Stats {
        bundle: BundleMetadata,
        drift: DriftStats,
    },
    Reviews {
        total: usize,
        next_offset: Option<usize>,
        items: Vec<ReviewCase>,
    },
    Resolved {
        id: String,
        existed: bool,
    },
    Error {
        error: String,
        caller_visible: bool,
    },
}

impl Response {
    fn from_error(err: &KairosError) -> Self {
        if !err.is_caller_visible() {
            tracing::error!("Request failed: {err}");
        }
        Self::Error {
            error: err.to_string(),
            caller_visible: err.is_caller_visible(),
        }
    }

    fn from_decision(result: kairos::Result<Decision>) -> Self {
        match result {
            Ok(decision) => Self::Decision { decision },
            Err(e) => Self::from_error(&e),
        }
    }
}

/// One labelled holdout row for `kairos evaluate`.
#[derive(Debug, Deserialize)]
struct LabelledInstance {
    instance: RawInstance,
    label: bool,
}

fn main() -> Result<()> {
    let config = ServiceConfig::from_env().context("Invalid configuration")?;

    let (writer, _guard) = match config.log_mode {
        LogMode::File => {
            if let Some(parent) = config.log_file.parent() {
                // Best-effort: a missing directory surfaces as the open error below.
                let _ = std::fs::create_dir_all(parent);
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.log_file)
                .with_context(|| format!("Failed to open log file {:?}", config.log_file))?;
            tracing_appender::non_blocking(file)
        }
        LogMode::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(SanitizingMakeWriter::new(writer)),
        )
        .init();

    tracing::info!("Starting Kairos...");

    let store = FsBundleStore::new(&config.bundle_dir, LoadOptions::from_env()?);
    let snapshot = store
        .load_snapshot()
        .with_context(|| format!("Failed to load bundle from {:?}", config.bundle_dir))?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None | Some("serve") => match &config.review_db {
            Some(path) => {
                let queue = SqliteReviewQueue::new(path)
                    .with_context(|| format!("Failed to open review queue {path:?}"))?;
                let service =
                    DecisionService::with_config(snapshot, &config.policy, Arc::new(queue))?;
                serve(&service, &store)?;
            }
            None => {
                tracing::warn!("No review queue configured; abstained cases are not persisted");
                let service = DecisionService::with_config(
                    snapshot,
                    &config.policy,
                    Arc::new(DiscardReviews),
                )?;
                serve(&service, &store)?;
            }
        },
        Some("evaluate") => {
            let Some(path) = args.get(1) else {
                bail!("usage: kairos evaluate <holdout.jsonl>");
            };
            let snapshot = snapshot.with_weight_overrides(&config.policy.weight_overrides)?;
            evaluate(snapshot, &config.policy, Path::new(path))?;
        }
        Some(other) => bail!("unknown command '{other}' (expected 'serve' or 'evaluate')"),
    }

    tracing::info!("Kairos shutdown complete.");
    Ok(())
}

fn serve<R>(service: &DecisionService<R>, store: &FsBundleStore) -> Result<()>
where
    R: ReviewSink + 'static,
    KairosError: From<R::Error>,
{
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match parse_request(&line) {
            Ok(request) => handle(service, store, request),
            Err(error) => Response::Error {
                error,
                caller_visible: true,
            },
        };
        serde_json::to_writer(&mut out, &response)?;
        out.write_all(b"\n")?;
        out.flush()?;
    }
    Ok(())
}

fn parse_request(line: &str) -> std::result::Result<Request, String> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| format!("Invalid JSON: {e}"))?;
    if value.get("op").is_some() {
        serde_json::from_value(value).map_err(|e| format!("Invalid request: {e}"))
    } else {
        serde_json::from_value(value)
            .map(|instance| Request::Decide { instance })
            .map_err(|e| format!("Invalid instance: {e}"))
    }
}

fn handle<R>(service: &DecisionService<R>, store: &FsBundleStore, request: Request) -> Response
where
    R: ReviewSink + 'static,
    KairosError: From<R::Error>,
{
    let result: kairos::Result<Response> = match request {
        Request::Decide { instance } => return Response::from_decision(service.decide(&instance)),
        Request::DecideBatch { instances } => Ok(Response::Batch {
            results: service
                .decide_batch(&instances)
                .into_iter()
                .map(Response::from_decision)
                .collect(),
        }),
        Request::Reload { force } => service
            .reload_from::<FsBundleStore>(store, force)
            .map(|bundle| Response::Reloaded { bundle }),
        Request::ReloadPolicy => PolicyConfig::from_env()
            .map_err(|e: kairos::config::ConfigError| <KairosError as From<kairos::config::ConfigError>>::from(e))
            .and_then(|config| service.apply_policy_config(&config))
            .map(|()| {
                let thresholds = service.policy().thresholds();
                Response::PolicyUpdated {
                    tau_low: thresholds.tau_low(),
                    tau_high: thresholds.tau_high(),
                }
            }),
        Request::Stats => Ok(Response::Stats {
            bundle: service.metadata(),
            drift: service.drift_stats(),
        }),
        Request::Reviews { offset, limit } => service
            .reviews()
            .load_paginated(offset, limit)
            .map_err(KairosError::from)
            .map(|page| Response::Reviews {
                total: page.total_count,
                next_offset: page.next_offset(),
                items: page.items,
            }),
        Request::Resolve { id } => service
            .reviews()
            .resolve(&id)
            .map_err(KairosError::from)
            .map(|existed| Response::Resolved { id, existed }),
    };
    result.unwrap_or_else(|e| Response::from_error(&e))
}

fn evaluate(
    snapshot: kairos::domain::ModelSnapshot,
    policy: &PolicyConfig,
    path: &Path,
) -> Result<()> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open holdout {path:?}"))?;
    let mut holdout = Vec::new();
    let mut labels = Vec::new();
    for (n, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let row: LabelledInstance = serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid holdout row", path.display(), n + 1))?;
        holdout.push(row.instance);
        labels.push(row.label);
    }

    let service = EvaluationService::new(Arc::new(snapshot), policy.engine()?);
    let report = service.evaluate(&holdout, &labels)?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, &report)?;
    out.write_all(b"\n")?;

    let gate = RegressionGate::default();
    let violations = gate.check(&report);
    if !violations.is_empty() {
        bail!(
            "Regression gate failed: {}",
            violations
                .iter()
                .map(|v| format!("{} = {:.4} (limit {:.4})", v.metric, v.value, v.limit))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    tracing::info!("Regression gate passed");
    Ok(())
}
