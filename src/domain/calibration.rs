//! Isotonic probability calibration.
//!
//! A `CalibrationMap` is a frozen, monotone, piecewise-linear mapping from raw
//! ensemble score to probability. It is fitted once on held-out data with the
//! pool-adjacent-violators algorithm and is validated whenever it is built or
//! deserialized, so an invalid map can never reach the decision path.

use serde::{Deserialize, Serialize};

/// Calibration fit and load failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("Cannot fit calibration on an empty set")]
    EmptyFitSet,

    #[error("Score/outcome length mismatch: {scores} scores, {outcomes} outcomes")]
    LengthMismatch { scores: usize, outcomes: usize },

    #[error("Non-finite value at index {index}")]
    NonFinite { index: usize },

    #[error("Calibration map has no breakpoints")]
    EmptyMap,

    #[error("Calibration map is not monotonic at breakpoint {index}")]
    NotMonotonic { index: usize },

    #[error("Calibrated probability {value} at breakpoint {index} is outside [0, 1]")]
    ProbabilityOutOfRange { index: usize, value: f64 },
}

/// One `(raw_score, probability)` knot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub raw: f64,
    pub probability: f64,
}

/// Side on which a raw score fell outside the fitted range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClampSide {
    Below,
    Above,
}

/// Calibrated probability plus range-violation flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrated {
    pub probability: f64,
    pub clamp: Option<ClampSide>,
}

#[derive(Deserialize)]
struct CalibrationMapRepr {
    breakpoints: Vec<Breakpoint>,
}

impl TryFrom<CalibrationMapRepr> for CalibrationMap {
    type Error = CalibrationError;

    fn try_from(repr: CalibrationMapRepr) -> Result<Self, Self::Error> {
        Self::new(repr.breakpoints)
    }
}

/// Frozen monotone mapping raw score -> probability.
///
/// Raw coordinates are strictly increasing; probabilities are non-decreasing
/// and lie in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CalibrationMapRepr")]
pub struct CalibrationMap {
    breakpoints: Vec<Breakpoint>,
}

impl CalibrationMap {
    /// Validate and build a map.
    ///
    /// # Errors
    /// Rejects empty, non-finite, non-monotonic and out-of-range breakpoints.
    pub fn new(breakpoints: Vec<Breakpoint>) -> Result<Self, CalibrationError> {
        if breakpoints.is_empty() {
            return Err(CalibrationError::EmptyMap);
        }
        for (index, bp) in breakpoints.iter().enumerate() {
            if !bp.raw.is_finite() || !bp.probability.is_finite() {
                return Err(CalibrationError::NonFinite { index });
            }
            if !(0.0..=1.0).contains(&bp.probability) {
                return Err(CalibrationError::ProbabilityOutOfRange {
                    index,
                    value: bp.probability,
                });
            }
        }
        for (i, pair) in breakpoints.windows(2).enumerate() {
            if pair[1].raw <= pair[0].raw || pair[1].probability < pair[0].probability {
                return Err(CalibrationError::NotMonotonic { index: i + 1 });
            }
        }
        Ok(Self { breakpoints })
    }

    #[must_use]
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.breakpoints
    }

    /// Fitted raw-score range `[min, max]`.
    #[must_use]
    pub fn domain(&self) -> (f64, f64) {
        let first = self.breakpoints[0].raw;
        let last = self.breakpoints[self.breakpoints.len() - 1].raw;
        (first, last)
    }

    /// Map a raw score to a probability.
    ///
    /// Linear interpolation between knots; scores outside the fitted range take
    /// the nearest end probability and report the side. NaN is treated as below
    /// the range.
    #[must_use]
    pub fn calibrate(&self, raw: f64) -> Calibrated {
        let first = self.breakpoints[0];
        let last = self.breakpoints[self.breakpoints.len() - 1];

        if raw.is_nan() || raw < first.raw {
            return Calibrated {
                probability: first.probability,
                clamp: Some(ClampSide::Below),
            };
        }
        if raw > last.raw {
            return Calibrated {
                probability: last.probability,
                clamp: Some(ClampSide::Above),
            };
        }

        // First knot strictly greater than `raw`.
        let hi = self.breakpoints.partition_point(|bp| bp.raw <= raw);
        let probability = if hi == self.breakpoints.len() {
            last.probability
        } else {
            let a = self.breakpoints[hi - 1];
            let b = self.breakpoints[hi];
            if raw == a.raw {
                a.probability
            } else {
                let t = (raw - a.raw) / (b.raw - a.raw);
                (a.probability + t * (b.probability - a.probability))
                    .clamp(a.probability, b.probability)
            }
        };

        Calibrated {
            probability,
            clamp: None,
        }
    }
}

/// Pool-adjacent-violators fitter.
pub struct IsotonicCalibrator;

#[derive(Debug, Clone, Copy)]
struct Block {
    x_min: f64,
    x_max: f64,
    sum: f64,
    weight: f64,
}

impl Block {
    fn mean(&self) -> f64 {
        self.sum / self.weight
    }
}

impl IsotonicCalibrator {
    /// Fit a non-decreasing map on held-out `(score, outcome)` pairs.
    ///
    /// Duplicate scores are pooled into one observation weighted by their count.
    ///
    /// # Errors
    /// Fails on empty or mismatched input and on non-finite scores.
    pub fn fit(scores: &[f64], outcomes: &[bool]) -> Result<CalibrationMap, CalibrationError> {
        if scores.len() != outcomes.len() {
            return Err(CalibrationError::LengthMismatch {
                scores: scores.len(),
                outcomes: outcomes.len(),
            });
        }
        if scores.is_empty() {
            return Err(CalibrationError::EmptyFitSet);
        }
        if let Some(index) = scores.iter().position(|s| !s.is_finite()) {
            return Err(CalibrationError::NonFinite { index });
        }

        let mut pairs: Vec<(f64, f64)> = scores
            .iter()
            .zip(outcomes)
            .map(|(s, y)| (*s, if *y { 1.0 } else { 0.0 }))
            .collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut blocks: Vec<Block> = Vec::new();
        for (x, y) in pairs {
            match blocks.last_mut() {
                Some(last) if last.x_max == x => {
                    last.sum += y;
                    last.weight += 1.0;
                }
                _ => blocks.push(Block {
                    x_min: x,
                    x_max: x,
                    sum: y,
                    weight: 1.0,
                }),
            }
            // Pool while the newest block violates monotonicity.
            while let [.., prev, tail] = blocks.as_slice() {
                if prev.mean() <= tail.mean() {
                    break;
                }
                let tail = *tail;
                blocks.pop();
                if let Some(prev) = blocks.last_mut() {
                    prev.x_max = tail.x_max;
                    prev.sum += tail.sum;
                    prev.weight += tail.weight;
                }
            }
        }

        let mut breakpoints = Vec::with_capacity(blocks.len() * 2);
        for block in &blocks {
            let probability = block.mean();
            breakpoints.push(Breakpoint {
                raw: block.x_min,
                probability,
            });
            if block.x_max > block.x_min {
                breakpoints.push(Breakpoint {
                    raw: block.x_max,
                    probability,
                });
            }
        }

        tracing::debug!(
            "Fitted isotonic calibration on {} samples ({} blocks)",
            scores.len(),
            blocks.len()
        );
        CalibrationMap::new(breakpoints)
    }
}
