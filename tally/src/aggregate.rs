//! Per-key running statistics and the partial-aggregate merge algebra.
//!
//! An [`Aggregate`] is the running result for one key within one epoch:
//! observation count, optional sum/min/max, Welford mean and variance
//! state, an exact unique-value set, and a bounded sample reservoir.
//! Every update is single-pass: one `observe` call touches each piece of
//! state at most once and never re-looks anything up.
//!
//! [`Aggregate::merge`] combines two partial aggregates for the same key
//! produced over disjoint time windows or by independent observers. The
//! operation is associative and commutative (within floating-point
//! tolerance), with absent optional fields treated as identity, so a
//! coordinator can collect partials in any order and fan-in.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::observation::Observation;
use crate::reservoir::Reservoir;

/// Engine timestamp: nanoseconds since the Unix epoch.
pub type Timestamp = u64;

/// The statistical calculations a filter can request.
///
/// `Avg`, `Variance`, and `StdDev` share Welford state: requesting any of
/// them maintains the running mean, and requesting `Variance` or `StdDev`
/// additionally maintains the running sum of squared deviations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Calc {
    /// Running sum of scalar values.
    Sum,
    /// Minimum scalar value seen.
    Min,
    /// Maximum scalar value seen.
    Max,
    /// Running arithmetic mean (Welford).
    Avg,
    /// Online variance (Welford, population form: `var_s / num`).
    Variance,
    /// Standard deviation, `sqrt(variance)`.
    StdDev,
    /// Exact count of distinct observation values.
    Unique,
}

/// Running per-key statistical state.
///
/// Public fields are the derived, externally visible results; the Welford
/// intermediates, unique-value set, reservoir, and threshold bookkeeping
/// are crate-internal. Optional fields stay `None` until the calculation
/// that produces them is requested and has seen at least one observation
/// — absence is explicit, never a sentinel value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Aggregate {
    /// Timestamp of the first observation in this window.
    pub begin: Timestamp,
    /// Timestamp of the most recent observation in this window.
    pub end: Timestamp,
    /// Number of observations applied.
    pub num: u64,
    /// Running sum, if `Calc::Sum` is tracked.
    pub sum: Option<f64>,
    /// Minimum value, if `Calc::Min` is tracked.
    pub min: Option<f64>,
    /// Maximum value, if `Calc::Max` is tracked.
    pub max: Option<f64>,
    /// Running mean, if any of avg/variance/std-dev is tracked.
    pub avg: Option<f64>,
    /// Derived variance (`var_s / num` for `num > 1`, else 0).
    pub variance: Option<f64>,
    /// Derived standard deviation.
    pub std_dev: Option<f64>,
    /// Derived distinct-value count, if `Calc::Unique` is tracked.
    pub unique: Option<u64>,
    /// Sample snapshot, filled from the reservoir when a threshold fires
    /// or at flush time.
    pub samples: Vec<String>,

    /// Mean before the most recent update (Welford intermediate).
    #[serde(skip)]
    pub(crate) prev_avg: Option<f64>,
    /// Running sum of squared deviations (Welford intermediate).
    #[serde(skip)]
    pub(crate) var_s: Option<f64>,
    /// Exact set backing `unique`. Grows with observed cardinality; the
    /// engine deliberately does not bound it (see DESIGN.md).
    #[serde(skip)]
    pub(crate) unique_vals: HashSet<Observation>,
    /// Live sample reservoir, created lazily on the first text
    /// observation when the filter configures a sample capacity.
    #[serde(skip)]
    pub(crate) reservoir: Option<Reservoir>,
    /// Latch: a direct threshold or threshold predicate already fired for
    /// this window.
    #[serde(skip)]
    pub(crate) threshold_crossed: bool,
    /// Cursor into a filter's ordered threshold series.
    #[serde(skip)]
    pub(crate) threshold_series_index: usize,
}

impl Aggregate {
    /// Creates an empty aggregate whose window starts (and so far ends)
    /// at `now`.
    pub fn new(now: Timestamp) -> Self {
        Self {
            begin: now,
            end: now,
            ..Self::default()
        }
    }

    /// Whether a direct threshold or threshold predicate has already
    /// fired for this window.
    pub fn threshold_crossed(&self) -> bool {
        self.threshold_crossed
    }

    /// The current position in the filter's ordered threshold series.
    pub fn threshold_series_index(&self) -> usize {
        self.threshold_series_index
    }

    /// Applies one observation to this aggregate.
    ///
    /// This is the single-pass hot path: `num` and `end` always advance;
    /// text observations feed the reservoir when `sample_capacity > 0`;
    /// each requested calculation updates its state exactly once; derived
    /// fields are recomputed at the end.
    pub fn observe(
        &mut self,
        obs: &Observation,
        measures: &[Calc],
        sample_capacity: usize,
        now: Timestamp,
    ) {
        let scalar = obs.scalar();
        self.num += 1;
        self.end = now;

        if sample_capacity > 0
            && let Some(text) = obs.text()
        {
            self.reservoir
                .get_or_insert_with(|| Reservoir::new(sample_capacity))
                .push(text);
        }

        if measures.contains(&Calc::Sum) {
            *self.sum.get_or_insert(0.0) += scalar;
        }
        if measures.contains(&Calc::Min) {
            self.min = Some(self.min.map_or(scalar, |m| m.min(scalar)));
        }
        if measures.contains(&Calc::Max) {
            self.max = Some(self.max.map_or(scalar, |m| m.max(scalar)));
        }

        let needs_avg = measures
            .iter()
            .any(|c| matches!(c, Calc::Avg | Calc::Variance | Calc::StdDev));
        let needs_var = measures
            .iter()
            .any(|c| matches!(c, Calc::Variance | Calc::StdDev));
        if needs_avg {
            self.welford_update(scalar, needs_var);
        }

        if measures.contains(&Calc::Unique) {
            self.unique_vals.insert(obs.clone());
        }

        self.finalize_derived();
    }

    /// Welford mean update, optionally accumulating the sum of squared
    /// deviations: `avg += (x - avg) / num`,
    /// `var_s += (x - prev_avg) * (x - avg)`.
    #[allow(clippy::cast_precision_loss)]
    fn welford_update(&mut self, scalar: f64, track_variance: bool) {
        // On the first write prev_avg is seeded with the scalar itself,
        // which makes the first var_s contribution exactly zero.
        let prev = self.avg.unwrap_or(scalar);
        let old = self.avg.unwrap_or(0.0);
        let mean = old + (scalar - old) / self.num as f64;
        if track_variance {
            *self.var_s.get_or_insert(0.0) += (scalar - prev) * (scalar - mean);
        }
        self.prev_avg = Some(prev);
        self.avg = Some(mean);
    }

    /// Recomputes the derived fields from the internal state:
    /// `unique = |unique_vals|`, `variance = var_s / num` when `num > 1`
    /// (else 0), `std_dev = sqrt(variance)`.
    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn finalize_derived(&mut self) {
        if !self.unique_vals.is_empty() {
            self.unique = Some(self.unique_vals.len() as u64);
        }
        if let Some(var_s) = self.var_s {
            let variance = if self.num > 1 {
                var_s / self.num as f64
            } else {
                0.0
            };
            self.variance = Some(variance);
            self.std_dev = Some(variance.sqrt());
        }
    }

    /// Merges two partial aggregates for the same key into a combined one.
    ///
    /// Associative and commutative within floating-point tolerance, with
    /// absence as identity: a field present on only one side passes
    /// through unchanged; a field absent on both sides stays absent.
    ///
    /// The variance recombination deliberately measures each side's
    /// squared mean deviation against the *combined* mean:
    ///
    /// ```text
    /// var_s_c = a.num * (a.var_s/a.num + (a.avg - avg_c)^2)
    ///         + b.num * (b.var_s/b.num + (b.avg - avg_c)^2)
    /// ```
    ///
    /// Distributed peers depend on this exact evaluation order for
    /// numerical compatibility; do not replace it with an algebraically
    /// equivalent form.
    #[allow(clippy::cast_precision_loss)]
    pub fn merge(&self, other: &Aggregate) -> Aggregate {
        let num = self.num + other.num;
        let avg = weighted_mean(self.avg, self.num, other.avg, other.num);
        let prev_avg = weighted_mean(self.prev_avg, self.num, other.prev_avg, other.num);

        let var_s = match (self.var_s, other.var_s) {
            (Some(a), Some(b)) => {
                match (self.avg, other.avg, avg) {
                    (Some(a_avg), Some(b_avg), Some(avg_c)) => {
                        let an = self.num as f64;
                        let bn = other.num as f64;
                        Some(
                            an * (a / an + (a_avg - avg_c).powi(2))
                                + bn * (b / bn + (b_avg - avg_c).powi(2)),
                        )
                    }
                    // var state without a mean cannot occur from observe();
                    // fall back to a plain sum rather than dropping data.
                    _ => Some(a + b),
                }
            }
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        let mut unique_vals = self.unique_vals.clone();
        unique_vals.extend(other.unique_vals.iter().cloned());

        let reservoir = match (&self.reservoir, &other.reservoir) {
            (Some(a), Some(b)) => {
                let mut merged = a.clone();
                merged.merge(b);
                Some(merged)
            }
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        let samples = reservoir.as_ref().map(Reservoir::snapshot).unwrap_or_default();

        let mut merged = Aggregate {
            begin: self.begin.min(other.begin),
            end: self.end.max(other.end),
            num,
            sum: combine(self.sum, other.sum, |a, b| a + b),
            min: combine(self.min, other.min, f64::min),
            max: combine(self.max, other.max, f64::max),
            avg,
            variance: None,
            std_dev: None,
            unique: None,
            samples,
            prev_avg,
            var_s,
            unique_vals,
            reservoir,
            threshold_crossed: self.threshold_crossed || other.threshold_crossed,
            threshold_series_index: self
                .threshold_series_index
                .max(other.threshold_series_index),
        };
        merged.finalize_derived();
        merged
    }
}

/// Combines two optional values, treating absence as identity.
fn combine(a: Option<f64>, b: Option<f64>, f: impl Fn(f64, f64) -> f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(f(a, b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Count-weighted mean of two partial means; pass-through when only one
/// side carries a mean.
#[allow(clippy::cast_precision_loss)]
fn weighted_mean(a: Option<f64>, a_num: u64, b: Option<f64>, b_num: u64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => {
            let total = (a_num + b_num) as f64;
            Some((a * a_num as f64 + b * b_num as f64) / total)
        }
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}
