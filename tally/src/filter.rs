//! Filter configuration types.
//!
//! A [`Filter`] binds one metric to an epoch duration, a set of requested
//! calculations, and optional behavior hooks: an observation predicate,
//! a key transformation (normalize hook XOR aggregation mask), threshold
//! configuration, and flush/crossing callbacks. Hooks are individually
//! optional `Box<dyn Fn>` fields — absence is represented explicitly by
//! `None`, never by a null-ish default implementation.
//!
//! Filters are plain configuration: the registry owns them after
//! registration, together with the aggregate table each one accumulates
//! into.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::aggregate::{Aggregate, Calc, Timestamp};
use crate::error::ConfigError;
use crate::observation::{Key, Observation};

/// Mapping from key to running aggregate for one (metric, filter) pair.
///
/// Entries are created lazily on first observation and the whole table is
/// reset at each epoch boundary.
pub type AggregateTable = HashMap<Key, Aggregate>;

/// Observation predicate: `false` skips the observation for this filter.
pub type PredicateHook = Box<dyn Fn(&Key, &Observation) -> bool>;

/// Key normalize hook: replaces the observation key before aggregation.
pub type NormalizeHook = Box<dyn Fn(&Key) -> Key>;

/// Override for the threshold watch value.
pub type ThresholdValueHook = Box<dyn Fn(&Key, &Aggregate) -> f64>;

/// Custom threshold predicate, checked alongside the numeric thresholds.
pub type ThresholdPredicateHook = Box<dyn Fn(&Key, &Aggregate) -> bool>;

/// Threshold-crossed callback, invoked synchronously with the key and an
/// aggregate snapshot. Must not mutate registry-owned state.
pub type CrossedHook = Box<dyn Fn(&Key, &Aggregate)>;

/// Period-finished callback, invoked once per epoch with the flush
/// timestamp, metric id, filter name, and the finalized table.
pub type PeriodFinishedHook = Box<dyn Fn(Timestamp, &str, &str, &AggregateTable)>;

/// Configuration binding one metric to an epoch, requested calculations,
/// and threshold/rollup behavior.
///
/// Construct with [`Filter::new`] and assign the optional fields
/// directly; everything not set stays inert.
///
/// ```rust
/// use std::time::Duration;
/// use tally::{Calc, Filter};
///
/// let mut filter = Filter::new(
///     "failed-auth",
///     Duration::from_secs(900),
///     vec![Calc::Sum, Calc::Unique],
/// );
/// filter.threshold = Some(12.0);
/// filter.samples = 5;
/// ```
pub struct Filter {
    /// Filter name, unique within its metric.
    pub name: String,
    /// Epoch duration: how often this filter's table is flushed and reset.
    pub every: Duration,
    /// The calculations to maintain per key.
    pub measures: Vec<Calc>,
    /// Internal id; defaults to the metric id at registration when unset.
    pub id: Option<String>,
    /// Observation predicate; `None` accepts everything.
    pub pred: Option<PredicateHook>,
    /// Key normalize hook. Mutually exclusive with `aggregation_mask`.
    pub normalize: Option<NormalizeHook>,
    /// Aggregation mask: prefix length used to collapse host keys onto
    /// their subnet. Mutually exclusive with `normalize`.
    pub aggregation_mask: Option<u8>,
    /// Override for the watch value compared against thresholds.
    pub threshold_value: Option<ThresholdValueHook>,
    /// Direct threshold: fires once per epoch when the watch value
    /// reaches it.
    pub threshold: Option<f64>,
    /// Ordered threshold series: each step fires once, in order.
    pub threshold_series: Vec<f64>,
    /// Custom threshold predicate.
    pub threshold_predicate: Option<ThresholdPredicateHook>,
    /// Threshold-crossed callback.
    pub crossed: Option<CrossedHook>,
    /// Period-finished callback.
    pub period_finished: Option<PeriodFinishedHook>,
    /// Name of the rollup this filter reports into, if any.
    pub rollup: Option<String>,
    /// Sample reservoir capacity; 0 disables sampling.
    pub samples: usize,
}

impl Filter {
    /// Creates a filter with the given name, epoch duration, and
    /// requested calculations; all hooks and thresholds unset.
    pub fn new(name: impl Into<String>, every: Duration, measures: Vec<Calc>) -> Self {
        Self {
            name: name.into(),
            every,
            measures,
            id: None,
            pred: None,
            normalize: None,
            aggregation_mask: None,
            threshold_value: None,
            threshold: None,
            threshold_series: Vec::new(),
            threshold_predicate: None,
            crossed: None,
            period_finished: None,
            rollup: None,
            samples: 0,
        }
    }

    /// Validates this filter's internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NormalizeConflict`] if both the normalize
    /// hook and the aggregation mask are set.
    pub fn validate(&self, metric: &str) -> std::result::Result<(), ConfigError> {
        if self.normalize.is_some() && self.aggregation_mask.is_some() {
            return Err(ConfigError::NormalizeConflict {
                metric: metric.to_string(),
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Applies this filter's key transformation: the normalize hook if
    /// set, else the aggregation mask, else the key unchanged.
    pub(crate) fn transform_key(&self, key: &Key) -> Key {
        if let Some(normalize) = &self.normalize {
            normalize(key)
        } else if let Some(prefix) = self.aggregation_mask {
            key.masked(prefix)
        } else {
            key.clone()
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter")
            .field("name", &self.name)
            .field("every", &self.every)
            .field("measures", &self.measures)
            .field("id", &self.id)
            .field("pred", &self.pred.is_some())
            .field("normalize", &self.normalize.is_some())
            .field("aggregation_mask", &self.aggregation_mask)
            .field("threshold_value", &self.threshold_value.is_some())
            .field("threshold", &self.threshold)
            .field("threshold_series", &self.threshold_series)
            .field("threshold_predicate", &self.threshold_predicate.is_some())
            .field("crossed", &self.crossed.is_some())
            .field("period_finished", &self.period_finished.is_some())
            .field("rollup", &self.rollup)
            .field("samples", &self.samples)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    #[test]
    fn test_validate_rejects_normalize_and_mask() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.normalize = Some(Box::new(|k: &Key| k.clone()));
        filter.aggregation_mask = Some(24);

        let err = filter.validate("metric").unwrap_err();
        assert_eq!(
            err,
            ConfigError::NormalizeConflict {
                metric: "metric".to_string(),
                name: "f".to_string(),
            }
        );
    }

    #[test]
    fn test_validate_accepts_either_transformation_alone() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.aggregation_mask = Some(24);
        assert!(filter.validate("metric").is_ok());

        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.normalize = Some(Box::new(|k: &Key| k.clone()));
        assert!(filter.validate("metric").is_ok());
    }

    #[test]
    fn test_transform_key_prefers_normalize() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.normalize = Some(Box::new(|_| Key::name("fixed")));
        let key = Key::host(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(filter.transform_key(&key), Key::name("fixed"));
    }

    #[test]
    fn test_transform_key_applies_mask() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.aggregation_mask = Some(16);
        let key = Key::host(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));
        let out = filter.transform_key(&key);
        assert!(out.host.is_none());
        assert_eq!(out.net.unwrap().to_string(), "10.1.0.0/16");
    }
}
