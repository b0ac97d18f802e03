//! The metrics manager: filter registry, accumulator, and flush cycle.
//!
//! The [`Manager`] is the single owner of all mutable engine state:
//! filters grouped by metric id, the aggregate table behind each filter,
//! the rollup registry, the epoch scheduler, and the flush sink. All
//! mutation flows through `&mut self`, which enforces the engine's
//! single-logical-writer contract — observations and flushes for a
//! filter can never overlap, so no internal locking exists. Hosts with
//! real threads wrap the manager in their own mutex.
//!
//! The engine clock is cooperative: the host calls
//! [`Manager::advance_to`] to move time forward, and due epoch timers
//! fire during that call, in deadline order. There is no way to
//! unregister a filter or cancel a pending flush; epochs always fire.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use tally::{Calc, Filter, Key, Manager, Observation};
//!
//! let mut manager = Manager::new(0);
//!
//! let mut filter = Filter::new(
//!     "failed-auth",
//!     Duration::from_secs(900),
//!     vec![Calc::Sum, Calc::Unique],
//! );
//! filter.threshold = Some(12.0);
//! filter.crossed = Some(Box::new(|key, agg| {
//!     println!("{key} crossed with {} attempts", agg.num);
//! }));
//! manager.add_filter("ftp.failed_auth", filter);
//!
//! let key = Key::host("10.0.0.5".parse().unwrap());
//! manager.add_data(
//!     "ftp.failed_auth",
//!     &key,
//!     &Observation::Text("password1".to_string()),
//! );
//!
//! // Fire the 15-minute epoch
//! manager.advance_to(900_000_000_000);
//! ```

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::aggregate::{Aggregate, Timestamp};
use crate::error::ConfigError;
use crate::filter::{AggregateTable, Filter};
use crate::observation::{Key, Observation};
use crate::rollup::{Rollup, RollupHook};
use crate::scheduler::{Deadline, EpochScheduler};
use crate::threshold;

/// Flush sink: receives one record per key at each epoch boundary. The
/// downstream collaborator owns durability, rotation, and format.
pub type FlushSink = Box<dyn FnMut(FlushRecord)>;

/// Per-update extensibility hook, invoked with the filter, the
/// (transformed) key, and the freshly updated aggregate after every
/// applied observation. This is the observation point a hosting cluster
/// layer uses to ship partial state.
pub type UpdateHook = Box<dyn Fn(&Filter, &Key, &Aggregate)>;

/// One flushed per-key result, emitted to the sink at an epoch boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushRecord {
    /// The timestamp the epoch fired at.
    pub timestamp: Timestamp,
    /// The filter's epoch duration.
    #[serde(with = "duration_serde")]
    pub every: Duration,
    /// The metric the filter is registered against.
    pub metric_id: String,
    /// The filter name.
    pub filter_name: String,
    /// The aggregation key.
    pub key: Key,
    /// The finalized aggregate for this key and epoch.
    pub aggregate: Aggregate,
}

/// A registered filter together with the aggregate table it accumulates
/// into. The table is exclusively owned here until flush, when snapshots
/// are handed downstream by value.
#[derive(Debug)]
struct FilterEntry {
    filter: Filter,
    table: AggregateTable,
}

/// The statistics engine: filter registry, accumulator, threshold
/// evaluation, epoch flushing, and rollup coordination.
pub struct Manager {
    /// Filters grouped by metric id, in registration order.
    filters: HashMap<String, Vec<FilterEntry>>,
    /// Registered (metric id, filter name) pairs, for duplicate checks.
    names: HashSet<(String, String)>,
    /// Rollups by name.
    rollups: HashMap<String, Rollup>,
    /// Pending epoch deadlines.
    scheduler: EpochScheduler,
    /// Flush sink, if installed.
    sink: Option<FlushSink>,
    /// Per-update extensibility hook, if installed.
    on_update: Option<UpdateHook>,
    /// The engine clock; moves forward via [`Manager::advance_to`].
    now: Timestamp,
}

impl Manager {
    /// Creates an engine whose clock starts at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            filters: HashMap::new(),
            names: HashSet::new(),
            rollups: HashMap::new(),
            scheduler: EpochScheduler::new(),
            sink: None,
            on_update: None,
            now: start,
        }
    }

    /// The engine's current clock value.
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Installs the flush sink. Replaces any previous sink.
    pub fn set_flush_sink(&mut self, sink: FlushSink) {
        self.sink = Some(sink);
    }

    /// Installs the per-update extensibility hook. Replaces any previous
    /// hook.
    pub fn set_update_hook(&mut self, hook: UpdateHook) {
        self.on_update = Some(hook);
    }

    /// Registers a filter for a metric, reporting failures as non-fatal
    /// warnings.
    ///
    /// Callers that need to distinguish success from rejection use
    /// [`Manager::try_add_filter`]; this variant matches the engine's
    /// external contract — registration failures surface on the warning
    /// channel and never as hard errors.
    pub fn add_filter(&mut self, metric_id: &str, filter: Filter) {
        if let Err(err) = self.try_add_filter(metric_id, filter) {
            warn!(metric = metric_id, error = %err, "filter registration rejected");
        }
    }

    /// Registers a filter for a metric.
    ///
    /// On success the filter's internal id defaults to the metric id if
    /// unset, an empty aggregate table is created, and the first epoch
    /// timer is scheduled `every` from now — or, for rollup members, at
    /// the next point on the rollup's shared flush grid. On failure the
    /// engine is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NormalizeConflict`] if the filter sets both a
    ///   normalize hook and an aggregation mask
    /// - [`ConfigError::DuplicateFilter`] if the (metric, name) pair is
    ///   already registered
    /// - [`ConfigError::UnknownRollup`] if the filter names a rollup that
    ///   does not exist
    /// - [`ConfigError::EpochMismatch`] if the filter's epoch conflicts
    ///   with the rollup's established epoch
    pub fn try_add_filter(
        &mut self,
        metric_id: &str,
        mut filter: Filter,
    ) -> std::result::Result<(), ConfigError> {
        filter.validate(metric_id)?;

        let name_key = (metric_id.to_string(), filter.name.clone());
        if self.names.contains(&name_key) {
            return Err(ConfigError::DuplicateFilter {
                metric: metric_id.to_string(),
                name: filter.name.clone(),
            });
        }

        // Joining the rollup is the last fallible step, so a rejection
        // here leaves no partial state behind. Rollup members are
        // scheduled on the rollup's shared flush grid instead of their
        // own registration time, so every member's epochs carry the same
        // timestamps no matter when it joined.
        let mut first_fire = self.now + epoch_nanos(filter.every);
        if let Some(rollup_name) = &filter.rollup {
            let Some(rollup) = self.rollups.get_mut(rollup_name) else {
                return Err(ConfigError::UnknownRollup {
                    name: filter.name.clone(),
                    rollup: rollup_name.clone(),
                });
            };
            rollup.join(&filter.name, filter.every)?;
            first_fire = rollup.first_deadline(self.now, epoch_nanos(filter.every));
        }

        if filter.id.is_none() {
            filter.id = Some(metric_id.to_string());
        }

        self.names.insert(name_key);
        let entries = self.filters.entry(metric_id.to_string()).or_default();
        let index = entries.len();
        entries.push(FilterEntry {
            filter,
            table: AggregateTable::new(),
        });
        self.scheduler
            .schedule(first_fire, metric_id.to_string(), index);
        Ok(())
    }

    /// Whether a filter with this (metric, name) pair is registered.
    pub fn has_filter(&self, metric_id: &str, filter_name: &str) -> bool {
        self.names
            .contains(&(metric_id.to_string(), filter_name.to_string()))
    }

    /// Creates a cross-filter rollup, reporting a duplicate name as a
    /// non-fatal warning.
    pub fn create_index_rollup(&mut self, name: &str, callback: RollupHook) {
        if let Err(err) = self.try_create_index_rollup(name, callback) {
            warn!(rollup = name, error = %err, "rollup registration rejected");
        }
    }

    /// Creates a cross-filter rollup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::DuplicateRollup`] if the name is taken.
    pub fn try_create_index_rollup(
        &mut self,
        name: &str,
        callback: RollupHook,
    ) -> std::result::Result<(), ConfigError> {
        if self.rollups.contains_key(name) {
            return Err(ConfigError::DuplicateRollup {
                name: name.to_string(),
            });
        }
        self.rollups
            .insert(name.to_string(), Rollup::new(name, callback));
        Ok(())
    }

    /// Applies one keyed observation.
    ///
    /// Unknown metric ids are a legitimate no-op. For every filter on the
    /// metric, independently: the predicate can skip the observation, the
    /// key is transformed (normalize hook XOR aggregation mask), the
    /// aggregate is created lazily with `begin = end = now`, the
    /// requested calculations are updated in a single pass, the update
    /// hook observes the new state, and the thresholds are checked and
    /// fired immediately.
    pub fn add_data(&mut self, metric_id: &str, key: &Key, obs: &Observation) {
        let now = self.now;
        let Self {
            filters, on_update, ..
        } = self;
        let Some(entries) = filters.get_mut(metric_id) else {
            return;
        };

        for entry in entries.iter_mut() {
            let filter = &entry.filter;
            if let Some(pred) = &filter.pred
                && !pred(key, obs)
            {
                continue;
            }

            let key = filter.transform_key(key);
            let agg = entry
                .table
                .entry(key.clone())
                .or_insert_with(|| Aggregate::new(now));
            agg.observe(obs, &filter.measures, filter.samples, now);

            if let Some(hook) = on_update {
                hook(filter, &key, agg);
            }

            if threshold::evaluate(filter, &key, agg, 1.0) {
                threshold::fire(filter, &key, agg);
            }
        }
    }

    /// Evaluates a filter's threshold for one key mid-epoch, firing the
    /// crossed callback if a rule matches.
    ///
    /// `scale` in `(0, 1)` compensates for partial-epoch visibility: a
    /// coordinator probing a worker that sees a 1/N traffic share passes
    /// `scale = 1/N` to approximate the full-epoch watch value. Returns
    /// whether a rule matched; `false` for unknown filters or keys.
    pub fn evaluate_threshold(
        &mut self,
        metric_id: &str,
        filter_name: &str,
        key: &Key,
        scale: f64,
    ) -> bool {
        let Some(entries) = self.filters.get_mut(metric_id) else {
            return false;
        };
        let Some(entry) = entries.iter_mut().find(|e| e.filter.name == filter_name) else {
            return false;
        };
        let filter = &entry.filter;
        let Some(agg) = entry.table.get_mut(key) else {
            return false;
        };

        let crossed = threshold::evaluate(filter, key, agg, scale);
        if crossed {
            threshold::fire(filter, key, agg);
        }
        crossed
    }

    /// Reads the live aggregate for a key, if one exists this epoch.
    ///
    /// Intended for cluster layers that snapshot partial state for
    /// merging; the returned reference must not outlive the next mutation.
    pub fn aggregate(&self, metric_id: &str, filter_name: &str, key: &Key) -> Option<&Aggregate> {
        self.filters
            .get(metric_id)?
            .iter()
            .find(|e| e.filter.name == filter_name)?
            .table
            .get(key)
    }

    /// The timestamp of the next pending epoch flush, if any filter is
    /// registered.
    pub fn next_epoch(&self) -> Option<Timestamp> {
        self.scheduler.next_deadline()
    }

    /// Moves the engine clock forward to `now`, firing every epoch timer
    /// that became due, in deadline order.
    ///
    /// A large jump fires multiple epochs for the same filter back to
    /// back, one flush per elapsed epoch. Moving backwards is a no-op on
    /// the clock but still drains deadlines due at the current time.
    pub fn advance_to(&mut self, now: Timestamp) {
        if now > self.now {
            self.now = now;
        }
        while let Some(deadline) = self.scheduler.pop_due(self.now) {
            self.flush(deadline);
        }
    }

    /// Flushes one filter's table: finalize every aggregate, emit flush
    /// records, feed the rollup, invoke the period-finished callback with
    /// the finalized table, reset the table, and schedule the next epoch.
    fn flush(&mut self, deadline: Deadline) {
        let Deadline { at, metric, index } = deadline;
        let Self {
            filters,
            rollups,
            scheduler,
            sink,
            ..
        } = self;
        let Some(entry) = filters.get_mut(&metric).and_then(|f| f.get_mut(index)) else {
            return;
        };
        let filter = &entry.filter;

        debug!(
            metric = %metric,
            filter = %filter.name,
            keys = entry.table.len(),
            "epoch flush"
        );

        let table = std::mem::take(&mut entry.table);
        let mut finalized = AggregateTable::with_capacity(table.len());
        for (key, mut agg) in table {
            agg.finalize_derived();
            if let Some(reservoir) = &agg.reservoir {
                agg.samples = reservoir.snapshot();
            }

            if let Some(sink) = sink {
                sink(FlushRecord {
                    timestamp: at,
                    every: filter.every,
                    metric_id: metric.clone(),
                    filter_name: filter.name.clone(),
                    key: key.clone(),
                    aggregate: agg.clone(),
                });
            }

            if let Some(rollup_name) = &filter.rollup
                && let Some(rollup) = rollups.get_mut(rollup_name)
            {
                rollup.feed(at, &key, &agg);
            }

            finalized.insert(key, agg);
        }

        if let Some(period_finished) = &filter.period_finished {
            period_finished(at, &metric, &filter.name, &finalized);
        }

        scheduler.schedule(at + epoch_nanos(filter.every), metric, index);
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("filters", &self.filters)
            .field("rollups", &self.rollups.len())
            .field("pending_epochs", &self.scheduler.len())
            .field("sink", &self.sink.is_some())
            .field("now", &self.now)
            .finish()
    }
}

/// Converts an epoch duration to engine-clock nanoseconds.
#[allow(clippy::cast_possible_truncation)] // epochs beyond ~584 years are impractical
fn epoch_nanos(every: Duration) -> u64 {
    every.as_nanos() as u64
}

/// Serde support for Duration fields.
///
/// Durations are serialized as total seconds (f64) for human readability
/// in emitted records.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(seconds))
    }
}
