//! Cross-filter rollups.
//!
//! A rollup is a named merge group: several filters (typically the same
//! measurement taken by different observers or under different
//! predicates) report their per-key epoch results into it, and once every
//! member has reported a key, the merged aggregate is handed to the
//! rollup callback — once per key per epoch. Members must share an epoch
//! duration; this is checked when a filter joins at registration time,
//! never at merge time.
//!
//! Members also share an epoch *phase*: the first member to join anchors
//! the rollup's flush grid, and later members get their first deadline on
//! that grid regardless of when they register. All member flushes for an
//! epoch therefore carry the same timestamp, which is what lets the
//! pending slots match feeds up by flush time.

use std::collections::HashMap;
use std::time::Duration;

use crate::aggregate::{Aggregate, Timestamp};
use crate::error::ConfigError;
use crate::observation::Key;

/// Rollup callback, invoked once per key after all member filters have
/// reported that key for the epoch.
pub type RollupHook = Box<dyn Fn(&Key, &Aggregate)>;

/// Per-key accumulation state for the current epoch.
#[derive(Debug)]
struct Pending {
    /// How many member filters have reported this key so far.
    reported: usize,
    /// Merged partial result.
    agg: Aggregate,
}

/// A named cross-filter merge group.
pub(crate) struct Rollup {
    name: String,
    callback: RollupHook,
    /// Number of member filters; fixed once setup is complete.
    members: usize,
    /// Epoch duration shared by all members; established by the first
    /// member to join.
    every: Option<Duration>,
    /// Registration time of the first member; origin of the shared flush
    /// grid all members are scheduled on.
    anchor: Option<Timestamp>,
    /// Flush timestamp the pending slots belong to. A feed from a newer
    /// epoch discards leftovers from members that skipped a key.
    epoch: Option<Timestamp>,
    pending: HashMap<Key, Pending>,
}

impl Rollup {
    /// Creates an empty rollup with no members.
    pub fn new(name: impl Into<String>, callback: RollupHook) -> Self {
        Self {
            name: name.into(),
            callback,
            members: 0,
            every: None,
            anchor: None,
            epoch: None,
            pending: HashMap::new(),
        }
    }

    /// Adds a member filter with the given epoch duration.
    ///
    /// The first member establishes the rollup's epoch; later members
    /// must match it.
    pub fn join(&mut self, filter_name: &str, every: Duration) -> Result<(), ConfigError> {
        match self.every {
            None => self.every = Some(every),
            Some(expected) if expected != every => {
                return Err(ConfigError::EpochMismatch {
                    name: filter_name.to_string(),
                    rollup: self.name.clone(),
                    every,
                    expected,
                });
            }
            Some(_) => {}
        }
        self.members += 1;
        Ok(())
    }

    /// First epoch deadline for a member joining at `now`, on the
    /// rollup's shared flush grid.
    ///
    /// The first member anchors the grid at its registration time; later
    /// members get the next grid point strictly after their own `now`.
    /// Keeping every member on one grid means all flushes for an epoch
    /// share a timestamp, so [`Rollup::feed`] can match them up.
    pub fn first_deadline(&mut self, now: Timestamp, every_nanos: u64) -> Timestamp {
        let anchor = *self.anchor.get_or_insert(now);
        let elapsed = now - anchor;
        anchor + every_nanos * (elapsed / every_nanos + 1)
    }

    /// Accepts one member filter's epoch result for a key, flushed at
    /// `at`.
    ///
    /// The result is merged into the key's pending slot; when the last
    /// member reports, the callback fires with the combined aggregate and
    /// the slot is cleared. A feed from a newer epoch drops any keys left
    /// incomplete by the previous one.
    pub fn feed(&mut self, at: Timestamp, key: &Key, agg: &Aggregate) {
        if self.epoch != Some(at) {
            self.pending.clear();
            self.epoch = Some(at);
        }

        let complete = {
            let slot = self
                .pending
                .entry(key.clone())
                .or_insert_with(|| Pending {
                    reported: 0,
                    agg: Aggregate::default(),
                });
            slot.agg = if slot.reported == 0 {
                agg.clone()
            } else {
                slot.agg.merge(agg)
            };
            slot.reported += 1;
            slot.reported >= self.members
        };

        if complete
            && let Some(slot) = self.pending.remove(key)
        {
            (self.callback)(key, &slot.agg);
        }
    }
}

impl std::fmt::Debug for Rollup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rollup")
            .field("name", &self.name)
            .field("members", &self.members)
            .field("every", &self.every)
            .field("pending", &self.pending.len())
            .finish()
    }
}
