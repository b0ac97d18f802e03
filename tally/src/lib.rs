//! # tally
//!
//! Embedded metrics aggregation engine for network security monitors.
//!
//! tally turns a stream of keyed observations ("host 10.0.0.5 failed an
//! FTP login with password `hunter2`") into bounded per-key statistics
//! over fixed time epochs, with threshold detection that fires exactly
//! once per configured bound per epoch. State is strictly bounded by the
//! key population, never by observation volume: each key carries a small
//! running aggregate plus an optional FIFO sample reservoir.
//!
//! Partial aggregates merge associatively and commutatively, including
//! the variance recombination, so several engines can observe disjoint
//! traffic shares and their flushed results combine into exact totals.
//!
//! ## Key Properties
//!
//! - Single-pass accumulation: one observation updates every requested
//!   calculation (sum, min, max, mean, variance, unique count) at once
//! - Welford mean/variance with lossless parallel recombination
//! - Idempotent thresholds: direct, ordered series, and custom predicate
//! - Cooperative time: the host drives the clock, epochs flush in order
//! - No background threads, no locks, no unbounded growth
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tally::{Calc, Filter, Key, Manager, Observation};
//!
//! let mut manager = Manager::new(0);
//!
//! // Flag hosts making 12+ distinct failed-login attempts per 15 min
//! let mut filter = Filter::new(
//!     "failed-auth",
//!     Duration::from_secs(900),
//!     vec![Calc::Sum, Calc::Unique],
//! );
//! filter.threshold = Some(12.0);
//! filter.samples = 5;
//! filter.crossed = Some(Box::new(|key, agg| {
//!     println!("{key}: {} attempts, e.g. {:?}", agg.num, agg.samples);
//! }));
//! manager.add_filter("ftp.failed_auth", filter);
//!
//! let attacker = Key::host("10.0.0.5".parse().unwrap());
//! for i in 0..12 {
//!     manager.add_data(
//!         "ftp.failed_auth",
//!         &attacker,
//!         &Observation::Text(format!("password{i}")),
//!     );
//! }
//!
//! // Move the clock past the epoch boundary to flush and reset
//! manager.advance_to(900_000_000_000);
//! ```
//!
//! ## Architecture
//!
//! - [`Manager`] — Top-level engine; registry, accumulator, flush cycle
//! - [`Filter`] — Per-metric configuration: epoch, calculations, hooks
//! - [`Aggregate`] — Per-key running statistics with mergeable internals
//! - [`Key`] / [`Observation`] — The observation stream's vocabulary
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`manager`] — Registry, accumulator, epoch flushing
//! - [`filter`] — Filter configuration and hook types
//! - [`aggregate`] — Running statistics and merge algebra
//! - [`threshold`] — Threshold rules and idempotent firing
//! - [`observation`] — Keys, subnets, observations
//! - [`reservoir`] — Bounded FIFO sample reservoir
//! - [`error`] — Error types
//!
//! Timestamps are engine-clock nanoseconds ([`Timestamp`]); the engine
//! never reads wall-clock time itself.

pub mod aggregate;
pub mod error;
pub mod filter;
pub mod manager;
pub mod observation;
pub mod reservoir;
pub mod threshold;

mod rollup;
mod scheduler;

// Re-export primary API types at crate root for convenience.
pub use aggregate::{Aggregate, Calc, Timestamp};
pub use error::{ConfigError, Result, TallyError};
pub use filter::{AggregateTable, Filter};
pub use manager::{FlushRecord, FlushSink, Manager, UpdateHook};
pub use observation::{Key, Observation, Subnet};
pub use reservoir::Reservoir;
pub use rollup::RollupHook;
