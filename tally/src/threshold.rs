//! Threshold evaluation and idempotent firing.
//!
//! Three independent rules decide whether an aggregate has crossed a
//! configured bound: a direct threshold (fires once per epoch, guarded by
//! a latch in the aggregate), an ordered threshold series (each step
//! fires once, in increasing order, deliberately ignoring the latch so
//! higher steps can still fire after a lower one), and a custom predicate
//! (latched like the direct threshold).
//!
//! The `scale` parameter compensates for partial-epoch visibility in
//! mid-epoch distributed checks: a worker that sees a 1/N share of the
//! traffic evaluates with `scale = 1/N`, which divides the watch value up
//! to an approximated full-epoch figure. This is an explicit
//! approximation, not an exact result.

use tracing::trace;

use crate::aggregate::Aggregate;
use crate::filter::Filter;
use crate::observation::Key;

/// Derives the watch value an aggregate is judged by: the unique count
/// if tracked, else the sum, else 0 — unless the filter overrides it
/// with a threshold-value hook.
#[allow(clippy::cast_precision_loss)]
pub fn watch_value(filter: &Filter, key: &Key, agg: &Aggregate) -> f64 {
    match &filter.threshold_value {
        Some(hook) => hook(key, agg),
        None => agg
            .unique
            .map(|u| u as f64)
            .or(agg.sum)
            .unwrap_or(0.0),
    }
}

/// Decides whether the aggregate has crossed one of the filter's
/// configured bounds.
///
/// `scale` in `(0, 1)` divides the watch value to approximate full-epoch
/// visibility from a partial view; any other value leaves it untouched.
/// Returns `true` if any rule fires; the caller is expected to follow up
/// with [`fire`].
pub fn evaluate(filter: &Filter, key: &Key, agg: &Aggregate, scale: f64) -> bool {
    let mut watch = watch_value(filter, key, agg);
    if scale > 0.0 && scale < 1.0 {
        watch /= scale;
    }

    if !agg.threshold_crossed()
        && let Some(threshold) = filter.threshold
        && watch >= threshold
    {
        return true;
    }

    // Series steps ignore the crossed latch: after step N fires, step N+1
    // must still be able to fire later in the same epoch.
    let index = agg.threshold_series_index();
    if index < filter.threshold_series.len() && watch >= filter.threshold_series[index] {
        return true;
    }

    if !agg.threshold_crossed()
        && let Some(predicate) = &filter.threshold_predicate
        && predicate(key, agg)
    {
        return true;
    }

    false
}

/// Fires the filter's threshold-crossed callback for this aggregate.
///
/// No-op when the filter has no callback configured. Otherwise the
/// reservoir is snapshotted into the aggregate's `samples`, the callback
/// is invoked synchronously with a by-value snapshot, the crossed latch
/// is set, and — when a series is configured — the series cursor
/// advances so the next, higher step becomes eligible.
pub fn fire(filter: &Filter, key: &Key, agg: &mut Aggregate) {
    let Some(callback) = &filter.crossed else {
        return;
    };

    if let Some(reservoir) = &agg.reservoir {
        agg.samples = reservoir.snapshot();
    }

    trace!(
        filter = %filter.name,
        key = %key,
        num = agg.num,
        "threshold crossed"
    );

    // Snapshot by value: the callback can keep or mutate its copy without
    // touching the live aggregate.
    let snapshot = agg.clone();
    callback(key, &snapshot);

    agg.threshold_crossed = true;
    if !filter.threshold_series.is_empty() {
        agg.threshold_series_index += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::*;
    use crate::aggregate::Calc;
    use crate::observation::Observation;

    fn feed_sum(n: u64) -> Aggregate {
        let mut agg = Aggregate::new(0);
        for _ in 0..n {
            agg.observe(&Observation::Count(1), &[Calc::Sum], 0, 0);
        }
        agg
    }

    #[test]
    fn test_watch_prefers_unique_over_sum() {
        let filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum, Calc::Unique]);
        let mut agg = Aggregate::new(0);
        for v in [10.0, 10.0, 20.0] {
            agg.observe(
                &Observation::Value(v),
                &[Calc::Sum, Calc::Unique],
                0,
                0,
            );
        }
        // sum = 40, unique = 2: unique wins
        assert_eq!(watch_value(&filter, &Key::name("k"), &agg), 2.0);
    }

    #[test]
    fn test_watch_value_hook_overrides() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold_value = Some(Box::new(|_, agg| agg.num as f64 * 100.0));
        let agg = feed_sum(3);
        assert_eq!(watch_value(&filter, &Key::name("k"), &agg), 300.0);
    }

    #[test]
    fn test_direct_threshold_latches() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold = Some(5.0);
        filter.crossed = Some(Box::new(|_, _| {}));
        let key = Key::name("k");

        let mut agg = feed_sum(5);
        assert!(evaluate(&filter, &key, &agg, 1.0));
        fire(&filter, &key, &mut agg);

        // Latched: more observations past the same threshold do not re-fire
        agg.observe(&Observation::Count(1), &[Calc::Sum], 0, 0);
        assert!(!evaluate(&filter, &key, &agg, 1.0));
    }

    #[test]
    fn test_series_fires_each_step_once_in_order() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold_series = vec![3.0, 6.0, 9.0];
        let fired = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&fired);
        filter.crossed = Some(Box::new(move |_, agg| {
            sink.borrow_mut().push(agg.sum.unwrap());
        }));
        let key = Key::name("k");

        let mut agg = Aggregate::new(0);
        for _ in 0..10 {
            agg.observe(&Observation::Count(1), &[Calc::Sum], 0, 0);
            if evaluate(&filter, &key, &agg, 1.0) {
                fire(&filter, &key, &mut agg);
            }
        }

        // One firing per step, at the first sum reaching each bound
        assert_eq!(*fired.borrow(), vec![3.0, 6.0, 9.0]);
        assert_eq!(agg.threshold_series_index(), 3);

        // Series exhausted: no further firings
        agg.observe(&Observation::Count(1), &[Calc::Sum], 0, 0);
        assert!(!evaluate(&filter, &key, &agg, 1.0));
    }

    #[test]
    fn test_predicate_rule_latches() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold_predicate = Some(Box::new(|_, agg| agg.num >= 2));
        filter.crossed = Some(Box::new(|_, _| {}));
        let key = Key::name("k");

        let mut agg = feed_sum(1);
        assert!(!evaluate(&filter, &key, &agg, 1.0));
        agg.observe(&Observation::Count(1), &[Calc::Sum], 0, 0);
        assert!(evaluate(&filter, &key, &agg, 1.0));
        fire(&filter, &key, &mut agg);
        assert!(!evaluate(&filter, &key, &agg, 1.0));
    }

    #[test]
    fn test_scale_compensates_partial_visibility() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold = Some(10.0);
        let key = Key::name("k");

        // A worker seeing a quarter of the traffic has sum = 3
        let agg = feed_sum(3);
        assert!(!evaluate(&filter, &key, &agg, 1.0));
        // Scaled up by 1/0.25 = 4 => watch 12 >= 10
        assert!(evaluate(&filter, &key, &agg, 0.25));
    }

    #[test]
    fn test_fire_without_callback_is_noop() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold = Some(1.0);
        let key = Key::name("k");

        let mut agg = feed_sum(2);
        fire(&filter, &key, &mut agg);
        // Nothing latched: the rule still evaluates true
        assert!(!agg.threshold_crossed());
        assert!(evaluate(&filter, &key, &agg, 1.0));
    }

    #[test]
    fn test_fire_snapshots_reservoir_into_samples() {
        let mut filter = Filter::new("f", Duration::from_secs(60), vec![Calc::Sum]);
        filter.threshold = Some(1.0);
        filter.samples = 4;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        filter.crossed = Some(Box::new(move |_, agg| {
            sink.borrow_mut().extend(agg.samples.iter().cloned());
        }));
        let key = Key::name("k");

        let mut agg = Aggregate::new(0);
        for user in ["root", "admin"] {
            agg.observe(&Observation::Text(user.to_string()), &[Calc::Sum], 4, 0);
        }
        assert!(evaluate(&filter, &key, &agg, 1.0));
        fire(&filter, &key, &mut agg);

        assert_eq!(*seen.borrow(), vec!["root", "admin"]);
    }
}
