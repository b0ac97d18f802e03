//! Integration tests for threshold detection through the full engine.
//!
//! The canonical scenario: flag any host making 12 or more distinct
//! failed FTP login attempts within a 15-minute epoch, reporting a few
//! of the attempted passwords as evidence.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tally::{Aggregate, Calc, Filter, Key, Manager, Observation};

const BASE: u64 = 1_700_000_000_000_000_000;
const SECOND: u64 = 1_000_000_000;

struct Firing {
    key: Key,
    num: u64,
    unique: Option<u64>,
    samples: Vec<String>,
}

fn bruteforce_filter(fired: &Rc<RefCell<Vec<Firing>>>) -> Filter {
    let mut filter = Filter::new(
        "bruteforcers",
        Duration::from_secs(900),
        vec![Calc::Sum, Calc::Unique],
    );
    filter.threshold = Some(12.0);
    filter.samples = 5;
    let sink = Rc::clone(fired);
    filter.crossed = Some(Box::new(move |key: &Key, agg: &Aggregate| {
        sink.borrow_mut().push(Firing {
            key: key.clone(),
            num: agg.num,
            unique: agg.unique,
            samples: agg.samples.clone(),
        });
    }));
    filter
}

#[test]
fn test_bruteforce_detection_fires_once_per_epoch() {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let mut manager = Manager::new(BASE);
    manager.add_filter("ftp.failed_auth", bruteforce_filter(&fired));

    let attacker = Key::host("203.0.113.9".parse().unwrap());
    let bystander = Key::host("198.51.100.2".parse().unwrap());
    manager.add_data(
        "ftp.failed_auth",
        &bystander,
        &Observation::Text("oops".to_string()),
    );

    // Eleven distinct passwords: below the bound, quiet
    for i in 0..11 {
        manager.add_data(
            "ftp.failed_auth",
            &attacker,
            &Observation::Text(format!("password{i}")),
        );
    }
    assert!(fired.borrow().is_empty());

    // The twelfth distinct attempt crosses, immediately
    manager.add_data(
        "ftp.failed_auth",
        &attacker,
        &Observation::Text("password11".to_string()),
    );
    {
        let firings = fired.borrow();
        assert_eq!(firings.len(), 1);
        assert_eq!(firings[0].key, attacker);
        assert_eq!(firings[0].num, 12);
        assert_eq!(firings[0].unique, Some(12));
        // Reservoir evidence: the five most recent passwords
        assert_eq!(
            firings[0].samples,
            vec!["password7", "password8", "password9", "password10", "password11"]
        );
    }

    // More attempts in the same epoch stay latched
    for i in 12..20 {
        manager.add_data(
            "ftp.failed_auth",
            &attacker,
            &Observation::Text(format!("password{i}")),
        );
    }
    assert_eq!(fired.borrow().len(), 1);
}

#[test]
fn test_epoch_reset_rearms_the_threshold() {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let mut manager = Manager::new(BASE);
    manager.add_filter("ftp.failed_auth", bruteforce_filter(&fired));

    let attacker = Key::host("203.0.113.9".parse().unwrap());
    for i in 0..12 {
        manager.add_data(
            "ftp.failed_auth",
            &attacker,
            &Observation::Text(format!("epoch1-{i}")),
        );
    }
    assert_eq!(fired.borrow().len(), 1);

    // Flush the 15-minute epoch; all per-key state resets
    manager.advance_to(BASE + 900 * SECOND);
    assert!(manager
        .aggregate("ftp.failed_auth", "bruteforcers", &attacker)
        .is_none());

    // A fresh campaign in the next epoch fires again
    for i in 0..12 {
        manager.add_data(
            "ftp.failed_auth",
            &attacker,
            &Observation::Text(format!("epoch2-{i}")),
        );
    }
    let firings = fired.borrow();
    assert_eq!(firings.len(), 2);
    assert_eq!(firings[1].num, 12);
}

#[test]
fn test_repeated_passwords_do_not_count_as_distinct() {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let mut manager = Manager::new(BASE);
    manager.add_filter("ftp.failed_auth", bruteforce_filter(&fired));

    // Twenty attempts but only three distinct passwords: the watch value
    // follows the unique count, not the sum
    let attacker = Key::host("203.0.113.9".parse().unwrap());
    for i in 0..20 {
        manager.add_data(
            "ftp.failed_auth",
            &attacker,
            &Observation::Text(format!("guess{}", i % 3)),
        );
    }
    assert!(fired.borrow().is_empty());
}

#[test]
fn test_threshold_series_escalates_within_one_epoch() {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&fired);

    let mut filter = Filter::new("scanners", Duration::from_secs(60), vec![Calc::Sum]);
    filter.threshold_series = vec![10.0, 100.0, 1000.0];
    filter.crossed = Some(Box::new(move |_, agg: &Aggregate| {
        sink.borrow_mut().push(agg.sum.unwrap());
    }));

    let mut manager = Manager::new(BASE);
    manager.add_filter("scan.attempts", filter);

    let scanner = Key::host("203.0.113.77".parse().unwrap());
    for _ in 0..1200 {
        manager.add_data("scan.attempts", &scanner, &Observation::Count(1));
    }

    // Each escalation step fired exactly once, at its bound
    assert_eq!(*fired.borrow(), vec![10.0, 100.0, 1000.0]);
}

#[test]
fn test_mid_epoch_check_with_partial_visibility() {
    let fired = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&fired);

    let mut filter = Filter::new("heavy", Duration::from_secs(60), vec![Calc::Sum]);
    filter.threshold = Some(100.0);
    filter.crossed = Some(Box::new(move |key: &Key, _| {
        sink.borrow_mut().push(key.clone());
    }));

    // This engine sees a quarter of the traffic; 30 observed implies
    // roughly 120 total, past the bound of 100
    let mut manager = Manager::new(BASE);
    manager.add_filter("conn.count", filter);

    let key = Key::name("total");
    for _ in 0..30 {
        manager.add_data("conn.count", &key, &Observation::Count(1));
    }
    assert!(fired.borrow().is_empty(), "unscaled, 30 < 100");

    let crossed = manager.evaluate_threshold("conn.count", "heavy", &key, 0.25);
    assert!(crossed);
    assert_eq!(*fired.borrow(), vec![key.clone()]);

    // The firing latched: a second probe does not re-fire
    assert!(!manager.evaluate_threshold("conn.count", "heavy", &key, 0.25));
    assert_eq!(fired.borrow().len(), 1);
}

#[test]
fn test_custom_watch_value_and_predicate() {
    let fired = Rc::new(RefCell::new(0u32));
    let sink = Rc::clone(&fired);

    let mut filter = Filter::new("spread", Duration::from_secs(60), vec![Calc::Avg, Calc::StdDev]);
    // Alert when the spread of observed values gets wide
    filter.threshold_predicate = Some(Box::new(|_, agg: &Aggregate| {
        agg.std_dev.is_some_and(|s| s > 40.0)
    }));
    filter.crossed = Some(Box::new(move |_, _| *sink.borrow_mut() += 1));

    let mut manager = Manager::new(BASE);
    manager.add_filter("conn.duration", filter);

    let key = Key::name("k");
    for v in [10.0, 12.0, 11.0] {
        manager.add_data("conn.duration", &key, &Observation::Value(v));
    }
    assert_eq!(*fired.borrow(), 0);

    // An outlier blows the standard deviation past the bound
    manager.add_data("conn.duration", &key, &Observation::Value(200.0));
    assert_eq!(*fired.borrow(), 1);

    // Latched for the rest of the epoch
    manager.add_data("conn.duration", &key, &Observation::Value(500.0));
    assert_eq!(*fired.borrow(), 1);
}
