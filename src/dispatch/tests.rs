//! Dispatch tests

use std::sync::atomic::AtomicUsize;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use super::*;

fn pattern(filter: &str) -> TopicPattern {
    TopicPattern::parse(filter).unwrap()
}

fn counting_handler(counter: &Arc<AtomicUsize>) -> Handler {
    let counter = counter.clone();
    Arc::new(move |_msg: &Message| -> Result<(), HandlerError> {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

fn recording_handler(log: &Arc<Mutex<Vec<String>>>, name: &'static str) -> Handler {
    let log = log.clone();
    Arc::new(move |msg: &Message| -> Result<(), HandlerError> {
        log.lock().push(format!("{}:{}", name, msg.topic));
        Ok(())
    })
}

#[test]
fn test_match_all_receives_once() {
    let registry = SubscriptionRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));
    registry.insert(TopicPattern::match_all(), QoS::AtMostOnce, counting_handler(&count));

    let report = registry.dispatch(&Message::new("a/b/c", "hey"));

    assert_eq!(report, DispatchReport { matched: 1, failed: 0 });
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fan_out_in_registration_order() {
    let registry = SubscriptionRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));

    registry.insert(pattern("a/+"), QoS::AtMostOnce, recording_handler(&log, "plus"));
    registry.insert(pattern("x/y"), QoS::AtMostOnce, recording_handler(&log, "other"));
    registry.insert(pattern("#"), QoS::AtMostOnce, recording_handler(&log, "all"));
    registry.insert(pattern("a/b"), QoS::AtMostOnce, recording_handler(&log, "exact"));

    let report = registry.dispatch(&Message::new("a/b", "1"));

    assert_eq!(report.matched, 3);
    assert_eq!(
        *log.lock(),
        vec![
            "plus:a/b".to_string(),
            "all:a/b".to_string(),
            "exact:a/b".to_string()
        ]
    );
}

#[test]
fn test_same_pattern_twice_is_not_deduplicated() {
    let registry = SubscriptionRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));

    let (_, first) = registry.insert(pattern("s/#"), QoS::AtMostOnce, counting_handler(&count));
    let (_, second) = registry.insert(pattern("s/#"), QoS::AtMostOnce, counting_handler(&count));
    assert!(first);
    assert!(!second);

    registry.dispatch(&Message::new("s/t", ""));
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[test]
fn test_failing_handler_does_not_stop_siblings() {
    let registry = SubscriptionRegistry::new();
    let mut diagnostics = registry.diagnostics();
    let count = Arc::new(AtomicUsize::new(0));

    registry.insert(pattern("#"), QoS::AtMostOnce, counting_handler(&count));
    let (failing, _) = registry.insert(
        pattern("#"),
        QoS::AtMostOnce,
        Arc::new(|_msg: &Message| -> Result<(), HandlerError> {
            Err(HandlerError::new("bad payload"))
        }),
    );
    registry.insert(pattern("#"), QoS::AtMostOnce, counting_handler(&count));

    let report = registry.dispatch(&Message::new("t", "x"));

    assert_eq!(report, DispatchReport { matched: 3, failed: 1 });
    assert_eq!(report.delivered(), 2);
    assert_eq!(count.load(Ordering::SeqCst), 2);

    let failure = diagnostics.try_recv().unwrap();
    assert_eq!(failure.subscription, failing);
    assert_eq!(failure.topic, "t");
    assert_eq!(failure.error.message(), "bad payload");
    assert!(!failure.panicked);
}

#[test]
fn test_panicking_handler_is_contained() {
    let registry = SubscriptionRegistry::new();
    let mut diagnostics = registry.diagnostics();
    let count = Arc::new(AtomicUsize::new(0));

    registry.insert(
        pattern("dwm/#"),
        QoS::AtMostOnce,
        Arc::new(|_msg: &Message| -> Result<(), HandlerError> { panic!("boom") }),
    );
    registry.insert(pattern("dwm/#"), QoS::AtMostOnce, counting_handler(&count));

    let report = registry.dispatch(&Message::new("dwm/node/1/uplink", "{}"));

    assert_eq!(report.failed, 1);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let failure = diagnostics.try_recv().unwrap();
    assert!(failure.panicked);
    assert_eq!(failure.error.message(), "boom");
}

#[test]
fn test_no_match() {
    let registry = SubscriptionRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));
    registry.insert(pattern("a/+/c"), QoS::AtMostOnce, counting_handler(&count));

    assert_eq!(registry.dispatch(&Message::new("a/b", "")).matched, 0);
    assert_eq!(registry.dispatch(&Message::new("a/b/c/d", "")).matched, 0);
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[test]
fn test_remove_is_idempotent_and_reports_last() {
    let registry = SubscriptionRegistry::new();
    let count = Arc::new(AtomicUsize::new(0));

    let (a, _) = registry.insert(pattern("x/#"), QoS::AtMostOnce, counting_handler(&count));
    let (b, _) = registry.insert(pattern("x/#"), QoS::AtLeastOnce, counting_handler(&count));

    assert_eq!(
        registry.remove(a),
        Some(Removed {
            filter: "x/#".to_string(),
            last_for_filter: false
        })
    );
    assert_eq!(registry.remove(a), None);
    assert!(registry.contains(b));

    let removed = registry.remove(b).unwrap();
    assert!(removed.last_for_filter);
    assert!(registry.is_empty());
}

#[test]
fn test_filters_take_highest_qos() {
    let registry = SubscriptionRegistry::new();
    let noop: Handler = Arc::new(|_msg: &Message| -> Result<(), HandlerError> { Ok(()) });

    registry.insert(pattern("a/#"), QoS::AtMostOnce, noop.clone());
    registry.insert(pattern("b"), QoS::AtLeastOnce, noop.clone());
    registry.insert(pattern("a/#"), QoS::ExactlyOnce, noop);

    assert_eq!(
        registry.filters(),
        vec![
            ("a/#".to_string(), QoS::ExactlyOnce),
            ("b".to_string(), QoS::AtLeastOnce)
        ]
    );
    assert_eq!(registry.qos_for("b"), Some(QoS::AtLeastOnce));
    assert_eq!(registry.qos_for("c"), None);
}

#[test]
fn test_handler_may_touch_registry() {
    let registry = Arc::new(SubscriptionRegistry::new());
    let r = registry.clone();
    registry.insert(
        pattern("#"),
        QoS::AtMostOnce,
        Arc::new(move |_msg: &Message| -> Result<(), HandlerError> {
            // Registry lock is not held during dispatch
            assert_eq!(r.len(), 1);
            Ok(())
        }),
    );

    assert_eq!(registry.dispatch(&Message::new("t", "")).failed, 0);
    assert_eq!(registry.clear(), 1);
}
