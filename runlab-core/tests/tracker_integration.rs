//! Integration tests for the tracker.
//!
//! These drive whole training-loop shapes through a `RecordingSink` and check
//! what reaches the console and the metric writers.

use pretty_assertions::assert_eq;
use runlab_core::{
    Delivery, IndicatorSpec, InterruptHub, JsonlMetricWriter, RecordingSink, Sample,
    SectionOptions, Tracker, TrackerSettings,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn tracker() -> (Tracker, RecordingSink) {
    let sink = RecordingSink::new();
    let settings = TrackerSettings {
        redraw_interval: Duration::ZERO,
        print_iteration_time: false,
        ..TrackerSettings::default()
    };
    (Tracker::with_settings(sink.clone(), settings), sink)
}

fn counting_hub() -> (Arc<InterruptHub>, Arc<AtomicUsize>) {
    let fallbacks = Arc::new(AtomicUsize::new(0));
    let counter = fallbacks.clone();
    let hub = InterruptHub::with_fallback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    (Arc::new(hub), fallbacks)
}

#[test]
fn test_second_write_is_independent_of_first() {
    let (tracker, _sink) = tracker();
    tracker.register(IndicatorSpec::scalar("x")).unwrap();

    tracker.store_all([("x", 1)]).unwrap();
    tracker.write();
    tracker.store_all([("x", 3)]).unwrap();
    tracker.write();

    let summary = tracker.last_summary();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].value, 3.0);
}

#[test]
fn test_training_loop_shape() {
    let (tracker, sink) = tracker();
    tracker.register(IndicatorSpec::queue("loss.train", 10)).unwrap();
    tracker.register(IndicatorSpec::scalar("accuracy.*")).unwrap();

    for _epoch in tracker.loop_steps(1..4) {
        {
            let _train = tracker.section("Train", SectionOptions::new().untimed());
            for batch in tracker.iterate("batches", 0..5).silent() {
                tracker.store("loss.train", 1.0 / (batch + 1) as f64).unwrap();
            }
        }
        {
            let _valid = tracker.section("Valid", SectionOptions::new().untimed());
            tracker.store("accuracy.valid", 0.5).unwrap();
        }
        tracker.write();
    }

    let lines = sink.lines();
    assert_eq!(lines.len(), 3);
    assert_eq!(
        lines[0],
        "       1:  Train: DONE  Valid: DONE   loss.train: 0.4567 accuracy.valid: 0.5000"
    );
    assert!(lines[2].starts_with("       3:  Train: DONE  Valid: DONE  "));
    assert_eq!(tracker.global_step(), 3);
    assert_eq!(tracker.section_depth(), 0);
}

#[test]
fn test_interrupt_mid_iteration_finishes_the_iteration() {
    let (tracker, _sink) = tracker();
    let (hub, fallbacks) = counting_hub();
    let mut completed = Vec::new();

    for step in tracker.loop_count(10) {
        let guard = tracker.delayed_interrupt(&hub);
        if step == 2 {
            assert_eq!(hub.deliver(), Delivery::Deferred);
        }
        // The body keeps running after the interrupt.
        let work = tracker.section("Work", SectionOptions::new());
        completed.push(step);
        drop(work);
        drop(guard);
    }

    assert_eq!(completed, vec![0, 1, 2]);
    assert_eq!(fallbacks.load(Ordering::SeqCst), 0);
    assert_eq!(hub.armed(), 0);
}

#[test]
fn test_interrupt_between_iterations_uses_fallback() {
    let (tracker, _sink) = tracker();
    let (hub, fallbacks) = counting_hub();

    for _ in tracker.loop_count(2) {
        let _guard = tracker.delayed_interrupt(&hub);
    }
    hub.deliver();
    assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
}

#[test]
fn test_jsonl_writer_receives_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.jsonl");
    let (tracker, _sink) = tracker();
    tracker.add_writer(Box::new(JsonlMetricWriter::open(&path).unwrap()));
    tracker.register(IndicatorSpec::histogram("grad.*")).unwrap();
    tracker.register(IndicatorSpec::scalar("loss")).unwrap();

    for step in tracker.loop_count(3) {
        tracker
            .write_values([
                ("grad.fc1", Sample::Array(vec![0.1, 0.2])),
                ("loss", Sample::Scalar(step as f64)),
            ])
            .unwrap();
    }
    tracker.flush_writers();

    let records = runlab_core::writer::read_jsonl(&path).unwrap();
    let steps: Vec<u64> = records.iter().map(|r| r.step).collect();
    assert_eq!(steps, vec![0, 1, 2]);
    assert_eq!(records[2].scalars["loss"], 2.0);
    assert_eq!(records[0].histograms["grad.fc1"], vec![0.1, 0.2]);
}

#[test]
fn test_auto_register_from_settings() {
    let sink = RecordingSink::new();
    let tracker = Tracker::with_settings(
        sink,
        TrackerSettings {
            auto_register: true,
            ..TrackerSettings::default()
        },
    );
    tracker.store("surprise", 4.0).unwrap();
    tracker.write();
    assert_eq!(tracker.last_summary()[0].name, "surprise");
}

#[test]
fn test_sections_outside_loop_keep_nesting() {
    let (tracker, sink) = tracker();
    let result: Result<(), String> =
        tracker.section_scope("Prepare", SectionOptions::new().untimed(), || {
            let _download = tracker.section("Download", SectionOptions::new().untimed());
            Ok(())
        });
    result.unwrap();
    tracker.info([("checkpoint", "none")]);

    assert_eq!(
        sink.lines(),
        vec![
            "Prepare...".to_string(),
            "  Download...[DONE]".to_string(),
            "Prepare...[DONE]".to_string(),
            "checkpoint: none".to_string(),
        ]
    );
}
