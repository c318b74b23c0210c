//! Detection pipeline behaviour observed through a running controller.

mod common;

use common::{fast_config, Bench};
use deposit_station::pipeline::{DedupPolicy, ScriptedDecoder};
use std::time::{Duration, Instant};

fn collect_events(bench: &Bench, count: usize) -> Vec<String> {
    (0..count)
        .map(|_| {
            bench
                .controller
                .events()
                .recv_timeout(Duration::from_secs(5))
                .expect("Missing unique barcode event")
                .detection
                .payload
        })
        .collect()
}

#[test]
fn test_clear_on_unique_re_accepts_previous_value() {
    let dir = tempfile::tempdir().unwrap();
    let decoder = ScriptedDecoder::parse("A, A\n\nB\nA\nA\n");
    let bench = Bench::launch(&fast_config(dir.path()), decoder);

    assert_eq!(collect_events(&bench, 3), ["A", "B", "A"]);
    std::thread::sleep(Duration::from_millis(50));
    assert!(bench.controller.events().try_recv().is_err());

    let report = bench.controller.shutdown().unwrap();
    bench.device.shutdown().unwrap();
    assert_eq!(report.consumer.unique, 3);
    assert_eq!(report.consumer.suppressed, 2);
    assert_eq!(report.producer.detections, 5);
}

#[test]
fn test_session_policy_reports_each_value_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config(dir.path());
    config.pipeline.dedup = DedupPolicy::Session;
    let decoder = ScriptedDecoder::parse("A\nB\nA\nC\nB\n");
    let bench = Bench::launch(&config, decoder);

    assert_eq!(collect_events(&bench, 3), ["A", "B", "C"]);
    std::thread::sleep(Duration::from_millis(50));
    assert!(bench.controller.events().try_recv().is_err());

    bench.controller.shutdown().unwrap();
    bench.device.shutdown().unwrap();
}

#[test]
fn test_events_keep_detection_order() {
    let dir = tempfile::tempdir().unwrap();
    let decoder = ScriptedDecoder::parse("X, Y, Z\nW\n");
    let bench = Bench::launch(&fast_config(dir.path()), decoder);

    let ordinals: Vec<u64> = (0..4)
        .map(|_| {
            bench
                .controller
                .events()
                .recv_timeout(Duration::from_secs(5))
                .unwrap()
                .ordinal
        })
        .collect();
    assert_eq!(ordinals, [1, 2, 3, 4]);

    bench.controller.shutdown().unwrap();
    bench.device.shutdown().unwrap();
}

#[test]
fn test_latest_frame_is_published() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::launch(&fast_config(dir.path()), ScriptedDecoder::default());

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut first = None;
    while first.is_none() && Instant::now() < deadline {
        first = bench.controller.latest_frame();
        std::thread::sleep(Duration::from_millis(5));
    }
    let first = first.expect("No frame published");
    assert_eq!((first.width, first.height), (64, 48));

    std::thread::sleep(Duration::from_millis(50));
    let later = bench.controller.latest_frame().unwrap();
    assert!(later.sequence > first.sequence);

    bench.controller.shutdown().unwrap();
    bench.device.shutdown().unwrap();
}

#[test]
fn test_shutdown_is_prompt() {
    let dir = tempfile::tempdir().unwrap();
    let bench = Bench::launch(&fast_config(dir.path()), ScriptedDecoder::default());
    bench.request("*OPC?").unwrap();

    let start = Instant::now();
    bench.controller.shutdown().unwrap();
    bench.device.shutdown().unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed < Duration::from_millis(250), "Shutdown took {elapsed:?}");
}
