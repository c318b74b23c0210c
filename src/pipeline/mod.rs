//! Detection pipeline: frames in, unique barcodes out.
//!
//! Two loops share a [`WorkQueue`] of [`Detection`]s:
//!
//! - the **producer** ([`run_producer`]) acquires frames, publishes each to the
//!   latest-wins [`FrameCell`], decodes it and enqueues every decoded payload
//! - the **consumer** ([`run_consumer`]) pops detections in arrival order, filters them
//!   through a [`Deduplicator`] and emits a [`UniqueBarcode`] for each accepted value
//!
//! Only the consumer touches the dedup set, so decisions are serialized without locks.

pub mod dedup;
pub mod source;

pub use dedup::{DedupPolicy, Deduplicator};
pub use source::{BarcodeDecoder, Decoded, Frame, FrameSource, ScriptedDecoder, SyntheticCamera};

use crate::error::StationResult;
use crate::queue::{LatestCell, QueueSender, Recv, WorkQueue};
use crate::shutdown::StopSignal;
use chrono::{DateTime, Local};
use crossbeam_channel::Sender;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// The current camera frame, shared latest-wins with any viewer.
pub type FrameCell = LatestCell<Frame>;

/// A decoded payload as it travels through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Decoded barcode text
    pub payload: String,
    /// Symbology reported by the decoder
    pub symbology: Option<String>,
    /// Wall-clock time the detection was produced
    pub detected_at: DateTime<Local>,
    /// Monotonic arrival time, used for windowed dedup
    pub arrived_at: Instant,
}

impl Detection {
    /// A detection arriving now.
    pub fn new(payload: impl Into<String>) -> Self {
        Self::at(payload, Instant::now())
    }

    /// A detection with an explicit arrival instant.
    pub fn at(payload: impl Into<String>, arrived_at: Instant) -> Self {
        Self {
            payload: payload.into(),
            symbology: None,
            detected_at: Local::now(),
            arrived_at,
        }
    }

    fn from_decoded(decoded: Decoded) -> Self {
        Self {
            symbology: decoded.symbology,
            ..Self::new(decoded.payload)
        }
    }
}

/// Event emitted once per accepted detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueBarcode {
    /// The accepted detection
    pub detection: Detection,
    /// 1-based position among unique events this session
    pub ordinal: u64,
}

/// Counters reported when the producer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Frames acquired
    pub frames: u64,
    /// Detections enqueued
    pub detections: u64,
}

/// Acquire, publish and decode frames until `stop` fires.
///
/// A source error ends the loop and is returned; the caller's worker wrapper turns it
/// into a station-wide stop.
pub fn run_producer<S, D>(
    source: &mut S,
    decoder: &mut D,
    frames: &FrameCell,
    detections: &QueueSender<Detection>,
    stop: &StopSignal,
) -> StationResult<ProducerStats>
where
    S: FrameSource + ?Sized,
    D: BarcodeDecoder + ?Sized,
{
    let mut stats = ProducerStats::default();
    while !stop.is_cancelled() {
        let Some(frame) = source.next_frame(stop)? else {
            continue;
        };
        stats.frames += 1;
        let decoded = decoder.decode(&frame);
        frames.store(frame);

        for item in decoded {
            trace!(payload = %item.payload, "Decoded");
            if !detections.push(Detection::from_decoded(item)) {
                debug!("Detection consumer gone, producer stopping");
                return Ok(stats);
            }
            stats.detections += 1;
        }
    }
    debug!(
        frames = stats.frames,
        detections = stats.detections,
        "Producer stopped"
    );
    Ok(stats)
}

/// Consumer behaviour knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Longest wait on an empty queue before rechecking the stop signal
    pub poll_interval: Duration,
    /// Discard the queued backlog after every unique event
    pub drain_backlog_on_unique: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            drain_backlog_on_unique: false,
        }
    }
}

/// Counters reported when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Detections popped from the queue
    pub received: u64,
    /// Unique events emitted
    pub unique: u64,
    /// Detections discarded as already seen
    pub suppressed: u64,
    /// Detections dropped by backlog draining
    pub drained: u64,
}

/// Deduplicate detections in arrival order until `stop` fires.
///
/// Events go to `events`; a closed receiver is not an error, events are then only
/// logged.
pub fn run_consumer(
    detections: &WorkQueue<Detection>,
    dedup: &mut Deduplicator,
    options: ConsumerOptions,
    events: &Sender<UniqueBarcode>,
    stop: &StopSignal,
) -> StationResult<ConsumerStats> {
    let mut stats = ConsumerStats::default();
    loop {
        let detection = match detections.recv(options.poll_interval, stop) {
            Recv::Item(detection) => detection,
            Recv::Empty => continue,
            Recv::Cancelled => break,
        };
        stats.received += 1;

        if !dedup.accept(&detection) {
            stats.suppressed += 1;
            trace!(payload = %detection.payload, "Already seen");
            continue;
        }

        stats.unique += 1;
        info!(
            barcode = %detection.payload,
            symbology = detection.symbology.as_deref().unwrap_or("-"),
            ordinal = stats.unique,
            "New unique barcode"
        );
        debug!(
            detected_at = %detection.detected_at.format("%H:%M:%S%.3f"),
            seen = ?dedup.seen(),
            "Dedup set"
        );
        let event = UniqueBarcode {
            detection,
            ordinal: stats.unique,
        };
        if events.send(event).is_err() {
            trace!("No listener for unique barcode events");
        }

        if options.drain_backlog_on_unique {
            let dropped = detections.drain();
            if dropped > 0 {
                debug!(dropped, "Drained detection backlog");
            }
            stats.drained += dropped as u64;
        }
    }
    debug!(
        received = stats.received,
        unique = stats.unique,
        suppressed = stats.suppressed,
        "Consumer stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feed `payloads` then close the queue; the consumer exits once it has drained it.
    fn consume(policy: DedupPolicy, payloads: &[&str], drain: bool) -> (Vec<String>, ConsumerStats) {
        let (tx, queue) = WorkQueue::unbounded();
        for p in payloads {
            tx.push(Detection::new(*p));
        }
        drop(tx);

        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let mut dedup = Deduplicator::new(policy);
        let options = ConsumerOptions {
            poll_interval: Duration::from_millis(5),
            drain_backlog_on_unique: drain,
        };
        let stats = run_consumer(&queue, &mut dedup, options, &events_tx, &StopSignal::new())
            .unwrap();
        let events = events_rx.try_iter().map(|e| e.detection.payload).collect();
        (events, stats)
    }

    #[test]
    fn clear_on_unique_sequence() {
        let (events, stats) = consume(DedupPolicy::ClearOnUnique, &["A", "A", "B", "A"], false);
        assert_eq!(events, ["A", "B", "A"]);
        assert_eq!(stats.received, 4);
        assert_eq!(stats.suppressed, 1);
    }

    #[test]
    fn drain_drops_backlog_after_each_unique() {
        let (events, stats) = consume(DedupPolicy::ClearOnUnique, &["A", "A", "B"], true);
        assert_eq!(events, ["A"]);
        assert_eq!(stats.drained, 2);
    }

    #[test]
    fn cancelled_consumer_returns_promptly() {
        let (_tx, queue) = WorkQueue::<Detection>::unbounded();
        let (events_tx, _events_rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let canceller = stop.clone();
        let handle = std::thread::spawn(move || {
            let mut dedup = Deduplicator::new(DedupPolicy::default());
            let options = ConsumerOptions {
                poll_interval: Duration::from_millis(50),
                drain_backlog_on_unique: false,
            };
            run_consumer(&queue, &mut dedup, options, &events_tx, &stop)
        });
        std::thread::sleep(Duration::from_millis(30));
        let start = Instant::now();
        canceller.cancel();
        handle.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn session_policy_sequence() {
        let (events, _) = consume(DedupPolicy::Session, &["A", "A", "B", "A"], false);
        assert_eq!(events, ["A", "B"]);
    }

    #[test]
    fn ordinals_count_unique_events() {
        let (tx, queue) = WorkQueue::unbounded();
        for p in ["X", "Y", "Y", "Z"] {
            tx.push(Detection::new(p));
        }
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let stop = StopSignal::new();
        let canceller = stop.clone();
        let handle = std::thread::spawn(move || {
            let mut dedup = Deduplicator::new(DedupPolicy::Session);
            run_consumer(&queue, &mut dedup, ConsumerOptions::default(), &events_tx, &stop)
        });
        let mut ordinals = Vec::new();
        for _ in 0..3 {
            let event = events_rx.recv_timeout(Duration::from_secs(2)).unwrap();
            ordinals.push((event.detection.payload, event.ordinal));
        }
        canceller.cancel();
        handle.join().unwrap().unwrap();
        assert_eq!(
            ordinals,
            [("X".to_string(), 1), ("Y".to_string(), 2), ("Z".to_string(), 3)]
        );
    }

    #[test]
    fn producer_publishes_frames_and_detections() {
        let mut camera = SyntheticCamera::new(8, 8, 1000);
        let mut decoder = ScriptedDecoder::new([vec!["A", "A"], vec![], vec!["B"]]);
        let frames = FrameCell::new();
        let (tx, queue) = WorkQueue::unbounded();
        let stop = StopSignal::new();

        let viewer = frames.clone();
        let canceller = stop.clone();
        let handle = std::thread::spawn(move || {
            run_producer(&mut camera, &mut decoder, &frames, &tx, &stop)
        });
        let mut got = Vec::new();
        while got.len() < 3 {
            match queue.recv(Duration::from_secs(2), &StopSignal::new()) {
                Recv::Item(d) => got.push(d.payload),
                other => panic!("unexpected {other:?}"),
            }
        }
        canceller.cancel();
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(got, ["A", "A", "B"]);
        assert_eq!(stats.detections, 3);
        assert!(stats.frames >= 3);
        assert!(viewer.latest().is_some());
    }

    #[test]
    fn producer_stops_when_consumer_is_gone() {
        let mut camera = SyntheticCamera::new(2, 2, 1000);
        let mut decoder = ScriptedDecoder::new([vec!["A"]]);
        let (tx, queue) = WorkQueue::unbounded();
        drop(queue);
        let stats =
            run_producer(&mut camera, &mut decoder, &FrameCell::new(), &tx, &StopSignal::new())
                .unwrap();
        assert_eq!(stats.detections, 0);
        assert_eq!(stats.frames, 1);
    }
}
