//! Thread orchestration for both ends of the link.
//!
//! [`ControllerStation`] runs four workers:
//!
//! | thread             | owns                               |
//! |--------------------|------------------------------------|
//! | `detect-producer`  | frame source, decoder              |
//! | `detect-consumer`  | dedup set                          |
//! | `protocol-engine`  | the link                           |
//! | `command-dispatch` | nothing; serializes command flow   |
//!
//! [`DeviceStation`] runs a single `device` worker that owns its link and the state
//! store. All workers share one [`StopSignal`]; a fatal error in any of them raises it
//! and the rest wind down within one poll interval.

use crate::config::StationConfig;
use crate::controller::{run_engine, ControllerEngine, EngineReport, EngineSettings};
use crate::device::{DeviceSettings, DeviceSimulator};
use crate::dispatch::{run_dispatch, CommandOutcome, DispatchStats};
use crate::error::{StationError, StationResult};
use crate::link::Link;
use crate::pipeline::{
    run_consumer, run_producer, BarcodeDecoder, ConsumerOptions, ConsumerStats, Deduplicator,
    Frame, FrameCell, FrameSource, ProducerStats, UniqueBarcode,
};
use crate::queue::{QueueSender, WorkQueue};
use crate::shutdown::StopSignal;
use crate::state::StateStore;
use crate::worker::{spawn_worker, Worker};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use tracing::{debug, error, info};

fn spawn<F, T>(name: &str, stop: &StopSignal, body: F) -> StationResult<Worker<T>>
where
    F: FnOnce() -> StationResult<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_worker(name, stop, body).map_err(|source| {
        stop.cancel();
        StationError::Spawn {
            name: name.to_string(),
            source,
        }
    })
}

/// Wait for a worker started before a later spawn failed. Its result no longer matters.
fn join_started<T>(worker: Worker<T>) {
    let name = worker.name().to_string();
    if let Err(e) = worker.join() {
        debug!(thread = %name, "Worker ended with {} after failed launch", e);
    }
}

/// Keep the first error, log the rest.
fn first_error(slot: &mut Option<StationError>, result: StationResult<()>) {
    if let Err(e) = result {
        match slot {
            None => *slot = Some(e),
            Some(_) => error!("Additional shutdown error: {}", e),
        }
    }
}

/// What each controller thread reported on exit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerReport {
    /// Frame acquisition counters
    pub producer: ProducerStats,
    /// Dedup counters
    pub consumer: ConsumerStats,
    /// Handshake result and request counters
    pub engine: EngineReport,
    /// Command counters
    pub dispatch: DispatchStats,
}

/// Running controller: detection pipeline plus command path.
#[derive(Debug)]
pub struct ControllerStation {
    stop: StopSignal,
    commands: QueueSender<String>,
    events: Receiver<UniqueBarcode>,
    outcomes: Receiver<CommandOutcome>,
    frames: FrameCell,
    producer: Worker<ProducerStats>,
    consumer: Worker<ConsumerStats>,
    engine: Worker<EngineReport>,
    dispatch: Worker<DispatchStats>,
}

impl ControllerStation {
    /// Start every controller thread.
    ///
    /// `link` moves into the engine thread and is released when that thread ends.
    pub fn launch<L, S, D>(
        config: &StationConfig,
        link: L,
        mut source: S,
        mut decoder: D,
        stop: StopSignal,
    ) -> StationResult<ControllerStation>
    where
        L: Link + 'static,
        S: FrameSource + 'static,
        D: BarcodeDecoder + 'static,
    {
        let poll = config.pipeline.poll_interval();
        let (detection_tx, detections) = WorkQueue::unbounded();
        let (command_tx, commands) = WorkQueue::unbounded();
        let (job_tx, jobs) = WorkQueue::unbounded();
        let (event_tx, events) = crossbeam_channel::unbounded();
        let (outcome_tx, outcomes) = crossbeam_channel::unbounded();
        let frames = FrameCell::new();

        info!(link = %link.describe(), dedup = ?config.pipeline.dedup, "Starting controller");

        let producer = spawn("detect-producer", &stop, {
            let stop = stop.clone();
            let frames = frames.clone();
            move || run_producer(&mut source, &mut decoder, &frames, &detection_tx, &stop)
        })?;

        let consumer = match spawn("detect-consumer", &stop, {
            let stop = stop.clone();
            let mut dedup = Deduplicator::new(config.pipeline.dedup);
            let options = ConsumerOptions {
                poll_interval: poll,
                drain_backlog_on_unique: config.pipeline.drain_backlog_on_unique,
            };
            move || run_consumer(&detections, &mut dedup, options, &event_tx, &stop)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                join_started(producer);
                return Err(e);
            }
        };

        let engine = match spawn("protocol-engine", &stop, {
            let stop = stop.clone();
            let mut engine = ControllerEngine::new(link, EngineSettings::from_config(config));
            move || run_engine(&mut engine, &jobs, poll, &stop)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                join_started(producer);
                join_started(consumer);
                return Err(e);
            }
        };

        let dispatch = match spawn("command-dispatch", &stop, {
            let stop = stop.clone();
            move || run_dispatch(&commands, &job_tx, &outcome_tx, poll, &stop)
        }) {
            Ok(worker) => worker,
            Err(e) => {
                join_started(producer);
                join_started(consumer);
                join_started(engine);
                return Err(e);
            }
        };

        Ok(ControllerStation {
            stop,
            commands: command_tx,
            events,
            outcomes,
            frames,
            producer,
            consumer,
            engine,
            dispatch,
        })
    }

    /// Where command strings are submitted. Clone it for each source.
    pub fn commands(&self) -> QueueSender<String> {
        self.commands.clone()
    }

    /// Unique-barcode events, in acceptance order.
    pub fn events(&self) -> &Receiver<UniqueBarcode> {
        &self.events
    }

    /// One outcome per submitted command, in submission order.
    pub fn outcomes(&self) -> &Receiver<CommandOutcome> {
        &self.outcomes
    }

    /// The most recent camera frame, if any.
    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        self.frames.latest()
    }

    /// The signal shared by every controller thread.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Raise the stop signal, join every thread and report.
    ///
    /// The first thread error, if any, is returned; later ones are only logged.
    pub fn shutdown(self) -> StationResult<ControllerReport> {
        self.stop.cancel();
        let mut report = ControllerReport::default();
        let mut failure = None;

        first_error(
            &mut failure,
            self.dispatch.join().map(|stats| report.dispatch = stats),
        );
        first_error(
            &mut failure,
            self.producer.join().map(|stats| report.producer = stats),
        );
        first_error(
            &mut failure,
            self.consumer.join().map(|stats| report.consumer = stats),
        );
        first_error(
            &mut failure,
            self.engine.join().map(|stats| report.engine = stats),
        );

        match failure {
            Some(e) => Err(e),
            None => {
                info!(
                    unique = report.consumer.unique,
                    commands = report.dispatch.completed,
                    "Controller stopped"
                );
                Ok(report)
            }
        }
    }
}

/// Running device simulator.
#[derive(Debug)]
pub struct DeviceStation {
    stop: StopSignal,
    worker: Worker<StateStore>,
}

impl DeviceStation {
    /// Start the device thread.
    ///
    /// When the thread ends, for whatever reason, it releases the link and then saves
    /// the store.
    pub fn launch<L>(
        config: &StationConfig,
        link: L,
        store: StateStore,
        stop: StopSignal,
    ) -> StationResult<DeviceStation>
    where
        L: Link + 'static,
    {
        info!(
            link = %link.describe(),
            state_file = %store.path().display(),
            "Starting device"
        );
        let mut simulator = DeviceSimulator::new(link, store, DeviceSettings::from_config(config));
        let worker = spawn("device", &stop, {
            let stop = stop.clone();
            move || {
                let served = simulator.run(&stop);
                let store = simulator.into_store();
                let saved = store.save();
                served?;
                saved?;
                Ok(store)
            }
        })?;
        Ok(DeviceStation { stop, worker })
    }

    /// The signal the device thread watches.
    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    /// Whether the device thread has already ended.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Stop the device, wait for it, and return the saved state.
    pub fn shutdown(self) -> StationResult<StateStore> {
        self.stop.cancel();
        self.worker.join()
    }
}
