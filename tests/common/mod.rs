//! Shared fixtures for the station integration tests.

#![allow(dead_code)]

use deposit_station::config::StationConfig;
use deposit_station::error::StationResult;
use deposit_station::link::{Link, MemoryLink};
use deposit_station::pipeline::{ScriptedDecoder, SyntheticCamera};
use deposit_station::shutdown::StopSignal;
use deposit_station::state::StateStore;
use deposit_station::station::{ControllerStation, DeviceStation};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Configuration with short timings so tests finish quickly.
pub fn fast_config(dir: &Path) -> StationConfig {
    let toml_str = r#"
        [link]
        read_timeout_ms = 5
        handshake_timeout_ms = 2000
        handshake_retry_ms = 50

        [pipeline]
        poll_interval_ms = 10
        synthetic_fps = 200

        [dispatch]
        response_timeout_ms = 1000

        [device]
        actuation_delay_ms = 20
    "#;
    let mut config: StationConfig = toml::from_str(toml_str).expect("Failed to parse test config");
    config.device.state_file = dir.join("state.json");
    config.validate().expect("Test config must be valid");
    config
}

/// Link wrapper counting how often it has been dropped.
pub struct CountingLink<L> {
    inner: L,
    drops: Arc<AtomicUsize>,
}

impl<L> CountingLink<L> {
    pub fn new(inner: L) -> (Self, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner,
                drops: Arc::clone(&drops),
            },
            drops,
        )
    }
}

impl<L: Link> Link for CountingLink<L> {
    fn write_line(&mut self, line: &str) -> StationResult<()> {
        self.inner.write_line(line)
    }

    fn read_line(&mut self, timeout: Duration) -> StationResult<Option<String>> {
        self.inner.read_line(timeout)
    }

    fn discard_input(&mut self) -> StationResult<()> {
        self.inner.discard_input()
    }

    fn describe(&self) -> String {
        format!("Counting({})", self.inner.describe())
    }
}

impl<L> Drop for CountingLink<L> {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Both sides of a station, wired over an in-memory link and sharing one stop signal.
pub struct Bench {
    pub controller: ControllerStation,
    pub device: DeviceStation,
    pub stop: StopSignal,
    pub controller_link_drops: Arc<AtomicUsize>,
    pub device_link_drops: Arc<AtomicUsize>,
}

impl Bench {
    pub fn launch(config: &StationConfig, decoder: ScriptedDecoder) -> Bench {
        let (controller_link, device_link) = MemoryLink::pair();
        let (controller_link, controller_link_drops) = CountingLink::new(controller_link);
        let (device_link, device_link_drops) = CountingLink::new(device_link);
        let stop = StopSignal::new();

        let store = StateStore::open(&config.device.state_file);
        let device = DeviceStation::launch(config, device_link, store, stop.clone())
            .expect("Failed to launch device");
        let camera = SyntheticCamera::new(64, 48, config.pipeline.synthetic_fps);
        let controller =
            ControllerStation::launch(config, controller_link, camera, decoder, stop.clone())
                .expect("Failed to launch controller");

        Bench {
            controller,
            device,
            stop,
            controller_link_drops,
            device_link_drops,
        }
    }

    /// Submit `command` and wait for its outcome.
    pub fn request(&self, command: &str) -> StationResult<String> {
        assert!(self.controller.commands().push(command.to_string()));
        let outcome = self
            .controller
            .outcomes()
            .recv_timeout(Duration::from_secs(5))
            .expect("No outcome for command");
        assert_eq!(outcome.request, command.trim());
        outcome.result
    }
}
