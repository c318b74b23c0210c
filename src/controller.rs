//! Controller side of the link protocol.
//!
//! [`ControllerEngine`] owns the link and runs strictly half-duplex exchanges: every
//! request is written, then exactly one reply line is awaited before the next request
//! may start. Actions are followed by `*OPC?`, whose reply serves as the
//! acknowledgement.
//!
//! On connect the engine performs a handshake instead of sleeping through the device's
//! reset time: `*IDN?` is repeated until the device answers with a well-formed
//! identification or the handshake deadline passes. Whatever arrived before that answer
//! is discarded.
//!
//! [`run_engine`] is the thread body. It serves [`EngineJob`]s from the dispatch loop
//! until the stop signal fires or the link fails.

use crate::command::{DeviceCommand, Request};
use crate::config::StationConfig;
use crate::error::{StationError, StationResult};
use crate::link::Link;
use crate::queue::{QueueSender, Recv, WorkQueue};
use crate::shutdown::StopSignal;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Parsed `*IDN?` reply: `VENDOR,MODEL,SERIAL,FIRMWARE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer
    pub vendor: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware version
    pub firmware: String,
}

impl FromStr for Identity {
    type Err = StationError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        match fields.as_slice() {
            [vendor, model, serial, firmware] if !vendor.is_empty() && !model.is_empty() => {
                Ok(Identity {
                    vendor: vendor.to_string(),
                    model: model.to_string(),
                    serial: serial.to_string(),
                    firmware: firmware.to_string(),
                })
            }
            _ => Err(StationError::MalformedReply(line.to_string())),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.vendor, self.model, self.serial, self.firmware
        )
    }
}

/// Timing knobs for the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Longest single link read; bounds how quickly cancellation is noticed
    pub read_timeout: Duration,
    /// How long a request may wait for its reply
    pub response_timeout: Duration,
    /// Overall handshake deadline
    pub handshake_timeout: Duration,
    /// Interval between handshake attempts
    pub handshake_retry: Duration,
    /// Consecutive timeouts before the operator is warned; 0 disables the warning
    pub timeout_warn_threshold: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            response_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            handshake_retry: Duration::from_millis(500),
            timeout_warn_threshold: 3,
        }
    }
}

impl EngineSettings {
    /// Settings taken from the `link` and `dispatch` sections.
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            read_timeout: config.link.read_timeout(),
            response_timeout: config.dispatch.response_timeout(),
            handshake_timeout: config.link.handshake_timeout(),
            handshake_retry: config.link.handshake_retry(),
            timeout_warn_threshold: config.dispatch.timeout_warn_threshold,
        }
    }

    /// Set the per-request reply deadline
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the handshake deadline and retry interval
    pub fn with_handshake(mut self, timeout: Duration, retry: Duration) -> Self {
        self.handshake_timeout = timeout;
        self.handshake_retry = retry;
        self
    }
}

/// Half-duplex request executor that exclusively owns the link.
pub struct ControllerEngine<L> {
    link: L,
    settings: EngineSettings,
    consecutive_timeouts: u32,
    requests: u64,
    timeouts: u64,
}

impl<L: Link> ControllerEngine<L> {
    /// Wrap a freshly opened link.
    pub fn new(link: L, settings: EngineSettings) -> Self {
        Self {
            link,
            settings,
            consecutive_timeouts: 0,
            requests: 0,
            timeouts: 0,
        }
    }

    /// Active settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Requests answered or timed out since the engine started.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Requests that went unanswered since the engine started.
    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    /// Current run of unanswered requests.
    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    /// Give the link back, e.g. to close it explicitly.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Wait for the device to identify itself.
    ///
    /// Returns [`StationError::ResponseTimeout`] if no well-formed identification
    /// arrives before the handshake deadline, and [`StationError::Cancelled`] if `stop`
    /// fires first. Link failures are returned as-is.
    pub fn handshake(&mut self, stop: &StopSignal) -> StationResult<Identity> {
        let query = DeviceCommand::Identify.wire();
        let deadline = Instant::now() + self.settings.handshake_timeout;
        let mut attempts = 0u32;
        info!(link = %self.link.describe(), "Waiting for device handshake");

        while Instant::now() < deadline {
            attempts += 1;
            self.link.write_line(query)?;
            let attempt_deadline = deadline.min(Instant::now() + self.settings.handshake_retry);

            while let Some(line) = self.await_line(attempt_deadline, stop)? {
                match line.parse::<Identity>() {
                    Ok(identity) => {
                        self.link.discard_input()?;
                        info!(%identity, attempts, "Device handshake complete");
                        return Ok(identity);
                    }
                    Err(e) => debug!("Ignoring pre-handshake input: {}", e),
                }
            }
            debug!(attempts, "No identification yet, retrying");
        }

        Err(StationError::ResponseTimeout {
            command: query.to_string(),
            timeout: self.settings.handshake_timeout,
        })
    }

    /// Run one full request/response cycle and return the trimmed reply.
    ///
    /// Input that arrived between requests is discarded first, so a late reply to an
    /// earlier, timed-out request is never mistaken for this one's.
    pub fn execute(&mut self, request: Request, stop: &StopSignal) -> StationResult<String> {
        self.link.discard_input()?;
        for line in request.wire_lines() {
            self.link.write_line(line)?;
        }
        debug!(%request, "Request sent");
        self.requests += 1;

        let deadline = Instant::now() + self.settings.response_timeout;
        match self.await_line(deadline, stop)? {
            Some(reply) => {
                self.consecutive_timeouts = 0;
                Ok(reply.trim().to_string())
            }
            None => {
                self.timeouts += 1;
                self.consecutive_timeouts += 1;
                let threshold = self.settings.timeout_warn_threshold;
                if threshold > 0 && self.consecutive_timeouts >= threshold {
                    warn!(
                        consecutive = self.consecutive_timeouts,
                        "Device has stopped answering; check power and cabling"
                    );
                }
                Err(StationError::ResponseTimeout {
                    command: request.to_string(),
                    timeout: self.settings.response_timeout,
                })
            }
        }
    }

    /// Read the next non-empty line before `deadline`, in `read_timeout` slices so the
    /// stop signal is rechecked between them.
    fn await_line(&mut self, deadline: Instant, stop: &StopSignal) -> StationResult<Option<String>> {
        loop {
            if stop.is_cancelled() {
                return Err(StationError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.link.read_line(remaining.min(self.settings.read_timeout))? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(line)),
                None => continue,
            }
        }
    }
}

impl<L> fmt::Debug for ControllerEngine<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerEngine")
            .field("settings", &self.settings)
            .field("requests", &self.requests)
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

/// Reply delivered back to the dispatch loop.
pub type EngineReply = StationResult<String>;

/// One request handed to the engine thread.
#[derive(Debug)]
pub struct EngineJob {
    /// Validated request
    pub request: Request,
    /// Where the outcome goes
    pub reply: QueueSender<EngineReply>,
}

/// Summary returned by [`run_engine`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    /// Device identification, if the handshake completed
    pub identity: Option<Identity>,
    /// Requests executed
    pub requests: u64,
    /// Requests that timed out
    pub timeouts: u64,
}

/// A link failure seen after `stop` was raised is the peer shutting down too.
fn during_shutdown(error: StationError, stop: &StopSignal) -> StationError {
    if error.is_fatal() && stop.is_cancelled() {
        debug!("Link closed during shutdown: {}", error);
        StationError::Cancelled
    } else {
        error
    }
}

/// Engine thread body: handshake, then serve jobs until stopped.
///
/// Link failures are returned so the worker wrapper can stop the station. The job in
/// flight is dropped unanswered in that case, which its waiter observes as a closed
/// reply queue.
pub fn run_engine<L: Link>(
    engine: &mut ControllerEngine<L>,
    jobs: &WorkQueue<EngineJob>,
    poll_interval: Duration,
    stop: &StopSignal,
) -> StationResult<EngineReport> {
    let mut report = EngineReport::default();
    match engine.handshake(stop).map_err(|e| during_shutdown(e, stop)) {
        Ok(identity) => report.identity = Some(identity),
        Err(StationError::Cancelled) => return Ok(report),
        Err(e) => return Err(e),
    }

    loop {
        let job = match jobs.recv(poll_interval, stop) {
            Recv::Item(job) => job,
            Recv::Empty => continue,
            Recv::Cancelled => break,
        };
        match engine.execute(job.request, stop).map_err(|e| during_shutdown(e, stop)) {
            Err(e) if e.is_fatal() => return Err(e),
            Err(StationError::Cancelled) => {
                job.reply.push(Err(StationError::Cancelled));
                break;
            }
            result => {
                job.reply.push(result);
            }
        }
    }

    report.requests = engine.requests();
    report.timeouts = engine.timeouts();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLink;

    fn fast() -> EngineSettings {
        EngineSettings {
            read_timeout: Duration::from_millis(5),
            response_timeout: Duration::from_millis(60),
            handshake_timeout: Duration::from_millis(300),
            handshake_retry: Duration::from_millis(30),
            timeout_warn_threshold: 2,
        }
    }

    #[test]
    fn identity_parses_four_fields() {
        let identity: Identity = "DSDevs,DSDriver,#00,mock_driver\r".parse().unwrap();
        assert_eq!(identity.vendor, "DSDevs");
        assert_eq!(identity.model, "DSDriver");
        assert_eq!(identity.serial, "#00");
        assert_eq!(identity.firmware, "mock_driver");
        assert_eq!(identity.to_string(), "DSDevs,DSDriver,#00,mock_driver");

        assert!(matches!(
            "1".parse::<Identity>(),
            Err(StationError::MalformedReply(_))
        ));
    }

    #[test]
    fn query_waits_for_one_reply() {
        let (controller, mut device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let stop = StopSignal::new();

        let responder = std::thread::spawn(move || {
            let line = device.read_line(Duration::from_secs(1)).unwrap();
            device.write_line("120").unwrap();
            line
        });
        let reply = engine.execute(Request::parse("MEAS:DIST?").unwrap(), &stop).unwrap();
        assert_eq!(reply, "120");
        assert_eq!(responder.join().unwrap().as_deref(), Some("MEAS:DIST?"));
    }

    #[test]
    fn action_is_followed_by_completion_query() {
        let (controller, mut device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let stop = StopSignal::new();

        let responder = std::thread::spawn(move || {
            let first = device.read_line(Duration::from_secs(1)).unwrap();
            let second = device.read_line(Duration::from_secs(1)).unwrap();
            device.write_line("1").unwrap();
            (first, second)
        });
        let reply = engine.execute(Request::parse("LED:ON").unwrap(), &stop).unwrap();
        assert_eq!(reply, "1");
        let (first, second) = responder.join().unwrap();
        assert_eq!(first.as_deref(), Some("LED:ON"));
        assert_eq!(second.as_deref(), Some("*OPC?"));
    }

    #[test]
    fn silence_times_out_and_is_counted() {
        let (controller, _device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let stop = StopSignal::new();
        for expected in 1..=3 {
            let err = engine.execute(Request::parse("*IDN?").unwrap(), &stop).unwrap_err();
            assert!(matches!(err, StationError::ResponseTimeout { .. }));
            assert_eq!(engine.consecutive_timeouts(), expected);
        }
        assert_eq!(engine.timeouts(), 3);
    }

    #[test]
    fn stale_reply_is_not_taken_for_the_next() {
        let (controller, mut device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let stop = StopSignal::new();

        assert!(engine.execute(Request::parse("*OPC?").unwrap(), &stop).is_err());
        device.write_line("late").unwrap();

        let responder = std::thread::spawn(move || {
            // *OPC? from the first request, then *IDN?
            device.read_line(Duration::from_secs(1)).unwrap();
            let query = device.read_line(Duration::from_secs(1)).unwrap();
            device.write_line("DSDevs,DSDriver,#00,mock_driver").unwrap();
            query
        });
        let reply = engine.execute(Request::parse("*IDN?").unwrap(), &stop).unwrap();
        assert_eq!(reply, "DSDevs,DSDriver,#00,mock_driver");
        assert_eq!(engine.consecutive_timeouts(), 0);
        assert_eq!(responder.join().unwrap().as_deref(), Some("*IDN?"));
    }

    #[test]
    fn handshake_retries_until_identified() {
        let (controller, mut device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let stop = StopSignal::new();

        let responder = std::thread::spawn(move || {
            // Ignore the first query as if still booting, answer the second
            device.read_line(Duration::from_secs(1)).unwrap();
            device.write_line("booting...").unwrap();
            device.read_line(Duration::from_secs(1)).unwrap();
            device.write_line("DSDevs,DSDriver,#00,mock_driver").unwrap();
            device
        });
        let identity = engine.handshake(&stop).unwrap();
        assert_eq!(identity.model, "DSDriver");
        drop(responder.join().unwrap());
    }

    #[test]
    fn handshake_gives_up_at_deadline() {
        let (controller, _device) = MemoryLink::pair();
        let mut engine = ControllerEngine::new(controller, fast());
        let start = Instant::now();
        let err = engine.handshake(&StopSignal::new()).unwrap_err();
        assert!(matches!(err, StationError::ResponseTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn closed_link_is_fatal() {
        let (controller, device) = MemoryLink::pair();
        drop(device);
        let mut engine = ControllerEngine::new(controller, fast());
        let err = engine
            .execute(Request::parse("*IDN?").unwrap(), &StopSignal::new())
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn cancelled_wait_returns_promptly() {
        let (controller, _device) = MemoryLink::pair();
        let settings = fast().with_response_timeout(Duration::from_secs(30));
        let mut engine = ControllerEngine::new(controller, settings);
        let stop = StopSignal::new();
        let canceller = stop.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let start = Instant::now();
        let err = engine.execute(Request::parse("*IDN?").unwrap(), &stop).unwrap_err();
        assert!(matches!(err, StationError::Cancelled));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
