//! Line-oriented byte links between controller and device.
//!
//! Framing is ASCII text terminated by `\n`; a `\r` before the newline is dropped so
//! CRLF peers work too. Two transports are provided:
//!
//! - [`SerialLink`] over the `serialport` crate (feature `instrument_serial`)
//! - [`MemoryLink`], a crossed in-memory pair used by the in-process simulation and tests
//!
//! Reads never block past their timeout, so owners can recheck the stop signal between
//! attempts.

use crate::error::{StationError, StationResult};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Line terminator appended to every outgoing line.
pub const LINE_TERMINATOR: &str = "\n";

/// Longest line accepted before the partial input is discarded.
pub const MAX_LINE_LEN: usize = 1024;

/// A bidirectional, newline-framed text link.
pub trait Link: Send {
    /// Write one line; the terminator is appended.
    fn write_line(&mut self, line: &str) -> StationResult<()>;

    /// Read one line, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing complete arrived in time. The returned line has its
    /// terminator removed but is otherwise untouched.
    fn read_line(&mut self, timeout: Duration) -> StationResult<Option<String>>;

    /// Drop any input received but not yet read.
    fn discard_input(&mut self) -> StationResult<()>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn write_line(&mut self, line: &str) -> StationResult<()> {
        (**self).write_line(line)
    }

    fn read_line(&mut self, timeout: Duration) -> StationResult<Option<String>> {
        (**self).read_line(timeout)
    }

    fn discard_input(&mut self) -> StationResult<()> {
        (**self).discard_input()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Accumulates raw bytes and splits them into lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > MAX_LINE_LEN && !self.buffer.contains(&b'\n') {
            warn!(
                len = self.buffer.len(),
                "Discarding oversized partial line from link"
            );
            self.buffer.clear();
        }
    }

    /// Pop the next complete line, if one is buffered.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Forget everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Whether a partial or complete line is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// One end of an in-memory link.
///
/// Dropping an end makes the peer observe [`StationError::LinkClosed`] once it has read
/// everything already sent.
#[derive(Debug)]
pub struct MemoryLink {
    name: String,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
    framer: LineFramer,
}

impl MemoryLink {
    /// Create two crossed ends: what one writes, the other reads.
    pub fn pair() -> (MemoryLink, MemoryLink) {
        Self::named_pair("controller", "device")
    }

    /// Like [`MemoryLink::pair`] with custom names for logging.
    pub fn named_pair(a: &str, b: &str) -> (MemoryLink, MemoryLink) {
        let (a_tx, b_rx) = crossbeam_channel::unbounded();
        let (b_tx, a_rx) = crossbeam_channel::unbounded();
        (
            MemoryLink {
                name: a.to_string(),
                tx: a_tx,
                rx: a_rx,
                framer: LineFramer::new(),
            },
            MemoryLink {
                name: b.to_string(),
                tx: b_tx,
                rx: b_rx,
                framer: LineFramer::new(),
            },
        )
    }

    /// Send raw bytes without framing, e.g. to emulate a line split across writes.
    pub fn write_raw(&mut self, bytes: &[u8]) -> StationResult<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| StationError::LinkClosed)
    }
}

impl Link for MemoryLink {
    fn write_line(&mut self, line: &str) -> StationResult<()> {
        trace!(link = %self.name, line = %line.escape_default(), "write");
        self.write_raw(format!("{line}{LINE_TERMINATOR}").as_bytes())
    }

    fn read_line(&mut self, timeout: Duration) -> StationResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.framer.next_line() {
                trace!(link = %self.name, line = %line.escape_default(), "read");
                return Ok(Some(line));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(bytes) => self.framer.push(&bytes),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(StationError::LinkClosed),
            }
        }
    }

    fn discard_input(&mut self) -> StationResult<()> {
        self.framer.clear();
        let dropped = self.rx.try_iter().count();
        if dropped > 0 {
            trace!(link = %self.name, chunks = dropped, "discarded pending input");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("MemoryLink({})", self.name)
    }
}

#[cfg(feature = "instrument_serial")]
pub use serial::SerialLink;

#[cfg(feature = "instrument_serial")]
mod serial {
    use super::{Link, LineFramer, LINE_TERMINATOR};
    use crate::error::{StationError, StationResult};
    use serialport::{ClearBuffer, SerialPort};
    use std::io::{ErrorKind, Read, Write};
    use std::time::{Duration, Instant};
    use tracing::{debug, trace};

    /// Internal read timeout of the OS port; bounds how long one `read` can block.
    const PORT_READ_TIMEOUT: Duration = Duration::from_millis(20);

    /// Serial link for RS-232/USB-serial controllers.
    pub struct SerialLink {
        port_name: String,
        baud_rate: u32,
        port: Box<dyn SerialPort>,
        framer: LineFramer,
    }

    impl SerialLink {
        /// Open `port_name` at `baud_rate`.
        pub fn open(port_name: &str, baud_rate: u32) -> StationResult<Self> {
            let port = serialport::new(port_name, baud_rate)
                .timeout(PORT_READ_TIMEOUT)
                .open()
                .map_err(|e| StationError::Link(e.into()))?;
            debug!(port = %port_name, baud_rate, "Serial port opened");
            Ok(Self {
                port_name: port_name.to_string(),
                baud_rate,
                port,
                framer: LineFramer::new(),
            })
        }
    }

    impl Link for SerialLink {
        fn write_line(&mut self, line: &str) -> StationResult<()> {
            let framed = format!("{line}{LINE_TERMINATOR}");
            self.port.write_all(framed.as_bytes())?;
            self.port.flush()?;
            trace!(port = %self.port_name, line = %line.escape_default(), "write");
            Ok(())
        }

        fn read_line(&mut self, timeout: Duration) -> StationResult<Option<String>> {
            let deadline = Instant::now() + timeout;
            let mut buffer = [0u8; 256];
            loop {
                if let Some(line) = self.framer.next_line() {
                    trace!(port = %self.port_name, line = %line.escape_default(), "read");
                    return Ok(Some(line));
                }
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                match self.port.read(&mut buffer) {
                    Ok(0) => return Err(StationError::LinkClosed),
                    Ok(n) => self.framer.push(&buffer[..n]),
                    // Port timeout is shorter than our overall timeout
                    Err(e) if e.kind() == ErrorKind::TimedOut => continue,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => return Err(StationError::Link(e)),
                }
            }
        }

        fn discard_input(&mut self) -> StationResult<()> {
            self.framer.clear();
            self.port
                .clear(ClearBuffer::Input)
                .map_err(|e| StationError::Link(e.into()))
        }

        fn describe(&self) -> String {
            format!("SerialLink({} @ {} baud)", self.port_name, self.baud_rate)
        }
    }

    impl Drop for SerialLink {
        fn drop(&mut self) {
            debug!(port = %self.port_name, "Serial port closed");
        }
    }
}

/// Open the configured physical link.
#[cfg(feature = "instrument_serial")]
pub fn open_serial(port: &str, baud_rate: u32) -> StationResult<Box<dyn Link>> {
    Ok(Box::new(SerialLink::open(port, baud_rate)?))
}

/// Open the configured physical link.
#[cfg(not(feature = "instrument_serial"))]
pub fn open_serial(_port: &str, _baud_rate: u32) -> StationResult<Box<dyn Link>> {
    Err(StationError::SerialFeatureDisabled)
}
