//! Detection sources: frame acquisition and barcode decoding.
//!
//! Capture hardware and the image-to-string decoder live outside this crate. They plug in
//! through [`FrameSource`] and [`BarcodeDecoder`]. Two simulated implementations are
//! provided for the binary and tests:
//!
//! - [`SyntheticCamera`] emits blank frames at a fixed rate
//! - [`ScriptedDecoder`] yields a scripted batch of payloads per frame

use crate::error::{StationError, StationResult};
use crate::shutdown::StopSignal;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

/// A captured camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic frame counter from the source
    pub sequence: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Raw pixel data, row-major BGR
    pub pixels: Vec<u8>,
    /// Wall-clock capture time
    pub captured_at: DateTime<Local>,
}

/// One payload decoded from a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Decoded barcode text
    pub payload: String,
    /// Symbology name reported by the decoder (e.g. "QRCODE"), if any
    pub symbology: Option<String>,
}

impl Decoded {
    /// A decoded payload without symbology information.
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            symbology: None,
        }
    }
}

/// Produces camera frames.
pub trait FrameSource: Send {
    /// Acquire the next frame.
    ///
    /// `Ok(None)` means no frame was available this cycle, which is not an error.
    /// Implementations must not block much longer than one frame period and should
    /// return promptly once `stop` fires.
    fn next_frame(&mut self, stop: &StopSignal) -> StationResult<Option<Frame>>;
}

/// Turns a frame into zero or more decoded payloads.
pub trait BarcodeDecoder: Send {
    /// Decode every barcode visible in `frame`. Repeats are allowed.
    fn decode(&mut self, frame: &Frame) -> Vec<Decoded>;
}

/// Simulated camera producing blank frames at a fixed rate.
#[derive(Debug)]
pub struct SyntheticCamera {
    width: u32,
    height: u32,
    period: Duration,
    sequence: u64,
}

impl SyntheticCamera {
    /// Camera with the given resolution and frame rate.
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            period: Duration::from_secs(1) / fps.max(1),
            sequence: 0,
        }
    }

    /// Number of frames produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.sequence
    }

    /// Bytes in one RGB frame.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl Default for SyntheticCamera {
    fn default() -> Self {
        Self::new(640, 480, 20)
    }
}

impl FrameSource for SyntheticCamera {
    fn next_frame(&mut self, stop: &StopSignal) -> StationResult<Option<Frame>> {
        if !stop.wait_timeout(self.period) {
            return Ok(None);
        }
        self.sequence += 1;
        Ok(Some(Frame {
            sequence: self.sequence,
            width: self.width,
            height: self.height,
            pixels: vec![0; self.frame_len()],
            captured_at: Local::now(),
        }))
    }
}

/// Decoder that replays a script: batch `n` is returned for the `n`th frame decoded.
///
/// Once the script is exhausted every frame decodes to nothing.
#[derive(Debug, Default)]
pub struct ScriptedDecoder {
    batches: VecDeque<Vec<Decoded>>,
}

impl ScriptedDecoder {
    /// Script from explicit batches.
    pub fn new<I, B, S>(batches: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            batches: batches
                .into_iter()
                .map(|batch| batch.into_iter().map(Decoded::new).collect())
                .collect(),
        }
    }

    /// Parse a script: one line per frame, payloads separated by commas.
    ///
    /// Blank lines are frames with no barcode in view; lines starting with `#` are
    /// comments.
    pub fn parse(script: &str) -> Self {
        let batches = script
            .lines()
            .filter(|line| !line.trim_start().starts_with('#'))
            .map(|line| {
                line.split(',')
                    .map(str::trim)
                    .filter(|payload| !payload.is_empty())
                    .map(Decoded::new)
                    .collect()
            })
            .collect();
        Self { batches }
    }

    /// Load and parse a script file.
    pub fn from_file(path: &Path) -> StationResult<Self> {
        let script =
            std::fs::read_to_string(path).map_err(|e| StationError::persistence(path, e))?;
        Ok(Self::parse(&script))
    }

    /// Frames still scripted.
    pub fn remaining(&self) -> usize {
        self.batches.len()
    }
}

impl BarcodeDecoder for ScriptedDecoder {
    fn decode(&mut self, _frame: &Frame) -> Vec<Decoded> {
        self.batches.pop_front().unwrap_or_default()
    }
}
