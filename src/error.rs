//! Custom error types for the station.
//!
//! This module defines the primary error type, `StationError`, shared by the detection
//! pipeline, the protocol engine on both sides of the link and the state store. Using the
//! `thiserror` crate it gives every failure a readable message and a single place where
//! the fatal/recoverable split is decided.
//!
//! ## Error Hierarchy
//!
//! - **`UnknownCommand`**: a line received by the device matched no registered command.
//!   Logged, no state change, the loop continues.
//! - **`UnsupportedRequest`**: the controller was asked to send a token that is neither a
//!   known query nor a known action. Rejected before anything reaches the link.
//! - **`ResponseTimeout`**: no reply line arrived in time. Recoverable while the stop
//!   signal is unset.
//! - **`MalformedReply`**: a reply line did not have the expected shape (e.g. an
//!   identification string without four fields).
//! - **`Link`** / **`LinkClosed`**: the byte stream failed. Fatal to the thread that owns
//!   the link, which must cancel the whole station.
//! - **`Persistence`** / **`StateFormat`**: reading or writing the state file failed.
//! - **`Configuration`** / **`Config`**: semantic or parse errors in configuration.
//!
//! By using `#[from]`, `StationError` can be created from the underlying error types with
//! the `?` operator.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

/// Every failure the station distinguishes.
#[derive(Error, Debug)]
pub enum StationError {
    /// Input did not match any registered command.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Request token is neither a known query nor a known action.
    #[error("Command not recognized: {0}")]
    UnsupportedRequest(String),

    /// No reply line arrived before the deadline.
    #[error("No response to '{command}' within {timeout:?}")]
    ResponseTimeout {
        /// Request that went unanswered.
        command: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// A reply arrived but could not be interpreted.
    #[error("Malformed reply: {0:?}")]
    MalformedReply(String),

    /// I/O failure on the link.
    #[error("Link I/O error: {0}")]
    Link(#[from] std::io::Error),

    /// The peer end of the link went away.
    #[error("Link closed by peer")]
    LinkClosed,

    /// Serial support was compiled out.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    /// Reading or writing the state file failed.
    #[error("State file '{}': {source}", path.display())]
    Persistence {
        /// File that was being accessed.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// State file contents could not be (de)serialized.
    #[error("State file format error: {0}")]
    StateFormat(#[from] serde_json::Error),

    /// Configuration loaded but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The stop signal fired while waiting.
    #[error("Operation cancelled by shutdown")]
    Cancelled,

    /// The OS refused to start a worker thread.
    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        /// Thread that could not be started.
        name: String,
        /// Underlying OS failure.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread ended by panicking.
    #[error("Thread '{0}' panicked")]
    ThreadPanicked(String),
}

impl StationError {
    /// Whether this error must take down the thread that observed it.
    ///
    /// Only failures of the link itself are fatal; every other kind is logged and the
    /// loop carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StationError::Link(_) | StationError::LinkClosed | StationError::SerialFeatureDisabled
        )
    }

    /// Build a persistence error for `path`.
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StationError::Persistence {
            path: path.into(),
            source,
        }
    }
}

impl From<figment::Error> for StationError {
    fn from(value: figment::Error) -> Self {
        StationError::Config(Box::new(value))
    }
}
