//! # Deposit Station Core Library
//!
//! This crate drives a deposit station: a camera watches the intake for barcodes while a
//! small microcontroller on a serial line operates the lid lock and a status LED. The
//! library holds both ends of that serial conversation, so the same code runs the real
//! controller, a simulated device for bench work, and both of them in-process for tests.
//!
//! ## Crate Structure
//!
//! - **`pipeline`**: frame acquisition, decoding hand-off and deduplication into
//!   unique-barcode events.
//! - **`command`**: the wire vocabulary (`*IDN?`, `LED:ON`, ...) and request classification.
//! - **`controller`**: the half-duplex protocol engine that owns the controller's link.
//! - **`dispatch`**: serializes command submissions from every source into the engine.
//! - **`device`**: the simulated device: registry lookup, handlers, state mutation.
//! - **`registry`**: exact-match command table with namespace-prefixed registration.
//! - **`state`**: durable key/value device state backed by a JSON file.
//! - **`link`**: newline-framed text links over serial ports or in-memory pairs.
//! - **`station`**: starts, wires and stops the worker threads of each side.
//! - **`queue`**, **`shutdown`**, **`worker`**: cross-thread plumbing shared by all loops.
//! - **`config`**, **`logging`**, **`error`**: configuration, tracing setup and the
//!   `StationError` type.

pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod link;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod station;
pub mod worker;

pub use error::{StationError, StationResult};
