//! Command dispatch loop.
//!
//! Raw command strings arrive on a [`WorkQueue`] from any number of sources (console,
//! upstream logic, tests). The loop takes one at a time, validates it, hands it to the
//! protocol engine and waits for the outcome before taking the next, so at most one
//! request is ever in flight regardless of how many sources submit concurrently.

use crate::command::Request;
use crate::controller::{EngineJob, EngineReply};
use crate::error::{StationError, StationResult};
use crate::queue::{QueueSender, Recv, WorkQueue};
use crate::shutdown::StopSignal;
use crossbeam_channel::Sender;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one submitted command.
#[derive(Debug)]
pub struct CommandOutcome {
    /// The command as submitted, trimmed
    pub request: String,
    /// Reply line, or why there is none
    pub result: StationResult<String>,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Requests answered by the device
    pub completed: u64,
    /// Requests rejected before transmission
    pub rejected: u64,
    /// Requests transmitted but not answered
    pub failed: u64,
}

/// Serve `commands` until `stop` fires or the engine goes away.
///
/// Every submission produces exactly one [`CommandOutcome`] on `outcomes`, except blank
/// lines, which are ignored.
pub fn run_dispatch(
    commands: &WorkQueue<String>,
    engine: &QueueSender<EngineJob>,
    outcomes: &Sender<CommandOutcome>,
    poll_interval: Duration,
    stop: &StopSignal,
) -> StationResult<DispatchStats> {
    let mut stats = DispatchStats::default();
    loop {
        let raw = match commands.recv(poll_interval, stop) {
            Recv::Item(raw) => raw,
            Recv::Empty => continue,
            Recv::Cancelled => break,
        };
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }

        let result = match Request::parse(token) {
            Ok(request) => match submit(engine, request, poll_interval, stop) {
                Some(result) => result,
                None => break,
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(reply) => {
                stats.completed += 1;
                info!(request = %token, reply = %reply, "Command complete");
            }
            Err(e @ StationError::UnsupportedRequest(_)) => {
                stats.rejected += 1;
                warn!("{}", e);
            }
            Err(StationError::Cancelled) => break,
            Err(e) => {
                stats.failed += 1;
                warn!(request = %token, "{}", e);
            }
        }

        let outcome = CommandOutcome {
            request: token.to_string(),
            result,
        };
        if outcomes.send(outcome).is_err() {
            debug!("No listener for command outcomes");
        }
    }
    debug!(
        completed = stats.completed,
        rejected = stats.rejected,
        failed = stats.failed,
        "Dispatch stopped"
    );
    Ok(stats)
}

/// Hand `request` to the engine and wait for its reply.
///
/// `None` means the station is shutting down: either `stop` fired or the engine thread
/// is gone.
fn submit(
    engine: &QueueSender<EngineJob>,
    request: Request,
    poll_interval: Duration,
    stop: &StopSignal,
) -> Option<EngineReply> {
    let (reply_tx, reply_rx) = WorkQueue::unbounded();
    if !engine.push(EngineJob {
        request,
        reply: reply_tx,
    }) {
        debug!(%request, "Protocol engine gone, dropping request");
        return None;
    }
    loop {
        match reply_rx.recv(poll_interval, stop) {
            Recv::Item(reply) => return Some(reply),
            Recv::Empty => continue,
            Recv::Cancelled => {
                debug!(%request, "Abandoned in-flight request");
                return None;
            }
        }
    }
}
