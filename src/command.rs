//! The command vocabulary spoken over the link.
//!
//! | Wire token   | Kind   | Device behaviour                                  |
//! |--------------|--------|---------------------------------------------------|
//! | `*IDN?`      | query  | replies `VENDOR,MODEL,SERIAL,FIRMWARE`            |
//! | `*OPC?`      | query  | replies `1` once earlier commands have completed  |
//! | `MEAS:DIST?` | query  | replies the measured distance in millimetres      |
//! | `LED:ON`     | action | `led = true`                                      |
//! | `LED:OFF`    | action | `led = false`                                     |
//! | `LOCK:ON`    | action | actuates the lid lock, `lock_position = 800`      |
//! | `LOCK:OFF`   | action | actuates the lid lock, `lock_position = 0`        |
//!
//! Actions produce no reply of their own; the controller follows each with `*OPC?`.

use crate::error::{StationError, StationResult};
use std::fmt;

/// Whether a request expects a direct reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Expects exactly one reply line.
    Query,
    /// Changes device state; acknowledged through `*OPC?`.
    Action,
}

/// Every command the device understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    /// `*IDN?`
    Identify,
    /// `*OPC?`
    OperationComplete,
    /// `MEAS:DIST?`
    MeasureDistance,
    /// `LED:ON`
    LedOn,
    /// `LED:OFF`
    LedOff,
    /// `LOCK:ON`
    LockOn,
    /// `LOCK:OFF`
    LockOff,
}

impl DeviceCommand {
    /// All commands, queries first.
    pub const ALL: [DeviceCommand; 7] = [
        DeviceCommand::Identify,
        DeviceCommand::OperationComplete,
        DeviceCommand::MeasureDistance,
        DeviceCommand::LedOn,
        DeviceCommand::LedOff,
        DeviceCommand::LockOn,
        DeviceCommand::LockOff,
    ];

    /// Exact token sent over the link.
    pub fn wire(self) -> &'static str {
        match self {
            DeviceCommand::Identify => "*IDN?",
            DeviceCommand::OperationComplete => "*OPC?",
            DeviceCommand::MeasureDistance => "MEAS:DIST?",
            DeviceCommand::LedOn => "LED:ON",
            DeviceCommand::LedOff => "LED:OFF",
            DeviceCommand::LockOn => "LOCK:ON",
            DeviceCommand::LockOff => "LOCK:OFF",
        }
    }

    /// Query or action.
    pub fn kind(self) -> RequestKind {
        match self {
            DeviceCommand::Identify
            | DeviceCommand::OperationComplete
            | DeviceCommand::MeasureDistance => RequestKind::Query,
            DeviceCommand::LedOn
            | DeviceCommand::LedOff
            | DeviceCommand::LockOn
            | DeviceCommand::LockOff => RequestKind::Action,
        }
    }

    /// Look up a token by exact match.
    pub fn from_wire(token: &str) -> Option<DeviceCommand> {
        Self::ALL.into_iter().find(|cmd| cmd.wire() == token)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire())
    }
}

/// A controller-side request, validated before anything is transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    command: DeviceCommand,
}

impl Request {
    /// Classify a raw request token.
    ///
    /// Surrounding whitespace is ignored; matching is otherwise exact and case sensitive.
    pub fn parse(raw: &str) -> StationResult<Request> {
        let token = raw.trim();
        DeviceCommand::from_wire(token)
            .map(|command| Request { command })
            .ok_or_else(|| StationError::UnsupportedRequest(token.to_string()))
    }

    /// The command carried by this request.
    pub fn command(&self) -> DeviceCommand {
        self.command
    }

    /// Query or action.
    pub fn kind(&self) -> RequestKind {
        self.command.kind()
    }

    /// Lines to transmit, in order, for one full request/response cycle.
    pub fn wire_lines(&self) -> Vec<&'static str> {
        match self.kind() {
            RequestKind::Query => vec![self.command.wire()],
            RequestKind::Action => vec![
                self.command.wire(),
                DeviceCommand::OperationComplete.wire(),
            ],
        }
    }
}

impl From<DeviceCommand> for Request {
    fn from(command: DeviceCommand) -> Self {
        Request { command }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.command.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tokens_round_trip() {
        for cmd in DeviceCommand::ALL {
            assert_eq!(DeviceCommand::from_wire(cmd.wire()), Some(cmd));
        }
    }

    #[test]
    fn queries_send_one_line() {
        let request = Request::parse("MEAS:DIST?").unwrap();
        assert_eq!(request.kind(), RequestKind::Query);
        assert_eq!(request.wire_lines(), ["MEAS:DIST?"]);
    }

    #[test]
    fn actions_are_followed_by_completion_query() {
        let request = Request::parse(" LOCK:ON\n").unwrap();
        assert_eq!(request.kind(), RequestKind::Action);
        assert_eq!(request.wire_lines(), ["LOCK:ON", "*OPC?"]);
    }

    #[test]
    fn unknown_tokens_are_rejected() {
        for raw in ["led:on", "LED:BLINK", "", "*IDN"] {
            match Request::parse(raw) {
                Err(StationError::UnsupportedRequest(token)) => assert_eq!(token, raw.trim()),
                other => panic!("expected rejection for {raw:?}, got {other:?}"),
            }
        }
    }
}
