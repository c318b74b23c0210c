//! Device side of the link protocol: a simulated LED and lid-lock driver.
//!
//! The simulator reads lines from its link, resolves each one through a
//! [`CommandRegistry`] of [`DeviceCommand`]s and executes the matching handler against
//! its [`StateStore`]. Queries write one reply line; actions change state and reply
//! nothing, leaving the acknowledgement to the `*OPC?` the controller sends next.
//!
//! Everything runs on one thread, which is therefore the only writer of the store.

use crate::command::DeviceCommand;
use crate::config::{IdentityConfig, StationConfig};
use crate::error::{StationError, StationResult};
use crate::link::Link;
use crate::registry::{CommandRegistry, RegistryBuilder};
use crate::shutdown::StopSignal;
use crate::state::{StateStore, LED, LOCK_POSITION};
use std::time::Duration;
use tracing::{debug, info};

/// Lock actuator position when engaged.
pub const LOCK_ENGAGED: i64 = 800;
/// Lock actuator position when released.
pub const LOCK_RELEASED: i64 = 0;

/// Reply to `*OPC?`.
pub const OPERATION_COMPLETE: &str = "1";

/// Build the device's command table.
pub fn device_registry() -> CommandRegistry<DeviceCommand> {
    RegistryBuilder::new()
        .register("*IDN?", DeviceCommand::Identify)
        .register("*OPC?", DeviceCommand::OperationComplete)
        .set_namespace("MEAS")
        .register(":DIST?", DeviceCommand::MeasureDistance)
        .set_namespace("LED")
        .register(":ON", DeviceCommand::LedOn)
        .register(":OFF", DeviceCommand::LedOff)
        .set_namespace("LOCK")
        .register(":ON", DeviceCommand::LockOn)
        .register(":OFF", DeviceCommand::LockOff)
        .build()
}

/// Behaviour knobs for the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSettings {
    /// Fields of the `*IDN?` reply
    pub identity: IdentityConfig,
    /// Simulated lock actuation time
    pub actuation_delay: Duration,
    /// Value reported for `MEAS:DIST?`
    pub distance_mm: u32,
    /// Longest single link read
    pub read_timeout: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            actuation_delay: Duration::from_millis(500),
            distance_mm: 120,
            read_timeout: Duration::from_millis(50),
        }
    }
}

impl DeviceSettings {
    /// Settings taken from the `device` and `link` sections.
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            identity: config.device.identity.clone(),
            actuation_delay: config.device.actuation_delay(),
            distance_mm: config.device.distance_mm,
            read_timeout: config.link.read_timeout(),
        }
    }

    /// The `*IDN?` reply line.
    pub fn identification(&self) -> String {
        let id = &self.identity;
        format!("{},{},{},{}", id.vendor, id.model, id.serial, id.firmware)
    }
}

/// Simulated device bound to one link and one state store.
pub struct DeviceSimulator<L> {
    link: L,
    store: StateStore,
    registry: CommandRegistry<DeviceCommand>,
    settings: DeviceSettings,
    handled: u64,
    unknown: u64,
}

impl<L: Link> DeviceSimulator<L> {
    /// Create a simulator with the standard command table.
    pub fn new(link: L, store: StateStore, settings: DeviceSettings) -> Self {
        Self {
            link,
            store,
            registry: device_registry(),
            settings,
            handled: 0,
            unknown: 0,
        }
    }

    /// Current device state.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Commands executed so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Lines that matched no command.
    pub fn unknown(&self) -> u64 {
        self.unknown
    }

    /// Release the link and hand back the state store.
    pub fn into_store(self) -> StateStore {
        let DeviceSimulator { link, store, .. } = self;
        debug!(link = %link.describe(), "Releasing device link");
        drop(link);
        store
    }

    /// Serve the link until `stop` fires.
    ///
    /// Unknown lines are logged and skipped. Link failures end the loop with an error,
    /// unless `stop` was already raised: the controller hanging up during shutdown is a
    /// normal end of service.
    pub fn run(&mut self, stop: &StopSignal) -> StationResult<()> {
        info!(
            link = %self.link.describe(),
            commands = ?self.registry.keys(),
            "Device ready"
        );
        while !stop.is_cancelled() {
            let served = match self.link.read_line(self.settings.read_timeout) {
                Ok(Some(line)) => self.handle_line(&line, stop),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = served {
                if stop.is_cancelled() {
                    debug!("Link closed during shutdown: {}", e);
                    break;
                }
                return Err(e);
            }
        }
        debug!(handled = self.handled, unknown = self.unknown, "Device loop stopped");
        Ok(())
    }

    /// Resolve and execute one received line, writing its reply if it has one.
    pub fn handle_line(&mut self, line: &str, stop: &StopSignal) -> StationResult<()> {
        let Some(command) = self.registry.dispatch(line, |command| *command) else {
            self.unknown += 1;
            return Ok(());
        };
        self.handled += 1;
        match self.execute(command, stop) {
            Ok(Some(reply)) => self.link.write_line(&reply),
            Ok(None) => Ok(()),
            Err(StationError::Cancelled) => {
                debug!(%command, "Interrupted by shutdown");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply `command` to the device, returning the reply line for queries.
    pub fn execute(
        &mut self,
        command: DeviceCommand,
        stop: &StopSignal,
    ) -> StationResult<Option<String>> {
        debug!(%command, "Executing");
        let reply = match command {
            DeviceCommand::Identify => Some(self.settings.identification()),
            DeviceCommand::OperationComplete => Some(OPERATION_COMPLETE.to_string()),
            DeviceCommand::MeasureDistance => Some(self.settings.distance_mm.to_string()),
            DeviceCommand::LedOn => {
                self.store.set(LED, true);
                None
            }
            DeviceCommand::LedOff => {
                self.store.set(LED, false);
                None
            }
            DeviceCommand::LockOn => {
                self.actuate_lock(LOCK_ENGAGED, stop)?;
                None
            }
            DeviceCommand::LockOff => {
                self.actuate_lock(LOCK_RELEASED, stop)?;
                None
            }
        };
        Ok(reply)
    }

    /// Move the lock, taking the configured actuation time. An interrupted move leaves
    /// the position unchanged.
    fn actuate_lock(&mut self, position: i64, stop: &StopSignal) -> StationResult<()> {
        if !stop.wait_timeout(self.settings.actuation_delay) {
            return Err(StationError::Cancelled);
        }
        self.store.set(LOCK_POSITION, position);
        info!(position, "Lock actuated");
        Ok(())
    }
}

impl<L> std::fmt::Debug for DeviceSimulator<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSimulator")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .field("handled", &self.handled)
            .finish_non_exhaustive()
    }
}
