//! Command registry: exact-match lookup from wire strings to handlers.
//!
//! Registration goes through [`RegistryBuilder`]. A namespace prefix can be set on the
//! builder and is prepended to every following [`RegistryBuilder::register`] call, which
//! keeps SCPI trees compact:
//!
//! ```
//! use deposit_station::registry::RegistryBuilder;
//!
//! let registry = RegistryBuilder::new()
//!     .register("*IDN?", "identify")
//!     .set_namespace("LED")
//!     .register(":ON", "led on")
//!     .register(":OFF", "led off")
//!     .build();
//!
//! assert_eq!(registry.resolve(" LED:ON \n").ok(), Some(&"led on"));
//! assert!(registry.resolve("led:on").is_err());
//! ```
//!
//! The prefix only exists while building. Each entry stores its fully qualified key, and
//! the built [`CommandRegistry`] is immutable.

use crate::error::{StationError, StationResult};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Builder for a [`CommandRegistry`].
#[derive(Debug)]
pub struct RegistryBuilder<H> {
    namespace: String,
    commands: HashMap<String, H>,
}

impl<H> Default for RegistryBuilder<H> {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            commands: HashMap::new(),
        }
    }
}

impl<H> RegistryBuilder<H> {
    /// Start an empty registry with no namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the prefix applied to subsequent [`register`](Self::register) calls.
    ///
    /// An empty prefix returns to the root.
    pub fn set_namespace(mut self, prefix: impl Into<String>) -> Self {
        self.namespace = prefix.into();
        self
    }

    /// The prefix currently applied by [`register`](Self::register).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Register `handler` under `namespace + suffix`. The last registration of a key wins.
    pub fn register(self, suffix: &str, handler: H) -> Self {
        let key = format!("{}{}", self.namespace, suffix);
        self.register_exact(key, handler)
    }

    /// Register `handler` under `key` exactly, ignoring the namespace.
    pub fn register_exact(mut self, key: impl Into<String>, handler: H) -> Self {
        let key = key.into();
        if self.commands.insert(key.clone(), handler).is_some() {
            debug!(command = %key, "Replacing existing command registration");
        }
        self
    }

    /// Freeze the registrations.
    pub fn build(self) -> CommandRegistry<H> {
        CommandRegistry {
            commands: self.commands,
        }
    }
}

/// Immutable exact-match command table.
#[derive(Debug)]
pub struct CommandRegistry<H> {
    commands: HashMap<String, H>,
}

impl<H> CommandRegistry<H> {
    /// Find the handler for a raw input line.
    ///
    /// Surrounding whitespace is trimmed; the remaining text must equal a registered key
    /// exactly (case sensitive, no prefix or wildcard matching).
    pub fn resolve(&self, input: &str) -> StationResult<&H> {
        let key = input.trim();
        self.commands
            .get(key)
            .ok_or_else(|| StationError::UnknownCommand(key.to_string()))
    }

    /// Look up `input` and hand its handler to `invoke`.
    ///
    /// Unknown input is logged and yields `None`; this is never fatal.
    pub fn dispatch<R>(&self, input: &str, invoke: impl FnOnce(&H) -> R) -> Option<R> {
        match self.resolve(input) {
            Ok(handler) => Some(invoke(handler)),
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    /// Whether `key` is registered exactly.
    pub fn contains(&self, key: &str) -> bool {
        self.commands.contains_key(key)
    }

    /// Number of registered commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}
