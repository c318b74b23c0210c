//! Durable device state.
//!
//! The device keeps a small key/value record (`led`, `lock_position`, ...) that survives
//! restarts. It is written as pretty JSON on shutdown and read back on startup; a missing
//! or unreadable file means "start from defaults".
//!
//! The store is owned by the device thread, so every mutation goes through `&mut self`
//! and there is exactly one writer.

use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// State key for the builtin LED.
pub const LED: &str = "led";
/// State key for the lid lock actuator position.
pub const LOCK_POSITION: &str = "lock_position";

/// A stored attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    /// On/off attribute
    Bool(bool),
    /// Numeric attribute
    Int(i64),
}

impl StateValue {
    /// The boolean payload, if this is a boolean.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            StateValue::Bool(v) => Some(v),
            StateValue::Int(_) => None,
        }
    }

    /// The integer payload, if this is an integer.
    pub fn as_int(self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(v),
            StateValue::Bool(_) => None,
        }
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<i64> for StateValue {
    fn from(value: i64) -> Self {
        StateValue::Int(value)
    }
}

/// Key/value record of device attributes backed by a JSON file.
#[derive(Debug, Clone, PartialEq)]
pub struct StateStore {
    path: PathBuf,
    values: BTreeMap<String, StateValue>,
}

impl StateStore {
    /// A store at `path` holding the defaults. Nothing is read from disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut store = Self {
            path: path.into(),
            values: BTreeMap::new(),
        };
        store.reset_to_defaults();
        store
    }

    /// Open the store at `path`, loading it if possible.
    ///
    /// Load failures are logged and leave the defaults in place.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let mut store = Self::new(path);
        if let Err(e) = store.load() {
            warn!("Falling back to default device state: {}", e);
        }
        store
    }

    /// The default attributes: LED off, lock released.
    pub fn defaults() -> BTreeMap<String, StateValue> {
        BTreeMap::from([
            (LED.to_string(), StateValue::Bool(false)),
            (LOCK_POSITION.to_string(), StateValue::Int(0)),
        ])
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.values.get(key).copied()
    }

    /// Store `value` under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.values.insert(key.into(), value.into());
    }

    /// Remove `key`; absent keys are ignored.
    pub fn remove(&mut self, key: &str) -> Option<StateValue> {
        self.values.remove(key)
    }

    /// Discard everything and restore the defaults.
    pub fn reset_to_defaults(&mut self) {
        self.values = Self::defaults();
    }

    /// All stored attributes.
    pub fn values(&self) -> &BTreeMap<String, StateValue> {
        &self.values
    }

    /// Read the backing file.
    ///
    /// A missing file resets to defaults and succeeds. Any other failure also resets to
    /// defaults, then reports the error.
    pub fn load(&mut self) -> StationResult<()> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No stored device state, using defaults");
                self.reset_to_defaults();
                return Ok(());
            }
            Err(e) => {
                self.reset_to_defaults();
                return Err(StationError::persistence(&self.path, e));
            }
        };

        match serde_json::from_str::<BTreeMap<String, StateValue>>(&contents) {
            Ok(values) => {
                debug!(path = %self.path.display(), entries = values.len(), "Device state loaded");
                self.values = values;
                Ok(())
            }
            Err(e) => {
                self.reset_to_defaults();
                Err(e.into())
            }
        }
    }

    /// Write the backing file.
    ///
    /// The document goes to a sibling temporary file which is flushed, synced and then
    /// renamed over the target, so a crash never leaves a half-written state file.
    pub fn save(&self) -> StationResult<()> {
        let tmp = self.tmp_path();
        let json = serde_json::to_string_pretty(&self.values)?;
        {
            let file = File::create(&tmp).map_err(|e| StationError::persistence(&tmp, e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(json.as_bytes())
                .and_then(|_| writer.flush())
                .map_err(|e| StationError::persistence(&tmp, e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| StationError::persistence(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StationError::persistence(&self.path, e))?;
        info!(path = %self.path.display(), "Device state saved");
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn absent_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let mut store = StateStore::new(dir.path().join("state.json"));
        store.set(LED, true);
        store.load().unwrap();
        assert_eq!(store.values(), &StateStore::defaults());
        assert_eq!(store.get(LED), Some(StateValue::Bool(false)));
        assert_eq!(store.get(LOCK_POSITION), Some(StateValue::Int(0)));
        assert_eq!(store.values().len(), 2);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut store = StateStore::new(&path);
        store.set(LED, true);
        store.set(LOCK_POSITION, 800_i64);
        store.set("door_count", 3_i64);
        store.save().unwrap();

        let mut fresh = StateStore::new(&path);
        fresh.load().unwrap();
        assert_eq!(fresh.values(), store.values());
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn file_uses_plain_json_values() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut store = StateStore::new(&path);
        store.set(LOCK_POSITION, 800_i64);
        store.save().unwrap();

        let doc: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(doc["led"], serde_json::json!(false));
        assert_eq!(doc["lock_position"], serde_json::json!(800));
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();

        let mut store = StateStore::new(&path);
        store.set(LED, true);
        assert!(matches!(store.load(), Err(StationError::StateFormat(_))));
        assert_eq!(store.values(), &StateStore::defaults());

        let opened = StateStore::open(&path);
        assert_eq!(opened.values(), &StateStore::defaults());
    }

    #[test]
    fn remove_and_reset() {
        let mut store = StateStore::new("unused.json");
        assert_eq!(store.remove(LED), Some(StateValue::Bool(false)));
        assert_eq!(store.remove(LED), None);
        store.reset_to_defaults();
        assert_eq!(store.get(LED).and_then(StateValue::as_bool), Some(false));
        assert_eq!(store.get(LOCK_POSITION).and_then(StateValue::as_int), Some(0));
    }

    #[test]
    fn save_into_missing_directory_is_reported() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("missing").join("state.json"));
        assert!(matches!(
            store.save(),
            Err(StationError::Persistence { .. })
        ));
    }
}
