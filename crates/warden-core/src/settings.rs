use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::protocol::{EventData, UpdateChannel};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] io::Error),
    #[error("settings serialization error: {0}")]
    Serialization(String),
}

/// User preferences plus the last enable/disable intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsSnapshot {
    pub configuration: String,
    pub report_device_name: bool,
    pub check_updates: bool,
    pub update_channel: UpdateChannel,
    pub desired_enabled: bool,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            configuration: String::new(),
            report_device_name: true,
            check_updates: true,
            update_channel: UpdateChannel::Stable,
            desired_enabled: false,
        }
    }
}

impl SettingsSnapshot {
    /// Payload of the `settings` event pushed to the service.
    pub fn to_event_data(&self) -> EventData {
        EventData {
            enabled: Some(self.desired_enabled),
            configuration: Some(self.configuration.clone()),
            report_device_name: Some(self.report_device_name),
            check_updates: Some(self.check_updates),
            update_channel: Some(self.update_channel.as_str().to_string()),
            ..EventData::default()
        }
    }

    /// True when the two snapshots differ at most in `desired_enabled`.
    pub fn same_preferences(&self, other: &SettingsSnapshot) -> bool {
        self.configuration == other.configuration
            && self.report_device_name == other.report_device_name
            && self.check_updates == other.check_updates
            && self.update_channel == other.update_channel
    }

    /// Overlays the fields present in a `settings` payload.
    pub fn merge_event_data(&mut self, data: &EventData) {
        if let Some(configuration) = &data.configuration {
            self.configuration = configuration.clone();
        }
        if let Some(value) = data.report_device_name {
            self.report_device_name = value;
        }
        if let Some(value) = data.check_updates {
            self.check_updates = value;
        }
        if let Some(channel) = &data.update_channel {
            self.update_channel = UpdateChannel::parse_lenient(channel);
        }
        if let Some(enabled) = data.enabled {
            self.desired_enabled = enabled;
        }
    }
}

/// Storage boundary for user settings. `changes` fires after every
/// committed `write`.
pub trait SettingsStore: Send + Sync {
    fn read(&self) -> SettingsSnapshot;
    fn write(&self, snapshot: SettingsSnapshot) -> Result<(), SettingsError>;
    fn changes(&self) -> watch::Receiver<SettingsSnapshot>;
}

pub struct JsonSettingsStore {
    path: PathBuf,
    current: watch::Sender<SettingsSnapshot>,
}

impl JsonSettingsStore {
    /// Loads `path`, falling back to defaults when the file is missing or
    /// unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = match load_snapshot(&path) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => SettingsSnapshot::default(),
            Err(err) => {
                warn!(event = "settings_load_error", path = %path.display(), error = %err);
                SettingsSnapshot::default()
            }
        };
        let (current, _) = watch::channel(snapshot);
        Self { path, current }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn read(&self) -> SettingsSnapshot {
        self.current.borrow().clone()
    }

    fn write(&self, snapshot: SettingsSnapshot) -> Result<(), SettingsError> {
        save_snapshot(&self.path, &snapshot)?;
        debug!(event = "settings_saved", path = %self.path.display());
        self.current.send_replace(snapshot);
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<SettingsSnapshot> {
        self.current.subscribe()
    }
}

pub struct MemorySettingsStore {
    current: watch::Sender<SettingsSnapshot>,
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(SettingsSnapshot::default())
    }
}

impl MemorySettingsStore {
    pub fn new(snapshot: SettingsSnapshot) -> Self {
        let (current, _) = watch::channel(snapshot);
        Self { current }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn read(&self) -> SettingsSnapshot {
        self.current.borrow().clone()
    }

    fn write(&self, snapshot: SettingsSnapshot) -> Result<(), SettingsError> {
        self.current.send_replace(snapshot);
        Ok(())
    }

    fn changes(&self) -> watch::Receiver<SettingsSnapshot> {
        self.current.subscribe()
    }
}

fn load_snapshot(path: &Path) -> Result<Option<SettingsSnapshot>, SettingsError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| SettingsError::Serialization(err.to_string()))
}

fn save_snapshot(path: &Path, snapshot: &SettingsSnapshot) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let body = serde_json::to_vec_pretty(snapshot)
        .map_err(|err| SettingsError::Serialization(err.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, body)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
