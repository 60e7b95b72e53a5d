//! Station settings and the device table.
//!
//! The core only ever sees devices through `DeviceConfig`. Everything else here
//! is read once at startup by the binary.

use crate::connection::{Connector, TestPatternConnector};
use crate::error::ConfigError;
use crate::frame_writer::RecordingFormat;
use crate::opener::DEFAULT_OPEN_TIMEOUT;
use crate::station::DEFAULT_REFRESH_COOLDOWN;
use serde::{Deserialize, Serialize};
use station_types::{Credentials, Slot, MAX_SLOTS};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_FILE: &str = "station.toml";

/// Where each camera slot points. Read whenever a panel starts or refreshes.
pub trait DeviceConfig: Send + Sync {
    fn device_address(&self, slot: Slot) -> Option<String>;
    fn device_name(&self, slot: Slot) -> Option<String>;

    /// Points `slot` at a new device, as the settings screen does. Returns what was
    /// stored: a host that is not an IP address is stored empty.
    fn store_device(&self, slot: Slot, host: &str, name: &str) -> Result<Device, ConfigError>;
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Device {
    pub host: String,
    pub name: String,
}

impl Device {
    /// A host that does not parse as an IP address is stored as empty.
    pub fn new(host: &str, name: &str) -> Device {
        Device { host: validated_host(host), name: name.trim().to_owned() }
    }
}

fn validated_host(host: &str) -> String {
    let host = host.trim();
    if host.is_empty() || host.parse::<IpAddr>().is_ok() {
        host.to_owned()
    } else {
        warn!(host, "not a valid IP address, device left without one");
        String::new()
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// Synthetic colour bars, no hardware needed.
    TestPattern,
    #[cfg(feature = "ffmpeg")]
    Rtsp,
}

impl Default for Backend {
    fn default() -> Backend {
        Backend::TestPattern
    }
}

impl Backend {
    pub fn connector(self) -> Arc<dyn Connector> {
        match self {
            Backend::TestPattern => Arc::new(TestPatternConnector::default()),
            #[cfg(feature = "ffmpeg")]
            Backend::Rtsp => Arc::new(crate::rtsp::RtspConnector::new()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StationSettings {
    pub recordings_dir: PathBuf,
    pub stream_path: String,
    pub user: String,
    pub password: String,
    pub open_timeout_secs: u64,
    pub refresh_cooldown_secs: u64,
    pub recording_format: RecordingFormat,
    pub backend: Backend,
}

impl Default for StationSettings {
    fn default() -> StationSettings {
        StationSettings {
            recordings_dir: PathBuf::from("recordings"),
            stream_path: "axis-media/media.amp".to_owned(),
            user: "root".to_owned(),
            password: String::new(),
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT.as_secs(),
            refresh_cooldown_secs: DEFAULT_REFRESH_COOLDOWN.as_secs(),
            recording_format: RecordingFormat::default(),
            backend: Backend::default(),
        }
    }
}

impl StationSettings {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.user.as_str(), self.password.as_str())
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn refresh_cooldown(&self) -> Duration {
        Duration::from_secs(self.refresh_cooldown_secs)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// INFO events are also appended here as CSV rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_file: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> LogSettings {
        LogSettings { level: "info".to_owned(), csv_file: None }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    pub station: StationSettings,
    pub log: LogSettings,
    /// An empty array would land after the tables, which TOML forbids.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<Device>,
}

impl StationConfig {
    pub fn from_toml(text: &str) -> Result<StationConfig, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    pub fn device(&self, slot: Slot) -> Option<&Device> {
        self.devices.get(slot.index())
    }

    pub fn set_device(&mut self, slot: Slot, device: Device) {
        if self.devices.len() <= slot.index() {
            self.devices.resize(slot.index() + 1, Device::default());
        }
        self.devices[slot.index()] = device;
    }
}

impl StationConfig {
    pub fn device_address(&self, slot: Slot) -> Option<String> {
        self.device(slot).and_then(|d| non_empty(&d.host))
    }

    pub fn device_name(&self, slot: Slot) -> Option<String> {
        self.device(slot).and_then(|d| non_empty(&d.name))
    }
}

/// In-memory devices, writable while the station runs.
#[derive(Default)]
pub struct DeviceTable {
    devices: RwLock<Vec<Device>>,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable::default()
    }

    pub fn from_devices(devices: Vec<Device>) -> DeviceTable {
        DeviceTable { devices: RwLock::new(devices) }
    }

    pub fn set(&self, slot: Slot, host: &str, name: &str) -> Device {
        let mut devices = match self.devices.write() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        };
        if devices.len() <= slot.index() {
            devices.resize(slot.index() + 1, Device::default());
        }
        let device = Device::new(host, name);
        devices[slot.index()] = device.clone();
        device
    }

    fn read(&self, slot: Slot, field: impl Fn(&Device) -> &str) -> Option<String> {
        let devices = match self.devices.read() {
            Ok(devices) => devices,
            Err(poisoned) => poisoned.into_inner(),
        };
        devices.get(slot.index()).and_then(|d| non_empty(field(d)))
    }
}

impl DeviceConfig for DeviceTable {
    fn device_address(&self, slot: Slot) -> Option<String> {
        self.read(slot, |d| d.host.as_str())
    }

    fn device_name(&self, slot: Slot) -> Option<String> {
        self.read(slot, |d| d.name.as_str())
    }

    fn store_device(&self, slot: Slot, host: &str, name: &str) -> Result<Device, ConfigError> {
        Ok(self.set(slot, host, name))
    }
}

/// The TOML file on disk. Every query re-reads it, so edits made through the
/// settings commands are seen at the next start or refresh.
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: impl Into<PathBuf>) -> ConfigFile {
        ConfigFile { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file reads as the defaults.
    pub fn load(&self) -> Result<StationConfig, ConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => StationConfig::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StationConfig::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn store(&self, config: &StationConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, config.to_toml()?)?;
        Ok(())
    }

    pub fn save_device(&self, slot: usize, host: &str, name: &str) -> Result<Device, ConfigError> {
        let slot = Slot::new(slot).ok_or(ConfigError::InvalidSlot(slot))?;
        let mut config = self.load()?;
        let device = Device::new(host, name);

        config.set_device(slot, device.clone());
        self.store(&config)?;
        info!(%slot, host = %device.host, name = %device.name, "device saved");
        Ok(device)
    }

    pub fn clear_devices(&self) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.devices.clear();
        self.store(&config)?;
        info!(path = %self.path.display(), "device configuration cleared");
        Ok(())
    }

    fn query(&self, slot: Slot, field: impl Fn(&StationConfig, Slot) -> Option<String>) -> Option<String> {
        match self.load() {
            Ok(config) => field(&config, slot),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read device configuration");
                None
            },
        }
    }
}

impl DeviceConfig for ConfigFile {
    fn device_address(&self, slot: Slot) -> Option<String> {
        self.query(slot, |config, slot| config.device_address(slot))
    }

    fn device_name(&self, slot: Slot) -> Option<String> {
        self.query(slot, |config, slot| config.device_name(slot))
    }

    fn store_device(&self, slot: Slot, host: &str, name: &str) -> Result<Device, ConfigError> {
        self.save_device(slot.index(), host, name)
    }
}

/// Slots beyond the table read as unconfigured.
pub fn configured_slots(config: &dyn DeviceConfig) -> usize {
    Slot::all().filter(|slot| config.device_address(*slot).is_some()).count().min(MAX_SLOTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(index: usize) -> Slot {
        Slot::new(index).unwrap()
    }

    #[test]
    fn defaults_fill_missing_keys() {
        let config = StationConfig::from_toml(r#"
            [station]
            password = "secret"

            [[devices]]
            host = "10.0.0.5"
            name = "Gate"
        "#).unwrap();

        assert_eq!(config.station.password, "secret");
        assert_eq!(config.station.stream_path, "axis-media/media.amp");
        assert_eq!(config.station.open_timeout(), Duration::from_secs(5));
        assert_eq!(config.station.refresh_cooldown(), Duration::from_secs(4));
        assert_eq!(config.station.recording_format, RecordingFormat::Mjpeg);
        assert_eq!(config.station.backend, Backend::TestPattern);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.device_address(slot(0)).as_deref(), Some("10.0.0.5"));
        assert_eq!(config.device_name(slot(0)).as_deref(), Some("Gate"));
        assert_eq!(config.device_address(slot(1)), None);
    }

    #[test]
    fn invalid_host_is_stored_empty() {
        assert_eq!(Device::new("10.0.0.7", "Yard").host, "10.0.0.7");
        assert_eq!(Device::new(" fe80::1 ", "").host, "fe80::1");
        assert_eq!(Device::new("camera.local", "Yard").host, "");
        assert_eq!(Device::new("10.0.0", "Yard").host, "");
    }

    #[test]
    fn config_file_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("station.toml"));

        assert_eq!(file.device_address(slot(2)), None);

        file.save_device(2, "192.168.1.20", "Back Door").unwrap();
        file.save_device(0, "not-an-ip", "Front").unwrap();

        assert_eq!(file.device_address(slot(2)).as_deref(), Some("192.168.1.20"));
        assert_eq!(file.device_name(slot(2)).as_deref(), Some("Back Door"));
        assert_eq!(file.device_address(slot(0)), None);
        assert_eq!(file.device_name(slot(0)).as_deref(), Some("Front"));
        assert_eq!(configured_slots(&file), 1);

        file.clear_devices().unwrap();
        assert_eq!(file.device_address(slot(2)), None);
        assert!(file.load().unwrap().devices.is_empty());
    }

    #[test]
    fn save_device_rejects_out_of_range_slot() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("station.toml"));
        assert!(matches!(file.save_device(4, "10.0.0.1", ""), Err(ConfigError::InvalidSlot(4))));
    }

    #[test]
    fn stored_devices_are_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = ConfigFile::new(dir.path().join("station.toml"));
        let table = DeviceTable::new();

        for devices in [&file as &dyn DeviceConfig, &table].iter() {
            let stored = devices.store_device(slot(1), " 10.0.0.42 ", "Side Door").unwrap();
            assert_eq!(stored, Device { host: "10.0.0.42".to_owned(), name: "Side Door".to_owned() });
            assert_eq!(devices.device_address(slot(1)).as_deref(), Some("10.0.0.42"));
            assert_eq!(devices.device_name(slot(1)).as_deref(), Some("Side Door"));

            assert_eq!(devices.store_device(slot(1), "gate-cam", "").unwrap().host, "");
            assert_eq!(devices.device_address(slot(1)), None);
        }
    }

    #[test]
    fn device_table_is_writable() {
        let table = DeviceTable::new();
        table.set(slot(3), "10.1.1.1", "  ");
        assert_eq!(table.device_address(slot(3)).as_deref(), Some("10.1.1.1"));
        assert_eq!(table.device_name(slot(3)), None);
        assert_eq!(table.device_address(slot(0)), None);
    }
}
