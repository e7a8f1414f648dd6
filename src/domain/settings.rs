use crate::domain::models::SpeedUnit;
use crate::infrastructure::bluetooth::protocol;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "obd_speed_monitor".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Target device
    #[serde(default = "default_target_name")]
    pub target_name: String,
    #[serde(default = "default_service_id")]
    pub target_service_id: String,
    #[serde(default = "default_characteristic_id")]
    pub target_characteristic_id: String,

    // Polling
    #[serde(default = "default_poll_command")]
    pub poll_command: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Hex bytes written once after subscribing; empty to skip
    #[serde(default = "default_enable_payload")]
    pub enable_payload: String,
    #[serde(default = "default_true")]
    pub write_with_response: bool,
    #[serde(default = "default_subscribe_retries")]
    pub subscribe_retries: u32,

    // Response decoding
    #[serde(default = "default_response_frame_len")]
    pub response_frame_len: usize,
    #[serde(default)]
    pub response_value_offset: usize,
    #[serde(default = "default_response_terminator")]
    pub response_terminator: Option<u8>,
    #[serde(default)]
    pub unit: SpeedUnit,

    // Scanning and reconnection
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Scan for this long, then pause for `scan_pause_ms`; unset scans continuously
    #[serde(default)]
    pub scan_window_ms: Option<u64>,
    #[serde(default = "default_scan_pause_ms")]
    pub scan_pause_ms: u64,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            target_name: default_target_name(),
            target_service_id: default_service_id(),
            target_characteristic_id: default_characteristic_id(),

            poll_command: default_poll_command(),
            poll_interval_ms: default_poll_interval_ms(),
            enable_payload: default_enable_payload(),
            write_with_response: default_true(),
            subscribe_retries: default_subscribe_retries(),

            response_frame_len: default_response_frame_len(),
            response_value_offset: 0,
            response_terminator: default_response_terminator(),
            unit: SpeedUnit::default(),

            auto_reconnect: default_true(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            scan_window_ms: None,
            scan_pause_ms: default_scan_pause_ms(),

            log_settings: LogSettings::default(),
        }
    }
}

fn default_target_name() -> String {
    protocol::DEFAULT_TARGET_NAME.to_string()
}
fn default_service_id() -> String {
    protocol::SERVICE_UUID.to_string()
}
fn default_characteristic_id() -> String {
    protocol::DATA_CHAR_UUID.to_string()
}
fn default_poll_command() -> String {
    protocol::SPEED_COMMAND.to_string()
}
fn default_poll_interval_ms() -> u64 {
    protocol::POLL_INTERVAL_MS
}
fn default_enable_payload() -> String {
    protocol::ENABLE_PAYLOAD.to_string()
}
fn default_subscribe_retries() -> u32 {
    3
}
fn default_response_frame_len() -> usize {
    7
}
fn default_response_terminator() -> Option<u8> {
    Some(protocol::FRAME_TERMINATOR)
}
fn default_reconnect_delay_ms() -> u64 {
    1000
}
fn default_scan_pause_ms() -> u64 {
    10_000
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load from the per-user config directory
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Self::load(settings_path)
    }

    /// Load from an explicit path. A missing file yields defaults; a file
    /// that cannot be read or parsed is an error.
    pub fn load(settings_path: PathBuf) -> anyhow::Result<Self> {
        let settings = match fs::read_to_string(&settings_path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                anyhow::anyhow!("Invalid settings file {}: {}", settings_path.display(), e)
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Settings::default(),
            Err(e) => anyhow::bail!(
                "Cannot read settings file {}: {}",
                settings_path.display(),
                e
            ),
        };

        Ok(Self {
            settings,
            settings_path,
        })
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ObdSpeedMonitor");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    #[cfg(test)]
    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}
