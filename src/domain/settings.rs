use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_true")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
    /// Per-target levels on top of `level`, e.g. `"hci" -> "trace"`.
    #[serde(default = "default_target_levels")]
    pub target_levels: BTreeMap<String, String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_true(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
            target_levels: default_target_levels(),
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
    "bt_hid_stack".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_target_levels() -> BTreeMap<String, String> {
    // Raw HCI traffic is traced per packet.
    BTreeMap::from([("hci".to_string(), "info".to_string())])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Host controller
    #[serde(default = "default_device_path")]
    pub device_path: String,
    #[serde(default = "default_max_acl_packet_length")]
    pub max_acl_packet_length: usize,

    // Discovery and L2CAP timing
    #[serde(default = "default_discovery_duration_secs")]
    pub discovery_duration_secs: u64,
    #[serde(default = "default_signal_timeout_ms")]
    pub signal_timeout_ms: u64,

    // Controller bring-up
    #[serde(default = "default_channel_open_delay_ms")]
    pub channel_open_delay_ms: u64,
    #[serde(default = "default_ir_settle_delay_ms")]
    pub ir_settle_delay_ms: u64,

    /// JSON file holding the system controller records, if any.
    #[serde(default)]
    pub config_store_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            device_path: default_device_path(),
            max_acl_packet_length: default_max_acl_packet_length(),
            discovery_duration_secs: default_discovery_duration_secs(),
            signal_timeout_ms: default_signal_timeout_ms(),
            channel_open_delay_ms: default_channel_open_delay_ms(),
            ir_settle_delay_ms: default_ir_settle_delay_ms(),
            config_store_path: None,
        }
    }
}

fn default_device_path() -> String {
    "/dev/usb/oh1/57e/305".to_string()
}
fn default_max_acl_packet_length() -> usize {
    512
}
fn default_discovery_duration_secs() -> u64 {
    30
}
fn default_signal_timeout_ms() -> u64 {
    1000
}
fn default_channel_open_delay_ms() -> u64 {
    500
}
fn default_ir_settle_delay_ms() -> u64 {
    50
}

impl Settings {
    pub fn discovery_duration(&self) -> Duration {
        Duration::from_secs(self.discovery_duration_secs)
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Use `settings_path` instead of the per-user config directory.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(target: "settings", "Using default settings: {}", e);
                Settings::default()
            }
        };
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BtHidStack");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
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

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bt_hid_stack_{}_{}.json", name, std::process::id()))
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"signal_timeout_ms": 250}"#).unwrap();
        assert_eq!(settings.signal_timeout_ms, 250);
        assert_eq!(settings.device_path, "/dev/usb/oh1/57e/305");
        assert_eq!(settings.channel_open_delay_ms, 500);
        assert_eq!(settings.log_settings, LogSettings::default());
        assert_eq!(settings.discovery_duration(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("reload");
        let mut service = SettingsService::with_path(path.clone());
        service.get_mut().ir_settle_delay_ms = 75;
        service.get_mut().config_store_path = Some("sysconf.json".to_string());
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path.clone());
        assert_eq!(reloaded.get().ir_settle_delay_ms, 75);
        assert_eq!(reloaded.get().config_store_path.as_deref(), Some("sysconf.json"));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_unreadable_file_gives_defaults() {
        let path = temp_path("garbage");
        fs::write(&path, "not json").unwrap();
        let service = SettingsService::with_path(path.clone());
        assert_eq!(service.get(), &Settings::default());
        let _ = fs::remove_file(path);
    }
}
