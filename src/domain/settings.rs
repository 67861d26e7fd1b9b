use crate::domain::models::RemoteDevice;
use serde::{Deserialize, Serialize};
use std::fs;
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
    "nixie_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,

    // Link Settings
    /// Treat every new session as verified without the challenge exchange
    #[serde(default = "default_false")]
    pub skip_handshake: bool,
    #[serde(default)]
    pub last_device: Option<RemoteDevice>,
    #[serde(default = "default_service_uuid")]
    pub service_uuid: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_true")]
    pub listen_after_disconnect: bool,
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,

    // Handshake Settings
    /// Unset means retry on every CONN_FAIL
    #[serde(default)]
    pub handshake_max_retries: Option<u32>,
    #[serde(default)]
    pub handshake_retry_delay_ms: u64,

    // Bridge Settings
    #[serde(default = "default_tcp_listen_addr")]
    pub tcp_listen_addr: String,

    // Clock Settings
    /// Offset applied when syncing the clock to system time
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            skip_handshake: false,
            last_device: None,
            service_uuid: default_service_uuid(),
            service_name: default_service_name(),
            listen_after_disconnect: default_true(),
            max_frame_len: default_max_frame_len(),
            handshake_max_retries: None,
            handshake_retry_delay_ms: 0,
            tcp_listen_addr: default_tcp_listen_addr(),
            utc_offset_minutes: 0,
        }
    }
}

fn default_service_uuid() -> String {
    "00001101-0000-1000-8000-00805F9B34FB".to_string()
}
fn default_service_name() -> String {
    "AllThingsBluetooth".to_string()
}
fn default_max_frame_len() -> usize {
    1024
}
fn default_tcp_listen_addr() -> String {
    "127.0.0.1:7070".to_string()
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

    /// Load from an explicit file, falling back to defaults when it is missing or unreadable.
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!("Using default settings ({}): {}", settings_path.display(), e);
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
        path.push("ProjectNixie");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
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

    pub fn remember_device(&mut self, device: RemoteDevice) -> anyhow::Result<()> {
        if self.settings.last_device.as_ref() != Some(&device) {
            self.settings.last_device = Some(device);
            self.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_take_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "skip_handshake": true }"#).unwrap();
        assert!(settings.skip_handshake);
        assert_eq!(settings.service_uuid, "00001101-0000-1000-8000-00805F9B34FB");
        assert_eq!(settings.max_frame_len, 1024);
        assert!(settings.listen_after_disconnect);
        assert_eq!(settings.handshake_max_retries, None);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut service = SettingsService::with_path(path.clone());
        assert!(service.get().last_device.is_none());

        service
            .remember_device(RemoteDevice::new("00:21:13:01:A2:FF", "Nixie"))
            .unwrap();
        service.get_mut().handshake_max_retries = Some(5);
        service.save().unwrap();

        let reloaded = SettingsService::with_path(path);
        assert_eq!(
            reloaded.get().last_device,
            Some(RemoteDevice::new("00:21:13:01:A2:FF", "Nixie"))
        );
        assert_eq!(reloaded.get().handshake_max_retries, Some(5));
    }

    #[test]
    fn test_corrupt_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        let service = SettingsService::with_path(path);
        assert!(!service.get().skip_handshake);
    }
}
