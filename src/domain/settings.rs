use crate::controller::{ControllerConfig, Timeouts};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hub program source, the payload when no `program_path` is configured.
/// The simulated hub runs it as is; a real hub needs it compiled to a
/// multi-file `.mpy` first.
pub const DEFAULT_HUB_PROGRAM: &[u8] = include_bytes!("../../assets/hub_program.py");

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
    #[serde(default = "default_true")]
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
            show_thread_ids: default_true(),
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
    "hub_remote".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Advertised name of the hub to connect to.
    #[serde(default = "default_hub_name")]
    pub hub_name: String,

    // Phase timeouts (seconds)
    #[serde(default = "default_find_device_timeout_s")]
    pub find_device_timeout_s: f64,
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: f64,
    #[serde(default = "default_run_program_timeout_s")]
    pub run_program_timeout_s: f64,
    #[serde(default = "default_write_timeout_s")]
    pub write_timeout_s: f64,
    #[serde(default = "default_disconnect_timeout_s")]
    pub disconnect_timeout_s: f64,

    /// Payload file. Pybricks firmware expects a multi-file `.mpy` blob here.
    #[serde(default)]
    pub program_path: Option<String>,

    #[serde(default)]
    pub log_settings: LogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hub_name: default_hub_name(),
            find_device_timeout_s: default_find_device_timeout_s(),
            connect_timeout_s: default_connect_timeout_s(),
            run_program_timeout_s: default_run_program_timeout_s(),
            write_timeout_s: default_write_timeout_s(),
            disconnect_timeout_s: default_disconnect_timeout_s(),
            program_path: None,
            log_settings: LogSettings::default(),
        }
    }
}

fn default_hub_name() -> String {
    "PY-SC".to_string()
}
fn default_find_device_timeout_s() -> f64 {
    20.0
}
fn default_connect_timeout_s() -> f64 {
    20.0
}
fn default_run_program_timeout_s() -> f64 {
    30.0
}
fn default_write_timeout_s() -> f64 {
    2.0
}
fn default_disconnect_timeout_s() -> f64 {
    5.0
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Settings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            discovery: secs(self.find_device_timeout_s),
            connect: secs(self.connect_timeout_s),
            transfer: secs(self.run_program_timeout_s),
            write: secs(self.write_timeout_s),
            disconnect: secs(self.disconnect_timeout_s),
        }
    }

    /// Read the payload once; the controller keeps it for every attempt.
    pub fn load_payload(&self) -> anyhow::Result<Vec<u8>> {
        match &self.program_path {
            Some(path) => fs::read(path).with_context(|| format!("reading program {}", path)),
            None => Ok(DEFAULT_HUB_PROGRAM.to_vec()),
        }
    }

    pub fn controller_config(&self) -> anyhow::Result<ControllerConfig> {
        Ok(ControllerConfig {
            device_name: self.hub_name.clone(),
            timeouts: self.timeouts(),
            payload: self.load_payload()?.into(),
        })
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load from an explicit file, falling back to defaults if missing or unreadable.
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("HubRemote");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}
