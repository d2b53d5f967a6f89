//! Configuration management for the sink daemon.
//!
//! This module handles loading and saving configuration from disk:
//! adapter naming, the pairing window, speech, triggers and the D-Bus
//! control surface.

use std::{
   env, fs,
   path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::{Result, SinkError};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   /// HCI adapter name (e.g. `hci0`); the default adapter when absent.
   #[serde(default)]
   pub adapter: Option<SmolStr>,

   #[serde(default = "default_friendly_name")]
   pub friendly_name: SmolStr,

   #[serde(default = "default_discoverable_duration_ms")]
   pub discoverable_duration_ms: u32,

   /// Open a pairing window as soon as the sink profile is ready.
   #[serde(default = "default_true")]
   pub discoverable_on_start: bool,

   #[serde(default)]
   pub speech: SpeechConfig,

   #[serde(default)]
   pub trigger: TriggerConfig,

   #[serde(default)]
   pub profiles: ProfilesConfig,

   #[serde(default)]
   pub dbus: DBusConfig,
}

/// Text-to-speech engine settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SpeechConfig {
   #[serde(default = "default_true")]
   pub enabled: bool,

   #[serde(default = "default_speech_command")]
   pub command: String,

   /// Extra arguments placed before the utterance.
   #[serde(default)]
   pub args: Vec<String>,
}

/// Sources of the "pressed" signal.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TriggerConfig {
   /// React to `SIGUSR1`.
   #[serde(default = "default_true")]
   pub signal: bool,

   /// evdev device exposing the pairing button (e.g. a gpio-keys node).
   #[serde(default)]
   pub input_device: Option<PathBuf>,

   #[serde(default = "default_key_code")]
   pub key_code: u16,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProfilesConfig {
   /// Command (argv) that applies a profile change on this board.
   #[serde(default)]
   pub switch_command: Option<Vec<String>>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DBusConfig {
   #[serde(default = "default_true")]
   pub enabled: bool,

   #[serde(default)]
   pub system_bus: bool,
}

fn default_friendly_name() -> SmolStr {
   SmolStr::new_static("Android Things Assistant")
}

const fn default_discoverable_duration_ms() -> u32 {
   10_000
}

const fn default_true() -> bool {
   true
}

fn default_speech_command() -> String {
   "espeak-ng".to_string()
}

/// `BTN_0`
const fn default_key_code() -> u16 {
   0x100
}

impl Default for SpeechConfig {
   fn default() -> Self {
      Self {
         enabled: true,
         command: default_speech_command(),
         args: vec![],
      }
   }
}

impl Default for TriggerConfig {
   fn default() -> Self {
      Self {
         signal: true,
         input_device: None,
         key_code: default_key_code(),
      }
   }
}

impl Default for DBusConfig {
   fn default() -> Self {
      Self {
         enabled: true,
         system_bus: false,
      }
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         friendly_name: default_friendly_name(),
         discoverable_duration_ms: default_discoverable_duration_ms(),
         discoverable_on_start: true,
         speech: SpeechConfig::default(),
         trigger: TriggerConfig::default(),
         profiles: ProfilesConfig::default(),
         dbus: DBusConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(config_path: &Path) -> Result<Self> {
      if config_path.exists() {
         let contents = fs::read_to_string(config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(config_path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save_to(&self, config_path: &Path) -> Result<()> {
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(sinkd_home) = env::var("SINKD_HOME") {
         PathBuf::from(sinkd_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(SinkError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("sinkd").join("config.toml"))
   }
}
