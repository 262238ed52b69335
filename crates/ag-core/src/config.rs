//! Configuration system for the allegrex loader

use crate::error::{EmulatorError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub loader: LoaderConfig,
    pub memory: MemoryConfig,
    pub debug: DebugConfig,
}

/// Module loader settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Base address used for relocatable modules when the caller has no preference
    pub default_base_address: u32,
    /// Only hand `~PSP` images to the decryptor while loading the first module
    pub decrypt_only_first_module: bool,
    /// Number of resolution passes an import may stay unresolved before it is
    /// reported at warn level
    pub unresolved_warn_threshold: u32,
    /// Keep a textual dump of the first module's ELF headers
    pub keep_elf_info: bool,
}

/// Emulated memory settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Enable the 64MB main memory layout (PSP-2000 and later)
    pub extended_ram: bool,
}

/// Debug settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            default_base_address: 0x0880_4000,
            decrypt_only_first_module: true,
            unresolved_warn_threshold: 1,
            keep_elf_info: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location, or create it if it doesn't exist
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| EmulatorError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to an explicit file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| EmulatorError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("allegrex")
            .join("config.toml")
    }
}
