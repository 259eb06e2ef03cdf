//! Configuration management for the CLI
//!
//! Configuration comes from, in order of precedence:
//! - the file named by `--config` / `CMARSHAL_CONFIG`
//! - the first existing default location (see [`Config::default_config_paths`])
//! - built-in defaults
//!
//! Files are YAML, TOML or JSON, chosen by extension.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Declarations file used when a command is not given one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub declarations: Option<PathBuf>,

    /// Library lookup settings
    pub libraries: LibraryConfig,

    /// Output settings
    pub output: OutputConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Library lookup configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Directories searched for relative library paths
    pub search_dirs: Vec<PathBuf>,

    /// Built test library used by `smoke` when `--testlib` is absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub testlib: Option<PathBuf>,
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Use colored output by default
    pub color: bool,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level used when no `-v` flag is given (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (compact, full, json)
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// File format, from the extension. Anything unrecognized is JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Yaml,
    Toml,
    Json,
}

impl FileFormat {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("toml") => FileFormat::Toml,
            _ => FileFormat::Json,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;

        let config = match FileFormat::of(path) {
            FileFormat::Yaml => serde_yaml::from_str(&content)?,
            FileFormat::Toml => toml::from_str(&content).map_err(|e| {
                Error::config(format!("invalid TOML in {}: {}", path.display(), e))
            })?,
            FileFormat::Json => serde_json::from_str(&content)?,
        };

        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        for path in Self::default_config_paths() {
            if path.exists() {
                match Self::from_file(&path) {
                    Ok(config) => {
                        tracing::debug!(path = %path.display(), "loaded configuration");
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable configuration");
                    }
                }
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file or default locations
    pub fn load_with_file(file: Option<&Path>) -> Result<Self> {
        if let Some(path) = file {
            Self::from_file(path)
        } else {
            Self::load()
        }
    }

    /// Configuration file locations, in search order
    pub fn default_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from(".cmarshal.yaml"),
            PathBuf::from(".cmarshal.toml"),
            PathBuf::from(".cmarshal.json"),
        ];

        if let Some(user) = Self::user_config_path() {
            if let Some(dir) = user.parent() {
                paths.push(user.clone());
                paths.push(dir.join("config.toml"));
                paths.push(dir.join("config.json"));
            }
        }

        paths
    }

    /// `~/.config/cmarshal/config.yaml` or the platform equivalent
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("cmarshal").join("config.yaml"))
    }

    /// Declarations file from the command line, else from the config
    pub fn declarations_file(&self, given: Option<PathBuf>) -> Result<PathBuf> {
        let path = given
            .or_else(|| self.declarations.clone())
            .ok_or(Error::NoDeclarations)?;
        if !path.exists() {
            return Err(Error::FileNotFound { path });
        }
        Ok(path)
    }

    /// Configured search directories followed by `extra`
    pub fn search_dirs(&self, extra: &[PathBuf]) -> Vec<PathBuf> {
        self.libraries
            .search_dirs
            .iter()
            .chain(extra)
            .cloned()
            .collect()
    }

    /// Serialize in the format implied by the path's extension
    pub fn to_string_for(&self, path: &Path) -> Result<String> {
        match FileFormat::of(path) {
            FileFormat::Yaml => Ok(serde_yaml::to_string(self)?),
            FileFormat::Toml => toml::to_string_pretty(self)
                .map_err(|e| Error::config(format!("failed to serialize as TOML: {}", e))),
            FileFormat::Json => Ok(serde_json::to_string_pretty(self)?),
        }
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_string_for(path)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, content)?;
        Ok(())
    }
}
