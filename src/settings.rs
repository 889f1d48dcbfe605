//! Settings for the agent CLI.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::grid::{GridError, GridSpec, GridStyle, MAX_COLUMNS};
use crate::model::ModelConfig;

const GRID_COLUMN_RANGE: (u32, u32) = (5, MAX_COLUMNS);
const GRID_ROW_RANGE: (u32, u32) = (10, 50);

/// Settings errors.
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to write settings: {0}")]
    Write(String),
    #[error("Invalid value for {name}: '{value}'")]
    Env { name: &'static str, value: String },
    #[error("Invalid settings: {0}")]
    Invalid(String),
    #[error(transparent)]
    Grid(#[from] GridError),
}

/// Grid density and style. Columns and rows are derived from the screen
/// size unless both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSettings {
    pub columns: Option<u32>,
    pub rows: Option<u32>,
    pub style: GridStyle,
}

/// Device connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdbSettings {
    pub adb_path: String,
    /// Serial of the device to drive; the only ready device when unset.
    pub device_id: Option<String>,
    pub command_timeout_secs: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            adb_path: "adb".to_string(),
            device_id: None,
            command_timeout_secs: 30,
        }
    }
}

/// All settings of one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub agent: AgentConfig,
    pub grid: GridSettings,
    pub model: ModelConfig,
    pub adb: AdbSettings,
    /// Session log directory. Defaults to the platform data directory.
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "grid-agent", "grid-agent")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Get the default logs directory path.
    pub fn default_logs_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "grid-agent", "grid-agent")
            .map(|dirs| dirs.data_dir().join("logs"))
    }

    /// Load settings from `path`, or from the config directory.
    ///
    /// An explicit path must exist. A missing file in the config directory
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::settings_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = fs::read_to_string(&path).map_err(|source| SettingsError::Read {
            path: path.clone(),
            source,
        })?;
        let settings = serde_json::from_str(&content)
            .map_err(|source| SettingsError::Parse { path: path.clone(), source })?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    /// Save settings to `path`, or to the config directory.
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf, SettingsError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::settings_path()
                .ok_or_else(|| SettingsError::Write("cannot determine config directory".into()))?,
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| SettingsError::Write(format!("failed to create {}: {}", dir.display(), e)))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| SettingsError::Write(format!("failed to serialize settings: {}", e)))?;
        fs::write(&path, content)
            .map_err(|e| SettingsError::Write(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(path)
    }

    /// Apply overrides from process environment variables.
    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_vars(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), SettingsError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(value) = get("MODEL_BASE_URL") {
            self.model.base_url = value;
        }
        if let Some(value) = get("MODEL_API_KEY") {
            self.model.api_key = value;
        }
        if let Some(value) = get("MODEL_NAME") {
            self.model.model_name = value;
        }
        if let Some(value) = get("ADB_DEVICE_ID") {
            self.adb.device_id = Some(value);
        }
        if let Some(value) = get("GRID_COLS") {
            self.grid.columns = Some(parse_number("GRID_COLS", &value)?);
        }
        if let Some(value) = get("GRID_ROWS") {
            self.grid.rows = Some(parse_number("GRID_ROWS", &value)?);
        }
        if let Some(value) = get("AGENT_MAX_STEPS") {
            self.agent.max_steps = parse_number("AGENT_MAX_STEPS", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.agent.validate().map_err(SettingsError::Invalid)?;
        self.grid.style.validate().map_err(SettingsError::Invalid)?;

        match (self.grid.columns, self.grid.rows) {
            (None, None) => {}
            (Some(columns), Some(rows)) => {
                if !(GRID_COLUMN_RANGE.0..=GRID_COLUMN_RANGE.1).contains(&columns) {
                    return Err(SettingsError::Invalid(format!(
                        "grid columns must be {}-{}, got {}",
                        GRID_COLUMN_RANGE.0, GRID_COLUMN_RANGE.1, columns
                    )));
                }
                if !(GRID_ROW_RANGE.0..=GRID_ROW_RANGE.1).contains(&rows) {
                    return Err(SettingsError::Invalid(format!(
                        "grid rows must be {}-{}, got {}",
                        GRID_ROW_RANGE.0, GRID_ROW_RANGE.1, rows
                    )));
                }
            }
            _ => {
                return Err(SettingsError::Invalid(
                    "grid columns and rows must be set together".to_string(),
                ))
            }
        }

        if self.model.base_url.trim().is_empty() {
            return Err(SettingsError::Invalid("model base_url must be set".to_string()));
        }
        if self.model.model_name.trim().is_empty() {
            return Err(SettingsError::Invalid("model name must be set".to_string()));
        }
        if self.model.timeout_secs == 0 || self.adb.command_timeout_secs == 0 {
            return Err(SettingsError::Invalid("timeouts must be positive".to_string()));
        }
        Ok(())
    }

    /// Build the session grid for a screen of the given size.
    pub fn resolve_grid(&self, screen_width: u32, screen_height: u32) -> Result<GridSpec, SettingsError> {
        let grid = match (self.grid.columns, self.grid.rows) {
            (Some(columns), Some(rows)) => GridSpec::new(columns, rows, screen_width, screen_height)?,
            _ => GridSpec::auto(screen_width, screen_height)?,
        };
        Ok(grid)
    }

    /// Directory for session logs.
    pub fn logs_dir(&self) -> Option<PathBuf> {
        self.log_dir.clone().or_else(Self::default_logs_dir)
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, SettingsError> {
    value.trim().parse().map_err(|_| SettingsError::Env {
        name,
        value: value.to_string(),
    })
}
