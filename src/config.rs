//! Configuration for the phase engine.
//!
//! Reads `.shopfloor/shopfloor.toml` from the project directory and layers
//! environment overrides on top (file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [session]
//! machine_id = "M-01"
//! operator_id = "op-7"
//! tick_interval_ms = 1000
//!
//! [remote]
//! timeout_ms = 5000
//! max_write_attempts = 3
//!
//! [cache]
//! dir = ".shopfloor/cache"
//!
//! [[shifts]]
//! label = "A"
//! start_hour = 6
//! end_hour = 14
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::shift::{ShiftWindow, default_shifts};

pub const CONFIG_DIR: &str = ".shopfloor";
pub const CONFIG_FILE: &str = "shopfloor.toml";

/// Which machine this client drives and as whom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_machine_id")]
    pub machine_id: String,
    #[serde(default = "default_operator_id")]
    pub operator_id: String,
    /// Live elapsed counter refresh interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

fn default_machine_id() -> String {
    "M-01".to_string()
}

fn default_operator_id() -> String {
    "operator".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            machine_id: default_machine_id(),
            operator_id: default_operator_id(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

/// Remote store call bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    /// Upper bound on any single remote call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per pending write when retrying a degraded sync
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_write_attempts() -> u32 {
    3
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_write_attempts: default_max_write_attempts(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSection {
    /// Cache directory; relative paths resolve against the project directory.
    /// Defaults to the per-user data directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Contents of `shopfloor.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopfloorToml {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default = "default_shifts")]
    pub shifts: Vec<ShiftWindow>,
}

impl Default for ShopfloorToml {
    fn default() -> Self {
        Self {
            session: SessionSection::default(),
            remote: RemoteSection::default(),
            cache: CacheSection::default(),
            shifts: default_shifts(),
        }
    }
}

impl ShopfloorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shopfloor.toml")
    }

    /// Load from `<config_dir>/shopfloor.toml`, or defaults if the file is missing.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize shopfloor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides read through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(machine) = lookup("SHOPFLOOR_MACHINE_ID").filter(|v| !v.is_empty()) {
            self.session.machine_id = machine;
        }
        if let Some(operator) = lookup("SHOPFLOOR_OPERATOR_ID").filter(|v| !v.is_empty()) {
            self.session.operator_id = operator;
        }
        if let Some(ms) = lookup("SHOPFLOOR_REMOTE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.remote.timeout_ms = ms;
        }
        if let Some(dir) = lookup("SHOPFLOOR_CACHE_DIR").filter(|v| !v.is_empty()) {
            self.cache.dir = Some(PathBuf::from(dir));
        }
        self
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.session.machine_id.trim().is_empty() {
            warnings.push("session.machine_id is empty".to_string());
        }
        if self.session.operator_id.trim().is_empty() {
            warnings.push("session.operator_id is empty".to_string());
        }
        if self.session.tick_interval_ms == 0 {
            warnings.push("session.tick_interval_ms must be greater than 0".to_string());
        }
        if self.remote.timeout_ms == 0 {
            warnings.push("remote.timeout_ms must be greater than 0".to_string());
        }
        if self.remote.max_write_attempts == 0 {
            warnings.push(
                "remote.max_write_attempts is 0; degraded writes will never be retried"
                    .to_string(),
            );
        }

        for shift in &self.shifts {
            if shift.start_hour > 23 || shift.end_hour > 24 {
                warnings.push(format!(
                    "Shift '{}' has hours outside the day ({}-{})",
                    shift.label, shift.start_hour, shift.end_hour
                ));
            }
            if shift.start_hour == shift.end_hour {
                warnings.push(format!("Shift '{}' is empty", shift.label));
            }
        }
        for hour in 0..24 {
            let covering = self.shifts.iter().filter(|s| s.contains(hour)).count();
            if covering > 1 {
                warnings.push(format!("Hour {} is covered by {} shifts", hour, covering));
            }
        }

        warnings
    }
}

/// Resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct ShopfloorConfig {
    pub project_dir: PathBuf,
    /// Path to the .shopfloor directory
    pub config_dir: PathBuf,
    pub toml: ShopfloorToml,
}

impl ShopfloorConfig {
    /// Load from a project directory, applying process environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let config_dir = project_dir.join(CONFIG_DIR);
        let toml = ShopfloorToml::load_or_default(&config_dir)?
            .with_env_overrides(|k| std::env::var(k).ok());

        Ok(Self {
            project_dir,
            config_dir,
            toml,
        })
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    /// Where the durable cache lives (file → env → per-user data dir).
    pub fn cache_dir(&self) -> PathBuf {
        match &self.toml.cache.dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.project_dir.join(dir),
            None => dirs::data_local_dir()
                .map(|d| d.join("shopfloor"))
                .unwrap_or_else(|| self.config_dir.join("cache")),
        }
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.toml.remote.timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.toml.session.tick_interval_ms.max(1))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
