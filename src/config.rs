//! Store configuration.
//!
//! A [`StoreConfig`] selects the backend, its data directory and the rule set
//! the store's engine starts with. It is read from TOML and can be overridden
//! from the environment:
//!
//! | Variable                | Field      |
//! |-------------------------|------------|
//! | `COLONY_STORAGE_DRIVER` | `driver`   |
//! | `COLONY_STORAGE_PATH`   | `path`     |
//! | `COLONY_RULE_SET`       | `rule_set` |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ColonyResult, ConfigError, ConfigResult};
use crate::rules::RulesEngine;
use crate::store::{PersistentStore, StorageDriver, open_persistent_store};

pub const ENV_DRIVER: &str = "COLONY_STORAGE_DRIVER";
pub const ENV_PATH: &str = "COLONY_STORAGE_PATH";
pub const ENV_RULE_SET: &str = "COLONY_RULE_SET";

/// Which rules a freshly opened store evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSet {
    /// No rules.
    Bare,
    /// housing_capacity, protocol_subject_cap, lineage_integrity.
    #[default]
    #[serde(rename = "default")]
    Defaults,
    /// The defaults plus lifecycle_transition and protocol_coverage.
    Extended,
}

impl RuleSet {
    pub fn build(self) -> RulesEngine {
        match self {
            Self::Bare => RulesEngine::new(),
            Self::Defaults => RulesEngine::with_defaults(),
            Self::Extended => RulesEngine::extended(),
        }
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bare => "bare",
            Self::Defaults => "default",
            Self::Extended => "extended",
        })
    }
}

impl FromStr for RuleSet {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bare" | "none" => Ok(Self::Bare),
            "default" | "defaults" => Ok(Self::Defaults),
            "extended" => Ok(Self::Extended),
            _ => Err(ConfigError::UnknownRuleSet {
                name: s.to_string(),
            }),
        }
    }
}

/// Backend selection, persisted as TOML.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to open (default: memory).
    #[serde(default)]
    pub driver: StorageDriver,
    /// Data directory for the snapshot and durable drivers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Initial rule set (default: default).
    #[serde(default)]
    pub rule_set: RuleSet,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self::default()
    }

    /// A config for `driver` rooted at `path`.
    pub fn with_driver(driver: StorageDriver, path: impl Into<PathBuf>) -> Self {
        Self {
            driver,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })
    }

    /// Load from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml_str(&content)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `COLONY_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ConfigResult<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(driver) = get(ENV_DRIVER) {
            self.driver = driver.parse()?;
        }
        if let Some(path) = get(ENV_PATH) {
            self.path = Some(PathBuf::from(path));
        }
        if let Some(rule_set) = get(ENV_RULE_SET) {
            self.rule_set = rule_set.parse()?;
        }
        Ok(())
    }

    /// The data directory, required by every driver except memory.
    pub fn require_path(&self) -> ConfigResult<&Path> {
        self.path.as_deref().ok_or_else(|| ConfigError::MissingPath {
            driver: self.driver.to_string(),
        })
    }

    pub fn build_engine(&self) -> RulesEngine {
        self.rule_set.build()
    }

    /// Open the configured store with a fresh engine for the configured rule set.
    pub fn open(&self) -> ColonyResult<Arc<dyn PersistentStore>> {
        open_persistent_store(self, Arc::new(self.build_engine()))
    }
}
