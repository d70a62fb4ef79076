//! Runtime settings.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (AEGIS_BACKEND_URL, AEGIS_REASONER_COMMAND, AEGIS_JOURNAL)
//! 2. Config file (`--config`, AEGIS_CONFIG, or .aegis/config.yaml)
//! 3. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .aegis/config.yaml
//! - A relative journal path is resolved against the config file's project root

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::core::DispatcherConfig;
use crate::gateway::GatewayConfig;
use crate::reasoning::ReasoningConfig;

pub const ENV_CONFIG: &str = "AEGIS_CONFIG";
pub const ENV_BACKEND_URL: &str = "AEGIS_BACKEND_URL";
pub const ENV_REASONER_COMMAND: &str = "AEGIS_REASONER_COMMAND";
pub const ENV_JOURNAL: &str = "AEGIS_JOURNAL";

/// Workflow store settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSONL journal; in-memory only when unset
    #[serde(default)]
    pub journal_path: Option<PathBuf>,
}

/// All tunables, one section per component
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub store: StoreConfig,

    /// File the settings were read from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

impl Settings {
    /// Load from all sources
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => std::env::var_os(ENV_CONFIG)
                .map(PathBuf::from)
                .or_else(find_config_file),
        };

        let mut settings = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    /// Parse a YAML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut settings = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        if let Some(journal) = settings.store.journal_path.take() {
            settings.store.journal_path = Some(resolve_path(project_root(path), &journal));
        }
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Self = serde_yaml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values serde cannot
    pub fn validate(&self) -> Result<()> {
        self.gateway.validate().map_err(anyhow::Error::msg)
    }

    /// Apply environment overrides through a lookup function
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = set(ENV_BACKEND_URL) {
            self.gateway.base_url = url;
        }
        if let Some(command) = set(ENV_REASONER_COMMAND) {
            self.reasoning.command = Some(command);
        }
        if let Some(journal) = set(ENV_JOURNAL) {
            self.store.journal_path = Some(PathBuf::from(journal));
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to render settings")
    }
}

/// Default journal location (~/.aegis/workflows.jsonl)
pub fn default_journal_path() -> Result<PathBuf> {
    Ok(dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".aegis")
        .join("workflows.jsonl"))
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".aegis").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Directory relative paths are resolved against: the parent of `.aegis/`
/// for a discovered file, else the file's own directory
fn project_root(config_path: &Path) -> &Path {
    let dir = config_path.parent().unwrap_or(Path::new("."));
    match dir.file_name() {
        Some(name) if name == ".aegis" => dir.parent().unwrap_or(Path::new(".")),
        _ => dir,
    }
}

fn resolve_path(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
