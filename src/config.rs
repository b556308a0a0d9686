use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::MalformedConfig;

/// A named target system that images can be built for.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct SystemConfig {
    /// Image reference the sandbox is created from (e.g. `docker://debian:12`)
    pub base_image: String,
    pub description: Option<String>,
}

/// Global configuration from `~/.config/sandwright/config.yaml`
#[derive(Debug, Serialize, Default, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to the container build binary. Discovered on PATH when unset.
    pub build_binary: Option<PathBuf>,
    /// Duplicate subprocess output to `<log_file>.out` / `<log_file>.err`.
    pub log_file: Option<PathBuf>,
    pub no_color: Option<bool>,
    pub systems: BTreeMap<String, SystemConfig>,
}

/// On-disk shape. Every field is optional so missing required fields can be
/// reported by name.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    build_binary: Option<PathBuf>,
    #[serde(default)]
    log_file: Option<PathBuf>,
    #[serde(default)]
    no_color: Option<bool>,
    #[serde(default)]
    systems: BTreeMap<String, RawSystem>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawSystem {
    #[serde(default)]
    base_image: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

impl Config {
    /// Load the global configuration, or defaults when there is none.
    pub fn load() -> anyhow::Result<Self> {
        debug!("config:loading");
        let config = match config_path() {
            Some(path) => Self::load_from_path(&path)?.unwrap_or_default(),
            None => Self::default(),
        };
        debug!(systems = config.systems.len(), "config:loaded");
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        Self::parse(path, &contents).map(Some)
    }

    fn parse(path: &Path, contents: &str) -> anyhow::Result<Self> {
        let raw: RawConfig = if contents.trim().is_empty() {
            RawConfig::default()
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| anyhow!("Failed to parse config at {}: {}", path.display(), e))?
        };

        let mut systems = BTreeMap::new();
        for (name, system) in raw.systems {
            let base_image = system.base_image.ok_or_else(|| MalformedConfig {
                path: path.to_path_buf(),
                entry: name.clone(),
                field: "base_image",
            })?;
            systems.insert(
                name,
                SystemConfig {
                    base_image,
                    description: system.description,
                },
            );
        }

        Ok(Self {
            build_binary: raw.build_binary,
            log_file: raw.log_file,
            no_color: raw.no_color,
            systems,
        })
    }

    pub fn no_color(&self) -> bool {
        self.no_color.unwrap_or(false)
    }

    /// Look up a configured system by name.
    pub fn system(&self, name: &str) -> anyhow::Result<&SystemConfig> {
        self.systems.get(name).ok_or_else(|| {
            if self.systems.is_empty() {
                anyhow!("Unknown system '{name}': no systems are configured")
            } else {
                anyhow!(
                    "Unknown system '{name}'. Known systems: {}",
                    self.systems.keys().cloned().collect::<Vec<_>>().join(", ")
                )
            }
        })
    }
}

/// `$XDG_CONFIG_HOME/sandwright/config.yaml`, falling back to `~/.config`.
/// A `config.yml` next to it is accepted too.
pub fn config_path() -> Option<PathBuf> {
    let dir = match std::env::var("XDG_CONFIG_HOME") {
        Ok(config_home) if !config_home.is_empty() => PathBuf::from(config_home).join("sandwright"),
        _ => home::home_dir()?.join(".config").join("sandwright"),
    };
    let yml = dir.join("config.yml");
    let yaml = dir.join("config.yaml");
    if !yaml.exists() && yml.exists() {
        return Some(yml);
    }
    Some(yaml)
}
