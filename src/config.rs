// ABOUTME: Configuration types and parsing for fanout.yml.
// ABOUTME: Optional file-based defaults merged under command-line flags.

use crate::error::{Error, Result};
use crate::multiplex::DuplicatePolicy;
use crate::target::HostKeyPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILENAME: &str = "fanout.yml";
pub const CONFIG_FILENAME_ALT: &str = "fanout.yaml";

/// Defaults loaded from `fanout.yml`, all optional. Command-line flags win
/// over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub port: Option<u16>,

    #[serde(default)]
    pub concurrency: Option<usize>,

    #[serde(default)]
    pub host_key: Option<HostKeyPolicy>,

    #[serde(default, deserialize_with = "deserialize_duplicate_policy")]
    pub on_duplicate: Option<DuplicatePolicy>,

    #[serde(default)]
    pub identity_files: Vec<PathBuf>,

    #[serde(default)]
    pub known_hosts: Option<PathBuf>,

    #[serde(default)]
    pub forward_agent: bool,

    #[serde(default)]
    pub gateway: Option<String>,

    #[serde(default, with = "humantime_serde::option")]
    pub connect_timeout: Option<Duration>,

    #[serde(default, with = "humantime_serde::option")]
    pub command_timeout: Option<Duration>,
}

impl FileConfig {
    /// Load defaults from the working directory, tolerating absence.
    pub fn discover(dir: &Path) -> Result<Self> {
        for name in [CONFIG_FILENAME, CONFIG_FILENAME_ALT] {
            let path = dir.join(name);
            if path.exists() {
                return Self::from_file(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FileConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == Some(0) {
            return Err(Error::InvalidConfig(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn deserialize_duplicate_policy<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<DuplicatePolicy>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    value
        .map(|s| s.parse().map_err(serde::de::Error::custom))
        .transpose()
}
