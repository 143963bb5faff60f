//! Optional TOML configuration for the CLI.
//!
//! Looked up at `--config`, then `REMORA_CONFIG`, then
//! `<config dir>/remora/config.toml`. Command-line arguments win over file
//! values.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use remora::SessionConfig;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Directory holding the controller module
    pub resources: Option<PathBuf>,
    /// Where extracted modules are written; the system temp dir when unset
    pub temp_dir: Option<PathBuf>,
    pub session: SessionConfig,
}

/// Settings for `attach` after merging file and arguments.
#[derive(Debug)]
pub struct AttachOptions {
    pub session: SessionConfig,
    pub resources: PathBuf,
    pub temp_dir: Option<PathBuf>,
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("remora").join("config.toml"))
    }

    /// Load `explicit`, or the default file if it exists, or defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn merge(
        self,
        process: Option<String>,
        signatures: Option<PathBuf>,
        resources: Option<PathBuf>,
        scan_only: bool,
    ) -> AttachOptions {
        let mut session = self.session;
        if let Some(process) = process {
            session.process_name = process;
        }
        if signatures.is_some() {
            session.signatures = signatures;
        }
        session.scan_only |= scan_only;

        AttachOptions {
            session,
            resources: resources
                .or(self.resources)
                .unwrap_or_else(|| PathBuf::from(".")),
            temp_dir: self.temp_dir,
        }
    }
}
