//! Runtime settings: defaults, optional TOML file, CLI overrides

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use scriptsync_core::DEFAULT_AUTO_PATTERN;

use crate::channel::DEFAULT_PORT;
use crate::cli::Cli;
use crate::mailbox::{DEFAULT_TTL, default_shared_dir};
use crate::watcher::DEFAULT_DEBOUNCE;
use crate::workspace::default_state_file;

/// Config file looked up in the workspace root when `--config` is absent
pub const CONFIG_FILE_NAME: &str = "scriptsync.toml";

const DEFAULT_HOST: &str = "127.0.0.1";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid auto_pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("no platform data directory; pass --state-file")]
    NoStateDir,
}

/// Contents of `scriptsync.toml`; every key is optional
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub host: Option<String>,
    pub mailbox_dir: Option<PathBuf>,
    pub mailbox_ttl_ms: Option<u64>,
    pub auto_pattern: Option<String>,
    pub debounce_ms: Option<u64>,
    pub state_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Fully resolved settings for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub workspace: PathBuf,
    pub host: String,
    pub port: u16,
    pub mailbox_dir: PathBuf,
    pub mailbox_ttl: Duration,
    pub auto_pattern: String,
    pub debounce: Duration,
    pub state_file: PathBuf,
    pub target: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings with CLI > file > defaults precedence
    pub fn resolve(cli: &Cli) -> Result<Self, ConfigError> {
        let workspace = std::fs::canonicalize(&cli.dir).unwrap_or_else(|_| cli.dir.clone());

        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => {
                let path = workspace.join(CONFIG_FILE_NAME);
                if path.exists() {
                    FileConfig::load(&path)?
                } else {
                    FileConfig::default()
                }
            }
        };

        Self::merge(cli, file, workspace)
    }

    fn merge(cli: &Cli, file: FileConfig, workspace: PathBuf) -> Result<Self, ConfigError> {
        let auto_pattern = file
            .auto_pattern
            .unwrap_or_else(|| DEFAULT_AUTO_PATTERN.to_string());
        if let Err(source) = glob::Pattern::new(&auto_pattern) {
            return Err(ConfigError::Pattern {
                pattern: auto_pattern,
                source,
            });
        }

        let state_file = match cli.state_file.clone().or(file.state_file) {
            Some(path) => path,
            None => default_state_file(&workspace).ok_or(ConfigError::NoStateDir)?,
        };

        // Relative targets are taken relative to the workspace
        let target = cli.target.as_ref().map(|t| workspace.join(t));

        Ok(Self {
            host: file.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            mailbox_dir: cli
                .mailbox_dir
                .clone()
                .or(file.mailbox_dir)
                .unwrap_or_else(default_shared_dir),
            mailbox_ttl: cli
                .mailbox_ttl_ms
                .or(file.mailbox_ttl_ms)
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_TTL),
            debounce: file
                .debounce_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_DEBOUNCE),
            auto_pattern,
            state_file,
            target,
            workspace,
        })
    }
}
