//! Runtime configuration loaded from `viki.toml`.
//!
//! [`VikiConfig`] holds every tunable of the runner. Values missing from the
//! file fall back to defaults. The `VIKI_HOME` environment variable takes
//! precedence over the `home` entry of the file.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the configuration file, looked up in the current directory.
pub const CONFIG_FILE: &str = "viki.toml";

/// Top-level configuration loaded from `viki.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct VikiConfig {
    /// Base directory of the installation.
    #[serde(default = "default_home")]
    pub home: PathBuf,

    /// Job registry directory. Relative paths are resolved against `home`.
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,

    /// Interpreter used to run steps. Invoked with `-x` so commands are traced.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Directory under which scratch workspaces are allocated.
    #[serde(default = "std::env::temp_dir")]
    pub workspace_root: PathBuf,

    /// Per-step timeout. No timeout when absent.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

fn default_home() -> PathBuf {
    PathBuf::from("/usr/local/viki")
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_shell() -> String {
    "/bin/bash".to_string()
}

impl Default for VikiConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            jobs_dir: default_jobs_dir(),
            shell: default_shell(),
            workspace_root: std::env::temp_dir(),
            step_timeout_secs: None,
        }
    }
}

impl VikiConfig {
    /// Loads the configuration from `path`, or from `viki.toml` in the current
    /// directory when no path is given. A missing default file yields the
    /// defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        if let Ok(home) = std::env::var("VIKI_HOME")
            && !home.is_empty()
        {
            config.home = PathBuf::from(home);
        }

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str::<VikiConfig>(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Absolute path of the job registry.
    pub fn jobs_path(&self) -> PathBuf {
        self.home.join(&self.jobs_dir)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}
