use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default configuration file name.
pub const CONFIG_FILE: &str = ".commodore.toml";

/// Default Lieutenant request timeout.
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved runtime configuration.
///
/// Precedence: CLI flags override environment variables override
/// `.commodore.toml` override built-in defaults. The CLI layer applies its
/// flags on top of what [`Config::load`] returns.
#[derive(Debug, Clone)]
pub struct Config {
    /// Lieutenant base URL (`COMMODORE_API_URL`).
    pub api_url: Option<String>,
    /// Lieutenant bearer token (`COMMODORE_API_TOKEN`).
    pub api_token: Option<String>,
    /// Author name for catalog commits (`COMMODORE_USERNAME`).
    pub username: String,
    /// Author email for catalog commits (`COMMODORE_USERMAIL`).
    pub usermail: String,
    /// Request timeout for Lieutenant calls.
    pub api_timeout: Duration,
    /// Bound on concurrent dependency fetches.
    pub parallelism: usize,
    /// Fallback global defaults repository, for tenants that do not
    /// advertise one.
    pub global_repo_url: Option<String>,
    /// Repository providing the `kube.libsonnet` baseline that shadows
    /// any jsonnet-bundler-vendored copy.
    pub baseline_lib_repo: Option<String>,
    /// Revision of the baseline library repository.
    pub baseline_lib_revision: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            username: "Commodore".to_string(),
            usermail: "commodore@syn.tools".to_string(),
            api_timeout: DEFAULT_API_TIMEOUT,
            parallelism: default_parallelism(),
            global_repo_url: None,
            baseline_lib_repo: None,
            baseline_lib_revision: None,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// `.commodore.toml` contents; everything optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    api_url: Option<String>,
    api_token: Option<String>,
    username: Option<String>,
    usermail: Option<String>,
    /// Human-readable duration, e.g. `5s` or `750ms`.
    api_timeout: Option<String>,
    parallelism: Option<usize>,
    global_repo_url: Option<String>,
    baseline_lib_repo: Option<String>,
    baseline_lib_revision: Option<String>,
}

impl Config {
    /// Load configuration for a working directory: defaults, then
    /// `.commodore.toml`, then environment variables.
    pub fn load(workdir: &Path) -> Result<Config> {
        let mut cfg = Config::default();

        let path = workdir.join(CONFIG_FILE);
        if path.is_file() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: FileConfig = toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            cfg.apply_file(file)?;
        }

        cfg.apply_env();
        Ok(cfg)
    }

    fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(v) = file.api_url {
            self.api_url = Some(v);
        }
        if let Some(v) = file.api_token {
            self.api_token = Some(v);
        }
        if let Some(v) = file.username {
            self.username = v;
        }
        if let Some(v) = file.usermail {
            self.usermail = v;
        }
        if let Some(v) = file.api_timeout {
            self.api_timeout = humantime::parse_duration(&v)
                .with_context(|| format!("invalid api_timeout: {v}"))?;
        }
        if let Some(v) = file.parallelism {
            self.parallelism = v.max(1);
        }
        if let Some(v) = file.global_repo_url {
            self.global_repo_url = Some(v);
        }
        if let Some(v) = file.baseline_lib_repo {
            self.baseline_lib_repo = Some(v);
        }
        if let Some(v) = file.baseline_lib_revision {
            self.baseline_lib_revision = Some(v);
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("COMMODORE_API_URL") {
            self.api_url = Some(v);
        }
        if let Ok(v) = std::env::var("COMMODORE_API_TOKEN") {
            self.api_token = Some(v);
        }
        if let Ok(v) = std::env::var("COMMODORE_USERNAME") {
            self.username = v;
        }
        if let Ok(v) = std::env::var("COMMODORE_USERMAIL") {
            self.usermail = v;
        }
    }
}
