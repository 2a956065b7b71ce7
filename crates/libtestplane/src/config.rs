use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use testplane_protocol::paths;
use testplane_protocol::version::downgrade_disabled_from_env;

use crate::error::ConfigError;

/// Connection timeout override, in seconds.
pub const CONNECTION_TIMEOUT_ENV: &str = "TESTPLANE_CONNECTION_TIMEOUT";

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct TestplaneConfig {
    /// Where controller-side sockets for test hosts are created.
    pub runtime_dir: PathBuf,
    /// Test host executable launched for every proxy.
    pub host_executable: PathBuf,
    pub connection_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Bound on waits for debugger acknowledgements.
    pub callback_timeout_ms: u64,
    pub job_queue_max_bytes: usize,
    pub disable_version_downgrade: bool,
    pub diagnostics_log: Option<PathBuf>,
}

impl Default for TestplaneConfig {
    fn default() -> Self {
        Self {
            runtime_dir: paths::default_runtime_dir(),
            host_executable: PathBuf::from("testplane-host"),
            connection_timeout_ms: 90_000,
            handshake_timeout_ms: 30_000,
            callback_timeout_ms: 180_000,
            job_queue_max_bytes: 64 * 1024 * 1024,
            disable_version_downgrade: false,
            diagnostics_log: None,
        }
    }
}

impl TestplaneConfig {
    /// Load from the default config path, falling back to defaults, then apply
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&paths::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            Self::parse(&contents)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    fn apply_env(&mut self) {
        if downgrade_disabled_from_env() {
            self.disable_version_downgrade = true;
        }
        if let Some(secs) = std::env::var(CONNECTION_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            self.connection_timeout_ms = secs.saturating_mul(1_000);
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn callback_timeout(&self) -> Duration {
        Duration::from_millis(self.callback_timeout_ms)
    }
}
