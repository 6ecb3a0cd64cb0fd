use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::loader::parser::parse_json_file;

/// Default transfer chunk size in bytes (512 * 512).
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 512;

/// Default polling tick for a remote call waiting on its reply.
pub const DEFAULT_POLL_TICK_MS: u64 = 2000;

/// Default disposal timeout in hours (one week).
pub const DEFAULT_DISPOSAL_TIMEOUT_HOURS: u32 = 168;

/// Root of the configuration file.
///
/// ```json
/// {
///   "resources": {
///     "local": { "staging_dir": "/var/lib/soma-flow", "translation_files": { "brainvisa": "/etc/soma/bv.txt" } }
///   },
///   "client": { "poll_tick_ms": 500, "call_timeout_secs": 600 }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub resources: HashMap<String, ResourceConfig>,
    #[serde(default)]
    pub client: ClientConfig,
}

impl EngineConfig {
    /// Loads the configuration. Any failure here is a configuration error and
    /// is meant to abort startup.
    pub fn load(path: &Path) -> Result<Self> {
        parse_json_file::<EngineConfig>(path).map_err(|e| Error::ConfigurationError(format!("cannot load '{}': {}", path.display(), e)))
    }

    pub fn resource(&self, name: &str) -> Result<&ResourceConfig> {
        self.resources.get(name).ok_or_else(|| Error::ConfigurationError(format!("missing resource section '{}'", name)))
    }
}

/// Settings of one computing resource served by an engine process.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceConfig {
    /// Port of the reply endpoint; absent or 0 picks a free port.
    #[serde(default)]
    pub port: Option<u16>,

    /// Directory holding the resource-side copies of every registered transfer.
    pub staging_dir: PathBuf,

    /// One translation file per shared-resource namespace.
    #[serde(default)]
    pub translation_files: HashMap<String, PathBuf>,

    #[serde(default = "default_max_running_jobs")]
    pub max_running_jobs: usize,

    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,

    /// How often a server-side `wait` re-checks job states.
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,

    #[serde(default = "default_max_frame_length")]
    pub max_frame_length: usize,
}

impl ResourceConfig {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        ResourceConfig {
            port: None,
            staging_dir: staging_dir.into(),
            translation_files: HashMap::new(),
            max_running_jobs: default_max_running_jobs(),
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            wait_poll_ms: default_wait_poll_ms(),
            max_frame_length: default_max_frame_length(),
        }
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_secs(self.housekeeping_interval_secs.max(1))
    }

    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }
}

/// Settings used by the submitting side.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_poll_tick_ms")]
    pub poll_tick_ms: u64,

    /// Per-call timeout; absent or 0 means wait forever.
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl ClientConfig {
    pub fn poll_tick(&self) -> Duration {
        Duration::from_millis(self.poll_tick_ms.max(1))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig { poll_tick_ms: default_poll_tick_ms(), call_timeout_secs: None, chunk_size: default_chunk_size() }
    }
}

fn default_max_running_jobs() -> usize {
    4
}

fn default_housekeeping_interval_secs() -> u64 {
    30
}

fn default_wait_poll_ms() -> u64 {
    200
}

fn default_max_frame_length() -> usize {
    64 * 1024 * 1024
}

fn default_poll_tick_ms() -> u64 {
    DEFAULT_POLL_TICK_MS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_missing_resource_section_is_configuration_error() {
        let config = EngineConfig { resources: HashMap::new(), client: ClientConfig::default() };

        let err = config.resource("cluster").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_missing_staging_dir_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "resources": {{ "local": {{ "port": 4000 }} }} }}"#).unwrap();

        let err = EngineConfig::load(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_defaults_are_applied() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "resources": {{ "local": {{ "staging_dir": "/tmp/stage" }} }} }}"#).unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        let resource = config.resource("local").unwrap();

        assert_eq!(resource.port, None);
        assert_eq!(resource.max_running_jobs, 4);
        assert_eq!(config.client.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.client.call_timeout(), None);
        assert_eq!(config.client.poll_tick(), Duration::from_millis(2000));
    }
}
