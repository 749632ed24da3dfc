/// Configuration loaded from workgate.toml.
///
/// Every section is optional; missing keys fall back to the defaults below
/// and CLI flags are merged over the result by the binary.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from workgate.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct WorkgateConfig {
    pub dispatch: DispatchConfig,
    pub shutdown: ShutdownConfig,
    #[serde(rename = "loop")]
    pub loop_: LoopConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum number of work items running at once.
    pub max_workers: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Signal names that request a stop, e.g. "SIGINT".
    pub signals: Vec<String>,
    /// Process exit code used when a second stop signal forces exit.
    pub force_exit_code: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Pause inside the demo loop task between ticks.
    pub interval_ms: u64,
}

// --- Default implementations ---

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            signals: vec!["SIGINT".to_string(), "SIGTERM".to_string()],
            force_exit_code: 0,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

/// Errors that can occur while loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    /// The file exists but could not be read.
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The file is not valid TOML for `WorkgateConfig`.
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl WorkgateConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
