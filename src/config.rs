//! Layered `plugforge.toml` configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE: &str = "plugforge.toml";
pub const CONFIG_ENV: &str = "PLUGFORGE_CONFIG";
pub const DEFAULT_SDK_ASSEMBLY: &str = "TcPluginBase";
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
pub const MAX_RETRY_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolsConfig {
    /// Reassembler; searched on `PATH` when unset.
    pub ilasm: Option<PathBuf>,
    /// Disassembler; searched on `PATH` when unset.
    pub ildasm: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkConfig {
    /// File stem of the SDK base assembly, never bundled.
    pub assembly: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl OutputConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub tools: ToolsConfig,
    pub sdk: SdkConfig,
    pub output: OutputConfig,
}

impl Default for Config {
    fn default() -> Self {
        ConfigLoader::finalize(RawConfig::default())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    tools: ToolsConfig,
    sdk: RawSdkConfig,
    output: RawOutputConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSdkConfig {
    assembly: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawOutputConfig {
    retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the project file `./plugforge.toml`, overlaid by `explicit` or,
    /// without it, the file named by `PLUGFORGE_CONFIG`.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let mut raw = RawConfig::default();

        // Layer 1: project config
        let project = PathBuf::from(CONFIG_FILE);
        if project.exists() {
            raw = Self::merge_raw(raw, Self::read(&project)?);
        }

        // Layer 2: explicit or environment config
        let overlay = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        if let Some(path) = overlay {
            if !path.exists() {
                return Err(Error::Config(format!("config file not found: {:?}", path)));
            }
            raw = Self::merge_raw(raw, Self::read(&path)?);
        }

        Self::validate(Self::finalize(raw))
    }

    /// Parses a single configuration document with defaults applied.
    pub fn from_toml(text: &str) -> Result<Config> {
        let raw: RawConfig = toml::from_str(text)?;
        Self::validate(Self::finalize(raw))
    }

    fn read(path: &Path) -> Result<RawConfig> {
        debug!("reading configuration from {:?}", path);
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|err| Error::Config(format!("invalid config {:?}: {}", path, err)))
    }

    /// Overlay values override base only if explicitly set.
    fn merge_raw(base: RawConfig, overlay: RawConfig) -> RawConfig {
        RawConfig {
            tools: ToolsConfig {
                ilasm: overlay.tools.ilasm.or(base.tools.ilasm),
                ildasm: overlay.tools.ildasm.or(base.tools.ildasm),
            },
            sdk: RawSdkConfig {
                assembly: overlay.sdk.assembly.or(base.sdk.assembly),
            },
            output: RawOutputConfig {
                retry_attempts: overlay.output.retry_attempts.or(base.output.retry_attempts),
                retry_backoff_ms: overlay
                    .output
                    .retry_backoff_ms
                    .or(base.output.retry_backoff_ms),
            },
        }
    }

    fn finalize(raw: RawConfig) -> Config {
        Config {
            tools: raw.tools,
            sdk: SdkConfig {
                assembly: raw
                    .sdk
                    .assembly
                    .unwrap_or_else(|| DEFAULT_SDK_ASSEMBLY.to_string()),
            },
            output: OutputConfig {
                retry_attempts: raw.output.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS),
                retry_backoff_ms: raw
                    .output
                    .retry_backoff_ms
                    .unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
            },
        }
    }

    fn validate(config: Config) -> Result<Config> {
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&config.output.retry_attempts) {
            return Err(Error::Config(format!(
                "output.retry_attempts must be between 1 and {MAX_RETRY_ATTEMPTS}"
            )));
        }
        if config.sdk.assembly.trim().is_empty() {
            return Err(Error::Config("sdk.assembly must not be empty".into()));
        }
        Ok(config)
    }
}
