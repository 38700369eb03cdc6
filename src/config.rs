/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::config
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Load and default Syn-Forum-Core configuration covering the
    composer boundary, Packagist lookups, and state/log paths.

  Security / Safety Notes:
    Configuration is read from operator-controlled paths only;
    no values are fetched remotely.

  Dependencies:
    toml + serde for parsing, dirs for per-user defaults.

  Operational Scope:
    Consumed by the entry point to wire the orchestrator, the
    composer client, and the Packagist client.

  Revision History:
    2026-03-02 COD  Authored configuration layer.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Defaults-first loading with explicit override points
    - Configuration failures surfaced, never papered over
============================================================*/

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SynforumError};

const CONFIG_DIR: &str = "syn-forum";
const CONFIG_FILE: &str = "config.toml";

/// Top-level Syn-Forum-Core configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynforumConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub packagist: PackagistConfig,
}

/// Filesystem locations for the state document and session logs.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    pub state_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// Settings for driving the composer binary.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComposerConfig {
    /// Binary to invoke; resolved through PATH.
    #[serde(default = "default_composer_binary")]
    pub binary: String,
    /// Forum root containing composer.json.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// Seconds allowed per composer invocation; a stalled run is a failure.
    #[serde(default = "default_composer_timeout")]
    pub timeout: u64,
    /// Package name of the forum core.
    #[serde(default = "default_core_package")]
    pub core_package: String,
    /// Pass --no-dev to composer operations.
    #[serde(default = "default_no_dev")]
    pub no_dev: bool,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            binary: default_composer_binary(),
            working_dir: default_working_dir(),
            timeout: default_composer_timeout(),
            core_package: default_core_package(),
            no_dev: default_no_dev(),
        }
    }
}

/// Settings for the Packagist metadata client.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagistConfig {
    #[serde(default = "default_packagist_base_url")]
    pub base_url: String,
    /// Request timeout in seconds.
    #[serde(default = "default_packagist_timeout")]
    pub timeout: u64,
    #[serde(default = "default_packagist_retries")]
    pub max_retries: usize,
    #[serde(default = "default_packagist_parallel")]
    pub max_parallel_requests: usize,
}

impl Default for PackagistConfig {
    fn default() -> Self {
        Self {
            base_url: default_packagist_base_url(),
            timeout: default_packagist_timeout(),
            max_retries: default_packagist_retries(),
            max_parallel_requests: default_packagist_parallel(),
        }
    }
}

impl SynforumConfig {
    /// Load configuration from the given path, or from the default
    /// per-user location when absent. A missing file yields defaults;
    /// an unreadable or unparsable file is a configuration error.
    pub fn load_from_optional_path(path: Option<&Path>) -> Result<Self> {
        let resolved = match path {
            Some(explicit) => explicit.to_path_buf(),
            None => default_config_path(),
        };

        if !resolved.exists() {
            if path.is_some() {
                return Err(SynforumError::Config(format!(
                    "Configuration file {} does not exist",
                    resolved.display()
                )));
            }
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&resolved).map_err(|err| {
            SynforumError::Config(format!(
                "Failed to read configuration {}: {err}",
                resolved.display()
            ))
        })?;
        toml::from_str(&raw).map_err(|err| {
            SynforumError::Config(format!(
                "Failed to parse configuration {}: {err}",
                resolved.display()
            ))
        })
    }

    /// Resolve the state document path.
    pub fn state_path(&self) -> PathBuf {
        self.paths
            .state_path
            .clone()
            .unwrap_or_else(|| data_root().join("state.json"))
    }

    /// Resolve the directory receiving session logs.
    pub fn log_dir(&self) -> PathBuf {
        self.paths
            .log_dir
            .clone()
            .unwrap_or_else(|| data_root().join("logs"))
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
        .join(CONFIG_FILE)
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR)
}

fn default_composer_binary() -> String {
    "composer".to_string()
}

fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_composer_timeout() -> u64 {
    900
}

fn default_core_package() -> String {
    "flarum/core".to_string()
}

fn default_no_dev() -> bool {
    true
}

fn default_packagist_base_url() -> String {
    "https://repo.packagist.org".to_string()
}

fn default_packagist_timeout() -> u64 {
    15
}

fn default_packagist_retries() -> usize {
    3
}

fn default_packagist_parallel() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_cover_all_sections() {
        let config = SynforumConfig::default();
        assert_eq!(config.composer.binary, "composer");
        assert_eq!(config.composer.core_package, "flarum/core");
        assert_eq!(config.composer.timeout, 900);
        assert!(config.composer.no_dev);
        assert_eq!(config.packagist.base_url, "https://repo.packagist.org");
        assert_eq!(config.packagist.max_retries, 3);
        assert!(config.state_path().ends_with("state.json"));
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[composer]\nbinary = \"composer2\"\ntimeout = 60\n\n[paths]\nstate_path = \"/tmp/forum-state.json\"\n"
        )
        .expect("write config");

        let config = SynforumConfig::load_from_optional_path(Some(file.path())).expect("load");
        assert_eq!(config.composer.binary, "composer2");
        assert_eq!(config.composer.timeout, 60);
        // Untouched sections keep their defaults.
        assert_eq!(config.composer.core_package, "flarum/core");
        assert_eq!(config.state_path(), PathBuf::from("/tmp/forum-state.json"));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[composer\nbinary =").expect("write config");

        let err = SynforumConfig::load_from_optional_path(Some(file.path())).unwrap_err();
        assert!(matches!(err, SynforumError::Config(_)));
    }

    #[test]
    fn explicit_missing_path_is_rejected() {
        let err =
            SynforumConfig::load_from_optional_path(Some(Path::new("/nonexistent/forum.toml")))
                .unwrap_err();
        assert!(matches!(err, SynforumError::Config(_)));
    }
}
