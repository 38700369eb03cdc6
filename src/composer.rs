/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::composer
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Interface with the composer binary to enumerate update
    candidates and apply scoped update runs against a forum
    deployment.

  Security / Safety Notes:
    Executes composer with user privileges only; no privilege
    escalation is attempted. All invocations are bounded by the
    configured timeout.

  Dependencies:
    tokio::process for async command execution, serde for
    composer JSON payloads.

  Operational Scope:
    Supplies the orchestrator with check outcomes and run
    outcomes through the PackageManager seam.

  Revision History:
    2026-03-02 COD  Crafted composer integration layer.
    2026-03-19 COD  Added why-not probing for failed core runs.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Deterministic command invocation with explicit checks
    - Structured parsing with clear failure modes
    - Reusable helpers for external command diagnostics
============================================================*/

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::ComposerConfig;
use crate::error::{Result, SynforumError};
use crate::packagist::lenient_version;
use crate::state::{UpdateStatus, UpdatedPackage};

/// Scope of one update run handed to the package manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateScope {
    CoreMinor {
        core_package: String,
        target_version: Option<String>,
    },
    Extension {
        name: String,
    },
    Global {
        core_package: String,
        target_version: Option<String>,
    },
}

impl UpdateScope {
    pub fn describe(&self) -> String {
        match self {
            UpdateScope::CoreMinor { core_package, .. } => format!("core-minor ({core_package})"),
            UpdateScope::Extension { name } => format!("extension ({name})"),
            UpdateScope::Global { .. } => "global".to_string(),
        }
    }
}

/// Completed check: ordered update candidates plus check timestamp.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub checked_at: DateTime<Utc>,
    pub updates: Vec<UpdatedPackage>,
}

/// Completed run: status plus the packages the run could not cover.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ran_at: DateTime<Utc>,
    pub status: UpdateStatus,
    pub limited_packages: BTreeSet<String>,
    pub incompatible_extensions: BTreeSet<String>,
}

/// Boundary to the external package manager. Production code drives
/// composer; tests script a fake against the orchestrator.
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Enumerate update candidates for the deployment.
    async fn check_updates(&self) -> Result<CheckOutcome>;

    /// Apply one scoped update run. External failures are captured in
    /// the outcome; an error means the run could not be issued at all.
    async fn apply_update(&self, scope: &UpdateScope) -> Result<RunOutcome>;
}

/// Drives the composer binary inside the forum root.
pub struct ComposerClient {
    binary: String,
    working_dir: PathBuf,
    timeout: Duration,
    no_dev: bool,
}

impl ComposerClient {
    pub fn new(config: &ComposerConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            working_dir: config.working_dir.clone(),
            timeout: Duration::from_secs(config.timeout.max(1)),
            no_dev: config.no_dev,
        }
    }

    async fn run_composer(&self, args: &[String]) -> Result<std::process::Output> {
        let command_line = format!("{} {}", self.binary, args.join(" "));
        let mut command = Command::new(&self.binary);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .env("COMPOSER_NO_INTERACTION", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out composer must not linger behind the orchestrator.
            .kill_on_drop(true);

        match timeout(self.timeout, command.output()).await {
            Ok(result) => result.map_err(|err| map_spawn_error(err, &self.binary)),
            Err(_) => Err(SynforumError::Timeout {
                command: command_line,
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    /// Probe which installed extensions block the core package from
    /// reaching `version`. why-not exits nonzero when blockers exist,
    /// so only spawn failures are treated as errors here.
    async fn why_not(&self, package: &str, version: &str) -> Result<BTreeSet<String>> {
        let args = vec![
            "why-not".to_string(),
            package.to_string(),
            version.to_string(),
            "--no-interaction".to_string(),
        ];
        let output = self.run_composer(&args).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_why_not(&stdout, package))
    }

    fn apply_args(&self, scope: &UpdateScope) -> Vec<String> {
        let mut args = match scope {
            UpdateScope::CoreMinor { core_package, .. } => vec![
                "update".to_string(),
                core_package.clone(),
                "--with-all-dependencies".to_string(),
            ],
            UpdateScope::Extension { name } => vec![
                "require".to_string(),
                format!("{name}:*"),
                "--update-with-all-dependencies".to_string(),
            ],
            UpdateScope::Global { .. } => vec![
                "update".to_string(),
                "--with-all-dependencies".to_string(),
            ],
        };
        args.push("--prefer-dist".to_string());
        args.push("--no-progress".to_string());
        args.push("--no-interaction".to_string());
        if self.no_dev {
            args.push("--no-dev".to_string());
        }
        args
    }
}

#[async_trait]
impl PackageManager for ComposerClient {
    async fn check_updates(&self) -> Result<CheckOutcome> {
        let args = vec![
            "outdated".to_string(),
            "--direct".to_string(),
            "--format=json".to_string(),
            "--no-interaction".to_string(),
        ];
        let output = self.run_composer(&args).await?;
        if !output.status.success() {
            return Err(SynforumError::CommandFailure {
                command: format!("{} outdated --direct", self.binary),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let stdout = String::from_utf8(output.stdout).map_err(|err| {
            SynforumError::Serialization(format!("composer outdated emitted invalid UTF-8: {err}"))
        })?;

        Ok(CheckOutcome {
            checked_at: Utc::now(),
            updates: parse_outdated(&stdout)?,
        })
    }

    async fn apply_update(&self, scope: &UpdateScope) -> Result<RunOutcome> {
        let args = self.apply_args(scope);
        let output = self.run_composer(&args).await?;
        let ran_at = Utc::now();

        if output.status.success() {
            return Ok(RunOutcome {
                ran_at,
                status: UpdateStatus::Success,
                limited_packages: BTreeSet::new(),
                incompatible_extensions: BTreeSet::new(),
            });
        }

        let diagnostics = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        let limited_packages = parse_problem_packages(&diagnostics);

        let incompatible_extensions = match scope {
            UpdateScope::CoreMinor {
                core_package,
                target_version: Some(target),
            }
            | UpdateScope::Global {
                core_package,
                target_version: Some(target),
            } => self.why_not(core_package, target).await.unwrap_or_default(),
            _ => BTreeSet::new(),
        };

        Ok(RunOutcome {
            ran_at,
            status: UpdateStatus::Failure,
            limited_packages,
            incompatible_extensions,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OutdatedDocument {
    #[serde(default)]
    installed: Vec<OutdatedEntry>,
}

#[derive(Debug, Deserialize)]
struct OutdatedEntry {
    name: String,
    version: String,
    latest: String,
    #[serde(rename = "latest-status")]
    latest_status: String,
    #[serde(default)]
    description: String,
}

/// Decode `composer outdated --format=json` output. Entries missing
/// expected fields fail decoding rather than producing partial state.
fn parse_outdated(stdout: &str) -> Result<Vec<UpdatedPackage>> {
    let document: OutdatedDocument = serde_json::from_str(stdout).map_err(|err| {
        SynforumError::Serialization(format!("Failed to decode composer outdated output: {err}"))
    })?;

    Ok(document
        .installed
        .into_iter()
        .map(|entry| {
            let latest_status =
                classify_latest_status(&entry.version, &entry.latest, &entry.latest_status);
            UpdatedPackage {
                name: entry.name,
                version: entry.version,
                latest: entry.latest,
                latest_minor: None,
                latest_major: None,
                latest_status,
                description: entry.description,
            }
        })
        .collect())
}

/// Normalize composer's latest-status vocabulary to the state model's
/// `up-to-date` / `minor` / `major`, preferring a semver verdict when
/// both versions parse.
fn classify_latest_status(installed: &str, latest: &str, raw_status: &str) -> String {
    if raw_status == "up-to-date" {
        return "up-to-date".to_string();
    }
    if let (Some(installed), Some(latest)) = (lenient_version(installed), lenient_version(latest)) {
        if latest <= installed {
            return "up-to-date".to_string();
        }
        return if latest.major > installed.major {
            "major".to_string()
        } else {
            "minor".to_string()
        };
    }
    match raw_status {
        "semver-safe-update" => "minor".to_string(),
        "update-possible" => "major".to_string(),
        other => other.to_string(),
    }
}

/// Extract vendored package names mentioned in composer's dependency
/// problem output.
fn parse_problem_packages(diagnostics: &str) -> BTreeSet<String> {
    const MARKERS: [&str; 4] = ["requires", "locked", "does not match", "conflicts"];

    let mut packages = BTreeSet::new();
    for line in diagnostics.lines() {
        if !MARKERS.iter().any(|marker| line.contains(marker)) {
            continue;
        }
        for token in line.split_whitespace() {
            if let Some(name) = vendored_name(token) {
                packages.insert(name);
            }
        }
    }
    packages
}

/// Extract the extensions `composer why-not` reports as holding back
/// `package`. Each blocker line leads with the dependent's name.
fn parse_why_not(stdout: &str, package: &str) -> BTreeSet<String> {
    let mut extensions = BTreeSet::new();
    for line in stdout.lines() {
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if let Some(name) = vendored_name(first) {
            if name != package {
                extensions.insert(name);
            }
        }
    }
    extensions
}

/// Reduce a diagnostic token to a `vendor/name` package identifier,
/// if it is one. Version suffixes like `vendor/name[1.2.0]` are
/// stripped; platform packages (no vendor segment) are rejected.
pub(crate) fn vendored_name(token: &str) -> Option<String> {
    let bare = token.split('[').next().unwrap_or_default();
    let bare = bare.trim_matches(|c: char| matches!(c, ',' | '.' | '(' | ')' | '"' | '\'' | ';'));
    let (vendor, name) = bare.split_once('/')?;
    if vendor.is_empty() || name.is_empty() || name.contains('/') {
        return None;
    }
    let valid = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    };
    if valid(vendor) && valid(name) {
        Some(bare.to_string())
    } else {
        None
    }
}

fn map_spawn_error(err: io::Error, command: &str) -> SynforumError {
    if err.kind() == io::ErrorKind::NotFound {
        SynforumError::CommandMissing {
            command: command.into(),
        }
    } else {
        SynforumError::Runtime(format!("Failed to spawn {command}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTDATED_JSON: &str = r#"{
        "installed": [
            {
                "name": "flarum/core",
                "version": "1.8.0",
                "latest": "1.8.5",
                "latest-status": "semver-safe-update",
                "description": "Delightfully simple forum software."
            },
            {
                "name": "fof/polls",
                "version": "2.0.1",
                "latest": "3.0.0",
                "latest-status": "update-possible",
                "description": "Polls for discussions."
            }
        ]
    }"#;

    #[test]
    fn outdated_output_decodes_and_classifies() {
        let updates = parse_outdated(OUTDATED_JSON).expect("decode");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].name, "flarum/core");
        assert_eq!(updates[0].latest_status, "minor");
        assert_eq!(updates[1].latest_status, "major");
        assert!(updates[0].latest_minor.is_none());
    }

    #[test]
    fn outdated_output_missing_fields_fails_fast() {
        let malformed = r#"{"installed": [{"name": "flarum/core", "version": "1.8.0"}]}"#;
        let err = parse_outdated(malformed).unwrap_err();
        assert!(matches!(err, SynforumError::Serialization(_)));
    }

    #[test]
    fn classification_prefers_semver_verdict() {
        // composer flags any cross-constraint jump as update-possible,
        // including minor bumps under a tight constraint.
        assert_eq!(classify_latest_status("1.2.0", "1.4.0", "update-possible"), "minor");
        assert_eq!(classify_latest_status("1.2.0", "2.0.0", "update-possible"), "major");
        assert_eq!(classify_latest_status("2.0", "v2.1", "semver-safe-update"), "minor");
        assert_eq!(classify_latest_status("1.0.0", "1.0.0", "semver-safe-update"), "up-to-date");
    }

    #[test]
    fn classification_falls_back_on_raw_status() {
        assert_eq!(
            classify_latest_status("dev-main", "dev-develop", "semver-safe-update"),
            "minor"
        );
        assert_eq!(
            classify_latest_status("dev-main", "dev-develop", "update-possible"),
            "major"
        );
    }

    #[test]
    fn apply_args_map_each_scope() {
        let client = ComposerClient::new(&crate::config::ComposerConfig::default());

        let core = client.apply_args(&UpdateScope::CoreMinor {
            core_package: "flarum/core".to_string(),
            target_version: Some("1.8.5".to_string()),
        });
        assert_eq!(core[..3], ["update", "flarum/core", "--with-all-dependencies"]);
        assert!(core.contains(&"--no-dev".to_string()));

        let extension = client.apply_args(&UpdateScope::Extension {
            name: "fof/polls".to_string(),
        });
        assert_eq!(extension[..2], ["require", "fof/polls:*"]);

        let global = client.apply_args(&UpdateScope::Global {
            core_package: "flarum/core".to_string(),
            target_version: None,
        });
        assert_eq!(global[..2], ["update", "--with-all-dependencies"]);
        assert!(global.contains(&"--no-interaction".to_string()));
    }

    #[test]
    fn problem_output_yields_limited_packages() {
        let diagnostics = "\
Loading composer repositories with package information
Your requirements could not be resolved to an installable set of packages.

  Problem 1
    - Root composer.json requires flarum/tags ^2.0, found flarum/tags[1.5.0] but it does not match the constraint.
  Problem 2
    - fof/polls is locked to version 1.2.0 and an update of this package was not requested.
";
        let packages = parse_problem_packages(diagnostics);
        assert_eq!(
            packages,
            BTreeSet::from(["flarum/tags".to_string(), "fof/polls".to_string()])
        );
    }

    #[test]
    fn why_not_output_excludes_the_probed_package() {
        let stdout = "\
flarum/tags 1.5.0 requires flarum/core (^1.0.0)
fof/polls 2.1.0 requires flarum/core (>=1.2)
flarum/core 1.8.0 is the root requirement
";
        let extensions = parse_why_not(stdout, "flarum/core");
        assert_eq!(
            extensions,
            BTreeSet::from(["flarum/tags".to_string(), "fof/polls".to_string()])
        );
    }

    #[test]
    fn vendored_name_rejects_platform_packages() {
        assert_eq!(vendored_name("php"), None);
        assert_eq!(vendored_name("ext-json"), None);
        assert_eq!(
            vendored_name("flarum/tags[1.5.0],"),
            Some("flarum/tags".to_string())
        );
        assert_eq!(vendored_name("a/b/c"), None);
    }
}
