/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::state
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Shared structures describing check and run results, plus the
    persisted store the admin layer reads between invocations.

  Security / Safety Notes:
    State data is written to operator-controlled paths; no
    privileged operations are performed.

  Dependencies:
    serde for JSON serialization, chrono for timestamps.

  Operational Scope:
    Written exclusively through the orchestrator; consumed by
    the presentation layer as read-only snapshots.

  Revision History:
    2026-03-02 COD  Introduced update-state model and store.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Whole-value replacement writes, no partial mutation
    - Closed enumerations for update types
    - Deterministic ordering for reproducible documents
============================================================*/

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SynforumError};

/// Scope classification of a package update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Major,
    Minor,
    Global,
}

impl UpdateType {
    pub const ALL: [UpdateType; 3] = [UpdateType::Major, UpdateType::Minor, UpdateType::Global];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Major => "major",
            UpdateType::Minor => "minor",
            UpdateType::Global => "global",
        }
    }
}

/// Outcome classification of a recorded update run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Failure,
    #[default]
    Unknown,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::Success => "success",
            UpdateStatus::Failure => "failure",
            UpdateStatus::Unknown => "unknown",
        }
    }
}

/// One package's installed version against its available versions.
/// Immutable snapshot, replaced wholesale on each check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedPackage {
    pub name: String,
    pub version: String,
    pub latest: String,
    #[serde(rename = "latest-minor", default, skip_serializing_if = "Option::is_none")]
    pub latest_minor: Option<String>,
    #[serde(rename = "latest-major", default, skip_serializing_if = "Option::is_none")]
    pub latest_major: Option<String>,
    #[serde(rename = "latest-status")]
    pub latest_status: String,
    #[serde(default)]
    pub description: String,
}

/// Most recently completed check: timestamp plus update candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdateCheck {
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updates: Vec<UpdatedPackage>,
}

/// Recorded outcome of one update run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub ran_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: UpdateStatus,
    #[serde(default)]
    pub limited_packages: BTreeSet<String>,
    #[serde(default)]
    pub incompatible_extensions: BTreeSet<String>,
}

/// Fixed record keyed by the closed `UpdateType` enumeration.
/// Every update type is always present; absence is unrepresentable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastUpdateRun {
    #[serde(default)]
    pub major: UpdateState,
    #[serde(default)]
    pub minor: UpdateState,
    #[serde(default)]
    pub global: UpdateState,
}

impl LastUpdateRun {
    pub fn get(&self, update_type: UpdateType) -> &UpdateState {
        match update_type {
            UpdateType::Major => &self.major,
            UpdateType::Minor => &self.minor,
            UpdateType::Global => &self.global,
        }
    }

    fn set(&mut self, update_type: UpdateType, state: UpdateState) {
        match update_type {
            UpdateType::Major => self.major = state,
            UpdateType::Minor => self.minor = state,
            UpdateType::Global => self.global = state,
        }
    }

    /// Union of limited-package sets across all update types.
    pub fn limited_packages(&self) -> BTreeSet<String> {
        UpdateType::ALL
            .iter()
            .flat_map(|t| self.get(*t).limited_packages.iter().cloned())
            .collect()
    }
}

/// Serialized document layout of the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub last_check: LastUpdateCheck,
    #[serde(default)]
    pub last_run: LastUpdateRun,
}

/// Holds the last-known check and run results, persisting each write
/// as a whole-document replacement so readers never observe partial
/// state.
#[derive(Debug)]
pub struct UpdateStateStore {
    document: StateDocument,
    path: Option<PathBuf>,
}

impl UpdateStateStore {
    /// Open the store, loading the existing document when present.
    /// A malformed document is a decoding error, never partial state.
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let document = match path.as_deref() {
            Some(existing) if existing.exists() => load_document(existing)?,
            _ => StateDocument::default(),
        };
        Ok(Self { document, path })
    }

    /// Drop the backing path; subsequent writes stay in memory.
    /// Used for dry runs.
    pub fn into_ephemeral(mut self) -> Self {
        self.path = None;
        self
    }

    pub fn last_check(&self) -> &LastUpdateCheck {
        &self.document.last_check
    }

    pub fn last_run(&self) -> &LastUpdateRun {
        &self.document.last_run
    }

    /// Replace the last check wholesale and persist.
    pub fn record_check(&mut self, check: LastUpdateCheck) -> Result<()> {
        self.document.last_check = check;
        self.persist()
    }

    /// Replace the state for one update type wholesale and persist.
    pub fn record_run(&mut self, update_type: UpdateType, state: UpdateState) -> Result<()> {
        self.document.last_run.set(update_type, state);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                SynforumError::Filesystem(format!(
                    "Failed to create state directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let file = File::create(path).map_err(|err| {
            SynforumError::Filesystem(format!(
                "Failed to create state file {}: {err}",
                path.display()
            ))
        })?;
        serde_json::to_writer_pretty(file, &self.document).map_err(|err| {
            SynforumError::Filesystem(format!(
                "Failed to write state file {}: {err}",
                path.display()
            ))
        })?;
        Ok(())
    }
}

fn load_document(path: &Path) -> Result<StateDocument> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        SynforumError::Filesystem(format!(
            "Failed to read state file {}: {err}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        SynforumError::Serialization(format!(
            "State file {} is malformed: {err}",
            path.display()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_package(name: &str, status: &str) -> UpdatedPackage {
        UpdatedPackage {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            latest: "2.0.0".to_string(),
            latest_minor: None,
            latest_major: None,
            latest_status: status.to_string(),
            description: String::new(),
        }
    }

    fn sample_check() -> LastUpdateCheck {
        LastUpdateCheck {
            checked_at: Some(Utc::now()),
            updates: vec![sample_package("flarum/tags", "minor")],
        }
    }

    #[test]
    fn record_check_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        let mut store = UpdateStateStore::open(Some(path.clone())).expect("open");

        let check = sample_check();
        store.record_check(check.clone()).expect("first record");
        let first = std::fs::read_to_string(&path).expect("read");
        store.record_check(check.clone()).expect("second record");
        let second = std::fs::read_to_string(&path).expect("read");

        assert_eq!(store.last_check(), &check);
        assert_eq!(first, second);
    }

    #[test]
    fn later_check_replaces_earlier_wholesale() {
        let mut store = UpdateStateStore::open(None).expect("open");
        store.record_check(sample_check()).expect("first");

        let second = LastUpdateCheck {
            checked_at: Some(Utc::now()),
            updates: vec![sample_package("fof/polls", "major")],
        };
        store.record_check(second.clone()).expect("second");

        assert_eq!(store.last_check(), &second);
        assert_eq!(store.last_check().updates.len(), 1);
    }

    #[test]
    fn record_run_replaces_only_that_type() {
        let mut store = UpdateStateStore::open(None).expect("open");
        let state = UpdateState {
            ran_at: Some(Utc::now()),
            status: UpdateStatus::Failure,
            limited_packages: BTreeSet::from(["flarum/tags".to_string()]),
            incompatible_extensions: BTreeSet::new(),
        };

        store
            .record_run(UpdateType::Minor, state.clone())
            .expect("record");

        assert_eq!(store.last_run().get(UpdateType::Minor), &state);
        assert_eq!(store.last_run().get(UpdateType::Major), &UpdateState::default());
        assert_eq!(store.last_run().get(UpdateType::Global), &UpdateState::default());
    }

    #[test]
    fn all_update_types_always_present() {
        let run = LastUpdateRun::default();
        for update_type in UpdateType::ALL {
            assert_eq!(run.get(update_type).status, UpdateStatus::Unknown);
        }
    }

    #[test]
    fn limited_packages_unions_across_types() {
        let mut run = LastUpdateRun::default();
        run.set(
            UpdateType::Minor,
            UpdateState {
                limited_packages: BTreeSet::from(["a/b".to_string(), "c/d".to_string()]),
                ..UpdateState::default()
            },
        );
        run.set(
            UpdateType::Global,
            UpdateState {
                limited_packages: BTreeSet::from(["c/d".to_string(), "e/f".to_string()]),
                ..UpdateState::default()
            },
        );

        let union = run.limited_packages();
        assert_eq!(
            union,
            BTreeSet::from(["a/b".to_string(), "c/d".to_string(), "e/f".to_string()])
        );
    }

    #[test]
    fn store_round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("state.json");
        let check = sample_check();
        {
            let mut store = UpdateStateStore::open(Some(path.clone())).expect("open");
            store.record_check(check.clone()).expect("record");
        }

        let reopened = UpdateStateStore::open(Some(path)).expect("reopen");
        assert_eq!(reopened.last_check(), &check);
    }

    #[test]
    fn malformed_state_file_fails_decoding() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").expect("write");

        let err = UpdateStateStore::open(Some(path)).unwrap_err();
        assert!(matches!(err, SynforumError::Serialization(_)));
    }

    #[test]
    fn package_serializes_with_original_key_names() {
        let mut package = sample_package("flarum/core", "minor");
        package.latest_minor = Some("1.8.5".to_string());
        let json = serde_json::to_value(&package).expect("serialize");
        assert_eq!(json["latest-minor"], "1.8.5");
        assert_eq!(json["latest-status"], "minor");
        assert!(json.get("latest-major").is_none());
    }
}
