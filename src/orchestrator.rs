/*============================================================
  Synavera Project: Syn-Forum
  Module: synforum_core::orchestrator
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Issue update-check and update-apply requests to the package
    manager, reconcile completions into the state store, and
    expose derived views for the presentation layer.

  Security / Safety Notes:
    Owns the state store exclusively; readers receive snapshots
    only. No privileged operations are performed.

  Dependencies:
    tokio for async execution, chrono for run timestamps.

  Operational Scope:
    Embedded by the entry point; one orchestrator per forum
    deployment.

  Revision History:
    2026-03-02 COD  Authored update orchestration core.
    2026-03-19 COD  Per-kind in-flight coalescing.
  ------------------------------------------------------------
  SSE Principles Observed:
    - At most one in-flight operation per named action
    - Failures recorded as state, never orchestrator aborts
    - Store written from completion paths only
============================================================*/

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::blueprint::{NotificationDispatch, UpdatesAvailableBlueprint};
use crate::composer::{vendored_name, PackageManager, UpdateScope};
use crate::error::{Result, SynforumError};
use crate::logger::Logger;
use crate::packagist::PackagistClient;
use crate::state::{
    LastUpdateCheck, LastUpdateRun, UpdateState, UpdateStateStore, UpdateStatus, UpdateType,
    UpdatedPackage,
};

/// Named actions that may each have at most one operation in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationKind {
    Check,
    CoreMinor,
    ExtensionUpdate,
    GlobalUpdate,
}

impl OperationKind {
    fn as_str(self) -> &'static str {
        match self {
            OperationKind::Check => "check",
            OperationKind::CoreMinor => "core-minor-update",
            OperationKind::ExtensionUpdate => "extension-update",
            OperationKind::GlobalUpdate => "global-update",
        }
    }
}

/// How a check trigger resolved: executed, or suppressed because the
/// same kind was already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Completed,
    Coalesced,
}

/// How an update trigger resolved. A completed run names the slot it
/// was recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDispatch {
    Completed(UpdateType),
    Coalesced,
}

/// Drives the external package manager and reconciles completions
/// into the exclusively-owned state store.
pub struct UpdateOrchestrator<M: PackageManager> {
    manager: M,
    store: Mutex<UpdateStateStore>,
    in_flight: Mutex<BTreeSet<OperationKind>>,
    packagist: Option<PackagistClient>,
    notifier: Box<dyn NotificationDispatch>,
    logger: Arc<Logger>,
    core_package: String,
}

/// Marks one operation kind as in flight; releases it on drop.
struct InFlightGuard<'a> {
    kinds: &'a Mutex<BTreeSet<OperationKind>>,
    kind: OperationKind,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut kinds) = self.kinds.lock() {
            kinds.remove(&self.kind);
        }
    }
}

impl<M: PackageManager> UpdateOrchestrator<M> {
    pub fn new(
        manager: M,
        store: UpdateStateStore,
        packagist: Option<PackagistClient>,
        notifier: Box<dyn NotificationDispatch>,
        logger: Arc<Logger>,
        core_package: String,
    ) -> Self {
        Self {
            manager,
            store: Mutex::new(store),
            in_flight: Mutex::new(BTreeSet::new()),
            packagist,
            notifier,
            logger,
            core_package,
        }
    }

    /// Trigger an update check. A second trigger while one is
    /// outstanding is a no-op; the store only ever reflects the most
    /// recently completed response.
    pub async fn check_for_updates(&self) -> Result<Dispatch> {
        let Some(_guard) = self.begin(OperationKind::Check)? else {
            return Ok(Dispatch::Coalesced);
        };

        self.logger.info("CHECK", "Querying package manager for update candidates");
        let mut outcome = match self.manager.check_updates().await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.logger.error("CHECK", format!("Update check failed: {err}"));
                return Err(err);
            }
        };

        if let Some(packagist) = &self.packagist {
            if let Err(err) = packagist.enrich(&mut outcome.updates).await {
                self.logger
                    .warn("PACKAGIST", format!("Version enrichment degraded: {err}"));
            }
        }

        let check = LastUpdateCheck {
            checked_at: Some(outcome.checked_at),
            updates: outcome.updates,
        };
        let update_count = check.updates.len();
        let core_latest = check
            .updates
            .iter()
            .find(|package| package.name == self.core_package)
            .map(|package| package.latest.clone());
        self.lock_store()?.record_check(check)?;
        self.logger
            .info("CHECK", format!("Recorded {update_count} update candidates"));

        if update_count > 0 {
            let blueprint =
                UpdatesAvailableBlueprint::new(update_count, core_latest, outcome.checked_at);
            self.notifier.deliver(&blueprint);
        }

        Ok(Dispatch::Completed)
    }

    /// Apply the newest compatible release of one extension. The run
    /// records under major or minor according to the extension's
    /// status in the last check.
    pub async fn update_extension(&self, name: &str) -> Result<RunDispatch> {
        let Some(guard) = self.begin(OperationKind::ExtensionUpdate)? else {
            return Ok(RunDispatch::Coalesced);
        };

        let update_type = self.classify_extension(name)?;
        let scope = UpdateScope::Extension {
            name: name.to_string(),
        };
        self.run_update(update_type, scope, Some(name)).await?;

        drop(guard);
        self.refresh_after_run().await;
        Ok(RunDispatch::Completed(update_type))
    }

    /// Move the core package to its newest release within the
    /// installed major.
    pub async fn update_core_minor(&self) -> Result<RunDispatch> {
        let Some(guard) = self.begin(OperationKind::CoreMinor)? else {
            return Ok(RunDispatch::Coalesced);
        };

        let target_version = {
            let store = self.lock_store()?;
            store
                .last_check()
                .updates
                .iter()
                .find(|package| package.name == self.core_package)
                .map(|package| {
                    package
                        .latest_minor
                        .clone()
                        .unwrap_or_else(|| package.latest.clone())
                })
        };
        let scope = UpdateScope::CoreMinor {
            core_package: self.core_package.clone(),
            target_version,
        };
        self.run_update(UpdateType::Minor, scope, None).await?;

        drop(guard);
        self.refresh_after_run().await;
        Ok(RunDispatch::Completed(UpdateType::Minor))
    }

    /// Update every package the deployment requires.
    pub async fn update_globally(&self) -> Result<RunDispatch> {
        let Some(guard) = self.begin(OperationKind::GlobalUpdate)? else {
            return Ok(RunDispatch::Coalesced);
        };

        let target_version = {
            let store = self.lock_store()?;
            store
                .last_check()
                .updates
                .iter()
                .find(|package| package.name == self.core_package)
                .map(|package| {
                    package
                        .latest_major
                        .clone()
                        .unwrap_or_else(|| package.latest.clone())
                })
        };
        let scope = UpdateScope::Global {
            core_package: self.core_package.clone(),
            target_version,
        };
        self.run_update(UpdateType::Global, scope, None).await?;

        drop(guard);
        self.refresh_after_run().await;
        Ok(RunDispatch::Completed(UpdateType::Global))
    }

    /// Snapshot of the most recently completed check.
    pub fn last_check(&self) -> Result<LastUpdateCheck> {
        Ok(self.lock_store()?.last_check().clone())
    }

    /// Snapshot of the recorded run states.
    pub fn last_run(&self) -> Result<LastUpdateRun> {
        Ok(self.lock_store()?.last_run().clone())
    }

    /// Updatable packages that are installed extensions. The core
    /// package and platform requirements never appear here.
    pub fn extension_updates(&self) -> Result<Vec<UpdatedPackage>> {
        let store = self.lock_store()?;
        Ok(store
            .last_check()
            .updates
            .iter()
            .filter(|package| {
                package.name != self.core_package && vendored_name(&package.name).is_some()
            })
            .cloned()
            .collect())
    }

    /// The core package's update entry, if any.
    pub fn core_update(&self) -> Result<Option<UpdatedPackage>> {
        let store = self.lock_store()?;
        Ok(store
            .last_check()
            .updates
            .iter()
            .find(|package| package.name == self.core_package)
            .cloned())
    }

    async fn run_update(
        &self,
        update_type: UpdateType,
        scope: UpdateScope,
        failure_target: Option<&str>,
    ) -> Result<()> {
        self.logger.info(
            "UPDATE",
            format!(
                "Applying {} update via {}",
                update_type.as_str(),
                scope.describe()
            ),
        );

        let state = match self.manager.apply_update(&scope).await {
            Ok(outcome) => {
                let mut state = UpdateState {
                    ran_at: Some(outcome.ran_at),
                    status: outcome.status,
                    limited_packages: outcome.limited_packages,
                    incompatible_extensions: outcome.incompatible_extensions,
                };
                if state.status == UpdateStatus::Failure {
                    if let Some(target) = failure_target {
                        state.limited_packages.insert(target.to_string());
                    }
                }
                state
            }
            Err(err) => {
                self.logger.error(
                    "UPDATE",
                    format!("{} update could not be issued: {err}", update_type.as_str()),
                );
                let mut limited_packages = BTreeSet::new();
                if let Some(target) = failure_target {
                    limited_packages.insert(target.to_string());
                }
                UpdateState {
                    ran_at: Some(Utc::now()),
                    status: UpdateStatus::Failure,
                    limited_packages,
                    incompatible_extensions: BTreeSet::new(),
                }
            }
        };

        match state.status {
            UpdateStatus::Success => self
                .logger
                .info("UPDATE", format!("{} update succeeded", update_type.as_str())),
            UpdateStatus::Failure => self.logger.warn(
                "UPDATE",
                format!(
                    "{} update failed; limited={} incompatible={}",
                    update_type.as_str(),
                    state.limited_packages.len(),
                    state.incompatible_extensions.len()
                ),
            ),
            UpdateStatus::Unknown => {}
        }

        self.lock_store()?.record_run(update_type, state)?;
        Ok(())
    }

    /// Runs change what the next check would report, so every recorded
    /// run is followed by a refresh.
    async fn refresh_after_run(&self) {
        if let Err(err) = self.check_for_updates().await {
            self.logger
                .warn("REFRESH", format!("Post-run check failed: {err}"));
        }
    }

    fn classify_extension(&self, name: &str) -> Result<UpdateType> {
        let store = self.lock_store()?;
        let update_type = store
            .last_check()
            .updates
            .iter()
            .find(|package| package.name == name)
            .map(|package| {
                if package.latest_status == "major" {
                    UpdateType::Major
                } else {
                    UpdateType::Minor
                }
            })
            .unwrap_or(UpdateType::Minor);
        Ok(update_type)
    }

    fn begin(&self, kind: OperationKind) -> Result<Option<InFlightGuard<'_>>> {
        let mut kinds = self
            .in_flight
            .lock()
            .map_err(|_| SynforumError::Runtime("in-flight registry lock poisoned".into()))?;
        if kinds.insert(kind) {
            Ok(Some(InFlightGuard {
                kinds: &self.in_flight,
                kind,
            }))
        } else {
            self.logger.debug(
                "COALESCE",
                format!("{} already in flight; trigger suppressed", kind.as_str()),
            );
            Ok(None)
        }
    }

    fn lock_store(&self) -> Result<MutexGuard<'_, UpdateStateStore>> {
        self.store
            .lock()
            .map_err(|_| SynforumError::Runtime("state store lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::blueprint::{LogNotifier, NotificationBlueprint};
    use crate::composer::{CheckOutcome, RunOutcome};
    use crate::error::SynforumError;

    struct FakeManager {
        updates: Vec<UpdatedPackage>,
        fail_check: bool,
        fail_apply: bool,
        checks: Arc<AtomicUsize>,
        applies: Arc<AtomicUsize>,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeManager {
        fn new(updates: Vec<UpdatedPackage>) -> Self {
            Self {
                updates,
                fail_check: false,
                fail_apply: false,
                checks: Arc::new(AtomicUsize::new(0)),
                applies: Arc::new(AtomicUsize::new(0)),
                gate: None,
            }
        }

        fn failing_apply(mut self) -> Self {
            self.fail_apply = true;
            self
        }

        fn failing_check(mut self) -> Self {
            self.fail_check = true;
            self
        }

        fn gated(mut self, gate: Arc<Semaphore>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait::async_trait]
    impl PackageManager for FakeManager {
        async fn check_updates(&self) -> crate::error::Result<CheckOutcome> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.fail_check {
                return Err(SynforumError::CommandFailure {
                    command: "composer outdated --direct".into(),
                    status: 1,
                    stderr: "network unreachable".into(),
                });
            }
            Ok(CheckOutcome {
                checked_at: Utc::now(),
                updates: self.updates.clone(),
            })
        }

        async fn apply_update(&self, _scope: &UpdateScope) -> crate::error::Result<RunOutcome> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if self.fail_apply {
                return Err(SynforumError::CommandFailure {
                    command: "composer update".into(),
                    status: 2,
                    stderr: "resolution failed".into(),
                });
            }
            Ok(RunOutcome {
                ran_at: Utc::now(),
                status: UpdateStatus::Success,
                limited_packages: BTreeSet::new(),
                incompatible_extensions: BTreeSet::new(),
            })
        }
    }

    struct CountingNotifier {
        delivered: Arc<AtomicUsize>,
    }

    impl NotificationDispatch for CountingNotifier {
        fn deliver(&self, _blueprint: &dyn NotificationBlueprint) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn package(name: &str, status: &str) -> UpdatedPackage {
        UpdatedPackage {
            name: name.to_string(),
            version: "1.0".to_string(),
            latest: (if status == "major" { "3.0" } else { "1.1" }).to_string(),
            latest_minor: None,
            latest_major: None,
            latest_status: status.to_string(),
            description: String::new(),
        }
    }

    fn orchestrator(manager: FakeManager) -> UpdateOrchestrator<FakeManager> {
        let logger = Arc::new(Logger::new(None, false).expect("logger"));
        let store = UpdateStateStore::open(None).expect("store");
        UpdateOrchestrator::new(
            manager,
            store,
            None,
            Box::new(LogNotifier::new(logger.clone())),
            logger,
            "flarum/core".to_string(),
        )
    }

    #[tokio::test]
    async fn derived_views_split_core_and_extensions() {
        let manager = FakeManager::new(vec![
            package("flarum/core", "minor"),
            package("fof/polls", "major"),
        ]);
        let orch = orchestrator(manager);

        assert_eq!(orch.check_for_updates().await.expect("check"), Dispatch::Completed);

        let core = orch.core_update().expect("view").expect("core entry");
        assert_eq!(core.name, "flarum/core");
        let extensions = orch.extension_updates().expect("view");
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].name, "fof/polls");
    }

    #[tokio::test]
    async fn second_concurrent_check_is_coalesced() {
        let gate = Arc::new(Semaphore::new(0));
        let manager = FakeManager::new(vec![]).gated(gate.clone());
        let checks = manager.checks.clone();
        let orch = Arc::new(orchestrator(manager));

        let background = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.check_for_updates().await })
        };
        while checks.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(
            orch.check_for_updates().await.expect("dispatch"),
            Dispatch::Coalesced
        );

        gate.add_permits(1);
        let first = background.await.expect("join").expect("check");
        assert_eq!(first, Dispatch::Completed);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_extension_update_is_recorded_not_raised() {
        let manager = FakeManager::new(vec![]).failing_apply();
        let applies = manager.applies.clone();
        let orch = orchestrator(manager);

        let dispatch = orch.update_extension("fof/polls").await.expect("dispatch");
        assert_eq!(dispatch, RunDispatch::Completed(UpdateType::Minor));
        assert_eq!(applies.load(Ordering::SeqCst), 1);

        let state = orch.last_run().expect("run");
        let minor = state.get(UpdateType::Minor);
        assert_eq!(minor.status, UpdateStatus::Failure);
        assert!(minor.ran_at.is_some());
        assert!(minor.limited_packages.contains("fof/polls"));
        // The orchestrator stays usable after a failed run.
        assert_eq!(orch.check_for_updates().await.expect("check"), Dispatch::Completed);
    }

    #[tokio::test]
    async fn completed_run_triggers_a_refresh_check() {
        let manager = FakeManager::new(vec![package("flarum/core", "minor")]);
        let checks = manager.checks.clone();
        let applies = manager.applies.clone();
        let orch = orchestrator(manager);

        orch.update_core_minor().await.expect("dispatch");

        assert_eq!(applies.load(Ordering::SeqCst), 1);
        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert_eq!(
            orch.last_run().expect("run").get(UpdateType::Minor).status,
            UpdateStatus::Success
        );
        assert!(orch.last_check().expect("check").checked_at.is_some());
    }

    #[tokio::test]
    async fn extension_run_classifies_from_last_check() {
        let manager = FakeManager::new(vec![package("fof/polls", "major")]);
        let orch = orchestrator(manager);
        orch.check_for_updates().await.expect("seed check");

        let dispatch = orch.update_extension("fof/polls").await.expect("dispatch");
        assert_eq!(dispatch, RunDispatch::Completed(UpdateType::Major));

        let run = orch.last_run().expect("run");
        assert_eq!(run.get(UpdateType::Major).status, UpdateStatus::Success);
        assert_eq!(run.get(UpdateType::Minor).status, UpdateStatus::Unknown);
    }

    #[tokio::test]
    async fn notification_emitted_only_when_updates_found() {
        let delivered = Arc::new(AtomicUsize::new(0));
        let logger = Arc::new(Logger::new(None, false).expect("logger"));
        let orch = UpdateOrchestrator::new(
            FakeManager::new(vec![package("fof/polls", "minor")]),
            UpdateStateStore::open(None).expect("store"),
            None,
            Box::new(CountingNotifier {
                delivered: delivered.clone(),
            }),
            logger.clone(),
            "flarum/core".to_string(),
        );
        orch.check_for_updates().await.expect("check");
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        let quiet = UpdateOrchestrator::new(
            FakeManager::new(vec![]),
            UpdateStateStore::open(None).expect("store"),
            None,
            Box::new(CountingNotifier {
                delivered: delivered.clone(),
            }),
            logger,
            "flarum/core".to_string(),
        );
        quiet.check_for_updates().await.expect("check");
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_check_leaves_the_store_untouched() {
        let manager = FakeManager::new(vec![]).failing_check();
        let orch = orchestrator(manager);

        let err = orch.check_for_updates().await.unwrap_err();
        assert!(matches!(err, SynforumError::CommandFailure { .. }));
        assert!(orch.last_check().expect("snapshot").checked_at.is_none());
    }
}
