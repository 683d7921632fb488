//! Convergence engine.
//!
//! Ties the pipeline together: validate the manifest, build the dependency
//! graph, diff declarations against remembered state, turn the diff into an
//! ordered plan, and execute it through the adapters. The `reconcile` loop
//! repeats plan and apply until a fresh diff comes back empty or the attempt
//! budget runs out.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::AdapterRegistry;
use crate::config::{DeclHasher, Manifest, ManifestValidator, ResourceId};
use crate::error::{ApplyError, Result};
use crate::graph::DependencyGraph;
use crate::planner::{CancelToken, DiffEngine, Plan, PlanExecutor, RunReport};
use crate::state::{
    EngineState, LockInfo, RunHistoryEntry, RunOperation, StateStore, generate_holder_id,
};

/// Pause between convergence attempts.
const RETRY_PAUSE_SECS: u64 = 2;

/// Engine driving plan and apply against a state store and adapters.
pub struct Engine<'a, S: StateStore> {
    /// Declared topology.
    manifest: &'a Manifest,
    /// State backend.
    store: &'a S,
    /// Adapter registry.
    registry: AdapterRegistry,
    /// Declaration hasher.
    hasher: DeclHasher,
    /// Diff engine.
    diff_engine: DiffEngine,
    /// Manifest validator.
    validator: ManifestValidator,
    /// Maximum convergence attempts.
    max_attempts: u32,
}

/// Result of an apply, reconcile, or destroy run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Which verb produced this outcome.
    pub operation: RunOperation,
    /// The last plan that was executed (empty when already converged).
    pub plan: Plan,
    /// Per-operation results of the last round.
    pub report: RunReport,
    /// Number of rounds that executed operations.
    pub attempts: u32,
    /// Whether the state matches the declarations afterwards.
    pub converged: bool,
}

/// Report of drift between declarations, remembered state, and the backend.
#[derive(Debug, serde::Serialize)]
pub struct DriftReport {
    /// Remembered resources the backend no longer has.
    pub missing: Vec<ResourceId>,
    /// Remembered resources whose live attributes differ from the record.
    pub changed: Vec<ResourceId>,
    /// Declaration changes not yet applied (creates, updates, deletes).
    pub pending_ops: usize,
    /// Number of remembered records examined.
    pub total_records: usize,
}

impl<'a, S: StateStore> Engine<'a, S> {
    /// Creates an engine over a manifest, a state store, and adapters.
    #[must_use]
    pub const fn new(manifest: &'a Manifest, store: &'a S, registry: AdapterRegistry) -> Self {
        Self {
            manifest,
            store,
            registry,
            hasher: DeclHasher::new(),
            diff_engine: DiffEngine::new(),
            validator: ManifestValidator::new(),
            max_attempts: manifest.run.max_attempts,
        }
    }

    /// Overrides the attempt budget for `reconcile`.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Validates the manifest and builds its dependency graph.
    ///
    /// # Errors
    ///
    /// Returns an error when validation fails, a reference targets an
    /// undeclared resource, or the declarations form a cycle.
    pub fn graph(&self) -> Result<DependencyGraph> {
        self.validator.validate(self.manifest)?;
        DependencyGraph::build(&self.manifest.resources)
    }

    /// Computes the plan for converging remembered state to the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error when validation or graph construction fails, or the
    /// state store cannot be read.
    pub async fn plan(&self) -> Result<Plan> {
        let graph = self.graph()?;
        let state = self.store.load().await?;
        let manifest_hash = self.hasher.hash_manifest(self.manifest);

        let diff = self.diff_engine.compute_diff(self.manifest, state.as_ref());
        debug!(
            "Diff: {} creates, {} updates, {} deletes, {} unchanged",
            diff.creates, diff.updates, diff.deletes, diff.unchanged
        );

        Ok(Plan::from_diff(
            &diff,
            self.manifest,
            &graph,
            state.as_ref(),
            &manifest_hash,
        ))
    }

    /// Plans and applies one round of changes.
    ///
    /// # Errors
    ///
    /// Returns an error when planning fails, the lock is held elsewhere, or
    /// the state store fails mid-run. Adapter failures do not error; they
    /// surface as failed and blocked operations in the outcome.
    pub async fn apply(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        info!("Applying topology for {}", self.manifest.qualified_name());

        let plan = self.plan().await?;
        if plan.is_empty() {
            info!("No changes required; state is converged");
            return Ok(RunOutcome::already_converged(RunOperation::Apply, plan));
        }

        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let outcome = self.run_plan(&plan, RunOperation::Apply, cancel).await;
        self.release(&lock).await;

        let report = outcome?;
        let converged = report.success;
        Ok(RunOutcome {
            operation: RunOperation::Apply,
            plan,
            report,
            attempts: 1,
            converged,
        })
    }

    /// Repeats plan and apply until converged or out of attempts.
    ///
    /// Convergence means a fresh diff against remembered state is empty.
    /// Failed and blocked operations are retried in the next round; records
    /// written in earlier rounds are not re-applied.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::MaxAttemptsExceeded`] when operations are still
    /// pending after the final attempt, besides the planning and state
    /// errors `apply` can return.
    pub async fn reconcile(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        info!(
            "Reconciling {} (up to {} attempts)",
            self.manifest.qualified_name(),
            self.max_attempts
        );

        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let outcome = self.reconcile_locked(cancel).await;
        self.release(&lock).await;
        outcome
    }

    async fn reconcile_locked(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        let mut last: Option<(Plan, RunReport)> = None;

        for attempt in 1..=self.max_attempts {
            debug!("Convergence attempt {attempt}/{}", self.max_attempts);

            let plan = self.plan().await?;
            if plan.is_empty() {
                let rounds = attempt - 1;
                info!("State converged after {rounds} round(s)");
                return Ok(match last {
                    Some((plan, report)) => RunOutcome {
                        operation: RunOperation::Reconcile,
                        plan,
                        report,
                        attempts: rounds,
                        converged: true,
                    },
                    None => RunOutcome::already_converged(RunOperation::Reconcile, plan),
                });
            }

            let report = self.run_plan(&plan, RunOperation::Reconcile, cancel).await?;

            if report.success {
                // Re-plan to confirm convergence with a clean diff
                last = Some((plan, report));
                continue;
            }

            if cancel.is_cancelled() {
                warn!(
                    "Convergence cancelled with {} operation(s) outstanding",
                    report.pending()
                );
                return Ok(RunOutcome {
                    operation: RunOperation::Reconcile,
                    plan,
                    report,
                    attempts: attempt,
                    converged: false,
                });
            }

            warn!(
                "{} operation(s) did not apply on attempt {attempt}",
                report.pending()
            );
            last = Some((plan, report));

            if attempt < self.max_attempts {
                tokio::time::sleep(Duration::from_secs(RETRY_PAUSE_SECS)).await;
            }
        }

        match last {
            // The final round applied cleanly but the confirming re-plan
            // never ran; the records are in step with the declarations.
            Some((plan, report)) if report.success => Ok(RunOutcome {
                operation: RunOperation::Reconcile,
                plan,
                report,
                attempts: self.max_attempts,
                converged: true,
            }),
            Some((_, report)) => Err(ApplyError::MaxAttemptsExceeded {
                attempts: self.max_attempts,
                pending: report.pending(),
            }
            .into()),
            None => {
                let manifest_hash = self.hasher.hash_manifest(self.manifest);
                Ok(RunOutcome::already_converged(
                    RunOperation::Reconcile,
                    Plan::empty(&manifest_hash),
                ))
            }
        }
    }

    /// Deletes every remembered resource, dependents before dependencies.
    ///
    /// Works entirely from the state store, so a broken manifest does not
    /// prevent tearing a topology down.
    ///
    /// # Errors
    ///
    /// Returns an error when the state store fails or is locked elsewhere.
    pub async fn destroy(&self, cancel: &CancelToken) -> Result<RunOutcome> {
        let manifest_hash = self.hasher.hash_manifest(self.manifest);

        let Some(state) = self.store.load().await? else {
            info!("No state found; nothing to destroy");
            return Ok(RunOutcome::already_converged(
                RunOperation::Destroy,
                Plan::empty(&manifest_hash),
            ));
        };
        if state.record_count() == 0 {
            info!("State holds no records; nothing to destroy");
            return Ok(RunOutcome::already_converged(
                RunOperation::Destroy,
                Plan::empty(&manifest_hash),
            ));
        }

        let plan = Plan::destroy_from_state(&state, &manifest_hash);
        info!("Destroying {} resource(s)", plan.op_count());

        let lock = self.store.acquire_lock(&generate_holder_id()).await?;
        let outcome = self.run_plan(&plan, RunOperation::Destroy, cancel).await;
        self.release(&lock).await;

        let report = outcome?;
        let converged = report.success;
        Ok(RunOutcome {
            operation: RunOperation::Destroy,
            plan,
            report,
            attempts: 1,
            converged,
        })
    }

    /// Compares declarations, remembered records, and live backend state.
    ///
    /// Reads every remembered resource through its adapter; a record the
    /// backend no longer has is reported missing, and live attributes that
    /// differ from the record on any remembered key are reported changed.
    ///
    /// # Errors
    ///
    /// Returns an error when the state store or an adapter read fails.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking drift for {}", self.manifest.qualified_name());

        let state = self.store.load().await?;
        let diff = self.diff_engine.compute_diff(self.manifest, state.as_ref());

        let mut missing = Vec::new();
        let mut changed = Vec::new();

        if let Some(state) = &state {
            for record in state.records.values() {
                let adapter = self.registry.adapter_for(&record.id.kind)?;
                match adapter.read(&record.id).await? {
                    None => {
                        debug!("Remembered resource {} is gone from the backend", record.id);
                        missing.push(record.id.clone());
                    }
                    Some(live) => {
                        let moved = record
                            .attributes
                            .iter()
                            .any(|(key, value)| live.get(key) != Some(value));
                        if moved {
                            debug!("Live attributes of {} differ from the record", record.id);
                            changed.push(record.id.clone());
                        }
                    }
                }
            }
        }

        Ok(DriftReport {
            missing,
            changed,
            pending_ops: diff.total_changes(),
            total_records: state.as_ref().map_or(0, EngineState::record_count),
        })
    }

    /// Executes a plan and persists the outcome.
    ///
    /// Loads (or initializes) the state document, runs the executor with the
    /// manifest's concurrency setting, appends a history entry, and saves.
    async fn run_plan(
        &self,
        plan: &Plan,
        operation: RunOperation,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let mut state = self.store.load().await?.unwrap_or_else(|| {
            EngineState::new(
                &self.manifest.project.name,
                &self.manifest.project.environment,
            )
        });

        // Record write-through needs a state document to exist
        if !self.store.exists().await? {
            self.store.save(&state).await?;
        }

        let executor = PlanExecutor::new(self.registry.clone(), self.manifest.run.concurrency);
        let report = executor.execute(plan, self.store, &mut state, cancel).await?;

        let touched: Vec<String> = plan.ops.iter().map(|op| op.id.to_string()).collect();
        let entry = if report.success {
            RunHistoryEntry::new(operation, &plan.manifest_hash, touched)
        } else {
            RunHistoryEntry::failed(operation, &plan.manifest_hash, touched, &report.to_string())
        };
        state.add_history(entry);

        if report.success {
            state.manifest_hash.clone_from(&plan.manifest_hash);
        }

        self.store.save(&state).await?;
        Ok(report)
    }

    /// Releases a lock, downgrading failures to a warning.
    async fn release(&self, lock: &LockInfo) {
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock: {e}");
        }
    }
}

impl RunOutcome {
    /// Outcome for a run that found nothing to do.
    fn already_converged(operation: RunOperation, plan: Plan) -> Self {
        let report = RunReport::empty(plan.unchanged.clone());
        Self {
            operation,
            plan,
            report,
            attempts: 0,
            converged: true,
        }
    }
}

impl DriftReport {
    /// Whether any drift was found.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.missing.is_empty() || !self.changed.is_empty() || self.pending_ops > 0
    }

    /// Whether backend, records, and declarations all agree.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        !self.has_drift()
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.attempts == 0 {
            return write!(f, "{}: no changes required", self.operation);
        }
        if self.converged {
            write!(
                f,
                "{} converged after {} attempt(s): {}",
                self.operation, self.attempts, self.report
            )
        } else {
            write!(
                f,
                "{} did not converge after {} attempt(s): {}",
                self.operation, self.attempts, self.report
            )
        }
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.has_drift() {
            writeln!(f, "Drift detected:")?;
            for id in &self.missing {
                writeln!(f, "  - {id}: missing from backend")?;
            }
            for id in &self.changed {
                writeln!(f, "  - {id}: live attributes differ from the record")?;
            }
            if self.pending_ops > 0 {
                writeln!(
                    f,
                    "  {} declaration change(s) not yet applied",
                    self.pending_ops
                )?;
            }
            Ok(())
        } else {
            write!(f, "No drift detected; state is converged")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, ResourceAdapter};
    use crate::config::{
        ProjectConfig, ProviderConfig, ResourceDecl, RunConfig, StateConfig,
    };
    use crate::error::{GraphError, TrellisError};
    use crate::state::LocalStateStore;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn decl(kind: &str, name: &str, attrs: &[(&str, Value)]) -> ResourceDecl {
        ResourceDecl {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            depends_on: vec![],
        }
    }

    fn manifest(resources: Vec<ResourceDecl>) -> Manifest {
        Manifest {
            project: ProjectConfig {
                name: String::from("edge-lab"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            run: RunConfig::default(),
            resources,
        }
    }

    fn three_tier() -> Manifest {
        manifest(vec![
            decl("gateway", "edge", &[("cidr", json!("10.0.0.0/16"))]),
            decl(
                "segment",
                "app",
                &[("gateway", json!("${gateway.edge.id}")), ("vlan", json!(100))],
            ),
            decl("vm", "web-0", &[("segment", json!("${segment.app.id}"))]),
        ])
    }

    fn test_store() -> (LocalStateStore, TempDir) {
        let temp = TempDir::new().expect("temp dir failed");
        (LocalStateStore::with_base_dir(temp.path()), temp)
    }

    fn memory_engine<'a>(
        manifest: &'a Manifest,
        store: &'a LocalStateStore,
        adapter: &Arc<MemoryAdapter>,
    ) -> Engine<'a, LocalStateStore> {
        Engine::new(
            manifest,
            store,
            AdapterRegistry::with_fallback(Arc::clone(adapter) as Arc<dyn ResourceAdapter>),
        )
    }

    #[tokio::test]
    async fn test_apply_then_replan_is_empty() {
        let manifest = three_tier();
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        let outcome = engine.apply(&CancelToken::new()).await.expect("apply failed");
        assert!(outcome.converged);
        assert_eq!(outcome.report.applied, 3);
        assert_eq!(adapter.resource_count().await, 3);

        // Unchanged declarations plan to nothing
        let plan = engine.plan().await.expect("plan failed");
        assert!(plan.is_empty());
        assert_eq!(plan.unchanged.len(), 3);
    }

    #[tokio::test]
    async fn test_reconcile_converges_and_records_history() {
        let manifest = three_tier();
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        let outcome = engine
            .reconcile(&CancelToken::new())
            .await
            .expect("reconcile failed");
        assert!(outcome.converged);
        assert_eq!(outcome.attempts, 1);

        let state = store
            .load()
            .await
            .expect("load failed")
            .expect("state missing");
        assert_eq!(state.record_count(), 3);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].operation, RunOperation::Reconcile);
        assert!(state.history[0].success);
        assert!(!state.manifest_hash.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_removes_all_records() {
        let manifest = three_tier();
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        engine.apply(&CancelToken::new()).await.expect("apply failed");
        let outcome = engine
            .destroy(&CancelToken::new())
            .await
            .expect("destroy failed");

        assert!(outcome.converged);
        assert_eq!(outcome.report.applied, 3);
        assert_eq!(adapter.resource_count().await, 0);

        let state = store
            .load()
            .await
            .expect("load failed")
            .expect("state missing");
        assert_eq!(state.record_count(), 0);
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_planning() {
        let manifest = manifest(vec![
            decl("segment", "a", &[("peer", json!("${segment.b.id}"))]),
            decl("segment", "b", &[("peer", json!("${segment.a.id}"))]),
        ]);
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        let result = engine.plan().await;
        assert!(matches!(
            result,
            Err(TrellisError::Graph(GraphError::Cycle { .. }))
        ));
        assert_eq!(adapter.resource_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_reference_rejected_before_planning() {
        let manifest = manifest(vec![decl(
            "vm",
            "web-0",
            &[("segment", json!("${segment.missing.id}"))],
        )]);
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        let result = engine.plan().await;
        assert!(matches!(
            result,
            Err(TrellisError::Graph(GraphError::UnresolvedReference { .. }))
        ));
    }

    #[tokio::test]
    async fn test_drift_reports_resource_deleted_behind_our_back() {
        let manifest = three_tier();
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        engine.apply(&CancelToken::new()).await.expect("apply failed");

        let clean = engine.check_drift().await.expect("drift check failed");
        assert!(clean.is_converged());

        adapter
            .delete(&ResourceId::new("vm", "web-0"))
            .await
            .expect("backend delete failed");

        let report = engine.check_drift().await.expect("drift check failed");
        assert!(report.has_drift());
        assert_eq!(report.missing, vec![ResourceId::new("vm", "web-0")]);
        assert!(report.changed.is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_apply() {
        let manifest = three_tier();
        let (store, _temp) = test_store();
        let adapter = Arc::new(MemoryAdapter::new());
        let engine = memory_engine(&manifest, &store, &adapter);

        engine.apply(&CancelToken::new()).await.expect("apply failed");
        assert!(!store.is_locked().await.expect("lock check failed"));
    }
}
