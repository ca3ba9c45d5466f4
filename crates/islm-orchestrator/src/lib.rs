#![forbid(unsafe_code)]

pub mod gate;

use std::collections::BTreeMap;
use std::time::Duration;

use islm_core::{
    compile_migration, decode_steps, BodyReport, CompiledMigration, CompiledStep,
    ExceptionDiagnostic, GovernanceRecord, GovernanceRecordInput, InstalledRoutine, IslmError,
    MigrationDefinition, MigrationRegistry, RegistrationError, RoutineKind, StepMode,
    TransitionStatus, DEFAULT_ACTOR,
};
use islm_store_core::{LifecycleStore, LockTimeout, StateConflict};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use gate::TestGate;

pub const DEFAULT_NAMESPACE: &str = "dv";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("regression tests have not passed for namespace `{namespace}`. Migration not allowed.")]
    GateClosed { namespace: String },
    #[error("cannot {action} {version_id}: {reason}")]
    OrderingViolation {
        version_id: String,
        action: &'static str,
        reason: String,
    },
    #[error("{version_id} is not loaded; run load before migrate")]
    NotLoaded { version_id: String },
    #[error("{version_id} is {state}; only MIGRATED or FAILED versions can be rolled back")]
    NotMigrated { version_id: String, state: String },
    #[error("unknown migration version `{0}`")]
    UnknownVersion(String),
    #[error("routine {routine} is installed with checksum {installed} but compiles to {expected}")]
    ChecksumDrift {
        routine: String,
        installed: String,
        expected: String,
    },
    #[error(transparent)]
    StateConflict(#[from] StateConflict),
    #[error(transparent)]
    LockTimeout(#[from] LockTimeout),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error(transparent)]
    Compile(#[from] IslmError),
    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoadOutcome {
    Loaded {
        version_id: String,
        record: Option<GovernanceRecord>,
    },
    AlreadyLoaded {
        version_id: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MigrateOutcome {
    Migrated {
        version_id: String,
        record: GovernanceRecord,
        report: BodyReport,
    },
    AlreadyApplied {
        version_id: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollbackOutcome {
    RolledBack {
        version_id: String,
        record: GovernanceRecord,
        report: BodyReport,
    },
    AlreadyRolledBack {
        version_id: String,
    },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VersionStatus {
    pub version_id: String,
    pub state: TransitionStatus,
    /// Result of the status probe: 1 when the version's schema change is present.
    pub status: u8,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub namespace: String,
    pub actor: String,
    pub lock_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            actor: DEFAULT_ACTOR.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

pub struct Orchestrator<'a> {
    store: &'a dyn LifecycleStore,
    registry: &'a MigrationRegistry,
    config: OrchestratorConfig,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(
        store: &'a dyn LifecycleStore,
        registry: &'a MigrationRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Installs the version's routines and records `NONE -> SQLLOADED` once.
    ///
    /// # Errors
    /// Returns [`LifecycleError::ChecksumDrift`] when different routines are
    /// already installed under the same names.
    pub fn load(&self, version_id: &str) -> Result<LoadOutcome, LifecycleError> {
        self.store.migrate()?;
        let definition = self.definition(version_id)?;
        let compiled = self.compile(definition)?;
        self.verify_installed(&compiled)?;

        let record = self.transition(
            definition,
            TransitionStatus::None,
            TransitionStatus::SqlLoaded,
            "migration routines installed",
            json!({ "checksum": compiled.checksum()? }),
        );
        let receipt = self.store.install_routines(&compiled, &record)?;

        if receipt.installed {
            info!(namespace = %self.config.namespace, version_id, "migration loaded");
            Ok(LoadOutcome::Loaded {
                version_id: version_id.to_string(),
                record: receipt.record,
            })
        } else {
            debug!(version_id, "migration already loaded");
            Ok(LoadOutcome::AlreadyLoaded {
                version_id: version_id.to_string(),
            })
        }
    }

    /// Loads every registered version in order.
    ///
    /// # Errors
    /// Stops at the first version that fails to load.
    pub fn load_all(&self) -> Result<Vec<LoadOutcome>, LifecycleError> {
        self.registry
            .list()
            .iter()
            .map(|definition| self.load(&definition.version_id()))
            .collect()
    }

    /// Applies one version.
    ///
    /// The gate is consulted first. The transactional part of the installed
    /// apply routine and the ledger record commit together; deferred steps run
    /// afterwards under their advisory locks, and a failure there records
    /// `FAILED` because the committed part cannot be undone automatically.
    ///
    /// # Errors
    /// Returns [`LifecycleError::GateClosed`], [`LifecycleError::NotLoaded`],
    /// [`LifecycleError::OrderingViolation`], [`LifecycleError::ChecksumDrift`]
    /// or an execution error. Only a deferred step failure changes the ledger.
    #[allow(clippy::too_many_lines)]
    pub fn migrate(&self, version_id: &str) -> Result<MigrateOutcome, LifecycleError> {
        self.store.migrate()?;

        let namespace = &self.config.namespace;
        let gate = TestGate::new(self.store, &self.config.actor);
        if !gate.check_gate(namespace)? {
            warn!(%namespace, version_id, "migration blocked by the test gate");
            return Err(LifecycleError::GateClosed {
                namespace: namespace.clone(),
            });
        }

        let definition = self.definition(version_id)?;
        let from = self.state_of(version_id)?;
        match from {
            TransitionStatus::None => {
                return Err(LifecycleError::NotLoaded {
                    version_id: version_id.to_string(),
                })
            }
            TransitionStatus::Migrated => {
                info!(version_id, "migration already applied");
                return Ok(MigrateOutcome::AlreadyApplied {
                    version_id: version_id.to_string(),
                });
            }
            TransitionStatus::SqlLoaded | TransitionStatus::RolledBack | TransitionStatus::Failed => {}
        }

        for predecessor in self.registry.predecessors(version_id) {
            let predecessor_id = predecessor.version_id();
            let state = self.state_of(&predecessor_id)?;
            if state != TransitionStatus::Migrated {
                return Err(LifecycleError::OrderingViolation {
                    version_id: version_id.to_string(),
                    action: "migrate",
                    reason: format!(
                        "earlier version {predecessor_id} is {}, expected MIGRATED",
                        state.as_str()
                    ),
                });
            }
        }

        let compiled = self.compile(definition)?;
        let installed = self.verify_installed(&compiled)?;
        let steps = routine_steps(&installed, RoutineKind::Apply, version_id)?;
        let (transactional, deferred): (Vec<CompiledStep>, Vec<CompiledStep>) =
            steps.into_iter().partition(|step| !step.is_deferred());

        let checksum = compiled.checksum()?;
        let migrated = self.transition(
            definition,
            from,
            TransitionStatus::Migrated,
            "migration applied",
            json!({ "checksum": checksum, "steps": transactional.len() + deferred.len() }),
        );

        let body = self
            .store
            .execute_body(
                &compiled.routines.migrate,
                &transactional,
                &migrated,
                deferred.is_empty(),
            )
            .map_err(conflict_or_execution);
        let (mut report, committed) = match body {
            Ok(body) => body,
            Err(LifecycleError::StateConflict(conflict))
                if conflict.actual == TransitionStatus::Migrated =>
            {
                info!(version_id, "migration was applied by another process");
                return Ok(MigrateOutcome::AlreadyApplied {
                    version_id: version_id.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let record = if let Some(record) = committed {
            record
        } else {
            match self.run_deferred(&deferred, &mut report) {
                Ok(()) => {
                    let mut migrated = migrated;
                    migrated.transition_result = json!({
                        "checksum": checksum,
                        "steps": transactional.len() + deferred.len(),
                        "report": report.to_json(),
                    });
                    self.store
                        .append_governance(&migrated)
                        .map_err(conflict_or_execution)?
                }
                Err((step, err)) => {
                    self.record_partial_failure(definition, &compiled, from, &step, &err, &report)?;
                    return Err(err);
                }
            }
        };

        info!(
            %namespace,
            version_id,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "migration applied"
        );
        Ok(MigrateOutcome::Migrated {
            version_id: version_id.to_string(),
            record,
            report,
        })
    }

    /// Migrates every pending version in order, stopping at the first error.
    ///
    /// # Errors
    /// Propagates the first [`Orchestrator::migrate`] failure.
    pub fn migrate_pending(&self) -> Result<Vec<MigrateOutcome>, LifecycleError> {
        let mut states = self.states()?;
        let mut outcomes = Vec::new();
        while let Some(definition) = self.registry.next_pending(&states) {
            let version_id = definition.version_id();
            outcomes.push(self.migrate(&version_id)?);
            states.insert(version_id, TransitionStatus::Migrated);
        }
        Ok(outcomes)
    }

    /// Runs the installed rollback routine. Never invoked automatically.
    ///
    /// # Errors
    /// Returns [`LifecycleError::NotMigrated`] from `NONE`/`SQLLOADED` and
    /// [`LifecycleError::OrderingViolation`] while a later version is
    /// `MIGRATED`.
    pub fn rollback(&self, version_id: &str) -> Result<RollbackOutcome, LifecycleError> {
        self.store.migrate()?;
        let definition = self.definition(version_id)?;
        let from = self.state_of(version_id)?;
        match from {
            TransitionStatus::RolledBack => {
                info!(version_id, "migration already rolled back");
                return Ok(RollbackOutcome::AlreadyRolledBack {
                    version_id: version_id.to_string(),
                });
            }
            TransitionStatus::None | TransitionStatus::SqlLoaded => {
                return Err(LifecycleError::NotMigrated {
                    version_id: version_id.to_string(),
                    state: from.as_str().to_string(),
                });
            }
            TransitionStatus::Migrated | TransitionStatus::Failed => {}
        }

        for successor in self.registry.successors(version_id) {
            let successor_id = successor.version_id();
            if self.state_of(&successor_id)? == TransitionStatus::Migrated {
                return Err(LifecycleError::OrderingViolation {
                    version_id: version_id.to_string(),
                    action: "roll back",
                    reason: format!("later version {successor_id} is still MIGRATED"),
                });
            }
        }

        let compiled = self.compile(definition)?;
        let installed = self.verify_installed(&compiled)?;
        let steps = routine_steps(&installed, RoutineKind::Rollback, version_id)?;
        let rolled_back = self.transition(
            definition,
            from,
            TransitionStatus::RolledBack,
            "migration rolled back",
            json!({ "checksum": compiled.checksum()?, "steps": steps.len() }),
        );

        let body = self
            .store
            .execute_body(&compiled.routines.undo, &steps, &rolled_back, true)
            .map_err(conflict_or_execution);
        let (report, committed) = match body {
            Ok(body) => body,
            Err(LifecycleError::StateConflict(conflict))
                if conflict.actual == TransitionStatus::RolledBack =>
            {
                info!(version_id, "migration was rolled back by another process");
                return Ok(RollbackOutcome::AlreadyRolledBack {
                    version_id: version_id.to_string(),
                });
            }
            Err(err) => return Err(err),
        };
        let record = committed.ok_or_else(|| {
            LifecycleError::Execution(anyhow::anyhow!("rollback record was not appended"))
        })?;

        info!(namespace = %self.config.namespace, version_id, "migration rolled back");
        Ok(RollbackOutcome::RolledBack {
            version_id: version_id.to_string(),
            record,
            report,
        })
    }

    /// Evaluates the status probe read-only. Uses the installed status routine
    /// when present so the answer matches what `load` installed.
    ///
    /// # Errors
    /// Returns an error when the version is unknown or the probe fails.
    pub fn status(&self, version_id: &str) -> Result<VersionStatus, LifecycleError> {
        self.store.migrate()?;
        let definition = self.definition(version_id)?;
        let state = self.state_of(version_id)?;

        let installed = self.store.installed_routines(version_id)?;
        let query = match installed
            .iter()
            .find(|routine| routine.kind == RoutineKind::Status)
            .and_then(|routine| routine.body.get("query"))
            .and_then(Value::as_str)
        {
            Some(query) => query.to_string(),
            None => self.compile(definition)?.status_query,
        };

        let applied = self.store.evaluate_probe(&query)?;
        Ok(VersionStatus {
            version_id: version_id.to_string(),
            state,
            status: u8::from(applied),
        })
    }

    /// # Errors
    /// Stops at the first version whose status cannot be evaluated.
    pub fn status_all(&self) -> Result<Vec<VersionStatus>, LifecycleError> {
        self.registry
            .list()
            .iter()
            .map(|definition| self.status(&definition.version_id()))
            .collect()
    }

    /// # Errors
    /// Returns an error when the ledger cannot be read.
    pub fn history(
        &self,
        version_id: Option<&str>,
    ) -> Result<Vec<GovernanceRecord>, LifecycleError> {
        self.store.migrate()?;
        Ok(self
            .store
            .governance_history(&self.config.namespace, version_id)?)
    }

    fn definition(&self, version_id: &str) -> Result<&'a MigrationDefinition, LifecycleError> {
        self.registry
            .get(version_id)
            .ok_or_else(|| LifecycleError::UnknownVersion(version_id.to_string()))
    }

    fn compile(&self, definition: &MigrationDefinition) -> Result<CompiledMigration, LifecycleError> {
        Ok(compile_migration(definition, self.store.dialect())?)
    }

    fn state_of(&self, version_id: &str) -> Result<TransitionStatus, LifecycleError> {
        Ok(self
            .store
            .current_state(&self.config.namespace, version_id)?)
    }

    fn states(&self) -> Result<BTreeMap<String, TransitionStatus>, LifecycleError> {
        self.store.migrate()?;
        self.registry
            .list()
            .iter()
            .map(|definition| {
                let version_id = definition.version_id();
                let state = self.state_of(&version_id)?;
                Ok((version_id, state))
            })
            .collect()
    }

    fn transition(
        &self,
        definition: &MigrationDefinition,
        from: TransitionStatus,
        to: TransitionStatus,
        reason: &str,
        result: Value,
    ) -> GovernanceRecordInput {
        GovernanceRecordInput::for_transition(
            &self.config.namespace,
            &definition.version,
            from,
            to,
            reason,
            result,
            &self.config.actor,
        )
    }

    fn verify_installed(
        &self,
        compiled: &CompiledMigration,
    ) -> Result<Vec<InstalledRoutine>, LifecycleError> {
        let installed = self.store.installed_routines(&compiled.version_id())?;
        let expected = compiled.routine_bodies()?;

        for routine in &installed {
            if let Some(body) = expected.iter().find(|body| body.name == routine.routine_name) {
                if body.checksum != routine.checksum {
                    return Err(LifecycleError::ChecksumDrift {
                        routine: routine.routine_name.clone(),
                        installed: routine.checksum.clone(),
                        expected: body.checksum.clone(),
                    });
                }
            }
        }
        Ok(installed)
    }

    fn run_deferred(
        &self,
        steps: &[CompiledStep],
        report: &mut BodyReport,
    ) -> Result<(), (CompiledStep, LifecycleError)> {
        for step in steps {
            let StepMode::Deferred { lock_operation } = &step.mode else {
                continue;
            };

            let lease = self
                .store
                .acquire_advisory_lock(lock_operation, self.config.lock_timeout)
                .map_err(|err| (step.clone(), lock_error(err)))?;

            let outcome = self.store.execute_deferred(step);

            if let Err(err) = self.store.release_advisory_lock(&lease) {
                warn!(operation = %lock_operation, error = %err, "failed to release advisory lock");
            }

            match outcome {
                Ok(partial) => {
                    report.executed.extend(partial.executed);
                    report.skipped.extend(partial.skipped);
                    report.notices.extend(partial.notices);
                }
                Err(err) => return Err((step.clone(), LifecycleError::Execution(err))),
            }
        }
        Ok(())
    }

    fn record_partial_failure(
        &self,
        definition: &MigrationDefinition,
        compiled: &CompiledMigration,
        from: TransitionStatus,
        step: &CompiledStep,
        err: &LifecycleError,
        report: &BodyReport,
    ) -> Result<(), LifecycleError> {
        warn!(
            namespace = %self.config.namespace,
            version_id = %compiled.version_id(),
            step = %step.label,
            error = %err,
            "deferred step failed after commit; recording FAILED"
        );

        let diagnostic = ExceptionDiagnostic {
            namespace: self.config.namespace.clone(),
            migrate_version: compiled.version_id(),
            routine: compiled.routines.migrate.clone(),
            code: match err {
                LifecycleError::LockTimeout(_) => "ISLM_LOCK_TIMEOUT",
                _ => "ISLM_DEFERRED_STEP",
            }
            .to_string(),
            message: err.to_string(),
            detail: None,
            hint: Some("the transactional part committed; fix the cause and migrate again".to_string()),
            context: Some(format!("deferred step {}\n{}", step.label, step.sql)),
            created_by: self.config.actor.clone(),
        };
        self.store.record_diagnostic(&diagnostic)?;

        let failed = self.transition(
            definition,
            from,
            TransitionStatus::Failed,
            "deferred step failed after commit",
            json!({
                "step": step.label,
                "error": err.to_string(),
                "report": report.to_json(),
            }),
        );
        self.store
            .append_governance(&failed)
            .map_err(conflict_or_execution)?;
        Ok(())
    }
}

fn routine_steps(
    installed: &[InstalledRoutine],
    kind: RoutineKind,
    version_id: &str,
) -> Result<Vec<CompiledStep>, LifecycleError> {
    let routine = installed
        .iter()
        .find(|routine| routine.kind == kind)
        .ok_or_else(|| LifecycleError::NotLoaded {
            version_id: version_id.to_string(),
        })?;
    Ok(decode_steps(&routine.body)?)
}

fn conflict_or_execution(err: anyhow::Error) -> LifecycleError {
    match err.downcast::<StateConflict>() {
        Ok(conflict) => LifecycleError::StateConflict(conflict),
        Err(err) => LifecycleError::Execution(err),
    }
}

fn lock_error(err: anyhow::Error) -> LifecycleError {
    match err.downcast::<LockTimeout>() {
        Ok(timeout) => LifecycleError::LockTimeout(timeout),
        Err(err) => LifecycleError::Execution(err),
    }
}
