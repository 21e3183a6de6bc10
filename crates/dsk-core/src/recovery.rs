//! Resume and rollback of an interrupted apply.

use crate::apply::{check_content, plan_root, ApplyReport, Engine, Run};
use crate::progress::ProgressEvent;
use crate::CoreError;
use dsk_schema::{validate_plan, Digest64, IntegrityError, Plan, StepKind};
use dsk_store::{
    live_path, AuditEntry, AuditLog, AuditOutcome, EntryKind, InstalledState, JobJournal,
    JournalWriter, StateLayout, TxnAction, TxnJournal, TxnWriter,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    pub plan_digest64: Digest64,
    /// Files and records put back from their backups.
    pub restored: u32,
    /// Files, swapped roots and records the apply had created.
    pub removed: u32,
    pub state_restored: bool,
}

impl<'a> Engine<'a> {
    /// Load the unfinished journal for `plan`, or explain why there is none.
    fn pending_journals(
        &self,
        plan: &Plan,
        layout: &StateLayout,
    ) -> Result<(JobJournal, TxnJournal), CoreError> {
        let journal = JobJournal::load(self.fs, &layout.journal_path())?.ok_or_else(|| {
            CoreError::NothingToResume(format!("no journal for '{}'", plan.product_id))
        })?;
        let status = journal.status();
        if status.is_finished() {
            return Err(CoreError::NothingToResume(format!(
                "last apply of '{}' is already {status:?}",
                plan.product_id
            )));
        }
        if journal.plan_digest64 != plan.plan_digest64 {
            return Err(IntegrityError::JournalPlanMismatch {
                journal: journal.plan_digest64,
                plan: plan.plan_digest64,
            }
            .into());
        }
        let txn = TxnJournal::load(self.fs, &layout.txn_path())?
            .unwrap_or_else(|| TxnJournal::new(plan.plan_digest64));
        if txn.plan_digest64 != plan.plan_digest64 {
            return Err(IntegrityError::JournalPlanMismatch {
                journal: txn.plan_digest64,
                plan: plan.plan_digest64,
            }
            .into());
        }
        Ok((journal, txn))
    }

    /// Continue an interrupted apply from its last durably completed step.
    ///
    /// Completed stage and verify steps whose file has not been committed are
    /// re-checked against the staging area and redone if it no longer holds
    /// the expected bytes. The result is the same installed payload, state
    /// and audit entry an uninterrupted apply would have produced.
    pub fn resume(&self, plan: &Plan) -> Result<ApplyReport, CoreError> {
        validate_plan(plan)?;
        let (layout, install_base) = self.paths(plan);
        let _lock = self.lock(plan, &layout)?;
        let (journal, txn) = self.pending_journals(plan, &layout)?;
        layout.initialize(self.fs)?;

        let mut completed = journal.completed_steps();
        let stale = self.stale_staged_steps(plan, &layout, &txn, &completed);
        for step_id in &stale {
            warn!("staged content for step {step_id} is gone or changed; redoing it");
            completed.remove(step_id);
        }
        info!(
            "resuming plan {} with {} of {} steps completed",
            plan.plan_digest64,
            completed.len(),
            plan.ordered_steps.len()
        );

        let dry_run = journal.dry_run;
        let run = Run {
            plan,
            layout: layout.clone(),
            install_base,
            journal: JournalWriter::resume(self.fs, layout.journal_path(), journal),
            txn: TxnWriter::resume(self.fs, layout.txn_path(), txn),
            dry_run,
            resumed: true,
        };
        self.run(run, &completed)
    }

    /// Per-artifact steps recorded as completed whose staged file is no longer
    /// valid and whose op has not been committed yet.
    fn stale_staged_steps(
        &self,
        plan: &Plan,
        layout: &StateLayout,
        txn: &TxnJournal,
        completed: &BTreeSet<u32>,
    ) -> BTreeSet<u32> {
        let mut stale = BTreeSet::new();
        for step in plan
            .ordered_steps
            .iter()
            .filter(|s| s.kind.is_per_artifact() && completed.contains(&s.step_id))
        {
            let Some((index, op)) = plan.op_for_step(step) else {
                continue;
            };
            if txn.has_op(index as u32) || txn.has_swapped_root(op.target_root_id) {
                continue;
            }
            let staged = layout.staged_path(op.target_root_id, &op.to);
            let valid = self
                .fs
                .read_file_bytes(&staged)
                .ok()
                .is_some_and(|bytes| check_content(op, &bytes).is_ok());
            if !valid {
                stale.insert(step.step_id);
                // Verification depends on staging, so both go together.
                if step.kind == StepKind::StageArtifact {
                    if let Some(verify) = plan.ordered_steps.iter().find(|s| {
                        s.kind == StepKind::VerifyHashes
                            && s.component_id == step.component_id
                            && s.artifact_id == step.artifact_id
                            && s.target_root_id == step.target_root_id
                    }) {
                        stale.insert(verify.step_id);
                    }
                }
            }
        }
        debug!("{} staged steps need redoing", stale.len());
        stale
    }

    /// Undo an interrupted apply.
    ///
    /// Walks the transaction journal backwards: replaced and removed files
    /// come back from `backup/`, files and roots the apply created are
    /// deleted, and a replaced registration record is put back. The
    /// installed-state snapshot is restored too if the apply got as far as
    /// replacing it.
    pub fn rollback(&self, plan: &Plan) -> Result<RollbackReport, CoreError> {
        validate_plan(plan)?;
        let (layout, install_base) = self.paths(plan);
        let _lock = self.lock(plan, &layout)?;
        let (journal, txn) = self.pending_journals(plan, &layout)?;
        info!(
            "rolling back plan {} ({} recorded changes)",
            plan.plan_digest64,
            txn.entries.len()
        );

        let mut restored = 0u32;
        let mut removed = 0u32;
        for entry in txn.entries.iter().rev() {
            match entry.action {
                TxnAction::SwapRoot => {
                    let live_root = install_base.join(plan_root(plan, entry.target_root_id)?);
                    if self.fs.exists(&live_root) {
                        self.fs.remove_dir_all(&live_root)?;
                        removed += 1;
                    }
                }
                TxnAction::Replace | TxnAction::Remove => {
                    let root = plan_root(plan, entry.target_root_id)?;
                    let live = live_path(&install_base, root, &entry.path);
                    let backup = layout.backup_path(entry.target_root_id, &entry.path);
                    if entry.had_previous {
                        if self.fs.exists(&backup) {
                            if self.fs.exists(&live) {
                                self.fs.remove_file(&live)?;
                            }
                            self.fs.rename(&backup, &live)?;
                            restored += 1;
                        }
                    } else if entry.action == TxnAction::Replace && self.fs.exists(&live) {
                        self.fs.remove_file(&live)?;
                        removed += 1;
                    }
                }
                TxnAction::Register => {
                    let live = layout.registrations_path();
                    let backup = layout.registrations_backup_path();
                    if entry.had_previous {
                        if self.fs.exists(&backup) {
                            if self.fs.exists(&live) {
                                self.fs.remove_file(&live)?;
                            }
                            self.fs.rename(&backup, &live)?;
                            restored += 1;
                        }
                    } else if self.fs.exists(&live) {
                        self.fs.remove_file(&live)?;
                        removed += 1;
                    }
                }
            }
        }

        let state_restored = if journal.dry_run {
            false
        } else {
            self.restore_state(plan, &layout, &journal)?
        };

        layout.clear_scratch(self.fs)?;
        let dry_run = journal.dry_run;
        let mut writer = JournalWriter::resume(self.fs, layout.journal_path(), journal);
        writer.append(EntryKind::RolledBack, None)?;

        if !dry_run {
            let audit_path = layout.audit_path();
            let mut log = AuditLog::load(self.fs, &audit_path)?;
            let state_digest64 = InstalledState::load(self.fs, &layout.state_path())?
                .map_or(Digest64::ZERO, |s| s.digest());
            log.push(AuditEntry {
                seq: 0,
                operation: plan.operation,
                outcome: AuditOutcome::RolledBack,
                plan_digest64: plan.plan_digest64,
                product_version: plan.product_version.clone(),
                files_written: 0,
                files_removed: 0,
                state_digest64,
            });
            log.save(self.fs, &audit_path)?;
        }

        self.progress
            .on_event(&ProgressEvent::RolledBack { restored, removed });
        info!("rollback complete: {restored} restored, {removed} removed");
        Ok(RollbackReport {
            plan_digest64: plan.plan_digest64,
            restored,
            removed,
            state_restored,
        })
    }

    /// Put back the installed-state snapshot the write-state step replaced.
    fn restore_state(
        &self,
        plan: &Plan,
        layout: &StateLayout,
        journal: &JobJournal,
    ) -> Result<bool, CoreError> {
        let state_path = layout.state_path();
        let backup = layout.state_backup_path();
        if self.fs.exists(&backup) {
            self.fs.rename(&backup, &state_path)?;
            return Ok(true);
        }
        let write_state_started = plan
            .ordered_steps
            .iter()
            .filter(|s| s.kind == StepKind::WriteState)
            .any(|s| journal.has_started(s.step_id));
        if !write_state_started {
            return Ok(false);
        }
        // No backup: there was no state before this apply.
        match InstalledState::load(self.fs, &state_path)? {
            Some(state) if state.plan_digest64 == plan.plan_digest64 => {
                self.fs.remove_file(&state_path)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsk_store::MemoryFs;

    #[test]
    fn nothing_to_resume_without_a_journal() {
        let fs = MemoryFs::new();
        let plan = sample_plan();
        let engine = Engine::new(&fs);
        assert!(matches!(
            engine.resume(&plan),
            Err(CoreError::NothingToResume(_))
        ));
        assert!(matches!(
            engine.rollback(&plan),
            Err(CoreError::NothingToResume(_))
        ));
    }

    fn sample_plan() -> Plan {
        use crate::planner::build_plan;
        use crate::splat::SplatRegistry;
        use dsk_schema::{
            Component, ComponentId, ComponentKind, InstallScope, Manifest, Operation,
            RequestBuilder,
        };
        let manifest = Manifest {
            product_id: "dominium".to_owned(),
            version: "1.0".to_owned(),
            build_channel: "stable".to_owned(),
            supported_targets: Vec::new(),
            components: vec![Component {
                id: ComponentId::new("core"),
                version: None,
                kind: ComponentKind::Product,
                default_selected: true,
                deps: Vec::new(),
                conflicts: Vec::new(),
                supported_targets: Vec::new(),
                artifacts: Vec::new(),
                shortcuts: Vec::new(),
                file_associations: Vec::new(),
                url_handlers: Vec::new(),
            }],
            layout_templates: Vec::new(),
            install_roots: Vec::new(),
            allowed_splats: Vec::new(),
            extensions: Vec::new(),
        };
        let request = RequestBuilder::new(Operation::Install, InstallScope::User, "linux-x86_64")
            .build()
            .unwrap();
        build_plan(&manifest, &request, &SplatRegistry::builtin(), None)
            .unwrap()
            .plan
    }

    #[test]
    fn completed_apply_cannot_be_rolled_back() {
        let fs = MemoryFs::new();
        let plan = sample_plan();
        let engine = Engine::new(&fs);
        engine.apply(&plan, false).unwrap();
        assert!(matches!(
            engine.rollback(&plan),
            Err(CoreError::NothingToResume(_))
        ));
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn journal_of_another_plan_is_refused() {
        use crate::failpoint::{self, Failpoints};
        let fs = MemoryFs::new();
        let plan = sample_plan();
        let crashing =
            Engine::new(&fs).with_failpoints(Failpoints::none().with(failpoint::BEFORE_WRITE_STATE));
        assert!(crashing.apply(&plan, false).unwrap_err().is_crash());

        let mut other = plan.clone();
        other.product_version = "2.0".to_owned();
        other.seal();
        let err = Engine::new(&fs).resume(&other).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Integrity(IntegrityError::JournalPlanMismatch { .. })
        ));

        let report = Engine::new(&fs).resume(&plan).unwrap();
        assert!(report.resumed);
        assert_eq!(report.steps_skipped, 2);
    }
}
