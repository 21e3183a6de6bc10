//! The apply engine.
//!
//! Steps run strictly in plan order. Each one is journaled as started before
//! its effect and as completed after it, and every change to a live install
//! root is first recorded as an intent in the transaction journal. A crash
//! anywhere therefore leaves enough on disk for [`Engine::resume`] to finish
//! the plan or [`Engine::rollback`] to undo it.

use crate::concurrency::{shutdown_requested, InstallLock};
use crate::failpoint::{self, Failpoints};
use crate::lifecycle::{transition, ApplyEvent, ApplyState};
use crate::progress::{NullProgress, ProgressEvent, ProgressSink};
use crate::CoreError;
use dsk_schema::{
    validate_plan, CapBits, Digest64, FileOp, FileOpKind, IntegrityError, Operation, Plan,
    PlanStep, StepKind, ValidationError,
};
use dsk_store::layout::REGISTRATIONS_FILE;
use dsk_store::{
    live_path, AuditEntry, AuditLog, AuditOutcome, EntryKind, FileSystem, InstalledState,
    JobJournal, JournalWriter, RegistrationRecord, StateLayout, TxnAction, TxnEntry, TxnWriter,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of a successful apply or resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub plan_digest64: Digest64,
    pub final_state: ApplyState,
    pub files_written: u32,
    pub files_removed: u32,
    /// Digest of the installed state the plan leaves behind. `None` after an
    /// uninstall.
    pub state_digest64: Option<Digest64>,
    pub dry_run: bool,
    pub resumed: bool,
    pub steps_run: u32,
    pub steps_skipped: u32,
}

pub struct Engine<'a> {
    pub(crate) fs: &'a dyn FileSystem,
    pub(crate) failpoints: Failpoints,
    pub(crate) progress: &'a dyn ProgressSink,
}

/// Per-invocation working set: journals, layout and counters.
pub(crate) struct Run<'r> {
    pub plan: &'r Plan,
    pub layout: StateLayout,
    pub install_base: PathBuf,
    pub journal: JournalWriter<'r>,
    pub txn: TxnWriter<'r>,
    pub dry_run: bool,
    pub resumed: bool,
}

impl<'a> Engine<'a> {
    pub fn new(fs: &'a dyn FileSystem) -> Self {
        Self {
            fs,
            failpoints: Failpoints::none(),
            progress: &NullProgress,
        }
    }

    #[must_use]
    pub fn with_failpoints(mut self, failpoints: Failpoints) -> Self {
        self.failpoints = failpoints;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: &'a dyn ProgressSink) -> Self {
        self.progress = progress;
        self
    }

    /// State layout and install base the plan applies to.
    pub fn paths(&self, plan: &Plan) -> (StateLayout, PathBuf) {
        let scope = self.fs.scope_paths(plan.install_scope);
        (
            StateLayout::new(&scope, &plan.product_id),
            scope.install_base,
        )
    }

    pub(crate) fn lock(&self, plan: &Plan, layout: &StateLayout) -> Result<InstallLock, CoreError> {
        InstallLock::try_acquire(self.fs, layout, &plan.product_id)
    }

    /// Apply a plan from the beginning.
    ///
    /// Refuses with [`CoreError::Locked`] while another writer holds the
    /// product's install lock, and with [`CoreError::PendingJournal`] while an
    /// earlier apply of the same product is unfinished.
    pub fn apply(&self, plan: &Plan, dry_run: bool) -> Result<ApplyReport, CoreError> {
        validate_plan(plan)?;
        let (layout, install_base) = self.paths(plan);
        let _lock = self.lock(plan, &layout)?;
        info!(
            "applying plan {} ({} {}) via {}{}",
            plan.plan_digest64,
            plan.operation,
            plan.product_id,
            self.fs.name(),
            if dry_run { ", dry run" } else { "" }
        );

        if let Some(existing) = JobJournal::load(self.fs, &layout.journal_path())? {
            if !existing.status().is_finished() {
                return Err(CoreError::PendingJournal(plan.product_id.clone()));
            }
        }
        layout.clear_scratch(self.fs)?;
        layout.initialize(self.fs)?;

        let journal = JournalWriter::create(
            self.fs,
            layout.journal_path(),
            plan.plan_digest64,
            plan.operation,
            dry_run,
        )?;
        let txn = TxnWriter::create(self.fs, layout.txn_path(), plan.plan_digest64)?;
        let run = Run {
            plan,
            layout,
            install_base,
            journal,
            txn,
            dry_run,
            resumed: false,
        };
        self.run(run, &BTreeSet::new())
    }

    /// Drive the state machine over every step not in `completed`.
    pub(crate) fn run(
        &self,
        mut run: Run<'_>,
        completed: &BTreeSet<u32>,
    ) -> Result<ApplyReport, CoreError> {
        let plan = run.plan;
        let total = plan.ordered_steps.len() as u32;
        let mut state = ApplyState::Pending;
        let mut steps_run = 0;
        let mut steps_skipped = 0;

        for step in &plan.ordered_steps {
            if completed.contains(&step.step_id) {
                state = transition(state, ApplyEvent::Step(step.kind))?;
                steps_skipped += 1;
                self.progress.on_event(&ProgressEvent::StepSkipped {
                    step_id: step.step_id,
                    kind: step.kind,
                });
                continue;
            }
            if shutdown_requested() {
                run.journal.append(EntryKind::Interrupted, Some(step))?;
                return Err(CoreError::ShutdownRequested {
                    step_id: step.step_id,
                });
            }

            state = transition(state, ApplyEvent::Step(step.kind))?;
            self.progress.on_event(&ProgressEvent::StepStarted {
                step_id: step.step_id,
                kind: step.kind,
                total,
            });
            run.journal.append(EntryKind::StepStarted, Some(step))?;

            match self.execute(&mut run, step) {
                Ok(()) => {}
                Err(e) if e.is_crash() => return Err(e),
                Err(e) => {
                    warn!("step {} ({}) failed: {e}", step.step_id, step.kind);
                    let failed = transition(state, ApplyEvent::Fail {
                        step_id: step.step_id,
                    })?;
                    debug!("apply state: {failed}");
                    if let Err(je) = run.journal.append(EntryKind::Failed, Some(step)) {
                        warn!("could not record failure in the journal: {je}");
                    }
                    return Err(CoreError::StepFailed {
                        step_id: step.step_id,
                        kind: step.kind,
                        source: Box::new(e),
                    });
                }
            }

            run.journal.append(EntryKind::StepCompleted, Some(step))?;
            steps_run += 1;
            self.progress.on_event(&ProgressEvent::StepCompleted {
                step_id: step.step_id,
                kind: step.kind,
            });
        }

        state = transition(state, ApplyEvent::Finish)?;
        run.journal.append(EntryKind::Completed, None)?;
        run.layout.clear_scratch(self.fs)?;
        info!("plan {} applied ({state})", plan.plan_digest64);

        let (files_written, files_removed) = op_counts(plan);
        Ok(ApplyReport {
            plan_digest64: plan.plan_digest64,
            final_state: state,
            files_written,
            files_removed,
            state_digest64: final_state_digest(plan),
            dry_run: run.dry_run,
            resumed: run.resumed,
            steps_run,
            steps_skipped,
        })
    }

    fn execute(&self, run: &mut Run<'_>, step: &PlanStep) -> Result<(), CoreError> {
        match step.kind {
            StepKind::StageArtifact => self.stage(run, step),
            StepKind::VerifyHashes => self.verify(run, step),
            StepKind::CommitSwap => self.commit(run),
            StepKind::RegisterActions => self.register(run),
            StepKind::WriteState => self.write_state(run),
            StepKind::WriteAudit => self.write_audit(run),
        }
    }

    fn stage(&self, run: &mut Run<'_>, step: &PlanStep) -> Result<(), CoreError> {
        let (_, op) = run
            .plan
            .op_for_step(step)
            .ok_or(CoreError::OrphanStep(step.step_id))?;
        let source = Path::new(&run.plan.payload_root).join(&op.from);
        let bytes = self.fs.read_file_bytes(&source)?;
        check_content(op, &bytes)?;
        let staged = run.layout.staged_path(op.target_root_id, &op.to);
        self.fs.write_file_bytes_atomic(&staged, &bytes)?;
        debug!("staged {} -> {}", source.display(), staged.display());
        self.failpoints.check(failpoint::AFTER_STAGE_EXTRACT)
    }

    fn verify(&self, run: &mut Run<'_>, step: &PlanStep) -> Result<(), CoreError> {
        let (_, op) = run
            .plan
            .op_for_step(step)
            .ok_or(CoreError::OrphanStep(step.step_id))?;
        let staged = run.layout.staged_path(op.target_root_id, &op.to);
        let bytes = self.fs.read_file_bytes(&staged)?;
        check_content(op, &bytes)?;
        self.failpoints.check(failpoint::AFTER_VERIFY)
    }

    /// Make staged content live.
    ///
    /// A fresh root (nothing live yet, nothing to remove) is renamed into
    /// place in one step when the splat can swap atomically. Everything else
    /// goes file by file: the previous file moves to `backup/`, then the
    /// staged file is renamed over the live path.
    fn commit(&self, run: &mut Run<'_>) -> Result<(), CoreError> {
        if run.dry_run {
            debug!("dry run: leaving live roots untouched");
            return Ok(());
        }
        let plan = run.plan;
        let mut sub_step = 0u32;
        let mut swapped = BTreeSet::new();

        if plan.splat_caps.contains(CapBits::ATOMIC_SWAP) {
            let copy_roots: BTreeSet<u32> = plan.copy_ops().map(|op| op.target_root_id).collect();
            for root_id in copy_roots {
                let has_removals = plan
                    .file_ops
                    .iter()
                    .any(|op| op.target_root_id == root_id && op.kind == FileOpKind::Remove);
                let root = plan_root(plan, root_id)?;
                let live_root = run.install_base.join(root);
                let staged_root = run.layout.staged_root(root_id);
                let recorded = run.txn.txn().has_swapped_root(root_id);
                if !recorded && (has_removals || self.fs.exists(&live_root)) {
                    continue;
                }
                if !recorded {
                    run.txn.record(TxnEntry {
                        action: TxnAction::SwapRoot,
                        op_index: 0,
                        target_root_id: root_id,
                        path: String::new(),
                        had_previous: false,
                    })?;
                }
                if self.fs.exists(&staged_root) {
                    self.fs.rename(&staged_root, &live_root)?;
                    info!("swapped {} into place", live_root.display());
                }
                swapped.insert(root_id);
                sub_step += 1;
                self.failpoints.check(&failpoint::mid_commit_step(sub_step))?;
            }
        }

        for (index, op) in plan.file_ops.iter().enumerate() {
            if op.kind == FileOpKind::Copy && swapped.contains(&op.target_root_id) {
                continue;
            }
            let root = plan_root(plan, op.target_root_id)?;
            let live = live_path(&run.install_base, root, &op.to);
            let backup = run.layout.backup_path(op.target_root_id, &op.to);
            let had_previous = match run.txn.txn().file_entry(index as u32) {
                Some(entry) => entry.had_previous,
                None => {
                    let had_previous = self.fs.exists(&live);
                    run.txn.record(TxnEntry {
                        action: match op.kind {
                            FileOpKind::Copy => TxnAction::Replace,
                            FileOpKind::Remove => TxnAction::Remove,
                        },
                        op_index: index as u32,
                        target_root_id: op.target_root_id,
                        path: op.to.clone(),
                        had_previous,
                    })?;
                    had_previous
                }
            };

            match op.kind {
                FileOpKind::Copy => {
                    let staged = run.layout.staged_path(op.target_root_id, &op.to);
                    if self.fs.exists(&staged) {
                        if had_previous && !self.fs.exists(&backup) {
                            self.fs.rename(&live, &backup)?;
                        }
                        self.fs.rename(&staged, &live)?;
                    }
                }
                FileOpKind::Remove => {
                    if self.fs.exists(&live) && !self.fs.exists(&backup) {
                        self.fs.rename(&live, &backup)?;
                    }
                }
            }
            self.progress.on_event(&ProgressEvent::FileCommitted {
                path: format!("{root}/{}", op.to),
            });
            sub_step += 1;
            self.failpoints.check(&failpoint::mid_commit_step(sub_step))?;
        }
        Ok(())
    }

    /// Replace the product's registration record with the plan's.
    ///
    /// The previous record moves aside behind a transaction intent so that
    /// rollback can put it back. An uninstall only moves it aside.
    fn register(&self, run: &mut Run<'_>) -> Result<(), CoreError> {
        let r = &run.plan.registrations;
        debug!(
            "registering {} shortcuts, {} file associations, {} url handlers",
            r.shortcuts.len(),
            r.file_associations.len(),
            r.url_handlers.len()
        );
        if run.dry_run {
            debug!("dry run: registrations computed, not written");
            return Ok(());
        }
        let path = run.layout.registrations_path();
        let backup = run.layout.registrations_backup_path();
        let had_previous = match run.txn.txn().registration_entry() {
            Some(entry) => entry.had_previous,
            None => {
                let had_previous = self.fs.exists(&path);
                run.txn.record(TxnEntry {
                    action: TxnAction::Register,
                    op_index: 0,
                    target_root_id: 0,
                    path: REGISTRATIONS_FILE.to_owned(),
                    had_previous,
                })?;
                had_previous
            }
        };
        if had_previous && !self.fs.exists(&backup) {
            self.fs.rename(&path, &backup)?;
        }
        if run.plan.operation != Operation::Uninstall {
            RegistrationRecord::from_plan(run.plan).save(self.fs, &path)?;
        }
        Ok(())
    }

    fn write_state(&self, run: &mut Run<'_>) -> Result<(), CoreError> {
        self.failpoints.check(failpoint::BEFORE_WRITE_STATE)?;
        let state_path = run.layout.state_path();
        if run.dry_run {
            debug!("dry run: installed state computed, not written");
        } else {
            let backup = run.layout.state_backup_path();
            if self.fs.exists(&state_path) && !self.fs.exists(&backup) {
                let previous = self.fs.read_file_bytes(&state_path)?;
                self.fs.write_file_bytes_atomic(&backup, &previous)?;
            }
            if run.plan.operation == Operation::Uninstall {
                if self.fs.exists(&state_path) {
                    self.fs.remove_file(&state_path)?;
                }
            } else {
                let state = InstalledState::from_plan(run.plan);
                state.save(self.fs, &state_path)?;
                debug!("installed state {} written", state.digest());
            }
        }
        self.failpoints.check(failpoint::AFTER_WRITE_STATE)
    }

    fn write_audit(&self, run: &mut Run<'_>) -> Result<(), CoreError> {
        self.failpoints.check(failpoint::BEFORE_WRITE_AUDIT)?;
        let plan = run.plan;
        let (files_written, files_removed) = op_counts(plan);
        let entry = AuditEntry {
            seq: 0,
            operation: plan.operation,
            outcome: if run.dry_run {
                AuditOutcome::DryRun
            } else {
                AuditOutcome::Applied
            },
            plan_digest64: plan.plan_digest64,
            product_version: plan.product_version.clone(),
            files_written,
            files_removed,
            state_digest64: final_state_digest(plan).unwrap_or(Digest64::ZERO),
        };
        if run.dry_run {
            debug!("dry run: audit entry computed, not written");
            return Ok(());
        }
        let audit_path = run.layout.audit_path();
        let mut log = AuditLog::load(self.fs, &audit_path)?;
        // A resumed audit step may find its own entry already written.
        let already = run.resumed
            && log.entries.last().is_some_and(|last| {
                last.plan_digest64 == entry.plan_digest64 && last.outcome == entry.outcome
            });
        if !already {
            log.push(entry);
            log.save(self.fs, &audit_path)?;
        }
        Ok(())
    }
}

pub(crate) fn plan_root(plan: &Plan, root_id: u32) -> Result<&str, CoreError> {
    plan.root(root_id).ok_or_else(|| {
        CoreError::Validation(ValidationError::RootOutOfRange {
            path: String::new(),
            index: root_id,
            roots: plan.install_roots.len(),
        })
    })
}

pub(crate) fn check_content(op: &FileOp, bytes: &[u8]) -> Result<(), IntegrityError> {
    let actual = Digest64::of(bytes);
    if actual != op.digest64 || bytes.len() as u64 != op.size {
        return Err(IntegrityError::ContentMismatch {
            path: op.to.clone(),
            expected: op.digest64,
            expected_size: op.size,
            actual,
            actual_size: bytes.len() as u64,
        });
    }
    Ok(())
}

fn op_counts(plan: &Plan) -> (u32, u32) {
    let written = plan.copy_ops().count() as u32;
    (written, plan.file_ops.len() as u32 - written)
}

fn final_state_digest(plan: &Plan) -> Option<Digest64> {
    (plan.operation != Operation::Uninstall).then(|| InstalledState::from_plan(plan).digest())
}
