//! Core orchestration for the dsk setup pipeline.
//!
//! This crate turns a validated manifest and request into an installed
//! payload: splat selection against an explicit registry, dependency
//! resolution, plan building, and the journaled apply engine with its
//! resume and rollback paths. Crash behaviour is exercised through named
//! failpoints. The engine holds a per-product install lock for every apply,
//! resume and rollback, so a second writer is refused.

pub mod apply;
pub mod concurrency;
pub mod failpoint;
pub mod lifecycle;
pub mod planner;
pub mod progress;
pub mod recovery;
pub mod refusal;
pub mod resolve;
pub mod splat;

pub use apply::{ApplyReport, Engine};
pub use concurrency::{install_signal_handler, shutdown_requested, InstallLock};
pub use failpoint::Failpoints;
pub use lifecycle::{transition, ApplyEvent, ApplyState};
pub use planner::{build_plan, PlanOutcome};
pub use progress::{NullProgress, ProgressEvent, ProgressSink};
pub use recovery::RollbackReport;
pub use refusal::Refusal;
pub use resolve::resolve;
pub use splat::{
    select_splat, RejectCode, Rejection, RootConvention, SelectionReason, SplatCandidate,
    SplatCaps, SplatRegistry, SplatSelection,
};

use dsk_schema::{
    HasStatus, IntegrityError, SchemaError, Status, StatusCode, StatusDomain, StepKind,
    ValidationError, USER_ACTIONABLE,
};
use dsk_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    Schema(#[from] SchemaError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("refused: {0}")]
    Refusal(#[from] Refusal),
    #[error("invalid state transition: {from} -> {event}")]
    InvalidTransition { from: ApplyState, event: String },
    #[error("step {step_id} ({kind}) failed: {source}")]
    StepFailed {
        step_id: u32,
        kind: StepKind,
        source: Box<CoreError>,
    },
    #[error("plan step {0} has no matching file op")]
    OrphanStep(u32),
    #[error("failpoint '{0}' triggered")]
    Failpoint(String),
    #[error("shutdown requested before step {step_id}; resume to continue")]
    ShutdownRequested { step_id: u32 },
    #[error("nothing to resume or roll back: {0}")]
    NothingToResume(String),
    #[error("an unfinished apply is pending for '{0}'; resume or roll it back first")]
    PendingJournal(String),
    #[error("another apply of '{0}' holds the install lock")]
    Locked(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Errors that model a process crash: the engine stops where it is and
    /// leaves every journal and scratch file behind for resume or rollback.
    pub fn is_crash(&self) -> bool {
        matches!(
            self,
            CoreError::Failpoint(_) | CoreError::ShutdownRequested { .. }
        )
    }
}

impl HasStatus for CoreError {
    fn status(&self) -> Status {
        match self {
            CoreError::Schema(e) => e.status(),
            CoreError::Validation(e) => e.status(),
            CoreError::Integrity(e) => e.status(),
            CoreError::Store(e) => e.status(),
            CoreError::Refusal(e) => e.status(),
            CoreError::StepFailed { source, .. } => source.status(),
            CoreError::InvalidTransition { .. } => {
                Status::new(StatusDomain::Kernel, StatusCode::ValidationError, 100)
            }
            CoreError::OrphanStep(_) => {
                Status::new(StatusDomain::Kernel, StatusCode::ValidationError, 101)
            }
            CoreError::Failpoint(_) => Status::new(StatusDomain::Kernel, StatusCode::Interrupted, 1),
            CoreError::ShutdownRequested { .. } => {
                Status::new(StatusDomain::Kernel, StatusCode::Interrupted, 2)
            }
            CoreError::NothingToResume(_) => {
                Status::new(StatusDomain::Kernel, StatusCode::RefusalError, 100)
                    .with_flags(USER_ACTIONABLE)
            }
            CoreError::PendingJournal(_) => {
                Status::new(StatusDomain::Kernel, StatusCode::RefusalError, 101)
                    .with_flags(USER_ACTIONABLE)
            }
            CoreError::Locked(_) => {
                Status::new(StatusDomain::Kernel, StatusCode::RefusalError, 102)
                    .with_flags(USER_ACTIONABLE)
            }
            CoreError::Io(_) => Status::new(StatusDomain::Io, StatusCode::IoError, 1),
        }
    }
}
