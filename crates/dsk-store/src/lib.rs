//! Filesystem service, state-dir layout, and persisted apply records for dsk.
//!
//! This crate provides the storage layer: the `FileSystem` service trait with
//! a real (optionally sandboxed) implementation and an in-memory fake,
//! `StateLayout` for the per-product state directory, the job and
//! transaction journals that make apply crash-safe, the `InstalledState`
//! snapshot, the `RegistrationRecord`, the append-only `AuditLog`, and
//! installed-payload verification.

pub mod audit;
pub mod fs;
pub mod integrity;
pub mod journal;
pub mod layout;
pub mod registry;
mod stamp;
pub mod state;
pub mod txn;

pub use audit::{AuditEntry, AuditLog, AuditOutcome};
pub use fs::{FileSystem, LockGuard, MemoryFs, RealFs, ScopePaths};
pub use integrity::{verify_installed, IntegrityFailure, IntegrityReport};
pub use journal::{EntryKind, JobJournal, JournalEntry, JournalStatus, JournalWriter};
pub use layout::{live_path, StateLayout};
pub use registry::RegistrationRecord;
pub use state::{InstalledComponent, InstalledFile, InstalledState};
pub use txn::{TxnAction, TxnEntry, TxnJournal, TxnWriter};

use dsk_schema::{
    HasStatus, IntegrityError, ParseError, Status, StatusCode, StatusDomain,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Fsync a directory so that a preceding `rename()` is durable.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("I/O error on '{}': {source}", path.display())]
    IoAt {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("malformed record file: {0}")]
    Parse(#[from] ParseError),
    #[error("{0}")]
    Integrity(#[from] IntegrityError),
    #[error("filesystem service unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn at(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::IoAt {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

impl HasStatus for StoreError {
    fn status(&self) -> Status {
        match self {
            StoreError::Parse(e) => e.status(),
            StoreError::Integrity(e) => e.status(),
            StoreError::Io(_) => Status::new(StatusDomain::Io, StatusCode::IoError, 1),
            StoreError::IoAt { .. } => Status::new(StatusDomain::Io, StatusCode::IoError, 2),
            StoreError::NotFound(_) => Status::new(StatusDomain::Io, StatusCode::IoError, 3),
            StoreError::Unavailable(_) => Status::new(StatusDomain::Io, StatusCode::IoError, 4),
        }
    }
}
