use crate::fs::{FileSystem, ScopePaths};
use crate::StoreError;
use std::path::{Path, PathBuf};

pub const JOURNAL_FILE: &str = "journal.dsujournal";
pub const TXN_FILE: &str = "txn.dsutxn";
pub const STATE_FILE: &str = "installed_state.dsustate";
pub const AUDIT_FILE: &str = "audit.dsuaudit";
pub const REGISTRATIONS_FILE: &str = "registrations.dsureg";
/// Hidden directory under the install base holding per-product scratch.
pub const SCRATCH_DIR: &str = ".dsk-staging";
const LOCK_FILE: &str = ".lock";
const PREVIOUS_SUFFIX: &str = ".prev";

/// Where one product's apply records and scratch space live.
///
/// The state directory `<state_base>/<product_id>` holds the job and
/// transaction journals, the installed-state snapshot, the registration
/// record, the audit log and the lock file. Staging and file backups live in
/// `<install_base>/.dsk-staging/<product_id>` instead, on the same filesystem
/// as the live roots, so that committing and restoring are plain renames.
/// Both are keyed by install-root index so that two roots can carry the same
/// relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    dir: PathBuf,
    scratch: PathBuf,
}

impl StateLayout {
    pub fn new(scope: &ScopePaths, product_id: &str) -> Self {
        Self {
            dir: scope.state_base.join(product_id),
            scratch: scope.install_base.join(SCRATCH_DIR).join(product_id),
        }
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[inline]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    #[inline]
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    #[inline]
    pub fn txn_path(&self) -> PathBuf {
        self.dir.join(TXN_FILE)
    }

    #[inline]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    #[inline]
    pub fn audit_path(&self) -> PathBuf {
        self.dir.join(AUDIT_FILE)
    }

    #[inline]
    pub fn registrations_path(&self) -> PathBuf {
        self.dir.join(REGISTRATIONS_FILE)
    }

    #[inline]
    pub fn staging_dir(&self) -> PathBuf {
        self.scratch.join("staging")
    }

    #[inline]
    pub fn backup_dir(&self) -> PathBuf {
        self.scratch.join("backup")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    pub fn staged_root(&self, root_id: u32) -> PathBuf {
        self.staging_dir().join(root_id.to_string())
    }

    pub fn staged_path(&self, root_id: u32, rel: &str) -> PathBuf {
        self.staged_root(root_id).join(rel)
    }

    pub fn backup_path(&self, root_id: u32, rel: &str) -> PathBuf {
        self.backup_dir().join(root_id.to_string()).join(rel)
    }

    /// Copy of the installed-state snapshot taken before an apply replaces it.
    pub fn state_backup_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{PREVIOUS_SUFFIX}"))
    }

    /// The registration record an apply replaced or removed.
    pub fn registrations_backup_path(&self) -> PathBuf {
        self.dir.join(format!("{REGISTRATIONS_FILE}{PREVIOUS_SUFFIX}"))
    }

    pub fn initialize(&self, fs: &dyn FileSystem) -> Result<(), StoreError> {
        fs.make_dir(&self.dir)?;
        fs.make_dir(&self.staging_dir())?;
        fs.make_dir(&self.backup_dir())?;
        Ok(())
    }

    /// Drop staging, backups and the previous-record copies once nothing can
    /// need them.
    pub fn clear_scratch(&self, fs: &dyn FileSystem) -> Result<(), StoreError> {
        fs.remove_dir_all(&self.scratch)?;
        for previous in [self.state_backup_path(), self.registrations_backup_path()] {
            if fs.exists(&previous) {
                fs.remove_file(&previous)?;
            }
        }
        Ok(())
    }
}

/// Live location of `rel` under install root `root`.
pub fn live_path(install_base: &Path, root: &str, rel: &str) -> PathBuf {
    install_base.join(root).join(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn scope() -> ScopePaths {
        ScopePaths {
            install_base: PathBuf::from("/tmp/dsk-test/install"),
            state_base: PathBuf::from("/tmp/dsk-test/state"),
        }
    }

    #[test]
    fn layout_paths_are_correct() {
        let layout = StateLayout::new(&scope(), "dominium");
        assert_eq!(
            layout.journal_path(),
            PathBuf::from("/tmp/dsk-test/state/dominium/journal.dsujournal")
        );
        assert_eq!(
            layout.txn_path(),
            PathBuf::from("/tmp/dsk-test/state/dominium/txn.dsutxn")
        );
        assert_eq!(
            layout.state_path(),
            PathBuf::from("/tmp/dsk-test/state/dominium/installed_state.dsustate")
        );
        assert_eq!(
            layout.state_backup_path(),
            PathBuf::from("/tmp/dsk-test/state/dominium/installed_state.dsustate.prev")
        );
        assert_eq!(
            layout.staged_path(1, "bin/tool"),
            PathBuf::from("/tmp/dsk-test/install/.dsk-staging/dominium/staging/1/bin/tool")
        );
        assert_eq!(
            layout.backup_path(0, "bin/tool"),
            PathBuf::from("/tmp/dsk-test/install/.dsk-staging/dominium/backup/0/bin/tool")
        );
    }

    #[test]
    fn scratch_shares_the_install_base() {
        let scope = scope();
        let layout = StateLayout::new(&scope, "dominium");
        assert!(layout.staging_dir().starts_with(&scope.install_base));
        assert!(layout.backup_dir().starts_with(&scope.install_base));
        assert!(!layout.staging_dir().starts_with(&scope.state_base));
    }

    #[test]
    fn initialize_is_idempotent() {
        let fs = MemoryFs::new();
        let layout = StateLayout::new(&fs.user_scope_paths(), "p");
        layout.initialize(&fs).unwrap();
        layout.initialize(&fs).unwrap();
        assert!(fs.is_dir(&layout.staging_dir()));
        assert!(fs.is_dir(&layout.backup_dir()));
    }

    #[test]
    fn clear_scratch_drops_previous_records() {
        let fs = MemoryFs::new();
        let layout = StateLayout::new(&fs.user_scope_paths(), "p");
        layout.initialize(&fs).unwrap();
        fs.write_file_bytes_atomic(&layout.staged_path(0, "bin/x"), b"x")
            .unwrap();
        fs.write_file_bytes_atomic(&layout.state_backup_path(), b"old")
            .unwrap();
        layout.clear_scratch(&fs).unwrap();
        assert!(!fs.exists(&layout.staging_dir()));
        assert!(!fs.exists(&layout.state_backup_path()));
        layout.clear_scratch(&fs).unwrap();
    }

    #[test]
    fn live_path_joins_root() {
        assert_eq!(
            live_path(Path::new("/base"), "apps/p", "bin/x"),
            PathBuf::from("/base/apps/p/bin/x")
        );
    }
}
