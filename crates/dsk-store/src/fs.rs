//! Filesystem service.
//!
//! The apply engine never touches OS APIs directly: every read, write, rename
//! and scope-to-path lookup goes through [`FileSystem`]. [`RealFs`] talks to
//! the host (optionally confined to a sandbox root) and [`MemoryFs`] is the
//! in-memory fake used by tests.

use crate::StoreError;
use dsk_schema::InstallScope;
use fs2::FileExt;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::NamedTempFile;

/// Where a scope keeps installed payloads and installer state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopePaths {
    pub install_base: PathBuf,
    pub state_base: PathBuf,
}

pub trait FileSystem: Send + Sync {
    fn name(&self) -> &str;

    fn read_file_bytes(&self, path: &Path) -> Result<Vec<u8>, StoreError>;

    /// Replace `path` with `bytes` so that readers see either the old or the
    /// new content, never a mix. Parent directories are created.
    fn write_file_bytes_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError>;

    /// Create `path` and any missing parents.
    fn make_dir(&self, path: &Path) -> Result<(), StoreError>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn remove_file(&self, path: &Path) -> Result<(), StoreError>;

    /// Remove a directory tree. Missing directories are not an error.
    fn remove_dir_all(&self, path: &Path) -> Result<(), StoreError>;

    /// Rename a file or directory, creating the destination's parents.
    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError>;

    /// Every regular file under `dir`, relative to `dir`, sorted.
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError>;

    /// Take the exclusive lock at `path` without waiting. `Ok(None)` means
    /// someone else holds it.
    fn try_lock(&self, path: &Path) -> Result<Option<LockGuard>, StoreError>;

    fn user_scope_paths(&self) -> ScopePaths;

    fn system_scope_paths(&self) -> ScopePaths;

    fn portable_scope_paths(&self) -> ScopePaths;

    fn scope_paths(&self, scope: InstallScope) -> ScopePaths {
        match scope {
            InstallScope::User => self.user_scope_paths(),
            InstallScope::System => self.system_scope_paths(),
            InstallScope::Portable => self.portable_scope_paths(),
        }
    }
}

/// An exclusive lock taken through [`FileSystem::try_lock`]. Released on drop.
#[derive(Debug)]
pub struct LockGuard {
    held: Held,
}

#[derive(Debug)]
enum Held {
    File(fs::File),
    Memory {
        locks: Arc<Mutex<BTreeSet<PathBuf>>>,
        path: PathBuf,
    },
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.held {
            Held::File(file) => {
                let _ = file.unlock();
            }
            Held::Memory { locks, path } => {
                if let Ok(mut held) = locks.lock() {
                    held.remove(path);
                }
            }
        }
    }
}

fn sandbox_scope(root: &Path, scope: &str) -> ScopePaths {
    ScopePaths {
        install_base: root.join(scope).join("install"),
        state_base: root.join(scope).join("state"),
    }
}

/// Host filesystem.
///
/// In sandboxed mode every scope resolves under the sandbox root, so an apply
/// can be exercised without touching the real user or system locations.
/// Payload reads are not confined: payload roots are ordinary host paths.
#[derive(Debug, Clone)]
pub struct RealFs {
    user: ScopePaths,
    system: ScopePaths,
    portable: ScopePaths,
}

impl RealFs {
    pub fn sandboxed(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            user: sandbox_scope(&root, "user"),
            system: sandbox_scope(&root, "system"),
            portable: sandbox_scope(&root, "portable"),
        }
    }

    /// Conventional host locations: `$HOME/.local` for user scope, `/opt` and
    /// `/var/lib/dsk` for system scope, and `portable_dir` for portable
    /// installs.
    pub fn host(home: &Path, portable_dir: &Path) -> Self {
        Self {
            user: ScopePaths {
                install_base: home.join(".local").join("share"),
                state_base: home.join(".local").join("state").join("dsk"),
            },
            system: ScopePaths {
                install_base: PathBuf::from("/opt"),
                state_base: PathBuf::from("/var/lib/dsk"),
            },
            portable: ScopePaths {
                install_base: portable_dir.to_path_buf(),
                state_base: portable_dir.join(".dsk"),
            },
        }
    }
}

fn collect_files(base: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    for entry in fs::read_dir(dir).map_err(|e| StoreError::at(dir, e))? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(base, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(rel) = path.strip_prefix(base) {
                out.push(rel.to_path_buf());
            }
        }
    }
    Ok(())
}

impl FileSystem for RealFs {
    fn name(&self) -> &str {
        "real"
    }

    fn read_file_bytes(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        fs::read(path).map_err(|e| StoreError::at(path, e))
    }

    fn write_file_bytes_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let dir = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(dir).map_err(|e| StoreError::at(dir, e))?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| StoreError::at(path, e.error))?;
        crate::fsync_dir(dir)?;
        Ok(())
    }

    fn make_dir(&self, path: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(path).map_err(|e| StoreError::at(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn remove_file(&self, path: &Path) -> Result<(), StoreError> {
        fs::remove_file(path).map_err(|e| StoreError::at(path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), StoreError> {
        match fs::remove_dir_all(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::at(path, e)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::at(parent, e))?;
        }
        fs::rename(from, to).map_err(|e| StoreError::at(from, e))?;
        if let Some(parent) = to.parent() {
            crate::fsync_dir(parent)?;
        }
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        collect_files(dir, dir, &mut out)?;
        out.sort();
        Ok(out)
    }

    fn try_lock(&self, path: &Path) -> Result<Option<LockGuard>, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::at(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::at(path, e))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard {
                held: Held::File(file),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(StoreError::at(path, e)),
        }
    }

    fn user_scope_paths(&self) -> ScopePaths {
        self.user.clone()
    }

    fn system_scope_paths(&self) -> ScopePaths {
        self.system.clone()
    }

    fn portable_scope_paths(&self) -> ScopePaths {
        self.portable.clone()
    }
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
}

impl MemoryTree {
    fn add_parents(&mut self, path: &Path) {
        let mut cur = path.parent();
        while let Some(p) = cur {
            if p.as_os_str().is_empty() || !self.dirs.insert(p.to_path_buf()) {
                break;
            }
            cur = p.parent();
        }
    }
}

/// In-memory filesystem fake. Scope paths live under `/mem/<scope>`.
#[derive(Debug, Default)]
pub struct MemoryFs {
    tree: Mutex<MemoryTree>,
    locks: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> Result<MutexGuard<'_, MemoryTree>, StoreError> {
        self.tree
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))
    }

    /// Every file currently held, with its content.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        self.tree().map(|t| t.files.clone()).unwrap_or_default()
    }
}

impl FileSystem for MemoryFs {
    fn name(&self) -> &str {
        "memory"
    }

    fn read_file_bytes(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        self.tree()?
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    fn write_file_bytes_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let mut tree = self.tree()?;
        tree.add_parents(path);
        tree.files.insert(path.to_path_buf(), bytes.to_vec());
        Ok(())
    }

    fn make_dir(&self, path: &Path) -> Result<(), StoreError> {
        let mut tree = self.tree()?;
        tree.add_parents(path);
        tree.dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.tree()
            .map(|t| t.files.contains_key(path) || t.dirs.contains(path))
            .unwrap_or(false)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.tree().map(|t| t.dirs.contains(path)).unwrap_or(false)
    }

    fn remove_file(&self, path: &Path) -> Result<(), StoreError> {
        self.tree()?
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<(), StoreError> {
        let mut tree = self.tree()?;
        tree.files.retain(|p, _| !p.starts_with(path));
        tree.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), StoreError> {
        let mut tree = self.tree()?;
        if let Some(bytes) = tree.files.remove(from) {
            tree.add_parents(to);
            tree.files.insert(to.to_path_buf(), bytes);
            return Ok(());
        }
        if !tree.dirs.contains(from) {
            return Err(StoreError::NotFound(from.to_path_buf()));
        }
        let moved_files: Vec<(PathBuf, Vec<u8>)> = tree
            .files
            .iter()
            .filter(|(p, _)| p.starts_with(from))
            .map(|(p, b)| (p.clone(), b.clone()))
            .collect();
        let moved_dirs: Vec<PathBuf> = tree
            .dirs
            .iter()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        tree.add_parents(to);
        for (p, bytes) in moved_files {
            tree.files.remove(&p);
            if let Ok(rel) = p.strip_prefix(from) {
                tree.files.insert(to.join(rel), bytes);
            }
        }
        for p in moved_dirs {
            tree.dirs.remove(&p);
            if let Ok(rel) = p.strip_prefix(from) {
                tree.dirs.insert(to.join(rel));
            }
        }
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
        let tree = self.tree()?;
        Ok(tree
            .files
            .keys()
            .filter_map(|p| p.strip_prefix(dir).ok())
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .collect())
    }

    fn try_lock(&self, path: &Path) -> Result<Option<LockGuard>, StoreError> {
        let mut held = self
            .locks
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {e}")))?;
        if !held.insert(path.to_path_buf()) {
            return Ok(None);
        }
        Ok(Some(LockGuard {
            held: Held::Memory {
                locks: Arc::clone(&self.locks),
                path: path.to_path_buf(),
            },
        }))
    }

    fn user_scope_paths(&self) -> ScopePaths {
        sandbox_scope(Path::new("/mem"), "user")
    }

    fn system_scope_paths(&self) -> ScopePaths {
        sandbox_scope(Path::new("/mem"), "system")
    }

    fn portable_scope_paths(&self) -> ScopePaths {
        sandbox_scope(Path::new("/mem"), "portable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(fs: &dyn FileSystem, root: &Path) {
        let file = root.join("a").join("b.txt");
        fs.write_file_bytes_atomic(&file, b"one").unwrap();
        assert!(fs.exists(&file));
        assert!(fs.is_dir(&root.join("a")));
        assert_eq!(fs.read_file_bytes(&file).unwrap(), b"one");

        fs.write_file_bytes_atomic(&file, b"two").unwrap();
        assert_eq!(fs.read_file_bytes(&file).unwrap(), b"two");

        let moved = root.join("c").join("d.txt");
        fs.rename(&file, &moved).unwrap();
        assert!(!fs.exists(&file));
        assert_eq!(fs.read_file_bytes(&moved).unwrap(), b"two");

        fs.write_file_bytes_atomic(&root.join("c").join("e").join("f"), b"x")
            .unwrap();
        assert_eq!(
            fs.list_files(&root.join("c")).unwrap(),
            vec![PathBuf::from("d.txt"), PathBuf::from("e/f")]
        );

        fs.rename(&root.join("c"), &root.join("z")).unwrap();
        assert_eq!(fs.read_file_bytes(&root.join("z/e/f")).unwrap(), b"x");

        fs.remove_file(&root.join("z/d.txt")).unwrap();
        assert!(matches!(
            fs.read_file_bytes(&root.join("z/d.txt")),
            Err(StoreError::NotFound(_))
        ));

        fs.remove_dir_all(&root.join("z")).unwrap();
        fs.remove_dir_all(&root.join("z")).unwrap();
        assert!(fs.list_files(&root.join("z")).unwrap().is_empty());

        let lock = root.join("state").join(".lock");
        let guard = fs.try_lock(&lock).unwrap();
        assert!(guard.is_some());
        assert!(fs.try_lock(&lock).unwrap().is_none());
        drop(guard);
        assert!(fs.try_lock(&lock).unwrap().is_some());
    }

    #[test]
    fn real_fs_contract() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&RealFs::sandboxed(dir.path()), dir.path());
    }

    #[test]
    fn memory_fs_contract() {
        exercise(&MemoryFs::new(), Path::new("/mem/test"));
    }

    #[test]
    fn sandbox_scopes_are_disjoint() {
        let fs = RealFs::sandboxed("/sb");
        let user = fs.scope_paths(InstallScope::User);
        let system = fs.scope_paths(InstallScope::System);
        assert_eq!(user.install_base, PathBuf::from("/sb/user/install"));
        assert_eq!(system.state_base, PathBuf::from("/sb/system/state"));
        assert_ne!(user.install_base, system.install_base);
    }

    #[test]
    fn missing_file_is_not_found() {
        let fs = MemoryFs::new();
        assert!(matches!(
            fs.read_file_bytes(Path::new("/nope")),
            Err(StoreError::NotFound(_))
        ));
    }
}
