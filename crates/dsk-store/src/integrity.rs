use crate::fs::FileSystem;
use crate::layout::live_path;
use crate::state::InstalledState;
use crate::StoreError;
use dsk_schema::{digest64, Digest64};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub checked: usize,
    pub passed: usize,
    pub failed: Vec<IntegrityFailure>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct IntegrityFailure {
    pub root: String,
    pub path: String,
    pub reason: String,
}

/// Re-hash every file the installed state records and compare against the
/// recorded digest and size.
pub fn verify_installed(
    fs: &dyn FileSystem,
    install_base: &Path,
    state: &InstalledState,
) -> Result<IntegrityReport, StoreError> {
    let mut report = IntegrityReport {
        checked: state.files.len(),
        ..Default::default()
    };

    for file in &state.files {
        let Some(root) = state.root(file.target_root_id) else {
            report.failed.push(IntegrityFailure {
                root: String::new(),
                path: file.path.clone(),
                reason: format!("install root {} not recorded", file.target_root_id),
            });
            continue;
        };
        let path = live_path(install_base, root, &file.path);
        match fs.read_file_bytes(&path) {
            Ok(bytes) => {
                let actual = Digest64(digest64(&bytes));
                if actual == file.digest64 && bytes.len() as u64 == file.size {
                    report.passed += 1;
                } else {
                    report.failed.push(IntegrityFailure {
                        root: root.to_owned(),
                        path: file.path.clone(),
                        reason: format!(
                            "content mismatch: expected {} ({} bytes), got {actual} ({} bytes)",
                            file.digest64,
                            file.size,
                            bytes.len()
                        ),
                    });
                }
            }
            Err(StoreError::NotFound(_)) => {
                report.failed.push(IntegrityFailure {
                    root: root.to_owned(),
                    path: file.path.clone(),
                    reason: "missing".to_owned(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::state::{InstalledComponent, InstalledFile};
    use dsk_schema::{
        ComponentId, ComponentKind, InstallScope, Operation, Ownership, Registrations, SplatId,
    };

    fn setup(content: &[u8]) -> (MemoryFs, InstalledState) {
        let fs = MemoryFs::new();
        let base = Path::new("/mem/user/install");
        fs.write_file_bytes_atomic(&live_path(base, "user/p", "bin/a"), content)
            .unwrap();
        let state = InstalledState {
            product_id: "p".to_owned(),
            product_version: "1".to_owned(),
            build_channel: "stable".to_owned(),
            selected_splat: SplatId::new("linux_portable"),
            operation: Operation::Install,
            install_scope: InstallScope::User,
            target_platform: "linux-x86_64".to_owned(),
            install_roots: vec!["user/p".to_owned()],
            plan_digest64: Digest64(1),
            manifest_digest64: Digest64(2),
            components: vec![InstalledComponent {
                id: ComponentId::new("core"),
                version: "1".to_owned(),
                kind: ComponentKind::Runtime,
            }],
            files: vec![
                InstalledFile {
                    target_root_id: 0,
                    path: "bin/a".to_owned(),
                    digest64: Digest64(digest64(b"abc")),
                    size: 3,
                    component_id: "core".to_owned(),
                    ownership: Ownership::Portable,
                },
                InstalledFile {
                    target_root_id: 0,
                    path: "bin/b".to_owned(),
                    digest64: Digest64(digest64(b"b")),
                    size: 1,
                    component_id: "core".to_owned(),
                    ownership: Ownership::Portable,
                },
            ],
            registrations: Registrations::default(),
        };
        (fs, state)
    }

    #[test]
    fn intact_file_passes_and_missing_file_fails() {
        let (fs, state) = setup(b"abc");
        let report = verify_installed(&fs, Path::new("/mem/user/install"), &state).unwrap();
        assert_eq!(report.checked, 2);
        assert_eq!(report.passed, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].path, "bin/b");
        assert_eq!(report.failed[0].reason, "missing");
    }

    #[test]
    fn modified_file_detected() {
        let (fs, state) = setup(b"abd");
        let report = verify_installed(&fs, Path::new("/mem/user/install"), &state).unwrap();
        assert_eq!(report.passed, 0);
        assert!(!report.is_clean());
        assert!(report.failed[0].reason.starts_with("content mismatch"));
    }
}
