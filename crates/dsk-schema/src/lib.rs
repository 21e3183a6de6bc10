//! Binary schema, digests, and validated models for the dsk setup core.
//!
//! This crate defines the persisted-artifact layer: the TLV file codec
//! (`tlv`), FNV-1a digests (`digest`), the product manifest (`Manifest`, with
//! a TOML authoring form), the installation request (`Request`), the resolved
//! component set (`ResolvedSet`), and the installation plan (`Plan`) with its
//! write/parse/validate invariants. Every error maps to a structured
//! [`Status`].

pub mod digest;
pub mod error;
pub mod manifest;
pub mod plan;
pub mod request;
pub mod resolved;
pub mod status;
pub mod tlv;
pub mod types;

pub use digest::{digest32, digest64, Digest64, Fnv64};
pub use error::{IntegrityError, SchemaError, ValidationError};
pub use manifest::{
    is_safe_relative_path, parse_manifest, parse_manifest_source_str, read_manifest_file,
    write_manifest, Artifact, Component, InstallRootDecl, LayoutTemplate, Manifest,
    ManifestSource,
};
pub use plan::{
    compute_plan_digest, parse_plan, read_plan_file, validate_plan, write_plan, write_plan_file,
    FileOp, Plan, PlanStep, Registrations,
};
pub use request::{
    parse_request, parse_request_source_str, read_request_file, write_request, Request,
    RequestBuilder, RequestSource,
};
pub use resolved::{ResolvedComponent, ResolvedSet};
pub use status::{HasStatus, Status, StatusCode, StatusDomain, USER_ACTIONABLE};
pub use tlv::{ParseError, UnknownRecord};
pub use types::{
    is_valid_platform_triple, target_matches, CapBits, ComponentId, ComponentKind,
    ComponentSource, FileOpKind, InstallScope, Operation, Ownership, PolicyFlags, SplatId,
    StepKind, UiMode,
};

use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `bytes` to `path` atomically: temp file in the same directory,
/// fsync, rename, then fsync the directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    if let Ok(f) = fs::File::open(dir) {
        let _ = f.sync_all();
    }
    Ok(())
}

/// Write the manifest's canonical bytes to `path`.
pub fn write_manifest_file(path: impl AsRef<Path>, manifest: &Manifest) -> Result<(), SchemaError> {
    write_atomic(path.as_ref(), &manifest.to_bytes())?;
    Ok(())
}

pub fn write_request_file(path: impl AsRef<Path>, request: &Request) -> Result<(), SchemaError> {
    write_atomic(path.as_ref(), &request.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
