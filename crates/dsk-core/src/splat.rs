//! Splat registry and selection.
//!
//! A splat is an installer variant (Debian package, MSI, portable zip, ...)
//! with a declared capability descriptor. Selection evaluates every candidate
//! against the manifest and request, records a typed rejection for each one
//! that does not qualify, and picks the requested splat or the first
//! compatible one in manifest order.

use crate::refusal::Refusal;
use dsk_schema::tlv::TlvWriter;
use dsk_schema::{
    digest64, target_matches, CapBits, Digest64, InstallScope, Manifest, Ownership, Request,
    SplatId, UiMode,
};
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootConvention {
    /// Self-contained directory chosen by the operator.
    Portable,
    /// Per-user application directory.
    UserLocal,
    /// System-wide program directory, usually needing elevation.
    SystemPrograms,
}

impl RootConvention {
    fn as_u8(self) -> u8 {
        match self {
            RootConvention::Portable => 1,
            RootConvention::UserLocal => 2,
            RootConvention::SystemPrograms => 3,
        }
    }
}

/// Capability descriptor of one splat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplatCaps {
    /// Target tokens: full triples, bare os tokens, or `any`.
    pub platforms: Vec<String>,
    pub scopes: Vec<InstallScope>,
    pub ui_modes: Vec<UiMode>,
    /// Ownership models the splat can install with; `Any` never appears here.
    pub ownership: Vec<Ownership>,
    /// Atomic-swap, resume, rollback and elevation support plus the
    /// registration action bits.
    pub caps: CapBits,
    pub root_convention: RootConvention,
}

mod tag {
    pub const PLATFORMS: u16 = 0x0001;
    pub const SCOPES: u16 = 0x0002;
    pub const UI_MODES: u16 = 0x0003;
    pub const OWNERSHIP: u16 = 0x0004;
    pub const CAPS: u16 = 0x0005;
    pub const ROOT_CONVENTION: u16 = 0x0006;
    pub const ITEM: u16 = 0x0100;
}

impl SplatCaps {
    /// FNV-1a 64 of the canonical TLV encoding.
    pub fn digest(&self) -> Digest64 {
        let mut platforms = self.platforms.clone();
        platforms.sort();
        platforms.dedup();
        let mut w = TlvWriter::new();
        w.write_str_list(tag::PLATFORMS, tag::ITEM, &platforms);
        w.write_container(tag::SCOPES, |list| {
            for scope in sorted(&self.scopes) {
                list.write_u8(tag::ITEM, scope.as_u8());
            }
        });
        w.write_container(tag::UI_MODES, |list| {
            for mode in sorted(&self.ui_modes) {
                list.write_u8(tag::ITEM, mode.as_u8());
            }
        });
        w.write_container(tag::OWNERSHIP, |list| {
            for o in sorted(&self.ownership) {
                list.write_u8(tag::ITEM, o.as_u8());
            }
        });
        w.write_u32(tag::CAPS, self.caps.bits());
        w.write_u8(tag::ROOT_CONVENTION, self.root_convention.as_u8());
        Digest64(digest64(w.as_bytes()))
    }

    pub fn supports_platform(&self, triple: &str) -> bool {
        self.platforms.iter().any(|t| target_matches(t, triple))
    }

    /// Ownership the splat installs with for the given preference.
    pub fn effective_ownership(&self, preferred: Ownership) -> Option<Ownership> {
        if preferred != Ownership::Any {
            return self.ownership.contains(&preferred).then_some(preferred);
        }
        [Ownership::Pkg, Ownership::Portable]
            .into_iter()
            .find(|o| self.ownership.contains(o))
    }
}

fn sorted<T: Ord + Copy>(items: &[T]) -> Vec<T> {
    let mut v = items.to_vec();
    v.sort();
    v.dedup();
    v
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplatCandidate {
    pub id: SplatId,
    pub caps: SplatCaps,
    pub caps_digest64: Digest64,
}

impl SplatCandidate {
    pub fn new(id: impl Into<String>, caps: SplatCaps) -> Self {
        let caps_digest64 = caps.digest();
        Self {
            id: SplatId::new(id),
            caps,
            caps_digest64,
        }
    }
}

/// Ordered set of known splats, passed explicitly to the selector.
#[derive(Debug, Clone, Default)]
pub struct SplatRegistry {
    candidates: Vec<SplatCandidate>,
}

impl SplatRegistry {
    pub fn new(candidates: Vec<SplatCandidate>) -> Self {
        Self { candidates }
    }

    /// The splats this build knows how to drive, in id order.
    pub fn builtin() -> Self {
        use InstallScope::{Portable, System, User};
        use UiMode::{Cli, Gui, Tui};
        let all_ui = vec![Gui, Tui, Cli];
        let pkg_caps = CapBits::RESUME
            | CapBits::ROLLBACK
            | CapBits::ELEVATION
            | CapBits::SHORTCUTS
            | CapBits::FILE_ASSOC
            | CapBits::URL_HANDLERS;
        Self::new(vec![
            SplatCandidate::new(
                "linux_deb",
                SplatCaps {
                    platforms: vec!["linux_deb".to_owned()],
                    scopes: vec![System],
                    ui_modes: all_ui.clone(),
                    ownership: vec![Ownership::Pkg],
                    caps: pkg_caps,
                    root_convention: RootConvention::SystemPrograms,
                },
            ),
            SplatCandidate::new(
                "linux_portable",
                SplatCaps {
                    platforms: vec![
                        "linux".to_owned(),
                        "linux_deb".to_owned(),
                        "linux_rpm".to_owned(),
                    ],
                    scopes: vec![Portable, User],
                    ui_modes: all_ui.clone(),
                    ownership: vec![Ownership::Portable],
                    caps: CapBits::RESUME | CapBits::ROLLBACK | CapBits::SHORTCUTS,
                    root_convention: RootConvention::UserLocal,
                },
            ),
            SplatCandidate::new(
                "macos_pkg",
                SplatCaps {
                    platforms: vec!["macos".to_owned()],
                    scopes: vec![User, System],
                    ui_modes: all_ui.clone(),
                    ownership: vec![Ownership::Pkg],
                    caps: pkg_caps,
                    root_convention: RootConvention::SystemPrograms,
                },
            ),
            SplatCandidate::new(
                "portable_zip",
                SplatCaps {
                    platforms: vec!["any".to_owned()],
                    scopes: vec![Portable, User],
                    ui_modes: all_ui.clone(),
                    ownership: vec![Ownership::Portable],
                    caps: CapBits::ATOMIC_SWAP | CapBits::RESUME | CapBits::ROLLBACK,
                    root_convention: RootConvention::Portable,
                },
            ),
            SplatCandidate::new(
                "win32_msi",
                SplatCaps {
                    platforms: vec!["win32".to_owned(), "win32_nt6".to_owned(), "win64".to_owned()],
                    scopes: vec![User, System],
                    ui_modes: all_ui,
                    ownership: vec![Ownership::Pkg],
                    caps: pkg_caps,
                    root_convention: RootConvention::SystemPrograms,
                },
            ),
            SplatCandidate::new(
                "win32_nt5",
                SplatCaps {
                    platforms: vec!["win32_nt5".to_owned()],
                    scopes: vec![Portable, User, System],
                    ui_modes: vec![Gui, Cli],
                    ownership: vec![Ownership::Portable],
                    caps: CapBits::RESUME
                        | CapBits::ROLLBACK
                        | CapBits::SHORTCUTS
                        | CapBits::FILE_ASSOC,
                    root_convention: RootConvention::UserLocal,
                },
            ),
        ])
    }

    pub fn find(&self, id: &str) -> Option<&SplatCandidate> {
        self.candidates.iter().find(|c| c.id.eq_ignore_case(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplatCandidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    RequestedIdMismatch,
    PlatformUnsupported,
    ScopeUnsupported,
    UiModeUnsupported,
    OwnershipIncompatible,
    ManifestAllowlist,
    RequiredCapsMissing,
    ProhibitedCapsPresent,
    ManifestTargetMismatch,
}

impl RejectCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectCode::RequestedIdMismatch => "requested_id_mismatch",
            RejectCode::PlatformUnsupported => "platform_unsupported",
            RejectCode::ScopeUnsupported => "scope_unsupported",
            RejectCode::UiModeUnsupported => "ui_mode_unsupported",
            RejectCode::OwnershipIncompatible => "ownership_incompatible",
            RejectCode::ManifestAllowlist => "manifest_allowlist",
            RejectCode::RequiredCapsMissing => "required_caps_missing",
            RejectCode::ProhibitedCapsPresent => "prohibited_caps_present",
            RejectCode::ManifestTargetMismatch => "manifest_target_mismatch",
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    pub splat_id: SplatId,
    pub code: RejectCode,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    Requested,
    FirstCompatible,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplatSelection {
    pub considered: Vec<SplatId>,
    pub rejections: Vec<Rejection>,
    pub selected: SplatCandidate,
    pub reason: SelectionReason,
}

/// First failing check for one candidate, in the fixed check order.
fn check_candidate(
    candidate: &SplatCandidate,
    manifest: &Manifest,
    request: &Request,
) -> Option<(RejectCode, String)> {
    let caps = &candidate.caps;

    if let Some(wanted) = &request.requested_splat {
        if !candidate.id.eq_ignore_case(wanted) {
            return Some((
                RejectCode::RequestedIdMismatch,
                format!("request names splat '{wanted}'"),
            ));
        }
    }
    if !caps.supports_platform(&request.target_platform) {
        return Some((
            RejectCode::PlatformUnsupported,
            format!("platform '{}' not supported", request.target_platform),
        ));
    }
    if !caps.scopes.contains(&request.install_scope) {
        return Some((
            RejectCode::ScopeUnsupported,
            format!("scope '{}' not supported", request.install_scope),
        ));
    }
    if !caps.ui_modes.contains(&request.ui_mode) {
        return Some((
            RejectCode::UiModeUnsupported,
            format!("ui mode '{}' not supported", request.ui_mode),
        ));
    }
    if caps.effective_ownership(request.ownership).is_none() {
        return Some((
            RejectCode::OwnershipIncompatible,
            format!("ownership '{}' not supported", request.ownership),
        ));
    }
    if !manifest.allowed_splats.is_empty()
        && !manifest
            .allowed_splats
            .iter()
            .any(|s| s.eq_ignore_case(&candidate.id))
    {
        return Some((
            RejectCode::ManifestAllowlist,
            "not in the manifest's splat allowlist".to_owned(),
        ));
    }
    if !caps.caps.contains(request.required_caps) {
        let missing = CapBits::from_bits(request.required_caps.bits() & !caps.caps.bits());
        return Some((
            RejectCode::RequiredCapsMissing,
            format!("missing required caps [{}]", missing.names().join(", ")),
        ));
    }
    if caps.caps.intersects(request.prohibited_caps) {
        let present = CapBits::from_bits(request.prohibited_caps.bits() & caps.caps.bits());
        return Some((
            RejectCode::ProhibitedCapsPresent,
            format!("has prohibited caps [{}]", present.names().join(", ")),
        ));
    }
    if !manifest.supported_targets.is_empty()
        && !manifest
            .supported_targets
            .iter()
            .any(|target| caps.supports_platform(target))
    {
        return Some((
            RejectCode::ManifestTargetMismatch,
            format!(
                "supports none of the manifest targets [{}]",
                manifest.supported_targets.join(", ")
            ),
        ));
    }
    None
}

/// Select the splat to install with.
///
/// Every candidate is evaluated so that all rejections are available for
/// diagnostics, even once a compatible one has been seen.
pub fn select_splat(
    registry: &SplatRegistry,
    manifest: &Manifest,
    request: &Request,
) -> Result<SplatSelection, Refusal> {
    let mut considered = Vec::with_capacity(registry.len());
    let mut rejections = Vec::new();
    let mut compatible: Vec<&SplatCandidate> = Vec::new();

    for candidate in registry.iter() {
        considered.push(candidate.id.clone());
        match check_candidate(candidate, manifest, request) {
            Some((code, detail)) => {
                debug!("splat {} rejected: {code} ({detail})", candidate.id);
                rejections.push(Rejection {
                    splat_id: candidate.id.clone(),
                    code,
                    detail,
                });
            }
            None => compatible.push(candidate),
        }
    }

    let picked = if let Some(wanted) = &request.requested_splat {
        compatible
            .iter()
            .find(|c| c.id.eq_ignore_case(wanted))
            .map(|c| (*c, SelectionReason::Requested))
    } else if manifest.allowed_splats.is_empty() {
        compatible
            .first()
            .map(|c| (*c, SelectionReason::FirstCompatible))
    } else {
        manifest.allowed_splats.iter().find_map(|allowed| {
            compatible
                .iter()
                .find(|c| c.id.eq_ignore_case(allowed))
                .map(|c| (*c, SelectionReason::FirstCompatible))
        })
    };

    match picked {
        Some((candidate, reason)) => {
            debug!("selected splat {} ({reason:?})", candidate.id);
            Ok(SplatSelection {
                considered,
                rejections,
                selected: candidate.clone(),
                reason,
            })
        }
        None => {
            let detail = if rejections.is_empty() {
                "the splat registry is empty".to_owned()
            } else {
                rejections
                    .iter()
                    .map(|r| format!("{}: {} ({})", r.splat_id, r.code, r.detail))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            Err(Refusal::SplatNotFound { detail, rejections })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsk_schema::{Operation, RequestBuilder};

    fn manifest(targets: &[&str], allowed: &[&str]) -> Manifest {
        Manifest {
            product_id: "dominium".to_owned(),
            version: "1.0".to_owned(),
            build_channel: "stable".to_owned(),
            supported_targets: targets.iter().map(|s| (*s).to_owned()).collect(),
            components: Vec::new(),
            layout_templates: Vec::new(),
            install_roots: Vec::new(),
            allowed_splats: allowed.iter().map(|s| SplatId::new(*s)).collect(),
            extensions: Vec::new(),
        }
    }

    fn request(scope: InstallScope, platform: &str) -> RequestBuilder {
        RequestBuilder::new(Operation::Install, scope, platform)
    }

    fn rejection<'a>(sel: &'a SplatSelection, id: &str) -> Option<&'a Rejection> {
        sel.rejections.iter().find(|r| r.splat_id == id)
    }

    #[test]
    fn caps_digest_is_order_independent() {
        let registry = SplatRegistry::builtin();
        let mut caps = registry.find("win32_nt5").unwrap().caps.clone();
        let before = caps.digest();
        caps.scopes.reverse();
        caps.ui_modes.reverse();
        assert_eq!(caps.digest(), before);
        caps.caps.insert(CapBits::ATOMIC_SWAP);
        assert_ne!(caps.digest(), before);
    }

    #[test]
    fn first_compatible_in_registry_order() {
        let m = manifest(&["linux_deb-x86_64"], &[]);
        let r = request(InstallScope::User, "linux_deb-x86_64").build().unwrap();
        let sel = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap();
        assert_eq!(sel.selected.id, "linux_portable");
        assert_eq!(sel.reason, SelectionReason::FirstCompatible);
        assert_eq!(sel.considered.len(), 6);
        assert_eq!(
            rejection(&sel, "linux_deb").unwrap().code,
            RejectCode::ScopeUnsupported
        );
        assert_eq!(
            rejection(&sel, "win32_msi").unwrap().code,
            RejectCode::PlatformUnsupported
        );
        // Compatible but not chosen: no rejection recorded.
        assert!(rejection(&sel, "portable_zip").is_none());
    }

    #[test]
    fn requested_splat_wins_and_others_are_rejected_by_id() {
        let m = manifest(&["linux_deb-x86_64"], &[]);
        let r = request(InstallScope::User, "linux_deb-x86_64")
            .splat("portable_zip")
            .build()
            .unwrap();
        let sel = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap();
        assert_eq!(sel.selected.id, "portable_zip");
        assert_eq!(sel.reason, SelectionReason::Requested);
        assert_eq!(sel.rejections.len(), 5);
        assert!(sel
            .rejections
            .iter()
            .all(|r| r.code == RejectCode::RequestedIdMismatch));
    }

    #[test]
    fn allowlist_order_decides() {
        let m = manifest(&["linux_deb-x86_64"], &["portable_zip", "linux_portable"]);
        let r = request(InstallScope::User, "linux_deb-x86_64").build().unwrap();
        let sel = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap();
        assert_eq!(sel.selected.id, "portable_zip");
        assert_eq!(
            rejection(&sel, "macos_pkg").unwrap().code,
            RejectCode::PlatformUnsupported
        );
    }

    #[test]
    fn checks_run_in_order() {
        let m = manifest(&["macos-arm64"], &["linux_portable"]);
        let r = request(InstallScope::User, "linux_deb-x86_64")
            .ui_mode(UiMode::Tui)
            .prohibit_caps(CapBits::SHORTCUTS)
            .build()
            .unwrap();
        let err = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap_err();
        let Refusal::SplatNotFound { rejections, detail } = err else {
            panic!("expected SplatNotFound");
        };
        let code = |id: &str| rejections.iter().find(|r| r.splat_id == id).unwrap().code;
        assert_eq!(code("linux_portable"), RejectCode::ProhibitedCapsPresent);
        assert_eq!(code("portable_zip"), RejectCode::ManifestAllowlist);
        assert_eq!(code("win32_nt5"), RejectCode::PlatformUnsupported);
        assert!(detail.contains("linux_portable: prohibited_caps_present"));
    }

    #[test]
    fn required_caps_filter_candidates() {
        let m = manifest(&["macos-arm64"], &[]);
        let r = request(InstallScope::Portable, "linux-x86_64")
            .require_caps(CapBits::ATOMIC_SWAP)
            .build()
            .unwrap();
        let sel = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap();
        assert_eq!(sel.selected.id, "portable_zip");
        assert_eq!(
            rejection(&sel, "linux_portable").unwrap().code,
            RejectCode::RequiredCapsMissing
        );
    }

    #[test]
    fn manifest_target_mismatch_is_last_check() {
        let m = manifest(&["win32_nt5-x86"], &[]);
        let r = request(InstallScope::User, "linux_deb-x86_64")
            .prohibit_caps(CapBits::ATOMIC_SWAP)
            .build()
            .unwrap();
        let err = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap_err();
        let Refusal::SplatNotFound { rejections, .. } = err else {
            panic!("expected SplatNotFound");
        };
        let code = |id: &str| rejections.iter().find(|r| r.splat_id == id).unwrap().code;
        assert_eq!(code("linux_portable"), RejectCode::ManifestTargetMismatch);
        assert_eq!(code("portable_zip"), RejectCode::ProhibitedCapsPresent);
        assert_eq!(rejections.len(), 6);
    }

    #[test]
    fn ownership_preference() {
        let m = manifest(&[], &[]);
        let r = request(InstallScope::System, "linux_deb-x86_64")
            .ownership(Ownership::Portable)
            .build()
            .unwrap();
        let err = select_splat(&SplatRegistry::builtin(), &m, &r).unwrap_err();
        let Refusal::SplatNotFound { rejections, .. } = err else {
            panic!("expected SplatNotFound");
        };
        assert_eq!(
            rejections.iter().find(|r| r.splat_id == "linux_deb").unwrap().code,
            RejectCode::OwnershipIncompatible
        );
    }
}
