use crate::digest::{Digest64, Fnv64};
use crate::types::{ComponentId, ComponentKind, ComponentSource};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedComponent {
    pub id: ComponentId,
    pub version: String,
    pub kind: ComponentKind,
    pub source: ComponentSource,
}

/// Canonical, dependency-closed, conflict-free component selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedSet {
    pub components: Vec<ResolvedComponent>,
    pub digest64: Digest64,
}

impl ResolvedSet {
    /// Sort into canonical order and stamp the digest.
    pub fn new(mut components: Vec<ResolvedComponent>) -> Self {
        sort_components(&mut components);
        let digest64 = resolved_digest(&components);
        Self {
            components,
            digest64,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.components.iter().any(|c| c.id.eq_ignore_case(id))
    }

    pub fn ids(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.id.as_str()).collect()
    }
}

pub fn sort_components(components: &mut [ResolvedComponent]) {
    components.sort_by(|a, b| canonical_key(a).cmp(&canonical_key(b)));
}

pub fn canonical_key(c: &ResolvedComponent) -> (String, &str) {
    (c.id.normalized(), c.version.as_str())
}

/// Digest over the canonical ordering. Selection source is not part of the
/// identity: a component chosen by default and the same component chosen
/// explicitly hash the same.
pub fn resolved_digest(components: &[ResolvedComponent]) -> Digest64 {
    let mut h = Fnv64::new();
    for c in components {
        h.write_str(&c.id.normalized());
        h.write_sep();
        h.write_str(&c.version);
        h.write_sep();
        h.write_u8(c.kind.as_u8());
        h.write_sep();
    }
    Digest64(h.finish())
}
