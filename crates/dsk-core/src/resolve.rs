//! Dependency resolution.
//!
//! Six steps, in this order: seed the selection, drop exclusions, close over
//! dependencies, check conflicts, prune components the target platform cannot
//! run, then sort canonically. Any refusal aborts with no partial result.

use crate::refusal::Refusal;
use dsk_schema::{
    target_matches, Component, ComponentSource, Manifest, Operation, Request, ResolvedComponent,
    ResolvedSet,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

fn lookup<'m>(manifest: &'m Manifest, id: &str) -> Result<&'m Component, Refusal> {
    manifest
        .component(id)
        .ok_or_else(|| Refusal::ComponentNotFound(id.to_owned()))
}

fn supports(component: &Component, platform: &str) -> bool {
    component.supported_targets.is_empty()
        || component
            .supported_targets
            .iter()
            .any(|t| target_matches(t, platform))
}

/// Resolve the component set a request selects on `platform`.
///
/// For uninstall the seed is every declared component, so the resulting plan
/// removes the complete payload.
pub fn resolve(
    manifest: &Manifest,
    request: &Request,
    platform: &str,
) -> Result<ResolvedSet, Refusal> {
    // Keyed by normalized id so iteration order is canonical.
    let mut selected: BTreeMap<String, (&Component, ComponentSource)> = BTreeMap::new();

    // 1. Seed.
    for id in &request.requested_components {
        let component = lookup(manifest, id)?;
        if request.operation != Operation::Uninstall {
            selected.insert(component.id.normalized(), (component, ComponentSource::User));
        }
    }
    if request.operation == Operation::Uninstall {
        for component in &manifest.components {
            selected.insert(component.id.normalized(), (component, ComponentSource::Default));
        }
    } else if request.requested_components.is_empty() {
        for component in manifest.components.iter().filter(|c| c.default_selected) {
            selected.insert(component.id.normalized(), (component, ComponentSource::Default));
        }
    }

    // 2. Exclusions.
    let mut excluded = BTreeSet::new();
    for id in &request.excluded_components {
        let component = lookup(manifest, id)?;
        let key = component.id.normalized();
        selected.remove(&key);
        excluded.insert(key);
    }

    // 3. Dependency closure, to a fixed point.
    loop {
        let mut added = Vec::new();
        for (component, _) in selected.values() {
            for dep in &component.deps {
                let key = dep.to_ascii_lowercase();
                if selected.contains_key(&key) || added.iter().any(|(k, _)| *k == key) {
                    continue;
                }
                if excluded.contains(&key) {
                    return Err(Refusal::UnsatisfiedDependency {
                        component: component.id.to_string(),
                        dependency: dep.clone(),
                        reason: "excluded by the request",
                    });
                }
                let Some(target) = manifest.component(dep) else {
                    return Err(Refusal::UnsatisfiedDependency {
                        component: component.id.to_string(),
                        dependency: dep.clone(),
                        reason: "not declared by the manifest",
                    });
                };
                added.push((key, target));
            }
        }
        if added.is_empty() {
            break;
        }
        for (key, component) in added {
            debug!("dependency pulled in: {}", component.id);
            selected.insert(key, (component, ComponentSource::Dependency));
        }
    }

    // 4. Conflicts. An uninstall removes everything regardless.
    let check_conflicts = request.operation != Operation::Uninstall;
    for (key, (component, _)) in selected.iter().filter(|_| check_conflicts) {
        for other in &component.conflicts {
            let other_key = other.to_ascii_lowercase();
            if other_key != *key && selected.contains_key(&other_key) {
                return Err(Refusal::ExplicitConflict {
                    component: component.id.to_string(),
                    other: other.clone(),
                });
            }
        }
    }

    // 5. Platform pruning.
    let incompatible: BTreeSet<String> = selected
        .iter()
        .filter(|(_, (c, _))| !supports(c, platform))
        .map(|(k, _)| k.clone())
        .collect();
    for key in &incompatible {
        let (component, source) = selected[key];
        if source == ComponentSource::User {
            return Err(Refusal::PlatformIncompatible {
                component: component.id.to_string(),
                platform: platform.to_owned(),
                required_by: None,
            });
        }
        for (dependent_key, (dependent, _)) in &selected {
            if incompatible.contains(dependent_key) {
                continue;
            }
            if depends_on(&selected, dependent_key, key) {
                return Err(Refusal::PlatformIncompatible {
                    component: component.id.to_string(),
                    platform: platform.to_owned(),
                    required_by: Some(dependent.id.to_string()),
                });
            }
        }
    }
    for key in &incompatible {
        debug!("dropping {key}: unsupported on {platform}");
        selected.remove(key);
    }

    // 6. Canonical order and digest.
    let components = selected
        .into_values()
        .map(|(c, source)| ResolvedComponent {
            id: c.id.clone(),
            version: c.effective_version(manifest).to_owned(),
            kind: c.kind,
            source,
        })
        .collect();
    Ok(ResolvedSet::new(components))
}

/// Whether `from` reaches `to` through the dependency edges of the selection.
fn depends_on(
    selected: &BTreeMap<String, (&Component, ComponentSource)>,
    from: &str,
    to: &str,
) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from.to_owned()];
    while let Some(key) = stack.pop() {
        let Some((component, _)) = selected.get(&key) else {
            continue;
        };
        for dep in &component.deps {
            let dep_key = dep.to_ascii_lowercase();
            if dep_key == to {
                return true;
            }
            if seen.insert(dep_key.clone()) {
                stack.push(dep_key);
            }
        }
    }
    false
}
