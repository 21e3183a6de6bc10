//! Plan building: resolved components projected through layout templates.

use crate::refusal::Refusal;
use crate::resolve::resolve;
use crate::splat::{select_splat, SplatRegistry, SplatSelection};
use crate::CoreError;
use dsk_schema::{
    validate_plan, CapBits, Digest64, FileOp, FileOpKind, InstallScope, Manifest,
    Operation, Ownership, Plan, PlanStep, PolicyFlags, Registrations, Request, ResolvedSet,
    SplatId, StepKind, ValidationError,
};
use dsk_store::InstalledState;
use std::collections::BTreeMap;
use tracing::{debug, info};

const FINISHING_STEPS: [StepKind; 4] = [
    StepKind::CommitSwap,
    StepKind::RegisterActions,
    StepKind::WriteState,
    StepKind::WriteAudit,
];

/// Everything the planner decided, for diagnostics.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Plan,
    pub selection: SplatSelection,
    pub resolved: ResolvedSet,
}

/// A file op before install roots are final; roots are tracked by path.
struct PendingOp {
    root: String,
    op: FileOp,
}

/// Install roots a manifest declares for the request's scope and platform,
/// sorted. Falls back to `<scope>/<product_id>` when none match.
pub fn install_roots(manifest: &Manifest, scope: InstallScope, platform: &str) -> Vec<String> {
    let mut roots: Vec<String> = manifest
        .install_roots
        .iter()
        .filter(|r| r.scope == scope && r.platform == platform)
        .map(|r| r.path.clone())
        .collect();
    roots.sort();
    roots.dedup();
    if roots.is_empty() {
        roots.push(format!("{}/{}", scope.as_str(), manifest.product_id));
    }
    roots
}

/// Destination of an artifact: the template prefix joined with the file name
/// of its source path.
fn destination(prefix: &str, source_path: &str) -> String {
    let file_name = source_path.rsplit('/').next().unwrap_or(source_path);
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        file_name.to_owned()
    } else {
        format!("{prefix}/{file_name}")
    }
}

/// Build a sealed, validated plan.
///
/// `previous` is the installed state of an earlier apply, if any. Upgrade and
/// repair plans remove the files it owned that the new plan no longer
/// installs; uninstall plans remove them all.
pub fn build_plan(
    manifest: &Manifest,
    request: &Request,
    registry: &SplatRegistry,
    previous: Option<&InstalledState>,
) -> Result<PlanOutcome, CoreError> {
    manifest.validate()?;
    let mut request = request.clone();
    request.canonicalize();
    request.validate()?;

    let selection = select_splat(registry, manifest, &request)?;
    let splat = &selection.selected;
    let platform = request.target_platform.as_str();
    let resolved = resolve(manifest, &request, platform)?;
    info!(
        "planning {} {} for {platform}: {} components via {}",
        request.operation,
        manifest.product_id,
        resolved.components.len(),
        splat.id
    );

    let ownership = splat
        .caps
        .effective_ownership(request.ownership)
        .unwrap_or(Ownership::Portable);
    let manifest_roots = install_roots(manifest, request.install_scope, platform);

    // Keyed by (root, to) so duplicate destinations collapse for removals and
    // surface as a conflict for copies.
    let mut ops: BTreeMap<(String, String), PendingOp> = BTreeMap::new();
    for component in &resolved.components {
        let Some(decl) = manifest.component(&component.id) else {
            return Err(Refusal::ComponentNotFound(component.id.to_string()).into());
        };
        for artifact in &decl.artifacts {
            let template = manifest.template(&artifact.layout_template_id).ok_or_else(|| {
                ValidationError::UnresolvedLayoutTemplate {
                    artifact: artifact.id.clone(),
                    template: artifact.layout_template_id.clone(),
                }
            })?;
            let root = manifest_roots
                .get(template.target_root as usize)
                .ok_or_else(|| ValidationError::TemplateRootOutOfRange {
                    template: template.id.clone(),
                    index: template.target_root,
                    roots: manifest_roots.len(),
                })?
                .clone();
            let to = destination(&template.path_prefix, &artifact.source_path);
            let kind = if request.operation == Operation::Uninstall {
                FileOpKind::Remove
            } else {
                FileOpKind::Copy
            };
            let from = match kind {
                FileOpKind::Copy => artifact.source_path.clone(),
                FileOpKind::Remove => String::new(),
            };
            let pending = PendingOp {
                root: root.clone(),
                op: FileOp {
                    kind,
                    from,
                    to: to.clone(),
                    ownership,
                    digest64: artifact.digest64,
                    size: artifact.size,
                    target_root_id: 0,
                    component_id: component.id.normalized(),
                    artifact_id: artifact.id.clone(),
                },
            };
            if ops.insert((root, to.clone()), pending).is_some() {
                return Err(ValidationError::ConflictingFileOp(to).into());
            }
        }
    }

    if let Some(previous) = previous.filter(|_| request.operation != Operation::Install) {
        for (root, file) in previous.file_locations() {
            let key = (root.to_owned(), file.path.clone());
            if ops.contains_key(&key) {
                continue;
            }
            debug!("previous file {root}/{} is no longer installed", file.path);
            ops.insert(
                key,
                PendingOp {
                    root: root.to_owned(),
                    op: FileOp {
                        kind: FileOpKind::Remove,
                        from: String::new(),
                        to: file.path.clone(),
                        ownership: file.ownership,
                        digest64: file.digest64,
                        size: file.size,
                        target_root_id: 0,
                        component_id: file.component_id.clone(),
                        artifact_id: String::new(),
                    },
                },
            );
        }
    }

    let mut roots = manifest_roots;
    roots.extend(ops.values().map(|p| p.root.clone()));
    roots.sort();
    roots.dedup();

    let mut file_ops = Vec::with_capacity(ops.len());
    let mut steps = Vec::new();
    for PendingOp { root, mut op } in ops.into_values() {
        op.target_root_id = roots.binary_search(&root).unwrap_or_default() as u32;
        if op.kind == FileOpKind::Copy {
            for kind in [StepKind::StageArtifact, StepKind::VerifyHashes] {
                steps.push(PlanStep {
                    step_id: 0,
                    kind,
                    target_root_id: op.target_root_id,
                    component_id: op.component_id.clone(),
                    artifact_id: op.artifact_id.clone(),
                });
            }
        }
        file_ops.push(op);
    }
    steps.extend(FINISHING_STEPS.iter().map(|&kind| PlanStep {
        step_id: 0,
        kind,
        target_root_id: 0,
        component_id: String::new(),
        artifact_id: String::new(),
    }));

    let registrations = if request.operation == Operation::Uninstall {
        Registrations::default()
    } else {
        registrations(manifest, &request, &resolved, splat.caps.caps)
    };

    let mut plan = Plan {
        product_id: manifest.product_id.clone(),
        product_version: manifest.version.clone(),
        build_channel: manifest.build_channel.clone(),
        selected_splat: SplatId::new(splat.id.normalized()),
        splat_caps: splat.caps.caps,
        splat_caps_digest64: splat.caps_digest64,
        operation: request.operation,
        install_scope: request.install_scope,
        target_platform: request.target_platform.clone(),
        payload_root: request.payload_root.clone(),
        install_roots: roots,
        manifest_digest64: manifest.digest(),
        request_digest64: request.digest(),
        resolved_set_digest64: resolved.digest64,
        plan_digest64: Digest64::ZERO,
        resolved_components: resolved.components.clone(),
        ordered_steps: steps,
        file_ops,
        registrations,
    };
    plan.canonicalize();
    plan.seal();
    validate_plan(&plan)?;
    debug!(
        "plan {} sealed: {} steps, {} file ops",
        plan.plan_digest64,
        plan.ordered_steps.len(),
        plan.file_ops.len()
    );

    Ok(PlanOutcome {
        plan,
        selection,
        resolved,
    })
}

fn registrations(
    manifest: &Manifest,
    request: &Request,
    resolved: &ResolvedSet,
    splat_caps: CapBits,
) -> Registrations {
    let allowed = |policy: PolicyFlags, cap: CapBits| {
        request.policy_flags.contains(policy) && splat_caps.contains(cap)
    };
    let shortcuts = allowed(PolicyFlags::ENABLE_SHORTCUTS, CapBits::SHORTCUTS);
    let file_assoc = allowed(PolicyFlags::ENABLE_FILE_ASSOC, CapBits::FILE_ASSOC);
    let url_handlers = allowed(PolicyFlags::ENABLE_URL_HANDLERS, CapBits::URL_HANDLERS);

    let mut out = Registrations::default();
    for component in resolved
        .components
        .iter()
        .filter_map(|c| manifest.component(&c.id))
    {
        let id = component.id.normalized();
        let tagged = |entries: &[String]| -> Vec<String> {
            entries.iter().map(|e| format!("{id}:{e}")).collect()
        };
        if shortcuts {
            out.shortcuts.extend(tagged(&component.shortcuts));
        }
        if file_assoc {
            out.file_associations
                .extend(tagged(&component.file_associations));
        }
        if url_handlers {
            out.url_handlers.extend(tagged(&component.url_handlers));
        }
    }
    out.canonicalize();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsk_schema::{
        parse_plan, Artifact, Component, ComponentId, ComponentKind, InstallRootDecl,
        LayoutTemplate, RequestBuilder, SchemaError,
    };
    use dsk_store::InstalledFile;

    fn artifact(id: &str, source: &str, template: &str, bytes: &[u8]) -> Artifact {
        Artifact {
            id: id.to_owned(),
            digest64: Digest64::of(bytes),
            size: bytes.len() as u64,
            source_path: source.to_owned(),
            layout_template_id: template.to_owned(),
        }
    }

    fn component(id: &str, deps: &[&str], artifacts: Vec<Artifact>) -> Component {
        Component {
            id: ComponentId::new(id),
            version: None,
            kind: ComponentKind::Runtime,
            default_selected: true,
            deps: deps.iter().map(|s| (*s).to_owned()).collect(),
            conflicts: Vec::new(),
            supported_targets: Vec::new(),
            artifacts,
            shortcuts: vec!["launcher".to_owned()],
            file_associations: vec![".dsave".to_owned()],
            url_handlers: Vec::new(),
        }
    }

    fn sample() -> Manifest {
        let mut m = Manifest {
            product_id: "dominium".to_owned(),
            version: "1.0.0".to_owned(),
            build_channel: "stable".to_owned(),
            supported_targets: vec!["linux-x86_64".to_owned()],
            components: vec![
                component(
                    "core",
                    &["base"],
                    vec![artifact("core_bin", "bin/dominium", "bin", b"core v1")],
                ),
                component(
                    "base",
                    &[],
                    vec![
                        artifact("base_data", "data/base.pak", "data", b"base data"),
                        artifact("base_lib", "lib/libbase.so", "bin", b"base lib"),
                    ],
                ),
            ],
            layout_templates: vec![
                LayoutTemplate {
                    id: "bin".to_owned(),
                    target_root: 0,
                    path_prefix: "bin".to_owned(),
                },
                LayoutTemplate {
                    id: "data".to_owned(),
                    target_root: 0,
                    path_prefix: "share/data".to_owned(),
                },
            ],
            install_roots: Vec::new(),
            allowed_splats: Vec::new(),
            extensions: Vec::new(),
        };
        m.canonicalize();
        m
    }

    fn request(op: Operation) -> Request {
        RequestBuilder::new(op, InstallScope::User, "linux-x86_64")
            .payload_root("/payload")
            .build()
            .unwrap()
    }

    fn plan(op: Operation, previous: Option<&InstalledState>) -> Plan {
        build_plan(&sample(), &request(op), &SplatRegistry::builtin(), previous)
            .unwrap()
            .plan
    }

    #[test]
    fn install_plan_layout() {
        let p = plan(Operation::Install, None);
        assert_eq!(p.selected_splat, "linux_portable");
        assert_eq!(p.install_roots, vec!["user/dominium"]);
        let targets: Vec<&str> = p.file_ops.iter().map(|op| op.to.as_str()).collect();
        assert_eq!(
            targets,
            vec!["bin/dominium", "bin/libbase.so", "share/data/base.pak"]
        );
        assert!(p.file_ops.iter().all(|op| op.kind == FileOpKind::Copy));
        assert!(p.file_ops.iter().all(|op| op.ownership == Ownership::Portable));

        // Two steps per artifact plus four finishing steps.
        assert_eq!(p.ordered_steps.len(), 3 * 2 + 4);
        let first = &p.ordered_steps[0];
        assert_eq!(
            (first.step_id, first.kind, first.component_id.as_str(), first.artifact_id.as_str()),
            (1, StepKind::StageArtifact, "base", "base_data")
        );
        assert_eq!(p.ordered_steps[1].kind, StepKind::VerifyHashes);
        let tail: Vec<StepKind> = p.ordered_steps[6..].iter().map(|s| s.kind).collect();
        assert_eq!(tail, FINISHING_STEPS.to_vec());
        assert_eq!(p.ordered_steps.last().map(|s| s.step_id), Some(10));
    }

    #[test]
    fn every_stage_step_maps_to_one_op() {
        let p = plan(Operation::Install, None);
        for step in p.ordered_steps.iter().filter(|s| s.kind.is_per_artifact()) {
            let (_, op) = p.op_for_step(step).unwrap();
            assert_eq!(op.artifact_id, step.artifact_id);
        }
    }

    #[test]
    fn plan_is_deterministic_and_parses_back() {
        let a = plan(Operation::Install, None);
        let b = plan(Operation::Install, None);
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(parse_plan(&a.to_bytes()).unwrap(), a);
    }

    #[test]
    fn frontend_does_not_change_the_plan() {
        let registry = SplatRegistry::builtin();
        let cli = request(Operation::Install);
        let mut gui = cli.clone();
        gui.frontend_id = "gui-wizard".to_owned();
        let a = build_plan(&sample(), &cli, &registry, None).unwrap().plan;
        let b = build_plan(&sample(), &gui, &registry, None).unwrap().plan;
        assert_eq!(a.plan_digest64, b.plan_digest64);
        assert_eq!(a.request_digest64, b.request_digest64);
    }

    #[test]
    fn declared_roots_and_template_bounds() {
        let mut m = sample();
        m.install_roots = vec![InstallRootDecl {
            scope: InstallScope::User,
            platform: "linux-x86_64".to_owned(),
            path: "games/dominium".to_owned(),
        }];
        let p = build_plan(&m, &request(Operation::Install), &SplatRegistry::builtin(), None)
            .unwrap()
            .plan;
        assert_eq!(p.install_roots, vec!["games/dominium"]);

        m.layout_templates[0].target_root = 3;
        let err = build_plan(&m, &request(Operation::Install), &SplatRegistry::builtin(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::TemplateRootOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn missing_layout_template_fails() {
        let mut m = sample();
        m.layout_templates.retain(|t| t.id != "data");
        let err = build_plan(&m, &request(Operation::Install), &SplatRegistry::builtin(), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ValidationError::UnresolvedLayoutTemplate { .. })
                | CoreError::Schema(SchemaError::Validation(
                    ValidationError::UnresolvedLayoutTemplate { .. }
                ))
        ));
    }

    #[test]
    fn uninstall_removes_everything_without_stage_steps() {
        let p = plan(Operation::Uninstall, None);
        assert_eq!(p.file_ops.len(), 3);
        assert!(p.file_ops.iter().all(|op| op.kind == FileOpKind::Remove && op.from.is_empty()));
        let kinds: Vec<StepKind> = p.ordered_steps.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, FINISHING_STEPS.to_vec());
        assert!(p.registrations.is_empty());
    }

    #[test]
    fn upgrade_removes_stale_previous_files() {
        let mut previous = InstalledState::from_plan(&plan(Operation::Install, None));
        previous.files.push(InstalledFile {
            target_root_id: 0,
            path: "bin/old_tool".to_owned(),
            digest64: Digest64(7),
            size: 3,
            component_id: "core".to_owned(),
            ownership: Ownership::Portable,
        });
        let p = plan(Operation::Upgrade, Some(&previous));
        let removed: Vec<&str> = p
            .file_ops
            .iter()
            .filter(|op| op.kind == FileOpKind::Remove)
            .map(|op| op.to.as_str())
            .collect();
        assert_eq!(removed, vec!["bin/old_tool"]);

        // A fresh install ignores whatever state is lying around.
        let fresh = plan(Operation::Install, Some(&previous));
        assert!(fresh.file_ops.iter().all(|op| op.kind == FileOpKind::Copy));
    }

    #[test]
    fn registrations_need_policy_and_splat_support() {
        let registry = SplatRegistry::builtin();
        let r = RequestBuilder::new(Operation::Install, InstallScope::User, "linux-x86_64")
            .payload_root("/payload")
            .policy(PolicyFlags::ENABLE_SHORTCUTS | PolicyFlags::ENABLE_FILE_ASSOC)
            .build()
            .unwrap();
        let p = build_plan(&sample(), &r, &registry, None).unwrap().plan;
        assert_eq!(p.registrations.shortcuts, vec!["base:launcher", "core:launcher"]);
        // linux_portable cannot register file associations.
        assert!(p.registrations.file_associations.is_empty());

        let quiet = build_plan(&sample(), &request(Operation::Install), &registry, None)
            .unwrap()
            .plan;
        assert!(quiet.registrations.is_empty());
    }

    #[test]
    fn refusals_propagate() {
        let r = RequestBuilder::new(Operation::Install, InstallScope::User, "linux-x86_64")
            .request("nonexistent")
            .build()
            .unwrap();
        let err = build_plan(&sample(), &r, &SplatRegistry::builtin(), None).unwrap_err();
        assert!(matches!(err, CoreError::Refusal(Refusal::ComponentNotFound(_))));
    }

    #[test]
    fn destination_joins_prefix_and_file_name() {
        assert_eq!(destination("bin", "build/out/dominium"), "bin/dominium");
        assert_eq!(destination("", "data/base.pak"), "base.pak");
        assert_eq!(destination("share/", "x"), "share/x");
    }
}
