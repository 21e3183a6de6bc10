//! Crash recovery through failpoints.
//!
//! Each test arms a named checkpoint, lets the engine "crash" there, and then
//! checks that resume converges on exactly what an uninterrupted apply
//! produces, or that rollback restores exactly what was there before.

use dsk_core::failpoint::{self, Failpoints};
use dsk_core::{build_plan, CoreError, Engine, SplatRegistry};
use dsk_schema::{
    Artifact, Component, ComponentId, ComponentKind, Digest64, InstallScope, LayoutTemplate,
    Manifest, Operation, Plan, PolicyFlags, RequestBuilder,
};
use dsk_store::{
    FileSystem, InstalledState, JobJournal, JournalStatus, MemoryFs, RegistrationRecord,
    StateLayout,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const PAYLOAD: &str = "/payload";

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
        default_selected: id == "core",
        deps: deps.iter().map(|d| (*d).to_owned()).collect(),
        conflicts: Vec::new(),
        supported_targets: Vec::new(),
        artifacts,
        shortcuts: vec![format!("{id}-launcher")],
        file_associations: Vec::new(),
        url_handlers: Vec::new(),
    }
}

/// Write version `v` of the payload into `fs` and describe it.
fn product(fs: &dyn FileSystem, v: &str) -> Manifest {
    let root = Path::new(PAYLOAD).join(v);
    let files = [
        ("bin/dominium", format!("dominium engine {v}")),
        ("bin/libcore.so", format!("core library {v}")),
        ("data/base.pak", format!("base data {v}")),
    ];
    for (path, content) in &files {
        fs.write_file_bytes_atomic(&root.join(path), content.as_bytes())
            .unwrap();
    }
    let mut manifest = Manifest {
        product_id: "dominium".to_owned(),
        version: v.to_owned(),
        build_channel: "stable".to_owned(),
        supported_targets: vec!["linux-x86_64".to_owned()],
        components: vec![
            component(
                "core",
                &["base"],
                vec![
                    artifact("engine", files[0].0, "bin", files[0].1.as_bytes()),
                    artifact("lib", files[1].0, "bin", files[1].1.as_bytes()),
                ],
            ),
            component(
                "base",
                &[],
                vec![artifact("data", files[2].0, "data", files[2].1.as_bytes())],
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
                path_prefix: "share".to_owned(),
            },
        ],
        install_roots: Vec::new(),
        allowed_splats: Vec::new(),
        extensions: Vec::new(),
    };
    manifest.canonicalize();
    manifest
}

fn plan_for(fs: &dyn FileSystem, op: Operation, v: &str) -> Plan {
    let manifest = product(fs, v);
    let mut builder = RequestBuilder::new(op, InstallScope::User, "linux-x86_64")
        .payload_root(format!("{PAYLOAD}/{v}"));
    // 2.0 ships without desktop shortcuts.
    if v == "1.0" {
        builder = builder.policy(PolicyFlags::ENABLE_SHORTCUTS);
    }
    let request = builder.build().unwrap();
    let layout = layout(fs);
    let previous = InstalledState::load(fs, &layout.state_path()).unwrap();
    build_plan(&manifest, &request, &SplatRegistry::builtin(), previous.as_ref())
        .unwrap()
        .plan
}

fn layout(fs: &dyn FileSystem) -> StateLayout {
    StateLayout::new(&fs.user_scope_paths(), "dominium")
}

/// Every live file under the user install base, leaving out scratch space.
fn live_tree(fs: &MemoryFs) -> BTreeMap<PathBuf, Vec<u8>> {
    let base = fs.user_scope_paths().install_base;
    let scratch = layout(fs).scratch_dir().to_path_buf();
    fs.snapshot()
        .into_iter()
        .filter(|(p, _)| p.starts_with(&base) && !p.starts_with(&scratch))
        .collect()
}

fn registrations(fs: &MemoryFs) -> Option<RegistrationRecord> {
    RegistrationRecord::load(fs, &layout(fs).registrations_path()).unwrap()
}

fn state_bytes(fs: &MemoryFs) -> Option<Vec<u8>> {
    let layout = layout(fs);
    fs.read_file_bytes(&layout.state_path()).ok()
}

fn crash_at(fs: &MemoryFs, plan: &Plan, point: &str) {
    let engine = Engine::new(fs).with_failpoints(Failpoints::none().with(point));
    let err = engine.apply(plan, false).unwrap_err();
    assert!(
        matches!(&err, CoreError::Failpoint(name) if name == point),
        "expected a crash at {point}, got {err}"
    );
}

fn clean_install() -> MemoryFs {
    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    Engine::new(&fs).apply(&plan, false).unwrap();
    fs
}

fn assert_resume_matches_clean_apply(point: &str) {
    let reference = clean_install();

    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    crash_at(&fs, &plan, point);
    let report = Engine::new(&fs).resume(&plan).unwrap();
    assert!(report.resumed);

    assert_eq!(live_tree(&fs), live_tree(&reference));
    assert_eq!(state_bytes(&fs), state_bytes(&reference));
    let layout = layout(&fs);
    let journal = JobJournal::load(&fs, &layout.journal_path()).unwrap().unwrap();
    assert_eq!(journal.status(), JournalStatus::Completed);
    assert!(!fs.exists(layout.scratch_dir()));
    assert_eq!(registrations(&fs), registrations(&reference));
}

#[test]
fn resume_after_stage_extract() {
    assert_resume_matches_clean_apply(failpoint::AFTER_STAGE_EXTRACT);
}

#[test]
fn resume_mid_commit() {
    assert_resume_matches_clean_apply(&failpoint::mid_commit_step(2));
}

#[test]
fn resume_after_verify_and_around_state_writes() {
    for point in [
        failpoint::AFTER_VERIFY,
        failpoint::BEFORE_WRITE_STATE,
        failpoint::AFTER_WRITE_STATE,
        failpoint::BEFORE_WRITE_AUDIT,
    ] {
        assert_resume_matches_clean_apply(point);
    }
}

#[test]
fn resume_redoes_staging_that_was_lost() {
    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    crash_at(&fs, &plan, failpoint::AFTER_VERIFY);
    let layout = layout(&fs);
    fs.remove_dir_all(&layout.staging_dir()).unwrap();

    Engine::new(&fs).resume(&plan).unwrap();
    assert_eq!(live_tree(&fs), live_tree(&clean_install()));
}

#[test]
fn rollback_of_fresh_install_leaves_nothing() {
    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    crash_at(&fs, &plan, &failpoint::mid_commit_step(2));
    assert_eq!(live_tree(&fs).len(), 2);

    let report = Engine::new(&fs).rollback(&plan).unwrap();
    assert_eq!(report.removed, 2);
    assert!(live_tree(&fs).is_empty());
    assert!(state_bytes(&fs).is_none());
    assert!(!fs.exists(layout(&fs).scratch_dir()));
}

#[test]
fn rollback_mid_commit_restores_exact_bytes() {
    let fs = clean_install();
    let before = live_tree(&fs);
    let state_before = state_bytes(&fs);

    let upgrade = plan_for(&fs, Operation::Upgrade, "2.0");
    crash_at(&fs, &upgrade, &failpoint::mid_commit_step(2));
    assert_ne!(live_tree(&fs), before);

    let report = Engine::new(&fs).rollback(&upgrade).unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(live_tree(&fs), before);
    assert_eq!(state_bytes(&fs), state_before);
}

#[test]
fn rollback_after_state_write_restores_previous_state() {
    let fs = clean_install();
    let before = live_tree(&fs);
    let state_before = state_bytes(&fs);

    let upgrade = plan_for(&fs, Operation::Upgrade, "2.0");
    crash_at(&fs, &upgrade, failpoint::AFTER_WRITE_STATE);
    assert_ne!(state_bytes(&fs), state_before);

    let report = Engine::new(&fs).rollback(&upgrade).unwrap();
    assert!(report.state_restored);
    assert_eq!(live_tree(&fs), before);
    assert_eq!(state_bytes(&fs), state_before);
}

#[test]
fn rollback_after_registering_restores_previous_registrations() {
    let fs = clean_install();
    let before = registrations(&fs).unwrap();
    assert_eq!(
        before.registrations.shortcuts,
        vec!["base:base-launcher", "core:core-launcher"]
    );

    let upgrade = plan_for(&fs, Operation::Upgrade, "2.0");
    crash_at(&fs, &upgrade, failpoint::BEFORE_WRITE_STATE);
    let replaced = registrations(&fs).unwrap();
    assert_eq!(replaced.plan_digest64, upgrade.plan_digest64);
    assert!(replaced.registrations.is_empty());

    let report = Engine::new(&fs).rollback(&upgrade).unwrap();
    assert!(report.restored >= 1);
    assert_eq!(registrations(&fs), Some(before));
    assert!(!fs.exists(&layout(&fs).registrations_backup_path()));
}

#[test]
fn rollback_of_fresh_install_after_registering_drops_the_record() {
    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    crash_at(&fs, &plan, failpoint::BEFORE_WRITE_STATE);
    assert!(registrations(&fs).is_some());

    Engine::new(&fs).rollback(&plan).unwrap();
    assert!(registrations(&fs).is_none());
    assert!(live_tree(&fs).is_empty());
}

#[test]
fn upgrade_rollback_then_reapply_keeps_user_data() {
    let fs = clean_install();
    let base = fs.user_scope_paths().install_base;
    let save = base.join("user/dominium/saves/slot1.dsave");
    fs.write_file_bytes_atomic(&save, b"player progress").unwrap();
    let v1 = live_tree(&fs);

    let upgrade = plan_for(&fs, Operation::Upgrade, "2.0");
    crash_at(&fs, &upgrade, &failpoint::mid_commit_step(1));
    Engine::new(&fs).rollback(&upgrade).unwrap();
    assert_eq!(live_tree(&fs), v1);

    Engine::new(&fs).apply(&upgrade, false).unwrap();
    assert_eq!(fs.read_file_bytes(&save).unwrap(), b"player progress");
    assert_eq!(
        fs.read_file_bytes(&base.join("user/dominium/bin/dominium"))
            .unwrap(),
        b"dominium engine 2.0"
    );
    let state = InstalledState::parse(&state_bytes(&fs).unwrap()).unwrap();
    assert_eq!(state.product_version, "2.0");
}

#[test]
fn crash_blocks_new_apply_until_resolved() {
    let fs = MemoryFs::new();
    let plan = plan_for(&fs, Operation::Install, "1.0");
    crash_at(&fs, &plan, failpoint::AFTER_STAGE_EXTRACT);

    let err = Engine::new(&fs).apply(&plan, false).unwrap_err();
    assert!(matches!(err, CoreError::PendingJournal(_)));

    Engine::new(&fs).rollback(&plan).unwrap();
    Engine::new(&fs).apply(&plan, false).unwrap();
    assert!(matches!(
        Engine::new(&fs).resume(&plan),
        Err(CoreError::NothingToResume(_))
    ));
}
