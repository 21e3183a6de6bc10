//! Installation plan: the immutable, digest-stamped program the apply engine
//! executes.
//!
//! The plan digest is the FNV-1a 64 of the serialized plan with the digest
//! value zeroed. The digest record is always the first record of the payload,
//! so a reader can check it against the raw bytes before decoding anything
//! else: any corruption of the payload surfaces as an integrity error.

use crate::digest::{digest64, Digest64};
use crate::error::{IntegrityError, SchemaError, ValidationError};
use crate::manifest::is_safe_relative_path;
use crate::resolved::{canonical_key, resolved_digest, ResolvedComponent};
use crate::tlv::{
    required, unwrap_file, wrap_file, ParseError, Record, TlvReader, TlvWriter, HEADER_SIZE,
};
use crate::types::{
    CapBits, ComponentId, ComponentKind, ComponentSource, FileOpKind, InstallScope, Operation,
    Ownership, SplatId, StepKind,
};
use serde::Serialize;
use std::cmp::Ordering;
use std::fs;
use std::path::Path;

pub const PLAN_MAGIC: &[u8; 4] = b"DSKP";

mod tag {
    pub const PLAN_DIGEST: u16 = 0x0001;
    pub const PRODUCT_ID: u16 = 0x0002;
    pub const PRODUCT_VERSION: u16 = 0x0003;
    pub const BUILD_CHANNEL: u16 = 0x0004;
    pub const SPLAT_ID: u16 = 0x0005;
    pub const SPLAT_CAPS_DIGEST: u16 = 0x0006;
    pub const OPERATION: u16 = 0x0007;
    pub const SCOPE: u16 = 0x0008;
    pub const PLATFORM: u16 = 0x0009;
    pub const PAYLOAD_ROOT: u16 = 0x000A;
    pub const INSTALL_ROOTS: u16 = 0x000B;
    pub const MANIFEST_DIGEST: u16 = 0x000C;
    pub const REQUEST_DIGEST: u16 = 0x000D;
    pub const RESOLVED_DIGEST: u16 = 0x000E;
    pub const COMPONENTS: u16 = 0x000F;
    pub const STEPS: u16 = 0x0010;
    pub const FILE_OPS: u16 = 0x0011;
    pub const REGISTRATIONS: u16 = 0x0012;
    pub const SPLAT_CAPS: u16 = 0x0013;

    pub const ITEM: u16 = 0x0100;
    pub const COMPONENT: u16 = 0x0200;
    pub const STEP: u16 = 0x0300;
    pub const FILE_OP: u16 = 0x0400;

    pub const RC_ID: u16 = 0x0001;
    pub const RC_VERSION: u16 = 0x0002;
    pub const RC_KIND: u16 = 0x0003;
    pub const RC_SOURCE: u16 = 0x0004;

    pub const S_ID: u16 = 0x0001;
    pub const S_KIND: u16 = 0x0002;
    pub const S_ROOT: u16 = 0x0003;
    pub const S_COMPONENT: u16 = 0x0004;
    pub const S_ARTIFACT: u16 = 0x0005;

    pub const F_KIND: u16 = 0x0001;
    pub const F_FROM: u16 = 0x0002;
    pub const F_TO: u16 = 0x0003;
    pub const F_OWNERSHIP: u16 = 0x0004;
    pub const F_DIGEST: u16 = 0x0005;
    pub const F_SIZE: u16 = 0x0006;
    pub const F_ROOT: u16 = 0x0007;
    pub const F_COMPONENT: u16 = 0x0008;
    pub const F_ARTIFACT: u16 = 0x0009;

    pub const R_SHORTCUTS: u16 = 0x0001;
    pub const R_FILE_ASSOC: u16 = 0x0002;
    pub const R_URL_HANDLERS: u16 = 0x0003;
}

/// Offset of the plan digest value inside a plan file: header, then the
/// first record's tag and length.
const DIGEST_VALUE_OFFSET: usize = HEADER_SIZE + 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub product_id: String,
    pub product_version: String,
    pub build_channel: String,
    pub selected_splat: SplatId,
    pub splat_caps: CapBits,
    pub splat_caps_digest64: Digest64,
    pub operation: Operation,
    pub install_scope: InstallScope,
    pub target_platform: String,
    pub payload_root: String,
    pub install_roots: Vec<String>,
    pub manifest_digest64: Digest64,
    pub request_digest64: Digest64,
    pub resolved_set_digest64: Digest64,
    pub plan_digest64: Digest64,
    pub resolved_components: Vec<ResolvedComponent>,
    pub ordered_steps: Vec<PlanStep>,
    pub file_ops: Vec<FileOp>,
    pub registrations: Registrations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub step_id: u32,
    pub kind: StepKind,
    pub target_root_id: u32,
    pub component_id: String,
    pub artifact_id: String,
}

impl PlanStep {
    /// Per-artifact steps run first, in (root, component, artifact, kind)
    /// order; the fixed finishing steps follow in kind order.
    pub fn sort_key(&self) -> (u8, u32, &str, &str, StepKind) {
        let phase = u8::from(!self.kind.is_per_artifact());
        (
            phase,
            self.target_root_id,
            &self.component_id,
            &self.artifact_id,
            self.kind,
        )
    }
}

impl StepKind {
    pub fn is_per_artifact(self) -> bool {
        matches!(self, StepKind::StageArtifact | StepKind::VerifyHashes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOp {
    pub kind: FileOpKind,
    /// Source path relative to the payload root. Empty for removals.
    pub from: String,
    /// Destination path relative to `install_roots[target_root_id]`.
    pub to: String,
    pub ownership: Ownership,
    pub digest64: Digest64,
    pub size: u64,
    pub target_root_id: u32,
    pub component_id: String,
    /// Manifest artifact this op installs or removes. Empty for removals of
    /// files no longer described by the manifest.
    pub artifact_id: String,
}

impl FileOp {
    pub fn sort_key(&self) -> (u32, &str, &str, FileOpKind) {
        (self.target_root_id, &self.to, &self.from, self.kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Registrations {
    pub shortcuts: Vec<String>,
    pub file_associations: Vec<String>,
    pub url_handlers: Vec<String>,
}

impl Registrations {
    pub fn is_empty(&self) -> bool {
        self.shortcuts.is_empty() && self.file_associations.is_empty() && self.url_handlers.is_empty()
    }

    pub fn canonicalize(&mut self) {
        for list in [
            &mut self.shortcuts,
            &mut self.file_associations,
            &mut self.url_handlers,
        ] {
            list.sort();
            list.dedup();
        }
    }
}

impl Plan {
    pub fn canonicalize(&mut self) {
        self.install_roots.sort();
        self.install_roots.dedup();
        crate::resolved::sort_components(&mut self.resolved_components);
        self.file_ops.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.ordered_steps
            .sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        for (i, step) in self.ordered_steps.iter_mut().enumerate() {
            step.step_id = i as u32 + 1;
        }
        self.registrations.canonicalize();
    }

    /// Recompute and store `plan_digest64`.
    pub fn seal(&mut self) {
        self.plan_digest64 = compute_plan_digest(self);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        wrap_file(PLAN_MAGIC, &self.encode_payload(self.plan_digest64))
    }

    pub fn root(&self, id: u32) -> Option<&str> {
        self.install_roots.get(id as usize).map(String::as_str)
    }

    pub fn copy_ops(&self) -> impl Iterator<Item = &FileOp> {
        self.file_ops.iter().filter(|op| op.kind == FileOpKind::Copy)
    }

    /// The copy op a per-artifact step works on, with its index in `file_ops`.
    pub fn op_for_step(&self, step: &PlanStep) -> Option<(usize, &FileOp)> {
        self.file_ops.iter().enumerate().find(|(_, op)| {
            op.kind == FileOpKind::Copy
                && op.target_root_id == step.target_root_id
                && op.component_id == step.component_id
                && op.artifact_id == step.artifact_id
        })
    }

    fn encode_payload(&self, digest: Digest64) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_u64(tag::PLAN_DIGEST, digest.0);
        w.write_str(tag::PRODUCT_ID, &self.product_id);
        w.write_str(tag::PRODUCT_VERSION, &self.product_version);
        w.write_str(tag::BUILD_CHANNEL, &self.build_channel);
        w.write_str(tag::SPLAT_ID, &self.selected_splat);
        w.write_u32(tag::SPLAT_CAPS, self.splat_caps.bits());
        w.write_u64(tag::SPLAT_CAPS_DIGEST, self.splat_caps_digest64.0);
        w.write_u8(tag::OPERATION, self.operation.as_u8());
        w.write_u8(tag::SCOPE, self.install_scope.as_u8());
        w.write_str(tag::PLATFORM, &self.target_platform);
        w.write_str(tag::PAYLOAD_ROOT, &self.payload_root);
        w.write_str_list(tag::INSTALL_ROOTS, tag::ITEM, &self.install_roots);
        w.write_u64(tag::MANIFEST_DIGEST, self.manifest_digest64.0);
        w.write_u64(tag::REQUEST_DIGEST, self.request_digest64.0);
        w.write_u64(tag::RESOLVED_DIGEST, self.resolved_set_digest64.0);
        w.write_container(tag::COMPONENTS, |list| {
            for c in &self.resolved_components {
                list.write_container(tag::COMPONENT, |cw| {
                    cw.write_str(tag::RC_ID, &c.id);
                    cw.write_str(tag::RC_VERSION, &c.version);
                    cw.write_u8(tag::RC_KIND, c.kind.as_u8());
                    cw.write_u8(tag::RC_SOURCE, c.source.as_u8());
                });
            }
        });
        w.write_container(tag::STEPS, |list| {
            for s in &self.ordered_steps {
                list.write_container(tag::STEP, |sw| {
                    sw.write_u32(tag::S_ID, s.step_id);
                    sw.write_u8(tag::S_KIND, s.kind.as_u8());
                    sw.write_u32(tag::S_ROOT, s.target_root_id);
                    sw.write_str(tag::S_COMPONENT, &s.component_id);
                    sw.write_str(tag::S_ARTIFACT, &s.artifact_id);
                });
            }
        });
        w.write_container(tag::FILE_OPS, |list| {
            for op in &self.file_ops {
                list.write_container(tag::FILE_OP, |fw| {
                    fw.write_u8(tag::F_KIND, op.kind.as_u8());
                    fw.write_str(tag::F_FROM, &op.from);
                    fw.write_str(tag::F_TO, &op.to);
                    fw.write_u8(tag::F_OWNERSHIP, op.ownership.as_u8());
                    fw.write_u64(tag::F_DIGEST, op.digest64.0);
                    fw.write_u64(tag::F_SIZE, op.size);
                    fw.write_u32(tag::F_ROOT, op.target_root_id);
                    fw.write_str(tag::F_COMPONENT, &op.component_id);
                    fw.write_str(tag::F_ARTIFACT, &op.artifact_id);
                });
            }
        });
        w.write_container(tag::REGISTRATIONS, |rw| {
            rw.write_str_list(tag::R_SHORTCUTS, tag::ITEM, &self.registrations.shortcuts);
            rw.write_str_list(
                tag::R_FILE_ASSOC,
                tag::ITEM,
                &self.registrations.file_associations,
            );
            rw.write_str_list(tag::R_URL_HANDLERS, tag::ITEM, &self.registrations.url_handlers);
        });
        w.into_bytes()
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, ParseError> {
        let mut f = PlanFields::default();
        let mut plan = Plan {
            product_id: String::new(),
            product_version: String::new(),
            build_channel: String::new(),
            selected_splat: SplatId::new(""),
            splat_caps: CapBits::empty(),
            splat_caps_digest64: Digest64::ZERO,
            operation: Operation::Install,
            install_scope: InstallScope::User,
            target_platform: String::new(),
            payload_root: String::new(),
            install_roots: Vec::new(),
            manifest_digest64: Digest64::ZERO,
            request_digest64: Digest64::ZERO,
            resolved_set_digest64: Digest64::ZERO,
            plan_digest64: Digest64::ZERO,
            resolved_components: Vec::new(),
            ordered_steps: Vec::new(),
            file_ops: Vec::new(),
            registrations: Registrations::default(),
        };

        let mut reader = TlvReader::new(payload);
        while let Some(rec) = reader.read_record()? {
            match rec.tag {
                tag::PLAN_DIGEST => plan.plan_digest64 = Digest64(rec.as_u64()?),
                tag::PRODUCT_ID => f.product_id = Some(rec.as_string()?),
                tag::PRODUCT_VERSION => f.product_version = Some(rec.as_string()?),
                tag::BUILD_CHANNEL => plan.build_channel = rec.as_string()?,
                tag::SPLAT_ID => f.splat = Some(SplatId::new(rec.as_string()?)),
                tag::SPLAT_CAPS => plan.splat_caps = CapBits::from_bits(rec.as_u32()?),
                tag::SPLAT_CAPS_DIGEST => plan.splat_caps_digest64 = Digest64(rec.as_u64()?),
                tag::OPERATION => f.operation = Some(Operation::from_u8(rec.as_u8()?)?),
                tag::SCOPE => f.scope = Some(InstallScope::from_u8(rec.as_u8()?)?),
                tag::PLATFORM => f.platform = Some(rec.as_string()?),
                tag::PAYLOAD_ROOT => plan.payload_root = rec.as_string()?,
                tag::INSTALL_ROOTS => plan.install_roots = rec.as_str_list(tag::ITEM)?,
                tag::MANIFEST_DIGEST => plan.manifest_digest64 = Digest64(rec.as_u64()?),
                tag::REQUEST_DIGEST => plan.request_digest64 = Digest64(rec.as_u64()?),
                tag::RESOLVED_DIGEST => plan.resolved_set_digest64 = Digest64(rec.as_u64()?),
                tag::COMPONENTS => {
                    plan.resolved_components =
                        decode_list(rec, tag::COMPONENT, decode_resolved_component)?;
                }
                tag::STEPS => plan.ordered_steps = decode_list(rec, tag::STEP, decode_step)?,
                tag::FILE_OPS => plan.file_ops = decode_list(rec, tag::FILE_OP, decode_file_op)?,
                tag::REGISTRATIONS => {
                    let mut r = rec.reader();
                    while let Some(field) = r.read_record()? {
                        match field.tag {
                            tag::R_SHORTCUTS => {
                                plan.registrations.shortcuts = field.as_str_list(tag::ITEM)?;
                            }
                            tag::R_FILE_ASSOC => {
                                plan.registrations.file_associations =
                                    field.as_str_list(tag::ITEM)?;
                            }
                            tag::R_URL_HANDLERS => {
                                plan.registrations.url_handlers = field.as_str_list(tag::ITEM)?;
                            }
                            _ => {
                                field.into_unknown()?;
                            }
                        }
                    }
                }
                _ => {
                    rec.into_unknown()?;
                }
            }
        }

        plan.product_id = required(f.product_id, "product_id")?;
        plan.product_version = required(f.product_version, "product_version")?;
        plan.selected_splat = required(f.splat, "selected_splat")?;
        plan.operation = required(f.operation, "operation")?;
        plan.install_scope = required(f.scope, "install_scope")?;
        plan.target_platform = required(f.platform, "target_platform")?;
        Ok(plan)
    }
}

#[derive(Default)]
struct PlanFields {
    product_id: Option<String>,
    product_version: Option<String>,
    splat: Option<SplatId>,
    operation: Option<Operation>,
    scope: Option<InstallScope>,
    platform: Option<String>,
}

fn decode_list<T>(
    rec: Record<'_>,
    item_tag: u16,
    decode: fn(Record<'_>) -> Result<T, ParseError>,
) -> Result<Vec<T>, ParseError> {
    let mut out = Vec::new();
    let mut reader = rec.reader();
    while let Some(item) = reader.read_record()? {
        if item.tag == item_tag {
            out.push(decode(item)?);
        } else {
            item.into_unknown()?;
        }
    }
    Ok(out)
}

fn decode_resolved_component(rec: Record<'_>) -> Result<ResolvedComponent, ParseError> {
    let (mut id, mut version, mut kind, mut source) = (None, None, None, None);
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::RC_ID => id = Some(ComponentId::new(field.as_string()?)),
            tag::RC_VERSION => version = Some(field.as_string()?),
            tag::RC_KIND => kind = Some(ComponentKind::from_u8(field.as_u8()?)?),
            tag::RC_SOURCE => source = Some(ComponentSource::from_u8(field.as_u8()?)?),
            _ => {
                field.into_unknown()?;
            }
        }
    }
    Ok(ResolvedComponent {
        id: required(id, "component.id")?,
        version: required(version, "component.version")?,
        kind: required(kind, "component.kind")?,
        source: required(source, "component.source")?,
    })
}

fn decode_step(rec: Record<'_>) -> Result<PlanStep, ParseError> {
    let (mut id, mut kind) = (None, None);
    let mut step = PlanStep {
        step_id: 0,
        kind: StepKind::StageArtifact,
        target_root_id: 0,
        component_id: String::new(),
        artifact_id: String::new(),
    };
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::S_ID => id = Some(field.as_u32()?),
            tag::S_KIND => kind = Some(StepKind::from_u8(field.as_u8()?)?),
            tag::S_ROOT => step.target_root_id = field.as_u32()?,
            tag::S_COMPONENT => step.component_id = field.as_string()?,
            tag::S_ARTIFACT => step.artifact_id = field.as_string()?,
            _ => {
                field.into_unknown()?;
            }
        }
    }
    step.step_id = required(id, "step.step_id")?;
    step.kind = required(kind, "step.kind")?;
    Ok(step)
}

fn decode_file_op(rec: Record<'_>) -> Result<FileOp, ParseError> {
    let (mut kind, mut to) = (None, None);
    let mut op = FileOp {
        kind: FileOpKind::Copy,
        from: String::new(),
        to: String::new(),
        ownership: Ownership::Portable,
        digest64: Digest64::ZERO,
        size: 0,
        target_root_id: 0,
        component_id: String::new(),
        artifact_id: String::new(),
    };
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::F_KIND => kind = Some(FileOpKind::from_u8(field.as_u8()?)?),
            tag::F_FROM => op.from = field.as_string()?,
            tag::F_TO => to = Some(field.as_string()?),
            tag::F_OWNERSHIP => op.ownership = Ownership::from_u8(field.as_u8()?)?,
            tag::F_DIGEST => op.digest64 = Digest64(field.as_u64()?),
            tag::F_SIZE => op.size = field.as_u64()?,
            tag::F_ROOT => op.target_root_id = field.as_u32()?,
            tag::F_COMPONENT => op.component_id = field.as_string()?,
            tag::F_ARTIFACT => op.artifact_id = field.as_string()?,
            _ => {
                field.into_unknown()?;
            }
        }
    }
    op.kind = required(kind, "file_op.kind")?;
    op.to = required(to, "file_op.to")?;
    Ok(op)
}

/// Digest of the plan's canonical serialization with `plan_digest64` zeroed.
pub fn compute_plan_digest(plan: &Plan) -> Digest64 {
    Digest64(digest64(&wrap_file(
        PLAN_MAGIC,
        &plan.encode_payload(Digest64::ZERO),
    )))
}

fn strictly_sorted<T, K: Ord>(items: &[T], key: impl Fn(&T) -> K) -> bool {
    items
        .windows(2)
        .all(|w| key(&w[0]).cmp(&key(&w[1])) == Ordering::Less)
}

/// Structural checks that do not involve the plan digest.
fn validate_structure(plan: &Plan) -> Result<(), SchemaError> {
    for (field, value) in [
        ("product_id", plan.product_id.as_str()),
        ("product_version", plan.product_version.as_str()),
        ("build_channel", plan.build_channel.as_str()),
        ("selected_splat", plan.selected_splat.as_str()),
        ("target_platform", plan.target_platform.as_str()),
    ] {
        if value.trim().is_empty() {
            return Err(ValidationError::EmptyField(field).into());
        }
    }
    for (field, digest) in [
        ("splat_caps_digest64", plan.splat_caps_digest64),
        ("manifest_digest64", plan.manifest_digest64),
        ("request_digest64", plan.request_digest64),
        ("resolved_set_digest64", plan.resolved_set_digest64),
        ("plan_digest64", plan.plan_digest64),
    ] {
        if digest.is_zero() {
            return Err(ValidationError::ZeroDigest(field).into());
        }
    }
    if plan.install_roots.is_empty() {
        return Err(ValidationError::EmptyField("install_roots").into());
    }
    if plan.install_roots.iter().any(|r| r.trim().is_empty()) {
        return Err(ValidationError::EmptyField("install_roots").into());
    }
    if let Some(root) = plan.install_roots.iter().find(|r| !is_safe_relative_path(r)) {
        return Err(ValidationError::UnsafePath(root.clone()).into());
    }
    if !strictly_sorted(&plan.install_roots, |r| r.clone()) {
        return Err(ValidationError::OutOfOrder("install_roots").into());
    }
    if !strictly_sorted(&plan.resolved_components, |c| {
        let (id, version) = canonical_key(c);
        (id, version.to_owned())
    }) {
        return Err(ValidationError::OutOfOrder("resolved_components").into());
    }
    if !strictly_sorted(&plan.ordered_steps, |s| {
        let (phase, root, c, a, k) = s.sort_key();
        (phase, root, c.to_owned(), a.to_owned(), k)
    }) {
        return Err(ValidationError::OutOfOrder("ordered_steps").into());
    }
    if plan
        .ordered_steps
        .iter()
        .enumerate()
        .any(|(i, s)| s.step_id as usize != i + 1)
    {
        return Err(ValidationError::OutOfOrder("step ids").into());
    }
    if !strictly_sorted(&plan.file_ops, |op| {
        let (root, to, from, kind) = op.sort_key();
        (root, to.to_owned(), from.to_owned(), kind)
    }) {
        return Err(ValidationError::OutOfOrder("file_ops").into());
    }
    let roots = plan.install_roots.len();
    for op in &plan.file_ops {
        if op.target_root_id as usize >= roots {
            return Err(ValidationError::RootOutOfRange {
                path: op.to.clone(),
                index: op.target_root_id,
                roots,
            }
            .into());
        }
        if op.to.is_empty() || !is_safe_relative_path(&op.to) {
            return Err(ValidationError::UnsafePath(op.to.clone()).into());
        }
        if op.kind == FileOpKind::Copy && (op.from.is_empty() || !is_safe_relative_path(&op.from))
        {
            return Err(ValidationError::UnsafePath(op.from.clone()).into());
        }
    }
    for pair in plan.file_ops.windows(2) {
        if pair[0].target_root_id == pair[1].target_root_id && pair[0].to == pair[1].to {
            return Err(ValidationError::ConflictingFileOp(pair[1].to.clone()).into());
        }
    }
    for step in &plan.ordered_steps {
        if step.target_root_id as usize >= roots {
            return Err(ValidationError::RootOutOfRange {
                path: format!("{}/{}", step.component_id, step.artifact_id),
                index: step.target_root_id,
                roots,
            }
            .into());
        }
    }
    Ok(())
}

fn validate_resolved_digest(plan: &Plan) -> Result<(), IntegrityError> {
    let computed = resolved_digest(&plan.resolved_components);
    if computed != plan.resolved_set_digest64 {
        return Err(IntegrityError::ResolvedDigestMismatch {
            stored: plan.resolved_set_digest64,
            computed,
        });
    }
    Ok(())
}

/// Full validation of an in-memory plan: structure, canonical order, root
/// bounds, resolved-set digest and plan digest.
pub fn validate_plan(plan: &Plan) -> Result<(), SchemaError> {
    validate_structure(plan)?;
    validate_resolved_digest(plan)?;
    let computed = compute_plan_digest(plan);
    if computed != plan.plan_digest64 {
        return Err(IntegrityError::PlanDigestMismatch {
            stored: plan.plan_digest64,
            computed,
        }
        .into());
    }
    Ok(())
}

pub fn write_plan(plan: &Plan) -> Vec<u8> {
    plan.to_bytes()
}

/// Parse and validate a `.dsuplan` file image.
///
/// The plan digest covers the canonical encoding, so optional extension
/// records a newer writer added do not affect it. When the payload does not
/// decode at all, the raw bytes are checked against the stored digest so
/// that corruption is reported as [`IntegrityError::PlanDigestMismatch`]
/// rather than as whatever decoding error it happens to cause.
pub fn parse_plan(bytes: &[u8]) -> Result<Plan, SchemaError> {
    let payload = unwrap_file(PLAN_MAGIC, bytes)?;
    let plan = match Plan::decode_payload(payload) {
        Ok(plan) => plan,
        Err(err) => {
            let (stored, computed) = raw_digests(bytes, payload);
            if stored != computed {
                return Err(IntegrityError::PlanDigestMismatch { stored, computed }.into());
            }
            return Err(err.into());
        }
    };
    let computed = compute_plan_digest(&plan);
    if computed != plan.plan_digest64 {
        return Err(IntegrityError::PlanDigestMismatch {
            stored: plan.plan_digest64,
            computed,
        }
        .into());
    }
    validate_structure(&plan)?;
    validate_resolved_digest(&plan)?;
    Ok(plan)
}

/// Stored digest and the digest of the raw file with its value zeroed.
fn raw_digests(bytes: &[u8], payload: &[u8]) -> (Digest64, Digest64) {
    let mut zeroed = bytes.to_vec();
    let stored = match TlvReader::new(payload).read_record() {
        Ok(Some(rec)) if rec.tag == tag::PLAN_DIGEST && rec.payload.len() == 8 => {
            zeroed[DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8].fill(0);
            rec.as_u64().map_or(Digest64::ZERO, Digest64)
        }
        _ => Digest64::ZERO,
    };
    (stored, Digest64(digest64(&zeroed)))
}

pub fn read_plan_file(path: impl AsRef<Path>) -> Result<Plan, SchemaError> {
    let bytes = fs::read(path)?;
    parse_plan(&bytes)
}

pub fn write_plan_file(path: impl AsRef<Path>, plan: &Plan) -> Result<(), SchemaError> {
    crate::write_atomic(path.as_ref(), &plan.to_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolved::ResolvedSet;
    use crate::status::HasStatus;

    fn sample() -> Plan {
        let resolved = ResolvedSet::new(vec![
            ResolvedComponent {
                id: ComponentId::new("core"),
                version: "1.0".to_owned(),
                kind: ComponentKind::Runtime,
                source: ComponentSource::User,
            },
            ResolvedComponent {
                id: ComponentId::new("base"),
                version: "1.0".to_owned(),
                kind: ComponentKind::Product,
                source: ComponentSource::Dependency,
            },
        ]);
        let mut steps = Vec::new();
        let mut ops = Vec::new();
        for (component, artifact, to) in [("core", "core_bin", "bin/core"), ("base", "base_dat", "data/base")] {
            for kind in [StepKind::VerifyHashes, StepKind::StageArtifact] {
                steps.push(PlanStep {
                    step_id: 0,
                    kind,
                    target_root_id: 0,
                    component_id: component.to_owned(),
                    artifact_id: artifact.to_owned(),
                });
            }
            ops.push(FileOp {
                kind: FileOpKind::Copy,
                from: format!("{component}/{artifact}"),
                to: to.to_owned(),
                ownership: Ownership::Portable,
                digest64: Digest64(0xabc),
                size: 3,
                target_root_id: 0,
                component_id: component.to_owned(),
                artifact_id: artifact.to_owned(),
            });
        }
        for kind in [
            StepKind::WriteAudit,
            StepKind::CommitSwap,
            StepKind::WriteState,
            StepKind::RegisterActions,
        ] {
            steps.push(PlanStep {
                step_id: 0,
                kind,
                target_root_id: 0,
                component_id: String::new(),
                artifact_id: String::new(),
            });
        }
        let mut plan = Plan {
            product_id: "dominium".to_owned(),
            product_version: "1.0".to_owned(),
            build_channel: "stable".to_owned(),
            selected_splat: SplatId::new("linux_portable"),
            splat_caps: CapBits::ROLLBACK | CapBits::RESUME,
            splat_caps_digest64: Digest64(1),
            operation: Operation::Install,
            install_scope: InstallScope::User,
            target_platform: "linux_deb-x86_64".to_owned(),
            payload_root: "payload".to_owned(),
            install_roots: vec!["user/dominium".to_owned()],
            manifest_digest64: Digest64(2),
            request_digest64: Digest64(3),
            resolved_set_digest64: resolved.digest64,
            plan_digest64: Digest64::ZERO,
            resolved_components: resolved.components,
            ordered_steps: steps,
            file_ops: ops,
            registrations: Registrations::default(),
        };
        plan.canonicalize();
        plan.seal();
        plan
    }

    #[test]
    fn canonical_step_order() {
        let plan = sample();
        let kinds: Vec<_> = plan.ordered_steps.iter().map(|s| (s.step_id, s.kind)).collect();
        assert_eq!(kinds[0], (1, StepKind::StageArtifact));
        assert_eq!(plan.ordered_steps[0].component_id, "base");
        assert_eq!(kinds[1], (2, StepKind::VerifyHashes));
        assert_eq!(
            kinds[4..].iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![
                StepKind::CommitSwap,
                StepKind::RegisterActions,
                StepKind::WriteState,
                StepKind::WriteAudit
            ]
        );
    }

    #[test]
    fn write_parse_roundtrip() {
        let plan = sample();
        validate_plan(&plan).unwrap();
        let bytes = write_plan(&plan);
        let parsed = parse_plan(&bytes).unwrap();
        assert_eq!(parsed, plan);
        assert_eq!(write_plan(&parsed), bytes);
    }

    #[test]
    fn every_flipped_payload_byte_is_an_integrity_error() {
        let bytes = write_plan(&sample());
        for i in HEADER_SIZE..bytes.len() {
            if (DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8).contains(&i) {
                continue;
            }
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            match parse_plan(&tampered) {
                Err(SchemaError::Integrity(IntegrityError::PlanDigestMismatch { .. })) => {}
                other => panic!("byte {i}: expected plan digest mismatch, got {other:?}"),
            }
        }
    }

    #[test]
    fn flipped_digest_byte_is_detected() {
        let mut bytes = write_plan(&sample());
        bytes[DIGEST_VALUE_OFFSET] ^= 0xff;
        let err = parse_plan(&bytes).unwrap_err();
        assert_eq!(err.status().subcode, 2);
    }

    fn with_extension(bytes: &[u8]) -> Vec<u8> {
        let payload = unwrap_file(PLAN_MAGIC, bytes).unwrap();
        let digest_record = DIGEST_VALUE_OFFSET + 8 - HEADER_SIZE;
        let mut w = TlvWriter::new();
        w.write_str(0x8001, "future extension");
        let mut extended = payload[..digest_record].to_vec();
        extended.extend_from_slice(w.as_bytes());
        extended.extend_from_slice(&payload[digest_record..]);
        wrap_file(PLAN_MAGIC, &extended)
    }

    #[test]
    fn optional_extension_records_keep_the_plan_digest() {
        let plan = sample();
        let canonical = write_plan(&plan);
        let extended = with_extension(&canonical);
        assert_ne!(extended, canonical);

        let parsed = parse_plan(&extended).unwrap();
        assert_eq!(parsed, plan);
        validate_plan(&parsed).unwrap();
        assert_eq!(write_plan(&parsed), canonical);
        assert_eq!(parse_plan(&write_plan(&parsed)).unwrap(), plan);
    }

    #[test]
    fn extension_sealed_over_raw_bytes_is_rejected() {
        let mut extended = with_extension(&write_plan(&sample()));
        extended[DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8].fill(0);
        let raw = digest64(&extended);
        extended[DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8].copy_from_slice(&raw.to_le_bytes());
        assert!(matches!(
            parse_plan(&extended),
            Err(SchemaError::Integrity(IntegrityError::PlanDigestMismatch { .. }))
        ));
    }

    #[test]
    fn escaping_install_roots_are_rejected() {
        for root in ["../../../../escaped", "/etc"] {
            let mut plan = sample();
            plan.install_roots = vec![root.to_owned()];
            plan.seal();
            assert!(matches!(
                validate_plan(&plan),
                Err(SchemaError::Validation(ValidationError::UnsafePath(ref p))) if p == root
            ));
            assert!(parse_plan(&write_plan(&plan)).is_err());
        }
    }

    #[test]
    fn resealed_resolved_tamper_is_resolved_mismatch() {
        let mut plan = sample();
        plan.resolved_components[0].version = "9.9".to_owned();
        plan.seal();
        let err = parse_plan(&write_plan(&plan)).unwrap_err();
        assert!(matches!(
            err,
            SchemaError::Integrity(IntegrityError::ResolvedDigestMismatch { .. })
        ));
        assert_eq!(err.status().subcode, 1);
    }

    #[test]
    fn out_of_order_file_ops_rejected() {
        let mut plan = sample();
        plan.file_ops.swap(0, 1);
        plan.seal();
        assert!(matches!(
            validate_plan(&plan),
            Err(SchemaError::Validation(ValidationError::OutOfOrder("file_ops")))
        ));
    }

    #[test]
    fn root_index_out_of_range_rejected() {
        let mut plan = sample();
        plan.file_ops[1].target_root_id = 4;
        plan.seal();
        assert!(matches!(
            validate_plan(&plan),
            Err(SchemaError::Validation(ValidationError::RootOutOfRange { index: 4, .. }))
        ));
    }

    #[test]
    fn zero_digest_rejected() {
        let mut plan = sample();
        plan.manifest_digest64 = Digest64::ZERO;
        plan.seal();
        assert!(matches!(
            validate_plan(&plan),
            Err(SchemaError::Validation(ValidationError::ZeroDigest("manifest_digest64")))
        ));
    }

    #[test]
    fn unsealed_plan_fails_validation() {
        let mut plan = sample();
        plan.product_version = "2.0".to_owned();
        assert!(matches!(
            validate_plan(&plan),
            Err(SchemaError::Integrity(IntegrityError::PlanDigestMismatch { .. }))
        ));
    }

    #[test]
    fn json_dump_is_stable() {
        let plan = sample();
        let a = serde_json::to_string_pretty(&plan).unwrap();
        assert_eq!(a, serde_json::to_string_pretty(&plan).unwrap());
        assert!(a.contains("\"selected_splat\": \"linux_portable\""));
        assert!(a.contains("\"splat_caps\": [\n    \"resume\",\n    \"rollback\"\n  ]"));
    }
}
