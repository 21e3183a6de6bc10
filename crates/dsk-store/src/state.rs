use crate::fs::FileSystem;
use crate::stamp::{stamp, unstamp};
use crate::StoreError;
use dsk_schema::tlv::{required, ParseError, Record, TlvReader, TlvWriter};
use dsk_schema::{
    ComponentId, ComponentKind, Digest64, FileOpKind, InstallScope, IntegrityError, Operation,
    Ownership, Plan, Registrations, SplatId,
};
use serde::Serialize;
use std::path::Path;

pub const STATE_MAGIC: &[u8; 4] = b"DSKS";

mod tag {
    pub const PRODUCT_ID: u16 = 0x0002;
    pub const PRODUCT_VERSION: u16 = 0x0003;
    pub const BUILD_CHANNEL: u16 = 0x0004;
    pub const SPLAT: u16 = 0x0005;
    pub const OPERATION: u16 = 0x0006;
    pub const SCOPE: u16 = 0x0007;
    pub const PLATFORM: u16 = 0x0008;
    pub const ROOTS: u16 = 0x0009;
    pub const PLAN_DIGEST: u16 = 0x000A;
    pub const MANIFEST_DIGEST: u16 = 0x000B;
    pub const COMPONENTS: u16 = 0x000C;
    pub const FILES: u16 = 0x000D;
    pub const REGISTRATIONS: u16 = 0x000E;

    pub const ITEM: u16 = 0x0100;
    pub const COMPONENT: u16 = 0x0200;
    pub const FILE: u16 = 0x0300;

    pub const C_ID: u16 = 0x0001;
    pub const C_VERSION: u16 = 0x0002;
    pub const C_KIND: u16 = 0x0003;

    pub const F_ROOT: u16 = 0x0001;
    pub const F_PATH: u16 = 0x0002;
    pub const F_DIGEST: u16 = 0x0003;
    pub const F_SIZE: u16 = 0x0004;
    pub const F_COMPONENT: u16 = 0x0005;
    pub const F_OWNERSHIP: u16 = 0x0006;

    pub const R_SHORTCUTS: u16 = 0x0001;
    pub const R_FILE_ASSOC: u16 = 0x0002;
    pub const R_URL_HANDLERS: u16 = 0x0003;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledComponent {
    pub id: ComponentId,
    pub version: String,
    pub kind: ComponentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledFile {
    pub target_root_id: u32,
    pub path: String,
    pub digest64: Digest64,
    pub size: u64,
    pub component_id: String,
    pub ownership: Ownership,
}

/// Snapshot of what a successful apply left installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledState {
    pub product_id: String,
    pub product_version: String,
    pub build_channel: String,
    pub selected_splat: SplatId,
    pub operation: Operation,
    pub install_scope: InstallScope,
    pub target_platform: String,
    pub install_roots: Vec<String>,
    pub plan_digest64: Digest64,
    pub manifest_digest64: Digest64,
    pub components: Vec<InstalledComponent>,
    pub files: Vec<InstalledFile>,
    pub registrations: Registrations,
}

impl InstalledState {
    /// The state a plan leaves behind once fully applied.
    pub fn from_plan(plan: &Plan) -> Self {
        let components = plan
            .resolved_components
            .iter()
            .map(|c| InstalledComponent {
                id: c.id.clone(),
                version: c.version.clone(),
                kind: c.kind,
            })
            .collect();
        let files = plan
            .file_ops
            .iter()
            .filter(|op| op.kind == FileOpKind::Copy)
            .map(|op| InstalledFile {
                target_root_id: op.target_root_id,
                path: op.to.clone(),
                digest64: op.digest64,
                size: op.size,
                component_id: op.component_id.clone(),
                ownership: op.ownership,
            })
            .collect();
        Self {
            product_id: plan.product_id.clone(),
            product_version: plan.product_version.clone(),
            build_channel: plan.build_channel.clone(),
            selected_splat: plan.selected_splat.clone(),
            operation: plan.operation,
            install_scope: plan.install_scope,
            target_platform: plan.target_platform.clone(),
            install_roots: plan.install_roots.clone(),
            plan_digest64: plan.plan_digest64,
            manifest_digest64: plan.manifest_digest64,
            components,
            files,
            registrations: plan.registrations.clone(),
        }
    }

    pub fn root(&self, id: u32) -> Option<&str> {
        self.install_roots.get(id as usize).map(String::as_str)
    }

    /// Installed files as `(root path, relative path)` pairs.
    pub fn file_locations(&self) -> impl Iterator<Item = (&str, &InstalledFile)> {
        self.files
            .iter()
            .filter_map(|f| self.root(f.target_root_id).map(|r| (r, f)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        stamp(STATE_MAGIC, &self.encode_body()).0
    }

    pub fn digest(&self) -> Digest64 {
        stamp(STATE_MAGIC, &self.encode_body()).1
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_str(tag::PRODUCT_ID, &self.product_id);
        w.write_str(tag::PRODUCT_VERSION, &self.product_version);
        w.write_str(tag::BUILD_CHANNEL, &self.build_channel);
        w.write_str(tag::SPLAT, &self.selected_splat);
        w.write_u8(tag::OPERATION, self.operation.as_u8());
        w.write_u8(tag::SCOPE, self.install_scope.as_u8());
        w.write_str(tag::PLATFORM, &self.target_platform);
        w.write_str_list(tag::ROOTS, tag::ITEM, &self.install_roots);
        w.write_u64(tag::PLAN_DIGEST, self.plan_digest64.0);
        w.write_u64(tag::MANIFEST_DIGEST, self.manifest_digest64.0);
        w.write_container(tag::COMPONENTS, |list| {
            for c in &self.components {
                list.write_container(tag::COMPONENT, |cw| {
                    cw.write_str(tag::C_ID, &c.id);
                    cw.write_str(tag::C_VERSION, &c.version);
                    cw.write_u8(tag::C_KIND, c.kind.as_u8());
                });
            }
        });
        w.write_container(tag::FILES, |list| {
            for f in &self.files {
                list.write_container(tag::FILE, |fw| {
                    fw.write_u32(tag::F_ROOT, f.target_root_id);
                    fw.write_str(tag::F_PATH, &f.path);
                    fw.write_u64(tag::F_DIGEST, f.digest64.0);
                    fw.write_u64(tag::F_SIZE, f.size);
                    fw.write_str(tag::F_COMPONENT, &f.component_id);
                    fw.write_u8(tag::F_OWNERSHIP, f.ownership.as_u8());
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

    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (body, _) = unstamp(STATE_MAGIC, bytes, |stored, computed| {
            IntegrityError::StateDigestMismatch { stored, computed }
        })?;
        Ok(decode_body(body)?)
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, StoreError> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let bytes = fs.read_file_bytes(path)?;
        Self::parse(&bytes).map(Some)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), StoreError> {
        fs.write_file_bytes_atomic(path, &self.to_bytes())
    }
}

fn decode_body(body: &[u8]) -> Result<InstalledState, ParseError> {
    let (mut product_id, mut version, mut splat, mut operation, mut scope, mut platform) =
        (None, None, None, None, None, None);
    let mut state = InstalledState {
        product_id: String::new(),
        product_version: String::new(),
        build_channel: String::new(),
        selected_splat: SplatId::new(""),
        operation: Operation::Install,
        install_scope: InstallScope::User,
        target_platform: String::new(),
        install_roots: Vec::new(),
        plan_digest64: Digest64::ZERO,
        manifest_digest64: Digest64::ZERO,
        components: Vec::new(),
        files: Vec::new(),
        registrations: Registrations::default(),
    };
    let mut reader = TlvReader::new(body);
    while let Some(rec) = reader.read_record()? {
        match rec.tag {
            tag::PRODUCT_ID => product_id = Some(rec.as_string()?),
            tag::PRODUCT_VERSION => version = Some(rec.as_string()?),
            tag::BUILD_CHANNEL => state.build_channel = rec.as_string()?,
            tag::SPLAT => splat = Some(SplatId::new(rec.as_string()?)),
            tag::OPERATION => operation = Some(Operation::from_u8(rec.as_u8()?)?),
            tag::SCOPE => scope = Some(InstallScope::from_u8(rec.as_u8()?)?),
            tag::PLATFORM => platform = Some(rec.as_string()?),
            tag::ROOTS => state.install_roots = rec.as_str_list(tag::ITEM)?,
            tag::PLAN_DIGEST => state.plan_digest64 = Digest64(rec.as_u64()?),
            tag::MANIFEST_DIGEST => state.manifest_digest64 = Digest64(rec.as_u64()?),
            tag::COMPONENTS => {
                let mut list = rec.reader();
                while let Some(item) = list.read_record()? {
                    if item.tag == tag::COMPONENT {
                        state.components.push(decode_component(item)?);
                    } else {
                        item.into_unknown()?;
                    }
                }
            }
            tag::FILES => {
                let mut list = rec.reader();
                while let Some(item) = list.read_record()? {
                    if item.tag == tag::FILE {
                        state.files.push(decode_file(item)?);
                    } else {
                        item.into_unknown()?;
                    }
                }
            }
            tag::REGISTRATIONS => {
                let mut r = rec.reader();
                while let Some(f) = r.read_record()? {
                    match f.tag {
                        tag::R_SHORTCUTS => state.registrations.shortcuts = f.as_str_list(tag::ITEM)?,
                        tag::R_FILE_ASSOC => {
                            state.registrations.file_associations = f.as_str_list(tag::ITEM)?;
                        }
                        tag::R_URL_HANDLERS => {
                            state.registrations.url_handlers = f.as_str_list(tag::ITEM)?;
                        }
                        _ => {
                            f.into_unknown()?;
                        }
                    }
                }
            }
            _ => {
                rec.into_unknown()?;
            }
        }
    }
    state.product_id = required(product_id, "product_id")?;
    state.product_version = required(version, "product_version")?;
    state.selected_splat = required(splat, "selected_splat")?;
    state.operation = required(operation, "operation")?;
    state.install_scope = required(scope, "install_scope")?;
    state.target_platform = required(platform, "target_platform")?;
    Ok(state)
}

fn decode_component(rec: Record<'_>) -> Result<InstalledComponent, ParseError> {
    let (mut id, mut version, mut kind) = (None, None, None);
    let mut r = rec.reader();
    while let Some(f) = r.read_record()? {
        match f.tag {
            tag::C_ID => id = Some(ComponentId::new(f.as_string()?)),
            tag::C_VERSION => version = Some(f.as_string()?),
            tag::C_KIND => kind = Some(ComponentKind::from_u8(f.as_u8()?)?),
            _ => {
                f.into_unknown()?;
            }
        }
    }
    Ok(InstalledComponent {
        id: required(id, "component.id")?,
        version: required(version, "component.version")?,
        kind: required(kind, "component.kind")?,
    })
}

fn decode_file(rec: Record<'_>) -> Result<InstalledFile, ParseError> {
    let mut path = None;
    let mut file = InstalledFile {
        target_root_id: 0,
        path: String::new(),
        digest64: Digest64::ZERO,
        size: 0,
        component_id: String::new(),
        ownership: Ownership::Portable,
    };
    let mut r = rec.reader();
    while let Some(f) = r.read_record()? {
        match f.tag {
            tag::F_ROOT => file.target_root_id = f.as_u32()?,
            tag::F_PATH => path = Some(f.as_string()?),
            tag::F_DIGEST => file.digest64 = Digest64(f.as_u64()?),
            tag::F_SIZE => file.size = f.as_u64()?,
            tag::F_COMPONENT => file.component_id = f.as_string()?,
            tag::F_OWNERSHIP => file.ownership = Ownership::from_u8(f.as_u8()?)?,
            _ => {
                f.into_unknown()?;
            }
        }
    }
    file.path = required(path, "file.path")?;
    Ok(file)
}
