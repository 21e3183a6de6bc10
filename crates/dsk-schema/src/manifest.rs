use crate::digest::{digest64, Digest64};
use crate::error::{SchemaError, ValidationError};
use crate::tlv::{required, unwrap_file, wrap_file, ParseError, Record, TlvWriter, UnknownRecord};
use crate::types::{
    is_valid_platform_triple, is_valid_target_token, ComponentId, ComponentKind, InstallScope,
    SplatId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub const MANIFEST_MAGIC: &[u8; 4] = b"DSKM";

mod tag {
    pub const PRODUCT_ID: u16 = 0x0001;
    pub const VERSION: u16 = 0x0002;
    pub const BUILD_CHANNEL: u16 = 0x0003;
    pub const SUPPORTED_TARGETS: u16 = 0x0004;
    pub const COMPONENTS: u16 = 0x0005;
    pub const LAYOUT_TEMPLATES: u16 = 0x0006;
    pub const INSTALL_ROOTS: u16 = 0x0007;
    pub const ALLOWED_SPLATS: u16 = 0x0008;

    pub const ITEM: u16 = 0x0100;
    pub const COMPONENT: u16 = 0x0200;
    pub const ARTIFACT: u16 = 0x0210;
    pub const TEMPLATE: u16 = 0x0300;
    pub const ROOT: u16 = 0x0400;

    pub const C_ID: u16 = 0x0001;
    pub const C_VERSION: u16 = 0x0002;
    pub const C_KIND: u16 = 0x0003;
    pub const C_DEFAULT: u16 = 0x0004;
    pub const C_DEPS: u16 = 0x0005;
    pub const C_CONFLICTS: u16 = 0x0006;
    pub const C_TARGETS: u16 = 0x0007;
    pub const C_ARTIFACTS: u16 = 0x0008;
    pub const C_SHORTCUTS: u16 = 0x0009;
    pub const C_FILE_ASSOC: u16 = 0x000A;
    pub const C_URL_HANDLERS: u16 = 0x000B;

    pub const A_ID: u16 = 0x0001;
    pub const A_DIGEST: u16 = 0x0002;
    pub const A_SIZE: u16 = 0x0003;
    pub const A_SOURCE: u16 = 0x0004;
    pub const A_TEMPLATE: u16 = 0x0005;

    pub const T_ID: u16 = 0x0001;
    pub const T_ROOT: u16 = 0x0002;
    pub const T_PREFIX: u16 = 0x0003;

    pub const R_SCOPE: u16 = 0x0001;
    pub const R_PLATFORM: u16 = 0x0002;
    pub const R_PATH: u16 = 0x0003;
}

/// Product metadata: what can be installed, where, and on which platforms.
///
/// A manifest returned by [`parse_manifest`] is validated and canonical
/// (every collection sorted), and is treated as immutable from then on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub product_id: String,
    pub version: String,
    pub build_channel: String,
    pub supported_targets: Vec<String>,
    pub components: Vec<Component>,
    pub layout_templates: Vec<LayoutTemplate>,
    pub install_roots: Vec<InstallRootDecl>,
    /// Splat allowlist in preference order. Empty means any registered splat.
    pub allowed_splats: Vec<SplatId>,
    /// Optional extension records this build does not understand.
    #[serde(skip)]
    pub extensions: Vec<UnknownRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Component {
    pub id: ComponentId,
    /// Defaults to the manifest version when absent.
    pub version: Option<String>,
    pub kind: ComponentKind,
    pub default_selected: bool,
    pub deps: Vec<String>,
    pub conflicts: Vec<String>,
    /// Empty means every platform the manifest supports.
    pub supported_targets: Vec<String>,
    pub artifacts: Vec<Artifact>,
    pub shortcuts: Vec<String>,
    pub file_associations: Vec<String>,
    pub url_handlers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub id: String,
    pub digest64: Digest64,
    pub size: u64,
    pub source_path: String,
    pub layout_template_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutTemplate {
    pub id: String,
    /// Index into the plan's sorted install roots.
    #[serde(default)]
    pub target_root: u32,
    #[serde(default)]
    pub path_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallRootDecl {
    pub scope: InstallScope,
    pub platform: String,
    pub path: String,
}

impl Component {
    pub fn effective_version<'a>(&'a self, manifest: &'a Manifest) -> &'a str {
        match self.version.as_deref() {
            Some(v) if !v.is_empty() => v,
            _ => &manifest.version,
        }
    }

    fn canonicalize(&mut self) {
        self.deps = canonical_id_list(&self.deps);
        self.conflicts = canonical_id_list(&self.conflicts);
        self.supported_targets = canonical_list(&self.supported_targets);
        self.shortcuts = canonical_list(&self.shortcuts);
        self.file_associations = canonical_list(&self.file_associations);
        self.url_handlers = canonical_list(&self.url_handlers);
        self.artifacts.sort_by(|a, b| a.id.cmp(&b.id));
    }
}

impl Manifest {
    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id.eq_ignore_case(id))
    }

    pub fn template(&self, id: &str) -> Option<&LayoutTemplate> {
        self.layout_templates.iter().find(|t| t.id == id)
    }

    /// Sort every collection into canonical order. Idempotent.
    pub fn canonicalize(&mut self) {
        self.supported_targets = canonical_list(&self.supported_targets);
        for component in &mut self.components {
            component.canonicalize();
        }
        self.components
            .sort_by(|a, b| a.id.normalized().cmp(&b.id.normalized()));
        self.layout_templates.sort_by(|a, b| a.id.cmp(&b.id));
        self.install_roots.sort();
        self.install_roots.dedup();
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.product_id.trim().is_empty() {
            return Err(ValidationError::EmptyField("product_id"));
        }
        if self.version.trim().is_empty() {
            return Err(ValidationError::EmptyField("version"));
        }
        if self.build_channel.trim().is_empty() {
            return Err(ValidationError::MissingBuildChannel);
        }
        for target in &self.supported_targets {
            if !is_valid_platform_triple(target) {
                return Err(ValidationError::InvalidPlatform(target.clone()));
            }
        }
        for root in &self.install_roots {
            if !is_valid_platform_triple(&root.platform) {
                return Err(ValidationError::InvalidPlatform(root.platform.clone()));
            }
            if root.path.trim().is_empty() {
                return Err(ValidationError::EmptyField("install_roots.path"));
            }
            if !is_safe_relative_path(&root.path) {
                return Err(ValidationError::UnsafePath(root.path.clone()));
            }
        }
        for template in &self.layout_templates {
            if template.id.is_empty() {
                return Err(ValidationError::EmptyField("layout_templates.id"));
            }
            if !is_safe_relative_path(&template.path_prefix) {
                return Err(ValidationError::UnsafePath(template.path_prefix.clone()));
            }
        }

        let mut seen = BTreeSet::new();
        for component in &self.components {
            if component.id.is_empty() {
                return Err(ValidationError::EmptyField("components.id"));
            }
            if !seen.insert(component.id.normalized()) {
                return Err(ValidationError::DuplicateComponent(
                    component.id.to_string(),
                ));
            }
            for target in &component.supported_targets {
                if !is_valid_target_token(target) {
                    return Err(ValidationError::InvalidPlatform(target.clone()));
                }
            }
            for artifact in &component.artifacts {
                if artifact.id.is_empty() {
                    return Err(ValidationError::EmptyField("artifacts.id"));
                }
                if !is_safe_relative_path(&artifact.source_path) || artifact.source_path.is_empty()
                {
                    return Err(ValidationError::UnsafePath(artifact.source_path.clone()));
                }
                if self.template(&artifact.layout_template_id).is_none() {
                    return Err(ValidationError::UnresolvedLayoutTemplate {
                        artifact: artifact.id.clone(),
                        template: artifact.layout_template_id.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Canonical TLV file bytes. Extension records are never written.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        wrap_file(MANIFEST_MAGIC, &canonical.encode_payload())
    }

    pub fn digest(&self) -> Digest64 {
        Digest64(digest64(&self.to_bytes()))
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_str(tag::PRODUCT_ID, &self.product_id);
        w.write_str(tag::VERSION, &self.version);
        w.write_str(tag::BUILD_CHANNEL, &self.build_channel);
        w.write_str_list(tag::SUPPORTED_TARGETS, tag::ITEM, &self.supported_targets);
        w.write_container(tag::COMPONENTS, |list| {
            for c in &self.components {
                list.write_container(tag::COMPONENT, |cw| encode_component(cw, c));
            }
        });
        w.write_container(tag::LAYOUT_TEMPLATES, |list| {
            for t in &self.layout_templates {
                list.write_container(tag::TEMPLATE, |tw| {
                    tw.write_str(tag::T_ID, &t.id);
                    tw.write_u32(tag::T_ROOT, t.target_root);
                    tw.write_str(tag::T_PREFIX, &t.path_prefix);
                });
            }
        });
        w.write_container(tag::INSTALL_ROOTS, |list| {
            for r in &self.install_roots {
                list.write_container(tag::ROOT, |rw| {
                    rw.write_u8(tag::R_SCOPE, r.scope.as_u8());
                    rw.write_str(tag::R_PLATFORM, &r.platform);
                    rw.write_str(tag::R_PATH, &r.path);
                });
            }
        });
        let splats: Vec<String> = self
            .allowed_splats
            .iter()
            .map(|s| s.as_str().to_owned())
            .collect();
        w.write_str_list(tag::ALLOWED_SPLATS, tag::ITEM, &splats);
        w.into_bytes()
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, ParseError> {
        let mut product_id = None;
        let mut version = None;
        let mut build_channel = String::new();
        let mut manifest = Manifest {
            product_id: String::new(),
            version: String::new(),
            build_channel: String::new(),
            supported_targets: Vec::new(),
            components: Vec::new(),
            layout_templates: Vec::new(),
            install_roots: Vec::new(),
            allowed_splats: Vec::new(),
            extensions: Vec::new(),
        };

        let mut reader = crate::tlv::TlvReader::new(payload);
        while let Some(rec) = reader.read_record()? {
            match rec.tag {
                tag::PRODUCT_ID => product_id = Some(rec.as_string()?),
                tag::VERSION => version = Some(rec.as_string()?),
                tag::BUILD_CHANNEL => build_channel = rec.as_string()?,
                tag::SUPPORTED_TARGETS => manifest.supported_targets = rec.as_str_list(tag::ITEM)?,
                tag::COMPONENTS => {
                    let mut list = rec.reader();
                    while let Some(item) = list.read_record()? {
                        if item.tag == tag::COMPONENT {
                            manifest.components.push(decode_component(item)?);
                        } else {
                            item.into_unknown()?;
                        }
                    }
                }
                tag::LAYOUT_TEMPLATES => {
                    let mut list = rec.reader();
                    while let Some(item) = list.read_record()? {
                        if item.tag == tag::TEMPLATE {
                            manifest.layout_templates.push(decode_template(item)?);
                        } else {
                            item.into_unknown()?;
                        }
                    }
                }
                tag::INSTALL_ROOTS => {
                    let mut list = rec.reader();
                    while let Some(item) = list.read_record()? {
                        if item.tag == tag::ROOT {
                            manifest.install_roots.push(decode_root(item)?);
                        } else {
                            item.into_unknown()?;
                        }
                    }
                }
                tag::ALLOWED_SPLATS => {
                    manifest.allowed_splats = rec
                        .as_str_list(tag::ITEM)?
                        .into_iter()
                        .map(SplatId::new)
                        .collect();
                }
                _ => manifest.extensions.push(rec.into_unknown()?),
            }
        }

        manifest.product_id = required(product_id, "product_id")?;
        manifest.version = required(version, "version")?;
        manifest.build_channel = build_channel;
        manifest.canonicalize();
        Ok(manifest)
    }
}

fn encode_component(w: &mut TlvWriter, c: &Component) {
    w.write_str(tag::C_ID, &c.id);
    if let Some(version) = c.version.as_deref().filter(|v| !v.is_empty()) {
        w.write_str(tag::C_VERSION, version);
    }
    w.write_u8(tag::C_KIND, c.kind.as_u8());
    w.write_bool(tag::C_DEFAULT, c.default_selected);
    w.write_str_list(tag::C_DEPS, tag::ITEM, &c.deps);
    w.write_str_list(tag::C_CONFLICTS, tag::ITEM, &c.conflicts);
    w.write_str_list(tag::C_TARGETS, tag::ITEM, &c.supported_targets);
    w.write_container(tag::C_ARTIFACTS, |list| {
        for a in &c.artifacts {
            list.write_container(tag::ARTIFACT, |aw| {
                aw.write_str(tag::A_ID, &a.id);
                aw.write_u64(tag::A_DIGEST, a.digest64.0);
                aw.write_u64(tag::A_SIZE, a.size);
                aw.write_str(tag::A_SOURCE, &a.source_path);
                aw.write_str(tag::A_TEMPLATE, &a.layout_template_id);
            });
        }
    });
    w.write_str_list(tag::C_SHORTCUTS, tag::ITEM, &c.shortcuts);
    w.write_str_list(tag::C_FILE_ASSOC, tag::ITEM, &c.file_associations);
    w.write_str_list(tag::C_URL_HANDLERS, tag::ITEM, &c.url_handlers);
}

fn decode_component(rec: Record<'_>) -> Result<Component, ParseError> {
    let mut id = None;
    let mut component = Component {
        id: ComponentId::new(""),
        version: None,
        kind: ComponentKind::Other,
        default_selected: false,
        deps: Vec::new(),
        conflicts: Vec::new(),
        supported_targets: Vec::new(),
        artifacts: Vec::new(),
        shortcuts: Vec::new(),
        file_associations: Vec::new(),
        url_handlers: Vec::new(),
    };
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::C_ID => id = Some(ComponentId::new(field.as_string()?)),
            tag::C_VERSION => component.version = Some(field.as_string()?),
            tag::C_KIND => component.kind = ComponentKind::from_u8(field.as_u8()?)?,
            tag::C_DEFAULT => component.default_selected = field.as_bool()?,
            tag::C_DEPS => component.deps = field.as_str_list(tag::ITEM)?,
            tag::C_CONFLICTS => component.conflicts = field.as_str_list(tag::ITEM)?,
            tag::C_TARGETS => component.supported_targets = field.as_str_list(tag::ITEM)?,
            tag::C_ARTIFACTS => {
                let mut list = field.reader();
                while let Some(item) = list.read_record()? {
                    if item.tag == tag::ARTIFACT {
                        component.artifacts.push(decode_artifact(item)?);
                    } else {
                        item.into_unknown()?;
                    }
                }
            }
            tag::C_SHORTCUTS => component.shortcuts = field.as_str_list(tag::ITEM)?,
            tag::C_FILE_ASSOC => component.file_associations = field.as_str_list(tag::ITEM)?,
            tag::C_URL_HANDLERS => component.url_handlers = field.as_str_list(tag::ITEM)?,
            _ => {
                field.into_unknown()?;
            }
        }
    }
    component.id = required(id, "component.id")?;
    Ok(component)
}

fn decode_artifact(rec: Record<'_>) -> Result<Artifact, ParseError> {
    let (mut id, mut digest, mut size, mut source, mut template) = (None, None, None, None, None);
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::A_ID => id = Some(field.as_string()?),
            tag::A_DIGEST => digest = Some(Digest64(field.as_u64()?)),
            tag::A_SIZE => size = Some(field.as_u64()?),
            tag::A_SOURCE => source = Some(field.as_string()?),
            tag::A_TEMPLATE => template = Some(field.as_string()?),
            _ => {
                field.into_unknown()?;
            }
        }
    }
    Ok(Artifact {
        id: required(id, "artifact.id")?,
        digest64: required(digest, "artifact.digest64")?,
        size: required(size, "artifact.size")?,
        source_path: required(source, "artifact.source_path")?,
        layout_template_id: required(template, "artifact.layout_template_id")?,
    })
}

fn decode_template(rec: Record<'_>) -> Result<LayoutTemplate, ParseError> {
    let (mut id, mut root, mut prefix) = (None, 0, String::new());
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::T_ID => id = Some(field.as_string()?),
            tag::T_ROOT => root = field.as_u32()?,
            tag::T_PREFIX => prefix = field.as_string()?,
            _ => {
                field.into_unknown()?;
            }
        }
    }
    Ok(LayoutTemplate {
        id: required(id, "layout_template.id")?,
        target_root: root,
        path_prefix: prefix,
    })
}

fn decode_root(rec: Record<'_>) -> Result<InstallRootDecl, ParseError> {
    let (mut scope, mut platform, mut path) = (None, None, None);
    let mut reader = rec.reader();
    while let Some(field) = reader.read_record()? {
        match field.tag {
            tag::R_SCOPE => scope = Some(InstallScope::from_u8(field.as_u8()?)?),
            tag::R_PLATFORM => platform = Some(field.as_string()?),
            tag::R_PATH => path = Some(field.as_string()?),
            _ => {
                field.into_unknown()?;
            }
        }
    }
    Ok(InstallRootDecl {
        scope: required(scope, "install_root.scope")?,
        platform: required(platform, "install_root.platform")?,
        path: required(path, "install_root.path")?,
    })
}

fn canonical_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

fn canonical_id_list(values: &[String]) -> Vec<String> {
    let lowered: Vec<String> = values.iter().map(|v| v.to_ascii_lowercase()).collect();
    canonical_list(&lowered)
}

/// Relative, `/`-separated, and never escaping its base directory.
pub fn is_safe_relative_path(path: &str) -> bool {
    if path.starts_with('/') || path.contains('\\') || path.contains(':') {
        return false;
    }
    path.split('/')
        .filter(|seg| !seg.is_empty())
        .all(|seg| seg != ".." && seg != ".")
}

/// Parse and validate a `.dsumanifest` file image.
pub fn parse_manifest(bytes: &[u8]) -> Result<Manifest, SchemaError> {
    let payload = unwrap_file(MANIFEST_MAGIC, bytes)?;
    let manifest = Manifest::decode_payload(payload)?;
    manifest.validate()?;
    Ok(manifest)
}

pub fn write_manifest(manifest: &Manifest) -> Vec<u8> {
    manifest.to_bytes()
}

pub fn read_manifest_file(path: impl AsRef<Path>) -> Result<Manifest, SchemaError> {
    let bytes = fs::read(path)?;
    parse_manifest(&bytes)
}

// --- TOML authoring source ---------------------------------------------------

/// Human-authored manifest source, compiled to the canonical TLV form.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSource {
    pub product_id: String,
    pub version: String,
    #[serde(default)]
    pub build_channel: Option<String>,
    #[serde(default)]
    pub supported_targets: Vec<String>,
    #[serde(default)]
    pub allowed_splats: Vec<String>,
    #[serde(default)]
    pub install_roots: Vec<InstallRootDecl>,
    #[serde(default)]
    pub layout_templates: Vec<LayoutTemplate>,
    #[serde(default)]
    pub components: Vec<ComponentDecl>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentDecl {
    pub id: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: ComponentKind,
    #[serde(default)]
    pub default_selected: bool,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<String>,
    #[serde(default)]
    pub supported_targets: Vec<String>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDecl>,
    #[serde(default)]
    pub shortcuts: Vec<String>,
    #[serde(default)]
    pub file_associations: Vec<String>,
    #[serde(default)]
    pub url_handlers: Vec<String>,
}

/// Artifact declaration. `digest` and `size` may be omitted when a payload
/// root is supplied at compile time; they are then computed from the file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactDecl {
    pub id: String,
    #[serde(default)]
    pub digest: Option<Digest64>,
    #[serde(default)]
    pub size: Option<u64>,
    pub source_path: String,
    pub layout_template_id: String,
}

fn default_kind() -> ComponentKind {
    ComponentKind::Other
}

pub fn parse_manifest_source_str(input: &str) -> Result<ManifestSource, SchemaError> {
    Ok(toml::from_str(input)?)
}

impl ManifestSource {
    /// Compile into a validated, canonical [`Manifest`].
    pub fn compile(self, payload_root: Option<&Path>) -> Result<Manifest, SchemaError> {
        let mut components = Vec::with_capacity(self.components.len());
        for decl in self.components {
            let mut artifacts = Vec::with_capacity(decl.artifacts.len());
            for a in decl.artifacts {
                let (digest64, size) = match (a.digest, a.size) {
                    (Some(d), Some(s)) => (d, s),
                    _ => {
                        let Some(root) = payload_root else {
                            return Err(ValidationError::EmptyField("artifacts.digest").into());
                        };
                        let bytes = fs::read(root.join(&a.source_path))?;
                        (Digest64::of(&bytes), bytes.len() as u64)
                    }
                };
                artifacts.push(Artifact {
                    id: a.id,
                    digest64,
                    size,
                    source_path: a.source_path,
                    layout_template_id: a.layout_template_id,
                });
            }
            components.push(Component {
                id: ComponentId::new(decl.id),
                version: decl.version,
                kind: decl.kind,
                default_selected: decl.default_selected,
                deps: decl.deps,
                conflicts: decl.conflicts,
                supported_targets: decl.supported_targets,
                artifacts,
                shortcuts: decl.shortcuts,
                file_associations: decl.file_associations,
                url_handlers: decl.url_handlers,
            });
        }

        let mut manifest = Manifest {
            product_id: self.product_id.trim().to_owned(),
            version: self.version.trim().to_owned(),
            build_channel: self.build_channel.unwrap_or_default().trim().to_owned(),
            supported_targets: self.supported_targets,
            components,
            layout_templates: self.layout_templates,
            install_roots: self.install_roots,
            allowed_splats: self.allowed_splats.into_iter().map(SplatId::new).collect(),
            extensions: Vec::new(),
        };
        manifest.canonicalize();
        manifest.validate()?;
        Ok(manifest)
    }
}
