//! Installation request: what the operator asked for.
//!
//! Requests are produced by a frontend, canonicalized, written once and read
//! back by the resolver and planner. Two frontends phrasing the same intent
//! differently (case, order, duplicates) produce identical bytes and the same
//! digest. `frontend_id` is diagnostic only and never part of the canonical
//! form.

use crate::digest::{digest64, Digest64};
use crate::error::{SchemaError, ValidationError};
use crate::tlv::{required, unwrap_file, wrap_file, ParseError, TlvReader, TlvWriter};
use crate::types::{
    is_valid_platform_triple, CapBits, InstallScope, Operation, Ownership, PolicyFlags, SplatId,
    UiMode,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const REQUEST_MAGIC: &[u8; 4] = b"DSKR";

mod tag {
    pub const OPERATION: u16 = 0x0001;
    pub const SCOPE: u16 = 0x0002;
    pub const PLATFORM: u16 = 0x0003;
    pub const REQUESTED: u16 = 0x0004;
    pub const EXCLUDED: u16 = 0x0005;
    pub const POLICY: u16 = 0x0006;
    pub const PAYLOAD_ROOT: u16 = 0x0007;
    pub const UI_MODE: u16 = 0x0008;
    pub const OWNERSHIP: u16 = 0x0009;
    pub const SPLAT: u16 = 0x000A;
    pub const REQUIRED_CAPS: u16 = 0x000B;
    pub const PROHIBITED_CAPS: u16 = 0x000C;

    pub const ITEM: u16 = 0x0100;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    pub operation: Operation,
    pub install_scope: InstallScope,
    pub target_platform: String,
    pub requested_components: Vec<String>,
    pub excluded_components: Vec<String>,
    pub policy_flags: PolicyFlags,
    pub payload_root: String,
    pub ui_mode: UiMode,
    pub ownership: Ownership,
    pub requested_splat: Option<SplatId>,
    pub required_caps: CapBits,
    pub prohibited_caps: CapBits,
    pub frontend_id: String,
}

impl Request {
    pub fn canonicalize(&mut self) {
        self.target_platform = self.target_platform.trim().to_owned();
        self.requested_components = canonical_ids(&self.requested_components);
        self.excluded_components = canonical_ids(&self.excluded_components);
        self.payload_root = self.payload_root.trim().to_owned();
        self.requested_splat = self
            .requested_splat
            .take()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .map(SplatId::new);
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.target_platform.is_empty() {
            return Err(ValidationError::EmptyField("target_platform"));
        }
        if !is_valid_platform_triple(&self.target_platform) {
            return Err(ValidationError::InvalidPlatform(
                self.target_platform.clone(),
            ));
        }
        for id in self
            .requested_components
            .iter()
            .chain(&self.excluded_components)
        {
            if id.trim().is_empty() {
                return Err(ValidationError::EmptyField("components"));
            }
        }
        for id in &self.requested_components {
            if self
                .excluded_components
                .iter()
                .any(|x| x.eq_ignore_ascii_case(id))
            {
                return Err(ValidationError::RequestedAndExcluded(id.clone()));
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut canonical = self.clone();
        canonical.canonicalize();
        wrap_file(REQUEST_MAGIC, &canonical.encode_payload())
    }

    /// Digest of the canonical bytes. Independent of `frontend_id`.
    pub fn digest(&self) -> Digest64 {
        Digest64(digest64(&self.to_bytes()))
    }

    pub fn wants_registrations(&self) -> bool {
        self.policy_flags.intersects(
            PolicyFlags::ENABLE_SHORTCUTS
                | PolicyFlags::ENABLE_FILE_ASSOC
                | PolicyFlags::ENABLE_URL_HANDLERS,
        )
    }

    fn encode_payload(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_u8(tag::OPERATION, self.operation.as_u8());
        w.write_u8(tag::SCOPE, self.install_scope.as_u8());
        w.write_str(tag::PLATFORM, &self.target_platform);
        w.write_str_list(tag::REQUESTED, tag::ITEM, &self.requested_components);
        w.write_str_list(tag::EXCLUDED, tag::ITEM, &self.excluded_components);
        w.write_u32(tag::POLICY, self.policy_flags.bits());
        w.write_str(tag::PAYLOAD_ROOT, &self.payload_root);
        w.write_u8(tag::UI_MODE, self.ui_mode.as_u8());
        w.write_u8(tag::OWNERSHIP, self.ownership.as_u8());
        if let Some(splat) = &self.requested_splat {
            w.write_str(tag::SPLAT, splat);
        }
        w.write_u32(tag::REQUIRED_CAPS, self.required_caps.bits());
        w.write_u32(tag::PROHIBITED_CAPS, self.prohibited_caps.bits());
        w.into_bytes()
    }

    fn decode_payload(payload: &[u8]) -> Result<Self, ParseError> {
        let (mut operation, mut scope, mut platform) = (None, None, None);
        let mut request = RequestBuilder::new(Operation::Install, InstallScope::User, "").build_raw();
        let mut reader = TlvReader::new(payload);
        while let Some(rec) = reader.read_record()? {
            match rec.tag {
                tag::OPERATION => operation = Some(Operation::from_u8(rec.as_u8()?)?),
                tag::SCOPE => scope = Some(InstallScope::from_u8(rec.as_u8()?)?),
                tag::PLATFORM => platform = Some(rec.as_string()?),
                tag::REQUESTED => request.requested_components = rec.as_str_list(tag::ITEM)?,
                tag::EXCLUDED => request.excluded_components = rec.as_str_list(tag::ITEM)?,
                tag::POLICY => request.policy_flags = PolicyFlags::from_bits(rec.as_u32()?),
                tag::PAYLOAD_ROOT => request.payload_root = rec.as_string()?,
                tag::UI_MODE => request.ui_mode = UiMode::from_u8(rec.as_u8()?)?,
                tag::OWNERSHIP => request.ownership = Ownership::from_u8(rec.as_u8()?)?,
                tag::SPLAT => request.requested_splat = Some(SplatId::new(rec.as_string()?)),
                tag::REQUIRED_CAPS => request.required_caps = CapBits::from_bits(rec.as_u32()?),
                tag::PROHIBITED_CAPS => {
                    request.prohibited_caps = CapBits::from_bits(rec.as_u32()?);
                }
                _ => {
                    rec.into_unknown()?;
                }
            }
        }
        request.operation = required(operation, "operation")?;
        request.install_scope = required(scope, "install_scope")?;
        request.target_platform = required(platform, "target_platform")?;
        request.canonicalize();
        Ok(request)
    }
}

fn canonical_ids(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = ids
        .iter()
        .map(|id| id.trim().to_ascii_lowercase())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn parse_request(bytes: &[u8]) -> Result<Request, SchemaError> {
    let payload = unwrap_file(REQUEST_MAGIC, bytes)?;
    let request = Request::decode_payload(payload)?;
    request.validate()?;
    Ok(request)
}

pub fn write_request(request: &Request) -> Vec<u8> {
    request.to_bytes()
}

pub fn read_request_file(path: impl AsRef<Path>) -> Result<Request, SchemaError> {
    let bytes = fs::read(path)?;
    parse_request(&bytes)
}

/// Programmatic request construction for frontends.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn new(operation: Operation, scope: InstallScope, platform: impl Into<String>) -> Self {
        Self {
            request: Request {
                operation,
                install_scope: scope,
                target_platform: platform.into(),
                requested_components: Vec::new(),
                excluded_components: Vec::new(),
                policy_flags: PolicyFlags::empty(),
                payload_root: String::new(),
                ui_mode: UiMode::Cli,
                ownership: Ownership::Any,
                requested_splat: None,
                required_caps: CapBits::empty(),
                prohibited_caps: CapBits::empty(),
                frontend_id: String::new(),
            },
        }
    }

    #[must_use]
    pub fn request(mut self, component: impl Into<String>) -> Self {
        self.request.requested_components.push(component.into());
        self
    }

    #[must_use]
    pub fn exclude(mut self, component: impl Into<String>) -> Self {
        self.request.excluded_components.push(component.into());
        self
    }

    #[must_use]
    pub fn policy(mut self, flags: PolicyFlags) -> Self {
        self.request.policy_flags.insert(flags);
        self
    }

    #[must_use]
    pub fn payload_root(mut self, root: impl Into<String>) -> Self {
        self.request.payload_root = root.into();
        self
    }

    #[must_use]
    pub fn ui_mode(mut self, mode: UiMode) -> Self {
        self.request.ui_mode = mode;
        self
    }

    #[must_use]
    pub fn ownership(mut self, ownership: Ownership) -> Self {
        self.request.ownership = ownership;
        self
    }

    #[must_use]
    pub fn splat(mut self, id: impl Into<String>) -> Self {
        self.request.requested_splat = Some(SplatId::new(id.into()));
        self
    }

    #[must_use]
    pub fn require_caps(mut self, caps: CapBits) -> Self {
        self.request.required_caps.insert(caps);
        self
    }

    #[must_use]
    pub fn prohibit_caps(mut self, caps: CapBits) -> Self {
        self.request.prohibited_caps.insert(caps);
        self
    }

    #[must_use]
    pub fn frontend(mut self, id: impl Into<String>) -> Self {
        self.request.frontend_id = id.into();
        self
    }

    fn build_raw(self) -> Request {
        self.request
    }

    /// Canonicalize and validate.
    pub fn build(self) -> Result<Request, ValidationError> {
        let mut request = self.request;
        request.canonicalize();
        request.validate()?;
        Ok(request)
    }
}

/// TOML form of a request, as written by hand or by scripted frontends.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestSource {
    pub operation: Operation,
    pub scope: InstallScope,
    pub platform: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub policy: PolicyFlags,
    #[serde(default)]
    pub payload_root: String,
    #[serde(default = "default_ui_mode")]
    pub ui_mode: UiMode,
    #[serde(default = "default_ownership")]
    pub ownership: Ownership,
    #[serde(default)]
    pub splat: Option<String>,
    #[serde(default)]
    pub required_caps: CapBits,
    #[serde(default)]
    pub prohibited_caps: CapBits,
    #[serde(default)]
    pub frontend_id: String,
}

fn default_ui_mode() -> UiMode {
    UiMode::Cli
}

fn default_ownership() -> Ownership {
    Ownership::Any
}

impl RequestSource {
    pub fn into_request(self) -> Result<Request, ValidationError> {
        let mut builder = RequestBuilder::new(self.operation, self.scope, self.platform)
            .policy(self.policy)
            .payload_root(self.payload_root)
            .ui_mode(self.ui_mode)
            .ownership(self.ownership)
            .require_caps(self.required_caps)
            .prohibit_caps(self.prohibited_caps)
            .frontend(self.frontend_id);
        for c in self.components {
            builder = builder.request(c);
        }
        for c in self.exclude {
            builder = builder.exclude(c);
        }
        if let Some(splat) = self.splat {
            builder = builder.splat(splat);
        }
        builder.build()
    }
}

pub fn parse_request_source_str(input: &str) -> Result<Request, SchemaError> {
    let source: RequestSource = toml::from_str(input)?;
    Ok(source.into_request()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RequestBuilder {
        RequestBuilder::new(Operation::Install, InstallScope::User, "linux_deb-x86_64")
            .payload_root("payload")
    }

    #[test]
    fn equivalent_phrasing_has_identical_digest() {
        let a = base()
            .request("Core")
            .request("tools")
            .frontend("gui")
            .build()
            .unwrap();
        let b = base()
            .request("tools")
            .request("core")
            .request("CORE")
            .frontend("cli")
            .build()
            .unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.frontend_id, b.frontend_id);
    }

    #[test]
    fn roundtrip_is_idempotent() {
        let req = base()
            .request("core")
            .exclude("docs")
            .policy(PolicyFlags::DETERMINISTIC | PolicyFlags::ENABLE_SHORTCUTS)
            .splat("linux_deb")
            .require_caps(CapBits::ROLLBACK)
            .build()
            .unwrap();
        let bytes = write_request(&req);
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.requested_splat.as_deref(), Some("linux_deb"));
        assert_eq!(write_request(&parsed), bytes);
        assert!(parsed.wants_registrations());
    }

    #[test]
    fn rejects_requested_and_excluded() {
        let err = base().request("core").exclude("CORE").build().unwrap_err();
        assert_eq!(err, ValidationError::RequestedAndExcluded("core".to_owned()));
    }

    #[test]
    fn rejects_bad_platform() {
        let err = RequestBuilder::new(Operation::Install, InstallScope::User, "win32")
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidPlatform(_)));
    }

    #[test]
    fn missing_operation_is_parse_error() {
        let mut w = TlvWriter::new();
        w.write_u8(tag::SCOPE, InstallScope::User.as_u8());
        w.write_str(tag::PLATFORM, "linux_deb-x86_64");
        let file = wrap_file(REQUEST_MAGIC, w.as_bytes());
        assert!(matches!(
            parse_request(&file),
            Err(SchemaError::Parse(ParseError::MissingField("operation")))
        ));
    }

    #[test]
    fn toml_source() {
        let src = r#"
operation = "upgrade"
scope = "system"
platform = "win32_nt5-x86"
components = ["core"]
policy = ["deterministic", "enable_url_handlers"]
ownership = "pkg"
"#;
        let req = parse_request_source_str(src).unwrap();
        assert_eq!(req.operation, Operation::Upgrade);
        assert_eq!(req.install_scope, InstallScope::System);
        assert_eq!(req.ownership, Ownership::Pkg);
        assert!(req.policy_flags.contains(PolicyFlags::ENABLE_URL_HANDLERS));
    }
}
