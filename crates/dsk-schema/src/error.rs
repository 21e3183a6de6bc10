use crate::digest::Digest64;
use crate::status::{HasStatus, Status, StatusCode, StatusDomain, USER_ACTIONABLE};
use crate::tlv::ParseError;
use thiserror::Error;

/// Semantic violations in a manifest, request or plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("manifest is missing build_channel")]
    MissingBuildChannel,
    #[error("required field '{0}' is empty")]
    EmptyField(&'static str),
    #[error("duplicate component id '{0}' (ids are case-insensitive)")]
    DuplicateComponent(String),
    #[error("invalid platform target '{0}', expected <os>-<arch> of [a-z0-9_]")]
    InvalidPlatform(String),
    #[error("artifact '{artifact}' references unknown layout template '{template}'")]
    UnresolvedLayoutTemplate { artifact: String, template: String },
    #[error("component '{0}' is both requested and excluded")]
    RequestedAndExcluded(String),
    #[error("digest '{0}' must be non-zero")]
    ZeroDigest(&'static str),
    #[error("{0} are not in canonical order")]
    OutOfOrder(&'static str),
    #[error("file op '{path}' targets root {index} but the plan has {roots} install roots")]
    RootOutOfRange {
        path: String,
        index: u32,
        roots: usize,
    },
    #[error("layout template '{template}' targets root {index} but only {roots} install roots exist")]
    TemplateRootOutOfRange {
        template: String,
        index: u32,
        roots: usize,
    },
    #[error("unsafe relative path '{0}'")]
    UnsafePath(String),
    #[error("more than one file op targets '{0}'")]
    ConflictingFileOp(String),
}

impl ValidationError {
    pub fn subcode(&self) -> u16 {
        match self {
            ValidationError::MissingBuildChannel => 1,
            ValidationError::EmptyField(_) => 2,
            ValidationError::DuplicateComponent(_) => 3,
            ValidationError::InvalidPlatform(_) => 4,
            ValidationError::UnresolvedLayoutTemplate { .. } => 5,
            ValidationError::RequestedAndExcluded(_) => 6,
            ValidationError::ZeroDigest(_) => 7,
            ValidationError::OutOfOrder(_) => 8,
            ValidationError::RootOutOfRange { .. } => 9,
            ValidationError::TemplateRootOutOfRange { .. } => 10,
            ValidationError::UnsafePath(_) => 11,
            ValidationError::ConflictingFileOp(_) => 12,
        }
    }
}

impl HasStatus for ValidationError {
    fn status(&self) -> Status {
        let status = Status::new(
            StatusDomain::Kernel,
            StatusCode::ValidationError,
            self.subcode(),
        );
        match self {
            ValidationError::RequestedAndExcluded(_) | ValidationError::InvalidPlatform(_) => {
                status.with_flags(USER_ACTIONABLE)
            }
            _ => status,
        }
    }
}

/// Digest mismatches: the artifact was tampered with or corrupted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("resolved-set digest mismatch: stored {stored}, recomputed {computed}")]
    ResolvedDigestMismatch { stored: Digest64, computed: Digest64 },
    #[error("plan digest mismatch: stored {stored}, recomputed {computed}")]
    PlanDigestMismatch { stored: Digest64, computed: Digest64 },
    #[error("installed-state digest mismatch: stored {stored}, recomputed {computed}")]
    StateDigestMismatch { stored: Digest64, computed: Digest64 },
    #[error("journal digest mismatch: stored {stored}, recomputed {computed}")]
    JournalDigestMismatch { stored: Digest64, computed: Digest64 },
    #[error("content of '{path}' does not match: expected {expected} ({expected_size} bytes), got {actual} ({actual_size} bytes)")]
    ContentMismatch {
        path: String,
        expected: Digest64,
        expected_size: u64,
        actual: Digest64,
        actual_size: u64,
    },
    #[error("journal belongs to plan {journal}, not {plan}")]
    JournalPlanMismatch { journal: Digest64, plan: Digest64 },
}

impl IntegrityError {
    pub fn subcode(&self) -> u16 {
        match self {
            IntegrityError::ResolvedDigestMismatch { .. } => 1,
            IntegrityError::PlanDigestMismatch { .. } => 2,
            IntegrityError::StateDigestMismatch { .. } => 3,
            IntegrityError::JournalDigestMismatch { .. } => 4,
            IntegrityError::ContentMismatch { .. } => 5,
            IntegrityError::JournalPlanMismatch { .. } => 6,
        }
    }
}

impl HasStatus for IntegrityError {
    fn status(&self) -> Status {
        Status::new(
            StatusDomain::Integrity,
            StatusCode::IntegrityError,
            self.subcode(),
        )
    }
}

impl HasStatus for ParseError {
    fn status(&self) -> Status {
        let subcode = match self {
            ParseError::Truncated { .. } => 1,
            ParseError::BadMagic { .. } => 2,
            ParseError::UnsupportedVersion { .. } => 3,
            ParseError::BadEndianMarker(_) => 4,
            ParseError::BadHeaderSize(_) => 5,
            ParseError::ChecksumMismatch { .. } => 6,
            ParseError::PayloadLength { .. } => 7,
            ParseError::LengthOverrun { .. } => 8,
            ParseError::BadFieldWidth { .. } => 9,
            ParseError::InvalidUtf8(_) => 10,
            ParseError::UnknownMandatoryTag(_) => 11,
            ParseError::MissingField(_) => 12,
            ParseError::InvalidEnum { .. } => 13,
        };
        Status::new(StatusDomain::Kernel, StatusCode::ParseError, subcode)
    }
}

/// Errors produced while loading or writing schema artifacts.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML source: {0}")]
    Toml(#[from] toml::de::Error),
}

impl HasStatus for SchemaError {
    fn status(&self) -> Status {
        match self {
            SchemaError::Parse(e) => e.status(),
            SchemaError::Validation(e) => e.status(),
            SchemaError::Integrity(e) => e.status(),
            SchemaError::Io(_) => Status::new(StatusDomain::Io, StatusCode::IoError, 1),
            SchemaError::Toml(_) => Status::new(StatusDomain::Kernel, StatusCode::ParseError, 100)
                .with_flags(USER_ACTIONABLE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_subcodes_are_distinct() {
        let a = IntegrityError::ResolvedDigestMismatch {
            stored: Digest64(1),
            computed: Digest64(2),
        };
        let b = IntegrityError::PlanDigestMismatch {
            stored: Digest64(1),
            computed: Digest64(2),
        };
        assert_ne!(a.status().subcode, b.status().subcode);
        assert_eq!(a.status().code, StatusCode::IntegrityError);
    }

    #[test]
    fn request_errors_are_user_actionable() {
        let e = ValidationError::RequestedAndExcluded("core".to_owned());
        assert!(e.status().is_user_actionable());
        assert!(e.to_string().contains("core"));
        assert!(!ValidationError::MissingBuildChannel
            .status()
            .is_user_actionable());
    }

    #[test]
    fn schema_error_display_wraps_inner() {
        let e = SchemaError::from(ParseError::MissingField("product_id"));
        assert!(e.to_string().contains("product_id"));
        assert_eq!(e.status().code, StatusCode::ParseError);
    }
}
