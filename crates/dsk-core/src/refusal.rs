use crate::splat::Rejection;
use dsk_schema::{HasStatus, Status, StatusCode, StatusDomain, USER_ACTIONABLE};
use thiserror::Error;

/// Business-rule rejections from the resolver and the splat selector.
///
/// The display text names the offending component, platform or splat so a
/// frontend can show it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Refusal {
    #[error("component '{0}' is not declared by the manifest")]
    ComponentNotFound(String),
    #[error("component '{component}' depends on '{dependency}', which is {reason}")]
    UnsatisfiedDependency {
        component: String,
        dependency: String,
        reason: &'static str,
    },
    #[error("component '{component}' conflicts with selected component '{other}'")]
    ExplicitConflict { component: String, other: String },
    #[error("component '{component}' does not support platform '{platform}'{}", required_by_suffix(.required_by))]
    PlatformIncompatible {
        component: String,
        platform: String,
        required_by: Option<String>,
    },
    #[error("no compatible splat: {detail}")]
    SplatNotFound {
        detail: String,
        rejections: Vec<Rejection>,
    },
}

fn required_by_suffix(required_by: &Option<String>) -> String {
    match required_by {
        Some(dependent) => format!(" (required by '{dependent}')"),
        None => String::new(),
    }
}

impl Refusal {
    pub fn subcode(&self) -> u16 {
        match self {
            Refusal::ComponentNotFound(_) => 1,
            Refusal::UnsatisfiedDependency { .. } => 2,
            Refusal::ExplicitConflict { .. } => 3,
            Refusal::PlatformIncompatible { .. } => 4,
            Refusal::SplatNotFound { .. } => 5,
        }
    }
}

impl HasStatus for Refusal {
    fn status(&self) -> Status {
        Status::new(StatusDomain::Kernel, StatusCode::RefusalError, self.subcode())
            .with_flags(USER_ACTIONABLE)
    }
}
