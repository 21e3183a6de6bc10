//! Structured status codes shared by every frontend.
//!
//! A status is `{domain, code, subcode, flags}`. Frontends display the error's
//! `Display` text verbatim and use the status to pick exit codes or to decide
//! whether to offer the operator a retry.

use serde::Serialize;
use std::fmt;

/// The refusal is caused by operator input (selection, flags) and can be
/// fixed without touching the product or the machine.
pub const USER_ACTIONABLE: u32 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusDomain {
    None,
    Kernel,
    Integrity,
    Io,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    ParseError,
    ValidationError,
    IntegrityError,
    RefusalError,
    IoError,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Status {
    pub domain: StatusDomain,
    pub code: StatusCode,
    pub subcode: u16,
    pub flags: u32,
}

impl Status {
    pub const OK: Status = Status {
        domain: StatusDomain::None,
        code: StatusCode::Ok,
        subcode: 0,
        flags: 0,
    };

    pub fn new(domain: StatusDomain, code: StatusCode, subcode: u16) -> Self {
        Self {
            domain,
            code,
            subcode,
            flags: 0,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_user_actionable(&self) -> bool {
        self.flags & USER_ACTIONABLE != 0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?}/{} flags=0x{:x}",
            self.domain, self.code, self.subcode, self.flags
        )
    }
}

/// Implemented by every error type that can surface to a frontend.
pub trait HasStatus {
    fn status(&self) -> Status;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_status() {
        assert!(Status::OK.is_ok());
        assert!(!Status::OK.is_user_actionable());
    }

    #[test]
    fn flags_accumulate() {
        let s = Status::new(StatusDomain::Kernel, StatusCode::RefusalError, 3)
            .with_flags(USER_ACTIONABLE);
        assert!(s.is_user_actionable());
        assert_eq!(s.subcode, 3);
        assert!(s.to_string().contains("RefusalError"));
    }
}
