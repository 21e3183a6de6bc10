//! Named crash checkpoints.
//!
//! The engine calls [`Failpoints::check`] at fixed points:
//! `after_stage_extract`, `after_verify`, `mid_commit_step_N` (after the N-th
//! commit sub-step, counting from 1), `before_write_state`,
//! `after_write_state` and `before_write_audit`. An armed checkpoint returns
//! [`CoreError::Failpoint`], which the engine treats as a process crash.
//! Without the `failpoints` feature nothing is ever armed.

use crate::CoreError;
use std::collections::BTreeSet;
use tracing::warn;

pub const AFTER_STAGE_EXTRACT: &str = "after_stage_extract";
pub const AFTER_VERIFY: &str = "after_verify";
pub const BEFORE_WRITE_STATE: &str = "before_write_state";
pub const AFTER_WRITE_STATE: &str = "after_write_state";
pub const BEFORE_WRITE_AUDIT: &str = "before_write_audit";

pub fn mid_commit_step(n: u32) -> String {
    format!("mid_commit_step_{n}")
}

#[derive(Debug, Clone, Default)]
pub struct Failpoints {
    armed: BTreeSet<String>,
}

impl Failpoints {
    pub fn none() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.arm(name);
        self
    }

    pub fn arm(&mut self, name: impl Into<String>) {
        self.armed.insert(name.into());
    }

    /// Parse a comma-separated list, as given on the command line.
    pub fn parse_list(list: &str) -> Self {
        let mut fp = Self::none();
        for name in list.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            fp.arm(name);
        }
        fp
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    #[cfg(feature = "failpoints")]
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        if self.armed.contains(name) {
            warn!("failpoint '{name}' triggered");
            return Err(CoreError::Failpoint(name.to_owned()));
        }
        Ok(())
    }

    #[cfg(not(feature = "failpoints"))]
    pub fn check(&self, name: &str) -> Result<(), CoreError> {
        let _ = name;
        if !self.armed.is_empty() {
            warn!("failpoints are not compiled in; ignoring");
        }
        Ok(())
    }
}

#[cfg(all(test, feature = "failpoints"))]
mod tests {
    use super::*;

    #[test]
    fn only_armed_points_trigger() {
        let fp = Failpoints::parse_list("after_verify, mid_commit_step_2");
        assert!(fp.check(AFTER_STAGE_EXTRACT).is_ok());
        assert!(matches!(
            fp.check(AFTER_VERIFY),
            Err(CoreError::Failpoint(name)) if name == "after_verify"
        ));
        assert!(fp.check(&mid_commit_step(1)).is_ok());
        assert!(fp.check(&mid_commit_step(2)).is_err());
    }

    #[test]
    fn empty_list_arms_nothing() {
        assert!(Failpoints::parse_list(" , ").is_empty());
    }
}
