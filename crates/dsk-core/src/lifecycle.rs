use crate::CoreError;
use dsk_schema::StepKind;
use serde::Serialize;
use std::fmt;

/// Apply engine states. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyState {
    Pending,
    Staging,
    Verifying,
    Committing,
    Registering,
    WritingState,
    WritingAudit,
    Done,
    Failed { step_id: u32 },
}

impl ApplyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ApplyState::Done | ApplyState::Failed { .. })
    }
}

impl fmt::Display for ApplyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyState::Pending => f.write_str("pending"),
            ApplyState::Staging => f.write_str("staging"),
            ApplyState::Verifying => f.write_str("verifying"),
            ApplyState::Committing => f.write_str("committing"),
            ApplyState::Registering => f.write_str("registering"),
            ApplyState::WritingState => f.write_str("writing_state"),
            ApplyState::WritingAudit => f.write_str("writing_audit"),
            ApplyState::Done => f.write_str("done"),
            ApplyState::Failed { step_id } => write!(f, "failed({step_id})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyEvent {
    /// A plan step of this kind is about to run.
    Step(StepKind),
    /// Every step completed.
    Finish,
    Fail { step_id: u32 },
}

impl fmt::Display for ApplyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyEvent::Step(kind) => write!(f, "{kind}"),
            ApplyEvent::Finish => f.write_str("finish"),
            ApplyEvent::Fail { step_id } => write!(f, "fail({step_id})"),
        }
    }
}

/// Advance the apply state machine.
///
/// Per-artifact steps interleave, so `Verifying -> Staging` is legal. A plan
/// with no artifacts (uninstall, empty selection) commits straight from
/// `Pending`.
pub fn transition(from: ApplyState, event: ApplyEvent) -> Result<ApplyState, CoreError> {
    use ApplyState as S;
    let next = match (from, event) {
        (S::Pending | S::Staging | S::Verifying, ApplyEvent::Step(StepKind::StageArtifact)) => {
            Some(S::Staging)
        }
        (S::Staging, ApplyEvent::Step(StepKind::VerifyHashes)) => Some(S::Verifying),
        (S::Pending | S::Verifying, ApplyEvent::Step(StepKind::CommitSwap)) => Some(S::Committing),
        (S::Committing, ApplyEvent::Step(StepKind::RegisterActions)) => Some(S::Registering),
        (S::Registering, ApplyEvent::Step(StepKind::WriteState)) => Some(S::WritingState),
        (S::WritingState, ApplyEvent::Step(StepKind::WriteAudit)) => Some(S::WritingAudit),
        (S::WritingAudit, ApplyEvent::Finish) => Some(S::Done),
        (s, ApplyEvent::Fail { step_id }) if !s.is_terminal() => Some(S::Failed { step_id }),
        _ => None,
    };

    next.ok_or_else(|| CoreError::InvalidTransition {
        from,
        event: event.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(kind: StepKind) -> ApplyEvent {
        ApplyEvent::Step(kind)
    }

    #[test]
    fn valid_transitions() {
        let mut s = ApplyState::Pending;
        for event in [
            step(StepKind::StageArtifact),
            step(StepKind::VerifyHashes),
            step(StepKind::StageArtifact),
            step(StepKind::VerifyHashes),
            step(StepKind::CommitSwap),
            step(StepKind::RegisterActions),
            step(StepKind::WriteState),
            step(StepKind::WriteAudit),
            ApplyEvent::Finish,
        ] {
            s = transition(s, event).unwrap();
        }
        assert_eq!(s, ApplyState::Done);
        assert!(transition(ApplyState::Pending, step(StepKind::CommitSwap)).is_ok());
    }

    #[test]
    fn invalid_transitions() {
        assert!(transition(ApplyState::Pending, step(StepKind::VerifyHashes)).is_err());
        assert!(transition(ApplyState::Staging, step(StepKind::CommitSwap)).is_err());
        assert!(transition(ApplyState::Committing, step(StepKind::WriteState)).is_err());
        assert!(transition(ApplyState::WritingState, ApplyEvent::Finish).is_err());
        assert!(transition(ApplyState::Done, step(StepKind::StageArtifact)).is_err());
    }

    #[test]
    fn failure_reachable_from_any_non_terminal_state() {
        for s in [
            ApplyState::Pending,
            ApplyState::Staging,
            ApplyState::Committing,
            ApplyState::WritingAudit,
        ] {
            assert_eq!(
                transition(s, ApplyEvent::Fail { step_id: 4 }).unwrap(),
                ApplyState::Failed { step_id: 4 }
            );
        }
        assert!(transition(ApplyState::Done, ApplyEvent::Fail { step_id: 1 }).is_err());
        assert!(transition(ApplyState::Failed { step_id: 1 }, ApplyEvent::Fail { step_id: 2 }).is_err());
    }
}
