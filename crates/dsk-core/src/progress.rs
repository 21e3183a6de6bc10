use dsk_schema::StepKind;

/// Progress reported by the engine while it works through a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    StepStarted {
        step_id: u32,
        kind: StepKind,
        total: u32,
    },
    StepSkipped {
        step_id: u32,
        kind: StepKind,
    },
    StepCompleted {
        step_id: u32,
        kind: StepKind,
    },
    FileCommitted {
        path: String,
    },
    RolledBack {
        restored: u32,
        removed: u32,
    },
}

/// Synchronous progress callback. Called on the engine's thread between
/// effects; implementations must not block for long.
pub trait ProgressSink {
    fn on_event(&self, event: &ProgressEvent);
}

pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

impl<F: Fn(&ProgressEvent)> ProgressSink for F {
    fn on_event(&self, event: &ProgressEvent) {
        self(event);
    }
}
