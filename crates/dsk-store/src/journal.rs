//! Job journal: append-only record of lifecycle progress.
//!
//! The engine appends an entry and makes it durable before performing the
//! effect it describes, so after a crash the journal always shows at least
//! what was attempted. Entries carry no timestamps or host paths: two runs of
//! the same plan produce byte-identical journals.

use crate::fs::FileSystem;
use crate::stamp::{stamp, unstamp};
use crate::StoreError;
use dsk_schema::tlv::{required, ParseError, TlvReader, TlvWriter};
use dsk_schema::{Digest64, IntegrityError, Operation, PlanStep, StepKind};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const JOURNAL_MAGIC: &[u8; 4] = b"DSKJ";

mod tag {
    pub const PLAN_DIGEST: u16 = 0x0002;
    pub const OPERATION: u16 = 0x0003;
    pub const DRY_RUN: u16 = 0x0004;
    pub const ENTRIES: u16 = 0x0005;

    pub const ENTRY: u16 = 0x0200;
    pub const E_SEQ: u16 = 0x0001;
    pub const E_KIND: u16 = 0x0002;
    pub const E_STEP_ID: u16 = 0x0003;
    pub const E_STEP_KIND: u16 = 0x0004;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Begin,
    StepStarted,
    StepCompleted,
    Failed,
    Interrupted,
    Completed,
    RolledBack,
}

impl EntryKind {
    fn as_u8(self) -> u8 {
        match self {
            EntryKind::Begin => 1,
            EntryKind::StepStarted => 2,
            EntryKind::StepCompleted => 3,
            EntryKind::Failed => 4,
            EntryKind::Interrupted => 5,
            EntryKind::Completed => 6,
            EntryKind::RolledBack => 7,
        }
    }

    fn from_u8(v: u8) -> Result<Self, ParseError> {
        Ok(match v {
            1 => EntryKind::Begin,
            2 => EntryKind::StepStarted,
            3 => EntryKind::StepCompleted,
            4 => EntryKind::Failed,
            5 => EntryKind::Interrupted,
            6 => EntryKind::Completed,
            7 => EntryKind::RolledBack,
            other => {
                return Err(ParseError::InvalidEnum {
                    field: "journal_entry_kind",
                    value: u32::from(other),
                })
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JournalEntry {
    pub seq: u32,
    pub kind: EntryKind,
    /// Plan step id, 0 for entries not tied to a step.
    pub step_id: u32,
    pub step_kind: Option<StepKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalStatus {
    InProgress,
    Failed { step_id: u32 },
    Interrupted,
    Completed,
    RolledBack,
}

impl JournalStatus {
    /// Completed and rolled-back journals need neither resume nor rollback.
    pub fn is_finished(self) -> bool {
        matches!(self, JournalStatus::Completed | JournalStatus::RolledBack)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobJournal {
    pub plan_digest64: Digest64,
    pub operation: Operation,
    pub dry_run: bool,
    pub entries: Vec<JournalEntry>,
}

impl JobJournal {
    pub fn new(plan_digest64: Digest64, operation: Operation, dry_run: bool) -> Self {
        Self {
            plan_digest64,
            operation,
            dry_run,
            entries: Vec::new(),
        }
    }

    pub fn status(&self) -> JournalStatus {
        if self.entries.iter().any(|e| e.kind == EntryKind::RolledBack) {
            return JournalStatus::RolledBack;
        }
        if self.entries.iter().any(|e| e.kind == EntryKind::Completed) {
            return JournalStatus::Completed;
        }
        match self.entries.last() {
            Some(e) if e.kind == EntryKind::Failed => JournalStatus::Failed { step_id: e.step_id },
            Some(e) if e.kind == EntryKind::Interrupted => JournalStatus::Interrupted,
            _ => JournalStatus::InProgress,
        }
    }

    pub fn completed_steps(&self) -> BTreeSet<u32> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::StepCompleted)
            .map(|e| e.step_id)
            .collect()
    }

    /// Highest step id durably recorded as completed.
    pub fn last_completed_step(&self) -> Option<u32> {
        self.completed_steps().last().copied()
    }

    pub fn has_started(&self, step_id: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.kind == EntryKind::StepStarted && e.step_id == step_id)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        stamp(JOURNAL_MAGIC, &self.encode_body()).0
    }

    pub fn digest(&self) -> Digest64 {
        stamp(JOURNAL_MAGIC, &self.encode_body()).1
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_u64(tag::PLAN_DIGEST, self.plan_digest64.0);
        w.write_u8(tag::OPERATION, self.operation.as_u8());
        w.write_bool(tag::DRY_RUN, self.dry_run);
        w.write_container(tag::ENTRIES, |list| {
            for e in &self.entries {
                list.write_container(tag::ENTRY, |ew| {
                    ew.write_u32(tag::E_SEQ, e.seq);
                    ew.write_u8(tag::E_KIND, e.kind.as_u8());
                    ew.write_u32(tag::E_STEP_ID, e.step_id);
                    if let Some(kind) = e.step_kind {
                        ew.write_u8(tag::E_STEP_KIND, kind.as_u8());
                    }
                });
            }
        });
        w.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (body, _) = unstamp(JOURNAL_MAGIC, bytes, |stored, computed| {
            IntegrityError::JournalDigestMismatch { stored, computed }
        })?;
        let (mut plan_digest, mut operation, mut dry_run) = (None, None, false);
        let mut entries = Vec::new();
        let mut reader = TlvReader::new(body);
        while let Some(rec) = reader.read_record()? {
            match rec.tag {
                tag::PLAN_DIGEST => plan_digest = Some(Digest64(rec.as_u64()?)),
                tag::OPERATION => operation = Some(Operation::from_u8(rec.as_u8()?)?),
                tag::DRY_RUN => dry_run = rec.as_bool()?,
                tag::ENTRIES => {
                    let mut list = rec.reader();
                    while let Some(item) = list.read_record()? {
                        if item.tag != tag::ENTRY {
                            item.into_unknown()?;
                            continue;
                        }
                        let (mut seq, mut kind, mut step_id, mut step_kind) = (None, None, 0, None);
                        let mut fields = item.reader();
                        while let Some(f) = fields.read_record()? {
                            match f.tag {
                                tag::E_SEQ => seq = Some(f.as_u32()?),
                                tag::E_KIND => kind = Some(EntryKind::from_u8(f.as_u8()?)?),
                                tag::E_STEP_ID => step_id = f.as_u32()?,
                                tag::E_STEP_KIND => step_kind = Some(StepKind::from_u8(f.as_u8()?)?),
                                _ => {
                                    f.into_unknown()?;
                                }
                            }
                        }
                        entries.push(JournalEntry {
                            seq: required(seq, "entry.seq")?,
                            kind: required(kind, "entry.kind")?,
                            step_id,
                            step_kind,
                        });
                    }
                }
                _ => {
                    rec.into_unknown()?;
                }
            }
        }
        Ok(Self {
            plan_digest64: required(plan_digest, "plan_digest64")?,
            operation: required(operation, "operation")?,
            dry_run,
            entries,
        })
    }

    /// Load the journal at `path`, or `None` if there is none.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, StoreError> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let bytes = fs.read_file_bytes(path)?;
        Self::parse(&bytes).map(Some)
    }
}

/// Owns a journal for the duration of one engine invocation and persists it
/// after every append.
pub struct JournalWriter<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
    journal: JobJournal,
}

impl<'a> JournalWriter<'a> {
    /// Start a fresh journal with a `Begin` entry.
    pub fn create(
        fs: &'a dyn FileSystem,
        path: PathBuf,
        plan_digest64: Digest64,
        operation: Operation,
        dry_run: bool,
    ) -> Result<Self, StoreError> {
        let mut writer = Self {
            fs,
            path,
            journal: JobJournal::new(plan_digest64, operation, dry_run),
        };
        writer.append(EntryKind::Begin, None)?;
        Ok(writer)
    }

    /// Continue an existing journal.
    pub fn resume(fs: &'a dyn FileSystem, path: PathBuf, journal: JobJournal) -> Self {
        Self { fs, path, journal }
    }

    pub fn append(&mut self, kind: EntryKind, step: Option<&PlanStep>) -> Result<(), StoreError> {
        let entry = JournalEntry {
            seq: self.journal.entries.len() as u32 + 1,
            kind,
            step_id: step.map_or(0, |s| s.step_id),
            step_kind: step.map(|s| s.kind),
        };
        debug!("journal append: {:?} step={}", entry.kind, entry.step_id);
        self.journal.entries.push(entry);
        self.fs
            .write_file_bytes_atomic(&self.path, &self.journal.to_bytes())
    }

    pub fn journal(&self) -> &JobJournal {
        &self.journal
    }

    pub fn into_journal(self) -> JobJournal {
        self.journal
    }
}
