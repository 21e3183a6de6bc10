//! Append-only audit trail of finished operations.

use crate::fs::FileSystem;
use crate::stamp::{stamp, unstamp};
use crate::StoreError;
use dsk_schema::tlv::{required, ParseError, TlvReader, TlvWriter};
use dsk_schema::{Digest64, IntegrityError, Operation};
use serde::Serialize;
use std::path::Path;

pub const AUDIT_MAGIC: &[u8; 4] = b"DSKA";

mod tag {
    pub const ENTRIES: u16 = 0x0002;

    pub const ENTRY: u16 = 0x0200;
    pub const E_SEQ: u16 = 0x0001;
    pub const E_OPERATION: u16 = 0x0002;
    pub const E_OUTCOME: u16 = 0x0003;
    pub const E_PLAN_DIGEST: u16 = 0x0004;
    pub const E_VERSION: u16 = 0x0005;
    pub const E_WRITTEN: u16 = 0x0006;
    pub const E_REMOVED: u16 = 0x0007;
    pub const E_STATE_DIGEST: u16 = 0x0008;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Applied,
    DryRun,
    RolledBack,
}

impl AuditOutcome {
    fn as_u8(self) -> u8 {
        match self {
            AuditOutcome::Applied => 1,
            AuditOutcome::DryRun => 2,
            AuditOutcome::RolledBack => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self, ParseError> {
        match v {
            1 => Ok(AuditOutcome::Applied),
            2 => Ok(AuditOutcome::DryRun),
            3 => Ok(AuditOutcome::RolledBack),
            other => Err(ParseError::InvalidEnum {
                field: "audit_outcome",
                value: u32::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub seq: u32,
    pub operation: Operation,
    pub outcome: AuditOutcome,
    pub plan_digest64: Digest64,
    pub product_version: String,
    pub files_written: u32,
    pub files_removed: u32,
    /// Digest of the installed state written by this operation, zero when
    /// no state was written.
    pub state_digest64: Digest64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditLog {
    pub entries: Vec<AuditEntry>,
}

impl AuditLog {
    /// Append an entry, assigning its sequence number.
    pub fn push(&mut self, mut entry: AuditEntry) {
        entry.seq = self.entries.len() as u32 + 1;
        self.entries.push(entry);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_container(tag::ENTRIES, |list| {
            for e in &self.entries {
                list.write_container(tag::ENTRY, |ew| {
                    ew.write_u32(tag::E_SEQ, e.seq);
                    ew.write_u8(tag::E_OPERATION, e.operation.as_u8());
                    ew.write_u8(tag::E_OUTCOME, e.outcome.as_u8());
                    ew.write_u64(tag::E_PLAN_DIGEST, e.plan_digest64.0);
                    ew.write_str(tag::E_VERSION, &e.product_version);
                    ew.write_u32(tag::E_WRITTEN, e.files_written);
                    ew.write_u32(tag::E_REMOVED, e.files_removed);
                    ew.write_u64(tag::E_STATE_DIGEST, e.state_digest64.0);
                });
            }
        });
        stamp(AUDIT_MAGIC, w.as_bytes()).0
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (body, _) = unstamp(AUDIT_MAGIC, bytes, |stored, computed| {
            IntegrityError::JournalDigestMismatch { stored, computed }
        })?;
        let mut log = AuditLog::default();
        let mut reader = TlvReader::new(body);
        while let Some(rec) = reader.read_record()? {
            if rec.tag != tag::ENTRIES {
                rec.into_unknown()?;
                continue;
            }
            let mut list = rec.reader();
            while let Some(item) = list.read_record()? {
                if item.tag != tag::ENTRY {
                    item.into_unknown()?;
                    continue;
                }
                let (mut seq, mut operation, mut outcome, mut plan_digest) =
                    (None, None, None, None);
                let mut entry_version = String::new();
                let (mut written, mut removed, mut state_digest) = (0, 0, Digest64::ZERO);
                let mut fields = item.reader();
                while let Some(f) = fields.read_record()? {
                    match f.tag {
                        tag::E_SEQ => seq = Some(f.as_u32()?),
                        tag::E_OPERATION => operation = Some(Operation::from_u8(f.as_u8()?)?),
                        tag::E_OUTCOME => outcome = Some(AuditOutcome::from_u8(f.as_u8()?)?),
                        tag::E_PLAN_DIGEST => plan_digest = Some(Digest64(f.as_u64()?)),
                        tag::E_VERSION => entry_version = f.as_string()?,
                        tag::E_WRITTEN => written = f.as_u32()?,
                        tag::E_REMOVED => removed = f.as_u32()?,
                        tag::E_STATE_DIGEST => state_digest = Digest64(f.as_u64()?),
                        _ => {
                            f.into_unknown()?;
                        }
                    }
                }
                log.entries.push(AuditEntry {
                    seq: required(seq, "audit.seq")?,
                    operation: required(operation, "audit.operation")?,
                    outcome: required(outcome, "audit.outcome")?,
                    plan_digest64: required(plan_digest, "audit.plan_digest64")?,
                    product_version: entry_version,
                    files_written: written,
                    files_removed: removed,
                    state_digest64: state_digest,
                });
            }
        }
        Ok(log)
    }

    /// Load the audit log, or an empty one if none exists yet.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self, StoreError> {
        if !fs.exists(path) {
            return Ok(Self::default());
        }
        let bytes = fs.read_file_bytes(path)?;
        Self::parse(&bytes)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), StoreError> {
        fs.write_file_bytes_atomic(path, &self.to_bytes())
    }
}
