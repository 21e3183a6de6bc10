//! Transaction journal: per-file commit intents.
//!
//! Every change to the live install root is recorded here, durably, before it
//! happens. `had_previous` says whether a file already existed at the target
//! (and was therefore moved to `backup/`), which is all rollback needs to
//! restore the pre-apply bytes. The registration record is journaled the same
//! way.

use crate::fs::FileSystem;
use crate::stamp::{stamp, unstamp};
use crate::StoreError;
use dsk_schema::tlv::{required, ParseError, TlvReader, TlvWriter};
use dsk_schema::{Digest64, IntegrityError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const TXN_MAGIC: &[u8; 4] = b"DSKT";

mod tag {
    pub const PLAN_DIGEST: u16 = 0x0002;
    pub const ENTRIES: u16 = 0x0003;

    pub const ENTRY: u16 = 0x0200;
    pub const E_ACTION: u16 = 0x0001;
    pub const E_OP_INDEX: u16 = 0x0002;
    pub const E_ROOT: u16 = 0x0003;
    pub const E_PATH: u16 = 0x0004;
    pub const E_HAD_PREVIOUS: u16 = 0x0005;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnAction {
    /// Staged file replaces (or creates) the live file.
    Replace,
    /// Live file is moved to backup.
    Remove,
    /// Whole staged root renamed into place; the live root did not exist.
    SwapRoot,
    /// Registration record replaced (or removed by an uninstall).
    Register,
}

impl TxnAction {
    fn as_u8(self) -> u8 {
        match self {
            TxnAction::Replace => 1,
            TxnAction::Remove => 2,
            TxnAction::SwapRoot => 3,
            TxnAction::Register => 4,
        }
    }

    fn from_u8(v: u8) -> Result<Self, ParseError> {
        match v {
            1 => Ok(TxnAction::Replace),
            2 => Ok(TxnAction::Remove),
            3 => Ok(TxnAction::SwapRoot),
            4 => Ok(TxnAction::Register),
            other => Err(ParseError::InvalidEnum {
                field: "txn_action",
                value: u32::from(other),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxnEntry {
    pub action: TxnAction,
    /// Index into the plan's file ops; unused for root swaps.
    pub op_index: u32,
    pub target_root_id: u32,
    /// Path relative to the install root; empty for root swaps.
    pub path: String,
    pub had_previous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TxnJournal {
    pub plan_digest64: Digest64,
    pub entries: Vec<TxnEntry>,
}

impl TxnJournal {
    pub fn new(plan_digest64: Digest64) -> Self {
        Self {
            plan_digest64,
            entries: Vec::new(),
        }
    }

    /// The intent recorded for file op `op_index`, if any.
    pub fn file_entry(&self, op_index: u32) -> Option<&TxnEntry> {
        self.entries.iter().find(|e| {
            matches!(e.action, TxnAction::Replace | TxnAction::Remove) && e.op_index == op_index
        })
    }

    pub fn has_op(&self, op_index: u32) -> bool {
        self.file_entry(op_index).is_some()
    }

    pub fn registration_entry(&self) -> Option<&TxnEntry> {
        self.entries
            .iter()
            .find(|e| e.action == TxnAction::Register)
    }

    pub fn has_swapped_root(&self, root_id: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.action == TxnAction::SwapRoot && e.target_root_id == root_id)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_u64(tag::PLAN_DIGEST, self.plan_digest64.0);
        w.write_container(tag::ENTRIES, |list| {
            for e in &self.entries {
                list.write_container(tag::ENTRY, |ew| {
                    ew.write_u8(tag::E_ACTION, e.action.as_u8());
                    ew.write_u32(tag::E_OP_INDEX, e.op_index);
                    ew.write_u32(tag::E_ROOT, e.target_root_id);
                    ew.write_str(tag::E_PATH, &e.path);
                    ew.write_bool(tag::E_HAD_PREVIOUS, e.had_previous);
                });
            }
        });
        stamp(TXN_MAGIC, w.as_bytes()).0
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (body, _) = unstamp(TXN_MAGIC, bytes, |stored, computed| {
            IntegrityError::JournalDigestMismatch { stored, computed }
        })?;
        let mut plan_digest = None;
        let mut entries = Vec::new();
        let mut reader = TlvReader::new(body);
        while let Some(rec) = reader.read_record()? {
            match rec.tag {
                tag::PLAN_DIGEST => plan_digest = Some(Digest64(rec.as_u64()?)),
                tag::ENTRIES => {
                    let mut list = rec.reader();
                    while let Some(item) = list.read_record()? {
                        if item.tag != tag::ENTRY {
                            item.into_unknown()?;
                            continue;
                        }
                        let mut action = None;
                        let mut entry = TxnEntry {
                            action: TxnAction::Replace,
                            op_index: 0,
                            target_root_id: 0,
                            path: String::new(),
                            had_previous: false,
                        };
                        let mut fields = item.reader();
                        while let Some(f) = fields.read_record()? {
                            match f.tag {
                                tag::E_ACTION => action = Some(TxnAction::from_u8(f.as_u8()?)?),
                                tag::E_OP_INDEX => entry.op_index = f.as_u32()?,
                                tag::E_ROOT => entry.target_root_id = f.as_u32()?,
                                tag::E_PATH => entry.path = f.as_string()?,
                                tag::E_HAD_PREVIOUS => entry.had_previous = f.as_bool()?,
                                _ => {
                                    f.into_unknown()?;
                                }
                            }
                        }
                        entry.action = required(action, "txn.action")?;
                        entries.push(entry);
                    }
                }
                _ => {
                    rec.into_unknown()?;
                }
            }
        }
        Ok(Self {
            plan_digest64: required(plan_digest, "plan_digest64")?,
            entries,
        })
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, StoreError> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let bytes = fs.read_file_bytes(path)?;
        Self::parse(&bytes).map(Some)
    }
}

pub struct TxnWriter<'a> {
    fs: &'a dyn FileSystem,
    path: PathBuf,
    txn: TxnJournal,
}

impl<'a> TxnWriter<'a> {
    pub fn create(
        fs: &'a dyn FileSystem,
        path: PathBuf,
        plan_digest64: Digest64,
    ) -> Result<Self, StoreError> {
        let writer = Self {
            fs,
            path,
            txn: TxnJournal::new(plan_digest64),
        };
        writer.persist()?;
        Ok(writer)
    }

    pub fn resume(fs: &'a dyn FileSystem, path: PathBuf, txn: TxnJournal) -> Self {
        Self { fs, path, txn }
    }

    /// Record an intent durably. Call before performing the effect.
    pub fn record(&mut self, entry: TxnEntry) -> Result<(), StoreError> {
        debug!(
            "txn intent: {:?} root={} path={} had_previous={}",
            entry.action, entry.target_root_id, entry.path, entry.had_previous
        );
        self.txn.entries.push(entry);
        self.persist()
    }

    pub fn txn(&self) -> &TxnJournal {
        &self.txn
    }

    fn persist(&self) -> Result<(), StoreError> {
        self.fs
            .write_file_bytes_atomic(&self.path, &self.txn.to_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    #[test]
    fn record_persists_each_intent() {
        let fs = MemoryFs::new();
        let path = PathBuf::from("/mem/state/p/txn.dsutxn");
        let mut w = TxnWriter::create(&fs, path.clone(), Digest64(5)).unwrap();
        w.record(TxnEntry {
            action: TxnAction::Replace,
            op_index: 0,
            target_root_id: 0,
            path: "bin/core".to_owned(),
            had_previous: true,
        })
        .unwrap();
        w.record(TxnEntry {
            action: TxnAction::SwapRoot,
            op_index: 0,
            target_root_id: 1,
            path: String::new(),
            had_previous: false,
        })
        .unwrap();

        let loaded = TxnJournal::load(&fs, &path).unwrap().unwrap();
        assert_eq!(&loaded, w.txn());
        assert!(loaded.has_op(0));
        assert!(!loaded.has_op(1));
        assert!(loaded.has_swapped_root(1));
        assert!(loaded.entries[0].had_previous);
    }

    #[test]
    fn registration_intent_is_not_a_file_op() {
        let mut txn = TxnJournal::new(Digest64(6));
        txn.entries.push(TxnEntry {
            action: TxnAction::Register,
            op_index: 0,
            target_root_id: 0,
            path: "registrations.dsureg".to_owned(),
            had_previous: true,
        });
        let loaded = TxnJournal::parse(&txn.to_bytes()).unwrap();
        assert!(!loaded.has_op(0));
        assert!(loaded.file_entry(0).is_none());
        assert!(loaded.registration_entry().is_some_and(|e| e.had_previous));
    }

    #[test]
    fn bad_action_byte_is_parse_error() {
        assert!(matches!(
            TxnAction::from_u8(9),
            Err(ParseError::InvalidEnum { field: "txn_action", value: 9 })
        ));
    }
}
