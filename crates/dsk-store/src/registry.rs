//! Registration record: the shortcuts, file associations and URL handlers a
//! product currently has registered with the desktop.
//!
//! The register-actions step owns this file. It is journaled like a live
//! file: the previous record moves to `registrations.dsureg.prev` before the
//! new one is written, and rollback moves it back.

use crate::fs::FileSystem;
use crate::stamp::{stamp, unstamp};
use crate::StoreError;
use dsk_schema::tlv::{required, ParseError, TlvReader, TlvWriter};
use dsk_schema::{Digest64, IntegrityError, Plan, Registrations};
use serde::Serialize;
use std::path::Path;

pub const REGISTRATIONS_MAGIC: &[u8; 4] = b"DSKG";

mod tag {
    pub const PRODUCT_ID: u16 = 0x0002;
    pub const PLAN_DIGEST: u16 = 0x0003;
    pub const SHORTCUTS: u16 = 0x0004;
    pub const FILE_ASSOC: u16 = 0x0005;
    pub const URL_HANDLERS: u16 = 0x0006;

    pub const ITEM: u16 = 0x0100;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationRecord {
    pub product_id: String,
    /// Plan whose register-actions step wrote this record.
    pub plan_digest64: Digest64,
    pub registrations: Registrations,
}

impl RegistrationRecord {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            product_id: plan.product_id.clone(),
            plan_digest64: plan.plan_digest64,
            registrations: plan.registrations.clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_str(tag::PRODUCT_ID, &self.product_id);
        w.write_u64(tag::PLAN_DIGEST, self.plan_digest64.0);
        w.write_str_list(tag::SHORTCUTS, tag::ITEM, &self.registrations.shortcuts);
        w.write_str_list(
            tag::FILE_ASSOC,
            tag::ITEM,
            &self.registrations.file_associations,
        );
        w.write_str_list(tag::URL_HANDLERS, tag::ITEM, &self.registrations.url_handlers);
        stamp(REGISTRATIONS_MAGIC, w.as_bytes()).0
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, StoreError> {
        let (body, _) = unstamp(REGISTRATIONS_MAGIC, bytes, |stored, computed| {
            IntegrityError::StateDigestMismatch { stored, computed }
        })?;
        Ok(decode_body(body)?)
    }

    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Option<Self>, StoreError> {
        if !fs.exists(path) {
            return Ok(None);
        }
        let bytes = fs.read_file_bytes(path)?;
        Self::parse(&bytes).map(Some)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<(), StoreError> {
        fs.write_file_bytes_atomic(path, &self.to_bytes())
    }
}

fn decode_body(body: &[u8]) -> Result<RegistrationRecord, ParseError> {
    let (mut product_id, mut plan_digest) = (None, None);
    let mut registrations = Registrations::default();
    let mut reader = TlvReader::new(body);
    while let Some(rec) = reader.read_record()? {
        match rec.tag {
            tag::PRODUCT_ID => product_id = Some(rec.as_string()?),
            tag::PLAN_DIGEST => plan_digest = Some(Digest64(rec.as_u64()?)),
            tag::SHORTCUTS => registrations.shortcuts = rec.as_str_list(tag::ITEM)?,
            tag::FILE_ASSOC => registrations.file_associations = rec.as_str_list(tag::ITEM)?,
            tag::URL_HANDLERS => registrations.url_handlers = rec.as_str_list(tag::ITEM)?,
            _ => {
                rec.into_unknown()?;
            }
        }
    }
    Ok(RegistrationRecord {
        product_id: required(product_id, "product_id")?,
        plan_digest64: required(plan_digest, "plan_digest64")?,
        registrations,
    })
}
