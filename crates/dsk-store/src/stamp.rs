//! Digest-stamped record files.
//!
//! The payload starts with a fixed `u64` digest record (tag 0x0001) followed
//! by the body records. The digest is FNV-1a 64 over the whole file with the
//! digest value zeroed, and is checked against the raw bytes before the body
//! is decoded.

use crate::StoreError;
use dsk_schema::tlv::{unwrap_file, wrap_file, TlvReader, TlvWriter, HEADER_SIZE};
use dsk_schema::{digest64, Digest64, IntegrityError};

pub(crate) const DIGEST_TAG: u16 = 0x0001;
const DIGEST_VALUE_OFFSET: usize = HEADER_SIZE + 6;

pub(crate) fn stamp(magic: &[u8; 4], body: &[u8]) -> (Vec<u8>, Digest64) {
    let mut w = TlvWriter::new();
    w.write_u64(DIGEST_TAG, 0);
    let mut payload = w.into_bytes();
    payload.extend_from_slice(body);
    let mut file = wrap_file(magic, &payload);
    let digest = Digest64(digest64(&file));
    file[DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8].copy_from_slice(&digest.0.to_le_bytes());
    (file, digest)
}

pub(crate) fn unstamp<'a>(
    magic: &[u8; 4],
    bytes: &'a [u8],
    mismatch: fn(Digest64, Digest64) -> IntegrityError,
) -> Result<(&'a [u8], Digest64), StoreError> {
    let payload = unwrap_file(magic, bytes)?;
    let mut reader = TlvReader::new(payload);
    let stored = match reader.read_record() {
        Ok(Some(rec)) if rec.tag == DIGEST_TAG && rec.payload.len() == 8 => {
            Digest64(rec.as_u64()?)
        }
        _ => Digest64::ZERO,
    };
    let mut zeroed = bytes.to_vec();
    if stored != Digest64::ZERO {
        zeroed[DIGEST_VALUE_OFFSET..DIGEST_VALUE_OFFSET + 8].fill(0);
    }
    let computed = Digest64(digest64(&zeroed));
    if stored != computed {
        return Err(mismatch(stored, computed).into());
    }
    Ok((&payload[6 + 8..], stored))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch(stored: Digest64, computed: Digest64) -> IntegrityError {
        IntegrityError::JournalDigestMismatch { stored, computed }
    }

    #[test]
    fn stamp_and_unstamp() {
        let mut w = TlvWriter::new();
        w.write_str(0x0002, "body");
        let (file, digest) = stamp(b"TEST", w.as_bytes());
        let (body, stored) = unstamp(b"TEST", &file, mismatch).unwrap();
        assert_eq!(body, w.as_bytes());
        assert_eq!(stored, digest);
    }

    #[test]
    fn tampered_body_is_integrity_error() {
        let mut w = TlvWriter::new();
        w.write_str(0x0002, "body");
        let (mut file, _) = stamp(b"TEST", w.as_bytes());
        let last = file.len() - 1;
        file[last] ^= 0x20;
        assert!(matches!(
            unstamp(b"TEST", &file, mismatch),
            Err(StoreError::Integrity(IntegrityError::JournalDigestMismatch { .. }))
        ));
    }
}
