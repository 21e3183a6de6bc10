//! Type-length-value binary codec shared by every persisted dsk artifact.
//!
//! A file is a fixed 20-byte header followed by a payload of TLV records:
//!
//! ```text
//! offset  size  field
//!      0     4  magic
//!      4     2  format version (u16 LE)
//!      6     2  endian marker 0xFFFE (u16 LE)
//!      8     4  header size, always 20 (u32 LE)
//!     12     4  payload length (u32 LE)
//!     16     4  FNV-1a 32 checksum over bytes [0, 16)
//! ```
//!
//! Each record is `u16 tag, u32 length, payload`. Lists and structs are
//! records whose payload is itself a TLV stream. Tags with [`TAG_OPTIONAL`]
//! set are forward-compatible extensions: readers that do not know them keep
//! them as [`UnknownRecord`] and writers never emit them in canonical output.

use crate::digest::digest32;
use thiserror::Error;

pub const HEADER_SIZE: usize = 20;
pub const ENDIAN_MARKER: u16 = 0xFFFE;
pub const FORMAT_VERSION: u16 = 1;
pub const TAG_OPTIONAL: u16 = 0x8000;

const RECORD_HEADER_SIZE: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("file too short: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },
    #[error("unsupported format version {found}, expected {expected}")]
    UnsupportedVersion { expected: u16, found: u16 },
    #[error("bad endian marker 0x{0:04x}")]
    BadEndianMarker(u16),
    #[error("bad header size {0}, expected 20")]
    BadHeaderSize(u32),
    #[error("header checksum mismatch: stored 0x{stored:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("payload length {declared} does not match {actual} bytes present")]
    PayloadLength { declared: u32, actual: usize },
    #[error("record 0x{tag:04x} length {len} overruns buffer at offset {offset}")]
    LengthOverrun { tag: u16, len: usize, offset: usize },
    #[error("record 0x{tag:04x} has width {actual}, expected {expected}")]
    BadFieldWidth {
        tag: u16,
        expected: usize,
        actual: usize,
    },
    #[error("record 0x{0:04x} is not valid UTF-8")]
    InvalidUtf8(u16),
    #[error("unknown mandatory tag 0x{0:04x}")]
    UnknownMandatoryTag(u16),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid value {value} for '{field}'")]
    InvalidEnum { field: &'static str, value: u32 },
}

/// Wrap a TLV payload in the fixed file header.
pub fn wrap_file(magic: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(magic);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&ENDIAN_MARKER.to_le_bytes());
    out.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = digest32(&out[..16]);
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate the file header and return the payload slice.
pub fn unwrap_file<'a>(magic: &[u8; 4], bytes: &'a [u8]) -> Result<&'a [u8], ParseError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ParseError::Truncated {
            need: HEADER_SIZE,
            have: bytes.len(),
        });
    }
    let mut found = [0u8; 4];
    found.copy_from_slice(&bytes[..4]);
    if &found != magic {
        return Err(ParseError::BadMagic {
            expected: *magic,
            found,
        });
    }
    let stored = le_u32(&bytes[16..20]);
    let computed = digest32(&bytes[..16]);
    if stored != computed {
        return Err(ParseError::ChecksumMismatch { stored, computed });
    }
    let version = le_u16(&bytes[4..6]);
    if version != FORMAT_VERSION {
        return Err(ParseError::UnsupportedVersion {
            expected: FORMAT_VERSION,
            found: version,
        });
    }
    let endian = le_u16(&bytes[6..8]);
    if endian != ENDIAN_MARKER {
        return Err(ParseError::BadEndianMarker(endian));
    }
    let header_size = le_u32(&bytes[8..12]);
    if header_size as usize != HEADER_SIZE {
        return Err(ParseError::BadHeaderSize(header_size));
    }
    let declared = le_u32(&bytes[12..16]);
    let payload = &bytes[HEADER_SIZE..];
    if declared as usize != payload.len() {
        return Err(ParseError::PayloadLength {
            declared,
            actual: payload.len(),
        });
    }
    Ok(payload)
}

fn le_u16(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn le_u32(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

/// Growable TLV encoder.
#[derive(Debug, Default, Clone)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tlv(&mut self, tag: u16, payload: &[u8]) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn write_u8(&mut self, tag: u16, v: u8) {
        self.write_tlv(tag, &[v]);
    }

    pub fn write_u16(&mut self, tag: u16, v: u16) {
        self.write_tlv(tag, &v.to_le_bytes());
    }

    pub fn write_u32(&mut self, tag: u16, v: u32) {
        self.write_tlv(tag, &v.to_le_bytes());
    }

    pub fn write_u64(&mut self, tag: u16, v: u64) {
        self.write_tlv(tag, &v.to_le_bytes());
    }

    pub fn write_bool(&mut self, tag: u16, v: bool) {
        self.write_u8(tag, u8::from(v));
    }

    pub fn write_str(&mut self, tag: u16, s: &str) {
        self.write_tlv(tag, s.as_bytes());
    }

    /// Write a nested record whose payload is produced by `f`.
    pub fn write_container(&mut self, tag: u16, f: impl FnOnce(&mut TlvWriter)) {
        let mut inner = TlvWriter::new();
        f(&mut inner);
        self.write_tlv(tag, &inner.buf);
    }

    /// Write a list container holding one `item_tag` string record per item.
    pub fn write_str_list(&mut self, list_tag: u16, item_tag: u16, items: &[String]) {
        self.write_container(list_tag, |w| {
            for item in items {
                w.write_str(item_tag, item);
            }
        });
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// One decoded record borrowing from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub tag: u16,
    pub payload: &'a [u8],
}

impl<'a> Record<'a> {
    fn fixed<const N: usize>(&self) -> Result<[u8; N], ParseError> {
        <[u8; N]>::try_from(self.payload).map_err(|_| ParseError::BadFieldWidth {
            tag: self.tag,
            expected: N,
            actual: self.payload.len(),
        })
    }

    pub fn as_u8(&self) -> Result<u8, ParseError> {
        Ok(self.fixed::<1>()?[0])
    }

    pub fn as_u16(&self) -> Result<u16, ParseError> {
        Ok(u16::from_le_bytes(self.fixed()?))
    }

    pub fn as_u32(&self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.fixed()?))
    }

    pub fn as_u64(&self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.fixed()?))
    }

    pub fn as_bool(&self) -> Result<bool, ParseError> {
        Ok(self.as_u8()? != 0)
    }

    pub fn as_string(&self) -> Result<String, ParseError> {
        std::str::from_utf8(self.payload)
            .map(str::to_owned)
            .map_err(|_| ParseError::InvalidUtf8(self.tag))
    }

    /// Decode a list container of string items tagged `item_tag`.
    pub fn as_str_list(&self, item_tag: u16) -> Result<Vec<String>, ParseError> {
        let mut out = Vec::new();
        let mut reader = self.reader();
        while let Some(rec) = reader.read_record()? {
            if rec.tag == item_tag {
                out.push(rec.as_string()?);
            } else {
                rec.into_unknown()?;
            }
        }
        Ok(out)
    }

    /// Reader over the nested TLV stream of a container record.
    pub fn reader(&self) -> TlvReader<'a> {
        TlvReader::new(self.payload)
    }

    pub fn is_optional(&self) -> bool {
        self.tag & TAG_OPTIONAL != 0
    }

    /// Classify a record the caller does not recognize.
    ///
    /// Optional tags are retained as [`UnknownRecord`]; anything else is a
    /// hard parse failure.
    pub fn into_unknown(self) -> Result<UnknownRecord, ParseError> {
        if self.is_optional() {
            Ok(UnknownRecord {
                tag: self.tag,
                bytes: self.payload.to_vec(),
            })
        } else {
            Err(ParseError::UnknownMandatoryTag(self.tag))
        }
    }
}

/// An optional record that the reader did not understand.
///
/// Kept so that tooling can inspect it, but never written back: canonical
/// output is identical whether or not the input carried extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRecord {
    pub tag: u16,
    pub bytes: Vec<u8>,
}

/// Bounds-checked TLV decoder.
#[derive(Debug, Clone)]
pub struct TlvReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> TlvReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn read_record(&mut self) -> Result<Option<Record<'a>>, ParseError> {
        if self.is_empty() {
            return Ok(None);
        }
        let remaining = self.data.len() - self.pos;
        if remaining < RECORD_HEADER_SIZE {
            return Err(ParseError::Truncated {
                need: RECORD_HEADER_SIZE,
                have: remaining,
            });
        }
        let head = &self.data[self.pos..self.pos + RECORD_HEADER_SIZE];
        let tag = le_u16(&head[..2]);
        let len = le_u32(&head[2..6]) as usize;
        let start = self.pos + RECORD_HEADER_SIZE;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        let Some(end) = end else {
            return Err(ParseError::LengthOverrun {
                tag,
                len,
                offset: self.pos,
            });
        };
        self.pos = end;
        Ok(Some(Record {
            tag,
            payload: &self.data[start..end],
        }))
    }
}

/// Unwrap an optional field that the decoder requires.
pub fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ParseError> {
    value.ok_or(ParseError::MissingField(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8; 4] = b"TEST";

    fn sample_payload() -> Vec<u8> {
        let mut w = TlvWriter::new();
        w.write_u32(0x0001, 42);
        w.write_str(0x0002, "hello");
        w.write_container(0x0003, |inner| {
            inner.write_u64(0x0001, 7);
            inner.write_bool(0x0002, true);
        });
        w.into_bytes()
    }

    #[test]
    fn header_layout_is_fixed() {
        let file = wrap_file(MAGIC, &sample_payload());
        assert_eq!(&file[..4], b"TEST");
        assert_eq!(&file[6..8], &[0xFE, 0xFF]);
        assert_eq!(u32::from_le_bytes([file[8], file[9], file[10], file[11]]), 20);
        assert_eq!(file.len(), HEADER_SIZE + sample_payload().len());
    }

    #[test]
    fn wrap_and_unwrap() {
        let payload = sample_payload();
        let file = wrap_file(MAGIC, &payload);
        assert_eq!(unwrap_file(MAGIC, &file).unwrap(), payload.as_slice());
    }

    #[test]
    fn reads_nested_records() {
        let payload = sample_payload();
        let mut r = TlvReader::new(&payload);
        let a = r.read_record().unwrap().unwrap();
        assert_eq!(a.as_u32().unwrap(), 42);
        let b = r.read_record().unwrap().unwrap();
        assert_eq!(b.as_string().unwrap(), "hello");
        let c = r.read_record().unwrap().unwrap();
        let mut inner = c.reader();
        assert_eq!(inner.read_record().unwrap().unwrap().as_u64().unwrap(), 7);
        assert!(inner.read_record().unwrap().unwrap().as_bool().unwrap());
        assert!(inner.read_record().unwrap().is_none());
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let file = wrap_file(MAGIC, &sample_payload());
        assert!(matches!(
            unwrap_file(b"NOPE", &file),
            Err(ParseError::BadMagic { .. })
        ));
    }

    #[test]
    fn rejects_corrupt_header_checksum() {
        let mut file = wrap_file(MAGIC, &sample_payload());
        file[5] ^= 0x01;
        assert!(matches!(
            unwrap_file(MAGIC, &file),
            Err(ParseError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn rejects_payload_length_mismatch() {
        let mut file = wrap_file(MAGIC, &sample_payload());
        file.push(0);
        assert!(matches!(
            unwrap_file(MAGIC, &file),
            Err(ParseError::PayloadLength { .. })
        ));
    }

    #[test]
    fn rejects_truncated_file() {
        assert!(matches!(
            unwrap_file(MAGIC, b"TES"),
            Err(ParseError::Truncated { .. })
        ));
    }

    #[test]
    fn rejects_length_overrun() {
        let mut w = TlvWriter::new();
        w.write_str(0x0001, "abcdef");
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 2);
        let mut r = TlvReader::new(&bytes);
        assert!(matches!(
            r.read_record(),
            Err(ParseError::LengthOverrun { tag: 0x0001, .. })
        ));
    }

    #[test]
    fn rejects_wrong_width() {
        let mut w = TlvWriter::new();
        w.write_u16(0x0001, 5);
        let bytes = w.into_bytes();
        let rec = TlvReader::new(&bytes).read_record().unwrap().unwrap();
        assert!(matches!(
            rec.as_u32(),
            Err(ParseError::BadFieldWidth { expected: 4, actual: 2, .. })
        ));
    }

    #[test]
    fn unknown_optional_tag_is_retained() {
        let rec = Record {
            tag: 0x8042,
            payload: b"ext",
        };
        let unknown = rec.into_unknown().unwrap();
        assert_eq!(unknown.tag, 0x8042);
        assert_eq!(unknown.bytes, b"ext");
    }

    #[test]
    fn unknown_mandatory_tag_fails() {
        let rec = Record {
            tag: 0x0042,
            payload: b"",
        };
        assert_eq!(
            rec.into_unknown(),
            Err(ParseError::UnknownMandatoryTag(0x0042))
        );
    }

    #[test]
    fn string_list_roundtrip() {
        let mut w = TlvWriter::new();
        w.write_str_list(0x0010, 0x0011, &["a".to_owned(), "bc".to_owned()]);
        let bytes = w.into_bytes();
        let rec = TlvReader::new(&bytes).read_record().unwrap().unwrap();
        assert_eq!(rec.as_str_list(0x0011).unwrap(), vec!["a", "bc"]);
    }
}
