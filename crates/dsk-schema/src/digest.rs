//! FNV-1a content digests.
//!
//! Every persisted artifact (manifest, request, resolved set, plan, journal
//! records, installed state) is stamped with a 64-bit FNV-1a digest. These are
//! integrity and identity checks, not security boundaries.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

pub const FNV64_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
pub const FNV64_PRIME: u64 = 1_099_511_628_211;

const FNV32_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV32_PRIME: u32 = 16_777_619;

/// Running FNV-1a 64-bit hasher.
///
/// Composite digests feed fields through one hasher with explicit framing:
/// strings are length-delimited and fields are separated by a NUL byte, so
/// `("ab", "c")` and `("a", "bc")` never collide by concatenation.
#[derive(Debug, Clone, Copy)]
pub struct Fnv64 {
    state: u64,
}

impl Default for Fnv64 {
    fn default() -> Self {
        Self::new()
    }
}

impl Fnv64 {
    pub fn new() -> Self {
        Self {
            state: FNV64_OFFSET_BASIS,
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.state ^= u64::from(b);
            self.state = self.state.wrapping_mul(FNV64_PRIME);
        }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.update(&[v]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.update(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.update(&v.to_le_bytes());
    }

    /// Length-delimited string write: u32 LE length, then the UTF-8 bytes.
    pub fn write_str(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.update(s.as_bytes());
    }

    pub fn write_sep(&mut self) {
        self.update(&[0]);
    }

    pub fn finish(&self) -> u64 {
        self.state
    }
}

pub fn digest64(bytes: &[u8]) -> u64 {
    let mut h = Fnv64::new();
    h.update(bytes);
    h.finish()
}

/// FNV-1a 32-bit, used for the fixed file-header checksum.
pub fn digest32(bytes: &[u8]) -> u32 {
    let mut h = FNV32_OFFSET_BASIS;
    for &b in bytes {
        h ^= u32::from(b);
        h = h.wrapping_mul(FNV32_PRIME);
    }
    h
}

/// A 64-bit digest value. Displays and serializes as 16 lowercase hex digits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest64(pub u64);

impl Digest64 {
    pub const ZERO: Digest64 = Digest64(0);

    pub fn of(bytes: &[u8]) -> Self {
        Self(digest64(bytes))
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_hex(self) -> String {
        format!("{:016x}", self.0)
    }

    /// Parse exactly 16 hex digits, as written by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(s, 16).ok().map(Self)
    }
}

impl fmt::Display for Digest64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for Digest64 {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl Serialize for Digest64 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest64 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest64::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid digest64 '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_offset_basis() {
        assert_eq!(digest64(b""), FNV64_OFFSET_BASIS);
    }

    #[test]
    fn known_vectors() {
        // Reference values for FNV-1a 64.
        assert_eq!(digest64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(digest64(b"foobar"), 0x8594_4171_f739_67e8);
        assert_eq!(digest32(b"a"), 0xe40c_292c);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let mut h = Fnv64::new();
        h.update(b"foo");
        h.update(b"bar");
        assert_eq!(h.finish(), digest64(b"foobar"));
    }

    #[test]
    fn framed_strings_do_not_collide() {
        let mut a = Fnv64::new();
        a.write_str("ab");
        a.write_sep();
        a.write_str("c");
        let mut b = Fnv64::new();
        b.write_str("a");
        b.write_sep();
        b.write_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn digest_hex_roundtrip() {
        let d = Digest64(0x0123_4567_89ab_cdef);
        assert_eq!(d.to_string(), "0123456789abcdef");
        assert_eq!(Digest64::from_hex("0123456789abcdef"), Some(d));
        assert_eq!(Digest64::from_hex("xyz"), None);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"0123456789abcdef\"");
    }

    #[test]
    fn hex_digest_needs_sixteen_plain_digits() {
        assert_eq!(
            Digest64::from_hex("0123456789ABCDEF"),
            Some(Digest64(0x0123_4567_89ab_cdef))
        );
        for bad in ["+123456789abcdef", "-123456789abcdef", "ff", "", "0123456789abcdef0"] {
            assert_eq!(Digest64::from_hex(bad), None, "{bad:?}");
        }
        assert!(serde_json::from_str::<Digest64>("\"+123456789abcdef\"").is_err());
    }
}
