//! Newtype wrappers for string identifiers, providing compile-time type safety.
//!
//! All newtypes serialize/deserialize as plain strings.

use crate::tlv::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

macro_rules! string_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance from a string.
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            /// Return the inner string as a slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Case-normalized form used for identity comparisons.
            pub fn normalized(&self) -> String {
                self.0.to_ascii_lowercase()
            }

            pub fn eq_ignore_case(&self, other: &str) -> bool {
                self.0.eq_ignore_ascii_case(other)
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_newtype!(
    /// Component identifier. Unique within a manifest, compared case-insensitively.
    ComponentId
);

string_newtype!(
    /// Identifier of an installer variant in the splat registry.
    SplatId
);

/// Closed enumerations stored as a single byte on the wire.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident, $field:literal {
        $($variant:ident = $value:literal => $text:literal),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_u8(self) -> u8 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn from_u8(v: u8) -> Result<Self, ParseError> {
                match v {
                    $($value => Ok($name::$variant),)+
                    other => Err(ParseError::InvalidEnum {
                        field: $field,
                        value: u32::from(other),
                    }),
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase();
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == lowered)
                    .ok_or_else(|| format!("invalid {}: '{s}'", $field))
            }
        }
    };
}

wire_enum!(
    /// Where an installation lives and who owns it.
    InstallScope, "install_scope" {
        Portable = 1 => "portable",
        User = 2 => "user",
        System = 3 => "system",
    }
);

wire_enum!(
    Operation, "operation" {
        Install = 1 => "install",
        Upgrade = 2 => "upgrade",
        Repair = 3 => "repair",
        Uninstall = 4 => "uninstall",
    }
);

wire_enum!(
    UiMode, "ui_mode" {
        Gui = 1 => "gui",
        Tui = 2 => "tui",
        Cli = 3 => "cli",
    }
);

wire_enum!(
    /// File ownership model. `Any` is only meaningful as a request preference.
    Ownership, "ownership" {
        Any = 0 => "any",
        Portable = 1 => "portable",
        Pkg = 2 => "pkg",
    }
);

wire_enum!(
    ComponentKind, "component_kind" {
        Product = 1 => "product",
        Runtime = 2 => "runtime",
        Tools = 3 => "tools",
        Pack = 4 => "pack",
        Driver = 5 => "driver",
        Other = 6 => "other",
    }
);

wire_enum!(
    /// Why a component ended up in the resolved set.
    ComponentSource, "component_source" {
        Default = 1 => "default",
        User = 2 => "user",
        Dependency = 3 => "dependency",
    }
);

wire_enum!(
    FileOpKind, "file_op_kind" {
        Copy = 1 => "copy",
        Remove = 2 => "remove",
    }
);

wire_enum!(
    /// Lifecycle step kinds, in execution order.
    StepKind, "step_kind" {
        StageArtifact = 1 => "stage_artifact",
        VerifyHashes = 2 => "verify_hashes",
        CommitSwap = 3 => "commit_swap",
        RegisterActions = 4 => "register_actions",
        WriteState = 5 => "write_state",
        WriteAudit = 6 => "write_audit",
    }
);

/// Named bit sets. Serialized as the sorted list of set flag names so that
/// JSON dumps stay readable and deterministic.
macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident {
        $($flag:ident = $bit:literal => $text:literal),+ $(,)?
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            $(pub const $flag: $name = $name($bit);)+
            pub const NAMES: &'static [(&'static str, $name)] = &[$(($text, $name($bit))),+];

            pub const fn empty() -> Self {
                Self(0)
            }

            pub const fn from_bits(bits: u32) -> Self {
                Self(bits)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            #[must_use]
            pub const fn with(self, other: $name) -> Self {
                Self(self.0 | other.0)
            }

            pub fn names(self) -> Vec<&'static str> {
                Self::NAMES
                    .iter()
                    .filter(|(_, f)| self.contains(*f))
                    .map(|(n, _)| *n)
                    .collect()
            }

            pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
                let mut out = Self::empty();
                for name in names {
                    let name = name.as_ref().trim().to_ascii_lowercase();
                    let flag = Self::NAMES
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, f)| *f)
                        .ok_or_else(|| format!("unknown {} flag '{name}'", stringify!($name)))?;
                    out.insert(flag);
                }
                Ok(out)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                self.with(rhs)
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                self.names().serialize(serializer)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let names = Vec::<String>::deserialize(deserializer)?;
                $name::from_names(&names).map_err(serde::de::Error::custom)
            }
        }
    };
}

flag_set!(
    /// Request policy bits.
    PolicyFlags {
        DETERMINISTIC = 0x0001 => "deterministic",
        OFFLINE = 0x0002 => "offline",
        ALLOW_PRERELEASE = 0x0004 => "allow_prerelease",
        LEGACY_MODE = 0x0008 => "legacy_mode",
        ENABLE_SHORTCUTS = 0x0010 => "enable_shortcuts",
        ENABLE_FILE_ASSOC = 0x0020 => "enable_file_assoc",
        ENABLE_URL_HANDLERS = 0x0040 => "enable_url_handlers",
    }
);

flag_set!(
    /// Capability and action bits advertised by a splat and constrained by a request.
    CapBits {
        ATOMIC_SWAP = 0x0001 => "atomic_swap",
        RESUME = 0x0002 => "resume",
        ROLLBACK = 0x0004 => "rollback",
        ELEVATION = 0x0008 => "elevation",
        SHORTCUTS = 0x0010 => "shortcuts",
        FILE_ASSOC = 0x0020 => "file_assoc",
        URL_HANDLERS = 0x0040 => "url_handlers",
    }
);

/// Check a platform triple against the `os-arch` token grammar,
/// i.e. `^[a-z0-9_]+-[a-z0-9_]+$`.
pub fn is_valid_platform_triple(s: &str) -> bool {
    let Some((os, arch)) = s.split_once('-') else {
        return false;
    };
    is_os_token(os) && is_os_token(arch)
}

fn is_os_token(t: &str) -> bool {
    !t.is_empty()
        && t
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

/// A component target is either a full triple or a bare os token such as
/// `linux_deb`, which matches every architecture of that os.
pub fn is_valid_target_token(s: &str) -> bool {
    s == "any" || is_os_token(s) || is_valid_platform_triple(s)
}

/// Whether a component target token admits the given platform triple.
pub fn target_matches(token: &str, triple: &str) -> bool {
    if token == "any" || token == triple {
        return true;
    }
    match triple.split_once('-') {
        Some((os, _)) => !token.contains('-') && token == os,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_id_display_and_as_ref() {
        let id = ComponentId::new("Core");
        assert_eq!(id.to_string(), "Core");
        assert_eq!(id.as_str(), "Core");
        assert_eq!(id.normalized(), "core");
        assert!(id.eq_ignore_case("CORE"));
    }

    #[test]
    fn splat_id_serde_roundtrip() {
        let id = SplatId::new("linux_deb");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"linux_deb\"");
        let back: SplatId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn platform_triple_grammar() {
        assert!(is_valid_platform_triple("linux-x86_64"));
        assert!(is_valid_platform_triple("win32_nt5-x86"));
        assert!(!is_valid_platform_triple("linux"));
        assert!(!is_valid_platform_triple("Linux-x86_64"));
        assert!(!is_valid_platform_triple("linux-"));
        assert!(!is_valid_platform_triple("linux-x86-64"));
        assert!(!is_valid_platform_triple("-x86"));
    }

    #[test]
    fn wire_enum_byte_roundtrip() {
        for op in Operation::ALL {
            assert_eq!(Operation::from_u8(op.as_u8()).unwrap(), *op);
        }
        assert!(matches!(
            InstallScope::from_u8(9),
            Err(ParseError::InvalidEnum {
                field: "install_scope",
                value: 9
            })
        ));
    }

    #[test]
    fn wire_enum_parses_text() {
        assert_eq!("System".parse::<InstallScope>().unwrap(), InstallScope::System);
        assert_eq!(
            "stage_artifact".parse::<StepKind>().unwrap(),
            StepKind::StageArtifact
        );
        assert!("sideways".parse::<Operation>().is_err());
        assert_eq!(
            serde_json::to_string(&StepKind::CommitSwap).unwrap(),
            "\"commit_swap\""
        );
    }

    #[test]
    fn flag_sets_use_names() {
        let flags = PolicyFlags::DETERMINISTIC | PolicyFlags::ENABLE_SHORTCUTS;
        assert_eq!(flags.names(), vec!["deterministic", "enable_shortcuts"]);
        assert_eq!(
            serde_json::to_string(&flags).unwrap(),
            r#"["deterministic","enable_shortcuts"]"#
        );
        assert_eq!(
            PolicyFlags::from_names(&["Enable_Shortcuts", "deterministic"]).unwrap(),
            flags
        );
        assert!(CapBits::from_names(&["teleport"]).is_err());
        assert!(CapBits::from_bits(0x3).contains(CapBits::RESUME));
        assert!(!CapBits::empty().intersects(CapBits::ROLLBACK));
    }

    #[test]
    fn target_tokens_match_by_os() {
        assert!(target_matches("linux_deb", "linux_deb-x86_64"));
        assert!(target_matches("linux_deb-x86_64", "linux_deb-x86_64"));
        assert!(target_matches("any", "win32_nt5-x86"));
        assert!(!target_matches("linux_deb", "win32_nt5-x86"));
        assert!(!target_matches("linux_deb-arm64", "linux_deb-x86_64"));
        assert!(is_valid_target_token("linux_deb"));
        assert!(!is_valid_target_token("Linux Deb"));
    }
}
