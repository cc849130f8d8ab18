//! Bounded engine names.
//!
//! The engine sizes hook, node and type names at 32 bytes and paths at 512
//! bytes, terminator included. Values are validated at construction time:
//! empty or overlong input is rejected, never truncated.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

use super::errors::{Error, Result};

/// Engine hook name buffer size, terminator included.
pub const HOOK_SIZE: usize = 32;
/// Engine node name buffer size, terminator included.
pub const NODE_SIZE: usize = 32;
/// Engine type name buffer size, terminator included.
pub const TYPE_SIZE: usize = 32;
/// Engine path buffer size, terminator included.
pub const PATH_SIZE: usize = 512;

/// Macro to define a length-bounded name newtype.
///
/// Generates: struct, `new()`, `as_str()`, Display, `TryFrom<String>`,
/// `TryFrom<&str>`, `Borrow<str>` and serde via `String`.
macro_rules! define_name {
    ($(#[$meta:meta])* $name:ident, $max:expr, $check:path) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Longest accepted value in bytes.
            pub const MAX_LEN: usize = $max;

            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                if value.is_empty() {
                    return Err(Error::validation(concat!(stringify!($name), " cannot be empty")));
                }
                if value.len() > Self::MAX_LEN {
                    return Err(Error::validation(format!(
                        "{} exceeds {} bytes: {:?}",
                        stringify!($name),
                        Self::MAX_LEN,
                        value
                    )));
                }
                if value.contains('\0') {
                    return Err(Error::validation(concat!(
                        stringify!($name),
                        " cannot contain NUL"
                    )));
                }
                $check(&value)?;
                Ok(Self(value))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> String {
                name.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

fn any(_: &str) -> Result<()> {
    Ok(())
}

/// Hooks and node names are path components, so they cannot carry path syntax.
fn path_component(value: &str) -> Result<()> {
    match value.chars().find(|c| matches!(c, '.' | ':' | '[' | ']')) {
        Some(c) => Err(Error::validation(format!(
            "{:?} cannot contain {:?}",
            value, c
        ))),
        None => Ok(()),
    }
}

define_name!(
    /// Named attachment point on an engine node.
    HookName,
    HOOK_SIZE - 1,
    path_component
);
define_name!(
    /// Global name of an engine node.
    NodeName,
    NODE_SIZE - 1,
    path_component
);
define_name!(
    /// Engine node type, e.g. `hub`.
    TypeName,
    TYPE_SIZE - 1,
    any
);
define_name!(
    /// Hierarchical address of a node: `.`, `name:`, `[id]:`, `hook.hook`.
    NodePath,
    PATH_SIZE - 1,
    any
);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_hook_name_accepts_boundary_length() {
        let name = "h".repeat(HookName::MAX_LEN);
        assert_eq!(HookName::new(name.clone()).unwrap().as_str(), name);
    }

    #[test]
    fn test_overlong_names_are_rejected_not_truncated() {
        let err = HookName::new("h".repeat(HookName::MAX_LEN + 1)).unwrap_err();
        assert!(err.to_string().contains("exceeds 31 bytes"));

        let err = NodePath::new("p".repeat(PATH_SIZE)).unwrap_err();
        assert!(err.to_string().contains("exceeds 511 bytes"));
    }

    #[test]
    fn test_empty_and_nul() {
        assert!(HookName::new("").is_err());
        assert!(NodeName::new("a\0b").is_err());
    }

    #[test]
    fn test_node_name_rejects_path_syntax() {
        assert!(NodeName::new("test hub").is_ok());
        assert!(NodeName::new("test:").is_err());
        assert!(NodeName::new("a.b").is_err());
        assert!(HookName::new("[1]").is_err());
        assert!(NodePath::new("test hub:a.b").is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let hook: HookName = serde_json::from_str("\"b\"").unwrap();
        assert_eq!(hook.as_str(), "b");
        assert!(serde_json::from_str::<HookName>("\"a.b\"").is_err());
        assert_eq!(serde_json::to_string(&hook).unwrap(), "\"b\"");
    }

    proptest! {
        #[test]
        fn prop_hook_length_bound(s in "[a-z0-9 _-]{0,64}") {
            let result = HookName::new(s.clone());
            prop_assert_eq!(result.is_ok(), !s.is_empty() && s.len() <= HookName::MAX_LEN);
        }
    }
}
