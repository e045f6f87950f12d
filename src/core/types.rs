//! core::types
//!
//! Strong types for item and type names.
//!
//! # Types
//!
//! - [`ItemName`] - Validated name of a node or property
//! - [`TypeName`] - Validated node-type name (`prefix:local` or plain local)
//!
//! # Validation
//!
//! These types enforce validity at construction time. Invalid values cannot
//! be represented, preventing entire classes of bugs downstream in the
//! overlay and the store.
//!
//! # Examples
//!
//! ```
//! use canopy::core::types::{ItemName, TypeName};
//!
//! let name = ItemName::new("body").unwrap();
//! assert_eq!(name.as_str(), "body");
//!
//! // A trailing [index] suffix is stripped, per the rename contract.
//! let stripped = ItemName::strip_index("foo[3]").unwrap();
//! assert_eq!(stripped.as_str(), "foo");
//!
//! let ty = TypeName::new("cms:article").unwrap();
//! assert_eq!(ty.prefix(), Some("cms"));
//! assert_eq!(ty.local_name(), "article");
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from name validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeNameError {
    #[error("invalid item name: {0}")]
    InvalidItemName(String),

    #[error("invalid type name: {0}")]
    InvalidTypeName(String),
}

/// A validated node or property name.
///
/// Item names:
/// - Cannot be empty
/// - Cannot contain `/`, `[` or `]` (indices live in paths, not names)
/// - Cannot start or end with whitespace
/// - Cannot contain more than one `:` (at most one namespace prefix)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ItemName(String);

impl ItemName {
    /// Create a new validated item name.
    ///
    /// # Errors
    ///
    /// Returns `TypeNameError::InvalidItemName` if the name is empty or
    /// contains `/`, brackets, stray whitespace, or multiple `:`.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    /// Create a name, stripping a trailing `[index]` suffix first.
    ///
    /// `rename("foo[3]")` must store the name `foo`; indices are an
    /// addressing concern, never part of the stored name.
    pub fn strip_index(name: &str) -> Result<Self, TypeNameError> {
        let stripped = match (name.rfind('['), name.ends_with(']')) {
            (Some(open), true) if name[open + 1..name.len() - 1].chars().all(|c| c.is_ascii_digit()) => {
                &name[..open]
            }
            _ => name,
        };
        Self::new(stripped)
    }

    fn validate(name: &str) -> Result<(), TypeNameError> {
        if name.is_empty() {
            return Err(TypeNameError::InvalidItemName(
                "item name cannot be empty".into(),
            ));
        }
        if name.starts_with(char::is_whitespace) || name.ends_with(char::is_whitespace) {
            return Err(TypeNameError::InvalidItemName(
                "item name cannot start or end with whitespace".into(),
            ));
        }
        for c in ['/', '[', ']'] {
            if name.contains(c) {
                return Err(TypeNameError::InvalidItemName(format!(
                    "item name cannot contain '{c}'"
                )));
            }
        }
        if name.matches(':').count() > 1 {
            return Err(TypeNameError::InvalidItemName(
                "item name cannot contain more than one ':'".into(),
            ));
        }
        Ok(())
    }

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace prefix, if the name carries one.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(p, _)| p)
    }

    /// The name with its prefix (if any) removed.
    pub fn local_name(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(_, l)| l)
    }

    /// Rebuild this name under a different namespace prefix.
    pub fn with_prefix(&self, prefix: &str) -> Result<Self, TypeNameError> {
        Self::new(format!("{prefix}:{}", self.local_name()))
    }
}

impl TryFrom<String> for ItemName {
    type Error = TypeNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemName> for String {
    fn from(value: ItemName) -> Self {
        value.0
    }
}

impl fmt::Display for ItemName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated node-type name.
///
/// Either `prefix:local` or a plain local name; both halves must be valid
/// item-name material.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TypeName(String);

impl TypeName {
    /// Create a new validated type name.
    ///
    /// # Errors
    ///
    /// Returns `TypeNameError::InvalidTypeName` for empty names, empty
    /// prefix/local halves, or names containing path characters.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeNameError> {
        let name = name.into();
        Self::validate(&name)?;
        Ok(Self(name))
    }

    fn validate(name: &str) -> Result<(), TypeNameError> {
        if name.is_empty() {
            return Err(TypeNameError::InvalidTypeName(
                "type name cannot be empty".into(),
            ));
        }
        if let Some((prefix, local)) = name.split_once(':') {
            if prefix.is_empty() || local.is_empty() {
                return Err(TypeNameError::InvalidTypeName(format!(
                    "type name has an empty half: {name}"
                )));
            }
            if local.contains(':') {
                return Err(TypeNameError::InvalidTypeName(format!(
                    "type name cannot contain more than one ':': {name}"
                )));
            }
        }
        for c in ['/', '[', ']', ' '] {
            if name.contains(c) {
                return Err(TypeNameError::InvalidTypeName(format!(
                    "type name cannot contain '{c}'"
                )));
            }
        }
        Ok(())
    }

    /// Get the type name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The namespace prefix, if the name carries one.
    pub fn prefix(&self) -> Option<&str> {
        self.0.split_once(':').map(|(p, _)| p)
    }

    /// The name with its prefix (if any) removed.
    pub fn local_name(&self) -> &str {
        self.0.split_once(':').map_or(&self.0, |(_, l)| l)
    }

    /// Rebuild this type name under a different namespace prefix.
    pub fn with_prefix(&self, prefix: &str) -> Result<Self, TypeNameError> {
        Self::new(format!("{prefix}:{}", self.local_name()))
    }
}

impl TryFrom<String> for TypeName {
    type Error = TypeNameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TypeName> for String {
    fn from(value: TypeName) -> Self {
        value.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
