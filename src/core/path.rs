//! core::path
//!
//! Hierarchical node addresses.
//!
//! # Overview
//!
//! A [`NodePath`] is a sequence of `(name, index)` segments addressing a node
//! in the content tree. Every other layer uses it for sorting, grouping, and
//! re-resolving nodes between commit batches.
//!
//! # Ordering
//!
//! Paths are totally ordered: lexicographic over `(name, index)` pairs, with a
//! shorter path comparing less than any of its extensions. Index `0` means
//! "no explicit index" and compares as its own value; it is not folded into
//! index `1` for comparison purposes (resolution treats it as the first
//! same-name sibling, see [`crate::store`]).
//!
//! # Example
//!
//! ```
//! use canopy::core::path::NodePath;
//!
//! let path = NodePath::parse("/content/articles/intro/intro[2]").unwrap();
//! assert_eq!(path.depth(), 4);
//! assert_eq!(
//!     path.document_variant_path().unwrap(),
//!     NodePath::parse("/content/articles/intro").unwrap()
//! );
//! ```

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from path parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    /// Path did not start with `/`.
    #[error("path must be absolute (start with '/'): {0}")]
    NotAbsolute(String),

    /// A segment was empty (`//` or trailing `/`).
    #[error("path contains an empty segment: {0}")]
    EmptySegment(String),

    /// A segment carried a malformed `[index]` suffix.
    #[error("invalid index in path segment: {0}")]
    InvalidIndex(String),
}

/// One step of a [`NodePath`]: a name plus an optional same-name-sibling index.
///
/// Index `0` means the segment carries no explicit index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathSegment {
    /// Segment name, never empty.
    pub name: String,
    /// Same-name-sibling index; `0` when not explicit.
    pub index: u32,
}

impl PathSegment {
    /// Create a segment with no explicit index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            index: 0,
        }
    }

    /// Create a segment with an explicit index.
    pub fn indexed(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }

    /// Parse `name` or `name[index]`.
    fn parse(text: &str, full: &str) -> Result<Self, PathError> {
        if text.is_empty() {
            return Err(PathError::EmptySegment(full.to_string()));
        }
        if let Some(open) = text.find('[') {
            if !text.ends_with(']') {
                return Err(PathError::InvalidIndex(full.to_string()));
            }
            let name = &text[..open];
            if name.is_empty() {
                return Err(PathError::EmptySegment(full.to_string()));
            }
            let digits = &text[open + 1..text.len() - 1];
            let index: u32 = digits
                .parse()
                .map_err(|_| PathError::InvalidIndex(full.to_string()))?;
            if index == 0 {
                return Err(PathError::InvalidIndex(full.to_string()));
            }
            Ok(Self::indexed(name, index))
        } else {
            Ok(Self::new(text))
        }
    }
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.index == 0 {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}[{}]", self.name, self.index)
        }
    }
}

/// An absolute address in the content tree.
///
/// The root path has zero segments and renders as `/`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath {
    segments: Vec<PathSegment>,
}

impl NodePath {
    /// The root path (no segments).
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Build a path from explicit segments.
    pub fn from_segments(segments: Vec<PathSegment>) -> Self {
        Self { segments }
    }

    /// Parse an absolute path string like `/a/b[2]/c`.
    ///
    /// # Errors
    ///
    /// Returns `PathError` if the string is not absolute, contains an empty
    /// segment, or carries a malformed index suffix.
    pub fn parse(text: &str) -> Result<Self, PathError> {
        let rest = text
            .strip_prefix('/')
            .ok_or_else(|| PathError::NotAbsolute(text.to_string()))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        let segments = rest
            .split('/')
            .map(|s| PathSegment::parse(s, text))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { segments })
    }

    /// Number of segments; the root has depth 0.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// True for the root path.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The segments of this path, root-first.
    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// The last segment, if any.
    pub fn last_segment(&self) -> Option<&PathSegment> {
        self.segments.last()
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<NodePath> {
        if self.segments.is_empty() {
            None
        } else {
            Some(Self {
                segments: self.segments[..self.segments.len() - 1].to_vec(),
            })
        }
    }

    /// Extend this path with one more segment.
    pub fn child(&self, segment: PathSegment) -> NodePath {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self { segments }
    }

    /// Iterate over every proper prefix of this path, shortest first.
    ///
    /// The root is included; the path itself is not. Each call returns a
    /// fresh iterator.
    pub fn ancestors(&self) -> impl Iterator<Item = NodePath> + '_ {
        (0..self.segments.len()).map(move |len| Self {
            segments: self.segments[..len].to_vec(),
        })
    }

    /// The shortest prefix at which a name repeats at two consecutive depths.
    ///
    /// Document variants are stored as same-named children of a handle node
    /// (`.../article/article`, `.../article/article[2]`); the returned prefix
    /// ends at the handle, so every variant of one document is a
    /// descendant-or-self of it. Returns `None` when no consecutive name
    /// repeat exists.
    pub fn document_variant_path(&self) -> Option<NodePath> {
        for i in 0..self.segments.len().saturating_sub(1) {
            if self.segments[i].name == self.segments[i + 1].name {
                return Some(Self {
                    segments: self.segments[..=i].to_vec(),
                });
            }
        }
        None
    }

    /// True when `other` is a (possibly equal) prefix of this path.
    pub fn is_descendant_or_self(&self, other: &NodePath) -> bool {
        if other.segments.len() > self.segments.len() {
            return false;
        }
        self.segments[..other.segments.len()] == other.segments[..]
    }
}

impl Ord for NodePath {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.segments.iter().zip(other.segments.iter()) {
            match a.name.cmp(&b.name).then(a.index.cmp(&b.index)) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        // All compared segments equal: shorter is smaller.
        self.segments.len().cmp(&other.segments.len())
    }
}

impl PartialOrd for NodePath {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.segments {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}
