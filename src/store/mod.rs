//! store
//!
//! Single interface for all backing content-store operations.
//!
//! This module provides the **single doorway** to the backing content store.
//! All reads and mutations of real content flow through the [`ContentStore`]
//! trait, which provides structured results and normalizes failures into
//! typed categories. No other module talks to a storage backend directly.
//!
//! # Architecture
//!
//! The engine and the overlay consume the store as `&mut dyn ContentStore`.
//! The trait covers node/property CRUD, identity-stable moves, versioning
//! checkout, the namespace and node-type registries, query-by-type, and the
//! session save that forms the durability boundary.
//!
//! # Error Handling
//!
//! Store errors are categorized into typed variants:
//! - [`StoreError::NodeNotFound`]: a node id no longer resolves
//! - [`StoreError::ItemExists`]: creation/move collided with an existing item
//! - [`StoreError::CheckedIn`]: mutation attempted under a checked-in
//!   versionable node
//! - [`StoreError::NamespaceConflict`]: prefix already maps to another URI
//! - [`StoreError::ReferentialIntegrity`]: save found a dangling reference
//!
//! # Example
//!
//! ```
//! use canopy::core::types::{ItemName, TypeName};
//! use canopy::store::{ContentStore, MemoryStore, PropertyValues, Value};
//!
//! let mut store = MemoryStore::new();
//! let root = store.root();
//! let content = store
//!     .add_node(root, &ItemName::new("content").unwrap(), &TypeName::new("unstructured").unwrap())
//!     .unwrap();
//! store
//!     .set_property(
//!         content,
//!         &ItemName::new("title").unwrap(),
//!         Some(PropertyValues::string("hello")),
//!     )
//!     .unwrap();
//! store.save().unwrap();
//! ```

mod memory;

pub use memory::MemoryStore;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::core::path::{NodePath, PathSegment};
use crate::core::types::{ItemName, TypeName};

/// Stable identity of a backing node.
///
/// Identities survive moves and renames; they are only retired by removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(Uuid);

impl NodeId {
    /// Mint a fresh node identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    String(String),
    Long(i64),
    Boolean(bool),
    /// Identity reference to another node; validated at save time.
    Reference(NodeId),
}

impl Value {
    /// The string payload, when this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// The stored shape of one property: a multi-valued flag plus a value list.
///
/// Single-valued properties carry exactly one value with `multiple = false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValues {
    pub multiple: bool,
    pub values: Vec<Value>,
}

impl PropertyValues {
    /// A single-valued property.
    pub fn single(value: Value) -> Self {
        Self {
            multiple: false,
            values: vec![value],
        }
    }

    /// A single-valued string property.
    pub fn string(value: impl Into<String>) -> Self {
        Self::single(Value::String(value.into()))
    }

    /// A multi-valued property.
    pub fn multi(values: Vec<Value>) -> Self {
        Self {
            multiple: true,
            values,
        }
    }

    /// A multi-valued string property.
    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::multi(values.into_iter().map(|s| Value::String(s.into())).collect())
    }
}

/// Name slot of a property or child definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefName {
    /// A definition for exactly this name.
    Named(ItemName),
    /// A residual definition matching any name (`*`).
    Residual,
}

impl DefName {
    /// Does this definition slot cover `name`?
    pub fn matches(&self, name: &ItemName) -> bool {
        match self {
            DefName::Named(n) => n == name,
            DefName::Residual => true,
        }
    }
}

/// Declared shape of one property on a node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDef {
    pub name: DefName,
    pub multiple: bool,
    /// Protected properties are store-managed and never written or removed
    /// by the migration core.
    pub protected: bool,
    pub mandatory: bool,
    /// Default values applied automatically at node creation.
    pub auto_created: Option<PropertyValues>,
}

impl PropertyDef {
    /// A plain named, single-valued, unprotected property definition.
    pub fn named(name: ItemName) -> Self {
        Self {
            name: DefName::Named(name),
            multiple: false,
            protected: false,
            mandatory: false,
            auto_created: None,
        }
    }

    /// A residual definition accepting any property name.
    pub fn residual() -> Self {
        Self {
            name: DefName::Residual,
            multiple: false,
            protected: false,
            mandatory: false,
            auto_created: None,
        }
    }
}

/// Declared shape of one child slot on a node type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildDef {
    pub name: DefName,
    /// Type given to auto-created children, and required of assigned ones.
    pub default_type: Option<TypeName>,
    pub mandatory: bool,
    pub protected: bool,
    /// Created by the store itself when the parent node is created.
    pub auto_created: bool,
    /// Whether several children may share this name.
    pub same_name_siblings: bool,
}

impl ChildDef {
    /// A plain named child slot.
    pub fn named(name: ItemName) -> Self {
        Self {
            name: DefName::Named(name),
            default_type: None,
            mandatory: false,
            protected: false,
            auto_created: false,
            same_name_siblings: false,
        }
    }

    /// A residual child slot allowing same-name siblings.
    pub fn residual() -> Self {
        Self {
            name: DefName::Residual,
            default_type: None,
            mandatory: false,
            protected: false,
            auto_created: false,
            same_name_siblings: true,
        }
    }
}

/// A registered node type: primary or mixin, with its declared items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTypeDef {
    pub name: TypeName,
    pub mixin: bool,
    /// Whether child order is significant and client-orderable.
    pub orderable: bool,
    pub properties: Vec<PropertyDef>,
    pub children: Vec<ChildDef>,
}

impl NodeTypeDef {
    /// A fully permissive type: residual properties and children, orderable.
    ///
    /// Types absent from the registry behave like this; see
    /// [`EffectiveType::resolve`].
    pub fn unstructured(name: TypeName) -> Self {
        Self {
            name,
            mixin: false,
            orderable: true,
            properties: vec![PropertyDef::residual()],
            children: vec![ChildDef::residual()],
        }
    }

    /// Look up the definition covering a property name (named beats residual).
    pub fn property_def(&self, name: &ItemName) -> Option<&PropertyDef> {
        self.properties
            .iter()
            .find(|d| matches!(&d.name, DefName::Named(n) if n == name))
            .or_else(|| {
                self.properties
                    .iter()
                    .find(|d| matches!(d.name, DefName::Residual))
            })
    }

    /// Look up the definition covering a child name (named beats residual).
    pub fn child_def(&self, name: &ItemName) -> Option<&ChildDef> {
        self.children
            .iter()
            .find(|d| matches!(&d.name, DefName::Named(n) if n == name))
            .or_else(|| {
                self.children
                    .iter()
                    .find(|d| matches!(d.name, DefName::Residual))
            })
    }
}

/// Errors from content-store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A node id no longer resolves.
    #[error("node not found: {id}")]
    NodeNotFound {
        /// The identity that failed to resolve
        id: NodeId,
    },

    /// Creation or move collided with an existing item that does not allow
    /// same-name siblings.
    #[error("item already exists: {path}")]
    ItemExists {
        /// Path of the conflicting item
        path: String,
    },

    /// A referenced node type is not registered.
    #[error("node type not found: {name}")]
    TypeNotFound {
        /// The missing type name
        name: String,
    },

    /// Mutation attempted on or under a checked-in versionable node.
    #[error("node is checked in: {path}")]
    CheckedIn {
        /// Path of the checked-in ancestor
        path: String,
    },

    /// Namespace prefix already maps to a different URI.
    #[error("namespace prefix '{prefix}' already maps to {existing}, refusing {requested}")]
    NamespaceConflict {
        prefix: String,
        existing: String,
        requested: String,
    },

    /// Save found a reference to a node that no longer exists.
    #[error("referential integrity violation: dangling reference to {target}")]
    ReferentialIntegrity {
        /// The dangling target identity
        target: NodeId,
    },

    /// Internal backend error.
    #[error("store error: {message}")]
    Internal {
        /// The error message
        message: String,
    },
}

/// The backing content store.
///
/// Object-safe so that visitors and the overlay can hold `&mut dyn
/// ContentStore` without generic plumbing. One migration cycle owns one
/// exclusive session; the engine is single-threaded and synchronous.
pub trait ContentStore {
    // -- reads ---------------------------------------------------------------

    /// Identity of the root node.
    fn root(&self) -> NodeId;

    /// Resolve a path to a node identity, or `None` when nothing is there.
    ///
    /// A segment index of `0` resolves like `1` (first same-name sibling).
    fn node_at(&self, path: &NodePath) -> Result<Option<NodeId>, StoreError>;

    /// Whether the identity still resolves.
    fn exists(&self, id: NodeId) -> bool;

    /// Current absolute path of a node.
    fn path_of(&self, id: NodeId) -> Result<NodePath, StoreError>;

    /// Current name of a node.
    fn name_of(&self, id: NodeId) -> Result<ItemName, StoreError>;

    /// Same-name-sibling index: `0` when the name is unique among siblings,
    /// else the 1-based position.
    fn index_of(&self, id: NodeId) -> Result<u32, StoreError>;

    /// Parent identity, or `None` for the root.
    fn parent_of(&self, id: NodeId) -> Result<Option<NodeId>, StoreError>;

    /// Ordered child identities.
    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError>;

    /// Declared primary type.
    fn primary_type(&self, id: NodeId) -> Result<TypeName, StoreError>;

    /// Assigned mixin types.
    fn mixins(&self, id: NodeId) -> Result<Vec<TypeName>, StoreError>;

    /// All properties of a node, name-sorted.
    fn properties(&self, id: NodeId) -> Result<Vec<(ItemName, PropertyValues)>, StoreError>;

    /// One property of a node, or `None`.
    fn property(&self, id: NodeId, name: &ItemName) -> Result<Option<PropertyValues>, StoreError>;

    // -- writes --------------------------------------------------------------

    /// Create a child node. Applies the type's auto-created children and
    /// default properties; assigns same-name-sibling indices.
    ///
    /// # Errors
    ///
    /// `ItemExists` when the parent's child definition forbids same-name
    /// siblings and the name is taken; `CheckedIn` under a checked-in
    /// versionable ancestor.
    fn add_node(
        &mut self,
        parent: NodeId,
        name: &ItemName,
        primary_type: &TypeName,
    ) -> Result<NodeId, StoreError>;

    /// Remove a node and its subtree.
    fn remove_node(&mut self, id: NodeId) -> Result<(), StoreError>;

    /// Move (or rename) a node, keeping its identity.
    ///
    /// # Errors
    ///
    /// `ItemExists` when the destination name is taken and same-name
    /// siblings are not allowed there.
    fn move_node(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &ItemName,
    ) -> Result<(), StoreError>;

    /// Set a primary type in place.
    ///
    /// Backends derived from versioned stores generally cannot do this; the
    /// overlay instead recreates the node (see [`crate::overlay`]). Provided
    /// for backends that can.
    fn set_primary_type(&mut self, id: NodeId, primary_type: &TypeName) -> Result<(), StoreError>;

    /// Create, replace, or (with `None`) remove a property.
    fn set_property(
        &mut self,
        id: NodeId,
        name: &ItemName,
        values: Option<PropertyValues>,
    ) -> Result<(), StoreError>;

    /// Add a mixin type to a node. Adding an already-present mixin is a no-op.
    fn add_mixin(&mut self, id: NodeId, mixin: &TypeName) -> Result<(), StoreError>;

    /// Remove a mixin type from a node.
    fn remove_mixin(&mut self, id: NodeId, mixin: &TypeName) -> Result<(), StoreError>;

    /// Move child `src` immediately before `dest`; `None` means "to last".
    fn order_before(
        &mut self,
        parent: NodeId,
        src: &PathSegment,
        dest: Option<&PathSegment>,
    ) -> Result<(), StoreError>;

    // -- versioning ----------------------------------------------------------

    /// Whether the node is versionable (subject to checkout rules).
    fn is_versionable(&self, id: NodeId) -> Result<bool, StoreError>;

    /// Whether a versionable node is currently checked out.
    fn is_checked_out(&self, id: NodeId) -> Result<bool, StoreError>;

    /// Acquire the mutable state of a versionable node. Idempotent; a no-op
    /// on non-versionable nodes. Never explicitly released by this core.
    fn checkout(&mut self, id: NodeId) -> Result<(), StoreError>;

    // -- namespace registry --------------------------------------------------

    /// URI registered for a prefix, or `None`.
    fn namespace_uri(&self, prefix: &str) -> Result<Option<String>, StoreError>;

    /// Prefix registered for a URI, or `None`.
    fn prefix_for_uri(&self, uri: &str) -> Result<Option<String>, StoreError>;

    /// Register a prefix/URI pair.
    ///
    /// # Errors
    ///
    /// `NamespaceConflict` when the prefix already maps to a different URI.
    fn register_namespace(&mut self, prefix: &str, uri: &str) -> Result<(), StoreError>;

    /// All registered (prefix, URI) pairs.
    fn namespaces(&self) -> Result<Vec<(String, String)>, StoreError>;

    // -- node-type registry --------------------------------------------------

    /// Look up a registered node type.
    fn node_type(&self, name: &TypeName) -> Result<Option<NodeTypeDef>, StoreError>;

    /// Register a node type, replacing any previous definition of the name.
    fn register_node_type(&mut self, def: NodeTypeDef) -> Result<(), StoreError>;

    /// All registered types whose name carries the given prefix.
    fn node_types_for_prefix(&self, prefix: &str) -> Result<Vec<NodeTypeDef>, StoreError>;

    // -- query ---------------------------------------------------------------

    /// Paths of all nodes whose primary type or mixins include `ty`,
    /// in forward path order.
    fn query_by_type(&self, ty: &TypeName) -> Result<Vec<NodePath>, StoreError>;

    // -- references ----------------------------------------------------------

    /// Every `(path, property)` still holding a reference to `id`.
    /// Best-effort diagnostic surface for integrity failures.
    fn referrers(&self, id: NodeId) -> Result<Vec<(NodePath, ItemName)>, StoreError>;

    // -- session -------------------------------------------------------------

    /// Flush the session. The durability and consistency boundary.
    ///
    /// # Errors
    ///
    /// `ReferentialIntegrity` when a reference property points at a removed
    /// node.
    fn save(&mut self) -> Result<(), StoreError>;
}

/// The effective node-type set of one node: primary type plus mixins.
///
/// Used by the overlay commit to skip properties the node's types do not
/// declare and to honor protected and mandatory flags. Types absent from the
/// registry resolve as [`NodeTypeDef::unstructured`], so stores with a
/// partially populated registry stay migratable.
#[derive(Debug, Clone)]
pub struct EffectiveType {
    types: Vec<NodeTypeDef>,
}

impl EffectiveType {
    /// Resolve the effective type set for `primary` plus `mixins`.
    pub fn resolve(
        store: &dyn ContentStore,
        primary: &TypeName,
        mixins: &[TypeName],
    ) -> Result<Self, StoreError> {
        let mut types = Vec::with_capacity(1 + mixins.len());
        for name in std::iter::once(primary).chain(mixins.iter()) {
            let def = store
                .node_type(name)?
                .unwrap_or_else(|| NodeTypeDef::unstructured(name.clone()));
            types.push(def);
        }
        Ok(Self { types })
    }

    /// Whether any member type declares (or residually accepts) the property.
    pub fn allows_property(&self, name: &ItemName) -> bool {
        self.types.iter().any(|t| t.property_def(name).is_some())
    }

    /// Whether the property is protected under every covering definition.
    pub fn property_protected(&self, name: &ItemName) -> bool {
        let mut covered = false;
        for ty in &self.types {
            if let Some(def) = ty.property_def(name) {
                covered = true;
                if !def.protected {
                    return false;
                }
            }
        }
        covered
    }

    /// The child definition covering `name`, if any member type has one.
    pub fn child_def(&self, name: &ItemName) -> Option<&ChildDef> {
        self.types.iter().find_map(|t| t.child_def(name))
    }

    /// Whether any member type supports explicit child ordering.
    pub fn orderable(&self) -> bool {
        self.types.iter().any(|t| t.orderable)
    }
}
