//! store::memory
//!
//! In-memory [`ContentStore`] implementation.
//!
//! # Overview
//!
//! `MemoryStore` is the reference backend: a complete, deterministic
//! implementation of the store contract used by every test in this crate and
//! usable by embedders as a scratch target. It models the behaviors the
//! overlay must work around in real stores:
//!
//! - same-name-sibling index assignment and path resolution
//! - auto-created children and default properties at node creation
//! - checkout enforcement under the nearest versionable ancestor
//! - creation/move conflicts where same-name siblings are forbidden
//! - referential-integrity validation at save time
//!
//! # Fingerprinting
//!
//! [`MemoryStore::fingerprint`] hashes a canonical serialization of the whole
//! tree, used by the idempotence tests to assert "the second run changed
//! nothing".

use std::collections::{BTreeMap, HashMap};

use sha2::{Digest, Sha256};

use super::{
    ContentStore, DefName, NodeId, NodeTypeDef, PropertyValues, StoreError, Value,
};
use crate::core::path::{NodePath, PathSegment};
use crate::core::types::{ItemName, TypeName};

/// Primary type given to the root node.
const ROOT_TYPE: &str = "sys:root";

#[derive(Debug, Clone)]
struct StoredNode {
    name: ItemName,
    parent: Option<NodeId>,
    primary_type: TypeName,
    mixins: Vec<TypeName>,
    children: Vec<NodeId>,
    properties: BTreeMap<ItemName, PropertyValues>,
    versionable: bool,
    checked_out: bool,
}

/// In-memory content store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    nodes: HashMap<NodeId, StoredNode>,
    root: NodeId,
    namespaces: BTreeMap<String, String>,
    types: BTreeMap<TypeName, NodeTypeDef>,
    saves: u64,
}

impl MemoryStore {
    /// Create an empty store containing only the root node.
    pub fn new() -> Self {
        let root = NodeId::new();
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            StoredNode {
                name: ItemName::new("root").expect("static name"),
                parent: None,
                primary_type: TypeName::new(ROOT_TYPE).expect("static type"),
                mixins: Vec::new(),
                children: Vec::new(),
                properties: BTreeMap::new(),
                versionable: false,
                checked_out: true,
            },
        );
        Self {
            nodes,
            root,
            namespaces: BTreeMap::new(),
            types: BTreeMap::new(),
            saves: 0,
        }
    }

    /// Number of successful saves, for tests asserting commit cadence.
    pub fn save_count(&self) -> u64 {
        self.saves
    }

    /// Mark a node versionable. Fresh versionable nodes start checked out.
    pub fn make_versionable(&mut self, id: NodeId) -> Result<(), StoreError> {
        let node = self.node_mut(id)?;
        node.versionable = true;
        Ok(())
    }

    /// Check a versionable node in, making it immutable until `checkout`.
    pub fn check_in(&mut self, id: NodeId) -> Result<(), StoreError> {
        let node = self.node_mut(id)?;
        node.versionable = true;
        node.checked_out = false;
        Ok(())
    }

    /// Hash of the whole tree's canonical serialization.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_node(self.root, &mut hasher);
        hex::encode(hasher.finalize())
    }

    fn hash_node(&self, id: NodeId, hasher: &mut Sha256) {
        let node = &self.nodes[&id];
        let mut mixins: Vec<&str> = node.mixins.iter().map(|m| m.as_str()).collect();
        mixins.sort_unstable();
        let header = serde_json::json!({
            "name": node.name.as_str(),
            "type": node.primary_type.as_str(),
            "mixins": mixins,
            "properties": node
                .properties
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        });
        hasher.update(header.to_string().as_bytes());
        for child in &node.children {
            self.hash_node(*child, hasher);
        }
    }

    fn node(&self, id: NodeId) -> Result<&StoredNode, StoreError> {
        self.nodes.get(&id).ok_or(StoreError::NodeNotFound { id })
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut StoredNode, StoreError> {
        self.nodes.get_mut(&id).ok_or(StoreError::NodeNotFound { id })
    }

    /// Fail with `CheckedIn` when the nearest versionable ancestor-or-self
    /// of `id` is not checked out.
    fn ensure_mutable(&self, id: NodeId) -> Result<(), StoreError> {
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = self.node(node_id)?;
            if node.versionable {
                if node.checked_out {
                    return Ok(());
                }
                return Err(StoreError::CheckedIn {
                    path: self.path_of(node_id)?.to_string(),
                });
            }
            current = node.parent;
        }
        Ok(())
    }

    fn sibling_index(&self, id: NodeId) -> Result<u32, StoreError> {
        let node = self.node(id)?;
        let Some(parent) = node.parent else {
            return Ok(0);
        };
        let parent_node = self.node(parent)?;
        let same_named: Vec<NodeId> = parent_node
            .children
            .iter()
            .copied()
            .filter(|c| self.nodes.get(c).map(|n| &n.name) == Some(&node.name))
            .collect();
        if same_named.len() <= 1 {
            return Ok(0);
        }
        let position = same_named
            .iter()
            .position(|c| *c == id)
            .ok_or(StoreError::NodeNotFound { id })?;
        Ok(position as u32 + 1)
    }

    /// Conflict check for creating or moving `name` under `parent`.
    fn check_name_free(&self, parent: NodeId, name: &ItemName) -> Result<(), StoreError> {
        let parent_node = self.node(parent)?;
        let taken = parent_node
            .children
            .iter()
            .any(|c| self.nodes.get(c).map(|n| &n.name) == Some(name));
        if !taken {
            return Ok(());
        }
        let sns_allowed = self
            .effective_child_def(parent, name)?
            .map(|d| d.same_name_siblings)
            .unwrap_or(false);
        if sns_allowed {
            Ok(())
        } else {
            Err(StoreError::ItemExists {
                path: self
                    .path_of(parent)?
                    .child(PathSegment::new(name.as_str()))
                    .to_string(),
            })
        }
    }

    fn effective_child_def(
        &self,
        parent: NodeId,
        name: &ItemName,
    ) -> Result<Option<super::ChildDef>, StoreError> {
        let parent_node = self.node(parent)?;
        let mut type_names = vec![parent_node.primary_type.clone()];
        type_names.extend(parent_node.mixins.iter().cloned());
        for ty in type_names {
            let def = self
                .types
                .get(&ty)
                .cloned()
                .unwrap_or_else(|| NodeTypeDef::unstructured(ty));
            if let Some(child_def) = def.child_def(name) {
                return Ok(Some(child_def.clone()));
            }
        }
        Ok(None)
    }

    /// Apply auto-created children and default properties declared by `ty`.
    fn apply_auto_created(&mut self, id: NodeId, ty: &TypeName) -> Result<(), StoreError> {
        let Some(def) = self.types.get(ty).cloned() else {
            return Ok(());
        };
        for prop in &def.properties {
            if let (DefName::Named(name), Some(values)) = (&prop.name, &prop.auto_created) {
                self.node_mut(id)?
                    .properties
                    .insert(name.clone(), values.clone());
            }
        }
        for child in &def.children {
            if let (DefName::Named(name), true) = (&child.name, child.auto_created) {
                let child_type = child
                    .default_type
                    .clone()
                    .ok_or_else(|| StoreError::Internal {
                        message: format!(
                            "auto-created child '{name}' of {ty} has no default type"
                        ),
                    })?;
                self.add_node(id, name, &child_type)?;
            }
        }
        Ok(())
    }

    fn resolve_child(
        &self,
        parent: NodeId,
        segment: &PathSegment,
    ) -> Result<Option<NodeId>, StoreError> {
        let parent_node = self.node(parent)?;
        let wanted = segment.index.max(1) as usize;
        let mut seen = 0usize;
        for child in &parent_node.children {
            if self.node(*child)?.name.as_str() == segment.name {
                seen += 1;
                if seen == wanted {
                    return Ok(Some(*child));
                }
            }
        }
        Ok(None)
    }

    fn collect_by_type(
        &self,
        id: NodeId,
        ty: &TypeName,
        out: &mut Vec<NodePath>,
    ) -> Result<(), StoreError> {
        let node = self.node(id)?;
        if &node.primary_type == ty || node.mixins.contains(ty) {
            out.push(self.path_of(id)?);
        }
        for child in node.children.clone() {
            self.collect_by_type(child, ty, out)?;
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContentStore for MemoryStore {
    fn root(&self) -> NodeId {
        self.root
    }

    fn node_at(&self, path: &NodePath) -> Result<Option<NodeId>, StoreError> {
        let mut current = self.root;
        for segment in path.segments() {
            match self.resolve_child(current, segment)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    fn exists(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn path_of(&self, id: NodeId) -> Result<NodePath, StoreError> {
        let node = self.node(id)?;
        match node.parent {
            None => Ok(NodePath::root()),
            Some(parent) => {
                let parent_path = self.path_of(parent)?;
                let index = self.sibling_index(id)?;
                Ok(parent_path.child(PathSegment::indexed(node.name.as_str(), index)))
            }
        }
    }

    fn name_of(&self, id: NodeId) -> Result<ItemName, StoreError> {
        Ok(self.node(id)?.name.clone())
    }

    fn index_of(&self, id: NodeId) -> Result<u32, StoreError> {
        self.sibling_index(id)
    }

    fn parent_of(&self, id: NodeId) -> Result<Option<NodeId>, StoreError> {
        Ok(self.node(id)?.parent)
    }

    fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        Ok(self.node(id)?.children.clone())
    }

    fn primary_type(&self, id: NodeId) -> Result<TypeName, StoreError> {
        Ok(self.node(id)?.primary_type.clone())
    }

    fn mixins(&self, id: NodeId) -> Result<Vec<TypeName>, StoreError> {
        Ok(self.node(id)?.mixins.clone())
    }

    fn properties(&self, id: NodeId) -> Result<Vec<(ItemName, PropertyValues)>, StoreError> {
        Ok(self
            .node(id)?
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn property(&self, id: NodeId, name: &ItemName) -> Result<Option<PropertyValues>, StoreError> {
        Ok(self.node(id)?.properties.get(name).cloned())
    }

    fn add_node(
        &mut self,
        parent: NodeId,
        name: &ItemName,
        primary_type: &TypeName,
    ) -> Result<NodeId, StoreError> {
        self.ensure_mutable(parent)?;
        self.check_name_free(parent, name)?;
        let id = NodeId::new();
        self.nodes.insert(
            id,
            StoredNode {
                name: name.clone(),
                parent: Some(parent),
                primary_type: primary_type.clone(),
                mixins: Vec::new(),
                children: Vec::new(),
                properties: BTreeMap::new(),
                versionable: false,
                checked_out: true,
            },
        );
        self.node_mut(parent)?.children.push(id);
        self.apply_auto_created(id, &primary_type.clone())?;
        Ok(id)
    }

    fn remove_node(&mut self, id: NodeId) -> Result<(), StoreError> {
        let node = self.node(id)?;
        let Some(parent) = node.parent else {
            return Err(StoreError::Internal {
                message: "cannot remove the root node".into(),
            });
        };
        self.ensure_mutable(parent)?;
        // Collect the subtree before mutating.
        let mut stack = vec![id];
        let mut doomed = Vec::new();
        while let Some(next) = stack.pop() {
            doomed.push(next);
            stack.extend(self.node(next)?.children.iter().copied());
        }
        self.node_mut(parent)?.children.retain(|c| *c != id);
        for dead in doomed {
            self.nodes.remove(&dead);
        }
        Ok(())
    }

    fn move_node(
        &mut self,
        id: NodeId,
        new_parent: NodeId,
        new_name: &ItemName,
    ) -> Result<(), StoreError> {
        let old_parent = self
            .node(id)?
            .parent
            .ok_or_else(|| StoreError::Internal {
                message: "cannot move the root node".into(),
            })?;
        // Reject moving a node under its own subtree.
        let mut cursor = Some(new_parent);
        while let Some(ancestor) = cursor {
            if ancestor == id {
                return Err(StoreError::Internal {
                    message: "cannot move a node under itself".into(),
                });
            }
            cursor = self.node(ancestor)?.parent;
        }
        self.ensure_mutable(old_parent)?;
        self.ensure_mutable(new_parent)?;
        let pure_rename = old_parent == new_parent && &self.node(id)?.name == new_name;
        if !pure_rename {
            // Ignore the node itself when checking the destination name.
            let occupied = {
                let parent_node = self.node(new_parent)?;
                parent_node.children.iter().any(|c| {
                    *c != id && self.nodes.get(c).map(|n| &n.name) == Some(new_name)
                })
            };
            if occupied {
                let sns_allowed = self
                    .effective_child_def(new_parent, new_name)?
                    .map(|d| d.same_name_siblings)
                    .unwrap_or(false);
                if !sns_allowed {
                    return Err(StoreError::ItemExists {
                        path: self
                            .path_of(new_parent)?
                            .child(PathSegment::new(new_name.as_str()))
                            .to_string(),
                    });
                }
            }
        }
        self.node_mut(old_parent)?.children.retain(|c| *c != id);
        self.node_mut(new_parent)?.children.push(id);
        let node = self.node_mut(id)?;
        node.parent = Some(new_parent);
        node.name = new_name.clone();
        Ok(())
    }

    fn set_primary_type(&mut self, id: NodeId, primary_type: &TypeName) -> Result<(), StoreError> {
        self.ensure_mutable(id)?;
        self.node_mut(id)?.primary_type = primary_type.clone();
        Ok(())
    }

    fn set_property(
        &mut self,
        id: NodeId,
        name: &ItemName,
        values: Option<PropertyValues>,
    ) -> Result<(), StoreError> {
        self.ensure_mutable(id)?;
        let node = self.node_mut(id)?;
        match values {
            Some(values) => {
                node.properties.insert(name.clone(), values);
            }
            None => {
                node.properties.remove(name);
            }
        }
        Ok(())
    }

    fn add_mixin(&mut self, id: NodeId, mixin: &TypeName) -> Result<(), StoreError> {
        self.ensure_mutable(id)?;
        let node = self.node_mut(id)?;
        if !node.mixins.contains(mixin) {
            node.mixins.push(mixin.clone());
        }
        Ok(())
    }

    fn remove_mixin(&mut self, id: NodeId, mixin: &TypeName) -> Result<(), StoreError> {
        self.ensure_mutable(id)?;
        self.node_mut(id)?.mixins.retain(|m| m != mixin);
        Ok(())
    }

    fn order_before(
        &mut self,
        parent: NodeId,
        src: &PathSegment,
        dest: Option<&PathSegment>,
    ) -> Result<(), StoreError> {
        self.ensure_mutable(parent)?;
        let src_id = self
            .resolve_child(parent, src)?
            .ok_or_else(|| StoreError::Internal {
                message: format!("order_before: source child not found: {src}"),
            })?;
        let dest_id = match dest {
            None => None,
            Some(segment) => Some(self.resolve_child(parent, segment)?.ok_or_else(|| {
                StoreError::Internal {
                    message: format!("order_before: destination child not found: {segment}"),
                }
            })?),
        };
        let children = &mut self.node_mut(parent)?.children;
        children.retain(|c| *c != src_id);
        match dest_id {
            None => children.push(src_id),
            Some(dest_id) => {
                let position = children
                    .iter()
                    .position(|c| *c == dest_id)
                    .unwrap_or(children.len());
                children.insert(position, src_id);
            }
        }
        Ok(())
    }

    fn is_versionable(&self, id: NodeId) -> Result<bool, StoreError> {
        Ok(self.node(id)?.versionable)
    }

    fn is_checked_out(&self, id: NodeId) -> Result<bool, StoreError> {
        let node = self.node(id)?;
        Ok(!node.versionable || node.checked_out)
    }

    fn checkout(&mut self, id: NodeId) -> Result<(), StoreError> {
        self.node_mut(id)?.checked_out = true;
        Ok(())
    }

    fn namespace_uri(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        Ok(self.namespaces.get(prefix).cloned())
    }

    fn prefix_for_uri(&self, uri: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .namespaces
            .iter()
            .find(|(_, u)| u.as_str() == uri)
            .map(|(p, _)| p.clone()))
    }

    fn register_namespace(&mut self, prefix: &str, uri: &str) -> Result<(), StoreError> {
        if let Some(existing) = self.namespaces.get(prefix) {
            if existing != uri {
                return Err(StoreError::NamespaceConflict {
                    prefix: prefix.to_string(),
                    existing: existing.clone(),
                    requested: uri.to_string(),
                });
            }
            return Ok(());
        }
        self.namespaces.insert(prefix.to_string(), uri.to_string());
        Ok(())
    }

    fn namespaces(&self) -> Result<Vec<(String, String)>, StoreError> {
        Ok(self
            .namespaces
            .iter()
            .map(|(p, u)| (p.clone(), u.clone()))
            .collect())
    }

    fn node_type(&self, name: &TypeName) -> Result<Option<NodeTypeDef>, StoreError> {
        Ok(self.types.get(name).cloned())
    }

    fn register_node_type(&mut self, def: NodeTypeDef) -> Result<(), StoreError> {
        self.types.insert(def.name.clone(), def);
        Ok(())
    }

    fn node_types_for_prefix(&self, prefix: &str) -> Result<Vec<NodeTypeDef>, StoreError> {
        Ok(self
            .types
            .values()
            .filter(|d| d.name.prefix() == Some(prefix))
            .cloned()
            .collect())
    }

    fn query_by_type(&self, ty: &TypeName) -> Result<Vec<NodePath>, StoreError> {
        let mut out = Vec::new();
        self.collect_by_type(self.root, ty, &mut out)?;
        Ok(out)
    }

    fn referrers(&self, id: NodeId) -> Result<Vec<(NodePath, ItemName)>, StoreError> {
        let mut out = Vec::new();
        for (node_id, node) in &self.nodes {
            for (name, values) in &node.properties {
                if values.values.iter().any(|v| matches!(v, Value::Reference(r) if *r == id)) {
                    out.push((self.path_of(*node_id)?, name.clone()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn save(&mut self) -> Result<(), StoreError> {
        for node in self.nodes.values() {
            for values in node.properties.values() {
                for value in &values.values {
                    if let Value::Reference(target) = value {
                        if !self.nodes.contains_key(target) {
                            return Err(StoreError::ReferentialIntegrity { target: *target });
                        }
                    }
                }
            }
        }
        self.saves += 1;
        Ok(())
    }
}
