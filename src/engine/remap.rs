//! Namespace remapping.
//!
//! A [`NamespaceRemap`] carries one namespace upgrade: the prefix under
//! migration, the old and new URIs, and the prefix the migrated names will
//! carry afterward. During preprocessing it registers the new prefix and
//! re-registers the type definitions it declares; during the walk or batch
//! sweeps it rewrites primary types, mixins, node names, and child/property
//! names found under the old prefix.
//!
//! Remaps chain: when a namespace has been upgraded before, the new remap
//! links to the previous one and delegates after its own rewriting, so
//! stacked upgrades on one namespace lineage apply within a single pass.

use std::collections::BTreeSet;

use tracing::debug;

use crate::core::{ItemName, NodePath, TypeName};
use crate::overlay::ItemHandle;
use crate::store::{ContentStore, DefName, NodeTypeDef};

use super::visitor::VisitContext;
use super::EngineError;

/// One namespace upgrade, optionally chained to an earlier one.
pub struct NamespaceRemap {
    name: String,
    prefix: String,
    old_uri: String,
    new_uri: String,
    new_prefix: String,
    types: Vec<NodeTypeDef>,
    explicit_types: bool,
    previous: Option<Box<NamespaceRemap>>,
}

impl NamespaceRemap {
    /// A remap of `prefix` from `old_uri` to `new_uri`.
    ///
    /// When the URIs differ, the post-migration prefix is synthesized as
    /// `prefix_<tail>` from the last URI path segment (dots become
    /// underscores); when they are equal the prefix is kept as-is.
    pub fn new(
        prefix: impl Into<String>,
        old_uri: impl Into<String>,
        new_uri: impl Into<String>,
    ) -> Self {
        let prefix = prefix.into();
        let old_uri = old_uri.into();
        let new_uri = new_uri.into();
        let new_prefix = if old_uri == new_uri {
            prefix.clone()
        } else {
            let tail = new_uri.rsplit('/').next().unwrap_or("").replace('.', "_");
            format!("{prefix}_{tail}")
        };
        Self {
            name: format!("remap-{prefix}"),
            prefix,
            old_uri,
            new_uri,
            new_prefix,
            types: Vec::new(),
            explicit_types: false,
            previous: None,
        }
    }

    /// Declare the type definitions this remap carries. A remap with
    /// explicit types can be driven by a type-indexed query instead of a
    /// full tree walk.
    pub fn with_types(mut self, types: Vec<NodeTypeDef>) -> Self {
        self.types = types;
        self.explicit_types = true;
        self
    }

    /// Chain this remap after an earlier upgrade of the same lineage.
    pub fn chained_to(mut self, previous: NamespaceRemap) -> Self {
        self.previous = Some(Box::new(previous));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn new_prefix(&self) -> &str {
        &self.new_prefix
    }

    pub fn old_uri(&self) -> &str {
        &self.old_uri
    }

    pub fn new_uri(&self) -> &str {
        &self.new_uri
    }

    pub fn has_explicit_types(&self) -> bool {
        self.explicit_types
    }

    /// Fill in auto-derived type definitions (scheduler step for remaps
    /// registered without an explicit type source).
    pub(crate) fn set_derived_types(&mut self, types: Vec<NodeTypeDef>) {
        self.types = types;
    }

    /// Without a type set there is no machine-checkable query: the remap
    /// must ride the full tree walk.
    pub fn is_atomic(&self) -> bool {
        self.types.is_empty()
    }

    /// Register the new prefix/URI pair and (re)register every declared
    /// type definition under the new prefix. Part of preprocessing.
    pub fn register(&mut self, store: &mut dyn ContentStore) -> Result<(), EngineError> {
        store.register_namespace(&self.new_prefix, &self.new_uri)?;
        for def in &self.types {
            let mut renamed = def.clone();
            if renamed.name.prefix() == Some(self.prefix.as_str()) {
                renamed.name = renamed.name.with_prefix(&self.new_prefix)?;
            }
            for property in &mut renamed.properties {
                if let DefName::Named(name) = &property.name {
                    if name.prefix() == Some(self.prefix.as_str()) {
                        property.name = DefName::Named(name.with_prefix(&self.new_prefix)?);
                    }
                }
            }
            for child in &mut renamed.children {
                if let Some(default_type) = &child.default_type {
                    if default_type.prefix() == Some(self.prefix.as_str()) {
                        child.default_type = Some(default_type.with_prefix(&self.new_prefix)?);
                    }
                }
            }
            store.register_node_type(renamed)?;
        }
        if let Some(previous) = &mut self.previous {
            previous.register(store)?;
        }
        Ok(())
    }

    /// Target paths for the batch sweeps: instances of every declared type,
    /// merged over the whole chain.
    pub fn targets(&mut self, store: &mut dyn ContentStore) -> Result<Vec<NodePath>, EngineError> {
        let mut out = BTreeSet::new();
        self.collect_targets(store, &mut out)?;
        Ok(out.into_iter().collect())
    }

    fn collect_targets(
        &mut self,
        store: &mut dyn ContentStore,
        out: &mut BTreeSet<NodePath>,
    ) -> Result<(), EngineError> {
        for def in &self.types {
            for path in store.query_by_type(&def.name)? {
                out.insert(path);
            }
        }
        if let Some(previous) = &mut self.previous {
            previous.collect_targets(store, out)?;
        }
        Ok(())
    }

    fn matches(&self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> Result<bool, EngineError> {
        if let Some(primary) = ctx.tree.primary_type_of(ctx.store, node)? {
            if primary.prefix() == Some(self.prefix.as_str()) {
                return Ok(true);
            }
        }
        let mixins = ctx.tree.mixins_of(ctx.store, node)?;
        Ok(mixins.iter().any(|m| m.prefix() == Some(self.prefix.as_str())))
    }

    /// Entering a node marks the visit boundary only; all rewriting happens
    /// on the way out.
    pub fn enter(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> Result<(), EngineError> {
        if let Some(previous) = &mut self.previous {
            previous.enter(ctx, node)?;
        }
        Ok(())
    }

    /// Rewrite a node on the way out, then delegate to the previous remap.
    pub fn leave(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> Result<(), EngineError> {
        if self.matches(ctx, node)? {
            self.rewrite_types(ctx, node)?;
            let name = ctx.tree.name_of(node)?;
            if name.prefix() == Some(self.prefix.as_str()) {
                let renamed = name.with_prefix(&self.new_prefix)?;
                debug!(from = %name, to = %renamed, "renaming migrated node");
                ctx.tree.rename(node, renamed.as_str())?;
            }
        }
        // Regardless of the node's own types: catch children and properties
        // whose names carry the migrated prefix but sit on foreign types.
        self.rename_prefixed_items(ctx, node)?;
        if let Some(previous) = &mut self.previous {
            previous.leave(ctx, node)?;
        }
        Ok(())
    }

    fn rewrite_types(&self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> Result<(), EngineError> {
        if let Some(primary) = ctx.tree.primary_type_of(ctx.store, node)? {
            if primary.prefix() == Some(self.prefix.as_str()) {
                let renamed = primary.with_prefix(&self.new_prefix)?;
                ctx.tree.set_primary_type(ctx.store, node, &renamed)?;
            }
        }
        let mixins = ctx.tree.mixins_of(ctx.store, node)?;
        let mut changed = false;
        let rewritten: Vec<TypeName> = mixins
            .into_iter()
            .map(|mixin| {
                if mixin.prefix() == Some(self.prefix.as_str()) {
                    changed = true;
                    mixin.with_prefix(&self.new_prefix)
                } else {
                    Ok(mixin)
                }
            })
            .collect::<Result<_, _>>()?;
        if changed {
            ctx.tree.set_mixins(ctx.store, node, rewritten)?;
        }
        Ok(())
    }

    fn rename_prefixed_items(
        &self,
        ctx: &mut VisitContext<'_>,
        node: ItemHandle,
    ) -> Result<(), EngineError> {
        for child in ctx.tree.children_of(ctx.store, node)? {
            let child_name = ctx.tree.name_of(child)?;
            if child_name.prefix() == Some(self.prefix.as_str()) {
                ctx.tree.rename(child, self.renamed(&child_name)?.as_str())?;
            }
        }
        for property in ctx.tree.properties_of(ctx.store, node)? {
            let property_name = ctx.tree.name_of(property)?;
            if property_name.prefix() == Some(self.prefix.as_str()) {
                ctx.tree
                    .rename(property, self.renamed(&property_name)?.as_str())?;
            }
        }
        Ok(())
    }

    fn renamed(&self, name: &ItemName) -> Result<ItemName, EngineError> {
        Ok(name.with_prefix(&self.new_prefix)?)
    }
}

impl std::fmt::Debug for NamespaceRemap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceRemap")
            .field("prefix", &self.prefix)
            .field("new_prefix", &self.new_prefix)
            .field("old_uri", &self.old_uri)
            .field("new_uri", &self.new_uri)
            .field("types", &self.types.len())
            .field("chained", &self.previous.is_some())
            .finish()
    }
}
