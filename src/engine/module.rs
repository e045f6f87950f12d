//! Module registration.
//!
//! A migration module is authored as a [`MigrationModule`] implementation;
//! each run the engine hands it a fresh [`RegistrationContext`] to declare
//! its name, ordering hints, tag gates, and visitors. Registrations are
//! consulted by the scheduler, carried through the run, and discarded at
//! run end.

use std::collections::BTreeSet;

use crate::core::TypeName;
use crate::store::{ContentStore, NodeTypeDef, StoreError};

use super::remap::NamespaceRemap;
use super::visitor::{AtomicVisit, IteratedVisit, Visitor};

/// One module's declared metadata and visitors for the current run.
#[derive(Debug, Default)]
pub struct ModuleRegistration {
    /// Required and unique; a registration without one is dropped.
    pub name: Option<String>,
    /// Names of modules this one should run before / after (hints, not a
    /// full topological order).
    pub before: Vec<String>,
    pub after: Vec<String>,
    /// Version tags that make the module eligible.
    pub start_tags: BTreeSet<String>,
    /// Tags that must already be present for the module to run.
    pub expect_tags: BTreeSet<String>,
    /// Tags recorded when the module's run completes.
    pub end_tags: BTreeSet<String>,
    pub visitors: Vec<Visitor>,
}

/// A unit of migration logic with eligibility metadata and visitors.
pub trait MigrationModule {
    /// Declare this module's registration for the coming cycle. Called once
    /// per cycle; the same module may be re-registered across cycles.
    fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()>;
}

/// The registration surface handed to module authors.
///
/// Doubles as a read-only window onto the store's namespace and type
/// registries, so modules can adapt their declarations to the schema
/// actually present.
pub struct RegistrationContext<'a> {
    store: &'a dyn ContentStore,
    registration: ModuleRegistration,
}

impl<'a> RegistrationContext<'a> {
    pub(crate) fn new(store: &'a dyn ContentStore) -> Self {
        Self {
            store,
            registration: ModuleRegistration::default(),
        }
    }

    pub(crate) fn finish(self) -> ModuleRegistration {
        self.registration
    }

    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.registration.name = Some(name.into());
        self
    }

    pub fn before(&mut self, module: impl Into<String>) -> &mut Self {
        self.registration.before.push(module.into());
        self
    }

    pub fn after(&mut self, module: impl Into<String>) -> &mut Self {
        self.registration.after.push(module.into());
        self
    }

    pub fn start_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.registration.start_tags.insert(tag.into());
        self
    }

    pub fn expect_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.registration.expect_tags.insert(tag.into());
        self
    }

    pub fn end_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        self.registration.end_tags.insert(tag.into());
        self
    }

    pub fn atomic_visitor(&mut self, visitor: Box<dyn AtomicVisit>) -> &mut Self {
        self.registration.visitors.push(Visitor::Atomic(visitor));
        self
    }

    pub fn iterated_visitor(&mut self, visitor: Box<dyn IteratedVisit>) -> &mut Self {
        self.registration.visitors.push(Visitor::Iterated(visitor));
        self
    }

    pub fn namespace_remap(&mut self, remap: NamespaceRemap) -> &mut Self {
        self.registration.visitors.push(Visitor::NamespaceRemap(remap));
        self
    }

    // -- registry window -----------------------------------------------------

    /// URI currently registered for a namespace prefix.
    pub fn namespace_uri(&self, prefix: &str) -> Result<Option<String>, StoreError> {
        self.store.namespace_uri(prefix)
    }

    /// Declared node types carrying a namespace prefix.
    pub fn node_types_for_prefix(&self, prefix: &str) -> Result<Vec<NodeTypeDef>, StoreError> {
        self.store.node_types_for_prefix(prefix)
    }

    /// One declared node type, if registered.
    pub fn node_type(&self, name: &TypeName) -> Result<Option<NodeTypeDef>, StoreError> {
        self.store.node_type(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    struct Noop;

    impl MigrationModule for Noop {
        fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
            ctx.name("noop").start_tag("v1").end_tag("v2").after("earlier");
            Ok(())
        }
    }

    #[test]
    fn registration_round_trip() {
        let store = MemoryStore::new();
        let mut ctx = RegistrationContext::new(&store);
        Noop.register(&mut ctx).unwrap();
        let registration = ctx.finish();
        assert_eq!(registration.name.as_deref(), Some("noop"));
        assert!(registration.start_tags.contains("v1"));
        assert!(registration.end_tags.contains("v2"));
        assert_eq!(registration.after, vec!["earlier".to_string()]);
    }

    #[test]
    fn registry_window_reads_through() {
        let mut store = MemoryStore::new();
        store.register_namespace("demo", "http://x/1.0").unwrap();
        let ctx = RegistrationContext::new(&store);
        assert_eq!(
            ctx.namespace_uri("demo").unwrap().as_deref(),
            Some("http://x/1.0")
        );
        assert!(ctx.namespace_uri("absent").unwrap().is_none());
    }
}
