//! End-to-end engine runs over an in-memory store.

use std::collections::BTreeSet;

use canopy::core::{EngineConfig, ItemName, NodePath, TypeName};
use canopy::engine::{
    AtomicVisit, Engine, EngineError, IteratedVisit, MigrationModule, NamespaceRemap,
    RegistrationContext, VisitContext,
};
use canopy::overlay::ItemHandle;
use canopy::store::{ContentStore, MemoryStore, PropertyValues, StoreError, Value};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn name(s: &str) -> ItemName {
    ItemName::new(s).unwrap()
}

fn ty(s: &str) -> TypeName {
    TypeName::new(s).unwrap()
}

fn path(s: &str) -> NodePath {
    NodePath::parse(s).unwrap()
}

/// A store carrying the well-known migration node and an empty tag set.
fn migratable_store() -> MemoryStore {
    init_tracing();
    let mut store = MemoryStore::new();
    let root = store.root();
    let system = store.add_node(root, &name("system"), &ty("sys:folder")).unwrap();
    store
        .add_node(system, &name("migration"), &ty("sys:migration"))
        .unwrap();
    store
}

fn tags_of(store: &MemoryStore) -> BTreeSet<String> {
    let node = store.node_at(&path("/system/migration")).unwrap().unwrap();
    match store.property(node, &name("canopy:tags")).unwrap() {
        Some(values) => values
            .values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        None => BTreeSet::new(),
    }
}

fn seed_tags(store: &mut MemoryStore, tags: &[&str]) {
    let node = store.node_at(&path("/system/migration")).unwrap().unwrap();
    store
        .set_property(
            node,
            &name("canopy:tags"),
            Some(PropertyValues::strings(tags.iter().copied())),
        )
        .unwrap();
}

/// A module that only moves tags around, with no visitors.
struct TagShift {
    name: &'static str,
    start: Vec<&'static str>,
    end: Vec<&'static str>,
}

impl MigrationModule for TagShift {
    fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
        ctx.name(self.name);
        for tag in &self.start {
            ctx.start_tag(*tag);
        }
        for tag in &self.end {
            ctx.end_tag(*tag);
        }
        Ok(())
    }
}

/// Stamps a property on every target of one node type, once per sweep.
struct Stamper {
    target_type: &'static str,
}

impl IteratedVisit for Stamper {
    fn name(&self) -> &str {
        "stamper"
    }

    fn targets(&mut self, store: &mut dyn ContentStore) -> anyhow::Result<Vec<NodePath>> {
        Ok(store.query_by_type(&ty(self.target_type))?)
    }

    fn visit(
        &mut self,
        ctx: &mut VisitContext<'_>,
        node: ItemHandle,
        leaving: bool,
    ) -> anyhow::Result<()> {
        let property = if leaving { "finalized" } else { "entered" };
        ctx.tree.set_property(
            ctx.store,
            node,
            &name(property),
            Some(PropertyValues::string("yes")),
        )?;
        Ok(())
    }
}

struct StamperModule {
    target_type: &'static str,
}

impl MigrationModule for StamperModule {
    fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
        ctx.name("stamper-module")
            .end_tag("stamped")
            .iterated_visitor(Box::new(Stamper {
                target_type: self.target_type,
            }));
        Ok(())
    }
}

#[test]
fn no_modules_is_idempotent() {
    let mut store = migratable_store();
    seed_tags(&mut store, &["baseline"]);
    let before = store.fingerprint();

    let mut engine = Engine::new(EngineConfig::default());
    let first = engine.run(&mut store).unwrap();
    let second = engine.run(&mut store).unwrap();

    assert_eq!(first.cycles, 0);
    assert_eq!(second.cycles, 0);
    assert_eq!(store.fingerprint(), before);
    assert_eq!(tags_of(&store), ["baseline".to_string()].into());
}

#[test]
fn clean_store_without_migration_node_is_noop() {
    let mut store = MemoryStore::new();
    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(TagShift {
        name: "bootstrap",
        start: vec![],
        end: vec!["v1"],
    }));
    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 0);
}

#[test]
fn tag_gated_module_runs_once() {
    let mut store = migratable_store();
    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(TagShift {
        name: "bootstrap",
        start: vec![],
        end: vec!["v1"],
    }));

    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 1);
    assert_eq!(report.modules_applied, vec!["bootstrap".to_string()]);
    // Root, /system, /system/migration.
    assert_eq!(report.visited, 3);
    assert!(tags_of(&store).contains("v1"));

    // Its end tag is now present: a second run selects nothing.
    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 0);
}

#[test]
fn bootstrap_runs_before_tagged_module() {
    let mut store = migratable_store();
    seed_tags(&mut store, &["v0"]);
    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(TagShift {
        name: "tagged",
        start: vec!["v0"],
        end: vec!["v1"],
    }));
    engine.register(Box::new(TagShift {
        name: "bootstrap",
        start: vec![],
        end: vec!["base"],
    }));

    // Cycle 1 runs the bootstrap alone; the tagged module follows in
    // cycle 2 once the bootstrap's end tag is in place.
    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 2);
    assert_eq!(
        report.modules_applied,
        vec!["bootstrap".to_string(), "tagged".to_string()]
    );
    assert_eq!(tags_of(&store), ["base".to_string(), "v1".to_string()].into());
}

#[test]
fn circular_tag_module_is_skipped() {
    let mut store = migratable_store();
    seed_tags(&mut store, &["v1"]);
    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(TagShift {
        name: "circular",
        start: vec!["v1"],
        end: vec!["v1", "v2"],
    }));
    engine.register(Box::new(TagShift {
        name: "ok",
        start: vec!["v1"],
        end: vec!["done"],
    }));

    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.modules_applied, vec!["ok".to_string()]);
    // "v1" was consumed by "ok"; the circular module never produced "v2".
    assert_eq!(tags_of(&store), ["done".to_string()].into());
}

#[test]
fn iterated_visitor_sees_both_sweeps() {
    let mut store = migratable_store();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    let doc = store.add_node(content, &name("doc"), &ty("demo:doc")).unwrap();
    store.add_node(content, &name("other"), &ty("unstructured")).unwrap();

    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(StamperModule { target_type: "demo:doc" }));
    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 1);

    assert_eq!(
        store.property(doc, &name("entered")).unwrap(),
        Some(PropertyValues::string("yes"))
    );
    assert_eq!(
        store.property(doc, &name("finalized")).unwrap(),
        Some(PropertyValues::string("yes"))
    );
    let other = store.node_at(&path("/content/other")).unwrap().unwrap();
    assert_eq!(store.property(other, &name("entered")).unwrap(), None);
}

#[test]
fn batch_threshold_bounds_commits() {
    let mut store = migratable_store();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    for i in 0..250 {
        store
            .add_node(content, &name(&format!("n{i:04}")), &ty("demo:doc"))
            .unwrap();
    }

    let mut config = EngineConfig::default();
    config.batch_threshold = 100;
    let mut engine = Engine::new(config);
    engine.register(Box::new(StamperModule { target_type: "demo:doc" }));

    let saves_before = store.save_count();
    let report = engine.run(&mut store).unwrap();
    // One save for processing, three per sweep (batches of 100/100/50),
    // and the wrap-up save.
    assert_eq!(store.save_count() - saves_before, 8);
    assert_eq!(report.batches_committed, 6);
}

#[test]
fn vanished_batch_targets_are_skipped() {
    let mut store = migratable_store();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    let keep = store.add_node(content, &name("keep"), &ty("demo:doc")).unwrap();
    let doomed = store.add_node(content, &name("doomed"), &ty("demo:doc")).unwrap();

    // Deletes one sibling during the atomic walk, so a collected batch
    // target no longer resolves by the time the sweeps run.
    struct Reaper;

    impl AtomicVisit for Reaper {
        fn name(&self) -> &str {
            "reaper"
        }

        fn enter(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> anyhow::Result<()> {
            if ctx.tree.name_of(node)? == ItemName::new("doomed").unwrap() {
                ctx.tree.remove(node)?;
            }
            Ok(())
        }
    }

    struct ReaperStamperModule;

    impl MigrationModule for ReaperStamperModule {
        fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
            ctx.name("reaper-stamper")
                .end_tag("reaped")
                .atomic_visitor(Box::new(Reaper))
                .iterated_visitor(Box::new(Stamper { target_type: "demo:doc" }));
            Ok(())
        }
    }

    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(ReaperStamperModule));
    engine.run(&mut store).unwrap();

    assert!(!store.exists(doomed));
    assert_eq!(
        store.property(keep, &name("entered")).unwrap(),
        Some(PropertyValues::string("yes"))
    );
}

#[test]
fn first_visitor_failure_reraised_after_phase() {
    let mut store = migratable_store();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    let good = store.add_node(content, &name("good"), &ty("unstructured")).unwrap();
    store.add_node(content, &name("bad"), &ty("unstructured")).unwrap();

    // Fails on one node, stamps every other.
    struct Flaky;

    impl AtomicVisit for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn enter(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> anyhow::Result<()> {
            if ctx.tree.name_of(node)? == ItemName::new("bad").unwrap() {
                anyhow::bail!("refusing this node");
            }
            ctx.tree.set_property(
                ctx.store,
                node,
                &ItemName::new("touched").unwrap(),
                Some(PropertyValues::string("yes")),
            )?;
            Ok(())
        }
    }

    struct FlakyModule;

    impl MigrationModule for FlakyModule {
        fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
            ctx.name("flaky-module")
                .end_tag("flaked")
                .atomic_visitor(Box::new(Flaky));
            Ok(())
        }
    }

    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(FlakyModule));
    let err = engine.run(&mut store).unwrap_err();
    assert!(matches!(err, EngineError::VisitorFailed { .. }));

    // The walk continued past the failure and the phase still committed.
    assert_eq!(
        store.property(good, &name("touched")).unwrap(),
        Some(PropertyValues::string("yes"))
    );
    // The run aborted before wrap-up: tags unchanged.
    assert_eq!(tags_of(&store), BTreeSet::new());
}

#[test]
fn dangling_reference_aborts_run_before_wrapup() {
    let mut store = migratable_store();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    let target = store.add_node(content, &name("target"), &ty("unstructured")).unwrap();
    let referrer = store.add_node(content, &name("referrer"), &ty("unstructured")).unwrap();
    store
        .set_property(
            referrer,
            &name("link"),
            Some(PropertyValues::single(Value::Reference(target))),
        )
        .unwrap();

    // Removes the referenced node, leaving "link" dangling at save time.
    struct Severer;

    impl AtomicVisit for Severer {
        fn name(&self) -> &str {
            "severer"
        }

        fn enter(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> anyhow::Result<()> {
            if ctx.tree.name_of(node)? == ItemName::new("target").unwrap() {
                ctx.tree.remove(node)?;
            }
            Ok(())
        }
    }

    struct SevererModule;

    impl MigrationModule for SevererModule {
        fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
            ctx.name("severer-module").end_tag("severed").atomic_visitor(Box::new(Severer));
            Ok(())
        }
    }

    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(SevererModule));
    let err = engine.run(&mut store).unwrap_err();
    assert!(matches!(
        err,
        EngineError::Store(StoreError::ReferentialIntegrity { .. })
    ));

    // The run aborted before wrap-up: tags unchanged.
    assert_eq!(tags_of(&store), BTreeSet::new());
}

#[test]
fn namespace_remap_end_to_end() {
    let mut store = migratable_store();
    store.register_namespace("demo", "http://ns.example.com/demo/1.0").unwrap();
    store
        .register_node_type(canopy::store::NodeTypeDef::unstructured(ty("demo:doc")))
        .unwrap();
    let root = store.root();
    let content = store.add_node(root, &name("content"), &ty("unstructured")).unwrap();
    let doc = store.add_node(content, &name("a"), &ty("demo:doc")).unwrap();
    store
        .set_property(doc, &name("demo:title"), Some(PropertyValues::string("t")))
        .unwrap();
    seed_tags(&mut store, &["upgrade-demo"]);

    struct RemapModule;

    impl MigrationModule for RemapModule {
        fn register(&mut self, ctx: &mut RegistrationContext<'_>) -> anyhow::Result<()> {
            ctx.name("demo-upgrade")
                .start_tag("upgrade-demo")
                .end_tag("demo-1.1")
                .namespace_remap(NamespaceRemap::new(
                    "demo",
                    "http://ns.example.com/demo/1.0",
                    "http://ns.example.com/demo/1.1",
                ));
            Ok(())
        }
    }

    let mut engine = Engine::new(EngineConfig::default());
    engine.register(Box::new(RemapModule));
    let report = engine.run(&mut store).unwrap();
    assert_eq!(report.cycles, 1);

    assert_eq!(
        store.namespace_uri("demo_1_1").unwrap().as_deref(),
        Some("http://ns.example.com/demo/1.1")
    );
    let migrated = store.node_at(&path("/content/a")).unwrap().unwrap();
    assert_eq!(store.primary_type(migrated).unwrap(), ty("demo_1_1:doc"));
    assert_eq!(
        store.property(migrated, &name("demo_1_1:title")).unwrap(),
        Some(PropertyValues::string("t"))
    );
    assert_eq!(
        tags_of(&store),
        ["demo-1.1".to_string()].into()
    );
}
