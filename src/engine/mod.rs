//! engine
//!
//! The migration engine: phase orchestration and version-tag bookkeeping.
//!
//! # Architecture
//!
//! One [`Engine::run`] call loops through migration cycles until the
//! scheduler finds nothing left to do. Each cycle moves through a fixed
//! phase sequence:
//!
//! ```text
//! Idle -> Preparing -> Preprocessing -> Processing
//!      -> BatchCommitBreadthFirst -> BatchCommitDepthFirst
//!      -> WrappingUp -> Idle
//! ```
//!
//! - **Preparing**: register modules, consult the version-tag set, select
//!   and order the cycle's modules
//! - **Preprocessing**: register remapped namespace prefixes and type
//!   definitions
//! - **Processing**: one full tree walk for atomic visitors, plus target
//!   collection for iterated visitors; committed before moving on
//! - **Batch commits**: the target set partitioned into bounded batches,
//!   swept shallow-first (`leaving = false`) then deep-first
//!   (`leaving = true`), committing after every batch
//! - **WrappingUp**: recompute and persist the version-tag set
//!
//! # Failure model
//!
//! A failure inside a single visitor invocation is caught, logged, and does
//! not stop the walk or batch; the first such failure is re-raised once the
//! current phase completes. Structural store errors are fatal immediately.
//! A referential-integrity violation at save gets a best-effort diagnostic
//! (every property still holding the dangling reference) before the error
//! propagates.
//!
//! # Re-entrancy
//!
//! Version tags are only advanced at wrap-up, and batch commits are durable
//! as they land, so an interrupted run can simply be rerun: the same
//! modules come up eligible again and already-applied edits are re-walked
//! harmlessly or skipped by path-resolution misses.

pub mod batch;
pub mod module;
pub mod remap;
pub mod scheduler;
pub mod visitor;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::core::config::EngineConfig;
use crate::core::{ItemName, NodePath, PathSegment, TypeNameError};
use crate::overlay::{OverlayError, OverlayTree};
use crate::store::{ContentStore, PropertyValues, StoreError};

pub use batch::TraversalOrder;
pub use module::{MigrationModule, ModuleRegistration, RegistrationContext};
pub use remap::NamespaceRemap;
pub use scheduler::Schedule;
pub use visitor::{AtomicVisit, IteratedVisit, VisitContext, Visitor};

/// Well-known node holding the version-tag property.
const MIGRATION_NODE: &str = "migration";
const SYSTEM_NODE: &str = "system";
/// Multi-valued string property recording applied migrations.
const TAGS_PROPERTY: &str = "canopy:tags";

/// Errors surfaced by an engine run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Structural backing-store failure; fatal for the current phase.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Overlay failure during a walk or commit.
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    /// Invalid item or type name produced during rewriting.
    #[error("invalid name: {0}")]
    Name(#[from] TypeNameError),

    /// A module's registration callback failed.
    #[error("module '{module}' failed to register: {message}")]
    Registration { module: String, message: String },

    /// First visitor failure of a phase, re-raised after the phase ends.
    #[error("visitor '{visitor}' failed during {phase}: {message}")]
    VisitorFailed {
        visitor: String,
        phase: Phase,
        message: String,
    },
}

/// The engine's phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Preparing,
    Preprocessing,
    Processing,
    BatchCommitBreadthFirst,
    BatchCommitDepthFirst,
    WrappingUp,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Preparing => "preparing",
            Phase::Preprocessing => "preprocessing",
            Phase::Processing => "processing",
            Phase::BatchCommitBreadthFirst => "batch-commit-breadth-first",
            Phase::BatchCommitDepthFirst => "batch-commit-depth-first",
            Phase::WrappingUp => "wrapping-up",
        };
        f.write_str(name)
    }
}

/// Summary of a completed run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// Identity of this run, for embedder audit logs.
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Migration cycles executed (0 when nothing was eligible).
    pub cycles: u32,
    /// Names of every module applied, in run order across cycles.
    pub modules_applied: Vec<String>,
    /// Nodes visited by the atomic tree walks, summed over cycles.
    pub visited: u64,
    /// Batches committed by the two sweeps, summed over cycles.
    pub batches_committed: u64,
    /// The version-tag set after the run.
    pub tags: BTreeSet<String>,
}

/// Per-cycle accounting folded into the final [`RunReport`].
struct CycleOutcome {
    applied: Vec<String>,
    visited: u64,
    batches_committed: u64,
}

/// Visitor key into the cycle's module list: (module index, visitor index).
type VisitorKey = (usize, usize);
type TargetMap = BTreeMap<NodePath, Vec<VisitorKey>>;

/// The migration engine. Owns the registered modules and the run loop;
/// borrows a backing-store session per run.
pub struct Engine {
    config: EngineConfig,
    modules: Vec<Box<dyn MigrationModule>>,
    phase: Phase,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            modules: Vec::new(),
            phase: Phase::Idle,
        }
    }

    /// Add a module to the engine's static module list.
    pub fn register(&mut self, module: Box<dyn MigrationModule>) -> &mut Self {
        self.modules.push(module);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run migration cycles until the scheduler finds nothing to do.
    ///
    /// A store without the well-known migration node is a no-op. Tags are
    /// read at the start of every cycle, so one module's wrap-up can make
    /// another module eligible in the next cycle.
    pub fn run(&mut self, store: &mut dyn ContentStore) -> Result<RunReport, EngineError> {
        let started_at = Utc::now();
        let mut cycles = 0;
        let mut modules_applied = Vec::new();
        let mut visited = 0;
        let mut batches_committed = 0;
        loop {
            self.phase = Phase::Preparing;
            let Some(tags) = read_tags(&*store)? else {
                debug!("no migration node present; nothing to do");
                break;
            };
            info!(cycle = cycles + 1, ?tags, "preparing migration cycle");

            let mut registrations = Vec::with_capacity(self.modules.len());
            for module in &mut self.modules {
                let mut ctx = RegistrationContext::new(&*store);
                module
                    .register(&mut ctx)
                    .map_err(|err| EngineError::Registration {
                        module: format!("#{}", registrations.len()),
                        message: format!("{err:#}"),
                    })?;
                registrations.push(ctx.finish());
            }

            let schedule = scheduler::prepare(&*store, registrations, &tags)?;
            if schedule.is_empty() {
                debug!("no applicable modules; run complete");
                break;
            }
            let outcome = self.run_cycle(store, schedule, tags)?;
            cycles += 1;
            modules_applied.extend(outcome.applied);
            visited += outcome.visited;
            batches_committed += outcome.batches_committed;
        }
        self.phase = Phase::Idle;
        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            cycles,
            modules_applied,
            visited,
            batches_committed,
            tags: read_tags(&*store)?.unwrap_or_default(),
        };
        info!(
            run_id = %report.run_id,
            cycles = report.cycles,
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "run complete"
        );
        Ok(report)
    }

    fn run_cycle(
        &mut self,
        store: &mut dyn ContentStore,
        mut schedule: scheduler::Schedule,
        tags: BTreeSet<String>,
    ) -> Result<CycleOutcome, EngineError> {
        let applied: Vec<String> = schedule
            .modules
            .iter()
            .filter_map(|m| m.name.clone())
            .collect();
        info!(modules = ?applied, single_runner = schedule.single_runner, "running cycle");
        let mut first_failure: Option<EngineError> = None;

        // Preprocessing: namespace and type registration is all-or-nothing.
        self.phase = Phase::Preprocessing;
        info!(phase = %self.phase, "entering phase");
        for module in &mut schedule.modules {
            for visitor in &mut module.visitors {
                if let Visitor::NamespaceRemap(remap) = visitor {
                    remap.register(store)?;
                }
            }
        }

        // Processing: collect iterated targets, then the atomic tree walk.
        self.phase = Phase::Processing;
        info!(phase = %self.phase, "entering phase");
        let targets = self.collect_targets(store, &mut schedule.modules, &mut first_failure);
        let visited;
        {
            let mut tree = OverlayTree::open(&*store, &NodePath::root())?;
            let root = tree.root();
            visited = walk(
                store,
                &mut tree,
                root,
                &mut schedule.modules,
                self.phase,
                &mut first_failure,
            )?;
            tree.commit(store)?;
        }
        self.save_session(store, false)?;
        if let Some(err) = first_failure.take() {
            return Err(err);
        }

        // Two batch sweeps over the same target map.
        self.phase = Phase::BatchCommitBreadthFirst;
        info!(phase = %self.phase, targets = targets.len(), "entering phase");
        let mut batches_committed = self.batch_sweep(
            store,
            &mut schedule.modules,
            &targets,
            TraversalOrder::Forward,
            false,
            &mut first_failure,
        )?;
        if let Some(err) = first_failure.take() {
            return Err(err);
        }

        self.phase = Phase::BatchCommitDepthFirst;
        info!(phase = %self.phase, "entering phase");
        batches_committed += self.batch_sweep(
            store,
            &mut schedule.modules,
            &targets,
            TraversalOrder::Reverse,
            true,
            &mut first_failure,
        )?;
        if let Some(err) = first_failure.take() {
            return Err(err);
        }

        // Wrap-up: consumed start tags drop out, produced end tags land.
        self.phase = Phase::WrappingUp;
        info!(phase = %self.phase, "entering phase");
        let mut new_tags = tags;
        for module in &schedule.modules {
            for tag in &module.start_tags {
                new_tags.remove(tag);
            }
            for tag in &module.end_tags {
                new_tags.insert(tag.clone());
            }
        }
        write_tags(store, &new_tags)?;
        self.save_session(store, true)?;
        info!(tags = ?new_tags, "cycle complete");
        Ok(CycleOutcome {
            applied,
            visited,
            batches_committed,
        })
    }

    /// Gather every iterated visitor's target paths, keyed by path.
    fn collect_targets(
        &self,
        store: &mut dyn ContentStore,
        modules: &mut [ModuleRegistration],
        first_failure: &mut Option<EngineError>,
    ) -> TargetMap {
        let mut targets = TargetMap::new();
        for (module_index, module) in modules.iter_mut().enumerate() {
            for (visitor_index, visitor) in module.visitors.iter_mut().enumerate() {
                let name = visitor.name().to_string();
                let paths = match visitor {
                    Visitor::Iterated(v) => v.targets(store).map_err(|e| format!("{e:#}")),
                    Visitor::NamespaceRemap(r) if !r.is_atomic() => {
                        r.targets(store).map_err(|e| e.to_string())
                    }
                    _ => continue,
                };
                match paths {
                    Ok(paths) => {
                        for path in paths {
                            targets
                                .entry(path)
                                .or_default()
                                .push((module_index, visitor_index));
                        }
                    }
                    Err(message) => {
                        record_failure(first_failure, &name, self.phase, message);
                    }
                }
            }
        }
        targets
    }

    /// One partition-and-replay sweep over the target map.
    fn batch_sweep(
        &mut self,
        store: &mut dyn ContentStore,
        modules: &mut [ModuleRegistration],
        targets: &TargetMap,
        order: TraversalOrder,
        leaving: bool,
        first_failure: &mut Option<EngineError>,
    ) -> Result<u64, EngineError> {
        let batches = batch::partition(targets, self.config.batch_threshold, order);
        let mut committed = 0;
        for batch in batches {
            let mut tree = OverlayTree::open(&*store, &NodePath::root())?;
            for (path, keys) in &batch {
                // Entries may have been moved or deleted since collection.
                let Some(handle) = tree.resolve(store, path)? else {
                    debug!(%path, "batch target no longer resolves; skipping");
                    continue;
                };
                for (module_index, visitor_index) in keys {
                    let visitor = &mut modules[*module_index].visitors[*visitor_index];
                    let name = visitor.name().to_string();
                    let result = {
                        let mut ctx = VisitContext {
                            store: &mut *store,
                            tree: &mut tree,
                        };
                        match visitor {
                            Visitor::Iterated(v) => v
                                .visit(&mut ctx, handle, leaving)
                                .map_err(|e| format!("{e:#}")),
                            Visitor::NamespaceRemap(r) => if leaving {
                                r.leave(&mut ctx, handle)
                            } else {
                                r.enter(&mut ctx, handle)
                            }
                            .map_err(|e| e.to_string()),
                            // Atomic visitors never land in the target map.
                            Visitor::Atomic(_) => Ok(()),
                        }
                    };
                    if let Err(message) = result {
                        record_failure(first_failure, &name, self.phase, message);
                    }
                }
            }
            tree.commit(store)?;
            self.save_session(store, false)?;
            committed += 1;
        }
        Ok(committed)
    }

    /// Save the session; `force` bypasses the `save_on_commit` switch (the
    /// wrap-up save is never skipped).
    fn save_session(&self, store: &mut dyn ContentStore, force: bool) -> Result<(), EngineError> {
        if !force && !self.config.save_on_commit {
            return Ok(());
        }
        match store.save() {
            Ok(()) => Ok(()),
            Err(StoreError::ReferentialIntegrity { target }) => {
                let referrers = store.referrers(target).unwrap_or_default();
                for (path, property) in &referrers {
                    error!(%path, %property, "property still references the dangling target");
                }
                error!(
                    ?target,
                    referrer_count = referrers.len(),
                    "referential integrity violation at save"
                );
                Err(StoreError::ReferentialIntegrity { target }.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Depth-first walk invoking atomic visitors: enter top-down, leave
/// bottom-up. Per-visitor failures are recorded, never propagated.
/// Returns the number of nodes visited.
fn walk(
    store: &mut dyn ContentStore,
    tree: &mut OverlayTree,
    handle: crate::overlay::ItemHandle,
    modules: &mut [ModuleRegistration],
    phase: Phase,
    first_failure: &mut Option<EngineError>,
) -> Result<u64, EngineError> {
    invoke_atomics(store, tree, handle, modules, phase, false, first_failure);
    let mut visited = 1;
    let children = tree.children_of(store, handle)?;
    for child in children {
        visited += walk(store, tree, child, modules, phase, first_failure)?;
    }
    invoke_atomics(store, tree, handle, modules, phase, true, first_failure);
    Ok(visited)
}

fn invoke_atomics(
    store: &mut dyn ContentStore,
    tree: &mut OverlayTree,
    handle: crate::overlay::ItemHandle,
    modules: &mut [ModuleRegistration],
    phase: Phase,
    leaving: bool,
    first_failure: &mut Option<EngineError>,
) {
    for module in modules.iter_mut() {
        for visitor in module.visitors.iter_mut() {
            if !visitor.is_atomic() {
                continue;
            }
            let name = visitor.name().to_string();
            let result = {
                let mut ctx = VisitContext {
                    store: &mut *store,
                    tree: &mut *tree,
                };
                match visitor {
                    Visitor::Atomic(v) => if leaving {
                        v.leave(&mut ctx, handle)
                    } else {
                        v.enter(&mut ctx, handle)
                    }
                    .map_err(|e| format!("{e:#}")),
                    Visitor::NamespaceRemap(r) => if leaving {
                        r.leave(&mut ctx, handle)
                    } else {
                        r.enter(&mut ctx, handle)
                    }
                    .map_err(|e| e.to_string()),
                    Visitor::Iterated(_) => Ok(()),
                }
            };
            if let Err(message) = result {
                record_failure(first_failure, &name, phase, message);
            }
        }
    }
}

fn record_failure(
    first_failure: &mut Option<EngineError>,
    visitor: &str,
    phase: Phase,
    message: String,
) {
    error!(visitor, %phase, error = %message, "visitor failed; continuing");
    if first_failure.is_none() {
        *first_failure = Some(EngineError::VisitorFailed {
            visitor: visitor.to_string(),
            phase,
            message,
        });
    }
}

fn migration_path() -> NodePath {
    NodePath::root()
        .child(PathSegment::new(SYSTEM_NODE))
        .child(PathSegment::new(MIGRATION_NODE))
}

fn tags_property() -> ItemName {
    ItemName::new(TAGS_PROPERTY).expect("constant property name is valid")
}

/// Read the version-tag set; `None` when the migration node is absent
/// (clean store, migration is a no-op).
fn read_tags(store: &dyn ContentStore) -> Result<Option<BTreeSet<String>>, EngineError> {
    let Some(node) = store.node_at(&migration_path())? else {
        return Ok(None);
    };
    let tags = match store.property(node, &tags_property())? {
        Some(values) => values
            .values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        None => BTreeSet::new(),
    };
    Ok(Some(tags))
}

fn write_tags(store: &mut dyn ContentStore, tags: &BTreeSet<String>) -> Result<(), EngineError> {
    let node = store
        .node_at(&migration_path())?
        .ok_or_else(|| StoreError::Internal {
            message: "migration node vanished during the run".into(),
        })?;
    store.set_property(
        node,
        &tags_property(),
        Some(PropertyValues::strings(tags.iter().cloned())),
    )?;
    Ok(())
}
