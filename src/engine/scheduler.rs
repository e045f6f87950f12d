//! Module selection and ordering.
//!
//! [`prepare`] is a pure move-in/move-out function: it consumes the cycle's
//! registrations and the current version-tag set and returns the ordered
//! subset that should run, with remap visitors resolved against the store's
//! schema. Nothing here mutates the store.
//!
//! Ordering is the bounded-bubble heuristic: modules are relocated next to
//! their before/after targets, with the total move count capped by the
//! number of declared constraints. That is best-effort, not a topological
//! sort; constraints left unsatisfied when the budget runs out are logged.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::store::ContentStore;

use super::module::ModuleRegistration;
use super::visitor::Visitor;
use super::EngineError;

/// The outcome of one prepare pass.
#[derive(Debug, Default)]
pub struct Schedule {
    /// Selected modules in run order. Empty means nothing to do.
    pub modules: Vec<ModuleRegistration>,
    /// A bootstrap module (no start tags) was selected and runs alone.
    pub single_runner: bool,
}

impl Schedule {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Select, validate, and order modules for one cycle.
pub fn prepare(
    store: &dyn ContentStore,
    modules: Vec<ModuleRegistration>,
    current_tags: &BTreeSet<String>,
) -> Result<Schedule, EngineError> {
    let mut single_runner = false;
    let mut selected: Vec<ModuleRegistration> = Vec::new();

    for module in modules {
        let Some(name) = module.name.clone() else {
            warn!("dropping unnamed module registration");
            continue;
        };
        if !module.start_tags.is_disjoint(&module.end_tags) {
            warn!(module = %name, "disabling module: start and end tags intersect");
            continue;
        }
        if !module.expect_tags.is_subset(current_tags) {
            debug!(module = %name, "skipping module: expected tags not satisfied");
            continue;
        }
        if module.start_tags.is_empty() {
            // Bootstrap module: eligible only while its end tags are not yet
            // all present.
            if module.end_tags.is_subset(current_tags) {
                continue;
            }
            single_runner = true;
            selected.push(module);
        } else if module.start_tags.iter().any(|t| current_tags.contains(t)) {
            selected.push(module);
        }
    }

    if single_runner {
        selected.retain(|m| m.start_tags.is_empty());
    }
    if selected.is_empty() {
        return Ok(Schedule::default());
    }

    reorder(&mut selected);
    resolve_remaps(store, &mut selected)?;

    Ok(Schedule {
        modules: selected,
        single_runner,
    })
}

fn position(modules: &[ModuleRegistration], name: &str) -> Option<usize> {
    modules.iter().position(|m| m.name.as_deref() == Some(name))
}

/// Bounded-bubble relative ordering: relocate each module next to its
/// after/before targets until stable or the move budget is exhausted.
fn reorder(modules: &mut Vec<ModuleRegistration>) {
    let budget: usize = modules.iter().map(|m| m.before.len() + m.after.len()).sum();
    let mut moves = 0;
    let mut changed = true;
    while changed && moves < budget {
        changed = false;
        for i in 0..modules.len() {
            let after_target = modules[i]
                .after
                .iter()
                .filter_map(|n| position(modules, n))
                .max();
            if let Some(target) = after_target {
                if target > i {
                    let module = modules.remove(i);
                    modules.insert(target, module);
                    moves += 1;
                    changed = true;
                    break;
                }
            }
            let before_target = modules[i]
                .before
                .iter()
                .filter_map(|n| position(modules, n))
                .min();
            if let Some(target) = before_target {
                if target < i {
                    let module = modules.remove(i);
                    modules.insert(target, module);
                    moves += 1;
                    changed = true;
                    break;
                }
            }
        }
    }

    for i in 0..modules.len() {
        let name = modules[i].name.as_deref().unwrap_or("");
        for after in &modules[i].after {
            if position(modules, after).is_some_and(|p| p > i) {
                warn!(module = name, after, "ordering constraint left unsatisfied");
            }
        }
        for before in &modules[i].before {
            if position(modules, before).is_some_and(|p| p < i) {
                warn!(module = name, before, "ordering constraint left unsatisfied");
            }
        }
    }
}

/// Resolve namespace remaps registered without an explicit type source:
/// drop them when an explicit remap of the same prefix is already selected,
/// otherwise derive their type set from the store's registry.
fn resolve_remaps(
    store: &dyn ContentStore,
    modules: &mut [ModuleRegistration],
) -> Result<(), EngineError> {
    let explicit: BTreeSet<String> = modules
        .iter()
        .flat_map(|m| m.visitors.iter())
        .filter_map(|v| match v {
            Visitor::NamespaceRemap(r) if r.has_explicit_types() => Some(r.prefix().to_string()),
            _ => None,
        })
        .collect();

    for module in modules.iter_mut() {
        let mut kept = Vec::with_capacity(module.visitors.len());
        for mut visitor in module.visitors.drain(..) {
            if let Visitor::NamespaceRemap(remap) = &mut visitor {
                if !remap.has_explicit_types() {
                    if explicit.contains(remap.prefix()) {
                        debug!(
                            prefix = remap.prefix(),
                            "skipping implicit remap: explicit remap already selected"
                        );
                        continue;
                    }
                    remap.set_derived_types(store.node_types_for_prefix(remap.prefix())?);
                }
            }
            kept.push(visitor);
        }
        module.visitors = kept;
    }
    Ok(())
}
