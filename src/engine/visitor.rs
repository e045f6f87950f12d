//! Visitor kinds and the enter/leave contract.
//!
//! The variant set is closed: a visitor is either *atomic* (needs the full
//! tree walk), *iterated* (driven by a pre-queried target set), or a
//! namespace remap (which decides at run time which of the two it is, see
//! [`NamespaceRemap::is_atomic`]). Modules bundle visitors; the engine owns
//! dispatch and failure isolation.

use crate::overlay::{ItemHandle, OverlayTree};
use crate::store::ContentStore;

use super::remap::NamespaceRemap;

/// Everything a visitor may touch during one invocation: the live backing
/// session and the overlay buffering this phase's edits.
pub struct VisitContext<'a> {
    pub store: &'a mut dyn ContentStore,
    pub tree: &'a mut OverlayTree,
}

/// A visitor invoked on every node of the full tree walk.
///
/// `enter` fires top-down, `leave` bottom-up; structural rewrites belong in
/// `leave` so a node's subtree is visited before the node itself changes
/// shape.
pub trait AtomicVisit {
    fn name(&self) -> &str;

    fn enter(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> anyhow::Result<()>;

    fn leave(&mut self, ctx: &mut VisitContext<'_>, node: ItemHandle) -> anyhow::Result<()> {
        let _ = (ctx, node);
        Ok(())
    }
}

/// A visitor driven by a pre-collected target set instead of a tree walk.
///
/// `targets` runs once during the processing phase; each returned path is
/// revisited twice during the batch sweeps, first with `leaving = false`
/// (shallow-first), then with `leaving = true` (deep-first).
pub trait IteratedVisit {
    fn name(&self) -> &str;

    fn targets(&mut self, store: &mut dyn ContentStore) -> anyhow::Result<Vec<crate::core::NodePath>>;

    fn visit(
        &mut self,
        ctx: &mut VisitContext<'_>,
        node: ItemHandle,
        leaving: bool,
    ) -> anyhow::Result<()>;
}

/// The closed set of visitor kinds a module may register.
pub enum Visitor {
    Atomic(Box<dyn AtomicVisit>),
    Iterated(Box<dyn IteratedVisit>),
    NamespaceRemap(NamespaceRemap),
}

impl Visitor {
    pub fn name(&self) -> &str {
        match self {
            Visitor::Atomic(v) => v.name(),
            Visitor::Iterated(v) => v.name(),
            Visitor::NamespaceRemap(r) => r.name(),
        }
    }

    /// Whether this visitor participates in the full tree walk (as opposed
    /// to the batch sweeps).
    pub fn is_atomic(&self) -> bool {
        match self {
            Visitor::Atomic(_) => true,
            Visitor::Iterated(_) => false,
            Visitor::NamespaceRemap(r) => r.is_atomic(),
        }
    }
}

impl std::fmt::Debug for Visitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Visitor::Atomic(_) => "Atomic",
            Visitor::Iterated(_) => "Iterated",
            Visitor::NamespaceRemap(_) => "NamespaceRemap",
        };
        write!(f, "Visitor::{kind}({})", self.name())
    }
}
