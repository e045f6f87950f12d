//! Batch partitioning with document-variant locality.
//!
//! The collected target map is sliced into size-bounded batches in forward
//! or reverse path order, then adjusted so a document-variant group that
//! straddles one batch boundary lands whole in the later batch. Bases are
//! computed from the initial slicing and never re-derived, so a move can
//! never cascade: groups spanning three or more pre-partition batches are
//! deliberately not merged further.

use std::collections::BTreeSet;

use crate::core::NodePath;

/// Direction of the path sort the batches are sliced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    Forward,
    Reverse,
}

/// One target entry: a path and the visitor keys to replay on it.
pub type BatchEntry<K> = (NodePath, Vec<K>);

/// The variant-group base a path is bucketed under, when it has one.
///
/// `/system` and `/attic` are their own bases: everything under either root
/// stays together without needing a repeated-name heuristic.
fn variant_base(path: &NodePath) -> Option<NodePath> {
    for exception in ["system", "attic"] {
        if path
            .segments()
            .first()
            .is_some_and(|s| s.name == exception && s.index <= 1)
        {
            return Some(NodePath::root().child(crate::core::PathSegment::new(exception)));
        }
    }
    path.document_variant_path()
}

/// Slice a target map into bounded batches and apply the variant-locality
/// adjustment. `threshold` must be nonzero (enforced by config validation).
pub fn partition<K: Clone>(
    targets: &std::collections::BTreeMap<NodePath, Vec<K>>,
    threshold: usize,
    order: TraversalOrder,
) -> Vec<Vec<BatchEntry<K>>> {
    let entries: Vec<BatchEntry<K>> = match order {
        TraversalOrder::Forward => targets
            .iter()
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect(),
        TraversalOrder::Reverse => targets
            .iter()
            .rev()
            .map(|(p, v)| (p.clone(), v.clone()))
            .collect(),
    };

    let mut batches: Vec<Vec<BatchEntry<K>>> = entries
        .chunks(threshold)
        .map(|chunk| chunk.to_vec())
        .collect();
    adjust(&mut batches);
    batches.retain(|b| !b.is_empty());
    batches
}

/// Move variant groups that straddle exactly one batch boundary into the
/// later batch.
///
/// Both the base sets and batch membership are taken from the incoming
/// slicing: an entry moved across boundary `i` is not a candidate again at
/// boundary `i + 1`, so a group covering three or more original batches is
/// only partially merged.
fn adjust<K>(batches: &mut Vec<Vec<BatchEntry<K>>>) {
    let bases: Vec<BTreeSet<NodePath>> = batches
        .iter()
        .map(|batch| batch.iter().filter_map(|(p, _)| variant_base(p)).collect())
        .collect();

    let mut tagged: Vec<Vec<(usize, BatchEntry<K>)>> = batches
        .drain(..)
        .enumerate()
        .map(|(i, batch)| batch.into_iter().map(|e| (i, e)).collect())
        .collect();

    for i in 0..tagged.len().saturating_sub(1) {
        let straddling: Vec<&NodePath> = bases[i].intersection(&bases[i + 1]).collect();
        if straddling.is_empty() {
            continue;
        }
        let mut moved = Vec::new();
        let mut kept = Vec::new();
        for (origin, entry) in std::mem::take(&mut tagged[i]) {
            let belongs = origin == i
                && straddling
                    .iter()
                    .any(|base| entry.0.is_descendant_or_self(base));
            if belongs {
                moved.push((origin, entry));
            } else {
                kept.push((origin, entry));
            }
        }
        tagged[i] = kept;
        // Moved entries precede the later batch's own, preserving the
        // overall traversal order.
        moved.extend(tagged[i + 1].drain(..));
        tagged[i + 1] = moved;
    }

    *batches = tagged
        .into_iter()
        .map(|batch| batch.into_iter().map(|(_, e)| e).collect())
        .collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn path(s: &str) -> NodePath {
        NodePath::parse(s).unwrap()
    }

    fn targets(paths: &[&str]) -> BTreeMap<NodePath, Vec<u32>> {
        paths.iter().map(|p| (path(p), vec![0])).collect()
    }

    fn sizes<K>(batches: &[Vec<BatchEntry<K>>]) -> Vec<usize> {
        batches.iter().map(|b| b.len()).collect()
    }

    #[test]
    fn fixed_size_slicing() {
        let map: BTreeMap<NodePath, Vec<u32>> = (0..250)
            .map(|i| (path(&format!("/content/n{i:04}")), vec![0]))
            .collect();
        let batches = partition(&map, 100, TraversalOrder::Forward);
        assert_eq!(sizes(&batches), vec![100, 100, 50]);
        // Forward order: first entry of the first batch is the smallest path.
        assert_eq!(batches[0][0].0, path("/content/n0000"));
    }

    #[test]
    fn reverse_order_flips_traversal() {
        let map = targets(&["/a", "/b", "/c"]);
        let batches = partition(&map, 2, TraversalOrder::Reverse);
        assert_eq!(batches[0][0].0, path("/c"));
        assert_eq!(batches[1][0].0, path("/a"));
    }

    #[test]
    fn adjacent_variant_group_merges_forward() {
        // The doc/doc variant group straddles the 2-entry batch boundary.
        let map = targets(&[
            "/content/a",
            "/content/doc/doc",
            "/content/doc/doc/body",
            "/content/z",
        ]);
        let batches = partition(&map, 2, TraversalOrder::Forward);
        assert_eq!(sizes(&batches), vec![1, 3]);
        assert!(batches[1]
            .iter()
            .any(|(p, _)| *p == path("/content/doc/doc")));
        assert!(batches[1]
            .iter()
            .any(|(p, _)| *p == path("/content/doc/doc/body")));
    }

    #[test]
    fn group_spanning_three_batches_not_fully_merged() {
        // Five variant entries with threshold 2: the group covers original
        // batches 0, 1, and 2. An entry moved across one boundary is not a
        // candidate again, so the group still ends up split.
        let map = targets(&[
            "/content/doc/doc",
            "/content/doc/doc/a",
            "/content/doc/doc/b",
            "/content/doc/doc/c",
            "/content/doc/doc/d",
        ]);
        let batches = partition(&map, 2, TraversalOrder::Forward);
        let group_batches: BTreeSet<usize> = batches
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                b.iter()
                    .any(|(p, _)| p.is_descendant_or_self(&path("/content/doc/doc")))
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(sizes(&batches), vec![2, 3]);
        assert!(group_batches.len() > 1);
    }

    #[test]
    fn system_and_attic_are_their_own_bases() {
        assert_eq!(variant_base(&path("/system/migration")), Some(path("/system")));
        assert_eq!(variant_base(&path("/attic/old/doc")), Some(path("/attic")));
        assert_eq!(variant_base(&path("/content/plain")), None);
        // The base ends at the handle node, the first of the repeated pair.
        assert_eq!(
            variant_base(&path("/content/doc/doc/body")),
            Some(path("/content/doc"))
        );
    }

    #[test]
    fn non_adjacent_bases_do_not_merge() {
        // Base present in batches 0 and 2 but absent from batch 1: no
        // boundary straddles, so nothing moves.
        let entry = |p: &str| (path(p), vec![0u32]);
        let mut batches = vec![
            vec![entry("/content/doc/doc")],
            vec![entry("/content/other")],
            vec![entry("/content/doc/doc/tail")],
        ];
        adjust(&mut batches);
        assert_eq!(sizes(&batches), vec![1, 1, 1]);
    }
}
