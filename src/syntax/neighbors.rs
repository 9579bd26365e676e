use super::{ancestor_loops, find_leaf_path, LoopNode, Node, SyntaxTree};
use crate::scheduling::Transformation;

use log::trace;
use rayon::prelude::*;

const TILE_FACTORS: [u32; 6] = [2, 4, 8, 16, 32, 64];
const UNROLL_FACTORS: [u32; 4] = [2, 4, 8, 16];
const VECTOR_WIDTHS: [u32; 3] = [4, 8, 16];

impl SyntaxTree {
    /// Every transformation the candidate generator proposes for this tree, in a
    /// fixed order. Proposals are not checked; most are filtered by
    /// [SyntaxTree::derive].
    pub fn candidate_transformations(&self) -> Vec<Transformation> {
        let mut candidates = vec![];
        propose_loop_transformations(&self.roots, false, &mut candidates);
        propose_fusions(self, &self.roots, &[], &mut candidates);
        candidates
    }

    /// Lazily derives every legal tree one transformation away from this one.
    ///
    /// Each call yields fresh, unevaluated trees.
    pub fn neighbors(&self) -> impl Iterator<Item = SyntaxTree> + '_ {
        self.candidate_transformations()
            .into_iter()
            .filter_map(move |t| self.derive_or_trace(&t))
    }

    /// Like [SyntaxTree::neighbors], but derives candidates in parallel. Order
    /// matches [SyntaxTree::neighbors].
    pub fn par_neighbors(&self) -> Vec<SyntaxTree> {
        self.candidate_transformations()
            .into_par_iter()
            .filter_map(|t| self.derive_or_trace(&t))
            .collect()
    }

    fn derive_or_trace(&self, transformation: &Transformation) -> Option<SyntaxTree> {
        match self.derive(transformation) {
            Ok(tree) => Some(tree),
            Err(e) => {
                trace!("Skipping {}: {}", transformation, e);
                None
            }
        }
    }
}

fn propose_loop_transformations(
    nodes: &[Node],
    parallel_above: bool,
    out: &mut Vec<Transformation>,
) {
    for node in nodes {
        let Node::Loop(l) = node else {
            continue;
        };
        let dim = &l.dim;
        let extent = l.constant_extent();
        let untagged = !l.is_tagged();

        if let (true, Some(extent), Some(_)) = (untagged, extent, l.lower.as_constant()) {
            for factor in TILE_FACTORS.into_iter().filter(|&f| i64::from(f) < extent) {
                out.push(Transformation::Tile {
                    dim: dim.clone(),
                    factor,
                });
            }
        }

        if untagged {
            let mut inner = l;
            while let [Node::Loop(child)] = inner.children.as_slice() {
                if !child.is_tagged() {
                    out.push(Transformation::Interchange {
                        first: dim.clone(),
                        second: child.dim.clone(),
                    });
                }
                inner = child;
            }
        }

        if untagged && l.is_innermost() {
            if let Some(extent) = extent {
                for factor in UNROLL_FACTORS.into_iter().filter(|&f| i64::from(f) <= extent) {
                    out.push(Transformation::Unroll {
                        dim: dim.clone(),
                        factor,
                    });
                }
                for factor in VECTOR_WIDTHS.into_iter().filter(|&f| i64::from(f) <= extent) {
                    out.push(Transformation::Vectorize {
                        dim: dim.clone(),
                        factor,
                    });
                }
            }
        }

        if !parallel_above && !l.tags.parallel && l.tags.vectorize.is_none() && !has_parallel(l) {
            out.push(Transformation::Parallelize { dim: dim.clone() });
        }

        propose_loop_transformations(&l.children, parallel_above || l.tags.parallel, out);
    }
}

fn has_parallel(l: &LoopNode) -> bool {
    l.children
        .iter()
        .any(|c| matches!(c, Node::Loop(inner) if inner.tags.parallel || has_parallel(inner)))
}

/// Proposes fusing each pair of consecutive sibling nests at every depth they could
/// share: the last computation of the first nest with the first of the second.
fn propose_fusions(
    tree: &SyntaxTree,
    siblings: &[Node],
    parent_path: &[usize],
    out: &mut Vec<Transformation>,
) {
    let program = tree.program();
    for pair in siblings.windows(2) {
        let (Node::Loop(left), Node::Loop(right)) = (&pair[0], &pair[1]) else {
            continue;
        };
        let (Some(first), Some(second)) = (last_leaf(left), first_leaf(right)) else {
            continue;
        };
        let Some(first_path) = find_leaf_path(&tree.roots, first) else {
            continue;
        };
        let Some(second_path) = find_leaf_path(&tree.roots, second) else {
            continue;
        };
        let shared_depth = (first_path.len() - 1).min(second_path.len() - 1);
        let first_loops = ancestor_loops(&tree.roots, &first_path);
        for depth in parent_path.len()..shared_depth {
            out.push(Transformation::Fuse {
                first: program.computations()[first].name.clone(),
                second: program.computations()[second].name.clone(),
                dim: first_loops[depth].dim.clone(),
            });
        }
    }
    for (idx, node) in siblings.iter().enumerate() {
        if let Node::Loop(l) = node {
            let mut path = parent_path.to_vec();
            path.push(idx);
            propose_fusions(tree, &l.children, &path, out);
        }
    }
}

fn first_leaf(l: &LoopNode) -> Option<usize> {
    l.children.iter().find_map(|c| match c {
        Node::Leaf(leaf) => Some(leaf.computation),
        Node::Loop(inner) => first_leaf(inner),
    })
}

fn last_leaf(l: &LoopNode) -> Option<usize> {
    l.children.iter().rev().find_map(|c| match c {
        Node::Leaf(leaf) => Some(leaf.computation),
        Node::Loop(inner) => last_leaf(inner),
    })
}

#[cfg(test)]
mod tests {
    use super::super::tests::tree_of;
    use super::*;
    use crate::program::library;

    #[test]
    fn test_neighbors_are_legal_and_one_step_away() {
        let tree = tree_of(library::two_mm(8));
        let neighbors = tree.neighbors().collect::<Vec<_>>();
        assert!(!neighbors.is_empty());
        for n in &neighbors {
            assert_eq!(n.depth(), 1);
            assert!(n.is_legal());
            assert!(!n.is_evaluated());
            assert_eq!(n.computation_counts(), vec![1; 4]);
        }
        let par = tree.par_neighbors();
        assert_eq!(
            par.iter().map(|t| t.schedule()).collect::<Vec<_>>(),
            neighbors.iter().map(|t| t.schedule()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_every_kind_conserves_computations() {
        let tree = tree_of(library::matmul(16));
        let mut kinds = std::collections::HashSet::new();
        for n in tree.neighbors() {
            assert_eq!(n.computation_counts(), vec![1, 1], "{}", n.schedule());
            kinds.insert(n.transformations()[0].keyword());
        }
        for kw in ["tile", "interchange", "fuse", "unroll", "parallelize", "vectorize"] {
            assert!(kinds.contains(kw), "no legal {kw} neighbor");
        }
    }

    #[test]
    fn test_candidates_include_every_kind() {
        let tree = tree_of(library::producer_consumer(32));
        let kinds = tree
            .candidate_transformations()
            .iter()
            .map(Transformation::keyword)
            .collect::<std::collections::HashSet<_>>();
        for kw in ["tile", "unroll", "vectorize", "parallelize", "fuse"] {
            assert!(kinds.contains(kw), "missing {kw}");
        }
        let matmul = tree_of(library::matmul(32));
        assert!(matmul
            .candidate_transformations()
            .contains(&Transformation::Interchange {
                first: "j_1".into(),
                second: "k".into()
            }));
    }

    #[test]
    fn test_fusion_is_proposed_for_producer_consumer() {
        let tree = tree_of(library::producer_consumer(32));
        let fused = tree
            .neighbors()
            .find(|t| matches!(t.transformations()[0], Transformation::Fuse { .. }))
            .unwrap();
        assert_eq!(fused.roots().len(), 1);
    }
}
