//! Structural application of a [Transformation] to a loop tree, checking each
//! transformation's local preconditions. Dataflow legality is checked by the caller.

use super::{
    ancestor_loops, children_at_mut, find_leaf_path, find_loop_path, loop_at, loop_at_mut,
    loop_names, LoopNode, LoopTags, Node,
};
use crate::expr::{Affine, AffineForm};
use crate::program::Program;
use crate::scheduling::{ApplyError, Transformation};
use crate::utils::fresh_name;

use divrem::DivCeil;
use std::collections::{HashMap, HashSet};

pub(super) fn apply(
    roots: &mut Vec<Node>,
    program: &Program,
    transformation: &Transformation,
) -> Result<(), ApplyError> {
    match transformation {
        Transformation::Tile { dim, factor } => {
            let mut taken = loop_names(roots);
            let node = named_loop_mut(roots, dim)?;
            if node.is_tagged() {
                return Err(transformation.not_applicable("loop is already tagged"));
            }
            let (lower, extent) = splittable(node, transformation)?;
            let factor = i64::from(*factor);
            if factor <= 1 || factor >= extent {
                return Err(transformation.not_applicable(format!(
                    "factor must be between 2 and {}",
                    extent - 1
                )));
            }
            split(node, lower, extent, factor, &mut taken);
            Ok(())
        }
        Transformation::Interchange { first, second } => interchange(roots, first, second, transformation),
        Transformation::Fuse { first, second, dim } => {
            fuse(roots, program, first, second, dim, transformation)
        }
        Transformation::Unroll { dim, factor } => {
            let mut taken = loop_names(roots);
            let node = named_loop_mut(roots, dim)?;
            if node.is_tagged() {
                return Err(transformation.not_applicable("loop is already tagged"));
            }
            let extent = (node.upper.clone() - node.lower.clone())
                .as_constant()
                .ok_or_else(|| transformation.not_applicable("extent is not constant"))?;
            let factor = i64::from(*factor);
            if factor <= 1 || factor > extent {
                return Err(
                    transformation.not_applicable(format!("factor must be between 2 and {extent}"))
                );
            }
            if factor == extent {
                node.tags.unroll = Some(factor as u32);
            } else {
                let (lower, extent) = splittable(node, transformation)?;
                split(node, lower, extent, factor, &mut taken).tags.unroll = Some(factor as u32);
            }
            Ok(())
        }
        Transformation::Parallelize { dim } => {
            let path = find_loop_path(roots, dim)
                .ok_or_else(|| ApplyError::UnknownLoop(dim.clone()))?;
            if ancestor_loops(roots, &path).iter().any(|l| l.tags.parallel) {
                return Err(transformation.not_applicable("an enclosing loop is parallel"));
            }
            let node = loop_at_mut(roots, &path).ok_or_else(|| ApplyError::UnknownLoop(dim.clone()))?;
            if node.tags.parallel {
                return Err(transformation.not_applicable("loop is already parallel"));
            }
            if node.tags.vectorize.is_some() {
                return Err(transformation.not_applicable("loop is vectorized"));
            }
            let mut nested_parallel = false;
            super::visit_loops(&node.children, 0, &mut |_, l| nested_parallel |= l.tags.parallel);
            if nested_parallel {
                return Err(transformation.not_applicable("an enclosed loop is parallel"));
            }
            node.tags.parallel = true;
            Ok(())
        }
        Transformation::Vectorize { dim, factor } => {
            let mut taken = loop_names(roots);
            let node = named_loop_mut(roots, dim)?;
            if !node.is_innermost() {
                return Err(transformation.not_applicable("loop is not innermost"));
            }
            if node.is_tagged() {
                return Err(transformation.not_applicable("loop is already tagged"));
            }
            // A remainder tile keeps its clamp; its unclamped extent is the vector width.
            let extent = (node.upper.clone() - node.lower.clone())
                .as_constant()
                .ok_or_else(|| transformation.not_applicable("extent is not constant"))?;
            let factor = i64::from(*factor);
            if factor <= 1 || factor > extent {
                return Err(
                    transformation.not_applicable(format!("width must be between 2 and {extent}"))
                );
            }
            if factor == extent {
                node.tags.vectorize = Some(factor as u32);
            } else {
                let (lower, extent) = splittable(node, transformation)?;
                split(node, lower, extent, factor, &mut taken).tags.vectorize = Some(factor as u32);
            }
            Ok(())
        }
    }
}

fn named_loop_mut<'a>(roots: &'a mut [Node], dim: &str) -> Result<&'a mut LoopNode, ApplyError> {
    let path = find_loop_path(roots, dim).ok_or_else(|| ApplyError::UnknownLoop(dim.to_owned()))?;
    loop_at_mut(roots, &path).ok_or_else(|| ApplyError::UnknownLoop(dim.to_owned()))
}

/// Returns the constant lower bound and extent of a loop that can be split.
fn splittable(node: &LoopNode, transformation: &Transformation) -> Result<(i64, i64), ApplyError> {
    if node.clamp.is_some() {
        return Err(transformation.not_applicable("loop is a remainder tile"));
    }
    let lower = node
        .lower
        .as_constant()
        .ok_or_else(|| transformation.not_applicable("lower bound is not constant"))?;
    let extent = node
        .constant_extent()
        .ok_or_else(|| transformation.not_applicable("extent is not constant"))?;
    Ok((lower, extent))
}

/// Splits `node` in place into an outer loop over tiles and an inner loop of
/// `factor` iterations, clamping the inner loop when `factor` does not divide
/// `extent`. Returns the inner loop.
fn split<'a>(
    node: &'a mut LoopNode,
    lower: i64,
    extent: i64,
    factor: i64,
    taken: &mut HashSet<String>,
) -> &'a mut LoopNode {
    let outer = fresh_name(&format!("{}0", node.dim), taken);
    taken.insert(outer.clone());
    let inner = fresh_name(&format!("{}1", node.dim), taken);
    taken.insert(inner.clone());

    let replacement =
        AffineForm::var(outer.clone()) * factor + AffineForm::var(inner.clone()) + lower;
    let mut body = std::mem::take(&mut node.children);
    substitute(&mut body, &mut |v| {
        if v == node.dim {
            replacement.clone()
        } else {
            AffineForm::var(v)
        }
    });

    let clamp = (extent % factor != 0)
        .then(|| AffineForm::constant(extent) - AffineForm::var(outer.clone()) * factor);
    node.dim = outer;
    node.lower = AffineForm::zero();
    node.upper = AffineForm::constant(<i64 as DivCeil>::div_ceil(extent, factor));
    node.children = vec![Node::Loop(LoopNode {
        dim: inner,
        lower: AffineForm::zero(),
        upper: AffineForm::constant(factor),
        clamp,
        tags: LoopTags::default(),
        children: body,
    })];
    match &mut node.children[0] {
        Node::Loop(inner) => inner,
        Node::Leaf(_) => unreachable!(),
    }
}

/// Rewrites every loop variable reference in `nodes`.
fn substitute(nodes: &mut [Node], mapper: &mut impl FnMut(String) -> Affine) {
    fn rewrite(form: &mut Affine, mapper: &mut impl FnMut(String) -> Affine) {
        let old = std::mem::replace(form, AffineForm::zero());
        *form = old.map_vars(mapper);
    }
    for node in nodes {
        match node {
            Node::Loop(l) => {
                rewrite(&mut l.lower, mapper);
                rewrite(&mut l.upper, mapper);
                if let Some(clamp) = &mut l.clamp {
                    rewrite(clamp, mapper);
                }
                substitute(&mut l.children, mapper);
            }
            Node::Leaf(leaf) => leaf.bindings.iter_mut().for_each(|b| rewrite(b, mapper)),
        }
    }
}

fn interchange(
    roots: &mut [Node],
    first: &str,
    second: &str,
    transformation: &Transformation,
) -> Result<(), ApplyError> {
    let first_path =
        find_loop_path(roots, first).ok_or_else(|| ApplyError::UnknownLoop(first.to_owned()))?;
    let second_path =
        find_loop_path(roots, second).ok_or_else(|| ApplyError::UnknownLoop(second.to_owned()))?;
    let (outer_path, inner_path) = if second_path.len() > first_path.len()
        && second_path.starts_with(&first_path)
    {
        (first_path, second_path)
    } else if first_path.len() > second_path.len() && first_path.starts_with(&second_path) {
        (second_path, first_path)
    } else {
        return Err(transformation.not_applicable("loops are not nested"));
    };

    let chain = (outer_path.len()..=inner_path.len())
        .map(|len| loop_at(roots, &inner_path[..len]))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| transformation.not_applicable("loops are not nested"))?;
    let (inner, above) = chain
        .split_last()
        .ok_or_else(|| transformation.not_applicable("loops are not nested"))?;
    let outer = above[0];
    if above.iter().any(|l| l.children.len() != 1) {
        return Err(transformation.not_applicable("loops are not perfectly nested"));
    }
    if outer.is_tagged() || inner.is_tagged() {
        return Err(transformation.not_applicable("loop is tagged"));
    }
    for l in above {
        if inner.bound_forms().any(|f| f.references(&l.dim)) {
            return Err(transformation.not_applicable(format!(
                "bounds of `{}` depend on `{}`",
                inner.dim, l.dim
            )));
        }
    }
    for mid in &above[1..] {
        if mid.bound_forms().any(|f| f.references(&outer.dim)) {
            return Err(transformation.not_applicable(format!(
                "bounds of `{}` depend on `{}`",
                mid.dim, outer.dim
            )));
        }
    }

    let outer_header = Header::of(outer);
    let inner_header = Header::of(inner);
    if let Some(l) = loop_at_mut(roots, &outer_path) {
        inner_header.install(l);
    }
    if let Some(l) = loop_at_mut(roots, &inner_path) {
        outer_header.install(l);
    }
    Ok(())
}

/// Everything about a loop except its body.
struct Header {
    dim: String,
    lower: Affine,
    upper: Affine,
    clamp: Option<Affine>,
    tags: LoopTags,
}

impl Header {
    fn of(l: &LoopNode) -> Self {
        Header {
            dim: l.dim.clone(),
            lower: l.lower.clone(),
            upper: l.upper.clone(),
            clamp: l.clamp.clone(),
            tags: l.tags,
        }
    }

    fn install(self, l: &mut LoopNode) {
        l.dim = self.dim;
        l.lower = self.lower;
        l.upper = self.upper;
        l.clamp = self.clamp;
        l.tags = self.tags;
    }
}

/// Moves the branch holding `second` so that it shares the loops enclosing `first`
/// down to and including `dim`, executing right after `first`'s branch.
fn fuse(
    roots: &mut Vec<Node>,
    program: &Program,
    first: &str,
    second: &str,
    dim: &str,
    transformation: &Transformation,
) -> Result<(), ApplyError> {
    let unknown = |name: &str| ApplyError::UnknownComputation(name.to_owned());
    let a = program.computation_index(first).ok_or_else(|| unknown(first))?;
    let b = program.computation_index(second).ok_or_else(|| unknown(second))?;
    if a == b {
        return Err(transformation.not_applicable("a computation cannot be fused with itself"));
    }
    let a_path = find_leaf_path(roots, a).ok_or_else(|| unknown(first))?;
    let b_path = find_leaf_path(roots, b).ok_or_else(|| unknown(second))?;
    let dim_path =
        find_loop_path(roots, dim).ok_or_else(|| ApplyError::UnknownLoop(dim.to_owned()))?;
    if !(a_path.len() > dim_path.len() && a_path.starts_with(&dim_path)) {
        return Err(transformation.not_applicable(format!("`{dim}` does not enclose `{first}`")));
    }
    let level = dim_path.len() - 1;
    if b_path.len() < level + 2 {
        return Err(transformation.not_applicable(format!(
            "`{second}` has fewer than {} enclosing loops",
            level + 1
        )));
    }
    let Some(diverge) = (0..=level).find(|&d| a_path[..=d] != b_path[..=d]) else {
        return Err(transformation.not_applicable("computations already share these loops"));
    };

    let a_loops = ancestor_loops(roots, &a_path);
    let b_loops = ancestor_loops(roots, &b_path);
    let rename: HashMap<String, String> = (diverge..=level)
        .map(|d| (b_loops[d].dim.clone(), a_loops[d].dim.clone()))
        .collect();
    let mut renamer = |v: String| AffineForm::var(rename.get(&v).cloned().unwrap_or(v));
    for d in diverge..=level {
        let (al, bl) = (a_loops[d], b_loops[d]);
        if al.is_tagged() || bl.is_tagged() {
            return Err(transformation.not_applicable("loop is tagged"));
        }
        let same = bl.lower.clone().map_vars(&mut renamer) == al.lower
            && bl.upper.clone().map_vars(&mut renamer) == al.upper
            && bl.clamp.clone().map(|c| c.map_vars(&mut renamer)) == al.clamp;
        if !same {
            return Err(transformation.not_applicable(format!(
                "bounds of `{}` and `{}` differ",
                al.dim, bl.dim
            )));
        }
    }

    // Detach the branch of `second` below `level` and prune loops it leaves empty.
    let branch_path = &b_path[..level + 2];
    let mut branch = match children_at_mut(roots, &branch_path[..level + 1]) {
        Some(siblings) => siblings.remove(branch_path[level + 1]),
        None => return Err(unknown(second)),
    };
    substitute(std::slice::from_mut(&mut branch), &mut renamer);
    for len in (diverge + 1..=level + 1).rev() {
        let empty = loop_at(roots, &b_path[..len]).map_or(false, |l| l.children.is_empty());
        if !empty {
            break;
        }
        if let Some(siblings) = children_at_mut(roots, &b_path[..len - 1]) {
            siblings.remove(b_path[len - 1]);
        }
    }

    let a_path = find_leaf_path(roots, a).ok_or_else(|| unknown(first))?;
    match children_at_mut(roots, &a_path[..level + 1]) {
        Some(siblings) => siblings.insert(a_path[level + 1] + 1, branch),
        None => return Err(unknown(first)),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::tests::tree_of;
    use super::super::SyntaxTree;
    use crate::program::{library, ComputationDesc, ExprDesc, ProgramDesc};
    use crate::scheduling::{ApplyError, Transformation};
    use crate::common::{BufferKind, Dtype};

    fn tile(dim: &str, factor: u32) -> Transformation {
        Transformation::Tile {
            dim: dim.into(),
            factor,
        }
    }

    fn interchange(first: &str, second: &str) -> Transformation {
        Transformation::Interchange {
            first: first.into(),
            second: second.into(),
        }
    }

    fn fuse(first: &str, second: &str, dim: &str) -> Transformation {
        Transformation::Fuse {
            first: first.into(),
            second: second.into(),
            dim: dim.into(),
        }
    }

    fn single_loop(n: i64) -> SyntaxTree {
        tree_of(
            ProgramDesc::new("copy")
                .param("N", n)
                .buffer("a", &["N"], Dtype::Float64, BufferKind::Input)
                .buffer("b", &["N"], Dtype::Float64, BufferKind::Output)
                .computation(
                    ComputationDesc::new("S")
                        .iter("i", "0", "N")
                        .store("b", &["i"])
                        .expr(ExprDesc::load("a", &["i"])),
                ),
        )
    }

    #[test]
    fn test_tile_40_by_8() {
        let tree = single_loop(40).derive(&tile("i", 8)).unwrap();
        assert_eq!(
            tree.to_string(),
            "for i0 in [0, 5)\n  for i1 in [0, 8)\n    S(i=8*i0 + i1)\n"
        );
        assert_eq!(tree.find_loop("i0").unwrap().constant_extent(), Some(5));
        assert_eq!(tree.find_loop("i1").unwrap().constant_extent(), Some(8));
        assert_eq!(tree.computation_counts(), vec![1]);
    }

    #[test]
    fn test_uneven_tile_clamps_remainder() {
        let tree = single_loop(42).derive(&tile("i", 8)).unwrap();
        assert_eq!(
            tree.to_string(),
            "for i0 in [0, 6)\n  for i1 in [0, min(8, -8*i0 + 42))\n    S(i=8*i0 + i1)\n"
        );
        assert!(tree.is_legal());
        assert!(matches!(
            tree.derive(&tile("i1", 2)),
            Err(ApplyError::NotApplicable { .. })
        ));
    }

    #[test]
    fn test_vectorize_remainder_tile_at_full_width() {
        let tree = single_loop(42).derive(&tile("i", 8)).unwrap();
        let vec = tree
            .derive(&Transformation::Vectorize {
                dim: "i1".into(),
                factor: 8,
            })
            .unwrap();
        assert_eq!(
            vec.to_string(),
            "for i0 in [0, 6)\n  for i1 in [0, min(8, -8*i0 + 42)) vectorize(8)\n    S(i=8*i0 + i1)\n"
        );
        assert!(vec.is_legal());
        // Narrower widths would split the remainder tile.
        assert!(matches!(
            tree.derive(&Transformation::Vectorize {
                dim: "i1".into(),
                factor: 4,
            }),
            Err(ApplyError::NotApplicable { .. })
        ));
    }

    #[test]
    fn test_tile_rejects_bad_factors() {
        let tree = single_loop(16);
        for factor in [0, 1, 16, 32] {
            assert!(matches!(
                tree.derive(&tile("i", factor)),
                Err(ApplyError::NotApplicable { .. })
            ));
        }
        assert_eq!(
            tree.derive(&tile("q", 4)).unwrap_err(),
            ApplyError::UnknownLoop("q".into())
        );
    }

    #[test]
    fn test_interchange_swaps_headers() {
        let tree = tree_of(library::matmul(8));
        let swapped = tree.derive(&interchange("k", "j_1")).unwrap();
        assert!(swapped
            .to_string()
            .contains("for i_1 in [0, 8)\n  for k in [0, 8)\n    for j_1 in [0, 8)\n      acc(i=i_1, j=j_1, k)\n"));
    }

    #[test]
    fn test_interchange_rejects_bounds_depending_on_outer_loop() {
        let tree = tree_of(
            ProgramDesc::new("lower_triangle")
                .param("N", 8)
                .buffer("a", &["N", "N"], Dtype::Float64, BufferKind::Output)
                .computation(
                    ComputationDesc::new("S")
                        .iter("i", "0", "N")
                        .iter("j", "0", "i")
                        .store("a", &["i", "j"])
                        .expr(ExprDesc::constant(1.0)),
                ),
        );
        let err = tree.derive(&interchange("i", "j")).unwrap_err();
        assert!(matches!(err, ApplyError::NotApplicable { .. }), "{err}");
    }

    #[test]
    fn test_interchange_rejects_imperfect_nest() {
        let tree = tree_of(library::cholesky(6));
        assert!(tree.derive(&interchange("j_1", "k")).is_err());
        assert!(tree.derive(&interchange("i", "k")).is_err());
    }

    #[test]
    fn test_fuse_producer_consumer() {
        let tree = tree_of(library::producer_consumer(16));
        let fused = tree.derive(&fuse("produce", "consume", "i")).unwrap();
        assert_eq!(
            fused.to_string(),
            "for i in [0, 16)\n  produce(i)\n  consume(i)\n"
        );
        assert_eq!(fused.computation_counts(), vec![1, 1]);
        assert!(matches!(
            fused.derive(&fuse("produce", "consume", "i")),
            Err(ApplyError::NotApplicable { .. })
        ));
    }

    #[test]
    fn test_fuse_requires_matching_bounds() {
        let tree = tree_of(library::blur(10));
        let err = tree.derive(&fuse("blur_x", "blur_y", "i")).unwrap_err();
        assert!(matches!(err, ApplyError::NotApplicable { .. }), "{err}");
    }

    #[test]
    fn test_unroll_full_and_partial() {
        let tree = single_loop(16);
        let full = tree
            .derive(&Transformation::Unroll {
                dim: "i".into(),
                factor: 16,
            })
            .unwrap();
        assert_eq!(full.to_string(), "for i in [0, 16) unroll(16)\n  S(i)\n");
        let partial = tree
            .derive(&Transformation::Unroll {
                dim: "i".into(),
                factor: 4,
            })
            .unwrap();
        assert_eq!(
            partial.to_string(),
            "for i0 in [0, 4)\n  for i1 in [0, 4) unroll(4)\n    S(i=4*i0 + i1)\n"
        );
    }

    #[test]
    fn test_parallelize_once_per_path() {
        let tree = tree_of(library::matmul(8));
        let par = tree
            .derive(&Transformation::Parallelize { dim: "i_1".into() })
            .unwrap();
        assert!(par
            .derive(&Transformation::Parallelize { dim: "j_1".into() })
            .is_err());
        assert!(par
            .derive(&Transformation::Parallelize { dim: "i".into() })
            .is_ok());
    }

    #[test]
    fn test_vectorize_requires_innermost() {
        let tree = tree_of(library::matmul(16));
        assert!(tree
            .derive(&Transformation::Vectorize {
                dim: "i".into(),
                factor: 4
            })
            .is_err());
        let vec = tree
            .derive(&Transformation::Vectorize {
                dim: "j".into(),
                factor: 4,
            })
            .unwrap();
        assert!(vec.to_string().contains("for j1 in [0, 4) vectorize(4)\n"));
    }
}
