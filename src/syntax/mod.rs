//! The search-space node: a loop tree over a program's computations, the
//! transformations applied to reach it, and an evaluation slot.
//!
//! Trees are values. [SyntaxTree::derive] copies a tree, applies one
//! [Transformation] to the copy, and re-verifies the whole copy against the
//! program's dataflow before handing it back; the source tree is never mutated.

mod apply;
mod neighbors;

use crate::datadeps::{DependenceOracle, LegalityError};
use crate::expr::{Affine, AffineForm};
use crate::lowering::LoweredKernel;
use crate::program::Program;
use crate::scheduling::{ApplyError, Schedule, Transformation};
use crate::utils::{fresh_name, indent};

use itertools::Itertools;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Session-wide, read-only state shared by every tree of a scheduling session.
pub struct ProgramContext {
    program: Program,
    oracle: OnceLock<Result<DependenceOracle, LegalityError>>,
}

#[derive(Clone)]
pub struct SyntaxTree {
    context: Arc<ProgramContext>,
    roots: Vec<Node>,
    transformations: Vec<Transformation>,
    evaluation: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Loop(LoopNode),
    Leaf(Leaf),
}

/// A loop `for dim in [lower, min(upper, clamp))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopNode {
    pub dim: String,
    pub lower: Affine,
    pub upper: Affine,
    /// A second exclusive upper bound, introduced for the remainder of an uneven tile.
    pub clamp: Option<Affine>,
    pub tags: LoopTags,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LoopTags {
    pub parallel: bool,
    pub vectorize: Option<u32>,
    pub unroll: Option<u32>,
}

/// One computation, executed at every point of its enclosing loops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leaf {
    pub computation: usize,
    /// The value of each of the computation's iterators, in domain order, as an
    /// affine form over the enclosing loop variables.
    pub bindings: Vec<Affine>,
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tree has not been evaluated")]
pub struct NotEvaluated;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("tree already carries an evaluation")]
pub struct AlreadyEvaluated;

impl ProgramContext {
    pub fn new(program: Program) -> Arc<Self> {
        Arc::new(ProgramContext {
            program,
            oracle: OnceLock::new(),
        })
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The dataflow of the program's initial nesting, computed on first use.
    pub(crate) fn oracle(&self) -> Result<&DependenceOracle, LegalityError> {
        self.oracle
            .get_or_init(|| {
                let roots = initial_roots(&self.program);
                let kernel = LoweredKernel::compile(&self.program, &roots)?;
                let oracle = DependenceOracle::build(&self.program, &kernel)?;
                debug!(
                    "Recorded dataflow of {} statement instances in {}",
                    oracle.instance_count(),
                    self.program.name()
                );
                Ok(oracle)
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

impl fmt::Debug for ProgramContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramContext")
            .field("program", &self.program.name())
            .finish_non_exhaustive()
    }
}

impl SyntaxTree {
    /// The tree of the program's initial nesting, with no transformations applied.
    pub fn initial(context: Arc<ProgramContext>) -> Self {
        let roots = initial_roots(context.program());
        SyntaxTree {
            context,
            roots,
            transformations: vec![],
            evaluation: None,
        }
    }

    pub fn from_program(program: Program) -> Self {
        SyntaxTree::initial(ProgramContext::new(program))
    }

    /// Rebuilds a tree by applying `schedule` to the initial tree of `context`.
    pub fn replay(context: Arc<ProgramContext>, schedule: &Schedule) -> Result<Self, ApplyError> {
        schedule
            .iter()
            .try_fold(SyntaxTree::initial(context), |tree, t| tree.derive(t))
    }

    pub fn context(&self) -> &Arc<ProgramContext> {
        &self.context
    }

    pub fn program(&self) -> &Program {
        self.context.program()
    }

    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    pub fn transformations(&self) -> &[Transformation] {
        &self.transformations
    }

    pub fn schedule(&self) -> Schedule {
        Schedule(self.transformations.clone())
    }

    /// The number of transformations applied since the initial tree.
    pub fn depth(&self) -> usize {
        self.transformations.len()
    }

    pub fn evaluation(&self) -> Result<f64, NotEvaluated> {
        self.evaluation.ok_or(NotEvaluated)
    }

    pub fn is_evaluated(&self) -> bool {
        self.evaluation.is_some()
    }

    pub fn set_evaluation(&mut self, evaluation: f64) -> Result<(), AlreadyEvaluated> {
        if self.evaluation.is_some() {
            return Err(AlreadyEvaluated);
        }
        self.evaluation = Some(evaluation);
        Ok(())
    }

    /// Returns a new tree with `transformation` applied.
    ///
    /// Fails if the transformation's preconditions do not hold on this tree or if
    /// the result changes the program's dataflow. The result is unevaluated.
    pub fn derive(&self, transformation: &Transformation) -> Result<SyntaxTree, ApplyError> {
        let mut roots = self.roots.clone();
        apply::apply(&mut roots, self.program(), transformation)?;
        let mut transformations = Vec::with_capacity(self.transformations.len() + 1);
        transformations.extend_from_slice(&self.transformations);
        transformations.push(transformation.clone());
        let derived = SyntaxTree {
            context: Arc::clone(&self.context),
            roots,
            transformations,
            evaluation: None,
        };
        derived.check_legality()?;
        Ok(derived)
    }

    pub fn is_legal(&self) -> bool {
        self.check_legality().is_ok()
    }

    /// Re-verifies the whole tree: every original instance runs exactly once, reads
    /// observe their original producers, buffers end with their original final
    /// writers, and concurrent loops have no conflicting iterations.
    pub fn check_legality(&self) -> Result<(), LegalityError> {
        let oracle = self.context.oracle()?;
        let kernel = self.lower()?;
        oracle.check(self.program(), &kernel)
    }

    pub(crate) fn lower(&self) -> Result<LoweredKernel, crate::lowering::LoweringError> {
        LoweredKernel::compile(self.program(), &self.roots)
    }

    /// Every loop in the tree with its depth, in pre-order.
    pub fn loops(&self) -> Vec<(usize, &LoopNode)> {
        let mut loops = vec![];
        visit_loops(&self.roots, 0, &mut |depth, l| loops.push((depth, l)));
        loops
    }

    pub fn find_loop(&self, dim: &str) -> Option<&LoopNode> {
        let path = find_loop_path(&self.roots, dim)?;
        match node_at(&self.roots, &path) {
            Some(Node::Loop(l)) => Some(l),
            _ => None,
        }
    }

    /// Leaves in execution order.
    pub fn leaves(&self) -> Vec<&Leaf> {
        fn collect<'a>(nodes: &'a [Node], out: &mut Vec<&'a Leaf>) {
            for node in nodes {
                match node {
                    Node::Loop(l) => collect(&l.children, out),
                    Node::Leaf(leaf) => out.push(leaf),
                }
            }
        }
        let mut out = vec![];
        collect(&self.roots, &mut out);
        out
    }

    /// The number of leaves per computation, indexed like the program's computations.
    pub fn computation_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.program().computations().len()];
        for leaf in self.leaves() {
            counts[leaf.computation] += 1;
        }
        counts
    }

    /// A string identifying the loop structure (not the history) of this tree.
    pub fn structure_key(&self) -> String {
        self.to_string()
    }

    /// Prints the loop nest as a table to stdout.
    pub fn print_ast(&self) {
        crate::pprint::pprint_tree(self, crate::pprint::TreePrintStyle::Full);
    }
}

impl fmt::Debug for SyntaxTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntaxTree")
            .field("program", &self.program().name())
            .field("transformations", &self.transformations)
            .field("evaluation", &self.evaluation)
            .field("roots", &self.roots)
            .finish()
    }
}

/// One line per node, two spaces of indentation per level.
impl fmt::Display for SyntaxTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn go(
            program: &Program,
            nodes: &[Node],
            depth: usize,
            f: &mut fmt::Formatter<'_>,
        ) -> fmt::Result {
            for node in nodes {
                writeln!(f, "{}{}", indent(depth), node.header(program))?;
                if let Node::Loop(l) = node {
                    go(program, &l.children, depth + 1, f)?;
                }
            }
            Ok(())
        }
        go(self.program(), &self.roots, 0, f)
    }
}

impl Node {
    /// This node's line of the tree text, without indentation or children.
    pub fn header<'a>(&'a self, program: &'a Program) -> impl fmt::Display + 'a {
        NodeHeader {
            node: self,
            program,
        }
    }
}

struct NodeHeader<'a> {
    node: &'a Node,
    program: &'a Program,
}

impl fmt::Display for NodeHeader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node {
            Node::Loop(l) => {
                write!(f, "for {} in [{}, ", l.dim, l.lower)?;
                match &l.clamp {
                    Some(clamp) => write!(f, "min({}, {}))", l.upper, clamp)?,
                    None => write!(f, "{})", l.upper)?,
                }
                if l.tags.parallel {
                    write!(f, " parallel")?;
                }
                if let Some(width) = l.tags.vectorize {
                    write!(f, " vectorize({width})")?;
                }
                if let Some(factor) = l.tags.unroll {
                    write!(f, " unroll({factor})")?;
                }
                Ok(())
            }
            Node::Leaf(leaf) => {
                let comp = &self.program.computations()[leaf.computation];
                let bindings = comp
                    .iterator_names()
                    .zip(&leaf.bindings)
                    .map(|(it, binding)| {
                        if *binding == AffineForm::var(it.to_owned()) {
                            it.to_owned()
                        } else {
                            format!("{it}={binding}")
                        }
                    })
                    .join(", ");
                write!(f, "{}({})", comp.name, bindings)
            }
        }
    }
}

impl Leaf {
    /// Rewrites `form`, over the computation's iterators, as a form over the
    /// enclosing loop variables.
    pub fn over_loops(&self, program: &Program, form: &Affine) -> Affine {
        let comp = &program.computations()[self.computation];
        let names = comp.iterator_names().collect::<Vec<_>>();
        form.clone()
            .map_vars(&mut |it: String| match names.iter().position(|n| *n == it) {
                Some(pos) => self.bindings[pos].clone(),
                None => AffineForm::var(it),
            })
    }
}

impl LoopNode {
    /// The trip count when it does not depend on enclosing loops.
    pub fn constant_extent(&self) -> Option<i64> {
        if self.clamp.is_some() {
            return None;
        }
        (self.upper.clone() - self.lower.clone()).as_constant()
    }

    /// True if every child is a leaf.
    pub fn is_innermost(&self) -> bool {
        self.children.iter().all(|c| matches!(c, Node::Leaf(_)))
    }

    pub fn bound_forms(&self) -> impl Iterator<Item = &Affine> + '_ {
        [&self.lower, &self.upper].into_iter().chain(self.clamp.as_ref())
    }

    pub fn is_tagged(&self) -> bool {
        self.tags != LoopTags::default()
    }
}

/// Builds the initial nesting: one loop per iterator, each computation in its own
/// nest unless it shares its outermost loops with an earlier computation.
pub(crate) fn initial_roots(program: &Program) -> Vec<Node> {
    let mut roots: Vec<Node> = vec![];
    let mut taken: HashSet<String> = HashSet::new();
    for (idx, comp) in program.computations().iter().enumerate() {
        let mut rename: HashMap<&str, String> = HashMap::new();
        let mut parent_path: Vec<usize> = vec![];
        let mut shared = 0;
        if let Some((other, level)) = comp.after {
            if let Some(leaf_path) = find_leaf_path(&roots, other) {
                let ancestors = ancestor_loops(&roots, &leaf_path);
                shared = (level + 1).min(ancestors.len()).min(comp.depth());
                for (dim, anc) in comp.domain.iter().zip(&ancestors[..shared]) {
                    rename.insert(&dim.name, anc.dim.clone());
                }
                parent_path = leaf_path[..shared].to_vec();
            }
        }

        for dim in &comp.domain[shared..] {
            let name = fresh_name(&dim.name, &taken);
            taken.insert(name.clone());
            rename.insert(&dim.name, name);
        }
        let renamed = |form: &Affine| {
            form.clone().map_vars(&mut |v: String| {
                AffineForm::var(rename.get(v.as_str()).cloned().unwrap_or(v))
            })
        };

        let mut node = Node::Leaf(Leaf {
            computation: idx,
            bindings: comp
                .domain
                .iter()
                .map(|d| AffineForm::var(rename[d.name.as_str()].clone()))
                .collect(),
        });
        for dim in comp.domain[shared..].iter().rev() {
            node = Node::Loop(LoopNode {
                dim: rename[dim.name.as_str()].clone(),
                lower: renamed(&dim.lower),
                upper: renamed(&dim.upper),
                clamp: None,
                tags: LoopTags::default(),
                children: vec![node],
            });
        }
        match children_at_mut(&mut roots, &parent_path) {
            Some(siblings) => siblings.push(node),
            None => roots.push(node),
        }
    }
    roots
}

// Paths address nodes by child index at each depth, starting from the roots. A
// loop at depth `d` has a path of length `d + 1`.

pub(crate) fn node_at<'a>(roots: &'a [Node], path: &[usize]) -> Option<&'a Node> {
    let (&first, rest) = path.split_first()?;
    let mut node = roots.get(first)?;
    for &idx in rest {
        match node {
            Node::Loop(l) => node = l.children.get(idx)?,
            Node::Leaf(_) => return None,
        }
    }
    Some(node)
}

pub(crate) fn node_at_mut<'a>(roots: &'a mut [Node], path: &[usize]) -> Option<&'a mut Node> {
    let (&first, rest) = path.split_first()?;
    let mut node = roots.get_mut(first)?;
    for &idx in rest {
        match node {
            Node::Loop(l) => node = l.children.get_mut(idx)?,
            Node::Leaf(_) => return None,
        }
    }
    Some(node)
}

pub(crate) fn loop_at<'a>(roots: &'a [Node], path: &[usize]) -> Option<&'a LoopNode> {
    match node_at(roots, path)? {
        Node::Loop(l) => Some(l),
        Node::Leaf(_) => None,
    }
}

pub(crate) fn loop_at_mut<'a>(roots: &'a mut [Node], path: &[usize]) -> Option<&'a mut LoopNode> {
    match node_at_mut(roots, path)? {
        Node::Loop(l) => Some(l),
        Node::Leaf(_) => None,
    }
}

/// The children of the loop at `loop_path`, or the roots if the path is empty.
pub(crate) fn children_at_mut<'a>(
    roots: &'a mut Vec<Node>,
    loop_path: &[usize],
) -> Option<&'a mut Vec<Node>> {
    if loop_path.is_empty() {
        return Some(roots);
    }
    loop_at_mut(roots, loop_path).map(|l| &mut l.children)
}

/// The loops enclosing the node at `path`, outermost first.
pub(crate) fn ancestor_loops<'a>(roots: &'a [Node], path: &[usize]) -> Vec<&'a LoopNode> {
    (1..path.len())
        .filter_map(|len| loop_at(roots, &path[..len]))
        .collect()
}

pub(crate) fn find_loop_path(roots: &[Node], dim: &str) -> Option<Vec<usize>> {
    find_path(roots, &mut |n| matches!(n, Node::Loop(l) if l.dim == dim))
}

pub(crate) fn find_leaf_path(roots: &[Node], computation: usize) -> Option<Vec<usize>> {
    find_path(roots, &mut |n| matches!(n, Node::Leaf(l) if l.computation == computation))
}

fn find_path(roots: &[Node], pred: &mut impl FnMut(&Node) -> bool) -> Option<Vec<usize>> {
    for (idx, node) in roots.iter().enumerate() {
        if pred(node) {
            return Some(vec![idx]);
        }
        if let Node::Loop(l) = node {
            if let Some(mut rest) = find_path(&l.children, pred) {
                rest.insert(0, idx);
                return Some(rest);
            }
        }
    }
    None
}

pub(crate) fn visit_loops<'a>(
    nodes: &'a [Node],
    depth: usize,
    visitor: &mut impl FnMut(usize, &'a LoopNode),
) {
    for node in nodes {
        if let Node::Loop(l) = node {
            visitor(depth, l);
            visit_loops(&l.children, depth + 1, visitor);
        }
    }
}

pub(crate) fn loop_names(roots: &[Node]) -> HashSet<String> {
    let mut names = HashSet::new();
    visit_loops(roots, 0, &mut |_, l| {
        names.insert(l.dim.clone());
    });
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::library;

    pub(crate) fn tree_of(desc: crate::program::ProgramDesc) -> SyntaxTree {
        SyntaxTree::from_program(desc.build().unwrap())
    }

    #[test]
    fn test_initial_matmul_text() {
        let tree = tree_of(library::matmul(16));
        assert_eq!(
            tree.to_string(),
            "for i in [0, 16)\n  for j in [0, 16)\n    init(i, j)\n\
             for i_1 in [0, 16)\n  for j_1 in [0, 16)\n    for k in [0, 16)\n      \
             acc(i=i_1, j=j_1, k)\n"
        );
        assert!(tree.is_legal());
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn test_initial_cholesky_shares_loops() {
        let tree = tree_of(library::cholesky(6));
        let text = tree.to_string();
        assert!(
            text.contains(
                "for j_1 in [0, i_1)\n    for k in [0, j_1)\n      S1(i=i_1, j=j_1, k)\n    S2(i=i_1, j=j_1)\n"
            ),
            "{text}"
        );
        assert!(
            text.ends_with("  for k_1 in [0, i_1)\n    S3(i=i_1, k=k_1)\n  S4(i=i_1)\n"),
            "{text}"
        );
        assert_eq!(tree.computation_counts(), vec![1; 5]);
        assert!(tree.is_legal());
    }

    #[test]
    fn test_evaluation_is_set_once() {
        let mut tree = tree_of(library::producer_consumer(8));
        assert_eq!(tree.evaluation(), Err(NotEvaluated));
        tree.set_evaluation(3.0).unwrap();
        assert_eq!(tree.set_evaluation(2.0), Err(AlreadyEvaluated));
        assert_eq!(tree.evaluation(), Ok(3.0));
    }

    #[test]
    fn test_derive_leaves_source_untouched() {
        let tree = tree_of(library::matmul(8));
        let before = tree.to_string();
        let derived = tree
            .derive(&Transformation::Tile {
                dim: "k".into(),
                factor: 4,
            })
            .unwrap();
        assert_eq!(tree.to_string(), before);
        assert_ne!(derived.to_string(), before);
        assert_eq!(derived.depth(), 1);
        assert!(!derived.is_evaluated());
    }

    #[test]
    fn test_replay_reproduces_structure() {
        let tree = tree_of(library::matmul(32));
        let schedule: Schedule = "tile i_1 8\ninterchange j_1 k\nparallelize i_10\nvectorize j_1 8\n"
            .parse()
            .unwrap();
        let replayed = SyntaxTree::replay(Arc::clone(tree.context()), &schedule).unwrap();
        assert_eq!(replayed.schedule(), schedule);
        let again = SyntaxTree::replay(
            Arc::clone(tree.context()),
            &replayed.schedule().to_string().parse().unwrap(),
        )
        .unwrap();
        assert_eq!(again.to_string(), replayed.to_string());
    }

    #[test]
    fn test_replay_preserves_legality_and_model_cost() {
        use crate::evaluator::{Evaluator, ModelEvaluator};

        let model = ModelEvaluator::default();
        let tree = tree_of(library::two_mm(16));
        let mut derived = tree.clone();
        for t in [
            Transformation::Tile {
                dim: "i".into(),
                factor: 4,
            },
            Transformation::Parallelize { dim: "i0".into() },
        ] {
            derived = derived.derive(&t).unwrap();
        }
        let schedule = derived.schedule().to_string().parse().unwrap();
        let replayed = SyntaxTree::replay(Arc::clone(tree.context()), &schedule).unwrap();
        assert_eq!(replayed.is_legal(), derived.is_legal());
        assert_eq!(replayed.computation_counts(), derived.computation_counts());
        assert_eq!(
            model.evaluate(&replayed).unwrap(),
            model.evaluate(&derived).unwrap()
        );
    }
}
