//! Compiles a loop tree into a slot-indexed form that can be walked quickly.
//!
//! Every loop gets a slot holding its current value; affine bounds and indices
//! become sums over slots. Walking a [LoweredKernel] visits computation instances
//! in the tree's execution order, which both the dependence checker and the
//! interpreter build on.

use crate::expr::Affine;
use crate::program::{Access, BinOp, Expr, Intrinsic, Program};
use crate::syntax::{Leaf, LoopNode, Node};

use smallvec::SmallVec;
use std::collections::HashMap;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LoweringError {
    #[error("`{0}` is not bound by an enclosing loop")]
    Unbound(String),
    #[error("`{0}` is not an iterator of `{1}`")]
    UnknownIterator(String, String),
}

#[derive(Debug)]
pub(crate) struct LoweredKernel {
    body: Vec<LNode>,
    loop_names: Vec<String>,
}

#[derive(Debug)]
enum LNode {
    Loop(LLoop),
    Leaf(LLeaf),
}

#[derive(Debug)]
struct LLoop {
    slot: usize,
    lower: SlotForm,
    upper: SlotForm,
    clamp: Option<SlotForm>,
    /// Parallel or vectorized: iterations may run in any order.
    concurrent: bool,
    body: Vec<LNode>,
}

#[derive(Debug)]
pub(crate) struct LLeaf {
    pub(crate) computation: usize,
    pub(crate) iterators: SmallVec<[SlotForm; 4]>,
    /// Reads in evaluation order; [LExpr::Load] indexes into this.
    pub(crate) reads: Vec<LAccess>,
    pub(crate) store: LAccess,
    pub(crate) expr: LExpr,
}

#[derive(Debug)]
pub(crate) struct LAccess {
    pub(crate) buffer: usize,
    indices: SmallVec<[SlotForm; 4]>,
    extents: SmallVec<[i64; 4]>,
    strides: SmallVec<[i64; 4]>,
}

#[derive(Debug)]
pub(crate) enum LExpr {
    Const(f64),
    Value(SlotForm),
    Load(usize),
    Binary(BinOp, Box<LExpr>, Box<LExpr>),
    Neg(Box<LExpr>),
    Call(Intrinsic, Vec<LExpr>),
}

/// An affine form over loop slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SlotForm {
    terms: SmallVec<[(usize, i64); 4]>,
    constant: i64,
}

/// One computation instance, as visited by [LoweredKernel::walk].
pub(crate) struct Instance<'a> {
    pub(crate) leaf: &'a LLeaf,
    pub(crate) slots: &'a [i64],
    /// The concurrent loops enclosing this instance, outermost first.
    pub(crate) concurrent: &'a [ConcurrentIteration],
}

/// An iteration of a concurrent loop. `activation` distinguishes separate
/// executions of the same loop and is unique within a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConcurrentIteration {
    pub(crate) slot: usize,
    pub(crate) activation: u64,
    pub(crate) iteration: i64,
}

impl SlotForm {
    pub(crate) fn eval(&self, slots: &[i64]) -> i64 {
        self.terms
            .iter()
            .fold(self.constant, |acc, &(slot, coeff)| acc + coeff * slots[slot])
    }

    fn add_scaled(&mut self, other: &SlotForm, scale: i64) {
        self.constant += other.constant * scale;
        for &(slot, coeff) in &other.terms {
            match self.terms.iter_mut().find(|(s, _)| *s == slot) {
                Some((_, c)) => *c += coeff * scale,
                None => self.terms.push((slot, coeff * scale)),
            }
        }
        self.terms.retain(|(_, c)| *c != 0);
    }
}

impl LAccess {
    /// The element offset of this access, or `None` if any index is out of bounds.
    pub(crate) fn offset(&self, slots: &[i64]) -> Option<usize> {
        let mut offset = 0;
        for ((index, &extent), &stride) in self.indices.iter().zip(&self.extents).zip(&self.strides)
        {
            let v = index.eval(slots);
            if v < 0 || v >= extent {
                return None;
            }
            offset += v * stride;
        }
        usize::try_from(offset).ok()
    }
}

impl Instance<'_> {
    pub(crate) fn iterator_values(&self) -> SmallVec<[i64; 4]> {
        self.leaf.iterators.iter().map(|f| f.eval(self.slots)).collect()
    }
}

impl LExpr {
    /// Evaluates the expression given the values of the leaf's reads.
    pub(crate) fn eval(&self, loaded: &[f64], slots: &[i64]) -> f64 {
        match self {
            LExpr::Const(v) => *v,
            LExpr::Value(form) => form.eval(slots) as f64,
            LExpr::Load(idx) => loaded[*idx],
            LExpr::Binary(op, lhs, rhs) => op.apply(lhs.eval(loaded, slots), rhs.eval(loaded, slots)),
            LExpr::Neg(arg) => -arg.eval(loaded, slots),
            LExpr::Call(intrinsic, args) => {
                let values = args
                    .iter()
                    .map(|a| a.eval(loaded, slots))
                    .collect::<SmallVec<[f64; 2]>>();
                intrinsic.apply(&values)
            }
        }
    }
}

impl LoweredKernel {
    pub(crate) fn compile(program: &Program, roots: &[Node]) -> Result<Self, LoweringError> {
        let mut compiler = Compiler {
            program,
            scope: vec![],
            loop_names: vec![],
        };
        let body = compiler.nodes(roots)?;
        Ok(LoweredKernel {
            body,
            loop_names: compiler.loop_names,
        })
    }

    pub(crate) fn loop_name(&self, slot: usize) -> &str {
        &self.loop_names[slot]
    }

    /// Visits every computation instance in execution order, stopping at the first
    /// error returned by `visit`.
    pub(crate) fn walk<E>(
        &self,
        visit: &mut impl FnMut(&Instance<'_>) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut walker = Walker {
            slots: vec![0; self.loop_names.len()],
            concurrent: SmallVec::new(),
            activations: 0,
        };
        walker.walk(&self.body, visit)
    }
}

struct Walker {
    slots: Vec<i64>,
    concurrent: SmallVec<[ConcurrentIteration; 2]>,
    activations: u64,
}

impl Walker {
    fn walk<E>(
        &mut self,
        nodes: &[LNode],
        visit: &mut impl FnMut(&Instance<'_>) -> Result<(), E>,
    ) -> Result<(), E> {
        for node in nodes {
            match node {
                LNode::Loop(l) => {
                    let lower = l.lower.eval(&self.slots);
                    let mut upper = l.upper.eval(&self.slots);
                    if let Some(clamp) = &l.clamp {
                        upper = upper.min(clamp.eval(&self.slots));
                    }
                    if l.concurrent {
                        self.activations += 1;
                        self.concurrent.push(ConcurrentIteration {
                            slot: l.slot,
                            activation: self.activations,
                            iteration: lower,
                        });
                    }
                    for v in lower..upper {
                        self.slots[l.slot] = v;
                        if l.concurrent {
                            if let Some(top) = self.concurrent.last_mut() {
                                top.iteration = v;
                            }
                        }
                        self.walk(&l.body, visit)?;
                    }
                    if l.concurrent {
                        self.concurrent.pop();
                    }
                }
                LNode::Leaf(leaf) => visit(&Instance {
                    leaf,
                    slots: &self.slots,
                    concurrent: &self.concurrent,
                })?,
            }
        }
        Ok(())
    }
}

struct Compiler<'a> {
    program: &'a Program,
    /// Loop variables in scope, innermost last, with their slots.
    scope: Vec<(String, usize)>,
    loop_names: Vec<String>,
}

impl Compiler<'_> {
    fn nodes(&mut self, nodes: &[Node]) -> Result<Vec<LNode>, LoweringError> {
        nodes
            .iter()
            .map(|node| match node {
                Node::Loop(l) => self.lower_loop(l).map(LNode::Loop),
                Node::Leaf(leaf) => self.leaf(leaf).map(LNode::Leaf),
            })
            .collect()
    }

    fn lower_loop(&mut self, l: &LoopNode) -> Result<LLoop, LoweringError> {
        let lower = self.form(&l.lower)?;
        let upper = self.form(&l.upper)?;
        let clamp = l.clamp.as_ref().map(|c| self.form(c)).transpose()?;
        let slot = self.loop_names.len();
        self.loop_names.push(l.dim.clone());
        self.scope.push((l.dim.clone(), slot));
        let body = self.nodes(&l.children);
        self.scope.pop();
        Ok(LLoop {
            slot,
            lower,
            upper,
            clamp,
            concurrent: l.tags.parallel || l.tags.vectorize.is_some(),
            body: body?,
        })
    }

    fn form(&self, form: &Affine) -> Result<SlotForm, LoweringError> {
        let mut lowered = SlotForm {
            terms: SmallVec::new(),
            constant: form.1,
        };
        for term in &form.0 {
            let slot = self
                .scope
                .iter()
                .rev()
                .find(|(name, _)| *name == term.1)
                .map(|(_, slot)| *slot)
                .ok_or_else(|| LoweringError::Unbound(term.1.clone()))?;
            lowered.terms.push((slot, term.0));
        }
        Ok(lowered)
    }

    fn leaf(&self, leaf: &Leaf) -> Result<LLeaf, LoweringError> {
        let comp = &self.program.computations()[leaf.computation];
        let iterators = leaf
            .bindings
            .iter()
            .map(|b| self.form(b))
            .collect::<Result<SmallVec<[SlotForm; 4]>, _>>()?;
        let by_name: HashMap<&str, &SlotForm> = comp.iterator_names().zip(&iterators).collect();
        let over_iterators = |form: &Affine| -> Result<SlotForm, LoweringError> {
            let mut lowered = SlotForm {
                terms: SmallVec::new(),
                constant: form.1,
            };
            for term in &form.0 {
                let binding = by_name.get(term.1.as_str()).ok_or_else(|| {
                    LoweringError::UnknownIterator(term.1.clone(), comp.name.clone())
                })?;
                lowered.add_scaled(binding, term.0);
            }
            Ok(lowered)
        };
        let access = |access: &Access| -> Result<LAccess, LoweringError> {
            let buffer = &self.program.buffers()[access.buffer];
            Ok(LAccess {
                buffer: access.buffer,
                indices: access
                    .indices
                    .iter()
                    .map(&over_iterators)
                    .collect::<Result<_, _>>()?,
                extents: buffer.shape.iter().map(|&d| i64::from(d)).collect(),
                strides: buffer.strides().into_iter().collect(),
            })
        };

        let mut reads = vec![];
        let expr = lower_expr(&comp.expr, &mut reads, &access, &over_iterators, &comp.name)?;
        let store = access(&comp.store)?;
        Ok(LLeaf {
            computation: leaf.computation,
            iterators,
            reads,
            store,
            expr,
        })
    }
}

fn lower_expr(
    expr: &Expr,
    reads: &mut Vec<LAccess>,
    access: &impl Fn(&Access) -> Result<LAccess, LoweringError>,
    over_iterators: &impl Fn(&Affine) -> Result<SlotForm, LoweringError>,
    computation: &str,
) -> Result<LExpr, LoweringError> {
    let mut sub = |e: &Expr| lower_expr(e, reads, access, over_iterators, computation).map(Box::new);
    Ok(match expr {
        Expr::Const(v) => LExpr::Const(*v),
        Expr::Iter(name) => LExpr::Value(over_iterators(&Affine::from(name.as_str()))?),
        Expr::Load(a) => {
            let lowered = access(a)?;
            reads.push(lowered);
            LExpr::Load(reads.len() - 1)
        }
        Expr::Binary(op, lhs, rhs) => {
            let lhs = sub(lhs)?;
            let rhs = sub(rhs)?;
            LExpr::Binary(*op, lhs, rhs)
        }
        Expr::Neg(arg) => LExpr::Neg(sub(arg)?),
        Expr::Call(intrinsic, args) => LExpr::Call(
            *intrinsic,
            args.iter()
                .map(|a| sub(a).map(|b| *b))
                .collect::<Result<_, _>>()?,
        ),
    })
}
