//! An analytical cost model of a loop tree.
//!
//! The estimate adds, per computation, the arithmetic work of its instances (shared
//! across vector lanes when its innermost loop is vectorized) and the cache misses
//! of its accesses, plus per-iteration loop overhead (amortized over unrolled
//! iterations). Parallel loops divide the cost of their subtree among processors.

use super::{EvalError, Evaluator};
use crate::expr::Affine;
use crate::program::{Access, Program};
use crate::syntax::{Leaf, LoopNode, LoopTags, Node, SyntaxTree};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MachineModel {
    pub processors: u32,
    /// Width of a vector register.
    pub vector_bytes: u32,
    pub cache_bytes: u64,
    pub line_bytes: u64,
    pub op_cost: f64,
    pub miss_cost: f64,
    pub loop_overhead: f64,
    /// Paid once per activation of a parallel loop.
    pub parallel_overhead: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ModelEvaluator {
    pub machine: MachineModel,
}

/// An enclosing loop during the cost walk.
#[derive(Debug, Clone)]
struct Frame<'a> {
    dim: &'a str,
    /// Inclusive range of values the loop variable takes.
    range: (i64, i64),
    /// Average trip count per activation.
    trips: f64,
    tags: LoopTags,
}

impl Default for MachineModel {
    fn default() -> Self {
        MachineModel {
            processors: 8,
            vector_bytes: 32,
            cache_bytes: 32 * 1024,
            line_bytes: 64,
            op_cost: 1.0,
            miss_cost: 20.0,
            loop_overhead: 1.0,
            parallel_overhead: 1000.0,
        }
    }
}

impl MachineModel {
    /// The default model with the processor count of the current machine.
    pub fn host() -> Self {
        MachineModel {
            processors: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            ..MachineModel::default()
        }
    }
}

impl ModelEvaluator {
    pub fn new(machine: MachineModel) -> Self {
        ModelEvaluator { machine }
    }

    /// The estimated cost of each node of `tree`, in pre-order.
    pub fn node_costs(&self, tree: &SyntaxTree) -> Result<Vec<f64>, EvalError> {
        let mut costs = vec![];
        self.nodes_cost(tree.program(), tree.roots(), &mut vec![], &mut costs)?;
        Ok(costs)
    }

    fn nodes_cost<'a>(
        &self,
        program: &Program,
        nodes: &'a [Node],
        stack: &mut Vec<Frame<'a>>,
        costs: &mut Vec<f64>,
    ) -> Result<f64, EvalError> {
        let mut total = 0.0;
        for node in nodes {
            let slot = costs.len();
            costs.push(0.0);
            let cost = match node {
                Node::Loop(l) => self.loop_cost(program, l, stack, costs)?,
                Node::Leaf(leaf) => self.leaf_cost(program, leaf, stack),
            };
            costs[slot] = cost;
            total += cost;
        }
        Ok(total)
    }

    fn loop_cost<'a>(
        &self,
        program: &Program,
        l: &'a LoopNode,
        stack: &mut Vec<Frame<'a>>,
        costs: &mut Vec<f64>,
    ) -> Result<f64, EvalError> {
        let frame = frame(l, stack)?;
        let activations: f64 = stack.iter().map(|f| f.trips).product();
        let trips = frame.trips;
        stack.push(frame);
        let body = self.nodes_cost(program, &l.children, stack, costs);
        stack.pop();

        let unroll = f64::from(l.tags.unroll.unwrap_or(1));
        let mut cost = body? + activations * trips * self.machine.loop_overhead / unroll;
        if l.tags.parallel && trips > 0.0 {
            let workers = f64::from(self.machine.processors.max(1)).min(trips);
            cost = cost * (trips / workers).ceil() / trips
                + activations * self.machine.parallel_overhead;
        }
        Ok(cost)
    }

    fn leaf_cost(&self, program: &Program, leaf: &Leaf, stack: &[Frame<'_>]) -> f64 {
        let comp = &program.computations()[leaf.computation];
        let instances: f64 = stack.iter().map(|f| f.trips).product();
        let elem_bytes = u64::from(program.buffers()[comp.store.buffer].dtype.size());

        let lanes = match stack.last().and_then(|f| f.tags.vectorize) {
            Some(width) => {
                let register_lanes = (u64::from(self.machine.vector_bytes) / elem_bytes).max(1);
                u64::from(width).min(register_lanes) as f64
            }
            None => 1.0,
        };
        let compute = instances * f64::from(comp.expr.op_count() + 1) * self.machine.op_cost / lanes;

        let mut unique: Vec<&Access> = vec![];
        for access in comp.reads().into_iter().chain([&comp.store]) {
            if !unique.contains(&access) {
                unique.push(access);
            }
        }
        let footprints = unique
            .iter()
            .map(|access| {
                let indices = access
                    .indices
                    .iter()
                    .map(|idx| leaf.over_loops(program, idx))
                    .collect::<Vec<_>>();
                AccessFootprint {
                    indices,
                    shape: program.buffers()[access.buffer]
                        .shape
                        .iter()
                        .map(|&d| i64::from(d))
                        .collect(),
                    elem_bytes: u64::from(program.buffers()[access.buffer].dtype.size()),
                }
            })
            .collect::<Vec<_>>();

        let mut misses = instances * footprints.len() as f64;
        for level in 0..=stack.len() {
            let lines: f64 = footprints
                .iter()
                .map(|fp| fp.lines(&stack[level..], self.machine.line_bytes))
                .sum();
            if lines * self.machine.line_bytes as f64 <= self.machine.cache_bytes as f64 {
                let repeats: f64 = stack[..level].iter().map(|f| f.trips).product();
                misses = lines * repeats;
                break;
            }
        }
        compute + misses * self.machine.miss_cost
    }
}

impl Evaluator for ModelEvaluator {
    fn evaluate(&self, tree: &SyntaxTree) -> Result<f64, EvalError> {
        self.nodes_cost(tree.program(), tree.roots(), &mut vec![], &mut vec![])
    }

    fn name(&self) -> &str {
        "model"
    }
}

fn frame<'a>(l: &'a LoopNode, stack: &[Frame<'_>]) -> Result<Frame<'a>, EvalError> {
    let range_of = |v: &String| {
        stack
            .iter()
            .rev()
            .find(|f| f.dim == v.as_str())
            .map(|f| f.range)
    };
    let unbounded = || {
        EvalError::Model(format!(
            "bounds of `{}` are not affine in enclosing loops",
            l.dim
        ))
    };
    let (lower_min, lower_max) = l.lower.bounds(range_of).ok_or_else(unbounded)?;
    let (mut upper_min, mut upper_max) = l.upper.bounds(range_of).ok_or_else(unbounded)?;
    if let Some(clamp) = &l.clamp {
        let (clamp_min, clamp_max) = clamp.bounds(range_of).ok_or_else(unbounded)?;
        upper_min = upper_min.min(clamp_min);
        upper_max = upper_max.min(clamp_max);
    }
    let trips = (((upper_max - lower_min) + (upper_min - lower_max)) as f64 / 2.0).max(0.0);
    Ok(Frame {
        dim: &l.dim,
        range: (lower_min, (upper_max - 1).max(lower_min)),
        trips,
        tags: l.tags,
    })
}

struct AccessFootprint {
    indices: Vec<Affine>,
    shape: Vec<i64>,
    elem_bytes: u64,
}

impl AccessFootprint {
    /// Distinct cache lines touched while the loops in `inner` run through all their
    /// iterations, enclosing loops held fixed.
    fn lines(&self, inner: &[Frame<'_>], line_bytes: u64) -> f64 {
        let spans = self
            .indices
            .iter()
            .zip(&self.shape)
            .map(|(idx, &extent)| {
                let span: f64 = 1.0
                    + inner
                        .iter()
                        .map(|f| {
                            idx.coefficient(&f.dim.to_owned()).unsigned_abs() as f64
                                * (f.trips - 1.0).max(0.0)
                        })
                        .sum::<f64>();
                span.min(extent as f64)
            })
            .collect::<Vec<_>>();
        let Some((last, outer)) = spans.split_last() else {
            return 1.0;
        };
        let contiguous = (last * self.elem_bytes as f64 / line_bytes as f64).ceil().max(1.0);
        contiguous * outer.iter().product::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::library;
    use crate::scheduling::Schedule;
    use std::sync::Arc;

    fn cost_after(desc: crate::program::ProgramDesc, schedule: &str) -> f64 {
        let tree = SyntaxTree::from_program(desc.build().unwrap());
        let schedule: Schedule = schedule.parse().unwrap();
        let derived = SyntaxTree::replay(Arc::clone(tree.context()), &schedule).unwrap();
        ModelEvaluator::default().evaluate(&derived).unwrap()
    }

    #[test]
    fn test_model_is_deterministic() {
        let tree = SyntaxTree::from_program(library::two_mm(32).build().unwrap());
        let model = ModelEvaluator::default();
        let first = model.evaluate(&tree).unwrap();
        for n in tree.neighbors().take(20) {
            assert_eq!(model.evaluate(&n).unwrap(), model.evaluate(&n).unwrap());
        }
        assert_eq!(model.evaluate(&tree).unwrap(), first);
    }

    #[test]
    fn test_parallel_loop_is_cheaper() {
        let base = cost_after(library::matmul(64), "");
        let par = cost_after(library::matmul(64), "parallelize i_1\n");
        assert!(par < base, "{par} >= {base}");
    }

    #[test]
    fn test_vectorize_and_unroll_reduce_cost() {
        let base = cost_after(library::producer_consumer(256), "");
        assert!(cost_after(library::producer_consumer(256), "vectorize i 8\n") < base);
        assert!(cost_after(library::producer_consumer(256), "unroll i 4\n") < base);
    }

    #[test]
    fn test_interchange_for_locality_is_cheaper() {
        let ijk = cost_after(library::matmul(128), "");
        let ikj = cost_after(library::matmul(128), "interchange j_1 k\n");
        assert!(ikj < ijk, "{ikj} >= {ijk}");
    }

    #[test]
    fn test_triangular_trip_counts() {
        let tree = SyntaxTree::from_program(library::cholesky(16).build().unwrap());
        let costs = ModelEvaluator::default().node_costs(&tree).unwrap();
        assert_eq!(costs.len(), 11);
        assert!(costs.iter().all(|c| *c >= 0.0));
    }
}
