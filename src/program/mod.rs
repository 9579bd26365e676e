//! The iteration program model: buffers, computations, their iteration domains and
//! access relations.
//!
//! A [Program] is produced once per scheduling session (see [ProgramDesc]) and is
//! read-only afterwards. Parameters are substituted away during translation, so every
//! bound and index in a [Program] is an affine form over iterator names only.

mod desc;
pub mod library;

pub use desc::{
    AccessDesc, AfterDesc, BufferDesc, ComputationDesc, ExprDesc, IteratorDesc, ProgramDesc,
    TranslationError,
};

use crate::common::{BufferKind, Dtype, Shape};
use crate::expr::Affine;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    name: String,
    params: BTreeMap<String, i64>,
    buffers: Vec<Buffer>,
    computations: Vec<Computation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    pub shape: Shape,
    pub dtype: Dtype,
    pub kind: BufferKind,
}

/// One dimension of a computation's iteration domain: `lower <= name < upper`.
///
/// Bounds may reference iterators of enclosing dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterDim {
    pub name: String,
    pub lower: Affine,
    pub upper: Affine,
}

/// A buffer location, one affine index per buffer dimension, over the computation's
/// iterators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Access {
    pub buffer: usize,
    pub indices: Vec<Affine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic {
    Sqrt,
    Exp,
    Abs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(f64),
    Iter(String),
    Load(Access),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Neg(Box<Expr>),
    Call(Intrinsic, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Computation {
    pub name: String,
    pub domain: Vec<IterDim>,
    pub expr: Expr,
    pub store: Access,
    /// Initial nesting: share the loops at depths `0..=level` with an earlier
    /// computation, executing after it.
    pub after: Option<(usize, usize)>,
}

impl Program {
    pub(crate) fn new(
        name: String,
        params: BTreeMap<String, i64>,
        buffers: Vec<Buffer>,
        computations: Vec<Computation>,
    ) -> Self {
        Program {
            name,
            params,
            buffers,
            computations,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &BTreeMap<String, i64> {
        &self.params
    }

    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    pub fn buffer_index(&self, name: &str) -> Option<usize> {
        self.buffers.iter().position(|b| b.name == name)
    }

    pub fn computations(&self) -> &[Computation] {
        &self.computations
    }

    pub fn computation_index(&self, name: &str) -> Option<usize> {
        self.computations.iter().position(|c| c.name == name)
    }

    pub fn display_computation(&self, idx: usize) -> impl fmt::Display + '_ {
        ComputationDisplay {
            program: self,
            computation: &self.computations[idx],
        }
    }
}

impl Buffer {
    pub fn volume(&self) -> usize {
        self.shape.iter().map(|&d| d as usize).product()
    }

    /// Row-major strides, in elements.
    pub fn strides(&self) -> Vec<i64> {
        let mut strides = vec![1i64; self.shape.len()];
        for d in (0..self.shape.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * i64::from(self.shape[d + 1]);
        }
        strides
    }
}

impl Expr {
    /// Visits every [Access] read by this expression, in evaluation order.
    pub fn visit_loads<'a, F>(&'a self, visitor: &mut F)
    where
        F: FnMut(&'a Access),
    {
        match self {
            Expr::Const(_) | Expr::Iter(_) => {}
            Expr::Load(access) => visitor(access),
            Expr::Binary(_, lhs, rhs) => {
                lhs.visit_loads(visitor);
                rhs.visit_loads(visitor);
            }
            Expr::Neg(arg) => arg.visit_loads(visitor),
            Expr::Call(_, args) => args.iter().for_each(|a| a.visit_loads(visitor)),
        }
    }

    /// The number of arithmetic operations evaluated per instance.
    pub fn op_count(&self) -> u32 {
        match self {
            Expr::Const(_) | Expr::Iter(_) | Expr::Load(_) => 0,
            Expr::Binary(_, lhs, rhs) => 1 + lhs.op_count() + rhs.op_count(),
            Expr::Neg(arg) => 1 + arg.op_count(),
            Expr::Call(_, args) => 1 + args.iter().map(Expr::op_count).sum::<u32>(),
        }
    }
}

impl Computation {
    pub fn depth(&self) -> usize {
        self.domain.len()
    }

    pub fn reads(&self) -> Vec<&Access> {
        let mut reads = Vec::new();
        self.expr.visit_loads(&mut |a| reads.push(a));
        reads
    }

    pub fn iterator_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.domain.iter().map(|d| d.name.as_str())
    }
}

impl BinOp {
    pub fn apply(&self, lhs: f64, rhs: f64) -> f64 {
        match self {
            BinOp::Add => lhs + rhs,
            BinOp::Sub => lhs - rhs,
            BinOp::Mul => lhs * rhs,
            BinOp::Div => lhs / rhs,
            BinOp::Min => lhs.min(rhs),
            BinOp::Max => lhs.max(rhs),
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Min => "min",
            BinOp::Max => "max",
        }
    }
}

impl Intrinsic {
    pub fn arity(&self) -> usize {
        1
    }

    pub fn apply(&self, args: &[f64]) -> f64 {
        match self {
            Intrinsic::Sqrt => args[0].sqrt(),
            Intrinsic::Exp => args[0].exp(),
            Intrinsic::Abs => args[0].abs(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Intrinsic::Sqrt => "sqrt",
            Intrinsic::Exp => "exp",
            Intrinsic::Abs => "fabs",
        }
    }
}

struct ComputationDisplay<'a> {
    program: &'a Program,
    computation: &'a Computation,
}

struct ExprDisplay<'a> {
    program: &'a Program,
    expr: &'a Expr,
}

struct AccessDisplay<'a> {
    program: &'a Program,
    access: &'a Access,
}

impl fmt::Display for ComputationDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = self.computation;
        write!(
            f,
            "{}({}): {} = {}",
            c.name,
            c.iterator_names().join(", "),
            AccessDisplay {
                program: self.program,
                access: &c.store
            },
            ExprDisplay {
                program: self.program,
                expr: &c.expr
            }
        )
    }
}

fn expr_display<'a>(program: &'a Program, expr: &'a Expr) -> ExprDisplay<'a> {
    ExprDisplay { program, expr }
}

impl<'a> fmt::Display for ExprDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let program = self.program;
        let sub = |expr: &'a Expr| expr_display(program, expr);
        match self.expr {
            Expr::Const(v) => write!(f, "{v}"),
            Expr::Iter(name) => write!(f, "{name}"),
            Expr::Load(access) => write!(
                f,
                "{}",
                AccessDisplay {
                    program: self.program,
                    access
                }
            ),
            Expr::Binary(op @ (BinOp::Min | BinOp::Max), lhs, rhs) => {
                write!(f, "{}({}, {})", op.symbol(), sub(&**lhs), sub(&**rhs))
            }
            Expr::Binary(op, lhs, rhs) => {
                write!(f, "({} {} {})", sub(&**lhs), op.symbol(), sub(&**rhs))
            }
            Expr::Neg(arg) => write!(f, "-{}", sub(&**arg)),
            Expr::Call(intrinsic, args) => write!(
                f,
                "{}({})",
                intrinsic.name(),
                args.iter().map(sub).join(", ")
            ),
        }
    }
}

impl fmt::Display for AccessDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]",
            self.program.buffers[self.access.buffer].name,
            self.access.indices.iter().join(", ")
        )
    }
}
