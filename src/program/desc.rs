use super::{Access, BinOp, Buffer, Computation, Expr, IterDim, Intrinsic, Program};
use crate::common::{BufferKind, DimSize, Dtype, Shape};
use crate::expr::{Affine, AffineForm, ParseAffineError};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops;

/// A declarative description of a program, as produced by a frontend.
///
/// Bounds, shapes, and indices are affine expressions in text form (e.g. `"N - 1"`)
/// over parameters and iterators. [ProgramDesc::build] validates and translates the
/// description in full or fails with a [TranslationError].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramDesc {
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, i64>,
    pub buffers: Vec<BufferDesc>,
    pub computations: Vec<ComputationDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferDesc {
    pub name: String,
    pub shape: Vec<String>,
    pub dtype: Dtype,
    pub kind: BufferKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationDesc {
    pub name: String,
    pub iterators: Vec<IteratorDesc>,
    pub store: AccessDesc,
    pub expr: ExprDesc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<AfterDesc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorDesc {
    pub name: String,
    pub lower: String,
    pub upper: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDesc {
    pub buffer: String,
    pub indices: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AfterDesc {
    pub computation: String,
    pub level: usize,
}

/// Expression nodes as they arrive from a frontend. Operators and intrinsics are named
/// by string; anything outside the supported set is a [TranslationError].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExprDesc {
    Const {
        value: f64,
    },
    Iter {
        name: String,
    },
    Load {
        buffer: String,
        indices: Vec<String>,
    },
    Binary {
        op: String,
        lhs: Box<ExprDesc>,
        rhs: Box<ExprDesc>,
    },
    Neg {
        arg: Box<ExprDesc>,
    },
    Call {
        name: String,
        args: Vec<ExprDesc>,
    },
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum TranslationError {
    #[error("program declares no computations")]
    EmptyProgram,
    #[error("duplicate {kind} name `{name}`")]
    DuplicateName { kind: &'static str, name: String },
    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),
    #[error("unknown computation `{0}`")]
    UnknownComputation(String),
    #[error("`{name}` is not a parameter or an iterator in scope in {context}")]
    UnknownName { name: String, context: String },
    #[error("unsupported operator `{0}`")]
    UnsupportedOperator(String),
    #[error("unsupported intrinsic `{0}`")]
    UnsupportedIntrinsic(String),
    #[error("intrinsic `{name}` takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("buffer `{buffer}` has rank {expected}, accessed with {got} indices")]
    RankMismatch {
        buffer: String,
        expected: usize,
        got: usize,
    },
    #[error("dimension {dim} of buffer `{buffer}` is not a positive constant")]
    BadShape { buffer: String, dim: usize },
    #[error("buffer `{0}` has more elements than can be indexed")]
    OversizedBuffer(String),
    #[error("computation `{computation}` writes input buffer `{buffer}`")]
    WriteToInput { computation: String, buffer: String },
    #[error("`{computation}` cannot share {level} loop levels with `{other}`")]
    IncompatibleSharedLoops {
        computation: String,
        other: String,
        level: usize,
    },
    #[error(transparent)]
    BadAffine(#[from] ParseAffineError),
}

/// Name resolution state threaded through the translation of one program.
struct TranslationContext<'a> {
    params: &'a BTreeMap<String, i64>,
    buffers: HashMap<&'a str, (usize, usize)>,
    computations: HashMap<&'a str, usize>,
    scope: Vec<String>,
    scope_owner: String,
}

impl ProgramDesc {
    pub fn new(name: impl Into<String>) -> Self {
        ProgramDesc {
            name: name.into(),
            params: BTreeMap::new(),
            buffers: vec![],
            computations: vec![],
        }
    }

    pub fn param(mut self, name: &str, value: i64) -> Self {
        self.params.insert(name.to_owned(), value);
        self
    }

    pub fn buffer(mut self, name: &str, shape: &[&str], dtype: Dtype, kind: BufferKind) -> Self {
        self.buffers.push(BufferDesc {
            name: name.to_owned(),
            shape: shape.iter().map(|s| (*s).to_owned()).collect(),
            dtype,
            kind,
        });
        self
    }

    pub fn computation(mut self, computation: ComputationDesc) -> Self {
        self.computations.push(computation);
        self
    }

    /// Validates and translates this description into a [Program].
    pub fn build(&self) -> Result<Program, TranslationError> {
        if self.computations.is_empty() {
            return Err(TranslationError::EmptyProgram);
        }
        let mut ctx = TranslationContext {
            params: &self.params,
            buffers: HashMap::new(),
            computations: HashMap::new(),
            scope: vec![],
            scope_owner: String::new(),
        };

        let mut buffers = Vec::with_capacity(self.buffers.len());
        for desc in &self.buffers {
            let buffer = ctx.translate_buffer(desc)?;
            if ctx
                .buffers
                .insert(&desc.name, (buffers.len(), buffer.shape.len()))
                .is_some()
            {
                return Err(TranslationError::DuplicateName {
                    kind: "buffer",
                    name: desc.name.clone(),
                });
            }
            buffers.push(buffer);
        }

        let mut computations: Vec<Computation> = Vec::with_capacity(self.computations.len());
        for desc in &self.computations {
            let computation = ctx.translate_computation(desc, &buffers, &computations)?;
            if ctx
                .computations
                .insert(&desc.name, computations.len())
                .is_some()
            {
                return Err(TranslationError::DuplicateName {
                    kind: "computation",
                    name: desc.name.clone(),
                });
            }
            computations.push(computation);
        }

        Ok(Program::new(
            self.name.clone(),
            self.params.clone(),
            buffers,
            computations,
        ))
    }
}

impl<'a> TranslationContext<'a> {
    fn translate_buffer(&mut self, desc: &BufferDesc) -> Result<Buffer, TranslationError> {
        self.scope.clear();
        self.scope_owner = format!("buffer `{}`", desc.name);
        let shape: Shape = desc
            .shape
            .iter()
            .enumerate()
            .map(|(dim, text)| {
                let bad_shape = || TranslationError::BadShape {
                    buffer: desc.name.clone(),
                    dim,
                };
                let size = self.affine(text, 0)?.as_constant().ok_or_else(bad_shape)?;
                DimSize::try_from(size)
                    .ok()
                    .filter(|&s| s > 0)
                    .ok_or_else(bad_shape)
            })
            .collect::<Result<_, _>>()?;
        shape
            .iter()
            .try_fold(1i64, |volume, &d| volume.checked_mul(i64::from(d)))
            .filter(|&volume| usize::try_from(volume).is_ok())
            .ok_or_else(|| TranslationError::OversizedBuffer(desc.name.clone()))?;
        Ok(Buffer {
            name: desc.name.clone(),
            shape,
            dtype: desc.dtype,
            kind: desc.kind,
        })
    }

    fn translate_computation(
        &mut self,
        desc: &ComputationDesc,
        buffers: &[Buffer],
        earlier: &[Computation],
    ) -> Result<Computation, TranslationError> {
        self.scope.clear();
        self.scope_owner = format!("computation `{}`", desc.name);

        let mut domain = Vec::with_capacity(desc.iterators.len());
        for (depth, it) in desc.iterators.iter().enumerate() {
            if self.scope.contains(&it.name) || self.params.contains_key(&it.name) {
                return Err(TranslationError::DuplicateName {
                    kind: "iterator",
                    name: it.name.clone(),
                });
            }
            domain.push(IterDim {
                name: it.name.clone(),
                lower: self.affine(&it.lower, depth)?,
                upper: self.affine(&it.upper, depth)?,
            });
            self.scope.push(it.name.clone());
        }

        let store = self.access(&desc.store.buffer, &desc.store.indices)?;
        if buffers[store.buffer].kind == BufferKind::Input {
            return Err(TranslationError::WriteToInput {
                computation: desc.name.clone(),
                buffer: desc.store.buffer.clone(),
            });
        }
        let expr = self.expr(&desc.expr)?;

        let after = match &desc.after {
            None => None,
            Some(after) => {
                let other_idx = *self
                    .computations
                    .get(after.computation.as_str())
                    .ok_or_else(|| TranslationError::UnknownComputation(after.computation.clone()))?;
                check_shared_loops(&desc.name, &domain, &earlier[other_idx], after.level)?;
                Some((other_idx, after.level))
            }
        };

        Ok(Computation {
            name: desc.name.clone(),
            domain,
            expr,
            store,
            after,
        })
    }

    /// Parses `text`, substituting parameters; only the first `visible` iterators of the
    /// current scope may be referenced.
    fn affine(&self, text: &str, visible: usize) -> Result<Affine, TranslationError> {
        let parsed: Affine = text.parse()?;
        parsed.try_map_vars(&mut |name: String| {
            if let Some(value) = self.params.get(&name) {
                Ok(AffineForm::constant(*value))
            } else if self.scope[..visible].contains(&name) {
                Ok(AffineForm::var(name))
            } else {
                Err(TranslationError::UnknownName {
                    name,
                    context: self.scope_owner.clone(),
                })
            }
        })
    }

    fn access(&self, buffer: &str, indices: &[String]) -> Result<Access, TranslationError> {
        let (buffer_idx, rank) = *self
            .buffers
            .get(buffer)
            .ok_or_else(|| TranslationError::UnknownBuffer(buffer.to_owned()))?;
        if rank != indices.len() {
            return Err(TranslationError::RankMismatch {
                buffer: buffer.to_owned(),
                expected: rank,
                got: indices.len(),
            });
        }
        Ok(Access {
            buffer: buffer_idx,
            indices: indices
                .iter()
                .map(|i| self.affine(i, self.scope.len()))
                .collect::<Result<_, _>>()?,
        })
    }

    fn expr(&self, desc: &ExprDesc) -> Result<Expr, TranslationError> {
        Ok(match desc {
            ExprDesc::Const { value } => Expr::Const(*value),
            ExprDesc::Iter { name } => {
                if !self.scope.contains(name) {
                    return Err(TranslationError::UnknownName {
                        name: name.clone(),
                        context: self.scope_owner.clone(),
                    });
                }
                Expr::Iter(name.clone())
            }
            ExprDesc::Load { buffer, indices } => Expr::Load(self.access(buffer, indices)?),
            ExprDesc::Binary { op, lhs, rhs } => {
                let op = match op.as_str() {
                    "+" | "add" => BinOp::Add,
                    "-" | "sub" => BinOp::Sub,
                    "*" | "mul" => BinOp::Mul,
                    "/" | "div" => BinOp::Div,
                    "min" => BinOp::Min,
                    "max" => BinOp::Max,
                    other => return Err(TranslationError::UnsupportedOperator(other.to_owned())),
                };
                Expr::Binary(op, Box::new(self.expr(lhs)?), Box::new(self.expr(rhs)?))
            }
            ExprDesc::Neg { arg } => Expr::Neg(Box::new(self.expr(arg)?)),
            ExprDesc::Call { name, args } => {
                let intrinsic = match name.as_str() {
                    "sqrt" => Intrinsic::Sqrt,
                    "exp" => Intrinsic::Exp,
                    "abs" => Intrinsic::Abs,
                    other => return Err(TranslationError::UnsupportedIntrinsic(other.to_owned())),
                };
                if args.len() != intrinsic.arity() {
                    return Err(TranslationError::Arity {
                        name: name.clone(),
                        expected: intrinsic.arity(),
                        got: args.len(),
                    });
                }
                Expr::Call(
                    intrinsic,
                    args.iter().map(|a| self.expr(a)).collect::<Result<_, _>>()?,
                )
            }
        })
    }
}

/// Checks that the loops at depths `0..=level` of `domain` match those of `other` once
/// iterators are renamed to `other`'s.
fn check_shared_loops(
    name: &str,
    domain: &[IterDim],
    other: &Computation,
    level: usize,
) -> Result<(), TranslationError> {
    let incompatible = || TranslationError::IncompatibleSharedLoops {
        computation: name.to_owned(),
        other: other.name.clone(),
        level: level + 1,
    };
    if level >= domain.len() || level >= other.domain.len() {
        return Err(incompatible());
    }
    let renames: HashMap<&str, &str> = domain[..=level]
        .iter()
        .zip(&other.domain[..=level])
        .map(|(mine, theirs)| (mine.name.as_str(), theirs.name.as_str()))
        .collect();
    let rename = |form: &Affine| {
        form.clone().map_vars(&mut |v: String| {
            AffineForm::var(renames.get(v.as_str()).map_or(v.clone(), |r| (*r).to_owned()))
        })
    };
    for (mine, theirs) in domain[..=level].iter().zip(&other.domain) {
        if rename(&mine.lower) != theirs.lower || rename(&mine.upper) != theirs.upper {
            return Err(incompatible());
        }
    }
    Ok(())
}

impl ComputationDesc {
    pub fn new(name: impl Into<String>) -> Self {
        ComputationDesc {
            name: name.into(),
            iterators: vec![],
            store: AccessDesc {
                buffer: String::new(),
                indices: vec![],
            },
            expr: ExprDesc::Const { value: 0.0 },
            after: None,
        }
    }

    pub fn iter(mut self, name: &str, lower: &str, upper: &str) -> Self {
        self.iterators.push(IteratorDesc {
            name: name.to_owned(),
            lower: lower.to_owned(),
            upper: upper.to_owned(),
        });
        self
    }

    pub fn store(mut self, buffer: &str, indices: &[&str]) -> Self {
        self.store = AccessDesc {
            buffer: buffer.to_owned(),
            indices: indices.iter().map(|s| (*s).to_owned()).collect(),
        };
        self
    }

    pub fn expr(mut self, expr: ExprDesc) -> Self {
        self.expr = expr;
        self
    }

    pub fn after(mut self, computation: &str, level: usize) -> Self {
        self.after = Some(AfterDesc {
            computation: computation.to_owned(),
            level,
        });
        self
    }
}

impl ExprDesc {
    pub fn constant(value: f64) -> Self {
        ExprDesc::Const { value }
    }

    pub fn iter(name: &str) -> Self {
        ExprDesc::Iter {
            name: name.to_owned(),
        }
    }

    pub fn load(buffer: &str, indices: &[&str]) -> Self {
        ExprDesc::Load {
            buffer: buffer.to_owned(),
            indices: indices.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    pub fn binary(op: &str, lhs: ExprDesc, rhs: ExprDesc) -> Self {
        ExprDesc::Binary {
            op: op.to_owned(),
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn call(name: &str, args: Vec<ExprDesc>) -> Self {
        ExprDesc::Call {
            name: name.to_owned(),
            args,
        }
    }
}

macro_rules! expr_desc_binop {
    ($trait:ident, $method:ident, $sym:literal) => {
        impl ops::$trait for ExprDesc {
            type Output = ExprDesc;

            fn $method(self, rhs: ExprDesc) -> ExprDesc {
                ExprDesc::binary($sym, self, rhs)
            }
        }
    };
}

expr_desc_binop!(Add, add, "+");
expr_desc_binop!(Sub, sub, "-");
expr_desc_binop!(Mul, mul, "*");
expr_desc_binop!(Div, div, "/");
