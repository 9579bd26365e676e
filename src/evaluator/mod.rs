//! Scoring of candidate trees. Lower scores are better.

pub mod execution;
pub mod model;

pub use execution::{
    Backend, BackendError, ExecutionConfig, ExecutionEvaluator, InputBuffers, InputError,
    TimingReduction,
};
pub use model::{MachineModel, ModelEvaluator};

use crate::syntax::SyntaxTree;

use auto_impl::auto_impl;

/// The score assigned to a tree whose execution timed out.
pub const MAX_COST: f64 = f64::MAX;

#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    #[error("generated kernel failed to build: {0:#}")]
    KernelBuild(anyhow::Error),
    #[error("generated kernel failed to run: {0:#}")]
    KernelRun(anyhow::Error),
    #[error("cannot estimate cost: {0}")]
    Model(String),
    #[error("evaluator failure: {0:#}")]
    Internal(anyhow::Error),
}

/// Scores a [SyntaxTree]. Implementations must be callable from several threads at
/// once, since search methods score neighbors in parallel.
#[auto_impl(&, Box, Arc)]
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, tree: &SyntaxTree) -> Result<f64, EvalError>;

    fn name(&self) -> &str;
}

impl EvalError {
    /// True if the failure is attributable to the candidate rather than the evaluator.
    pub fn is_kernel_failure(&self) -> bool {
        matches!(self, EvalError::KernelBuild(_) | EvalError::KernelRun(_))
    }
}

/// Scores every tree the same. Useful as a baseline and in tests.
#[derive(Debug, Clone, Copy)]
pub struct ConstantEvaluator(pub f64);

impl Evaluator for ConstantEvaluator {
    fn evaluate(&self, _tree: &SyntaxTree) -> Result<f64, EvalError> {
        Ok(self.0)
    }

    fn name(&self) -> &str {
        "constant"
    }
}
