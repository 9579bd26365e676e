//! An in-process [Backend] that executes trees directly.

use crate::common::BufferKind;
use crate::evaluator::{Backend, BackendError, InputBuffers};
use crate::lowering::{Instance, LoweredKernel};
use crate::syntax::{ProgramContext, SyntaxTree};

use anyhow::anyhow;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Instances executed between deadline checks.
const DEADLINE_CHECK_INTERVAL: u64 = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct Interpreter;

pub struct InterpretedKernel {
    context: Arc<ProgramContext>,
    lowered: LoweredKernel,
}

impl Backend for Interpreter {
    type Kernel = InterpretedKernel;

    fn name(&self) -> &str {
        "interpreter"
    }

    fn build(
        &self,
        tree: &SyntaxTree,
        _deadline: Option<Instant>,
    ) -> Result<InterpretedKernel, BackendError> {
        Ok(InterpretedKernel {
            context: Arc::clone(tree.context()),
            lowered: tree.lower().map_err(|e| BackendError::Kernel(e.into()))?,
        })
    }

    fn measure(
        &self,
        kernel: &InterpretedKernel,
        inputs: &InputBuffers,
        runs: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<Duration>, BackendError> {
        (0..runs)
            .map(|_| {
                let start = Instant::now();
                kernel.run(inputs, deadline)?;
                Ok(start.elapsed())
            })
            .collect()
    }
}

impl InterpretedKernel {
    /// Executes the kernel once on fresh buffers, returning every buffer's final
    /// contents in program order.
    pub fn run(
        &self,
        inputs: &InputBuffers,
        deadline: Option<Instant>,
    ) -> Result<Vec<Vec<f64>>, BackendError> {
        let program = self.context.program();
        let mut buffers = program
            .buffers()
            .iter()
            .map(|b| match b.kind {
                BufferKind::Input => inputs
                    .get(&b.name)
                    .map(<[f64]>::to_vec)
                    .ok_or_else(|| BackendError::Harness(anyhow!("missing input `{}`", b.name))),
                BufferKind::Output | BufferKind::Temporary => Ok(vec![0.0; b.volume()]),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut executed = 0u64;
        let mut loaded = SmallVec::<[f64; 8]>::new();
        self.lowered.walk(&mut |inst: &Instance<'_>| {
            executed += 1;
            if executed % DEADLINE_CHECK_INTERVAL == 0
                && deadline.map_or(false, |d| Instant::now() >= d)
            {
                return Err(BackendError::Timeout);
            }
            let leaf = inst.leaf;
            let out_of_bounds = |buffer: usize| {
                BackendError::Kernel(anyhow!(
                    "`{}` accesses `{}` out of bounds",
                    program.computations()[leaf.computation].name,
                    program.buffers()[buffer].name
                ))
            };
            loaded.clear();
            for read in &leaf.reads {
                let offset = read
                    .offset(inst.slots)
                    .ok_or_else(|| out_of_bounds(read.buffer))?;
                loaded.push(buffers[read.buffer][offset]);
            }
            let value = leaf.expr.eval(&loaded, inst.slots);
            let store = &leaf.store;
            let offset = store
                .offset(inst.slots)
                .ok_or_else(|| out_of_bounds(store.buffer))?;
            buffers[store.buffer][offset] = program.buffers()[store.buffer].dtype.round(value);
            Ok(())
        })?;
        Ok(buffers)
    }
}

/// Interprets `tree` once, returning the final contents of each non-input buffer by
/// name.
pub fn execute(
    tree: &SyntaxTree,
    inputs: &InputBuffers,
) -> Result<BTreeMap<String, Vec<f64>>, BackendError> {
    let kernel = Interpreter.build(tree, None)?;
    let buffers = kernel.run(inputs, None)?;
    Ok(tree
        .program()
        .buffers()
        .iter()
        .zip(buffers)
        .filter(|(b, _)| b.kind != BufferKind::Input)
        .map(|(b, values)| (b.name.clone(), values))
        .collect())
}
