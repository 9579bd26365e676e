//! Whole-tree legality by dataflow comparison.
//!
//! A [DependenceOracle] records the dataflow of a program's initial nesting: which
//! instance produced the value each read observes, and which instance last wrote
//! each buffer cell. A transformed tree is legal when walking it in execution order
//! reproduces that dataflow exactly and no concurrent loop has two iterations
//! touching the same cell where at least one writes.

use crate::lowering::{ConcurrentIteration, Instance, LoweredKernel, LoweringError};
use crate::program::Program;

use smallvec::SmallVec;
use std::collections::HashMap;

/// Sentinel producer for cells never written (e.g., inputs).
const NO_WRITER: u32 = u32::MAX;

type InstanceKey = (usize, SmallVec<[i64; 4]>);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LegalityError {
    #[error("`{0}` executes a point outside its iteration domain")]
    OutsideDomain(String),
    #[error("`{0}` executes a point more than once")]
    Duplicated(String),
    #[error("{missing} instance(s) of `{computation}` no longer execute")]
    Dropped { computation: String, missing: usize },
    #[error("`{consumer}` no longer reads the value of `{buffer}` it depends on")]
    DependenceViolated { consumer: String, buffer: String },
    #[error("the final contents of `{0}` change")]
    OutputChanged(String),
    #[error("iterations of concurrent loop `{dim}` conflict on `{buffer}`")]
    ConcurrentConflict { dim: String, buffer: String },
    #[error("`{computation}` accesses `{buffer}` out of bounds")]
    OutOfBounds { computation: String, buffer: String },
    #[error(transparent)]
    Lowering(#[from] LoweringError),
}

#[derive(Debug)]
pub(crate) struct DependenceOracle {
    ids: HashMap<InstanceKey, u32>,
    computation_of: Vec<usize>,
    /// The producer of each read, per instance, in read order.
    read_sources: Vec<SmallVec<[u32; 4]>>,
    final_writers: Vec<Vec<u32>>,
}

impl DependenceOracle {
    pub(crate) fn build(program: &Program, kernel: &LoweredKernel) -> Result<Self, LegalityError> {
        let mut last_writer = empty_writers(program);
        let mut ids = HashMap::new();
        let mut computation_of = vec![];
        let mut read_sources = vec![];
        kernel.walk(&mut |inst: &Instance<'_>| {
            let leaf = inst.leaf;
            let id = computation_of.len() as u32;
            if ids
                .insert((leaf.computation, inst.iterator_values()), id)
                .is_some()
            {
                return Err(LegalityError::Duplicated(comp_name(program, leaf.computation)));
            }
            computation_of.push(leaf.computation);

            let mut sources = SmallVec::with_capacity(leaf.reads.len());
            for read in &leaf.reads {
                let offset = read
                    .offset(inst.slots)
                    .ok_or_else(|| out_of_bounds(program, leaf.computation, read.buffer))?;
                sources.push(last_writer[read.buffer][offset]);
            }
            read_sources.push(sources);

            let offset = leaf
                .store
                .offset(inst.slots)
                .ok_or_else(|| out_of_bounds(program, leaf.computation, leaf.store.buffer))?;
            last_writer[leaf.store.buffer][offset] = id;
            Ok(())
        })?;
        Ok(DependenceOracle {
            ids,
            computation_of,
            read_sources,
            final_writers: last_writer,
        })
    }

    pub(crate) fn instance_count(&self) -> usize {
        self.computation_of.len()
    }

    pub(crate) fn check(&self, program: &Program, kernel: &LoweredKernel) -> Result<(), LegalityError> {
        let mut executed = vec![false; self.computation_of.len()];
        let mut last_writer = empty_writers(program);
        let mut conflicts = ConflictTracker::default();
        kernel.walk(&mut |inst: &Instance<'_>| {
            let leaf = inst.leaf;
            let name = || comp_name(program, leaf.computation);
            let id = *self
                .ids
                .get(&(leaf.computation, inst.iterator_values()))
                .ok_or_else(|| LegalityError::OutsideDomain(name()))?;
            if std::mem::replace(&mut executed[id as usize], true) {
                return Err(LegalityError::Duplicated(name()));
            }

            for (read, &expected) in leaf.reads.iter().zip(&self.read_sources[id as usize]) {
                let offset = read
                    .offset(inst.slots)
                    .ok_or_else(|| out_of_bounds(program, leaf.computation, read.buffer))?;
                if last_writer[read.buffer][offset] != expected {
                    return Err(LegalityError::DependenceViolated {
                        consumer: name(),
                        buffer: program.buffers()[read.buffer].name.clone(),
                    });
                }
                conflicts.touch(program, kernel, inst.concurrent, read.buffer, offset, false)?;
            }

            let store = &leaf.store;
            let offset = store
                .offset(inst.slots)
                .ok_or_else(|| out_of_bounds(program, leaf.computation, store.buffer))?;
            conflicts.touch(program, kernel, inst.concurrent, store.buffer, offset, true)?;
            last_writer[store.buffer][offset] = id;
            Ok(())
        })?;

        if let Some(first_missing) = executed.iter().position(|e| !e) {
            let computation = self.computation_of[first_missing];
            let missing = executed
                .iter()
                .zip(&self.computation_of)
                .filter(|(e, c)| !**e && **c == computation)
                .count();
            return Err(LegalityError::Dropped {
                computation: comp_name(program, computation),
                missing,
            });
        }
        for (buffer, (actual, expected)) in last_writer.iter().zip(&self.final_writers).enumerate() {
            if actual != expected {
                return Err(LegalityError::OutputChanged(
                    program.buffers()[buffer].name.clone(),
                ));
            }
        }
        Ok(())
    }
}

fn empty_writers(program: &Program) -> Vec<Vec<u32>> {
    program
        .buffers()
        .iter()
        .map(|b| vec![NO_WRITER; b.volume()])
        .collect()
}

fn comp_name(program: &Program, computation: usize) -> String {
    program.computations()[computation].name.clone()
}

fn out_of_bounds(program: &Program, computation: usize, buffer: usize) -> LegalityError {
    LegalityError::OutOfBounds {
        computation: comp_name(program, computation),
        buffer: program.buffers()[buffer].name.clone(),
    }
}

/// Per-cell record of which iterations of the current activation of a concurrent
/// loop touched the cell.
#[derive(Debug, Clone, Copy, Default)]
struct CellUse {
    activation: u64,
    writer: Option<i64>,
    reader: Option<i64>,
    many_readers: bool,
}

#[derive(Default)]
struct ConflictTracker {
    /// Keyed by (loop slot, buffer); dense over the buffer's cells.
    cells: HashMap<(usize, usize), Vec<CellUse>>,
}

impl ConflictTracker {
    fn touch(
        &mut self,
        program: &Program,
        kernel: &LoweredKernel,
        concurrent: &[ConcurrentIteration],
        buffer: usize,
        offset: usize,
        is_write: bool,
    ) -> Result<(), LegalityError> {
        for ctx in concurrent {
            let cells = self
                .cells
                .entry((ctx.slot, buffer))
                .or_insert_with(|| vec![CellUse::default(); program.buffers()[buffer].volume()]);
            let cell = &mut cells[offset];
            if cell.activation != ctx.activation {
                *cell = CellUse {
                    activation: ctx.activation,
                    ..CellUse::default()
                };
            }
            let it = ctx.iteration;
            let conflict = if is_write {
                let conflict = cell.writer.map_or(false, |w| w != it)
                    || cell.reader.map_or(false, |r| r != it || cell.many_readers);
                cell.writer = Some(it);
                conflict
            } else {
                match cell.reader {
                    None => cell.reader = Some(it),
                    Some(r) if r != it => cell.many_readers = true,
                    Some(_) => {}
                }
                cell.writer.map_or(false, |w| w != it)
            };
            if conflict {
                return Err(LegalityError::ConcurrentConflict {
                    dim: kernel.loop_name(ctx.slot).to_owned(),
                    buffer: program.buffers()[buffer].name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{BufferKind, Dtype};
    use crate::program::{library, ComputationDesc, ExprDesc, ProgramDesc};
    use crate::scheduling::{ApplyError, Transformation};
    use crate::syntax::SyntaxTree;

    fn tree(desc: ProgramDesc) -> SyntaxTree {
        SyntaxTree::from_program(desc.build().unwrap())
    }

    fn illegal(tree: &SyntaxTree, t: Transformation) -> LegalityError {
        match tree.derive(&t) {
            Err(ApplyError::Illegal(e)) => e,
            other => panic!("expected {t} to be illegal, got {other:?}"),
        }
    }

    /// `a[i][j] = a[i - 1][j + 1] + 1`: a dependence with distance (1, -1).
    fn skewed_recurrence(n: i64) -> ProgramDesc {
        ProgramDesc::new("skewed")
            .param("N", n)
            .buffer("a", &["N", "N"], Dtype::Float64, BufferKind::Output)
            .computation(
                ComputationDesc::new("S")
                    .iter("i", "1", "N")
                    .iter("j", "0", "N - 1")
                    .store("a", &["i", "j"])
                    .expr(ExprDesc::load("a", &["i - 1", "j + 1"]) + ExprDesc::constant(1.0)),
            )
    }

    #[test]
    fn test_oracle_counts_instances() {
        let t = tree(library::matmul(4));
        let oracle = t.context().oracle().unwrap();
        assert_eq!(oracle.instance_count(), 16 + 64);
    }

    #[test]
    fn test_interchange_reversing_dependence_is_illegal() {
        let t = tree(skewed_recurrence(8));
        let err = illegal(
            &t,
            Transformation::Interchange {
                first: "i".into(),
                second: "j".into(),
            },
        );
        assert!(matches!(err, LegalityError::DependenceViolated { .. }), "{err}");
    }

    #[test]
    fn test_neighbors_omit_reversing_interchange() {
        let t = tree(skewed_recurrence(8));
        let interchange = Transformation::Interchange {
            first: "i".into(),
            second: "j".into(),
        };
        assert!(t.candidate_transformations().contains(&interchange));
        let neighbors = t.neighbors().collect::<Vec<_>>();
        assert!(!neighbors.is_empty());
        assert!(neighbors.iter().all(|n| n.is_legal()));
        assert!(!neighbors
            .iter()
            .any(|n| n.transformations().contains(&interchange)));
    }

    #[test]
    fn test_consumer_moved_ahead_of_same_index_producer_is_illegal() {
        let t = tree(library::producer_consumer(8));
        let err = illegal(
            &t,
            Transformation::Fuse {
                first: "consume".into(),
                second: "produce".into(),
                dim: "i_1".into(),
            },
        );
        assert!(matches!(err, LegalityError::DependenceViolated { .. }), "{err}");

        let forward = Transformation::Fuse {
            first: "produce".into(),
            second: "consume".into(),
            dim: "i".into(),
        };
        let neighbors = t.neighbors().collect::<Vec<_>>();
        assert!(neighbors
            .iter()
            .any(|n| n.transformations().contains(&forward)));
        assert!(!neighbors.iter().any(|n| n
            .transformations()
            .iter()
            .any(|x| matches!(x, Transformation::Fuse { first, .. } if first == "consume"))));
    }

    #[test]
    fn test_parallel_carried_dependence_is_illegal() {
        let t = tree(skewed_recurrence(8));
        let err = illegal(&t, Transformation::Parallelize { dim: "i".into() });
        assert!(matches!(err, LegalityError::ConcurrentConflict { .. }), "{err}");
        assert!(t
            .derive(&Transformation::Parallelize { dim: "j".into() })
            .is_ok());
    }

    #[test]
    fn test_vectorized_reduction_is_illegal() {
        let t = tree(library::matmul(8));
        let err = illegal(
            &t,
            Transformation::Vectorize {
                dim: "k".into(),
                factor: 4,
            },
        );
        assert!(matches!(err, LegalityError::ConcurrentConflict { .. }), "{err}");
    }

    #[test]
    fn test_fusing_consumer_ahead_of_producer_is_illegal() {
        let desc = ProgramDesc::new("shifted")
            .param("N", 16)
            .buffer("input", &["N"], Dtype::Float64, BufferKind::Input)
            .buffer("buf", &["N"], Dtype::Float64, BufferKind::Temporary)
            .buffer("out", &["N - 1"], Dtype::Float64, BufferKind::Output)
            .computation(
                ComputationDesc::new("produce")
                    .iter("i", "0", "N - 1")
                    .store("buf", &["i"])
                    .expr(ExprDesc::load("input", &["i"])),
            )
            .computation(
                ComputationDesc::new("consume")
                    .iter("i", "0", "N - 1")
                    .store("out", &["i"])
                    .expr(ExprDesc::load("buf", &["i + 1"])),
            );
        let t = tree(desc);
        let err = illegal(
            &t,
            Transformation::Fuse {
                first: "produce".into(),
                second: "consume".into(),
                dim: "i".into(),
            },
        );
        assert!(matches!(err, LegalityError::DependenceViolated { .. }), "{err}");
    }

    #[test]
    fn test_fusing_init_with_reduction_is_legal() {
        let t = tree(library::matmul(8));
        let fused = t
            .derive(&Transformation::Fuse {
                first: "init".into(),
                second: "acc".into(),
                dim: "j".into(),
            })
            .unwrap();
        assert_eq!(fused.roots().len(), 1);
        assert!(fused.is_legal());
    }
}
