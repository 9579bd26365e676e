//! Checks interpreted trees against independent [ndarray] implementations of the
//! library programs.

use crate::common::{BufferKind, Dtype};
use crate::evaluator::{BackendError, InputBuffers};
use crate::interp;
use crate::program::{Buffer, Program};
use crate::syntax::SyntaxTree;

use ndarray::{linalg::general_mat_mul, prelude::*};
use std::collections::BTreeMap;

/// Relative tolerance when comparing against a reference.
const TOLERANCE: f64 = 1e-6;

#[derive(thiserror::Error, Debug)]
pub enum VerificationError {
    #[error("no reference implementation for program `{0}`")]
    NoReference(String),
    #[error("input buffer `{0}` is missing or misshapen")]
    BadInput(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Check whether `tree` computes what its program means, by interpreting it and
/// comparing every output buffer against a reference implementation.
pub fn check_correctness(
    tree: &SyntaxTree,
    inputs: &InputBuffers,
) -> Result<bool, VerificationError> {
    let program = tree.program();
    let expected = reference_outputs(program, inputs)?;
    let actual = interp::execute(tree, inputs)?;
    let passed = expected.iter().all(|(name, reference)| {
        actual.get(name).map_or(false, |values| {
            values.len() == reference.len()
                && reference
                    .iter()
                    .zip(values)
                    .all(|(e, a)| (e - a).abs() <= TOLERANCE * e.abs().max(1.0))
        })
    });
    if passed {
        log::debug!("Tree passed correctness check");
    } else {
        log::debug!("Tree failed correctness check");
    }
    Ok(passed)
}

/// The expected contents of each output buffer of a library program, row-major.
pub fn reference_outputs(
    program: &Program,
    inputs: &InputBuffers,
) -> Result<BTreeMap<String, ArrayD<f64>>, VerificationError> {
    let mut outputs = BTreeMap::new();
    match program.name() {
        "matmul" => {
            let a = input_matrix(program, inputs, "A")?;
            let b = input_matrix(program, inputs, "B")?;
            outputs.insert("C".to_owned(), a.dot(&b).into_dyn());
        }
        "2mm" => {
            let a = input_matrix(program, inputs, "A")?;
            let b = input_matrix(program, inputs, "B")?;
            let c = input_matrix(program, inputs, "C")?;
            let tmp = a.dot(&b);
            let mut d = Array2::zeros((tmp.nrows(), c.ncols()));
            general_mat_mul(1.0, &tmp, &c, 0.0, &mut d);
            outputs.insert("D".to_owned(), d.into_dyn());
        }
        "blur" => {
            let input = input_matrix(program, inputs, "input")?;
            let round = |v: f64| program_dtype(program, "by").map_or(v, |d| d.round(v));
            let (rows, cols) = input.dim();
            let bx = Array2::from_shape_fn((rows, cols - 2), |(i, j)| {
                round(input.slice(s![i, j..j + 3]).sum() / 3.0)
            });
            let by = Array2::from_shape_fn((rows - 2, cols - 2), |(i, j)| {
                round(bx.slice(s![i..i + 3, j]).sum() / 3.0)
            });
            outputs.insert("by".to_owned(), by.into_dyn());
        }
        other => return Err(VerificationError::NoReference(other.to_owned())),
    }
    debug_assert!(outputs.keys().all(|name| program
        .buffers()
        .iter()
        .any(|b| &b.name == name && b.kind == BufferKind::Output)));
    Ok(outputs)
}

fn input_matrix(
    program: &Program,
    inputs: &InputBuffers,
    name: &str,
) -> Result<Array2<f64>, VerificationError> {
    let bad_input = || VerificationError::BadInput(name.to_owned());
    let buffer = find_buffer(program, name).ok_or_else(bad_input)?;
    let values = inputs.get(name).ok_or_else(bad_input)?;
    let [rows, cols] = buffer.shape[..] else {
        return Err(bad_input());
    };
    Array2::from_shape_vec((rows as usize, cols as usize), values.to_vec()).map_err(|_| bad_input())
}

fn find_buffer<'a>(program: &'a Program, name: &str) -> Option<&'a Buffer> {
    program.buffers().iter().find(|b| b.name == name)
}

fn program_dtype(program: &Program, name: &str) -> Option<Dtype> {
    find_buffer(program, name).map(|b| b.dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::library;
    use crate::scheduling::Schedule;
    use crate::syntax::ProgramContext;

    fn replayed(program: Program, schedule: &str) -> SyntaxTree {
        let schedule = schedule.parse::<Schedule>().unwrap();
        SyntaxTree::replay(ProgramContext::new(program), &schedule).unwrap()
    }

    #[test]
    fn test_matmul_initial_tree_is_correct() {
        let program = library::matmul(8).build().unwrap();
        let inputs = InputBuffers::generate(&program, 5);
        let tree = SyntaxTree::from_program(program);
        assert!(check_correctness(&tree, &inputs).unwrap());
    }

    #[test]
    fn test_tiled_matmul_is_correct() {
        let program = library::matmul(10).build().unwrap();
        let inputs = InputBuffers::generate(&program, 6);
        let tree = replayed(program, "tile i_1 4\ntile k 3\nparallelize i_10\n");
        assert!(check_correctness(&tree, &inputs).unwrap());
    }

    #[test]
    fn test_two_mm_and_blur_are_correct() {
        let program = library::two_mm(5).build().unwrap();
        let inputs = InputBuffers::generate(&program, 7);
        assert!(check_correctness(&SyntaxTree::from_program(program), &inputs).unwrap());

        let program = library::blur(9).build().unwrap();
        let inputs = InputBuffers::generate(&program, 8);
        assert!(check_correctness(&SyntaxTree::from_program(program), &inputs).unwrap());
    }

    #[test]
    fn test_unknown_program_has_no_reference() {
        let program = library::producer_consumer(4).build().unwrap();
        let inputs = InputBuffers::generate(&program, 0);
        assert!(matches!(
            check_correctness(&SyntaxTree::from_program(program), &inputs),
            Err(VerificationError::NoReference(_))
        ));
    }
}
