//! Descriptions of a few classic loop nests.

use super::{ComputationDesc, ExprDesc, ProgramDesc};
use crate::common::{BufferKind, Dtype};

fn ld(buffer: &str, indices: &[&str]) -> ExprDesc {
    ExprDesc::load(buffer, indices)
}

/// `C = A * B` for square `n`×`n` matrices, with a separate zero-initialization nest.
pub fn matmul(n: i64) -> ProgramDesc {
    ProgramDesc::new("matmul")
        .param("N", n)
        .buffer("A", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("B", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("C", &["N", "N"], Dtype::Float64, BufferKind::Output)
        .computation(
            ComputationDesc::new("init")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .store("C", &["i", "j"])
                .expr(ExprDesc::constant(0.0)),
        )
        .computation(
            ComputationDesc::new("acc")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .iter("k", "0", "N")
                .store("C", &["i", "j"])
                .expr(ld("C", &["i", "j"]) + ld("A", &["i", "k"]) * ld("B", &["k", "j"])),
        )
}

/// `D = (A * B) * C` through a temporary, as in PolyBench's 2mm.
pub fn two_mm(n: i64) -> ProgramDesc {
    ProgramDesc::new("2mm")
        .param("N", n)
        .buffer("A", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("B", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("C", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("tmp", &["N", "N"], Dtype::Float64, BufferKind::Temporary)
        .buffer("D", &["N", "N"], Dtype::Float64, BufferKind::Output)
        .computation(
            ComputationDesc::new("tmp_init")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .store("tmp", &["i", "j"])
                .expr(ExprDesc::constant(0.0)),
        )
        .computation(
            ComputationDesc::new("tmp_acc")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .iter("k", "0", "N")
                .store("tmp", &["i", "j"])
                .expr(ld("tmp", &["i", "j"]) + ld("A", &["i", "k"]) * ld("B", &["k", "j"])),
        )
        .computation(
            ComputationDesc::new("d_init")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .store("D", &["i", "j"])
                .expr(ExprDesc::constant(0.0)),
        )
        .computation(
            ComputationDesc::new("d_acc")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .iter("k", "0", "N")
                .store("D", &["i", "j"])
                .expr(ld("D", &["i", "j"]) + ld("tmp", &["i", "k"]) * ld("C", &["k", "j"])),
        )
}

/// A separable 3×3 box blur: a horizontal pass into a temporary, then a vertical pass.
pub fn blur(n: i64) -> ProgramDesc {
    let third = || ExprDesc::constant(3.0);
    ProgramDesc::new("blur")
        .param("N", n)
        .buffer("input", &["N", "N"], Dtype::Float32, BufferKind::Input)
        .buffer("bx", &["N", "N - 2"], Dtype::Float32, BufferKind::Temporary)
        .buffer("by", &["N - 2", "N - 2"], Dtype::Float32, BufferKind::Output)
        .computation(
            ComputationDesc::new("blur_x")
                .iter("i", "0", "N")
                .iter("j", "0", "N - 2")
                .store("bx", &["i", "j"])
                .expr(
                    (ld("input", &["i", "j"])
                        + ld("input", &["i", "j + 1"])
                        + ld("input", &["i", "j + 2"]))
                        / third(),
                ),
        )
        .computation(
            ComputationDesc::new("blur_y")
                .iter("i", "0", "N - 2")
                .iter("j", "0", "N - 2")
                .store("by", &["i", "j"])
                .expr(
                    (ld("bx", &["i", "j"]) + ld("bx", &["i + 1", "j"]) + ld("bx", &["i + 2", "j"]))
                        / third(),
                ),
        )
}

/// In-place Cholesky factorization of a copy of `A` (PolyBench's cholesky), which has
/// triangular iteration domains.
pub fn cholesky(n: i64) -> ProgramDesc {
    ProgramDesc::new("cholesky")
        .param("N", n)
        .buffer("A", &["N", "N"], Dtype::Float64, BufferKind::Input)
        .buffer("L", &["N", "N"], Dtype::Float64, BufferKind::Output)
        .computation(
            ComputationDesc::new("copy")
                .iter("i", "0", "N")
                .iter("j", "0", "N")
                .store("L", &["i", "j"])
                .expr(ld("A", &["i", "j"])),
        )
        .computation(
            ComputationDesc::new("S1")
                .iter("i", "0", "N")
                .iter("j", "0", "i")
                .iter("k", "0", "j")
                .store("L", &["i", "j"])
                .expr(ld("L", &["i", "j"]) - ld("L", &["i", "k"]) * ld("L", &["j", "k"])),
        )
        .computation(
            ComputationDesc::new("S2")
                .iter("i", "0", "N")
                .iter("j", "0", "i")
                .store("L", &["i", "j"])
                .expr(ld("L", &["i", "j"]) / ld("L", &["j", "j"]))
                .after("S1", 1),
        )
        .computation(
            ComputationDesc::new("S3")
                .iter("i", "0", "N")
                .iter("k", "0", "i")
                .store("L", &["i", "i"])
                .expr(ld("L", &["i", "i"]) - ld("L", &["i", "k"]) * ld("L", &["i", "k"]))
                .after("S2", 0),
        )
        .computation(
            ComputationDesc::new("S4")
                .iter("i", "0", "N")
                .store("L", &["i", "i"])
                .expr(ExprDesc::call("sqrt", vec![ld("L", &["i", "i"])]))
                .after("S3", 0),
        )
}

/// Two single-loop computations: `buf[i] = 2 * input[i]`, then `out[i] = buf[i] + 1`.
pub fn producer_consumer(n: i64) -> ProgramDesc {
    ProgramDesc::new("producer_consumer")
        .param("N", n)
        .buffer("input", &["N"], Dtype::Float64, BufferKind::Input)
        .buffer("buf", &["N"], Dtype::Float64, BufferKind::Temporary)
        .buffer("out", &["N"], Dtype::Float64, BufferKind::Output)
        .computation(
            ComputationDesc::new("produce")
                .iter("i", "0", "N")
                .store("buf", &["i"])
                .expr(ExprDesc::constant(2.0) * ld("input", &["i"])),
        )
        .computation(
            ComputationDesc::new("consume")
                .iter("i", "0", "N")
                .store("out", &["i"])
                .expr(ld("buf", &["i"]) + ExprDesc::constant(1.0)),
        )
}
