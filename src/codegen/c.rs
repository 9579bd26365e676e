use crate::common::BufferKind;
use crate::expr::{Affine, Term};
use crate::program::{BinOp, Expr, Program};
use crate::syntax::{Leaf, LoopNode, Node, SyntaxTree};
use crate::utils::{indent, LinePrefixWrite};

use itertools::Itertools;
use std::fmt::{self, Write};

const KERNEL_NAME: &str = "kernel";

const PRELUDE: &str = "\
#include <math.h>
#include <stdint.h>
#include <stdio.h>
#include <stdlib.h>
#include <string.h>
#include <time.h>

#define MIN(a, b) ((a) < (b) ? (a) : (b))
#define MAX(a, b) ((a) > (b) ? (a) : (b))

static struct timespec ts_diff(struct timespec start, struct timespec end) {
  struct timespec delta;
  if (end.tv_nsec < start.tv_nsec) {
    delta.tv_sec = end.tv_sec - start.tv_sec - 1;
    delta.tv_nsec = 1000000000 + end.tv_nsec - start.tv_nsec;
  } else {
    delta.tv_sec = end.tv_sec - start.tv_sec;
    delta.tv_nsec = end.tv_nsec - start.tv_nsec;
  }
  return delta;
}

static int load_input(const char *dir, const char *name, void *dst, size_t bytes) {
  char path[4096];
  snprintf(path, sizeof(path), \"%s/%s.bin\", dir, name);
  FILE *f = fopen(path, \"rb\");
  if (!f) {
    perror(path);
    return -1;
  }
  size_t read = fread(dst, 1, bytes, f);
  fclose(f);
  return read == bytes ? 0 : -1;
}
";

/// Emits a C99 translation unit holding `tree` as a kernel function, plus a `main`
/// that loads inputs from `argv[2]`, runs the kernel `argv[1]` times, and prints one
/// `cpu: <s>s <ns>ns` line per run.
pub fn emit_source<W: Write>(tree: &SyntaxTree, out: &mut W) -> fmt::Result {
    let program = tree.program();
    {
        let mut comment = LinePrefixWrite::new(&mut *out, "// ");
        writeln!(comment, "{}", program.name())?;
        write!(comment, "{}", tree.schedule())?;
    }
    out.write_str(PRELUDE)?;
    writeln!(out)?;
    emit_kernel(tree, out)?;
    writeln!(out)?;
    emit_main(program, out)
}

fn emit_kernel<W: Write>(tree: &SyntaxTree, out: &mut W) -> fmt::Result {
    let program = tree.program();
    let params = program
        .buffers()
        .iter()
        .map(|b| format!("{} *restrict b_{}", b.dtype.c_type(), b.name))
        .join(", ");
    writeln!(out, "static void {KERNEL_NAME}({params}) {{")?;
    for node in tree.roots() {
        emit_node(program, node, 1, out)?;
    }
    writeln!(out, "}}")
}

fn emit_node<W: Write>(program: &Program, node: &Node, depth: usize, out: &mut W) -> fmt::Result {
    match node {
        Node::Loop(l) => emit_loop(program, l, depth, out),
        Node::Leaf(leaf) => emit_leaf(program, leaf, depth, out),
    }
}

fn emit_loop<W: Write>(program: &Program, l: &LoopNode, depth: usize, out: &mut W) -> fmt::Result {
    // Preprocessor directives are not indented.
    if l.tags.parallel {
        writeln!(out, "#pragma omp parallel for")?;
    }
    if let Some(width) = l.tags.vectorize {
        writeln!(
            out,
            "#pragma clang loop vectorize(enable) vectorize_width({width})"
        )?;
    }
    if let Some(factor) = l.tags.unroll {
        writeln!(out, "#pragma unroll {factor}")?;
    }
    let var = loop_var(&l.dim);
    let upper = match &l.clamp {
        Some(clamp) => format!("MIN({}, {})", c_affine(&l.upper), c_affine(clamp)),
        None => c_affine(&l.upper),
    };
    writeln!(
        out,
        "{}for (int64_t {var} = {}; {var} < {upper}; {var}++) {{",
        indent(depth),
        c_affine(&l.lower),
    )?;
    for child in &l.children {
        emit_node(program, child, depth + 1, out)?;
    }
    writeln!(out, "{}}}", indent(depth))
}

fn emit_leaf<W: Write>(program: &Program, leaf: &Leaf, depth: usize, out: &mut W) -> fmt::Result {
    let comp = &program.computations()[leaf.computation];
    writeln!(
        out,
        "{}{} = {};",
        indent(depth),
        c_access(program, leaf, comp.store.buffer, &comp.store.indices),
        c_expr(program, leaf, &comp.expr)
    )
}

fn emit_main<W: Write>(program: &Program, out: &mut W) -> fmt::Result {
    let depth = 1;
    writeln!(out, "int main(int argc, char *argv[]) {{")?;
    writeln!(out, "{}if (argc != 3) {{", indent(depth))?;
    writeln!(
        out,
        "{}fprintf(stderr, \"usage: %s RUNS INPUT_DIR\\n\", argv[0]);",
        indent(depth + 1)
    )?;
    writeln!(out, "{}return 2;", indent(depth + 1))?;
    writeln!(out, "{}}}", indent(depth))?;
    writeln!(out, "{}const long runs = atol(argv[1]);", indent(depth))?;
    writeln!(out, "{}const char *dir = argv[2];", indent(depth))?;

    for b in program.buffers() {
        let ty = b.dtype.c_type();
        let bytes = format!("sizeof({ty}) * {}", b.volume());
        writeln!(out, "{}{ty} *b_{} = malloc({bytes});", indent(depth), b.name)?;
        writeln!(out, "{}if (!b_{}) return 3;", indent(depth), b.name)?;
        if b.kind == BufferKind::Input {
            writeln!(
                out,
                "{}if (load_input(dir, \"{}\", b_{}, {bytes})) return 4;",
                indent(depth),
                b.name,
                b.name
            )?;
        }
    }

    let args = program
        .buffers()
        .iter()
        .map(|b| format!("b_{}", b.name))
        .join(", ");
    writeln!(out, "{}struct timespec start, end;", indent(depth))?;
    writeln!(out, "{}for (long run = 0; run < runs; ++run) {{", indent(depth))?;
    for b in program.buffers().iter().filter(|b| b.kind != BufferKind::Input) {
        writeln!(
            out,
            "{}memset(b_{}, 0, sizeof({}) * {});",
            indent(depth + 1),
            b.name,
            b.dtype.c_type(),
            b.volume()
        )?;
    }
    writeln!(out, "{}clock_gettime(CLOCK_MONOTONIC, &start);", indent(depth + 1))?;
    writeln!(out, "{}{KERNEL_NAME}({args});", indent(depth + 1))?;
    writeln!(out, "{}clock_gettime(CLOCK_MONOTONIC, &end);", indent(depth + 1))?;
    writeln!(
        out,
        "{}struct timespec delta = ts_diff(start, end);",
        indent(depth + 1)
    )?;
    writeln!(
        out,
        "{}printf(\"cpu: %llds %lldns\\n\", (long long)delta.tv_sec, (long long)delta.tv_nsec);",
        indent(depth + 1)
    )?;
    writeln!(out, "{}}}", indent(depth))?;

    for b in program.buffers() {
        writeln!(out, "{}free(b_{});", indent(depth), b.name)?;
    }
    writeln!(out, "{}return 0;", indent(depth))?;
    writeln!(out, "}}")
}

fn loop_var(dim: &str) -> String {
    format!("l_{dim}")
}

/// An affine form over loop variables as a parenthesized C expression.
fn c_affine(form: &Affine) -> String {
    let mut parts = form
        .0
        .iter()
        .map(|Term(coeff, var)| match coeff {
            1 => loop_var(var),
            -1 => format!("-{}", loop_var(var)),
            _ => format!("{coeff} * {}", loop_var(var)),
        })
        .collect::<Vec<_>>();
    if form.1 != 0 || parts.is_empty() {
        parts.push(form.1.to_string());
    }
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        format!("({})", parts.join(" + "))
    }
}

fn c_access(program: &Program, leaf: &Leaf, buffer: usize, indices: &[Affine]) -> String {
    let buf = &program.buffers()[buffer];
    let offset = indices
        .iter()
        .zip(buf.strides())
        .map(|(idx, stride)| {
            let idx = c_affine(&leaf.over_loops(program, idx));
            if stride == 1 {
                idx
            } else {
                format!("{idx} * {stride}")
            }
        })
        .join(" + ");
    let offset = if offset.is_empty() { "0".to_owned() } else { offset };
    format!("b_{}[{offset}]", buf.name)
}

fn c_expr(program: &Program, leaf: &Leaf, expr: &Expr) -> String {
    match expr {
        Expr::Const(v) => format!("{v:?}"),
        Expr::Iter(name) => format!(
            "(double){}",
            c_affine(&leaf.over_loops(program, &Affine::from(name.as_str())))
        ),
        Expr::Load(access) => c_access(program, leaf, access.buffer, &access.indices),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = c_expr(program, leaf, lhs);
            let rhs = c_expr(program, leaf, rhs);
            match op {
                BinOp::Min => format!("fmin({lhs}, {rhs})"),
                BinOp::Max => format!("fmax({lhs}, {rhs})"),
                _ => format!("({lhs} {} {rhs})", op.symbol()),
            }
        }
        Expr::Neg(arg) => format!("(-{})", c_expr(program, leaf, arg)),
        Expr::Call(intrinsic, args) => format!(
            "{}({})",
            intrinsic.name(),
            args.iter().map(|a| c_expr(program, leaf, a)).join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::library;
    use crate::scheduling::Schedule;
    use std::sync::Arc;

    fn source(desc: crate::program::ProgramDesc, schedule: &str) -> String {
        let tree = SyntaxTree::from_program(desc.build().unwrap());
        let schedule: Schedule = schedule.parse().unwrap();
        let tree = SyntaxTree::replay(Arc::clone(tree.context()), &schedule).unwrap();
        let mut out = String::new();
        emit_source(&tree, &mut out).unwrap();
        out
    }

    #[test]
    fn test_c_affine() {
        assert_eq!(c_affine(&"8*i0 + i1".parse().unwrap()), "(8 * l_i0 + l_i1)");
        assert_eq!(c_affine(&"-i + 3".parse().unwrap()), "(-l_i + 3)");
        assert_eq!(c_affine(&"0".parse().unwrap()), "0");
        assert_eq!(c_affine(&"j".parse().unwrap()), "l_j");
    }

    #[test]
    fn test_emitted_matmul() {
        let src = source(library::matmul(16), "");
        assert!(src.contains(
            "static void kernel(double *restrict b_A, double *restrict b_B, double *restrict b_C) {"
        ));
        assert!(src.contains("for (int64_t l_k = 0; l_k < 16; l_k++) {"));
        assert!(src.contains(
            "b_C[l_i_1 * 16 + l_j_1] = (b_C[l_i_1 * 16 + l_j_1] + (b_A[l_i_1 * 16 + l_k] * b_B[l_k * 16 + l_j_1]));"
        ));
        assert!(src.contains("memset(b_C, 0, sizeof(double) * 256);"));
        assert!(src.contains("if (load_input(dir, \"A\", b_A, sizeof(double) * 256)) return 4;"));
    }

    #[test]
    fn test_emitted_pragmas_and_clamp() {
        let src = source(
            library::producer_consumer(42),
            "tile i 8\nparallelize i0\nvectorize i1 8\nunroll i_1 2\n",
        );
        assert!(src.contains("// tile i 8\n"));
        assert!(src.contains("#pragma omp parallel for\n  for (int64_t l_i0 = 0; l_i0 < 6; l_i0++) {"));
        assert!(src.contains(
            "#pragma clang loop vectorize(enable) vectorize_width(8)\n    \
             for (int64_t l_i1 = 0; l_i1 < MIN(8, (-8 * l_i0 + 42)); l_i1++) {"
        ));
        assert!(src.contains("#pragma unroll 2\n"));
    }
}
