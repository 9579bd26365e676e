use iai_callgrind::{black_box, main};

use loopsched::program::library;
use loopsched::syntax::SyntaxTree;

#[inline(never)]
fn collect_matmul_neighbors() {
    let tree = SyntaxTree::from_program(library::matmul(16).build().unwrap());
    black_box(tree.neighbors().collect::<Vec<_>>());
}

#[inline(never)]
fn collect_two_mm_neighbors() {
    let tree = SyntaxTree::from_program(library::two_mm(16).build().unwrap());
    black_box(tree.neighbors().collect::<Vec<_>>());
}

main!(
    callgrind_args = "--simulate-wb=no", "--simulate-hwpref=yes",
        "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64";
    functions = collect_matmul_neighbors, collect_two_mm_neighbors
);
