pub mod autoscheduler;
pub mod codegen;
pub mod color;
pub mod common;
pub mod datadeps;
pub mod evaluator;
pub mod expr;
pub mod interp;
pub mod lowering;
pub mod pprint;
pub mod program;
pub mod scheduling;
pub mod search;
pub mod syntax;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;

pub use smallvec;
