use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::fs;
use std::io;
use std::path;
use std::sync::Arc;
use std::time::Duration;

use loopsched::autoscheduler::AutoScheduler;
use loopsched::codegen::{emit_source, ClangBackend};
use loopsched::color::{self, ColorMode};
use loopsched::evaluator::{
    Backend, Evaluator, ExecutionConfig, ExecutionEvaluator, InputBuffers, MachineModel,
    ModelEvaluator, TimingReduction,
};
use loopsched::interp::Interpreter;
use loopsched::pprint::{pprint_report, pprint_tree, TreePrintStyle};
use loopsched::program::{library, Program, ProgramDesc};
use loopsched::scheduling::Schedule;
use loopsched::search::{SearchConfig, SearchKind, SearchStrategy};
use loopsched::syntax::{ProgramContext, SyntaxTree};
use loopsched::utils::ToWriteFmt;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Color mode
    #[arg(long, value_enum, default_value_t = ColorMode::Auto)]
    color: ColorMode,

    /// Print style for the best tree
    #[arg(long, value_enum, default_value_t = TreePrintStyle::Full)]
    print_style: TreePrintStyle,

    /// Search method
    #[arg(long, value_enum, default_value_t = SearchKind::Beam)]
    search: SearchKind,

    /// Evaluator guiding the search
    #[arg(long, value_enum, default_value_t = EvaluatorKind::Model)]
    evaluator: EvaluatorKind,

    /// Backend used to measure the baseline and the best tree
    #[arg(long, value_enum, default_value_t = BackendKind::Interp)]
    backend: BackendKind,

    #[arg(long, default_value = "6")]
    max_depth: usize,

    #[arg(long, default_value = "2000")]
    max_explored: usize,

    /// Wall-clock budget for the search, in seconds
    #[arg(long)]
    time_budget_secs: Option<u64>,

    #[arg(long, default_value = "4")]
    beam_width: usize,

    #[arg(long, default_value = "8")]
    population: usize,

    #[arg(long, default_value = "16")]
    sample_size: usize,

    #[arg(long, default_value = "0")]
    seed: u64,

    /// Score neighbors on the calling thread only
    #[arg(long)]
    sequential: bool,

    /// Runs per measurement [default: $NB_EXEC, else 5]
    #[arg(long)]
    runs: Option<usize>,

    #[arg(long, value_enum, default_value_t = TimingReduction::Min)]
    reduction: TimingReduction,

    /// Per-measurement timeout, in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Seed for generated input buffers
    #[arg(long, default_value = "0")]
    input_seed: u64,

    /// Measure a saved schedule instead of searching
    #[arg(long)]
    replay: Option<path::PathBuf>,

    /// Write the best schedule to this file
    #[arg(long)]
    save_schedule: Option<path::PathBuf>,

    /// Print the generated C code of the best tree
    #[arg(long)]
    print_code: bool,

    #[command(subcommand)]
    program: ProgramArg,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum EvaluatorKind {
    Model,
    Execution,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum BackendKind {
    Interp,
    Clang,
}

#[derive(clap::Subcommand)]
enum ProgramArg {
    #[command(about = "Schedule a matrix multiplication")]
    Matmul { size: i64 },
    #[command(about = "Schedule two chained matrix multiplications")]
    TwoMm { size: i64 },
    #[command(about = "Schedule a separable 3x3 blur")]
    Blur { size: i64 },
    #[command(about = "Schedule a Cholesky factorization")]
    Cholesky { size: i64 },
    #[command(about = "Schedule a producer/consumer pair")]
    ProducerConsumer { size: i64 },
    #[command(about = "Schedule a program described in a JSON file")]
    Load { path: path::PathBuf },
}

impl Args {
    fn search_config(&self) -> SearchConfig {
        SearchConfig {
            max_depth: self.max_depth,
            max_explored: self.max_explored,
            time_budget: self.time_budget_secs.map(Duration::from_secs),
            beam_width: self.beam_width,
            sample_size: self.sample_size,
            population: self.population,
            seed: self.seed,
            parallel: !self.sequential,
            ..SearchConfig::default()
        }
    }

    fn execution_config(&self) -> ExecutionConfig {
        let defaults = ExecutionConfig::default();
        ExecutionConfig {
            runs: self.runs.unwrap_or(defaults.runs),
            reduction: self.reduction,
            timeout: self.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl ProgramArg {
    fn load(&self) -> Result<Program> {
        let desc = match self {
            ProgramArg::Matmul { size } => library::matmul(*size),
            ProgramArg::TwoMm { size } => library::two_mm(*size),
            ProgramArg::Blur { size } => library::blur(*size),
            ProgramArg::Cholesky { size } => library::cholesky(*size),
            ProgramArg::ProducerConsumer { size } => library::producer_consumer(*size),
            ProgramArg::Load { path } => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str::<ProgramDesc>(&text)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
        };
        Ok(desc.build()?)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    color::set_color_mode(args.color);
    let program = args.program.load()?;
    match args.backend {
        BackendKind::Interp => main_per_backend(&args, program, Interpreter),
        BackendKind::Clang => main_per_backend(&args, program, ClangBackend::new()?),
    }
}

fn main_per_backend<B: Backend>(args: &Args, program: Program, backend: B) -> Result<()> {
    let inputs = InputBuffers::generate(&program, args.input_seed);
    let executor = ExecutionEvaluator::new(&program, backend, inputs, args.execution_config())?;
    info!("Measuring with the {} backend", executor.backend().name());

    if let Some(schedule_path) = &args.replay {
        return replay(args, program, schedule_path, &executor);
    }

    let searcher = SearchStrategy::new(args.search, args.search_config());
    match args.evaluator {
        EvaluatorKind::Model => {
            let model = ModelEvaluator::new(MachineModel::host());
            schedule(args, program, searcher, model, &executor)
        }
        EvaluatorKind::Execution => schedule(args, program, searcher, &executor, &executor),
    }
}

fn schedule<E: Evaluator, X: Evaluator>(
    args: &Args,
    program: Program,
    searcher: SearchStrategy,
    evaluator: E,
    executor: X,
) -> Result<()> {
    let start_time = std::time::Instant::now();
    let mut scheduler =
        AutoScheduler::new(program, searcher, evaluator, executor).with_print_style(args.print_style);
    let report = scheduler.find_schedule()?;
    info!("find_schedule took {:?}", start_time.elapsed());
    pprint_report(report);
    println!();

    let applied = scheduler.apply_best_schedule()?;
    println!();
    print_outcome(&applied.schedule, applied.execution_time, applied.speedup);
    if args.print_code {
        println!();
        emit_source(&applied.tree, &mut ToWriteFmt(io::stdout()))?;
    }
    if let Some(path) = &args.save_schedule {
        fs::write(path, applied.schedule.to_string())
            .with_context(|| format!("writing {}", path.display()))?;
        info!("Saved schedule to {}", path.display());
    }
    Ok(())
}

fn replay<X: Evaluator>(
    args: &Args,
    program: Program,
    schedule_path: &path::Path,
    executor: X,
) -> Result<()> {
    let text = fs::read_to_string(schedule_path)
        .with_context(|| format!("reading {}", schedule_path.display()))?;
    let schedule = text.parse::<Schedule>()?;
    let context = ProgramContext::new(program);
    let tree = SyntaxTree::replay(Arc::clone(&context), &schedule)?;

    let baseline = executor.evaluate(&SyntaxTree::initial(context))?;
    pprint_tree(&tree, args.print_style);
    println!();
    let execution_time = executor.evaluate(&tree)?;
    print_outcome(&schedule, execution_time, baseline / execution_time);
    if args.print_code {
        println!();
        emit_source(&tree, &mut ToWriteFmt(io::stdout()))?;
    }
    Ok(())
}

fn print_outcome(schedule: &Schedule, execution_time: f64, speedup: f64) {
    if schedule.is_empty() {
        println!("Schedule: (none)");
    } else {
        println!("Schedule:");
        for t in schedule.iter() {
            println!("  {t}");
        }
    }
    println!("Execution time: {execution_time:.4} ms ({speedup:.2}x speedup)");
}
