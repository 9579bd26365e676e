//! Scores trees by building them into kernels and timing them.

use super::{EvalError, Evaluator, MAX_COST};
use crate::common::BufferKind;
use crate::program::Program;
use crate::syntax::SyntaxTree;

use clap::ValueEnum;
use dashmap::DashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_RUNS: usize = 5;

/// Kernels kept by an [ExecutionEvaluator] before the oldest are dropped.
pub const DEFAULT_KERNEL_CAPACITY: usize = 256;

/// Builds trees into runnable kernels and times them.
pub trait Backend: Send + Sync {
    type Kernel: Send + Sync;

    fn name(&self) -> &str;

    /// Builds `tree` into a kernel. Building must not continue past `deadline`.
    fn build(
        &self,
        tree: &SyntaxTree,
        deadline: Option<Instant>,
    ) -> Result<Self::Kernel, BackendError>;

    /// Runs `kernel` `runs` times, returning the time of each run. Runs must not
    /// continue past `deadline`.
    fn measure(
        &self,
        kernel: &Self::Kernel,
        inputs: &InputBuffers,
        runs: usize,
        deadline: Option<Instant>,
    ) -> Result<Vec<Duration>, BackendError>;
}

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// The kernel itself failed, e.g. did not compile or crashed.
    #[error("{0:#}")]
    Kernel(anyhow::Error),
    /// The surrounding machinery failed.
    #[error("{0:#}")]
    Harness(anyhow::Error),
    #[error("deadline exceeded")]
    Timeout,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum TimingReduction {
    #[default]
    Min,
    Mean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub runs: usize,
    pub reduction: TimingReduction,
    /// Per-evaluation limit. Trees that exceed it score [MAX_COST].
    pub timeout: Option<Duration>,
}

/// Initial contents of a program's input buffers, keyed by buffer name, in
/// row-major order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputBuffers {
    values: BTreeMap<String, Vec<f64>>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("no values given for input buffer `{0}`")]
    Missing(String),
    #[error("`{buffer}` needs {expected} values but {actual} were given")]
    WrongSize {
        buffer: String,
        expected: usize,
        actual: usize,
    },
    #[error("`{0}` is not an input buffer of the program")]
    NotAnInput(String),
}

pub struct ExecutionEvaluator<B: Backend> {
    backend: B,
    inputs: InputBuffers,
    config: ExecutionConfig,
    /// Built kernels keyed by schedule text. Each cell is locked while its kernel
    /// builds, so a cached schedule is built at most once.
    kernels: DashMap<String, Arc<Mutex<Option<Arc<B::Kernel>>>>>,
    /// Keys of `kernels` in the order they were built.
    build_order: Mutex<VecDeque<String>>,
    kernel_capacity: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            runs: runs_from_env(),
            reduction: TimingReduction::default(),
            timeout: None,
        }
    }
}

/// The run count given by the `NB_EXEC` environment variable, or [DEFAULT_RUNS].
pub fn runs_from_env() -> usize {
    match std::env::var("NB_EXEC") {
        Ok(v) => match v.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                warn!("Ignoring invalid NB_EXEC value {:?}", v);
                DEFAULT_RUNS
            }
        },
        Err(_) => DEFAULT_RUNS,
    }
}

impl TimingReduction {
    /// Reduces run times to milliseconds.
    pub fn reduce(&self, times: &[Duration]) -> Option<f64> {
        let millis = times.iter().map(|t| t.as_nanos() as f64 / 1e6);
        match self {
            TimingReduction::Min => millis.reduce(f64::min),
            TimingReduction::Mean => {
                if times.is_empty() {
                    None
                } else {
                    Some(millis.sum::<f64>() / times.len() as f64)
                }
            }
        }
    }
}

impl InputBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, buffer: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(buffer, values);
        self
    }

    pub fn insert(&mut self, buffer: impl Into<String>, values: Vec<f64>) {
        self.values.insert(buffer.into(), values);
    }

    pub fn get(&self, buffer: &str) -> Option<&[f64]> {
        self.values.get(buffer).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f64])> + '_ {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Pseudo-random contents for every input buffer of `program`, rounded to each
    /// buffer's dtype.
    pub fn generate(program: &Program, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut inputs = InputBuffers::new();
        for buffer in program.buffers() {
            if buffer.kind != BufferKind::Input {
                continue;
            }
            let values = (0..buffer.volume())
                .map(|_| buffer.dtype.round(rng.gen_range(-8.0..8.0)))
                .collect();
            inputs.insert(buffer.name.clone(), values);
        }
        inputs
    }

    /// Checks that every input buffer of `program`, and nothing else, has a value
    /// per element.
    pub fn validate(&self, program: &Program) -> Result<(), InputError> {
        for name in self.values.keys() {
            match program.buffer_index(name) {
                Some(idx) if program.buffers()[idx].kind == BufferKind::Input => {}
                _ => return Err(InputError::NotAnInput(name.clone())),
            }
        }
        for buffer in program.buffers() {
            if buffer.kind != BufferKind::Input {
                continue;
            }
            let values = self
                .get(&buffer.name)
                .ok_or_else(|| InputError::Missing(buffer.name.clone()))?;
            if values.len() != buffer.volume() {
                return Err(InputError::WrongSize {
                    buffer: buffer.name.clone(),
                    expected: buffer.volume(),
                    actual: values.len(),
                });
            }
        }
        Ok(())
    }
}

impl<B: Backend> ExecutionEvaluator<B> {
    pub fn new(
        program: &Program,
        backend: B,
        inputs: InputBuffers,
        config: ExecutionConfig,
    ) -> Result<Self, InputError> {
        inputs.validate(program)?;
        Ok(ExecutionEvaluator {
            backend,
            inputs,
            config,
            kernels: DashMap::new(),
            build_order: Mutex::new(VecDeque::new()),
            kernel_capacity: DEFAULT_KERNEL_CAPACITY,
        })
    }

    /// Keeps at most `capacity` built kernels, dropping the oldest first.
    pub fn with_kernel_capacity(mut self, capacity: usize) -> Self {
        self.kernel_capacity = capacity.max(1);
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn inputs(&self) -> &InputBuffers {
        &self.inputs
    }

    /// The number of built kernels currently cached.
    pub fn built_kernels(&self) -> usize {
        self.build_order.lock().len()
    }

    fn kernel(
        &self,
        tree: &SyntaxTree,
        deadline: Option<Instant>,
    ) -> Result<Arc<B::Kernel>, BackendError> {
        let key = tree.schedule().to_string();
        // Clone the cell out so the map's shard lock is not held while building.
        let cell = Arc::clone(self.kernels.entry(key.clone()).or_default().value());
        let mut slot = cell.lock();
        if let Some(kernel) = slot.as_ref() {
            return Ok(Arc::clone(kernel));
        }
        debug!("Building {} kernel for\n{}", self.backend.name(), tree);
        let kernel = match self.backend.build(tree, deadline) {
            Ok(kernel) => Arc::new(kernel),
            Err(e) => {
                drop(slot);
                self.kernels.remove(&key);
                return Err(e);
            }
        };
        *slot = Some(Arc::clone(&kernel));
        drop(slot);
        self.remember(key);
        Ok(kernel)
    }

    /// Records a newly built kernel, evicting the oldest ones beyond capacity.
    fn remember(&self, key: String) {
        let mut order = self.build_order.lock();
        order.push_back(key);
        while order.len() > self.kernel_capacity {
            if let Some(oldest) = order.pop_front() {
                debug!("Evicting kernel for schedule {:?}", oldest);
                self.kernels.remove(&oldest);
            }
        }
    }
}

impl<B: Backend> Evaluator for ExecutionEvaluator<B> {
    fn evaluate(&self, tree: &SyntaxTree) -> Result<f64, EvalError> {
        let start = Instant::now();
        let deadline = self.config.timeout.map(|t| start + t);
        let kernel = match self.kernel(tree, deadline) {
            Ok(kernel) => kernel,
            Err(BackendError::Timeout) => {
                debug!("Build timed out after {:?}; scoring as MAX_COST", start.elapsed());
                return Ok(MAX_COST);
            }
            Err(BackendError::Kernel(e)) => return Err(EvalError::KernelBuild(e)),
            Err(BackendError::Harness(e)) => return Err(EvalError::Internal(e)),
        };
        if deadline.map_or(false, |d| Instant::now() >= d) {
            debug!("Deadline passed while building; scoring as MAX_COST");
            return Ok(MAX_COST);
        }
        let runs = self.config.runs.max(1);
        match self.backend.measure(&kernel, &self.inputs, runs, deadline) {
            Ok(times) => self.config.reduction.reduce(&times).ok_or_else(|| {
                EvalError::Internal(anyhow::anyhow!("backend returned no measurements"))
            }),
            Err(BackendError::Timeout) => {
                debug!("Timed out after {:?}; scoring as MAX_COST", start.elapsed());
                Ok(MAX_COST)
            }
            Err(BackendError::Kernel(e)) => Err(EvalError::KernelRun(e)),
            Err(BackendError::Harness(e)) => Err(EvalError::Internal(e)),
        }
    }

    fn name(&self) -> &str {
        "execution"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::library;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A backend whose kernels "run" for a fixed time per transformation.
    #[derive(Default)]
    struct FakeBackend {
        builds: AtomicUsize,
        fail_builds: bool,
        build_time: Option<Duration>,
        time_out: bool,
    }

    impl Backend for FakeBackend {
        type Kernel = usize;

        fn name(&self) -> &str {
            "fake"
        }

        fn build(
            &self,
            tree: &SyntaxTree,
            deadline: Option<Instant>,
        ) -> Result<usize, BackendError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_builds {
                return Err(BackendError::Kernel(anyhow::anyhow!("no compiler")));
            }
            if let Some(build_time) = self.build_time {
                std::thread::sleep(build_time);
                if deadline.map_or(false, |d| Instant::now() >= d) {
                    return Err(BackendError::Timeout);
                }
            }
            Ok(tree.depth())
        }

        fn measure(
            &self,
            kernel: &usize,
            _inputs: &InputBuffers,
            runs: usize,
            _deadline: Option<Instant>,
        ) -> Result<Vec<Duration>, BackendError> {
            if self.time_out {
                return Err(BackendError::Timeout);
            }
            Ok((0..runs)
                .map(|r| Duration::from_millis((10 + *kernel + r) as u64))
                .collect())
        }
    }

    fn config(reduction: TimingReduction) -> ExecutionConfig {
        ExecutionConfig {
            runs: 3,
            reduction,
            timeout: None,
        }
    }

    #[test]
    fn test_inputs_are_validated() {
        let program = library::producer_consumer(4).build().unwrap();
        let missing = ExecutionEvaluator::new(
            &program,
            FakeBackend::default(),
            InputBuffers::new(),
            config(TimingReduction::Min),
        );
        assert_eq!(missing.err(), Some(InputError::Missing("input".into())));

        let short = InputBuffers::new().with("input", vec![1.0; 3]);
        assert_eq!(
            short.validate(&program),
            Err(InputError::WrongSize {
                buffer: "input".into(),
                expected: 4,
                actual: 3
            })
        );
        let extra = InputBuffers::generate(&program, 0).with("out", vec![0.0; 4]);
        assert_eq!(
            extra.validate(&program),
            Err(InputError::NotAnInput("out".into()))
        );
        assert!(InputBuffers::generate(&program, 0).validate(&program).is_ok());
    }

    #[test]
    fn test_reductions() {
        let program = library::producer_consumer(4).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone());
        let inputs = InputBuffers::generate(&program, 1);
        let min = ExecutionEvaluator::new(
            &program,
            FakeBackend::default(),
            inputs.clone(),
            config(TimingReduction::Min),
        )
        .unwrap();
        let mean = ExecutionEvaluator::new(
            &program,
            FakeBackend::default(),
            inputs,
            config(TimingReduction::Mean),
        )
        .unwrap();
        assert_eq!(min.evaluate(&tree).unwrap(), 10.0);
        assert_eq!(mean.evaluate(&tree).unwrap(), 11.0);
    }

    #[test]
    fn test_kernels_are_built_once_per_schedule() {
        let program = library::matmul(8).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone());
        let eval = ExecutionEvaluator::new(
            &program,
            FakeBackend::default(),
            InputBuffers::generate(&program, 0),
            config(TimingReduction::Min),
        )
        .unwrap();
        let neighbors = tree.neighbors().take(4).collect::<Vec<_>>();
        rayon::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    for n in &neighbors {
                        eval.evaluate(n).unwrap();
                    }
                });
            }
        });
        assert_eq!(eval.backend().builds.load(Ordering::SeqCst), 4);
        assert_eq!(eval.built_kernels(), 4);
    }

    #[test]
    fn test_failures_and_timeouts() {
        let program = library::producer_consumer(4).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone());
        let failing = ExecutionEvaluator::new(
            &program,
            FakeBackend {
                fail_builds: true,
                ..FakeBackend::default()
            },
            InputBuffers::generate(&program, 0),
            config(TimingReduction::Min),
        )
        .unwrap();
        let err = failing.evaluate(&tree).unwrap_err();
        assert!(err.is_kernel_failure(), "{err}");

        let slow = ExecutionEvaluator::new(
            &program,
            FakeBackend {
                time_out: true,
                ..FakeBackend::default()
            },
            InputBuffers::generate(&program, 0),
            config(TimingReduction::Min),
        )
        .unwrap();
        assert_eq!(slow.evaluate(&tree).unwrap(), MAX_COST);
    }

    #[test]
    fn test_slow_build_scores_max_cost() {
        let program = library::producer_consumer(4).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone());
        let eval = ExecutionEvaluator::new(
            &program,
            FakeBackend {
                build_time: Some(Duration::from_millis(50)),
                ..FakeBackend::default()
            },
            InputBuffers::generate(&program, 0),
            ExecutionConfig {
                timeout: Some(Duration::from_millis(10)),
                ..config(TimingReduction::Min)
            },
        )
        .unwrap();
        assert_eq!(eval.evaluate(&tree).unwrap(), MAX_COST);
        assert_eq!(eval.built_kernels(), 0);
        // Nothing was cached, so the next evaluation builds again.
        assert_eq!(eval.evaluate(&tree).unwrap(), MAX_COST);
        assert_eq!(eval.backend().builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_oldest_kernels_are_evicted() {
        let program = library::matmul(8).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone());
        let eval = ExecutionEvaluator::new(
            &program,
            FakeBackend::default(),
            InputBuffers::generate(&program, 0),
            config(TimingReduction::Min),
        )
        .unwrap()
        .with_kernel_capacity(2);
        let neighbors = tree.neighbors().take(3).collect::<Vec<_>>();
        for n in &neighbors {
            eval.evaluate(n).unwrap();
        }
        assert_eq!(eval.built_kernels(), 2);
        assert_eq!(eval.backend().builds.load(Ordering::SeqCst), 3);

        // The newest kernel is still cached; the oldest is rebuilt.
        eval.evaluate(&neighbors[2]).unwrap();
        assert_eq!(eval.backend().builds.load(Ordering::SeqCst), 3);
        eval.evaluate(&neighbors[0]).unwrap();
        assert_eq!(eval.backend().builds.load(Ordering::SeqCst), 4);
        assert_eq!(eval.built_kernels(), 2);
    }

    #[test]
    fn test_interpreter_repeated_evaluations_agree() {
        use crate::interp::Interpreter;

        let program = library::matmul(12).build().unwrap();
        let tree = SyntaxTree::from_program(program.clone())
            .derive(&crate::scheduling::Transformation::Tile {
                dim: "i_1".into(),
                factor: 4,
            })
            .unwrap();
        let eval = ExecutionEvaluator::new(
            &program,
            Interpreter,
            InputBuffers::generate(&program, 2),
            config(TimingReduction::Min),
        )
        .unwrap();
        let times = (0..3)
            .map(|_| eval.evaluate(&tree).unwrap())
            .collect::<Vec<_>>();
        assert!(times.iter().all(|t| t.is_finite() && *t > 0.0 && *t < MAX_COST));
        assert_eq!(eval.built_kernels(), 1);
        let fastest = times.iter().copied().fold(f64::INFINITY, f64::min);
        let slowest = times.iter().copied().fold(0.0, f64::max);
        assert!(slowest <= fastest * 50.0, "{times:?}");
    }
}
