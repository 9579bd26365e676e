//! A scheduling session: measure the program as written, search for a better
//! tree, then measure the best tree found.

use crate::evaluator::{EvalError, Evaluator};
use crate::pprint::{pprint_string, TreePrintStyle};
use crate::program::Program;
use crate::scheduling::Schedule;
use crate::search::{SearchError, SearchMethod};
use crate::syntax::{ProgramContext, SyntaxTree};

use log::info;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct AutoScheduler<S: SearchMethod, E: Evaluator, X: Evaluator> {
    context: Arc<ProgramContext>,
    searcher: S,
    evaluator: E,
    executor: X,
    print_style: TreePrintStyle,
    baseline: Option<f64>,
    report: Option<SearchReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchReport {
    pub method: &'static str,
    pub evaluator: String,
    pub explored: usize,
    pub discarded: usize,
    pub best_evaluation: f64,
    /// Execution time of the initial tree, in milliseconds.
    pub baseline_time: f64,
    pub search_time: Duration,
    pub best_schedule: Schedule,
}

#[derive(Debug, Clone)]
pub struct AppliedSchedule {
    pub tree: SyntaxTree,
    pub schedule: Schedule,
    /// The tree as printed when it was applied.
    pub printed: String,
    /// Execution time of the best tree, in milliseconds.
    pub execution_time: f64,
    /// Baseline time over execution time.
    pub speedup: f64,
}

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("cannot measure the initial tree: {0}")]
    BaselineFailed(#[source] EvalError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("no schedule has been found yet")]
    NoSearchPerformed,
    #[error("cannot measure the best tree: {0}")]
    BestScheduleFailed(#[source] EvalError),
}

impl<S: SearchMethod, E: Evaluator, X: Evaluator> AutoScheduler<S, E, X> {
    /// `evaluator` guides the search; `executor` measures the baseline and the
    /// applied schedule.
    pub fn new(program: Program, searcher: S, evaluator: E, executor: X) -> Self {
        AutoScheduler {
            context: ProgramContext::new(program),
            searcher,
            evaluator,
            executor,
            print_style: TreePrintStyle::Full,
            baseline: None,
            report: None,
        }
    }

    pub fn with_print_style(mut self, print_style: TreePrintStyle) -> Self {
        self.print_style = print_style;
        self
    }

    pub fn context(&self) -> &Arc<ProgramContext> {
        &self.context
    }

    pub fn searcher(&self) -> &S {
        &self.searcher
    }

    pub fn report(&self) -> Option<&SearchReport> {
        self.report.as_ref()
    }

    pub fn initial_tree(&self) -> SyntaxTree {
        SyntaxTree::initial(Arc::clone(&self.context))
    }

    /// Execution time of the initial tree, measured once per session.
    pub fn baseline(&mut self) -> Result<f64, SchedulerError> {
        if let Some(baseline) = self.baseline {
            return Ok(baseline);
        }
        let baseline = self
            .executor
            .evaluate(&self.initial_tree())
            .map_err(SchedulerError::BaselineFailed)?;
        info!("Baseline ({}): {:.4} ms", self.executor.name(), baseline);
        self.baseline = Some(baseline);
        Ok(baseline)
    }

    pub fn find_schedule(&mut self) -> Result<&SearchReport, SchedulerError> {
        let baseline_time = self.baseline()?;
        let initial = self.initial_tree();

        let start = Instant::now();
        let best = self.searcher.search(initial, &self.evaluator)?;
        let best_schedule = best.schedule();
        let best_evaluation = best.evaluation().unwrap_or(f64::INFINITY);
        let search_time = start.elapsed();

        let report = SearchReport {
            method: self.searcher.name(),
            evaluator: self.evaluator.name().to_owned(),
            explored: self.searcher.explored(),
            discarded: self.searcher.discarded(),
            best_evaluation,
            baseline_time,
            search_time,
            best_schedule,
        };
        info!(
            "{} search with {} explored {} trees ({} discarded) in {:?}; best {:.4} with {} transformations",
            report.method,
            report.evaluator,
            report.explored,
            report.discarded,
            report.search_time,
            report.best_evaluation,
            report.best_schedule.len(),
        );
        Ok(self.report.insert(report))
    }

    /// Prints the best tree found by [AutoScheduler::find_schedule] and measures it.
    pub fn apply_best_schedule(&self) -> Result<AppliedSchedule, SchedulerError> {
        let report = self.report.as_ref().ok_or(SchedulerError::NoSearchPerformed)?;
        let tree = self
            .searcher
            .best_tree()
            .ok_or(SchedulerError::NoSearchPerformed)?
            .clone();

        let printed = pprint_string(&tree, self.print_style);
        print!("{printed}");

        let execution_time = self
            .executor
            .evaluate(&tree)
            .map_err(SchedulerError::BestScheduleFailed)?;
        let speedup = report.baseline_time / execution_time;
        info!(
            "Best schedule runs in {:.4} ms ({:.2}x over {:.4} ms)",
            execution_time, speedup, report.baseline_time
        );
        Ok(AppliedSchedule {
            schedule: tree.schedule(),
            tree,
            printed,
            execution_time,
            speedup,
        })
    }
}
