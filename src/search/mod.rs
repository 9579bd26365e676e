//! Search methods exploring trees reachable from an initial [SyntaxTree].
//!
//! Every method shares the bookkeeping in [SearchState]: candidates are
//! deduplicated by structure, scored in parallel, and the best tree so far (ties
//! broken toward fewer transformations) is kept along with a history of best costs.

use crate::evaluator::{EvalError, Evaluator};
use crate::syntax::SyntaxTree;

use clap::ValueEnum;
use enum_dispatch::enum_dispatch;
use itertools::Itertools;
use log::{debug, info};
use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, Instant};

pub use beam::BeamSearch;
pub use exhaustive::ExhaustiveSearch;
pub use greedy::GreedySearch;
pub use randomized::RandomizedSearch;

mod beam;
mod exhaustive;
mod greedy;
mod randomized;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    /// The most transformations a tree may carry.
    pub max_depth: usize,
    /// The most trees to evaluate, the initial tree included.
    pub max_explored: usize,
    pub time_budget: Option<Duration>,
    /// Relative improvement below which a round counts as a plateau.
    pub tolerance: f64,
    /// Plateau rounds tolerated before stopping.
    pub patience: usize,
    pub beam_width: usize,
    /// Mutation attempts per population member.
    pub sample_size: usize,
    pub population: usize,
    pub seed: u64,
    /// Derive and score neighbors on the rayon pool.
    pub parallel: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum SearchError {
    #[error("the initial tree cannot be evaluated: {0}")]
    InitialNotEvaluable(#[source] EvalError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SearchKind {
    Exhaustive,
    Beam,
    Greedy,
    Randomized,
}

/// Progress shared by every search method.
#[derive(Debug, Default)]
pub struct SearchState {
    explored: usize,
    discarded: usize,
    best: Option<SyntaxTree>,
    history: Vec<f64>,
    seen: HashSet<String>,
    started: Option<Instant>,
}

#[enum_dispatch]
pub trait SearchMethod {
    /// Searches from `initial`, returning the best tree found.
    fn search(
        &mut self,
        initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<&SyntaxTree, SearchError>;

    fn name(&self) -> &'static str;

    fn config(&self) -> &SearchConfig;

    fn state(&self) -> &SearchState;

    /// The number of trees evaluated so far.
    fn explored(&self) -> usize {
        self.state().explored
    }

    /// The number of candidates dropped because the evaluator failed on them.
    fn discarded(&self) -> usize {
        self.state().discarded
    }

    fn best_evaluation(&self) -> Option<f64> {
        self.best_tree().and_then(|t| t.evaluation().ok())
    }

    fn best_tree(&self) -> Option<&SyntaxTree> {
        self.state().best.as_ref()
    }

    /// The best cost after each round of the search. Never increases.
    fn history(&self) -> &[f64] {
        &self.state().history
    }
}

#[enum_dispatch(SearchMethod)]
pub enum SearchStrategy {
    Exhaustive(ExhaustiveSearch),
    Beam(BeamSearch),
    Greedy(GreedySearch),
    Randomized(RandomizedSearch),
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_depth: 6,
            max_explored: 2000,
            time_budget: None,
            tolerance: 0.01,
            patience: 2,
            beam_width: 4,
            sample_size: 16,
            population: 8,
            seed: 0,
            parallel: true,
        }
    }
}

impl SearchStrategy {
    pub fn new(kind: SearchKind, config: SearchConfig) -> Self {
        match kind {
            SearchKind::Exhaustive => ExhaustiveSearch::new(config).into(),
            SearchKind::Beam => BeamSearch::new(config).into(),
            SearchKind::Greedy => GreedySearch::new(config).into(),
            SearchKind::Randomized => RandomizedSearch::new(config).into(),
        }
    }
}

/// Orders evaluated trees by cost, then by number of transformations.
pub fn compare_trees(a: &SyntaxTree, b: &SyntaxTree) -> Ordering {
    cost(a)
        .total_cmp(&cost(b))
        .then_with(|| a.depth().cmp(&b.depth()))
}

fn cost(tree: &SyntaxTree) -> f64 {
    tree.evaluation().unwrap_or(f64::INFINITY)
}

/// True if `new` improves on `old` by more than `tolerance`, relatively.
fn improves(new: f64, old: f64, tolerance: f64) -> bool {
    new < old - tolerance * old.abs()
}

impl SearchState {
    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn best(&self) -> &SyntaxTree {
        self.best
            .as_ref()
            .expect("best tree is set when a search begins")
    }

    /// Resets the state and scores `initial`, which becomes the first best tree.
    fn begin(
        &mut self,
        mut initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<SyntaxTree, SearchError> {
        *self = SearchState {
            started: Some(Instant::now()),
            ..SearchState::default()
        };
        if !initial.is_evaluated() {
            let c = evaluator
                .evaluate(&initial)
                .map_err(SearchError::InitialNotEvaluable)?;
            // Cannot fail: checked above.
            let _ = initial.set_evaluation(c);
        }
        self.explored += 1;
        self.seen.insert(initial.structure_key());
        self.best = Some(initial.clone());
        self.history.push(cost(&initial));
        Ok(initial)
    }

    fn out_of_budget(&self, config: &SearchConfig) -> bool {
        self.explored >= config.max_explored
            || config.time_budget.map_or(false, |b| self.elapsed() >= b)
    }

    /// Marks `tree` as seen, returning false if an identical tree was seen before.
    fn visit(&mut self, tree: &SyntaxTree) -> bool {
        self.seen.insert(tree.structure_key())
    }

    /// Scores the unseen neighbors of `tree`, up to the remaining budget.
    fn expand(
        &mut self,
        config: &SearchConfig,
        tree: &SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Vec<SyntaxTree> {
        if tree.depth() >= config.max_depth || self.out_of_budget(config) {
            return vec![];
        }
        let neighbors = if config.parallel {
            tree.par_neighbors()
        } else {
            tree.neighbors().collect()
        };
        let fresh = neighbors
            .into_iter()
            .filter(|n| self.visit(n))
            .collect::<Vec<_>>();
        self.score(config, fresh, evaluator)
    }

    /// Evaluates `trees`, returning those the evaluator could score. Trees beyond
    /// the remaining budget are dropped unevaluated.
    fn score(
        &mut self,
        config: &SearchConfig,
        mut trees: Vec<SyntaxTree>,
        evaluator: &dyn Evaluator,
    ) -> Vec<SyntaxTree> {
        trees.truncate(config.max_explored.saturating_sub(self.explored));
        let results = if config.parallel {
            trees
                .into_par_iter()
                .map(|t| {
                    let r = evaluator.evaluate(&t);
                    (t, r)
                })
                .collect::<Vec<_>>()
        } else {
            trees
                .into_iter()
                .map(|t| {
                    let r = evaluator.evaluate(&t);
                    (t, r)
                })
                .collect()
        };

        let mut scored = Vec::with_capacity(results.len());
        for (mut tree, result) in results {
            self.explored += 1;
            match result {
                Ok(c) => {
                    let _ = tree.set_evaluation(c);
                    self.offer(&tree);
                    scored.push(tree);
                }
                Err(e) => {
                    self.discarded += 1;
                    debug!("Discarding candidate {}: {}", tree.schedule(), e);
                }
            }
        }
        if let Some(best) = &self.best {
            self.history.push(cost(best));
        }
        scored
    }

    /// Replaces the best tree with `tree` if `tree` is better.
    fn offer(&mut self, tree: &SyntaxTree) {
        let better = match &self.best {
            Some(best) => compare_trees(tree, best) == Ordering::Less,
            None => true,
        };
        if better {
            debug!(
                "New best {} after {} explored: {}",
                cost(tree),
                self.explored,
                tree.schedule().iter().join("; ")
            );
            self.best = Some(tree.clone());
        }
    }

    fn finish(&self, method: &str) {
        info!(
            "{} search explored {} trees ({} discarded) in {:?}",
            method,
            self.explored,
            self.discarded,
            self.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ConstantEvaluator, ModelEvaluator};
    use crate::program::library;
    use crate::scheduling::Transformation;

    pub(super) fn small_config() -> SearchConfig {
        SearchConfig {
            max_depth: 3,
            max_explored: 60,
            ..SearchConfig::default()
        }
    }

    pub(super) fn matmul_tree() -> SyntaxTree {
        SyntaxTree::from_program(library::matmul(16).build().unwrap())
    }

    /// Fails on any tree with a tiled loop.
    struct NoTiling;

    impl Evaluator for NoTiling {
        fn evaluate(&self, tree: &SyntaxTree) -> Result<f64, EvalError> {
            if tree
                .transformations()
                .iter()
                .any(|t| matches!(t, Transformation::Tile { .. }))
            {
                return Err(EvalError::Model("no tiling".into()));
            }
            ModelEvaluator::default().evaluate(tree)
        }

        fn name(&self) -> &str {
            "no-tiling"
        }
    }

    struct Failing;

    impl Evaluator for Failing {
        fn evaluate(&self, _tree: &SyntaxTree) -> Result<f64, EvalError> {
            Err(EvalError::Model("always fails".into()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    fn all_kinds() -> [SearchKind; 4] {
        [
            SearchKind::Exhaustive,
            SearchKind::Beam,
            SearchKind::Greedy,
            SearchKind::Randomized,
        ]
    }

    #[test]
    fn test_history_never_increases() {
        let model = ModelEvaluator::default();
        for kind in all_kinds() {
            let mut search = SearchStrategy::new(kind, small_config());
            search.search(matmul_tree(), &model).unwrap();
            let history = search.history();
            assert!(!history.is_empty());
            assert!(
                history.windows(2).all(|w| w[1] <= w[0]),
                "{kind:?}: {history:?}"
            );
            assert_eq!(search.best_evaluation(), history.last().copied());
            assert!(search.explored() <= small_config().max_explored);
        }
    }

    #[test]
    fn test_best_is_no_worse_than_initial() {
        let model = ModelEvaluator::default();
        let initial_cost = model.evaluate(&matmul_tree()).unwrap();
        for kind in all_kinds() {
            let mut search = SearchStrategy::new(kind, small_config());
            let best = search.search(matmul_tree(), &model).unwrap();
            assert!(best.is_legal());
            assert!(best.depth() <= small_config().max_depth);
            assert!(best.evaluation().unwrap() <= initial_cost, "{kind:?}");
        }
    }

    #[test]
    fn test_constant_evaluator_keeps_initial_tree() {
        for kind in all_kinds() {
            let mut search = SearchStrategy::new(kind, small_config());
            let best = search.search(matmul_tree(), &ConstantEvaluator(1.0)).unwrap();
            assert_eq!(best.depth(), 0, "{kind:?}");
            assert_eq!(search.best_evaluation(), Some(1.0));
        }
    }

    #[test]
    fn test_evaluator_failures_are_discarded() {
        for kind in all_kinds() {
            let mut search = SearchStrategy::new(kind, small_config());
            let best = search.search(matmul_tree(), &NoTiling).unwrap();
            assert!(!best
                .transformations()
                .iter()
                .any(|t| matches!(t, Transformation::Tile { .. })));
            assert!(search.discarded() > 0, "{kind:?}");
        }
    }

    #[test]
    fn test_unevaluable_initial_tree_is_fatal() {
        let mut search = SearchStrategy::new(SearchKind::Greedy, small_config());
        assert!(matches!(
            search.search(matmul_tree(), &Failing),
            Err(SearchError::InitialNotEvaluable(_))
        ));
    }

    #[test]
    fn test_sequential_and_parallel_agree() {
        let model = ModelEvaluator::default();
        let mut par = SearchStrategy::new(SearchKind::Beam, small_config());
        let mut seq = SearchStrategy::new(
            SearchKind::Beam,
            SearchConfig {
                parallel: false,
                ..small_config()
            },
        );
        let a = par.search(matmul_tree(), &model).unwrap().schedule();
        let b = seq.search(matmul_tree(), &model).unwrap().schedule();
        assert_eq!(a, b);
        assert_eq!(par.explored(), seq.explored());
    }
}
