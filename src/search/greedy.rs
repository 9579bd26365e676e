use super::{compare_trees, cost, SearchConfig, SearchError, SearchMethod, SearchState};
use crate::evaluator::Evaluator;
use crate::syntax::SyntaxTree;

use log::debug;

/// Hill climbing: moves to the best neighbor while it is strictly cheaper.
pub struct GreedySearch {
    config: SearchConfig,
    state: SearchState,
}

impl GreedySearch {
    pub fn new(config: SearchConfig) -> Self {
        GreedySearch {
            config,
            state: SearchState::default(),
        }
    }
}

impl SearchMethod for GreedySearch {
    fn search(
        &mut self,
        initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<&SyntaxTree, SearchError> {
        let mut current = self.state.begin(initial, evaluator)?;
        while !self.state.out_of_budget(&self.config) {
            let neighbors = self.state.expand(&self.config, &current, evaluator);
            let Some(next) = neighbors.into_iter().min_by(compare_trees) else {
                break;
            };
            if cost(&next) >= cost(&current) {
                debug!("No improving neighbor at depth {}", current.depth());
                break;
            }
            current = next;
        }
        self.state.finish(self.name());
        Ok(self.state.best())
    }

    fn name(&self) -> &'static str {
        "greedy"
    }

    fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn state(&self) -> &SearchState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{matmul_tree, small_config};
    use super::*;
    use crate::evaluator::ModelEvaluator;

    #[test]
    fn test_greedy_path_is_strictly_improving() {
        let model = ModelEvaluator::default();
        let mut search = GreedySearch::new(SearchConfig {
            max_explored: usize::MAX,
            ..small_config()
        });
        let best = search.search(matmul_tree(), &model).unwrap().clone();
        // Replaying each prefix of the best schedule must lower the cost each time.
        let mut prefix = matmul_tree();
        let mut last = model.evaluate(&prefix).unwrap();
        for t in best.transformations() {
            prefix = prefix.derive(t).unwrap();
            let c = model.evaluate(&prefix).unwrap();
            assert!(c < last, "{t} does not improve: {c} >= {last}");
            last = c;
        }
        assert!(best.depth() <= small_config().max_depth);
    }
}
