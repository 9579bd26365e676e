use super::{compare_trees, cost, improves, SearchConfig, SearchError, SearchMethod, SearchState};
use crate::evaluator::Evaluator;
use crate::syntax::SyntaxTree;

use log::debug;

/// Keeps the `beam_width` best trees of each level and expands only those,
/// stopping once `patience` consecutive levels fail to improve on the best cost.
pub struct BeamSearch {
    config: SearchConfig,
    state: SearchState,
}

impl BeamSearch {
    pub fn new(config: SearchConfig) -> Self {
        BeamSearch {
            config,
            state: SearchState::default(),
        }
    }
}

impl SearchMethod for BeamSearch {
    fn search(
        &mut self,
        initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<&SyntaxTree, SearchError> {
        let initial = self.state.begin(initial, evaluator)?;
        let mut best_cost = cost(&initial);
        let mut beam = vec![initial];
        let mut plateau = 0;
        for level in 0..self.config.max_depth {
            let mut candidates = vec![];
            for tree in &beam {
                if self.state.out_of_budget(&self.config) {
                    break;
                }
                candidates.extend(self.state.expand(&self.config, tree, evaluator));
            }
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by(compare_trees);
            candidates.truncate(self.config.beam_width.max(1));
            beam = candidates;

            let level_cost = cost(&beam[0]);
            debug!("Beam level {}: best {}", level + 1, level_cost);
            if improves(level_cost, best_cost, self.config.tolerance) {
                best_cost = level_cost;
                plateau = 0;
            } else {
                plateau += 1;
                if plateau >= self.config.patience.max(1) {
                    debug!("Beam search plateaued at level {}", level + 1);
                    break;
                }
            }
        }
        self.state.finish(self.name());
        Ok(self.state.best())
    }

    fn name(&self) -> &'static str {
        "beam"
    }

    fn config(&self) -> &SearchConfig {
        &self.config
    }

    fn state(&self) -> &SearchState {
        &self.state
    }
}
