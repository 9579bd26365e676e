use super::{compare_trees, cost, improves, SearchConfig, SearchError, SearchMethod, SearchState};
use crate::evaluator::Evaluator;
use crate::syntax::SyntaxTree;

use log::{debug, trace};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Elitist evolutionary search. Each generation mutates every member of the
/// population by one random legal transformation; parents and offspring then
/// compete for `population` places.
pub struct RandomizedSearch {
    config: SearchConfig,
    state: SearchState,
}

impl RandomizedSearch {
    pub fn new(config: SearchConfig) -> Self {
        RandomizedSearch {
            config,
            state: SearchState::default(),
        }
    }

    /// Derives an unseen tree from `parent` with one of up to `sample_size` randomly
    /// chosen transformations.
    fn mutate(&mut self, parent: &SyntaxTree, rng: &mut StdRng) -> Option<SyntaxTree> {
        if parent.depth() >= self.config.max_depth {
            return None;
        }
        let mut candidates = parent.candidate_transformations();
        candidates.shuffle(rng);
        for t in candidates.iter().take(self.config.sample_size.max(1)) {
            match parent.derive(t) {
                Ok(child) => {
                    if self.state.visit(&child) {
                        return Some(child);
                    }
                }
                Err(e) => trace!("Mutation {} rejected: {}", t, e),
            }
        }
        None
    }
}

impl SearchMethod for RandomizedSearch {
    fn search(
        &mut self,
        initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<&SyntaxTree, SearchError> {
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let initial = self.state.begin(initial, evaluator)?;
        let mut best_cost = cost(&initial);
        let mut population = vec![initial];
        let mut plateau = 0;
        let mut generation = 0;
        while !self.state.out_of_budget(&self.config) {
            generation += 1;
            let offspring = population
                .iter()
                .filter_map(|parent| self.mutate(parent, &mut rng))
                .collect::<Vec<_>>();
            if offspring.is_empty() {
                debug!("No offspring in generation {}", generation);
                break;
            }
            let scored = self.state.score(&self.config, offspring, evaluator);
            population.extend(scored);
            population.sort_by(compare_trees);
            population.truncate(self.config.population.max(1));

            let generation_cost = cost(&population[0]);
            if improves(generation_cost, best_cost, self.config.tolerance) {
                best_cost = generation_cost;
                plateau = 0;
            } else {
                plateau += 1;
                // Patience is in units of `population` generations.
                if plateau >= self.config.patience.max(1) * self.config.population.max(1) {
                    debug!("Randomized search plateaued after {} generations", generation);
                    break;
                }
            }
        }
        self.state.finish(self.name());
        Ok(self.state.best())
    }

    fn name(&self) -> &'static str {
        "randomized"
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
    fn test_same_seed_same_result() {
        let model = ModelEvaluator::default();
        let run = |seed| {
            let mut search = RandomizedSearch::new(SearchConfig { seed, ..small_config() });
            let schedule = search.search(matmul_tree(), &model).unwrap().schedule();
            (schedule, search.explored())
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_population_members_stay_within_depth() {
        let model = ModelEvaluator::default();
        let mut search = RandomizedSearch::new(SearchConfig {
            max_depth: 2,
            max_explored: 200,
            ..small_config()
        });
        let best = search.search(matmul_tree(), &model).unwrap();
        assert!(best.depth() <= 2);
        assert!(best.is_legal());
    }
}
