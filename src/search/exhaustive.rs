use super::{SearchConfig, SearchError, SearchMethod, SearchState};
use crate::evaluator::Evaluator;
use crate::syntax::SyntaxTree;

/// Depth-first enumeration of every tree up to `max_depth` transformations,
/// skipping trees structurally identical to one already seen.
pub struct ExhaustiveSearch {
    config: SearchConfig,
    state: SearchState,
}

impl ExhaustiveSearch {
    pub fn new(config: SearchConfig) -> Self {
        ExhaustiveSearch {
            config,
            state: SearchState::default(),
        }
    }
}

impl SearchMethod for ExhaustiveSearch {
    fn search(
        &mut self,
        initial: SyntaxTree,
        evaluator: &dyn Evaluator,
    ) -> Result<&SyntaxTree, SearchError> {
        let initial = self.state.begin(initial, evaluator)?;
        let mut stack = vec![initial];
        while let Some(tree) = stack.pop() {
            if self.state.out_of_budget(&self.config) {
                break;
            }
            let children = self.state.expand(&self.config, &tree, evaluator);
            // Reversed so the first neighbor is visited first.
            stack.extend(children.into_iter().rev());
        }
        self.state.finish(self.name());
        Ok(self.state.best())
    }

    fn name(&self) -> &'static str {
        "exhaustive"
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
    use super::super::tests::small_config;
    use super::*;
    use crate::evaluator::ConstantEvaluator;
    use crate::program::library;

    #[test]
    fn test_enumerates_small_space_completely() {
        let tree = SyntaxTree::from_program(library::producer_consumer(4).build().unwrap());
        let config = SearchConfig {
            max_depth: 1,
            max_explored: usize::MAX,
            ..small_config()
        };
        let mut search = ExhaustiveSearch::new(config);
        search.search(tree.clone(), &ConstantEvaluator(0.0)).unwrap();
        let distinct = tree
            .neighbors()
            .map(|t| t.structure_key())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(search.explored(), 1 + distinct.len());
        assert_eq!(search.discarded(), 0);
    }

    #[test]
    fn test_respects_max_explored() {
        let tree = SyntaxTree::from_program(library::matmul(16).build().unwrap());
        let mut search = ExhaustiveSearch::new(SearchConfig {
            max_explored: 25,
            ..small_config()
        });
        search.search(tree, &ConstantEvaluator(0.0)).unwrap();
        assert_eq!(search.explored(), 25);
    }
}
