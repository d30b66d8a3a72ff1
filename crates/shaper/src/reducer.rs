use crate::error::{Result, ShapeError};
use crate::estimator::TokenEstimator;
use crate::{CostFn, PriorityFn};
use navspace_protocol::{DefaultLimits, TokenBudget};
use tokio_util::sync::CancellationToken;

/// Outcome of one reduction pass over a priority-ordered batch.
#[derive(Debug)]
pub struct Reduction<T> {
    pub retained: Vec<T>,
    pub was_reduced: bool,
    pub retained_tokens: u64,
    pub total_count: usize,
    /// Even the smallest candidate exceeded the budget; the caller gets it
    /// anyway instead of an empty response.
    pub hard_truncated: bool,
}

/// Shrinks a batch along a fixed descending candidate-count sequence until
/// its exact cost fits the budget.
///
/// The sequence is a default, not a contract: the right budget depends on the
/// hosting consumer's context window, which this layer does not control.
#[derive(Debug, Clone)]
pub struct ProgressiveReducer {
    steps: Vec<usize>,
}

impl Default for ProgressiveReducer {
    fn default() -> Self {
        Self::new(DefaultLimits::default().reducer_steps)
    }
}

impl ProgressiveReducer {
    /// Steps are normalized to a strictly descending, non-zero sequence.
    #[must_use]
    pub fn new(mut steps: Vec<usize>) -> Self {
        steps.retain(|s| *s > 0);
        steps.sort_unstable_by(|a, b| b.cmp(a));
        steps.dedup();
        if steps.is_empty() {
            steps = DefaultLimits::default().reducer_steps;
        }
        Self { steps }
    }

    #[must_use]
    pub fn steps(&self) -> &[usize] {
        &self.steps
    }

    pub fn reduce<T>(
        &self,
        items: Vec<T>,
        cost: CostFn<'_, T>,
        priority: PriorityFn<'_, T>,
        budget: TokenBudget,
        estimator: &TokenEstimator,
        cancel: &CancellationToken,
    ) -> Result<Reduction<T>> {
        let total_count = items.len();
        if cancel.is_cancelled() {
            return Err(ShapeError::Cancelled);
        }

        let estimate = estimator.estimate_batch(&items, cost);
        if estimate <= budget.max_tokens {
            return Ok(Reduction {
                retained: items,
                was_reduced: false,
                retained_tokens: estimate,
                total_count,
                hard_truncated: false,
            });
        }

        // Stable sort on descending priority: ties keep original operation
        // order so repeated calls reduce identically.
        let mut tagged: Vec<(i64, T)> = items.into_iter().map(|t| (priority(&t), t)).collect();
        tagged.sort_by(|a, b| b.0.cmp(&a.0));
        let sorted: Vec<T> = tagged.into_iter().map(|(_, t)| t).collect();

        // If every step exceeds the batch length, the smallest candidate is
        // the batch itself.
        let mut smallest = sorted.len();
        for &step in &self.steps {
            if cancel.is_cancelled() {
                return Err(ShapeError::Cancelled);
            }
            if step >= sorted.len() {
                continue;
            }
            smallest = step;
            let exact = estimator.exact_batch(&sorted[..step], cost);
            if exact <= budget.max_tokens {
                let mut retained = sorted;
                retained.truncate(step);
                return Ok(Reduction {
                    retained,
                    was_reduced: true,
                    retained_tokens: exact,
                    total_count,
                    hard_truncated: false,
                });
            }
        }

        // Nothing fit. Return the smallest candidate flagged hard-truncated
        // rather than an empty response.
        let keep = smallest.min(sorted.len()).max(1);
        let mut retained = sorted;
        retained.truncate(keep);
        let exact = estimator.exact_batch(&retained, cost);
        Ok(Reduction {
            retained,
            was_reduced: true,
            retained_tokens: exact,
            total_count,
            hard_truncated: true,
        })
    }
}
