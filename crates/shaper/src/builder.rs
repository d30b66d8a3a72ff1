use crate::error::{Result, ShapeError};
use crate::estimator::TokenEstimator;
use crate::reducer::ProgressiveReducer;
use crate::store::ResourceStore;
use crate::{CostFn, PriorityFn};
use navspace_protocol::{ReducedResponse, TokenBudget, ToolNextAction, TruncationReason};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How the consumer can re-run the producing operation with larger limits.
/// `args` is the original call's argument object; the builder overlays the
/// suggested limits onto it.
#[derive(Debug, Clone)]
pub struct RetryTemplate {
    pub tool: String,
    pub args: serde_json::Value,
}

pub struct ShapeRequest<'a, T> {
    pub items: Vec<T>,
    pub cost: CostFn<'a, T>,
    pub priority: PriorityFn<'a, T>,
    pub budget: TokenBudget,
    pub max_results: usize,
    pub retry: Option<RetryTemplate>,
}

/// Orchestrates shaping for every operation: estimate, reduce if needed,
/// park the untruncated batch, annotate the response.
pub struct ResponseBuilder {
    estimator: TokenEstimator,
    reducer: ProgressiveReducer,
    store: Arc<ResourceStore>,
    resource_ttl: Duration,
}

impl ResponseBuilder {
    #[must_use]
    pub fn new(
        estimator: TokenEstimator,
        reducer: ProgressiveReducer,
        store: Arc<ResourceStore>,
        resource_ttl: Duration,
    ) -> Self {
        Self {
            estimator,
            reducer,
            store,
            resource_ttl,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ResourceStore> {
        &self.store
    }

    pub fn build<T: Serialize>(
        &self,
        request: ShapeRequest<'_, T>,
        cancel: &CancellationToken,
    ) -> Result<ReducedResponse<T>> {
        let ShapeRequest {
            mut items,
            cost,
            priority,
            budget,
            max_results,
            retry,
        } = request;
        let max_results = max_results.max(1);
        let total_count = items.len();

        if cancel.is_cancelled() {
            return Err(ShapeError::Cancelled);
        }

        let estimate = self.estimator.estimate_batch(&items, cost);
        if estimate <= budget.max_tokens && total_count <= max_results {
            return Ok(ReducedResponse::complete(items, estimate));
        }

        // The response will not carry every item, so the full, unclamped
        // batch goes to the resource store before the clamp: "more" must not
        // be bounded by the caller's own cap.
        let full_payload = serde_json::to_vec(&items)?;

        let clamped_by_cap = total_count > max_results;
        if clamped_by_cap {
            items.truncate(max_results);
        }

        let reduction = self.reducer.reduce(
            items,
            cost,
            priority,
            budget,
            &self.estimator,
            cancel,
        )?;

        if cancel.is_cancelled() {
            return Err(ShapeError::Cancelled);
        }

        let truncation = if reduction.hard_truncated {
            TruncationReason::HardTruncated
        } else if reduction.was_reduced {
            TruncationReason::MaxTokens
        } else {
            TruncationReason::MaxResults
        };

        let resource_uri = self.store.put(full_payload, self.resource_ttl);
        let retained = reduction.retained.len();
        let next_actions = next_actions(&resource_uri, retry.as_ref(), total_count, estimate, retained);

        Ok(ReducedResponse {
            items: reduction.retained,
            was_reduced: true,
            retained_tokens: reduction.retained_tokens,
            total_count,
            truncation: Some(truncation),
            resource_uri: Some(resource_uri),
            next_actions,
        })
    }
}

fn next_actions(
    resource_uri: &str,
    retry: Option<&RetryTemplate>,
    total_count: usize,
    full_estimate: u64,
    retained: usize,
) -> Vec<ToolNextAction> {
    let mut actions = vec![ToolNextAction {
        tool: "fetch_resource".to_string(),
        args: serde_json::json!({ "uri": resource_uri }),
        reason: format!(
            "Fetch all {total_count} results in one untruncated payload (kept {retained} here)."
        ),
    }];

    if let Some(retry) = retry {
        let mut args = retry.args.clone();
        if let Some(map) = args.as_object_mut() {
            map.insert("max_results".to_string(), serde_json::json!(total_count));
            map.insert(
                "budget_tokens".to_string(),
                serde_json::json!(full_estimate),
            );
        }
        actions.push(ToolNextAction {
            tool: retry.tool.clone(),
            args,
            reason: format!(
                "Re-run with budget_tokens >= {full_estimate} to receive all {total_count} results inline."
            ),
        });
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::{ResponseBuilder, RetryTemplate, ShapeRequest};
    use crate::estimator::TokenEstimator;
    use crate::reducer::ProgressiveReducer;
    use crate::store::ResourceStore;
    use navspace_protocol::{TokenBudget, TruncationReason};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn builder() -> ResponseBuilder {
        ResponseBuilder::new(
            TokenEstimator::default(),
            ProgressiveReducer::default(),
            Arc::new(ResourceStore::default()),
            Duration::from_secs(60),
        )
    }

    fn request<'a>(
        items: Vec<u64>,
        cost: crate::CostFn<'a, u64>,
        budget: u64,
        max_results: usize,
    ) -> ShapeRequest<'a, u64> {
        ShapeRequest {
            items,
            cost,
            priority: &|_| 0,
            budget: TokenBudget::new(budget),
            max_results,
            retry: None,
        }
    }

    #[test]
    fn small_batch_passes_untouched() {
        let b = builder();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(10) };
        let resp = b
            .build(request((0..10).collect(), &cost, 10_000, 100), &CancellationToken::new())
            .unwrap();
        assert!(!resp.was_reduced);
        assert_eq!(resp.items.len(), 10);
        assert_eq!(resp.total_count, 10);
        assert!(resp.resource_uri.is_none());
        assert!(b.store().is_empty());
    }

    #[test]
    fn clamp_alone_still_parks_full_batch() {
        let b = builder();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(1) };
        let resp = b
            .build(request((0..50).collect(), &cost, 10_000, 20), &CancellationToken::new())
            .unwrap();
        assert!(resp.was_reduced);
        assert_eq!(resp.items.len(), 20);
        assert_eq!(resp.total_count, 50);
        assert_eq!(resp.truncation, Some(TruncationReason::MaxResults));

        let uri = resp.resource_uri.expect("resource uri");
        let stored: Vec<u64> = serde_json::from_slice(&b.store().get(&uri).unwrap()).unwrap();
        assert_eq!(stored.len(), 50);
    }

    #[test]
    fn budget_reduction_stores_unclamped_set() {
        let b = builder();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(150) };
        let resp = b
            .build(request((0..200).collect(), &cost, 10_000, 500), &CancellationToken::new())
            .unwrap();
        assert!(resp.was_reduced);
        assert_eq!(resp.items.len(), 50);
        assert_eq!(resp.total_count, 200);
        assert_eq!(resp.truncation, Some(TruncationReason::MaxTokens));

        let uri = resp.resource_uri.expect("resource uri");
        let stored: Vec<u64> = serde_json::from_slice(&b.store().get(&uri).unwrap()).unwrap();
        assert_eq!(stored.len(), 200);
    }

    #[test]
    fn retry_template_overlays_suggested_limits() {
        let b = builder();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(150) };
        let resp = b
            .build(
                ShapeRequest {
                    items: (0..200).collect(),
                    cost: &cost,
                    priority: &|_| 0,
                    budget: TokenBudget::new(10_000),
                    max_results: 500,
                    retry: Some(RetryTemplate {
                        tool: "find_references".to_string(),
                        args: serde_json::json!({"symbol": "Frobnicate"}),
                    }),
                },
                &CancellationToken::new(),
            )
            .unwrap();

        let retry = resp
            .next_actions
            .iter()
            .find(|a| a.tool == "find_references")
            .expect("retry action");
        assert_eq!(retry.args["symbol"], "Frobnicate");
        assert_eq!(retry.args["max_results"], 200);
        assert!(retry.args["budget_tokens"].as_u64().unwrap() >= 30_000);
    }

    #[test]
    fn identical_input_shapes_identically() {
        let b = builder();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(150) };
        let first = b
            .build(request((0..200).collect(), &cost, 10_000, 500), &CancellationToken::new())
            .unwrap();
        let second = b
            .build(request((0..200).collect(), &cost, 10_000, 500), &CancellationToken::new())
            .unwrap();
        assert_eq!(first.items, second.items);
        assert_eq!(first.resource_uri.is_some(), second.resource_uri.is_some());
        assert_eq!(first.retained_tokens, second.retained_tokens);
    }
}
