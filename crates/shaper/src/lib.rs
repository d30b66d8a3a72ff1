//! Token-budgeted response shaping.
//!
//! Estimate the serialized cost of a result batch before building the
//! response, progressively reduce it to fit a budget, park the untruncated
//! payload in the resource store, and annotate the response so the consumer
//! can ask for more.

mod builder;
mod error;
mod estimator;
mod reducer;
mod store;

pub use builder::{ResponseBuilder, RetryTemplate, ShapeRequest};
pub use error::{Result, ShapeError};
pub use estimator::{estimate_value, TokenEstimator, FALLBACK_ITEM_TOKENS};
pub use reducer::{ProgressiveReducer, Reduction};
pub use store::{ResourceStore, StoreError, RESOURCE_URI_SCHEME};

/// Per-item serialized-cost function. Errors degrade to a fixed conservative
/// estimate instead of failing the response.
pub type CostFn<'a, T> = &'a (dyn Fn(&T) -> anyhow::Result<u64> + Sync);

/// Per-item priority. Higher sorts earlier; ties keep original order.
pub type PriorityFn<'a, T> = &'a (dyn Fn(&T) -> i64 + Sync);
