use crate::CostFn;
use serde::Serialize;
use serde_json::Value;

/// Rough cost of serialized text for the downstream consumer: ~4 chars per
/// token. An approximation by contract; the consumer's tokenizer is not ours.
const CHARS_PER_TOKEN: u64 = 4;

/// Flat cost of the response envelope around the items (field names, counts,
/// hints).
const ENVELOPE_OVERHEAD_TOKENS: u64 = 64;

/// Conservative per-item estimate used when a cost function fails.
pub const FALLBACK_ITEM_TOKENS: u64 = 64;

/// A sampled max this far above the sampled average means the batch sizing is
/// irregular and extrapolation would lie.
const IRREGULARITY_FACTOR: u64 = 5;

const DEFAULT_SAMPLE_SIZE: usize = 5;

/// Estimated token cost of one JSON value: string content length-weighted,
/// nested collections summed recursively, plus a small structural cost per
/// field.
#[must_use]
pub fn estimate_value(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(s) => chars_to_tokens(s.chars().count() as u64),
        Value::Array(items) => items
            .iter()
            .map(|v| 1 + estimate_value(v))
            .sum::<u64>()
            .max(1),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, v)| 1 + chars_to_tokens(key.chars().count() as u64) + estimate_value(v))
            .sum::<u64>()
            .max(1),
    }
}

fn chars_to_tokens(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    sample_size: usize,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }
}

impl TokenEstimator {
    #[must_use]
    pub fn with_sample_size(sample_size: usize) -> Self {
        Self {
            sample_size: sample_size.max(1),
        }
    }

    /// Cost of one serializable item via the generic value walk.
    pub fn estimate_item<T: Serialize>(&self, item: &T) -> u64 {
        match serde_json::to_value(item) {
            Ok(value) => estimate_value(&value),
            Err(err) => {
                log::warn!("item estimation failed, using fallback: {err}");
                FALLBACK_ITEM_TOKENS
            }
        }
    }

    /// Batch cost without walking every item: average the first
    /// `sample_size`, extrapolate, add the envelope overhead. Irregularly
    /// sized batches (sampled max > 5x sampled average) fall back to exact
    /// summation; those batches are typically small enough for it.
    pub fn estimate_batch<T>(&self, items: &[T], cost: CostFn<'_, T>) -> u64 {
        if items.is_empty() {
            return ENVELOPE_OVERHEAD_TOKENS;
        }

        if items.len() <= self.sample_size {
            return self.exact_sum(items, cost) + ENVELOPE_OVERHEAD_TOKENS;
        }

        let sample: Vec<u64> = items[..self.sample_size]
            .iter()
            .map(|item| safe_cost(cost, item))
            .collect();
        let sample_total: u64 = sample.iter().sum();
        let sample_max = sample.iter().copied().max().unwrap_or(0);
        let sample_avg = sample_total / sample.len() as u64;

        if sample_avg > 0 && sample_max > sample_avg.saturating_mul(IRREGULARITY_FACTOR) {
            return self.exact_sum(items, cost) + ENVELOPE_OVERHEAD_TOKENS;
        }

        sample_avg.max(1).saturating_mul(items.len() as u64) + ENVELOPE_OVERHEAD_TOKENS
    }

    /// Exact cost of a candidate prefix plus the envelope. Used by the
    /// reducer, where candidates are small enough that exactness is cheap.
    pub fn exact_batch<T>(&self, items: &[T], cost: CostFn<'_, T>) -> u64 {
        self.exact_sum(items, cost) + ENVELOPE_OVERHEAD_TOKENS
    }

    fn exact_sum<T>(&self, items: &[T], cost: CostFn<'_, T>) -> u64 {
        items.iter().map(|item| safe_cost(cost, item)).sum()
    }
}

/// Run a caller-provided cost function, degrading to the fixed conservative
/// estimate on failure rather than failing the whole response.
pub(crate) fn safe_cost<T>(cost: CostFn<'_, T>, item: &T) -> u64 {
    match cost(item) {
        Ok(tokens) => tokens,
        Err(err) => {
            log::warn!("cost function failed, using fallback estimate: {err}");
            FALLBACK_ITEM_TOKENS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{estimate_value, TokenEstimator, FALLBACK_ITEM_TOKENS};
    use serde_json::json;

    #[test]
    fn strings_dominate_cost() {
        let small = estimate_value(&json!({"path": "a.cs"}));
        let large = estimate_value(&json!({"path": "a".repeat(400)}));
        assert!(large > small * 10, "small={small} large={large}");
    }

    #[test]
    fn nested_collections_sum() {
        let nested = json!({"items": [{"name": "alpha"}, {"name": "beta"}]});
        let flat = json!({"name": "alpha"});
        assert!(estimate_value(&nested) > estimate_value(&flat));
    }

    #[test]
    fn uniform_batch_extrapolates_from_sample() {
        let items: Vec<u64> = (0..200).collect();
        let est = TokenEstimator::default();
        let cost = |_: &u64| -> anyhow::Result<u64> { Ok(150) };
        let total = est.estimate_batch(&items, &cost);
        // 200 * 150 plus the envelope, derived from 5 samples only.
        assert!((30_000..30_500).contains(&total), "total={total}");
    }

    #[test]
    fn irregular_batch_uses_exact_sum() {
        // One sampled item is enormous relative to the rest; extrapolating
        // from the sample average would misprice the tail.
        let mut items: Vec<u64> = vec![10; 16];
        items[0] = 10_000;
        let est = TokenEstimator::with_sample_size(8);
        let cost = |v: &u64| -> anyhow::Result<u64> { Ok(*v) };
        let total = est.estimate_batch(&items, &cost);
        let exact: u64 = items.iter().sum();
        assert!(total >= exact, "total={total} exact={exact}");
        assert!(total < exact + 100, "total={total} exact={exact}");
    }

    #[test]
    fn failing_cost_fn_degrades_to_fallback() {
        let items = vec![1u64, 2, 3];
        let est = TokenEstimator::default();
        let cost = |_: &u64| -> anyhow::Result<u64> { anyhow::bail!("broken") };
        let total = est.estimate_batch(&items, &cost);
        assert!(total >= FALLBACK_ITEM_TOKENS * 3);
    }
}
