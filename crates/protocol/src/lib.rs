use anyhow::Result;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub const RESPONSE_SCHEMA_VERSION: u32 = 1;

/// Why a response carries fewer items than the operation produced.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TruncationReason {
    MaxTokens,
    MaxResults,
    HardTruncated,
}

/// A concrete follow-up call the consumer can make to get more than this
/// response could carry.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ToolNextAction {
    pub tool: String,
    pub args: serde_json::Value,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub hint: Option<String>,
    #[serde(default)]
    pub next_actions: Vec<ToolNextAction>,
}

/// Immutable token budget for one shaped response.
///
/// `floor_tokens` is the minimum spend that still produces a useful answer;
/// below it the shaper prefers a hard-truncated non-empty response over an
/// empty one.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, JsonSchema)]
pub struct TokenBudget {
    pub max_tokens: u64,
    pub floor_tokens: u64,
}

impl TokenBudget {
    #[must_use]
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            floor_tokens: (max_tokens / 20).clamp(64, 512),
        }
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DefaultLimits::default().max_tokens)
    }
}

/// The shaped result of one operation: the retained prefix plus enough
/// annotation for the consumer to tell whether (and how) to ask for more.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct ReducedResponse<T> {
    pub items: Vec<T>,
    pub was_reduced: bool,
    pub retained_tokens: u64,
    pub total_count: usize,
    pub truncation: Option<TruncationReason>,
    pub resource_uri: Option<String>,
    #[serde(default)]
    pub next_actions: Vec<ToolNextAction>,
}

impl<T> ReducedResponse<T> {
    /// A response that carries the whole batch untouched.
    #[must_use]
    pub fn complete(items: Vec<T>, retained_tokens: u64) -> Self {
        let total_count = items.len();
        Self {
            items,
            was_reduced: false,
            retained_tokens,
            total_count,
            truncation: None,
            resource_uri: None,
            next_actions: Vec::new(),
        }
    }
}

/// Configuration defaults for the whole layer. Every value here is a default,
/// not a contract: the hosting consumer's context window decides the right
/// budget, and env overrides may replace any of them.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema)]
pub struct DefaultLimits {
    pub max_tokens: u64,
    pub max_results: usize,
    pub resource_ttl_ms: u64,
    pub resource_capacity: usize,
    pub idle_evict_ms: u64,
    pub sweep_interval_ms: u64,
    pub close_grace_ms: u64,
    pub reducer_steps: Vec<usize>,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            max_tokens: 10_000,
            max_results: 100,
            resource_ttl_ms: 30 * 60 * 1000,
            resource_capacity: 256,
            idle_evict_ms: 10 * 60 * 1000,
            sweep_interval_ms: 30_000,
            close_grace_ms: 2_000,
            reducer_steps: vec![100, 75, 50, 30, 20, 10, 5],
        }
    }
}

pub fn serialize_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(Into::into)
}

#[must_use]
pub fn unix_ms(ts: SystemTime) -> u64 {
    ts.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
