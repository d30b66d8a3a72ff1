use navspace_protocol::DefaultLimits;
use navspace_workspace::WorkspaceCacheConfig;
use std::time::Duration;

const MIN_MAX_TOKENS: u64 = 256;
const MAX_MAX_TOKENS: u64 = 1_000_000;
const MIN_MAX_RESULTS: usize = 1;
const MAX_MAX_RESULTS: usize = 10_000;
const MIN_TTL_MS: u64 = 1_000;
const MAX_TTL_MS: u64 = 24 * 60 * 60 * 1000;
const MIN_SWEEP_MS: u64 = 10;
const MAX_SWEEP_MS: u64 = 60 * 60 * 1000;
const MAX_GRACE_MS: u64 = 60_000;

/// Effective runtime settings: `DefaultLimits` plus `NAVSPACE_*` env
/// overrides, clamped to sane ranges. All of these are defaults, not
/// contracts; the hosting consumer knows its own context window best.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub max_tokens: u64,
    pub max_results: usize,
    pub resource_ttl: Duration,
    pub resource_capacity: usize,
    pub reducer_steps: Vec<usize>,
    pub cache: WorkspaceCacheConfig,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let limits = DefaultLimits::default();
        Self {
            max_tokens: limits.max_tokens,
            max_results: limits.max_results,
            resource_ttl: Duration::from_millis(limits.resource_ttl_ms),
            resource_capacity: limits.resource_capacity,
            reducer_steps: limits.reducer_steps,
            cache: WorkspaceCacheConfig::default(),
        }
    }
}

impl RuntimeSettings {
    #[must_use]
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(v) = env_u64("NAVSPACE_MAX_TOKENS") {
            settings.max_tokens = v.clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS);
        }
        if let Some(v) = env_u64("NAVSPACE_MAX_RESULTS") {
            settings.max_results = (v as usize).clamp(MIN_MAX_RESULTS, MAX_MAX_RESULTS);
        }
        if let Some(v) = env_u64("NAVSPACE_RESOURCE_TTL_MS") {
            settings.resource_ttl = Duration::from_millis(v.clamp(MIN_TTL_MS, MAX_TTL_MS));
        }
        if let Some(v) = env_u64("NAVSPACE_IDLE_EVICT_MS") {
            settings.cache.idle_evict_after =
                Duration::from_millis(v.clamp(MIN_TTL_MS, MAX_TTL_MS));
        }
        if let Some(v) = env_u64("NAVSPACE_SWEEP_MS") {
            settings.cache.sweep_interval =
                Duration::from_millis(v.clamp(MIN_SWEEP_MS, MAX_SWEEP_MS));
        }
        if let Some(v) = env_u64("NAVSPACE_CLOSE_GRACE_MS") {
            settings.cache.close_grace = Duration::from_millis(v.min(MAX_GRACE_MS));
        }

        settings
    }

    /// Caller-requested budget, bounded to the layer's hard range.
    #[must_use]
    pub fn clamp_budget_tokens(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.max_tokens)
            .clamp(MIN_MAX_TOKENS, MAX_MAX_TOKENS)
    }

    #[must_use]
    pub fn clamp_max_results(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.max_results)
            .clamp(MIN_MAX_RESULTS, MAX_MAX_RESULTS)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let raw = std::env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring unparseable {key}={trimmed}");
            None
        }
    }
}
