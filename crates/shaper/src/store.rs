use getrandom::getrandom;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

pub const RESOURCE_URI_SCHEME: &str = "navspace://results/";

const DEFAULT_CAPACITY: usize = 256;
// Expired IDs are remembered so callers can tell "re-run the operation"
// apart from "bad URI".
const TOMBSTONE_CAPACITY: usize = 512;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("unknown resource uri: {0}")]
    UnknownUri(String),

    #[error("resource expired: {0}")]
    Expired(String),

    #[error("malformed resource uri: {0}")]
    MalformedUri(String),
}

struct StoreEntry {
    payload: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    entries: HashMap<u64, StoreEntry>,
    order: VecDeque<u64>,
    tombstones: VecDeque<u64>,
    tombstone_set: HashSet<u64>,
}

/// TTL-keyed storage for full, untruncated result payloads.
///
/// IDs are random: resource URIs get copy-pasted between agent sessions, and
/// predictable low IDs would let a stale URI resolve to the wrong payload.
/// Entries expire lazily at access time; `sweep` reclaims memory between
/// accesses. Capacity-bounded, oldest first.
pub struct ResourceStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl Default for ResourceStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ResourceStore {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn put(&self, payload: Vec<u8>, ttl: Duration) -> String {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::prune_expired(&mut inner, now);

        let id = Self::allocate_id(&mut inner);
        inner.entries.insert(
            id,
            StoreEntry {
                payload,
                expires_at: now + ttl,
            },
        );
        inner.order.push_back(id);

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }

        format_uri(id)
    }

    pub fn get(&self, uri: &str) -> Result<Vec<u8>, StoreError> {
        let id = parse_uri(uri)?;
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.entries.get(&id) {
            Some(entry) if entry.expires_at > now => Ok(entry.payload.clone()),
            Some(_) => {
                Self::bury(&mut inner, id);
                Err(StoreError::Expired(uri.to_string()))
            }
            None if inner.tombstone_set.contains(&id) => Err(StoreError::Expired(uri.to_string())),
            None => Err(StoreError::UnknownUri(uri.to_string())),
        }
    }

    pub fn delete(&self, uri: &str) -> bool {
        let Ok(id) = parse_uri(uri) else {
            return false;
        };
        let mut inner = self.lock();
        let existed = inner.entries.remove(&id).is_some();
        if existed {
            inner.order.retain(|k| k != &id);
        }
        existed
    }

    /// Reclaim memory held by expired entries. Expiry itself is lazy; this
    /// only matters for long-idle processes.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        Self::prune_expired(&mut inner, now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_id(inner: &mut StoreInner) -> u64 {
        for _ in 0..8 {
            let mut bytes = [0u8; 8];
            if getrandom(&mut bytes).is_err() {
                break;
            }
            let candidate = u64::from_be_bytes(bytes).max(1);
            if !inner.entries.contains_key(&candidate) && !inner.tombstone_set.contains(&candidate)
            {
                return candidate;
            }
        }

        // Sequential fallback if the RNG is unavailable or keeps colliding.
        let mut candidate = inner.next_id.max(1);
        while inner.entries.contains_key(&candidate) || inner.tombstone_set.contains(&candidate) {
            candidate = candidate.wrapping_add(1).max(1);
        }
        inner.next_id = candidate.wrapping_add(1).max(1);
        candidate
    }

    fn prune_expired(inner: &mut StoreInner, now: Instant) {
        let expired: Vec<u64> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            Self::bury(inner, id);
        }
    }

    fn bury(inner: &mut StoreInner, id: u64) {
        inner.entries.remove(&id);
        inner.order.retain(|k| k != &id);
        if inner.tombstone_set.insert(id) {
            inner.tombstones.push_back(id);
            while inner.tombstones.len() > TOMBSTONE_CAPACITY {
                if let Some(old) = inner.tombstones.pop_front() {
                    inner.tombstone_set.remove(&old);
                }
            }
        }
    }
}

fn format_uri(id: u64) -> String {
    format!("{RESOURCE_URI_SCHEME}{id:016x}")
}

fn parse_uri(uri: &str) -> Result<u64, StoreError> {
    let raw = uri
        .strip_prefix(RESOURCE_URI_SCHEME)
        .ok_or_else(|| StoreError::MalformedUri(uri.to_string()))?;
    u64::from_str_radix(raw, 16).map_err(|_| StoreError::MalformedUri(uri.to_string()))
}
