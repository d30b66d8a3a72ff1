use crate::error::{Result, WorkspaceError};
use crate::freshness::DocSlot;
use navspace_engine::{CodeModelEngine, EngineProject};
use navspace_protocol::{unix_ms, DefaultLimits};
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct WorkspaceCacheConfig {
    /// Handles unused this long are closed by the background sweep.
    pub idle_evict_after: Duration,
    pub sweep_interval: Duration,
    /// How long close waits for in-flight operations before forcing release.
    pub close_grace: Duration,
}

impl Default for WorkspaceCacheConfig {
    fn default() -> Self {
        let limits = DefaultLimits::default();
        Self {
            idle_evict_after: Duration::from_millis(limits.idle_evict_ms),
            sweep_interval: Duration::from_millis(limits.sweep_interval_ms),
            close_grace: Duration::from_millis(limits.close_grace_ms),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
pub struct CacheStats {
    pub loads: u64,
    pub load_failures: u64,
    pub cache_hits: u64,
    pub coalesced_waits: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub closes: u64,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct ProjectStatus {
    pub root: String,
    pub generation: u64,
    pub loaded_at_unix_ms: u64,
    pub idle_ms: u64,
    pub open_documents: usize,
    pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
    loads: AtomicU64,
    load_failures: AtomicU64,
    cache_hits: AtomicU64,
    coalesced_waits: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
    closes: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CacheStats {
        CacheStats {
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced_waits: self.coalesced_waits.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}

/// One loaded project model plus its open documents. Owned exclusively by the
/// cache; operations see it only through `ProjectHandle` guards.
pub(crate) struct ProjectEntry {
    root: PathBuf,
    engine_project: EngineProject,
    generation: u64,
    loaded_at_unix_ms: u64,
    last_access_ms: AtomicU64,
    docs: StdMutex<HashMap<PathBuf, Arc<DocSlot>>>,
    inflight: AtomicUsize,
    closed: AtomicBool,
    drained: Notify,
}

impl ProjectEntry {
    fn new(root: PathBuf, engine_project: EngineProject, generation: u64) -> Self {
        let now = unix_ms(SystemTime::now());
        Self {
            root,
            engine_project,
            generation,
            loaded_at_unix_ms: now,
            last_access_ms: AtomicU64::new(now),
            docs: StdMutex::new(HashMap::new()),
            inflight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    pub(crate) fn touch(&self) {
        self.last_access_ms
            .store(unix_ms(SystemTime::now()), Ordering::Relaxed);
    }

    fn idle_ms(&self) -> u64 {
        unix_ms(SystemTime::now()).saturating_sub(self.last_access_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn doc_slot(&self, path: &Path) -> Arc<DocSlot> {
        let mut docs = self.docs.lock().unwrap_or_else(|e| e.into_inner());
        docs.entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(DocSlot::default()))
            .clone()
    }

    fn open_documents(&self) -> usize {
        self.docs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// RAII guard over a live project model. Holding one counts as an in-flight
/// operation: close and eviction wait (up to the grace period) for the count
/// to drain before releasing engine resources.
pub struct ProjectHandle {
    entry: Arc<ProjectEntry>,
}

impl std::fmt::Debug for ProjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectHandle")
            .field("root", &self.entry.root)
            .field("generation", &self.entry.generation)
            .finish()
    }
}

impl ProjectHandle {
    fn attach(entry: Arc<ProjectEntry>) -> Self {
        entry.inflight.fetch_add(1, Ordering::SeqCst);
        entry.touch();
        Self { entry }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.entry.root
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.entry.generation
    }

    #[must_use]
    pub fn engine_project(&self) -> EngineProject {
        self.entry.engine_project
    }

    /// Fails once the underlying model has been released; callers must not
    /// hand a closed handle to the engine.
    pub fn ensure_open(&self) -> Result<()> {
        if self.entry.is_closed() {
            return Err(WorkspaceError::HandleClosed(self.entry.root.clone()));
        }
        Ok(())
    }

    pub(crate) fn entry(&self) -> &Arc<ProjectEntry> {
        &self.entry
    }
}

impl Clone for ProjectHandle {
    fn clone(&self) -> Self {
        Self::attach(self.entry.clone())
    }
}

impl Drop for ProjectHandle {
    fn drop(&mut self) {
        if self.entry.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.entry.drained.notify_waiters();
        }
    }
}

struct RootSlot {
    root: PathBuf,
    build_lock: TokioMutex<()>,
    generation: AtomicU64,
    current: StdMutex<Option<Arc<ProjectEntry>>>,
}

impl RootSlot {
    fn current(&self) -> Option<Arc<ProjectEntry>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn swap(&self, next: Option<Arc<ProjectEntry>>) -> Option<Arc<ProjectEntry>> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, next)
    }
}

struct CacheInner {
    engine: Arc<dyn CodeModelEngine>,
    config: WorkspaceCacheConfig,
    registry: StdMutex<HashMap<PathBuf, Arc<RootSlot>>>,
    counters: Counters,
    shutdown: CancellationToken,
}

/// Concurrent registry of project-root -> live model handle.
///
/// Concurrent acquires for one root coalesce into a single engine load
/// behind the per-root build lock; distinct roots proceed fully in parallel.
/// An injected component with an explicit start/shutdown lifecycle, not an
/// ambient singleton.
#[derive(Clone)]
pub struct WorkspaceCache {
    inner: Arc<CacheInner>,
}

impl WorkspaceCache {
    pub fn start(engine: Arc<dyn CodeModelEngine>, config: WorkspaceCacheConfig) -> Self {
        let inner = Arc::new(CacheInner {
            engine,
            config: config.clone(),
            registry: StdMutex::new(HashMap::new()),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
        });
        spawn_sweep_loop(Arc::downgrade(&inner), config.sweep_interval);
        Self { inner }
    }

    /// Existing live handle, or a fresh single-flight construction.
    pub async fn acquire(
        &self,
        root: &Path,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<ProjectHandle> {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled);
        }
        let slot = self.slot(root);

        let _build = match slot.build_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.inner
                    .counters
                    .coalesced_waits
                    .fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    guard = slot.build_lock.lock() => guard,
                    () = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
                }
            }
        };

        if !force_refresh {
            if let Some(entry) = slot.current() {
                if !entry.is_closed() {
                    self.inner.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(ProjectHandle::attach(entry));
                }
            }
        }

        self.load_locked(&slot, cancel).await
    }

    /// Live handle without auto-load.
    pub fn get(&self, root: &Path) -> Result<ProjectHandle> {
        let root = normalize_root(root);
        let slot = {
            let registry = self.lock_registry();
            registry.get(&root).cloned()
        };
        let entry = slot
            .and_then(|s| s.current())
            .filter(|entry| !entry.is_closed())
            .ok_or(WorkspaceError::ProjectNotLoaded(root))?;
        Ok(ProjectHandle::attach(entry))
    }

    /// Force full reconstruction: generation++, documents discarded, reload.
    /// `false` if nothing existed for this root.
    pub async fn invalidate(&self, root: &Path, cancel: &CancellationToken) -> Result<bool> {
        let root = normalize_root(root);
        let slot = {
            let registry = self.lock_registry();
            registry.get(&root).cloned()
        };
        let Some(slot) = slot else {
            return Ok(false);
        };

        let _build = tokio::select! {
            guard = slot.build_lock.lock() => guard,
            () = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
        };
        if slot.current().is_none() {
            return Ok(false);
        }

        self.inner
            .counters
            .invalidations
            .fetch_add(1, Ordering::Relaxed);
        let handle = self.load_locked(&slot, cancel).await?;
        drop(handle);
        Ok(true)
    }

    /// Deterministic, idempotent teardown. `false` if nothing was open.
    pub async fn close(&self, root: &Path) -> bool {
        let root = normalize_root(root);
        let slot = {
            let registry = self.lock_registry();
            registry.get(&root).cloned()
        };
        let Some(slot) = slot else {
            return false;
        };

        let _build = slot.build_lock.lock().await;
        match slot.swap(None) {
            Some(entry) => {
                self.inner.counters.closes.fetch_add(1, Ordering::Relaxed);
                close_entry(&self.inner, entry).await;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<ProjectStatus> {
        let slots: Vec<Arc<RootSlot>> = self.lock_registry().values().cloned().collect();
        let mut statuses: Vec<ProjectStatus> = slots
            .iter()
            .filter_map(|slot| slot.current())
            .filter(|entry| !entry.is_closed())
            .map(|entry| ProjectStatus {
                root: entry.root.display().to_string(),
                generation: entry.generation,
                loaded_at_unix_ms: entry.loaded_at_unix_ms,
                idle_ms: entry.idle_ms(),
                open_documents: entry.open_documents(),
                in_flight: entry.inflight.load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by(|a, b| a.root.cmp(&b.root));
        statuses
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot()
    }

    /// Stop the sweep task and close every root.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let roots: Vec<PathBuf> = self.lock_registry().keys().cloned().collect();
        for root in roots {
            self.close(&root).await;
        }
    }

    async fn load_locked(
        &self,
        slot: &Arc<RootSlot>,
        cancel: &CancellationToken,
    ) -> Result<ProjectHandle> {
        let loaded = tokio::select! {
            () = cancel.cancelled() => return Err(WorkspaceError::Cancelled),
            res = self.inner.engine.load_project(&slot.root) => res,
        };

        let engine_project = match loaded {
            Ok(project) => project,
            Err(err) => {
                // Construction failure must not poison the registry: the slot
                // keeps its previous state and the next acquire starts fresh.
                self.inner
                    .counters
                    .load_failures
                    .fetch_add(1, Ordering::Relaxed);
                return Err(err.into());
            }
        };

        let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Arc::new(ProjectEntry::new(
            slot.root.clone(),
            engine_project,
            generation,
        ));
        let old = slot.swap(Some(entry.clone()));
        self.inner.counters.loads.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "loaded project {} (generation {generation})",
            slot.root.display()
        );

        if let Some(old) = old {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                close_entry(&inner, old).await;
            });
        }

        Ok(ProjectHandle::attach(entry))
    }

    fn slot(&self, root: &Path) -> Arc<RootSlot> {
        let root = normalize_root(root);
        let mut registry = self.lock_registry();
        registry
            .entry(root.clone())
            .or_insert_with(|| {
                Arc::new(RootSlot {
                    root,
                    build_lock: TokioMutex::new(()),
                    generation: AtomicU64::new(0),
                    current: StdMutex::new(None),
                })
            })
            .clone()
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<RootSlot>>> {
        self.inner.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for WorkspaceCache {
    fn drop(&mut self) {
        if Arc::strong_count(&self.inner) == 1 {
            self.inner.shutdown.cancel();
        }
    }
}

async fn close_entry(inner: &CacheInner, entry: Arc<ProjectEntry>) {
    entry.closed.store(true, Ordering::SeqCst);

    let drained = async {
        loop {
            let notified = entry.drained.notified();
            if entry.inflight.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
    };
    if tokio::time::timeout(inner.config.close_grace, drained)
        .await
        .is_err()
    {
        log::warn!(
            "closing {} with {} operation(s) still in flight",
            entry.root.display(),
            entry.inflight.load(Ordering::SeqCst)
        );
    }

    if let Err(err) = inner.engine.unload(entry.engine_project).await {
        log::warn!("engine unload failed for {}: {err}", entry.root.display());
    }
}

fn spawn_sweep_loop(inner: Weak<CacheInner>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            if inner.shutdown.is_cancelled() {
                break;
            }
            sweep_once(&inner).await;
        }
    });
}

async fn sweep_once(inner: &Arc<CacheInner>) {
    let slots: Vec<Arc<RootSlot>> = inner
        .registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .values()
        .cloned()
        .collect();

    let idle_after_ms = inner.config.idle_evict_after.as_millis() as u64;
    for slot in slots {
        // The build lock keeps eviction from racing an in-flight acquire for
        // the same root.
        let Ok(_build) = slot.build_lock.try_lock() else {
            continue;
        };
        let evict = slot
            .current()
            .is_some_and(|e| e.inflight.load(Ordering::SeqCst) == 0 && e.idle_ms() > idle_after_ms);
        if !evict {
            continue;
        }
        if let Some(entry) = slot.swap(None) {
            inner.counters.evictions.fetch_add(1, Ordering::Relaxed);
            log::info!("evicting idle project {}", entry.root.display());
            close_entry(inner, entry).await;
        }
    }
}

fn normalize_root(root: &Path) -> PathBuf {
    // Lexical normalization only: symlink resolution would make cache keys
    // depend on filesystem state at acquire time.
    let mut out = PathBuf::new();
    for component in root.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
