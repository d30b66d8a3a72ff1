//! Facade exposed to the analysis operations.
//!
//! Operations acquire a project handle, query the engine through it, and hand
//! their raw result lists to `shape_response`. Everything expensive or
//! stateful (handle cache, freshness, resource store) lives behind this one
//! component with an explicit start/shutdown lifecycle.

use navspace_engine::EngineError;
use navspace_shaper::{
    ProgressiveReducer, ResourceStore, ResponseBuilder, ShapeError, ShapeRequest, TokenEstimator,
};
use navspace_workspace::{DocumentFreshnessTracker, WorkspaceCache};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod config;
mod dispatch;
mod error;

pub use config::RuntimeSettings;
pub use dispatch::{shape_spec, ResultKind, ShapeSpec};
pub use error::{error_envelope, Result, ServiceError};

// The types operations actually touch, re-exported so callers depend on one
// crate.
pub use navspace_engine::{CodeModelEngine, EngineProject, StubEngine, TextEdit};
pub use navspace_protocol::{ReducedResponse, TokenBudget, ToolNextAction, TruncationReason};
pub use navspace_shaper::RetryTemplate;
pub use navspace_workspace::{
    CacheStats, DocumentInfo, ProjectHandle, ProjectStatus, WorkspaceError,
};

pub struct NavService {
    engine: Arc<dyn CodeModelEngine>,
    cache: WorkspaceCache,
    tracker: DocumentFreshnessTracker,
    builder: ResponseBuilder,
    settings: RuntimeSettings,
    shutdown: CancellationToken,
}

impl NavService {
    /// Wire up the cache, tracker, and store and start their background
    /// tasks. Must run inside a tokio runtime.
    #[must_use]
    pub fn start(engine: Arc<dyn CodeModelEngine>, settings: RuntimeSettings) -> Self {
        let cache = WorkspaceCache::start(engine.clone(), settings.cache.clone());
        let tracker = DocumentFreshnessTracker::new(engine.clone());
        let store = Arc::new(ResourceStore::with_capacity(settings.resource_capacity));
        let builder = ResponseBuilder::new(
            TokenEstimator::default(),
            ProgressiveReducer::new(settings.reducer_steps.clone()),
            store.clone(),
            settings.resource_ttl,
        );
        let shutdown = CancellationToken::new();
        spawn_resource_sweep(
            Arc::downgrade(&store),
            settings.cache.sweep_interval,
            shutdown.clone(),
        );

        Self {
            engine,
            cache,
            tracker,
            builder,
            settings,
            shutdown,
        }
    }

    pub async fn acquire_project(
        &self,
        root: &Path,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<ProjectHandle> {
        Ok(self.cache.acquire(root, force_refresh, cancel).await?)
    }

    pub async fn resolve_document(
        &self,
        handle: &ProjectHandle,
        path: &Path,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> Result<DocumentInfo> {
        if cancel.is_cancelled() {
            return Err(WorkspaceError::Cancelled.into());
        }
        Ok(self.tracker.resolve(handle, path, force_refresh).await?)
    }

    pub async fn mark_document_stale(&self, handle: &ProjectHandle, path: &Path) {
        self.tracker.mark_stale(handle, path).await;
    }

    /// Run a semantic query with one automatic invalidate-and-retry when the
    /// engine reports the handle went stale mid-operation.
    pub async fn query(
        &self,
        root: &Path,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let handle = self.cache.acquire(root, false, cancel).await?;
        match self.query_once(&handle, request, cancel).await {
            Err(ServiceError::Workspace(WorkspaceError::StaleHandle { .. })) => {
                log::info!(
                    "stale handle for {}; reloading and retrying once",
                    root.display()
                );
                drop(handle);
                self.cache.invalidate(root, cancel).await?;
                let handle = self.cache.acquire(root, false, cancel).await?;
                self.query_once(&handle, request, cancel).await
            }
            other => other,
        }
    }

    /// Apply an edit through the engine, persist the result to disk, and
    /// record the new version so the next resolve does not re-push it.
    pub async fn apply_edit(
        &self,
        root: &Path,
        path: &Path,
        edit: &TextEdit,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let handle = self.cache.acquire(root, false, cancel).await?;
        match self.apply_edit_once(&handle, path, edit, cancel).await {
            Err(ServiceError::Workspace(WorkspaceError::StaleHandle { .. })) => {
                log::info!(
                    "stale handle for {}; reloading and retrying edit once",
                    root.display()
                );
                drop(handle);
                self.cache.invalidate(root, cancel).await?;
                let handle = self.cache.acquire(root, false, cancel).await?;
                self.apply_edit_once(&handle, path, edit, cancel).await
            }
            other => other,
        }
    }

    /// Shape a raw result batch to the caller's budget and cap.
    pub fn shape_response(
        &self,
        kind: ResultKind,
        items: Vec<Value>,
        budget_tokens: Option<u64>,
        max_results: Option<usize>,
        retry: Option<RetryTemplate>,
        cancel: &CancellationToken,
    ) -> Result<ReducedResponse<Value>> {
        let spec = shape_spec(kind);
        let budget = TokenBudget::new(self.settings.clamp_budget_tokens(budget_tokens));
        let max_results = self.settings.clamp_max_results(max_results);
        Ok(self.builder.build(
            ShapeRequest {
                items,
                cost: &spec.cost,
                priority: &spec.priority,
                budget,
                max_results,
                retry,
            },
            cancel,
        )?)
    }

    /// Full, untruncated payload parked by an earlier reduced response.
    pub fn fetch_resource(&self, uri: &str) -> Result<Value> {
        let bytes = self
            .builder
            .store()
            .get(uri)
            .map_err(ShapeError::from)?;
        Ok(serde_json::from_slice(&bytes).map_err(ShapeError::from)?)
    }

    pub async fn invalidate_project(&self, root: &Path, cancel: &CancellationToken) -> Result<bool> {
        Ok(self.cache.invalidate(root, cancel).await?)
    }

    pub async fn close_project(&self, root: &Path) -> bool {
        self.cache.close(root).await
    }

    #[must_use]
    pub fn list_active(&self) -> Vec<ProjectStatus> {
        self.cache.list_active()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Stop background tasks and close every project.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.cache.shutdown().await;
    }

    async fn query_once(
        &self,
        handle: &ProjectHandle,
        request: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        handle.ensure_open()?;
        let out = tokio::select! {
            () = cancel.cancelled() => return Err(WorkspaceError::Cancelled.into()),
            res = self.engine.query(handle.engine_project(), request) => res,
        };
        out.map_err(|err| stale_or_engine(err, handle))
    }

    async fn apply_edit_once(
        &self,
        handle: &ProjectHandle,
        path: &Path,
        edit: &TextEdit,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // The engine must hold current content before the edit lands on it.
        let info = self.resolve_document(handle, path, false, cancel).await?;

        let out = tokio::select! {
            () = cancel.cancelled() => return Err(WorkspaceError::Cancelled.into()),
            res = self.engine.apply_edit(handle.engine_project(), &info.path, edit) => res,
        };
        let new_text = out.map_err(|err| stale_or_engine(err, handle))?;

        tokio::fs::write(&info.path, &new_text)
            .await
            .map_err(|_| WorkspaceError::DocumentNotFound(info.path.clone()))?;
        self.tracker.note_edit_applied(handle, path).await;
        Ok(new_text)
    }
}

fn stale_or_engine(err: EngineError, handle: &ProjectHandle) -> ServiceError {
    match err {
        EngineError::InvalidHandle => WorkspaceError::StaleHandle {
            root: handle.root().to_path_buf(),
            generation: handle.generation(),
        }
        .into(),
        other => ServiceError::Workspace(other.into()),
    }
}

fn spawn_resource_sweep(store: Weak<ResourceStore>, interval: Duration, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(store) = store.upgrade() else {
                break;
            };
            store.sweep();
        }
    });
}
