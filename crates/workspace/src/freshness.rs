use crate::cache::ProjectHandle;
use crate::error::{Result, WorkspaceError};
use navspace_engine::{CodeModelEngine, EngineError};
use schemars::JsonSchema;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex as TokioMutex;

/// Snapshot of one open document's freshness bookkeeping.
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct DocumentInfo {
    pub path: PathBuf,
    /// Monotonic content version token; bumped on every re-synchronization.
    pub version: u64,
    pub mtime_unix_ms: u64,
    /// Project generation the document was last synchronized under.
    pub generation: u64,
    /// Whether this resolve pushed fresh content into the engine.
    pub resynced: bool,
}

#[derive(Default)]
pub(crate) struct DocSlot {
    state: TokioMutex<DocState>,
}

#[derive(Default)]
struct DocState {
    version: u64,
    last_mtime: Option<SystemTime>,
    forced_stale: bool,
    generation: u64,
    synced: bool,
}

/// Keeps the engine's in-memory view of each document in step with disk.
///
/// A query against a stale snapshot silently answers for content that no
/// longer exists; a timestamp check per access is the price of never doing
/// that. Same-path resolves serialize on a per-path lock; distinct paths run
/// concurrently.
pub struct DocumentFreshnessTracker {
    engine: Arc<dyn CodeModelEngine>,
}

impl DocumentFreshnessTracker {
    pub fn new(engine: Arc<dyn CodeModelEngine>) -> Self {
        Self { engine }
    }

    pub async fn resolve(
        &self,
        handle: &ProjectHandle,
        path: &Path,
        force_refresh: bool,
    ) -> Result<DocumentInfo> {
        handle.ensure_open()?;
        let path = absolutize(handle.root(), path);
        let slot = handle.entry().doc_slot(&path);
        let mut state = slot.state.lock().await;
        handle.ensure_open()?;

        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| WorkspaceError::DocumentNotFound(path.clone()))?;
        let mtime = metadata
            .modified()
            .map_err(|_| WorkspaceError::DocumentNotFound(path.clone()))?;

        let needs_sync = force_refresh
            || !state.synced
            || state.forced_stale
            || state.generation < handle.generation()
            || state.last_mtime.is_none_or(|seen| mtime > seen);

        if !needs_sync {
            handle.entry().touch();
            return Ok(info(&path, &state, false));
        }

        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| WorkspaceError::DocumentNotFound(path.clone()))?;
        let version = state.version + 1;
        self.engine
            .set_document_text(handle.engine_project(), &path, &text, version)
            .await
            .map_err(|err| map_engine_error(err, handle))?;

        *state = DocState {
            version,
            last_mtime: Some(mtime),
            forced_stale: false,
            generation: handle.generation(),
            synced: true,
        };
        handle.entry().touch();
        log::debug!("resynchronized {} (version {version})", path.display());
        Ok(info(&path, &state, true))
    }

    /// Force the next resolve to re-synchronize regardless of timestamps.
    /// Covers filesystem timestamp coarseness and rapid automated edits.
    pub async fn mark_stale(&self, handle: &ProjectHandle, path: &Path) {
        let path = absolutize(handle.root(), path);
        let slot = handle.entry().doc_slot(&path);
        slot.state.lock().await.forced_stale = true;
    }

    /// Record that an edit went through this layer: the engine already holds
    /// the new content, so the next resolve must not re-push it.
    pub async fn note_edit_applied(&self, handle: &ProjectHandle, path: &Path) {
        let path = absolutize(handle.root(), path);
        let slot = handle.entry().doc_slot(&path);
        let mut state = slot.state.lock().await;
        state.version += 1;
        state.synced = true;
        state.forced_stale = false;
        state.generation = handle.generation();
        state.last_mtime = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|m| m.modified().ok());
    }
}

fn info(path: &Path, state: &DocState, resynced: bool) -> DocumentInfo {
    DocumentInfo {
        path: path.to_path_buf(),
        version: state.version,
        mtime_unix_ms: state
            .last_mtime
            .map_or(0, navspace_protocol::unix_ms),
        generation: state.generation,
        resynced,
    }
}

fn map_engine_error(err: EngineError, handle: &ProjectHandle) -> WorkspaceError {
    match err {
        // The engine dropped this project out from under us: the handle's
        // generation no longer matches a live model.
        EngineError::InvalidHandle => WorkspaceError::StaleHandle {
            root: handle.root().to_path_buf(),
            generation: handle.generation(),
        },
        other => WorkspaceError::Engine(other),
    }
}

fn absolutize(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
