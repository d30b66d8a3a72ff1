use crate::{CodeModelEngine, EngineError, EngineProject, Result, TextEdit};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory engine used by tests and stub deployments.
///
/// Behaves like the real engine at the interface level (tokens, documents,
/// queries) while letting tests observe load counts and inject latency,
/// failures, and poisoned handles.
pub struct StubEngine {
    state: Mutex<StubState>,
    load_delay: Duration,
    loads: AtomicUsize,
    set_text_calls: AtomicUsize,
}

#[derive(Default)]
struct StubState {
    next_id: u64,
    projects: HashMap<u64, StubProject>,
    fail_next_load: Option<String>,
}

struct StubProject {
    root: PathBuf,
    poisoned: bool,
    docs: HashMap<PathBuf, StubDoc>,
    canned_query: Option<serde_json::Value>,
}

struct StubDoc {
    text: String,
    version: u64,
}

impl StubEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StubState::default()),
            load_delay: Duration::ZERO,
            loads: AtomicUsize::new(0),
            set_text_calls: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Total successful `load_project` calls across all roots.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Total `set_document_text` calls.
    #[must_use]
    pub fn set_text_count(&self) -> usize {
        self.set_text_calls.load(Ordering::SeqCst)
    }

    /// Make the next `load_project` fail with `message`.
    pub fn fail_next_load(&self, message: impl Into<String>) {
        self.lock().fail_next_load = Some(message.into());
    }

    /// Mark a live project so further queries fail with `InvalidHandle`,
    /// as the real engine does after an out-of-band reload.
    pub fn poison(&self, project: EngineProject) {
        if let Some(p) = self.lock().projects.get_mut(&project.0) {
            p.poisoned = true;
        }
    }

    /// Queue the result the next `query` on `project` should return.
    pub fn set_query_result(&self, project: EngineProject, result: serde_json::Value) {
        if let Some(p) = self.lock().projects.get_mut(&project.0) {
            p.canned_query = Some(result);
        }
    }

    /// Engine-side text of a document, if present.
    #[must_use]
    pub fn document_text(&self, project: EngineProject, path: &Path) -> Option<String> {
        self.lock()
            .projects
            .get(&project.0)
            .and_then(|p| p.docs.get(path))
            .map(|d| d.text.clone())
    }

    #[must_use]
    pub fn is_loaded(&self, project: EngineProject) -> bool {
        self.lock().projects.contains_key(&project.0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CodeModelEngine for StubEngine {
    async fn load_project(&self, root: &Path) -> Result<EngineProject> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let mut state = self.lock();
        if let Some(message) = state.fail_next_load.take() {
            return Err(EngineError::LoadFailed {
                root: root.to_path_buf(),
                message,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        state.projects.insert(
            id,
            StubProject {
                root: root.to_path_buf(),
                poisoned: false,
                docs: HashMap::new(),
                canned_query: None,
            },
        );
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(EngineProject(id))
    }

    async fn unload(&self, project: EngineProject) -> Result<()> {
        self.lock().projects.remove(&project.0);
        Ok(())
    }

    async fn get_document(&self, project: EngineProject, path: &Path) -> Result<String> {
        let state = self.lock();
        let p = state
            .projects
            .get(&project.0)
            .ok_or(EngineError::InvalidHandle)?;
        p.docs
            .get(path)
            .map(|d| d.text.clone())
            .ok_or_else(|| EngineError::DocumentMissing(path.to_path_buf()))
    }

    async fn set_document_text(
        &self,
        project: EngineProject,
        path: &Path,
        text: &str,
        version: u64,
    ) -> Result<()> {
        let mut state = self.lock();
        let p = state
            .projects
            .get_mut(&project.0)
            .ok_or(EngineError::InvalidHandle)?;
        p.docs.insert(
            path.to_path_buf(),
            StubDoc {
                text: text.to_string(),
                version,
            },
        );
        self.set_text_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn apply_edit(
        &self,
        project: EngineProject,
        path: &Path,
        edit: &TextEdit,
    ) -> Result<String> {
        let mut state = self.lock();
        let p = state
            .projects
            .get_mut(&project.0)
            .ok_or(EngineError::InvalidHandle)?;
        let doc = p
            .docs
            .get_mut(path)
            .ok_or_else(|| EngineError::DocumentMissing(path.to_path_buf()))?;

        if edit.start > edit.end || edit.end > doc.text.len() {
            return Err(EngineError::QueryFailed(format!(
                "edit span {}..{} out of bounds for {} bytes",
                edit.start,
                edit.end,
                doc.text.len()
            )));
        }
        doc.text.replace_range(edit.start..edit.end, &edit.new_text);
        doc.version += 1;
        Ok(doc.text.clone())
    }

    async fn query(
        &self,
        project: EngineProject,
        request: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let mut state = self.lock();
        let p = state
            .projects
            .get_mut(&project.0)
            .ok_or(EngineError::InvalidHandle)?;
        if p.poisoned {
            return Err(EngineError::InvalidHandle);
        }
        if let Some(canned) = p.canned_query.take() {
            return Ok(canned);
        }
        Ok(serde_json::json!({
            "root": p.root.display().to_string(),
            "request": request,
            "results": [],
        }))
    }
}
