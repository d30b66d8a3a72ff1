use navspace_engine::EngineError;
use navspace_protocol::ErrorEnvelope;
use navspace_shaper::{ShapeError, StoreError};
use navspace_workspace::WorkspaceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

/// Machine-readable rendering for callers: a stable code, the original
/// diagnostic text, and a recovery hint where one exists.
#[must_use]
pub fn error_envelope(err: &ServiceError) -> ErrorEnvelope {
    let (code, hint, details) = classify(err);
    ErrorEnvelope {
        code: code.to_string(),
        message: err.to_string(),
        details,
        hint: hint.map(str::to_string),
        next_actions: Vec::new(),
    }
}

fn classify(err: &ServiceError) -> (&'static str, Option<&'static str>, Option<serde_json::Value>) {
    match err {
        ServiceError::Workspace(err) => match err {
            WorkspaceError::ProjectNotLoaded(_) => (
                "project_not_loaded",
                Some("Acquire the project first; acquire_project loads on demand."),
                None,
            ),
            WorkspaceError::DocumentNotFound(path) => (
                "document_not_found",
                Some("The path is outside the project or unreadable."),
                Some(serde_json::json!({ "path": path.display().to_string() })),
            ),
            WorkspaceError::StaleHandle { root, generation } => (
                "stale_handle",
                Some("The project model was rebuilt mid-operation; retry the call."),
                Some(serde_json::json!({
                    "root": root.display().to_string(),
                    "generation": generation,
                })),
            ),
            WorkspaceError::HandleClosed(_) => (
                "handle_closed",
                Some("The project was closed or evicted; acquire it again."),
                None,
            ),
            WorkspaceError::Engine(EngineError::LoadFailed { root, message }) => (
                "project_load_failed",
                None,
                Some(serde_json::json!({
                    "root": root.display().to_string(),
                    "engine_message": message,
                })),
            ),
            WorkspaceError::Engine(EngineError::Cancelled) | WorkspaceError::Cancelled => {
                ("cancelled", None, None)
            }
            WorkspaceError::Engine(_) => ("engine_failure", None, None),
        },
        ServiceError::Shape(err) => match err {
            ShapeError::Store(StoreError::Expired(_)) => (
                "resource_expired",
                Some("Parked results age out by design; re-run the original operation."),
                None,
            ),
            ShapeError::Store(StoreError::UnknownUri(_)) => (
                "resource_unknown",
                Some("The URI was never issued by this process; check for typos."),
                None,
            ),
            ShapeError::Store(StoreError::MalformedUri(_)) => ("resource_malformed", None, None),
            ShapeError::Serialize(_) => ("serialize_failed", None, None),
            ShapeError::Cancelled => ("cancelled", None, None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{error_envelope, ServiceError};
    use navspace_engine::EngineError;
    use navspace_shaper::{ShapeError, StoreError};
    use navspace_workspace::WorkspaceError;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn load_failure_preserves_engine_diagnostic() {
        let err = ServiceError::Workspace(WorkspaceError::Engine(EngineError::LoadFailed {
            root: PathBuf::from("/w/app.sln"),
            message: "MSBuild SDK not found".to_string(),
        }));
        let envelope = error_envelope(&err);
        assert_eq!(envelope.code, "project_load_failed");
        assert!(envelope.message.contains("MSBuild SDK not found"));
        assert_eq!(
            envelope.details.unwrap()["engine_message"],
            "MSBuild SDK not found"
        );
    }

    #[test]
    fn expired_and_unknown_resources_are_distinct() {
        let expired = ServiceError::Shape(ShapeError::Store(StoreError::Expired(
            "navspace://results/00000000000000aa".to_string(),
        )));
        let unknown = ServiceError::Shape(ShapeError::Store(StoreError::UnknownUri(
            "navspace://results/00000000000000bb".to_string(),
        )));
        assert_eq!(error_envelope(&expired).code, "resource_expired");
        assert_eq!(error_envelope(&unknown).code, "resource_unknown");
    }

    #[test]
    fn cancellation_maps_to_one_code() {
        let a = ServiceError::Workspace(WorkspaceError::Cancelled);
        let b = ServiceError::Shape(ShapeError::Cancelled);
        assert_eq!(error_envelope(&a).code, "cancelled");
        assert_eq!(error_envelope(&b).code, "cancelled");
    }
}
