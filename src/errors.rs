//! Error types shared by the workspace store and the pipeline runner.

use std::path::PathBuf;

/// Errors surfaced by the orchestrator.
///
/// Store preconditions (`WorkspaceAlreadyExists`, `WorkspaceNotFound`) and
/// identifier parse failures always propagate to the caller. Unknown step ids
/// passed to runner mutators are deliberately NOT represented here: those are
/// logged and ignored so a stale UI callback cannot crash the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("malformed workspace identifier {id:?}: expected \"org/repo/feature\"")]
    MalformedIdentifier { id: String },

    #[error("workspace key segments must be non-empty")]
    EmptyKeySegment,

    #[error("workspace key segment {segment:?} must not contain '/'")]
    InvalidKeySegment { segment: String },

    #[error("workspace {id} already exists")]
    WorkspaceAlreadyExists { id: String },

    #[error("workspace {id} not found")]
    WorkspaceNotFound { id: String },

    #[error("storage unavailable at {}: {source}", .path.display())]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read workspace record {}: {source}", .path.display())]
    ReadRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write workspace record {}: {source}", .path.display())]
    WriteRecord {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode workspace record {}: {source}", .path.display())]
    EncodeRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse workspace record {}: {source}", .path.display())]
    ParseRecord {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no workspace selected: call set_active_workspace first")]
    NoActiveWorkspace,

    #[error("pipeline {pipeline_id} has no step at index {index}")]
    NoCurrentStep { pipeline_id: String, index: usize },

    #[error("step {step_id} of workspace {workspace_id} is already running")]
    StepAlreadyRunning {
        workspace_id: String,
        step_id: String,
    },

    #[error("step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
