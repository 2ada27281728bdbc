//! Mutable, in-memory, per-workspace record of pipeline progress.
//!
//! Serializable so the hosting UI can stash it in workspace metadata and
//! rehydrate it after a restart.

use super::PipelineDefinition;
use crate::workspace::WorkspaceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Idle,
    Running,
    Completed,
    Error,
}

/// Workspace-level run status. `Error` is not terminal: the caller may retry
/// the failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Error,
}

/// What the executor produced for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl StepResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: None,
        }
    }
}

/// Runtime record of one step within one workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRuntimeState {
    pub id: String,
    pub status: StepStatus,
    #[serde(default)]
    pub inputs: HashMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<StepResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepRuntimeState {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: StepStatus::Idle,
            inputs: HashMap::new(),
            response: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// The whole runtime state of one workspace's pipeline run.
///
/// `history` records every step index ever visited through forward or jump
/// navigation; it is never empty and its last element always equals
/// `current_step_index`, which is what makes rewind possible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRunState {
    pub workspace_id: WorkspaceId,
    pub pipeline_id: String,
    pub current_step_index: usize,
    pub status: RunStatus,
    pub steps: HashMap<String, StepRuntimeState>,
    pub history: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkspaceRunState {
    /// Fresh state at step zero with every step idle.
    pub fn new(workspace_id: WorkspaceId, pipeline: &PipelineDefinition) -> Self {
        let steps = pipeline
            .steps
            .iter()
            .map(|step| (step.id.clone(), StepRuntimeState::new(&step.id)))
            .collect();
        Self {
            workspace_id,
            pipeline_id: pipeline.id.clone(),
            current_step_index: 0,
            status: RunStatus::Idle,
            steps,
            history: vec![0],
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Runtime record of the step at `current_step_index`, if the pipeline
    /// defines one.
    pub fn current_step(&self, pipeline: &PipelineDefinition) -> Option<&StepRuntimeState> {
        let step = pipeline.step_at(self.current_step_index)?;
        self.steps.get(&step.id)
    }
}
