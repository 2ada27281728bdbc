//! Pipeline definitions and the per-workspace runner that drives them.
//!
//! A [`PipelineDefinition`] is an immutable, ordered list of prompt-based
//! steps shared by every workspace that runs it. The [`PipelineRunner`] keeps
//! one [`WorkspaceRunState`] per workspace id it has observed and delegates
//! the actual step work to an injected [`StepExecutor`].

mod executor;
mod runner;
mod state;

pub use executor::{StepContext, StepExecutor};
pub use runner::{PipelineRunner, StatusChange};
pub use state::{RunStatus, StepResponse, StepRuntimeState, StepStatus, WorkspaceRunState};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An ordered list of steps. Immutable once handed to a runner; steps are
/// addressed both by index and by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub id: String,
    pub name: String,
    pub steps: Vec<PipelineStepDefinition>,
}

impl PipelineDefinition {
    /// Resolves a step id to its index.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn step_at(&self, index: usize) -> Option<&PipelineStepDefinition> {
        self.steps.get(index)
    }

    /// Index of the final step; `None` for an empty pipeline.
    pub fn last_index(&self) -> Option<usize> {
        self.steps.len().checked_sub(1)
    }
}

/// One unit of pipeline work, parameterized by inputs and producing a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStepDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub prompt: PromptTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// The prompt contract of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub template: String,
    #[serde(default)]
    pub required_inputs: Vec<String>,
    #[serde(default)]
    pub expected_outputs: Vec<String>,
}

#[cfg(test)]
mod tests;
