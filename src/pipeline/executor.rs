//! The injected boundary that performs the actual step work.
//!
//! The runner never generates step content itself; the hosting UI supplies a
//! [`StepExecutor`] (typically a prompt-to-model call) and the runner hands it
//! an owned [`StepContext`] per execution.

use super::state::{StepResponse, StepRuntimeState};
use super::{PipelineDefinition, PipelineStepDefinition};
use crate::workspace::WorkspaceId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Everything one step execution can see: the pipeline, the step being run,
/// its runtime record, and read-only copies of every prior response and
/// input. Owned data throughout, so executors can move it into spawned work.
#[derive(Clone)]
pub struct StepContext {
    pub workspace_id: WorkspaceId,
    pub pipeline: Arc<PipelineDefinition>,
    pub step: PipelineStepDefinition,
    pub step_state: StepRuntimeState,
    /// Responses of every step that has one, keyed by step id.
    pub responses: HashMap<String, StepResponse>,
    /// Recorded inputs of every step, keyed by step id.
    pub inputs: HashMap<String, HashMap<String, Value>>,
    /// Flips to `true` when the host cancels the in-flight step. Cooperative:
    /// the executor decides when to observe it.
    pub cancel_rx: watch::Receiver<bool>,
}

impl StepContext {
    /// Whether cancellation has been requested for this execution.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation is requested. Intended for use inside a
    /// `tokio::select!` alongside the executor's real work; also resolves if
    /// the runner side goes away.
    pub async fn cancelled(&mut self) {
        while !*self.cancel_rx.borrow() {
            if self.cancel_rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Performs the work of one pipeline step.
///
/// Returning `Ok(None)` (or a response with empty content) completes the step
/// without recording a response. Errors are recorded on the step and the
/// workspace and re-raised to the caller, who may retry.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, context: StepContext) -> anyhow::Result<Option<StepResponse>>;
}
