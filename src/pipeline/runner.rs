//! Multi-workspace pipeline runner.
//!
//! One runner owns the runtime state of every workspace id it has observed.
//! All mutation happens in short synchronous sections under an internal
//! mutex; the only suspension point is the executor callback, awaited with
//! the lock released. That makes the per-workspace in-flight guard a real
//! guarantee rather than a convention: a second `run_current_step` on the
//! same workspace while the first is awaiting fails fast instead of silently
//! overwriting its result.

use super::executor::{StepContext, StepExecutor};
use super::state::{RunStatus, StepResponse, StepRuntimeState, StepStatus, WorkspaceRunState};
use super::PipelineDefinition;
use crate::errors::{OrchestratorError, Result};
use crate::workspace::WorkspaceId;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};

/// Capacity of the status broadcast channel. Slow subscribers lag, they do
/// not block transitions.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Broadcast on every workspace-status-level transition (not on every field
/// mutation). The only push interface the runner exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub workspace_id: WorkspaceId,
    pub status: RunStatus,
}

struct InFlight {
    step_id: String,
    cancel_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct RunnerInner {
    states: HashMap<WorkspaceId, WorkspaceRunState>,
    in_flight: HashMap<WorkspaceId, InFlight>,
    active: Option<WorkspaceId>,
}

/// Drives one [`PipelineDefinition`] through its steps, once per workspace.
///
/// The runner is an explicit object, not ambient state; multiple runners
/// coexist (each with its own state map), which is what makes it testable
/// with a fake executor. Methods operate on the active workspace supplied by
/// the hosting UI via [`set_active_workspace`](Self::set_active_workspace).
pub struct PipelineRunner {
    pipeline: Arc<PipelineDefinition>,
    executor: Arc<dyn StepExecutor>,
    auto_advance: bool,
    status_tx: broadcast::Sender<StatusChange>,
    inner: Mutex<RunnerInner>,
}

impl PipelineRunner {
    pub fn new(pipeline: PipelineDefinition, executor: Arc<dyn StepExecutor>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            pipeline: Arc::new(pipeline),
            executor,
            auto_advance: true,
            status_tx,
            inner: Mutex::new(RunnerInner::default()),
        }
    }

    /// Disables (or re-enables) the automatic `advance_step` after a
    /// successful `run_current_step`. On by default.
    pub fn with_auto_advance(mut self, auto_advance: bool) -> Self {
        self.auto_advance = auto_advance;
        self
    }

    pub fn pipeline(&self) -> Arc<PipelineDefinition> {
        Arc::clone(&self.pipeline)
    }

    /// Subscribes to workspace status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    /// Swaps the pipeline definition. Run states created under the previous
    /// definition are replaced wholesale the next time their workspace is
    /// touched, so stale per-step state never leaks across pipeline versions.
    pub fn set_pipeline(&mut self, pipeline: PipelineDefinition) {
        self.pipeline = Arc::new(pipeline);
    }

    /// Makes `workspace_id` the target of subsequent runner calls, creating
    /// its run state lazily on first observation.
    ///
    /// Side effect: if the previously active workspace was `running` it is
    /// demoted to `paused` first, so two workspaces never appear to run at
    /// once from the runner's perspective.
    pub fn set_active_workspace(&self, workspace_id: WorkspaceId) {
        let mut inner = self.lock();
        if let Some(previous) = inner.active.clone() {
            if previous != workspace_id {
                if let Some(state) = inner.states.get_mut(&previous) {
                    if state.status == RunStatus::Running {
                        state.status = RunStatus::Paused;
                        tracing::debug!(workspace = %previous, "pausing previously active workspace");
                        self.broadcast(&previous, RunStatus::Paused);
                    }
                }
            }
        }
        Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        inner.active = Some(workspace_id);
    }

    pub fn active_workspace(&self) -> Option<WorkspaceId> {
        self.lock().active.clone()
    }

    /// Owned snapshot of a workspace's run state.
    pub fn run_state(&self, workspace_id: &WorkspaceId) -> Option<WorkspaceRunState> {
        self.lock().states.get(workspace_id).cloned()
    }

    /// Adopts a previously persisted run state (e.g. read back from workspace
    /// metadata). State recorded against a different pipeline id is discarded
    /// with a warning; a fresh state will be created lazily instead.
    pub fn hydrate(&self, mut state: WorkspaceRunState) {
        if state.pipeline_id != self.pipeline.id {
            tracing::warn!(
                pipeline_id = %state.pipeline_id,
                workspace = %state.workspace_id,
                "discarding persisted run state for a different pipeline"
            );
            return;
        }
        if state.history.last() != Some(&state.current_step_index) {
            state.history.push(state.current_step_index);
        }
        self.lock()
            .states
            .insert(state.workspace_id.clone(), state);
    }

    /// `idle | paused -> running`. Stamps `started_at` once, on the very
    /// first transition into `running`. Any other status is a logged no-op.
    pub fn start_pipeline(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        match state.status {
            RunStatus::Idle | RunStatus::Paused => {
                if state.started_at.is_none() {
                    state.started_at = Some(Utc::now());
                }
                state.status = RunStatus::Running;
                self.broadcast(&workspace_id, RunStatus::Running);
            }
            status => {
                tracing::debug!(workspace = %workspace_id, ?status, "start_pipeline ignored");
            }
        }
        Ok(())
    }

    /// `running -> paused`; no-op otherwise. Pausing only prevents autonomous
    /// advancement, it does not abort an in-flight executor callback — use
    /// [`cancel_current_step`](Self::cancel_current_step) for that.
    pub fn pause_pipeline(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        if state.status == RunStatus::Running {
            state.status = RunStatus::Paused;
            self.broadcast(&workspace_id, RunStatus::Paused);
        }
        Ok(())
    }

    /// `paused -> running`; no-op otherwise.
    pub fn resume_pipeline(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        if state.status == RunStatus::Paused {
            state.status = RunStatus::Running;
            self.broadcast(&workspace_id, RunStatus::Running);
        }
        Ok(())
    }

    /// Moves to the next step, recording the new index in history. At the
    /// last index the workspace transitions to `completed` instead
    /// (idempotent; `finished_at` is stamped once).
    pub fn advance_step(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        self.advance_step_locked(&mut inner, &workspace_id);
        Ok(())
    }

    /// Pops the last history entry and returns to the one before it. A
    /// history of length 1 cannot rewind further.
    pub fn rewind_step(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        if state.history.len() > 1 {
            state.history.pop();
            if let Some(&index) = state.history.last() {
                state.current_step_index = index;
            }
        }
        Ok(())
    }

    /// Jumps to the step with the given id, recording the jump in history so
    /// it can be rewound. An unknown id is a logged no-op.
    pub fn go_to_step(&self, step_id: &str) -> Result<()> {
        let Some(index) = self.pipeline.step_index(step_id) else {
            tracing::warn!(step_id, "go_to_step: unknown step id, ignoring");
            return Ok(());
        };
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        state.current_step_index = index;
        state.history.push(index);
        Ok(())
    }

    /// Merges `inputs` into the named step's recorded inputs. An unknown id
    /// is a logged no-op: these calls are typically driven by UI callbacks
    /// holding possibly stale references, and must not crash the pipeline.
    pub fn set_step_inputs(&self, step_id: &str, inputs: HashMap<String, Value>) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        match state.steps.get_mut(step_id) {
            Some(step) => step.inputs.extend(inputs),
            None => tracing::warn!(step_id, "set_step_inputs: unknown step id, ignoring"),
        }
        Ok(())
    }

    /// Records a response for the named step, marking it completed. If the
    /// step is the pipeline's last, the workspace completes too. An unknown
    /// id is a logged no-op.
    pub fn set_step_response(&self, step_id: &str, response: StepResponse) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        self.record_response_locked(&mut inner, &workspace_id, step_id, response);
        Ok(())
    }

    /// Discards the workspace's runtime state and reinitializes from the
    /// current pipeline definition.
    pub fn reset_pipeline(&self) -> Result<()> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        inner.states.insert(
            workspace_id.clone(),
            WorkspaceRunState::new(workspace_id.clone(), &self.pipeline),
        );
        self.broadcast(&workspace_id, RunStatus::Idle);
        Ok(())
    }

    /// Signals cancellation to the in-flight execution on the active
    /// workspace, if any. Cooperative: the executor observes the signal via
    /// its [`StepContext`]; once it returns, the step goes back to `idle`.
    pub fn cancel_current_step(&self) -> Result<()> {
        let inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;
        if let Some(in_flight) = inner.in_flight.get(&workspace_id) {
            tracing::debug!(workspace = %workspace_id, step_id = %in_flight.step_id, "cancelling in-flight step");
            let _ = in_flight.cancel_tx.send(true);
        }
        Ok(())
    }

    /// Executes the current step through the injected executor.
    ///
    /// Fails with `NoCurrentStep` when the pipeline has no step at the
    /// current index and `StepAlreadyRunning` when an execution for this
    /// workspace is still in flight. On success the response is recorded and,
    /// with auto-advance enabled, the pipeline moves on — unless the
    /// workspace was paused while the step ran. On executor failure
    /// both the step and the workspace are marked `error` and the error is
    /// re-raised; the caller may call again to retry. A cancelled execution
    /// returns `Ok(None)` with the step back at `idle`.
    pub async fn run_current_step(
        &self,
        input_overrides: Option<HashMap<String, Value>>,
    ) -> Result<Option<StepResponse>> {
        let (workspace_id, step_id, context) = self.begin_step(input_overrides)?;

        // The only suspension point; the lock is not held here.
        let outcome = self.executor.execute(context).await;

        let mut inner = self.lock();
        let cancelled = inner
            .in_flight
            .remove(&workspace_id)
            .is_some_and(|in_flight| *in_flight.cancel_tx.borrow());

        if cancelled {
            let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
            if let Some(step) = state.steps.get_mut(&step_id) {
                step.status = StepStatus::Idle;
                step.error = None;
                step.started_at = None;
            }
            tracing::debug!(workspace = %workspace_id, step_id = %step_id, "step cancelled, returning to idle");
            return Ok(None);
        }

        match outcome {
            Ok(response) => {
                let response = response.filter(|r| !r.content.is_empty());
                let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
                if state.status == RunStatus::Error {
                    // A successful execution clears a previous failure.
                    state.status = RunStatus::Running;
                    state.error = None;
                    self.broadcast(&workspace_id, RunStatus::Running);
                }
                match response.clone() {
                    Some(resp) => {
                        self.record_response_locked(&mut inner, &workspace_id, &step_id, resp);
                    }
                    None => {
                        // Executor finished without producing content.
                        let state =
                            Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
                        if let Some(step) = state.steps.get_mut(&step_id) {
                            step.status = StepStatus::Completed;
                            step.error = None;
                            step.completed_at = Some(Utc::now());
                        }
                    }
                }
                // Pausing while the step was in flight keeps the response
                // but suppresses autonomous advancement.
                let paused = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id)
                    .status
                    == RunStatus::Paused;
                if self.auto_advance && !paused {
                    self.advance_step_locked(&mut inner, &workspace_id);
                }
                Ok(response)
            }
            Err(err) => {
                let message = format!("{err:#}");
                let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
                if let Some(step) = state.steps.get_mut(&step_id) {
                    step.status = StepStatus::Error;
                    step.error = Some(message.clone());
                }
                state.status = RunStatus::Error;
                state.error = Some(message.clone());
                self.broadcast(&workspace_id, RunStatus::Error);
                Err(OrchestratorError::StepFailed { step_id, message })
            }
        }
    }

    /// Synchronous prologue of `run_current_step`: validates, arms the
    /// in-flight guard, marks the step running and builds the owned context.
    fn begin_step(
        &self,
        input_overrides: Option<HashMap<String, Value>>,
    ) -> Result<(WorkspaceId, String, StepContext)> {
        let mut inner = self.lock();
        let workspace_id = Self::active_id(&inner)?;

        if let Some(in_flight) = inner.in_flight.get(&workspace_id) {
            return Err(OrchestratorError::StepAlreadyRunning {
                workspace_id: workspace_id.to_string(),
                step_id: in_flight.step_id.clone(),
            });
        }

        let state = Self::ensure_state(&mut inner, &self.pipeline, &workspace_id);
        let index = state.current_step_index;
        let Some(step) = self.pipeline.step_at(index).cloned() else {
            return Err(OrchestratorError::NoCurrentStep {
                pipeline_id: self.pipeline.id.clone(),
                index,
            });
        };

        let step_state = state
            .steps
            .entry(step.id.clone())
            .or_insert_with(|| StepRuntimeState::new(&step.id));
        step_state.status = StepStatus::Running;
        step_state.error = None;
        if let Some(overrides) = input_overrides {
            step_state.inputs.extend(overrides);
        }
        if step_state.started_at.is_none() {
            step_state.started_at = Some(Utc::now());
        }
        let step_state = step_state.clone();

        let responses = state
            .steps
            .iter()
            .filter_map(|(id, s)| s.response.clone().map(|r| (id.clone(), r)))
            .collect();
        let inputs = state
            .steps
            .iter()
            .map(|(id, s)| (id.clone(), s.inputs.clone()))
            .collect();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        inner.in_flight.insert(
            workspace_id.clone(),
            InFlight {
                step_id: step.id.clone(),
                cancel_tx,
            },
        );

        let step_id = step.id.clone();
        let context = StepContext {
            workspace_id: workspace_id.clone(),
            pipeline: Arc::clone(&self.pipeline),
            step,
            step_state,
            responses,
            inputs,
            cancel_rx,
        };
        Ok((workspace_id, step_id, context))
    }

    fn advance_step_locked(&self, inner: &mut RunnerInner, workspace_id: &WorkspaceId) {
        let Some(last) = self.pipeline.last_index() else {
            return;
        };
        let state = Self::ensure_state(inner, &self.pipeline, workspace_id);
        if state.current_step_index >= last {
            if state.status != RunStatus::Completed {
                state.status = RunStatus::Completed;
                if state.finished_at.is_none() {
                    state.finished_at = Some(Utc::now());
                }
                self.broadcast(workspace_id, RunStatus::Completed);
            }
        } else {
            state.current_step_index += 1;
            state.history.push(state.current_step_index);
        }
    }

    fn record_response_locked(
        &self,
        inner: &mut RunnerInner,
        workspace_id: &WorkspaceId,
        step_id: &str,
        response: StepResponse,
    ) {
        let is_last = self.pipeline.step_index(step_id).is_some()
            && self.pipeline.step_index(step_id) == self.pipeline.last_index();
        let state = Self::ensure_state(inner, &self.pipeline, workspace_id);
        let Some(step) = state.steps.get_mut(step_id) else {
            tracing::warn!(step_id, "set_step_response: unknown step id, ignoring");
            return;
        };
        step.response = Some(response);
        step.status = StepStatus::Completed;
        step.error = None;
        step.completed_at = Some(Utc::now());
        if is_last && state.status != RunStatus::Completed {
            state.status = RunStatus::Completed;
            if state.finished_at.is_none() {
                state.finished_at = Some(Utc::now());
            }
            self.broadcast(workspace_id, RunStatus::Completed);
        }
    }

    /// Creates the run state lazily on first observation and replaces it
    /// wholesale when the pipeline id no longer matches the definition.
    fn ensure_state<'a>(
        inner: &'a mut RunnerInner,
        pipeline: &Arc<PipelineDefinition>,
        workspace_id: &WorkspaceId,
    ) -> &'a mut WorkspaceRunState {
        let state = inner
            .states
            .entry(workspace_id.clone())
            .or_insert_with(|| WorkspaceRunState::new(workspace_id.clone(), pipeline));
        if state.pipeline_id != pipeline.id {
            *state = WorkspaceRunState::new(workspace_id.clone(), pipeline);
        }
        state
    }

    fn active_id(inner: &RunnerInner) -> Result<WorkspaceId> {
        inner
            .active
            .clone()
            .ok_or(OrchestratorError::NoActiveWorkspace)
    }

    fn broadcast(&self, workspace_id: &WorkspaceId, status: RunStatus) {
        let _ = self.status_tx.send(StatusChange {
            workspace_id: workspace_id.clone(),
            status,
        });
    }

    fn lock(&self) -> MutexGuard<'_, RunnerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
