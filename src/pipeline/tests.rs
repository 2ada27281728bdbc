//! Tests for the pipeline runner state machine, driven by fake executors so
//! no model call is ever needed.

use super::*;
use crate::errors::OrchestratorError;
use crate::workspace::WorkspaceId;
use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

fn pipeline_with(id: &str, step_count: usize) -> PipelineDefinition {
    let steps = (1..=step_count)
        .map(|n| PipelineStepDefinition {
            id: format!("step-{n}"),
            name: format!("Step {n}"),
            description: None,
            prompt: PromptTemplate {
                template: format!("Do part {n} of the work"),
                required_inputs: Vec::new(),
                expected_outputs: Vec::new(),
            },
            metadata: None,
        })
        .collect();
    PipelineDefinition {
        id: id.to_string(),
        name: "Feature pipeline".to_string(),
        steps,
    }
}

fn pipeline(step_count: usize) -> PipelineDefinition {
    pipeline_with("feature-pipeline", step_count)
}

fn workspace(feature: &str) -> WorkspaceId {
    WorkspaceId::parse(&format!("acme/widgets/{feature}")).expect("valid workspace id")
}

/// Completes every step with a canned response.
struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        Ok(Some(StepResponse::new(format!("{} done", context.step.id))))
    }
}

/// Completes every step without producing a response.
struct SilentExecutor;

#[async_trait]
impl StepExecutor for SilentExecutor {
    async fn execute(&self, _context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        Ok(None)
    }
}

/// Fails the first execution, succeeds afterwards.
struct FailOnceExecutor {
    failed: AtomicBool,
}

impl FailOnceExecutor {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StepExecutor for FailOnceExecutor {
    async fn execute(&self, context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("model endpoint unavailable"));
        }
        Ok(Some(StepResponse::new(format!("{} retried", context.step.id))))
    }
}

/// Parks inside the executor until released, so tests can observe the
/// in-flight window.
struct GateExecutor {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl StepExecutor for GateExecutor {
    async fn execute(&self, context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(Some(StepResponse::new(format!("{} done", context.step.id))))
    }
}

/// Parks until cancelled, then errors; the runner must prefer the
/// cancellation outcome over the error.
struct CancellableExecutor {
    entered: Arc<Notify>,
}

#[async_trait]
impl StepExecutor for CancellableExecutor {
    async fn execute(&self, mut context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        self.entered.notify_one();
        context.cancelled().await;
        Err(anyhow!("interrupted"))
    }
}

/// Records every context it sees for later assertions.
struct ContextSpyExecutor {
    seen: Mutex<Vec<StepContext>>,
}

impl ContextSpyExecutor {
    fn new() -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl StepExecutor for ContextSpyExecutor {
    async fn execute(&self, context: StepContext) -> anyhow::Result<Option<StepResponse>> {
        let response = StepResponse::new(format!("{} done", context.step.id));
        self.seen.lock().expect("spy lock").push(context);
        Ok(Some(response))
    }
}

#[test]
fn advance_at_last_index_is_idempotent() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    runner.advance_step().expect("advance");
    runner.advance_step().expect("advance to completed");

    let first = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.current_step_index, 1);
    assert!(first.finished_at.is_some());

    runner.advance_step().expect("advance once completed");
    let second = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(second.current_step_index, first.current_step_index);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.finished_at, first.finished_at);
}

#[test]
fn rewind_returns_to_the_original_index() {
    let runner = PipelineRunner::new(pipeline(4), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    for _ in 0..3 {
        runner.advance_step().expect("advance");
    }
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 3);
    assert_eq!(state.history, vec![0, 1, 2, 3]);

    for _ in 0..3 {
        runner.rewind_step().expect("rewind");
    }
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.history, vec![0]);

    // A history of length 1 cannot rewind further.
    runner.rewind_step().expect("rewind at floor");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.history, vec![0]);
}

#[test]
fn switching_workspaces_pauses_the_running_one() {
    let runner = PipelineRunner::new(pipeline(3), Arc::new(EchoExecutor));
    let a = workspace("auth");
    let b = workspace("billing");

    runner.set_active_workspace(a.clone());
    runner.start_pipeline().expect("start a");
    runner.advance_step().expect("advance a");

    runner.set_active_workspace(b.clone());
    runner.start_pipeline().expect("start b");

    let state_a = runner.run_state(&a).expect("state a");
    assert_eq!(state_a.status, RunStatus::Paused);
    assert_eq!(state_a.current_step_index, 1);
    let state_b = runner.run_state(&b).expect("state b");
    assert_eq!(state_b.status, RunStatus::Running);
    assert_eq!(state_b.current_step_index, 0);
}

#[test]
fn started_at_is_stamped_once() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    runner.start_pipeline().expect("start");
    let first = runner.run_state(&workspace("auth")).expect("state");
    runner.pause_pipeline().expect("pause");
    runner.start_pipeline().expect("restart");
    let second = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(second.started_at, first.started_at);
}

#[tokio::test]
async fn run_current_step_records_response_and_advances() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));
    runner.start_pipeline().expect("start");

    let response = runner.run_current_step(None).await.expect("run step one");
    assert_eq!(response.expect("response").content, "step-1 done");

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 1);
    assert_eq!(state.history, vec![0, 1]);
    let step_one = state.steps.get("step-1").expect("step-1 state");
    assert_eq!(step_one.status, StepStatus::Completed);
    assert!(step_one.response.is_some());
    assert!(step_one.completed_at.is_some());

    runner.run_current_step(None).await.expect("run step two");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.finished_at.is_some());
}

#[tokio::test]
async fn executor_sees_prior_responses_and_merged_inputs() {
    let spy = Arc::new(ContextSpyExecutor::new());
    let runner = PipelineRunner::new(pipeline(2), spy.clone());
    runner.set_active_workspace(workspace("auth"));

    runner
        .set_step_inputs(
            "step-1",
            HashMap::from([("branch".to_string(), json!("main"))]),
        )
        .expect("set inputs");
    runner
        .run_current_step(Some(HashMap::from([(
            "dry_run".to_string(),
            json!(true),
        )])))
        .await
        .expect("run step one");
    runner.run_current_step(None).await.expect("run step two");

    let seen = spy.seen.lock().expect("spy lock");
    assert_eq!(seen.len(), 2);

    let first = &seen[0];
    assert_eq!(first.step.id, "step-1");
    assert_eq!(first.step_state.status, StepStatus::Running);
    assert_eq!(first.step_state.inputs.get("branch"), Some(&json!("main")));
    assert_eq!(first.step_state.inputs.get("dry_run"), Some(&json!(true)));

    let second = &seen[1];
    assert_eq!(second.step.id, "step-2");
    let prior = second.responses.get("step-1").expect("prior response");
    assert_eq!(prior.content, "step-1 done");
    let prior_inputs = second.inputs.get("step-1").expect("prior inputs");
    assert_eq!(prior_inputs.len(), 2);
}

#[tokio::test]
async fn executor_failure_marks_error_and_retry_succeeds() {
    let runner = PipelineRunner::new(pipeline(1), Arc::new(FailOnceExecutor::new()));
    runner.set_active_workspace(workspace("auth"));
    runner.start_pipeline().expect("start");

    let err = runner
        .run_current_step(None)
        .await
        .expect_err("first run fails");
    assert!(matches!(err, OrchestratorError::StepFailed { .. }));

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.status, RunStatus::Error);
    assert!(state.error.is_some());
    let step = state.steps.get("step-1").expect("step state");
    assert_eq!(step.status, StepStatus::Error);
    assert!(step.error.is_some());

    // Error is not terminal: the same call can be retried.
    let response = runner.run_current_step(None).await.expect("retry");
    assert_eq!(response.expect("response").content, "step-1 retried");

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.error.is_none());
    let step = state.steps.get("step-1").expect("step state");
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.error.is_none());
}

#[test]
fn unknown_step_ids_are_ignored() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));
    let before = runner.run_state(&workspace("auth")).expect("state");

    runner
        .set_step_response("no-such-step", StepResponse::new("stray"))
        .expect("response for unknown id");
    runner
        .set_step_inputs(
            "no-such-step",
            HashMap::from([("k".to_string(), json!(1))]),
        )
        .expect("inputs for unknown id");
    runner.go_to_step("no-such-step").expect("jump to unknown id");

    let after = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(after.current_step_index, before.current_step_index);
    assert_eq!(after.history, before.history);
    assert_eq!(after.status, before.status);
    for step in after.steps.values() {
        assert_eq!(step.status, StepStatus::Idle);
        assert!(step.response.is_none());
        assert!(step.inputs.is_empty());
    }
}

#[test]
fn jumps_are_recorded_for_rewind() {
    let runner = PipelineRunner::new(pipeline(3), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    runner.go_to_step("step-3").expect("jump");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 2);
    assert_eq!(state.history, vec![0, 2]);

    runner.rewind_step().expect("rewind jump");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 0);
}

#[tokio::test]
async fn concurrent_run_fails_fast() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let executor = GateExecutor {
        entered: entered.clone(),
        release: release.clone(),
    };
    let runner = Arc::new(PipelineRunner::new(pipeline(1), Arc::new(executor)));
    runner.set_active_workspace(workspace("auth"));

    let background = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_current_step(None).await })
    };
    entered.notified().await;

    let err = runner
        .run_current_step(None)
        .await
        .expect_err("second call while in flight");
    assert!(matches!(err, OrchestratorError::StepAlreadyRunning { .. }));

    release.notify_one();
    let response = background
        .await
        .expect("join")
        .expect("first call completes");
    assert_eq!(response.expect("response").content, "step-1 done");
}

#[tokio::test]
async fn pausing_during_flight_suppresses_auto_advance() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let executor = GateExecutor {
        entered: entered.clone(),
        release: release.clone(),
    };
    let runner = Arc::new(PipelineRunner::new(pipeline(3), Arc::new(executor)));
    runner.set_active_workspace(workspace("auth"));
    runner.start_pipeline().expect("start");

    let background = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_current_step(None).await })
    };
    entered.notified().await;

    runner.pause_pipeline().expect("pause while in flight");
    release.notify_one();
    let response = background.await.expect("join").expect("run completes");
    assert_eq!(response.expect("response").content, "step-1 done");

    // The response is kept, but the paused workspace stays on its step.
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.history, vec![0]);
    let step = state.steps.get("step-1").expect("step state");
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.response.is_some());

    // Resuming picks up where the pause left off.
    runner.resume_pipeline().expect("resume");
    release.notify_one();
    runner.run_current_step(None).await.expect("run again");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 1);
}

#[tokio::test]
async fn cancelled_step_returns_to_idle() {
    let entered = Arc::new(Notify::new());
    let executor = CancellableExecutor {
        entered: entered.clone(),
    };
    let runner = Arc::new(PipelineRunner::new(pipeline(2), Arc::new(executor)));
    runner.set_active_workspace(workspace("auth"));

    let background = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run_current_step(None).await })
    };
    entered.notified().await;

    runner.cancel_current_step().expect("cancel");
    let response = background.await.expect("join").expect("cancelled run");
    assert!(response.is_none());

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 0);
    let step = state.steps.get("step-1").expect("step state");
    assert_eq!(step.status, StepStatus::Idle);
    assert!(step.error.is_none());
    assert!(step.started_at.is_none());
}

#[tokio::test]
async fn empty_pipeline_has_no_current_step() {
    let runner = PipelineRunner::new(pipeline(0), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    let err = runner.run_current_step(None).await.expect_err("no steps");
    assert!(matches!(err, OrchestratorError::NoCurrentStep { .. }));
}

#[tokio::test]
async fn silent_executor_completes_step_without_response() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(SilentExecutor));
    runner.set_active_workspace(workspace("auth"));

    let response = runner.run_current_step(None).await.expect("run");
    assert!(response.is_none());

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 1);
    let step = state.steps.get("step-1").expect("step state");
    assert_eq!(step.status, StepStatus::Completed);
    assert!(step.response.is_none());
    assert!(step.completed_at.is_some());
}

#[test]
fn status_changes_are_broadcast() {
    let runner = PipelineRunner::new(pipeline(1), Arc::new(EchoExecutor));
    let mut rx = runner.subscribe();
    let id = workspace("auth");
    runner.set_active_workspace(id.clone());

    runner.start_pipeline().expect("start");
    runner.pause_pipeline().expect("pause");
    runner.resume_pipeline().expect("resume");
    runner.advance_step().expect("complete");

    let expected = [
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Running,
        RunStatus::Completed,
    ];
    for status in expected {
        let change = rx.try_recv().expect("buffered status change");
        assert_eq!(change, StatusChange {
            workspace_id: id.clone(),
            status,
        });
    }
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn operations_require_an_active_workspace() {
    let runner = PipelineRunner::new(pipeline(1), Arc::new(EchoExecutor));

    assert!(matches!(
        runner.start_pipeline(),
        Err(OrchestratorError::NoActiveWorkspace)
    ));
    assert!(matches!(
        runner.run_current_step(None).await,
        Err(OrchestratorError::NoActiveWorkspace)
    ));
}

#[test]
fn reset_discards_all_progress() {
    let runner = PipelineRunner::new(pipeline(3), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    runner.start_pipeline().expect("start");
    runner.advance_step().expect("advance");
    runner
        .set_step_inputs(
            "step-1",
            HashMap::from([("k".to_string(), json!(1))]),
        )
        .expect("set inputs");

    runner.reset_pipeline().expect("reset");
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.status, RunStatus::Idle);
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.history, vec![0]);
    assert!(state.started_at.is_none());
    for step in state.steps.values() {
        assert_eq!(step.status, StepStatus::Idle);
        assert!(step.inputs.is_empty());
    }
}

#[test]
fn hydrate_rejects_state_from_another_pipeline() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    let stale = WorkspaceRunState::new(workspace("auth"), &pipeline_with("old-pipeline", 5));

    runner.hydrate(stale);
    assert!(runner.run_state(&workspace("auth")).is_none());
}

#[test]
fn hydrate_adopts_matching_state_and_repairs_history() {
    let runner = PipelineRunner::new(pipeline(3), Arc::new(EchoExecutor));
    let mut persisted = WorkspaceRunState::new(workspace("auth"), &pipeline(3));
    persisted.current_step_index = 2;
    persisted.status = RunStatus::Paused;

    runner.hydrate(persisted);
    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.current_step_index, 2);
    assert_eq!(state.status, RunStatus::Paused);
    assert_eq!(state.history.last(), Some(&2));
}

#[test]
fn changing_the_pipeline_reinitializes_run_state() {
    let mut runner = PipelineRunner::new(pipeline_with("v1", 2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));
    runner.advance_step().expect("advance");

    runner.set_pipeline(pipeline_with("v2", 3));
    runner.start_pipeline().expect("start under new pipeline");

    let state = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(state.pipeline_id, "v2");
    assert_eq!(state.current_step_index, 0);
    assert_eq!(state.history, vec![0]);
    assert_eq!(state.steps.len(), 3);
}

#[test]
fn run_state_returns_an_independent_copy() {
    let runner = PipelineRunner::new(pipeline(2), Arc::new(EchoExecutor));
    runner.set_active_workspace(workspace("auth"));

    let mut copy = runner.run_state(&workspace("auth")).expect("state");
    copy.current_step_index = 99;
    copy.history.push(99);

    let fresh = runner.run_state(&workspace("auth")).expect("state");
    assert_eq!(fresh.current_step_index, 0);
    assert_eq!(fresh.history, vec![0]);
}
