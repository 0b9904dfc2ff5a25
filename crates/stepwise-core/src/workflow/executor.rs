//! Workflow executor: drives a definition from `StartAt` to termination.
//!
//! `Executor` owns the resource invoker and engine configuration, assigns
//! each run a UUIDv7 and a tracing span, applies the run timeout, and keeps a
//! registry of live runs so that any run can be cancelled by id.
//!
//! # Execution flow
//!
//! 1. Decode the input bytes (blank input is `{}`).
//! 2. Register a run token (a child of the caller's token).
//! 3. Traverse: run the current state's pipeline, follow its transition.
//! 4. Parallel branches and Map iterations re-enter the traversal on their
//!    own Tokio tasks with a child token.
//! 5. Encode the terminal state's output, or report the failure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::StateError;
use stepwise_types::resource::ResourceScheme;
use stepwise_types::workflow::StateMachine;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::pipeline::{self, Transition};
use super::step_runner::{ResourceInvoker, StepRunner};

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs workflow definitions. Cheap to share: clones refer to the same
/// invoker and run registry.
pub struct Executor<I> {
    runner: Arc<StepRunner<I>>,
    /// Cancellation tokens keyed by run_id.
    runs: Arc<DashMap<Uuid, CancellationToken>>,
}

impl<I> Clone for Executor<I> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            runs: Arc::clone(&self.runs),
        }
    }
}

impl<I: ResourceInvoker + 'static> Executor<I> {
    pub fn new(invoker: I, config: EngineConfig) -> Self {
        Self {
            runner: Arc::new(StepRunner::new(invoker, config)),
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Run `workflow` on `input` and return the encoded output.
    ///
    /// Resolves when the run finishes, fails, is cancelled through `cancel`
    /// (or [`Executor::cancel`]) or exceeds its timeout.
    pub async fn execute(
        &self,
        cancel: CancellationToken,
        workflow: Arc<StateMachine>,
        input: &[u8],
    ) -> Result<Vec<u8>, ExecutionError> {
        let input = decode_input(input)?;
        let output = self.run(cancel, workflow, input).await?;
        serde_json::to_vec(&output).map_err(|e| ExecutionError::Encode(e.to_string()))
    }

    /// Like [`Executor::execute`], on already-decoded JSON.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        workflow: Arc<StateMachine>,
        input: Value,
    ) -> Result<Value, ExecutionError> {
        let timeout_secs = workflow
            .timeout_seconds
            .unwrap_or(self.runner.config().default_timeout_secs);
        let timeout = Duration::from_secs(timeout_secs);

        let token = cancel.child_token();
        let ctx = ExecutionContext::new(Arc::clone(&workflow), input.clone(), token.clone());
        let run_id = ctx.run_id;
        let span = ctx.span.clone();
        self.runs.insert(run_id, token.clone());
        let _guard = RunGuard {
            runs: Arc::clone(&self.runs),
            run_id,
            token: token.clone(),
        };

        let runner = Arc::clone(&self.runner);
        async {
            tracing::info!(
                run_id = %run_id,
                start_at = workflow.start_at.as_str(),
                timeout_secs,
                "starting execution"
            );

            // Cancellation reaches the traversal through its token; it returns
            // once every branch and task has stopped.
            let mut traversal = traverse(runner, ctx, Arc::clone(&workflow), input);
            let result = match tokio::time::timeout(timeout, &mut traversal).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    let _ = traversal.await;
                    Err(ExecutionError::Timeout)
                }
            };

            match &result {
                Ok(_) => tracing::info!(run_id = %run_id, "execution succeeded"),
                Err(e) if e.is_cancellation() => {
                    tracing::warn!(run_id = %run_id, error = %e, "execution stopped")
                }
                Err(e) => tracing::error!(run_id = %run_id, error = %e, "execution failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Cancel a live run.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), ExecutionError> {
        match self.runs.remove(&run_id) {
            Some((_, token)) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "execution cancelled");
                Ok(())
            }
            None => Err(ExecutionError::RunNotFound(run_id)),
        }
    }

    /// Ids of runs that have not finished yet.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }
}

/// Deregisters a run and cancels its token when the run ends, including
/// when the caller drops the `run` future early.
struct RunGuard {
    runs: Arc<DashMap<Uuid, CancellationToken>>,
    run_id: Uuid,
    token: CancellationToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.token.cancel();
        self.runs.remove(&self.run_id);
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Walk `machine` from its `StartAt` until a terminal transition.
///
/// Boxed so that Parallel and Map can spawn it recursively.
pub(crate) fn traverse<I: ResourceInvoker + 'static>(
    runner: Arc<StepRunner<I>>,
    ctx: ExecutionContext,
    machine: Arc<StateMachine>,
    input: Value,
) -> BoxFuture<'static, Result<Value, ExecutionError>> {
    Box::pin(async move {
        let mut current = machine.start_at.clone();
        let mut value = input;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }

            let state = machine
                .state(&current)
                .ok_or_else(|| ExecutionError::UnknownState(current.clone()))?;
            let outcome = pipeline::run_state(&runner, &ctx, state, value).await?;

            let next = match &outcome.transition {
                Transition::Next(next) | Transition::Branch(next) => next.as_str(),
                Transition::End => "(end)",
                Transition::Succeed => "(succeed)",
                Transition::Fail { .. } => "(fail)",
            };
            tracing::debug!(
                run_id = %ctx.run_id,
                state = current.as_str(),
                kind = state.kind_name(),
                next,
                "state complete"
            );

            match outcome.transition {
                Transition::Next(next) => current = next,
                Transition::Branch(key) => {
                    if !machine.states.contains_key(&key) {
                        return Err(ExecutionError::InvalidBranch {
                            state: current,
                            key,
                        });
                    }
                    current = key;
                }
                Transition::End | Transition::Succeed => return Ok(outcome.output),
                Transition::Fail { error, cause } => {
                    return Err(ExecutionError::Failed {
                        state: current,
                        error,
                        cause,
                    });
                }
            }
            value = outcome.output;
        }
    })
}

fn decode_input(input: &[u8]) -> Result<Value, ExecutionError> {
    if input.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_slice(input).map_err(|e| ExecutionError::Decode(e.to_string()))
}

// ---------------------------------------------------------------------------
// ExecutionError
// ---------------------------------------------------------------------------

/// Errors that end a run.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    /// A transition named a state that is not in the graph.
    #[error("unknown state '{0}'")]
    UnknownState(String),

    /// A Choice selected a target that is not in the graph.
    #[error("choice state '{state}' selected unknown branch '{key}'")]
    InvalidBranch { state: String, key: String },

    /// A state error no retrier or catcher handled.
    #[error("state '{state}' failed: {error}")]
    State { state: String, error: StateError },

    /// The run reached a Fail state.
    #[error("execution failed at '{state}': {error}: {cause}")]
    Failed {
        state: String,
        error: String,
        cause: String,
    },

    #[error("resource scheme '{0}' is not implemented")]
    NotImplemented(ResourceScheme),

    #[error("invalid input: {0}")]
    Decode(String),

    #[error("cannot encode output: {0}")]
    Encode(String),

    /// A branch or iteration task panicked.
    #[error("branch task failed: {0}")]
    Join(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution timed out")]
    Timeout,

    /// Run not found (for cancel).
    #[error("execution not found: {0}")]
    RunNotFound(Uuid),
}

impl ExecutionError {
    /// True for runs stopped from outside rather than failed.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ExecutionError::Cancelled | ExecutionError::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
