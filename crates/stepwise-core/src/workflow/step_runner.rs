//! Core evaluation for all 8 state kinds.
//!
//! `StepRunner` dispatches on `StateKind` and produces the raw result and
//! flow decision for a state. It knows nothing about the data-flow filters
//! around it (see `pipeline`) or about retry/catch. Task states reach the
//! outside world only through the `ResourceInvoker` seam; Parallel and Map
//! re-enter the traversal for each branch or element on Tokio tasks.
//!
//! State kinds: Pass, Task, Choice, Wait, Succeed, Fail, Parallel, Map.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use stepwise_types::config::EngineConfig;
use stepwise_types::error::{StateError, names};
use stepwise_types::resource::{ResourceScheme, TaskResource};
use stepwise_types::workflow::{
    ChoiceState, DataPath, MapState, ParallelState, State, StateKind, TaskState, WaitState,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::choice;
use super::context::ExecutionContext;
use super::executor::{ExecutionError, traverse};

// ---------------------------------------------------------------------------
// ResourceInvoker trait
// ---------------------------------------------------------------------------

/// Errors a resource invocation can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// The scheme exists in the language but has no implementation here.
    #[error("resource scheme '{0}' is not implemented")]
    NotImplemented(ResourceScheme),

    /// The task input does not have the shape the resource needs.
    #[error("invalid task input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Failed(String),

    /// The invocation stopped because its token was cancelled.
    #[error("invocation cancelled")]
    Cancelled,
}

/// Executes Task resources.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach. Implementations
/// must stop work promptly once `cancel` fires.
pub trait ResourceInvoker: Send + Sync {
    fn invoke(
        &self,
        resource: &TaskResource,
        input: Value,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, ResourceError>> + Send;
}

// ---------------------------------------------------------------------------
// Core output
// ---------------------------------------------------------------------------

/// How traversal continues after a state's core evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Flow {
    /// Follow the state's own `Next`/`End`.
    Continue,
    /// A Choice picked this target.
    Branch(String),
    Succeed,
    Fail { error: String, cause: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoreOutput {
    pub result: Value,
    pub flow: Flow,
}

impl CoreOutput {
    fn value(result: Value) -> Self {
        Self {
            result,
            flow: Flow::Continue,
        }
    }
}

/// A core-evaluation failure: either eligible for retry/catch, or fatal to
/// the whole run.
#[derive(Debug, Clone)]
pub enum StepError {
    State(StateError),
    Engine(ExecutionError),
}

impl From<StateError> for StepError {
    fn from(err: StateError) -> Self {
        StepError::State(err)
    }
}

impl From<ExecutionError> for StepError {
    fn from(err: ExecutionError) -> Self {
        StepError::Engine(err)
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes a single state's core logic. Shared behind `Arc` by every task
/// of a run.
pub struct StepRunner<I> {
    invoker: I,
    config: EngineConfig,
}

impl<I: ResourceInvoker + 'static> StepRunner<I> {
    pub fn new(invoker: I, config: EngineConfig) -> Self {
        Self { invoker, config }
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    /// Evaluate `state` against its effective input (after `InputPath` and
    /// `Parameters`).
    pub async fn run(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        state: &State,
        input: Value,
    ) -> Result<CoreOutput, StepError> {
        match &state.kind {
            StateKind::Pass(pass) => Ok(CoreOutput::value(pass.result.clone().unwrap_or(input))),
            StateKind::Task(task) => self.run_task(ctx, task, input).await.map(CoreOutput::value),
            StateKind::Choice(choice) => Self::run_choice(ctx, state, choice, input),
            StateKind::Wait(wait) => Self::run_wait(ctx, state, wait, input)
                .await
                .map(CoreOutput::value),
            StateKind::Succeed => Ok(CoreOutput {
                result: input,
                flow: Flow::Succeed,
            }),
            StateKind::Fail(fail) => Ok(CoreOutput {
                result: input,
                flow: Flow::Fail {
                    error: fail.error.clone().unwrap_or_default(),
                    cause: fail.cause.clone().unwrap_or_default(),
                },
            }),
            StateKind::Parallel(parallel) => self
                .run_parallel(ctx, parallel, input)
                .await
                .map(CoreOutput::value),
            StateKind::Map(map) => self
                .run_map(ctx, state, map, input)
                .await
                .map(CoreOutput::value),
        }
    }

    // -----------------------------------------------------------------------
    // Task
    // -----------------------------------------------------------------------

    async fn run_task(
        &self,
        ctx: &ExecutionContext,
        task: &TaskState,
        input: Value,
    ) -> Result<Value, StepError> {
        // The invoker watches the token itself and reports `Cancelled` once it
        // has released the resource.
        let token = ctx.cancel.child_token();
        let call = self.invoker.invoke(&task.resource, input, token.clone());
        tokio::pin!(call);

        let result = match task.timeout_seconds {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    token.cancel();
                    let _ = call.await;
                    return Err(StateError::new(
                        names::TIMEOUT,
                        format!("task '{}' exceeded {secs}s", task.resource),
                    )
                    .into());
                }
            },
            None => call.await,
        };

        result.map_err(|err| match err {
            ResourceError::NotImplemented(scheme) => ExecutionError::NotImplemented(scheme).into(),
            ResourceError::Cancelled => ExecutionError::Cancelled.into(),
            other => StateError::task_failed(other.to_string()).into(),
        })
    }

    // -----------------------------------------------------------------------
    // Choice
    // -----------------------------------------------------------------------

    fn run_choice(
        ctx: &ExecutionContext,
        state: &State,
        choice: &ChoiceState,
        input: Value,
    ) -> Result<CoreOutput, StepError> {
        let doc = ctx.to_context_document(&state.name, 0);
        match choice::select_next(choice, &input, &doc) {
            Some(next) => Ok(CoreOutput {
                flow: Flow::Branch(next.to_string()),
                result: input,
            }),
            None => Err(StateError::new(
                names::NO_CHOICE_MATCHED,
                format!("no choice rule matched in '{}' and no Default is set", state.name),
            )
            .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Wait
    // -----------------------------------------------------------------------

    async fn run_wait(
        ctx: &ExecutionContext,
        state: &State,
        wait: &WaitState,
        input: Value,
    ) -> Result<Value, StepError> {
        let doc = ctx.to_context_document(&state.name, 0);
        let duration = wait_duration(wait, &input, &doc, Utc::now())?;

        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ExecutionError::Cancelled.into()),
            _ = tokio::time::sleep(duration) => Ok(input),
        }
    }

    // -----------------------------------------------------------------------
    // Parallel
    // -----------------------------------------------------------------------

    async fn run_parallel(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        parallel: &ParallelState,
        input: Value,
    ) -> Result<Value, StepError> {
        let token = ctx.cancel.child_token();
        let mut set = JoinSet::new();

        for (index, branch) in parallel.branches.iter().enumerate() {
            let runner = Arc::clone(self);
            let branch_ctx = ctx.child(token.clone());
            let branch = Arc::clone(branch);
            let input = input.clone();

            set.spawn(
                async move { (index, traverse(runner, branch_ctx, branch, input).await) }
                    .instrument(tracing::Span::current()),
            );
        }

        collect_ordered(set, parallel.branches.len(), &token)
            .await
            .map(Value::Array)
    }

    // -----------------------------------------------------------------------
    // Map
    // -----------------------------------------------------------------------

    async fn run_map(
        self: &Arc<Self>,
        ctx: &ExecutionContext,
        state: &State,
        map: &MapState,
        input: Value,
    ) -> Result<Value, StepError> {
        let selected = match &map.items_path {
            DataPath::Path(path) => {
                let doc = ctx.to_context_document(&state.name, 0);
                path.select_in(&input, &doc).map_err(|e| {
                    StateError::new(names::PARAMETER_PATH_FAILURE, format!("ItemsPath: {e}"))
                })?
            }
            DataPath::Default | DataPath::Null => input.clone(),
        };
        let Value::Array(items) = selected else {
            return Err(StateError::new(
                names::RUNTIME,
                format!("ItemsPath of '{}' must select an array", state.name),
            )
            .into());
        };

        let limit = match map.max_concurrency {
            0 => self.config.max_map_concurrency,
            n => n,
        };
        let semaphore = (limit > 0).then(|| Arc::new(Semaphore::new(limit as usize)));

        let token = ctx.cancel.child_token();
        let mut set = JoinSet::new();
        let len = items.len();

        tracing::debug!(
            state = state.name.as_str(),
            items = len,
            max_concurrency = limit,
            "starting map iterations"
        );

        for (index, item) in items.into_iter().enumerate() {
            let item_ctx = ctx.for_item(token.clone(), index, item.clone());
            let item_input = match &map.parameters {
                Some(selector) => {
                    let doc = item_ctx.to_context_document(&state.name, 0);
                    match selector.resolve(&input, &doc) {
                        Ok(value) => value,
                        Err(e) => {
                            drain(&mut set, &token).await;
                            return Err(StateError::new(
                                names::PARAMETER_PATH_FAILURE,
                                format!("ItemSelector: {e}"),
                            )
                            .into());
                        }
                    }
                }
                None => item,
            };

            let runner = Arc::clone(self);
            let iterator = Arc::clone(&map.iterator);
            let semaphore = semaphore.clone();

            set.spawn(
                async move {
                    let _permit = match semaphore {
                        Some(sem) => match sem.acquire_owned().await {
                            Ok(permit) => Some(permit),
                            Err(_) => return (index, Err(ExecutionError::Cancelled)),
                        },
                        None => None,
                    };
                    if item_ctx.cancel.is_cancelled() {
                        return (index, Err(ExecutionError::Cancelled));
                    }
                    (index, traverse(runner, item_ctx, iterator, item_input).await)
                }
                .instrument(tracing::Span::current()),
            );
        }

        collect_ordered(set, len, &token).await.map(Value::Array)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type BranchResult = (usize, Result<Value, ExecutionError>);

/// Wait for every task, placing each output at its index.
///
/// The first failure cancels `token`, waits for the remaining tasks to stop
/// and becomes the result. Cancellation of `token` from outside wins over
/// everything.
async fn collect_ordered(
    mut set: JoinSet<BranchResult>,
    len: usize,
    token: &CancellationToken,
) -> Result<Vec<Value>, StepError> {
    let mut slots: Vec<Option<Value>> = vec![None; len];

    loop {
        let joined = tokio::select! {
            biased;
            _ = token.cancelled() => {
                drain(&mut set, token).await;
                return Err(ExecutionError::Cancelled.into());
            }
            joined = set.join_next() => joined,
        };

        let failure = match joined {
            None => break,
            Some(Ok((index, Ok(value)))) => {
                if let Some(slot) = slots.get_mut(index) {
                    *slot = Some(value);
                }
                continue;
            }
            Some(Ok((_, Err(err)))) => branch_failure(err),
            Some(Err(join_err)) => ExecutionError::Join(join_err.to_string()).into(),
        };

        drain(&mut set, token).await;
        return Err(failure);
    }

    // Every task either filled its slot or returned early above.
    Ok(slots.into_iter().flatten().collect())
}

/// Cancel `token` and join every task still running.
///
/// Tasks are not aborted: each one sees the cancelled token, so a Task state
/// in flight gets to stop its resource before the branch returns.
async fn drain(set: &mut JoinSet<BranchResult>, token: &CancellationToken) {
    token.cancel();
    while set.join_next().await.is_some() {}
}

/// Map a nested traversal failure to the enclosing state's error.
///
/// `Fail` states and unhandled state errors keep their error name so that
/// the enclosing Retry/Catch can match them. Everything else stays fatal.
fn branch_failure(err: ExecutionError) -> StepError {
    match err {
        ExecutionError::Failed { error, cause, .. } => StateError::new(error, cause).into(),
        ExecutionError::State { error, .. } => error.into(),
        other => other.into(),
    }
}

/// Resolve how long a Wait state suspends, measured from `now`.
fn wait_duration(
    wait: &WaitState,
    input: &Value,
    context: &Value,
    now: DateTime<Utc>,
) -> Result<Duration, StateError> {
    let until = |at: DateTime<Utc>| (at - now).to_std().unwrap_or(Duration::ZERO);

    match wait {
        WaitState::Seconds(secs) => Ok(Duration::from_secs(*secs)),
        WaitState::SecondsPath(path) => {
            let value = path
                .select_in(input, context)
                .map_err(|e| StateError::new(names::RUNTIME, format!("SecondsPath: {e}")))?;
            value.as_u64().map(Duration::from_secs).ok_or_else(|| {
                StateError::new(
                    names::RUNTIME,
                    format!("SecondsPath '{path}' must select a non-negative integer, got {value}"),
                )
            })
        }
        WaitState::Timestamp(at) => Ok(until(*at)),
        WaitState::TimestampPath(path) => {
            let value = path
                .select_in(input, context)
                .map_err(|e| StateError::new(names::RUNTIME, format!("TimestampPath: {e}")))?;
            value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|at| until(at.with_timezone(&Utc)))
                .ok_or_else(|| {
                    StateError::new(
                        names::RUNTIME,
                        format!("TimestampPath '{path}' must select an RFC 3339 timestamp, got {value}"),
                    )
                })
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
