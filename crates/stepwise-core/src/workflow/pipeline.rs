//! The per-state data-flow pipeline.
//!
//! Every state runs the same stages around its core evaluation:
//!
//! 1. `InputPath` selects the effective input from the raw input.
//! 2. `Parameters` builds the value handed to core evaluation.
//! 3. Core evaluation (`StepRunner`), guarded by Retry/Catch.
//! 4. `ResultSelector` reshapes the raw result, then `ResultPath` places it
//!    into the raw input.
//! 5. `OutputPath` selects what flows to the next state.
//!
//! Stages 2-4 sit inside the retry/catch guard: a path failure there is a
//! state error a policy can handle. `InputPath` and `OutputPath` failures
//! are fatal to the run.

use std::sync::Arc;

use serde_json::{Value, json};
use stepwise_types::error::{StateError, names};
use stepwise_types::workflow::{DataPath, State};
use tracing::Instrument;

use super::context::ExecutionContext;
use super::executor::ExecutionError;
use super::retry::{RecoveryDecision, RetryHandler};
use super::step_runner::{Flow, ResourceInvoker, StepError, StepRunner};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Where traversal goes after a state.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The state's `Next`, or a catcher's `Next`.
    Next(String),
    /// A Choice target; checked against the graph by the traversal.
    Branch(String),
    End,
    Succeed,
    Fail { error: String, cause: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub output: Value,
    pub transition: Transition,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run one state end to end on `raw_input`.
pub async fn run_state<I: ResourceInvoker + 'static>(
    runner: &Arc<StepRunner<I>>,
    ctx: &ExecutionContext,
    state: &State,
    raw_input: Value,
) -> Result<StepOutcome, ExecutionError> {
    let span = tracing::debug_span!("state", state = state.name.as_str(), kind = state.kind_name());
    run_state_inner(runner, ctx, state, raw_input)
        .instrument(span)
        .await
}

async fn run_state_inner<I: ResourceInvoker + 'static>(
    runner: &Arc<StepRunner<I>>,
    ctx: &ExecutionContext,
    state: &State,
    raw_input: Value,
) -> Result<StepOutcome, ExecutionError> {
    let effective = filter(&state.input_path, &raw_input, || ctx.to_context_document(&state.name, 0))
        .map_err(|e| fatal(state, StateError::new(names::RUNTIME, format!("InputPath: {e}"))))?;

    let retriers = state.kind.retriers();
    let catchers = state.kind.catchers();
    let mut attempts = vec![0u32; retriers.len()];
    let mut retry_count = 0u32;

    let (composed, flow) = loop {
        match guarded(runner, ctx, state, &raw_input, effective.clone(), retry_count).await {
            Ok(done) => break done,
            Err(StepError::Engine(err)) => return Err(err),
            Err(StepError::State(err)) => {
                match RetryHandler::decide(&err, retriers, catchers, &mut attempts) {
                    RecoveryDecision::Retry { delay, attempt } => {
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            state = state.name.as_str(),
                            error = err.error.as_str(),
                            cause = err.cause.as_str(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying state"
                        );
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        retry_count += 1;
                    }
                    RecoveryDecision::Catch {
                        next,
                        result_path,
                        payload,
                    } => {
                        tracing::warn!(
                            run_id = %ctx.run_id,
                            state = state.name.as_str(),
                            error = err.error.as_str(),
                            next = next.as_str(),
                            "error caught"
                        );
                        let output = place_result(&result_path, &raw_input, payload)
                            .map_err(|e| fatal(state, e))?;
                        return Ok(StepOutcome {
                            output,
                            transition: Transition::Next(next),
                        });
                    }
                    RecoveryDecision::Fatal => {
                        tracing::error!(
                            run_id = %ctx.run_id,
                            state = state.name.as_str(),
                            error = err.error.as_str(),
                            cause = err.cause.as_str(),
                            "unhandled state error"
                        );
                        return Err(fatal(state, err));
                    }
                }
            }
        }
    };

    let transition = match flow {
        Flow::Fail { error, cause } => {
            return Ok(StepOutcome {
                output: composed,
                transition: Transition::Fail { error, cause },
            });
        }
        Flow::Succeed => Transition::Succeed,
        Flow::Branch(target) => Transition::Branch(target),
        Flow::Continue => match &state.next {
            Some(next) => Transition::Next(next.clone()),
            None => Transition::End,
        },
    };

    let output = filter(&state.output_path, &composed, || {
        ctx.to_context_document(&state.name, retry_count)
    })
    .map_err(|e| fatal(state, StateError::new(names::RUNTIME, format!("OutputPath: {e}"))))?;

    Ok(StepOutcome { output, transition })
}

/// Stages 2-4: everything Retry/Catch can recover from.
async fn guarded<I: ResourceInvoker + 'static>(
    runner: &Arc<StepRunner<I>>,
    ctx: &ExecutionContext,
    state: &State,
    raw_input: &Value,
    effective: Value,
    retry_count: u32,
) -> Result<(Value, Flow), StepError> {
    let needs_doc = state.kind.parameters().is_some() || state.kind.result_selector().is_some();
    let doc = if needs_doc {
        ctx.to_context_document(&state.name, retry_count)
    } else {
        Value::Null
    };

    let core_input = match state.kind.parameters() {
        Some(template) => template.resolve(&effective, &doc).map_err(|e| {
            StateError::new(names::PARAMETER_PATH_FAILURE, format!("Parameters: {e}"))
        })?,
        None => effective,
    };

    let core = runner.run(ctx, state, core_input).await?;
    if matches!(core.flow, Flow::Fail { .. }) {
        return Ok((core.result, core.flow));
    }

    let result = match state.kind.result_selector() {
        Some(selector) => selector.resolve(&core.result, &doc).map_err(|e| {
            StateError::new(names::PARAMETER_PATH_FAILURE, format!("ResultSelector: {e}"))
        })?,
        None => core.result,
    };

    let composed = place_result(state.kind.result_path(), raw_input, result)?;
    Ok((composed, core.flow))
}

// ---------------------------------------------------------------------------
// Path stages
// ---------------------------------------------------------------------------

/// `InputPath` / `OutputPath`: absent passes through, `null` yields `{}`.
/// `$$` paths select from the context document built by `doc`.
fn filter(
    path: &DataPath,
    value: &Value,
    doc: impl FnOnce() -> Value,
) -> Result<Value, stepwise_types::error::PathError> {
    match path {
        DataPath::Default => Ok(value.clone()),
        DataPath::Null => Ok(json!({})),
        DataPath::Path(path) if path.is_context() => path.select(&doc()),
        DataPath::Path(path) => path.select(value),
    }
}

/// `ResultPath`: absent or `$` replaces, `null` keeps the raw input, a path
/// splices the result into a copy of the raw input.
fn place_result(path: &DataPath, raw_input: &Value, result: Value) -> Result<Value, StateError> {
    match path {
        DataPath::Default => Ok(result),
        DataPath::Null => Ok(raw_input.clone()),
        DataPath::Path(path) => {
            let mut target = raw_input.clone();
            path.put(&mut target, result)
                .map_err(|e| StateError::new(names::RESULT_PATH_MATCH_FAILURE, e.to_string()))?;
            Ok(target)
        }
    }
}

fn fatal(state: &State, error: StateError) -> ExecutionError {
    ExecutionError::State {
        state: state.name.clone(),
        error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
