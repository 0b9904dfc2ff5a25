//! In-memory fixtures shared by the engine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use stepwise_types::resource::{ResourceScheme, TaskResource};
use stepwise_types::workflow::StateMachine;
use tokio_util::sync::CancellationToken;

use super::context::ExecutionContext;
use super::step_runner::{ResourceError, ResourceInvoker};

/// A `ResourceInvoker` whose `script:` names select canned behaviours:
///
/// - `echo`: `{"result": "<args joined>\n"}`
/// - `fail`: always fails
/// - `sleep`: sleeps `ms`, returns `{"slept": ms}` plus any `tag`; counts a
///   cleanup when cancelled mid-sleep
/// - `flaky`: fails until called `succeed_after` times (default 3)
/// - `identity`: returns its input
#[derive(Debug, Clone, Default)]
pub struct ScriptedInvoker {
    pub calls: Arc<AtomicU32>,
    pub cleanups: Arc<AtomicU32>,
}

impl ScriptedInvoker {
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Sleeps that observed their cancellation token.
    pub fn cleanup_count(&self) -> u32 {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl ResourceInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        resource: &TaskResource,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<Value, ResourceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        if resource.scheme != ResourceScheme::Script {
            return Err(ResourceError::NotImplemented(resource.scheme));
        }

        match resource.name.as_str() {
            "echo" => {
                let args: Vec<&str> = input["args"]
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_str).collect())
                    .unwrap_or_default();
                Ok(json!({ "result": format!("{}\n", args.join(" ")) }))
            }
            "fail" => Err(ResourceError::Failed("scripted failure".to_string())),
            "sleep" => {
                let ms = input["ms"].as_u64().unwrap_or(0);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.cleanups.fetch_add(1, Ordering::SeqCst);
                        Err(ResourceError::Cancelled)
                    }
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let mut out = json!({ "slept": ms });
                        if let Some(tag) = input.get("tag") {
                            out["tag"] = tag.clone();
                        }
                        Ok(out)
                    }
                }
            }
            "flaky" => {
                let needed = input["succeed_after"].as_u64().unwrap_or(3);
                if u64::from(call) < needed {
                    Err(ResourceError::Failed(format!("attempt {call} failed")))
                } else {
                    Ok(json!({ "attempts": call }))
                }
            }
            "identity" => Ok(input),
            other => Err(ResourceError::Failed(format!("unknown script '{other}'"))),
        }
    }
}

pub fn machine(value: Value) -> StateMachine {
    serde_json::from_value(value).unwrap()
}

pub fn context_for(machine: StateMachine) -> ExecutionContext {
    context_with_input(machine, json!({}))
}

/// A context whose `$$.Execution.Input` is `input`.
pub fn context_with_input(machine: StateMachine, input: Value) -> ExecutionContext {
    ExecutionContext::new(Arc::new(machine), input, CancellationToken::new())
}
