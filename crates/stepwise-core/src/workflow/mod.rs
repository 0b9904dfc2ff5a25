//! Workflow engine core: definition loading, the state pipeline, and traversal.
//!
//! - `definition` -- JSON parsing, validation, filesystem load
//! - `context` -- Per-run execution context and the `$$` context document
//! - `choice` -- Choice rule evaluation
//! - `retry` -- Retry/Catch policy decisions and backoff
//! - `step_runner` -- Core evaluation for each state kind, Parallel/Map fan-out
//! - `pipeline` -- InputPath/Parameters/ResultSelector/ResultPath/OutputPath
//! - `executor` -- Traversal, run registry, timeout and cancellation

pub mod choice;
pub mod context;
pub mod definition;
pub mod executor;
pub mod pipeline;
pub mod retry;
pub mod step_runner;

#[cfg(test)]
pub(crate) mod test_support;
