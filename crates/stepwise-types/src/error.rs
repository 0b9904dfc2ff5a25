use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Well-known error names raised by the interpreter itself.
///
/// Retriers and catchers match on these through `ErrorEquals`.
pub mod names {
    /// Wildcard that matches every error name.
    pub const ALL: &str = "States.ALL";
    /// A Task resource failed or returned an unusable result.
    pub const TASK_FAILED: &str = "States.TaskFailed";
    /// A Task ran longer than its `TimeoutSeconds`.
    pub const TIMEOUT: &str = "States.Timeout";
    /// Input or output filtering failed.
    pub const RUNTIME: &str = "States.Runtime";
    /// A Choice state found no matching rule and has no `Default`.
    pub const NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
    /// A `Parameters`, `ItemsPath` or `ResultSelector` path did not resolve.
    pub const PARAMETER_PATH_FAILURE: &str = "States.ParameterPathFailure";
    /// A `ResultPath` could not be applied to the state input.
    pub const RESULT_PATH_MATCH_FAILURE: &str = "States.ResultPathMatchFailure";
}

/// Errors raised while parsing or evaluating a reference path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("invalid path syntax at offset {offset} in '{path}': {reason}")]
    Syntax {
        path: String,
        offset: usize,
        reason: String,
    },

    /// The path uses `@`, a union, a slice or a filter.
    #[error("the path '{0}' is not a reference path")]
    NotReferencePath(String),

    #[error("path '{0}' did not match any value")]
    NoMatch(String),

    #[error("cannot write through path '{path}': {reason}")]
    NotWritable { path: String, reason: String },
}

/// Authoring defects found while loading a definition. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error("invalid resource '{0}': expected '<scheme>:<name>'")]
    InvalidResource(String),

    #[error("unsupported resource scheme '{0}'")]
    UnsupportedResource(String),

    #[error("invalid payload template: {0}")]
    InvalidPayload(String),

    #[error("invalid choice rule: {0}")]
    InvalidChoiceRule(String),

    #[error("invalid wait state: {0}")]
    InvalidWait(String),

    #[error("state '{from}' transitions to unknown state '{target}'")]
    UnknownState { from: String, target: String },

    #[error("StartAt '{0}' does not name a state")]
    MissingStartState(String),

    #[error("state '{0}' must declare either Next or End")]
    MissingTransition(String),

    #[error("state '{0}' declares both Next and End")]
    ConflictingTransition(String),

    #[error("state '{0}': States.ALL must appear alone in the last retrier or catcher")]
    MisplacedErrorAll(String),

    #[error("state '{state}': {reason}")]
    InvalidField { state: String, reason: String },
}

/// A recoverable-by-policy failure produced by a state's core evaluation.
///
/// Consumed by the retry/catch stage of the same step; when a catcher handles
/// it, [`StateError::to_payload`] is what lands in the data flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error}: {cause}")]
pub struct StateError {
    /// Error name matched against `ErrorEquals`.
    pub error: String,
    /// Human-readable description.
    pub cause: String,
}

impl StateError {
    pub fn new(error: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            cause: cause.into(),
        }
    }

    pub fn task_failed(cause: impl Into<String>) -> Self {
        Self::new(names::TASK_FAILED, cause)
    }

    /// The `{"Error": ..., "Cause": ...}` object injected by a catcher.
    pub fn to_payload(&self) -> Value {
        json!({
            "Error": self.error,
            "Cause": self.cause,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_error_display() {
        let err = StateError::task_failed("exit status 1");
        assert_eq!(err.to_string(), "States.TaskFailed: exit status 1");
    }

    #[test]
    fn test_state_error_payload_shape() {
        let err = StateError::new("Custom.Error", "boom");
        assert_eq!(
            err.to_payload(),
            json!({ "Error": "Custom.Error", "Cause": "boom" })
        );
    }

    #[test]
    fn test_definition_error_wraps_path_error() {
        let err: DefinitionError = PathError::NotReferencePath("$[?(@.a)]".to_string()).into();
        assert!(err.to_string().contains("not a reference path"));
    }
}
