//! Workflow definition loading and validation.
//!
//! Converts JSON definition text into the `StateMachine` model and validates
//! the graph-level constraints that deserialization alone cannot check:
//! every transition target exists, transitions are well formed, and
//! `States.ALL` is only used where it can be matched last.

use std::path::Path;

use stepwise_types::error::{DefinitionError, names};
use stepwise_types::workflow::{DataPath, StateKind, StateMachine};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a definition.
#[derive(Debug, Error)]
pub enum LoadError {
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON, or a field that failed to parse (paths, resources,
    /// choice rules, payload templates).
    #[error("parse error: {0}")]
    Parse(String),

    /// Well-formed JSON describing an invalid graph.
    #[error("invalid definition: {0}")]
    Invalid(#[from] DefinitionError),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse JSON text into a validated `StateMachine`.
///
/// Runs `validate_definition` after deserialization, so the returned value
/// is guaranteed to be structurally valid.
pub fn parse_workflow_json(json: &str) -> Result<StateMachine, LoadError> {
    let def: StateMachine =
        serde_json::from_str(json).map_err(|e| LoadError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `StateMachine` back to pretty-printed JSON.
pub fn serialize_workflow_json(def: &StateMachine) -> Result<String, LoadError> {
    serde_json::to_string_pretty(def).map_err(|e| LoadError::Parse(e.to_string()))
}

/// Read and parse a definition file.
pub fn load_workflow_file(path: &Path) -> Result<StateMachine, LoadError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_json(&content)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `StateMachine` and every branch and
/// iterator nested inside it.
///
/// Checks:
/// - `StartAt` names a state
/// - Choice, Succeed and Fail declare neither `Next` nor `End`; every other
///   state declares exactly one
/// - every `Next`, Choice rule target, `Default` and catcher `Next` exists
/// - `States.ALL` appears alone, in the last retrier or catcher
/// - `ResultPath` fields are definite `$` paths
/// - Parallel has at least one branch; Map `ItemsPath` is not null
/// - retry `BackoffRate` is at least 1.0
pub fn validate_definition(def: &StateMachine) -> Result<(), DefinitionError> {
    if def.start_state().is_none() {
        return Err(DefinitionError::MissingStartState(def.start_at.clone()));
    }

    let target_exists = |from: &str, target: &str| {
        if def.states.contains_key(target) {
            Ok(())
        } else {
            Err(DefinitionError::UnknownState {
                from: from.to_string(),
                target: target.to_string(),
            })
        }
    };

    for (name, state) in &def.states {
        let field_error = |reason: &str| DefinitionError::InvalidField {
            state: name.clone(),
            reason: reason.to_string(),
        };

        // Transitions
        if state.kind.is_terminal_or_branching() {
            if state.next.is_some() || state.end {
                return Err(field_error(&format!(
                    "{} states cannot declare Next or End",
                    state.kind_name()
                )));
            }
        } else {
            match (&state.next, state.end) {
                (Some(_), true) => {
                    return Err(DefinitionError::ConflictingTransition(name.clone()));
                }
                (None, false) => return Err(DefinitionError::MissingTransition(name.clone())),
                (Some(next), false) => target_exists(name, next)?,
                (None, true) => {}
            }
        }

        // Result placement
        check_result_path(state.kind.result_path()).map_err(|r| field_error(&r))?;

        // Retry / catch
        let retriers = state.kind.retriers();
        check_error_all(
            name,
            retriers.iter().map(|r| r.error_equals.as_slice()),
        )?;
        for retrier in retriers {
            if retrier.error_equals.is_empty() {
                return Err(field_error("Retry entries need a non-empty ErrorEquals"));
            }
            if retrier.backoff_rate < 1.0 {
                return Err(field_error("Retry BackoffRate must be at least 1.0"));
            }
        }

        let catchers = state.kind.catchers();
        check_error_all(name, catchers.iter().map(|c| c.error_equals.as_slice()))?;
        for catcher in catchers {
            if catcher.error_equals.is_empty() {
                return Err(field_error("Catch entries need a non-empty ErrorEquals"));
            }
            target_exists(name, &catcher.next)?;
            check_result_path(&catcher.result_path).map_err(|r| field_error(&r))?;
        }

        // Kind-specific
        match &state.kind {
            StateKind::Choice(choice) => {
                if choice.choices.is_empty() {
                    return Err(field_error("Choice states need at least one rule"));
                }
                for rule in &choice.choices {
                    target_exists(name, &rule.next)?;
                }
                if let Some(default) = &choice.default {
                    target_exists(name, default)?;
                }
            }
            StateKind::Parallel(parallel) => {
                if parallel.branches.is_empty() {
                    return Err(field_error("Parallel states need at least one branch"));
                }
                for branch in &parallel.branches {
                    validate_definition(branch)?;
                }
            }
            StateKind::Map(map) => {
                if map.items_path == DataPath::Null {
                    return Err(field_error("ItemsPath cannot be null"));
                }
                validate_definition(&map.iterator)?;
            }
            StateKind::Pass(_)
            | StateKind::Task(_)
            | StateKind::Wait(_)
            | StateKind::Succeed
            | StateKind::Fail(_) => {}
        }
    }

    Ok(())
}

fn check_result_path(path: &DataPath) -> Result<(), String> {
    match path {
        DataPath::Path(path) if path.is_context() => {
            Err(format!("ResultPath '{path}' cannot target the context object"))
        }
        DataPath::Path(path) if !path.is_definite() => {
            Err(format!("ResultPath '{path}' must address a single node"))
        }
        _ => Ok(()),
    }
}

fn check_error_all<'a>(
    state: &str,
    lists: impl ExactSizeIterator<Item = &'a [String]>,
) -> Result<(), DefinitionError> {
    let count = lists.len();
    for (i, list) in lists.enumerate() {
        if list.iter().any(|e| e == names::ALL) && (list.len() != 1 || i + 1 != count) {
            return Err(DefinitionError::MisplacedErrorAll(state.to_string()));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn parse(value: Value) -> Result<StateMachine, LoadError> {
        parse_workflow_json(&value.to_string())
    }

    fn invalid(value: Value) -> DefinitionError {
        match parse(value) {
            Err(LoadError::Invalid(err)) => err,
            other => panic!("expected a validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_valid_definition() {
        let def = parse(json!({
            "StartAt": "Check",
            "States": {
                "Check": {
                    "Type": "Choice",
                    "Choices": [{ "Variable": "$.n", "NumericGreaterThan": 3, "Next": "Big" }],
                    "Default": "Small"
                },
                "Big": { "Type": "Pass", "Result": "big", "ResultPath": "$.y", "End": true },
                "Small": { "Type": "Pass", "Result": "small", "ResultPath": "$.y", "End": true }
            }
        }))
        .unwrap();
        assert_eq!(def.states.len(), 3);
    }

    #[test]
    fn test_rejects_missing_start_state() {
        let err = invalid(json!({
            "StartAt": "Nope",
            "States": { "A": { "Type": "Succeed" } }
        }));
        assert_eq!(err, DefinitionError::MissingStartState("Nope".to_string()));
    }

    #[test]
    fn test_rejects_unknown_next() {
        let err = invalid(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "Next": "Ghost" } }
        }));
        assert!(matches!(err, DefinitionError::UnknownState { ref target, .. } if target == "Ghost"));
    }

    #[test]
    fn test_rejects_unknown_choice_target() {
        let err = invalid(json!({
            "StartAt": "C",
            "States": {
                "C": {
                    "Type": "Choice",
                    "Choices": [{ "Variable": "$.a", "IsPresent": true, "Next": "Missing" }]
                }
            }
        }));
        assert!(matches!(err, DefinitionError::UnknownState { .. }));
    }

    #[test]
    fn test_rejects_bad_transitions() {
        let err = invalid(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass" } }
        }));
        assert_eq!(err, DefinitionError::MissingTransition("A".to_string()));

        let err = invalid(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Pass", "Next": "A", "End": true } }
        }));
        assert_eq!(err, DefinitionError::ConflictingTransition("A".to_string()));

        let err = invalid(json!({
            "StartAt": "A",
            "States": { "A": { "Type": "Succeed", "End": true } }
        }));
        assert!(matches!(err, DefinitionError::InvalidField { .. }));
    }

    #[test]
    fn test_rejects_misplaced_error_all() {
        let err = invalid(json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "script:true",
                    "Retry": [
                        { "ErrorEquals": ["States.ALL"] },
                        { "ErrorEquals": ["States.Timeout"] }
                    ],
                    "End": true
                }
            }
        }));
        assert_eq!(err, DefinitionError::MisplacedErrorAll("T".to_string()));

        let err = invalid(json!({
            "StartAt": "T",
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "script:true",
                    "Catch": [{ "ErrorEquals": ["States.ALL", "Other"], "Next": "T" }],
                    "End": true
                }
            }
        }));
        assert_eq!(err, DefinitionError::MisplacedErrorAll("T".to_string()));
    }

    #[test]
    fn test_rejects_indefinite_result_path() {
        let err = invalid(json!({
            "StartAt": "P",
            "States": { "P": { "Type": "Pass", "ResultPath": "$..x", "End": true } }
        }));
        assert!(matches!(err, DefinitionError::InvalidField { .. }));
    }

    #[test]
    fn test_validates_nested_branches() {
        let err = invalid(json!({
            "StartAt": "Par",
            "States": {
                "Par": {
                    "Type": "Parallel",
                    "Branches": [{
                        "StartAt": "Inner",
                        "States": { "Inner": { "Type": "Pass", "Next": "Outside" } }
                    }],
                    "End": true
                }
            }
        }));
        assert!(matches!(err, DefinitionError::UnknownState { ref target, .. } if target == "Outside"));
    }

    #[test]
    fn test_parse_errors_surface_field_failures() {
        let err = parse(json!({
            "StartAt": "T",
            "States": { "T": { "Type": "Task", "Resource": "script", "End": true } }
        }))
        .unwrap_err();
        assert!(matches!(err, LoadError::Parse(ref msg) if msg.contains("invalid resource")));

        let err = parse_workflow_json("{ not json").unwrap_err();
        assert!(matches!(err, LoadError::Parse(_)));
    }

    #[test]
    fn test_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.asl.json");
        std::fs::write(
            &path,
            r#"{ "StartAt": "Hi", "States": { "Hi": { "Type": "Pass", "Result": {"a": 1}, "End": true } } }"#,
        )
        .unwrap();

        let def = load_workflow_file(&path).unwrap();
        assert_eq!(def.start_at, "Hi");

        let err = load_workflow_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, LoadError::Io(_)));
    }

    #[test]
    fn test_serialize_reparses() {
        let def = parse(json!({
            "StartAt": "W",
            "States": { "W": { "Type": "Wait", "Seconds": 1, "Next": "S" }, "S": { "Type": "Succeed" } }
        }))
        .unwrap();
        let text = serialize_workflow_json(&def).unwrap();
        let again = parse_workflow_json(&text).unwrap();
        assert_eq!(again.states.len(), 2);
    }
}
