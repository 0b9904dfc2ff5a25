//! Workflow definition model.
//!
//! A [`StateMachine`] is the compiled form of a JSON definition: an entry
//! state, an optional timeout and a name-addressed graph of [`State`]s. Every
//! path, payload template, resource identifier and choice rule inside it is
//! parsed while deserializing, so executing a definition never re-parses
//! strings. Definitions are immutable after loading and are shared behind
//! `Arc` by concurrent runs and nested branches.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::choice::ChoiceRule;
use crate::error::DefinitionError;
use crate::path::ReferencePath;
use crate::payload::PayloadTemplate;
use crate::resource::TaskResource;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// A workflow definition, or one branch/iterator nested inside one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawStateMachine", rename_all = "PascalCase")]
pub struct StateMachine {
    pub start_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub states: HashMap<String, State>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawStateMachine {
    start_at: String,
    #[serde(default)]
    timeout_seconds: Option<u64>,
    #[serde(default)]
    comment: Option<String>,
    states: HashMap<String, State>,
}

impl From<RawStateMachine> for StateMachine {
    fn from(raw: RawStateMachine) -> Self {
        let states = raw
            .states
            .into_iter()
            .map(|(name, mut state)| {
                state.name.clone_from(&name);
                (name, state)
            })
            .collect();
        Self {
            start_at: raw.start_at,
            timeout_seconds: raw.timeout_seconds,
            comment: raw.comment,
            states,
        }
    }
}

impl StateMachine {
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }

    pub fn start_state(&self) -> Option<&State> {
        self.state(&self.start_at)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// One node of the graph: the fields shared by every kind plus the
/// kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    /// Filled from the key in the enclosing `States` map.
    #[serde(skip)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub input_path: DataPath,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub output_path: DataPath,
    #[serde(flatten)]
    pub kind: StateKind,
}

impl State {
    /// The `Type` tag, for logs and error messages.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// The eight state kinds, tagged by `Type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum StateKind {
    Pass(PassState),
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Succeed,
    Fail(FailState),
    Parallel(ParallelState),
    Map(MapState),
}

impl StateKind {
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Pass(_) => "Pass",
            StateKind::Task(_) => "Task",
            StateKind::Choice(_) => "Choice",
            StateKind::Wait(_) => "Wait",
            StateKind::Succeed => "Succeed",
            StateKind::Fail(_) => "Fail",
            StateKind::Parallel(_) => "Parallel",
            StateKind::Map(_) => "Map",
        }
    }

    /// Choice, Succeed and Fail decide their own transition; every other kind
    /// needs exactly one of `Next`/`End`.
    pub fn is_terminal_or_branching(&self) -> bool {
        matches!(
            self,
            StateKind::Choice(_) | StateKind::Succeed | StateKind::Fail(_)
        )
    }

    pub fn parameters(&self) -> Option<&PayloadTemplate> {
        match self {
            StateKind::Pass(s) => s.parameters.as_ref(),
            StateKind::Task(s) => s.parameters.as_ref(),
            StateKind::Parallel(s) => s.parameters.as_ref(),
            // Map applies its selector per item, not to the state input.
            _ => None,
        }
    }

    pub fn result_selector(&self) -> Option<&PayloadTemplate> {
        match self {
            StateKind::Task(s) => s.result_selector.as_ref(),
            StateKind::Parallel(s) => s.result_selector.as_ref(),
            StateKind::Map(s) => s.result_selector.as_ref(),
            _ => None,
        }
    }

    pub fn result_path(&self) -> &DataPath {
        const DEFAULT: &DataPath = &DataPath::Default;
        match self {
            StateKind::Pass(s) => &s.result_path,
            StateKind::Task(s) => &s.result_path,
            StateKind::Parallel(s) => &s.result_path,
            StateKind::Map(s) => &s.result_path,
            _ => DEFAULT,
        }
    }

    pub fn retriers(&self) -> &[Retrier] {
        match self {
            StateKind::Task(s) => &s.retry,
            StateKind::Parallel(s) => &s.retry,
            StateKind::Map(s) => &s.retry,
            _ => &[],
        }
    }

    pub fn catchers(&self) -> &[Catcher] {
        match self {
            StateKind::Task(s) => &s.catch,
            StateKind::Parallel(s) => &s.catch,
            StateKind::Map(s) => &s.catch,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// Kind payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PassState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub result_path: DataPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PayloadTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskState {
    pub resource: TaskResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PayloadTemplate>,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub result_path: DataPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<PayloadTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChoiceState {
    /// Evaluated in order; the first match wins.
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// How long a Wait state suspends. Exactly one form is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawWait", into = "RawWait")]
pub enum WaitState {
    Seconds(u64),
    SecondsPath(ReferencePath),
    Timestamp(DateTime<Utc>),
    TimestampPath(ReferencePath),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawWait {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seconds_path: Option<ReferencePath>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp_path: Option<ReferencePath>,
}

impl TryFrom<RawWait> for WaitState {
    type Error = DefinitionError;

    fn try_from(raw: RawWait) -> Result<Self, Self::Error> {
        let mut forms = Vec::with_capacity(1);
        if let Some(seconds) = raw.seconds {
            forms.push(WaitState::Seconds(seconds));
        }
        if let Some(path) = raw.seconds_path {
            forms.push(WaitState::SecondsPath(path));
        }
        if let Some(at) = raw.timestamp {
            forms.push(WaitState::Timestamp(at));
        }
        if let Some(path) = raw.timestamp_path {
            forms.push(WaitState::TimestampPath(path));
        }

        match forms.len() {
            1 => Ok(forms.remove(0)),
            0 => Err(DefinitionError::InvalidWait(
                "one of Seconds, SecondsPath, Timestamp or TimestampPath is required".into(),
            )),
            _ => Err(DefinitionError::InvalidWait(
                "only one of Seconds, SecondsPath, Timestamp or TimestampPath may be set".into(),
            )),
        }
    }
}

impl From<WaitState> for RawWait {
    fn from(wait: WaitState) -> Self {
        match wait {
            WaitState::Seconds(s) => RawWait {
                seconds: Some(s),
                ..Default::default()
            },
            WaitState::SecondsPath(p) => RawWait {
                seconds_path: Some(p),
                ..Default::default()
            },
            WaitState::Timestamp(t) => RawWait {
                timestamp: Some(t),
                ..Default::default()
            },
            WaitState::TimestampPath(p) => RawWait {
                timestamp_path: Some(p),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParallelState {
    /// Outputs are collected in this order.
    pub branches: Vec<Arc<StateMachine>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PayloadTemplate>,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub result_path: DataPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<PayloadTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MapState {
    #[serde(alias = "ItemProcessor")]
    pub iterator: Arc<StateMachine>,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub items_path: DataPath,
    /// Per-item selector; sees `$$.Map.Item.Index` and `$$.Map.Item.Value`.
    #[serde(default, alias = "ItemSelector", skip_serializing_if = "Option::is_none")]
    pub parameters: Option<PayloadTemplate>,
    /// 0 means unbounded.
    #[serde(default)]
    pub max_concurrency: u32,
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub result_path: DataPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_selector: Option<PayloadTemplate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
}

// ---------------------------------------------------------------------------
// Retry and catch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Retrier {
    pub error_equals: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// 0 disables this retrier.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_seconds: Option<u64>,
}

fn default_interval_seconds() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Catcher {
    pub error_equals: Vec<String>,
    pub next: String,
    /// Where `{"Error", "Cause"}` lands in the raw state input.
    #[serde(default, skip_serializing_if = "DataPath::is_default")]
    pub result_path: DataPath,
}

// ---------------------------------------------------------------------------
// DataPath
// ---------------------------------------------------------------------------

/// A path-valued field that distinguishes "absent" from JSON `null`.
///
/// For `InputPath`/`OutputPath`, absent passes the value through and `null`
/// yields `{}`. For `ResultPath`, absent replaces the input with the result
/// and `null` discards the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DataPath {
    #[default]
    Default,
    Null,
    Path(ReferencePath),
}

impl DataPath {
    pub fn is_default(&self) -> bool {
        matches!(self, DataPath::Default)
    }
}

impl<'de> Deserialize<'de> for DataPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Only reached when the field is present; absence is `#[serde(default)]`.
        Ok(match Option::<ReferencePath>::deserialize(deserializer)? {
            Some(path) => DataPath::Path(path),
            None => DataPath::Null,
        })
    }
}

impl Serialize for DataPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataPath::Default => ReferencePath::root().serialize(serializer),
            DataPath::Null => serializer.serialize_none(),
            DataPath::Path(path) => path.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceScheme;
    use serde_json::json;

    fn machine(value: Value) -> StateMachine {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_names_filled_from_keys() {
        let m = machine(json!({
            "StartAt": "First",
            "States": {
                "First": { "Type": "Pass", "Next": "Last" },
                "Last": { "Type": "Succeed" }
            }
        }));
        assert_eq!(m.start_state().unwrap().name, "First");
        assert_eq!(m.state("Last").unwrap().kind_name(), "Succeed");
        assert_eq!(m.state("First").unwrap().next.as_deref(), Some("Last"));
    }

    #[test]
    fn test_data_path_absent_null_and_set() {
        let m = machine(json!({
            "StartAt": "A",
            "States": {
                "A": {
                    "Type": "Pass",
                    "InputPath": null,
                    "OutputPath": "$.out",
                    "End": true
                }
            }
        }));
        let a = m.state("A").unwrap();
        assert_eq!(a.input_path, DataPath::Null);
        assert!(matches!(a.output_path, DataPath::Path(_)));
        assert_eq!(a.kind.result_path(), &DataPath::Default);
    }

    #[test]
    fn test_task_state_fields() {
        let m = machine(json!({
            "StartAt": "T",
            "TimeoutSeconds": 30,
            "States": {
                "T": {
                    "Type": "Task",
                    "Resource": "script:echo",
                    "Parameters": { "args.$": "$.words" },
                    "ResultPath": "$.echoed",
                    "TimeoutSeconds": 5,
                    "Retry": [{ "ErrorEquals": ["States.TaskFailed"], "MaxAttempts": 2 }],
                    "Catch": [{ "ErrorEquals": ["States.ALL"], "Next": "Oops", "ResultPath": null }],
                    "End": true
                },
                "Oops": { "Type": "Fail", "Error": "Broken", "Cause": "task failed" }
            }
        }));
        assert_eq!(m.timeout_seconds, Some(30));

        let StateKind::Task(task) = &m.state("T").unwrap().kind else {
            panic!("expected Task");
        };
        assert_eq!(task.resource.scheme, ResourceScheme::Script);
        assert_eq!(task.timeout_seconds, Some(5));
        assert_eq!(task.retry[0].max_attempts, 2);
        assert_eq!(task.retry[0].interval_seconds, 1);
        assert!((task.retry[0].backoff_rate - 2.0).abs() < f64::EPSILON);
        assert_eq!(task.catch[0].result_path, DataPath::Null);
        assert!(task.parameters.is_some());
    }

    #[test]
    fn test_map_aliases() {
        let m = machine(json!({
            "StartAt": "M",
            "States": {
                "M": {
                    "Type": "Map",
                    "ItemsPath": "$.items",
                    "ItemSelector": { "v.$": "$$.Map.Item.Value" },
                    "MaxConcurrency": 2,
                    "ItemProcessor": {
                        "StartAt": "Inner",
                        "States": { "Inner": { "Type": "Pass", "End": true } }
                    },
                    "End": true
                }
            }
        }));
        let StateKind::Map(map) = &m.state("M").unwrap().kind else {
            panic!("expected Map");
        };
        assert_eq!(map.max_concurrency, 2);
        assert!(map.parameters.is_some());
        assert_eq!(map.iterator.start_state().unwrap().name, "Inner");
    }

    #[test]
    fn test_wait_requires_exactly_one_form() {
        let ok = machine(json!({
            "StartAt": "W",
            "States": { "W": { "Type": "Wait", "Timestamp": "2030-01-01T00:00:00Z", "End": true } }
        }));
        assert!(matches!(
            ok.state("W").unwrap().kind,
            StateKind::Wait(WaitState::Timestamp(_))
        ));

        for wait in [
            json!({ "Type": "Wait", "End": true }),
            json!({ "Type": "Wait", "Seconds": 1, "SecondsPath": "$.s", "End": true }),
        ] {
            let err = serde_json::from_value::<StateMachine>(json!({
                "StartAt": "W",
                "States": { "W": wait }
            }))
            .unwrap_err();
            assert!(err.to_string().contains("invalid wait state"), "{err}");
        }
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = serde_json::from_value::<StateMachine>(json!({
            "StartAt": "X",
            "States": { "X": { "Type": "Teleport", "End": true } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Teleport"));
    }

    #[test]
    fn test_unsupported_resource_rejected_at_load() {
        let err = serde_json::from_value::<StateMachine>(json!({
            "StartAt": "T",
            "States": { "T": { "Type": "Task", "Resource": "lambda:fn", "End": true } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported resource scheme"));
    }

    #[test]
    fn test_serialize_keeps_type_tag_and_paths() {
        let raw = json!({
            "StartAt": "P",
            "States": {
                "P": { "Type": "Pass", "Result": { "a": 1 }, "ResultPath": null, "End": true }
            }
        });
        let m = machine(raw.clone());
        assert_eq!(serde_json::to_value(&m).unwrap(), raw);
    }
}
