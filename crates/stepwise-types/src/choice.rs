//! Choice rules: the structured boolean conditions a Choice state evaluates.
//!
//! Rules are parsed from their JSON form once, while the definition loads.
//! Evaluation lives in `stepwise-core`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DefinitionError;
use crate::path::ReferencePath;

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

/// A top-level rule: a condition plus the state to continue at when it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct ChoiceRule {
    pub condition: Condition,
    pub next: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        variable: ReferencePath,
        op: Comparator,
        operand: Operand,
    },
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    /// From a `...Path` comparator; resolved against the same input.
    Path(ReferencePath),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparator {
    StringEquals,
    StringLessThan,
    StringGreaterThan,
    StringLessThanEquals,
    StringGreaterThanEquals,
    StringMatches,
    NumericEquals,
    NumericLessThan,
    NumericGreaterThan,
    NumericLessThanEquals,
    NumericGreaterThanEquals,
    BooleanEquals,
    TimestampEquals,
    TimestampLessThan,
    TimestampGreaterThan,
    TimestampLessThanEquals,
    TimestampGreaterThanEquals,
    IsNull,
    IsPresent,
    IsNumeric,
    IsString,
    IsBoolean,
    IsTimestamp,
}

/// The literal type a comparator's operand must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    String,
    Number,
    Boolean,
    Timestamp,
}

const COMPARATORS: &[(&str, Comparator)] = &[
    ("StringEquals", Comparator::StringEquals),
    ("StringLessThan", Comparator::StringLessThan),
    ("StringGreaterThan", Comparator::StringGreaterThan),
    ("StringLessThanEquals", Comparator::StringLessThanEquals),
    ("StringGreaterThanEquals", Comparator::StringGreaterThanEquals),
    ("StringMatches", Comparator::StringMatches),
    ("NumericEquals", Comparator::NumericEquals),
    ("NumericLessThan", Comparator::NumericLessThan),
    ("NumericGreaterThan", Comparator::NumericGreaterThan),
    ("NumericLessThanEquals", Comparator::NumericLessThanEquals),
    ("NumericGreaterThanEquals", Comparator::NumericGreaterThanEquals),
    ("BooleanEquals", Comparator::BooleanEquals),
    ("TimestampEquals", Comparator::TimestampEquals),
    ("TimestampLessThan", Comparator::TimestampLessThan),
    ("TimestampGreaterThan", Comparator::TimestampGreaterThan),
    ("TimestampLessThanEquals", Comparator::TimestampLessThanEquals),
    ("TimestampGreaterThanEquals", Comparator::TimestampGreaterThanEquals),
    ("IsNull", Comparator::IsNull),
    ("IsPresent", Comparator::IsPresent),
    ("IsNumeric", Comparator::IsNumeric),
    ("IsString", Comparator::IsString),
    ("IsBoolean", Comparator::IsBoolean),
    ("IsTimestamp", Comparator::IsTimestamp),
];

impl Comparator {
    pub fn name(&self) -> &'static str {
        COMPARATORS
            .iter()
            .find(|(_, c)| c == self)
            .map(|(name, _)| *name)
            .unwrap_or("Unknown")
    }

    fn lookup(name: &str) -> Option<Self> {
        COMPARATORS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| *c)
    }

    /// Type checks (`IsNull`, `IsPresent`, ...) take a boolean literal and
    /// have no `...Path` form.
    pub fn is_type_check(&self) -> bool {
        matches!(
            self,
            Comparator::IsNull
                | Comparator::IsPresent
                | Comparator::IsNumeric
                | Comparator::IsString
                | Comparator::IsBoolean
                | Comparator::IsTimestamp
        )
    }

    /// `StringMatches` only accepts a literal pattern.
    fn allows_path(&self) -> bool {
        !self.is_type_check() && *self != Comparator::StringMatches
    }

    pub fn operand_kind(&self) -> OperandKind {
        use Comparator::*;
        match self {
            StringEquals | StringLessThan | StringGreaterThan | StringLessThanEquals
            | StringGreaterThanEquals | StringMatches => OperandKind::String,
            NumericEquals | NumericLessThan | NumericGreaterThan | NumericLessThanEquals
            | NumericGreaterThanEquals => OperandKind::Number,
            TimestampEquals | TimestampLessThan | TimestampGreaterThan
            | TimestampLessThanEquals | TimestampGreaterThanEquals => OperandKind::Timestamp,
            BooleanEquals | IsNull | IsPresent | IsNumeric | IsString | IsBoolean
            | IsTimestamp => OperandKind::Boolean,
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn invalid(reason: impl Into<String>) -> DefinitionError {
    DefinitionError::InvalidChoiceRule(reason.into())
}

impl Condition {
    fn parse(mut map: Map<String, Value>) -> Result<Self, DefinitionError> {
        map.remove("Comment");

        if let Some(items) = map.remove("And") {
            return Self::ensure_alone(&map, "And")
                .and_then(|_| Self::parse_list(items, "And"))
                .map(Condition::And);
        }
        if let Some(items) = map.remove("Or") {
            return Self::ensure_alone(&map, "Or")
                .and_then(|_| Self::parse_list(items, "Or"))
                .map(Condition::Or);
        }
        if let Some(inner) = map.remove("Not") {
            Self::ensure_alone(&map, "Not")?;
            let Value::Object(inner) = inner else {
                return Err(invalid("'Not' must hold a rule object"));
            };
            return Ok(Condition::Not(Box::new(Self::parse(inner)?)));
        }

        let variable = match map.remove("Variable") {
            Some(Value::String(path)) => ReferencePath::parse(&path)?,
            Some(_) => return Err(invalid("'Variable' must be a path string")),
            None => return Err(invalid("rule needs 'Variable' or one of And/Or/Not")),
        };

        let mut entries = map.into_iter();
        let (key, value) = entries
            .next()
            .ok_or_else(|| invalid(format!("rule on '{variable}' has no comparator")))?;
        if let Some((extra, _)) = entries.next() {
            return Err(invalid(format!(
                "rule on '{variable}' has more than one comparator ('{key}', '{extra}')"
            )));
        }

        let (op, operand) = Self::parse_comparison(&key, value)?;
        Ok(Condition::Compare {
            variable,
            op,
            operand,
        })
    }

    fn parse_comparison(key: &str, value: Value) -> Result<(Comparator, Operand), DefinitionError> {
        if let Some(op) = Comparator::lookup(key) {
            Self::check_literal(op, &value)?;
            return Ok((op, Operand::Literal(value)));
        }

        let op = key
            .strip_suffix("Path")
            .and_then(Comparator::lookup)
            .filter(Comparator::allows_path)
            .ok_or_else(|| invalid(format!("unknown comparator '{key}'")))?;
        let Value::String(path) = value else {
            return Err(invalid(format!("'{key}' must be a path string")));
        };
        Ok((op, Operand::Path(ReferencePath::parse(&path)?)))
    }

    fn check_literal(op: Comparator, value: &Value) -> Result<(), DefinitionError> {
        let ok = match op.operand_kind() {
            OperandKind::String => value.is_string(),
            OperandKind::Number => value.is_number(),
            OperandKind::Boolean => value.is_boolean(),
            OperandKind::Timestamp => value
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
        };
        if ok {
            Ok(())
        } else {
            Err(invalid(format!(
                "'{}' expects a {:?} operand, got {value}",
                op.name(),
                op.operand_kind()
            )))
        }
    }

    fn parse_list(items: Value, key: &str) -> Result<Vec<Condition>, DefinitionError> {
        let Value::Array(items) = items else {
            return Err(invalid(format!("'{key}' must hold an array of rules")));
        };
        if items.is_empty() {
            return Err(invalid(format!("'{key}' must not be empty")));
        }
        items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Self::parse(map),
                _ => Err(invalid(format!("'{key}' entries must be rule objects"))),
            })
            .collect()
    }

    fn ensure_alone(rest: &Map<String, Value>, key: &str) -> Result<(), DefinitionError> {
        match rest.keys().next() {
            Some(other) => Err(invalid(format!("'{key}' cannot be combined with '{other}'"))),
            None => Ok(()),
        }
    }

    fn into_map(self) -> Map<String, Value> {
        let mut map = Map::new();
        match self {
            Condition::And(items) => {
                map.insert("And".into(), Self::list_value(items));
            }
            Condition::Or(items) => {
                map.insert("Or".into(), Self::list_value(items));
            }
            Condition::Not(inner) => {
                map.insert("Not".into(), Value::Object(inner.into_map()));
            }
            Condition::Compare {
                variable,
                op,
                operand,
            } => {
                map.insert("Variable".into(), Value::String(variable.to_string()));
                match operand {
                    Operand::Literal(value) => {
                        map.insert(op.name().to_string(), value);
                    }
                    Operand::Path(path) => {
                        map.insert(format!("{}Path", op.name()), Value::String(path.to_string()));
                    }
                }
            }
        }
        map
    }

    fn list_value(items: Vec<Condition>) -> Value {
        Value::Array(
            items
                .into_iter()
                .map(|c| Value::Object(c.into_map()))
                .collect(),
        )
    }
}

impl TryFrom<Value> for ChoiceRule {
    type Error = DefinitionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut map) = value else {
            return Err(invalid("choice rule must be an object"));
        };
        let next = match map.remove("Next") {
            Some(Value::String(next)) if !next.is_empty() => next,
            Some(_) => return Err(invalid("'Next' must be a state name")),
            None => return Err(invalid("top-level choice rule needs 'Next'")),
        };
        Ok(Self {
            condition: Condition::parse(map)?,
            next,
        })
    }
}

impl From<ChoiceRule> for Value {
    fn from(rule: ChoiceRule) -> Self {
        let mut map = rule.condition.into_map();
        map.insert("Next".into(), Value::String(rule.next));
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: Value) -> Result<ChoiceRule, DefinitionError> {
        ChoiceRule::try_from(value)
    }

    #[test]
    fn test_parse_simple_comparison() {
        let r = rule(json!({ "Variable": "$.n", "NumericGreaterThan": 3, "Next": "Big" })).unwrap();
        assert_eq!(r.next, "Big");
        match r.condition {
            Condition::Compare { variable, op, operand } => {
                assert_eq!(variable.to_string(), "$.n");
                assert_eq!(op, Comparator::NumericGreaterThan);
                assert_eq!(operand, Operand::Literal(json!(3)));
            }
            other => panic!("unexpected condition {other:?}"),
        }
    }

    #[test]
    fn test_parse_path_operand() {
        let r = rule(json!({ "Variable": "$.a", "StringEqualsPath": "$.b", "Next": "X" })).unwrap();
        assert!(matches!(
            r.condition,
            Condition::Compare { op: Comparator::StringEquals, operand: Operand::Path(_), .. }
        ));
    }

    #[test]
    fn test_parse_nested_boolean_rules() {
        let r = rule(json!({
            "And": [
                { "Variable": "$.a", "IsPresent": true },
                { "Not": { "Variable": "$.a", "StringEquals": "off" } },
                { "Or": [
                    { "Variable": "$.n", "NumericEquals": 1 },
                    { "Variable": "$.n", "NumericEquals": 2 }
                ]}
            ],
            "Next": "Done"
        }))
        .unwrap();
        let Condition::And(items) = &r.condition else {
            panic!("expected And");
        };
        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], Condition::Not(_)));
        assert!(matches!(&items[2], Condition::Or(inner) if inner.len() == 2));
    }

    #[test]
    fn test_rejects_bad_rules() {
        let cases = [
            json!({ "Variable": "$.n", "NumericEquals": 1 }),
            json!({ "Variable": "$.n", "Next": "X" }),
            json!({ "Variable": "$.n", "Frobnicate": 1, "Next": "X" }),
            json!({ "Variable": "$.n", "NumericEquals": "one", "Next": "X" }),
            json!({ "Variable": "$.n", "IsNullPath": "$.x", "Next": "X" }),
            json!({ "Variable": "$.t", "TimestampEquals": "yesterday", "Next": "X" }),
            json!({ "And": [], "Next": "X" }),
            json!({ "And": [{ "Variable": "$.a", "IsNull": true }], "Variable": "$.b", "Next": "X" }),
            json!({ "Variable": "$.n", "NumericEquals": 1, "NumericLessThan": 3, "Next": "X" }),
        ];
        for case in cases {
            let err = rule(case.clone()).unwrap_err();
            assert!(
                matches!(err, DefinitionError::InvalidChoiceRule(_)),
                "{case}: {err:?}"
            );
        }
    }

    #[test]
    fn test_forbidden_variable_path() {
        let err = rule(json!({ "Variable": "$..a[?(@.b)]", "IsNull": true, "Next": "X" })).unwrap_err();
        assert!(matches!(err, DefinitionError::Path(_)));
    }

    #[test]
    fn test_serializes_to_original_shape() {
        let raw = json!({
            "Or": [
                { "Variable": "$.x", "StringMatches": "log-*" },
                { "Variable": "$.x", "StringEqualsPath": "$.y" }
            ],
            "Next": "Match"
        });
        let parsed = rule(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(parsed).unwrap(), raw);
    }
}
