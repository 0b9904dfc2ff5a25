//! Choice rule evaluation.
//!
//! Comparisons read their variable (and path operands) from the state's
//! effective input, or from the context document for `$$` paths. A variable that does not resolve, or a value of the
//! wrong type, makes the comparison false rather than failing the state;
//! only `IsPresent: false` matches a missing variable.

use std::cmp::Ordering;

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use stepwise_types::choice::{Comparator, Condition, Operand};
use stepwise_types::workflow::ChoiceState;

/// Pick the transition target: the first matching rule's `Next`, else the
/// `Default`. `None` means no rule matched and there is no default.
pub fn select_next<'a>(
    state: &'a ChoiceState,
    input: &Value,
    context: &Value,
) -> Option<&'a str> {
    state
        .choices
        .iter()
        .find(|rule| evaluate(&rule.condition, input, context))
        .map(|rule| rule.next.as_str())
        .or(state.default.as_deref())
}

pub fn evaluate(condition: &Condition, input: &Value, context: &Value) -> bool {
    match condition {
        Condition::And(items) => items.iter().all(|c| evaluate(c, input, context)),
        Condition::Or(items) => items.iter().any(|c| evaluate(c, input, context)),
        Condition::Not(inner) => !evaluate(inner, input, context),
        Condition::Compare {
            variable,
            op,
            operand,
        } => {
            let value = variable.select_in(input, context).ok();
            let operand = match operand {
                Operand::Literal(v) => Some(v.clone()),
                Operand::Path(path) => path.select_in(input, context).ok(),
            };
            match (value, operand) {
                (value, Some(operand)) if op.is_type_check() => {
                    type_check(*op, value.as_ref(), &operand)
                }
                (Some(value), Some(operand)) => compare(*op, &value, &operand),
                _ => false,
            }
        }
    }
}

fn type_check(op: Comparator, value: Option<&Value>, expected: &Value) -> bool {
    let Some(expected) = expected.as_bool() else {
        return false;
    };
    if op == Comparator::IsPresent {
        return value.is_some() == expected;
    }
    let Some(value) = value else {
        return false;
    };
    let actual = match op {
        Comparator::IsNull => value.is_null(),
        Comparator::IsNumeric => value.is_number(),
        Comparator::IsString => value.is_string(),
        Comparator::IsBoolean => value.is_boolean(),
        Comparator::IsTimestamp => value.as_str().and_then(timestamp).is_some(),
        _ => return false,
    };
    actual == expected
}

fn compare(op: Comparator, value: &Value, operand: &Value) -> bool {
    use Comparator::*;
    match op {
        StringMatches => match (value.as_str(), operand.as_str()) {
            (Some(text), Some(pattern)) => string_matches(text, pattern),
            _ => false,
        },
        StringEquals | StringLessThan | StringGreaterThan | StringLessThanEquals
        | StringGreaterThanEquals => match (value.as_str(), operand.as_str()) {
            (Some(a), Some(b)) => ordering_holds(op, a.cmp(b)),
            _ => false,
        },
        NumericEquals | NumericLessThan | NumericGreaterThan | NumericLessThanEquals
        | NumericGreaterThanEquals => match (value.as_f64(), operand.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b).is_some_and(|o| ordering_holds(op, o)),
            _ => false,
        },
        BooleanEquals => match (value.as_bool(), operand.as_bool()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        TimestampEquals | TimestampLessThan | TimestampGreaterThan
        | TimestampLessThanEquals | TimestampGreaterThanEquals => {
            match (
                value.as_str().and_then(timestamp),
                operand.as_str().and_then(timestamp),
            ) {
                (Some(a), Some(b)) => ordering_holds(op, a.cmp(&b)),
                _ => false,
            }
        }
        IsNull | IsPresent | IsNumeric | IsString | IsBoolean | IsTimestamp => false,
    }
}

fn ordering_holds(op: Comparator, ordering: Ordering) -> bool {
    use Comparator::*;
    match op {
        StringEquals | NumericEquals | TimestampEquals => ordering == Ordering::Equal,
        StringLessThan | NumericLessThan | TimestampLessThan => ordering == Ordering::Less,
        StringGreaterThan | NumericGreaterThan | TimestampGreaterThan => {
            ordering == Ordering::Greater
        }
        StringLessThanEquals | NumericLessThanEquals | TimestampLessThanEquals => {
            ordering != Ordering::Greater
        }
        StringGreaterThanEquals | NumericGreaterThanEquals | TimestampGreaterThanEquals => {
            ordering != Ordering::Less
        }
        _ => false,
    }
}

fn timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Glob match where `*` matches any run of characters; `\*` and `\\` are
/// literal.
fn string_matches(text: &str, pattern: &str) -> bool {
    #[derive(PartialEq)]
    enum Token {
        Char(char),
        Star,
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => tokens.push(Token::Char(escaped)),
                None => tokens.push(Token::Char('\\')),
            },
            '*' => tokens.push(Token::Star),
            other => tokens.push(Token::Char(other)),
        }
    }

    // Iterative wildcard matching with single-star backtracking.
    let text: Vec<char> = text.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        match tokens.get(p) {
            Some(Token::Char(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            Some(Token::Star) => {
                star = Some((p, t));
                p += 1;
            }
            _ => match star {
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|token| *token == Token::Star)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_types::choice::ChoiceRule;

    const NO_CONTEXT: &Value = &Value::Null;

    fn cond(rule: Value) -> Condition {
        let mut rule = rule;
        rule["Next"] = json!("X");
        ChoiceRule::try_from(rule).unwrap().condition
    }

    #[test]
    fn test_numeric_comparisons() {
        let input = json!({ "n": 5, "limit": 5.0 });
        assert!(evaluate(&cond(json!({ "Variable": "$.n", "NumericGreaterThan": 3 })), &input, NO_CONTEXT));
        assert!(!evaluate(&cond(json!({ "Variable": "$.n", "NumericLessThan": 3 })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.n", "NumericEqualsPath": "$.limit" })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.n", "NumericLessThanEquals": 5 })), &input, NO_CONTEXT));
    }

    #[test]
    fn test_string_and_boolean_comparisons() {
        let input = json!({ "s": "beta", "flag": true });
        assert!(evaluate(&cond(json!({ "Variable": "$.s", "StringEquals": "beta" })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.s", "StringGreaterThan": "alpha" })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.flag", "BooleanEquals": true })), &input, NO_CONTEXT));
        // Type mismatch is false, not an error.
        assert!(!evaluate(&cond(json!({ "Variable": "$.flag", "StringEquals": "true" })), &input, NO_CONTEXT));
    }

    #[test]
    fn test_timestamp_comparisons() {
        let input = json!({ "at": "2024-05-01T12:00:00+02:00" });
        assert!(evaluate(
            &cond(json!({ "Variable": "$.at", "TimestampEquals": "2024-05-01T10:00:00Z" })),
            &input,
            NO_CONTEXT
        ));
        assert!(evaluate(
            &cond(json!({ "Variable": "$.at", "TimestampLessThan": "2025-01-01T00:00:00Z" })),
            &input,
            NO_CONTEXT
        ));
    }

    #[test]
    fn test_type_checks_and_presence() {
        let input = json!({ "a": null, "b": "2024-01-01T00:00:00Z" });
        assert!(evaluate(&cond(json!({ "Variable": "$.a", "IsNull": true })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.a", "IsPresent": true })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.zzz", "IsPresent": false })), &input, NO_CONTEXT));
        assert!(!evaluate(&cond(json!({ "Variable": "$.zzz", "IsNull": true })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.b", "IsTimestamp": true })), &input, NO_CONTEXT));
        assert!(evaluate(&cond(json!({ "Variable": "$.b", "IsNumeric": false })), &input, NO_CONTEXT));
    }

    #[test]
    fn test_boolean_combinators() {
        let input = json!({ "n": 7 });
        let rule = cond(json!({
            "And": [
                { "Variable": "$.n", "NumericGreaterThan": 5 },
                { "Not": { "Variable": "$.n", "NumericEquals": 8 } },
                { "Or": [
                    { "Variable": "$.missing", "IsPresent": true },
                    { "Variable": "$.n", "NumericLessThan": 10 }
                ]}
            ]
        }));
        assert!(evaluate(&rule, &input, NO_CONTEXT));
        assert!(!evaluate(&rule, &json!({ "n": 8 }), NO_CONTEXT));
    }

    #[test]
    fn test_string_matches_patterns() {
        assert!(string_matches("log-2024.txt", "log-*.txt"));
        assert!(string_matches("anything", "*"));
        assert!(string_matches("", "*"));
        assert!(string_matches("a*b", "a\\*b"));
        assert!(!string_matches("axb", "a\\*b"));
        assert!(string_matches("abcabc", "*bc*c"));
        assert!(!string_matches("abc", "a*d"));
        assert!(string_matches("back\\slash", "back\\\\slash"));
    }

    #[test]
    fn test_select_next_uses_first_match_then_default() {
        let state: ChoiceState = serde_json::from_value(json!({
            "Choices": [
                { "Variable": "$.n", "NumericGreaterThan": 3, "Next": "Big" },
                { "Variable": "$.n", "NumericGreaterThan": 1, "Next": "Medium" }
            ],
            "Default": "Small"
        }))
        .unwrap();

        assert_eq!(select_next(&state, &json!({ "n": 5 }), NO_CONTEXT), Some("Big"));
        assert_eq!(select_next(&state, &json!({ "n": 2 }), NO_CONTEXT), Some("Medium"));
        assert_eq!(select_next(&state, &json!({ "n": 0 }), NO_CONTEXT), Some("Small"));

        let no_default = ChoiceState {
            default: None,
            ..state
        };
        assert_eq!(select_next(&no_default, &json!({ "n": 0 }), NO_CONTEXT), None);
    }

    #[test]
    fn test_context_paths_read_context_document() {
        let input = json!({ "State": { "Name": "data" }, "n": 2 });
        let context = json!({ "State": { "Name": "Check", "RetryCount": 0 }, "Limit": 2 });

        let rule = cond(json!({ "Variable": "$$.State.Name", "StringEquals": "Check" }));
        assert!(evaluate(&rule, &input, &context));
        assert!(!evaluate(&rule, &input, NO_CONTEXT));

        let rule = cond(json!({ "Variable": "$.n", "NumericEqualsPath": "$$.Limit" }));
        assert!(evaluate(&rule, &input, &context));

        let rule = cond(json!({ "Variable": "$$.State.Name", "StringEquals": "data" }));
        assert!(!evaluate(&rule, &input, &context));
    }
}
