//! Payload templates for `Parameters`, `ItemSelector` and `ResultSelector`.
//!
//! A template is a JSON value where any object field whose key ends in `.$`
//! holds a reference path instead of a literal. The suffix is stripped from
//! the output key and the path's selection is placed there.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DefinitionError, PathError};
use crate::path::ReferencePath;

const PATH_SUFFIX: &str = ".$";

/// A pre-parsed payload template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum PayloadTemplate {
    Literal(Value),
    Path(ReferencePath),
    /// Field order follows the definition.
    Object(Vec<(String, PayloadTemplate)>),
    Array(Vec<PayloadTemplate>),
}

impl PayloadTemplate {
    /// Build the payload, resolving `$` paths against `input` and `$$` paths
    /// against `context`.
    pub fn resolve(&self, input: &Value, context: &Value) -> Result<Value, PathError> {
        match self {
            PayloadTemplate::Literal(value) => Ok(value.clone()),
            PayloadTemplate::Path(path) => {
                let root = if path.is_context() { context } else { input };
                path.select(root)
            }
            PayloadTemplate::Object(fields) => {
                let mut out = Map::with_capacity(fields.len());
                for (key, field) in fields {
                    out.insert(key.clone(), field.resolve(input, context)?);
                }
                Ok(Value::Object(out))
            }
            PayloadTemplate::Array(items) => items
                .iter()
                .map(|item| item.resolve(input, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
        }
    }

    fn parse(value: Value) -> Result<Self, DefinitionError> {
        match value {
            Value::Object(map) => {
                let mut fields = Vec::with_capacity(map.len());
                for (key, value) in map {
                    match key.strip_suffix(PATH_SUFFIX) {
                        Some(stripped) => {
                            let Value::String(path) = value else {
                                return Err(DefinitionError::InvalidPayload(format!(
                                    "field '{key}' must be a path string"
                                )));
                            };
                            if stripped.is_empty() {
                                return Err(DefinitionError::InvalidPayload(format!(
                                    "field '{key}' has an empty name"
                                )));
                            }
                            let path = ReferencePath::parse(&path)?;
                            fields.push((stripped.to_string(), PayloadTemplate::Path(path)));
                        }
                        None => fields.push((key, PayloadTemplate::parse(value)?)),
                    }
                }
                Ok(PayloadTemplate::Object(fields))
            }
            Value::Array(items) => items
                .into_iter()
                .map(PayloadTemplate::parse)
                .collect::<Result<Vec<_>, _>>()
                .map(PayloadTemplate::Array),
            literal => Ok(PayloadTemplate::Literal(literal)),
        }
    }
}

impl TryFrom<Value> for PayloadTemplate {
    type Error = DefinitionError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<PayloadTemplate> for Value {
    fn from(template: PayloadTemplate) -> Self {
        match template {
            PayloadTemplate::Literal(value) => value,
            // Only reachable at the top level; fields carry their own suffix.
            PayloadTemplate::Path(path) => Value::String(path.to_string()),
            PayloadTemplate::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(key, field)| match field {
                        PayloadTemplate::Path(path) => {
                            (format!("{key}{PATH_SUFFIX}"), Value::String(path.to_string()))
                        }
                        other => (key, Value::from(other)),
                    })
                    .collect(),
            ),
            PayloadTemplate::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
        }
    }
}
