//! Task resource identifiers of the form `<scheme>:<name>`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DefinitionError;

/// Resource kinds a Task state can dispatch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceScheme {
    /// Run an executable found on `PATH`.
    Script,
    Command,
    Curl,
}

impl ResourceScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceScheme::Script => "script",
            ResourceScheme::Command => "command",
            ResourceScheme::Curl => "curl",
        }
    }
}

impl fmt::Display for ResourceScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceScheme {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(ResourceScheme::Script),
            "command" => Ok(ResourceScheme::Command),
            "curl" => Ok(ResourceScheme::Curl),
            other => Err(DefinitionError::UnsupportedResource(other.to_string())),
        }
    }
}

/// A Task's `Resource`, split and validated once at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskResource {
    pub scheme: ResourceScheme,
    pub name: String,
}

impl TaskResource {
    /// Split at the first `:`. Both halves must be non-blank.
    pub fn parse(raw: &str) -> Result<Self, DefinitionError> {
        let invalid = || DefinitionError::InvalidResource(raw.to_string());

        let (scheme, name) = raw.split_once(':').ok_or_else(invalid)?;
        if scheme.trim().is_empty() || name.trim().is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme: scheme.parse()?,
            name: name.to_string(),
        })
    }
}

impl TryFrom<String> for TaskResource {
    type Error = DefinitionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TaskResource> for String {
    fn from(resource: TaskResource) -> Self {
        resource.to_string()
    }
}

impl fmt::Display for TaskResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.name)
    }
}
