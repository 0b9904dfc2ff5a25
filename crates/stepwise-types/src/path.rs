//! Reference paths: the restricted JSONPath dialect used to select and place
//! data inside state input and output.
//!
//! A reference path is anchored at `$` (the state's data) or `$$` (the
//! execution context document). It supports dot and bracket child access,
//! array indexing, wildcards and recursive descent, and rejects the `@`,
//! union, slice and filter operators with [`PathError::NotReferencePath`].
//!
//! ```
//! use stepwise_types::path::ReferencePath;
//!
//! let path = ReferencePath::parse("$.order['line items'][0]").unwrap();
//! let doc = serde_json::json!({ "order": { "line items": ["pen"] } });
//! assert_eq!(path.select(&doc).unwrap(), serde_json::json!("pen"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::PathError;

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// One step of a parsed path, applied left to right after the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Fragment {
    /// `.name` or `['name']`
    Child(String),
    /// `[3]`; negative values count back from the end of the array.
    Index(i64),
    /// `.*` or `[*]`
    Wildcard,
    /// `..` followed by the fragment it applies at every depth.
    Descent,
}

// ---------------------------------------------------------------------------
// ReferencePath
// ---------------------------------------------------------------------------

/// A parsed, validated reference path.
///
/// Immutable once parsed; definitions hold these so that no path string is
/// re-parsed during execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReferencePath {
    fragments: Vec<Fragment>,
    context: bool,
}

impl ReferencePath {
    /// Parse a path string, rejecting non-reference operators.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let (context, body) = match path.strip_prefix("$$") {
            Some(_) => (true, &path[1..]),
            None => (false, path),
        };

        let fragments = Parser::new(path, body, context as usize).parse()?;
        Ok(Self { fragments, context })
    }

    /// The root path `$`.
    pub fn root() -> Self {
        Self {
            fragments: Vec::new(),
            context: false,
        }
    }

    /// Whether this path addresses the context document (`$$`).
    pub fn is_context(&self) -> bool {
        self.context
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    /// A path is definite when it can only ever address a single node.
    pub fn is_definite(&self) -> bool {
        !self
            .fragments
            .iter()
            .any(|f| matches!(f, Fragment::Wildcard | Fragment::Descent))
    }

    /// Select from `context` for `$$` paths and from `input` otherwise.
    pub fn select_in(&self, input: &Value, context: &Value) -> Result<Value, PathError> {
        if self.context {
            self.select(context)
        } else {
            self.select(input)
        }
    }

    /// Select the value(s) this path addresses in `root`.
    ///
    /// Definite paths return the addressed node or [`PathError::NoMatch`].
    /// Wildcard and descent paths return an array of every match, which may
    /// be empty.
    pub fn select(&self, root: &Value) -> Result<Value, PathError> {
        if self.is_definite() {
            let mut current = root;
            for fragment in &self.fragments {
                current = step(current, fragment).ok_or_else(|| self.no_match())?;
            }
            return Ok(current.clone());
        }

        let mut matches = Vec::new();
        collect(root, &self.fragments, &mut matches);
        Ok(Value::Array(matches.into_iter().cloned().collect()))
    }

    /// Place `value` into `target` at this path.
    ///
    /// Missing intermediate object fields are created. Fails when an
    /// intermediate node is not an object (or array, for index fragments),
    /// when an index is out of range, or when the path is not definite.
    pub fn put(&self, target: &mut Value, value: Value) -> Result<(), PathError> {
        if self.context {
            return Err(self.not_writable("context paths are read-only"));
        }
        if !self.is_definite() {
            return Err(self.not_writable("path must address a single node"));
        }

        let Some((last, parents)) = self.fragments.split_last() else {
            *target = value;
            return Ok(());
        };

        let mut current = target;
        for fragment in parents {
            current = self.descend_mut(current, fragment)?;
        }

        match (last, current) {
            (Fragment::Child(name), Value::Object(map)) => {
                map.insert(name.clone(), value);
                Ok(())
            }
            (Fragment::Index(index), Value::Array(items)) => {
                let slot = resolve_index(*index, items.len())
                    .ok_or_else(|| self.not_writable("index out of range"))?;
                items[slot] = value;
                Ok(())
            }
            (_, other) => Err(self.not_writable(&format!(
                "cannot place a field inside {}",
                kind_of(other)
            ))),
        }
    }

    fn descend_mut<'v>(
        &self,
        current: &'v mut Value,
        fragment: &Fragment,
    ) -> Result<&'v mut Value, PathError> {
        match (fragment, current) {
            (Fragment::Child(name), Value::Object(map)) => Ok(map
                .entry(name.clone())
                .or_insert_with(|| Value::Object(Map::new()))),
            (Fragment::Index(index), Value::Array(items)) => {
                let len = items.len();
                resolve_index(*index, len)
                    .map(move |slot| &mut items[slot])
                    .ok_or_else(|| self.not_writable("index out of range"))
            }
            (_, other) => Err(self.not_writable(&format!(
                "intermediate node is {}",
                kind_of(other)
            ))),
        }
    }

    fn no_match(&self) -> PathError {
        PathError::NoMatch(self.to_string())
    }

    fn not_writable(&self, reason: &str) -> PathError {
        PathError::NotWritable {
            path: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl Default for ReferencePath {
    fn default() -> Self {
        Self::root()
    }
}

impl TryFrom<String> for ReferencePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ReferencePath> for String {
    fn from(path: ReferencePath) -> Self {
        path.to_string()
    }
}

impl std::str::FromStr for ReferencePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ReferencePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.context { "$$" } else { "$" })?;

        let mut after_descent = false;
        for fragment in &self.fragments {
            match fragment {
                Fragment::Descent => f.write_str("..")?,
                Fragment::Wildcard if after_descent => f.write_str("*")?,
                Fragment::Wildcard => f.write_str(".*")?,
                Fragment::Child(name) if is_plain_name(name) => {
                    if !after_descent {
                        f.write_str(".")?;
                    }
                    f.write_str(name)?;
                }
                Fragment::Child(name) => {
                    f.write_str("['")?;
                    for c in name.chars() {
                        if c == '\'' || c == '\\' {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                    f.write_str("']")?;
                }
                Fragment::Index(index) => write!(f, "[{index}]")?,
            }
            after_descent = matches!(fragment, Fragment::Descent);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Evaluation helpers
// ---------------------------------------------------------------------------

fn step<'v>(value: &'v Value, fragment: &Fragment) -> Option<&'v Value> {
    match (fragment, value) {
        (Fragment::Child(name), Value::Object(map)) => map.get(name),
        (Fragment::Index(index), Value::Array(items)) => {
            resolve_index(*index, items.len()).map(|slot| &items[slot])
        }
        _ => None,
    }
}

fn collect<'v>(value: &'v Value, fragments: &[Fragment], out: &mut Vec<&'v Value>) {
    let Some((fragment, rest)) = fragments.split_first() else {
        out.push(value);
        return;
    };

    match fragment {
        Fragment::Wildcard => {
            for child in children(value) {
                collect(child, rest, out);
            }
        }
        Fragment::Descent => {
            // `rest` is never empty: the parser rejects a trailing `..`.
            collect(value, rest, out);
            for child in children(value) {
                collect(child, fragments, out);
            }
        }
        _ => {
            if let Some(next) = step(value, fragment) {
                collect(next, rest, out);
            }
        }
    }
}

fn children(value: &Value) -> Box<dyn Iterator<Item = &Value> + '_> {
    match value {
        Value::Object(map) => Box::new(map.values()),
        Value::Array(items) => Box::new(items.iter()),
        _ => Box::new(std::iter::empty()),
    }
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { len + index } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    /// Full original text, for error messages.
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
    /// Offset of `chars[0]` within `source`.
    base: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str, body: &str, base: usize) -> Self {
        Self {
            source,
            chars: body.chars().collect(),
            pos: 0,
            base,
        }
    }

    fn parse(mut self) -> Result<Vec<Fragment>, PathError> {
        match self.peek() {
            Some('$') => self.pos += 1,
            Some('@') => return Err(self.forbidden()),
            _ => return Err(self.syntax("path must start with '$'")),
        }

        let mut fragments = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                '.' if self.peek_at(1) == Some('.') => {
                    self.pos += 2;
                    fragments.push(Fragment::Descent);
                    match self.peek() {
                        Some('*') => {
                            self.pos += 1;
                            fragments.push(Fragment::Wildcard);
                        }
                        Some('[') => fragments.push(self.bracket()?),
                        Some(_) => fragments.push(Fragment::Child(self.name()?)),
                        None => return Err(self.syntax("'..' must be followed by a name")),
                    }
                }
                '.' => {
                    self.pos += 1;
                    if self.peek() == Some('*') {
                        self.pos += 1;
                        fragments.push(Fragment::Wildcard);
                    } else {
                        fragments.push(Fragment::Child(self.name()?));
                    }
                }
                '[' => fragments.push(self.bracket()?),
                '@' => return Err(self.forbidden()),
                other => return Err(self.syntax(&format!("unexpected character '{other}'"))),
            }
        }

        Ok(fragments)
    }

    /// A dot-notation field name, running to the next `.` or `[`.
    fn name(&mut self) -> Result<String, PathError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            match c {
                '.' | '[' => break,
                '@' | ',' | ':' | '?' => return Err(self.forbidden()),
                ']' | ' ' | '\t' => return Err(self.syntax(&format!("unexpected '{c}' in name"))),
                _ => self.pos += 1,
            }
        }

        let name: String = self.chars[start..self.pos].iter().collect();
        if name.is_empty() {
            return Err(self.syntax("expected a field name"));
        }
        Ok(name)
    }

    fn bracket(&mut self) -> Result<Fragment, PathError> {
        self.pos += 1;
        self.skip_ws();

        let fragment = match self.peek() {
            Some('?') | Some('@') => return Err(self.forbidden()),
            Some(':') => return Err(self.forbidden()),
            Some('*') => {
                self.pos += 1;
                Fragment::Wildcard
            }
            Some(quote @ ('\'' | '"')) => Fragment::Child(self.quoted(quote)?),
            Some(c) if c == '-' || c.is_ascii_digit() => Fragment::Index(self.number()?),
            Some(other) => return Err(self.syntax(&format!("unexpected '{other}' in brackets"))),
            None => return Err(self.syntax("unterminated '['")),
        };

        self.skip_ws();
        match self.peek() {
            Some(']') => {
                self.pos += 1;
                Ok(fragment)
            }
            Some(',') | Some(':') => Err(self.forbidden()),
            Some(other) => Err(self.syntax(&format!("expected ']' but found '{other}'"))),
            None => Err(self.syntax("unterminated '['")),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String, PathError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                Some('\\') => {
                    match self.peek_at(1) {
                        Some(c @ ('\\' | '\'' | '"')) => out.push(c),
                        Some(c) => {
                            out.push('\\');
                            out.push(c);
                        }
                        None => return Err(self.syntax("unterminated string")),
                    }
                    self.pos += 2;
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
                None => return Err(self.syntax("unterminated string")),
            }
        }
    }

    fn number(&mut self) -> Result<i64, PathError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
            // `[-:2]` is a slice, not a malformed index
            if self.peek() == Some(':') {
                return Err(self.forbidden());
            }
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }

        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse()
            .map_err(|_| self.syntax(&format!("invalid index '{text}'")))
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn syntax(&self, reason: &str) -> PathError {
        PathError::Syntax {
            path: self.source.to_string(),
            offset: self.base + self.pos,
            reason: reason.to_string(),
        }
    }

    fn forbidden(&self) -> PathError {
        PathError::NotReferencePath(self.source.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
