//! Parameterized query descriptors.
//!
//! Templates reference parameters as `$name`, which is both Cypher's syntax and one
//! of SQLite's named-parameter forms. Placeholders inside string literals,
//! backtick-quoted identifiers and comments are ignored.

use std::collections::BTreeMap;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::{errors::GraphDbError, value::ParamValue};

pub type Parameters = BTreeMap<String, ParamValue>;

/// Routing hint: reads may go to a replica, writes must go to the primary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Read => "read",
            AccessMode::Write => "write",
        }
    }
}

/// An immutable query template plus its bound parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryDescriptor {
    template: String,
    placeholders: Vec<String>,
    params: Parameters,
}

impl QueryDescriptor {
    pub fn new<T: Into<String>>(template: T) -> Self {
        let template = template.into();
        let placeholders = scan_placeholders(&template);
        Self {
            template,
            placeholders,
            params: Parameters::new(),
        }
    }

    /// Builds a descriptor and validates it in one step.
    pub fn with_params<T: Into<String>>(
        template: T,
        params: Parameters,
    ) -> Result<Self, GraphDbError> {
        let mut descriptor = Self::new(template);
        descriptor.params = params;
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Binds a parameter, replacing any previous value under the same name.
    pub fn param<K: Into<String>, V: Into<ParamValue>>(mut self, name: K, value: V) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Placeholder names in order of first appearance.
    pub fn placeholders(&self) -> &[String] {
        &self.placeholders
    }

    /// Checks that placeholders and bound parameters match exactly.
    pub fn validate(&self) -> Result<(), GraphDbError> {
        if self.template.trim().is_empty() {
            return Err(GraphDbError::validation("query template must be set"));
        }
        let declared: AHashSet<&str> = self.placeholders.iter().map(|s| s.as_str()).collect();
        let missing: Vec<&str> = self
            .placeholders
            .iter()
            .filter(|name| !self.params.contains_key(name.as_str()))
            .map(|s| s.as_str())
            .collect();
        let unknown: Vec<&str> = self
            .params
            .keys()
            .filter(|name| !declared.contains(name.as_str()))
            .map(|s| s.as_str())
            .collect();
        if missing.is_empty() && unknown.is_empty() {
            return Ok(());
        }
        let mut problems = Vec::new();
        if !missing.is_empty() {
            problems.push(format!("missing parameters: {}", dollar_list(&missing)));
        }
        if !unknown.is_empty() {
            problems.push(format!("unknown parameters: {}", dollar_list(&unknown)));
        }
        Err(GraphDbError::validation(problems.join("; ")))
    }
}

fn dollar_list(names: &[&str]) -> String {
    names
        .iter()
        .map(|name| format!("${name}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ScanState {
    Code,
    Quoted(char),
    LineComment,
    BlockComment,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

pub(crate) fn scan_placeholders(template: &str) -> Vec<String> {
    let chars: Vec<char> = template.chars().collect();
    let mut seen = AHashSet::new();
    let mut names = Vec::new();
    let mut state = ScanState::Code;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match state {
            ScanState::Code => match c {
                '\'' | '"' | '`' => state = ScanState::Quoted(c),
                '/' if next == Some('/') => {
                    state = ScanState::LineComment;
                    i += 1;
                }
                '/' if next == Some('*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                '$' => {
                    let start = i + 1;
                    let mut end = start;
                    while end < chars.len() && is_ident_char(chars[end]) {
                        end += 1;
                    }
                    if end > start {
                        let name: String = chars[start..end].iter().collect();
                        if seen.insert(name.clone()) {
                            names.push(name);
                        }
                        i = end;
                        continue;
                    }
                }
                _ => {}
            },
            ScanState::Quoted(quote) => {
                if c == '\\' && quote != '`' {
                    i += 1;
                } else if c == quote {
                    state = ScanState::Code;
                }
            }
            ScanState::LineComment => {
                if c == '\n' {
                    state = ScanState::Code;
                }
            }
            ScanState::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = ScanState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    names
}
