// Copyright 2023 Timberline Project Authors. Licensed under Apache-2.0.

//! Stream labels and label matchers.

use std::{
    collections::hash_map::DefaultHasher,
    fmt,
    hash::{Hash, Hasher},
};

use common_util::define_result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid regex in matcher, name:{}, value:{}, err:{}", name, value, source))]
    InvalidRegex {
        name: String,
        value: String,
        source: regex::Error,
        backtrace: Backtrace,
    },
}

define_result!(Error);

/// A single `name=value` label.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Sorted label set identifying one stream within a tenant.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<Label>);

impl Labels {
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut labels: Vec<_> = pairs
            .iter()
            .map(|(name, value)| Label {
                name: name.to_string(),
                value: value.to_string(),
            })
            .collect();
        labels.sort();
        labels.dedup();
        Self(labels)
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable fingerprint of the label set, the series identifier within a
    /// tenant.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.0.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOp {
    /// `=`
    Eq,
    /// `!=`
    Neq,
    /// `=~`
    Re,
    /// `!~`
    NotRe,
}

/// One label matcher of a delete request or retention stream selector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl Matcher {
    pub fn new(name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, MatchOp::Eq, value)
    }

    /// Compile the matcher, validating any regex value.
    pub fn compile(&self) -> Result<CompiledMatcher> {
        let regex = match self.op {
            MatchOp::Eq | MatchOp::Neq => None,
            MatchOp::Re | MatchOp::NotRe => {
                // Fully anchored, like prometheus matchers.
                let re = Regex::new(&format!("^(?:{})$", self.value)).context(InvalidRegex {
                    name: &self.name,
                    value: &self.value,
                })?;
                Some(re)
            }
        };

        Ok(CompiledMatcher {
            matcher: self.clone(),
            regex,
        })
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            MatchOp::Eq => "=",
            MatchOp::Neq => "!=",
            MatchOp::Re => "=~",
            MatchOp::NotRe => "!~",
        };
        write!(f, "{}{}{:?}", self.name, op, self.value)
    }
}

/// A [Matcher] with its regex compiled up front.
#[derive(Clone, Debug)]
pub struct CompiledMatcher {
    matcher: Matcher,
    regex: Option<Regex>,
}

impl CompiledMatcher {
    /// A missing label matches as the empty string, like prometheus.
    pub fn matches(&self, labels: &Labels) -> bool {
        let value = labels.get(&self.matcher.name).unwrap_or("");
        match self.matcher.op {
            MatchOp::Eq => value == self.matcher.value,
            MatchOp::Neq => value != self.matcher.value,
            MatchOp::Re => self.regex.as_ref().unwrap().is_match(value),
            MatchOp::NotRe => !self.regex.as_ref().unwrap().is_match(value),
        }
    }
}

/// Compile `matchers` and report whether all of them match `labels`.
pub fn compile_all(matchers: &[Matcher]) -> Result<Vec<CompiledMatcher>> {
    matchers.iter().map(Matcher::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_fingerprint() {
        let a = Labels::from_pairs(&[("job", "ingester"), ("app", "x")]);
        let b = Labels::from_pairs(&[("app", "x"), ("job", "ingester")]);
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(Some("x"), a.get("app"));
        assert_eq!(None, a.get("missing"));

        let c = Labels::from_pairs(&[("app", "y"), ("job", "ingester")]);
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_matcher_ops() {
        let labels = Labels::from_pairs(&[("app", "web"), ("env", "prod")]);

        let cases = [
            (Matcher::eq("app", "web"), true),
            (Matcher::eq("app", "db"), false),
            (Matcher::new("app", MatchOp::Neq, "db"), true),
            (Matcher::new("app", MatchOp::Re, "w.b"), true),
            (Matcher::new("app", MatchOp::Re, "w"), false),
            (Matcher::new("app", MatchOp::NotRe, "w.*"), false),
            // Missing labels match as empty values.
            (Matcher::eq("missing", ""), true),
            (Matcher::new("missing", MatchOp::Neq, "x"), true),
        ];
        for (matcher, expect) in cases {
            let compiled = matcher.compile().unwrap();
            assert_eq!(expect, compiled.matches(&labels), "matcher:{matcher}");
        }
    }

    #[test]
    fn test_invalid_regex() {
        let err = Matcher::new("app", MatchOp::Re, "(").compile();
        assert!(err.is_err());
    }
}
