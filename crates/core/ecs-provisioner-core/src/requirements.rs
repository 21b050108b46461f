//! Label requirements
//!
//! A node request is expressed as an ordered set of requirements over label
//! keys. Offerings and images are matched against those requirements; a key
//! the request never mentions places no constraint on the other side.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Requirement operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Value must be one of `values`
    In,
    /// Value must not be one of `values`
    NotIn,
    /// Any value
    Exists,
    /// Key must be absent
    DoesNotExist,
}

/// A single constraint over one label key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    /// Label key
    pub key: String,

    /// Operator applied to `values`
    pub operator: Operator,

    /// Values the operator refers to
    #[serde(default)]
    pub values: BTreeSet<String>,

    /// Minimum number of distinct values the candidate set must cover
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_values: Option<usize>,
}

impl Requirement {
    /// Key must take one of `values`
    pub fn new_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_operator(key, Operator::In, values)
    }

    /// Key must not take any of `values`
    pub fn not_in<I, S>(key: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_operator(key, Operator::NotIn, values)
    }

    /// Key may take any value
    pub fn exists(key: impl Into<String>) -> Self {
        Self::with_operator(key, Operator::Exists, Vec::<String>::new())
    }

    /// Key must not be set
    pub fn does_not_exist(key: impl Into<String>) -> Self {
        Self::with_operator(key, Operator::DoesNotExist, Vec::<String>::new())
    }

    fn with_operator<I, S>(key: impl Into<String>, operator: Operator, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().map(Into::into).collect(),
            min_values: None,
        }
    }

    /// Require at least `n` distinct values across the candidate set
    pub fn with_min_values(mut self, n: usize) -> Self {
        self.min_values = Some(n);
        self
    }

    /// Whether `value` satisfies this requirement
    pub fn allows(&self, value: &str) -> bool {
        match self.operator {
            Operator::In => self.values.contains(value),
            Operator::NotIn => !self.values.contains(value),
            Operator::Exists => true,
            Operator::DoesNotExist => false,
        }
    }
}

/// Ordered requirement set, at most one requirement per key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirements {
    entries: Vec<Requirement>,
}

impl Requirements {
    /// Empty requirement set (admits everything)
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a requirement, replacing any existing one for the same key
    pub fn add(&mut self, requirement: Requirement) {
        match self.entries.iter_mut().find(|r| r.key == requirement.key) {
            Some(existing) => *existing = requirement,
            None => self.entries.push(requirement),
        }
    }

    /// Builder form of [`Requirements::add`]
    pub fn with(mut self, requirement: Requirement) -> Self {
        self.add(requirement);
        self
    }

    /// Requirement for `key`, if any
    pub fn get(&self, key: &str) -> Option<&Requirement> {
        self.entries.iter().find(|r| r.key == key)
    }

    /// Whether `value` is admitted for `key`. Undefined keys admit everything.
    pub fn allows(&self, key: &str, value: &str) -> bool {
        self.get(key).is_none_or(|r| r.allows(value))
    }

    /// Whether any requirement carries a minimum-distinct-values rule
    pub fn has_min_values(&self) -> bool {
        self.entries.iter().any(|r| r.min_values.is_some())
    }

    /// Check a label set against these requirements.
    ///
    /// Labels the other side does not define are treated as compatible.
    pub fn compatible_with(&self, labels: &BTreeMap<String, String>) -> bool {
        self.entries.iter().all(|r| match labels.get(&r.key) {
            Some(value) => r.allows(value),
            None => true,
        })
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter()
    }

    /// Number of keys constrained
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is constrained
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<Requirement> for Requirements {
    fn from_iter<T: IntoIterator<Item = Requirement>>(iter: T) -> Self {
        let mut requirements = Self::new();
        for requirement in iter {
            requirements.add(requirement);
        }
        requirements
    }
}
