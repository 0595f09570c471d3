// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Shared run state and the per-key merge policy.
//!
//! State is a key/value container. Nodes never mutate it directly: they
//! return [`StateFragment`]s, and the executor applies those fragments at
//! superstep boundaries through [`State::apply`], the single mutation path.
//! Each key combines under a declared [`MergePolicy`]; sibling fragments
//! from one superstep are applied in spawn-index order, so `Accumulate`
//! keys are deterministic regardless of task completion order.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// How fragment values combine with existing values for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MergePolicy {
    /// New value replaces the old one. The default for undeclared keys.
    #[default]
    Overwrite,
    /// New values extend the existing JSON array for this key. Fragments
    /// carrying an array are concatenated element-wise; a non-array value
    /// is pushed as a single element. An absent key starts as an empty array.
    Accumulate,
}

/// Declared merge policies, keyed by state key.
///
/// Built once per graph and shared by every run over it. A key written
/// without a declaration gets `Overwrite` for the lifetime of the run.
#[derive(Debug, Clone, Default)]
pub struct StateSchema {
    policies: HashMap<String, MergePolicy>,
}

impl StateSchema {
    /// Create an empty schema (every key defaults to `Overwrite`).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the merge policy for a key. Last declaration wins at build
    /// time; policies are immutable once the graph is compiled.
    pub fn declare(&mut self, key: impl Into<String>, policy: MergePolicy) {
        self.policies.insert(key.into(), policy);
    }

    /// Look up the policy for a key.
    #[must_use]
    pub fn policy(&self, key: &str) -> MergePolicy {
        self.policies.get(key).copied().unwrap_or_default()
    }
}

/// The output of one node activation: the keys it wants written.
///
/// A fragment may only contain keys the node declared as outputs; the
/// executor rejects anything else with [`Error::UndeclaredOutputKey`].
/// Entries keep insertion order so applies stay deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFragment {
    entries: Vec<(String, Value)>,
}

impl StateFragment {
    /// Create an empty fragment (a node that writes nothing this activation).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key/value entry, builder style.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.push((key.into(), value));
        self
    }

    /// Add a key/value entry.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.push((key.into(), value));
    }

    /// True if the fragment carries no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &(String, Value)> {
        self.entries.iter()
    }

    pub(crate) fn into_entries(self) -> Vec<(String, Value)> {
        self.entries
    }
}

impl FromIterator<(String, Value)> for StateFragment {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// The shared key/value state of one run.
///
/// Created by the caller with initial keys, mutated only by the executor's
/// merge step, and returned as the final state when the run terminates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    values: BTreeMap<String, Value>,
}

impl State {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a key, builder style. Only for constructing the initial state;
    /// during a run all writes go through [`State::apply`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Current value for a key. Absent reads are allowed; compute functions
    /// decide what an absent key means, the engine never treats it as an error.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Convenience accessor for string-valued keys.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// True if the key has been written.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Number of populated keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no key has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Apply one fragment under the schema's merge policies.
    ///
    /// This is the only mutation path. The executor serializes calls, so
    /// there is a total order of applies within a run even though the node
    /// computations that produced the fragments ran concurrently.
    pub fn apply(&mut self, fragment: StateFragment, schema: &StateSchema) -> Result<()> {
        for (key, value) in fragment.into_entries() {
            match schema.policy(&key) {
                MergePolicy::Overwrite => {
                    self.values.insert(key, value);
                }
                MergePolicy::Accumulate => {
                    let slot = self
                        .values
                        .entry(key)
                        .or_insert_with(|| Value::Array(Vec::new()));
                    let existing = slot.as_array_mut().ok_or_else(|| {
                        Error::InternalExecution(
                            "Accumulate key holds a non-array value".to_string(),
                        )
                    })?;
                    match value {
                        Value::Array(items) => existing.extend(items),
                        other => existing.push(other),
                    }
                }
            }
        }
        Ok(())
    }

    /// Freeze the current state into a snapshot for node execution.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            inner: Arc::new(self.clone()),
        }
    }
}

/// An immutable view of [`State`] taken at the start of a superstep.
///
/// Every node activation in a superstep reads the same snapshot; sibling
/// writes are invisible until the next superstep's merge. Cloning is cheap
/// (it bumps an `Arc`), so snapshots move freely into spawned tasks.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    inner: Arc<State>,
}

impl StateSnapshot {
    /// Current value for a key, or `None` if not yet written.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    /// Convenience accessor for string-valued keys.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.inner.get_str(key)
    }

    /// True if the key has been written.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// The underlying state, for diffing in observability hooks.
    #[must_use]
    pub fn as_state(&self) -> &State {
        &self.inner
    }
}
