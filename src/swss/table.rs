//! In-memory table store.
//!
//! A [`SonicDbTable`] is a cheaply cloneable handle; every clone refers to the
//! same rows, so registering a table in several database groupings yields
//! views rather than copies. One lock guards the row map, which makes every
//! operation on a table linearizable with respect to the others.
//!
//! A table may be linked to a *state table*. Mutations applied through
//! [`SonicDbTable::apply`] that succeed are mirrored there, the way the
//! application-state database reflects what the switch actually accepted.

use super::notifier::{Notification, ResponseCode};
use super::queue::{Mutation, QueuedMutation};
use super::FieldValues;
use crate::core::error::{HarnessError, HarnessResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Failure the apply path reports for a key instead of applying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedResponse {
    /// Response code to report.
    pub code: ResponseCode,
    /// Detail message.
    pub message: String,
}

struct TableInner {
    name: String,
    state: Mutex<TableState>,
    state_table: Option<SonicDbTable>,
}

#[derive(Default)]
struct TableState {
    rows: BTreeMap<String, FieldValues>,
    responses: HashMap<String, InjectedResponse>,
    applied: u64,
}

/// Shared handle to one simulated table.
#[derive(Clone)]
pub struct SonicDbTable {
    inner: Arc<TableInner>,
}

impl SonicDbTable {
    /// Create an empty table.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None)
    }

    /// Create an empty table whose applied mutations are mirrored into `state_table`.
    pub fn with_state_table(name: impl Into<String>, state_table: &SonicDbTable) -> Self {
        Self::build(name.into(), Some(state_table.clone()))
    }

    fn build(name: String, state_table: Option<SonicDbTable>) -> Self {
        Self {
            inner: Arc::new(TableInner {
                name,
                state: Mutex::new(TableState::default()),
                state_table,
            }),
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Linked state table, if any.
    pub fn state_table(&self) -> Option<&SonicDbTable> {
        self.inner.state_table.as_ref()
    }

    /// Check whether two handles refer to the same table.
    pub fn same_table(&self, other: &SonicDbTable) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Replace the row at `key` with `fields`.
    pub fn set(&self, key: impl Into<String>, fields: FieldValues) {
        let key = key.into();
        tracing::trace!(table = %self.inner.name, key = %key, "row set");
        self.inner.state.lock().rows.insert(key, fields);
    }

    /// Remove the row at `key`. Returns whether a row was removed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.inner.state.lock().rows.remove(key).is_some();
        tracing::trace!(table = %self.inner.name, key = %key, removed, "row delete");
        removed
    }

    /// Current fields at `key`.
    pub fn get(&self, key: &str) -> Option<FieldValues> {
        self.inner.state.lock().rows.get(key).cloned()
    }

    /// Current fields at `key`, or a NotFound error naming the table.
    pub fn read_table_entry(&self, key: &str) -> HarnessResult<FieldValues> {
        self.get(key).ok_or_else(|| {
            HarnessError::not_found(format!("{} has no entry for key {}", self.inner.name, key))
        })
    }

    /// Value of one field at `key`.
    pub fn get_field(&self, key: &str, field: &str) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .rows
            .get(key)?
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.clone())
    }

    /// Check whether a row exists.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.state.lock().rows.contains_key(key)
    }

    /// Sorted snapshot of row keys.
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().rows.keys().cloned().collect()
    }

    /// Sorted snapshot of all rows.
    pub fn entries(&self) -> Vec<(String, FieldValues)> {
        self.inner
            .state
            .lock()
            .rows
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.inner.state.lock().rows.len()
    }

    /// Check if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every row (injected responses are kept).
    pub fn clear(&self) {
        self.inner.state.lock().rows.clear();
    }

    /// Number of mutations applied successfully through [`apply`](Self::apply).
    pub fn applied(&self) -> u64 {
        self.inner.state.lock().applied
    }

    /// Make the apply path reject mutations on `key` with `code`.
    pub fn set_response_for_key(
        &self,
        key: impl Into<String>,
        code: ResponseCode,
        message: impl Into<String>,
    ) {
        self.inner.state.lock().responses.insert(
            key.into(),
            InjectedResponse {
                code,
                message: message.into(),
            },
        );
    }

    /// Remove an injected response.
    pub fn clear_response_for_key(&self, key: &str) {
        self.inner.state.lock().responses.remove(key);
    }

    /// Apply one dequeued mutation and describe the outcome.
    ///
    /// The injected-response check and the row update happen under one lock,
    /// so readers see either the old row or the complete new one. A rejected
    /// mutation leaves both this table and its state mirror untouched.
    pub fn apply(&self, queued: &QueuedMutation) -> Notification {
        let key = queued.mutation.key().to_string();
        {
            let mut state = self.inner.state.lock();
            if let Some(response) = state.responses.get(&key) {
                if !response.code.is_success() {
                    tracing::debug!(
                        table = %self.inner.name,
                        key = %key,
                        code = %response.code,
                        "mutation rejected by injected response"
                    );
                    return Notification::failure(
                        key,
                        response.code,
                        response.message.clone(),
                        queued.seq,
                    );
                }
            }
            match &queued.mutation {
                Mutation::Set { fields, .. } => {
                    state.rows.insert(key.clone(), fields.clone());
                }
                Mutation::Delete { .. } => {
                    state.rows.remove(&key);
                }
            }
            state.applied += 1;
        }

        if let Some(mirror) = &self.inner.state_table {
            match &queued.mutation {
                Mutation::Set { fields, .. } => mirror.set(key.clone(), fields.clone()),
                Mutation::Delete { .. } => {
                    mirror.delete(&key);
                }
            }
        }

        tracing::debug!(
            table = %self.inner.name,
            op = queued.mutation.op(),
            key = %key,
            seq = queued.seq,
            "mutation applied"
        );
        Notification::success(key, queued.seq)
    }
}

impl fmt::Debug for SonicDbTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SonicDbTable")
            .field("name", &self.inner.name)
            .field("rows", &self.len())
            .finish()
    }
}
