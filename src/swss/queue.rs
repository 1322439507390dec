//! Per-table mutation queue (producer side).
//!
//! Producers append with [`MutationQueue::enqueue`], which never blocks. The
//! apply path takes entries from the head; whoever dequeues an entry owns it
//! and must apply it or report its failure. Closing the queue stops new work
//! but leaves already-queued entries drainable.

use super::FieldValues;
use crate::core::error::{HarnessError, HarnessResult};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A pending operation on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Replace the row at `key` with `fields`.
    Set { key: String, fields: FieldValues },
    /// Remove the row at `key` if present.
    Delete { key: String },
}

impl Mutation {
    /// Create a set mutation.
    pub fn set(key: impl Into<String>, fields: FieldValues) -> Self {
        Self::Set {
            key: key.into(),
            fields,
        }
    }

    /// Create a delete mutation.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into() }
    }

    /// Row key the mutation targets.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }

    /// Operation name as used on the SONiC wire ("SET" / "DEL").
    pub fn op(&self) -> &'static str {
        match self {
            Self::Set { .. } => "SET",
            Self::Delete { .. } => "DEL",
        }
    }
}

/// A mutation together with its enqueue sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMutation {
    /// Position in the table's enqueue order, starting at 1.
    pub seq: u64,
    /// The operation.
    pub mutation: Mutation,
}

/// Result of a bounded dequeue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dequeue {
    /// The head entry, now owned by the caller.
    Item(QueuedMutation),
    /// The queue stayed empty for the whole timeout.
    TimedOut,
    /// The queue is closed and fully drained.
    Closed,
}

struct QueueInner {
    table: String,
    state: Mutex<QueueState>,
    ready: Condvar,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedMutation>,
    next_seq: u64,
    closed: bool,
}

/// FIFO of mutations destined for one table.
#[derive(Clone)]
pub struct MutationQueue {
    inner: Arc<QueueInner>,
}

impl MutationQueue {
    /// Create an empty queue for the named table.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                table: table.into(),
                state: Mutex::new(QueueState::default()),
                ready: Condvar::new(),
            }),
        }
    }

    /// Table this queue feeds.
    pub fn table(&self) -> &str {
        &self.inner.table
    }

    /// Append a mutation to the tail and return its sequence number.
    pub fn enqueue(&self, mutation: Mutation) -> HarnessResult<u64> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(HarnessError::QueueClosed {
                table: self.inner.table.clone(),
            });
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        tracing::trace!(
            table = %self.inner.table,
            op = mutation.op(),
            key = %mutation.key(),
            seq,
            "mutation enqueued"
        );
        state.pending.push_back(QueuedMutation { seq, mutation });
        drop(state);
        self.inner.ready.notify_one();
        Ok(seq)
    }

    /// Take the head entry if there is one.
    pub fn try_dequeue(&self) -> Option<QueuedMutation> {
        self.inner.state.lock().pending.pop_front()
    }

    /// Take the head entry, waiting up to `timeout` for one to arrive.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Dequeue {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Dequeue::Item(item);
            }
            if state.closed {
                return Dequeue::Closed;
            }
            if Instant::now() >= deadline {
                return Dequeue::TimedOut;
            }
            let _ = self.inner.ready.wait_until(&mut state, deadline);
        }
    }

    /// Take the head entry, waiting until one arrives or the queue is closed
    /// and drained.
    pub fn dequeue_blocking(&self) -> Option<QueuedMutation> {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.inner.ready.wait(&mut state);
        }
    }

    /// Stop accepting mutations and wake any blocked consumer.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if !state.closed {
            state.closed = true;
            tracing::debug!(
                table = %self.inner.table,
                remaining = state.pending.len(),
                "mutation queue closed"
            );
        }
        drop(state);
        self.inner.ready.notify_all();
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total mutations ever accepted.
    pub fn enqueued(&self) -> u64 {
        self.inner.state.lock().next_seq
    }

    /// Copy of the queued entries, head first.
    pub fn snapshot(&self) -> Vec<QueuedMutation> {
        self.inner.state.lock().pending.iter().cloned().collect()
    }
}

impl fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationQueue")
            .field("table", &self.inner.table)
            .field("len", &self.len())
            .finish()
    }
}
