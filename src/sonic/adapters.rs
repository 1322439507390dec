//! Capabilities the P4Runtime server needs from the SONiC databases.
//!
//! The server only sees these traits; the harness supplies in-process fakes.

use crate::core::error::HarnessResult;
use crate::swss::notifier::WaitOutcome;
use crate::swss::FieldValues;
use std::time::Duration;

/// Read access to one logical database.
pub trait DbConnectorAdapter: Send + Sync {
    /// Whether `table` is registered.
    fn has_table(&self, table: &str) -> bool;

    /// Sorted row keys of `table`.
    fn keys(&self, table: &str) -> HarnessResult<Vec<String>>;

    /// Fields of one row.
    fn get(&self, table: &str, key: &str) -> HarnessResult<Option<FieldValues>>;

    /// Whether a row exists.
    fn exists(&self, table: &str, key: &str) -> HarnessResult<bool>;
}

/// Write side of the producer/consumer protocol for one table.
pub trait ProducerStateTableAdapter: Send + Sync {
    /// Table the producer writes.
    fn table_name(&self) -> &str;

    /// Request that `key` be replaced with `values`. Returns the sequence number.
    fn set(&self, key: &str, values: FieldValues) -> HarnessResult<u64>;

    /// Request that `key` be removed. Returns the sequence number.
    fn del(&self, key: &str) -> HarnessResult<u64>;
}

/// Acknowledgment side of the producer/consumer protocol for one table.
pub trait ConsumerNotifierAdapter: Send + Sync {
    /// Block for the next acknowledgment, up to `timeout`.
    fn wait_for_notification(&self, timeout: Duration) -> WaitOutcome;
}
