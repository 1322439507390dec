//! Producer capability backed by an in-process mutation queue.

use super::queue::{Mutation, MutationQueue};
use super::FieldValues;
use crate::core::error::HarnessResult;
use crate::sonic::adapters::ProducerStateTableAdapter;

/// Writes intended row changes into one table's [`MutationQueue`].
#[derive(Debug, Clone)]
pub struct FakeProducerStateTable {
    queue: MutationQueue,
}

impl FakeProducerStateTable {
    /// Producer for the table `queue` feeds.
    pub fn new(queue: MutationQueue) -> Self {
        Self { queue }
    }

    /// Underlying queue.
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }
}

impl ProducerStateTableAdapter for FakeProducerStateTable {
    fn table_name(&self) -> &str {
        self.queue.table()
    }

    fn set(&self, key: &str, values: FieldValues) -> HarnessResult<u64> {
        self.queue.enqueue(Mutation::set(key, values))
    }

    fn del(&self, key: &str) -> HarnessResult<u64> {
        self.queue.enqueue(Mutation::delete(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_del_enqueue_in_order() {
        let queue = MutationQueue::new("P4RT");
        let producer = FakeProducerStateTable::new(queue.clone());
        assert_eq!(producer.table_name(), "P4RT");

        producer
            .set("k", vec![("action".into(), "drop".into())])
            .unwrap();
        producer.del("k").unwrap();

        let ops: Vec<_> = queue
            .snapshot()
            .into_iter()
            .map(|q| q.mutation.op())
            .collect();
        assert_eq!(ops, vec!["SET", "DEL"]);
    }
}
