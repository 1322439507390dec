//! Simulated SONiC database layer.
//!
//! Stands in for the Redis-backed producer/consumer protocol: producers
//! enqueue intended row changes, an apply path commits them to in-memory
//! tables and posts one acknowledgment per change, and consumers block on
//! those acknowledgments.

pub mod applier;
pub mod connector;
pub mod notifier;
pub mod producer;
pub mod queue;
pub mod table;

pub use applier::{Applier, ApplyWorker};
pub use connector::FakeDbConnector;
pub use notifier::{AckChannel, FakeConsumerNotifier, Notification, ResponseCode, WaitOutcome};
pub use producer::FakeProducerStateTable;
pub use queue::{Dequeue, Mutation, MutationQueue, QueuedMutation};
pub use table::SonicDbTable;

/// One field of a row.
pub type FieldValue = (String, String);

/// Ordered fields of a row.
pub type FieldValues = Vec<FieldValue>;
