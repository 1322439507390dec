//! P4RT harness - P4Runtime component tests over simulated SONiC databases.
//!
//! The harness runs a real P4Runtime gRPC server on loopback and points it at
//! in-process fakes of the SONiC Redis databases. Tests drive the server over
//! the wire and then inspect, step or fail the fakes directly.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    P4Runtime client (test)                      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ gRPC (loopback, plaintext)
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      P4Runtime server                           │
//! │     arbitration │ PI ↔ IR ↔ AppDb │ VRF refcounts │ packet I/O   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │ adapter traits
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Simulated SONiC DBs                         │
//! │   producer queues │ apply paths │ tables │ acknowledgments      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::error`] - Error types and gRPC mapping
//!
//! ## Simulated databases
//! - [`swss::table`] - Keyed tables with state mirrors and failure injection
//! - [`swss::queue`] - Per-table FIFO of pending mutations
//! - [`swss::notifier`] - Per-table acknowledgment channel
//! - [`swss::applier`] - Apply path, stepped or run by a worker
//! - [`swss::connector`] - Database groupings of tables
//!
//! ## Server under test
//! - [`sonic::adapters`] - Capability traits the server is written against
//! - [`sonic::app_db`] - IR ↔ AppDb row translation
//! - [`sonic::packetio`] - Packet channel
//! - [`p4rt::server`] - The P4Runtime server
//! - [`p4rt::service`] - gRPC service and client plumbing
//! - [`sai`] - Fixed SAI tables
//!
//! ## Harness
//! - [`harness`] - Lifecycle owner of all of the above

pub mod cli;
pub mod core;
pub mod harness;
pub mod p4rt;
pub mod sai;
pub mod sonic;
pub mod swss;

pub use self::core::{config, error};
pub use harness::{Harness, HarnessState};
