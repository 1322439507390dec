//! P4Runtime front end: wire messages, the gRPC service, PI ↔ IR
//! translation, controller arbitration and the server itself.

pub mod controller;
pub mod ir;
pub mod p4info;
pub mod proto;
pub mod server;
pub mod service;
pub mod session;

pub use controller::SdnControllerManager;
pub use ir::IrP4Info;
pub use server::{P4RuntimeImpl, ServerDependencies, ServerOptions};
pub use service::{P4Runtime, P4RuntimeClient, P4RuntimeServer};
pub use session::P4RuntimeSession;
