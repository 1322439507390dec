//! Seams between the P4Runtime server and the switch software.

pub mod adapters;
pub mod app_db;
pub mod packetio;

pub use adapters::{ConsumerNotifierAdapter, DbConnectorAdapter, ProducerStateTableAdapter};
pub use packetio::{FakePacketIo, PacketIoInterface, ReceivedPacket};
