//! Packet I/O boundary.
//!
//! The server sends controller packets out through [`PacketIoInterface`] and
//! receives punted packets from the channel returned by `start_receive`.
//! [`FakePacketIo`] records packets out per port and lets tests inject
//! packets in.

use crate::core::error::{HarnessError, HarnessResult};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Port name packets are sent to when the controller asks for ingress submission.
pub const SUBMIT_TO_INGRESS_PORT: &str = "send_to_ingress";

/// A packet punted to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Port the packet arrived on.
    pub source_port: String,
    /// Port the pipeline would have sent it to.
    pub target_port: String,
    /// Raw packet bytes.
    pub payload: Bytes,
}

/// Packet channel capability used by the server.
pub trait PacketIoInterface: Send + Sync {
    /// Transmit `payload` on `port`.
    fn send_packet_out(&self, port: &str, payload: Bytes) -> HarnessResult<()>;

    /// Start receiving punted packets. May be called once.
    fn start_receive(
        &self,
        use_genetlink: bool,
    ) -> HarnessResult<mpsc::UnboundedReceiver<ReceivedPacket>>;
}

#[derive(Default)]
struct PacketIoState {
    packets_out: BTreeMap<String, Vec<Bytes>>,
    known_ports: Option<BTreeSet<String>>,
    receiver: Option<mpsc::UnboundedSender<ReceivedPacket>>,
    use_genetlink: Option<bool>,
}

/// In-process packet channel.
#[derive(Clone, Default)]
pub struct FakePacketIo {
    state: Arc<Mutex<PacketIoState>>,
}

impl FakePacketIo {
    /// Channel accepting packets out on any port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict packets out to the listed ports.
    pub fn with_ports<I, S>(ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let io = Self::default();
        io.state.lock().known_ports = Some(ports.into_iter().map(Into::into).collect());
        io
    }

    /// Drain packets sent out on `port`, oldest first.
    pub fn take_packets_out(&self, port: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .packets_out
            .remove(port)
            .unwrap_or_default()
    }

    /// Number of packets sent out on `port` and not yet taken.
    pub fn packets_out_count(&self, port: &str) -> usize {
        self.state
            .lock()
            .packets_out
            .get(port)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Inject a punted packet. Fails if receive has not started.
    pub fn push_packet_in(
        &self,
        source_port: impl Into<String>,
        target_port: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> HarnessResult<()> {
        let state = self.state.lock();
        let sender = state.receiver.as_ref().ok_or_else(|| {
            HarnessError::failed_precondition("packet receive has not been started")
        })?;
        sender
            .send(ReceivedPacket {
                source_port: source_port.into(),
                target_port: target_port.into(),
                payload: payload.into(),
            })
            .map_err(|_| HarnessError::Unavailable {
                message: "packet receiver is gone".to_string(),
            })
    }

    /// Receive mode requested by the server, once receive has started.
    pub fn receive_mode(&self) -> Option<bool> {
        self.state.lock().use_genetlink
    }
}

impl PacketIoInterface for FakePacketIo {
    fn send_packet_out(&self, port: &str, payload: Bytes) -> HarnessResult<()> {
        let mut state = self.state.lock();
        if let Some(ports) = &state.known_ports {
            if port != SUBMIT_TO_INGRESS_PORT && !ports.contains(port) {
                return Err(HarnessError::invalid_argument(format!(
                    "unknown egress port: {}",
                    port
                )));
            }
        }
        tracing::debug!(port = %port, len = payload.len(), "packet out");
        state
            .packets_out
            .entry(port.to_string())
            .or_default()
            .push(payload);
        Ok(())
    }

    fn start_receive(
        &self,
        use_genetlink: bool,
    ) -> HarnessResult<mpsc::UnboundedReceiver<ReceivedPacket>> {
        let mut state = self.state.lock();
        if state.receiver.is_some() {
            return Err(HarnessError::failed_precondition(
                "packet receive already started",
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.receiver = Some(tx);
        state.use_genetlink = Some(use_genetlink);
        tracing::debug!(use_genetlink, "packet receive started");
        Ok(rx)
    }
}

impl std::fmt::Debug for FakePacketIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakePacketIo")
            .field("ports_with_output", &state.packets_out.len())
            .field("receiving", &state.receiver.is_some())
            .finish()
    }
}
