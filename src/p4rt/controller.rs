//! SDN controller arbitration.
//!
//! Several controllers may hold stream connections to the device. The one
//! with the highest election id is the primary: only it may write or change
//! the pipeline, and it alone receives packet-ins. Every change of primary
//! is announced to all connections.

use super::proto::{
    self, stream_message_response, MasterArbitrationUpdate, RpcStatus, StreamMessageResponse,
    Uint128,
};
use crate::core::error::{HarnessError, HarnessResult};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tonic::{Code, Status};

/// Outbound half of a controller's stream.
pub type StreamSender = mpsc::UnboundedSender<Result<StreamMessageResponse, Status>>;

/// Identifier the server assigns to each stream.
pub type ConnectionId = u64;

struct Connection {
    election_id: Option<Uint128>,
    role: Option<proto::Role>,
    sender: StreamSender,
}

/// Tracks controller connections for one device.
pub struct SdnControllerManager {
    device_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
}

impl SdnControllerManager {
    /// Manager for `device_id`.
    pub fn new(device_id: u64) -> Self {
        Self {
            device_id,
            connections: BTreeMap::new(),
        }
    }

    /// Register or update a connection from an arbitration message.
    pub fn handle_arbitration(
        &mut self,
        connection: ConnectionId,
        update: &MasterArbitrationUpdate,
        sender: &StreamSender,
    ) -> HarnessResult<()> {
        if update.device_id != self.device_id {
            return Err(HarnessError::invalid_argument(format!(
                "arbitration for device {} but this device is {}",
                update.device_id, self.device_id
            )));
        }
        if let Some(election_id) = update.election_id {
            let taken = self
                .connections
                .iter()
                .any(|(id, c)| *id != connection && c.election_id == Some(election_id));
            if taken {
                return Err(HarnessError::invalid_argument(format!(
                    "election id {} is already used by another connection",
                    election_id.as_u128()
                )));
            }
        }

        let previous = self.primary_connection();
        self.connections.insert(
            connection,
            Connection {
                election_id: update.election_id,
                role: update.role.clone(),
                sender: sender.clone(),
            },
        );
        let current = self.primary_connection();
        tracing::info!(
            connection,
            election_id = update.election_id.map(|e| e.as_u128()).unwrap_or(0) as u64,
            primary = current == Some(connection),
            "controller arbitration"
        );

        if previous != current {
            self.notify_all();
        } else {
            self.notify(connection);
        }
        Ok(())
    }

    /// Forget a connection. Returns whether it was registered.
    pub fn disconnect(&mut self, connection: ConnectionId) -> bool {
        let previous = self.primary_connection();
        let removed = self.connections.remove(&connection).is_some();
        if removed {
            tracing::info!(connection, "controller disconnected");
            if previous == Some(connection) {
                self.notify_all();
            }
        }
        removed
    }

    /// Highest election id among live connections.
    pub fn primary_election_id(&self) -> Option<Uint128> {
        self.connections.values().filter_map(|c| c.election_id).max()
    }

    fn primary_connection(&self) -> Option<ConnectionId> {
        let primary = self.primary_election_id()?;
        self.connections
            .iter()
            .find(|(_, c)| c.election_id == Some(primary))
            .map(|(id, _)| *id)
    }

    /// Whether a request carrying `election_id` comes from the primary.
    pub fn is_primary(&self, election_id: Option<Uint128>) -> bool {
        match (election_id, self.primary_election_id()) {
            (Some(requested), Some(primary)) => requested == primary,
            _ => false,
        }
    }

    /// Whether `connection` is the primary stream.
    pub fn is_primary_connection(&self, connection: ConnectionId) -> bool {
        self.primary_connection() == Some(connection)
    }

    /// Fail unless `election_id` belongs to the primary.
    pub fn check_primary(&self, election_id: Option<Uint128>) -> HarnessResult<()> {
        if self.is_primary(election_id) {
            Ok(())
        } else {
            Err(HarnessError::permission_denied(
                "only the primary connection can issue this request",
            ))
        }
    }

    /// Send a message on the primary stream. Returns whether it was sent.
    pub fn send_to_primary(&self, message: StreamMessageResponse) -> bool {
        let Some(primary) = self.primary_connection() else {
            return false;
        };
        self.send_to(primary, message)
    }

    /// Send a message on one stream. Returns whether it was sent.
    pub fn send_to(&self, connection: ConnectionId, message: StreamMessageResponse) -> bool {
        match self.connections.get(&connection) {
            Some(c) => c.sender.send(Ok(message)).is_ok(),
            None => false,
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn notify_all(&self) {
        for id in self.connections.keys() {
            self.notify(*id);
        }
    }

    fn notify(&self, connection: ConnectionId) {
        let Some(c) = self.connections.get(&connection) else {
            return;
        };
        let primary = self.primary_election_id();
        let (code, message) = match primary {
            Some(p) if c.election_id == Some(p) => (Code::Ok, "you are the primary connection"),
            Some(_) => (Code::AlreadyExists, "you are a backup connection"),
            None => (Code::NotFound, "there is no primary connection"),
        };
        let update = MasterArbitrationUpdate {
            device_id: self.device_id,
            role: c.role.clone(),
            election_id: primary,
            status: Some(RpcStatus {
                code: code as i32,
                message: message.to_string(),
            }),
        };
        let _ = c.sender.send(Ok(StreamMessageResponse {
            update: Some(stream_message_response::Update::Arbitration(update)),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE: u64 = 7;

    fn arbitration(election: u64) -> MasterArbitrationUpdate {
        MasterArbitrationUpdate {
            device_id: DEVICE,
            role: None,
            election_id: Some(Uint128::from_low(election)),
            status: None,
        }
    }

    fn status_code(rx: &mut mpsc::UnboundedReceiver<Result<StreamMessageResponse, Status>>) -> i32 {
        match rx.try_recv().unwrap().unwrap().update {
            Some(stream_message_response::Update::Arbitration(a)) => a.status.unwrap().code,
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_highest_election_id_is_primary() {
        let mut manager = SdnControllerManager::new(DEVICE);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        manager.handle_arbitration(1, &arbitration(10), &tx1).unwrap();
        assert_eq!(status_code(&mut rx1), Code::Ok as i32);

        manager.handle_arbitration(2, &arbitration(20), &tx2).unwrap();
        assert_eq!(status_code(&mut rx1), Code::AlreadyExists as i32);
        assert_eq!(status_code(&mut rx2), Code::Ok as i32);
        assert!(manager.is_primary(Some(Uint128::from_low(20))));
        assert!(manager.check_primary(Some(Uint128::from_low(10))).is_err());

        assert!(manager.disconnect(2));
        assert_eq!(status_code(&mut rx1), Code::Ok as i32);
        assert!(manager.is_primary_connection(1));
    }

    #[test]
    fn test_duplicate_election_id_rejected() {
        let mut manager = SdnControllerManager::new(DEVICE);
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.handle_arbitration(1, &arbitration(5), &tx).unwrap();
        assert!(manager.handle_arbitration(2, &arbitration(5), &tx).is_err());
        // Re-sending the same id on the same connection is fine.
        assert!(manager.handle_arbitration(1, &arbitration(5), &tx).is_ok());
    }

    #[test]
    fn test_wrong_device_rejected() {
        let mut manager = SdnControllerManager::new(DEVICE);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut update = arbitration(1);
        update.device_id = DEVICE + 1;
        assert!(matches!(
            manager.handle_arbitration(1, &update, &tx),
            Err(HarnessError::InvalidArgument { .. })
        ));
        assert_eq!(manager.connection_count(), 0);
    }
}
