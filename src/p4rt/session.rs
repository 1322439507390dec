//! Controller-side session used to drive the server from tests and tools.
//!
//! A session opens the stream channel, wins arbitration with its election
//! id and then stamps its device and election ids on every request.

use super::proto::{
    self, stream_message_request, stream_message_response, update::Type as UpdateType, Uint128,
};
use super::service::P4RuntimeClient;
use crate::core::error::{HarnessError, HarnessResult};
use crate::p4rt::p4info::P4Info;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Code, Status, Streaming};

/// How long [`P4RuntimeSession::connect`] waits for arbitration.
pub const ARBITRATION_TIMEOUT: Duration = Duration::from_secs(5);

/// A primary controller connection.
pub struct P4RuntimeSession {
    client: P4RuntimeClient,
    device_id: u64,
    election_id: Uint128,
    outbound: mpsc::UnboundedSender<proto::StreamMessageRequest>,
    inbound: Streaming<proto::StreamMessageResponse>,
}

impl P4RuntimeSession {
    /// Connect to `addr` (`host:port`) and become primary for `device_id`.
    pub async fn connect(
        addr: impl std::fmt::Display,
        device_id: u64,
        election_id: Uint128,
    ) -> HarnessResult<Self> {
        let mut client = P4RuntimeClient::connect(&addr)
            .await
            .map_err(|e| HarnessError::Transport {
                message: format!("connect to {}: {}", addr, e),
            })?;
        let (outbound, rx) = mpsc::unbounded_channel();
        outbound
            .send(arbitration(device_id, election_id))
            .map_err(|_| HarnessError::internal("stream request channel closed"))?;
        let inbound = client
            .stream_channel(UnboundedReceiverStream::new(rx))
            .await
            .map_err(status_error)?
            .into_inner();

        let mut session = Self {
            client,
            device_id,
            election_id,
            outbound,
            inbound,
        };
        session.await_arbitration().await?;
        tracing::debug!(%addr, device_id, "session is primary");
        Ok(session)
    }

    async fn await_arbitration(&mut self) -> HarnessResult<()> {
        loop {
            let message = self.next_message(ARBITRATION_TIMEOUT).await?.ok_or_else(|| {
                HarnessError::DeadlineExceeded {
                    message: "no arbitration response".to_string(),
                }
            })?;
            if let Some(stream_message_response::Update::Arbitration(update)) = message.update {
                let code = update.status.map(|s| s.code).unwrap_or(Code::Unknown as i32);
                if code == Code::Ok as i32 {
                    return Ok(());
                }
                return Err(HarnessError::failed_precondition(format!(
                    "session did not become primary (status {})",
                    code
                )));
            }
        }
    }

    /// Device id the session addresses.
    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    /// Election id the session won with.
    pub fn election_id(&self) -> Uint128 {
        self.election_id
    }

    /// Raw client, for requests the session does not wrap.
    pub fn client(&mut self) -> &mut P4RuntimeClient {
        &mut self.client
    }

    /// Send a write batch.
    pub async fn write(&mut self, updates: Vec<proto::Update>) -> Result<(), Status> {
        let request = proto::WriteRequest {
            device_id: self.device_id,
            election_id: Some(self.election_id),
            updates,
            ..Default::default()
        };
        self.client.write(request).await?;
        Ok(())
    }

    /// Write one table entry with the given update type.
    pub async fn write_entry(
        &mut self,
        kind: UpdateType,
        entry: proto::TableEntry,
    ) -> Result<(), Status> {
        self.write(vec![update(kind, entry)]).await
    }

    /// Read table entries. `table_id` 0 reads every table.
    pub async fn read_table_entries(
        &mut self,
        table_id: u32,
        with_counters: bool,
    ) -> Result<Vec<proto::TableEntry>, Status> {
        let filter = proto::TableEntry {
            table_id,
            counter_data: with_counters.then(proto::CounterData::default),
            ..Default::default()
        };
        let request = proto::ReadRequest {
            device_id: self.device_id,
            entities: vec![proto::Entity::table_entry(filter)],
            ..Default::default()
        };
        let mut stream = self.client.read(request).await?.into_inner();
        let mut entries = Vec::new();
        while let Some(response) = stream.message().await? {
            entries.extend(
                response
                    .entities
                    .into_iter()
                    .filter_map(|e| e.as_table_entry().cloned()),
            );
        }
        Ok(entries)
    }

    /// Install `p4info` as the forwarding pipeline.
    pub async fn set_forwarding_pipeline_config(&mut self, p4info: P4Info) -> Result<(), Status> {
        let request = proto::SetForwardingPipelineConfigRequest {
            device_id: self.device_id,
            election_id: Some(self.election_id),
            action: proto::set_forwarding_pipeline_config_request::Action::VerifyAndCommit as i32,
            config: Some(proto::ForwardingPipelineConfig {
                p4info: Some(p4info),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.client.set_forwarding_pipeline_config(request).await?;
        Ok(())
    }

    /// Queue a packet-out on the stream channel.
    pub fn send_packet_out(&self, packet: proto::PacketOut) -> HarnessResult<()> {
        self.outbound
            .send(proto::StreamMessageRequest {
                update: Some(stream_message_request::Update::Packet(packet)),
            })
            .map_err(|_| HarnessError::internal("stream request channel closed"))
    }

    /// Next message on the stream channel. `None` if the stream ended.
    pub async fn next_message(
        &mut self,
        timeout: Duration,
    ) -> HarnessResult<Option<proto::StreamMessageResponse>> {
        match tokio::time::timeout(timeout, self.inbound.message()).await {
            Ok(result) => result.map_err(status_error),
            Err(_) => Err(HarnessError::DeadlineExceeded {
                message: format!("no stream message within {:?}", timeout),
            }),
        }
    }
}

/// Build an update.
pub fn update(kind: UpdateType, entry: proto::TableEntry) -> proto::Update {
    proto::Update {
        r#type: kind as i32,
        entity: Some(proto::Entity::table_entry(entry)),
    }
}

fn arbitration(device_id: u64, election_id: Uint128) -> proto::StreamMessageRequest {
    proto::StreamMessageRequest {
        update: Some(stream_message_request::Update::Arbitration(
            proto::MasterArbitrationUpdate {
                device_id,
                role: None,
                election_id: Some(election_id),
                status: None,
            },
        )),
    }
}

fn status_error(status: Status) -> HarnessError {
    HarnessError::Transport {
        message: format!("{:?}: {}", status.code(), status.message()),
    }
}
