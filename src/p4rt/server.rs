//! P4Runtime server backed by the SONiC databases.
//!
//! Writes are translated PI → IR → AppDb rows, handed to the P4RT producer,
//! and answered only once the apply path acknowledges every row. Reads
//! translate the AppDb rows back. The server never touches a table directly:
//! it sees the databases only through the capability traits in
//! [`crate::sonic::adapters`] and the packet channel through
//! [`PacketIoInterface`].

use super::controller::{ConnectionId, SdnControllerManager, StreamSender};
use super::ir::{self, ActionRequirement, IrP4Info, IrTableEntry};
use super::proto::{
    self, get_forwarding_pipeline_config_request::ResponseType,
    set_forwarding_pipeline_config_request::Action as PipelineAction, stream_message_request,
    stream_message_response, update::Type as UpdateType,
};
use super::service::{P4Runtime, ResponseStream};
use crate::core::config::{HarnessConfig, TableNames};
use crate::core::error::{GrpcErrorMapping, HarnessError, HarnessResult};
use crate::sonic::adapters::{ConsumerNotifierAdapter, DbConnectorAdapter, ProducerStateTableAdapter};
use crate::sonic::app_db;
use crate::sonic::packetio::{PacketIoInterface, ReceivedPacket, SUBMIT_TO_INGRESS_PORT};
use crate::swss::notifier::WaitOutcome;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Code, Request, Response, Status, Streaming};

/// P4Runtime API version reported by `Capabilities`.
pub const P4RUNTIME_API_VERSION: &str = "1.3.0";

/// Tables routes reference VRFs from.
const ROUTE_TABLES: [&str; 2] = ["ipv4_table", "ipv6_table"];

/// Fields written for each VRF the server creates.
const VRF_FIELDS: [(&str, &str); 2] = [("v4", "true"), ("v6", "true")];

/// Everything the server is built from.
pub struct ServerDependencies {
    /// Application DB: P4RT, PORT_TABLE and VRF_TABLE.
    pub app_db: Box<dyn DbConnectorAdapter>,
    /// Application-state DB: state mirrors of P4RT and VRF_TABLE.
    pub app_state_db: Box<dyn DbConnectorAdapter>,
    /// Counters DB.
    pub counters_db: Box<dyn DbConnectorAdapter>,
    /// Producer for P4RT rows.
    pub p4rt_producer: Box<dyn ProducerStateTableAdapter>,
    /// Acknowledgments for P4RT rows.
    pub p4rt_notifier: Box<dyn ConsumerNotifierAdapter>,
    /// Producer for VRF rows.
    pub vrf_producer: Box<dyn ProducerStateTableAdapter>,
    /// Acknowledgments for VRF rows.
    pub vrf_notifier: Box<dyn ConsumerNotifierAdapter>,
    /// Packet channel.
    pub packetio: Box<dyn PacketIoInterface>,
}

/// Server behaviour switches.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerOptions {
    /// Device id requests must carry.
    pub device_id: u64,
    /// Receive packets through the generic-netlink model.
    pub use_genetlink: bool,
    /// Translate controller port ids to SONiC port names.
    pub translate_port_ids: bool,
    /// Wait bound for each acknowledgment.
    pub response_timeout: Duration,
    /// Table names.
    pub tables: TableNames,
}

impl ServerOptions {
    /// Options taken from the harness configuration.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            device_id: config.server.device_id,
            use_genetlink: config.server.use_genetlink,
            translate_port_ids: config.server.translate_port_ids,
            response_timeout: config.response_timeout(),
            tables: config.tables.clone(),
        }
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from_config(&HarnessConfig::default())
    }
}

/// Installed forwarding pipeline.
struct Pipeline {
    config: proto::ForwardingPipelineConfig,
    ir: IrP4Info,
}

/// State touched only while a write or pipeline change is in progress.
#[derive(Default)]
struct WriteState {
    /// Routes per VRF, for the VRFs this server created.
    vrf_refs: HashMap<String, usize>,
}

/// Outcome of one update in a batch.
#[derive(Debug, Clone, PartialEq)]
struct UpdateStatus {
    code: Code,
    message: String,
}

impl UpdateStatus {
    fn ok() -> Self {
        Self {
            code: Code::Ok,
            message: String::new(),
        }
    }

    fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<HarnessError> for UpdateStatus {
    fn from(e: HarnessError) -> Self {
        Self {
            code: GrpcErrorMapping::to_grpc_code(&e),
            message: e.message(),
        }
    }
}

/// An update that passed validation and will be enqueued.
struct PreparedUpdate {
    index: usize,
    kind: UpdateType,
    key: String,
    values: Vec<(String, String)>,
    vrf: Option<String>,
}

/// Bidirectional SONiC port name ↔ controller id map.
#[derive(Debug, Default)]
struct PortTranslation {
    id_to_name: HashMap<String, String>,
    name_to_id: HashMap<String, String>,
}

struct ServerInner {
    options: ServerOptions,
    deps: ServerDependencies,
    pipeline: RwLock<Option<Arc<Pipeline>>>,
    write_state: Mutex<WriteState>,
    controllers: Mutex<SdnControllerManager>,
    next_connection: AtomicU64,
}

/// The P4Runtime service under test.
#[derive(Clone)]
pub struct P4RuntimeImpl {
    inner: Arc<ServerInner>,
}

impl P4RuntimeImpl {
    /// Build a server. Fails if a database lacks a table the server needs.
    pub fn new(deps: ServerDependencies, options: ServerOptions) -> HarnessResult<Self> {
        let tables = &options.tables;
        let required: [(&str, &dyn DbConnectorAdapter, &str); 6] = [
            ("APPL_DB", deps.app_db.as_ref(), &tables.p4rt),
            ("APPL_DB", deps.app_db.as_ref(), &tables.port),
            ("APPL_DB", deps.app_db.as_ref(), &tables.vrf),
            ("APPL_STATE_DB", deps.app_state_db.as_ref(), &tables.p4rt),
            ("APPL_STATE_DB", deps.app_state_db.as_ref(), &tables.vrf),
            ("COUNTERS_DB", deps.counters_db.as_ref(), &tables.counters),
        ];
        for (db, connector, table) in required {
            if !connector.has_table(table) {
                return Err(HarnessError::MissingTable {
                    table: format!("{}/{}", db, table),
                });
            }
        }
        tracing::info!(
            device_id = options.device_id,
            use_genetlink = options.use_genetlink,
            translate_port_ids = options.translate_port_ids,
            "P4Runtime server created"
        );
        Ok(Self {
            inner: Arc::new(ServerInner {
                controllers: Mutex::new(SdnControllerManager::new(options.device_id)),
                options,
                deps,
                pipeline: RwLock::new(None),
                write_state: Mutex::new(WriteState::default()),
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    /// Server options.
    pub fn options(&self) -> &ServerOptions {
        &self.inner.options
    }

    /// Whether a forwarding pipeline is installed.
    pub fn has_pipeline(&self) -> bool {
        self.inner.pipeline.read().is_some()
    }

    /// Number of live controller streams.
    pub fn connection_count(&self) -> usize {
        self.inner.controllers.lock().connection_count()
    }

    /// Start the packet channel's receive side.
    pub fn start_receive(&self) -> HarnessResult<mpsc::UnboundedReceiver<ReceivedPacket>> {
        self.inner
            .deps
            .packetio
            .start_receive(self.inner.options.use_genetlink)
    }

    /// Forward punted packets to the primary controller until the channel closes.
    pub async fn forward_packet_ins(self, mut packets: mpsc::UnboundedReceiver<ReceivedPacket>) {
        while let Some(packet) = packets.recv().await {
            match self.inner.packet_in(&packet) {
                Ok(Some(message)) => {
                    if !self.inner.controllers.lock().send_to_primary(message) {
                        tracing::debug!(port = %packet.source_port, "packet-in dropped: no primary");
                    }
                }
                Ok(None) => {
                    tracing::debug!(port = %packet.source_port, "packet-in dropped: no pipeline");
                }
                Err(e) => {
                    tracing::warn!(port = %packet.source_port, error = %e, "packet-in dropped");
                }
            }
        }
        tracing::debug!("packet-in forwarding stopped");
    }
}

impl ServerInner {
    fn check_device(&self, device_id: u64) -> HarnessResult<()> {
        if device_id != self.options.device_id {
            return Err(HarnessError::invalid_argument(format!(
                "request is for device {} but this device is {}",
                device_id, self.options.device_id
            )));
        }
        Ok(())
    }

    fn current_pipeline(&self) -> HarnessResult<Arc<Pipeline>> {
        self.pipeline.read().clone().ok_or_else(|| {
            HarnessError::failed_precondition("no forwarding pipeline config has been pushed")
        })
    }

    fn port_translation(&self) -> HarnessResult<PortTranslation> {
        let mut ports = PortTranslation::default();
        if !self.options.translate_port_ids {
            return Ok(ports);
        }
        let table = &self.options.tables.port;
        for name in self.deps.app_db.keys(table)? {
            let Some(fields) = self.deps.app_db.get(table, &name)? else {
                continue;
            };
            if let Some((_, id)) = fields.iter().find(|(field, _)| field == "id") {
                ports.id_to_name.insert(id.clone(), name.clone());
                ports.name_to_id.insert(name, id.clone());
            }
        }
        Ok(ports)
    }

    fn port_name(&self, ports: &PortTranslation, id: &str) -> HarnessResult<String> {
        if !self.options.translate_port_ids {
            return Ok(id.to_string());
        }
        ports
            .id_to_name
            .get(id)
            .cloned()
            .ok_or_else(|| HarnessError::invalid_argument(format!("unknown port id '{}'", id)))
    }

    fn port_id(&self, ports: &PortTranslation, name: &str) -> HarnessResult<String> {
        if !self.options.translate_port_ids {
            return Ok(name.to_string());
        }
        ports
            .name_to_id
            .get(name)
            .cloned()
            .ok_or_else(|| HarnessError::internal(format!("port {} has no configured id", name)))
    }

    // ------------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn write(&self, request: proto::WriteRequest) -> Result<proto::WriteResponse, Status> {
        self.check_device(request.device_id)?;
        self.controllers.lock().check_primary(request.election_id)?;

        let mut write_state = self.write_state.lock();
        let pipeline = self.current_pipeline()?;
        if request.updates.is_empty() {
            return Ok(proto::WriteResponse {});
        }
        let ports = self.port_translation()?;
        let p4rt_table = &self.options.tables.p4rt;

        let mut results: Vec<Option<UpdateStatus>> = vec![None; request.updates.len()];
        let mut prepared = Vec::new();
        let mut batch_keys = HashSet::new();
        for (index, update) in request.updates.iter().enumerate() {
            let outcome = self
                .prepare_update(&pipeline.ir, &ports, index, update)
                .and_then(|p| {
                    if !batch_keys.insert(p.key.clone()) {
                        return Err(HarnessError::invalid_argument(format!(
                            "entry appears more than once in the batch: {}",
                            p.key
                        )));
                    }
                    let exists = self.deps.app_db.exists(p4rt_table, &p.key)?;
                    match p.kind {
                        UpdateType::Insert if exists => Err(HarnessError::already_exists(
                            format!("entry already exists: {}", p.key),
                        )),
                        UpdateType::Modify | UpdateType::Delete if !exists => Err(
                            HarnessError::not_found(format!("entry does not exist: {}", p.key)),
                        ),
                        _ => Ok(p),
                    }
                });
            match outcome {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    tracing::debug!(update = index + 1, error = %e, "update rejected");
                    results[index] = Some(e.into());
                }
            }
        }

        let created_vrfs = self.create_missing_vrfs(&mut write_state, &mut prepared, &mut results);

        let mut enqueued = Vec::with_capacity(prepared.len());
        for p in prepared {
            let sent = match p.kind {
                UpdateType::Delete => self.deps.p4rt_producer.del(&p.key),
                _ => self.deps.p4rt_producer.set(&p.key, p.values.clone()),
            };
            match sent {
                Ok(seq) => enqueued.push((seq, p)),
                Err(e) => results[p.index] = Some(e.into()),
            }
        }

        let mut timed_out = false;
        for (seq, p) in &enqueued {
            if timed_out {
                results[p.index] = Some(UpdateStatus::from(HarnessError::DeadlineExceeded {
                    message: "abandoned after an earlier acknowledgment timed out".to_string(),
                }));
                continue;
            }
            let status = match self.wait_for_ack(self.deps.p4rt_notifier.as_ref(), &p.key, *seq) {
                Some(status) => status,
                None => {
                    timed_out = true;
                    UpdateStatus::from(HarnessError::DeadlineExceeded {
                        message: format!("no acknowledgment for {}", p.key),
                    })
                }
            };
            if status.is_ok() {
                if let Some(vrf) = &p.vrf {
                    match p.kind {
                        UpdateType::Insert => {
                            if let Some(count) = write_state.vrf_refs.get_mut(vrf) {
                                *count += 1;
                            }
                        }
                        UpdateType::Delete => {
                            if let Some(count) = write_state.vrf_refs.get_mut(vrf) {
                                *count = count.saturating_sub(1);
                            }
                        }
                        _ => {}
                    }
                }
            }
            results[p.index] = Some(status);
        }

        // VRFs nothing references any more, including ones created for
        // routes that then failed.
        let mut unused: BTreeSet<String> = created_vrfs;
        unused.extend(
            write_state
                .vrf_refs
                .iter()
                .filter(|(_, count)| **count == 0)
                .map(|(vrf, _)| vrf.clone()),
        );
        for vrf in unused {
            if write_state.vrf_refs.get(&vrf).copied().unwrap_or(0) == 0 {
                write_state.vrf_refs.remove(&vrf);
                self.remove_vrf(&vrf);
            }
        }
        drop(write_state);

        let statuses: Vec<UpdateStatus> = results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| UpdateStatus::from(HarnessError::internal("update was not processed")))
            })
            .collect();
        if statuses.iter().all(UpdateStatus::is_ok) {
            return Ok(proto::WriteResponse {});
        }
        let mut message = String::from("Batch failed, individual results:");
        for (i, status) in statuses.iter().enumerate() {
            if status.is_ok() {
                message.push_str(&format!("\n#{}: OK", i + 1));
            } else {
                message.push_str(&format!(
                    "\n#{}: {}: {}",
                    i + 1,
                    GrpcErrorMapping::code_name(status.code),
                    status.message
                ));
            }
        }
        tracing::debug!(%message, "write batch failed");
        Err(Status::new(Code::Unknown, message))
    }

    fn prepare_update(
        &self,
        info: &IrP4Info,
        ports: &PortTranslation,
        index: usize,
        update: &proto::Update,
    ) -> HarnessResult<PreparedUpdate> {
        let kind = UpdateType::try_from(update.r#type).unwrap_or(UpdateType::Unspecified);
        if kind == UpdateType::Unspecified {
            return Err(HarnessError::invalid_argument("update type is unspecified"));
        }
        let entry = update
            .entity
            .as_ref()
            .and_then(|e| e.as_table_entry())
            .ok_or_else(|| HarnessError::unimplemented("only table entries can be written"))?;

        let requirement = if kind == UpdateType::Delete {
            ActionRequirement::Optional
        } else {
            ActionRequirement::Required
        };
        let mut ir_entry = ir::pi_to_ir(info, entry, requirement)?;
        ir_entry.map_port_values(info, |id| self.port_name(ports, id))?;

        let key = app_db::ir_table_entry_to_app_db_key(&ir_entry);
        let values = if kind == UpdateType::Delete {
            Vec::new()
        } else {
            app_db::ir_table_entry_to_app_db_values(&ir_entry)?
        };
        tracing::trace!(update = index + 1, entry = %ir_entry, "update translated");
        Ok(PreparedUpdate {
            index,
            kind,
            key,
            values,
            vrf: route_vrf(&ir_entry),
        })
    }

    /// Create VRFs first referenced by inserts in this batch. Updates whose
    /// VRF could not be created are failed and removed from `prepared`.
    fn create_missing_vrfs(
        &self,
        write_state: &mut WriteState,
        prepared: &mut Vec<PreparedUpdate>,
        results: &mut [Option<UpdateStatus>],
    ) -> BTreeSet<String> {
        let mut created = BTreeSet::new();
        let mut failed: HashMap<String, UpdateStatus> = HashMap::new();
        let wanted: BTreeSet<String> = prepared
            .iter()
            .filter(|p| p.kind == UpdateType::Insert)
            .filter_map(|p| p.vrf.clone())
            .filter(|vrf| write_state.vrf_refs.get(vrf).copied().unwrap_or(0) == 0)
            .collect();

        for vrf in wanted {
            let exists = self
                .deps
                .app_db
                .exists(&self.options.tables.vrf, &vrf)
                .unwrap_or(false);
            // Created by someone else; not ours to reference count.
            if exists {
                continue;
            }
            let fields = VRF_FIELDS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            let status = match self.deps.vrf_producer.set(&vrf, fields) {
                Ok(seq) => self
                    .wait_for_ack(self.deps.vrf_notifier.as_ref(), &vrf, seq)
                    .unwrap_or_else(|| {
                        UpdateStatus::from(HarnessError::DeadlineExceeded {
                            message: format!("no acknowledgment for VRF {}", vrf),
                        })
                    }),
                Err(e) => e.into(),
            };
            if status.is_ok() {
                tracing::debug!(vrf = %vrf, "VRF created");
                write_state.vrf_refs.insert(vrf.clone(), 0);
                created.insert(vrf);
            } else {
                tracing::warn!(vrf = %vrf, code = ?status.code, "VRF creation failed");
                failed.insert(vrf, status);
            }
        }

        if !failed.is_empty() {
            prepared.retain(|p| {
                let status = p
                    .vrf
                    .as_ref()
                    .filter(|_| p.kind == UpdateType::Insert)
                    .and_then(|vrf| failed.get(vrf));
                match status {
                    Some(status) => {
                        results[p.index] = Some(status.clone());
                        false
                    }
                    None => true,
                }
            });
        }
        created
    }

    fn remove_vrf(&self, vrf: &str) {
        let seq = match self.deps.vrf_producer.del(vrf) {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(vrf = %vrf, error = %e, "VRF removal not enqueued");
                return;
            }
        };
        match self.wait_for_ack(self.deps.vrf_notifier.as_ref(), vrf, seq) {
            Some(status) if status.is_ok() => tracing::debug!(vrf = %vrf, "VRF removed"),
            Some(status) => {
                tracing::warn!(vrf = %vrf, code = ?status.code, message = %status.message, "VRF removal failed")
            }
            None => tracing::warn!(vrf = %vrf, "VRF removal not acknowledged"),
        }
    }

    /// Wait for the acknowledgment of the mutation enqueued as `seq` for `key`.
    /// `None` means the wait timed out.
    ///
    /// Acknowledgments older than `seq` belong to updates whose wait already
    /// timed out and are dropped.
    fn wait_for_ack(
        &self,
        notifier: &dyn ConsumerNotifierAdapter,
        key: &str,
        seq: u64,
    ) -> Option<UpdateStatus> {
        let deadline = Instant::now() + self.options.response_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match notifier.wait_for_notification(remaining) {
                WaitOutcome::TimedOut => {
                    tracing::warn!(key = %key, seq, timeout = ?self.options.response_timeout, "acknowledgment timed out");
                    return None;
                }
                WaitOutcome::Ready(notification) if notification.seq < seq => {
                    tracing::warn!(
                        key = %notification.key,
                        seq = notification.seq,
                        expected = seq,
                        "discarding stale acknowledgment"
                    );
                }
                WaitOutcome::Ready(notification)
                    if notification.key != key || notification.seq != seq =>
                {
                    tracing::error!(
                        expected = %key,
                        expected_seq = seq,
                        received = %notification.key,
                        received_seq = notification.seq,
                        "acknowledgment for unexpected mutation"
                    );
                    return Some(UpdateStatus::from(HarnessError::internal(format!(
                        "expected acknowledgment for {} but received one for {}",
                        key, notification.key
                    ))));
                }
                WaitOutcome::Ready(notification) => {
                    return Some(UpdateStatus {
                        code: notification.code.to_grpc_code(),
                        message: notification.message,
                    })
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn read(&self, request: proto::ReadRequest) -> Result<proto::ReadResponse, Status> {
        self.check_device(request.device_id)?;
        let pipeline = self.current_pipeline()?;
        let mut filters = Vec::with_capacity(request.entities.len());
        for entity in &request.entities {
            let entry = entity
                .as_table_entry()
                .ok_or_else(|| HarnessError::unimplemented("only table entries can be read"))?;
            if entry.table_id != 0 && pipeline.ir.table(entry.table_id).is_none() {
                return Err(HarnessError::not_found(format!(
                    "unknown table id {}",
                    entry.table_id
                ))
                .into());
            }
            filters.push((entry.table_id, entry.counter_data.is_some()));
        }
        if filters.is_empty() {
            return Ok(proto::ReadResponse::default());
        }

        let ports = self.port_translation()?;
        let p4rt_table = &self.options.tables.p4rt;
        let mut entities = Vec::new();
        for key in self.deps.app_db.keys(p4rt_table)? {
            let Some(values) = self.deps.app_db.get(p4rt_table, &key)? else {
                continue;
            };
            let mut ir_entry = match app_db::app_db_to_ir_table_entry(&pipeline.ir, &key, &values) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "skipping row outside the pipeline");
                    continue;
                }
            };
            let Some(table) = pipeline.ir.table_by_alias(&ir_entry.table_name) else {
                continue;
            };
            let wanted = filters
                .iter()
                .filter(|(id, _)| *id == 0 || *id == table.id)
                .map(|(_, counters)| *counters)
                .reduce(|a, b| a || b);
            let Some(with_counters) = wanted else {
                continue;
            };

            ir_entry
                .map_port_values(&pipeline.ir, |name| self.port_id(&ports, name))
                .map_err(|e| Status::internal(format!("{}: {}", key, e.message())))?;
            let mut pi = ir::ir_to_pi(&pipeline.ir, &ir_entry)
                .map_err(|e| Status::internal(format!("{}: {}", key, e.message())))?;
            if with_counters {
                pi.counter_data = self.counter_data(&key)?;
            }
            entities.push(proto::Entity::table_entry(pi));
        }
        tracing::debug!(entities = entities.len(), "read complete");
        Ok(proto::ReadResponse { entities })
    }

    fn counter_data(&self, key: &str) -> HarnessResult<Option<proto::CounterData>> {
        let counters_key = format!("{}:{}", self.options.tables.p4rt, key);
        let Some(fields) = self
            .deps
            .counters_db
            .get(&self.options.tables.counters, &counters_key)?
        else {
            return Ok(None);
        };
        let mut data = proto::CounterData::default();
        for (field, value) in fields {
            let parsed = value.parse::<i64>().map_err(|_| {
                HarnessError::internal(format!("counter {} of {} is not a number", field, key))
            });
            match field.as_str() {
                "packets" => data.packet_count = parsed?,
                "bytes" => data.byte_count = parsed?,
                _ => {}
            }
        }
        Ok(Some(data))
    }

    // ------------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn set_pipeline(
        &self,
        request: proto::SetForwardingPipelineConfigRequest,
    ) -> Result<proto::SetForwardingPipelineConfigResponse, Status> {
        self.check_device(request.device_id)?;
        self.controllers.lock().check_primary(request.election_id)?;

        let action = PipelineAction::try_from(request.action).unwrap_or(PipelineAction::Unspecified);
        if action == PipelineAction::Unspecified {
            return Err(Status::invalid_argument("pipeline action is unspecified"));
        }
        let _write_state = self.write_state.lock();

        let Some(config) = request.config else {
            if action == PipelineAction::Commit && self.pipeline.read().is_some() {
                return Ok(proto::SetForwardingPipelineConfigResponse {});
            }
            return Err(Status::invalid_argument("request has no forwarding pipeline config"));
        };
        let p4info = config
            .p4info
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("forwarding pipeline config has no P4Info"))?;
        let ir = IrP4Info::from_p4info(p4info)?;
        if action == PipelineAction::Verify {
            tracing::debug!("forwarding pipeline verified");
            return Ok(proto::SetForwardingPipelineConfigResponse {});
        }

        let mut current = self.pipeline.write();
        if let Some(existing) = current.as_ref() {
            let installed = self.deps.app_db.keys(&self.options.tables.p4rt)?;
            if existing.ir.p4info() != p4info && !installed.is_empty() {
                return Err(HarnessError::failed_precondition(format!(
                    "cannot replace the forwarding pipeline while {} entries are installed",
                    installed.len()
                ))
                .into());
            }
        }
        tracing::info!(tables = p4info.tables.len(), ?action, "forwarding pipeline installed");
        *current = Some(Arc::new(Pipeline { config, ir }));
        Ok(proto::SetForwardingPipelineConfigResponse {})
    }

    #[allow(clippy::result_large_err)]
    fn get_pipeline(
        &self,
        request: proto::GetForwardingPipelineConfigRequest,
    ) -> Result<proto::GetForwardingPipelineConfigResponse, Status> {
        self.check_device(request.device_id)?;
        let Some(pipeline) = self.pipeline.read().clone() else {
            return Ok(proto::GetForwardingPipelineConfigResponse { config: None });
        };
        let full = &pipeline.config;
        let response_type = ResponseType::try_from(request.response_type).unwrap_or(ResponseType::All);
        let config = match response_type {
            ResponseType::All => full.clone(),
            ResponseType::CookieOnly => proto::ForwardingPipelineConfig {
                cookie: full.cookie.clone(),
                ..Default::default()
            },
            ResponseType::P4infoAndCookie => proto::ForwardingPipelineConfig {
                p4info: full.p4info.clone(),
                cookie: full.cookie.clone(),
                ..Default::default()
            },
            ResponseType::DeviceConfigAndCookie => proto::ForwardingPipelineConfig {
                p4_device_config: full.p4_device_config.clone(),
                cookie: full.cookie.clone(),
                ..Default::default()
            },
        };
        Ok(proto::GetForwardingPipelineConfigResponse {
            config: Some(config),
        })
    }

    // ------------------------------------------------------------------------
    // Stream channel
    // ------------------------------------------------------------------------

    /// Handle one inbound stream message. An error ends the stream.
    #[allow(clippy::result_large_err)]
    fn handle_stream_message(
        &self,
        connection: ConnectionId,
        message: proto::StreamMessageRequest,
        sender: &StreamSender,
    ) -> Result<(), Status> {
        match message.update {
            Some(stream_message_request::Update::Arbitration(update)) => {
                self.controllers
                    .lock()
                    .handle_arbitration(connection, &update, sender)?;
            }
            Some(stream_message_request::Update::Packet(packet)) => {
                if let Err(e) = self.packet_out(connection, &packet) {
                    tracing::debug!(connection, error = %e, "packet-out rejected");
                    let error = proto::StreamError {
                        canonical_code: GrpcErrorMapping::to_grpc_code(&e) as i32,
                        message: e.message(),
                        details: Some(proto::stream_error::Details::PacketOut(
                            proto::PacketOutError {
                                packet_out: Some(packet),
                            },
                        )),
                    };
                    self.controllers.lock().send_to(
                        connection,
                        proto::StreamMessageResponse {
                            update: Some(stream_message_response::Update::Error(error)),
                        },
                    );
                }
            }
            None => {
                tracing::debug!(connection, "ignoring empty stream message");
            }
        }
        Ok(())
    }

    fn packet_out(&self, connection: ConnectionId, packet: &proto::PacketOut) -> HarnessResult<()> {
        if !self.controllers.lock().is_primary_connection(connection) {
            return Err(HarnessError::permission_denied(
                "only the primary connection can send packets",
            ));
        }
        let pipeline = self.current_pipeline()?;

        let mut egress_port = None;
        let mut submit_to_ingress = false;
        for metadata in &packet.metadata {
            let definition = pipeline
                .ir
                .packet_out_metadata(metadata.metadata_id)
                .ok_or_else(|| {
                    HarnessError::invalid_argument(format!(
                        "unknown packet-out metadata id {}",
                        metadata.metadata_id
                    ))
                })?;
            match definition.name.as_str() {
                "egress_port" => {
                    egress_port = Some(ir::bytes_to_ir(
                        &metadata.value,
                        definition.format,
                        definition.bitwidth,
                        "egress_port",
                    )?)
                }
                "submit_to_ingress" => submit_to_ingress = metadata.value.iter().any(|b| *b != 0),
                _ => {}
            }
        }

        let port = if submit_to_ingress {
            SUBMIT_TO_INGRESS_PORT.to_string()
        } else {
            let id = egress_port.ok_or_else(|| {
                HarnessError::invalid_argument("packet-out has no egress_port metadata")
            })?;
            let ports = self.port_translation()?;
            self.port_name(&ports, &id)?
        };
        self.deps
            .packetio
            .send_packet_out(&port, Bytes::copy_from_slice(&packet.payload))
    }

    fn packet_in(&self, packet: &ReceivedPacket) -> HarnessResult<Option<proto::StreamMessageResponse>> {
        let Some(pipeline) = self.pipeline.read().clone() else {
            return Ok(None);
        };
        let ports = self.port_translation()?;
        let mut metadata = Vec::with_capacity(2);
        for (name, port) in [
            ("ingress_port", &packet.source_port),
            ("target_egress_port", &packet.target_port),
        ] {
            let Some(definition) = pipeline.ir.packet_in_metadata(name) else {
                continue;
            };
            let value = if definition.is_port {
                self.port_id(&ports, port)?
            } else {
                port.clone()
            };
            metadata.push(proto::PacketMetadata {
                metadata_id: definition.id,
                value: value.into_bytes(),
            });
        }
        Ok(Some(proto::StreamMessageResponse {
            update: Some(stream_message_response::Update::Packet(proto::PacketIn {
                payload: packet.payload.to_vec(),
                metadata,
            })),
        }))
    }
}

/// VRF a route entry lives in.
fn route_vrf(entry: &IrTableEntry) -> Option<String> {
    if !ROUTE_TABLES.contains(&entry.table_name.as_str()) {
        return None;
    }
    entry.match_value("vrf_id")
}

fn join_error(e: tokio::task::JoinError) -> Status {
    Status::internal(format!("request handler failed: {}", e))
}

#[tonic::async_trait]
impl P4Runtime for P4RuntimeImpl {
    async fn write(
        &self,
        request: Request<proto::WriteRequest>,
    ) -> Result<Response<proto::WriteResponse>, Status> {
        let inner = Arc::clone(&self.inner);
        let request = request.into_inner();
        tracing::debug!(updates = request.updates.len(), "write request");
        let response = tokio::task::spawn_blocking(move || inner.write(request))
            .await
            .map_err(join_error)??;
        Ok(Response::new(response))
    }

    async fn read(
        &self,
        request: Request<proto::ReadRequest>,
    ) -> Result<Response<ResponseStream<proto::ReadResponse>>, Status> {
        let inner = Arc::clone(&self.inner);
        let request = request.into_inner();
        let response = tokio::task::spawn_blocking(move || inner.read(request))
            .await
            .map_err(join_error)??;
        let stream: ResponseStream<proto::ReadResponse> =
            Box::pin(tokio_stream::iter(vec![Ok(response)]));
        Ok(Response::new(stream))
    }

    async fn set_forwarding_pipeline_config(
        &self,
        request: Request<proto::SetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::SetForwardingPipelineConfigResponse>, Status> {
        let inner = Arc::clone(&self.inner);
        let request = request.into_inner();
        let response = tokio::task::spawn_blocking(move || inner.set_pipeline(request))
            .await
            .map_err(join_error)??;
        Ok(Response::new(response))
    }

    async fn get_forwarding_pipeline_config(
        &self,
        request: Request<proto::GetForwardingPipelineConfigRequest>,
    ) -> Result<Response<proto::GetForwardingPipelineConfigResponse>, Status> {
        Ok(Response::new(self.inner.get_pipeline(request.into_inner())?))
    }

    async fn capabilities(
        &self,
        _request: Request<proto::CapabilitiesRequest>,
    ) -> Result<Response<proto::CapabilitiesResponse>, Status> {
        Ok(Response::new(proto::CapabilitiesResponse {
            p4runtime_api_version: P4RUNTIME_API_VERSION.to_string(),
        }))
    }

    async fn stream_channel(
        &self,
        request: Request<Streaming<proto::StreamMessageRequest>>,
    ) -> Result<Response<ResponseStream<proto::StreamMessageResponse>>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        tracing::debug!(connection, "stream channel opened");

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(message)) => {
                        if let Err(status) = inner.handle_stream_message(connection, message, &tx) {
                            tracing::debug!(connection, %status, "closing stream channel");
                            let _ = tx.send(Err(status));
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        tracing::debug!(connection, %status, "stream channel receive failed");
                        break;
                    }
                }
            }
            inner.controllers.lock().disconnect(connection);
            tracing::debug!(connection, "stream channel closed");
        });

        let stream: ResponseStream<proto::StreamMessageResponse> =
            Box::pin(UnboundedReceiverStream::new(rx));
        Ok(Response::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sai;
    use crate::sonic::packetio::FakePacketIo;
    use crate::swss::{
        AckChannel, Applier, FakeConsumerNotifier, FakeDbConnector, FakeProducerStateTable,
        MutationQueue, SonicDbTable,
    };

    struct Fixture {
        server: P4RuntimeImpl,
        p4rt: Applier,
        vrf: Applier,
        port_table: SonicDbTable,
    }

    fn fixture(translate_port_ids: bool) -> Fixture {
        let p4rt_state = SonicDbTable::new("P4RT");
        let vrf_state = SonicDbTable::new("VRF_TABLE");
        let p4rt = Applier::new(
            SonicDbTable::with_state_table("P4RT", &p4rt_state),
            MutationQueue::new("P4RT"),
            AckChannel::new("P4RT"),
        );
        let vrf = Applier::new(
            SonicDbTable::with_state_table("VRF_TABLE", &vrf_state),
            MutationQueue::new("VRF_TABLE"),
            AckChannel::new("VRF_TABLE"),
        );
        let port_table = SonicDbTable::new("PORT_TABLE");

        let mut app_db = FakeDbConnector::new("APPL_DB");
        app_db.add_table("P4RT", p4rt.table().clone()).unwrap();
        app_db.add_table("PORT_TABLE", port_table.clone()).unwrap();
        app_db.add_table("VRF_TABLE", vrf.table().clone()).unwrap();
        let mut state_db = FakeDbConnector::new("APPL_STATE_DB");
        state_db.add_table("P4RT", p4rt_state).unwrap();
        state_db.add_table("VRF_TABLE", vrf_state).unwrap();
        let mut counters_db = FakeDbConnector::new("COUNTERS_DB");
        counters_db
            .add_table("COUNTERS", SonicDbTable::new("COUNTERS"))
            .unwrap();

        let deps = ServerDependencies {
            app_db: Box::new(app_db),
            app_state_db: Box::new(state_db),
            counters_db: Box::new(counters_db),
            p4rt_producer: Box::new(FakeProducerStateTable::new(p4rt.queue().clone())),
            p4rt_notifier: Box::new(FakeConsumerNotifier::new(p4rt.acks().clone())),
            vrf_producer: Box::new(FakeProducerStateTable::new(vrf.queue().clone())),
            vrf_notifier: Box::new(FakeConsumerNotifier::new(vrf.acks().clone())),
            packetio: Box::new(FakePacketIo::new()),
        };
        let options = ServerOptions {
            translate_port_ids,
            response_timeout: Duration::from_millis(200),
            ..ServerOptions::default()
        };
        Fixture {
            server: P4RuntimeImpl::new(deps, options).unwrap(),
            p4rt,
            vrf,
            port_table,
        }
    }

    fn become_primary(server: &P4RuntimeImpl) -> mpsc::UnboundedReceiver<Result<proto::StreamMessageResponse, Status>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let update = proto::MasterArbitrationUpdate {
            device_id: server.options().device_id,
            role: None,
            election_id: Some(proto::Uint128::from_low(1)),
            status: None,
        };
        server
            .inner
            .controllers
            .lock()
            .handle_arbitration(1, &update, &tx)
            .unwrap();
        rx
    }

    fn install_pipeline(server: &P4RuntimeImpl) {
        server
            .inner
            .set_pipeline(proto::SetForwardingPipelineConfigRequest {
                device_id: server.options().device_id,
                election_id: Some(proto::Uint128::from_low(1)),
                action: PipelineAction::VerifyAndCommit as i32,
                config: Some(proto::ForwardingPipelineConfig {
                    p4info: Some(sai::fixed_l3_p4info()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
    }

    fn route_insert(vrf: &str) -> proto::WriteRequest {
        let entry = proto::TableEntry {
            table_id: sai::ROUTING_IPV4_TABLE_ID,
            r#match: vec![
                proto::FieldMatch {
                    field_id: 1,
                    field_match_type: Some(proto::field_match::FieldMatchType::Exact(
                        proto::field_match::Exact {
                            value: vrf.as_bytes().to_vec(),
                        },
                    )),
                },
                proto::FieldMatch {
                    field_id: 2,
                    field_match_type: Some(proto::field_match::FieldMatchType::Lpm(
                        proto::field_match::Lpm {
                            value: vec![10, 81, 8, 0],
                            prefix_len: 23,
                        },
                    )),
                },
            ],
            action: Some(proto::TableAction {
                r#type: Some(proto::table_action::Type::Action(proto::Action {
                    action_id: sai::ROUTING_DROP_ACTION_ID,
                    params: vec![],
                })),
            }),
            ..Default::default()
        };
        proto::WriteRequest {
            device_id: DEFAULT_DEVICE,
            election_id: Some(proto::Uint128::from_low(1)),
            updates: vec![proto::Update {
                r#type: UpdateType::Insert as i32,
                entity: Some(proto::Entity::table_entry(entry)),
            }],
            ..Default::default()
        }
    }

    const DEFAULT_DEVICE: u64 = crate::core::config::DEFAULT_DEVICE_ID;

    /// Run a blocking write while a helper thread applies mutations.
    fn write_with_apply(f: &Fixture, request: proto::WriteRequest) -> Result<proto::WriteResponse, Status> {
        let inner = Arc::clone(&f.server.inner);
        let handle = std::thread::spawn(move || inner.write(request));
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            f.vrf.apply_pending();
            f.p4rt.apply_pending();
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.join().unwrap()
    }

    #[test]
    fn test_missing_table_is_rejected() {
        let deps = ServerDependencies {
            app_db: Box::new(FakeDbConnector::new("APPL_DB")),
            app_state_db: Box::new(FakeDbConnector::new("APPL_STATE_DB")),
            counters_db: Box::new(FakeDbConnector::new("COUNTERS_DB")),
            p4rt_producer: Box::new(FakeProducerStateTable::new(MutationQueue::new("P4RT"))),
            p4rt_notifier: Box::new(FakeConsumerNotifier::new(AckChannel::new("P4RT"))),
            vrf_producer: Box::new(FakeProducerStateTable::new(MutationQueue::new("VRF_TABLE"))),
            vrf_notifier: Box::new(FakeConsumerNotifier::new(AckChannel::new("VRF_TABLE"))),
            packetio: Box::new(FakePacketIo::new()),
        };
        assert!(matches!(
            P4RuntimeImpl::new(deps, ServerOptions::default()),
            Err(HarnessError::MissingTable { .. })
        ));
    }

    #[test]
    fn test_write_requires_primary_and_pipeline() {
        let f = fixture(false);
        let err = f.server.inner.write(route_insert("50")).unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);

        let _rx = become_primary(&f.server);
        let err = f.server.inner.write(route_insert("50")).unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[test]
    fn test_route_creates_and_removes_vrf() {
        let f = fixture(false);
        let _rx = become_primary(&f.server);
        install_pipeline(&f.server);

        write_with_apply(&f, route_insert("50")).unwrap();
        assert!(f.vrf.table().contains("50"));
        assert_eq!(f.p4rt.table().len(), 1);

        let mut delete = route_insert("50");
        delete.updates[0].r#type = UpdateType::Delete as i32;
        write_with_apply(&f, delete).unwrap();
        assert!(f.p4rt.table().is_empty());
        assert!(!f.vrf.table().contains("50"));
    }

    #[test]
    fn test_ack_timeout_is_deadline_exceeded() {
        let f = fixture(false);
        let _rx = become_primary(&f.server);
        install_pipeline(&f.server);
        // VRF already present so only the route is enqueued, and nobody applies it.
        f.vrf.table().set("50", vec![]);

        let err = f.server.inner.write(route_insert("50")).unwrap_err();
        assert_eq!(err.code(), Code::Unknown);
        assert!(err.message().contains("#1: DEADLINE_EXCEEDED"));
        assert_eq!(f.p4rt.queue().len(), 1);
    }

    #[test]
    fn test_late_ack_does_not_misalign_next_write() {
        let f = fixture(false);
        let _rx = become_primary(&f.server);
        install_pipeline(&f.server);
        f.vrf.table().set("50", vec![]);

        let err = f.server.inner.write(route_insert("50")).unwrap_err();
        assert!(err.message().contains("#1: DEADLINE_EXCEEDED"));
        // The timed-out route is applied after its writer gave up.
        assert_eq!(f.p4rt.apply_pending(), 1);
        assert_eq!(f.p4rt.acks().pending(), 1);

        write_with_apply(&f, route_insert("51")).unwrap();
        assert_eq!(f.p4rt.table().len(), 2);
        assert_eq!(f.p4rt.acks().pending(), 0);
    }

    #[test]
    fn test_packet_in_translates_ports() {
        let f = fixture(true);
        install_pipeline_without_primary(&f.server);
        f.port_table.set("Ethernet4", vec![("id".into(), "2".into())]);
        f.port_table.set("Ethernet8", vec![("id".into(), "3".into())]);

        let message = f
            .server
            .inner
            .packet_in(&ReceivedPacket {
                source_port: "Ethernet4".into(),
                target_port: "Ethernet8".into(),
                payload: Bytes::from_static(b"pkt"),
            })
            .unwrap()
            .unwrap();
        match message.update {
            Some(stream_message_response::Update::Packet(packet)) => {
                assert_eq!(packet.payload, b"pkt".to_vec());
                assert_eq!(packet.metadata[0].metadata_id, sai::PACKET_IN_INGRESS_PORT_ID);
                assert_eq!(packet.metadata[0].value, b"2".to_vec());
                assert_eq!(packet.metadata[1].value, b"3".to_vec());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    fn install_pipeline_without_primary(server: &P4RuntimeImpl) {
        let config = proto::ForwardingPipelineConfig {
            p4info: Some(sai::fixed_l3_p4info()),
            ..Default::default()
        };
        let ir = IrP4Info::from_p4info(&sai::fixed_l3_p4info()).unwrap();
        *server.inner.pipeline.write() = Some(Arc::new(Pipeline { config, ir }));
    }
}
