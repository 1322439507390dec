//! Harness orchestration.
//!
//! The harness owns every fake, the server under test and the gRPC
//! transport, and fixes their lifecycle:
//! - Start order: tables → queues and apply paths → connectors → packet
//!   channel → server → transport
//! - Shutdown order (on drop): transport → apply paths → runtime

use crate::core::config::{ApplyMode, HarnessConfig};
use crate::core::error::{HarnessError, HarnessResult};
use crate::p4rt::proto::Uint128;
use crate::p4rt::server::{P4RuntimeImpl, ServerDependencies, ServerOptions};
use crate::p4rt::service::P4RuntimeServer;
use crate::p4rt::session::P4RuntimeSession;
use crate::sonic::packetio::FakePacketIo;
use crate::swss::{
    AckChannel, Applier, ApplyWorker, FakeConsumerNotifier, FakeDbConnector,
    FakeProducerStateTable, MutationQueue, SonicDbTable,
};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;

/// Logical database names.
pub const APPL_DB: &str = "APPL_DB";
pub const APPL_STATE_DB: &str = "APPL_STATE_DB";
pub const COUNTERS_DB: &str = "COUNTERS_DB";

/// Harness lifecycle state. Each transition happens once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    /// Components are being built.
    Constructing,
    /// The transport accepts RPCs.
    Serving,
    /// Drop is in progress.
    ShuttingDown,
    /// Everything is released.
    Stopped,
}

/// Table handles owned by the harness.
struct Tables {
    p4rt: SonicDbTable,
    port: SonicDbTable,
    vrf: SonicDbTable,
    p4rt_state: SonicDbTable,
    vrf_state: SonicDbTable,
    counters: SonicDbTable,
}

/// What drop has to stop, in order.
struct Teardown {
    grace: Duration,
    runtime: tokio::runtime::Runtime,
    shutdown_tx: watch::Sender<bool>,
    serve: JoinHandle<Result<(), tonic::transport::Error>>,
    packet_in: JoinHandle<()>,
    workers: Vec<ApplyWorker>,
    queues: Vec<MutationQueue>,
}

impl Teardown {
    fn run(self) {
        let Teardown {
            grace,
            runtime,
            shutdown_tx,
            mut serve,
            packet_in,
            mut workers,
            queues,
        } = self;

        // 1. Transport
        let _ = shutdown_tx.send(true);
        let stopped = runtime.block_on(async { tokio::time::timeout(grace, &mut serve).await });
        match stopped {
            Ok(Ok(Ok(()))) => tracing::debug!("gRPC transport stopped"),
            Ok(Ok(Err(e))) => tracing::warn!(error = %e, "gRPC transport stopped with error"),
            Ok(Err(e)) => tracing::warn!(error = %e, "gRPC transport task failed"),
            Err(_) => {
                tracing::warn!(grace = ?grace, "gRPC transport did not stop in time, aborting");
                serve.abort();
            }
        }
        packet_in.abort();

        // 2. Apply paths
        for queue in &queues {
            queue.close();
        }
        for worker in &mut workers {
            worker.stop();
        }

        // 3. Runtime
        runtime.shutdown_timeout(grace);
    }
}

/// A running P4Runtime server over simulated SONiC databases.
pub struct Harness {
    config: HarnessConfig,
    state: HarnessState,
    tables: Tables,
    p4rt_applier: Applier,
    vrf_applier: Applier,
    packet_io: FakePacketIo,
    server: P4RuntimeImpl,
    local_addr: SocketAddr,
    handle: Handle,
    teardown: Option<Teardown>,
}

impl Harness {
    /// Build and start a harness. Configuration and transport errors are
    /// fatal: the harness never reaches [`HarnessState::Serving`].
    pub fn new(config: HarnessConfig) -> HarnessResult<Self> {
        let mut state = HarnessState::Constructing;
        config.validate()?;
        let names = &config.tables;
        tracing::info!(
            port = config.listener.port,
            mode = ?config.apply.mode,
            "starting P4RT harness"
        );

        // 1. Tables
        let p4rt_state = SonicDbTable::new(&names.p4rt);
        let vrf_state = SonicDbTable::new(&names.vrf);
        let tables = Tables {
            p4rt: SonicDbTable::with_state_table(&names.p4rt, &p4rt_state),
            port: SonicDbTable::new(&names.port),
            vrf: SonicDbTable::with_state_table(&names.vrf, &vrf_state),
            p4rt_state,
            vrf_state,
            counters: SonicDbTable::new(&names.counters),
        };

        // 2. Queues and apply paths
        let p4rt_applier = Applier::new(
            tables.p4rt.clone(),
            MutationQueue::new(&names.p4rt),
            AckChannel::new(&names.p4rt),
        );
        let vrf_applier = Applier::new(
            tables.vrf.clone(),
            MutationQueue::new(&names.vrf),
            AckChannel::new(&names.vrf),
        );
        let mut workers = Vec::new();
        if config.apply.mode == ApplyMode::Background {
            for applier in [&p4rt_applier, &vrf_applier] {
                let worker = ApplyWorker::spawn(applier.clone()).map_err(|e| {
                    HarnessError::internal(format!("failed to spawn apply worker: {}", e))
                })?;
                workers.push(worker);
            }
        }

        // 3. Connectors
        let mut app_db = FakeDbConnector::new(APPL_DB);
        app_db.add_table(&names.p4rt, tables.p4rt.clone())?;
        app_db.add_table(&names.port, tables.port.clone())?;
        app_db.add_table(&names.vrf, tables.vrf.clone())?;
        let mut app_state_db = FakeDbConnector::new(APPL_STATE_DB);
        app_state_db.add_table(&names.p4rt, tables.p4rt_state.clone())?;
        app_state_db.add_table(&names.vrf, tables.vrf_state.clone())?;
        let mut counters_db = FakeDbConnector::new(COUNTERS_DB);
        counters_db.add_table(&names.counters, tables.counters.clone())?;

        // 4. Packet channel
        let packet_io = FakePacketIo::new();

        // 5. Server under test
        let deps = ServerDependencies {
            app_db: Box::new(app_db),
            app_state_db: Box::new(app_state_db),
            counters_db: Box::new(counters_db),
            p4rt_producer: Box::new(FakeProducerStateTable::new(p4rt_applier.queue().clone())),
            p4rt_notifier: Box::new(FakeConsumerNotifier::new(p4rt_applier.acks().clone())),
            vrf_producer: Box::new(FakeProducerStateTable::new(vrf_applier.queue().clone())),
            vrf_notifier: Box::new(FakeConsumerNotifier::new(vrf_applier.acks().clone())),
            packetio: Box::new(packet_io.clone()),
        };
        let server = P4RuntimeImpl::new(deps, ServerOptions::from_config(&config))?;
        let packet_ins = server.start_receive()?;

        // 6. Transport. Bound before the runtime is built: dropping a runtime
        // inside an async context panics.
        let listener = bind(config.bind_addr()?)?;
        let local_addr = listener.local_addr().map_err(|e| HarnessError::Transport {
            message: format!("failed to read bound address: {}", e),
        })?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("p4rt-harness")
            .enable_all()
            .build()
            .map_err(|e| HarnessError::Transport {
                message: format!("failed to build runtime: {}", e),
            })?;
        let registered = {
            let _guard = runtime.enter();
            tokio::net::TcpListener::from_std(listener)
        };
        let listener = match registered {
            Ok(listener) => listener,
            Err(e) => {
                runtime.shutdown_background();
                return Err(HarnessError::Transport {
                    message: format!("failed to register listener on {}: {}", local_addr, e),
                });
            }
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = P4RuntimeServer::new(server.clone());
        let serve = runtime.spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
        });
        let packet_in = runtime.spawn(server.clone().forward_packet_ins(packet_ins));

        state = transition(state, HarnessState::Serving);
        tracing::info!(addr = %local_addr, "P4RT harness serving");

        let queues = vec![p4rt_applier.queue().clone(), vrf_applier.queue().clone()];
        Ok(Self {
            handle: runtime.handle().clone(),
            teardown: Some(Teardown {
                grace: config.shutdown_grace(),
                runtime,
                shutdown_tx,
                serve,
                packet_in,
                workers,
                queues,
            }),
            config,
            state,
            tables,
            p4rt_applier,
            vrf_applier,
            packet_io,
            server,
            local_addr,
        })
    }

    /// Harness with default configuration on an ephemeral port.
    pub fn ephemeral() -> HarnessResult<Self> {
        Self::new(HarnessConfig::ephemeral())
    }

    /// Configuration the harness was built from.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// Address the transport is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port the transport is bound to.
    pub fn grpc_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Device id the server answers for.
    pub fn device_id(&self) -> u64 {
        self.config.server.device_id
    }

    /// P4RT table in the application database.
    pub fn p4rt_app_db_table(&self) -> &SonicDbTable {
        &self.tables.p4rt
    }

    /// Port table in the application database.
    pub fn port_app_db_table(&self) -> &SonicDbTable {
        &self.tables.port
    }

    /// VRF table in the application database.
    pub fn vrf_app_db_table(&self) -> &SonicDbTable {
        &self.tables.vrf
    }

    /// P4RT mirror in the application state database.
    pub fn p4rt_state_db_table(&self) -> &SonicDbTable {
        &self.tables.p4rt_state
    }

    /// VRF mirror in the application state database.
    pub fn vrf_state_db_table(&self) -> &SonicDbTable {
        &self.tables.vrf_state
    }

    /// Per-entry counters.
    pub fn p4rt_counters_db_table(&self) -> &SonicDbTable {
        &self.tables.counters
    }

    /// Packet channel fake.
    pub fn packet_io(&self) -> &FakePacketIo {
        &self.packet_io
    }

    /// Apply path of the P4RT table, for manual stepping.
    pub fn p4rt_applier(&self) -> &Applier {
        &self.p4rt_applier
    }

    /// Apply path of the VRF table, for manual stepping.
    pub fn vrf_applier(&self) -> &Applier {
        &self.vrf_applier
    }

    /// The server under test.
    pub fn server(&self) -> &P4RuntimeImpl {
        &self.server
    }

    /// Handle of the transport runtime.
    pub fn runtime_handle(&self) -> &Handle {
        &self.handle
    }

    /// Run a future on the transport runtime from a plain thread.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    /// Register a SONiC port and its controller id in PORT_TABLE.
    pub fn add_port(&self, name: &str, id: &str) {
        self.tables
            .port
            .set(name, vec![("id".to_string(), id.to_string())]);
    }

    /// Open a controller session that becomes primary with `election_id`.
    pub fn connect(&self, election_id: u64) -> HarnessResult<P4RuntimeSession> {
        self.block_on(P4RuntimeSession::connect(
            self.local_addr,
            self.device_id(),
            Uint128::from_low(election_id),
        ))
    }
}

fn bind(addr: SocketAddr) -> HarnessResult<std::net::TcpListener> {
    let transport_error = |e: std::io::Error| HarnessError::Transport {
        message: format!("failed to bind {}: {}", addr, e),
    };
    let listener = std::net::TcpListener::bind(addr).map_err(transport_error)?;
    listener.set_nonblocking(true).map_err(transport_error)?;
    Ok(listener)
}

fn transition(from: HarnessState, to: HarnessState) -> HarnessState {
    tracing::debug!(?from, ?to, "harness state change");
    to
}

impl Drop for Harness {
    fn drop(&mut self) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };
        self.state = transition(self.state, HarnessState::ShuttingDown);
        tracing::info!(addr = %self.local_addr, "stopping P4RT harness");

        // Blocking on a runtime is not allowed from inside another one.
        if Handle::try_current().is_ok() {
            let joined = std::thread::Builder::new()
                .name("p4rt-harness-teardown".to_string())
                .spawn(move || teardown.run())
                .map(|thread| thread.join());
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::warn!("harness teardown thread panicked"),
                Err(e) => tracing::warn!(error = %e, "failed to spawn harness teardown thread"),
            }
        } else {
            teardown.run();
        }

        self.state = transition(self.state, HarnessState::Stopped);
        tracing::info!("P4RT harness stopped");
    }
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("state", &self.state)
            .field("local_addr", &self.local_addr)
            .field("apply_mode", &self.config.apply.mode)
            .finish_non_exhaustive()
    }
}
