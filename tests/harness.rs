//! End-to-end tests: a controller session against a running harness.

mod common;

use common::{ipv4_route, ipv6_drop_route, router_interface, without_action, ELECTION_ID};
use p4rt_harness::config::{ApplyMode, HarnessConfig};
use p4rt_harness::error::HarnessError;
use p4rt_harness::p4rt::proto::{
    self, get_forwarding_pipeline_config_request::ResponseType, stream_message_response,
    update::Type as UpdateType, PacketMetadata, PacketOut,
};
use p4rt_harness::p4rt::session::update;
use p4rt_harness::sai;
use p4rt_harness::sonic::packetio::SUBMIT_TO_INGRESS_PORT;
use p4rt_harness::swss::ResponseCode;
use p4rt_harness::{Harness, HarnessState};
use std::time::{Duration, Instant};
use tonic::Code;

const RIF_KEY: &str = r#"FIXED_ROUTER_INTERFACE_TABLE:{"match/router_interface_id":"1"}"#;
const ROUTE_KEY: &str =
    r#"FIXED_IPV4_TABLE:{"match/ipv4_dst":"10.81.8.0/23","match/vrf_id":"vrf-1"}"#;

fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// ============================================================================
// Writes
// ============================================================================

#[test]
fn insert_router_interface_lands_in_app_db() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap();

    let table = harness.p4rt_app_db_table();
    assert_eq!(table.keys(), vec![RIF_KEY.to_string()]);
    assert_eq!(
        table.get(RIF_KEY).unwrap(),
        fields(&[
            ("action", "set_port_and_src_mac"),
            ("param/port", "Ethernet4"),
            ("param/src_mac", "02:2a:10:00:00:03"),
        ])
    );
    assert_eq!(
        harness.p4rt_state_db_table().get(RIF_KEY),
        table.get(RIF_KEY)
    );
}

#[test]
fn routes_create_and_release_their_vrf() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    let v4 = ipv4_route("vrf-1", [10, 81, 8, 0], 23, "8");
    let v6 = ipv6_drop_route(
        "vrf-1",
        [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        32,
    );

    harness
        .block_on(session.write(vec![
            update(UpdateType::Insert, v4.clone()),
            update(UpdateType::Insert, v6.clone()),
        ]))
        .unwrap();
    assert_eq!(harness.p4rt_app_db_table().len(), 2);
    assert_eq!(
        harness.vrf_app_db_table().get("vrf-1").unwrap(),
        fields(&[("v4", "true"), ("v6", "true")])
    );
    assert!(harness.vrf_state_db_table().contains("vrf-1"));
    // One VRF row for both routes.
    assert_eq!(harness.vrf_applier().queue().enqueued(), 1);

    harness
        .block_on(session.write_entry(UpdateType::Delete, without_action(&v4)))
        .unwrap();
    assert!(harness.vrf_app_db_table().contains("vrf-1"));

    harness
        .block_on(session.write_entry(UpdateType::Delete, without_action(&v6)))
        .unwrap();
    assert!(harness.p4rt_app_db_table().is_empty());
    assert!(!harness.vrf_app_db_table().contains("vrf-1"));
    assert!(!harness.vrf_state_db_table().contains("vrf-1"));
}

#[test]
fn modify_replaces_the_row() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap();
    harness
        .block_on(session.write_entry(UpdateType::Modify, router_interface("1", "3")))
        .unwrap();

    assert_eq!(
        harness
            .p4rt_app_db_table()
            .get_field(RIF_KEY, "param/port")
            .as_deref(),
        Some("Ethernet8")
    );
}

#[test]
fn delete_of_missing_entry_is_not_found_and_enqueues_nothing() {
    let harness = common::manual_harness();
    let mut session = common::primary_session(&harness);

    let err = harness
        .block_on(session.write_entry(UpdateType::Delete, without_action(&router_interface("1", "2"))))
        .unwrap_err();

    assert_eq!(err.code(), Code::Unknown);
    assert!(err.message().contains("#1: NOT_FOUND"), "{}", err.message());
    assert_eq!(harness.p4rt_applier().queue().enqueued(), 0);
    assert!(harness.p4rt_app_db_table().is_empty());
}

#[test]
fn insert_of_existing_entry_is_already_exists() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap();

    let err = harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap_err();
    assert!(err.message().contains("#1: ALREADY_EXISTS"), "{}", err.message());
}

#[test]
fn unknown_port_id_is_invalid_argument() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    let err = harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "999")))
        .unwrap_err();

    assert!(err.message().contains("#1: INVALID_ARGUMENT"), "{}", err.message());
    assert!(err.message().contains("999"));
    assert!(harness.p4rt_app_db_table().is_empty());
}

#[test]
fn insert_without_action_is_invalid_argument() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    let err = harness
        .block_on(session.write_entry(UpdateType::Insert, without_action(&router_interface("1", "2"))))
        .unwrap_err();
    assert!(err.message().contains("#1: INVALID_ARGUMENT"), "{}", err.message());
}

#[test]
fn injected_failure_is_reported_per_update() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    harness
        .p4rt_app_db_table()
        .set_response_for_key(RIF_KEY, ResponseCode::Full, "table is full");

    let err = harness
        .block_on(session.write(vec![
            update(UpdateType::Insert, router_interface("1", "2")),
            update(UpdateType::Insert, router_interface("2", "3")),
        ]))
        .unwrap_err();

    assert_eq!(
        err.message(),
        "Batch failed, individual results:\n#1: RESOURCE_EXHAUSTED: table is full\n#2: OK"
    );
    assert!(!harness.p4rt_app_db_table().contains(RIF_KEY));
    assert!(!harness.p4rt_state_db_table().contains(RIF_KEY));
    assert_eq!(harness.p4rt_app_db_table().len(), 1);
}

#[test]
fn duplicate_entry_in_batch_is_rejected() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    let err = harness
        .block_on(session.write(vec![
            update(UpdateType::Insert, router_interface("1", "2")),
            update(UpdateType::Insert, router_interface("1", "3")),
        ]))
        .unwrap_err();

    assert!(err.message().contains("#1: OK"), "{}", err.message());
    assert!(err.message().contains("#2: INVALID_ARGUMENT"), "{}", err.message());
    assert_eq!(
        harness
            .p4rt_app_db_table()
            .get_field(RIF_KEY, "param/port")
            .as_deref(),
        Some("Ethernet4")
    );
}

#[test]
fn write_without_pipeline_is_failed_precondition() {
    let harness = common::harness();
    let mut session = harness.connect(ELECTION_ID).unwrap();

    let err = harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

// ============================================================================
// Apply path
// ============================================================================

#[test]
fn manual_apply_holds_the_rpc_until_stepped() {
    let harness = common::manual_harness();
    let mut session = common::primary_session(&harness);

    let write = harness.runtime_handle().spawn(async move {
        session
            .write_entry(UpdateType::Insert, router_interface("1", "2"))
            .await
    });

    let queue = harness.p4rt_applier().queue();
    assert!(common::wait_until(Duration::from_secs(5), || queue.len() == 1));
    // Nothing is visible until the apply path runs.
    assert!(harness.p4rt_app_db_table().is_empty());
    assert!(!write.is_finished());

    let ack = harness.p4rt_applier().apply_next().unwrap();
    assert_eq!(ack.key, RIF_KEY);
    assert!(ack.code.is_success());

    harness.block_on(write).unwrap().unwrap();
    assert!(harness.p4rt_app_db_table().contains(RIF_KEY));
}

#[test]
fn drop_with_rpc_in_flight_is_bounded() {
    let harness = common::manual_harness();
    let mut session = common::primary_session(&harness);

    let _write = harness.runtime_handle().spawn(async move {
        session
            .write_entry(UpdateType::Insert, router_interface("1", "2"))
            .await
    });
    let queue = harness.p4rt_applier().queue().clone();
    assert!(common::wait_until(Duration::from_secs(5), || queue.len() == 1));

    let grace = harness.config().shutdown_grace();
    let start = Instant::now();
    drop(harness);
    assert!(start.elapsed() < grace * 4, "teardown took {:?}", start.elapsed());
    assert!(queue.is_closed());
}

#[test]
fn late_acknowledgment_does_not_fail_the_next_write() {
    let harness = common::harness_with(|c| {
        c.server.translate_port_ids = true;
        c.server.response_timeout_ms = 100;
        c.apply.mode = ApplyMode::Manual;
    });
    harness.add_port("Ethernet4", "2");
    let mut session = common::primary_session(&harness);

    let err = harness
        .block_on(session.write_entry(UpdateType::Insert, router_interface("1", "2")))
        .unwrap_err();
    assert!(err.message().contains("#1: DEADLINE_EXCEEDED"), "{}", err.message());
    assert_eq!(harness.p4rt_applier().apply_pending(), 1);

    let write = harness.runtime_handle().spawn(async move {
        session
            .write_entry(UpdateType::Insert, router_interface("2", "2"))
            .await
    });
    let queue = harness.p4rt_applier().queue();
    assert!(common::wait_until(Duration::from_secs(5), || queue.len() == 1));
    harness.p4rt_applier().apply_next().unwrap();

    harness.block_on(write).unwrap().unwrap();
    assert_eq!(harness.p4rt_app_db_table().len(), 2);
}

// ============================================================================
// Reads
// ============================================================================

#[test]
fn read_returns_written_entries() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    let rif = router_interface("1", "2");
    let route = ipv4_route("vrf-1", [10, 81, 8, 0], 23, "8");
    harness
        .block_on(session.write(vec![
            update(UpdateType::Insert, rif.clone()),
            update(UpdateType::Insert, route.clone()),
        ]))
        .unwrap();

    let all = harness.block_on(session.read_table_entries(0, false)).unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.contains(&rif));
    assert!(all.contains(&route));

    let routes = harness
        .block_on(session.read_table_entries(sai::ROUTING_IPV4_TABLE_ID, false))
        .unwrap();
    assert_eq!(routes, vec![route]);
}

#[test]
fn read_includes_counters_when_requested() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    let route = ipv4_route("vrf-1", [10, 81, 8, 0], 23, "8");
    harness
        .block_on(session.write_entry(UpdateType::Insert, route))
        .unwrap();
    harness.p4rt_counters_db_table().set(
        format!("P4RT:{}", ROUTE_KEY),
        fields(&[("packets", "7"), ("bytes", "700")]),
    );

    let entries = harness
        .block_on(session.read_table_entries(sai::ROUTING_IPV4_TABLE_ID, true))
        .unwrap();
    assert_eq!(
        entries[0].counter_data,
        Some(proto::CounterData {
            byte_count: 700,
            packet_count: 7,
        })
    );
}

// ============================================================================
// Pipeline and arbitration
// ============================================================================

#[test]
fn pipeline_config_is_returned() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);
    let request = proto::GetForwardingPipelineConfigRequest {
        device_id: harness.device_id(),
        response_type: ResponseType::All as i32,
    };

    let response = harness
        .block_on(session.client().get_forwarding_pipeline_config(request))
        .unwrap()
        .into_inner();
    assert_eq!(
        response.config.and_then(|c| c.p4info),
        Some(sai::fixed_l3_p4info())
    );

    let capabilities = harness
        .block_on(session.client().capabilities(proto::CapabilitiesRequest {}))
        .unwrap()
        .into_inner();
    assert!(!capabilities.p4runtime_api_version.is_empty());
}

#[test]
fn lower_election_id_does_not_become_primary() {
    let harness = common::harness();
    let _primary = harness.connect(10).unwrap();

    let backup = harness.connect(5);
    assert!(matches!(
        backup,
        Err(HarnessError::FailedPrecondition { .. })
    ));
}

// ============================================================================
// Packet I/O
// ============================================================================

#[test]
fn packet_out_goes_to_translated_port() {
    let harness = common::harness();
    let session = common::primary_session(&harness);

    session
        .send_packet_out(PacketOut {
            payload: b"hello".to_vec(),
            metadata: vec![PacketMetadata {
                metadata_id: sai::PACKET_OUT_EGRESS_PORT_ID,
                value: b"3".to_vec(),
            }],
        })
        .unwrap();
    session
        .send_packet_out(PacketOut {
            payload: b"punt".to_vec(),
            metadata: vec![PacketMetadata {
                metadata_id: sai::PACKET_OUT_SUBMIT_TO_INGRESS_ID,
                value: vec![1],
            }],
        })
        .unwrap();

    let packet_io = harness.packet_io();
    assert!(common::wait_until(Duration::from_secs(5), || {
        packet_io.packets_out_count("Ethernet8") == 1
            && packet_io.packets_out_count(SUBMIT_TO_INGRESS_PORT) == 1
    }));
    assert_eq!(packet_io.take_packets_out("Ethernet8")[0].as_ref(), b"hello");
}

#[test]
fn packet_in_reaches_the_primary() {
    let harness = common::harness();
    let mut session = common::primary_session(&harness);

    harness
        .packet_io()
        .push_packet_in("Ethernet4", "Ethernet8", &b"ping"[..])
        .unwrap();

    let packet = loop {
        let message = harness
            .block_on(session.next_message(Duration::from_secs(5)))
            .unwrap()
            .expect("stream ended");
        if let Some(stream_message_response::Update::Packet(packet)) = message.update {
            break packet;
        }
    };
    assert_eq!(packet.payload, b"ping".to_vec());
    assert_eq!(
        packet.metadata,
        vec![
            PacketMetadata {
                metadata_id: sai::PACKET_IN_INGRESS_PORT_ID,
                value: b"2".to_vec(),
            },
            PacketMetadata {
                metadata_id: sai::PACKET_IN_TARGET_EGRESS_PORT_ID,
                value: b"3".to_vec(),
            },
        ]
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn port_in_use_is_a_transport_error() {
    let first = common::harness_with(|_| {});
    assert_eq!(first.state(), HarnessState::Serving);

    let mut config = HarnessConfig::ephemeral();
    config.listener.port = first.grpc_port();
    assert!(matches!(
        Harness::new(config),
        Err(HarnessError::Transport { .. })
    ));
}

#[tokio::test]
async fn port_in_use_is_reported_from_an_async_context() {
    common::init_tracing();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();

    let mut config = common::test_config();
    config.listener.port = taken.local_addr().unwrap().port();
    match Harness::new(config) {
        Err(HarnessError::Transport { message }) => assert!(message.contains("failed to bind")),
        other => panic!("expected a transport error, got {:?}", other.map(|_| ())),
    }
}
