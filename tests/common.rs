//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;` in test
//! files.

#![allow(dead_code)]

use p4rt_harness::config::{ApplyMode, HarnessConfig};
use p4rt_harness::p4rt::proto::{
    self, field_match::FieldMatchType, table_action, Action, FieldMatch, TableAction, TableEntry,
};
use p4rt_harness::p4rt::P4RuntimeSession;
use p4rt_harness::sai;
use p4rt_harness::Harness;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

/// Election id used by the primary test controller.
pub const ELECTION_ID: u64 = 1;

/// Install a test subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("p4rt_harness=debug")
        .with_test_writer()
        .try_init();
}

/// Write `content` to a temporary config file.
pub fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}

/// Ephemeral-port config with short timeouts.
pub fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::ephemeral();
    config.listener.shutdown_grace_ms = 500;
    config.server.response_timeout_ms = 2_000;
    config
}

/// Start a harness on an ephemeral port, after adjusting the config.
pub fn harness_with(configure: impl FnOnce(&mut HarnessConfig)) -> Harness {
    init_tracing();
    let mut config = test_config();
    configure(&mut config);
    Harness::new(config).expect("Failed to start harness")
}

/// Start a harness with background apply and port id translation, with
/// Ethernet4 ↔ "2" and Ethernet8 ↔ "3" registered.
pub fn harness() -> Harness {
    let harness = harness_with(|c| c.server.translate_port_ids = true);
    harness.add_port("Ethernet4", "2");
    harness.add_port("Ethernet8", "3");
    harness
}

/// Same as [`harness`] but mutations wait for manual stepping.
pub fn manual_harness() -> Harness {
    let harness = harness_with(|c| {
        c.server.translate_port_ids = true;
        c.apply.mode = ApplyMode::Manual;
    });
    harness.add_port("Ethernet4", "2");
    harness.add_port("Ethernet8", "3");
    harness
}

/// Connect as primary and push the fixed SAI pipeline.
pub fn primary_session(harness: &Harness) -> P4RuntimeSession {
    let mut session = harness.connect(ELECTION_ID).expect("Failed to connect");
    harness
        .block_on(session.set_forwarding_pipeline_config(sai::fixed_l3_p4info()))
        .expect("Failed to set pipeline");
    session
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Entry builders
// ============================================================================

pub fn exact(field_id: u32, value: &[u8]) -> FieldMatch {
    FieldMatch {
        field_id,
        field_match_type: Some(FieldMatchType::Exact(proto::field_match::Exact {
            value: value.to_vec(),
        })),
    }
}

pub fn lpm(field_id: u32, value: &[u8], prefix_len: i32) -> FieldMatch {
    FieldMatch {
        field_id,
        field_match_type: Some(FieldMatchType::Lpm(proto::field_match::Lpm {
            value: value.to_vec(),
            prefix_len,
        })),
    }
}

pub fn action(action_id: u32, params: &[(u32, &[u8])]) -> Option<TableAction> {
    Some(TableAction {
        r#type: Some(table_action::Type::Action(Action {
            action_id,
            params: params
                .iter()
                .map(|(param_id, value)| proto::action::Param {
                    param_id: *param_id,
                    value: value.to_vec(),
                })
                .collect(),
        })),
    })
}

/// Router interface `rif` on controller port `port`.
pub fn router_interface(rif: &str, port: &str) -> TableEntry {
    TableEntry {
        table_id: sai::ROUTING_ROUTER_INTERFACE_TABLE_ID,
        r#match: vec![exact(1, rif.as_bytes())],
        action: action(
            sai::ROUTING_SET_PORT_AND_SRC_MAC_ACTION_ID,
            &[
                (1, port.as_bytes()),
                (2, &[0x02, 0x2a, 0x10, 0x00, 0x00, 0x03][..]),
            ],
        ),
        ..Default::default()
    }
}

/// IPv4 route in `vrf` for `addr/prefix_len` to nexthop `nexthop`.
pub fn ipv4_route(vrf: &str, addr: [u8; 4], prefix_len: i32, nexthop: &str) -> TableEntry {
    TableEntry {
        table_id: sai::ROUTING_IPV4_TABLE_ID,
        r#match: vec![exact(1, vrf.as_bytes()), lpm(2, &addr, prefix_len)],
        action: action(
            sai::ROUTING_SET_NEXTHOP_ID_ACTION_ID,
            &[(1, nexthop.as_bytes())],
        ),
        ..Default::default()
    }
}

/// IPv6 route in `vrf` that drops traffic to `addr/prefix_len`.
pub fn ipv6_drop_route(vrf: &str, addr: [u8; 16], prefix_len: i32) -> TableEntry {
    TableEntry {
        table_id: sai::ROUTING_IPV6_TABLE_ID,
        r#match: vec![exact(1, vrf.as_bytes()), lpm(2, &addr, prefix_len)],
        action: action(sai::ROUTING_DROP_ACTION_ID, &[]),
        ..Default::default()
    }
}

/// The same entry without its action, as sent for a delete.
pub fn without_action(entry: &TableEntry) -> TableEntry {
    TableEntry {
        action: None,
        ..entry.clone()
    }
}
