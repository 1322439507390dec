//! Fixed SAI tables.
//!
//! The routing tables every SAI P4 instantiation shares, with their stable
//! P4Runtime ids, plus a P4Info describing them for pipeline configuration.

use crate::p4rt::ir::PORT_TYPE_NAME;
use crate::p4rt::p4info::{
    action, controller_packet_metadata, match_field::MatchType, Action, ActionRef,
    ControllerPacketMetadata, MatchField, P4Info, P4NamedType, Preamble, Table,
};

// Table ids (8 most significant bits = 0x02).
pub const ROUTING_NEIGHBOR_TABLE_ID: u32 = 0x0200_0040;
pub const ROUTING_ROUTER_INTERFACE_TABLE_ID: u32 = 0x0200_0041;
pub const ROUTING_NEXTHOP_TABLE_ID: u32 = 0x0200_0042;
pub const ROUTING_IPV4_TABLE_ID: u32 = 0x0200_0044;
pub const ROUTING_IPV6_TABLE_ID: u32 = 0x0200_0045;
pub const L3_ADMIT_TABLE_ID: u32 = 0x0200_0047;

// Action ids (8 most significant bits = 0x01).
pub const ROUTING_SET_DST_MAC_ACTION_ID: u32 = 0x0100_0001;
pub const ROUTING_SET_PORT_AND_SRC_MAC_ACTION_ID: u32 = 0x0100_0002;
pub const ROUTING_SET_NEXTHOP_ACTION_ID: u32 = 0x0100_0003;
pub const ROUTING_SET_WCMP_GROUP_ID_ACTION_ID: u32 = 0x0100_0004;
pub const ROUTING_SET_NEXTHOP_ID_ACTION_ID: u32 = 0x0100_0005;
pub const ROUTING_DROP_ACTION_ID: u32 = 0x0100_0006;
pub const L3_ADMIT_ACTION_ID: u32 = 0x0100_0008;

// Controller header ids.
pub const PACKET_IN_HEADER_ID: u32 = 0x8100_0001;
pub const PACKET_OUT_HEADER_ID: u32 = 0x8100_0002;

// Packet metadata ids.
pub const PACKET_IN_INGRESS_PORT_ID: u32 = 1;
pub const PACKET_IN_TARGET_EGRESS_PORT_ID: u32 = 2;
pub const PACKET_OUT_EGRESS_PORT_ID: u32 = 1;
pub const PACKET_OUT_SUBMIT_TO_INGRESS_ID: u32 = 2;
pub const PACKET_OUT_UNUSED_PAD_ID: u32 = 3;

fn string_field(id: u32, name: &str, match_type: MatchType) -> MatchField {
    MatchField {
        id,
        name: name.to_string(),
        annotations: Vec::new(),
        bitwidth: 0,
        match_type: match_type as i32,
        type_name: None,
    }
}

fn formatted_field(id: u32, name: &str, match_type: MatchType, bitwidth: i32, format: &str) -> MatchField {
    MatchField {
        id,
        name: name.to_string(),
        annotations: vec![format.to_string()],
        bitwidth,
        match_type: match_type as i32,
        type_name: None,
    }
}

fn port_field(id: u32, name: &str, match_type: MatchType) -> MatchField {
    MatchField {
        type_name: Some(P4NamedType {
            name: PORT_TYPE_NAME.to_string(),
        }),
        ..string_field(id, name, match_type)
    }
}

fn string_param(id: u32, name: &str) -> action::Param {
    action::Param {
        id,
        name: name.to_string(),
        annotations: Vec::new(),
        bitwidth: 0,
        type_name: None,
    }
}

fn port_param(id: u32, name: &str) -> action::Param {
    action::Param {
        type_name: Some(P4NamedType {
            name: PORT_TYPE_NAME.to_string(),
        }),
        ..string_param(id, name)
    }
}

fn mac_param(id: u32, name: &str) -> action::Param {
    action::Param {
        id,
        name: name.to_string(),
        annotations: vec!["@format(MAC_ADDRESS)".to_string()],
        bitwidth: 48,
        type_name: None,
    }
}

fn routing_action(id: u32, alias: &str, params: Vec<action::Param>) -> Action {
    Action {
        preamble: Some(Preamble::new(id, format!("ingress.routing.{}", alias), alias)),
        params,
    }
}

fn routing_table(id: u32, alias: &str, match_fields: Vec<MatchField>, actions: &[u32]) -> Table {
    Table {
        preamble: Some(Preamble::new(id, format!("ingress.routing.{}", alias), alias)),
        match_fields,
        action_refs: actions
            .iter()
            .map(|id| ActionRef {
                id: *id,
                annotations: Vec::new(),
            })
            .collect(),
        size: 1024,
    }
}

fn metadata(id: u32, name: &str, bitwidth: i32, port: bool) -> controller_packet_metadata::Metadata {
    controller_packet_metadata::Metadata {
        id,
        name: name.to_string(),
        annotations: Vec::new(),
        bitwidth,
        type_name: port.then(|| P4NamedType {
            name: PORT_TYPE_NAME.to_string(),
        }),
    }
}

/// P4Info for the fixed L3 routing tables.
pub fn fixed_l3_p4info() -> P4Info {
    let route_actions = [
        ROUTING_DROP_ACTION_ID,
        ROUTING_SET_NEXTHOP_ID_ACTION_ID,
        ROUTING_SET_WCMP_GROUP_ID_ACTION_ID,
    ];

    P4Info {
        tables: vec![
            routing_table(
                ROUTING_NEIGHBOR_TABLE_ID,
                "neighbor_table",
                vec![
                    string_field(1, "router_interface_id", MatchType::Exact),
                    string_field(2, "neighbor_id", MatchType::Exact),
                ],
                &[ROUTING_SET_DST_MAC_ACTION_ID],
            ),
            routing_table(
                ROUTING_ROUTER_INTERFACE_TABLE_ID,
                "router_interface_table",
                vec![string_field(1, "router_interface_id", MatchType::Exact)],
                &[ROUTING_SET_PORT_AND_SRC_MAC_ACTION_ID],
            ),
            routing_table(
                ROUTING_NEXTHOP_TABLE_ID,
                "nexthop_table",
                vec![string_field(1, "nexthop_id", MatchType::Exact)],
                &[ROUTING_SET_NEXTHOP_ACTION_ID],
            ),
            routing_table(
                ROUTING_IPV4_TABLE_ID,
                "ipv4_table",
                vec![
                    string_field(1, "vrf_id", MatchType::Exact),
                    formatted_field(2, "ipv4_dst", MatchType::Lpm, 32, "@format(IPV4_ADDRESS)"),
                ],
                &route_actions,
            ),
            routing_table(
                ROUTING_IPV6_TABLE_ID,
                "ipv6_table",
                vec![
                    string_field(1, "vrf_id", MatchType::Exact),
                    formatted_field(2, "ipv6_dst", MatchType::Lpm, 128, "@format(IPV6_ADDRESS)"),
                ],
                &route_actions,
            ),
            routing_table(
                L3_ADMIT_TABLE_ID,
                "l3_admit_table",
                vec![
                    formatted_field(1, "dst_mac", MatchType::Ternary, 48, "@format(MAC_ADDRESS)"),
                    port_field(2, "in_port", MatchType::Optional),
                ],
                &[L3_ADMIT_ACTION_ID],
            ),
        ],
        actions: vec![
            routing_action(
                ROUTING_SET_DST_MAC_ACTION_ID,
                "set_dst_mac",
                vec![mac_param(1, "dst_mac")],
            ),
            routing_action(
                ROUTING_SET_PORT_AND_SRC_MAC_ACTION_ID,
                "set_port_and_src_mac",
                vec![port_param(1, "port"), mac_param(2, "src_mac")],
            ),
            routing_action(
                ROUTING_SET_NEXTHOP_ACTION_ID,
                "set_nexthop",
                vec![
                    string_param(1, "router_interface_id"),
                    string_param(2, "neighbor_id"),
                ],
            ),
            routing_action(
                ROUTING_SET_WCMP_GROUP_ID_ACTION_ID,
                "set_wcmp_group_id",
                vec![string_param(1, "wcmp_group_id")],
            ),
            routing_action(
                ROUTING_SET_NEXTHOP_ID_ACTION_ID,
                "set_nexthop_id",
                vec![string_param(1, "nexthop_id")],
            ),
            routing_action(ROUTING_DROP_ACTION_ID, "drop", Vec::new()),
            routing_action(L3_ADMIT_ACTION_ID, "admit_to_l3", Vec::new()),
        ],
        controller_packet_metadata: vec![
            ControllerPacketMetadata {
                preamble: Some(Preamble::new(PACKET_IN_HEADER_ID, "packet_in", "packet_in")),
                metadata: vec![
                    metadata(PACKET_IN_INGRESS_PORT_ID, "ingress_port", 0, true),
                    metadata(PACKET_IN_TARGET_EGRESS_PORT_ID, "target_egress_port", 0, true),
                ],
            },
            ControllerPacketMetadata {
                preamble: Some(Preamble::new(PACKET_OUT_HEADER_ID, "packet_out", "packet_out")),
                metadata: vec![
                    metadata(PACKET_OUT_EGRESS_PORT_ID, "egress_port", 0, true),
                    metadata(PACKET_OUT_SUBMIT_TO_INGRESS_ID, "submit_to_ingress", 1, false),
                    metadata(PACKET_OUT_UNUSED_PAD_ID, "unused_pad", 7, false),
                ],
            },
        ],
    }
}
