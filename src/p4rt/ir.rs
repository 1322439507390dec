//! Intermediate representation of P4 programs and table entries.
//!
//! PI entries use numeric ids and raw byte strings. The IR names everything
//! (table alias, match field name, action alias, parameter name) and renders
//! values as formatted strings such as `00:02:03:04:05:06` or `10.81.8.0`.
//! [`IrP4Info`] holds the schema lookups both directions of translation use.

use super::p4info::{self, match_field::MatchType};
use super::proto::{self, field_match::FieldMatchType};
use crate::core::error::{HarnessError, HarnessResult};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Named type marking fields that carry port identifiers.
pub const PORT_TYPE_NAME: &str = "port_id_t";

// ============================================================================
// Value formats
// ============================================================================

/// How a field's bytes are rendered in the IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Arbitrary UTF-8 string (translated fields, bitwidth 0).
    String,
    /// `aa:bb:cc:dd:ee:ff`.
    Mac,
    /// Dotted quad.
    Ipv4,
    /// RFC 5952 text.
    Ipv6,
    /// `0x`-prefixed lowercase hex.
    HexString,
}

impl Format {
    fn from_annotations(annotations: &[String], bitwidth: i32) -> Self {
        for annotation in annotations {
            match annotation.as_str() {
                "@format(MAC_ADDRESS)" => return Self::Mac,
                "@format(IPV4_ADDRESS)" => return Self::Ipv4,
                "@format(IPV6_ADDRESS)" => return Self::Ipv6,
                _ => {}
            }
        }
        if bitwidth == 0 {
            Self::String
        } else {
            Self::HexString
        }
    }
}

fn is_port_type(type_name: &Option<p4info::P4NamedType>) -> bool {
    type_name
        .as_ref()
        .map(|t| t.name == PORT_TYPE_NAME)
        .unwrap_or(false)
}

/// Drop leading zero bytes, keeping at least one byte.
pub fn canonical_bytes(bytes: &[u8]) -> Vec<u8> {
    match bytes.iter().position(|b| *b != 0) {
        Some(first) => bytes[first..].to_vec(),
        None if bytes.is_empty() => Vec::new(),
        None => vec![0],
    }
}

fn padded<const N: usize>(bytes: &[u8], what: &str) -> HarnessResult<[u8; N]> {
    let canonical = canonical_bytes(bytes);
    if canonical.len() > N {
        return Err(HarnessError::invalid_argument(format!(
            "{} is {} bytes, expected at most {}",
            what,
            canonical.len(),
            N
        )));
    }
    let mut out = [0u8; N];
    out[N - canonical.len()..].copy_from_slice(&canonical);
    Ok(out)
}

fn bit_length(bytes: &[u8]) -> usize {
    let canonical = canonical_bytes(bytes);
    match canonical.first() {
        None | Some(0) => 0,
        Some(first) => (canonical.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
    }
}

/// Render PI bytes in `format`.
pub fn bytes_to_ir(bytes: &[u8], format: Format, bitwidth: i32, what: &str) -> HarnessResult<String> {
    if bytes.is_empty() {
        return Err(HarnessError::invalid_argument(format!(
            "{} has an empty value",
            what
        )));
    }
    match format {
        Format::String => String::from_utf8(bytes.to_vec()).map_err(|_| {
            HarnessError::invalid_argument(format!("{} is not a valid UTF-8 string", what))
        }),
        Format::Mac => {
            let mac: [u8; 6] = padded(bytes, what)?;
            Ok(mac
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(":"))
        }
        Format::Ipv4 => {
            let octets: [u8; 4] = padded(bytes, what)?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        Format::Ipv6 => {
            let octets: [u8; 16] = padded(bytes, what)?;
            Ok(Ipv6Addr::from(octets).to_string())
        }
        Format::HexString => {
            if bitwidth > 0 && bit_length(bytes) > bitwidth as usize {
                return Err(HarnessError::invalid_argument(format!(
                    "{} does not fit in {} bits",
                    what, bitwidth
                )));
            }
            let hex: String = canonical_bytes(bytes)
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect();
            Ok(format!("0x{}", hex))
        }
    }
}

/// Encode an IR string as canonical PI bytes.
pub fn ir_to_bytes(value: &str, format: Format, what: &str) -> HarnessResult<Vec<u8>> {
    let invalid = || HarnessError::invalid_argument(format!("{} has malformed value: {}", what, value));
    match format {
        Format::String => {
            if value.is_empty() {
                return Err(invalid());
            }
            Ok(value.as_bytes().to_vec())
        }
        Format::Mac => {
            let parts: Vec<&str> = value.split(':').collect();
            if parts.len() != 6 {
                return Err(invalid());
            }
            let mut mac = Vec::with_capacity(6);
            for part in parts {
                mac.push(u8::from_str_radix(part, 16).map_err(|_| invalid())?);
            }
            Ok(canonical_bytes(&mac))
        }
        Format::Ipv4 => {
            let addr: Ipv4Addr = value.parse().map_err(|_| invalid())?;
            Ok(canonical_bytes(&addr.octets()))
        }
        Format::Ipv6 => {
            let addr: Ipv6Addr = value.parse().map_err(|_| invalid())?;
            Ok(canonical_bytes(&addr.octets()))
        }
        Format::HexString => {
            let digits = value.strip_prefix("0x").ok_or_else(invalid)?;
            if digits.is_empty() {
                return Err(invalid());
            }
            let even = if digits.len() % 2 == 1 {
                format!("0{}", digits)
            } else {
                digits.to_string()
            };
            let mut bytes = Vec::with_capacity(even.len() / 2);
            for i in (0..even.len()).step_by(2) {
                let pair = even.get(i..i + 2).ok_or_else(invalid)?;
                bytes.push(u8::from_str_radix(pair, 16).map_err(|_| invalid())?);
            }
            Ok(canonical_bytes(&bytes))
        }
    }
}

fn check_prefix(bytes: &[u8], prefix_len: i32, bitwidth: i32, what: &str) -> HarnessResult<()> {
    if prefix_len < 0 || prefix_len > bitwidth {
        return Err(HarnessError::invalid_argument(format!(
            "{} has prefix length {} outside 0..={}",
            what, prefix_len, bitwidth
        )));
    }
    let width = (bitwidth as usize).div_ceil(8);
    let canonical = canonical_bytes(bytes);
    if canonical.len() > width {
        return Err(HarnessError::invalid_argument(format!(
            "{} does not fit in {} bits",
            what, bitwidth
        )));
    }
    let mut full = vec![0u8; width - canonical.len()];
    full.extend_from_slice(&canonical);
    // Bits are counted from the most significant bit of a `bitwidth`-bit value.
    let lead = width * 8 - bitwidth as usize;
    for (i, byte) in full.iter().enumerate() {
        for bit in 0..8 {
            let pos = i * 8 + bit;
            if pos < lead {
                continue;
            }
            let set = byte & (0x80 >> bit) != 0;
            if set && pos - lead >= prefix_len as usize {
                return Err(HarnessError::invalid_argument(format!(
                    "{} has bits set beyond prefix length {}",
                    what, prefix_len
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Schema
// ============================================================================

/// Match field definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrMatchFieldDefinition {
    pub id: u32,
    pub name: String,
    pub match_type: MatchType,
    pub format: Format,
    pub bitwidth: i32,
    pub is_port: bool,
}

/// Action parameter (or packet metadata) definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrParamDefinition {
    pub id: u32,
    pub name: String,
    pub format: Format,
    pub bitwidth: i32,
    pub is_port: bool,
}

/// Action definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrActionDefinition {
    pub id: u32,
    pub name: String,
    pub alias: String,
    pub params: BTreeMap<u32, IrParamDefinition>,
}

impl IrActionDefinition {
    fn param_by_name(&self, name: &str) -> Option<&IrParamDefinition> {
        self.params.values().find(|p| p.name == name)
    }
}

/// Table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrTableDefinition {
    pub id: u32,
    pub name: String,
    pub alias: String,
    pub match_fields: BTreeMap<u32, IrMatchFieldDefinition>,
    pub action_ids: Vec<u32>,
    pub size: i64,
}

impl IrTableDefinition {
    /// Entries need a priority iff the table has ternary or optional matches.
    pub fn requires_priority(&self) -> bool {
        self.match_fields
            .values()
            .any(|f| matches!(f.match_type, MatchType::Ternary | MatchType::Optional))
    }

    /// Look up a match field by name.
    pub fn match_field_by_name(&self, name: &str) -> Option<&IrMatchFieldDefinition> {
        self.match_fields.values().find(|f| f.name == name)
    }
}

/// Validated, indexed P4Info.
#[derive(Debug, Clone, PartialEq)]
pub struct IrP4Info {
    p4info: p4info::P4Info,
    tables: BTreeMap<u32, IrTableDefinition>,
    tables_by_alias: HashMap<String, u32>,
    actions: BTreeMap<u32, IrActionDefinition>,
    actions_by_alias: HashMap<String, u32>,
    packet_in_metadata: BTreeMap<u32, IrParamDefinition>,
    packet_out_metadata: BTreeMap<u32, IrParamDefinition>,
}

fn preamble(preamble: &Option<p4info::Preamble>, what: &str) -> HarnessResult<p4info::Preamble> {
    let preamble = preamble
        .clone()
        .ok_or_else(|| HarnessError::invalid_argument(format!("{} is missing its preamble", what)))?;
    if preamble.id == 0 || preamble.name.is_empty() {
        return Err(HarnessError::invalid_argument(format!(
            "{} has an invalid preamble (id {}, name '{}')",
            what, preamble.id, preamble.name
        )));
    }
    Ok(preamble)
}

fn alias_of(preamble: &p4info::Preamble) -> String {
    if preamble.alias.is_empty() {
        preamble.name.clone()
    } else {
        preamble.alias.clone()
    }
}

impl IrP4Info {
    /// Validate and index a P4Info.
    pub fn from_p4info(info: &p4info::P4Info) -> HarnessResult<Self> {
        let mut actions = BTreeMap::new();
        let mut actions_by_alias = HashMap::new();
        for action in &info.actions {
            let pre = preamble(&action.preamble, "action")?;
            let alias = alias_of(&pre);
            let mut params = BTreeMap::new();
            for param in &action.params {
                let definition = IrParamDefinition {
                    id: param.id,
                    name: param.name.clone(),
                    format: Format::from_annotations(&param.annotations, param.bitwidth),
                    bitwidth: param.bitwidth,
                    is_port: is_port_type(&param.type_name),
                };
                if params.insert(param.id, definition).is_some() {
                    return Err(HarnessError::invalid_argument(format!(
                        "action {} has duplicate param id {}",
                        alias, param.id
                    )));
                }
            }
            if actions_by_alias.insert(alias.clone(), pre.id).is_some() {
                return Err(HarnessError::invalid_argument(format!(
                    "duplicate action alias {}",
                    alias
                )));
            }
            let definition = IrActionDefinition {
                id: pre.id,
                name: pre.name.clone(),
                alias,
                params,
            };
            if actions.insert(pre.id, definition).is_some() {
                return Err(HarnessError::invalid_argument(format!(
                    "duplicate action id {}",
                    pre.id
                )));
            }
        }

        let mut tables = BTreeMap::new();
        let mut tables_by_alias = HashMap::new();
        for table in &info.tables {
            let pre = preamble(&table.preamble, "table")?;
            let alias = alias_of(&pre);
            let mut match_fields = BTreeMap::new();
            for field in &table.match_fields {
                let match_type = MatchType::try_from(field.match_type).map_err(|_| {
                    HarnessError::invalid_argument(format!(
                        "table {} field {} has unknown match type {}",
                        alias, field.name, field.match_type
                    ))
                })?;
                if matches!(match_type, MatchType::Unspecified | MatchType::Range) {
                    return Err(HarnessError::unimplemented(format!(
                        "table {} field {} uses unsupported match type {:?}",
                        alias, field.name, match_type
                    )));
                }
                let definition = IrMatchFieldDefinition {
                    id: field.id,
                    name: field.name.clone(),
                    match_type,
                    format: Format::from_annotations(&field.annotations, field.bitwidth),
                    bitwidth: field.bitwidth,
                    is_port: is_port_type(&field.type_name),
                };
                if match_fields.insert(field.id, definition).is_some() {
                    return Err(HarnessError::invalid_argument(format!(
                        "table {} has duplicate match field id {}",
                        alias, field.id
                    )));
                }
            }
            let mut action_ids = Vec::with_capacity(table.action_refs.len());
            for action_ref in &table.action_refs {
                if !actions.contains_key(&action_ref.id) {
                    return Err(HarnessError::invalid_argument(format!(
                        "table {} references unknown action id {}",
                        alias, action_ref.id
                    )));
                }
                action_ids.push(action_ref.id);
            }
            if tables_by_alias.insert(alias.clone(), pre.id).is_some() {
                return Err(HarnessError::invalid_argument(format!(
                    "duplicate table alias {}",
                    alias
                )));
            }
            let definition = IrTableDefinition {
                id: pre.id,
                name: pre.name.clone(),
                alias,
                match_fields,
                action_ids,
                size: table.size,
            };
            if tables.insert(pre.id, definition).is_some() {
                return Err(HarnessError::invalid_argument(format!(
                    "duplicate table id {}",
                    pre.id
                )));
            }
        }

        let mut packet_in_metadata = BTreeMap::new();
        let mut packet_out_metadata = BTreeMap::new();
        for header in &info.controller_packet_metadata {
            let pre = preamble(&header.preamble, "controller packet metadata")?;
            let target = match pre.name.as_str() {
                "packet_in" => &mut packet_in_metadata,
                "packet_out" => &mut packet_out_metadata,
                other => {
                    tracing::debug!(name = %other, "ignoring controller packet metadata");
                    continue;
                }
            };
            for meta in &header.metadata {
                target.insert(
                    meta.id,
                    IrParamDefinition {
                        id: meta.id,
                        name: meta.name.clone(),
                        format: Format::from_annotations(&meta.annotations, meta.bitwidth),
                        bitwidth: meta.bitwidth,
                        is_port: is_port_type(&meta.type_name),
                    },
                );
            }
        }

        Ok(Self {
            p4info: info.clone(),
            tables,
            tables_by_alias,
            actions,
            actions_by_alias,
            packet_in_metadata,
            packet_out_metadata,
        })
    }

    /// The P4Info this was built from.
    pub fn p4info(&self) -> &p4info::P4Info {
        &self.p4info
    }

    pub fn table(&self, id: u32) -> Option<&IrTableDefinition> {
        self.tables.get(&id)
    }

    pub fn table_by_alias(&self, alias: &str) -> Option<&IrTableDefinition> {
        self.tables_by_alias.get(alias).and_then(|id| self.tables.get(id))
    }

    pub fn tables(&self) -> impl Iterator<Item = &IrTableDefinition> {
        self.tables.values()
    }

    pub fn action(&self, id: u32) -> Option<&IrActionDefinition> {
        self.actions.get(&id)
    }

    pub fn action_by_alias(&self, alias: &str) -> Option<&IrActionDefinition> {
        self.actions_by_alias.get(alias).and_then(|id| self.actions.get(id))
    }

    /// Packet-in metadata by name.
    pub fn packet_in_metadata(&self, name: &str) -> Option<&IrParamDefinition> {
        self.packet_in_metadata.values().find(|m| m.name == name)
    }

    /// Packet-out metadata by id.
    pub fn packet_out_metadata(&self, id: u32) -> Option<&IrParamDefinition> {
        self.packet_out_metadata.get(&id)
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Match value in IR form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrMatchValue {
    Exact(String),
    Lpm { value: String, prefix_len: i32 },
    Ternary { value: String, mask: String },
    Optional(String),
}

impl IrMatchValue {
    /// Text used in AppDb keys: `v`, `v/len` or `v&mask`.
    pub fn to_app_db_string(&self) -> String {
        match self {
            Self::Exact(v) | Self::Optional(v) => v.clone(),
            Self::Lpm { value, prefix_len } => format!("{}/{}", value, prefix_len),
            Self::Ternary { value, mask } => format!("{}&{}", value, mask),
        }
    }

    /// Parse AppDb key text for a field of `match_type`.
    pub fn from_app_db_string(text: &str, match_type: MatchType) -> HarnessResult<Self> {
        let malformed = || {
            HarnessError::invalid_argument(format!(
                "malformed {:?} match value: {}",
                match_type, text
            ))
        };
        match match_type {
            MatchType::Exact => Ok(Self::Exact(text.to_string())),
            MatchType::Optional => Ok(Self::Optional(text.to_string())),
            MatchType::Lpm => {
                let (value, len) = text.rsplit_once('/').ok_or_else(malformed)?;
                let prefix_len = len.parse().map_err(|_| malformed())?;
                Ok(Self::Lpm {
                    value: value.to_string(),
                    prefix_len,
                })
            }
            MatchType::Ternary => {
                let (value, mask) = text.split_once('&').ok_or_else(malformed)?;
                Ok(Self::Ternary {
                    value: value.to_string(),
                    mask: mask.to_string(),
                })
            }
            MatchType::Unspecified | MatchType::Range => Err(malformed()),
        }
    }

    fn map_values<F>(&mut self, f: &F) -> HarnessResult<()>
    where
        F: Fn(&str) -> HarnessResult<String>,
    {
        match self {
            Self::Exact(v) | Self::Optional(v) => *v = f(v)?,
            Self::Lpm { value, .. } => *value = f(value)?,
            Self::Ternary { value, .. } => *value = f(value)?,
        }
        Ok(())
    }
}

/// One match of an IR entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrMatch {
    pub name: String,
    pub value: IrMatchValue,
}

/// Action invocation of an IR entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrActionInvocation {
    pub name: String,
    pub params: Vec<(String, String)>,
}

/// Table entry in IR form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrTableEntry {
    /// Table alias.
    pub table_name: String,
    /// Matches in field-id order.
    pub matches: Vec<IrMatch>,
    pub priority: i32,
    pub action: Option<IrActionInvocation>,
}

impl IrTableEntry {
    /// Value of the named match, as AppDb text.
    pub fn match_value(&self, name: &str) -> Option<String> {
        self.matches
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value.to_app_db_string())
    }

    /// Rewrite every port-typed match and parameter value with `f`.
    pub fn map_port_values<F>(&mut self, info: &IrP4Info, f: F) -> HarnessResult<()>
    where
        F: Fn(&str) -> HarnessResult<String>,
    {
        let table = info.table_by_alias(&self.table_name).ok_or_else(|| {
            HarnessError::invalid_argument(format!("unknown table {}", self.table_name))
        })?;
        for m in &mut self.matches {
            if table
                .match_field_by_name(&m.name)
                .map(|d| d.is_port)
                .unwrap_or(false)
            {
                m.value.map_values(&f)?;
            }
        }
        if let Some(action) = &mut self.action {
            let definition = info.action_by_alias(&action.name).ok_or_else(|| {
                HarnessError::invalid_argument(format!("unknown action {}", action.name))
            })?;
            for (name, value) in &mut action.params {
                if definition
                    .param_by_name(name)
                    .map(|p| p.is_port)
                    .unwrap_or(false)
                {
                    *value = f(value)?;
                }
            }
        }
        Ok(())
    }
}

/// Whether the action is mandatory for the update being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionRequirement {
    /// INSERT and MODIFY.
    Required,
    /// DELETE: identified by its matches alone.
    Optional,
}

fn translate_match(
    table: &IrTableDefinition,
    pi: &proto::FieldMatch,
) -> HarnessResult<IrMatch> {
    let field = table.match_fields.get(&pi.field_id).ok_or_else(|| {
        HarnessError::invalid_argument(format!(
            "table {} has no match field with id {}",
            table.alias, pi.field_id
        ))
    })?;
    let what = format!("match field {}", field.name);
    let kind = pi.field_match_type.as_ref().ok_or_else(|| {
        HarnessError::invalid_argument(format!("{} is missing a value", what))
    })?;
    let value = match (field.match_type, kind) {
        (MatchType::Exact, FieldMatchType::Exact(exact)) => {
            IrMatchValue::Exact(bytes_to_ir(&exact.value, field.format, field.bitwidth, &what)?)
        }
        (MatchType::Lpm, FieldMatchType::Lpm(lpm)) => {
            if lpm.prefix_len == 0 {
                return Err(HarnessError::invalid_argument(format!(
                    "{} is a wildcard LPM match and must be omitted",
                    what
                )));
            }
            check_prefix(&lpm.value, lpm.prefix_len, field.bitwidth, &what)?;
            IrMatchValue::Lpm {
                value: bytes_to_ir(&lpm.value, field.format, field.bitwidth, &what)?,
                prefix_len: lpm.prefix_len,
            }
        }
        (MatchType::Ternary, FieldMatchType::Ternary(ternary)) => {
            let value = canonical_bytes(&ternary.value);
            let mask = canonical_bytes(&ternary.mask);
            if mask.iter().all(|b| *b == 0) {
                return Err(HarnessError::invalid_argument(format!(
                    "{} is a wildcard ternary match and must be omitted",
                    what
                )));
            }
            // value & !mask must be zero; align both on the right.
            let width = value.len().max(mask.len());
            let pad = |b: &[u8]| {
                let mut v = vec![0u8; width - b.len()];
                v.extend_from_slice(b);
                v
            };
            if pad(&value)
                .iter()
                .zip(pad(&mask).iter())
                .any(|(v, m)| v & !m != 0)
            {
                return Err(HarnessError::invalid_argument(format!(
                    "{} has value bits outside its mask",
                    what
                )));
            }
            IrMatchValue::Ternary {
                value: bytes_to_ir(&ternary.value, field.format, field.bitwidth, &what)?,
                mask: bytes_to_ir(&ternary.mask, field.format, field.bitwidth, &what)?,
            }
        }
        (MatchType::Optional, FieldMatchType::Optional(optional)) => IrMatchValue::Optional(
            bytes_to_ir(&optional.value, field.format, field.bitwidth, &what)?,
        ),
        (expected, _) => {
            return Err(HarnessError::invalid_argument(format!(
                "{} expects a {:?} match",
                what, expected
            )))
        }
    };
    Ok(IrMatch {
        name: field.name.clone(),
        value,
    })
}

fn translate_action(
    info: &IrP4Info,
    table: &IrTableDefinition,
    pi: &proto::Action,
) -> HarnessResult<IrActionInvocation> {
    let action = info.action(pi.action_id).ok_or_else(|| {
        HarnessError::invalid_argument(format!("unknown action id {}", pi.action_id))
    })?;
    if !table.action_ids.contains(&pi.action_id) {
        return Err(HarnessError::invalid_argument(format!(
            "action {} is not valid for table {}",
            action.alias, table.alias
        )));
    }
    let mut by_id = BTreeMap::new();
    for param in &pi.params {
        let definition = action.params.get(&param.param_id).ok_or_else(|| {
            HarnessError::invalid_argument(format!(
                "action {} has no param with id {}",
                action.alias, param.param_id
            ))
        })?;
        let what = format!("param {} of action {}", definition.name, action.alias);
        let value = bytes_to_ir(&param.value, definition.format, definition.bitwidth, &what)?;
        if by_id.insert(param.param_id, (definition.name.clone(), value)).is_some() {
            return Err(HarnessError::invalid_argument(format!("duplicate {}", what)));
        }
    }
    if let Some(missing) = action.params.values().find(|p| !by_id.contains_key(&p.id)) {
        return Err(HarnessError::invalid_argument(format!(
            "action {} is missing param {}",
            action.alias, missing.name
        )));
    }
    Ok(IrActionInvocation {
        name: action.alias.clone(),
        params: by_id.into_values().collect(),
    })
}

/// Translate a PI table entry into IR.
pub fn pi_to_ir(
    info: &IrP4Info,
    entry: &proto::TableEntry,
    requirement: ActionRequirement,
) -> HarnessResult<IrTableEntry> {
    let table = info.table(entry.table_id).ok_or_else(|| {
        HarnessError::invalid_argument(format!("unknown table id {}", entry.table_id))
    })?;

    let mut seen = HashSet::new();
    let mut matches = BTreeMap::new();
    for pi_match in &entry.r#match {
        if !seen.insert(pi_match.field_id) {
            return Err(HarnessError::invalid_argument(format!(
                "table {} has duplicate match field id {}",
                table.alias, pi_match.field_id
            )));
        }
        matches.insert(pi_match.field_id, translate_match(table, pi_match)?);
    }
    if let Some(missing) = table
        .match_fields
        .values()
        .find(|f| f.match_type == MatchType::Exact && !matches.contains_key(&f.id))
    {
        return Err(HarnessError::invalid_argument(format!(
            "table {} is missing exact match field {}",
            table.alias, missing.name
        )));
    }

    if table.requires_priority() {
        if entry.priority <= 0 {
            return Err(HarnessError::invalid_argument(format!(
                "table {} requires a positive priority",
                table.alias
            )));
        }
    } else if entry.priority != 0 {
        return Err(HarnessError::invalid_argument(format!(
            "table {} does not take a priority, got {}",
            table.alias, entry.priority
        )));
    }

    let action = match entry.action.as_ref().and_then(|a| a.r#type.as_ref()) {
        Some(proto::table_action::Type::Action(action)) => {
            Some(translate_action(info, table, action)?)
        }
        None if requirement == ActionRequirement::Required => {
            return Err(HarnessError::invalid_argument(format!(
                "entry for table {} is missing an action",
                table.alias
            )))
        }
        None => None,
    };

    Ok(IrTableEntry {
        table_name: table.alias.clone(),
        matches: matches.into_values().collect(),
        priority: entry.priority,
        action,
    })
}

/// Translate an IR table entry back into PI.
pub fn ir_to_pi(info: &IrP4Info, entry: &IrTableEntry) -> HarnessResult<proto::TableEntry> {
    let table = info.table_by_alias(&entry.table_name).ok_or_else(|| {
        HarnessError::invalid_argument(format!("unknown table {}", entry.table_name))
    })?;

    let mut matches = Vec::with_capacity(entry.matches.len());
    for ir_match in &entry.matches {
        let field = table.match_field_by_name(&ir_match.name).ok_or_else(|| {
            HarnessError::invalid_argument(format!(
                "table {} has no match field {}",
                table.alias, ir_match.name
            ))
        })?;
        let what = format!("match field {}", field.name);
        let kind = match &ir_match.value {
            IrMatchValue::Exact(v) => FieldMatchType::Exact(proto::field_match::Exact {
                value: ir_to_bytes(v, field.format, &what)?,
            }),
            IrMatchValue::Lpm { value, prefix_len } => {
                FieldMatchType::Lpm(proto::field_match::Lpm {
                    value: ir_to_bytes(value, field.format, &what)?,
                    prefix_len: *prefix_len,
                })
            }
            IrMatchValue::Ternary { value, mask } => {
                FieldMatchType::Ternary(proto::field_match::Ternary {
                    value: ir_to_bytes(value, field.format, &what)?,
                    mask: ir_to_bytes(mask, field.format, &what)?,
                })
            }
            IrMatchValue::Optional(v) => FieldMatchType::Optional(proto::field_match::Optional {
                value: ir_to_bytes(v, field.format, &what)?,
            }),
        };
        matches.push(proto::FieldMatch {
            field_id: field.id,
            field_match_type: Some(kind),
        });
    }
    matches.sort_by_key(|m| m.field_id);

    let action = match &entry.action {
        Some(invocation) => {
            let definition = info.action_by_alias(&invocation.name).ok_or_else(|| {
                HarnessError::invalid_argument(format!("unknown action {}", invocation.name))
            })?;
            let mut params = Vec::with_capacity(invocation.params.len());
            for (name, value) in &invocation.params {
                let param = definition.param_by_name(name).ok_or_else(|| {
                    HarnessError::invalid_argument(format!(
                        "action {} has no param {}",
                        definition.alias, name
                    ))
                })?;
                let what = format!("param {} of action {}", name, definition.alias);
                params.push(proto::action::Param {
                    param_id: param.id,
                    value: ir_to_bytes(value, param.format, &what)?,
                });
            }
            params.sort_by_key(|p| p.param_id);
            Some(proto::TableAction {
                r#type: Some(proto::table_action::Type::Action(proto::Action {
                    action_id: definition.id,
                    params,
                })),
            })
        }
        None => None,
    };

    Ok(proto::TableEntry {
        table_id: table.id,
        r#match: matches,
        action,
        priority: entry.priority,
        counter_data: None,
    })
}

impl fmt::Display for IrTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.table_name)?;
        for (i, m) in self.matches.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", m.name, m.value.to_app_db_string())?;
        }
        f.write_str(")")?;
        if let Some(action) = &self.action {
            write!(f, " -> {}", action.name)?;
        }
        Ok(())
    }
}
