//! Translation between IR table entries and P4RT AppDb rows.
//!
//! A row key is `FIXED_<ALIAS>:<json>` where the JSON object holds one
//! `match/<field>` entry per match plus `priority` when it is non-zero. The
//! object is serialized with sorted keys, so one entry always maps to one key.
//! Row fields are `action` followed by one `param/<name>` per parameter.

use crate::core::error::{HarnessError, HarnessResult};
use crate::p4rt::ir::{IrActionInvocation, IrMatch, IrMatchValue, IrP4Info, IrTableEntry};
use crate::swss::FieldValues;
use serde_json::{Map, Value};

/// Prefix of AppDb table names for fixed (SAI) tables.
pub const FIXED_TABLE_PREFIX: &str = "FIXED_";

const MATCH_PREFIX: &str = "match/";
const PARAM_PREFIX: &str = "param/";

/// AppDb table name for a P4Info table alias.
pub fn app_db_table_name(alias: &str) -> String {
    format!("{}{}", FIXED_TABLE_PREFIX, alias.to_ascii_uppercase())
}

/// Row key for an entry.
pub fn ir_table_entry_to_app_db_key(entry: &IrTableEntry) -> String {
    let mut object = Map::new();
    for m in &entry.matches {
        object.insert(
            format!("{}{}", MATCH_PREFIX, m.name),
            Value::String(m.value.to_app_db_string()),
        );
    }
    if entry.priority != 0 {
        object.insert("priority".to_string(), Value::from(entry.priority));
    }
    format!(
        "{}:{}",
        app_db_table_name(&entry.table_name),
        Value::Object(object)
    )
}

/// Row fields for an entry.
pub fn ir_table_entry_to_app_db_values(entry: &IrTableEntry) -> HarnessResult<FieldValues> {
    let action = entry.action.as_ref().ok_or_else(|| {
        HarnessError::invalid_argument(format!(
            "entry for table {} has no action",
            entry.table_name
        ))
    })?;
    let mut values = Vec::with_capacity(action.params.len() + 1);
    values.push(("action".to_string(), action.name.clone()));
    for (name, value) in &action.params {
        values.push((format!("{}{}", PARAM_PREFIX, name), value.clone()));
    }
    Ok(values)
}

/// Rebuild an IR entry from a row.
pub fn app_db_to_ir_table_entry(
    info: &IrP4Info,
    key: &str,
    values: &FieldValues,
) -> HarnessResult<IrTableEntry> {
    let (table_part, json) = key.split_once(':').ok_or_else(|| {
        HarnessError::invalid_argument(format!("AppDb key has no table separator: {}", key))
    })?;
    let table = info
        .tables()
        .find(|t| app_db_table_name(&t.alias) == table_part)
        .ok_or_else(|| {
            HarnessError::invalid_argument(format!("AppDb key names unknown table: {}", table_part))
        })?;

    let object: Map<String, Value> = serde_json::from_str(json).map_err(|e| {
        HarnessError::invalid_argument(format!("AppDb key is not a JSON object: {}: {}", key, e))
    })?;

    let mut priority = 0;
    let mut matches = Vec::new();
    for (field, value) in &object {
        if field == "priority" {
            priority = value
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| {
                    HarnessError::invalid_argument(format!("AppDb key has bad priority: {}", key))
                })?;
            continue;
        }
        let name = field.strip_prefix(MATCH_PREFIX).ok_or_else(|| {
            HarnessError::invalid_argument(format!("AppDb key has unexpected field {}", field))
        })?;
        let definition = table.match_field_by_name(name).ok_or_else(|| {
            HarnessError::invalid_argument(format!(
                "table {} has no match field {}",
                table.alias, name
            ))
        })?;
        let text = value.as_str().ok_or_else(|| {
            HarnessError::invalid_argument(format!("AppDb match {} is not a string", field))
        })?;
        matches.push((
            definition.id,
            IrMatch {
                name: name.to_string(),
                value: IrMatchValue::from_app_db_string(text, definition.match_type)?,
            },
        ));
    }
    matches.sort_by_key(|(id, _)| *id);

    let mut action_name = None;
    let mut params = Vec::new();
    for (field, value) in values {
        if field == "action" {
            action_name = Some(value.clone());
        } else if let Some(name) = field.strip_prefix(PARAM_PREFIX) {
            params.push((name.to_string(), value.clone()));
        } else {
            tracing::trace!(key = %key, field = %field, "ignoring AppDb field");
        }
    }
    let action = match action_name {
        Some(name) => {
            let definition = info.action_by_alias(&name).ok_or_else(|| {
                HarnessError::invalid_argument(format!("AppDb row names unknown action {}", name))
            })?;
            // Parameters are kept in P4Info order.
            params.sort_by_key(|(n, _)| {
                definition
                    .params
                    .values()
                    .find(|p| &p.name == n)
                    .map(|p| p.id)
                    .unwrap_or(u32::MAX)
            });
            Some(IrActionInvocation { name, params })
        }
        None => None,
    };

    Ok(IrTableEntry {
        table_name: table.alias.clone(),
        matches: matches.into_iter().map(|(_, m)| m).collect(),
        priority,
        action,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sai;

    fn route() -> IrTableEntry {
        IrTableEntry {
            table_name: "ipv4_table".into(),
            matches: vec![
                IrMatch {
                    name: "vrf_id".into(),
                    value: IrMatchValue::Exact("50".into()),
                },
                IrMatch {
                    name: "ipv4_dst".into(),
                    value: IrMatchValue::Lpm {
                        value: "10.81.8.0".into(),
                        prefix_len: 23,
                    },
                },
            ],
            priority: 0,
            action: Some(IrActionInvocation {
                name: "set_nexthop_id".into(),
                params: vec![("nexthop_id".into(), "8".into())],
            }),
        }
    }

    #[test]
    fn test_key_is_sorted_json() {
        assert_eq!(
            ir_table_entry_to_app_db_key(&route()),
            r#"FIXED_IPV4_TABLE:{"match/ipv4_dst":"10.81.8.0/23","match/vrf_id":"50"}"#
        );
    }

    #[test]
    fn test_values_start_with_action() {
        let values = ir_table_entry_to_app_db_values(&route()).unwrap();
        assert_eq!(
            values,
            vec![
                ("action".to_string(), "set_nexthop_id".to_string()),
                ("param/nexthop_id".to_string(), "8".to_string()),
            ]
        );
    }

    #[test]
    fn test_row_translates_back() {
        let info = IrP4Info::from_p4info(&sai::fixed_l3_p4info()).unwrap();
        let entry = route();
        let key = ir_table_entry_to_app_db_key(&entry);
        let values = ir_table_entry_to_app_db_values(&entry).unwrap();
        let back = app_db_to_ir_table_entry(&info, &key, &values).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_priority_in_key() {
        let entry = IrTableEntry {
            table_name: "l3_admit_table".into(),
            matches: vec![IrMatch {
                name: "dst_mac".into(),
                value: IrMatchValue::Ternary {
                    value: "00:02:03:04:05:06".into(),
                    mask: "ff:ff:ff:ff:ff:ff".into(),
                },
            }],
            priority: 10,
            action: None,
        };
        assert_eq!(
            ir_table_entry_to_app_db_key(&entry),
            r#"FIXED_L3_ADMIT_TABLE:{"match/dst_mac":"00:02:03:04:05:06&ff:ff:ff:ff:ff:ff","priority":10}"#
        );
    }

    #[test]
    fn test_unknown_table_prefix_rejected() {
        let info = IrP4Info::from_p4info(&sai::fixed_l3_p4info()).unwrap();
        assert!(app_db_to_ir_table_entry(&info, "FIXED_BOGUS:{}", &vec![]).is_err());
    }
}
