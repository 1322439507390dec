//! Table registry.
//!
//! A [`FakeDbConnector`] groups tables into one logical database. Tables are
//! registered while the harness is being built; once the connector is boxed
//! behind [`DbConnectorAdapter`] and handed to the server, nothing can add to it.

use super::table::SonicDbTable;
use super::FieldValues;
use crate::core::error::{HarnessError, HarnessResult};
use crate::sonic::adapters::DbConnectorAdapter;
use std::collections::BTreeMap;

/// Named collection of shared table handles.
#[derive(Debug, Clone, Default)]
pub struct FakeDbConnector {
    name: String,
    tables: BTreeMap<String, SonicDbTable>,
}

impl FakeDbConnector {
    /// Create an empty database grouping.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    /// Database name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `table` under `name`.
    pub fn add_table(&mut self, name: impl Into<String>, table: SonicDbTable) -> HarnessResult<()> {
        let name = name.into();
        if self.tables.contains_key(&name) {
            return Err(HarnessError::DuplicateTable { table: name });
        }
        tracing::debug!(db = %self.name, table = %name, "table registered");
        self.tables.insert(name, table);
        Ok(())
    }

    /// Resolve a registered table.
    pub fn get_table(&self, name: &str) -> Option<&SonicDbTable> {
        self.tables.get(name)
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    fn table(&self, name: &str) -> HarnessResult<&SonicDbTable> {
        self.tables.get(name).ok_or_else(|| HarnessError::MissingTable {
            table: format!("{}/{}", self.name, name),
        })
    }
}

impl DbConnectorAdapter for FakeDbConnector {
    fn has_table(&self, table: &str) -> bool {
        self.tables.contains_key(table)
    }

    fn keys(&self, table: &str) -> HarnessResult<Vec<String>> {
        Ok(self.table(table)?.keys())
    }

    fn get(&self, table: &str, key: &str) -> HarnessResult<Option<FieldValues>> {
        Ok(self.table(table)?.get(key))
    }

    fn exists(&self, table: &str, key: &str) -> HarnessResult<bool> {
        Ok(self.table(table)?.contains(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut db = FakeDbConnector::new("APPL_DB");
        db.add_table("P4RT", SonicDbTable::new("P4RT")).unwrap();
        let err = db
            .add_table("P4RT", SonicDbTable::new("P4RT"))
            .unwrap_err();
        assert_eq!(
            err,
            HarnessError::DuplicateTable {
                table: "P4RT".into()
            }
        );
    }

    #[test]
    fn test_views_share_rows() {
        let table = SonicDbTable::new("VRF_TABLE");
        let mut app = FakeDbConnector::new("APPL_DB");
        let mut other = FakeDbConnector::new("OTHER_DB");
        app.add_table("VRF_TABLE", table.clone()).unwrap();
        other.add_table("VRF_TABLE", table.clone()).unwrap();

        table.set("vrf-1", vec![]);
        assert!(app.exists("VRF_TABLE", "vrf-1").unwrap());
        assert_eq!(other.keys("VRF_TABLE").unwrap(), vec!["vrf-1".to_string()]);
    }

    #[test]
    fn test_unknown_table_is_missing() {
        let db = FakeDbConnector::new("COUNTERS_DB");
        assert!(!db.has_table("COUNTERS"));
        assert!(matches!(
            db.keys("COUNTERS"),
            Err(HarnessError::MissingTable { .. })
        ));
    }
}
