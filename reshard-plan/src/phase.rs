//! Multi-table partition phase: one `Plan` per partitioned table.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use reshard_common::error::ReshardResult;
use reshard_common::ids::{PartitionId, TupleId};
use serde::{Deserialize, Serialize};

use crate::plan::{Plan, PlanFile};
use crate::reconfig::KeyType;

/// Placement of one table inside a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseTable {
    /// Declared type of the partitioning key.
    pub key_type: KeyType,
    /// Key ownership.
    pub plan: Plan,
}

/// Placement of every partitioned table at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionPhase {
    tables: BTreeMap<String, PhaseTable>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PhaseFile {
    tables: BTreeMap<String, PhaseTableFile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PhaseTableFile {
    #[serde(default)]
    key_type: KeyType,
    partitions: BTreeMap<PartitionId, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    exceptions: BTreeMap<PartitionId, Vec<TupleId>>,
}

impl PartitionPhase {
    /// Creates an empty phase.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one table's placement.
    pub fn insert(&mut self, table: impl Into<String>, key_type: KeyType, plan: Plan) {
        let _ = self
            .tables
            .insert(table.into(), PhaseTable { key_type, plan });
    }

    /// Placement of one table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&PhaseTable> {
        self.tables.get(name)
    }

    /// All tables in ascending name order.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &PhaseTable)> {
        self.tables.iter().map(|(name, table)| (name.as_str(), table))
    }

    /// Parses a phase document: `{"tables": {"usertable": {"key_type": "BIGINT", "partitions": {...}}}}`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` for malformed JSON or any invalid table plan.
    pub fn from_json(payload: &str) -> ReshardResult<Self> {
        let file: PhaseFile = serde_json::from_str(payload)?;
        let mut phase = Self::new();
        for (name, table) in file.tables {
            let plan = Plan::from_file_shape(PlanFile {
                partitions: table.partitions,
                exceptions: table.exceptions,
            })?;
            phase.insert(name, table.key_type, plan);
        }
        Ok(phase)
    }

    /// Serializes the phase as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` if serialization fails.
    pub fn to_json(&self) -> ReshardResult<String> {
        let file = PhaseFile {
            tables: self
                .tables
                .iter()
                .map(|(name, table)| {
                    let shape = table.plan.to_file_shape();
                    (
                        name.clone(),
                        PhaseTableFile {
                            key_type: table.key_type,
                            partitions: shape.partitions,
                            exceptions: shape.exceptions,
                        },
                    )
                })
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Loads a phase file.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io` for read failures and `ReshardError::Plan` for parse failures.
    pub fn load<P: AsRef<Path>>(path: P) -> ReshardResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// Writes the phase to a file.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io` for write failures.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ReshardResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
