//! Partitioning descriptor: how each table and procedure is partitioned.
//!
//! The descriptor is the JSON document shipped alongside a reconfiguration plan:
//!
//! ```json
//! {
//!   "TABLE_ENTRIES": {
//!     "{'database':'CUSTOMER'}": {
//!       "METHOD": "HASH",
//!       "ATTRIBUTE": "{'CUSTOMER#*MultiColumn*':[{'CUSTOMER':'C_W_ID'},{'CUSTOMER':'C_D_ID'}]}",
//!       "ATTRIBUTE_class": "edu.brown.catalog.special.MultiColumn",
//!       "PARENT": "{'database':'DISTRICT'}",
//!       "PARENT_ATTRIBUTE": "{'DISTRICT':'D_W_ID'}"
//!     }
//!   },
//!   "PROC_ENTRIES": {
//!     "{'database':'delivery'}": {
//!       "METHOD": "HASH",
//!       "SINGLE_PARTITION": true,
//!       "ATTRIBUTE": "{'delivery':'0'}",
//!       "ATTRIBUTE_class": "org.voltdb.catalog.ProcParameter"
//!     }
//!   }
//! }
//! ```
//!
//! Catalog references use single-quoted pseudo-JSON; they are normalized to JSON before parsing.

use std::collections::BTreeMap;

use reshard_common::error::{ReshardError, ReshardResult};
use serde::Deserialize;
use serde_json::Value;

const MULTI_COLUMN_MARKER: &str = "#*MultiColumn*";
const MULTI_PROC_PARAMETER_MARKER: &str = "#*MultiProcParameter*";

/// Partitioning method of a table or procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionMethod {
    /// Rows hashed on the partitioning attribute.
    Hash,
    /// Rows mapped through a parent table's partitioning.
    Map,
    /// Every partition holds a full copy.
    Replication,
}

/// Partitioning attribute reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// One table column.
    Column {
        /// Owning table.
        table: String,
        /// Column name.
        column: String,
    },
    /// Composite key over several columns of one table.
    MultiColumn {
        /// Owning table.
        table: String,
        /// Column names in key order.
        columns: Vec<String>,
    },
    /// One procedure parameter.
    ProcParameter {
        /// Owning procedure.
        procedure: String,
        /// Parameter index.
        index: usize,
    },
    /// Composite key over several procedure parameters.
    MultiProcParameter {
        /// Owning procedure.
        procedure: String,
        /// Parameter indexes in key order.
        indexes: Vec<usize>,
    },
}

impl Attribute {
    /// Class name suffix this attribute shape is tagged with in `ATTRIBUTE_class`.
    #[must_use]
    pub const fn class_name(&self) -> &'static str {
        match self {
            Self::Column { .. } => "Column",
            Self::MultiColumn { .. } => "MultiColumn",
            Self::ProcParameter { .. } => "ProcParameter",
            Self::MultiProcParameter { .. } => "MultiProcParameter",
        }
    }
}

/// Partitioning of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEntry {
    /// Partitioning method.
    pub method: PartitionMethod,
    /// Partitioning attribute; absent for replicated tables.
    pub attribute: Option<Attribute>,
    /// Co-partitioned parent table.
    pub parent: Option<String>,
    /// Parent column the table is co-partitioned on.
    pub parent_attribute: Option<Attribute>,
}

/// Partitioning of one stored procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureEntry {
    /// Partitioning method.
    pub method: PartitionMethod,
    /// Routing parameter.
    pub attribute: Option<Attribute>,
    /// Whether the procedure always runs on one partition.
    pub single_partition: bool,
}

/// Parsed partitioning descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitioningDescriptor {
    tables: BTreeMap<String, TableEntry>,
    procedures: BTreeMap<String, ProcedureEntry>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "TABLE_ENTRIES", default)]
    tables: BTreeMap<String, RawEntry>,
    #[serde(rename = "PROC_ENTRIES", default)]
    procedures: BTreeMap<String, RawEntry>,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "METHOD")]
    method: PartitionMethod,
    #[serde(rename = "ATTRIBUTE", default)]
    attribute: Option<String>,
    #[serde(rename = "ATTRIBUTE_class", default)]
    attribute_class: Option<String>,
    #[serde(rename = "PARENT", default)]
    parent: Option<String>,
    #[serde(rename = "PARENT_ATTRIBUTE", default)]
    parent_attribute: Option<String>,
    #[serde(rename = "SINGLE_PARTITION", default)]
    single_partition: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Table,
    Procedure,
}

impl PartitioningDescriptor {
    /// Parses and validates a descriptor document.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the JSON is malformed, a catalog reference cannot be
    /// parsed, an `ATTRIBUTE_class` disagrees with its attribute, a partitioned entry has no
    /// attribute, or a procedure entry lacks `SINGLE_PARTITION`.
    pub fn from_json(payload: &str) -> ReshardResult<Self> {
        let raw: RawDescriptor = serde_json::from_str(payload)?;

        let mut tables = BTreeMap::new();
        for (key, entry) in raw.tables {
            let name = parse_catalog_name(&key)?;
            let attribute = parse_entry_attribute(&name, &entry, Owner::Table)?;
            let parent = entry.parent.as_deref().map(parse_catalog_name).transpose()?;
            let parent_attribute = entry
                .parent_attribute
                .as_deref()
                .map(|text| parse_attribute(text, Owner::Table))
                .transpose()?;
            if parent.is_some() != parent_attribute.is_some() {
                return Err(ReshardError::Plan(format!(
                    "table {name}: PARENT and PARENT_ATTRIBUTE must be given together"
                )));
            }
            let _ = tables.insert(
                name,
                TableEntry {
                    method: entry.method,
                    attribute,
                    parent,
                    parent_attribute,
                },
            );
        }

        let mut procedures = BTreeMap::new();
        for (key, entry) in raw.procedures {
            let name = parse_catalog_name(&key)?;
            let attribute = parse_entry_attribute(&name, &entry, Owner::Procedure)?;
            let Some(single_partition) = entry.single_partition else {
                return Err(ReshardError::Plan(format!(
                    "procedure {name}: SINGLE_PARTITION is required"
                )));
            };
            let _ = procedures.insert(
                name,
                ProcedureEntry {
                    method: entry.method,
                    attribute,
                    single_partition,
                },
            );
        }

        Ok(Self { tables, procedures })
    }

    /// Partitioning of one table.
    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.tables.get(name)
    }

    /// Partitioning of one procedure.
    #[must_use]
    pub fn procedure(&self, name: &str) -> Option<&ProcedureEntry> {
        self.procedures.get(name)
    }

    /// Whether a table is replicated (and therefore never migrated).
    #[must_use]
    pub fn is_replicated(&self, table: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|entry| entry.method == PartitionMethod::Replication)
    }

    /// Tables whose rows live on exactly one partition, ascending.
    pub fn partitioned_tables(&self) -> impl Iterator<Item = &str> {
        self.tables
            .iter()
            .filter(|(_, entry)| entry.method != PartitionMethod::Replication)
            .map(|(name, _)| name.as_str())
    }
}

fn parse_entry_attribute(
    name: &str,
    entry: &RawEntry,
    owner: Owner,
) -> ReshardResult<Option<Attribute>> {
    let attribute = entry
        .attribute
        .as_deref()
        .map(|text| parse_attribute(text, owner))
        .transpose()?;

    match (&attribute, entry.method) {
        (None, PartitionMethod::Hash | PartitionMethod::Map) => {
            return Err(ReshardError::Plan(format!(
                "{name}: partitioned entry requires ATTRIBUTE"
            )));
        }
        (Some(attribute), _) => {
            if let Some(class) = entry.attribute_class.as_deref() {
                let suffix = class.rsplit('.').next().unwrap_or(class);
                if suffix != attribute.class_name() {
                    return Err(ReshardError::Plan(format!(
                        "{name}: ATTRIBUTE_class {class} does not match {} attribute",
                        attribute.class_name()
                    )));
                }
            }
        }
        (None, PartitionMethod::Replication) => {}
    }
    Ok(attribute)
}

/// Parses `{'database':'NAME'}` into `NAME`.
fn parse_catalog_name(text: &str) -> ReshardResult<String> {
    let normalized = normalize(text)?;
    let (_, value) = single_pair(&normalized, text)?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| malformed(text))
}

fn parse_attribute(text: &str, owner: Owner) -> ReshardResult<Attribute> {
    let normalized = normalize(text)?;
    let (key, value) = single_pair(&normalized, text)?;

    if let Some(table) = key.strip_suffix(MULTI_COLUMN_MARKER) {
        let columns = composite_members(value, text)?;
        return Ok(Attribute::MultiColumn {
            table: table.to_owned(),
            columns,
        });
    }
    if let Some(procedure) = key.strip_suffix(MULTI_PROC_PARAMETER_MARKER) {
        let indexes = composite_members(value, text)?
            .iter()
            .map(|member| parse_index(member, text))
            .collect::<ReshardResult<Vec<_>>>()?;
        return Ok(Attribute::MultiProcParameter {
            procedure: procedure.to_owned(),
            indexes,
        });
    }

    let member = value.as_str().ok_or_else(|| malformed(text))?;
    Ok(match owner {
        Owner::Table => Attribute::Column {
            table: key.to_owned(),
            column: member.to_owned(),
        },
        Owner::Procedure => Attribute::ProcParameter {
            procedure: key.to_owned(),
            index: parse_index(member, text)?,
        },
    })
}

/// Members of a composite: `[{'T':'A'},{'T':'B'}]` into `["A", "B"]`.
fn composite_members(value: &Value, text: &str) -> ReshardResult<Vec<String>> {
    let items = value.as_array().ok_or_else(|| malformed(text))?;
    if items.is_empty() {
        return Err(malformed(text));
    }
    items
        .iter()
        .map(|item| {
            let (_, member) = single_pair(item, text)?;
            member
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| malformed(text))
        })
        .collect()
}

fn single_pair<'a>(value: &'a Value, text: &str) -> ReshardResult<(&'a str, &'a Value)> {
    let object = value.as_object().ok_or_else(|| malformed(text))?;
    let mut pairs = object.iter();
    match (pairs.next(), pairs.next()) {
        (Some((key, value)), None) => Ok((key.as_str(), value)),
        _ => Err(malformed(text)),
    }
}

fn parse_index(member: &str, text: &str) -> ReshardResult<usize> {
    member.parse::<usize>().map_err(|_| malformed(text))
}

fn normalize(text: &str) -> ReshardResult<Value> {
    serde_json::from_str(&text.replace('\'', "\"")).map_err(|_| malformed(text))
}

fn malformed(text: &str) -> ReshardError {
    ReshardError::Plan(format!("malformed catalog reference `{text}`"))
}

#[cfg(test)]
mod tests {
    use super::{Attribute, PartitionMethod, PartitioningDescriptor};
    use googletest::prelude::*;
    use rstest::rstest;

    const TPCC_DESCRIPTOR: &str = r#"{
        "TABLE_ENTRIES": {
            "{'database':'CUSTOMER'}": {
                "PARENT_ATTRIBUTE": "{'DISTRICT':'D_W_ID'}",
                "PARENT": "{'database':'DISTRICT'}",
                "METHOD": "HASH",
                "ATTRIBUTE": "{'CUSTOMER#*MultiColumn*':[{'CUSTOMER':'C_W_ID'},{'CUSTOMER':'C_D_ID'}]}",
                "ATTRIBUTE_class": "edu.brown.catalog.special.MultiColumn"
            },
            "{'database':'ITEM'}": {
                "PARENT_ATTRIBUTE": null,
                "PARENT": null,
                "METHOD": "REPLICATION",
                "ATTRIBUTE": null
            },
            "{'database':'WAREHOUSE'}": {
                "METHOD": "HASH",
                "ATTRIBUTE": "{'WAREHOUSE':'W_ID'}",
                "ATTRIBUTE_class": "org.voltdb.catalog.Column"
            }
        },
        "PROC_ENTRIES": {
            "{'database':'delivery'}": {
                "SINGLE_PARTITION": true,
                "METHOD": "HASH",
                "ATTRIBUTE": "{'delivery':'0'}",
                "ATTRIBUTE_class": "org.voltdb.catalog.ProcParameter"
            },
            "{'database':'neworder'}": {
                "SINGLE_PARTITION": false,
                "METHOD": "HASH",
                "ATTRIBUTE": "{'neworder#*MultiProcParameter*':[{'neworder':'0'},{'neworder':'1'}]}",
                "ATTRIBUTE_class": "edu.brown.catalog.special.MultiProcParameter"
            }
        }
    }"#;

    #[rstest]
    fn tpcc_descriptor_parses_tables() {
        let descriptor = PartitioningDescriptor::from_json(TPCC_DESCRIPTOR)
            .expect("descriptor should parse");
        let customer = descriptor.table("CUSTOMER").expect("table exists");
        assert_that!(customer.method, eq(PartitionMethod::Hash));
        assert_that!(
            customer.attribute.as_ref(),
            eq(Some(&Attribute::MultiColumn {
                table: "CUSTOMER".to_owned(),
                columns: vec!["C_W_ID".to_owned(), "C_D_ID".to_owned()],
            }))
        );
        assert_that!(customer.parent.as_deref(), eq(Some("DISTRICT")));
        assert_that!(
            customer.parent_attribute.as_ref(),
            eq(Some(&Attribute::Column {
                table: "DISTRICT".to_owned(),
                column: "D_W_ID".to_owned(),
            }))
        );
        assert_that!(descriptor.is_replicated("ITEM"), eq(true));
        assert_that!(descriptor.is_replicated("CUSTOMER"), eq(false));
        let partitioned = descriptor.partitioned_tables().collect::<Vec<_>>();
        assert_that!(&partitioned, eq(&vec!["CUSTOMER", "WAREHOUSE"]));
    }

    #[rstest]
    fn tpcc_descriptor_parses_procedures() {
        let descriptor = PartitioningDescriptor::from_json(TPCC_DESCRIPTOR)
            .expect("descriptor should parse");
        let delivery = descriptor.procedure("delivery").expect("procedure exists");
        assert_that!(delivery.single_partition, eq(true));
        assert_that!(
            delivery.attribute.as_ref(),
            eq(Some(&Attribute::ProcParameter {
                procedure: "delivery".to_owned(),
                index: 0,
            }))
        );
        let neworder = descriptor.procedure("neworder").expect("procedure exists");
        assert_that!(neworder.single_partition, eq(false));
        assert_that!(
            neworder.attribute.as_ref(),
            eq(Some(&Attribute::MultiProcParameter {
                procedure: "neworder".to_owned(),
                indexes: vec![0, 1],
            }))
        );
    }

    #[rstest]
    #[case::class_mismatch(
        r#"{"TABLE_ENTRIES": {"{'database':'T'}": {"METHOD": "HASH", "ATTRIBUTE": "{'T':'A'}", "ATTRIBUTE_class": "x.MultiColumn"}}}"#
    )]
    #[case::missing_attribute(
        r#"{"TABLE_ENTRIES": {"{'database':'T'}": {"METHOD": "HASH", "ATTRIBUTE": null}}}"#
    )]
    #[case::unknown_method(
        r#"{"TABLE_ENTRIES": {"{'database':'T'}": {"METHOD": "RANGE", "ATTRIBUTE": "{'T':'A'}"}}}"#
    )]
    #[case::bad_catalog_key(
        r#"{"TABLE_ENTRIES": {"database=T": {"METHOD": "REPLICATION"}}}"#
    )]
    #[case::non_string_catalog_name(
        r#"{"TABLE_ENTRIES": {"{'database':['T']}": {"METHOD": "REPLICATION"}}}"#
    )]
    #[case::parent_without_attribute(
        r#"{"TABLE_ENTRIES": {"{'database':'T'}": {"METHOD": "MAP", "ATTRIBUTE": "{'T':'A'}", "PARENT": "{'database':'P'}"}}}"#
    )]
    #[case::missing_single_partition(
        r#"{"PROC_ENTRIES": {"{'database':'p'}": {"METHOD": "HASH", "ATTRIBUTE": "{'p':'0'}"}}}"#
    )]
    #[case::non_numeric_parameter(
        r#"{"PROC_ENTRIES": {"{'database':'p'}": {"METHOD": "HASH", "SINGLE_PARTITION": true, "ATTRIBUTE": "{'p':'x'}"}}}"#
    )]
    fn malformed_descriptors_are_rejected(#[case] payload: &str) {
        assert_that!(PartitioningDescriptor::from_json(payload).is_err(), eq(true));
    }
}
