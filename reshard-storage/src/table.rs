//! Table schemas, rows and row batches.

use std::sync::Arc;

use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::TupleId;

/// Column storage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// 1-byte integer.
    TinyInt,
    /// 2-byte integer.
    SmallInt,
    /// 4-byte integer.
    Integer,
    /// 8-byte integer.
    BigInt,
    /// 8-byte float.
    Float,
    /// 8-byte timestamp.
    Timestamp,
    /// Variable-length string of at most `n` bytes.
    Varchar(u32),
}

impl ColumnType {
    /// Estimated serialized width of one value.
    ///
    /// Variable-length strings are sized at their declared maximum plus a 4-byte length prefix.
    #[must_use]
    pub const fn estimated_width(self) -> u64 {
        match self {
            Self::TinyInt => 1,
            Self::SmallInt => 2,
            Self::Integer => 4,
            Self::BigInt | Self::Float | Self::Timestamp => 8,
            Self::Varchar(max_len) => 4 + max_len as u64,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::TinyInt | Self::SmallInt | Self::Integer | Self::BigInt | Self::Timestamp, Value::Int(_))
            | (Self::Float, Value::Float(_)) => true,
            (Self::Varchar(max_len), Value::Text(text)) => text.len() <= max_len as usize,
            _ => false,
        }
    }
}

/// Named column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Storage type.
    pub ty: ColumnType,
}

impl Column {
    /// Creates a column.
    #[must_use]
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Schema of one partitioned table: the partitioning key column plus payload columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Partitioning key column. Its value is the row's `TupleId`.
    pub key: Column,
    /// Payload columns in declaration order.
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Creates a schema.
    #[must_use]
    pub fn new(name: impl Into<String>, key: Column, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            key,
            columns,
        }
    }

    /// Estimated serialized size of one tuple, the sum of every column's estimated width.
    #[must_use]
    pub fn estimate_tuple_size(&self) -> u64 {
        self.key.ty.estimated_width()
            + self
                .columns
                .iter()
                .map(|column| column.ty.estimated_width())
                .sum::<u64>()
    }

    /// Checks a row's arity and value types against this schema.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` naming the first mismatching column.
    pub fn check_row(&self, row: &Row) -> ReshardResult<()> {
        if row.values.len() != self.columns.len() {
            return Err(ReshardError::Storage(format!(
                "table {}: row {} has {} values, schema has {} columns",
                self.name,
                row.key,
                row.values.len(),
                self.columns.len()
            )));
        }
        if let Some(column) = self
            .columns
            .iter()
            .zip(&row.values)
            .find(|(column, value)| !column.ty.accepts(value))
            .map(|(column, _)| column)
        {
            return Err(ReshardError::Storage(format!(
                "table {}: row {} has an invalid value for column {}",
                self.name, row.key, column.name
            )));
        }
        Ok(())
    }
}

/// Column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL.
    Null,
    /// Any integer-like column.
    Int(i64),
    /// Floating-point column.
    Float(f64),
    /// String column.
    Text(String),
}

/// One tuple: key plus payload values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Partitioning key.
    pub key: TupleId,
    /// Payload values matching the schema's payload columns.
    pub values: Vec<Value>,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub const fn new(key: TupleId, values: Vec<Value>) -> Self {
        Self { key, values }
    }
}

/// Rows of one table moved as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RowBatch {
    schema: Arc<TableSchema>,
    rows: Vec<Row>,
}

impl RowBatch {
    /// Creates a batch.
    #[must_use]
    pub const fn new(schema: Arc<TableSchema>, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }

    /// Schema of the rows.
    #[must_use]
    pub fn schema(&self) -> &Arc<TableSchema> {
        &self.schema
    }

    /// Table the rows belong to.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.schema.name
    }

    /// Rows in ascending key order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Consumes the batch, returning its rows.
    #[must_use]
    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Estimated serialized size of the batch.
    #[must_use]
    pub fn estimated_bytes(&self) -> u64 {
        self.schema.estimate_tuple_size() * self.rows.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::{Column, ColumnType, Row, RowBatch, TableSchema, Value};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn usertable() -> TableSchema {
        TableSchema::new(
            "usertable",
            Column::new("ycsb_key", ColumnType::BigInt),
            vec![
                Column::new("field1", ColumnType::Varchar(100)),
                Column::new("counter", ColumnType::Integer),
            ],
        )
    }

    #[rstest]
    #[case(ColumnType::TinyInt, 1)]
    #[case(ColumnType::SmallInt, 2)]
    #[case(ColumnType::Integer, 4)]
    #[case(ColumnType::BigInt, 8)]
    #[case(ColumnType::Timestamp, 8)]
    #[case(ColumnType::Varchar(16), 20)]
    fn column_widths(#[case] ty: ColumnType, #[case] expected: u64) {
        assert_that!(ty.estimated_width(), eq(expected));
    }

    #[rstest]
    fn tuple_size_sums_key_and_payload_columns() {
        assert_that!(usertable().estimate_tuple_size(), eq(116_u64));
    }

    #[rstest]
    #[case::ok(Row::new(1, vec![Value::Text("a".into()), Value::Int(3)]), true)]
    #[case::null(Row::new(1, vec![Value::Null, Value::Null]), true)]
    #[case::arity(Row::new(1, vec![Value::Int(3)]), false)]
    #[case::type_mismatch(Row::new(1, vec![Value::Int(3), Value::Int(3)]), false)]
    #[case::too_long(Row::new(1, vec![Value::Text("x".repeat(101)), Value::Int(3)]), false)]
    fn rows_are_checked_against_schema(#[case] row: Row, #[case] valid: bool) {
        assert_that!(usertable().check_row(&row).is_ok(), eq(valid));
    }

    #[rstest]
    fn batch_estimates_bytes_from_schema() {
        let rows = vec![Row::new(1, vec![Value::Null, Value::Null]); 3];
        let batch = RowBatch::new(Arc::new(usertable()), rows);
        assert_that!(batch.row_count(), eq(3_usize));
        assert_that!(batch.estimated_bytes(), eq(348_u64));
        assert_that!(batch.table(), eq("usertable"));
    }
}
