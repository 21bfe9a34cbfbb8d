//! Partition engine: per-partition table storage with chunked extraction.
//!
//! One engine belongs to exactly one partition and is driven from that partition's thread.
//! Extraction removes rows from the source immediately and parks them in the undo log under the
//! caller's token, so a failed chunk can be restored without touching earlier ones.

use std::collections::BTreeMap;
use std::sync::Arc;

use reshard_common::config::ExtractConfig;
use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionId, TupleId, TxnId, UndoToken};
use reshard_plan::KeyRange;

use crate::table::{Row, RowBatch, TableSchema};
use crate::undo::{UndoEntry, UndoLog};

/// `limit_bytes` value selecting the engine's default chunk size.
pub const DEFAULT_LIMIT: i64 = -1;

/// One extraction call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractRequest {
    /// Table to extract from.
    pub table: String,
    /// Keys to extract.
    pub range: KeyRange,
    /// Id of the migration request, for tracing.
    pub request_id: TxnId,
    /// Partition pulling the data.
    pub caller_partition: PartitionId,
    /// Token the extracted rows are parked under.
    pub undo_token: UndoToken,
    /// Token of the previous chunk to commit before extracting, if any.
    pub previous_undo_token: Option<UndoToken>,
    /// Byte cap for this chunk, or [`DEFAULT_LIMIT`].
    pub limit_bytes: i64,
}

/// One extracted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractChunk {
    /// Extracted rows.
    pub batch: RowBatch,
    /// Whether rows of the range remain after this chunk.
    pub has_more: bool,
    /// Token the rows are parked under.
    pub undo_token: UndoToken,
}

#[derive(Debug)]
struct TableState {
    schema: Arc<TableSchema>,
    rows: BTreeMap<TupleId, Row>,
}

/// In-memory storage of one partition.
#[derive(Debug)]
pub struct PartitionEngine {
    partition: PartitionId,
    default_limit_bytes: u64,
    tables: BTreeMap<String, TableState>,
    undo: UndoLog,
}

impl PartitionEngine {
    /// Creates an empty engine for `partition`.
    #[must_use]
    pub fn new(partition: PartitionId, config: &ExtractConfig) -> Self {
        Self {
            partition,
            default_limit_bytes: config.default_limit_bytes,
            tables: BTreeMap::new(),
            undo: UndoLog::new(),
        }
    }

    /// Partition this engine stores.
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Registers a table. Registering an identical schema twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` when a different schema is already registered under the
    /// same name.
    pub fn create_table(&mut self, schema: Arc<TableSchema>) -> ReshardResult<()> {
        if let Some(existing) = self.tables.get(&schema.name) {
            if existing.schema == schema {
                return Ok(());
            }
            return Err(ReshardError::Storage(format!(
                "partition {}: table {} already exists with a different schema",
                self.partition, schema.name
            )));
        }
        let _ = self.tables.insert(
            schema.name.clone(),
            TableState {
                schema,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    /// Schema of a registered table.
    #[must_use]
    pub fn schema(&self, table: &str) -> Option<&Arc<TableSchema>> {
        self.tables.get(table).map(|state| &state.schema)
    }

    /// Bulk-loads rows into a registered table. Either every row is inserted or none is.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for an unknown table, a row not matching the schema, or a
    /// key that is already present (in the table or twice in `rows`).
    pub fn load_table(&mut self, table: &str, rows: Vec<Row>) -> ReshardResult<usize> {
        let partition = self.partition;
        let state = self.table_mut(table)?;
        let mut incoming = BTreeMap::new();
        for row in rows {
            state.schema.check_row(&row)?;
            if state.rows.contains_key(&row.key) || incoming.contains_key(&row.key) {
                return Err(ReshardError::Storage(format!(
                    "partition {partition}: duplicate key {} in table {table}",
                    row.key
                )));
            }
            let _ = incoming.insert(row.key, row);
        }
        let loaded = incoming.len();
        state.rows.append(&mut incoming);
        Ok(loaded)
    }

    /// Number of rows of `table` inside `range`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for an unknown table.
    pub fn row_count(&self, table: &str, range: KeyRange) -> ReshardResult<usize> {
        Ok(self.table(table)?.rows.range(range.from..range.to).count())
    }

    /// Estimated serialized size of one tuple of `table`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for an unknown table.
    pub fn estimate_tuple_size(&self, table: &str) -> ReshardResult<u64> {
        Ok(self.table(table)?.schema.estimate_tuple_size())
    }

    /// Removes the next chunk of `request.range` and parks it under `request.undo_token`.
    ///
    /// A chunk holds `max(1, limit / tuple_size)` rows in ascending key order. An empty range
    /// yields one empty chunk with `has_more == false`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` for an unknown table, a non-increasing undo token, an
    /// unknown previous token or a negative limit other than [`DEFAULT_LIMIT`], and
    /// `ReshardError::Contract` when the caller is this partition.
    pub fn extract_table(&mut self, request: &ExtractRequest) -> ReshardResult<ExtractChunk> {
        if request.caller_partition == self.partition {
            return Err(ReshardError::Contract(format!(
                "partition {} cannot extract to itself",
                self.partition
            )));
        }
        let limit = match request.limit_bytes {
            DEFAULT_LIMIT => self.default_limit_bytes,
            bytes => u64::try_from(bytes).map_err(|_| {
                ReshardError::Storage(format!("invalid extract limit {bytes}"))
            })?,
        };
        self.table(&request.table)?;
        self.undo.check_fresh(request.undo_token)?;
        if let Some(previous) = request.previous_undo_token {
            self.undo.release(previous)?;
        }

        let partition = self.partition;
        let state = self.table_mut(&request.table)?;
        let tuple_size = state.schema.estimate_tuple_size().max(1);
        let rows_per_chunk = usize::try_from(limit / tuple_size).unwrap_or(usize::MAX).max(1);
        let range = request.range;

        let keys = state
            .rows
            .range(range.from..range.to)
            .map(|(key, _)| *key)
            .take(rows_per_chunk)
            .collect::<Vec<_>>();
        let rows = keys
            .iter()
            .filter_map(|key| state.rows.remove(key))
            .collect::<Vec<_>>();
        let has_more = state.rows.range(range.from..range.to).next().is_some();
        let schema = Arc::clone(&state.schema);

        self.undo.record(
            request.undo_token,
            UndoEntry {
                table: request.table.clone(),
                rows: rows.clone(),
            },
        )?;
        tracing::debug!(
            partition,
            request_id = request.request_id,
            caller = request.caller_partition,
            table = %request.table,
            range = %range,
            rows = rows.len(),
            has_more,
            undo_token = request.undo_token,
            "extracted chunk"
        );
        Ok(ExtractChunk {
            batch: RowBatch::new(schema, rows),
            has_more,
            undo_token: request.undo_token,
        })
    }

    /// Restores the rows extracted under `undo_token`. Returns the number of restored rows.
    ///
    /// Rolling back a token that is not pending (already rolled back or released) restores
    /// nothing.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` if a parked key was re-inserted meanwhile; the chunk stays
    /// pending in that case.
    pub fn rollback(&mut self, undo_token: UndoToken) -> ReshardResult<usize> {
        let Some(entry) = self.undo.take(undo_token) else {
            return Ok(0);
        };
        let partition = self.partition;
        let Some(state) = self.tables.get_mut(&entry.table) else {
            let table = entry.table.clone();
            self.undo.reinstate(undo_token, entry);
            return Err(unknown_table(partition, &table));
        };
        if let Some(row) = entry.rows.iter().find(|row| state.rows.contains_key(&row.key)) {
            let key = row.key;
            let table = entry.table.clone();
            self.undo.reinstate(undo_token, entry);
            return Err(ReshardError::Storage(format!(
                "partition {partition}: key {key} of table {table} was re-inserted before rollback"
            )));
        }
        let restored = entry.rows.len();
        state
            .rows
            .extend(entry.rows.into_iter().map(|row| (row.key, row)));
        tracing::warn!(partition, undo_token, restored, "rolled back extracted chunk");
        Ok(restored)
    }

    /// Commits the chunk extracted under `undo_token`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Storage` when the token is not pending.
    pub fn release(&mut self, undo_token: UndoToken) -> ReshardResult<()> {
        self.undo.release(undo_token)
    }

    /// Highest undo token this engine has accepted.
    #[must_use]
    pub const fn last_undo_token(&self) -> Option<UndoToken> {
        self.undo.highest()
    }

    /// Tokens whose chunks are neither released nor rolled back.
    pub fn pending_undo_tokens(&self) -> impl Iterator<Item = UndoToken> + '_ {
        self.undo.pending_tokens()
    }

    fn table(&self, table: &str) -> ReshardResult<&TableState> {
        self.tables
            .get(table)
            .ok_or_else(|| unknown_table(self.partition, table))
    }

    fn table_mut(&mut self, table: &str) -> ReshardResult<&mut TableState> {
        let partition = self.partition;
        self.tables
            .get_mut(table)
            .ok_or_else(|| unknown_table(partition, table))
    }
}

fn unknown_table(partition: PartitionId, table: &str) -> ReshardError {
    ReshardError::Storage(format!("partition {partition}: unknown table {table}"))
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_LIMIT, ExtractRequest, PartitionEngine};
    use crate::table::{Column, ColumnType, Row, TableSchema, Value};
    use googletest::prelude::*;
    use reshard_common::config::ExtractConfig;
    use reshard_common::error::ReshardError;
    use reshard_plan::KeyRange;
    use rstest::rstest;
    use std::sync::Arc;

    /// 8-byte key plus a 192-byte string column: 200 bytes per tuple.
    fn wide_schema() -> Arc<TableSchema> {
        Arc::new(TableSchema::new(
            "usertable",
            Column::new("id", ColumnType::BigInt),
            vec![Column::new("payload", ColumnType::Varchar(188))],
        ))
    }

    fn engine_with_rows(count: u64) -> PartitionEngine {
        let mut engine = PartitionEngine::new(0, &ExtractConfig::default());
        engine.create_table(wide_schema()).expect("table is new");
        let rows = (0..count)
            .map(|key| Row::new(key, vec![Value::Text(format!("row-{key}"))]))
            .collect();
        let _ = engine.load_table("usertable", rows).expect("rows are valid");
        engine
    }

    fn request(range: KeyRange, undo_token: u64, previous: Option<u64>, limit_bytes: i64) -> ExtractRequest {
        ExtractRequest {
            table: "usertable".to_owned(),
            range,
            request_id: 1,
            caller_partition: 1,
            undo_token,
            previous_undo_token: previous,
            limit_bytes,
        }
    }

    fn full_range() -> KeyRange {
        KeyRange { from: 0, to: 1000 }
    }

    #[rstest]
    fn thousand_rows_in_2kb_chunks_take_100_chunks() {
        let mut engine = engine_with_rows(1000);
        assert_that!(engine.estimate_tuple_size("usertable").ok(), eq(Some(200_u64)));

        let mut chunks = 0_usize;
        let mut rows = 0_usize;
        let mut final_chunks = 0_usize;
        let mut previous = None;
        let mut token = 1_u64;
        loop {
            let chunk = engine
                .extract_table(&request(full_range(), token, previous, 2048))
                .expect("extraction should succeed");
            chunks += 1;
            rows += chunk.batch.row_count();
            assert_that!(chunk.batch.row_count(), eq(10_usize));
            if !chunk.has_more {
                final_chunks += 1;
                engine.release(token).expect("final token is pending");
                break;
            }
            previous = Some(token);
            token += 1;
        }
        assert_that!(chunks, eq(100_usize));
        assert_that!(rows, eq(1000_usize));
        assert_that!(final_chunks, eq(1_usize));
        assert_that!(engine.row_count("usertable", full_range()).ok(), eq(Some(0_usize)));
        assert_that!(engine.pending_undo_tokens().count(), eq(0_usize));
    }

    #[rstest]
    #[case::default_limit(DEFAULT_LIMIT, 25)]
    #[case::tiny_limit(1, 1)]
    #[case::exact_limit(1000, 5)]
    fn chunk_size_follows_limit(#[case] limit_bytes: i64, #[case] expected_rows: usize) {
        let mut engine = engine_with_rows(25);
        let chunk = engine
            .extract_table(&request(full_range(), 1, None, limit_bytes))
            .expect("extraction should succeed");
        assert_that!(chunk.batch.row_count(), eq(expected_rows));
    }

    #[rstest]
    fn empty_range_yields_one_empty_final_chunk() {
        let mut engine = engine_with_rows(10);
        let chunk = engine
            .extract_table(&request(KeyRange { from: 500, to: 600 }, 1, None, DEFAULT_LIMIT))
            .expect("extraction should succeed");
        assert_that!(chunk.batch.row_count(), eq(0_usize));
        assert_that!(chunk.has_more, eq(false));
    }

    #[rstest]
    fn rollback_restores_only_its_chunk_and_is_idempotent() {
        let mut engine = engine_with_rows(30);
        let first = engine
            .extract_table(&request(full_range(), 1, None, 2000))
            .expect("extraction should succeed");
        let second = engine
            .extract_table(&request(full_range(), 2, None, 2000))
            .expect("extraction should succeed");
        assert_that!(first.batch.row_count(), eq(10_usize));
        assert_that!(second.batch.row_count(), eq(10_usize));
        assert_that!(engine.row_count("usertable", full_range()).ok(), eq(Some(10_usize)));

        assert_that!(engine.rollback(2).ok(), eq(Some(10_usize)));
        assert_that!(engine.rollback(2).ok(), eq(Some(0_usize)));
        assert_that!(engine.row_count("usertable", full_range()).ok(), eq(Some(20_usize)));
        assert_that!(engine.row_count("usertable", KeyRange { from: 0, to: 10 }).ok(), eq(Some(0_usize)));

        let pending = engine.pending_undo_tokens().collect::<Vec<_>>();
        assert_that!(&pending, eq(&vec![1_u64]));
    }

    #[rstest]
    fn previous_token_is_released_by_next_extract() {
        let mut engine = engine_with_rows(30);
        let _ = engine
            .extract_table(&request(full_range(), 1, None, 2000))
            .expect("extraction should succeed");
        let _ = engine
            .extract_table(&request(full_range(), 2, Some(1), 2000))
            .expect("extraction should succeed");
        assert_that!(engine.rollback(1).ok(), eq(Some(0_usize)));
        assert_that!(engine.row_count("usertable", full_range()).ok(), eq(Some(10_usize)));
    }

    #[rstest]
    #[case::reused(1)]
    #[case::older(0)]
    fn non_increasing_token_is_rejected(#[case] token: u64) {
        let mut engine = engine_with_rows(30);
        let _ = engine
            .extract_table(&request(full_range(), 1, None, 2000))
            .expect("extraction should succeed");
        let error = engine
            .extract_table(&request(full_range(), token, None, 2000))
            .expect_err("stale token must fail");
        let ReshardError::Storage(message) = error else {
            panic!("expected storage error");
        };
        assert_that!(message.contains("not greater than"), eq(true));
        assert_that!(engine.row_count("usertable", full_range()).ok(), eq(Some(20_usize)));
    }

    #[rstest]
    fn extracting_to_self_is_a_contract_violation() {
        let mut engine = engine_with_rows(5);
        let mut self_request = request(full_range(), 1, None, DEFAULT_LIMIT);
        self_request.caller_partition = 0;
        assert_that!(
            matches!(engine.extract_table(&self_request), Err(ReshardError::Contract(_))),
            eq(true)
        );
    }

    #[rstest]
    fn load_is_all_or_nothing() {
        let mut engine = engine_with_rows(5);
        let rows = vec![
            Row::new(10, vec![Value::Null]),
            Row::new(3, vec![Value::Null]),
        ];
        assert_that!(engine.load_table("usertable", rows).is_err(), eq(true));
        assert_that!(engine.row_count("usertable", KeyRange { from: 0, to: 100 }).ok(), eq(Some(5_usize)));
        assert_that!(engine.load_table("missing", Vec::new()).is_err(), eq(true));
    }

    #[rstest]
    fn rollback_conflict_keeps_chunk_pending() {
        let mut engine = engine_with_rows(5);
        let _ = engine
            .extract_table(&request(full_range(), 1, None, DEFAULT_LIMIT))
            .expect("extraction should succeed");
        let _ = engine
            .load_table("usertable", vec![Row::new(2, vec![Value::Null])])
            .expect("key 2 was extracted");
        assert_that!(engine.rollback(1).is_err(), eq(true));
        let pending = engine.pending_undo_tokens().collect::<Vec<_>>();
        assert_that!(&pending, eq(&vec![1_u64]));
    }
}
