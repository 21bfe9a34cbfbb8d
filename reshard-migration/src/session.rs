//! Chunk loop that moves one reconfiguration range from its source partition to a sink.
//!
//! Chunks are committed lazily: the source only drops a chunk's undo data when the next extract
//! names it as the previous token, or when the final chunk is accepted. A sink failure therefore
//! rolls back exactly the chunk in flight and the loop retries it under a fresh token.

use reshard_common::error::ReshardResult;
use reshard_common::ids::{TxnId, UndoToken};
use reshard_plan::{KeyRange, ReconfigurationRange};
use reshard_storage::{ExtractChunk, ExtractRequest, PartitionEngine};

/// Side of the protocol that owns the rows being moved.
pub trait ChunkSource {
    /// Removes the next chunk, see [`PartitionEngine::extract_table`].
    ///
    /// # Errors
    ///
    /// Any extraction failure.
    fn extract(&mut self, request: &ExtractRequest) -> ReshardResult<ExtractChunk>;

    /// Restores the chunk parked under `undo_token`.
    ///
    /// # Errors
    ///
    /// Any rollback failure.
    fn rollback(&mut self, undo_token: UndoToken) -> ReshardResult<usize>;

    /// Commits the chunk parked under `undo_token`.
    ///
    /// # Errors
    ///
    /// Any release failure.
    fn release(&mut self, undo_token: UndoToken) -> ReshardResult<()>;
}

impl ChunkSource for PartitionEngine {
    fn extract(&mut self, request: &ExtractRequest) -> ReshardResult<ExtractChunk> {
        self.extract_table(request)
    }

    fn rollback(&mut self, undo_token: UndoToken) -> ReshardResult<usize> {
        Self::rollback(self, undo_token)
    }

    fn release(&mut self, undo_token: UndoToken) -> ReshardResult<()> {
        Self::release(self, undo_token)
    }
}

/// Destination of extracted chunks.
pub trait ChunkSink {
    /// Stores one chunk of `range`. A failure makes the session roll the chunk back.
    ///
    /// # Errors
    ///
    /// Any write failure.
    fn accept(&mut self, range: &ReconfigurationRange, chunk: &ExtractChunk) -> ReshardResult<()>;
}

/// Hands out strictly increasing undo tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoTokenSequence {
    next: UndoToken,
}

impl UndoTokenSequence {
    /// Sequence whose first token is `first`.
    #[must_use]
    pub const fn starting_at(first: UndoToken) -> Self {
        Self { next: first }
    }

    /// Sequence continuing after `last`, typically [`PartitionEngine::last_undo_token`].
    #[must_use]
    pub const fn after(last: Option<UndoToken>) -> Self {
        match last {
            Some(last) => Self::starting_at(last.saturating_add(1)),
            None => Self::starting_at(1),
        }
    }

    /// Returns the next token.
    pub const fn next_token(&mut self) -> UndoToken {
        let token = self.next;
        self.next = self.next.saturating_add(1);
        token
    }
}

/// Outcome of migrating one range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migrated table.
    pub table: String,
    /// Migrated keys.
    pub range: KeyRange,
    /// Rows accepted by the sink.
    pub rows: usize,
    /// Chunks accepted by the sink.
    pub chunks: usize,
    /// Chunks rolled back and extracted again.
    pub retries: u32,
    /// Token of the final chunk.
    pub last_undo_token: Option<UndoToken>,
}

/// Drives the extraction loop of one range.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionSession {
    request_id: TxnId,
    limit_bytes: i64,
    max_chunk_retries: u32,
}

impl ExtractionSession {
    /// Session for migration request `request_id`, cutting chunks at `limit_bytes`.
    #[must_use]
    pub const fn new(request_id: TxnId, limit_bytes: i64, max_chunk_retries: u32) -> Self {
        Self {
            request_id,
            limit_bytes,
            max_chunk_retries,
        }
    }

    /// Moves every row of `range` from `source` into `sink`.
    ///
    /// # Errors
    ///
    /// Returns the extraction error as is, or the sink error once a chunk failed
    /// `max_chunk_retries + 1` times. Chunks accepted before the failure stay committed and the
    /// failed chunk is restored on the source.
    pub fn run(
        &self,
        source: &mut dyn ChunkSource,
        sink: &mut dyn ChunkSink,
        range: &ReconfigurationRange,
        tokens: &mut UndoTokenSequence,
    ) -> ReshardResult<MigrationReport> {
        let mut report = MigrationReport {
            table: range.table.clone(),
            range: range.key_range(),
            rows: 0,
            chunks: 0,
            retries: 0,
            last_undo_token: None,
        };
        let mut previous = None;
        let mut failed_attempts = 0_u32;

        loop {
            let undo_token = tokens.next_token();
            let chunk = source.extract(&ExtractRequest {
                table: range.table.clone(),
                range: range.key_range(),
                request_id: self.request_id,
                caller_partition: range.new_partition,
                undo_token,
                previous_undo_token: previous,
                limit_bytes: self.limit_bytes,
            })?;
            // The previous chunk is committed by the call above, whatever the sink does next.
            previous = None;

            if let Err(error) = sink.accept(range, &chunk) {
                let restored = source.rollback(undo_token)?;
                failed_attempts += 1;
                if failed_attempts > self.max_chunk_retries {
                    tracing::warn!(
                        request_id = self.request_id,
                        table = %range.table,
                        undo_token,
                        attempts = failed_attempts,
                        error = %error,
                        "giving up on chunk"
                    );
                    return Err(error);
                }
                report.retries += 1;
                tracing::debug!(
                    request_id = self.request_id,
                    undo_token,
                    restored,
                    error = %error,
                    "sink rejected chunk, retrying"
                );
                continue;
            }

            failed_attempts = 0;
            report.rows += chunk.batch.row_count();
            report.chunks += 1;
            report.last_undo_token = Some(undo_token);
            if !chunk.has_more {
                source.release(undo_token)?;
                break;
            }
            previous = Some(undo_token);
        }

        tracing::info!(
            request_id = self.request_id,
            table = %report.table,
            range = %report.range,
            from = range.old_partition,
            to = range.new_partition,
            rows = report.rows,
            chunks = report.chunks,
            retries = report.retries,
            "range migrated"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::{ChunkSink, ExtractionSession, MigrationReport, UndoTokenSequence};
    use googletest::prelude::*;
    use reshard_common::config::ExtractConfig;
    use reshard_common::error::{ReshardError, ReshardResult};
    use reshard_plan::{KeyRange, KeyType, ReconfigurationRange};
    use reshard_storage::{Column, ColumnType, ExtractChunk, PartitionEngine, Row, TableSchema, Value};
    use rstest::rstest;
    use std::sync::Arc;

    /// Records accepted keys and fails the calls listed in `fail_on` (1-based).
    #[derive(Default)]
    struct RecordingSink {
        calls: usize,
        fail_on: Vec<usize>,
        keys: Vec<u64>,
    }

    impl ChunkSink for RecordingSink {
        fn accept(&mut self, _range: &ReconfigurationRange, chunk: &ExtractChunk) -> ReshardResult<()> {
            self.calls += 1;
            if self.fail_on.contains(&self.calls) {
                return Err(ReshardError::Storage(format!("sink call {} failed", self.calls)));
            }
            self.keys.extend(chunk.batch.rows().iter().map(|row| row.key));
            Ok(())
        }
    }

    fn source(rows: u64) -> PartitionEngine {
        let mut engine = PartitionEngine::new(0, &ExtractConfig::default());
        engine
            .create_table(Arc::new(TableSchema::new(
                "usertable",
                Column::new("id", ColumnType::BigInt),
                vec![Column::new("payload", ColumnType::Varchar(188))],
            )))
            .expect("table is new");
        let rows = (0..rows)
            .map(|key| Row::new(key, vec![Value::Text(format!("v{key}"))]))
            .collect();
        let _ = engine.load_table("usertable", rows).expect("rows are valid");
        engine
    }

    fn range(to: u64) -> ReconfigurationRange {
        ReconfigurationRange {
            table: "usertable".to_owned(),
            key_type: KeyType::BigInt,
            from: 0,
            to,
            old_partition: 0,
            new_partition: 1,
        }
    }

    #[rstest]
    fn clean_run_moves_every_row_once() {
        let mut engine = source(1000);
        let mut sink = RecordingSink::default();
        let mut tokens = UndoTokenSequence::starting_at(1);

        let report = ExtractionSession::new(9, 2048, 3)
            .run(&mut engine, &mut sink, &range(1000), &mut tokens)
            .expect("migration should succeed");

        assert_that!(
            &report,
            eq(&MigrationReport {
                table: "usertable".to_owned(),
                range: KeyRange { from: 0, to: 1000 },
                rows: 1000,
                chunks: 100,
                retries: 0,
                last_undo_token: Some(100),
            })
        );
        assert_that!(&sink.keys, eq(&(0..1000).collect::<Vec<u64>>()));
        assert_that!(engine.pending_undo_tokens().count(), eq(0_usize));
        assert_that!(engine.row_count("usertable", KeyRange { from: 0, to: 1000 }).ok(), eq(Some(0_usize)));
    }

    #[rstest]
    #[case::first_chunk(vec![1], 1)]
    #[case::middle_chunk(vec![5], 1)]
    #[case::same_chunk_twice(vec![5, 6], 2)]
    #[case::last_chunk(vec![10], 1)]
    fn failed_chunk_is_retried_not_restarted(#[case] fail_on: Vec<usize>, #[case] retries: u32) {
        let mut engine = source(100);
        let mut sink = RecordingSink {
            fail_on,
            ..RecordingSink::default()
        };
        let mut tokens = UndoTokenSequence::starting_at(1);

        let report = ExtractionSession::new(1, 2000, 3)
            .run(&mut engine, &mut sink, &range(100), &mut tokens)
            .expect("retries should recover");

        assert_that!(report.retries, eq(retries));
        assert_that!(report.chunks, eq(10_usize));
        assert_that!(report.rows, eq(100_usize));
        assert_that!(&sink.keys, eq(&(0..100).collect::<Vec<u64>>()));
        assert_that!(engine.pending_undo_tokens().count(), eq(0_usize));
    }

    #[rstest]
    fn exhausted_retries_keep_prior_chunks_committed() {
        let mut engine = source(100);
        let mut sink = RecordingSink {
            fail_on: (3..10).collect(),
            ..RecordingSink::default()
        };
        let mut tokens = UndoTokenSequence::starting_at(1);

        let error = ExtractionSession::new(1, 2000, 2)
            .run(&mut engine, &mut sink, &range(100), &mut tokens)
            .expect_err("sink keeps failing");

        assert_that!(&error, eq(&ReshardError::Storage("sink call 5 failed".to_owned())));
        assert_that!(&sink.keys, eq(&(0..20).collect::<Vec<u64>>()));
        assert_that!(engine.row_count("usertable", KeyRange { from: 0, to: 100 }).ok(), eq(Some(80_usize)));
        assert_that!(engine.pending_undo_tokens().count(), eq(0_usize));
    }

    #[rstest]
    fn empty_range_reports_one_empty_chunk() {
        let mut engine = source(10);
        let mut sink = RecordingSink::default();
        let mut tokens = UndoTokenSequence::after(Some(41));

        let mut empty = range(600);
        empty.from = 500;
        let report = ExtractionSession::new(1, -1, 0)
            .run(&mut engine, &mut sink, &empty, &mut tokens)
            .expect("empty range migrates");

        assert_that!(report.rows, eq(0_usize));
        assert_that!(report.chunks, eq(1_usize));
        assert_that!(report.last_undo_token, eq(Some(42_u64)));
    }

    #[rstest]
    fn stale_token_sequence_surfaces_storage_error() {
        let mut engine = source(10);
        let mut tokens = UndoTokenSequence::starting_at(1);
        let _ = ExtractionSession::new(1, -1, 0)
            .run(&mut engine, &mut RecordingSink::default(), &range(5), &mut tokens)
            .expect("first range migrates");

        let mut stale = UndoTokenSequence::starting_at(1);
        let mut rest = range(10);
        rest.from = 5;
        let outcome = ExtractionSession::new(2, -1, 0).run(
            &mut engine,
            &mut RecordingSink::default(),
            &rest,
            &mut stale,
        );
        assert_that!(matches!(outcome, Err(ReshardError::Storage(_))), eq(true));
    }
}
