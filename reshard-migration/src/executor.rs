//! Executes a reconfiguration plan across partition engines.
//!
//! Every source partition gets one consumer thread, so extraction from an engine only ever runs
//! on that partition's thread. Each routed range carries its own request txn id; the consumer
//! publishes the range's outcome under that id and the executor collects them through the
//! dependency tracker.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use reshard_common::config::ReshardConfig;
use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionId, TxnId, UndoToken};
use reshard_core::{Consumer, DependencyTracker, Producer, Router, WAIT_EXHAUSTED};
use reshard_plan::descriptor::PartitioningDescriptor;
use reshard_plan::{ReconfigurationPlan, ReconfigurationRange};
use reshard_storage::{DEFAULT_LIMIT, ExtractChunk, ExtractRequest, PartitionEngine};

use crate::session::{ChunkSink, ChunkSource, ExtractionSession, MigrationReport, UndoTokenSequence};

/// Partition engine shared between the executor and the consumer threads.
pub type SharedEngine = Arc<Mutex<PartitionEngine>>;

type MigrationOutcome = Result<MigrationReport, ReshardError>;

type MigrationProducer = Producer<ReconfigurationRange, MigrationTask, SourcePartitionRouter>;

const ABORTED: ReshardError = ReshardError::InvalidState("migration aborted by an earlier failure");

fn lock(engine: &SharedEngine) -> ReshardResult<MutexGuard<'_, PartitionEngine>> {
    engine
        .lock()
        .map_err(|_| ReshardError::InvalidState("partition engine mutex is poisoned"))
}

impl ChunkSource for SharedEngine {
    fn extract(&mut self, request: &ExtractRequest) -> ReshardResult<ExtractChunk> {
        lock(self)?.extract_table(request)
    }

    fn rollback(&mut self, undo_token: UndoToken) -> ReshardResult<usize> {
        lock(self)?.rollback(undo_token)
    }

    fn release(&mut self, undo_token: UndoToken) -> ReshardResult<()> {
        lock(self)?.release(undo_token)
    }
}

/// Writes accepted chunks into a destination engine, creating the table on first use.
#[derive(Debug, Clone)]
pub struct EngineSink {
    engine: SharedEngine,
}

impl EngineSink {
    /// Sink writing into `engine`.
    #[must_use]
    pub const fn new(engine: SharedEngine) -> Self {
        Self { engine }
    }
}

impl ChunkSink for EngineSink {
    fn accept(&mut self, range: &ReconfigurationRange, chunk: &ExtractChunk) -> ReshardResult<()> {
        let mut engine = lock(&self.engine)?;
        if engine.partition() != range.new_partition {
            return Err(ReshardError::Contract(format!(
                "range {range} delivered to partition {}",
                engine.partition()
            )));
        }
        engine.create_table(Arc::clone(chunk.batch.schema()))?;
        let _ = engine.load_table(chunk.batch.table(), chunk.batch.rows().to_vec())?;
        Ok(())
    }
}

/// One range routed to a source partition, tagged with its request txn id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationTask {
    /// Request id the outcome is published under.
    pub txn: TxnId,
    /// Range to migrate.
    pub range: ReconfigurationRange,
}

/// Routes each range to the consumer of its source partition.
///
/// Txn ids are handed out sequentially from `first_txn` in routing order.
#[derive(Debug, Clone)]
pub struct SourcePartitionRouter {
    consumers: BTreeMap<PartitionId, usize>,
    next_txn: TxnId,
}

impl SourcePartitionRouter {
    /// Router for consumers serving `sources`, in that order.
    #[must_use]
    pub fn new(sources: &[PartitionId], first_txn: TxnId) -> Self {
        Self {
            consumers: sources
                .iter()
                .enumerate()
                .map(|(index, partition)| (*partition, index))
                .collect(),
            next_txn: first_txn,
        }
    }
}

impl Router<ReconfigurationRange, MigrationTask> for SourcePartitionRouter {
    fn route(&mut self, range: ReconfigurationRange, consumer_count: usize) -> (usize, MigrationTask) {
        let txn = self.next_txn;
        self.next_txn += 1;
        // An unknown source maps past the last consumer, which the producer rejects.
        let index = self
            .consumers
            .get(&range.old_partition)
            .copied()
            .unwrap_or(consumer_count);
        (index, MigrationTask { txn, range })
    }
}

/// Drops the tables a descriptor marks as replicated: every partition already holds them.
#[must_use]
pub fn without_replicated(
    plan: &ReconfigurationPlan,
    descriptor: &PartitioningDescriptor,
) -> ReconfigurationPlan {
    ReconfigurationPlan::from_tables(
        plan.tables()
            .iter()
            .filter(|table| {
                let replicated = descriptor.is_replicated(&table.table);
                if replicated {
                    tracing::debug!(table = %table.table, "skipping replicated table");
                }
                !replicated
            })
            .cloned()
            .collect(),
    )
}

/// Migrates reconfiguration plans between a fixed set of partition engines.
#[derive(Debug)]
pub struct MigrationExecutor {
    engines: BTreeMap<PartitionId, SharedEngine>,
    config: ReshardConfig,
    limit_bytes: i64,
    tracker: Arc<DependencyTracker<MigrationOutcome>>,
    next_txn: TxnId,
}

impl MigrationExecutor {
    /// Executor over `engines`, keyed by their partition.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Contract` when two engines claim the same partition.
    pub fn new(
        engines: impl IntoIterator<Item = PartitionEngine>,
        config: ReshardConfig,
    ) -> ReshardResult<Self> {
        let mut by_partition = BTreeMap::new();
        for engine in engines {
            let partition = engine.partition();
            if by_partition
                .insert(partition, Arc::new(Mutex::new(engine)))
                .is_some()
            {
                return Err(ReshardError::Contract(format!(
                    "partition {partition} has two engines"
                )));
            }
        }
        Ok(Self {
            engines: by_partition,
            config,
            limit_bytes: DEFAULT_LIMIT,
            tracker: Arc::new(DependencyTracker::new()),
            next_txn: 1,
        })
    }

    /// Caps every chunk at `limit_bytes` instead of the engines' default.
    #[must_use]
    pub fn with_limit_bytes(mut self, limit_bytes: i64) -> Self {
        self.limit_bytes = limit_bytes;
        self
    }

    /// Engine of `partition`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Contract` when no engine serves `partition`.
    pub fn engine(&self, partition: PartitionId) -> ReshardResult<&SharedEngine> {
        self.engines.get(&partition).ok_or_else(|| {
            ReshardError::Contract(format!("no engine serves partition {partition}"))
        })
    }

    /// Partitions served by this executor, ascending.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.engines.keys().copied()
    }

    /// Migrates every range of `plan`, returning one report per range in plan order.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Contract` when a range names a partition without an engine (before
    /// anything moves). Otherwise returns the first range failure; ranges already migrated stay
    /// migrated and ranges not started yet are skipped.
    pub fn execute(&mut self, plan: &ReconfigurationPlan) -> ReshardResult<Vec<MigrationReport>> {
        let ranges = plan.ranges().cloned().collect::<Vec<_>>();
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        for range in &ranges {
            self.engine(range.old_partition)?;
            self.engine(range.new_partition)?;
        }
        let sources = ranges
            .iter()
            .map(|range| range.old_partition)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect::<Vec<_>>();

        let first_txn = self.next_txn;
        let range_count = ranges.len() as u64;
        self.next_txn += range_count;
        tracing::info!(
            ranges = range_count,
            sources = sources.len(),
            first_txn,
            "starting migration"
        );

        let aborted = Arc::new(AtomicBool::new(false));
        let mut producer = Producer::new(ranges, SourcePartitionRouter::new(&sources, first_txn));
        for source in &sources {
            producer.add_consumer(self.source_consumer(*source, &aborted)?);
        }

        let outcome = producer
            .run()
            .and_then(|routed| self.collect(first_txn, routed, &producer));
        let joined = producer.join();
        for txn in first_txn..first_txn + range_count {
            let _ = self.tracker.remove(txn)?;
        }
        let reports = outcome?;
        joined?;
        Ok(reports)
    }

    fn source_consumer(
        &self,
        source: PartitionId,
        aborted: &Arc<AtomicBool>,
    ) -> ReshardResult<Consumer<MigrationTask>> {
        let mut engine = Arc::clone(self.engine(source)?);
        let mut tokens = UndoTokenSequence::after(lock(&engine)?.last_undo_token());
        let destinations = self.engines.clone();
        let tracker = Arc::clone(&self.tracker);
        let aborted = Arc::clone(aborted);
        let limit_bytes = self.limit_bytes;
        let max_chunk_retries = self.config.extract.max_chunk_retries;

        Ok(Consumer::new(self.config.pipeline.queue, move |task: MigrationTask| {
            let outcome = if aborted.load(Ordering::Acquire) {
                Err(ABORTED)
            } else {
                destinations
                    .get(&task.range.new_partition)
                    .ok_or_else(|| {
                        ReshardError::Contract(format!(
                            "no engine serves partition {}",
                            task.range.new_partition
                        ))
                    })
                    .and_then(|destination| {
                        let mut sink = EngineSink::new(Arc::clone(destination));
                        ExtractionSession::new(task.txn, limit_bytes, max_chunk_retries).run(
                            &mut engine,
                            &mut sink,
                            &task.range,
                            &mut tokens,
                        )
                    })
            };
            if outcome.is_err() {
                aborted.store(true, Ordering::Release);
            }
            tracker.publish(task.txn, outcome.clone())?;
            outcome.map(|_| ())
        }))
    }

    /// Awaits every routed txn. The first real failure wins over the aborts it caused.
    fn collect(
        &self,
        first_txn: TxnId,
        routed: usize,
        producer: &MigrationProducer,
    ) -> ReshardResult<Vec<MigrationReport>> {
        let mut reports = Vec::with_capacity(routed);
        let mut failure = None;
        for txn in (first_txn..).take(routed) {
            match self.await_outcome(txn, producer)? {
                Ok(report) => reports.push(report),
                Err(error) if error == ABORTED => {
                    if failure.is_none() {
                        failure = Some(error);
                    }
                }
                Err(error) => {
                    tracing::warn!(txn, error = %error, "range migration failed");
                    if failure.as_ref().is_none_or(|first| *first == ABORTED) {
                        failure = Some(error);
                    }
                }
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(reports),
        }
    }

    /// Outcome of `txn`. Gives up only once every consumer thread has exited without publishing
    /// it.
    fn await_outcome(
        &self,
        txn: TxnId,
        producer: &MigrationProducer,
    ) -> ReshardResult<MigrationOutcome> {
        loop {
            match self.tracker.await_with_retry(txn, &self.config.rendezvous) {
                Ok(outcome) => return Ok(outcome),
                Err(error) if error == WAIT_EXHAUSTED && producer.is_running() => {
                    tracing::debug!(txn, "range still migrating");
                }
                Err(error) => return self.tracker.get(txn)?.ok_or(error),
            }
        }
    }
}
