//! Process composition root for `reshard`.

mod bootstrap;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use reshard_common::config::ReshardConfig;
use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionCount, PartitionId};
use reshard_migration::{MigrationExecutor, MigrationReport, without_replicated};
use reshard_placement::{GaPlacement, PlacementStats};
use reshard_plan::descriptor::PartitioningDescriptor;
use reshard_plan::phase::PartitionPhase;
use reshard_plan::reconfig::diff_table;
use reshard_plan::{KeyType, Plan, ReconfigurationPlan, ReconfigurationRange};
use reshard_storage::{Column, ColumnType, DEFAULT_LIMIT, PartitionEngine, Row, TableSchema, Value};

/// Table name used when diffing a bare plan file.
const PLAN_TABLE: &str = "plan";
/// Decimal digits of the largest key.
const KEY_DIGITS: usize = 20;

#[derive(Debug, Parser)]
#[command(name = "reshard")]
#[command(about = "Skew-aware repartitioning and live migration coordinator", long_about = None)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) config: ConfigArgs,
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Configuration sources. Flags override the JSON file.
#[derive(Debug, Clone, Default, Args)]
pub(crate) struct ConfigArgs {
    /// JSON configuration file.
    #[arg(long, env = "RESHARD_CONFIG")]
    pub(crate) config: Option<PathBuf>,
    /// Fixed search seed for reproducible placements.
    #[arg(long)]
    pub(crate) seed: Option<u64>,
    /// Placement search time limit in seconds.
    #[arg(long)]
    pub(crate) time_limit_secs: Option<u64>,
    /// Placement search generation cap.
    #[arg(long)]
    pub(crate) generations: Option<usize>,
    /// Bound every migration queue to this many ranges.
    #[arg(long)]
    pub(crate) queue_capacity: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Rebalance a plan file from access statistics.
    Plan(PlanArgs),
    /// Migrate demo rows between two partition phases on in-memory engines.
    Migrate(MigrateArgs),
}

#[derive(Debug, Clone, Args)]
pub(crate) struct PlanArgs {
    /// Current plan file.
    #[arg(long)]
    pub(crate) plan: PathBuf,
    /// Access statistics JSON.
    #[arg(long)]
    pub(crate) stats: PathBuf,
    /// Number of partitions the new plan may use.
    #[arg(long)]
    pub(crate) partitions: u32,
    /// Where to write the rebalanced plan.
    #[arg(long)]
    pub(crate) output: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub(crate) struct MigrateArgs {
    /// Phase file describing the current placement.
    #[arg(long)]
    pub(crate) old: PathBuf,
    /// Phase file describing the target placement.
    #[arg(long)]
    pub(crate) new: PathBuf,
    /// Partitioning descriptor; replicated tables it names are not migrated.
    #[arg(long)]
    pub(crate) descriptor: Option<PathBuf>,
    /// Chunk size cap in bytes. Defaults to the extract config.
    #[arg(long)]
    pub(crate) limit_bytes: Option<u64>,
    /// Refuse to synthesize more demo rows than this.
    #[arg(long, default_value_t = 1_000_000)]
    pub(crate) max_rows: u64,
}

/// Result of the `plan` subcommand.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSummary {
    /// Total load deviation before placement.
    pub imbalance_before: f64,
    /// Total load deviation after placement.
    pub imbalance_after: f64,
    /// Hot tuples and cold slices that changed partition.
    pub moved_units: usize,
    /// Migration ranges between the input and the written plan.
    pub ranges: Vec<ReconfigurationRange>,
    /// Partitions left in the written plan.
    pub partitions: Vec<PartitionId>,
}

impl PlanSummary {
    /// Human-readable report.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = format!(
            "placement: imbalance {:.1} -> {:.1}, moved_units={}, partitions={:?}, ranges={}",
            self.imbalance_before,
            self.imbalance_after,
            self.moved_units,
            self.partitions,
            self.ranges.len()
        );
        for range in &self.ranges {
            let _ = write!(text, "\n  {range}");
        }
        text
    }
}

/// Result of the `migrate` subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationSummary {
    /// Tables skipped as replicated.
    pub skipped_tables: Vec<String>,
    /// One report per migrated range, in plan order.
    pub reports: Vec<MigrationReport>,
}

impl MigrationSummary {
    /// Total rows moved.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.reports.iter().map(|report| report.rows).sum()
    }

    /// Human-readable report.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = format!(
            "migration: ranges={}, rows={}, skipped_tables={:?}",
            self.reports.len(),
            self.rows(),
            self.skipped_tables
        );
        for report in &self.reports {
            let _ = write!(
                text,
                "\n  {} {} rows={} chunks={} retries={}",
                report.table, report.range, report.rows, report.chunks, report.retries
            );
        }
        text
    }
}

/// Reconfiguration coordinator: owns the configuration and wires placement, diffing and
/// migration together.
#[derive(Debug, Clone)]
pub struct Coordinator {
    config: ReshardConfig,
}

impl Coordinator {
    /// Creates a coordinator from a validated configuration.
    #[must_use]
    pub const fn new(config: ReshardConfig) -> Self {
        Self { config }
    }

    /// Rebalances a plan file and writes the result.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidConfig` for a zero partition count, plus any load, placement
    /// or write failure.
    pub fn plan(&self, args: &PlanArgs) -> ReshardResult<PlanSummary> {
        let partition_count = PartitionCount::new(args.partitions)
            .ok_or(ReshardError::InvalidConfig("--partitions must be positive"))?;
        let stats = PlacementStats::load(&args.stats)?;
        let current = Plan::load(&args.plan)?;

        let mut placement =
            GaPlacement::new(self.config.placement.clone(), self.config.search.clone());
        let outcome = placement.compute_placement(
            &stats.hot_tuples,
            &stats.partition_totals,
            &current,
            partition_count,
            self.config.placement.time_limit(),
        )?;
        outcome.plan.save(&args.output)?;
        let diff = diff_table(PLAN_TABLE, KeyType::BigInt, &current, &outcome.plan)?;
        tracing::info!(
            output = %args.output.display(),
            moved_units = outcome.moved_units,
            ranges = diff.ranges.len(),
            "plan written"
        );

        Ok(PlanSummary {
            imbalance_before: outcome.imbalance_before,
            imbalance_after: outcome.imbalance_after,
            moved_units: outcome.moved_units,
            ranges: diff.ranges,
            partitions: outcome.plan.partitions().collect(),
        })
    }

    /// Loads both phases, fills in-memory engines with demo rows for the old phase, migrates
    /// them and checks every row landed where the new phase puts it.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidConfig` when the demo data would exceed `max_rows`,
    /// `ReshardError::Storage` when a row is not on its new partition afterwards, plus any load,
    /// diff or migration failure.
    pub fn migrate(&self, args: &MigrateArgs) -> ReshardResult<MigrationSummary> {
        let old = PartitionPhase::load(&args.old)?;
        let new = PartitionPhase::load(&args.new)?;
        let descriptor = match &args.descriptor {
            Some(path) => PartitioningDescriptor::from_json(&fs::read_to_string(path)?)?,
            None => PartitioningDescriptor::default(),
        };

        let full = ReconfigurationPlan::between(&old, &new)?;
        let plan = without_replicated(&full, &descriptor);
        let skipped_tables = old
            .tables()
            .map(|(name, _)| name)
            .filter(|name| descriptor.is_replicated(name))
            .map(str::to_owned)
            .collect::<Vec<_>>();

        let engines = demo_engines(&old, &new, &descriptor, &self.config, args.max_rows)?;
        let limit_bytes = match args.limit_bytes {
            Some(bytes) => i64::try_from(bytes)
                .map_err(|_| ReshardError::InvalidConfig("--limit-bytes is too large"))?,
            None => DEFAULT_LIMIT,
        };
        let mut executor =
            MigrationExecutor::new(engines, self.config.clone())?.with_limit_bytes(limit_bytes);
        let reports = executor.execute(&plan)?;
        verify_placement(&executor, &new, &descriptor)?;

        Ok(MigrationSummary {
            skipped_tables,
            reports,
        })
    }
}

const fn column_type(key_type: KeyType) -> ColumnType {
    match key_type {
        KeyType::TinyInt => ColumnType::TinyInt,
        KeyType::SmallInt => ColumnType::SmallInt,
        KeyType::Integer => ColumnType::Integer,
        KeyType::BigInt => ColumnType::BigInt,
    }
}

/// Payloads are `{table}-{key}`, so the column fits the table name plus any key.
fn demo_schema(table: &str, key_type: KeyType) -> ReshardResult<Arc<TableSchema>> {
    let width = u32::try_from(table.len() + 1 + KEY_DIGITS)
        .map_err(|_| ReshardError::InvalidConfig("table name is too long for demo data"))?;
    Ok(Arc::new(TableSchema::new(
        table,
        Column::new("key", column_type(key_type)),
        vec![Column::new("payload", ColumnType::Varchar(width))],
    )))
}

/// One engine per partition named by either phase, holding one demo row per key of the old
/// phase.
fn demo_engines(
    old: &PartitionPhase,
    new: &PartitionPhase,
    descriptor: &PartitioningDescriptor,
    config: &ReshardConfig,
    max_rows: u64,
) -> ReshardResult<Vec<PartitionEngine>> {
    let partitions = old
        .tables()
        .chain(new.tables())
        .filter(|(name, _)| !descriptor.is_replicated(name))
        .flat_map(|(_, table)| table.plan.partitions().collect::<Vec<_>>())
        .collect::<BTreeSet<_>>();

    let mut engines = partitions
        .iter()
        .map(|partition| (*partition, PartitionEngine::new(*partition, &config.extract)))
        .collect::<BTreeMap<_, _>>();
    let mut total_rows = 0_u64;
    for (name, table) in old.tables() {
        if descriptor.is_replicated(name) {
            continue;
        }
        let schema = demo_schema(name, table.key_type)?;
        let mut rows_by_partition: BTreeMap<PartitionId, Vec<Row>> = BTreeMap::new();
        for (range, owner) in table.plan.segments() {
            total_rows += range.width();
            if total_rows > max_rows {
                return Err(ReshardError::InvalidConfig("demo data exceeds --max-rows"));
            }
            rows_by_partition.entry(owner).or_default().extend(
                (range.from..range.to)
                    .map(|key| Row::new(key, vec![Value::Text(format!("{name}-{key}"))])),
            );
        }
        for (partition, engine) in &mut engines {
            engine.create_table(Arc::clone(&schema))?;
            if let Some(rows) = rows_by_partition.remove(partition) {
                let _ = engine.load_table(name, rows)?;
            }
        }
    }
    tracing::info!(partitions = engines.len(), rows = total_rows, "demo engines loaded");
    Ok(engines.into_values().collect())
}

/// Checks that every key of the new phase is stored on its new owner.
fn verify_placement(
    executor: &MigrationExecutor,
    new: &PartitionPhase,
    descriptor: &PartitioningDescriptor,
) -> ReshardResult<()> {
    for (name, table) in new.tables() {
        if descriptor.is_replicated(name) {
            continue;
        }
        for (range, owner) in table.plan.segments() {
            let stored = executor
                .engine(owner)?
                .lock()
                .map_err(|_| ReshardError::InvalidState("partition engine mutex is poisoned"))?
                .row_count(name, range)?;
            if u64::try_from(stored).ok() != Some(range.width()) {
                return Err(ReshardError::Storage(format!(
                    "table {name}: partition {owner} holds {stored} of {} rows in {range}",
                    range.width()
                )));
            }
        }
    }
    Ok(())
}

/// Parses the command line, runs one subcommand and prints its report.
///
/// # Errors
///
/// Returns any configuration or subcommand failure.
pub fn run() -> ReshardResult<()> {
    bootstrap::init_tracing();
    let cli = Cli::parse();
    let config = bootstrap::load_config(&cli.config)?;
    let coordinator = Coordinator::new(config);
    let report = match &cli.command {
        Command::Plan(args) => coordinator.plan(args)?.render(),
        Command::Migrate(args) => coordinator.migrate(args)?.render(),
    };
    println!("{report}");
    Ok(())
}
