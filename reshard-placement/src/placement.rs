//! Skew-driven placement: turns access statistics and the current plan into a rebalanced plan.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use reshard_common::config::{PlacementConfig, SearchConfig};
use reshard_common::containers::HotTuples;
use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionCount, PartitionId, TupleId};
use reshard_plan::{KeyRange, Plan};
use serde::Deserialize;

use crate::problem::{PlacementProblem, SearchProblem};
use crate::search::{EvolutionarySearch, Optimizer, SearchBudget};

/// Access statistics feeding one placement run.
///
/// `hot_tuples[p]` holds the hot tuples currently on partition `p`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementStats {
    /// Hot tuples per partition, indexed by partition id.
    pub hot_tuples: Vec<HotTuples>,
    /// Total access count per partition. Missing partitions count as 0.
    pub partition_totals: BTreeMap<PartitionId, u64>,
}

#[derive(Debug, Deserialize)]
struct StatsFile {
    #[serde(default)]
    hot_tuples: Vec<BTreeMap<TupleId, u64>>,
    #[serde(default)]
    partition_totals: BTreeMap<PartitionId, u64>,
}

impl PlacementStats {
    /// Parses `{"hot_tuples": [{"<tuple>": count}, ...], "partition_totals": {"0": 123}}`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` for malformed JSON.
    pub fn from_json(payload: &str) -> ReshardResult<Self> {
        let file: StatsFile = serde_json::from_str(payload)?;
        Ok(Self {
            hot_tuples: file
                .hot_tuples
                .into_iter()
                .map(|partition| partition.into_iter().collect())
                .collect(),
            partition_totals: file.partition_totals,
        })
    }

    /// Loads a stats file.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io` for read failures and `ReshardError::Plan` for parse failures.
    pub fn load<P: AsRef<Path>>(path: P) -> ReshardResult<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

/// Result of one placement run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementOutcome {
    /// Rebalanced plan.
    pub plan: Plan,
    /// Total deviation from the mean load before the run.
    pub imbalance_before: f64,
    /// Total deviation from the mean load under the chosen assignment. Never above
    /// `imbalance_before`.
    pub imbalance_after: f64,
    /// Units (hot tuples and cold slices) assigned to a new partition.
    pub moved_units: usize,
    /// Smallest non-zero unit weight, `None` when nothing could move.
    pub smallest_unit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Unit {
    Hot(TupleId),
    Slice(Vec<KeyRange>),
}

/// Placement optimizer over hot tuples and cold slices.
#[derive(Debug)]
pub struct GaPlacement<O = EvolutionarySearch> {
    config: PlacementConfig,
    generations: usize,
    optimizer: O,
}

impl GaPlacement<EvolutionarySearch> {
    /// Creates a placement driven by the default evolutionary search.
    #[must_use]
    pub fn new(config: PlacementConfig, search: SearchConfig) -> Self {
        let generations = search.generations;
        Self::with_optimizer(config, generations, EvolutionarySearch::new(search))
    }
}

impl<O: Optimizer> GaPlacement<O> {
    /// Creates a placement driven by a custom optimizer.
    #[must_use]
    pub const fn with_optimizer(config: PlacementConfig, generations: usize, optimizer: O) -> Self {
        Self {
            config,
            generations,
            optimizer,
        }
    }

    /// Computes a rebalanced copy of `plan`.
    ///
    /// # Errors
    ///
    /// See [`GaPlacement::compute_placement`].
    pub fn compute_plan(
        &mut self,
        hot_tuples: &[HotTuples],
        partition_totals: &BTreeMap<PartitionId, u64>,
        plan: &Plan,
        partition_count: PartitionCount,
        time_limit: Duration,
    ) -> ReshardResult<Plan> {
        self.compute_placement(hot_tuples, partition_totals, plan, partition_count, time_limit)
            .map(|outcome| outcome.plan)
    }

    /// Loads the current plan from `plan_path`, then behaves like [`GaPlacement::compute_plan`].
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io`/`ReshardError::Plan` when the plan file cannot be loaded, plus
    /// every error of [`GaPlacement::compute_placement`].
    pub fn compute_plan_from_file<P: AsRef<Path>>(
        &mut self,
        hot_tuples: &[HotTuples],
        partition_totals: &BTreeMap<PartitionId, u64>,
        plan_path: P,
        partition_count: PartitionCount,
        time_limit: Duration,
    ) -> ReshardResult<Plan> {
        let plan = Plan::load(plan_path)?;
        self.compute_plan(hot_tuples, partition_totals, &plan, partition_count, time_limit)
    }

    /// Computes a rebalanced copy of `plan` and reports how far the load moved.
    ///
    /// Hot tuples become exceptions on their destination partition; cold slices move their
    /// ranges. Afterwards exceptions touching a range of their own partition are folded back into
    /// range form and partitions left without data are dropped. With nothing to move the input
    /// plan is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Contract` when statistics or the plan name a partition outside
    /// `partition_count`, and `ReshardError::Plan` when a hot tuple is not owned by the partition
    /// it is reported on.
    pub fn compute_placement(
        &mut self,
        hot_tuples: &[HotTuples],
        partition_totals: &BTreeMap<PartitionId, u64>,
        plan: &Plan,
        partition_count: PartitionCount,
        time_limit: Duration,
    ) -> ReshardResult<PlacementOutcome> {
        let (problem, units) =
            self.build_problem(hot_tuples, partition_totals, plan, partition_count)?;
        let current = problem.current();
        let imbalance_before = problem.imbalance(&current);
        let smallest_unit = problem.smallest_unit();

        if units.is_empty() {
            return Ok(PlacementOutcome {
                plan: plan.clone(),
                imbalance_before,
                imbalance_after: imbalance_before,
                moved_units: 0,
                smallest_unit,
            });
        }

        let budget = SearchBudget {
            generations: self.generations,
            deadline: Instant::now().checked_add(time_limit),
        };
        let best = self.optimizer.search(&problem, budget);
        let imbalance_after = problem.imbalance(&best.genes);

        let mut next = plan.clone();
        let mut moved_units = 0;
        for ((unit, source), destination) in units.iter().zip(&current).zip(&best.genes) {
            if source == destination {
                continue;
            }
            moved_units += 1;
            match unit {
                Unit::Hot(tuple) => {
                    let _ = next.remove_tuple_id(*source, *tuple);
                    next.add_exception(*destination, *tuple)?;
                }
                Unit::Slice(ranges) => {
                    for range in ranges {
                        next.remove_range(*source, *range)?;
                        next.add_key_range(*destination, *range)?;
                    }
                }
            }
        }
        let demoted = next.demote_tuples();
        let dropped = next.remove_empty_partitions();

        tracing::info!(
            moved_units,
            demoted,
            dropped = dropped.len(),
            imbalance_before,
            imbalance_after,
            "placement computed"
        );
        Ok(PlacementOutcome {
            plan: next,
            imbalance_before,
            imbalance_after,
            moved_units,
            smallest_unit,
        })
    }

    fn build_problem(
        &self,
        hot_tuples: &[HotTuples],
        partition_totals: &BTreeMap<PartitionId, u64>,
        plan: &Plan,
        partition_count: PartitionCount,
    ) -> ReshardResult<(PlacementProblem, Vec<Unit>)> {
        let count = partition_count.get();
        if hot_tuples.len() > count as usize {
            return Err(ReshardError::Contract(format!(
                "hot tuples reported for {} partitions, partition count is {count}",
                hot_tuples.len()
            )));
        }
        if let Some(partition) = plan.partitions().find(|partition| *partition >= count) {
            return Err(ReshardError::Contract(format!(
                "plan partition {partition} is outside partition count {count}"
            )));
        }
        if let Some(partition) = partition_totals.keys().find(|partition| **partition >= count) {
            tracing::warn!(partition, count, "ignoring load of partition outside partition count");
        }

        // Residual load and plan once hot tuples are pulled out.
        let mut residual_load = partition_count
            .ids()
            .map(|partition| partition_totals.get(&partition).copied().unwrap_or(0))
            .collect::<Vec<_>>();
        let mut residual = plan.clone();
        let mut hot_units = Vec::new();
        for (partition, tuples) in (0..count).zip(hot_tuples) {
            let mut sorted = tuples.iter().map(|(tuple, accesses)| (*tuple, *accesses)).collect::<Vec<_>>();
            sorted.sort_unstable();
            for (tuple, accesses) in sorted {
                if !residual.remove_tuple_id(partition, tuple) {
                    return Err(ReshardError::Plan(format!(
                        "hot tuple {tuple} is not owned by partition {partition}"
                    )));
                }
                let load = &mut residual_load[partition as usize];
                *load = load.saturating_sub(accesses);
                hot_units.push((tuple, accesses, partition));
            }
        }

        let mut slice_units = Vec::new();
        let mut fixed_load = residual_load.clone();
        for partition in residual.partitions() {
            let tuple_count = residual.tuple_count(partition);
            if tuple_count == 0 {
                continue;
            }
            let load = residual_load[partition as usize];
            for slice in residual.range_slices(partition, self.config.cold_partition_width) {
                let width = Plan::range_list_width(&slice);
                let weight = scaled_weight(load, width, tuple_count);
                let fixed = &mut fixed_load[partition as usize];
                *fixed = fixed.saturating_sub(weight);
                slice_units.push((slice, weight, partition));
            }
        }

        let mut problem = PlacementProblem::new(partition_count, fixed_load, self.config.move_penalty);
        let mut units = Vec::with_capacity(hot_units.len() + slice_units.len());
        for (tuple, accesses, partition) in hot_units {
            let _ = problem.push_unit(accesses, partition);
            units.push(Unit::Hot(tuple));
        }
        for (slice, weight, partition) in slice_units {
            let _ = problem.push_unit(weight, partition);
            units.push(Unit::Slice(slice));
        }
        tracing::debug!(
            variables = units.len(),
            mean = problem.mean(),
            "placement problem built"
        );
        Ok((problem, units))
    }
}

/// `floor(load / tuple_count * width)` without floating point.
fn scaled_weight(load: u64, width: u64, tuple_count: u64) -> u64 {
    let scaled = u128::from(load) * u128::from(width) / u128::from(tuple_count);
    u64::try_from(scaled).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::{GaPlacement, PlacementStats};
    use googletest::prelude::*;
    use reshard_common::config::{PlacementConfig, SearchConfig};
    use reshard_common::containers::HotTuples;
    use reshard_common::ids::PartitionCount;
    use reshard_plan::Plan;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn four() -> PartitionCount {
        PartitionCount::new(4).expect("literal is valid")
    }

    fn even_plan() -> Plan {
        let mut plan = Plan::new();
        for partition in 0..4_u32 {
            let from = u64::from(partition) * 1000;
            plan.add_range(partition, from, from + 1000)
                .expect("disjoint ranges");
        }
        plan
    }

    fn placement() -> GaPlacement {
        let search = SearchConfig {
            seed: Some(17),
            ..SearchConfig::default()
        };
        GaPlacement::new(PlacementConfig::default(), search)
    }

    fn hot(entries: &[(u64, u64)]) -> HotTuples {
        entries.iter().copied().collect()
    }

    #[rstest]
    fn balanced_load_keeps_the_plan() {
        let plan = even_plan();
        let hot_tuples = (0..4_u64)
            .map(|partition| hot(&[(partition * 1000 + 1, 50), (partition * 1000 + 500, 50)]))
            .collect::<Vec<_>>();
        let totals: BTreeMap<u32, u64> = (0..4).map(|partition| (partition, 1000)).collect();

        let outcome = placement()
            .compute_placement(&hot_tuples, &totals, &plan, four(), Duration::from_secs(10))
            .expect("placement should succeed");
        assert_that!(outcome.imbalance_after <= 50.0, eq(true));
        assert_that!(outcome.moved_units, eq(0_usize));
        assert_that!(outcome.plan.is_equivalent(&plan), eq(true));
    }

    #[rstest]
    fn skewed_hot_tuples_are_spread() {
        let plan = even_plan();
        let hot_tuples = vec![hot(&[(1, 100), (2, 100), (3, 100), (4, 100)])];
        let totals = BTreeMap::from([(0, 400)]);

        let outcome = placement()
            .compute_placement(&hot_tuples, &totals, &plan, four(), Duration::from_secs(10))
            .expect("placement should succeed");
        assert_that!(outcome.smallest_unit, eq(Some(100_u64)));
        assert_that!(outcome.imbalance_before, eq(600.0));
        assert_that!(outcome.imbalance_after <= 200.0, eq(true));

        let total_tuples = (0..4).map(|partition| outcome.plan.tuple_count(partition)).sum::<u64>();
        assert_that!(total_tuples, eq(4000_u64));
        assert_that!((0..4000).all(|key| outcome.plan.owner_of(key).is_some()), eq(true));
    }

    #[rstest]
    #[case::seed_3(3)]
    #[case::seed_11(11)]
    #[case::seed_87(87)]
    #[case::seed_140(140)]
    fn reported_imbalance_never_grows(#[case] seed: u64) {
        let plan = even_plan();
        let hot_tuples = (0..4_u64)
            .map(|partition| {
                hot(&[
                    (partition * 1000 + 7, 10 + seed * (partition + 1) % 90),
                    (partition * 1000 + 900, 5 + (seed * 7 + partition) % 40),
                ])
            })
            .collect::<Vec<_>>();
        let totals = (0..4_u32)
            .map(|partition| (partition, 200 + seed * 31 * u64::from(partition + 1) % 700))
            .collect::<BTreeMap<_, _>>();
        let search = SearchConfig {
            seed: Some(seed),
            generations: 30,
            ..SearchConfig::default()
        };

        let outcome = GaPlacement::new(PlacementConfig::default(), search)
            .compute_placement(&hot_tuples, &totals, &plan, four(), Duration::from_secs(10))
            .expect("placement should succeed");
        assert_that!(outcome.imbalance_after <= outcome.imbalance_before, eq(true));
    }

    #[rstest]
    fn nothing_to_move_returns_input_plan() {
        let plan = Plan::new();
        let outcome = placement()
            .compute_placement(&[], &BTreeMap::new(), &plan, four(), Duration::from_secs(1))
            .expect("placement should succeed");
        assert_that!(&outcome.plan, eq(&plan));
        assert_that!(outcome.moved_units, eq(0_usize));
    }

    #[rstest]
    fn hot_tuple_on_wrong_partition_is_rejected() {
        let hot_tuples = vec![HotTuples::new(), hot(&[(5, 10)])];
        let result = placement().compute_plan(
            &hot_tuples,
            &BTreeMap::new(),
            &even_plan(),
            four(),
            Duration::from_secs(1),
        );
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn partitions_beyond_count_are_rejected() {
        let two = PartitionCount::new(2).expect("literal is valid");
        let result = placement().compute_plan(
            &[],
            &BTreeMap::new(),
            &even_plan(),
            two,
            Duration::from_secs(1),
        );
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn compute_plan_reads_plan_file() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        let path = std::env::temp_dir().join(format!("reshard-placement-{nanos}.json"));
        even_plan().save(&path).expect("plan should save");

        let totals: BTreeMap<u32, u64> = (0..4).map(|partition| (partition, 10)).collect();
        let plan = placement()
            .compute_plan_from_file(&[], &totals, &path, four(), Duration::from_secs(10))
            .expect("placement should succeed");
        let _ = std::fs::remove_file(&path);
        assert_that!(plan.is_equivalent(&even_plan()), eq(true));
    }

    #[rstest]
    fn stats_parse_from_json() {
        let stats = PlacementStats::from_json(
            r#"{"hot_tuples": [{"7": 40}, {}], "partition_totals": {"0": 100, "1": 5}}"#,
        )
        .expect("stats should parse");
        assert_that!(stats.hot_tuples.len(), eq(2_usize));
        assert_that!(stats.hot_tuples[0].get(&7).copied(), eq(Some(40_u64)));
        assert_that!(stats.partition_totals.get(&1).copied(), eq(Some(5_u64)));
    }
}
