//! Reconfiguration plan: the ordered migration ranges that turn one placement into another.

use std::fmt;

use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionId, TupleId};
use serde::{Deserialize, Serialize};

use crate::phase::PartitionPhase;
use crate::plan::Plan;
use crate::range::KeyRange;

/// Declared SQL type of a partitioning key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeyType {
    /// 8-bit integer key.
    TinyInt,
    /// 16-bit integer key.
    SmallInt,
    /// 32-bit integer key.
    Integer,
    /// 64-bit integer key.
    #[default]
    BigInt,
}

impl KeyType {
    /// Largest key value representable by this type.
    #[must_use]
    pub const fn max_key(self) -> TupleId {
        match self {
            Self::TinyInt => i8::MAX as TupleId,
            Self::SmallInt => i16::MAX as TupleId,
            Self::Integer => i32::MAX as TupleId,
            Self::BigInt => i64::MAX as TupleId,
        }
    }

    /// Whether a half-open range's keys all fit this type.
    #[must_use]
    pub const fn fits(self, range: KeyRange) -> bool {
        range.to - 1 <= self.max_key()
    }
}

/// Atomic unit of migration: keys `[from, to)` of one table move between two partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReconfigurationRange<K = TupleId> {
    /// Table whose rows move.
    pub table: String,
    /// Declared key type of the table's partitioning column.
    pub key_type: KeyType,
    /// First key inside the range.
    pub from: K,
    /// First key past the range.
    pub to: K,
    /// Partition owning the keys before migration.
    pub old_partition: PartitionId,
    /// Partition owning the keys after migration.
    pub new_partition: PartitionId,
}

impl ReconfigurationRange<TupleId> {
    /// Key interval of this range.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        KeyRange {
            from: self.from,
            to: self.to,
        }
    }
}

impl<K: fmt::Display> fmt::Display for ReconfigurationRange<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}-{}) {}->{}",
            self.table, self.from, self.to, self.old_partition, self.new_partition
        )
    }
}

/// Migration ranges of one table, ascending by key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconfigurationTable {
    /// Table name.
    pub table: String,
    /// Non-overlapping ranges, ascending by `from`.
    pub ranges: Vec<ReconfigurationRange>,
}

/// Every migration range between two phases, grouped by table (ascending name).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconfigurationPlan {
    tables: Vec<ReconfigurationTable>,
}

impl ReconfigurationPlan {
    /// Diffs every table present in both phases.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the phases disagree on the table set or a table's plans
    /// cover different key spaces.
    pub fn between(old: &PartitionPhase, new: &PartitionPhase) -> ReshardResult<Self> {
        let mut tables = Vec::new();
        for (name, old_table) in old.tables() {
            let Some(new_table) = new.table(name) else {
                return Err(ReshardError::Plan(format!(
                    "table {name} is missing from the new phase"
                )));
            };
            let diffed = diff_table(name, old_table.key_type, &old_table.plan, &new_table.plan)?;
            if !diffed.ranges.is_empty() {
                tables.push(diffed);
            }
        }
        if let Some((name, _)) = new.tables().find(|(name, _)| old.table(name).is_none()) {
            return Err(ReshardError::Plan(format!(
                "table {name} is missing from the old phase"
            )));
        }
        tracing::debug!(
            tables = tables.len(),
            ranges = tables.iter().map(|table| table.ranges.len()).sum::<usize>(),
            "reconfiguration plan built"
        );
        Ok(Self { tables })
    }

    /// Builds a plan from already diffed tables, sorting them by name.
    #[must_use]
    pub fn from_tables(mut tables: Vec<ReconfigurationTable>) -> Self {
        tables.retain(|table| !table.ranges.is_empty());
        tables.sort_by(|left, right| left.table.cmp(&right.table));
        Self { tables }
    }

    /// Tables with at least one migration range.
    #[must_use]
    pub fn tables(&self) -> &[ReconfigurationTable] {
        &self.tables
    }

    /// All ranges in table, then key order.
    pub fn ranges(&self) -> impl Iterator<Item = &ReconfigurationRange> {
        self.tables.iter().flat_map(|table| table.ranges.iter())
    }

    /// Ranges leaving a partition.
    #[must_use]
    pub fn outgoing(&self, partition: PartitionId) -> Vec<&ReconfigurationRange> {
        self.ranges()
            .filter(|range| range.old_partition == partition)
            .collect()
    }

    /// Ranges arriving at a partition.
    #[must_use]
    pub fn incoming(&self, partition: PartitionId) -> Vec<&ReconfigurationRange> {
        self.ranges()
            .filter(|range| range.new_partition == partition)
            .collect()
    }

    /// Total number of migration ranges.
    #[must_use]
    pub fn range_count(&self) -> usize {
        self.tables.iter().map(|table| table.ranges.len()).sum()
    }

    /// Whether nothing needs to move.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Computes the migration ranges turning `old` into `new` for one table.
///
/// Keys whose owner does not change are skipped. Maximal contiguous runs sharing the same
/// `(old, new)` partition pair become one range; output is ascending by key and no key is covered
/// twice.
///
/// # Errors
///
/// Returns `ReshardError::Plan` when the two plans do not cover exactly the same keys or a range
/// exceeds `key_type`.
pub fn diff_table(
    table: &str,
    key_type: KeyType,
    old: &Plan,
    new: &Plan,
) -> ReshardResult<ReconfigurationTable> {
    let old_segments = old.segments();
    let new_segments = new.segments();

    let mut points = old_segments
        .iter()
        .chain(new_segments.iter())
        .flat_map(|(range, _)| [range.from, range.to])
        .collect::<Vec<_>>();
    points.sort_unstable();
    points.dedup();

    let mut ranges: Vec<ReconfigurationRange> = Vec::new();
    let mut old_index = 0;
    let mut new_index = 0;
    for window in points.windows(2) {
        let (from, to) = (window[0], window[1]);
        let old_owner = owner_at(&old_segments, &mut old_index, from);
        let new_owner = owner_at(&new_segments, &mut new_index, from);
        let (old_partition, new_partition) = match (old_owner, new_owner) {
            (Some(old_partition), Some(new_partition)) => (old_partition, new_partition),
            (None, None) => continue,
            (Some(_), None) | (None, Some(_)) => {
                return Err(ReshardError::Plan(format!(
                    "table {table}: keys {from}-{to} are not covered by both plans"
                )));
            }
        };
        if old_partition == new_partition {
            continue;
        }
        if !key_type.fits(KeyRange { from, to }) {
            return Err(ReshardError::Plan(format!(
                "table {table}: keys {from}-{to} exceed key type {key_type:?}"
            )));
        }

        if let Some(last) = ranges.last_mut()
            && last.to == from
            && last.old_partition == old_partition
            && last.new_partition == new_partition
        {
            last.to = to;
            continue;
        }
        ranges.push(ReconfigurationRange {
            table: table.to_owned(),
            key_type,
            from,
            to,
            old_partition,
            new_partition,
        });
    }

    Ok(ReconfigurationTable {
        table: table.to_owned(),
        ranges,
    })
}

/// Owner of `key` in ascending, non-overlapping segments, advancing `cursor` monotonically.
fn owner_at(
    segments: &[(KeyRange, PartitionId)],
    cursor: &mut usize,
    key: TupleId,
) -> Option<PartitionId> {
    while segments
        .get(*cursor)
        .is_some_and(|(range, _)| range.to <= key)
    {
        *cursor += 1;
    }
    segments
        .get(*cursor)
        .filter(|(range, _)| range.contains(key))
        .map(|(_, partition)| *partition)
}

/// Applies migration ranges to a plan, returning the migrated placement.
///
/// # Errors
///
/// Returns `ReshardError::Plan` when a range's keys are not all owned by its `old_partition`,
/// which includes a key covered by two ranges.
pub fn apply(plan: &Plan, ranges: &[ReconfigurationRange]) -> ReshardResult<Plan> {
    let mut migrated = plan.clone();
    for range in ranges {
        let keys = KeyRange::new(range.from, range.to)?;
        migrated.remove_range(range.old_partition, keys)?;
        migrated.add_key_range(range.new_partition, keys)?;
    }
    Ok(migrated)
}

#[cfg(test)]
mod tests {
    use super::{KeyType, ReconfigurationPlan, apply, diff_table};
    use crate::phase::PartitionPhase;
    use crate::plan::Plan;
    use googletest::prelude::*;
    use rstest::rstest;

    fn plan(payload: &str) -> Plan {
        Plan::from_json(payload).expect("plan should parse")
    }

    #[rstest]
    #[case(r#"{"partitions": {"0": "0-100", "1": "100-200"}}"#)]
    #[case(r#"{"partitions": {"0": "0-10,20-30", "1": "10-20"}, "exceptions": {"2": [30]}}"#)]
    fn identical_plans_produce_no_ranges(#[case] payload: &str) {
        let same = plan(payload);
        let diffed = diff_table("t", KeyType::BigInt, &same, &same).expect("diff should succeed");
        assert_that!(diffed.ranges.len(), eq(0));
    }

    #[rstest]
    fn contiguous_runs_with_same_pair_are_merged() {
        let old = plan(r#"{"partitions": {"0": "0-50", "1": "50-100"}}"#);
        let new = plan(r#"{"partitions": {"0": "0-20", "1": "50-100,20-50"}}"#);
        let diffed = diff_table("t", KeyType::BigInt, &old, &new).expect("diff should succeed");
        assert_that!(diffed.ranges.len(), eq(1));
        let range = &diffed.ranges[0];
        assert_that!((range.from, range.to), eq((20_u64, 50_u64)));
        assert_that!(
            (range.old_partition, range.new_partition),
            eq((0_u32, 1_u32))
        );
    }

    #[rstest]
    fn exception_moves_produce_single_key_ranges() {
        let old = plan(r#"{"partitions": {"0": "0-10", "1": "10-20"}}"#);
        let new = plan(r#"{"partitions": {"0": "0-5,6-10", "1": "10-20"}, "exceptions": {"1": [5]}}"#);
        let diffed = diff_table("t", KeyType::BigInt, &old, &new).expect("diff should succeed");
        assert_that!(diffed.ranges.len(), eq(1));
        assert_that!(
            (diffed.ranges[0].from, diffed.ranges[0].to),
            eq((5_u64, 6_u64))
        );
    }

    #[rstest]
    fn ranges_are_ascending_and_split_on_pair_change() {
        let old = plan(r#"{"partitions": {"0": "0-30"}}"#);
        let new = plan(r#"{"partitions": {"1": "0-10", "2": "10-20", "0": "20-30"}}"#);
        let diffed = diff_table("t", KeyType::BigInt, &old, &new).expect("diff should succeed");
        let summary = diffed
            .ranges
            .iter()
            .map(|range| (range.from, range.to, range.new_partition))
            .collect::<Vec<_>>();
        assert_that!(&summary, eq(&vec![(0_u64, 10_u64, 1_u32), (10, 20, 2)]));
    }

    #[rstest]
    #[case(r#"{"partitions": {"0": "0-50", "1": "50-100"}}"#, r#"{"partitions": {"1": "0-100"}}"#)]
    #[case(r#"{"partitions": {"0": "0-100"}}"#, r#"{"partitions": {"0": "50-100", "2": "0-25", "3": "25-50"}}"#)]
    #[case(
        r#"{"partitions": {"0": "0-10", "1": "10-20"}, "exceptions": {"2": [20, 21]}}"#,
        r#"{"partitions": {"2": "0-10", "0": "10-22"}}"#
    )]
    fn applying_diff_reproduces_new_plan(#[case] old: &str, #[case] new: &str) {
        let old = plan(old);
        let new = plan(new);
        let diffed = diff_table("t", KeyType::BigInt, &old, &new).expect("diff should succeed");
        let migrated = apply(&old, &diffed.ranges).expect("ranges should apply");
        assert_that!(migrated.is_equivalent(&new), eq(true));
    }

    #[rstest]
    fn overlapping_ranges_cannot_both_apply() {
        let old = plan(r#"{"partitions": {"0": "0-100", "1": "100-200"}}"#);
        let new = plan(r#"{"partitions": {"1": "0-200"}}"#);
        let mut ranges = diff_table("t", KeyType::BigInt, &old, &new)
            .expect("diff should succeed")
            .ranges;
        ranges.push(ranges[0].clone());
        assert_that!(apply(&old, &ranges).is_err(), eq(true));
    }

    #[rstest]
    fn differing_key_spaces_are_rejected() {
        let old = plan(r#"{"partitions": {"0": "0-100"}}"#);
        let new = plan(r#"{"partitions": {"1": "0-90"}}"#);
        assert_that!(diff_table("t", KeyType::BigInt, &old, &new).is_err(), eq(true));
    }

    #[rstest]
    fn narrow_key_type_rejects_wide_ranges() {
        let old = plan(r#"{"partitions": {"0": "0-1000"}}"#);
        let new = plan(r#"{"partitions": {"1": "0-1000"}}"#);
        assert_that!(diff_table("t", KeyType::TinyInt, &old, &new).is_err(), eq(true));
        assert_that!(diff_table("t", KeyType::SmallInt, &old, &new).is_ok(), eq(true));
    }

    #[rstest]
    fn plan_between_phases_groups_by_table() {
        let old = PartitionPhase::from_json(
            r#"{"tables": {
                "warehouse": {"partitions": {"0": "0-4"}},
                "customer": {"partitions": {"0": "0-10"}},
                "item": {"partitions": {"0": "0-5"}}
            }}"#,
        )
        .expect("phase should parse");
        let new = PartitionPhase::from_json(
            r#"{"tables": {
                "warehouse": {"partitions": {"0": "0-2", "1": "2-4"}},
                "customer": {"partitions": {"0": "0-5", "1": "5-10"}},
                "item": {"partitions": {"0": "0-5"}}
            }}"#,
        )
        .expect("phase should parse");

        let reconfig = ReconfigurationPlan::between(&old, &new).expect("plan should build");
        let names = reconfig
            .tables()
            .iter()
            .map(|table| table.table.as_str())
            .collect::<Vec<_>>();
        assert_that!(&names, eq(&vec!["customer", "warehouse"]));
        assert_that!(reconfig.range_count(), eq(2));
        assert_that!(reconfig.outgoing(0).len(), eq(2));
        assert_that!(reconfig.incoming(1).len(), eq(2));
        assert_that!(reconfig.incoming(0).len(), eq(0));
    }

    #[rstest]
    fn plan_between_rejects_mismatched_tables() {
        let old = PartitionPhase::from_json(r#"{"tables": {"a": {"partitions": {"0": "0-4"}}}}"#)
            .expect("phase should parse");
        let new = PartitionPhase::from_json(r#"{"tables": {"b": {"partitions": {"0": "0-4"}}}}"#)
            .expect("phase should parse");
        assert_that!(ReconfigurationPlan::between(&old, &new).is_err(), eq(true));
    }
}
