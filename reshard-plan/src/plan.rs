//! Per-table placement: which partition owns which key ranges and hot-tuple exceptions.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionId, TupleId};
use serde::{Deserialize, Serialize};

use crate::range::{KeyRange, format_range_list, parse_range_list};

/// Assignment of one table's key space to partitions.
///
/// Ranges are kept sorted and coalesced per partition. Exceptions are single tuples owned by a
/// partition outside its range list (hot tuples moved by the optimizer). No key is owned twice:
/// every mutation checks ownership before it inserts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    ranges: BTreeMap<PartitionId, Vec<KeyRange>>,
    exceptions: BTreeMap<PartitionId, BTreeSet<TupleId>>,
}

/// On-disk plan shape: `{"partitions": {"0": "0-1000,2000-3000"}, "exceptions": {"1": [5]}}`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PlanFile {
    pub(crate) partitions: BTreeMap<PartitionId, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) exceptions: BTreeMap<PartitionId, Vec<TupleId>>,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a partition with no data.
    pub fn add_partition(&mut self, partition: PartitionId) {
        self.ranges.entry(partition).or_default();
    }

    /// Partition ids known to this plan, ascending.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.ranges.keys().copied()
    }

    /// Sorted, coalesced ranges of one partition.
    #[must_use]
    pub fn ranges(&self, partition: PartitionId) -> &[KeyRange] {
        self.ranges.get(&partition).map_or(&[], Vec::as_slice)
    }

    /// Exception tuples owned by one partition, ascending.
    pub fn exceptions(&self, partition: PartitionId) -> impl Iterator<Item = TupleId> + '_ {
        self.exceptions
            .get(&partition)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Adds `[from, to)` to a partition.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the range is empty or any of its keys is already owned.
    pub fn add_range(&mut self, partition: PartitionId, from: TupleId, to: TupleId) -> ReshardResult<()> {
        self.add_key_range(partition, KeyRange::new(from, to)?)
    }

    /// Adds a prebuilt range to a partition. See [`Plan::add_range`].
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when any key of the range is already owned.
    pub fn add_key_range(&mut self, partition: PartitionId, range: KeyRange) -> ReshardResult<()> {
        if let Some(owner) = self.first_overlap(range) {
            return Err(ReshardError::Plan(format!(
                "range {range} for partition {partition} overlaps keys owned by partition {owner}"
            )));
        }
        insert_coalesced(self.ranges.entry(partition).or_default(), range);
        Ok(())
    }

    /// Makes one tuple an exception owned by `partition`.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the tuple is already owned by any partition, or is
    /// `TupleId::MAX`, which no half-open range can hold.
    pub fn add_exception(&mut self, partition: PartitionId, tuple: TupleId) -> ReshardResult<()> {
        if tuple == TupleId::MAX {
            return Err(ReshardError::Plan(format!(
                "tuple {tuple} is past the last representable key"
            )));
        }
        if let Some(owner) = self.owner_of(tuple) {
            return Err(ReshardError::Plan(format!(
                "tuple {tuple} is already owned by partition {owner}"
            )));
        }
        self.add_partition(partition);
        self.exceptions.entry(partition).or_default().insert(tuple);
        Ok(())
    }

    /// Removes one tuple from a partition, splitting its range around the tuple.
    ///
    /// Returns whether the partition owned the tuple.
    pub fn remove_tuple_id(&mut self, partition: PartitionId, tuple: TupleId) -> bool {
        if let Some(set) = self.exceptions.get_mut(&partition)
            && set.remove(&tuple)
        {
            return true;
        }
        let Some(list) = self.ranges.get_mut(&partition) else {
            return false;
        };
        let Some(index) = list.iter().position(|range| range.contains(tuple)) else {
            return false;
        };
        let removed = list.remove(index);
        let (left, right) = removed.subtract(KeyRange::single(tuple));
        if let Some(right) = right {
            list.insert(index, right);
        }
        if let Some(left) = left {
            list.insert(index, left);
        }
        true
    }

    /// Removes every key of `cut` from a partition.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` when the partition does not own all of `cut`; the plan is left
    /// untouched in that case.
    pub fn remove_range(&mut self, partition: PartitionId, cut: KeyRange) -> ReshardResult<()> {
        let owned_in_ranges: u64 = self
            .ranges(partition)
            .iter()
            .filter(|range| range.overlaps(cut))
            .map(|range| range.to.min(cut.to) - range.from.max(cut.from))
            .sum();
        let owned_exceptions = self
            .exceptions
            .get(&partition)
            .map_or(0, |set| set.range(cut.from..cut.to).count() as u64);
        if owned_in_ranges + owned_exceptions != cut.width() {
            return Err(ReshardError::Plan(format!(
                "partition {partition} does not own all keys of {cut}"
            )));
        }

        if let Some(list) = self.ranges.get_mut(&partition) {
            let remaining = list
                .iter()
                .flat_map(|range| {
                    let (left, right) = range.subtract(cut);
                    left.into_iter().chain(right)
                })
                .collect();
            *list = remaining;
        }
        if let Some(set) = self.exceptions.get_mut(&partition) {
            set.retain(|tuple| !cut.contains(*tuple));
        }
        Ok(())
    }

    /// Partition owning `key`, if any.
    #[must_use]
    pub fn owner_of(&self, key: TupleId) -> Option<PartitionId> {
        if let Some((partition, _)) = self.exceptions.iter().find(|(_, set)| set.contains(&key)) {
            return Some(*partition);
        }
        self.ranges.iter().find_map(|(partition, list)| {
            let index = list.partition_point(|range| range.to <= key);
            list.get(index)
                .filter(|range| range.contains(key))
                .map(|_| *partition)
        })
    }

    /// Number of tuples (range keys plus exceptions) owned by a partition.
    #[must_use]
    pub fn tuple_count(&self, partition: PartitionId) -> u64 {
        let exceptions = self.exceptions.get(&partition).map_or(0, BTreeSet::len) as u64;
        Self::range_list_width(self.ranges(partition)) + exceptions
    }

    /// Total number of keys in a list of ranges.
    #[must_use]
    pub fn range_list_width(ranges: &[KeyRange]) -> u64 {
        ranges.iter().map(|range| range.width()).sum()
    }

    /// Cuts a partition's ranges into consecutive slices of `width` keys each.
    ///
    /// A slice may span several ranges; the last slice holds the remainder and can be narrower.
    /// Exceptions are not part of any slice.
    #[must_use]
    pub fn range_slices(&self, partition: PartitionId, width: u64) -> Vec<Vec<KeyRange>> {
        let width = width.max(1);
        let mut slices = Vec::new();
        let mut current = Vec::new();
        let mut current_width = 0_u64;

        for range in self.ranges(partition) {
            let mut from = range.from;
            while from < range.to {
                let take = (width - current_width).min(range.to - from);
                current.push(KeyRange {
                    from,
                    to: from + take,
                });
                current_width += take;
                from += take;
                if current_width == width {
                    slices.push(std::mem::take(&mut current));
                    current_width = 0;
                }
            }
        }
        if !current.is_empty() {
            slices.push(current);
        }
        slices
    }

    /// Canonical ownership view: every owned key run as `(range, owner)`, ascending, with
    /// adjacent runs of the same owner merged. Two plans with equal segments place every key
    /// identically, regardless of range/exception representation.
    #[must_use]
    pub fn segments(&self) -> Vec<(KeyRange, PartitionId)> {
        let mut runs = self
            .ranges
            .iter()
            .flat_map(|(partition, list)| list.iter().map(|range| (*range, *partition)))
            .chain(self.exceptions.iter().flat_map(|(partition, set)| {
                set.iter().map(|tuple| (KeyRange::single(*tuple), *partition))
            }))
            .collect::<Vec<_>>();
        runs.sort_unstable_by_key(|(range, _)| range.from);

        let mut merged: Vec<(KeyRange, PartitionId)> = Vec::with_capacity(runs.len());
        for (range, partition) in runs {
            if let Some((last, owner)) = merged.last_mut()
                && *owner == partition
                && last.to == range.from
            {
                last.to = range.to;
                continue;
            }
            merged.push((range, partition));
        }
        merged
    }

    /// Whether both plans assign every key to the same partition.
    #[must_use]
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.segments() == other.segments()
    }

    /// Folds exceptions back into range form where they touch a range of their own partition.
    ///
    /// Isolated exceptions stay exceptions. Returns the number of demoted tuples.
    pub fn demote_tuples(&mut self) -> usize {
        let mut demoted = 0;
        loop {
            let mut changed = false;
            for (partition, set) in &mut self.exceptions {
                let Some(list) = self.ranges.get_mut(partition) else {
                    continue;
                };
                let adjacent = set
                    .iter()
                    .copied()
                    .filter(|tuple| {
                        list.iter()
                            .any(|range| range.to == *tuple || range.from == tuple.saturating_add(1))
                    })
                    .collect::<Vec<_>>();
                for tuple in adjacent {
                    set.remove(&tuple);
                    insert_coalesced(list, KeyRange::single(tuple));
                    demoted += 1;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        self.exceptions.retain(|_, set| !set.is_empty());
        demoted
    }

    /// Drops partitions owning neither ranges nor exceptions. Returns the dropped ids.
    pub fn remove_empty_partitions(&mut self) -> Vec<PartitionId> {
        let empty = self
            .ranges
            .iter()
            .filter(|(partition, list)| {
                list.is_empty()
                    && self
                        .exceptions
                        .get(*partition)
                        .is_none_or(BTreeSet::is_empty)
            })
            .map(|(partition, _)| *partition)
            .collect::<Vec<_>>();
        for partition in &empty {
            self.ranges.remove(partition);
            self.exceptions.remove(partition);
        }
        empty
    }

    /// Parses a plan from its JSON representation.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` for malformed JSON, malformed ranges, or overlapping ownership.
    pub fn from_json(payload: &str) -> ReshardResult<Self> {
        let file: PlanFile = serde_json::from_str(payload)?;
        Self::from_file_shape(file)
    }

    pub(crate) fn from_file_shape(file: PlanFile) -> ReshardResult<Self> {
        let mut plan = Self::new();
        for (partition, text) in file.partitions {
            plan.add_partition(partition);
            for range in parse_range_list(&text)? {
                plan.add_key_range(partition, range)?;
            }
        }
        for (partition, tuples) in file.exceptions {
            for tuple in tuples {
                plan.add_exception(partition, tuple)?;
            }
        }
        Ok(plan)
    }

    pub(crate) fn to_file_shape(&self) -> PlanFile {
        PlanFile {
            partitions: self
                .ranges
                .iter()
                .map(|(partition, list)| (*partition, format_range_list(list)))
                .collect(),
            exceptions: self
                .exceptions
                .iter()
                .filter(|(_, set)| !set.is_empty())
                .map(|(partition, set)| (*partition, set.iter().copied().collect()))
                .collect(),
        }
    }

    /// Serializes the plan as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Plan` if serialization fails.
    pub fn to_json(&self) -> ReshardResult<String> {
        Ok(serde_json::to_string_pretty(&self.to_file_shape())?)
    }

    /// Loads a plan file.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io` for read failures and `ReshardError::Plan` for parse failures.
    pub fn load<P: AsRef<Path>>(path: P) -> ReshardResult<Self> {
        let payload = fs::read_to_string(path)?;
        Self::from_json(&payload)
    }

    /// Writes the plan to a file.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Io` for write failures.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> ReshardResult<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    fn first_overlap(&self, range: KeyRange) -> Option<PartitionId> {
        let in_ranges = self.ranges.iter().find_map(|(partition, list)| {
            list.iter()
                .any(|owned| owned.overlaps(range))
                .then_some(*partition)
        });
        in_ranges.or_else(|| {
            self.exceptions.iter().find_map(|(partition, set)| {
                set.range(range.from..range.to)
                    .next()
                    .map(|_| *partition)
            })
        })
    }
}

/// Inserts a range known not to overlap, merging with touching neighbours.
fn insert_coalesced(list: &mut Vec<KeyRange>, range: KeyRange) {
    let index = list.partition_point(|owned| owned.from < range.from);
    list.insert(index, range);
    if index + 1 < list.len() && list[index].to == list[index + 1].from {
        list[index].to = list[index + 1].to;
        list.remove(index + 1);
    }
    if index > 0 && list[index - 1].to == list[index].from {
        list[index - 1].to = list[index].to;
        list.remove(index);
    }
}
