//! Canonical identifier types used across placement, storage, and migration.

/// Partition identifier. Each partition is owned by exactly one execution thread.
pub type PartitionId = u32;

/// Transaction identifier used to key asynchronous fragment results.
pub type TxnId = u64;

/// Monotonic identifier of one extracted chunk, used for selective rollback.
pub type UndoToken = u64;

/// Tuple identifier, equal to the partitioning key value of the tuple.
pub type TupleId = u64;

/// Strongly typed partition-count wrapper.
///
/// A reconfiguration over zero partitions is a caller bug, so the value is validated once at the
/// edge and every entry point taking `PartitionCount` can rely on `get() >= 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionCount(u32);

impl PartitionCount {
    /// Creates a validated partition-count value.
    ///
    /// Returns `None` for zero.
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Iterates every partition id in `0..count`.
    pub fn ids(self) -> impl Iterator<Item = PartitionId> {
        0..self.0
    }
}

#[cfg(test)]
mod tests {
    use super::PartitionCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn partition_count_rejects_zero() {
        assert_that!(PartitionCount::new(0), eq(None));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(u32::MAX)]
    fn partition_count_accepts_positive_values(#[case] input: u32) {
        let count = PartitionCount::new(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }

    #[rstest]
    fn partition_count_enumerates_ids() {
        let count = PartitionCount::new(3).expect("literal is valid");
        let ids = count.ids().collect::<Vec<_>>();
        assert_that!(&ids, eq(&vec![0_u32, 1, 2]));
    }
}
