//! Placement problem: movable units, their access weights, and the balance fitness.

use reshard_common::ids::{PartitionCount, PartitionId};

/// Discrete assignment problem explored by an [`crate::Optimizer`].
///
/// Every variable takes a value in `0..domain()`. Higher fitness is better.
pub trait SearchProblem {
    /// Number of variables (genes).
    fn variable_count(&self) -> usize;

    /// Number of values each variable can take.
    fn domain(&self) -> u32;

    /// Assignment describing the current state, used to seed the search.
    fn current(&self) -> Vec<u32>;

    /// Scores one full assignment.
    fn fitness(&self, assignment: &[u32]) -> f64;
}

/// Movable placement units (hot tuples first, then cold slices) with their access weights.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementProblem {
    weights: Vec<u64>,
    locations: Vec<PartitionId>,
    fixed_load: Vec<u64>,
    partition_count: PartitionCount,
    mean: f64,
    move_penalty: f64,
}

impl PlacementProblem {
    /// Creates an empty problem over `partition_count` partitions.
    ///
    /// `fixed_load[p]` is load that stays on `p` whatever the assignment; missing entries are 0.
    #[must_use]
    pub fn new(partition_count: PartitionCount, fixed_load: Vec<u64>, move_penalty: f64) -> Self {
        let mut fixed_load = fixed_load;
        fixed_load.resize(partition_count.get() as usize, 0);
        let mut problem = Self {
            weights: Vec::new(),
            locations: Vec::new(),
            fixed_load,
            partition_count,
            mean: 0.0,
            move_penalty,
        };
        problem.refresh_mean();
        problem
    }

    /// Adds one movable unit currently on `location`. Returns its variable index.
    pub fn push_unit(&mut self, weight: u64, location: PartitionId) -> usize {
        self.weights.push(weight);
        self.locations.push(location);
        self.refresh_mean();
        self.weights.len() - 1
    }

    /// Access weight of every unit.
    #[must_use]
    pub fn weights(&self) -> &[u64] {
        &self.weights
    }

    /// Current partition of every unit.
    #[must_use]
    pub fn locations(&self) -> &[PartitionId] {
        &self.locations
    }

    /// Partition count the units are spread over.
    #[must_use]
    pub const fn partition_count(&self) -> PartitionCount {
        self.partition_count
    }

    /// Mean load per partition.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Smallest non-zero unit weight, the granularity at which load can be shifted.
    #[must_use]
    pub fn smallest_unit(&self) -> Option<u64> {
        self.weights.iter().copied().filter(|weight| *weight > 0).min()
    }

    /// Projected load of every partition under `assignment`.
    #[must_use]
    pub fn loads(&self, assignment: &[u32]) -> Vec<u64> {
        let mut loads = self.fixed_load.clone();
        for (weight, destination) in self.weights.iter().zip(assignment) {
            if let Some(load) = loads.get_mut(*destination as usize) {
                *load += weight;
            }
        }
        loads
    }

    /// Sum over partitions of the absolute deviation of projected load from the mean.
    #[must_use]
    pub fn imbalance(&self, assignment: &[u32]) -> f64 {
        self.loads(assignment)
            .into_iter()
            .map(|load| (as_f64(load) - self.mean).abs())
            .sum()
    }

    /// Total weight of units whose destination differs from their current partition.
    ///
    /// Idle units count as weight 1 so they are never moved for free.
    #[must_use]
    pub fn moved_weight(&self, assignment: &[u32]) -> u64 {
        self.weights
            .iter()
            .zip(&self.locations)
            .zip(assignment)
            .filter(|((_, location), destination)| *location != *destination)
            .map(|((weight, _), _)| (*weight).max(1))
            .sum()
    }

    fn refresh_mean(&mut self) {
        let total = self.fixed_load.iter().sum::<u64>() + self.weights.iter().sum::<u64>();
        self.mean = as_f64(total) / f64::from(self.partition_count.get());
    }
}

impl SearchProblem for PlacementProblem {
    fn variable_count(&self) -> usize {
        self.weights.len()
    }

    fn domain(&self) -> u32 {
        self.partition_count.get()
    }

    fn current(&self) -> Vec<u32> {
        self.locations.clone()
    }

    /// `-(imbalance + move_penalty * moved weight)`.
    fn fitness(&self, assignment: &[u32]) -> f64 {
        -(self.imbalance(assignment) + self.move_penalty * as_f64(self.moved_weight(assignment)))
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: u64) -> f64 {
    value as f64
}

#[cfg(test)]
mod tests {
    use super::{PlacementProblem, SearchProblem};
    use googletest::prelude::*;
    use reshard_common::ids::PartitionCount;
    use rstest::rstest;

    fn two_partitions() -> PlacementProblem {
        let count = PartitionCount::new(2).expect("literal is valid");
        let mut problem = PlacementProblem::new(count, vec![10, 10], 0.5);
        let _ = problem.push_unit(40, 0);
        let _ = problem.push_unit(20, 0);
        let _ = problem.push_unit(20, 0);
        problem
    }

    #[rstest]
    fn mean_counts_fixed_and_movable_load_once() {
        let problem = two_partitions();
        assert_that!(problem.mean(), eq(50.0));
        assert_that!(problem.variable_count(), eq(3_usize));
        assert_that!(problem.smallest_unit(), eq(Some(20_u64)));
    }

    #[rstest]
    #[case::current(vec![0, 0, 0], vec![90, 10])]
    #[case::balanced(vec![0, 1, 1], vec![50, 50])]
    fn loads_follow_assignment(#[case] assignment: Vec<u32>, #[case] expected: Vec<u64>) {
        let problem = two_partitions();
        assert_that!(&problem.loads(&assignment), eq(&expected));
    }

    #[rstest]
    fn balanced_assignment_scores_higher_than_current() {
        let problem = two_partitions();
        let current = problem.fitness(&problem.current());
        let balanced = problem.fitness(&[0, 1, 1]);
        assert_that!(current, eq(-80.0));
        assert_that!(balanced, eq(-20.0));
        assert_that!(problem.imbalance(&[0, 1, 1]), eq(0.0));
        assert_that!(problem.imbalance(&[0, 0, 0]), eq(80.0));
    }

    #[rstest]
    fn move_penalty_prefers_the_lighter_move() {
        let count = PartitionCount::new(2).expect("literal is valid");
        let mut problem = PlacementProblem::new(count, vec![10, 10], 0.5);
        let _ = problem.push_unit(40, 0);
        let _ = problem.push_unit(20, 0);
        let _ = problem.push_unit(20, 1);

        let light: [u32; 3] = [0, 1, 1];
        let heavy: [u32; 3] = [1, 0, 0];
        assert_that!(&problem.loads(&light), eq(&problem.loads(&heavy)));
        assert_that!(problem.moved_weight(&heavy), eq(60_u64));
        assert_that!(problem.fitness(&light), eq(-10.0));
        assert_that!(problem.fitness(&heavy) < problem.fitness(&light), eq(true));
    }
}
