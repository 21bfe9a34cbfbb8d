//! Placement model: key ranges, per-table plans, partitioning descriptors, and the differ that
//! turns two plans into an ordered set of migration ranges.

pub mod descriptor;
pub mod phase;
pub mod plan;
pub mod range;
pub mod reconfig;

pub use plan::Plan;
pub use range::KeyRange;
pub use reconfig::{KeyType, ReconfigurationPlan, ReconfigurationRange, ReconfigurationTable};
