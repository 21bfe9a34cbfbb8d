//! Hash container aliases shared by the partition engines, the rendezvous and the optimizer
//! input.
//!
//! Keeping the choice in one place lets every crate swap the hasher or map implementation
//! together.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

use crate::ids::TupleId;

/// Hash map used for per-partition and per-transaction state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hash set used for membership indexes.
pub type HotSet<T> = HbSet<T>;

/// Access counts of one partition's hot tuples: tuple id to access count.
///
/// Iteration order is unspecified; consumers needing a stable order sort the keys.
pub type HotTuples = HotMap<TupleId, u64>;
