//! Load-aware placement: models hot tuples and cold slices as movable units and searches for a
//! partition assignment that evens out access load.

pub mod placement;
pub mod problem;
pub mod search;

pub use placement::{GaPlacement, PlacementOutcome, PlacementStats};
pub use problem::{PlacementProblem, SearchProblem};
pub use search::{Assignment, EvolutionarySearch, Optimizer, SearchBudget, SearchObserver, TracingObserver};
