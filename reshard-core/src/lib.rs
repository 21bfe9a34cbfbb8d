//! Concurrency building blocks of a reconfiguration: the producer/consumer fan-out pipeline and
//! the txn-keyed dependency rendezvous.

pub mod pipeline;
pub mod rendezvous;

pub use pipeline::{Consumer, Producer, RandomRouter, Router};
pub use rendezvous::{Dependency, DependencyId, DependencyTracker, WAIT_EXHAUSTED};
