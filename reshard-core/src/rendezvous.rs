//! Txn-keyed rendezvous between partition threads that publish results and a coordinator that
//! waits for them.
//!
//! All state sits behind one mutex paired with one condvar. Waiters always re-check the map after
//! waking, so spurious wake-ups and a publish racing the start of a wait are both handled.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use reshard_common::config::RendezvousConfig;
use reshard_common::containers::{HotMap, HotSet};
use reshard_common::error::{ReshardError, ReshardResult};
use reshard_common::ids::{PartitionId, TxnId};

/// Error of [`DependencyTracker::await_with_retry`] when every attempt timed out.
pub const WAIT_EXHAUSTED: ReshardError = ReshardError::InvalidState("dependency wait exhausted");

/// Identifier of one dependency produced by a sending partition.
pub type DependencyId = u32;

/// Result a partition sent back for a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency<P> {
    /// Partition that produced the payload.
    pub sender_partition: PartitionId,
    /// Dependency slot the payload fills.
    pub dependency_id: DependencyId,
    /// Result data.
    pub payload: P,
}

#[derive(Debug)]
struct TrackerState<V> {
    values: HotMap<TxnId, V>,
    waiters: HotSet<TxnId>,
}

impl<V> Default for TrackerState<V> {
    fn default() -> Self {
        Self {
            values: HotMap::new(),
            waiters: HotSet::new(),
        }
    }
}

/// Write-once, txn-keyed result store with blocking waits.
#[derive(Debug)]
pub struct DependencyTracker<V> {
    state: Mutex<TrackerState<V>>,
    published: Condvar,
}

impl<V> Default for DependencyTracker<V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(TrackerState::default()),
            published: Condvar::new(),
        }
    }
}

impl<V: Clone> DependencyTracker<V> {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the value of `txn` and wakes its waiter.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when `txn` already has a value or the mutex is
    /// poisoned.
    pub fn publish(&self, txn: TxnId, value: V) -> ReshardResult<()> {
        let mut state = self.lock()?;
        if state.values.contains_key(&txn) {
            return Err(ReshardError::InvalidState("dependency already published"));
        }
        let _ = state.values.insert(txn, value);
        drop(state);
        self.published.notify_all();
        Ok(())
    }

    /// Value of `txn` if already published. Never blocks on publication.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the mutex is poisoned.
    pub fn get(&self, txn: TxnId) -> ReshardResult<Option<V>> {
        Ok(self.lock()?.values.get(&txn).cloned())
    }

    /// Waits up to `timeout` for `txn` to be published.
    ///
    /// `Ok(None)` means the value is not available yet and the caller may wait again.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when another thread is already waiting on `txn` or
    /// the mutex is poisoned.
    pub fn await_value(&self, txn: TxnId, timeout: Duration) -> ReshardResult<Option<V>> {
        let mut state = self.lock()?;
        if let Some(value) = state.values.get(&txn) {
            return Ok(Some(value.clone()));
        }
        if !state.waiters.insert(txn) {
            return Err(ReshardError::InvalidState("dependency already has a waiter"));
        }

        let (mut state, _) = self
            .published
            .wait_timeout_while(state, timeout, |state| !state.values.contains_key(&txn))
            .map_err(|_| ReshardError::InvalidState("dependency tracker mutex is poisoned"))?;
        let _ = state.waiters.remove(&txn);
        Ok(state.values.get(&txn).cloned())
    }

    /// Repeats [`DependencyTracker::await_value`] up to `config.max_attempts` times.
    ///
    /// # Errors
    ///
    /// Returns [`WAIT_EXHAUSTED`] when every attempt timed out, and any error of a single
    /// attempt.
    pub fn await_with_retry(&self, txn: TxnId, config: &RendezvousConfig) -> ReshardResult<V> {
        for attempt in 1..=config.max_attempts {
            if let Some(value) = self.await_value(txn, config.wait_timeout())? {
                return Ok(value);
            }
            tracing::debug!(txn, attempt, "dependency not yet available");
        }
        tracing::warn!(txn, attempts = config.max_attempts, "dependency wait exhausted");
        Err(WAIT_EXHAUSTED)
    }

    /// Drops the value of `txn`, returning it.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the mutex is poisoned.
    pub fn remove(&self, txn: TxnId) -> ReshardResult<Option<V>> {
        Ok(self.lock()?.values.remove(&txn))
    }

    /// Number of published values still held.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the mutex is poisoned.
    pub fn len(&self) -> ReshardResult<usize> {
        Ok(self.lock()?.values.len())
    }

    /// Whether no value is held.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the mutex is poisoned.
    pub fn is_empty(&self) -> ReshardResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lock(&self) -> ReshardResult<MutexGuard<'_, TrackerState<V>>> {
        self.state
            .lock()
            .map_err(|_| ReshardError::InvalidState("dependency tracker mutex is poisoned"))
    }
}

impl<P: Clone> DependencyTracker<Dependency<P>> {
    /// Publishes the payload a partition sent back for `txn`.
    ///
    /// # Errors
    ///
    /// See [`DependencyTracker::publish`].
    pub fn store_dependency(
        &self,
        txn: TxnId,
        sender_partition: PartitionId,
        dependency_id: DependencyId,
        payload: P,
    ) -> ReshardResult<()> {
        self.publish(
            txn,
            Dependency {
                sender_partition,
                dependency_id,
                payload,
            },
        )
    }
}
