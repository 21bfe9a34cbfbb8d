//! Fan-out pipeline: one producer routes items to N consumer threads.
//!
//! Each consumer owns a queue and a dedicated thread. Closing a consumer's queue lets the thread
//! drain everything already enqueued before it exits, so no routed item is dropped.

use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use reshard_common::config::QueuePolicy;
use reshard_common::error::{ReshardError, ReshardResult};

type Handler<U> = Box<dyn FnMut(U) -> ReshardResult<()> + Send>;

enum QueueSender<U> {
    Unbounded(mpsc::Sender<U>),
    Bounded(mpsc::SyncSender<U>),
}

impl<U> QueueSender<U> {
    fn send(&self, item: U) -> Result<(), mpsc::SendError<U>> {
        match self {
            Self::Unbounded(sender) => sender.send(item),
            Self::Bounded(sender) => sender.send(item),
        }
    }
}

#[derive(Debug, Default)]
struct ConsumerCounters {
    processed: u64,
    failures: u64,
    first_error: Option<ReshardError>,
}

/// Worker owning one queue and one thread.
pub struct Consumer<U> {
    index: usize,
    policy: QueuePolicy,
    handler: Option<Handler<U>>,
    sender: Option<QueueSender<U>>,
    worker: Option<thread::JoinHandle<()>>,
    counters: Arc<Mutex<ConsumerCounters>>,
}

impl<U> fmt::Debug for Consumer<U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("index", &self.index)
            .field("policy", &self.policy)
            .field("started", &self.handler.is_none())
            .field("open", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

impl<U: Send + 'static> Consumer<U> {
    /// Creates a stopped consumer that hands every dequeued item to `handler`.
    pub fn new<F>(policy: QueuePolicy, handler: F) -> Self
    where
        F: FnMut(U) -> ReshardResult<()> + Send + 'static,
    {
        Self {
            index: 0,
            policy,
            handler: Some(Box::new(handler)),
            sender: None,
            worker: None,
            counters: Arc::new(Mutex::new(ConsumerCounters::default())),
        }
    }

    /// Opens the queue and spawns the consumer thread.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when already started and `ReshardError::Io` when the
    /// thread cannot be spawned.
    pub fn start(&mut self) -> ReshardResult<()> {
        let Some(mut handler) = self.handler.take() else {
            return Err(ReshardError::InvalidState("consumer already started"));
        };
        let (sender, receiver) = match self.policy {
            QueuePolicy::Unbounded => {
                let (sender, receiver) = mpsc::channel();
                (QueueSender::Unbounded(sender), receiver)
            }
            QueuePolicy::Bounded(capacity) => {
                let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
                (QueueSender::Bounded(sender), receiver)
            }
        };

        let counters = Arc::clone(&self.counters);
        let index = self.index;
        let worker = thread::Builder::new()
            .name(format!("reshard-consumer-{index}"))
            .spawn(move || {
                for item in receiver {
                    let outcome = handler(item);
                    let Ok(mut guard) = counters.lock() else {
                        return;
                    };
                    guard.processed += 1;
                    if let Err(error) = outcome {
                        tracing::warn!(consumer = index, error = %error, "consumer handler failed");
                        guard.failures += 1;
                        if guard.first_error.is_none() {
                            guard.first_error = Some(error);
                        }
                    }
                }
            })?;

        self.sender = Some(sender);
        self.worker = Some(worker);
        Ok(())
    }

    /// Enqueues one item. Blocks while a bounded queue is full.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the queue is not open.
    pub fn enqueue(&self, item: U) -> ReshardResult<()> {
        let Some(sender) = &self.sender else {
            return Err(ReshardError::InvalidState("consumer queue is not open"));
        };
        sender
            .send(item)
            .map_err(|_| ReshardError::InvalidState("consumer thread has exited"))
    }

    /// Closes the queue. The thread finishes every queued item, then exits.
    pub fn stop_when_empty(&mut self) {
        self.sender = None;
    }

    /// Closes the queue and waits for the thread to finish.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the consumer thread panicked.
    pub fn join(&mut self) -> ReshardResult<()> {
        self.stop_when_empty();
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| ReshardError::InvalidState("consumer thread panicked")),
            None => Ok(()),
        }
    }
}

impl<U> Consumer<U> {
    /// Whether the consumer thread is alive. A stopped or joined consumer is not running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    /// Items handled so far, failed ones included.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the counter mutex is poisoned.
    pub fn processed(&self) -> ReshardResult<u64> {
        self.with_counters(|counters| counters.processed)
    }

    /// Items whose handler returned an error.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the counter mutex is poisoned.
    pub fn failures(&self) -> ReshardResult<u64> {
        self.with_counters(|counters| counters.failures)
    }

    /// First handler error, if any.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when the counter mutex is poisoned.
    pub fn first_error(&self) -> ReshardResult<Option<ReshardError>> {
        self.with_counters(|counters| counters.first_error.clone())
    }

    fn with_counters<T>(&self, read: impl FnOnce(&ConsumerCounters) -> T) -> ReshardResult<T> {
        let guard = self
            .counters
            .lock()
            .map_err(|_| ReshardError::InvalidState("consumer counter mutex is poisoned"))?;
        Ok(read(&guard))
    }
}

impl<U> Drop for Consumer<U> {
    fn drop(&mut self) {
        // Close the queue first so the worker loop observes disconnection.
        self.sender = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Picks the consumer for each item and transforms it into the consumer's item type.
pub trait Router<T, U> {
    /// Returns `(consumer index, transformed item)`. The index must be below `consumer_count`.
    fn route(&mut self, item: T, consumer_count: usize) -> (usize, U);
}

impl<T, U, F> Router<T, U> for F
where
    F: FnMut(T, usize) -> (usize, U),
{
    fn route(&mut self, item: T, consumer_count: usize) -> (usize, U) {
        self(item, consumer_count)
    }
}

/// Sends every item unchanged to a uniformly random consumer.
#[derive(Debug)]
pub struct RandomRouter {
    rng: SmallRng,
}

impl RandomRouter {
    /// Router seeded from entropy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: SmallRng::from_entropy(),
        }
    }

    /// Router with a fixed seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Router<T, T> for RandomRouter {
    fn route(&mut self, item: T, consumer_count: usize) -> (usize, T) {
        (self.rng.gen_range(0..consumer_count.max(1)), item)
    }
}

/// Routes a fixed input set across its consumers.
pub struct Producer<T, U, R = RandomRouter> {
    input: Vec<T>,
    router: R,
    consumers: Vec<Consumer<U>>,
}

impl<T, U, R> fmt::Debug for Producer<T, U, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("pending_input", &self.input.len())
            .field("consumers", &self.consumers)
            .finish_non_exhaustive()
    }
}

impl<T, U, R> Producer<T, U, R>
where
    U: Send + 'static,
    R: Router<T, U>,
{
    /// Creates a producer over `input` with no consumers.
    pub fn new(input: impl IntoIterator<Item = T>, router: R) -> Self {
        Self {
            input: input.into_iter().collect(),
            router,
            consumers: Vec::new(),
        }
    }

    /// Appends a consumer. Its index is its position in [`Producer::consumers`].
    pub fn add_consumer(&mut self, mut consumer: Consumer<U>) {
        consumer.index = self.consumers.len();
        self.consumers.push(consumer);
    }

    /// Registered consumers in index order.
    #[must_use]
    pub fn consumers(&self) -> &[Consumer<U>] {
        &self.consumers
    }

    /// Starts every consumer, routes every input item, then closes every queue.
    ///
    /// Returns the number of routed items. Consumers keep draining in the background; call
    /// [`Producer::join`] to wait for them.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::Contract` when there are no consumers or the router names an
    /// unknown consumer. Routing stops at the offending item, items already enqueued are still
    /// processed, and every queue is closed.
    pub fn run(&mut self) -> ReshardResult<usize> {
        let consumer_count = self.consumers.len();
        if consumer_count == 0 {
            return Err(ReshardError::Contract(
                "producer has no consumers".to_owned(),
            ));
        }
        for consumer in &mut self.consumers {
            consumer.start()?;
        }

        let outcome = self.route_all(consumer_count);
        for consumer in &mut self.consumers {
            consumer.stop_when_empty();
        }
        if let Ok(routed) = &outcome {
            tracing::debug!(routed, consumers = consumer_count, "producer finished routing");
        }
        outcome
    }

    fn route_all(&mut self, consumer_count: usize) -> ReshardResult<usize> {
        let mut routed = 0;
        for item in std::mem::take(&mut self.input) {
            let (index, item) = self.router.route(item, consumer_count);
            let Some(consumer) = self.consumers.get(index) else {
                return Err(ReshardError::Contract(format!(
                    "router returned consumer {index}, only {consumer_count} exist"
                )));
            };
            consumer.enqueue(item)?;
            routed += 1;
        }
        Ok(routed)
    }

    /// Waits for every consumer thread to exit.
    ///
    /// # Errors
    ///
    /// Returns the first consumer join failure.
    pub fn join(&mut self) -> ReshardResult<()> {
        let mut outcome = Ok(());
        for consumer in &mut self.consumers {
            let joined = consumer.join();
            if outcome.is_ok() {
                outcome = joined;
            }
        }
        outcome
    }

    /// Whether any consumer thread is still draining its queue.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.consumers.iter().any(Consumer::is_running)
    }

    /// Sum of every consumer's processed count.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when a counter mutex is poisoned.
    pub fn total_processed(&self) -> ReshardResult<u64> {
        self.consumers.iter().map(Consumer::processed).sum()
    }

    /// First handler error across consumers, in consumer order.
    ///
    /// # Errors
    ///
    /// Returns `ReshardError::InvalidState` when a counter mutex is poisoned.
    pub fn first_error(&self) -> ReshardResult<Option<ReshardError>> {
        for consumer in &self.consumers {
            if let Some(error) = consumer.first_error()? {
                return Ok(Some(error));
            }
        }
        Ok(None)
    }
}
