//! Consumer loop: acquire, handle with a background heartbeat, release.

use std::fmt::Display;
use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use taskq_core::{Payload, QueueResult, TaskId};

use super::{WorkerHandle, shutdown_requested, spawn_worker, wait_for_shutdown};
use crate::queue::TaskQueue;
use crate::store::Store;

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Name for logging and the worker thread.
    pub name: String,
    /// Sleep between acquire attempts while the queue is empty, and after
    /// every failed task.
    pub poll_interval: Duration,
    /// How often the heartbeat thread refreshes a task being handled. Must be
    /// well below the cleanup timeout.
    pub heartbeat_interval: Duration,
    /// Stop instead of polling when `acquire` finds nothing.
    pub exit_when_empty: bool,
    /// Stop after this many handler failures in a row. `None` never stops.
    pub max_consecutive_failures: Option<u32>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "consumer".to_string(),
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            exit_when_empty: false,
            max_consecutive_failures: None,
        }
    }
}

impl ConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn exit_when_empty(mut self, exit: bool) -> Self {
        self.exit_when_empty = exit;
        self
    }

    pub fn with_max_consecutive_failures(mut self, max: Option<u32>) -> Self {
        self.max_consecutive_failures = max;
        self
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub tasks_acquired: u64,
    pub tasks_released: u64,
    /// Handler errors; those tasks stay working until cleanup requeues them.
    pub tasks_failed: u64,
    pub heartbeats_failed: u64,
    /// Acquire or release calls that failed after retries.
    pub store_errors: u64,
}

/// Result of one [`Consumer::run_once`] step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing pending.
    Idle,
    /// Handler succeeded and the task was released.
    Completed(TaskId),
    /// Handler failed; the task was left in the working set.
    Failed(TaskId),
}

/// What a handler sees of the task it is processing.
pub struct TaskContext<'a, S> {
    id: &'a TaskId,
    queue: &'a TaskQueue<S>,
    stop: &'a AtomicBool,
}

impl<S: Store> TaskContext<'_, S> {
    pub fn id(&self) -> &TaskId {
        self.id
    }

    /// Merge progress fields into the task's metrics (also refreshes the heartbeat).
    pub fn report<I, K, V>(&self, fields: I) -> QueueResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: ToString,
    {
        self.queue.update(self.id, fields)
    }

    /// Ask [`Consumer::run`] to stop once this task is finished, for failures
    /// that no other task would get past (a missing program, say).
    pub fn stop_consumer(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Handle to a consumer running on its own thread.
#[derive(Debug)]
pub struct ConsumerHandle {
    worker: WorkerHandle,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl ConsumerHandle {
    /// Request graceful shutdown; returns the final statistics.
    pub fn shutdown(self) -> ConsumerStats {
        self.worker.shutdown();
        snapshot(&self.stats)
    }

    pub fn stats(&self) -> ConsumerStats {
        snapshot(&self.stats)
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }
}

/// Pulls tasks from one queue and hands them to a handler.
///
/// A handler error leaves the task in the working set without further
/// heartbeats, so it is retried after the next cleanup once its heartbeat
/// goes stale. After a failure the loop sleeps for the poll interval, so a
/// handler that fails everything claims one task per interval instead of
/// draining the pending list.
pub struct Consumer<S> {
    queue: TaskQueue<S>,
    config: ConsumerConfig,
    stats: Arc<Mutex<ConsumerStats>>,
    stop: AtomicBool,
}

impl<S: Store> Consumer<S> {
    pub fn new(queue: TaskQueue<S>, config: ConsumerConfig) -> Self {
        Self {
            queue,
            config,
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
            stop: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &TaskQueue<S> {
        &self.queue
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn stats(&self) -> ConsumerStats {
        snapshot(&self.stats)
    }

    /// Acquire and process at most one task.
    pub fn run_once<H, E>(&self, handler: &mut H) -> QueueResult<RunOutcome>
    where
        H: FnMut(&TaskContext<'_, S>, &Payload) -> Result<(), E>,
        E: Display,
    {
        let acquired = self.queue.acquire().inspect_err(|_| {
            self.record(|s| s.store_errors += 1);
        })?;
        let Some((id, payload)) = acquired else {
            return Ok(RunOutcome::Idle);
        };
        self.record(|s| s.tasks_acquired += 1);

        let (result, heartbeat_failures) = thread::scope(|scope| {
            // Dropping the sender (also on unwind) stops the heartbeat thread.
            let (stop_tx, stop_rx) = mpsc::channel::<()>();
            let queue = &self.queue;
            let task = &id;
            let interval = self.config.heartbeat_interval;
            let beats = scope.spawn(move || heartbeat_loop(queue, task, interval, stop_rx));

            let ctx = TaskContext {
                id: &id,
                queue: &self.queue,
                stop: &self.stop,
            };
            let result = handler(&ctx, &payload);

            drop(stop_tx);
            (result, beats.join().unwrap_or(0))
        });
        self.record(|s| s.heartbeats_failed += heartbeat_failures);

        match result {
            Ok(()) => {
                self.queue.release(&id).inspect_err(|_| {
                    self.record(|s| s.store_errors += 1);
                })?;
                self.record(|s| s.tasks_released += 1);
                Ok(RunOutcome::Completed(id))
            }
            Err(err) => {
                warn!(
                    consumer = %self.config.name,
                    topic = %self.queue.topic(),
                    task_id = %id,
                    error = %err,
                    "task handler failed; leaving task for cleanup"
                );
                self.record(|s| s.tasks_failed += 1);
                Ok(RunOutcome::Failed(id))
            }
        }
    }

    /// Process tasks until shutdown is requested, a handler asks to stop, the
    /// failure limit is hit, or the queue is empty when `exit_when_empty` is
    /// set.
    pub fn run<H, E>(&self, mut handler: H, shutdown: Option<&Receiver<()>>) -> ConsumerStats
    where
        H: FnMut(&TaskContext<'_, S>, &Payload) -> Result<(), E>,
        E: Display,
    {
        info!(consumer = %self.config.name, topic = %self.queue.topic(), "consumer started");
        self.stop.store(false, Ordering::SeqCst);
        let mut consecutive_failures = 0u32;

        loop {
            if shutdown_requested(shutdown) {
                break;
            }

            let outcome = self.run_once(&mut handler);
            if self.stop.load(Ordering::SeqCst) {
                warn!(consumer = %self.config.name, "handler requested stop");
                break;
            }

            match outcome {
                Ok(RunOutcome::Completed(_)) => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(RunOutcome::Failed(_)) => {
                    consecutive_failures += 1;
                    if self
                        .config
                        .max_consecutive_failures
                        .is_some_and(|max| consecutive_failures >= max)
                    {
                        error!(
                            consumer = %self.config.name,
                            failures = consecutive_failures,
                            "too many consecutive task failures; stopping"
                        );
                        break;
                    }
                }
                Ok(RunOutcome::Idle) => {
                    if self.config.exit_when_empty {
                        debug!(consumer = %self.config.name, "queue empty; exiting");
                        break;
                    }
                }
                Err(err) => {
                    error!(consumer = %self.config.name, error = %err, "consumer store error");
                }
            }

            if wait_for_shutdown(shutdown, self.config.poll_interval) {
                break;
            }
        }

        let stats = self.stats();
        info!(
            consumer = %self.config.name,
            released = stats.tasks_released,
            failed = stats.tasks_failed,
            "consumer stopped"
        );
        stats
    }

    /// Run the consumer on a background thread.
    pub fn spawn<H, E>(self, handler: H) -> io::Result<ConsumerHandle>
    where
        S: 'static,
        H: FnMut(&TaskContext<'_, S>, &Payload) -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let stats = self.stats.clone();
        let name = self.config.name.clone();
        let worker = spawn_worker(&name, move |shutdown_rx| {
            self.run(handler, Some(&shutdown_rx));
        })?;

        Ok(ConsumerHandle { worker, stats })
    }

    fn record(&self, f: impl FnOnce(&mut ConsumerStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

fn heartbeat_loop<S: Store>(
    queue: &TaskQueue<S>,
    id: &TaskId,
    interval: Duration,
    stop: Receiver<()>,
) -> u64 {
    let mut failures = 0;

    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(err) = queue.heartbeat(id) {
                    failures += 1;
                    warn!(topic = %queue.topic(), task_id = %id, error = %err, "heartbeat failed");
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return failures,
        }
    }
}

fn snapshot(stats: &Mutex<ConsumerStats>) -> ConsumerStats {
    stats
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueOptions;
    use crate::retry::RetryPolicy;
    use crate::store::InMemoryStore;

    fn queue() -> (InMemoryStore, TaskQueue<InMemoryStore>) {
        let store = InMemoryStore::with_clock(1_000);
        let fast = |p: RetryPolicy| {
            p.with_delays(Duration::ZERO, Duration::from_millis(1), Duration::from_millis(2))
        };
        let options = QueueOptions::default()
            .with_connection_retry(fast(RetryPolicy::connection()))
            .with_conflict_retry(fast(RetryPolicy::conflict()));
        let queue = TaskQueue::with_options(store.clone(), "jobs".parse().unwrap(), options);
        (store, queue)
    }

    fn config() -> ConsumerConfig {
        ConsumerConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_heartbeat_interval(Duration::from_millis(5))
            .exit_when_empty(true)
    }

    fn task(queue: &TaskQueue<InMemoryStore>, n: usize) -> TaskId {
        let payload: Payload = [("n".to_string(), n.to_string())].into_iter().collect();
        queue.create(&payload).unwrap()
    }

    #[test]
    fn run_once_is_idle_on_empty_queue() {
        let (_, queue) = queue();
        let consumer = Consumer::new(queue, config());
        let outcome = consumer
            .run_once(&mut |_: &TaskContext<'_, InMemoryStore>, _: &Payload| Ok::<(), String>(()))
            .unwrap();
        assert_eq!(outcome, RunOutcome::Idle);
    }

    #[test]
    fn successful_handler_releases_task() {
        let (_, queue) = queue();
        let id = task(&queue, 1);
        let consumer = Consumer::new(queue, config());

        let outcome = consumer
            .run_once(&mut |ctx: &TaskContext<'_, InMemoryStore>, payload: &Payload| {
                assert_eq!(payload["n"], "1");
                ctx.report([("progress", "100")]).map_err(|e| e.to_string())
            })
            .unwrap();

        assert_eq!(outcome, RunOutcome::Completed(id.clone()));
        assert!(consumer.queue().working_ids().unwrap().is_empty());
        assert_eq!(consumer.queue().payload(&id).unwrap(), None);
        assert_eq!(consumer.stats().tasks_released, 1);
    }

    #[test]
    fn failed_handler_leaves_task_working() {
        let (_, queue) = queue();
        let id = task(&queue, 1);
        let consumer = Consumer::new(queue, config());

        let outcome = consumer
            .run_once(&mut |_: &TaskContext<'_, InMemoryStore>, _: &Payload| Err("boom"))
            .unwrap();

        assert_eq!(outcome, RunOutcome::Failed(id.clone()));
        assert_eq!(consumer.queue().working_ids().unwrap(), vec![id.to_string()]);
        assert_eq!(consumer.stats().tasks_failed, 1);
    }

    #[test]
    fn heartbeat_runs_while_handler_is_busy() {
        let (store, queue) = queue();
        let id = task(&queue, 1);
        let consumer = Consumer::new(queue, config());

        consumer
            .run_once(&mut |ctx: &TaskContext<'_, InMemoryStore>, _: &Payload| {
                store.advance(Duration::from_secs(100));
                thread::sleep(Duration::from_millis(50));
                let metrics = ctx.queue.metrics(ctx.id()).unwrap().unwrap();
                assert_eq!(metrics.heartbeat(), Some(1_100));
                Ok::<(), String>(())
            })
            .unwrap();

        assert_eq!(consumer.queue().payload(&id).unwrap(), None);
    }

    #[test]
    fn run_drains_queue_and_exits_when_empty() {
        let (_, queue) = queue();
        for n in 0..5 {
            task(&queue, n);
        }
        let consumer = Consumer::new(queue, config());

        let mut seen = Vec::new();
        let stats = consumer.run(
            |_: &TaskContext<'_, InMemoryStore>, payload: &Payload| {
                seen.push(payload["n"].clone());
                Ok::<(), String>(())
            },
            None,
        );

        assert_eq!(seen, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(stats.tasks_acquired, 5);
        assert_eq!(stats.tasks_released, 5);
    }

    #[test]
    fn failing_handler_claims_one_task_per_poll_interval() {
        let (_, queue) = queue();
        let producer = queue.clone();
        for n in 0..50 {
            task(&producer, n);
        }
        let consumer = Consumer::new(
            queue,
            config().with_poll_interval(Duration::from_secs(5)),
        );

        let handle = consumer
            .spawn(|_: &TaskContext<'_, InMemoryStore>, _: &Payload| Err::<(), _>("boom"))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        let stats = handle.shutdown();

        assert_eq!(stats.tasks_acquired, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert_eq!(producer.pending_ids().unwrap().len(), 49);
    }

    #[test]
    fn run_stops_after_consecutive_failure_limit() {
        let (_, queue) = queue();
        for n in 0..10 {
            task(&queue, n);
        }
        let consumer = Consumer::new(
            queue,
            config()
                .with_poll_interval(Duration::from_millis(1))
                .with_max_consecutive_failures(Some(3)),
        );

        let mut calls = 0;
        let stats = consumer.run(
            |_: &TaskContext<'_, InMemoryStore>, _: &Payload| {
                calls += 1;
                // One success in the middle resets the count.
                if calls == 2 { Ok(()) } else { Err("boom") }
            },
            None,
        );

        assert_eq!(stats.tasks_released, 1);
        assert_eq!(stats.tasks_failed, 4);
        assert_eq!(consumer.queue().pending_ids().unwrap().len(), 5);
    }

    #[test]
    fn handler_can_stop_the_consumer() {
        let (_, queue) = queue();
        for n in 0..3 {
            task(&queue, n);
        }
        let consumer = Consumer::new(queue, config());

        let stats = consumer.run(
            |ctx: &TaskContext<'_, InMemoryStore>, _: &Payload| {
                ctx.stop_consumer();
                Err::<(), _>("cannot start")
            },
            None,
        );

        assert_eq!(stats.tasks_acquired, 1);
        assert_eq!(consumer.queue().pending_ids().unwrap().len(), 2);
        assert_eq!(consumer.queue().working_ids().unwrap().len(), 1);
    }

    #[test]
    fn spawned_consumer_stops_on_shutdown() {
        let (_, queue) = queue();
        let producer = queue.clone();
        let consumer = Consumer::new(queue, config().exit_when_empty(false));

        let handle = consumer
            .spawn(|_: &TaskContext<'_, InMemoryStore>, _: &Payload| Ok::<(), String>(()))
            .unwrap();

        task(&producer, 1);
        task(&producer, 2);
        for _ in 0..200 {
            if handle.stats().tasks_released == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let stats = handle.shutdown();
        assert_eq!(stats.tasks_released, 2);
        assert!(producer.pending_ids().unwrap().is_empty());
    }
}
