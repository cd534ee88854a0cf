//! Periodic stale-task reclamation.

use std::io;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use tracing::{error, info};

use taskq_core::QueueResult;

use super::{WorkerHandle, shutdown_requested, spawn_worker, wait_for_shutdown};
use crate::queue::{CleanupReport, TaskQueue};
use crate::store::Store;

/// Reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    pub name: String,
    /// Time between cleanup passes.
    pub interval: Duration,
    /// Heartbeat age beyond which a working task is requeued.
    pub timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            name: "reaper".to_string(),
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(900),
        }
    }
}

impl ReaperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Calls `cleanup` on a fixed interval.
pub struct Reaper<S> {
    queue: TaskQueue<S>,
    config: ReaperConfig,
}

impl<S: Store> Reaper<S> {
    pub fn new(queue: TaskQueue<S>, config: ReaperConfig) -> Self {
        Self { queue, config }
    }

    pub fn run_once(&self) -> QueueResult<CleanupReport> {
        let report = self.queue.cleanup(self.config.timeout)?;
        if !report.requeued.is_empty() {
            info!(
                reaper = %self.config.name,
                topic = %self.queue.topic(),
                requeued = report.requeued.len(),
                inspected = report.inspected,
                "reclaimed stale tasks"
            );
        }
        Ok(report)
    }

    /// Loop until shutdown. A failed pass is logged and the next one runs on
    /// schedule.
    pub fn run(&self, shutdown: Option<&Receiver<()>>) {
        info!(
            reaper = %self.config.name,
            topic = %self.queue.topic(),
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "reaper started"
        );

        loop {
            if shutdown_requested(shutdown) {
                break;
            }
            if let Err(err) = self.run_once() {
                error!(reaper = %self.config.name, error = %err, "cleanup pass failed");
            }
            if wait_for_shutdown(shutdown, self.config.interval) {
                break;
            }
        }

        info!(reaper = %self.config.name, "reaper stopped");
    }

    pub fn spawn(self) -> io::Result<WorkerHandle>
    where
        S: 'static,
    {
        let name = self.config.name.clone();
        spawn_worker(&name, move |shutdown_rx| self.run(Some(&shutdown_rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use taskq_core::Payload;
    use std::thread;

    #[test]
    fn spawned_reaper_requeues_stale_tasks_until_shutdown() {
        let store = InMemoryStore::with_clock(10_000);
        let queue = TaskQueue::new(store.clone(), "jobs".parse().unwrap());
        let payload: Payload = [("k".to_string(), "v".to_string())].into_iter().collect();
        let id = queue.create(&payload).unwrap();
        queue.acquire().unwrap();
        store.advance(Duration::from_secs(120));

        let reaper = Reaper::new(
            queue.clone(),
            ReaperConfig::default()
                .with_interval(Duration::from_millis(5))
                .with_timeout(Duration::from_secs(60)),
        );
        let handle = reaper.spawn().unwrap();

        for _ in 0..200 {
            if !queue.pending_ids().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(queue.pending_ids().unwrap(), vec![id.to_string()]);
        assert!(queue.working_ids().unwrap().is_empty());
    }

    #[test]
    fn run_once_leaves_fresh_tasks() {
        let store = InMemoryStore::with_clock(10_000);
        let queue = TaskQueue::new(store, "jobs".parse().unwrap());
        let payload: Payload = [("k".to_string(), "v".to_string())].into_iter().collect();
        queue.create(&payload).unwrap();
        queue.acquire().unwrap();

        let reaper = Reaper::new(queue, ReaperConfig::default());
        let report = reaper.run_once().unwrap();
        assert_eq!(report.fresh, 1);
        assert!(report.requeued.is_empty());
    }
}
