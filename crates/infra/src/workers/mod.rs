//! Long-running drivers built on the task queue.
//!
//! - `Consumer`: acquire → handle (with a background heartbeat) → release
//! - `Reaper`: periodic `cleanup`
//!
//! Both run inline on the calling thread or on a named background thread
//! controlled through a handle.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

pub mod consumer;
pub mod reaper;

pub use consumer::{Consumer, ConsumerConfig, ConsumerHandle, ConsumerStats, RunOutcome, TaskContext};
pub use reaper::{Reaper, ReaperConfig};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A worker in the middle of a task finishes it first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(thread::JoinHandle::is_finished)
    }
}

/// Run `body` on a named thread, handing it the shutdown receiver.
pub(crate) fn spawn_worker<F>(name: &str, body: F) -> io::Result<WorkerHandle>
where
    F: FnOnce(Receiver<()>) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

    let join = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(shutdown_rx))?;

    Ok(WorkerHandle {
        shutdown: shutdown_tx,
        join: Some(join),
    })
}

/// Sleep for `period`, returning `true` early if shutdown was requested
/// (or the handle was dropped).
pub(crate) fn wait_for_shutdown(shutdown: Option<&Receiver<()>>, period: Duration) -> bool {
    match shutdown {
        Some(rx) => match rx.recv_timeout(period) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        },
        None => {
            thread::sleep(period);
            false
        }
    }
}

/// Non-blocking shutdown check.
pub(crate) fn shutdown_requested(shutdown: Option<&Receiver<()>>) -> bool {
    shutdown.is_some_and(|rx| match rx.try_recv() {
        Ok(()) => true,
        Err(mpsc::TryRecvError::Disconnected) => true,
        Err(mpsc::TryRecvError::Empty) => false,
    })
}
