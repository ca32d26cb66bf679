//! Background workers that wait for the lock on another thread's behalf.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{self as channel, Receiver, Sender};
use log::{debug, error};

use crate::errors::{Result, StrandError};

/// How a background acquisition ended.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The lock was acquired and ownership handed to the requesting thread.
    Acquired,
    /// The request was cancelled before ownership reached the requester.
    Cancelled,
    Failed(StrandError),
}

/// Shared cancellation flag between a [`WorkerHandle`] and its running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type AcquireJob = Box<dyn FnOnce(&CancelToken) -> AcquireOutcome + Send + 'static>;

struct Task {
    job: AcquireJob,
    cancel: CancelToken,
    result: Sender<AcquireOutcome>,
}

/// Handle on a submitted job.
pub struct WorkerHandle {
    cancel: CancelToken,
    result: Receiver<AcquireOutcome>,
}

impl WorkerHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Blocks until the job reports its outcome.
    pub fn await_result(self) -> AcquireOutcome {
        self.result.recv().unwrap_or_else(|_| {
            AcquireOutcome::Failed(StrandError::Worker("worker exited without a result".into()))
        })
    }

    pub fn try_result(&self) -> Option<AcquireOutcome> {
        self.result.try_recv().ok()
    }

    pub(crate) fn receiver(&self) -> &Receiver<AcquireOutcome> {
        &self.result
    }
}

/// A fixed pool of named worker threads fed from a channel.
///
/// While suspended the pool still runs jobs already queued, but callers are
/// expected to check [`is_suspended`](AcquireWorkerPool::is_suspended) and
/// block directly instead of submitting.
pub struct AcquireWorkerPool {
    sender: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    suspended: AtomicBool,
}

impl AcquireWorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(StrandError::InvalidArgument(
                "worker pool needs at least one thread".into(),
            ));
        }

        let (sender, receiver) = channel::unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("strand-acquire-{index}"))
                .spawn(move || worker_loop(receiver))
                .map_err(|e| StrandError::Worker(format!("failed to spawn worker: {e}")))?;
            workers.push(handle);
        }
        debug!("Started acquisition worker pool with {} threads", threads);

        Ok(Self {
            sender: Some(sender),
            workers,
            suspended: AtomicBool::new(false),
        })
    }

    pub fn submit(&self, job: AcquireJob) -> Result<WorkerHandle> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| StrandError::Worker("worker pool is shut down".into()))?;

        let cancel = CancelToken::new();
        let (result_tx, result_rx) = channel::bounded(1);
        sender
            .send(Task {
                job,
                cancel: cancel.clone(),
                result: result_tx,
            })
            .map_err(|_| StrandError::Worker("worker pool is shut down".into()))?;

        Ok(WorkerHandle {
            cancel,
            result: result_rx,
        })
    }

    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Stops accepting jobs and joins the workers once the queue drains.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Acquisition worker panicked during shutdown");
            }
        }
    }
}

impl Drop for AcquireWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Task>) {
    for task in receiver.iter() {
        let outcome = if task.cancel.is_cancelled() {
            AcquireOutcome::Cancelled
        } else {
            let cancel = task.cancel.clone();
            let job = task.job;
            panic::catch_unwind(AssertUnwindSafe(move || job(&cancel))).unwrap_or_else(|_| {
                error!("Acquisition job panicked");
                AcquireOutcome::Failed(StrandError::Worker("acquisition job panicked".into()))
            })
        };
        // The requester may have stopped listening after cancelling.
        let _ = task.result.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_submitted_jobs() {
        let pool = AcquireWorkerPool::new(2).unwrap();
        let handle = pool.submit(Box::new(|_: &CancelToken| AcquireOutcome::Acquired)).unwrap();
        assert!(matches!(handle.await_result(), AcquireOutcome::Acquired));
    }

    #[test]
    fn job_observes_cancellation() {
        let pool = AcquireWorkerPool::new(1).unwrap();
        let handle = pool
            .submit(Box::new(|cancel: &CancelToken| {
                while !cancel.is_cancelled() {
                    thread::yield_now();
                }
                AcquireOutcome::Cancelled
            }))
            .unwrap();
        handle.cancel();
        assert!(matches!(handle.await_result(), AcquireOutcome::Cancelled));
    }

    #[test]
    fn panicking_job_reports_failure() {
        let pool = AcquireWorkerPool::new(1).unwrap();
        let handle = pool
            .submit(Box::new(|_: &CancelToken| -> AcquireOutcome { panic!("boom") })).unwrap();
        assert!(matches!(
            handle.await_result(),
            AcquireOutcome::Failed(StrandError::Worker(_))
        ));
    }

    #[test]
    fn rejects_empty_pool() {
        assert!(matches!(
            AcquireWorkerPool::new(0),
            Err(StrandError::InvalidArgument(_))
        ));
    }
}
