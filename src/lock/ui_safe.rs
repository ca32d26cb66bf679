//! Lock acquisition for threads that must keep servicing their own work
//! queue while they wait.
//!
//! The caller first tries a short bounded acquire. If that fails, a worker
//! thread waits for the lock instead, and on success hands ownership over to
//! the caller. Meanwhile the caller keeps draining its [`UiExecutor`], so
//! work posted to it by other threads (including the current lock owner)
//! still runs.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{self as channel, Receiver, Sender, select};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::{Result, StrandError};
use crate::lock::ConcurrencyLock;
use crate::thread_token::ThreadToken;
use crate::worker::{AcquireJob, AcquireOutcome, AcquireWorkerPool, CancelToken, WorkerHandle};

type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// The work queue of a responsiveness-critical thread.
pub struct UiExecutor {
    sender: Sender<Runnable>,
    receiver: Receiver<Runnable>,
}

/// Posts work to a [`UiExecutor`] from any thread.
#[derive(Clone)]
pub struct UiPoster {
    sender: Sender<Runnable>,
}

impl UiPoster {
    pub fn post(&self, runnable: impl FnOnce() + Send + 'static) {
        // Only fails once the executor itself is gone.
        let _ = self.sender.send(Box::new(runnable));
    }
}

impl Default for UiExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl UiExecutor {
    pub fn new() -> Self {
        let (sender, receiver) = channel::unbounded();
        Self { sender, receiver }
    }

    pub fn poster(&self) -> UiPoster {
        UiPoster {
            sender: self.sender.clone(),
        }
    }

    pub fn post(&self, runnable: impl FnOnce() + Send + 'static) {
        let _ = self.sender.send(Box::new(runnable));
    }

    /// Runs every runnable queued so far and returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(runnable) = self.receiver.try_recv() {
            runnable();
            ran += 1;
        }
        ran
    }

    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    fn receiver(&self) -> &Receiver<Runnable> {
        &self.receiver
    }
}

/// Timing knobs of [`ConcurrencyLock::ui_safe_acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UiSafeTimings {
    /// Bounded wait attempted before delegating to a worker.
    pub initial_wait_ms: u64,
    /// Slice of the worker's acquire loop and of the caller's servicing loop.
    pub poll_ms: u64,
}

impl Default for UiSafeTimings {
    fn default() -> Self {
        Self {
            initial_wait_ms: 250,
            poll_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handoff {
    Pending,
    Transferred,
    Cancelled,
}

impl ConcurrencyLock {
    /// Acquires the lock without ever blocking the calling thread
    /// uncooperatively.
    ///
    /// Falls back to a plain [`acquire`](ConcurrencyLock::acquire) when the
    /// worker pool is suspended. If, while servicing `ui`, the calling thread
    /// ends up owning the lock by some other path, the worker is cancelled and
    /// the call counts as a re-entrant acquisition.
    ///
    /// # Errors
    ///
    /// [`StrandError::Interrupted`] if the thread is interrupted or the worker
    /// is cancelled; any lock acquired on the caller's behalf is released
    /// first.
    pub fn ui_safe_acquire(
        self: &Arc<Self>,
        exclusive: bool,
        ui: &UiExecutor,
        workers: &AcquireWorkerPool,
        timings: UiSafeTimings,
    ) -> Result<()> {
        let me = ThreadToken::current();
        if me.take_interrupt() {
            return Err(StrandError::Interrupted);
        }

        if self.try_acquire(timings.initial_wait_ms as i64, exclusive)? {
            return Ok(());
        }

        if workers.is_suspended() {
            debug!("Worker pool suspended, {:?} blocks on the lock directly", me);
            return self.acquire(exclusive);
        }

        let handoff = Arc::new(Mutex::new(Handoff::Pending));
        let handle = workers.submit(self.acquire_job(exclusive, me.clone(), &handoff, timings.poll_ms))?;
        let mut delegation = Delegation {
            lock: self,
            handoff,
            handle,
            settled: false,
        };
        debug!("{:?} delegated lock acquisition to a worker", me);

        let poll = Duration::from_millis(timings.poll_ms.max(1));
        loop {
            select! {
                recv(delegation.handle.receiver()) -> outcome => {
                    delegation.settled = true;
                    return match outcome {
                        Ok(AcquireOutcome::Acquired) => Ok(()),
                        Ok(AcquireOutcome::Cancelled) => Err(StrandError::Interrupted),
                        Ok(AcquireOutcome::Failed(e)) => Err(e),
                        Err(_) => Err(StrandError::Worker("worker exited without a result".into())),
                    };
                }
                recv(ui.receiver()) -> runnable => {
                    // A panic here unwinds through `delegation`, which
                    // abandons the worker's attempt.
                    if let Ok(runnable) = runnable {
                        runnable();
                    }
                }
                default(poll) => {}
            }

            if me.take_interrupt() {
                delegation.abandon();
                return Err(StrandError::Interrupted);
            }

            let mut state = delegation.handoff.lock();
            if *state == Handoff::Pending && self.reenter_if_owner(exclusive) {
                debug!("{:?} already owns the lock, cancelling its worker", me);
                *state = Handoff::Cancelled;
                drop(state);
                delegation.handle.cancel();
                delegation.settled = true;
                return Ok(());
            }
        }
    }

    fn acquire_job(
        self: &Arc<Self>,
        exclusive: bool,
        target: ThreadToken,
        handoff: &Arc<Mutex<Handoff>>,
        poll_ms: u64,
    ) -> AcquireJob {
        let lock = Arc::clone(self);
        let handoff = Arc::clone(handoff);
        let slice = poll_ms.max(1) as i64;

        Box::new(move |cancel: &CancelToken| {
            loop {
                if cancel.is_cancelled() {
                    return AcquireOutcome::Cancelled;
                }
                match lock.try_acquire(slice, exclusive) {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(e) => return AcquireOutcome::Failed(e),
                }
            }

            let mut state = handoff.lock();
            if *state == Handoff::Pending {
                match lock.transfer(&target) {
                    Ok(()) => {
                        *state = Handoff::Transferred;
                        AcquireOutcome::Acquired
                    }
                    Err(e) => {
                        *state = Handoff::Cancelled;
                        drop(state);
                        if let Err(release_error) = lock.release() {
                            warn!("Worker failed to release after a failed transfer: {}", release_error);
                        }
                        AcquireOutcome::Failed(e)
                    }
                }
            } else {
                drop(state);
                if let Err(e) = lock.release() {
                    warn!("Worker failed to release an abandoned acquisition: {}", e);
                }
                AcquireOutcome::Cancelled
            }
        })
    }
}

/// A worker's acquisition on the calling thread's behalf. Unless settled,
/// dropping it cancels the attempt and releases anything already handed over.
struct Delegation<'a> {
    lock: &'a ConcurrencyLock,
    handoff: Arc<Mutex<Handoff>>,
    handle: WorkerHandle,
    settled: bool,
}

impl Delegation<'_> {
    fn abandon(&mut self) {
        self.settled = true;
        self.handle.cancel();
        let mut state = self.handoff.lock();
        match *state {
            Handoff::Transferred => {
                drop(state);
                if let Err(e) = self.lock.release() {
                    warn!("Failed to release a lock acquired on an abandoned caller's behalf: {}", e);
                }
            }
            Handoff::Pending => *state = Handoff::Cancelled,
            Handoff::Cancelled => {}
        }
    }
}

impl Drop for Delegation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            debug!("Abandoning an unfinished delegated acquisition");
            self.abandon();
        }
    }
}
