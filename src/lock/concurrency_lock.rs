use ahash::AHashSet as HashSet;
use log::{debug, warn};
use parking_lot::Mutex;

use crate::errors::{Result, StrandError};
use crate::lock::wait_queue::WaitQueue;
use crate::thread_token::ThreadToken;

struct LockState {
    owner: Option<ThreadToken>,
    /// One entry per recursive acquisition by `owner`; `true` marks an
    /// exclusive one. Empty exactly when `owner` is `None`.
    holds: Vec<bool>,
    yielders: HashSet<ThreadToken>,
    queue: WaitQueue,
}

impl LockState {
    fn is_exclusive_holder(&self) -> bool {
        self.holds.iter().any(|exclusive| *exclusive)
    }

    fn is_owner(&self, thread: &ThreadToken) -> bool {
        self.owner.as_ref() == Some(thread)
    }

    /// True if a thread other than `thread` is yielding. A yielder resuming
    /// is not held back by its own yield.
    fn has_other_yielders(&self, thread: &ThreadToken) -> bool {
        self.yielders.iter().any(|yielder| yielder != thread)
    }

    fn take(&mut self, thread: ThreadToken, exclusive: bool) {
        self.yielders.remove(&thread);
        self.owner = Some(thread);
        self.holds.clear();
        self.holds.push(exclusive);
    }

    /// Frees the lock and hands it to the next eligible waiter, if any.
    fn hand_off(&mut self) {
        self.owner = None;
        self.holds.clear();

        let allow_exclusive = self.yielders.is_empty();
        if let Some(node) = self.queue.dequeue_next(allow_exclusive) {
            let next = node.thread().clone();
            debug!("Lock handed off to {:?}", next);
            self.take(next, node.is_exclusive());
        }
    }
}

/// A single-owner, recursive, mode-aware lock.
///
/// Waiters are served in FIFO order. The only exception is yielding: while a
/// non-exclusive owner has offered to step aside (see [`yield_now`]), queued
/// exclusive requests are passed over in favour of non-exclusive ones until
/// every yielder has resumed and released.
///
/// Ownership is tied to the calling thread's [`ThreadToken`], and blocking
/// waits honour [`ThreadToken::interrupt`].
///
/// [`yield_now`]: ConcurrencyLock::yield_now
pub struct ConcurrencyLock {
    state: Mutex<LockState>,
}

impl Default for ConcurrencyLock {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyLock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                holds: Vec::new(),
                yielders: HashSet::new(),
                queue: WaitQueue::new(),
            }),
        }
    }

    /// Blocks until the lock is acquired or the thread is interrupted.
    pub fn acquire(&self, exclusive: bool) -> Result<()> {
        self.try_acquire(0, exclusive).map(|_| ())
    }

    /// Attempts to acquire the lock, waiting at most `timeout_ms`
    /// milliseconds (`0` waits without bound).
    ///
    /// # Errors
    ///
    /// * [`StrandError::InvalidArgument`] for a negative timeout.
    /// * [`StrandError::Interrupted`] if the thread is interrupted before or
    ///   during the wait, or if it already owns the lock non-exclusively and
    ///   asks for exclusive access while other threads are yielding (it would
    ///   otherwise wait on itself).
    pub fn try_acquire(&self, timeout_ms: i64, exclusive: bool) -> Result<bool> {
        if timeout_ms < 0 {
            return Err(StrandError::InvalidArgument(format!(
                "negative lock timeout: {timeout_ms}"
            )));
        }

        let me = ThreadToken::current();
        if me.take_interrupt() {
            return Err(StrandError::Interrupted);
        }

        let node = {
            let mut state = self.state.lock();

            if state.is_owner(&me) {
                if exclusive && !state.is_exclusive_holder() && !state.yielders.is_empty() {
                    warn!(
                        "{:?} attempted an exclusive re-acquisition while yielders are pending",
                        me
                    );
                    return Err(StrandError::Interrupted);
                }
                state.holds.push(exclusive);
                return Ok(true);
            }

            let must_queue = exclusive && state.has_other_yielders(&me);
            if state.owner.is_none() && !must_queue {
                debug!("Lock acquired by {:?} (exclusive: {})", me, exclusive);
                state.take(me, exclusive);
                return Ok(true);
            }

            state.queue.enqueue(&me, exclusive)
        };

        // Ownership is assigned by the releasing thread before the wake-up.
        let acquired = node.wait_for(timeout_ms as u64)?;
        if !acquired {
            debug!("{:?} timed out after {}ms waiting for the lock", me, timeout_ms);
        }
        Ok(acquired)
    }

    /// Releases one level of the calling thread's hold.
    ///
    /// # Errors
    ///
    /// [`StrandError::NotOwner`] if the calling thread does not own the lock.
    pub fn release(&self) -> Result<()> {
        let me = ThreadToken::current();
        let mut state = self.state.lock();
        if !state.is_owner(&me) {
            return Err(StrandError::NotOwner);
        }

        state.holds.pop();
        if state.holds.is_empty() {
            debug!("Lock released by {:?}", me);
            state.hand_off();
        }
        Ok(())
    }

    /// Releases every level of the calling thread's hold and returns how many
    /// there were.
    pub fn release_all(&self) -> Result<usize> {
        let me = ThreadToken::current();
        let mut state = self.state.lock();
        if !state.is_owner(&me) {
            return Err(StrandError::NotOwner);
        }

        let depth = state.holds.len();
        debug!("Lock fully released by {:?} (depth {})", me, depth);
        state.hand_off();
        Ok(depth)
    }

    /// Offers to let a waiting non-exclusive thread run next.
    ///
    /// Returns `true` only when the caller holds the lock non-exclusively and
    /// at least one non-exclusive waiter is queued. On success the caller is
    /// registered as a yielder: it must then release its hold and acquire
    /// again to resume, which removes it from the yielders.
    pub fn yield_now(&self) -> Result<bool> {
        let me = ThreadToken::current();
        let mut state = self.state.lock();
        if !state.is_owner(&me) {
            return Err(StrandError::NotOwner);
        }
        if state.is_exclusive_holder() || !state.queue.has_non_exclusive_waiter() {
            return Ok(false);
        }

        debug!("{:?} yields the lock", me);
        state.yielders.insert(me);
        Ok(true)
    }

    /// Moves ownership from the calling thread to `new_owner`, keeping the
    /// depth. Used by background acquisition on another thread's behalf.
    pub(crate) fn transfer(&self, new_owner: &ThreadToken) -> Result<()> {
        let me = ThreadToken::current();
        let mut state = self.state.lock();
        if !state.is_owner(&me) {
            return Err(StrandError::NotOwner);
        }

        debug!("Lock ownership transferred from {:?} to {:?}", me, new_owner);
        state.yielders.remove(new_owner);
        state.owner = Some(new_owner.clone());
        Ok(())
    }

    /// If the calling thread already owns the lock, adds one level to its
    /// hold and returns `true`.
    pub(crate) fn reenter_if_owner(&self, exclusive: bool) -> bool {
        let me = ThreadToken::current();
        let mut state = self.state.lock();
        if state.is_owner(&me) {
            state.holds.push(exclusive);
            true
        } else {
            false
        }
    }

    pub fn owner(&self) -> Option<ThreadToken> {
        self.state.lock().owner.clone()
    }

    pub fn depth(&self) -> usize {
        self.state.lock().holds.len()
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().is_owner(&ThreadToken::current())
    }

    pub fn is_exclusive_holder(&self) -> bool {
        self.state.lock().is_exclusive_holder()
    }

    pub fn yielder_count(&self) -> usize {
        self.state.lock().yielders.len()
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn exclusive_waiters(&self) -> usize {
        self.state.lock().queue.exclusive_count()
    }
}

impl std::fmt::Debug for ConcurrencyLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConcurrencyLock")
            .field("owner", &state.owner)
            .field("depth", &state.holds.len())
            .field("yielders", &state.yielders.len())
            .field("waiters", &state.queue.len())
            .finish()
    }
}
