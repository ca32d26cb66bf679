use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::{Condvar, Mutex};

use crate::errors::{Result, StrandError};
use crate::thread_token::ThreadToken;

#[derive(Debug, Default)]
struct NodeState {
    exclusive: bool,
    notified: bool,
    timed_out: bool,
}

/// One thread blocked on the lock.
///
/// A node is woken at most once. If the waiter gives up first (timeout or
/// interruption) the node is marked timed out and a later `wake_up` fails, so
/// ownership is never handed to a thread that is no longer waiting.
pub struct WaitNode {
    thread: ThreadToken,
    state: Mutex<NodeState>,
    cond: Condvar,
}

impl WaitNode {
    fn new(thread: ThreadToken, exclusive: bool) -> Self {
        Self {
            thread,
            state: Mutex::new(NodeState {
                exclusive,
                ..NodeState::default()
            }),
            cond: Condvar::new(),
        }
    }

    pub fn thread(&self) -> &ThreadToken {
        &self.thread
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }

    pub fn is_timed_out(&self) -> bool {
        self.state.lock().timed_out
    }

    fn reset(&self, exclusive: bool) {
        let mut state = self.state.lock();
        state.exclusive = exclusive;
        state.notified = false;
        state.timed_out = false;
    }

    /// Wakes the waiting thread. Returns `false` if the node was already woken
    /// or its waiter already gave up.
    pub fn wake_up(&self) -> bool {
        let mut state = self.state.lock();
        if state.notified || state.timed_out {
            return false;
        }
        state.notified = true;
        self.cond.notify_all();
        true
    }

    pub(crate) fn notify_interrupt(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Blocks the calling thread until woken, until `timeout_ms` elapses
    /// (`0` waits forever) or until the thread is interrupted.
    ///
    /// Returns `Ok(true)` when woken and `Ok(false)` on timeout. An interrupt
    /// that arrives after the wake-up leaves the interrupt flag raised and
    /// still reports success; one that arrives before it marks the node timed
    /// out and fails with [`StrandError::Interrupted`].
    pub fn wait_for(self: &Arc<Self>, timeout_ms: u64) -> Result<bool> {
        let deadline = (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms));
        self.thread.park_on(self);

        let mut state = self.state.lock();
        let outcome = loop {
            if state.notified {
                break Ok(true);
            }
            if self.thread.take_interrupt() {
                state.timed_out = true;
                break Err(StrandError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        state.timed_out = true;
                        break Ok(false);
                    }
                    self.cond.wait_until(&mut state, deadline);
                }
                None => self.cond.wait(&mut state),
            }
        };
        drop(state);

        self.thread.unpark();
        outcome
    }
}

/// FIFO queue of threads blocked on a [`ConcurrencyLock`].
///
/// Not synchronized on its own; the owning lock guards it with its internal
/// critical section.
///
/// [`ConcurrencyLock`]: crate::lock::ConcurrencyLock
#[derive(Default)]
pub struct WaitQueue {
    nodes: VecDeque<Arc<WaitNode>>,
    exclusive_count: usize,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `thread`. A node the thread left behind after an earlier timed
    /// out wait is re-initialized in place, keeping its queue position.
    pub fn enqueue(&mut self, thread: &ThreadToken, exclusive: bool) -> Arc<WaitNode> {
        if let Some(node) = self.nodes.iter().find(|node| node.thread == *thread) {
            let node = Arc::clone(node);
            if node.is_exclusive() {
                self.exclusive_count -= 1;
            }
            node.reset(exclusive);
            if exclusive {
                self.exclusive_count += 1;
            }
            trace!("Re-using wait node of {:?} (exclusive: {})", thread, exclusive);
            return node;
        }

        let node = Arc::new(WaitNode::new(thread.clone(), exclusive));
        self.nodes.push_back(Arc::clone(&node));
        if exclusive {
            self.exclusive_count += 1;
        }
        trace!("Queued {:?} at position {} (exclusive: {})", thread, self.nodes.len(), exclusive);
        node
    }

    /// Removes and wakes the first eligible waiter. Exclusive waiters are
    /// skipped unless `allow_exclusive`; waiters that already gave up are
    /// dropped along the way.
    pub fn dequeue_next(&mut self, allow_exclusive: bool) -> Option<Arc<WaitNode>> {
        let mut index = 0;
        while index < self.nodes.len() {
            let exclusive = self.nodes[index].is_exclusive();
            if exclusive && !allow_exclusive {
                index += 1;
                continue;
            }

            let node = self.nodes.remove(index)?;
            if exclusive {
                self.exclusive_count -= 1;
            }
            if node.wake_up() {
                return Some(node);
            }
            trace!("Dropped stale wait node of {:?}", node.thread);
        }
        None
    }

    /// True if some queued waiter asks for non-exclusive access.
    ///
    /// A node whose wait timed out still counts: it keeps its place for a
    /// thread that retries in slices, as background acquisition does. If
    /// that thread gave up for good, the node is dropped on the next
    /// dequeue and a yield made for it hands the lock to nobody.
    pub fn has_non_exclusive_waiter(&self) -> bool {
        self.nodes.iter().any(|node| {
            let state = node.state.lock();
            !state.exclusive && !state.notified
        })
    }

    pub fn exclusive_count(&self) -> usize {
        self.exclusive_count
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
