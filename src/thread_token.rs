//! Thread identity and cooperative interruption.
//!
//! The lock hands ownership between threads and must be able to abort a
//! thread that is parked in a wait. Each thread lazily receives a
//! [`ThreadToken`] carrying a process-unique id and an interrupt flag that
//! other threads may raise.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::lock::wait_queue::WaitNode;

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadToken = ThreadToken::fresh();
}

struct TokenInner {
    id: u64,
    name: Option<String>,
    interrupted: AtomicBool,
    /// The node this thread is currently blocked on, if any.
    parked_on: Mutex<Option<Arc<WaitNode>>>,
}

/// Handle identifying one thread. Cheap to clone; equality is by id.
#[derive(Clone)]
pub struct ThreadToken {
    inner: Arc<TokenInner>,
}

impl ThreadToken {
    fn fresh() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                id: NEXT_TOKEN_ID.fetch_add(1, Ordering::SeqCst),
                name: std::thread::current().name().map(str::to_owned),
                interrupted: AtomicBool::new(false),
                parked_on: Mutex::new(None),
            }),
        }
    }

    /// Returns the token of the calling thread.
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn is_current(&self) -> bool {
        CURRENT.with(|current| current == self)
    }

    /// Raises the interrupt flag and wakes the thread if it is parked on a
    /// wait node.
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::SeqCst);
        let parked = self.inner.parked_on.lock().clone();
        if let Some(node) = parked {
            node.notify_interrupt();
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Clears the interrupt flag, returning whether it was set.
    pub fn take_interrupt(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn park_on(&self, node: &Arc<WaitNode>) {
        *self.inner.parked_on.lock() = Some(Arc::clone(node));
    }

    pub(crate) fn unpark(&self) {
        *self.inner.parked_on.lock() = None;
    }
}

impl PartialEq for ThreadToken {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ThreadToken {}

impl Hash for ThreadToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ThreadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "Thread#{}({})", self.inner.id, name),
            None => write!(f, "Thread#{}", self.inner.id),
        }
    }
}
