use std::sync::Arc;

use parking_lot::Mutex;

use crate::change_log::Change;
use crate::coordinator::TransactionHandle;
use crate::errors::{Result, StrandError};
use crate::listener::Notification;

/// A shared value whose writes are captured by the current transaction.
///
/// Clones share the same cell.
///
/// # Examples
///
/// ```no_run
/// use strand::prelude::*;
///
/// let coordinator = TransactionCoordinator::builder().build().unwrap();
/// let balance = TrackedValue::new("balance", 10);
///
/// let txn = coordinator
///     .open_transaction(TransactionMode::ReadWrite, TransactionOptions::new())
///     .unwrap();
/// balance.set(&txn, 42).unwrap();
/// txn.rollback().unwrap();
/// assert_eq!(balance.get(), 10);
/// ```
pub struct TrackedValue<T> {
    name: Arc<str>,
    cell: Arc<Mutex<T>>,
}

impl<T> Clone for TrackedValue<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: Send + 'static> TrackedValue<T> {
    pub fn new(name: impl Into<Arc<str>>, initial: T) -> Self {
        Self {
            name: name.into(),
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.cell.lock().clone()
    }

    /// Reads the value in place.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.cell.lock())
    }

    /// Writes `value` and records the previous one in `txn`.
    ///
    /// # Errors
    ///
    /// [`StrandError::ReadOnly`] if `txn` is read-only, or
    /// [`StrandError::IllegalState`] if `txn` is not the calling thread's
    /// innermost active transaction. The value is left untouched in both
    /// cases.
    pub fn set(&self, txn: &TransactionHandle, value: T) -> Result<()> {
        txn.check_writable()?;
        let previous = std::mem::replace(&mut *self.cell.lock(), value);
        txn.record(Box::new(ValueChange {
            name: Arc::clone(&self.name),
            cell: Arc::clone(&self.cell),
            stored: Some(previous),
        }))
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for TrackedValue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedValue")
            .field("name", &self.name)
            .field("value", &*self.cell.lock())
            .finish()
    }
}

/// The record left behind by [`TrackedValue::set`].
///
/// Holds the value that is *not* currently in the cell; applying swaps it
/// back in, which is why reversal is the same operation in both directions.
pub struct ValueChange<T> {
    name: Arc<str>,
    cell: Arc<Mutex<T>>,
    stored: Option<T>,
}

impl<T: Send + 'static> ValueChange<T> {
    fn swap(&mut self) -> Result<()> {
        let stored = self.stored.as_mut().ok_or_else(|| {
            StrandError::Change(format!("change to '{}' has been disposed", self.name))
        })?;
        std::mem::swap(&mut *self.cell.lock(), stored);
        Ok(())
    }
}

impl<T: Send + 'static> Change for ValueChange<T> {
    fn apply(&mut self) -> Result<()> {
        self.swap()?;
        self.stored = None;
        Ok(())
    }

    fn apply_and_reverse(&mut self) -> Result<()> {
        self.swap()
    }

    fn can_apply(&self) -> bool {
        self.stored.is_some()
    }

    fn dispose(&mut self) {
        self.stored = None;
    }

    fn notification(&self) -> Option<Notification> {
        Some(Notification::new(self.name.as_ref(), "set"))
    }
}
