use std::fmt;
use std::sync::Arc;

use log::{debug, error};

use crate::change_log::{Change, ChangeLog};
use crate::errors::{Result, Status, StrandError};
use crate::listener::Notification;
use crate::lock::{ConcurrencyLock, UiExecutor, UiSafeTimings};
use crate::options::{OptionRegistry, TransactionOptions};
use crate::thread_token::ThreadToken;
use crate::worker::AcquireWorkerPool;
use crate::TransactionMode;

/// Identifies a transaction for its whole life. Ids are never reused by a
/// coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    /// Pre-commit hooks and triggers are running.
    Committing,
    Committed,
    RolledBack,
}

impl TransactionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }
}

/// How a root transaction obtains the lock.
pub enum LockAcquisition<'a> {
    /// Park the calling thread until the lock is free.
    Blocking,
    /// Keep servicing `ui` while a worker waits for the lock.
    UiSafe {
        ui: &'a UiExecutor,
        workers: &'a AcquireWorkerPool,
        timings: UiSafeTimings,
    },
}

/// What a committed transaction hands to its parent or the undo history.
pub(crate) struct CommitRecord {
    pub(crate) log: ChangeLog,
    pub(crate) notifications: Vec<Notification>,
    pub(crate) unchecked: Vec<Notification>,
}

/// A unit of work on the shared model.
///
/// A transaction is confined to the thread that opened it. A root
/// transaction holds the coordinator's [`ConcurrencyLock`] from
/// [`start`](Transaction::start) until it reaches a terminal state; nested
/// transactions run under their root's hold and never touch the lock.
///
/// Every edit made while the transaction is active is appended to its
/// private [`ChangeLog`]. On commit a nested transaction hands its log to
/// the parent; on rollback the log is applied in reverse.
pub struct Transaction {
    id: TransactionId,
    mode: TransactionMode,
    parent: Option<TransactionId>,
    options: TransactionOptions,
    change_log: ChangeLog,
    notifications: Vec<Notification>,
    /// Notifications no trigger has been offered yet.
    unchecked: Vec<Notification>,
    state: TransactionState,
    owner: ThreadToken,
    /// Set only on a root transaction.
    lock: Option<Arc<ConcurrencyLock>>,
    abort_status: Option<Status>,
}

impl Transaction {
    /// Starts a transaction on the calling thread.
    ///
    /// With a `parent` the transaction is nested: it inherits the parent's
    /// hereditary options and returns immediately. Without one it is a root
    /// transaction and first acquires `lock`, exclusively for
    /// [`TransactionMode::ReadWrite`], as directed by `acquisition`.
    ///
    /// # Arguments
    ///
    /// * `id` - The identifier assigned by the coordinator.
    /// * `parent` - The calling thread's innermost active transaction, if any.
    /// * `mode` - Read-only or read-write.
    /// * `options` - The options requested by the caller.
    /// * `lock` - The coordinator's lock; only used for a root transaction.
    /// * `registry` - Option metadata used to validate and inherit options.
    /// * `acquisition` - Blocking or UI-safe acquisition of `lock`.
    ///
    /// # Errors
    ///
    /// * [`StrandError::IllegalNesting`] when a read-write transaction is
    ///   nested in a read-only one.
    /// * [`StrandError::IllegalState`] when `parent` is finished or belongs
    ///   to another thread.
    /// * [`StrandError::InvalidArgument`] for mistyped options.
    /// * [`StrandError::Interrupted`] if the thread is interrupted while
    ///   waiting for the lock.
    pub fn start(
        id: TransactionId,
        parent: Option<&Transaction>,
        mode: TransactionMode,
        options: TransactionOptions,
        lock: &Arc<ConcurrencyLock>,
        registry: &OptionRegistry,
        acquisition: LockAcquisition<'_>,
    ) -> Result<Self> {
        options.validate(registry)?;
        let owner = ThreadToken::current();

        if let Some(parent) = parent {
            if parent.owner != owner {
                return Err(StrandError::IllegalState(format!(
                    "{} belongs to another thread",
                    parent.id
                )));
            }
            if parent.state.is_terminal() {
                return Err(StrandError::IllegalState(format!(
                    "{} is already {:?}",
                    parent.id, parent.state
                )));
            }
            if !parent.mode.allows_child(mode) {
                return Err(StrandError::IllegalNesting(format!(
                    "cannot open a {:?} transaction inside read-only {}",
                    mode, parent.id
                )));
            }

            let options = options.inherit(&parent.options, registry);
            debug!("Started {} ({:?}) nested in {}", id, mode, parent.id);
            return Ok(Self::new(id, mode, Some(parent.id), options, owner, None));
        }

        let exclusive = mode.is_exclusive();
        match acquisition {
            LockAcquisition::Blocking => lock.acquire(exclusive)?,
            LockAcquisition::UiSafe {
                ui,
                workers,
                timings,
            } => lock.ui_safe_acquire(exclusive, ui, workers, timings)?,
        }
        debug!("Started root {} ({:?})", id, mode);
        Ok(Self::new(id, mode, None, options, owner, Some(Arc::clone(lock))))
    }

    fn new(
        id: TransactionId,
        mode: TransactionMode,
        parent: Option<TransactionId>,
        options: TransactionOptions,
        owner: ThreadToken,
        lock: Option<Arc<ConcurrencyLock>>,
    ) -> Self {
        Self {
            id,
            mode,
            parent,
            options,
            change_log: ChangeLog::new(),
            notifications: Vec::new(),
            unchecked: Vec::new(),
            state: TransactionState::Active,
            owner,
            lock,
            abort_status: None,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn parent(&self) -> Option<TransactionId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn owner(&self) -> &ThreadToken {
        &self.owner
    }

    pub fn change_log(&self) -> &ChangeLog {
        &self.change_log
    }

    pub fn notifications(&self) -> &[Notification] {
        &self.notifications
    }

    /// Notifications recorded here or composed from children that pre-commit
    /// triggers have not been offered yet.
    pub fn unchecked_notifications(&self) -> &[Notification] {
        &self.unchecked
    }

    /// The failure of a nested transaction that doomed this one, if any.
    pub fn abort_status(&self) -> Option<&Status> {
        self.abort_status.as_ref()
    }

    /// Fails with the reason an edit may not be recorded now.
    pub fn check_writable(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(StrandError::IllegalState(format!(
                "{} is {:?}",
                self.id, self.state
            )));
        }
        if !self.mode.is_exclusive() {
            return Err(StrandError::ReadOnly(self.id));
        }
        Ok(())
    }

    /// Appends one edit to the change log, along with its notification.
    pub fn record(&mut self, change: Box<dyn Change>) -> Result<()> {
        self.check_writable()?;
        if let Some(notification) = change.notification() {
            self.unchecked.push(notification.clone());
            self.notifications.push(notification);
        }
        self.change_log.record(change);
        Ok(())
    }

    /// Takes over the log and notifications of a committed child.
    pub(crate) fn compose_child(&mut self, child: CommitRecord) -> Result<()> {
        if self.state.is_terminal() {
            return Err(StrandError::IllegalState(format!(
                "{} is {:?} and cannot absorb a child",
                self.id, self.state
            )));
        }
        self.change_log.compose(child.log);
        self.notifications.extend(child.notifications);
        self.unchecked.extend(child.unchecked);
        Ok(())
    }

    /// Records that triggers have seen every notification so far.
    pub(crate) fn mark_checked(&mut self) {
        self.unchecked.clear();
    }

    /// Marks the transaction as doomed: its commit will roll back instead.
    pub(crate) fn abort(&mut self, status: Status) {
        match &mut self.abort_status {
            Some(existing) => existing.add(status),
            None => self.abort_status = Some(status),
        }
    }

    pub(crate) fn begin_commit(&mut self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(StrandError::IllegalState(format!(
                "cannot commit {} while {:?}",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committing;
        Ok(())
    }

    /// Completes a commit started with `begin_commit`, releasing the lock if
    /// this is a root transaction. Returns what the parent or the undo
    /// history takes over.
    pub(crate) fn finish_commit(&mut self) -> Result<CommitRecord> {
        if self.state != TransactionState::Committing {
            return Err(StrandError::IllegalState(format!(
                "{} is {:?}, not committing",
                self.id, self.state
            )));
        }
        self.state = TransactionState::Committed;
        let record = CommitRecord {
            log: std::mem::take(&mut self.change_log),
            notifications: std::mem::take(&mut self.notifications),
            unchecked: std::mem::take(&mut self.unchecked),
        };
        debug!("Committed {} ({} changes)", self.id, record.log.len());
        self.release_lock()?;
        Ok(record)
    }

    /// Reverts every recorded edit, newest first, and releases the lock if
    /// this is a root transaction.
    ///
    /// A failure while reverting does not stop the rollback; it is returned
    /// as `Ok(Some(StrandError::RecoveryFailure))` once the transaction is
    /// rolled back and the lock released.
    pub(crate) fn roll_back(&mut self) -> Result<Option<StrandError>> {
        if self.state.is_terminal() {
            return Err(StrandError::IllegalState(format!(
                "cannot roll back {} while {:?}",
                self.id, self.state
            )));
        }

        let recovery = match self.change_log.apply() {
            Ok(()) => None,
            Err(StrandError::RecoveryFailure(message)) => {
                error!("Rollback of {} left the model inconsistent: {}", self.id, message);
                Some(StrandError::RecoveryFailure(message))
            }
            Err(other) => {
                error!("Rollback of {} failed: {}", self.id, other);
                Some(StrandError::RecoveryFailure(other.to_string()))
            }
        };
        self.notifications.clear();
        self.unchecked.clear();
        self.state = TransactionState::RolledBack;
        debug!("Rolled back {}", self.id);

        self.release_lock()?;
        Ok(recovery)
    }

    fn release_lock(&mut self) -> Result<()> {
        if let Some(lock) = self.lock.take() {
            lock.release()?;
        }
        Ok(())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("parent", &self.parent)
            .field("state", &self.state)
            .field("changes", &self.change_log.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(lock: &Arc<ConcurrencyLock>, id: u64, mode: TransactionMode) -> Transaction {
        Transaction::start(
            TransactionId(id),
            None,
            mode,
            TransactionOptions::new(),
            lock,
            &OptionRegistry::default(),
            LockAcquisition::Blocking,
        )
        .unwrap()
    }

    #[test]
    fn root_holds_lock_until_terminal() {
        let lock = Arc::new(ConcurrencyLock::new());
        let mut txn = root(&lock, 1, TransactionMode::ReadWrite);
        assert!(lock.is_held_by_current_thread());
        assert!(lock.is_exclusive_holder());

        txn.begin_commit().unwrap();
        assert!(txn.finish_commit().is_ok());
        assert_eq!(txn.state(), TransactionState::Committed);
        assert!(lock.owner().is_none());
    }

    #[test]
    fn read_only_parent_rejects_writer_child() {
        let lock = Arc::new(ConcurrencyLock::new());
        let parent = root(&lock, 1, TransactionMode::ReadOnly);
        let result = Transaction::start(
            TransactionId(2),
            Some(&parent),
            TransactionMode::ReadWrite,
            TransactionOptions::new(),
            &lock,
            &OptionRegistry::default(),
            LockAcquisition::Blocking,
        );
        assert!(matches!(result, Err(StrandError::IllegalNesting(_))));
        assert_eq!(lock.depth(), 1);
    }

    #[test]
    fn nested_start_leaves_lock_depth_alone() {
        let lock = Arc::new(ConcurrencyLock::new());
        let parent = root(&lock, 1, TransactionMode::ReadWrite);
        let child = Transaction::start(
            TransactionId(2),
            Some(&parent),
            TransactionMode::ReadOnly,
            TransactionOptions::new(),
            &lock,
            &OptionRegistry::default(),
            LockAcquisition::Blocking,
        )
        .unwrap();
        assert_eq!(child.parent(), Some(TransactionId(1)));
        assert_eq!(lock.depth(), 1);
    }

    #[test]
    fn read_only_transaction_rejects_edits() {
        let lock = Arc::new(ConcurrencyLock::new());
        let mut txn = root(&lock, 7, TransactionMode::ReadOnly);
        let result = txn.record(Box::new(ChangeLog::new()));
        assert!(matches!(result, Err(StrandError::ReadOnly(TransactionId(7)))));
    }

    #[test]
    fn rollback_twice_is_illegal() {
        let lock = Arc::new(ConcurrencyLock::new());
        let mut txn = root(&lock, 1, TransactionMode::ReadWrite);
        assert!(txn.roll_back().unwrap().is_none());
        assert!(matches!(txn.roll_back(), Err(StrandError::IllegalState(_))));
    }
}
