use std::collections::VecDeque;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap as HashMap;
use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};

use crate::change_log::{Change, ChangeLog, CommandChange};
use crate::command::Command;
use crate::config::CoordinatorConfig;
use crate::errors::{Result, Severity, Status, StrandError};
use crate::listener::{
    CommitEvent, CommitListener, Notification, Outcome, PrecommitEvent, PrecommitHook,
};
use crate::lock::{ConcurrencyLock, UiExecutor};
use crate::options::{OptionDescriptor, OptionRegistry, TransactionOptions, keys};
use crate::thread_token::ThreadToken;
use crate::transaction::{LockAcquisition, Transaction, TransactionId, TransactionState};
use crate::worker::AcquireWorkerPool;
use crate::TransactionMode;

/// Strand prelude
pub mod prelude {
    pub use crate::change_log::*;
    pub use crate::command::*;
    pub use crate::config::*;
    pub use crate::errors::*;
    pub use crate::listener::*;
    pub use crate::lock::*;
    pub use crate::options::*;
    pub use crate::transaction::*;
    pub use crate::*;
}

struct HistoryEntry {
    label: Option<String>,
    log: ChangeLog,
}

#[derive(Default)]
struct UndoHistory {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

impl UndoHistory {
    fn clear_redo(&mut self) {
        for mut entry in self.redo.drain(..) {
            entry.log.dispose();
        }
    }
}

struct Inner {
    lock: Arc<ConcurrencyLock>,
    config: CoordinatorConfig,
    registry: OptionRegistry,
    next_id: AtomicU64,
    /// Each thread's open transactions, innermost last.
    stacks: Mutex<HashMap<ThreadToken, Vec<Transaction>>>,
    hooks: RwLock<Vec<Arc<dyn PrecommitHook>>>,
    listeners: RwLock<Vec<Arc<dyn CommitListener>>>,
    history: Mutex<UndoHistory>,
    workers: AcquireWorkerPool,
}

/// The entry point for opening transactions on a shared model.
///
/// Each thread has its own stack of open transactions. Opening a
/// transaction on a thread with an empty stack starts a root transaction,
/// which acquires the coordinator's [`ConcurrencyLock`]; otherwise the new
/// transaction is nested in the thread's innermost one.
///
/// Clones share the same lock, hooks and history.
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<Inner>,
}

/// Builds a [`TransactionCoordinator`].
#[derive(Default)]
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    lock: Option<Arc<ConcurrencyLock>>,
    hooks: Vec<Arc<dyn PrecommitHook>>,
    listeners: Vec<Arc<dyn CommitListener>>,
    options: Vec<OptionDescriptor>,
}

impl CoordinatorBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Shares an existing lock instead of creating a new one.
    pub fn lock(mut self, lock: Arc<ConcurrencyLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn PrecommitHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Registers an application-defined option key.
    pub fn option(mut self, descriptor: OptionDescriptor) -> Self {
        self.options.push(descriptor);
        self
    }

    /// Validates the configuration and starts the acquisition workers.
    pub fn build(self) -> Result<TransactionCoordinator> {
        self.config.validate()?;
        let mut registry = OptionRegistry::default();
        for descriptor in self.options {
            registry.register(descriptor)?;
        }
        self.config.default_options.validate(&registry)?;
        let workers = AcquireWorkerPool::new(self.config.worker_threads)?;

        debug!("Built transaction coordinator with {:?}", self.config);
        Ok(TransactionCoordinator {
            inner: Arc::new(Inner {
                lock: self.lock.unwrap_or_else(|| Arc::new(ConcurrencyLock::new())),
                config: self.config,
                registry,
                next_id: AtomicU64::new(1),
                stacks: Mutex::new(HashMap::new()),
                hooks: RwLock::new(self.hooks),
                listeners: RwLock::new(self.listeners),
                history: Mutex::new(UndoHistory::default()),
                workers,
            }),
        })
    }
}

impl TransactionCoordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::default()
    }

    /// Opens a transaction on the calling thread.
    ///
    /// If the thread already has an open transaction, the new one is nested
    /// in it and returns immediately. Otherwise it is a root transaction and
    /// blocks until the lock is acquired, exclusively for
    /// [`TransactionMode::ReadWrite`].
    ///
    /// # Arguments
    ///
    /// * `mode` - Whether the transaction may record edits.
    /// * `options` - Options for this transaction; a nested transaction also
    ///   inherits its parent's hereditary options, and a root transaction
    ///   picks up the configured defaults.
    ///
    /// # Returns
    ///
    /// A handle that must be committed or rolled back on this thread.
    /// Dropping it rolls the transaction back.
    ///
    /// # Errors
    ///
    /// [`StrandError::IllegalNesting`] when opening a read-write transaction
    /// inside a read-only one, and [`StrandError::Interrupted`] if the thread
    /// is interrupted while waiting for the lock.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand::prelude::*;
    ///
    /// let coordinator = TransactionCoordinator::builder().build().unwrap();
    /// let counter = TrackedValue::new("counter", 0);
    ///
    /// let txn = coordinator
    ///     .open_transaction(TransactionMode::ReadWrite, TransactionOptions::new())
    ///     .unwrap();
    /// counter.set(&txn, 1).unwrap();
    /// txn.commit().unwrap();
    /// assert_eq!(counter.get(), 1);
    /// ```
    pub fn open_transaction(
        &self,
        mode: TransactionMode,
        options: TransactionOptions,
    ) -> Result<TransactionHandle> {
        self.inner.open(mode, options, LockAcquisition::Blocking)
    }

    /// Like [`open_transaction`](Self::open_transaction), but a root
    /// transaction keeps running the work posted to `ui` while it waits for
    /// the lock.
    pub fn open_transaction_ui_safe(
        &self,
        mode: TransactionMode,
        options: TransactionOptions,
        ui: &UiExecutor,
    ) -> Result<TransactionHandle> {
        let acquisition = LockAcquisition::UiSafe {
            ui,
            workers: &self.inner.workers,
            timings: self.inner.config.ui_safe_timings(),
        };
        self.inner.open(mode, options, acquisition)
    }

    /// Runs `f` in a new transaction, committing if it returns `Ok` and
    /// rolling back otherwise.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand::prelude::*;
    ///
    /// let coordinator = TransactionCoordinator::builder().build().unwrap();
    /// let name = TrackedValue::new("name", String::from("draft"));
    ///
    /// coordinator
    ///     .run_exclusive(TransactionMode::ReadWrite, TransactionOptions::new(), |txn| {
    ///         name.set(txn, String::from("final"))
    ///     })
    ///     .unwrap();
    /// ```
    pub fn run_exclusive<R>(
        &self,
        mode: TransactionMode,
        options: TransactionOptions,
        f: impl FnOnce(&TransactionHandle) -> Result<R>,
    ) -> Result<R> {
        let txn = self.open_transaction(mode, options)?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = txn.rollback() {
                    error!("Rollback after a failed closure also failed: {}", rollback_error);
                }
                Err(e)
            }
        }
    }

    /// Lets a waiting reader run while the calling thread only reads.
    ///
    /// Only a thread whose root transaction is read-only can yield. When
    /// another non-exclusive waiter is queued, the thread hands the lock over
    /// completely, waits to get it back, and restores its previous depth.
    ///
    /// # Returns
    ///
    /// `true` if another thread ran in between.
    pub fn yield_now(&self) -> Result<bool> {
        self.inner.yield_now()
    }

    /// Reverts the most recent undoable root transaction.
    ///
    /// Returns `false` when there is nothing to undo. Must be called without
    /// an open transaction on this thread.
    pub fn undo(&self) -> Result<bool> {
        self.inner.replay(true)
    }

    /// Re-applies the most recently undone root transaction.
    pub fn redo(&self) -> Result<bool> {
        self.inner.replay(false)
    }

    pub fn can_undo(&self) -> bool {
        !self.inner.history.lock().undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.inner.history.lock().redo.is_empty()
    }

    /// Label of the entry [`undo`](Self::undo) would revert.
    pub fn undo_label(&self) -> Option<String> {
        self.inner
            .history
            .lock()
            .undo
            .back()
            .and_then(|entry| entry.label.clone())
    }

    pub fn undo_depth(&self) -> usize {
        self.inner.history.lock().undo.len()
    }

    /// Drops the whole undo and redo history.
    pub fn flush_history(&self) {
        let mut history = self.inner.history.lock();
        for mut entry in history.undo.drain(..) {
            entry.log.dispose();
        }
        history.clear_redo();
    }

    /// The calling thread's innermost open transaction.
    pub fn active_transaction_id(&self) -> Option<TransactionId> {
        let me = ThreadToken::current();
        self.inner
            .stacks
            .lock()
            .get(&me)
            .and_then(|stack| stack.last())
            .map(Transaction::id)
    }

    /// Number of transactions open on the calling thread.
    pub fn nesting_depth(&self) -> usize {
        let me = ThreadToken::current();
        self.inner.stacks.lock().get(&me).map_or(0, Vec::len)
    }

    pub fn add_hook(&self, hook: Arc<dyn PrecommitHook>) {
        self.inner.hooks.write().push(hook);
    }

    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub fn lock(&self) -> &Arc<ConcurrencyLock> {
        &self.inner.lock
    }

    pub fn workers(&self) -> &AcquireWorkerPool {
        &self.inner.workers
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &OptionRegistry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("lock", &self.inner.lock)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// An open transaction, confined to the thread that opened it.
///
/// Dropping a handle without committing or rolling back rolls the
/// transaction back.
pub struct TransactionHandle {
    id: TransactionId,
    mode: TransactionMode,
    inner: Arc<Inner>,
    closed: bool,
    _not_send: PhantomData<*const ()>,
}

impl TransactionHandle {
    fn new(id: TransactionId, mode: TransactionMode, inner: Arc<Inner>) -> Self {
        Self {
            id,
            mode,
            inner,
            closed: false,
            _not_send: PhantomData,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// `None` once the transaction has left this thread's stack.
    pub fn state(&self) -> Option<TransactionState> {
        self.inner.inspect(self.id, Transaction::state)
    }

    pub fn is_root(&self) -> bool {
        self.inner
            .inspect(self.id, Transaction::is_root)
            .unwrap_or(false)
    }

    pub fn options(&self) -> Result<TransactionOptions> {
        self.inner.with_transaction(self.id, |t| Ok(t.options().clone()))
    }

    /// Notifications of the edits recorded so far, including those of
    /// committed nested transactions.
    pub fn notifications(&self) -> Result<Vec<Notification>> {
        self.inner
            .with_transaction(self.id, |t| Ok(t.notifications().to_vec()))
    }

    /// Number of entries in the change log.
    pub fn change_count(&self) -> Result<usize> {
        self.inner.with_transaction(self.id, |t| Ok(t.change_log().len()))
    }

    /// Fails unless an edit could be recorded right now.
    pub fn check_writable(&self) -> Result<()> {
        self.inner.with_transaction(self.id, |t| t.check_writable())
    }

    /// Records one edit made on behalf of this transaction.
    ///
    /// # Errors
    ///
    /// [`StrandError::ReadOnly`] for a read-only transaction, and
    /// [`StrandError::IllegalState`] unless this is the calling thread's
    /// innermost active transaction.
    pub fn record(&self, change: Box<dyn Change>) -> Result<()> {
        self.inner.with_transaction(self.id, |t| t.record(change))
    }

    /// Dooms the transaction: its commit will roll back with `status`.
    pub fn abort(&self, status: Status) -> Result<()> {
        self.inner.with_transaction(self.id, |t| {
            t.abort(status);
            Ok(())
        })
    }

    /// Commits the transaction.
    ///
    /// Runs the pre-commit hooks and any trigger commands they contribute,
    /// then hands the change log to the parent (nested) or the undo history
    /// (root). A root transaction releases the lock and notifies the commit
    /// listeners.
    ///
    /// # Errors
    ///
    /// [`StrandError::Rollback`] if a hook vetoed the commit, a trigger
    /// failed, or a nested transaction failed earlier. The transaction has
    /// been fully rolled back by then, and a failure of a nested transaction
    /// also dooms its parent.
    pub fn commit(mut self) -> Result<()> {
        self.closed = true;
        self.inner.commit(self.id)
    }

    /// Rolls the transaction back, along with any nested transaction still
    /// open inside it.
    ///
    /// # Errors
    ///
    /// [`StrandError::RecoveryFailure`] if some edit could not be reverted.
    /// The transaction is rolled back and the lock released regardless.
    pub fn rollback(mut self) -> Result<()> {
        self.closed = true;
        self.inner.rollback(self.id)
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.closed || self.inner.inspect(self.id, Transaction::state).is_none() {
            return;
        }
        warn!("{} dropped without commit or rollback, rolling back", self.id);
        if let Err(e) = self.inner.rollback(self.id) {
            error!("Implicit rollback of {} failed: {}", self.id, e);
        }
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Inner {
    fn open(
        self: &Arc<Self>,
        mode: TransactionMode,
        options: TransactionOptions,
        acquisition: LockAcquisition<'_>,
    ) -> Result<TransactionHandle> {
        let me = ThreadToken::current();
        let id = TransactionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        {
            let mut stacks = self.stacks.lock();
            if let Some(stack) = stacks.get_mut(&me) {
                if let Some(parent) = stack.last() {
                    let txn = Transaction::start(
                        id,
                        Some(parent),
                        mode,
                        options,
                        &self.lock,
                        &self.registry,
                        acquisition,
                    )?;
                    stack.push(txn);
                    return Ok(TransactionHandle::new(id, mode, Arc::clone(self)));
                }
            }
        }

        // The stack mutex must not be held while waiting for the lock.
        let options = options.with_defaults(&self.config.default_options);
        let txn = Transaction::start(
            id,
            None,
            mode,
            options,
            &self.lock,
            &self.registry,
            acquisition,
        )?;
        self.stacks.lock().entry(me).or_default().push(txn);
        Ok(TransactionHandle::new(id, mode, Arc::clone(self)))
    }

    /// Runs `f` on `id`, which must be the calling thread's innermost
    /// transaction.
    fn with_transaction<R>(
        &self,
        id: TransactionId,
        f: impl FnOnce(&mut Transaction) -> Result<R>,
    ) -> Result<R> {
        let me = ThreadToken::current();
        let mut stacks = self.stacks.lock();
        let stack = stacks
            .get_mut(&me)
            .ok_or_else(|| not_open(id))?;
        let position = stack
            .iter()
            .position(|t| t.id() == id)
            .ok_or_else(|| not_open(id))?;
        if position + 1 != stack.len() {
            return Err(StrandError::IllegalState(format!(
                "{} is not the innermost transaction of this thread",
                id
            )));
        }
        f(&mut stack[position])
    }

    /// Reads from `id` wherever it sits in the calling thread's stack.
    fn inspect<R>(&self, id: TransactionId, f: impl FnOnce(&Transaction) -> R) -> Option<R> {
        let me = ThreadToken::current();
        self.stacks
            .lock()
            .get(&me)
            .and_then(|stack| stack.iter().find(|t| t.id() == id))
            .map(f)
    }

    fn pop(&self, id: TransactionId) -> Result<Transaction> {
        let me = ThreadToken::current();
        let mut stacks = self.stacks.lock();
        let stack = stacks.get_mut(&me).ok_or_else(|| not_open(id))?;
        match stack.last() {
            Some(top) if top.id() == id => {}
            _ => return Err(not_open(id)),
        }
        let txn = stack.pop().ok_or_else(|| not_open(id))?;
        if stack.is_empty() {
            stacks.remove(&me);
        }
        Ok(txn)
    }

    /// Rolls back whatever is still open inside `id` and returns how many
    /// transactions that was.
    fn abandon_nested(self: &Arc<Self>, id: TransactionId) -> usize {
        if self.inspect(id, Transaction::id).is_none() {
            return 0;
        }

        let me = ThreadToken::current();
        let mut abandoned = 0;
        loop {
            let top = self
                .stacks
                .lock()
                .get(&me)
                .and_then(|stack| stack.last())
                .map(Transaction::id);
            match top {
                Some(top) if top != id => {
                    warn!("Rolling back {} left open inside {}", top, id);
                    if let Err(e) = self.finish_rollback(top, None) {
                        error!("Failed to roll back {}: {}", top, e);
                        break;
                    }
                    abandoned += 1;
                }
                _ => break,
            }
        }
        abandoned
    }

    fn commit(self: &Arc<Self>, id: TransactionId) -> Result<()> {
        let abandoned = self.abandon_nested(id);
        if abandoned > 0 {
            self.finish_rollback(id, None)?;
            return Err(StrandError::IllegalState(format!(
                "{} was committed with {} nested transaction(s) still open",
                id, abandoned
            )));
        }

        let doomed = self.with_transaction(id, |t| Ok(t.abort_status().cloned()))?;
        if let Some(status) = doomed {
            warn!("{} was doomed by a failed nested transaction, rolling back", id);
            return Err(self.fail(id, status));
        }

        self.with_transaction(id, |t| t.begin_commit())?;
        if let Err(e) = self.precommit(id) {
            let status = e.to_status();
            warn!("Commit of {} failed, rolling back:\n{}", id, status);
            self.abandon_nested(id);
            return Err(self.fail(id, status));
        }
        self.abandon_nested(id);

        let mut txn = self.pop(id)?;
        let record = txn.finish_commit()?;
        match txn.parent() {
            Some(parent) => {
                self.with_transaction(parent, |p| p.compose_child(record))?;
            }
            None => {
                self.retain_for_undo(txn.options(), record.log);
                self.post_commit(CommitEvent {
                    transaction: id,
                    outcome: Outcome::Committed,
                    options: txn.options().clone(),
                    notifications: record.notifications,
                    status: None,
                });
            }
        }
        Ok(())
    }

    /// Rolls back a transaction whose commit failed and builds the error
    /// reported to the caller.
    fn fail(self: &Arc<Self>, id: TransactionId, status: Status) -> StrandError {
        match self.finish_rollback(id, Some(status.clone())) {
            Ok(None) => StrandError::Rollback(status),
            Ok(Some(recovery)) => {
                StrandError::Rollback(status.with_child(Status::error(recovery.to_string())))
            }
            Err(e) => e,
        }
    }

    fn rollback(self: &Arc<Self>, id: TransactionId) -> Result<()> {
        self.abandon_nested(id);
        match self.finish_rollback(id, None)? {
            Some(recovery) => Err(recovery),
            None => Ok(()),
        }
    }

    /// Pops and rolls back `id`. A `failure` is passed on to the parent,
    /// which is doomed by it, or to the commit listeners for a root.
    fn finish_rollback(
        self: &Arc<Self>,
        id: TransactionId,
        failure: Option<Status>,
    ) -> Result<Option<StrandError>> {
        let mut txn = self.pop(id)?;
        let recovery = txn.roll_back()?;

        match txn.parent() {
            Some(parent) => {
                if let Some(status) = failure {
                    self.with_transaction(parent, |p| {
                        p.abort(status);
                        Ok(())
                    })?;
                }
            }
            None => {
                let status = match (&failure, &recovery) {
                    (Some(status), Some(e)) => {
                        Some(status.clone().with_child(Status::error(e.to_string())))
                    }
                    (Some(status), None) => Some(status.clone()),
                    (None, Some(e)) => Some(Status::error(e.to_string())),
                    (None, None) => None,
                };
                self.post_commit(CommitEvent {
                    transaction: id,
                    outcome: Outcome::RolledBack,
                    options: txn.options().clone(),
                    notifications: Vec::new(),
                    status,
                });
            }
        }
        Ok(recovery)
    }

    /// Runs the hooks until they stop contributing triggers.
    ///
    /// Round 0 offers only the notifications no trigger has seen yet, so an
    /// edit already handled when a nested transaction committed does not
    /// fire its triggers again in the parent.
    fn precommit(self: &Arc<Self>, id: TransactionId) -> Result<()> {
        let me = ThreadToken::current();
        let (mode, options, is_root, mut notifications) = self.with_transaction(id, |t| {
            Ok((
                t.mode(),
                t.options().clone(),
                t.is_root(),
                t.unchecked_notifications().to_vec(),
            ))
        })?;

        let run_triggers = !options.is_set(keys::NO_TRIGGERS, &self.registry);
        let run_validation = !options.is_set(keys::NO_VALIDATION, &self.registry);
        let hooks = self.hooks.read().clone();
        if hooks.is_empty() || !(run_triggers || run_validation) {
            return Ok(());
        }

        let mut round = 0;
        loop {
            if me.take_interrupt() {
                return Err(StrandError::Interrupted);
            }

            let event = PrecommitEvent {
                transaction: id,
                mode,
                options: &options,
                is_root,
                round,
                notifications: &notifications,
            };
            let mut failure = Status::new(Severity::Ok, format!("Pre-commit of {} failed", id));
            let mut triggers: Vec<Box<dyn Command>> = Vec::new();
            for hook in &hooks {
                match panic::catch_unwind(AssertUnwindSafe(|| hook.about_to_commit(&event))) {
                    Ok(Ok(Some(command))) if run_triggers => triggers.push(command),
                    Ok(Ok(_)) => {}
                    Ok(Err(status)) if run_validation && status.is_failure() => failure.add(status),
                    Ok(Err(status)) => debug!("Ignoring hook status for {}: {}", id, status),
                    Err(_) => failure.add(Status::error("pre-commit hook panicked")),
                }
            }

            if failure.is_failure() {
                return Err(StrandError::Rollback(failure));
            }
            if triggers.is_empty() {
                break;
            }

            round += 1;
            if round > self.config.max_trigger_rounds {
                return Err(StrandError::Rollback(Status::error(format!(
                    "{} exceeded {} trigger rounds",
                    id, self.config.max_trigger_rounds
                ))));
            }
            debug!("Running {} trigger(s) for {} (round {})", triggers.len(), id, round);
            notifications = self.run_triggers(triggers)?;
            if notifications.is_empty() {
                break;
            }
        }

        if run_triggers {
            self.with_transaction(id, |t| {
                t.mark_checked();
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Executes trigger commands in a transaction nested in the committing
    /// one and returns the notifications they produced.
    fn run_triggers(self: &Arc<Self>, triggers: Vec<Box<dyn Command>>) -> Result<Vec<Notification>> {
        let options = TransactionOptions::new()
            .with_tag(keys::TRIGGER)
            .with_flag(keys::NO_TRIGGERS)
            .with_flag(keys::NO_VALIDATION);
        let txn = self.open(TransactionMode::ReadWrite, options, LockAcquisition::Blocking)?;

        for mut command in triggers {
            let label = command.label().to_string();
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| command.execute(&txn)))
                .unwrap_or_else(|_| {
                    Err(StrandError::IllegalState(format!("trigger '{}' panicked", label)))
                });
            if let Err(e) = outcome {
                warn!("Trigger '{}' failed: {}", label, e);
                txn.rollback()?;
                return Err(e);
            }
            txn.record(Box::new(CommandChange::executed(command)))?;
        }

        let notifications = txn.notifications()?;
        txn.commit()?;
        Ok(notifications)
    }

    fn retain_for_undo(&self, options: &TransactionOptions, mut log: ChangeLog) {
        let undoable = self.config.undo_limit > 0
            && !log.is_empty()
            && !options.is_set(keys::NO_UNDO, &self.registry)
            && !options.is_set(keys::UNDO_REDO, &self.registry);
        if !undoable {
            log.dispose();
            return;
        }

        let mut history = self.history.lock();
        history.clear_redo();
        history.undo.push_back(HistoryEntry {
            label: options.label().map(str::to_string),
            log,
        });
        while history.undo.len() > self.config.undo_limit {
            if let Some(mut oldest) = history.undo.pop_front() {
                oldest.log.dispose();
            }
        }
    }

    fn post_commit(&self, event: CommitEvent) {
        if event.options.is_set(keys::NO_NOTIFICATIONS, &self.registry) {
            return;
        }
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.transaction_closed(&event))).is_err() {
                error!("Commit listener panicked on {}", event.transaction);
            }
        }
    }

    /// Moves one history entry between the undo and redo stacks, reverting
    /// or re-applying its changes under a root transaction.
    fn replay(self: &Arc<Self>, undo: bool) -> Result<bool> {
        let direction = if undo { "undo" } else { "redo" };
        let me = ThreadToken::current();
        if self.stacks.lock().contains_key(&me) {
            return Err(StrandError::IllegalState(format!(
                "cannot {} inside an open transaction",
                direction
            )));
        }
        {
            let history = self.history.lock();
            if (undo && history.undo.is_empty()) || (!undo && history.redo.is_empty()) {
                return Ok(false);
            }
        }

        let options = TransactionOptions::new()
            .with_tag(keys::UNDO_REDO)
            .with_flag(keys::NO_TRIGGERS)
            .with_flag(keys::NO_UNDO)
            .with_label(direction);
        let txn = self.open(TransactionMode::ReadWrite, options, LockAcquisition::Blocking)?;

        // Another thread may have emptied the stack while this one waited.
        let entry = {
            let mut history = self.history.lock();
            if undo {
                history.undo.pop_back()
            } else {
                history.redo.pop()
            }
        };
        let Some(mut entry) = entry else {
            txn.commit()?;
            return Ok(false);
        };

        if !entry.log.can_apply() {
            self.restore_entry(undo, entry);
            txn.rollback()?;
            return Err(StrandError::IllegalState(format!(
                "the latest history entry can no longer {}",
                direction
            )));
        }

        if let Err(e) = entry.log.apply_and_reverse() {
            error!("Failed to {}: {}", direction, e);
            entry.log.dispose();
            txn.rollback()?;
            return Err(e);
        }

        if let Err(e) = txn.commit() {
            warn!("{} was vetoed, restoring: {}", direction, e);
            if let Err(restore_error) = entry.log.apply_and_reverse() {
                error!("Failed to restore after a vetoed {}: {}", direction, restore_error);
                entry.log.dispose();
                return Err(restore_error);
            }
            self.restore_entry(undo, entry);
            return Err(e);
        }

        debug!("Completed {} of {} change(s)", direction, entry.log.len());
        let mut history = self.history.lock();
        if undo {
            history.redo.push(entry);
        } else {
            history.undo.push_back(entry);
        }
        Ok(true)
    }

    fn restore_entry(&self, undo: bool, entry: HistoryEntry) {
        let mut history = self.history.lock();
        if undo {
            history.undo.push_back(entry);
        } else {
            history.redo.push(entry);
        }
    }

    fn yield_now(&self) -> Result<bool> {
        let me = ThreadToken::current();
        let root_mode = self
            .stacks
            .lock()
            .get(&me)
            .and_then(|stack| stack.first())
            .map(Transaction::mode)
            .ok_or_else(|| {
                StrandError::IllegalState("yield requires an open transaction".into())
            })?;
        if root_mode.is_exclusive() || !self.lock.yield_now()? {
            return Ok(false);
        }

        let depth = self.lock.release_all()?;
        let mut interrupted = false;
        loop {
            match self.lock.acquire(false) {
                Ok(()) => break,
                // The open transactions need the lock back regardless.
                Err(StrandError::Interrupted) => interrupted = true,
                Err(e) => return Err(e),
            }
        }
        for _ in 1..depth {
            self.lock.acquire(false)?;
        }
        if interrupted {
            me.interrupt();
        }
        debug!("{:?} resumed after yielding (depth {})", me, depth);
        Ok(true)
    }
}

fn not_open(id: TransactionId) -> StrandError {
    StrandError::IllegalState(format!("{} is not open on this thread", id))
}
