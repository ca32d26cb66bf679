//! Hooks invoked around the commit of a transaction.

use crate::command::Command;
use crate::errors::Status;
use crate::options::TransactionOptions;
use crate::transaction::TransactionId;
use crate::TransactionMode;

/// Describes one edit to the observers of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    feature: String,
    kind: String,
}

impl Notification {
    pub fn new(feature: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            feature: feature.into(),
            kind: kind.into(),
        }
    }

    /// Name of the edited value.
    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

/// What a [`PrecommitHook`] sees for one round of a commit.
///
/// Round 0 carries the notifications of the transaction and its committed
/// children that no trigger has been offered yet; a child's edits were
/// already offered when the child committed. Later rounds carry only those
/// produced by the previous round's triggers.
#[derive(Debug)]
pub struct PrecommitEvent<'a> {
    pub transaction: TransactionId,
    pub mode: TransactionMode,
    pub options: &'a TransactionOptions,
    pub is_root: bool,
    pub round: u32,
    pub notifications: &'a [Notification],
}

pub type HookResult = std::result::Result<Option<Box<dyn Command>>, Status>;

/// Runs while a transaction is committing and may veto it or contribute a
/// trigger command.
///
/// Returning `Err` with a failing [`Status`] rolls the transaction back
/// (unless it was opened with `no_validation`). Returning a command runs it
/// inside the committing transaction (unless `no_triggers` is set), after
/// which every hook is consulted again with the notifications it produced.
pub trait PrecommitHook: Send + Sync {
    fn about_to_commit(&self, event: &PrecommitEvent<'_>) -> HookResult;
}

impl<F> PrecommitHook for F
where
    F: Fn(&PrecommitEvent<'_>) -> HookResult + Send + Sync,
{
    fn about_to_commit(&self, event: &PrecommitEvent<'_>) -> HookResult {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack,
}

/// Delivered after a root transaction has finished and released the lock.
#[derive(Debug, Clone)]
pub struct CommitEvent {
    pub transaction: TransactionId,
    pub outcome: Outcome,
    pub options: TransactionOptions,
    /// Every notification of the committed transaction, empty on rollback.
    pub notifications: Vec<Notification>,
    /// Why the transaction was rolled back, when it did not happen on request.
    pub status: Option<Status>,
}

pub trait CommitListener: Send + Sync {
    fn transaction_closed(&self, event: &CommitEvent);
}

impl<F> CommitListener for F
where
    F: Fn(&CommitEvent) + Send + Sync,
{
    fn transaction_closed(&self, event: &CommitEvent) {
        self(event)
    }
}
