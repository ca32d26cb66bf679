use crate::coordinator::TransactionHandle;
use crate::errors::Result;

/// An undoable action, typically contributed by a [`PrecommitHook`] as a
/// trigger and executed inside the committing transaction.
///
/// After `execute` succeeds the coordinator records the command itself as a
/// [`CommandChange`], so rolling back or undoing the transaction calls
/// [`undo`](Command::undo) and redoing it calls [`redo`](Command::redo).
///
/// [`PrecommitHook`]: crate::listener::PrecommitHook
/// [`CommandChange`]: crate::change_log::CommandChange
pub trait Command: Send {
    fn label(&self) -> &str {
        "command"
    }

    /// Performs the action. Edits made through `txn` (for example via
    /// [`TrackedValue::set`](crate::change_log::TrackedValue::set)) are
    /// recorded in the transaction's own change log.
    fn execute(&mut self, txn: &TransactionHandle) -> Result<()>;

    fn undo(&mut self) -> Result<()>;

    fn redo(&mut self) -> Result<()>;

    fn can_undo(&self) -> bool {
        true
    }

    fn can_redo(&self) -> bool {
        true
    }
}

type RecordingFn = Box<dyn FnMut(&TransactionHandle) -> Result<()> + Send>;

/// A command whose every edit goes through the transaction handle.
///
/// Reverting such a command is entirely the change log's job, so its own
/// `undo` and `redo` do nothing.
pub struct RecordingCommand {
    label: String,
    body: RecordingFn,
}

impl RecordingCommand {
    pub fn new(
        label: impl Into<String>,
        body: impl FnMut(&TransactionHandle) -> Result<()> + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            body: Box::new(body),
        }
    }
}

impl Command for RecordingCommand {
    fn label(&self) -> &str {
        &self.label
    }

    fn execute(&mut self, txn: &TransactionHandle) -> Result<()> {
        (self.body)(txn)
    }

    fn undo(&mut self) -> Result<()> {
        Ok(())
    }

    fn redo(&mut self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for RecordingCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingCommand")
            .field("label", &self.label)
            .finish()
    }
}
