use log::debug;

use crate::change_log::Change;
use crate::command::Command;
use crate::errors::{Result, StrandError};

/// Records an executed [`Command`] so that it is undone with the rest of
/// the transaction.
pub struct CommandChange {
    command: Box<dyn Command>,
    /// `true` while the command's effect is in place.
    applied: bool,
    disposed: bool,
}

impl CommandChange {
    /// Wraps a command whose `execute` has already run.
    pub fn executed(command: Box<dyn Command>) -> Self {
        Self {
            command,
            applied: true,
            disposed: false,
        }
    }

    pub fn label(&self) -> &str {
        self.command.label()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed {
            return Err(StrandError::Change(format!(
                "command '{}' has been disposed",
                self.command.label()
            )));
        }
        Ok(())
    }
}

impl Change for CommandChange {
    fn apply(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.applied {
            debug!("Undoing command '{}'", self.command.label());
            self.command.undo()?;
            self.applied = false;
        }
        Ok(())
    }

    fn apply_and_reverse(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.applied {
            debug!("Undoing command '{}'", self.command.label());
            self.command.undo()?;
        } else {
            debug!("Redoing command '{}'", self.command.label());
            self.command.redo()?;
        }
        self.applied = !self.applied;
        Ok(())
    }

    fn can_apply(&self) -> bool {
        !self.disposed
            && if self.applied {
                self.command.can_undo()
            } else {
                self.command.can_redo()
            }
    }

    fn dispose(&mut self) {
        self.disposed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::TransactionHandle;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicI32, Ordering};

    struct Counter {
        value: Arc<AtomicI32>,
        redoable: bool,
    }

    impl Command for Counter {
        fn execute(&mut self, _txn: &TransactionHandle) -> Result<()> {
            self.value.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn undo(&mut self) -> Result<()> {
            self.value.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn redo(&mut self) -> Result<()> {
            self.value.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn can_redo(&self) -> bool {
            self.redoable
        }
    }

    #[test]
    fn toggles_between_undo_and_redo() {
        let value = Arc::new(AtomicI32::new(1));
        let mut change = CommandChange::executed(Box::new(Counter {
            value: Arc::clone(&value),
            redoable: true,
        }));

        change.apply_and_reverse().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 0);
        change.apply_and_reverse().unwrap();
        assert_eq!(value.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn can_apply_follows_direction() {
        let value = Arc::new(AtomicI32::new(1));
        let mut change = CommandChange::executed(Box::new(Counter {
            value,
            redoable: false,
        }));
        assert!(change.can_apply());
        change.apply_and_reverse().unwrap();
        assert!(!change.can_apply());
    }

    #[test]
    fn disposed_change_refuses_to_apply() {
        let value = Arc::new(AtomicI32::new(1));
        let mut change = CommandChange::executed(Box::new(Counter {
            value: Arc::clone(&value),
            redoable: true,
        }));
        change.dispose();
        assert!(matches!(change.apply(), Err(StrandError::Change(_))));
        assert_eq!(value.load(Ordering::SeqCst), 1);
    }
}
