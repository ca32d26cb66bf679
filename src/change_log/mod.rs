//! Reversible records of the edits made while a transaction is open.
//!
//! A [`ChangeLog`] is a flat sequence of [`Change`] records. Nested
//! transactions produce their own logs, which are composed into the parent's
//! log on commit; composition flattens, so a log never contains another log.
//!
//! Reversal comes in two flavours:
//!
//! * [`Change::apply`] undoes everything once, in reverse chronological order,
//!   and consumes the log. This is the rollback path.
//! * [`Change::apply_and_reverse`] undoes everything and leaves each record
//!   primed to redo it, so successive calls toggle between the two states.
//!   This backs the durable undo history.

pub mod command_change;
pub mod value;

use log::trace;

use crate::errors::{Result, StrandError};
use crate::listener::Notification;

pub use command_change::CommandChange;
pub use value::{TrackedValue, ValueChange};

/// One reversible edit, opaque to the transaction engine.
pub trait Change: Send {
    /// Reverts the edit.
    fn apply(&mut self) -> Result<()>;

    /// Reverts the edit and records the inverse, so that the next call
    /// re-applies it.
    fn apply_and_reverse(&mut self) -> Result<()>;

    /// Whether the edit can currently be reverted.
    fn can_apply(&self) -> bool {
        true
    }

    /// Releases any model state the record keeps alive.
    fn dispose(&mut self) {}

    /// True when reverting would have no effect.
    fn is_empty(&self) -> bool {
        false
    }

    /// The notification emitted when the edit is recorded.
    fn notification(&self) -> Option<Notification> {
        None
    }

    /// Exposes the record as a composite log so that it can be flattened.
    fn as_composite_mut(&mut self) -> Option<&mut ChangeLog> {
        None
    }
}

/// A composite, flattening record of changes.
#[derive(Default)]
pub struct ChangeLog {
    entries: Vec<Box<dyn Change>>,
    undone: bool,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one edit. A composite record is flattened into this log,
    /// unless it is currently undone: that one is kept whole so it remembers
    /// which direction to replay next.
    pub fn record(&mut self, mut change: Box<dyn Change>) {
        if let Some(nested) = change.as_composite_mut() {
            if !nested.undone {
                let nested = std::mem::take(nested);
                self.compose(nested);
                return;
            }
        }
        self.entries.push(change);
    }

    /// Moves every entry of `other` to the end of this log. An empty `other`
    /// is discarded, and an undone one is appended as a single entry.
    pub fn compose(&mut self, other: ChangeLog) {
        if other.is_empty() {
            trace!("Discarding empty change log of {} entries", other.entries.len());
            return;
        }
        if other.undone {
            self.entries.push(Box::new(other));
            return;
        }
        for entry in other.entries {
            self.record(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the log has been toggled an odd number of times by
    /// [`Change::apply_and_reverse`].
    pub fn is_undone(&self) -> bool {
        self.undone
    }

    fn revert_all(&mut self, reverse: bool) -> Result<()> {
        let mut failures = Vec::new();
        for entry in self.entries.iter_mut().rev() {
            let outcome = if reverse {
                entry.apply_and_reverse()
            } else {
                entry.apply()
            };
            if let Err(e) = outcome {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StrandError::RecoveryFailure(failures.join("; ")))
        }
    }
}

impl Change for ChangeLog {
    /// Reverts every entry, newest first, then disposes them. The log is
    /// empty afterwards.
    fn apply(&mut self) -> Result<()> {
        let outcome = self.revert_all(false);
        self.dispose();
        outcome
    }

    fn apply_and_reverse(&mut self) -> Result<()> {
        let outcome = self.revert_all(true);
        // The newest entry is now the one to re-apply last.
        self.entries.reverse();
        self.undone = !self.undone;
        outcome
    }

    fn can_apply(&self) -> bool {
        self.entries.iter().all(|entry| entry.can_apply())
    }

    fn dispose(&mut self) {
        for mut entry in self.entries.drain(..) {
            entry.dispose();
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|entry| entry.is_empty())
    }

    fn as_composite_mut(&mut self) -> Option<&mut ChangeLog> {
        Some(self)
    }
}

impl std::fmt::Debug for ChangeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeLog")
            .field("entries", &self.entries.len())
            .field("undone", &self.undone)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Appends its tag to a shared journal whenever it is reverted.
    struct Journaled {
        tag: &'static str,
        journal: Arc<Mutex<Vec<String>>>,
        empty: bool,
    }

    impl Change for Journaled {
        fn apply(&mut self) -> Result<()> {
            self.journal.lock().push(format!("undo {}", self.tag));
            Ok(())
        }

        fn apply_and_reverse(&mut self) -> Result<()> {
            self.journal.lock().push(format!("toggle {}", self.tag));
            Ok(())
        }

        fn is_empty(&self) -> bool {
            self.empty
        }
    }

    fn journaled(tag: &'static str, journal: &Arc<Mutex<Vec<String>>>) -> Box<dyn Change> {
        Box::new(Journaled {
            tag,
            journal: Arc::clone(journal),
            empty: false,
        })
    }

    #[test]
    fn apply_reverts_newest_first_and_consumes() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut log = ChangeLog::new();
        log.record(journaled("a", &journal));
        log.record(journaled("b", &journal));

        log.apply().unwrap();
        assert_eq!(*journal.lock(), vec!["undo b", "undo a"]);
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn apply_and_reverse_alternates_direction() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut log = ChangeLog::new();
        log.record(journaled("a", &journal));
        log.record(journaled("b", &journal));

        log.apply_and_reverse().unwrap();
        assert!(log.is_undone());
        log.apply_and_reverse().unwrap();
        assert!(!log.is_undone());
        assert_eq!(
            *journal.lock(),
            vec!["toggle b", "toggle a", "toggle a", "toggle b"]
        );
    }

    #[test]
    fn compose_flattens_nested_logs() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut inner = ChangeLog::new();
        inner.record(journaled("inner", &journal));

        let mut outer = ChangeLog::new();
        outer.record(journaled("outer", &journal));
        outer.record(Box::new(inner));
        assert_eq!(outer.len(), 2);
        assert!(outer.entries.iter_mut().all(|e| e.as_composite_mut().is_none()));
    }

    #[test]
    fn compose_discards_empty_logs() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let mut empty = ChangeLog::new();
        empty.record(Box::new(Journaled {
            tag: "noop",
            journal: Arc::clone(&journal),
            empty: true,
        }));

        let mut log = ChangeLog::new();
        log.compose(empty);
        assert_eq!(log.len(), 0);
        assert!(log.is_empty());
    }
}
