pub mod change_log;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod listener;
pub mod lock;
pub mod options;
pub mod thread_token;
pub mod transaction;
pub mod worker;

// Re-export key types and structs for easier access
pub use change_log::{Change, ChangeLog, TrackedValue};
pub use command::{Command, RecordingCommand};
pub use config::CoordinatorConfig;
pub use coordinator::{CoordinatorBuilder, TransactionCoordinator, TransactionHandle, prelude};
pub use errors::{Result, Severity, Status, StrandError};
pub use lock::{ConcurrencyLock, UiExecutor};
pub use options::{OptionRegistry, TransactionOptions};
pub use thread_token::ThreadToken;
pub use transaction::{Transaction, TransactionId, TransactionState};
pub use worker::AcquireWorkerPool;

// Define the TransactionMode enum here as it's a core part of the public API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
///
/// Access modes of a transaction
pub enum TransactionMode {
    ///
    /// [TransactionMode::ReadOnly] transactions acquire the lock non-exclusively and may not
    /// record edits. A read-only root transaction can [yield](TransactionCoordinator::yield_now)
    /// the lock to another reader waiting for it.
    ReadOnly,
    ///
    /// [TransactionMode::ReadWrite] transactions acquire the lock exclusively. No other
    /// transaction runs while one is open, and a read-write transaction cannot be nested
    /// inside a [TransactionMode::ReadOnly] one.
    ReadWrite,
}

impl TransactionMode {
    /// Whether a root transaction in this mode takes the lock exclusively.
    pub fn is_exclusive(self) -> bool {
        self == TransactionMode::ReadWrite
    }

    /// Whether a transaction in mode `child` may be nested in one in this mode.
    pub fn allows_child(self, child: TransactionMode) -> bool {
        !(self == TransactionMode::ReadOnly && child == TransactionMode::ReadWrite)
    }
}
