use std::fmt;

use thiserror::Error;

use crate::transaction::TransactionId;

/// Severity of a [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Ok,
    Info,
    Warning,
    Error,
    Cancel,
}

/// A structured outcome reported by validation, triggers or the commit itself.
///
/// Statuses nest: a multi-status carries the individual problems as
/// `children`, and its own severity is the worst of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    severity: Severity,
    message: String,
    children: Vec<Status>,
}

impl Status {
    pub fn ok() -> Self {
        Self::new(Severity::Ok, "OK")
    }

    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            children: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn cancel(message: impl Into<String>) -> Self {
        Self::new(Severity::Cancel, message)
    }

    /// Adds a child status, raising this status' severity to the child's if
    /// the child is worse.
    pub fn with_child(mut self, child: Status) -> Self {
        self.add(child);
        self
    }

    pub fn add(&mut self, child: Status) {
        if child.severity > self.severity {
            self.severity = child.severity;
        }
        self.children.push(child);
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn children(&self) -> &[Status] {
        &self.children
    }

    /// True when this status must abort a commit.
    pub fn is_failure(&self) -> bool {
        self.severity >= Severity::Error
    }

    fn fmt_indented(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        write!(f, "{:indent$}{:?}: {}", "", self.severity, self.message, indent = indent)?;
        for child in &self.children {
            writeln!(f)?;
            child.fmt_indented(f, indent + 2)?;
        }
        Ok(())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indented(f, 0)
    }
}

#[derive(Error, Debug)]
pub enum StrandError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Lock is not owned by the calling thread")]
    NotOwner,

    #[error("Interrupted while acquiring the lock")]
    Interrupted,

    #[error("Illegal transaction nesting: {0}")]
    IllegalNesting(String),

    #[error("Illegal transaction state: {0}")]
    IllegalState(String),

    #[error("Transaction {0} is read-only")]
    ReadOnly(TransactionId),

    #[error("Transaction rolled back: {0}")]
    Rollback(Status),

    #[error("Failed to revert changes, model integrity is uncertain: {0}")]
    RecoveryFailure(String),

    #[error("Change error: {0}")]
    Change(String),

    #[error("Worker pool error: {0}")]
    Worker(String),
}

impl StrandError {
    /// The status a rollback should report for this error.
    pub fn to_status(&self) -> Status {
        match self {
            StrandError::Rollback(status) => status.clone(),
            StrandError::Interrupted => Status::cancel(self.to_string()),
            other => Status::error(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
