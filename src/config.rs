use serde::{Deserialize, Serialize};

use crate::errors::{Result, StrandError};
use crate::lock::UiSafeTimings;
use crate::options::TransactionOptions;

/// Tunables of a [`TransactionCoordinator`](crate::TransactionCoordinator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bounded wait a UI-safe open attempts before delegating to a worker.
    pub ui_safe_initial_wait_ms: u64,
    /// Slice length of the worker's acquire loop and of the UI servicing loop.
    pub worker_poll_ms: u64,
    pub worker_threads: usize,
    /// Trigger rounds allowed per commit before it is rolled back.
    pub max_trigger_rounds: u32,
    /// Depth of the undo history; `0` disables it.
    pub undo_limit: usize,
    /// Options applied to every root transaction that does not set them.
    pub default_options: TransactionOptions,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ui_safe_initial_wait_ms: 250,
            worker_poll_ms: 100,
            worker_threads: 1,
            max_trigger_rounds: 32,
            undo_limit: 100,
            default_options: TransactionOptions::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_poll_ms == 0 {
            return Err(StrandError::InvalidArgument(
                "worker_poll_ms must be positive".into(),
            ));
        }
        if self.worker_threads == 0 {
            return Err(StrandError::InvalidArgument(
                "worker_threads must be positive".into(),
            ));
        }
        if self.max_trigger_rounds == 0 {
            return Err(StrandError::InvalidArgument(
                "max_trigger_rounds must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ui_safe_timings(&self) -> UiSafeTimings {
        UiSafeTimings {
            initial_wait_ms: self.ui_safe_initial_wait_ms,
            poll_ms: self.worker_poll_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::keys;

    #[test]
    fn missing_fields_take_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"undo_limit": 5, "default_options": {"no_triggers": true}}"#)
                .unwrap();
        assert_eq!(config.undo_limit, 5);
        assert_eq!(config.worker_poll_ms, 100);
        assert!(config.default_options.contains(keys::NO_TRIGGERS));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let config = CoordinatorConfig {
            worker_poll_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StrandError::InvalidArgument(_))));
    }
}
