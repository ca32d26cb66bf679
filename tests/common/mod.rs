//! Common utilities for Strand integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use strand::listener::{
    CommitEvent, CommitListener, HookResult, PrecommitEvent, PrecommitHook,
};
use strand::{CoordinatorConfig, Status, TransactionCoordinator};

/// Builds a coordinator with short UI-safe timings so tests stay fast.
pub fn setup_coordinator() -> TransactionCoordinator {
    setup_coordinator_with(Vec::new(), Vec::new())
}

pub fn setup_coordinator_with(
    hooks: Vec<Arc<dyn PrecommitHook>>,
    listeners: Vec<Arc<dyn CommitListener>>,
) -> TransactionCoordinator {
    let config = CoordinatorConfig {
        ui_safe_initial_wait_ms: 20,
        worker_poll_ms: 10,
        ..CoordinatorConfig::default()
    };
    let mut builder = TransactionCoordinator::builder().config(config);
    for hook in hooks {
        builder = builder.hook(hook);
    }
    for listener in listeners {
        builder = builder.listener(listener);
    }
    builder.build().expect("coordinator should build")
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

// --- CollectingListener ---

/// Remembers every commit event it receives.
#[derive(Default)]
pub struct CollectingListener {
    events: Mutex<Vec<CommitEvent>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CommitEvent> {
        self.events.lock().clone()
    }
}

impl CommitListener for CollectingListener {
    fn transaction_closed(&self, event: &CommitEvent) {
        self.events.lock().push(event.clone());
    }
}

// --- VetoHook ---

/// Fails any commit whose notifications mention `feature`.
pub struct VetoHook {
    feature: String,
}

impl VetoHook {
    pub fn on(feature: &str) -> Arc<Self> {
        Arc::new(Self {
            feature: feature.to_string(),
        })
    }
}

impl PrecommitHook for VetoHook {
    fn about_to_commit(&self, event: &PrecommitEvent<'_>) -> HookResult {
        if event
            .notifications
            .iter()
            .any(|n| n.feature() == self.feature)
        {
            return Err(Status::error(format!("'{}' may not change", self.feature)));
        }
        Ok(None)
    }
}
