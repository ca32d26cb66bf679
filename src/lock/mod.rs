//! The concurrency control primitive: a fair, recursive, mode-aware lock and
//! the wait queue behind it.
pub mod concurrency_lock;
pub mod ui_safe;
pub mod wait_queue;

pub use concurrency_lock::ConcurrencyLock;
pub use ui_safe::{UiExecutor, UiPoster, UiSafeTimings};
pub use wait_queue::{WaitNode, WaitQueue};
