//! Sync engine: change events, reconciliation, pipelines and retry handling.

mod change_event;
mod dispatcher;
mod idempotency;
mod pull_scheduler;
mod rate_limiter;
mod reconciler;
mod retry;
mod retry_manager;
mod sync_log_model;
mod sync_traits;
mod webhook;

pub use change_event::*;
pub use dispatcher::*;
pub use idempotency::*;
pub use pull_scheduler::*;
pub use rate_limiter::*;
pub use reconciler::*;
pub use retry::*;
pub use retry_manager::*;
pub use sync_log_model::*;
pub use sync_traits::*;
pub use webhook::*;

#[cfg(test)]
mod test_support;
