//! Worker system — task dispatch against the current logic module.
//!
//! Core components:
//! - `task` — Task types (METER_POST, FAST_POST, LOGIN_CHECK, INVENTORY, SINGLE_CHECK)
//! - `state` — Task state machine (Received → Dispatching → Executing → Completed/Rejected)
//! - `progress` — Progress forwarding to the coordinator
//! - `dispatcher` — Routing, concurrency limit, timeouts and result reporting

pub mod dispatcher;
pub mod progress;
pub mod state;
pub mod task;

pub use dispatcher::{DispatcherConfig, TaskDispatcher, TaskOutcome};
pub use progress::ProgressReporter;
pub use state::{TaskLifecycle, TaskState};
pub use task::{Task, TaskType};
