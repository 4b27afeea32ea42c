//! Task dispatcher. Turns `execute_task` messages into capability calls.
//!
//! Every task runs its own state machine (Received → Dispatching → Executing
//! → Completed, or Received → Rejected) against the logic module snapshot
//! captured on receipt. Failures of any kind end as a structured result; the
//! dispatcher never hands an error back to the channel layer.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::channels::{OutboundMessage, Outbox};
use crate::config::AgentConfig;
use crate::error::{CapabilityError, TaskError};
use crate::logic::{Capability, LogicModule, LogicStore};
use crate::worker::progress::ProgressReporter;
use crate::worker::state::{TaskLifecycle, TaskState};
use crate::worker::task::{Task, TaskType};

/// Dispatcher tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Tasks allowed to execute at once; later ones wait for a slot.
    pub max_parallel_tasks: usize,
    /// Per-task execution limit.
    pub task_timeout: Option<Duration>,
    /// Progress coalescing interval.
    pub progress_min_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for DispatcherConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_parallel_tasks: config.max_parallel_tasks,
            task_timeout: config.task_timeout,
            progress_min_interval: config.progress_min_interval,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// Module not ready; no result was emitted.
    Rejected,
    /// `task_completed` was emitted with this result.
    Completed(Value),
}

/// Routes tasks to the current logic module and reports results.
pub struct TaskDispatcher {
    store: Arc<LogicStore>,
    outbox: Outbox,
    permits: Arc<Semaphore>,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(store: Arc<LogicStore>, outbox: Outbox, config: DispatcherConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel_tasks.max(1))),
            store,
            outbox,
            config,
        }
    }

    /// Run a task on its own tokio task so the caller keeps receiving events.
    pub fn spawn(self: &Arc<Self>, task: Task) -> JoinHandle<TaskOutcome> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(task).await })
    }

    /// Drive one task through its state machine to a terminal state.
    pub async fn dispatch(&self, task: Task) -> TaskOutcome {
        let mut lifecycle = TaskLifecycle::new(&task.request_id);
        tracing::info!(
            request_id = %task.request_id,
            task_type = %task.task_type,
            "Task received"
        );

        // Captured once; a hot swap from here on does not affect this task.
        let module = self.store.snapshot().await;

        if !module.is_ready() {
            advance(&mut lifecycle, TaskState::Rejected, Some("logic module not ready"));
            let local_hash = self.store.disk_hash().await;
            tracing::warn!(
                request_id = %task.request_id,
                local_hash = local_hash.as_deref().unwrap_or("none"),
                "Logic module not ready, dropping task and requesting version check"
            );
            self.outbox.send(OutboundMessage::CheckVersion(local_hash));
            return TaskOutcome::Rejected;
        }

        advance(&mut lifecycle, TaskState::Dispatching, None);

        let result = if let TaskType::Unknown(raw) = &task.task_type {
            tracing::warn!(request_id = %task.request_id, task_type = %raw, "Unknown task type");
            json!({ "error": "Unknown Task Type" })
        } else {
            let _permit = self.permits.acquire().await;
            advance(&mut lifecycle, TaskState::Executing, None);

            let reporter = ProgressReporter::new(
                task.request_id.clone(),
                self.outbox.clone(),
                self.config.progress_min_interval,
            );
            match self.execute(&task, &module, &reporter).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(request_id = %task.request_id, error = %e, "Task failed");
                    json!({ "error": e.to_string(), "failed": 1 })
                }
            }
        };

        advance(&mut lifecycle, TaskState::Completed, None);
        tracing::info!(
            request_id = %task.request_id,
            task_type = %task.task_type,
            elapsed_ms = lifecycle.elapsed().as_millis() as u64,
            error = result.get("error").is_some(),
            "Task completed"
        );

        self.outbox.send(OutboundMessage::TaskCompleted {
            request_id: task.request_id.clone(),
            result: result.clone(),
        });
        TaskOutcome::Completed(result)
    }

    /// Run the capability chain with the timeout and panic boundary applied.
    async fn execute(
        &self,
        task: &Task,
        module: &LogicModule,
        reporter: &ProgressReporter,
    ) -> Result<Value, TaskError> {
        let guarded = AssertUnwindSafe(route(task, module, reporter)).catch_unwind();

        let outcome = match self.config.task_timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .map_err(|_| TaskError::Timeout(limit))?,
            None => guarded.await,
        };

        outcome.unwrap_or_else(|panic| Err(TaskError::Panicked(panic_message(panic.as_ref()))))
    }
}

fn advance(lifecycle: &mut TaskLifecycle, to: TaskState, reason: Option<&str>) {
    if let Err(e) = lifecycle.transition_to(to, reason.map(str::to_string)) {
        tracing::error!(error = %e, "Illegal task state transition");
    }
}

fn unavailable(capability: Capability) -> TaskError {
    TaskError::CapabilityUnavailable(capability.as_str().to_string())
}

/// Map a task onto its capability chain. Calls within a chain are sequential.
async fn route(
    task: &Task,
    module: &LogicModule,
    reporter: &ProgressReporter,
) -> Result<Value, TaskError> {
    let caps = module.capabilities();

    match &task.task_type {
        TaskType::MeterPost | TaskType::FastPost => {
            let batch = caps
                .process_batch
                .as_ref()
                .ok_or_else(|| unavailable(Capability::ProcessBatch))?;
            let credentials = task.credentials()?;
            let meters = task.meters()?;
            Ok(batch.process_batch(&credentials, &meters, reporter).await?)
        }

        TaskType::LoginCheck => {
            let login = caps
                .verify_login_details
                .as_ref()
                .ok_or_else(|| unavailable(Capability::VerifyLoginDetails))?;
            let credentials = task.credentials()?;
            let outcome = login.verify_login_details(&credentials).await?;
            serde_json::to_value(outcome)
                .map_err(|e| CapabilityError::Failed(format!("unserializable login result: {e}")).into())
        }

        TaskType::Inventory => {
            let login = caps
                .verify_login_details
                .as_ref()
                .ok_or_else(|| unavailable(Capability::VerifyLoginDetails))?;
            let inventory = caps
                .get_inventory_list
                .as_ref()
                .ok_or_else(|| unavailable(Capability::GetInventoryList))?;
            let credentials = task.credentials()?;
            let limit = task.limit()?;

            let session = login.verify_login_details(&credentials).await?;
            if !session.success {
                return Ok(json!({
                    "error": format!("Login Failed: {}", session.message.unwrap_or_default())
                }));
            }

            let data = inventory.get_inventory_list(&session.cookies, limit).await?;
            Ok(json!({ "status": "success", "count": data.len(), "data": data }))
        }

        TaskType::SingleCheck => {
            let login = caps
                .verify_login_details
                .as_ref()
                .ok_or_else(|| unavailable(Capability::VerifyLoginDetails))?;
            let verifier = caps
                .verify_meter
                .as_ref()
                .ok_or_else(|| unavailable(Capability::VerifyMeter))?;
            let credentials = task.credentials()?;
            let meter_no = task.meter_no()?;

            let session = login.verify_login_details(&credentials).await?;
            if !session.success {
                return Ok(json!({ "error": "Login Failed" }));
            }

            let lookup = verifier.verify_meter(&session.cookies, &meter_no).await?;
            if lookup.found {
                Ok(json!({ "status": "found", "data": lookup.data }))
            } else {
                Ok(json!({ "status": "not_found" }))
            }
        }

        TaskType::Unknown(_) => Ok(json!({ "error": "Unknown Task Type" })),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
