//! Progress forwarding from a running capability to the coordinator.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::channels::{OutboundMessage, Outbox};
use crate::logic::{ProgressSink, ProgressUpdate};

/// Forwards a task's progress callbacks as `task_progress` messages.
///
/// With a non-zero `min_interval`, intermediate updates closer together than
/// the interval are dropped. The first and the final update always go out.
pub struct ProgressReporter {
    request_id: String,
    outbox: Outbox,
    min_interval: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl ProgressReporter {
    pub fn new(request_id: impl Into<String>, outbox: Outbox, min_interval: Duration) -> Self {
        Self {
            request_id: request_id.into(),
            outbox,
            min_interval,
            last_sent: Mutex::new(None),
        }
    }

    fn should_forward(&self, update: &ProgressUpdate) -> bool {
        if self.min_interval.is_zero() {
            return true;
        }
        let now = Instant::now();
        let mut last = match self.last_sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let forward = update.is_final()
            || last.is_none_or(|at| now.duration_since(at) >= self.min_interval);
        if forward {
            *last = Some(now);
        }
        forward
    }
}

impl ProgressSink for ProgressReporter {
    fn report(&self, update: ProgressUpdate) {
        if !self.should_forward(&update) {
            return;
        }
        tracing::debug!(
            request_id = %self.request_id,
            current = update.current,
            total = update.total,
            status = %update.status,
            "Task progress"
        );
        self.outbox.send(OutboundMessage::TaskProgress {
            request_id: self.request_id.clone(),
            progress: update,
        });
    }
}
