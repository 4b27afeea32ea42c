//! Main agent loop: wires the channel, version sync and task dispatcher.
//!
//! Inbound events are handled one at a time; tasks are spawned so the loop
//! keeps receiving. Everything outbound goes through a single [`Outbox`]
//! drained by a pump task, which keeps send order stable.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;

use crate::agent::heartbeat::spawn_heartbeat;
use crate::agent::version_sync::VersionSync;
use crate::channels::{Channel, ChannelEvent, InboundMessage, Outbox};
use crate::config::AgentConfig;
use crate::error::Error;
use crate::logic::LogicStore;
use crate::worker::{DispatcherConfig, Task, TaskDispatcher};

/// The worker agent.
pub struct Agent {
    config: AgentConfig,
    channel: Arc<dyn Channel>,
    store: Arc<LogicStore>,
}

impl Agent {
    pub fn new(config: AgentConfig, channel: Arc<dyn Channel>, store: Arc<LogicStore>) -> Self {
        Self {
            config,
            channel,
            store,
        }
    }

    /// Run until Ctrl+C or until the channel's event stream ends.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(ctrl_c()).await
    }

    /// Run until `shutdown` resolves or the channel's event stream ends.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), Error> {
        let mut events = self.channel.start().await?;

        let (outbox, mut outbound_rx) = Outbox::channel();
        let pump_channel = Arc::clone(&self.channel);
        let mut pump_handle = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let event = message.event_name();
                if let Err(e) = pump_channel.send(message).await {
                    tracing::warn!(event, error = %e, "Failed to send message");
                }
            }
        });

        let connected = Arc::new(AtomicBool::new(false));
        let heartbeat_handle = spawn_heartbeat(
            outbox.clone(),
            Arc::clone(&connected),
            self.config.heartbeat_interval,
        );

        let dispatcher = Arc::new(TaskDispatcher::new(
            Arc::clone(&self.store),
            outbox.clone(),
            DispatcherConfig::from(&self.config),
        ));
        let mut sync = VersionSync::new(Arc::clone(&self.store), outbox);

        tracing::info!(
            channel = self.channel.name(),
            coordinator = %self.config.coordinator_url,
            "Agent ready"
        );

        tokio::pin!(shutdown);
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = events.next() => {
                    match event {
                        Some(e) => e,
                        None => {
                            tracing::info!("Channel stream ended, shutting down...");
                            break;
                        }
                    }
                }
            };

            match event {
                ChannelEvent::Connected => {
                    connected.store(true, Ordering::SeqCst);
                    tracing::info!("Connected to coordinator");
                    sync.check_version().await;
                }
                ChannelEvent::Disconnected { reason } => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!(%reason, "Disconnected from coordinator");
                }
                ChannelEvent::Message(message) => {
                    self.handle_message(message, &mut sync, &dispatcher).await;
                }
            }
        }

        tracing::info!("Agent shutting down...");
        heartbeat_handle.abort();
        let _ = heartbeat_handle.await;

        // The pump ends once every outbox handle is gone, which includes the
        // ones held by tasks still running.
        drop(sync);
        drop(dispatcher);
        if tokio::time::timeout(self.config.shutdown_grace, &mut pump_handle)
            .await
            .is_err()
        {
            tracing::warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "In-flight tasks did not finish before shutdown, dropping their results"
            );
            pump_handle.abort();
        }

        self.channel.shutdown().await?;
        Ok(())
    }

    async fn handle_message(
        &self,
        message: InboundMessage,
        sync: &mut VersionSync,
        dispatcher: &Arc<TaskDispatcher>,
    ) {
        match message {
            InboundMessage::UpdateLogicFile { content } => {
                if let Ok(module) = sync.on_update(&content).await {
                    tracing::info!(
                        hash = module.content_hash().unwrap_or_default(),
                        ready = module.is_ready(),
                        "Logic module swapped"
                    );
                }
            }
            InboundMessage::LogicUptodate => sync.on_uptodate(),
            InboundMessage::ExecuteTask(envelope) => {
                dispatcher.spawn(Task::from_envelope(envelope));
            }
        }
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Ctrl+C received");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::sync::{Mutex, mpsc, oneshot};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::channels::{EventStream, OutboundMessage, TaskEnvelope};
    use crate::error::{CapabilityError, ChannelError, LogicError};
    use crate::logic::{
        BatchProcessor, CapabilitySet, Credentials, ModuleCompiler, ProgressSink, compute_hash,
    };

    /// Channel driven by the test: events go in through `events_tx`, sent
    /// messages come out through `sent_rx`.
    struct MockChannel {
        events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
        sent: mpsc::UnboundedSender<OutboundMessage>,
        shut_down: AtomicBool,
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }

        async fn start(&self) -> Result<EventStream, ChannelError> {
            let rx = self.events.lock().await.take().ok_or_else(|| {
                ChannelError::StartupFailed {
                    name: "mock".to_string(),
                    reason: "already started".to_string(),
                }
            })?;
            Ok(Box::pin(UnboundedReceiverStream::new(rx)))
        }

        async fn send(&self, message: OutboundMessage) -> Result<(), ChannelError> {
            let _ = self.sent.send(message);
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), ChannelError> {
            self.shut_down.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountMeters;

    #[async_trait]
    impl BatchProcessor for CountMeters {
        async fn process_batch(
            &self,
            _credentials: &Credentials,
            meters: &[Value],
            _progress: &dyn ProgressSink,
        ) -> Result<Value, CapabilityError> {
            if let Some(ms) = meters.first().and_then(|m| m["delayMs"].as_u64()) {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(json!({ "status": "completed", "total": meters.len() }))
        }
    }

    struct JsonCompiler;

    impl ModuleCompiler for JsonCompiler {
        fn compile(&self, content: &[u8]) -> Result<CapabilitySet, LogicError> {
            serde_json::from_slice::<Value>(content)
                .map_err(|e| LogicError::Compile(e.to_string()))?;
            Ok(CapabilitySet::new().with_process_batch(Arc::new(CountMeters)))
        }
    }

    struct Running {
        events: mpsc::UnboundedSender<ChannelEvent>,
        sent: mpsc::UnboundedReceiver<OutboundMessage>,
        channel: Arc<MockChannel>,
        agent: tokio::task::JoinHandle<Result<(), Error>>,
        _dir: tempfile::TempDir,
    }

    impl Running {
        async fn next_sent(&mut self) -> OutboundMessage {
            tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
                .await
                .expect("message within timeout")
                .expect("channel open")
        }

        /// Next sent message that is not a heartbeat.
        async fn next_non_heartbeat(&mut self) -> OutboundMessage {
            loop {
                let msg = self.next_sent().await;
                if msg != OutboundMessage::Heartbeat {
                    return msg;
                }
            }
        }
    }

    fn start_agent(heartbeat: Duration) -> Running {
        start_agent_until(heartbeat, std::future::pending())
    }

    fn start_agent_until(
        heartbeat: Duration,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(MockChannel {
            events: Mutex::new(Some(events_rx)),
            sent: sent_tx,
            shut_down: AtomicBool::new(false),
        });
        let store = Arc::new(LogicStore::new(
            dir.path().join("logic.json"),
            Arc::new(JsonCompiler),
        ));
        let config = AgentConfig {
            heartbeat_interval: heartbeat,
            ..AgentConfig::default()
        };
        let agent = Agent::new(config, Arc::clone(&channel) as Arc<dyn Channel>, store);

        Running {
            events: events_tx,
            sent: sent_rx,
            channel,
            agent: tokio::spawn(agent.run_until(shutdown)),
            _dir: dir,
        }
    }

    fn execute(request_id: &str, task_type: &str, payload: Value) -> ChannelEvent {
        ChannelEvent::Message(InboundMessage::ExecuteTask(TaskEnvelope {
            request_id: request_id.to_string(),
            task_type: task_type.to_string(),
            payload,
        }))
    }

    #[tokio::test]
    async fn full_sync_and_task_cycle() {
        let mut run = start_agent(Duration::from_secs(3600));
        let logic = r#"{"name":"v1"}"#;

        run.events.send(ChannelEvent::Connected).unwrap();
        assert_eq!(run.next_sent().await, OutboundMessage::CheckVersion(None));

        // Not ready yet: the task is dropped and the version is re-checked.
        run.events.send(execute("r-0", "METER_POST", json!({ "meters": [] }))).unwrap();
        assert_eq!(run.next_sent().await, OutboundMessage::CheckVersion(None));

        run.events
            .send(ChannelEvent::Message(InboundMessage::UpdateLogicFile {
                content: logic.to_string(),
            }))
            .unwrap();
        run.events
            .send(execute("r-1", "METER_POST", json!({ "meters": [{}, {}] })))
            .unwrap();
        assert_eq!(
            run.next_sent().await,
            OutboundMessage::TaskCompleted {
                request_id: "r-1".to_string(),
                result: json!({ "status": "completed", "total": 2 }),
            }
        );

        // Reconnect reports the content that was installed.
        run.events
            .send(ChannelEvent::Disconnected { reason: "test".to_string() })
            .unwrap();
        run.events.send(ChannelEvent::Connected).unwrap();
        assert_eq!(
            run.next_sent().await,
            OutboundMessage::CheckVersion(Some(compute_hash(logic.as_bytes())))
        );

        run.events
            .send(execute("r-2", "REBOOT", Value::Null))
            .unwrap();
        assert_eq!(
            run.next_sent().await,
            OutboundMessage::TaskCompleted {
                request_id: "r-2".to_string(),
                result: json!({ "error": "Unknown Task Type" }),
            }
        );
    }

    #[tokio::test]
    async fn heartbeat_only_while_connected() {
        let mut run = start_agent(Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(run.sent.try_recv().is_err());

        run.events.send(ChannelEvent::Connected).unwrap();
        let (mut saw_check, mut saw_beat) = (false, false);
        while !(saw_check && saw_beat) {
            match run.next_sent().await {
                OutboundMessage::CheckVersion(_) => saw_check = true,
                OutboundMessage::Heartbeat => saw_beat = true,
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn logic_uptodate_sends_nothing() {
        let mut run = start_agent(Duration::from_secs(3600));

        run.events.send(ChannelEvent::Connected).unwrap();
        let _check = run.next_sent().await;
        run.events
            .send(ChannelEvent::Message(InboundMessage::LogicUptodate))
            .unwrap();
        run.events.send(execute("r-9", "METER_POST", json!({}))).unwrap();

        // The only reply is the not-ready re-check for the task.
        assert_eq!(run.next_non_heartbeat().await, OutboundMessage::CheckVersion(None));
        assert!(run.sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_end_shuts_down_channel() {
        let run = start_agent(Duration::from_secs(3600));

        drop(run.events);
        let result = tokio::time::timeout(Duration::from_secs(5), run.agent)
            .await
            .expect("agent stops")
            .unwrap();

        assert!(result.is_ok());
        assert!(run.channel.shut_down.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_results() {
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let mut run = start_agent_until(Duration::from_secs(3600), async {
            let _ = stop_rx.await;
        });

        run.events.send(ChannelEvent::Connected).unwrap();
        let _check = run.next_sent().await;
        run.events
            .send(ChannelEvent::Message(InboundMessage::UpdateLogicFile {
                content: "{}".to_string(),
            }))
            .unwrap();
        run.events
            .send(execute(
                "r-slow",
                "METER_POST",
                json!({ "meters": [{ "delayMs": 200 }] }),
            ))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run.agent)
            .await
            .expect("agent stops")
            .unwrap();
        assert!(result.is_ok());
        assert!(run.channel.shut_down.load(Ordering::SeqCst));

        let mut completed = Vec::new();
        while let Ok(msg) = run.sent.try_recv() {
            if let OutboundMessage::TaskCompleted { request_id, result } = msg {
                completed.push((request_id, result));
            }
        }
        assert_eq!(
            completed,
            vec![(
                "r-slow".to_string(),
                json!({ "status": "completed", "total": 1 })
            )]
        );
    }
}
