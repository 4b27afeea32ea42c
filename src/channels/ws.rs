//! WebSocket channel to the coordinator.
//!
//! One background task owns the socket. It connects with the worker's
//! credentials in the upgrade headers, forwards decoded frames as
//! `ChannelEvent`s, drains the outbound queue into the socket, and reconnects
//! with exponential backoff whenever the connection drops. Outbound messages
//! queued while disconnected are flushed after the next connect.
//!
//! Outbound frames travel in two lanes. Advisory frames (heartbeat, progress)
//! use a bounded queue and are rejected once it is full. Version checks and
//! task results use an unbounded lane and are never dropped. The session
//! drains the advisory lane first so a task's progress precedes its result.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

use crate::channels::protocol::{InboundMessage, OutboundMessage};
use crate::channels::{Channel, ChannelEvent, EventStream};
use crate::error::ChannelError;
use crate::identity::WorkerIdentity;

const CHANNEL_NAME: &str = "ws";
const ADVISORY_QUEUE: usize = 1024;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection settings for [`WsChannel`].
#[derive(Debug, Clone)]
pub struct WsChannelConfig {
    pub url: String,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
}

/// Receiving ends of the outbound lanes, owned by the connection task.
struct OutboundLanes {
    advisory: mpsc::Receiver<String>,
    reliable: mpsc::UnboundedReceiver<String>,
}

impl OutboundLanes {
    /// Next frame already queued, advisory lane first.
    fn try_next(&mut self) -> Option<String> {
        self.advisory
            .try_recv()
            .or_else(|_| self.reliable.try_recv())
            .ok()
    }
}

/// Self-reconnecting WebSocket channel.
pub struct WsChannel {
    config: WsChannelConfig,
    identity: WorkerIdentity,
    advisory_tx: mpsc::Sender<String>,
    reliable_tx: mpsc::UnboundedSender<String>,
    /// Consumed once in `start()`.
    lanes: Mutex<Option<OutboundLanes>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    pub fn new(config: WsChannelConfig, identity: WorkerIdentity) -> Self {
        let (advisory_tx, advisory) = mpsc::channel(ADVISORY_QUEUE);
        let (reliable_tx, reliable) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            identity,
            advisory_tx,
            reliable_tx,
            lanes: Mutex::new(Some(OutboundLanes { advisory, reliable })),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Channel for WsChannel {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn start(&self) -> Result<EventStream, ChannelError> {
        let lanes = self
            .lanes
            .lock()
            .await
            .take()
            .ok_or_else(|| ChannelError::StartupFailed {
                name: CHANNEL_NAME.to_string(),
                reason: "start() already called".to_string(),
            })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Connection {
            config: self.config.clone(),
            identity: self.identity.clone(),
            events_tx,
            lanes,
            shutdown_rx: self.shutdown_tx.subscribe(),
        };
        *self.task.lock().await = Some(tokio::spawn(conn.run()));

        Ok(Box::pin(UnboundedReceiverStream::new(events_rx)))
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), ChannelError> {
        let event = message.event_name();
        let json = serde_json::to_string(&message.to_frame()).map_err(|e| {
            ChannelError::SendFailed {
                name: CHANNEL_NAME.to_string(),
                event: event.to_string(),
                reason: e.to_string(),
            }
        })?;
        let queued = if message.is_advisory() {
            self.advisory_tx.try_send(json).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => "outbound queue full",
                mpsc::error::TrySendError::Closed(_) => "connection task stopped",
            })
        } else {
            self.reliable_tx
                .send(json)
                .map_err(|_| "connection task stopped")
        };
        queued.map_err(|reason| ChannelError::SendFailed {
            name: CHANNEL_NAME.to_string(),
            event: event.to_string(),
            reason: reason.to_string(),
        })
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!(error = %e, "WebSocket connection task ended abnormally");
        }
        Ok(())
    }
}

/// State owned by the background connection task.
struct Connection {
    config: WsChannelConfig,
    identity: WorkerIdentity,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    lanes: OutboundLanes,
    shutdown_rx: watch::Receiver<bool>,
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Dropped(String),
}

impl Connection {
    async fn run(mut self) {
        let mut delay = self.config.reconnect_min;

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }

            match self.connect().await {
                Ok(socket) => {
                    delay = self.config.reconnect_min;
                    info!(url = %self.config.url, machine_id = %self.identity.machine_id(), "Connected to coordinator");
                    if self.events_tx.send(ChannelEvent::Connected).is_err() {
                        break;
                    }

                    let end = self.session(socket).await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Dropped(reason) => {
                            warn!(reason = %reason, "Coordinator connection lost");
                            if self
                                .events_tx
                                .send(ChannelEvent::Disconnected { reason })
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Coordinator connect failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            delay = (delay * 2).min(self.config.reconnect_max);
        }

        debug!("WebSocket connection task stopped");
    }

    async fn connect(&self) -> Result<Socket, ChannelError> {
        let connect_err = |reason: String| ChannelError::ConnectFailed {
            name: CHANNEL_NAME.to_string(),
            reason,
        };

        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!(
                "Bearer {}",
                self.identity.secret_key().expose_secret()
            ))
            .map_err(|e| connect_err(format!("invalid secret key header: {e}")))?,
        );
        headers.insert(
            "x-machine-id",
            HeaderValue::from_str(self.identity.machine_id())
                .map_err(|e| connect_err(format!("invalid machine id header: {e}")))?,
        );

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        Ok(socket)
    }

    async fn session(&mut self, mut socket: Socket) -> SessionEnd {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    self.flush(&mut socket).await;
                    let _ = socket.close(None).await;
                    return SessionEnd::Shutdown;
                }

                Some(json) = self.lanes.advisory.recv() => {
                    if let Err(e) = socket.send(Message::Text(json.into())).await {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                }

                Some(json) = self.lanes.reliable.recv() => {
                    if let Err(e) = socket.send(Message::Text(json.into())).await {
                        return SessionEnd::Dropped(format!("send failed: {e}"));
                    }
                }

                inbound = socket.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => match InboundMessage::parse(&text) {
                            Ok(Some(message)) => {
                                debug!(event = message.event_name(), "Coordinator message");
                                if self.events_tx.send(ChannelEvent::Message(message)).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            Ok(None) => debug!(text = %text.as_str(), "Ignoring unknown coordinator event"),
                            Err(e) => warn!(error = %e, "Invalid frame from coordinator"),
                        },
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                return SessionEnd::Dropped("pong failed".to_string());
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| format!("closed by coordinator: {}", f.reason.as_str()))
                                .unwrap_or_else(|| "closed by coordinator".to_string());
                            return SessionEnd::Dropped(reason);
                        }
                        None => return SessionEnd::Dropped("stream ended".to_string()),
                        Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    /// Send whatever is already queued before closing.
    async fn flush(&mut self, socket: &mut Socket) {
        let mut sent = 0usize;
        while let Some(json) = self.lanes.try_next() {
            if let Err(e) = socket.send(Message::Text(json.into())).await {
                warn!(error = %e, "Failed to flush outbound queue");
                return;
            }
            sent += 1;
        }
        if sent > 0 {
            debug!(sent, "Flushed outbound queue before close");
        }
    }
}
