//! End-to-end tests for the agent over a real WebSocket.
//!
//! Each test spins up an Axum server on a random port that plays both the
//! coordinator (`/agent`) and the meter portal (`/portal/...`), then runs the
//! agent against it with an HTTP logic manifest.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;

use meter_agent::agent::Agent;
use meter_agent::channels::{WsChannel, WsChannelConfig};
use meter_agent::config::AgentConfig;
use meter_agent::error::Error;
use meter_agent::identity::WorkerIdentity;
use meter_agent::logic::{LogicStore, ManifestCompiler, compute_hash};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What the test tells the coordinator side to do next.
enum Command {
    Send(Value),
    /// Drop the current connection.
    Hangup,
}

struct ServerState {
    headers_tx: mpsc::UnboundedSender<HeaderMap>,
    from_agent_tx: mpsc::UnboundedSender<Value>,
    commands: Mutex<mpsc::UnboundedReceiver<Command>>,
}

/// Test-side handle to the fake coordinator.
struct Coordinator {
    port: u16,
    headers: mpsc::UnboundedReceiver<HeaderMap>,
    from_agent: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    fn send(&self, event: &str, data: Value) {
        self.commands
            .send(Command::Send(json!({ "event": event, "data": data })))
            .unwrap();
    }

    fn hangup(&self) {
        self.commands.send(Command::Hangup).unwrap();
    }

    /// Next frame the agent sent.
    async fn recv(&mut self) -> Value {
        self.from_agent.recv().await.expect("server stopped")
    }

    /// Skip frames until one with `event` arrives.
    async fn recv_event(&mut self, event: &str) -> Value {
        loop {
            let frame = self.recv().await;
            if frame["event"] == event {
                return frame;
            }
        }
    }

    fn manifest(&self) -> String {
        json!({
            "name": "test-portal",
            "base_url": format!("http://127.0.0.1:{}/portal", self.port),
            "timeout_secs": 5,
            "capabilities": {
                "verifyLoginDetails": {
                    "method": "POST",
                    "path": "/login",
                    "body": { "user": "{userid}", "pass": "{password}" }
                },
                "processBatch": {
                    "method": "POST",
                    "path": "/meters/{meterNo}/reading",
                    "body": { "reading": "{reading}" }
                },
                "verifyMeter": { "method": "GET", "path": "/meters/{meterNo}" }
            }
        })
        .to_string()
    }
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let _ = state.headers_tx.send(headers);
    ws.on_upgrade(move |socket| coordinator_session(socket, state))
}

async fn coordinator_session(mut socket: WebSocket, state: Arc<ServerState>) {
    let mut commands = state.commands.lock().await;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if socket.send(Message::Text(frame.to_string().into())).await.is_err() {
                        return;
                    }
                }
                Some(Command::Hangup) | None => return,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let frame: Value = serde_json::from_str(text.as_str()).expect("invalid JSON from agent");
                    let _ = state.from_agent_tx.send(frame);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn portal_login(Json(body): Json<Value>) -> impl IntoResponse {
    if body["user"] == "u1" && body["pass"] == "pw" {
        (
            StatusCode::OK,
            [(header::SET_COOKIE, "sid=abc; Path=/; HttpOnly")],
            Json(json!({ "success": true, "account": "A-1" })),
        )
            .into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "message": "Invalid credentials" })),
        )
            .into_response()
    }
}

async fn portal_reading(
    Path(meter_no): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let has_session = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("sid=abc"));
    if !has_session {
        StatusCode::FORBIDDEN
    } else if meter_no.starts_with("M-") && body["reading"].is_string() {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    }
}

async fn portal_meter(Path(meter_no): Path<String>) -> impl IntoResponse {
    if meter_no == "M-1" {
        (StatusCode::OK, Json(json!({ "meterNo": "M-1", "owner": "A-1" }))).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Start an Axum server on a random port.
async fn start_server() -> Coordinator {
    let (headers_tx, headers) = mpsc::unbounded_channel();
    let (from_agent_tx, from_agent) = mpsc::unbounded_channel();
    let (commands, commands_rx) = mpsc::unbounded_channel();
    let state = Arc::new(ServerState {
        headers_tx,
        from_agent_tx,
        commands: Mutex::new(commands_rx),
    });

    let app = Router::new()
        .route("/agent", get(agent_ws))
        .route("/portal/login", post(portal_login))
        .route("/portal/meters/{meter_no}/reading", post(portal_reading))
        .route("/portal/meters/{meter_no}", get(portal_meter))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Coordinator {
        port,
        headers,
        from_agent,
        commands,
    }
}

/// Running agent plus the means to stop it.
struct RunningAgent {
    stop: oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<Result<(), Error>>,
    _dir: tempfile::TempDir,
}

impl RunningAgent {
    async fn stop(self) {
        let _ = self.stop.send(());
        timeout(TEST_TIMEOUT, self.handle)
            .await
            .expect("agent did not stop")
            .unwrap()
            .unwrap();
    }
}

fn start_agent(port: u16) -> RunningAgent {
    let dir = tempfile::tempdir().unwrap();
    let config = AgentConfig {
        coordinator_url: format!("ws://127.0.0.1:{port}/agent"),
        logic_path: dir.path().join("logic.json"),
        identity_path: dir.path().join("identity.json"),
        heartbeat_interval: Duration::from_secs(3600),
        reconnect_min: Duration::from_millis(50),
        reconnect_max: Duration::from_millis(200),
        ..AgentConfig::default()
    };

    let identity = WorkerIdentity::new("worker-test", "s3cret").unwrap();
    let channel = Arc::new(WsChannel::new(
        WsChannelConfig {
            url: config.coordinator_url.clone(),
            reconnect_min: config.reconnect_min,
            reconnect_max: config.reconnect_max,
        },
        identity,
    ));
    let store = Arc::new(LogicStore::new(
        config.logic_path.clone(),
        Arc::new(ManifestCompiler::new()),
    ));

    let (stop, stop_rx) = oneshot::channel::<()>();
    let agent = Agent::new(config, channel, store);
    let handle = tokio::spawn(agent.run_until(async {
        let _ = stop_rx.await;
    }));

    RunningAgent {
        stop,
        handle,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_connect_sends_auth_headers_and_version_check() {
    timeout(TEST_TIMEOUT, async {
        let mut coordinator = start_server().await;
        let agent = start_agent(coordinator.port);

        let headers = coordinator.headers.recv().await.unwrap();
        assert_eq!(headers["authorization"], "Bearer s3cret");
        assert_eq!(headers["x-machine-id"], "worker-test");

        let frame = coordinator.recv().await;
        assert_eq!(frame, json!({ "event": "check_version", "data": null }));

        agent.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_update_then_tasks_against_portal() {
    timeout(TEST_TIMEOUT, async {
        let mut coordinator = start_server().await;
        let agent = start_agent(coordinator.port);
        coordinator.recv_event("check_version").await;

        let manifest = coordinator.manifest();
        coordinator.send("update_logic_file", json!({ "content": manifest }));
        coordinator.send(
            "execute_task",
            json!({
                "requestId": "r-1",
                "taskType": "METER_POST",
                "payload": {
                    "userid": "u1",
                    "password": "pw",
                    "meters": [
                        { "meterNo": "M-1", "reading": "42" },
                        { "meterNo": "M-2", "reading": "7" }
                    ]
                }
            }),
        );

        let mut progress = Vec::new();
        let completed = loop {
            let frame = coordinator.recv().await;
            match frame["event"].as_str() {
                Some("task_progress") => progress.push(frame),
                Some("task_completed") => break frame,
                other => panic!("unexpected event {other:?}"),
            }
        };

        assert_eq!(progress.len(), 3);
        assert!(progress.iter().all(|f| f["data"]["requestId"] == "r-1"));
        assert_eq!(progress[2]["data"]["progress"]["current"], 2);
        assert_eq!(completed["data"]["requestId"], "r-1");
        assert_eq!(
            completed["data"]["result"],
            json!({ "status": "completed", "total": 2, "success": 2, "failed": 0, "errors": [] })
        );

        coordinator.send(
            "execute_task",
            json!({
                "requestId": "r-2",
                "taskType": "SINGLE_CHECK",
                "payload": { "userid": "u1", "password": "pw", "meterNo": "M-9" }
            }),
        );
        let frame = coordinator.recv_event("task_completed").await;
        assert_eq!(
            frame["data"],
            json!({ "requestId": "r-2", "result": { "status": "not_found" } })
        );

        coordinator.send(
            "execute_task",
            json!({
                "requestId": "r-3",
                "taskType": "LOGIN_CHECK",
                "payload": { "userid": "u1", "password": "wrong" }
            }),
        );
        let frame = coordinator.recv_event("task_completed").await;
        assert_eq!(frame["data"]["result"]["success"], false);
        assert_eq!(frame["data"]["result"]["message"], "Invalid credentials");

        agent.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_reconnect_reports_installed_hash() {
    timeout(TEST_TIMEOUT, async {
        let mut coordinator = start_server().await;
        let agent = start_agent(coordinator.port);
        coordinator.recv_event("check_version").await;

        let manifest = coordinator.manifest();
        coordinator.send("update_logic_file", json!({ "content": manifest }));
        // A task round-trip guarantees the update was applied before hanging up.
        coordinator.send(
            "execute_task",
            json!({ "requestId": "r-1", "taskType": "NOPE", "payload": {} }),
        );
        let frame = coordinator.recv_event("task_completed").await;
        assert_eq!(frame["data"]["result"], json!({ "error": "Unknown Task Type" }));

        coordinator.hangup();

        let frame = coordinator.recv_event("check_version").await;
        assert_eq!(frame["data"], json!(compute_hash(manifest.as_bytes())));

        agent.stop().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn test_task_before_logic_requests_version_check() {
    timeout(TEST_TIMEOUT, async {
        let mut coordinator = start_server().await;
        let agent = start_agent(coordinator.port);
        coordinator.recv_event("check_version").await;

        coordinator.send(
            "execute_task",
            json!({ "requestId": "r-1", "taskType": "METER_POST", "payload": { "meters": [] } }),
        );

        let frame = coordinator.recv().await;
        assert_eq!(frame, json!({ "event": "check_version", "data": null }));

        agent.stop().await;
    })
    .await
    .expect("test timed out");
}
