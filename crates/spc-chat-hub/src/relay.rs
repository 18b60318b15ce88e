use axum::{
    body::Bytes,
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use spc_core::{
    AgentRegistry, ChatMessage, ConnectionRole, ErrorResponse, IngressRequest, IngressResponse,
    KeepaliveResponse, ShutdownResponse, StatusReport, INGRESS_PATH, VIEWER_PATH,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcast::{Viewer, VIEWER_QUEUE_CAPACITY};
use crate::channel::ChannelState;
use crate::supervisor::{LifecycleEvent, SupervisorHandle, SHUTDOWN_GRACE};

const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_FRAME_BYTES: usize = 256 * 1024;
const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct RelayState {
    pub channel: Arc<ChannelState>,
    pub lifecycle: SupervisorHandle,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed ingress payload: {0}")]
    MalformedIngress(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            success: false,
            error: self.to_string(),
        };
        (StatusCode::BAD_REQUEST, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsParams {
    #[serde(default)]
    role: Option<ConnectionRole>,
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(|| async { "ok" }))
        .route(VIEWER_PATH, get(ws_handler))
        .route("/api/agents", get(list_agents))
        .route("/api/messages", get(list_messages))
        .route(INGRESS_PATH, post(post_message))
        .route("/api/status", get(status))
        .route("/api/shutdown", post(shutdown))
        .route("/api/keepalive", post(keepalive))
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn list_agents(State(state): State<RelayState>) -> Json<AgentRegistry> {
    Json(state.channel.registry().clone())
}

async fn list_messages(State(state): State<RelayState>) -> Json<Vec<ChatMessage>> {
    Json(state.channel.history())
}

async fn status(State(state): State<RelayState>) -> Json<StatusReport> {
    Json(state.channel.status())
}

async fn post_message(
    State(state): State<RelayState>,
    body: Bytes,
) -> Result<Json<IngressResponse>, ApiError> {
    let request = parse_ingress(&body)?;
    let stored = state.channel.ingest(&request.text);
    Ok(Json(IngressResponse {
        success: true,
        count: stored.len(),
    }))
}

async fn keepalive(State(state): State<RelayState>) -> Json<KeepaliveResponse> {
    let remaining = state.channel.keepalive();
    debug!(event = "keepalive", remaining = remaining);
    Json(KeepaliveResponse {
        success: true,
        remaining_seconds: remaining,
    })
}

async fn shutdown(State(state): State<RelayState>) -> Json<ShutdownResponse> {
    let lifecycle = state.lifecycle.clone();
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        lifecycle.send(LifecycleEvent::ShutdownRequested).await;
    });
    info!(event = "shutdown_requested");
    Json(ShutdownResponse {
        success: true,
        message: "Shutting down".to_string(),
    })
}

fn parse_ingress(raw: &[u8]) -> Result<IngressRequest, ApiError> {
    serde_json::from_slice(raw).map_err(|err| ApiError::MalformedIngress(err.to_string()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<WsParams>,
    State(state): State<RelayState>,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    if state.lifecycle.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let role = params.role.unwrap_or_default();
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr, role))
}

async fn handle_socket(state: RelayState, socket: WebSocket, remote: SocketAddr, role: ConnectionRole) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(VIEWER_QUEUE_CAPACITY);
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            match tokio::time::timeout(WRITE_TIMEOUT, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                _ => return,
            }
            if closing {
                return;
            }
        }
    });

    let conn_id = state.channel.next_conn_id();
    if role == ConnectionRole::Subscriber {
        let Some(snapshot) = state.channel.connect(Viewer::new(conn_id.clone(), tx.clone())) else {
            info!(event = "viewer_refused", conn_id = %conn_id, remote = %remote);
            drop(tx);
            let _ = write_task.await;
            return;
        };
        info!(
            event = "viewer_connected",
            conn_id = %conn_id,
            remote = %remote,
            history = snapshot.history.len(),
            remaining = snapshot.remaining_seconds
        );
        state.lifecycle.notify(LifecycleEvent::ViewerConnected {
            conn_id: conn_id.clone(),
        });
    } else {
        info!(event = "publisher_connected", conn_id = %conn_id, remote = %remote);
    }

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(value) => value,
            Err(err) => {
                debug!(event = "read_error", conn_id = %conn_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                debug!(event = "client_close", conn_id = %conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if role != ConnectionRole::Publisher {
            debug!(event = "viewer_frame_ignored", conn_id = %conn_id);
            continue;
        }
        if data.len() > MAX_FRAME_BYTES {
            warn!(event = "frame_too_large", conn_id = %conn_id, size = data.len());
            continue;
        }
        match parse_ingress(&data) {
            Ok(request) => {
                let stored = state.channel.ingest(&request.text);
                debug!(event = "publisher_ingest", conn_id = %conn_id, count = stored.len());
            }
            Err(err) => warn!(event = "publisher_frame_invalid", conn_id = %conn_id, error = %err),
        }
    }

    if role == ConnectionRole::Subscriber {
        if state.channel.disconnect(&conn_id) {
            info!(event = "viewer_disconnected", conn_id = %conn_id);
        }
        state.lifecycle.notify(LifecycleEvent::ViewerDisconnected {
            conn_id: conn_id.clone(),
        });
    } else {
        info!(event = "publisher_disconnected", conn_id = %conn_id);
    }
    drop(tx);
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::supervisor::{IdleSupervisor, ShutdownReason};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
    use tower::ServiceExt;

    fn relay_state(config: ChannelConfig) -> (RelayState, IdleSupervisor) {
        let channel = Arc::new(
            ChannelState::new(AgentRegistry::default_team(), config).expect("channel"),
        );
        let (supervisor, lifecycle) = IdleSupervisor::new(channel.clone());
        (RelayState { channel, lifecycle }, supervisor)
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingress_round_trips_through_message_listing() {
        let (state, _sup) = relay_state(ChannelConfig::default());
        let app = router(state.clone());

        let payload = serde_json::json!({
            "text": "thinking...\n📐 Jamie: API contract drafted\n🧑‍💼 Quinn: not on the team"
        });
        let (code, body) = call(app.clone(), "POST", "/api/message", &payload.to_string()).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"success": true, "count": 1}));

        let (code, listed) = call(app, "GET", "/api/messages", "").await;
        assert_eq!(code, StatusCode::OK);
        let stored = &state.channel.history()[0];
        let listed = &listed[0];
        assert_eq!(listed["id"], stored.id.as_str());
        assert_eq!(listed["agent"], "Jamie");
        assert_eq!(listed["emoji"], "📐");
        assert_eq!(listed["role"], "Architect");
        assert_eq!(listed["color"], "#8B5CF6");
        assert_eq!(listed["content"], "API contract drafted");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_ingress_is_a_client_error_and_changes_nothing() {
        let (state, _sup) = relay_state(ChannelConfig::default());
        let app = router(state.clone());

        for body in ["not json", "{}", r#"{"text": 7}"#, ""] {
            let (code, value) = call(app.clone(), "POST", "/api/message", body).await;
            assert_eq!(code, StatusCode::BAD_REQUEST, "body {body:?}");
            assert_eq!(value["success"], false);
            assert!(value["error"].as_str().is_some());
        }
        assert_eq!(state.channel.message_count(), 0);
        assert_eq!(state.channel.viewer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn introspection_endpoints() {
        let (state, _sup) = relay_state(ChannelConfig {
            feature: Some("onboarding".to_string()),
            ..ChannelConfig::default()
        });
        let app = router(state);

        let (code, agents) = call(app.clone(), "GET", "/api/agents", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(agents["Alex"]["role"], "PM");
        assert_eq!(agents["Riley"]["emoji"], "📝");

        let (_, status) = call(app.clone(), "GET", "/api/status", "").await;
        assert_eq!(status["idleTimeoutSeconds"], 1800);
        assert_eq!(status["connectedClients"], 0);
        assert_eq!(status["messageCount"], 0);
        assert_eq!(status["feature"], "onboarding");
        assert!(status["uptime"].as_u64().is_some());

        let (code, keepalive) = call(app, "POST", "/api/keepalive", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(keepalive["success"], true);
        assert_eq!(keepalive["remainingSeconds"], 1800);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_endpoint_acknowledges_then_transitions() {
        let (state, supervisor) = relay_state(ChannelConfig::default());
        tokio::spawn(supervisor.run());
        let app = router(state.clone());

        let (code, body) = call(app, "POST", "/api/shutdown", "").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);

        let reason = tokio::time::timeout(
            Duration::from_secs(2),
            state.lifecycle.wait_for_shutdown(),
        )
        .await
        .expect("shutdown in time");
        assert_eq!(reason, ShutdownReason::ManualShutdown);
    }

    async fn spawn_relay(state: RelayState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = router(state);
        tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await;
        });
        addr
    }

    async fn next_event<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .expect("frame ok");
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).expect("event json");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn viewer_gets_history_then_live_messages_from_a_publisher() {
        let (state, _sup) = relay_state(ChannelConfig::default());
        state.channel.ingest("🧑‍💼 Alex: one\n📐 Jamie: two");
        let addr = spawn_relay(state.clone()).await;

        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer connect");
        let history = next_event(&mut viewer).await;
        assert_eq!(history["type"], "history");
        let items = history["data"].as_array().expect("array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["content"], "one");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");

        let (mut publisher, _) = connect_async(format!("ws://{addr}/ws?role=publisher"))
            .await
            .expect("publisher connect");
        publisher
            .send(WsMessage::Text(r#"{"text":"💻 Sam: three"}"#.to_string()))
            .await
            .expect("publish");

        let live = next_event(&mut viewer).await;
        assert_eq!(live["type"], "message");
        assert_eq!(live["data"]["content"], "three");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");

        assert_eq!(state.channel.viewer_count(), 1);
        assert_eq!(state.channel.message_count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_is_broadcast_before_close() {
        let (state, mut supervisor) = relay_state(ChannelConfig::default());
        let addr = spawn_relay(state.clone()).await;

        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer connect");
        assert_eq!(next_event(&mut viewer).await["type"], "history");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");

        assert!(supervisor.enter_shutdown(ShutdownReason::ManualInterrupt));
        let event = next_event(&mut viewer).await;
        assert_eq!(event["type"], "shutdown");
        assert_eq!(event["data"], "manual-interrupt");

        let closed = tokio::time::timeout(Duration::from_secs(2), viewer.next())
            .await
            .expect("close in time");
        assert!(matches!(closed, Some(Ok(WsMessage::Close(_))) | None | Some(Err(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_publisher_frame_is_dropped_and_socket_stays_usable() {
        let (state, _sup) = relay_state(ChannelConfig::default());
        let addr = spawn_relay(state.clone()).await;

        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("viewer connect");
        assert_eq!(next_event(&mut viewer).await["type"], "history");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");

        let (mut publisher, _) = connect_async(format!("ws://{addr}/ws?role=publisher"))
            .await
            .expect("publisher connect");
        for frame in ["not json", r#"{"text": 7}"#, r#"{"text":"💻 Sam: still here"}"#] {
            publisher
                .send(WsMessage::Text(frame.to_string()))
                .await
                .expect("publisher socket open");
        }

        let live = next_event(&mut viewer).await;
        assert_eq!(live["type"], "message");
        assert_eq!(live["data"]["content"], "still here");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");
        assert!(
            tokio::time::timeout(Duration::from_millis(300), viewer.next())
                .await
                .is_err(),
            "no further events expected"
        );
        assert_eq!(state.channel.message_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscriber_frames_are_not_ingested() {
        let (state, _sup) = relay_state(ChannelConfig::default());
        let addr = spawn_relay(state.clone()).await;

        let (mut viewer, _) = connect_async(format!("ws://{addr}/ws?role=viewer"))
            .await
            .expect("viewer connect");
        assert_eq!(next_event(&mut viewer).await["type"], "history");
        assert_eq!(next_event(&mut viewer).await["type"], "timer_reset");

        viewer
            .send(WsMessage::Text(r#"{"text":"💻 Sam: sneaking in"}"#.to_string()))
            .await
            .expect("viewer socket open");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(state.channel.message_count(), 0);
        assert_eq!(state.channel.viewer_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upgrade_refused_once_shutting_down() {
        let (state, mut supervisor) = relay_state(ChannelConfig::default());
        let addr = spawn_relay(state.clone()).await;
        assert!(supervisor.enter_shutdown(ShutdownReason::ManualShutdown));

        match connect_async(format!("ws://{addr}/ws")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 503);
            }
            Err(other) => panic!("expected http refusal, got {other}"),
            Ok(_) => panic!("upgrade should be refused"),
        }
        assert_eq!(state.channel.viewer_count(), 0);
    }
}
