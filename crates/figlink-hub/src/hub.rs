use crate::{
    config::{HubConfig, McpConflictPolicy},
    heartbeat::{spawn_monitor, LivenessClock},
    registry::{CloseReason, ConnectionEntry, ConnectionHandle, ConnectionRegistry},
    routes::{RouteBinding, RouteDecision, RouteResolver},
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use figlink_core::{
    decode_frame, encode_frame,
    wire::{CONNECTED, JOIN, JOINED, PING, PONG},
    ConnectionIdentity, Envelope, Role,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::{io, net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
};
use tracing::{debug, info, warn};

struct HubTables {
    registry: ConnectionRegistry,
    routes: RouteResolver,
}

/// Shared relay state. Registry and route bindings sit behind one lock so
/// admission and cleanup are each a single critical section.
pub struct HubState {
    config: HubConfig,
    tables: Mutex<HubTables>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(HubTables {
                registry: ConnectionRegistry::new(),
                routes: RouteResolver::new(),
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.tables.lock().await.registry.ids()
    }

    pub async fn binding(&self, token: &str) -> Option<RouteBinding> {
        self.tables.lock().await.routes.binding(token).cloned()
    }

    pub async fn channel_of(&self, connection_id: &str) -> Option<String> {
        let tables = self.tables.lock().await;
        tables
            .registry
            .lookup(connection_id)
            .ok()
            .and_then(|entry| entry.channel().map(str::to_string))
    }

    /// Applies the admission policy and registers the connection. The
    /// `connected` greeting is queued before the entry becomes routable so it
    /// is always the first frame the peer sees. Returns the registry serial,
    /// or `None` when the newcomer was turned away.
    async fn admit(
        &self,
        identity: &ConnectionIdentity,
        handle: &ConnectionHandle,
        clock: &LivenessClock,
    ) -> Option<u64> {
        let connection_id = identity.connection_id();
        let role = identity.role();
        let token = identity.token();
        let mut tables = self.tables.lock().await;

        if role == Role::Mcp {
            if let Ok(incumbent) = tables.registry.lookup(&connection_id) {
                let incumbent_serial = incumbent.serial();
                match self.config.mcp_policy {
                    McpConflictPolicy::RejectNewcomer => {
                        warn!(
                            event = "mcp_rejected",
                            connection_id = %connection_id,
                            token = %token
                        );
                        handle.close(CloseReason::Rejected);
                        return None;
                    }
                    McpConflictPolicy::EvictIncumbent => {
                        if let Ok(mut old) =
                            tables.registry.unregister(&connection_id, incumbent_serial)
                        {
                            tables.routes.clear(token, &connection_id);
                            old.shutdown(CloseReason::Evicted);
                            info!(
                                event = "mcp_evicted",
                                connection_id = %connection_id,
                                serial = incumbent_serial
                            );
                        }
                    }
                }
            }
        }

        let greeting = Envelope::new(
            CONNECTED,
            json!({
                "connectionId": connection_id,
                "role": role,
                "token": token,
            }),
        );
        match encode_frame(&greeting, self.config.max_message_bytes) {
            Ok(text) => {
                handle.try_send_text(text);
            }
            Err(err) => warn!(event = "greeting_encode_error", error = %err),
        }

        let serial = tables.registry.next_serial();
        let mut entry = ConnectionEntry::new(identity.clone(), serial, handle.clone(), clock.clone());
        entry.attach_heartbeat(spawn_monitor(
            connection_id.clone(),
            self.config.heartbeat,
            handle.clone(),
            clock.clone(),
        ));

        if let Some(mut displaced) = tables.registry.replace(entry) {
            displaced.shutdown(CloseReason::Replaced);
            info!(
                event = "connection_replaced",
                connection_id = %connection_id,
                serial = displaced.serial()
            );
        }
        if role == Role::Mcp {
            tables.routes.bind_mcp(token, &connection_id);
        }

        info!(
            event = "client_connected",
            connection_id = %connection_id,
            role = %role,
            token = %token,
            serial = serial
        );
        Some(serial)
    }

    /// Unregisters the connection, clears its route slots and stops its
    /// timers. A stale serial leaves a newer connection with the same id alone.
    async fn remove_connection(&self, connection_id: &str, serial: u64, reason: CloseReason) {
        let mut tables = self.tables.lock().await;
        match tables.registry.unregister(connection_id, serial) {
            Ok(mut entry) => {
                tables.routes.clear(entry.token(), connection_id);
                entry.shutdown(reason);
                info!(
                    event = "client_disconnected",
                    connection_id = %connection_id,
                    role = %entry.role(),
                    reason = reason.as_str(),
                    age_ms = entry.age_ms()
                );
            }
            Err(err) => {
                debug!(
                    event = "unregister_skipped",
                    connection_id = %connection_id,
                    reason = reason.as_str(),
                    error = %err
                );
            }
        }
    }

    /// Force-closes every live connection.
    pub async fn close_all(&self, reason: CloseReason) {
        let mut tables = self.tables.lock().await;
        let entries = tables.registry.drain();
        tables.routes = RouteResolver::new();
        let count = entries.len();
        for mut entry in entries {
            entry.shutdown(reason);
        }
        info!(event = "connections_closed", count = count, reason = reason.as_str());
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        identity: ConnectionIdentity,
        remote: SocketAddr,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (handle, mut rx, mut closed) = ConnectionHandle::channel(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) if !is_close => {}
                    _ => return,
                }
            }
        });

        let clock = LivenessClock::new();
        let connection_id = identity.connection_id();
        let Some(serial) = self.admit(&identity, &handle, &clock).await else {
            drop(handle);
            let _ = write_task.await;
            return;
        };
        debug!(event = "handshake_ok", connection_id = %connection_id, remote = %remote);

        let reason = loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        break CloseReason::Shutdown;
                    }
                    if let Some(reason) = *closed.borrow_and_update() {
                        break reason;
                    }
                }
                next = ws_receiver.next() => {
                    let msg = match next {
                        Some(Ok(value)) => value,
                        Some(Err(err)) => {
                            warn!(event = "read_error", connection_id = %connection_id, error = %err);
                            break CloseReason::ReadError;
                        }
                        None => break CloseReason::ClientClosed,
                    };
                    let data = match msg {
                        Message::Text(text) => text.into_bytes(),
                        Message::Binary(bytes) => bytes,
                        Message::Close(_) => {
                            info!(event = "client_close", connection_id = %connection_id);
                            break CloseReason::ClientClosed;
                        }
                        Message::Ping(_) | Message::Pong(_) => {
                            clock.touch();
                            continue;
                        }
                    };
                    self.handle_frame(&identity, &connection_id, serial, &handle, &clock, &data)
                        .await;
                }
            }
        };

        self.remove_connection(&connection_id, serial, reason).await;
        drop(handle);
        let _ = write_task.await;
    }

    async fn handle_frame(
        &self,
        identity: &ConnectionIdentity,
        connection_id: &str,
        serial: u64,
        handle: &ConnectionHandle,
        clock: &LivenessClock,
        data: &[u8],
    ) {
        if data.len() > self.config.max_message_bytes {
            warn!(
                event = "message_too_large",
                connection_id = %connection_id,
                size = data.len()
            );
            return;
        }
        if self.config.debug {
            debug!(
                event = "message_received",
                connection_id = %connection_id,
                raw = %String::from_utf8_lossy(data)
            );
        }
        let envelope = match decode_frame(data, self.config.max_message_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", connection_id = %connection_id, error = %err);
                return;
            }
        };

        match envelope.kind.as_str() {
            PONG => {
                clock.touch();
                return;
            }
            PING => {
                clock.touch();
                self.deliver(handle, connection_id, &Envelope::pong()).await;
                return;
            }
            JOIN => {
                self.handle_join(connection_id, serial, handle, &envelope).await;
                return;
            }
            _ => {}
        }

        let token = identity.token();
        if let Some(target) = envelope.target.as_deref() {
            let recipient = {
                let tables = self.tables.lock().await;
                tables
                    .registry
                    .lookup(target)
                    .ok()
                    .filter(|entry| entry.token() == token && entry.connection_id() != connection_id)
                    .map(|entry| entry.handle().clone())
            };
            match recipient {
                Some(recipient) => {
                    self.deliver(&recipient, target, &envelope.forwarded_from(connection_id))
                        .await;
                }
                None => {
                    debug!(
                        event = "target_miss",
                        connection_id = %connection_id,
                        target = %target,
                        kind = %envelope.kind
                    );
                }
            }
            return;
        }

        if envelope.broadcast {
            let recipients: Vec<(String, ConnectionHandle)> = {
                let tables = self.tables.lock().await;
                tables
                    .registry
                    .ids_for_token(token)
                    .into_iter()
                    .filter(|id| id != connection_id)
                    .filter_map(|id| {
                        let handle = tables.registry.lookup(&id).ok()?.handle().clone();
                        Some((id, handle))
                    })
                    .collect()
            };
            let forwarded = envelope.forwarded_from(connection_id);
            for (id, recipient) in &recipients {
                self.deliver(recipient, id, &forwarded).await;
            }
            debug!(
                event = "broadcast",
                connection_id = %connection_id,
                kind = %envelope.kind,
                recipients = recipients.len()
            );
            return;
        }

        let Some(class) = self.config.routes.classify(&envelope.kind) else {
            debug!(event = "unknown_type", connection_id = %connection_id, kind = %envelope.kind);
            return;
        };

        let recipient = {
            let mut tables = self.tables.lock().await;
            match tables
                .routes
                .route(token, connection_id, identity.role(), class, &envelope.kind)
            {
                Ok(RouteDecision::Forward(target)) => match tables.registry.lookup(&target) {
                    Ok(entry) => Some((target, entry.handle().clone())),
                    Err(err) => {
                        debug!(event = "route_stale", target = %target, error = %err);
                        None
                    }
                },
                Ok(RouteDecision::Recorded) => {
                    debug!(event = "active_recorded", connection_id = %connection_id, token = %token);
                    None
                }
                Ok(RouteDecision::Ignored) => None,
                Err(err) => {
                    debug!(
                        event = "route_miss",
                        connection_id = %connection_id,
                        class = class.as_str(),
                        error = %err
                    );
                    None
                }
            }
        };
        if let Some((target, recipient)) = recipient {
            self.deliver(&recipient, &target, &envelope.forwarded_from(connection_id))
                .await;
        }
    }

    async fn handle_join(
        &self,
        connection_id: &str,
        serial: u64,
        handle: &ConnectionHandle,
        envelope: &Envelope,
    ) {
        let channel = envelope
            .data
            .get("channel")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|channel| !channel.is_empty());
        let Some(channel) = channel else {
            warn!(event = "join_invalid", connection_id = %connection_id);
            let reply = Envelope::error_reply(
                envelope.request_id.clone(),
                "join requires a non-empty data.channel",
            );
            self.deliver(handle, connection_id, &reply).await;
            return;
        };

        let recorded = {
            let mut tables = self.tables.lock().await;
            match tables.registry.lookup_mut(connection_id, serial) {
                Ok(entry) => {
                    entry.set_channel(channel.to_string());
                    true
                }
                Err(_) => false,
            }
        };
        if !recorded {
            return;
        }
        info!(event = "channel_joined", connection_id = %connection_id, channel = %channel);
        let mut reply = Envelope::new(JOINED, json!({ "channel": channel }));
        reply.request_id = envelope.request_id.clone();
        self.deliver(handle, connection_id, &reply).await;
    }

    async fn deliver(&self, recipient: &ConnectionHandle, recipient_id: &str, envelope: &Envelope) {
        let text = match encode_frame(envelope, self.config.max_message_bytes) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "encode_error", recipient = %recipient_id, error = %err);
                return;
            }
        };
        if !recipient.send_text(text, self.config.write_timeout).await {
            warn!(event = "send_error", recipient = %recipient_id, kind = %envelope.kind);
        }
    }
}

pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws/:connection_id", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(connection_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<HubState>>,
) -> impl IntoResponse {
    if !hub.config.allow_remote && !addr.ip().is_loopback() {
        warn!(event = "remote_refused", remote = %addr);
        return StatusCode::FORBIDDEN.into_response();
    }
    let identity = match ConnectionIdentity::parse(&connection_id) {
        Ok(value) => value,
        Err(err) => {
            warn!(event = "invalid_identifier", remote = %addr, error = %err);
            return (StatusCode::BAD_REQUEST, err.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket, identity, addr).await;
    })
}

/// Serves the relay on `listener` until `shutdown` flips to true, then closes
/// every live connection.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<HubState>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let app = router(hub.clone());
    let signal = async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!(event = "hub_shutdown");
        hub.close_all(CloseReason::Shutdown).await;
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(signal)
    .await
}

pub async fn run(config: HubConfig, shutdown: watch::Receiver<bool>) -> io::Result<()> {
    let listener = TcpListener::bind(config.addr).await?;
    let local = listener.local_addr()?;
    info!(
        event = "hub_start",
        addr = %local,
        mcp_policy = config.mcp_policy.as_str(),
        heartbeat = config.heartbeat.is_enabled()
    );
    serve(listener, Arc::new(HubState::new(config)), shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heartbeat::HeartbeatConfig;
    use std::time::Duration;
    use tokio::{net::TcpStream, task::JoinHandle};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{self, Message as WsMessage},
        MaybeTlsStream, WebSocketStream,
    };

    type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

    struct TestHub {
        addr: SocketAddr,
        hub: Arc<HubState>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<io::Result<()>>,
    }

    impl TestHub {
        async fn stop(self) {
            let _ = self.shutdown.send(true);
            let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
        }
    }

    async fn launch_hub(config: HubConfig) -> TestHub {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let hub = Arc::new(HubState::new(config));
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(serve(listener, hub.clone(), rx));
        TestHub {
            addr,
            hub,
            shutdown,
            task,
        }
    }

    async fn dial(addr: SocketAddr, id: &str) -> Ws {
        let (mut ws, _) = connect_async(format!("ws://{addr}/ws/{id}"))
            .await
            .expect("connect");
        let greeting = recv(&mut ws).await.expect("connected frame");
        assert_eq!(greeting.kind, CONNECTED);
        assert_eq!(greeting.data["connectionId"], id);
        ws
    }

    async fn send(ws: &mut Ws, value: Value) {
        ws.send(WsMessage::Text(value.to_string()))
            .await
            .expect("send");
    }

    /// Next application envelope, skipping heartbeat traffic. `None` on
    /// close or when nothing arrives within a second.
    async fn recv(ws: &mut Ws) -> Option<Envelope> {
        recv_within(ws, Duration::from_secs(1)).await
    }

    async fn recv_within(ws: &mut Ws, wait: Duration) -> Option<Envelope> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = tokio::time::timeout_at(deadline, ws.next()).await.ok()??;
            match next.ok()? {
                WsMessage::Text(text) => {
                    let envelope: Envelope = serde_json::from_str(&text).expect("envelope");
                    if envelope.is_heartbeat() {
                        continue;
                    }
                    return Some(envelope);
                }
                WsMessage::Close(_) => return None,
                _ => continue,
            }
        }
    }

    async fn wait_until_closed(ws: &mut Ws) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pull_is_forwarded_to_the_last_announcer() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;
        let mut mcp = dial(hub.addr, "mcp_abc").await;

        send(&mut plugin, json!({"type": "state", "data": {"sel": "X"}})).await;
        assert!(
            eventually(|| async {
                hub.hub
                    .binding("abc")
                    .await
                    .and_then(|binding| binding.last_active)
                    .as_deref()
                    == Some("plugin_abc_device_1")
            })
            .await
        );

        send(&mut mcp, json!({"type": "pull", "requestId": "r1", "timestamp": 1})).await;
        let pulled = recv(&mut plugin).await.expect("pull forwarded");
        assert_eq!(pulled.kind, "pull");
        assert_eq!(pulled.request_id.as_deref(), Some("r1"));
        assert_eq!(pulled.sender.as_deref(), Some("mcp_abc"));
        assert!(pulled.forwarded);

        send(
            &mut plugin,
            json!({"type": "pull_response", "requestId": "r1", "data": {"nodes": []}}),
        )
        .await;
        let answer = recv(&mut mcp).await.expect("response forwarded");
        assert_eq!(answer.kind, "pull_response");
        assert_eq!(answer.request_id.as_deref(), Some("r1"));
        assert_eq!(answer.sender.as_deref(), Some("plugin_abc_device_1"));
        assert_eq!(answer.data, json!({"nodes": []}));

        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn push_without_a_plugin_is_dropped_and_hub_stays_responsive() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut mcp = dial(hub.addr, "mcp_abc").await;
        send(&mut mcp, json!({"type": "pull", "requestId": "r2"})).await;
        send(&mut mcp, json!({"type": "push", "data": {"x": 1}})).await;
        send(&mut mcp, json!({"type": "ping"})).await;

        let pong = tokio::time::timeout(Duration::from_secs(1), mcp.next())
            .await
            .expect("pong in time")
            .expect("open")
            .expect("frame");
        match pong {
            WsMessage::Text(text) => assert!(text.contains("\"type\":\"pong\"")),
            other => panic!("expected pong, got {other:?}"),
        }

        let body = get_health(hub.addr).await;
        assert!(body.ends_with("ok"), "health body: {body}");
        hub.stop().await;
    }

    async fn get_health(addr: SocketAddr) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = TcpStream::connect(addr).await.expect("tcp");
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .expect("write");
        let mut body = String::new();
        stream.read_to_string(&mut body).await.expect("read");
        body
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_identifier_is_refused_before_upgrade() {
        let hub = launch_hub(HubConfig::default()).await;
        for id in ["mcp_", "plugin_abc", "plugin_abc_device_x"] {
            let err = connect_async(format!("ws://{}/ws/{id}", hub.addr))
                .await
                .expect_err("refused");
            match err {
                tungstenite::Error::Http(response) => {
                    assert_eq!(response.status(), 400, "id {id}")
                }
                other => panic!("unexpected error for {id}: {other:?}"),
            }
        }
        assert!(hub.hub.connection_ids().await.is_empty());
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_mcp_evicts_the_incumbent_by_default() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut first = dial(hub.addr, "mcp_abc").await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;
        let mut second = dial(hub.addr, "mcp_abc").await;

        assert!(wait_until_closed(&mut first).await, "incumbent closed");
        assert_eq!(
            hub.hub.connection_ids().await,
            vec!["mcp_abc".to_string(), "plugin_abc_device_1".to_string()]
        );

        send(&mut plugin, json!({"type": "result", "requestId": "r5"})).await;
        let result = recv(&mut second).await.expect("newcomer owns the binding");
        assert_eq!(result.request_id.as_deref(), Some("r5"));
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reject_policy_keeps_the_incumbent() {
        let config = HubConfig {
            mcp_policy: McpConflictPolicy::RejectNewcomer,
            ..HubConfig::default()
        };
        let hub = launch_hub(config).await;
        let mut first = dial(hub.addr, "mcp_abc").await;
        let (mut second, _) = connect_async(format!("ws://{}/ws/mcp_abc", hub.addr))
            .await
            .expect("upgrade");
        assert!(wait_until_closed(&mut second).await, "newcomer closed");

        send(&mut first, json!({"type": "ping"})).await;
        let reply = tokio::time::timeout(Duration::from_secs(1), first.next())
            .await
            .expect("incumbent alive")
            .expect("open")
            .expect("frame");
        assert!(matches!(reply, WsMessage::Text(text) if text.contains("pong")));
        assert_eq!(hub.hub.connection_ids().await, vec!["mcp_abc".to_string()]);
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_mcp_dials_leave_one_live_connection() {
        let hub = launch_hub(HubConfig::default()).await;
        let url = format!("ws://{}/ws/mcp_race", hub.addr);
        let (a, b) = tokio::join!(connect_async(url.clone()), connect_async(url));
        let (mut a, _) = a.expect("a");
        let (mut b, _) = b.expect("b");

        let (a_closed, b_closed) = tokio::join!(wait_until_closed(&mut a), wait_until_closed(&mut b));
        assert!(a_closed ^ b_closed, "exactly one dial survives");
        assert_eq!(hub.hub.connection_ids().await, vec!["mcp_race".to_string()]);
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_timeout_closes_silent_peer_and_clears_its_binding() {
        let config = HubConfig {
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_millis(100),
                pong_timeout: Duration::from_millis(300),
                check_interval: Duration::from_millis(20),
            },
            ..HubConfig::default()
        };
        let hub = launch_hub(config).await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;
        send(&mut plugin, json!({"type": "selection_changed"})).await;
        assert!(eventually(|| async { hub.hub.binding("abc").await.is_some() }).await);

        // Pings are read but never answered.
        assert!(wait_until_closed(&mut plugin).await);
        assert!(eventually(|| async { hub.hub.binding("abc").await.is_none() }).await);
        assert!(hub.hub.connection_ids().await.is_empty());
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn answering_pings_keeps_a_peer_registered() {
        let config = HubConfig {
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_millis(50),
                pong_timeout: Duration::from_millis(200),
                check_interval: Duration::from_millis(10),
            },
            ..HubConfig::default()
        };
        let hub = launch_hub(config).await;
        let mut web = dial(hub.addr, "web-1").await;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(700);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, web.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) if text.contains("\"ping\"") => {
                    send(&mut web, json!({"type": "pong"})).await;
                }
                Ok(Some(Ok(_))) => {}
                Ok(_) => panic!("connection dropped"),
                Err(_) => break,
            }
        }
        assert_eq!(hub.hub.connection_ids().await, vec!["web-1".to_string()]);
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pull_after_plugin_left_is_dropped() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut mcp = dial(hub.addr, "mcp_abc").await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;
        send(&mut plugin, json!({"type": "state"})).await;
        assert!(eventually(|| async {
            hub.hub
                .binding("abc")
                .await
                .is_some_and(|binding| binding.last_active.is_some())
        })
        .await);

        plugin.close(None).await.expect("close");
        assert!(eventually(|| async {
            hub.hub
                .binding("abc")
                .await
                .is_some_and(|binding| binding.last_active.is_none())
        })
        .await);

        send(&mut mcp, json!({"type": "pull", "requestId": "r1"})).await;
        send(&mut mcp, json!({"type": "ping"})).await;
        let next = tokio::time::timeout(Duration::from_secs(1), mcp.next())
            .await
            .expect("hub alive")
            .expect("open")
            .expect("frame");
        assert!(matches!(next, WsMessage::Text(text) if text.contains("pong")));
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_and_oversized_frames_keep_the_connection_open() {
        let config = HubConfig {
            max_message_bytes: 256,
            ..HubConfig::default()
        };
        let hub = launch_hub(config).await;
        let mut web = dial(hub.addr, "web-1").await;
        web.send(WsMessage::Text("{not json".into())).await.expect("send");
        web.send(WsMessage::Text(r#"{"data":1}"#.into())).await.expect("send");
        web.send(WsMessage::Text(format!(
            r#"{{"type":"push","data":"{}"}}"#,
            "x".repeat(512)
        )))
        .await
        .expect("send");
        send(&mut web, json!({"type": "ping"})).await;

        let reply = tokio::time::timeout(Duration::from_secs(1), web.next())
            .await
            .expect("still served")
            .expect("open")
            .expect("frame");
        assert!(matches!(reply, WsMessage::Text(text) if text.contains("pong")));
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn join_is_acknowledged_and_recorded() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;

        send(&mut plugin, json!({"type": "join", "requestId": "j0", "data": {}})).await;
        let refused = recv(&mut plugin).await.expect("error reply");
        assert_eq!(refused.request_id.as_deref(), Some("j0"));
        assert!(refused.error.is_some());

        send(
            &mut plugin,
            json!({"type": "join", "requestId": "j1", "data": {"channel": "design"}}),
        )
        .await;
        let joined = recv(&mut plugin).await.expect("joined");
        assert_eq!(joined.kind, JOINED);
        assert_eq!(joined.request_id.as_deref(), Some("j1"));
        assert_eq!(joined.data["channel"], "design");
        assert_eq!(
            hub.hub.channel_of("plugin_abc_device_1").await.as_deref(),
            Some("design")
        );
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn directed_hand_off_stays_within_the_token() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut mcp = dial(hub.addr, "mcp_abc").await;
        let mut same = dial(hub.addr, "plugin_abc_device_1").await;
        let mut other = dial(hub.addr, "plugin_xyz_device_1").await;

        send(
            &mut mcp,
            json!({"type": "custom", "target": "plugin_xyz_device_1", "requestId": "t0"}),
        )
        .await;
        send(
            &mut mcp,
            json!({"type": "custom", "target": "plugin_abc_device_1", "requestId": "t1"}),
        )
        .await;

        let handed = recv(&mut same).await.expect("same-token target");
        assert_eq!(handed.request_id.as_deref(), Some("t1"));
        assert_eq!(handed.target.as_deref(), Some("plugin_abc_device_1"));
        assert_eq!(handed.sender.as_deref(), Some("mcp_abc"));
        assert!(recv_within(&mut other, Duration::from_millis(300)).await.is_none());
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_reaches_every_other_peer_of_the_token() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut mcp = dial(hub.addr, "mcp_abc").await;
        let mut plugin = dial(hub.addr, "plugin_abc_device_1").await;
        let mut web = dial(hub.addr, "abc").await;
        let mut stranger = dial(hub.addr, "plugin_xyz_device_2").await;

        send(
            &mut plugin,
            json!({"type": "document_saved", "broadcast": true, "data": {"rev": 3}}),
        )
        .await;

        for peer in [&mut mcp, &mut web] {
            let got = recv(peer).await.expect("broadcast delivered");
            assert_eq!(got.kind, "document_saved");
            assert_eq!(got.sender.as_deref(), Some("plugin_abc_device_1"));
            assert_eq!(got.data["rev"], 3);
        }
        assert!(recv_within(&mut plugin, Duration::from_millis(300)).await.is_none());
        assert!(recv_within(&mut stranger, Duration::from_millis(300)).await.is_none());
        hub.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_closes_live_connections() {
        let hub = launch_hub(HubConfig::default()).await;
        let mut web = dial(hub.addr, "web-1").await;
        let state = hub.hub.clone();
        hub.stop().await;
        assert!(wait_until_closed(&mut web).await);
        assert!(state.connection_ids().await.is_empty());
    }
}
