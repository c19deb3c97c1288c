//! Persistent duplex client for the reasoning gateway.
//!
//! [`GatewayConnection`] is a cheap handle; all connection state lives in a
//! single owner task that holds the socket, the table of pending requests
//! and the active chat run. Callers talk to it through a command channel and
//! hear back through one-shot replies and a broadcast of [`GatewayUpdate`]s.
//!
//! The connection is opened lazily by the first request. The handshake
//! waits for a `connect.challenge` event, answers with a `connect` request,
//! and completes only when the response carries a `snapshot`. After that a
//! WebSocket ping goes out on every heartbeat interval.
//!
//! On transport failure every pending request fails at once. A session
//! that had completed its handshake reconnects after the base delay with a
//! fresh backoff; a failing connect backs off exponentially until the
//! circuit breaker opens (see [`backoff`]).

pub mod backoff;
pub mod circuit_breaker;
pub mod protocol;
mod run;

use crate::config::GatewayConfig;
use crate::error::{Result, TalkError};
use async_trait::async_trait;
use backoff::{ReconnectPolicy, RetryDecision};
use futures_util::{SinkExt, StreamExt};
use protocol::{ChatEvent, ChatSendAck, ClientInfo, ConnectParams, Frame, event, method};
use run::RunTracker;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection state, for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting `delay` before retry number `attempt`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Too many failures; no attempt for `retry_in`.
    CircuitOpen { retry_in: Duration },
}

/// Something the gateway wants the conversation layer to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayUpdate {
    /// Full response text so far for `run`. Replaces any earlier delta.
    Delta { run: String, text: String },
    /// The response for `run` is complete.
    Final { run: String, text: String },
    Failed { run: String, message: String },
    Aborted { run: String },
    Status(ConnectionStatus),
}

/// The chat operations the conversation layer needs from a reasoning backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Send a user message as run `run_key` and wait for the acknowledgement
    /// (not the reply, which streams as [`GatewayUpdate`]s).
    async fn send_message(&self, text: &str, run_key: &str) -> Result<()>;

    /// Best-effort cancellation of `run_key`. Later events for it are dropped.
    async fn abort(&self, run_key: &str);

    fn subscribe(&self) -> broadcast::Receiver<GatewayUpdate>;

    /// Close the connection without reconnecting.
    async fn shutdown(&self);
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<()>>,
    },
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    ChatSend {
        key: String,
        message: String,
        reply: oneshot::Sender<Result<Value>>,
    },
    Abort {
        key: String,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the gateway owner task.
#[derive(Clone)]
pub struct GatewayConnection {
    commands: mpsc::Sender<Command>,
    updates: broadcast::Sender<GatewayUpdate>,
    status: watch::Receiver<ConnectionStatus>,
}

impl GatewayConnection {
    /// Spawn the owner task. No connection is made until it is needed.
    pub fn spawn(config: GatewayConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (updates_tx, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        let owner = Owner::new(config, cmd_rx, updates_tx.clone(), status_tx);
        tokio::spawn(owner.run());
        Self {
            commands: cmd_tx,
            updates: updates_tx,
            status: status_rx,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayUpdate> {
        self.updates.subscribe()
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| TalkError::Channel("gateway task stopped".into()))?;
        rx.await
            .map_err(|_| TalkError::Channel("gateway task dropped request".into()))?
    }

    /// Open the connection now and wait for the handshake.
    ///
    /// # Errors
    ///
    /// Returns the connect failure, or [`TalkError::Transport`] while the
    /// circuit is open.
    pub async fn connect(&self) -> Result<()> {
        self.call(|reply| Command::Connect { reply }).await
    }

    /// Send a request and wait for its response payload.
    ///
    /// # Errors
    ///
    /// Fails with [`TalkError::Protocol`] if the gateway rejects the request,
    /// [`TalkError::Transport`] if the connection drops first and
    /// [`TalkError::Timeout`] if no response arrives in time.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let method = method.to_owned();
        self.call(|reply| Command::Request {
            method,
            params,
            reply,
        })
        .await
    }

    /// Send `message` as a new chat run keyed by `idempotency_key`.
    ///
    /// Resolves on the acknowledgement; the reply streams as updates.
    ///
    /// # Errors
    ///
    /// Same as [`request`](Self::request).
    pub async fn send_chat(&self, message: &str, idempotency_key: &str) -> Result<ChatSendAck> {
        let key = idempotency_key.to_owned();
        let message = message.to_owned();
        let payload = self
            .call(|reply| Command::ChatSend {
                key,
                message,
                reply,
            })
            .await?;
        Ok(serde_json::from_value(payload).unwrap_or_default())
    }

    /// Stop following `key` and ask the gateway to abort it.
    pub async fn abort_chat(&self, key: &str) {
        let _ = self
            .commands
            .send(Command::Abort {
                key: key.to_owned(),
            })
            .await;
    }

    /// Close the connection and stop reconnecting until the next request.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[async_trait]
impl ChatBackend for GatewayConnection {
    async fn send_message(&self, text: &str, run_key: &str) -> Result<()> {
        self.send_chat(text, run_key).await.map(|_| ())
    }

    async fn abort(&self, run_key: &str) {
        self.abort_chat(run_key).await;
    }

    fn subscribe(&self) -> broadcast::Receiver<GatewayUpdate> {
        GatewayConnection::subscribe(self)
    }

    async fn shutdown(&self) {
        self.disconnect().await;
    }
}

/// A request waiting for the connection to come up.
struct Outgoing {
    id: String,
    frame: Frame,
    pending: Pending,
}

/// A request sent and awaiting its response.
struct Pending {
    reply: oneshot::Sender<Result<Value>>,
    deadline: Instant,
    run_key: Option<String>,
}

enum HandshakeEnd {
    Ready(WsStream),
    Failed(TalkError),
    Disconnected,
    Closed,
}

enum SessionEnd {
    Lost(String),
    Disconnected,
    Closed,
}

struct Owner {
    config: GatewayConfig,
    commands: mpsc::Receiver<Command>,
    updates: broadcast::Sender<GatewayUpdate>,
    status: watch::Sender<ConnectionStatus>,
    policy: ReconnectPolicy,
    queued: Vec<Outgoing>,
    pending: HashMap<String, Pending>,
    connect_waiters: Vec<oneshot::Sender<Result<()>>>,
    run: RunTracker,
    retry_at: Option<Instant>,
}

impl Owner {
    fn new(
        config: GatewayConfig,
        commands: mpsc::Receiver<Command>,
        updates: broadcast::Sender<GatewayUpdate>,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            policy: ReconnectPolicy::new(&config.reconnect),
            run: RunTracker::new(config.session_key.clone()),
            config,
            commands,
            updates,
            status,
            queued: Vec::new(),
            pending: HashMap::new(),
            connect_waiters: Vec::new(),
            retry_at: None,
        }
    }

    async fn run(mut self) {
        loop {
            if !self.wait_for_attempt().await {
                return;
            }
            match self.handshake().await {
                HandshakeEnd::Closed => return,
                HandshakeEnd::Disconnected => {}
                HandshakeEnd::Failed(e) => self.on_connect_failure(e),
                HandshakeEnd::Ready(ws) => {
                    info!(url = %self.config.url, "gateway connected");
                    self.policy.on_connected();
                    self.retry_at = None;
                    self.set_status(ConnectionStatus::Connected);
                    for waiter in self.connect_waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                    match self.serve(ws).await {
                        SessionEnd::Closed => return,
                        SessionEnd::Disconnected => {}
                        SessionEnd::Lost(reason) => self.on_session_lost(&reason),
                    }
                }
            }
        }
    }

    fn now_std() -> std::time::Instant {
        Instant::now().into_std()
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        let changed = self.status.send_if_modified(|s| {
            if *s == status {
                false
            } else {
                *s = status;
                true
            }
        });
        if changed {
            debug!(?status, "gateway status");
            let _ = self.updates.send(GatewayUpdate::Status(status));
        }
    }

    fn publish(&self, updates: Vec<GatewayUpdate>) {
        for update in updates {
            let _ = self.updates.send(update);
        }
    }

    /// Wait until a connection attempt is due. Returns `false` once every
    /// handle is gone.
    async fn wait_for_attempt(&mut self) -> bool {
        loop {
            let wanted = self.retry_at.is_some()
                || !self.queued.is_empty()
                || !self.connect_waiters.is_empty();
            if wanted && self.retry_at.is_none_or(|at| at <= Instant::now()) {
                if self.policy.should_attempt(Self::now_std()) {
                    return true;
                }
                // Half-open probe already taken; wait out a fresh cool-down.
                self.retry_at =
                    Some(Instant::now() + Duration::from_secs(self.config.reconnect.cooldown_secs));
            }

            let retry_at = self.retry_at;
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    None => {
                        self.fail_all(|| TalkError::Transport("gateway client dropped".into()));
                        return false;
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.go_offline();
                        let _ = reply.send(());
                    }
                    Some(cmd) => self.accept_offline(cmd),
                },
                () = sleep_until_opt(retry_at) => {}
                () = sleep_until_opt(deadline) => self.expire(Instant::now()),
            }
        }
    }

    /// Accept a command while there is no connection.
    fn accept_offline(&mut self, cmd: Command) {
        let open_for = self.circuit_remaining();
        match cmd {
            Command::Connect { reply } => match open_for {
                Some(left) => {
                    let _ = reply.send(Err(circuit_open_error(left)));
                }
                None => self.connect_waiters.push(reply),
            },
            Command::Request { .. } | Command::ChatSend { .. } => {
                if let Some(outgoing) = self.prepare(cmd) {
                    match open_for {
                        Some(left) => {
                            if let Some(key) = &outgoing.pending.run_key {
                                let _ = self.run.end(key);
                            }
                            let _ = outgoing.pending.reply.send(Err(circuit_open_error(left)));
                        }
                        None => self.queued.push(outgoing),
                    }
                }
            }
            Command::Abort { key } => {
                let _ = self.run.end(&key);
            }
            Command::Disconnect { reply } => {
                self.go_offline();
                let _ = reply.send(());
            }
        }
    }

    fn circuit_remaining(&self) -> Option<Duration> {
        let status = *self.status.borrow();
        match status {
            ConnectionStatus::CircuitOpen { .. } => self
                .retry_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            _ => None,
        }
    }

    /// Turn a request command into a frame plus its pending entry.
    fn prepare(&mut self, cmd: Command) -> Option<Outgoing> {
        let deadline = Instant::now() + Duration::from_millis(self.config.request_timeout_ms);
        let (method, params, reply, run_key) = match cmd {
            Command::Request {
                method,
                params,
                reply,
            } => (method, params, reply, None),
            Command::ChatSend {
                key,
                message,
                reply,
            } => {
                self.run.begin(&key);
                let params = serde_json::to_value(protocol::ChatSendParams {
                    session_key: self.config.session_key.clone(),
                    message,
                    deliver: false,
                    idempotency_key: key.clone(),
                })
                .unwrap_or(Value::Null);
                (method::CHAT_SEND.to_owned(), params, reply, Some(key))
            }
            _ => return None,
        };
        let (id, frame) = Frame::request(&method, params);
        Some(Outgoing {
            id,
            frame,
            pending: Pending {
                reply,
                deadline,
                run_key,
            },
        })
    }

    async fn handshake(&mut self) -> HandshakeEnd {
        self.set_status(ConnectionStatus::Connecting);
        let attempt = open_session(self.config.clone());
        tokio::pin!(attempt);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                res = &mut attempt => {
                    return match res {
                        Ok(ws) => HandshakeEnd::Ready(ws),
                        Err(e) => HandshakeEnd::Failed(e),
                    };
                }
                cmd = self.commands.recv() => match cmd {
                    None => {
                        self.fail_all(|| TalkError::Transport("gateway client dropped".into()));
                        return HandshakeEnd::Closed;
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.go_offline();
                        let _ = reply.send(());
                        return HandshakeEnd::Disconnected;
                    }
                    Some(cmd) => self.accept_offline(cmd),
                },
                () = sleep_until_opt(deadline) => self.expire(Instant::now()),
            }
        }
    }

    async fn serve(&mut self, ws: WsStream) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        for outgoing in std::mem::take(&mut self.queued) {
            let json = outgoing.frame.to_json();
            self.pending.insert(outgoing.id, outgoing.pending);
            if let Err(e) = write.send(Message::Text(json)).await {
                return SessionEnd::Lost(format!("send error: {e}"));
            }
        }

        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("connection closed by gateway".into());
                    }
                    Some(Err(e)) => return SessionEnd::Lost(format!("read error: {e}")),
                    // Binary frames are not part of the protocol; pongs need no handling.
                    Some(Ok(_)) => {}
                },
                cmd = self.commands.recv() => {
                    let frame = match cmd {
                        None => {
                            let _ = write.send(Message::Close(None)).await;
                            self.fail_all(|| TalkError::Transport("gateway client dropped".into()));
                            return SessionEnd::Closed;
                        }
                        Some(Command::Disconnect { reply }) => {
                            let _ = write.send(Message::Close(None)).await;
                            info!("gateway disconnected");
                            self.go_offline();
                            let _ = reply.send(());
                            return SessionEnd::Disconnected;
                        }
                        Some(Command::Connect { reply }) => {
                            let _ = reply.send(Ok(()));
                            None
                        }
                        Some(Command::Abort { key }) => self.abort_frame(&key),
                        Some(cmd) => self.prepare(cmd).map(|outgoing| {
                            let json = outgoing.frame.to_json();
                            self.pending.insert(outgoing.id, outgoing.pending);
                            json
                        }),
                    };
                    if let Some(json) = frame
                        && let Err(e) = write.send(Message::Text(json)).await
                    {
                        return SessionEnd::Lost(format!("send error: {e}"));
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Lost(format!("heartbeat error: {e}"));
                    }
                }
                () = sleep_until_opt(deadline) => self.expire(Instant::now()),
            }
        }
    }

    fn abort_frame(&mut self, key: &str) -> Option<String> {
        let run_id = self.run.end(key)?;
        debug!(run_id = %run_id, "aborting chat run");
        let params = serde_json::to_value(protocol::ChatAbortParams {
            session_key: self.config.session_key.clone(),
            run_id: Some(run_id),
        })
        .unwrap_or(Value::Null);
        let (id, frame) = Frame::request(method::CHAT_ABORT, params);
        // Nobody waits on the reply; the entry only keeps the response from
        // being logged as unmatched.
        let (reply, _) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                reply,
                deadline: Instant::now() + Duration::from_millis(self.config.request_timeout_ms),
                run_key: None,
            },
        );
        Some(frame.to_json())
    }

    fn handle_text(&mut self, text: &str) {
        let Some(frame) = Frame::parse(text) else {
            if let Some(id) = Frame::malformed_response_id(text)
                && let Some(pending) = self.pending.remove(&id)
            {
                warn!(id = %id, "malformed response, failing request");
                self.fail_pending(
                    pending,
                    TalkError::Protocol(format!("malformed response to request {id}")),
                );
                return;
            }
            warn!("ignoring malformed gateway frame");
            return;
        };
        match frame {
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } => {
                let Some(pending) = self.pending.remove(&id) else {
                    warn!(id = %id, "response for unknown request id");
                    return;
                };
                if ok {
                    let payload = payload.unwrap_or(Value::Null);
                    if let Some(key) = &pending.run_key {
                        let ack: ChatSendAck =
                            serde_json::from_value(payload.clone()).unwrap_or_default();
                        self.run.acknowledge(key, ack.run_id);
                    }
                    let _ = pending.reply.send(Ok(payload));
                } else {
                    let message = protocol::error_message(error.as_ref());
                    warn!(id = %id, "gateway rejected request: {message}");
                    if let Some(key) = &pending.run_key {
                        let _ = self.run.end(key);
                    }
                    let _ = pending.reply.send(Err(TalkError::Protocol(message)));
                }
            }
            Frame::Event { event, payload, .. } => match event.as_str() {
                event::CHAT => match serde_json::from_value::<ChatEvent>(payload) {
                    Ok(chat) => {
                        let updates = self.run.apply(chat);
                        self.publish(updates);
                    }
                    Err(e) => warn!("malformed chat event: {e}"),
                },
                event::TICK => {}
                other => debug!(event = other, "ignoring gateway event"),
            },
            Frame::Req { method, .. } => debug!(method = %method, "ignoring gateway request"),
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.deadline)
            .chain(self.queued.iter().map(|o| o.pending.deadline))
            .min()
    }

    fn expire(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                self.fail_pending(p, TalkError::Timeout("no response from gateway".into()));
            }
        }
        let (expired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.queued)
            .into_iter()
            .partition(|o| o.pending.deadline <= now);
        self.queued = kept;
        for o in expired {
            self.fail_pending(
                o.pending,
                TalkError::Timeout("gateway connection not established".into()),
            );
        }
    }

    fn fail_pending(&mut self, pending: Pending, error: TalkError) {
        if let Some(key) = &pending.run_key {
            let _ = self.run.end(key);
        }
        let _ = pending.reply.send(Err(error));
    }

    /// Fail every pending and queued request and every connect waiter.
    fn fail_all(&mut self, error: impl Fn() -> TalkError) {
        let pending: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        let queued: Vec<Pending> = self.queued.drain(..).map(|o| o.pending).collect();
        for p in pending.into_iter().chain(queued) {
            self.fail_pending(p, error());
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error()));
        }
    }

    /// Explicit disconnect: fail everything, forget the run, stop retrying.
    fn go_offline(&mut self) {
        self.fail_all(|| TalkError::Transport("gateway disconnected".into()));
        self.run.clear();
        self.retry_at = None;
        self.policy.on_connected();
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn on_session_lost(&mut self, reason: &str) {
        warn!("gateway connection lost: {reason}");
        let pending: Vec<Pending> = self.pending.drain().map(|(_, p)| p).collect();
        for p in pending {
            self.fail_pending(p, TalkError::Transport(format!("connection lost: {reason}")));
        }
        if let Some(run) = self.run.clear() {
            self.publish(vec![GatewayUpdate::Failed {
                run,
                message: format!("connection lost: {reason}"),
            }]);
        }
        let delay = self.policy.on_session_lost();
        self.retry_at = Some(Instant::now() + delay);
        self.set_status(ConnectionStatus::Reconnecting { attempt: 1, delay });
    }

    fn on_connect_failure(&mut self, error: TalkError) {
        warn!("gateway connect failed: {error}");
        match self.policy.on_failure(Self::now_std()) {
            RetryDecision::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "gateway reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
                self.set_status(ConnectionStatus::Reconnecting { attempt, delay });
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(TalkError::Transport(error.to_string())));
                }
            }
            RetryDecision::CircuitOpen { until } => {
                let retry_in = until.saturating_duration_since(Self::now_std());
                warn!(
                    cooldown_secs = retry_in.as_secs(),
                    "gateway circuit open, pausing reconnects"
                );
                self.retry_at = Some(Instant::now() + retry_in);
                self.set_status(ConnectionStatus::CircuitOpen { retry_in });
                let message = error.to_string();
                self.fail_all(|| TalkError::Transport(message.clone()));
            }
        }
    }
}

fn circuit_open_error(retry_in: Duration) -> TalkError {
    TalkError::Transport(format!(
        "gateway unavailable, retrying in {}s",
        retry_in.as_secs()
    ))
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Open the socket and run the challenge/connect handshake.
async fn open_session(config: GatewayConfig) -> Result<WsStream> {
    let timeout = Duration::from_millis(config.handshake_timeout_ms);
    match tokio::time::timeout(timeout, handshake_exchange(&config)).await {
        Ok(res) => res,
        // Dropping the half-open socket closes it.
        Err(_) => Err(TalkError::Transport(format!(
            "handshake did not complete within {}ms",
            timeout.as_millis()
        ))),
    }
}

async fn handshake_exchange(config: &GatewayConfig) -> Result<WsStream> {
    let (mut ws, _) = tokio_tungstenite::connect_async(config.url.as_str())
        .await
        .map_err(|e| TalkError::Transport(format!("connect: {e}")))?;

    let nonce = loop {
        match next_frame(&mut ws).await? {
            Frame::Event { event, payload, .. } if event == event::CONNECT_CHALLENGE => {
                break payload
                    .get("nonce")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
            }
            other => debug!(?other, "frame before challenge ignored"),
        }
    };

    let params = ConnectParams {
        min_protocol: config.protocol_version,
        max_protocol: config.protocol_version,
        client: ClientInfo {
            id: config.client_id.clone(),
            display_name: "ClawK Talk".to_owned(),
            version: config.client_version.clone(),
            platform: std::env::consts::OS.to_owned(),
            mode: "ui".to_owned(),
        },
        role: config.role.clone(),
        scopes: config.scopes.clone(),
        caps: Vec::new(),
        auth: config
            .token
            .as_ref()
            .map(|token| protocol::AuthParams {
                token: token.clone(),
            }),
        nonce,
    };
    let params = serde_json::to_value(params)
        .map_err(|e| TalkError::Protocol(format!("encode connect: {e}")))?;
    let (connect_id, frame) = Frame::request(method::CONNECT, params);
    ws.send(Message::Text(frame.to_json()))
        .await
        .map_err(|e| TalkError::Transport(format!("send connect: {e}")))?;

    loop {
        match next_frame(&mut ws).await? {
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } if id == connect_id => {
                if !ok {
                    return Err(TalkError::Protocol(format!(
                        "connect rejected: {}",
                        protocol::error_message(error.as_ref())
                    )));
                }
                if !protocol::is_hello(payload.as_ref()) {
                    return Err(TalkError::Protocol(
                        "connect response missing snapshot".into(),
                    ));
                }
                return Ok(ws);
            }
            other => debug!(?other, "frame during handshake ignored"),
        }
    }
}

/// Read until the next parseable envelope.
async fn next_frame(ws: &mut WsStream) -> Result<Frame> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
                Some(frame) => return Ok(frame),
                None => warn!("ignoring malformed gateway frame"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(TalkError::Transport(
                    "connection closed during handshake".into(),
                ));
            }
            Some(Err(e)) => return Err(TalkError::Transport(format!("read error: {e}"))),
            Some(Ok(_)) => {}
        }
    }
}
