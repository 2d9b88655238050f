//! Transport session — owns the WebSocket lifecycle: connect,
//! handshake, heartbeat, receive loop, reconnect, teardown.
//!
//! One logical connection per session. All wire writes go through a
//! single writer task fed by an mpsc channel, so concurrent senders
//! interleave only between whole frames. The receive loop, heartbeat
//! loop, and retry supervisor are independent tasks cancelled together
//! on disconnect.
//!
//! Transient failures reconnect after a fixed delay (a deliberate close
//! code 1012, "service restart", reconnects immediately). Credential
//! and protocol-version failures are fatal: they stop the retry loop,
//! record the error, and invoke the registered fatal-error hook —
//! those need operator intervention, not retries.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use oc_protocol::{
    AuthParams, ClientInfo, ConnectParams, DeviceAuth, Frame, RequestFrame, ResponseFrame,
    CLIENT_DISPLAY_NAME, CLIENT_ID, CLIENT_LOCALE, CLIENT_MODE, CLIENT_VERSION,
    CONNECT_CHALLENGE_EVENT, DEVICE_ROLE, DEVICE_SCOPES, PROTOCOL_MAX_VERSION,
    PROTOCOL_MIN_VERSION,
};

use crate::error::{classify_handshake_error, classify_request_error, GatewayError, Result};
use crate::events::{EventDispatcher, EventHandler};
use crate::identity::{build_device_auth, load_or_create_keypair, KeyStore};
use crate::pending::PendingRequests;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    Closing,
}

/// Why a live connection ended.
enum CloseReason {
    /// Normal closure or transport failure; retried after a delay.
    Closed,
    /// Close code 1012: the gateway is restarting. Retried immediately.
    RemoteRestart,
}

/// Callback invoked when the retry loop stops on a fatal error.
pub type FatalErrorHook = Box<dyn Fn(&GatewayError) + Send + Sync>;

/// Session tunables. The timing constants mirror what current gateway
/// deployments expect; override through the client builder.
#[derive(Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub token: Option<String>,
    /// Interval between outgoing heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for an unsolicited `connect.challenge` before
    /// falling back to the legacy handshake.
    pub challenge_timeout: Duration,
    /// Budget for the correlated `connect` response.
    pub handshake_timeout: Duration,
    /// Delay between reconnect attempts after a transient failure.
    pub retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18789,
            use_tls: false,
            token: None,
            heartbeat_interval: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// The WebSocket URL, with the token as a query parameter when
    /// configured (the gateway accepts it there or as a header).
    fn url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        match &self.token {
            Some(token) => format!("{scheme}://{}:{}/?token={token}", self.host, self.port),
            None => format!("{scheme}://{}:{}", self.host, self.port),
        }
    }
}

/// Low-level gateway protocol session.
pub struct GatewaySession {
    config: SessionConfig,
    key_store: Option<Arc<dyn KeyStore>>,

    state: Mutex<ConnectionState>,
    connected_tx: watch::Sender<bool>,
    /// Sender into the current connection's writer task, if connected.
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    pending: PendingRequests,
    dispatcher: EventDispatcher,

    /// Payload of the successful connect response, kept for
    /// diagnostics.
    snapshot: RwLock<Value>,
    /// Latest gateway-reported presence, seeded from the snapshot.
    presence: RwLock<Value>,

    fatal: Mutex<Option<GatewayError>>,
    on_fatal: Mutex<Option<FatalErrorHook>>,
    last_pong: Mutex<Instant>,

    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewaySession {
    pub fn new(config: SessionConfig, key_store: Option<Arc<dyn KeyStore>>) -> Arc<Self> {
        let (connected_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            key_store,
            state: Mutex::new(ConnectionState::Disconnected),
            connected_tx,
            outbound: Mutex::new(None),
            pending: PendingRequests::default(),
            dispatcher: EventDispatcher::default(),
            snapshot: RwLock::new(Value::Null),
            presence: RwLock::new(Value::Null),
            fatal: Mutex::new(None),
            on_fatal: Mutex::new(None),
            last_pong: Mutex::new(Instant::now()),
            cancel: Mutex::new(CancellationToken::new()),
            task: Mutex::new(None),
        })
    }

    // ── Public surface ───────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Watch that tracks the connected flag.
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    /// The fatal error that stopped the retry loop, if any.
    pub fn fatal_error(&self) -> Option<GatewayError> {
        self.fatal.lock().clone()
    }

    /// Register the hook invoked when the retry loop stops permanently.
    pub fn set_on_fatal_error(&self, hook: FatalErrorHook) {
        *self.on_fatal.lock() = Some(hook);
    }

    /// Register an event handler; duplicate registration is a no-op.
    pub fn on_event(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        self.dispatcher.on_event(event_name, handler);
    }

    /// Payload captured from the connect handshake response.
    pub fn connect_snapshot(&self) -> Value {
        self.snapshot.read().clone()
    }

    /// Latest presence data.
    pub fn presence(&self) -> Value {
        self.presence.read().clone()
    }

    /// Replace presence state from a presence event payload.
    pub fn update_presence(&self, payload: Value) {
        if !payload.is_null() {
            *self.presence.write() = normalize_presence(payload);
        }
    }

    /// Time since the last heartbeat pong.
    pub fn heartbeat_age(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start the supervised connection loop. Idempotent: a no-op when
    /// the loop is already running.
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        *self.fatal.lock() = None;
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        self.set_state(ConnectionState::Connecting);
        *task = Some(tokio::spawn(self.clone().connection_loop(cancel)));
    }

    /// Tear the session down: cancel the retry loop and its per-
    /// connection tasks, fail every pending request. Safe to call when
    /// already disconnected.
    pub async fn disconnect(&self) {
        tracing::info!("disconnecting from gateway");
        self.set_state(ConnectionState::Closing);
        self.connected_tx.send_replace(false);
        self.cancel.lock().cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        *self.outbound.lock() = None;
        let failed = self.pending.fail_all();
        if failed > 0 {
            tracing::debug!(count = failed, "failed pending requests on disconnect");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Send a request and await its correlated response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<ResponseFrame> {
        let out = self
            .outbound
            .lock()
            .clone()
            .filter(|_| self.connected())
            .ok_or_else(|| GatewayError::Connection("not connected to gateway".into()))?;

        let request = RequestFrame::new(method, params);
        let id = request.id.clone();
        let rx = self.pending.register(&id);

        tracing::debug!(method = %method, id = %id, "sending request");
        if out.send(Frame::Req(request)).is_err() {
            self.pending.remove(&id);
            return Err(GatewayError::Connection("connection closed".into()));
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        // Cleanup runs on every exit path; resolve already removed the
        // entry on success, this covers timeout and send races.
        self.pending.remove(&id);

        let response = match outcome {
            Err(_) => {
                return Err(GatewayError::Timeout(format!("request timeout for {method}")));
            }
            Ok(Err(_)) => {
                return Err(GatewayError::Connection(
                    "connection closed while waiting for response".into(),
                ));
            }
            Ok(Ok(response)) => response,
        };

        if !response.ok {
            return Err(classify_request_error(&response.error));
        }
        Ok(response)
    }

    // ── Connection supervisor ────────────────────────────────────────

    async fn connection_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Opening is cancellable from the outside; once connected,
            // cancellation is handled inside run_connection so its task
            // teardown always completes.
            let ws = tokio::select! {
                result = self.open_connection() => match result {
                    Ok(ws) => Some(ws),
                    Err(err) if err.is_fatal() => {
                        self.record_fatal(err);
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "connection failed, will retry");
                        None
                    }
                },
                _ = cancel.cancelled() => {
                    tracing::debug!("connection loop cancelled");
                    break;
                }
            };

            if let Some(ws) = ws {
                match self.run_connection(ws, &cancel).await {
                    CloseReason::RemoteRestart => {
                        tracing::info!("gateway is restarting, reconnecting immediately");
                        continue;
                    }
                    CloseReason::Closed => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        tracing::warn!("connection closed, will retry");
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_delay) => {}
                _ = cancel.cancelled() => break,
            }
        }

        self.connected_tx.send_replace(false);
        self.set_state(ConnectionState::Disconnected);
    }

    /// Open the transport and complete the handshake.
    async fn open_connection(&self) -> Result<WsStream> {
        self.set_state(ConnectionState::Connecting);
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            tls = self.config.use_tls,
            "connecting to gateway"
        );

        let mut request = self
            .config
            .url()
            .into_client_request()
            .map_err(|err| GatewayError::Config(format!("invalid gateway url: {err}")))?;
        if let Some(token) = &self.config.token {
            let bearer = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| GatewayError::Config(format!("invalid token: {err}")))?;
            let raw = HeaderValue::from_str(token)
                .map_err(|err| GatewayError::Config(format!("invalid token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, bearer);
            request.headers_mut().insert("x-openclaw-token", raw);
        }

        let (mut ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(classify_connect_error)?;

        self.set_state(ConnectionState::Handshaking);
        self.handshake(&mut ws).await?;
        Ok(ws)
    }

    /// Connected phase: spawn the writer and heartbeat tasks, run the
    /// receive loop, and tear both tasks down before returning.
    async fn run_connection(&self, ws: WsStream, cancel: &CancellationToken) -> CloseReason {
        self.set_state(ConnectionState::Connected);
        *self.last_pong.lock() = Instant::now();
        self.connected_tx.send_replace(true);
        tracing::info!("connected to gateway");

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Frame>();
        *self.outbound.lock() = Some(out_tx.clone());

        let writer = tokio::spawn(write_loop(sink, out_rx));
        let heartbeat = tokio::spawn(heartbeat_loop(
            out_tx.clone(),
            self.config.heartbeat_interval,
            cancel.child_token(),
        ));

        // Run until the connection ends or the session is cancelled, so
        // the task teardown below always executes.
        let reason = tokio::select! {
            reason = self.receive_loop(stream, &out_tx) => reason,
            _ = cancel.cancelled() => CloseReason::Closed,
        };

        // Teardown for this connection attempt.
        *self.outbound.lock() = None;
        self.connected_tx.send_replace(false);
        heartbeat.abort();
        writer.abort();
        let _ = heartbeat.await;
        let _ = writer.await;
        let failed = self.pending.fail_all();
        if failed > 0 {
            tracing::debug!(count = failed, "failed pending requests on connection loss");
        }
        reason
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Connect handshake, supporting both the challenge/device-auth
    /// flow and the legacy token-only flow of older gateways.
    async fn handshake(&self, ws: &mut WsStream) -> Result<()> {
        // Step 1: optionally wait for an unsolicited connect.challenge.
        // A non-challenge first message is kept for step 3, not dropped.
        let mut nonce: Option<String> = None;
        let mut first_message: Option<Frame> = None;

        match tokio::time::timeout(self.config.challenge_timeout, ws.next()).await {
            Err(_) => {
                tracing::debug!("no connect.challenge received, using legacy handshake");
            }
            Ok(None) => {
                return Err(GatewayError::Connection(
                    "connection closed during handshake".into(),
                ));
            }
            Ok(Some(Err(err))) => {
                return Err(GatewayError::Connection(format!(
                    "websocket error during handshake: {err}"
                )));
            }
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<Frame>(&text) {
                Ok(Frame::Event(event)) if event.event == CONNECT_CHALLENGE_EVENT => {
                    nonce = event
                        .payload
                        .get("nonce")
                        .and_then(Value::as_str)
                        .map(str::to_owned);
                    tracing::debug!(nonce = nonce.is_some(), "received connect.challenge");
                }
                Ok(frame) => {
                    tracing::debug!(
                        kind = frame.kind(),
                        "first message was not connect.challenge, using legacy handshake"
                    );
                    first_message = Some(frame);
                }
                Err(_) => {
                    tracing::debug!("non-JSON first message, using legacy handshake");
                }
            },
            Ok(Some(Ok(_))) => {
                tracing::debug!("non-text first message, using legacy handshake");
            }
        }

        // Step 2: build the connect request. A failed device proof must
        // not abort the handshake; fall back to token-only auth.
        let mut params = ConnectParams {
            min_protocol: PROTOCOL_MIN_VERSION,
            max_protocol: PROTOCOL_MAX_VERSION,
            client: ClientInfo::this_client(),
            caps: vec![],
            locale: CLIENT_LOCALE.into(),
            user_agent: format!("{CLIENT_DISPLAY_NAME}/{CLIENT_VERSION}"),
            auth: self
                .config
                .token
                .clone()
                .map(|token| AuthParams { token }),
            role: None,
            scopes: None,
            device: None,
        };
        if let Some(nonce) = nonce.as_deref() {
            match self.build_device_proof(nonce).await {
                Ok(device) => {
                    params.role = Some(DEVICE_ROLE.into());
                    params.scopes =
                        Some(DEVICE_SCOPES.iter().map(|s| s.to_string()).collect());
                    params.device = Some(device);
                    tracing::debug!("challenge received, including device auth proof");
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "failed to build device auth proof, falling back to token-only connect"
                    );
                }
            }
        }

        let request = RequestFrame::new("connect", serde_json::to_value(&params)?);
        let request_id = request.id.clone();
        let json = serde_json::to_string(&Frame::Req(request))?;
        tracing::debug!("sending connect request");
        ws.send(Message::Text(json)).await.map_err(|err| {
            GatewayError::Connection(format!("failed to send connect request: {err}"))
        })?;

        // Step 3: read until the correlated response, skipping events.
        let response = loop {
            let frame = match first_message.take() {
                Some(frame) => frame,
                None => match tokio::time::timeout(self.config.handshake_timeout, ws.next()).await
                {
                    Err(_) => return Err(GatewayError::Connection("handshake timeout".into())),
                    Ok(None) => {
                        return Err(GatewayError::Connection(
                            "connection closed during handshake".into(),
                        ));
                    }
                    Ok(Some(Err(err))) => {
                        return Err(GatewayError::Connection(format!(
                            "websocket error during handshake: {err}"
                        )));
                    }
                    Ok(Some(Ok(Message::Text(text)))) => serde_json::from_str::<Frame>(&text)
                        .map_err(|err| {
                            GatewayError::Protocol(format!(
                                "invalid JSON in handshake response: {err}"
                            ))
                        })?,
                    Ok(Some(Ok(_))) => continue,
                },
            };

            match frame {
                Frame::Event(event) => {
                    tracing::debug!(event = %event.event, "event during handshake, skipping");
                    continue;
                }
                Frame::Res(response) => break response,
                other => {
                    return Err(GatewayError::Protocol(format!(
                        "expected response, got {}",
                        other.kind()
                    )));
                }
            }
        };

        if response.id != request_id {
            return Err(GatewayError::Protocol("response id mismatch".into()));
        }
        if !response.ok {
            return Err(classify_handshake_error(&response.error));
        }

        *self.snapshot.write() = response.payload.clone();
        let presence = response
            .payload
            .get("snapshot")
            .and_then(|s| s.get("presence"))
            .cloned()
            .unwrap_or(Value::Null);
        *self.presence.write() = normalize_presence(presence);
        tracing::debug!("handshake completed");
        Ok(())
    }

    async fn build_device_proof(&self, nonce: &str) -> Result<DeviceAuth> {
        let store = self.key_store.as_ref().ok_or_else(|| {
            GatewayError::Config("no key store configured for device auth".into())
        })?;
        let key = load_or_create_keypair(store.as_ref()).await?;
        let scopes: Vec<String> = DEVICE_SCOPES.iter().map(|s| s.to_string()).collect();
        Ok(build_device_auth(
            &key,
            CLIENT_ID,
            CLIENT_MODE,
            DEVICE_ROLE,
            &scopes,
            self.config.token.as_deref().unwrap_or(""),
            nonce,
        ))
    }

    // ── Receive path ─────────────────────────────────────────────────

    async fn receive_loop(
        &self,
        mut stream: SplitStream<WsStream>,
        out_tx: &mpsc::UnboundedSender<Frame>,
    ) -> CloseReason {
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Text(text)) => self.handle_frame(&text, out_tx).await,
                Ok(Message::Close(frame)) => {
                    if frame
                        .as_ref()
                        .is_some_and(|f| f.code == CloseCode::Restart)
                    {
                        return CloseReason::RemoteRestart;
                    }
                    match frame {
                        Some(f) => tracing::warn!(
                            code = %f.code,
                            reason = %f.reason,
                            "gateway closed connection"
                        ),
                        None => tracing::warn!("gateway closed connection"),
                    }
                    return CloseReason::Closed;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "websocket read failed");
                    return CloseReason::Closed;
                }
            }
        }
        CloseReason::Closed
    }

    /// Decode and dispatch one inbound frame. Decode failures are
    /// logged and do not terminate the connection.
    async fn handle_frame(&self, text: &str, out_tx: &mpsc::UnboundedSender<Frame>) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "received invalid frame, ignoring");
                return;
            }
        };

        match frame {
            Frame::Res(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    // Late arrival after a timeout; normal, not an error.
                    tracing::debug!(id = %id, "response for request that already timed out");
                }
            }
            Frame::Event(event) => {
                self.dispatcher.dispatch(&event.event, &event).await;
            }
            Frame::Ping => {
                let _ = out_tx.send(Frame::Pong);
            }
            Frame::Pong => {
                *self.last_pong.lock() = Instant::now();
                tracing::trace!("received heartbeat pong");
            }
            Frame::Req(request) => {
                tracing::warn!(method = %request.method, "unexpected request from gateway, ignoring");
            }
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn record_fatal(&self, err: GatewayError) {
        tracing::error!(
            error = %err,
            "gateway connection stopped; operator intervention required"
        );
        *self.fatal.lock() = Some(err.clone());
        if let Some(hook) = self.on_fatal.lock().as_ref() {
            hook(&err);
        }
    }
}

/// Serialize and write outbound frames; owns the sink so writes never
/// interleave within one frame.
async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(error = %err, "failed to serialize outbound frame");
                continue;
            }
        };
        if sink.send(Message::Text(json)).await.is_err() {
            tracing::warn!("websocket write failed");
            break;
        }
    }
    let _ = sink.close().await;
}

/// Emit a ping on every interval tick; a failed send means the writer
/// is gone and the connection is coming down anyway.
async fn heartbeat_loop(
    out_tx: mpsc::UnboundedSender<Frame>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => return,
        }
        if out_tx.send(Frame::Ping).is_err() {
            tracing::warn!("heartbeat failed, stopping");
            return;
        }
    }
}

fn classify_connect_error(err: tokio_tungstenite::tungstenite::Error) -> GatewayError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            GatewayError::Authentication(format!(
                "gateway rejected connection: HTTP {}",
                response.status().as_u16()
            ))
        }
        other => GatewayError::Connection(format!("connect failed: {other}")),
    }
}

/// The gateway reports presence either as an object or as a bare list
/// of client ids; normalize the list into `{"clients": [...]}`.
fn normalize_presence(value: Value) -> Value {
    match value {
        Value::Array(clients) => serde_json::json!({ "clients": clients }),
        Value::Null => serde_json::json!({}),
        other => other,
    }
}
