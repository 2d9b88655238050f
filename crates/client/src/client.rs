//! High-level gateway client: agent requests over a supervised session.
//!
//! Wraps a [`GatewaySession`] with the agent-run machinery: sending an
//! `agent` request, correlating its buffered output events by run id,
//! and surfacing the result either as one final string or as a chunk
//! stream. Constructed through [`crate::GatewayClientBuilder`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_core::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use oc_protocol::{AgentEventPayload, AgentOptions, AgentParams, EventFrame};

use crate::error::{GatewayError, Result};
use crate::events::EventHandler;
use crate::identity::KeyStore;
use crate::run::{AgentRun, OutputMode, RunStatus, RunTable};
use crate::session::{FatalErrorHook, GatewaySession, SessionConfig};

/// Client-level tunables, distinct from the transport timings in
/// [`SessionConfig`].
#[derive(Clone)]
pub(crate) struct ClientConfig {
    /// Overall budget for one agent run, ack to completion.
    pub timeout: Duration,
    /// How long `connect` waits for the session to come up.
    pub connect_wait: Duration,
    /// Budget for the gateway to ack an `agent` request with a run id.
    pub ack_timeout: Duration,
    /// Budget for `health` / `status` queries.
    pub query_timeout: Duration,
    pub output_mode: OutputMode,
    pub duplicate_window: Duration,
}

/// Mutable per-request defaults, adjustable between runs.
pub(crate) struct ClientSettings {
    pub session_key: String,
    pub model: Option<String>,
    pub thinking: Option<String>,
}

/// Gateway client facade.
pub struct GatewayClient {
    session: Arc<GatewaySession>,
    runs: Arc<RunTable>,
    settings: Mutex<ClientSettings>,
    config: ClientConfig,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient").finish_non_exhaustive()
    }
}

impl GatewayClient {
    pub(crate) fn new(
        session_config: SessionConfig,
        config: ClientConfig,
        settings: ClientSettings,
        key_store: Option<Arc<dyn KeyStore>>,
    ) -> Self {
        let session = GatewaySession::new(session_config, key_store);
        let runs = Arc::new(RunTable::default());

        session.on_event("agent", Arc::new(AgentEventHandler { runs: runs.clone() }));
        session.on_event(
            "presence",
            Arc::new(PresenceEventHandler {
                session: Arc::downgrade(&session),
            }),
        );

        Self {
            session,
            runs,
            settings: Mutex::new(settings),
            config,
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start the session and wait for the first successful handshake.
    ///
    /// The session keeps reconnecting in the background afterwards; a
    /// fatal handshake failure recorded during the wait is surfaced
    /// here instead of the bare timeout.
    pub async fn connect(&self) -> Result<()> {
        self.session.connect();
        let mut connected = self.session.connected_watch();
        let result = match tokio::time::timeout(self.config.connect_wait, connected.wait_for(|up| *up)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(GatewayError::Connection("session terminated".into())),
            Err(_) => match self.session.fatal_error() {
                Some(err @ GatewayError::Authentication(_)) => Err(err),
                Some(err) => Err(GatewayError::Connection(err.to_string())),
                None => Err(GatewayError::Connection(format!(
                    "connection timeout - gateway at {}:{} may not be reachable",
                    self.session.config().host,
                    self.session.config().port
                ))),
            },
        };
        result
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn connected(&self) -> bool {
        self.session.connected()
    }

    /// The fatal error that stopped the session, if any.
    pub fn fatal_error(&self) -> Option<GatewayError> {
        self.session.fatal_error()
    }

    /// Register a callback invoked when the session stops on a fatal
    /// error.
    pub fn on_fatal_error(&self, hook: impl Fn(&GatewayError) + Send + Sync + 'static) {
        self.session.set_on_fatal_error(Box::new(hook) as FatalErrorHook);
    }

    /// Register a handler for a named gateway event.
    pub fn on_event(&self, event_name: &str, handler: Arc<dyn EventHandler>) {
        self.session.on_event(event_name, handler);
    }

    // ── Agent runs ───────────────────────────────────────────────────

    /// Send an agent request and wait for the complete response text.
    pub async fn send_agent_request(&self, message: impl Into<String>) -> Result<String> {
        self.send_agent_request_with_key(message, None).await
    }

    /// Like [`Self::send_agent_request`], with a caller-chosen
    /// idempotency key for safe retries.
    pub async fn send_agent_request_with_key(
        &self,
        message: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> Result<String> {
        let params = self.agent_params(message.into(), idempotency_key);
        let response = self
            .session
            .send_request("agent", serde_json::to_value(&params)?, self.config.ack_timeout)
            .await?;

        let run_id = extract_run_id(&response.payload)?;
        let run = AgentRun::new(
            &run_id,
            self.config.output_mode,
            self.config.duplicate_window,
            false,
        );
        self.runs.insert(run.clone());
        let _guard = RunGuard {
            runs: self.runs.clone(),
            run_id: run_id.clone(),
        };
        tracing::info!(run_id = %run_id, "agent request accepted");

        let mut done = run.completed();
        let result = match tokio::time::timeout(self.config.timeout, done.wait_for(|v| *v)).await {
            Err(_) => Err(GatewayError::Timeout(format!(
                "agent run {run_id} timed out"
            ))),
            Ok(Err(_)) => Err(GatewayError::Connection("run tracker closed".into())),
            Ok(Ok(_)) => match run.status() {
                Some(RunStatus::Ok) => Ok(run.response()),
                Some(RunStatus::Error) => Err(GatewayError::AgentExecution(
                    run.summary()
                        .unwrap_or_else(|| "agent run failed".into()),
                )),
                None => Err(GatewayError::AgentExecution(
                    "agent run completed without status".into(),
                )),
            },
        };
        result
    }

    /// Send an agent request and stream response chunks as they arrive.
    ///
    /// The stream ends after the terminal event; a failed run yields
    /// its chunks first and an error at the end.
    pub fn stream_agent_request(
        &self,
        message: impl Into<String>,
    ) -> impl Stream<Item = Result<String>> + Send + 'static {
        self.stream_agent_request_with_key(message, None)
    }

    /// Like [`Self::stream_agent_request`], with a caller-chosen
    /// idempotency key for safe retries.
    pub fn stream_agent_request_with_key(
        &self,
        message: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> impl Stream<Item = Result<String>> + Send + 'static {
        let session = self.session.clone();
        let runs = self.runs.clone();
        let config = self.config.clone();
        let params = self.agent_params(message.into(), idempotency_key);

        async_stream::try_stream! {
            let response = session
                .send_request("agent", serde_json::to_value(&params)?, config.ack_timeout)
                .await?;

            let run_id = extract_run_id(&response.payload)?;
            let run = AgentRun::new(&run_id, config.output_mode, config.duplicate_window, true);
            runs.insert(run.clone());
            let _guard = RunGuard { runs, run_id: run_id.clone() };
            tracing::info!(run_id = %run_id, "agent request accepted, streaming");

            // A fresh run always has its stream; bail out quietly if not.
            let Some(mut rx) = run.take_stream() else {
                return;
            };

            let deadline = tokio::time::Instant::now() + config.timeout;
            loop {
                let chunk = tokio::time::timeout_at(deadline, rx.recv())
                    .await
                    .map_err(|_| {
                        GatewayError::Timeout(format!("agent run {run_id} timed out"))
                    })?;
                match chunk {
                    Some(Some(text)) => yield text,
                    // `None` chunk is the completion sentinel; a closed
                    // channel means the same thing here.
                    Some(None) | None => break,
                }
            }

            let outcome: Result<()> = match run.status() {
                Some(RunStatus::Ok) => Ok(()),
                Some(RunStatus::Error) => Err(GatewayError::AgentExecution(
                    run.summary().unwrap_or_else(|| "agent run failed".into()),
                )),
                None => Err(GatewayError::AgentExecution(
                    "agent run ended without status".into(),
                )),
            };
            outcome?;
        }
    }

    /// Number of runs currently awaiting completion.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub async fn health(&self) -> Result<Value> {
        let response = self
            .session
            .send_request("health", json!({}), self.config.query_timeout)
            .await?;
        Ok(response.payload)
    }

    pub async fn status(&self) -> Result<Value> {
        let response = self
            .session
            .send_request("status", json!({}), self.config.query_timeout)
            .await?;
        Ok(response.payload)
    }

    /// Payload of the connect handshake response.
    pub fn connect_snapshot(&self) -> Value {
        self.session.connect_snapshot()
    }

    /// Latest gateway presence data.
    pub fn presence(&self) -> Value {
        self.session.presence()
    }

    // ── Settings ─────────────────────────────────────────────────────

    pub fn session_key(&self) -> String {
        self.settings.lock().session_key.clone()
    }

    pub fn set_session_key(&self, session_key: impl Into<String>) {
        self.settings.lock().session_key = session_key.into();
    }

    pub fn model(&self) -> Option<String> {
        self.settings.lock().model.clone()
    }

    pub fn set_model(&self, model: Option<String>) {
        self.settings.lock().model = model;
    }

    pub fn thinking(&self) -> Option<String> {
        self.settings.lock().thinking.clone()
    }

    pub fn set_thinking(&self, thinking: Option<String>) {
        self.settings.lock().thinking = thinking;
    }

    // ── Internals ────────────────────────────────────────────────────

    fn agent_params(&self, message: String, idempotency_key: Option<String>) -> AgentParams {
        let settings = self.settings.lock();
        let options = AgentOptions {
            model: settings.model.clone(),
            thinking: settings.thinking.clone(),
        };
        AgentParams {
            message,
            session_key: settings.session_key.clone(),
            idempotency_key: idempotency_key.unwrap_or_else(|| Uuid::new_v4().to_string()),
            options: (!options.is_empty()).then_some(options),
        }
    }
}

fn extract_run_id(payload: &Value) -> Result<String> {
    payload
        .get("runId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned)
        .ok_or_else(|| GatewayError::AgentExecution("agent response missing runId".into()))
}

/// Removes the run from the table when the caller stops waiting, so an
/// abandoned stream does not leak the run entry.
struct RunGuard {
    runs: Arc<RunTable>,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.remove(&self.run_id);
    }
}

// ── Event handlers ───────────────────────────────────────────────────

/// Routes `agent` events into the run table.
struct AgentEventHandler {
    runs: Arc<RunTable>,
}

#[async_trait::async_trait]
impl EventHandler for AgentEventHandler {
    async fn handle(&self, event: &EventFrame) -> anyhow::Result<()> {
        let payload: AgentEventPayload = match serde_json::from_value(event.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "malformed agent event payload");
                return Ok(());
            }
        };
        let Some(run_id) = payload.run_id.as_deref() else {
            tracing::warn!("agent event without runId");
            return Ok(());
        };
        let Some(run) = self.runs.get(run_id) else {
            // A run another client started, or one we already gave up on.
            tracing::debug!(run_id = %run_id, "agent event for unknown run");
            return Ok(());
        };

        if let Some(text) = payload.text() {
            run.add_output(text);
        }

        let phase = payload.data.phase.as_deref();
        if let Some(status) = payload.status.as_deref().and_then(RunStatus::parse) {
            run.set_complete(status, payload.summary.clone());
            tracing::info!(run_id = %run_id, status = ?status, "agent run completed");
        } else if matches!(phase, Some("end" | "complete")) {
            run.set_complete(RunStatus::Ok, None);
            tracing::info!(run_id = %run_id, phase = ?phase, "agent run completed");
        } else if let Some(status) = payload.status.as_deref() {
            tracing::debug!(run_id = %run_id, status = %status, "agent run progress");
        }
        Ok(())
    }
}

/// Mirrors `presence` events into the session's presence state. Holds a
/// weak reference: the session owns the dispatcher that owns this
/// handler.
struct PresenceEventHandler {
    session: Weak<GatewaySession>,
}

#[async_trait::async_trait]
impl EventHandler for PresenceEventHandler {
    async fn handle(&self, event: &EventFrame) -> anyhow::Result<()> {
        if let Some(session) = self.session.upgrade() {
            session.update_presence(event.payload.clone());
        }
        Ok(())
    }
}
