//! Builder for [`GatewayClient`]. All tunables default to what current
//! gateway deployments expect; tests shrink the timing knobs.

use std::sync::Arc;
use std::time::Duration;

use crate::client::{ClientConfig, ClientSettings, GatewayClient};
use crate::error::{GatewayError, Result};
use crate::identity::KeyStore;
use crate::run::OutputMode;
use crate::session::SessionConfig;

pub struct GatewayClientBuilder {
    host: String,
    port: u16,
    use_tls: bool,
    token: Option<String>,
    session_key: String,
    model: Option<String>,
    thinking: Option<String>,
    output_mode: OutputMode,
    key_store: Option<Arc<dyn KeyStore>>,

    timeout: Duration,
    connect_wait: Duration,
    ack_timeout: Duration,
    query_timeout: Duration,
    duplicate_window: Duration,
    heartbeat_interval: Duration,
    challenge_timeout: Duration,
    handshake_timeout: Duration,
    retry_delay: Duration,
}

impl Default for GatewayClientBuilder {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 18789,
            use_tls: false,
            token: None,
            session_key: "main".into(),
            model: None,
            thinking: None,
            output_mode: OutputMode::default(),
            key_store: None,
            timeout: Duration::from_secs(30),
            connect_wait: Duration::from_secs(5),
            ack_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(5),
            duplicate_window: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(30),
            challenge_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl GatewayClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn use_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Bearer token presented during connect and on the HTTP upgrade.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Conversation session key sent with each agent request.
    pub fn session_key(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = session_key.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn thinking(mut self, thinking: impl Into<String>) -> Self {
        self.thinking = Some(thinking.into());
        self
    }

    /// How agent output events deliver text; depends on the gateway
    /// generation.
    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }

    /// Key store backing the device identity. Without one the client
    /// answers challenges with token-only auth.
    pub fn key_store(mut self, store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(store);
        self
    }

    /// Overall budget for one agent run.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect_wait(mut self, wait: Duration) -> Self {
        self.connect_wait = wait;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Suppression window for duplicate fragments in append mode.
    pub fn duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn challenge_timeout(mut self, timeout: Duration) -> Self {
        self.challenge_timeout = timeout;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn build(self) -> Result<GatewayClient> {
        if self.host.is_empty() {
            return Err(GatewayError::Config("host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(GatewayError::Config("port must not be zero".into()));
        }

        let session = SessionConfig {
            host: self.host,
            port: self.port,
            use_tls: self.use_tls,
            token: self.token,
            heartbeat_interval: self.heartbeat_interval,
            challenge_timeout: self.challenge_timeout,
            handshake_timeout: self.handshake_timeout,
            retry_delay: self.retry_delay,
        };
        let config = ClientConfig {
            timeout: self.timeout,
            connect_wait: self.connect_wait,
            ack_timeout: self.ack_timeout,
            query_timeout: self.query_timeout,
            output_mode: self.output_mode,
            duplicate_window: self.duplicate_window,
        };
        let settings = ClientSettings {
            session_key: self.session_key,
            model: self.model,
            thinking: self.thinking,
        };

        Ok(GatewayClient::new(session, config, settings, self.key_store))
    }
}
