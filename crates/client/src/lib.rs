//! WebSocket client for the OpenClaw gateway.
//!
//! The crate is layered:
//!
//! - [`GatewaySession`] owns one supervised WebSocket connection:
//!   handshake (with optional device-auth challenge), heartbeats,
//!   request/response correlation, event dispatch, and reconnection.
//! - [`GatewayClient`] sits on top and speaks in agent runs: it sends
//!   `agent` requests, buffers the gateway's output events per run, and
//!   returns final text or a chunk stream.
//!
//! ```no_run
//! use oc_client::GatewayClientBuilder;
//!
//! # async fn demo() -> oc_client::Result<()> {
//! let client = GatewayClientBuilder::new()
//!     .host("127.0.0.1")
//!     .port(18789)
//!     .token("secret")
//!     .build()?;
//! client.connect().await?;
//! let reply = client.send_agent_request("hello").await?;
//! println!("{reply}");
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod error;
mod events;
mod identity;
mod pending;
mod run;
mod session;

pub use builder::GatewayClientBuilder;
pub use client::GatewayClient;
pub use error::{GatewayError, Result};
pub use events::EventHandler;
pub use identity::{
    build_device_auth, build_signature_payload, device_id_from_public_key,
    load_or_create_keypair, DeviceKeypair, FileKeyStore, KeyStore, KeyStoreError,
};
pub use run::OutputMode;
pub use session::{ConnectionState, FatalErrorHook, GatewaySession, SessionConfig};
