//! dtx runtime - event bus, single-flight init, and control channel
//!
//! This crate provides the session-independent building blocks the `dtx`
//! session controller is assembled from:
//!
//! - **Events**: [`EventBus`] fanning device lifecycle events out to
//!   isolated listeners
//! - **Init guard**: [`Deferred`] and [`InitGuard`] for abortable,
//!   single-flight initialization
//! - **Control client**: the [`ControlClient`] contract and its WebSocket
//!   implementation
//! - **Control server**: the [`ControlServer`] contract and the WebSocket
//!   relay pairing tester and app
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐
//! │     dtx      │  SessionController, drivers, device facade
//! └──────┬───────┘
//!        │ consumes traits
//! ┌──────▼───────┐
//! │ dtx-runtime  │  This crate
//! │  ┌────────┐  │
//! │  │ Events │  │  Ordered, fault-isolated fan-out
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Client │  │  messageId correlation, crash latch
//! │  └────────┘  │
//! │  ┌────────┐  │
//! │  │ Server │  │  tester <-> app relay
//! │  └────────┘  │
//! └──────────────┘
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod init_guard;
pub mod server;

pub use client::{
	ControlClient, ControlClientFactory, Nonresponsiveness, NonresponsivenessListener, WsControlClient,
	WsControlClientFactory,
};
pub use error::{Error, Result};
pub use events::{
	ErrorHandler, EventBus, EventName, Listener, ListenerError, ListenerFuture, ListenerId, listener,
};
pub use init_guard::{Deferred, InitGuard, InitStatus};
pub use server::{ControlServer, ControlServerFactory, RelayServer, RelayServerFactory, ServerOptions};
