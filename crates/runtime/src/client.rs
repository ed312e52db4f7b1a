//! Tester-side control client.
//!
//! The [`ControlClient`] trait is what the session controller and device
//! drivers consume. [`WsControlClient`] is the default implementation over a
//! WebSocket to the control server.
//!
//! # Message Flow
//!
//! 1. `connect()` opens the socket and logs in as the tester of the session
//! 2. `send_action()` assigns a `messageId`, records the request as pending,
//!    and awaits the frame echoing that id
//! 3. Frames without a pending id are notifications: a crash report is
//!    latched until read, a nonresponsiveness report goes to the listener
//! 4. `cleanup()` closes the socket and fails whatever is still pending

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dtx_protocol::{Envelope, LoginParams, Role, SessionEndpoint, kind};
use futures_util::{SinkExt, StreamExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Main-thread stall reported by the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonresponsiveness {
	pub thread_dump: String,
}

/// Callback for [`Nonresponsiveness`] reports.
pub type NonresponsivenessListener = Arc<dyn Fn(Nonresponsiveness) + Send + Sync>;

/// Protocol connection to the on-device test agent, as seen by the tester.
#[async_trait]
pub trait ControlClient: Send + Sync {
	/// Opens the connection and joins the session.
	async fn connect(&self) -> Result<()>;

	/// Sends an action to the app and awaits its reply.
	async fn send_action(&self, kind: &str, params: Value) -> Result<Value>;

	fn set_nonresponsiveness_listener(&self, listener: NonresponsivenessListener);

	/// Logs every request still awaiting a reply.
	fn dump_pending_requests(&self, test_name: Option<&str>);

	/// Returns the latched crash report, clearing it.
	fn take_pending_crash(&self) -> Option<String>;

	/// Closes the connection; outstanding requests fail with [`Error::ChannelClosed`].
	async fn cleanup(&self) -> Result<()>;
}

/// Creates control clients for a session endpoint.
pub trait ControlClientFactory: Send + Sync {
	fn create(&self, endpoint: &SessionEndpoint) -> Arc<dyn ControlClient>;
}

/// Default [`ControlClientFactory`] producing [`WsControlClient`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsControlClientFactory;

impl ControlClientFactory for WsControlClientFactory {
	fn create(&self, endpoint: &SessionEndpoint) -> Arc<dyn ControlClient> {
		Arc::new(WsControlClient::new(endpoint.clone()))
	}
}

struct PendingRequest {
	kind: String,
	params: String,
	tx: oneshot::Sender<Result<Value>>,
}

type PendingMap = IndexMap<i64, PendingRequest>;

/// State shared between the client handle and its reader task.
struct Shared {
	last_id: AtomicI64,
	pending: Mutex<PendingMap>,
	crash: Mutex<Option<String>>,
	on_nonresponsive: Mutex<Option<NonresponsivenessListener>>,
}

/// Removes the pending entry when a request future completes or is dropped.
struct PendingGuard<'a> {
	id: i64,
	shared: &'a Shared,
}

impl Drop for PendingGuard<'_> {
	fn drop(&mut self) {
		if self.shared.pending.lock().shift_remove(&self.id).is_some() {
			tracing::debug!(target: "dtx::client", id = self.id, "dropped orphaned request");
		}
	}
}

impl Shared {
	fn new() -> Self {
		Self {
			last_id: AtomicI64::new(0),
			pending: Mutex::new(IndexMap::new()),
			crash: Mutex::new(None),
			on_nonresponsive: Mutex::new(None),
		}
	}

	async fn request(
		&self,
		outbound: &mpsc::UnboundedSender<Message>,
		kind: &str,
		params: Value,
	) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::SeqCst);
		let frame = serde_json::to_string(&Envelope::new(kind, params.clone()).with_id(id))?;

		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(
			id,
			PendingRequest {
				kind: kind.to_string(),
				params: params.to_string(),
				tx,
			},
		);
		let _guard = PendingGuard { id, shared: self };

		tracing::debug!(target: "dtx::client", id, kind, "sending request");
		outbound
			.send(Message::Text(frame))
			.map_err(|_| Error::ChannelClosed)?;

		rx.await.map_err(|_| Error::ChannelClosed)?
	}

	fn dispatch(&self, text: &str) {
		let envelope: Envelope = match serde_json::from_str(text) {
			Ok(envelope) => envelope,
			Err(e) => {
				tracing::warn!(target: "dtx::client", error = %e, "ignoring malformed frame");
				return;
			}
		};

		if let Some(id) = envelope.message_id {
			let pending = self.pending.lock().shift_remove(&id);
			if let Some(pending) = pending {
				let result = if envelope.is(kind::ERROR) {
					Err(Error::Remote(error_message(&envelope.params)))
				} else {
					Ok(envelope.params)
				};
				let _ = pending.tx.send(result);
				return;
			}
		}

		match envelope.kind.as_str() {
			kind::APP_CRASHED => {
				let details = envelope
					.params
					.get("errorDetails")
					.and_then(Value::as_str)
					.map(str::to_string)
					.unwrap_or_else(|| envelope.params.to_string());
				if details.is_empty() {
					tracing::debug!(target: "dtx::client", "ignoring crash report without details");
					return;
				}
				tracing::debug!(target: "dtx::client", "latched app crash report");
				*self.crash.lock() = Some(details);
			}
			kind::APP_NONRESPONSIVE => {
				let thread_dump = envelope
					.params
					.get("threadDump")
					.and_then(Value::as_str)
					.unwrap_or_default()
					.to_string();
				let listener = self.on_nonresponsive.lock().clone();
				match listener {
					Some(listener) => listener(Nonresponsiveness { thread_dump }),
					None => {
						tracing::debug!(target: "dtx::client", "nonresponsiveness report without listener")
					}
				}
			}
			kind::APP_DISCONNECTED => {
				tracing::debug!(target: "dtx::client", "app disconnected");
				self.fail_pending(Error::Transport("app disconnected from the control server".into()));
			}
			kind::APP_CONNECTED => {
				tracing::debug!(target: "dtx::client", "app connected");
			}
			other => {
				tracing::debug!(target: "dtx::client", kind = other, "unhandled notification");
			}
		}
	}

	fn fail_pending(&self, error: Error) {
		let drained: Vec<PendingRequest> = self.pending.lock().drain(..).map(|(_, p)| p).collect();
		for pending in drained {
			let _ = pending.tx.send(Err(error.clone()));
		}
	}
}

fn error_message(params: &Value) -> String {
	params
		.get("error")
		.and_then(Value::as_str)
		.map(str::to_string)
		.unwrap_or_else(|| params.to_string())
}

/// WebSocket implementation of [`ControlClient`].
pub struct WsControlClient {
	endpoint: SessionEndpoint,
	shared: Arc<Shared>,
	outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WsControlClient {
	pub fn new(endpoint: SessionEndpoint) -> Self {
		Self {
			endpoint,
			shared: Arc::new(Shared::new()),
			outbound: Mutex::new(None),
			tasks: Mutex::new(Vec::new()),
		}
	}

	pub fn endpoint(&self) -> &SessionEndpoint {
		&self.endpoint
	}

	/// Returns the number of requests awaiting a reply.
	pub fn pending_count(&self) -> usize {
		self.shared.pending.lock().len()
	}

	fn outbound(&self) -> Result<mpsc::UnboundedSender<Message>> {
		self.outbound.lock().clone().ok_or(Error::ChannelClosed)
	}
}

#[async_trait]
impl ControlClient for WsControlClient {
	async fn connect(&self) -> Result<()> {
		if self.outbound.lock().is_some() {
			return Ok(());
		}

		let server = self.endpoint.server.as_str();
		let (stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(server))
			.await
			.map_err(|_| Error::Timeout(format!("connecting to {server}")))?
			.map_err(|e| Error::ConnectionFailed(format!("{server}: {e}")))?;

		let (mut sink, mut source) = stream.split();
		let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

		let writer = tokio::spawn(async move {
			while let Some(message) = rx.recv().await {
				let closing = matches!(message, Message::Close(_));
				if let Err(e) = sink.send(message).await {
					tracing::debug!(target: "dtx::client", error = %e, "socket write failed");
					break;
				}
				if closing {
					break;
				}
			}
		});

		let shared = Arc::clone(&self.shared);
		let reader = tokio::spawn(async move {
			while let Some(frame) = source.next().await {
				match frame {
					Ok(Message::Text(text)) => shared.dispatch(&text),
					Ok(Message::Close(_)) => break,
					Ok(_) => {}
					Err(e) => {
						tracing::warn!(target: "dtx::client", error = %e, "socket read failed");
						break;
					}
				}
			}
			shared.fail_pending(Error::ChannelClosed);
		});

		*self.outbound.lock() = Some(tx.clone());
		self.tasks.lock().extend([writer, reader]);

		let login = serde_json::to_value(LoginParams {
			session_id: self.endpoint.session_id.clone(),
			role: Role::Tester,
		})?;
		let reply = tokio::time::timeout(LOGIN_TIMEOUT, self.shared.request(&tx, kind::LOGIN, login))
			.await
			.map_err(|_| Error::Timeout(format!("logging into session {}", self.endpoint.session_id)))??;

		let app_connected = reply.get("appConnected").and_then(Value::as_bool).unwrap_or(false);
		tracing::debug!(
			target: "dtx::client",
			server,
			session_id = %self.endpoint.session_id,
			app_connected,
			"logged in"
		);
		Ok(())
	}

	async fn send_action(&self, kind: &str, params: Value) -> Result<Value> {
		let outbound = self.outbound()?;
		self.shared.request(&outbound, kind, params).await
	}

	fn set_nonresponsiveness_listener(&self, listener: NonresponsivenessListener) {
		*self.shared.on_nonresponsive.lock() = Some(listener);
	}

	fn dump_pending_requests(&self, test_name: Option<&str>) {
		let lines: Vec<String> = self
			.shared
			.pending
			.lock()
			.iter()
			.map(|(id, p)| format!("  (id = {id}) {}: {}", p.kind, p.params))
			.collect();
		if lines.is_empty() {
			return;
		}

		let hint = match test_name {
			Some(name) => format!("That might be the reason why the test \"{name}\" has timed out."),
			None => "Unresolved requests will be rejected.".to_string(),
		};
		tracing::warn!(
			target: "dtx::client",
			event = "PENDING_REQUESTS",
			"App has not responded to the network requests below:\n{}\n\n{hint}",
			lines.join("\n")
		);
	}

	fn take_pending_crash(&self) -> Option<String> {
		self.shared.crash.lock().take()
	}

	async fn cleanup(&self) -> Result<()> {
		let outbound = self.outbound.lock().take();
		if let Some(tx) = outbound {
			let _ = tx.send(Message::Close(None));
		}
		self.shared.fail_pending(Error::ChannelClosed);

		let tasks = std::mem::take(&mut *self.tasks.lock());
		for mut task in tasks {
			if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
				task.abort();
			}
		}
		Ok(())
	}
}

impl std::fmt::Debug for WsControlClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WsControlClient")
			.field("endpoint", &self.endpoint)
			.field("connected", &self.outbound.lock().is_some())
			.field("pending", &self.pending_count())
			.finish()
	}
}
