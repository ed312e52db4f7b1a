//! Control server relaying frames between tester and app.
//!
//! Each WebSocket logs into a session with a [`Role`]. After login every text
//! frame is forwarded to the counterpart role of the same session. Frames for
//! a counterpart that has not logged in yet are queued and flushed on its
//! login. When the app goes away the tester is told with `appDisconnected`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::routing::get;
use dtx_protocol::{Envelope, LoginParams, Role, kind};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};

/// Options for starting a control server.
#[derive(Debug, Clone)]
pub struct ServerOptions {
	pub host: String,
	/// Port to bind; 0 picks an ephemeral port.
	pub port: u16,
	/// Runs detached from any session controller (log at info level).
	pub standalone: bool,
}

impl ServerOptions {
	pub fn local(port: u16) -> Self {
		Self {
			host: "127.0.0.1".to_string(),
			port,
			standalone: false,
		}
	}
}

/// A running control server.
#[async_trait]
pub trait ControlServer: Send + Sync {
	/// Port the server is listening on.
	fn port(&self) -> u16;

	/// Stops accepting connections and drops connected peers.
	async fn close(&self) -> Result<()>;
}

/// Starts control servers on demand.
#[async_trait]
pub trait ControlServerFactory: Send + Sync {
	async fn start(&self, options: ServerOptions) -> Result<Arc<dyn ControlServer>>;
}

type PeerTx = mpsc::UnboundedSender<Message>;

#[derive(Default)]
struct SessionSlot {
	tester: Option<PeerTx>,
	app: Option<PeerTx>,
	to_tester: VecDeque<String>,
	to_app: VecDeque<String>,
}

impl SessionSlot {
	fn peer(&mut self, role: Role) -> &mut Option<PeerTx> {
		match role {
			Role::Tester => &mut self.tester,
			Role::App => &mut self.app,
		}
	}

	fn backlog(&mut self, role: Role) -> &mut VecDeque<String> {
		match role {
			Role::Tester => &mut self.to_tester,
			Role::App => &mut self.to_app,
		}
	}

	fn is_empty(&self) -> bool {
		self.tester.is_none() && self.app.is_none()
	}
}

#[derive(Default)]
struct RelayState {
	sessions: HashMap<String, SessionSlot>,
}

struct Shared {
	state: Mutex<RelayState>,
	shutdown: watch::Receiver<bool>,
}

type SharedState = Arc<Shared>;

/// WebSocket relay implementing [`ControlServer`].
pub struct RelayServer {
	port: u16,
	shutdown_tx: watch::Sender<bool>,
	stop_tx: Mutex<Option<oneshot::Sender<()>>>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
	/// Binds the listener and starts serving in the background.
	pub async fn start(options: ServerOptions) -> Result<Self> {
		let listener = TcpListener::bind((options.host.as_str(), options.port))
			.await
			.map_err(|e| Error::Server(format!("failed to bind {}:{}: {e}", options.host, options.port)))?;
		let port = listener.local_addr()?.port();

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let state = Arc::new(Shared {
			state: Mutex::new(RelayState::default()),
			shutdown: shutdown_rx,
		});

		let app = Router::new()
			.route(
				"/",
				get(|ws: WebSocketUpgrade, State(state): State<SharedState>| async move {
					ws.on_upgrade(|socket| handle_socket(socket, state))
				}),
			)
			.with_state(state);

		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let task = tokio::spawn(async move {
			let serve = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async {
				let _ = stop_rx.await;
			});
			if let Err(e) = serve.await {
				warn!(target: "dtx::server", error = %e, "control server stopped with error");
			}
		});

		if options.standalone {
			info!(target: "dtx::server", port, "control server listening");
		} else {
			debug!(target: "dtx::server", port, "control server listening");
		}

		Ok(Self {
			port,
			shutdown_tx,
			stop_tx: Mutex::new(Some(stop_tx)),
			task: Mutex::new(Some(task)),
		})
	}

	/// Resolves once the server task exits.
	pub async fn wait(&self) {
		let task = self.task.lock().take();
		if let Some(task) = task {
			let _ = task.await;
		}
	}
}

#[async_trait]
impl ControlServer for RelayServer {
	fn port(&self) -> u16 {
		self.port
	}

	async fn close(&self) -> Result<()> {
		let _ = self.shutdown_tx.send(true);
		let stop = self.stop_tx.lock().take();
		if let Some(stop) = stop {
			let _ = stop.send(());
		}
		let task = self.task.lock().take();
		if let Some(task) = task {
			task.await
				.map_err(|e| Error::Server(format!("server task failed: {e}")))?;
		}
		debug!(target: "dtx::server", port = self.port, "control server closed");
		Ok(())
	}
}

impl std::fmt::Debug for RelayServer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RelayServer").field("port", &self.port).finish()
	}
}

/// Default [`ControlServerFactory`] producing [`RelayServer`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelayServerFactory;

#[async_trait]
impl ControlServerFactory for RelayServerFactory {
	async fn start(&self, options: ServerOptions) -> Result<Arc<dyn ControlServer>> {
		Ok(Arc::new(RelayServer::start(options).await?))
	}
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
	let (mut ws_tx, mut ws_rx) = socket.split();
	let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
	let mut shutdown = state.shutdown.clone();

	let send_task = tokio::spawn(async move {
		while let Some(msg) = rx.recv().await {
			if ws_tx.send(msg).await.is_err() {
				break;
			}
		}
		let _ = ws_tx.close().await;
	});

	let mut login: Option<LoginParams> = None;

	loop {
		let frame = tokio::select! {
			frame = ws_rx.next() => frame,
			_ = shutdown.changed() => break,
		};
		let text = match frame {
			Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
			Some(Ok(Message::Close(_))) | None => break,
			Some(Ok(_)) => continue,
			Some(Err(err)) => {
				debug!(target: "dtx::server", error = %err, "peer socket error");
				break;
			}
		};

		match &login {
			Some(params) => relay(&state, params, text),
			None => match accept_login(&state, &tx, &text) {
				Ok(params) => login = Some(params),
				Err(err) => {
					warn!(target: "dtx::server", error = %err, "rejecting frame before login");
					let _ = tx.send(Message::Text(
						envelope_text(&Envelope::new(kind::ERROR, json!({ "error": err.to_string() }))).into(),
					));
				}
			},
		}
	}

	if let Some(params) = login {
		disconnect(&state, &params, &tx);
	}
	drop(tx);
	let _ = send_task.await;
}

fn accept_login(state: &SharedState, tx: &PeerTx, text: &str) -> Result<LoginParams> {
	let envelope: Envelope = serde_json::from_str(text)?;
	if !envelope.is(kind::LOGIN) {
		return Err(Error::Protocol(format!("expected login, got '{}'", envelope.kind)));
	}
	let params: LoginParams = serde_json::from_value(envelope.params)?;

	let mut relay_state = state.state.lock();
	let slot = relay_state.sessions.entry(params.session_id.clone()).or_default();
	if slot.peer(params.role).is_some() {
		warn!(target: "dtx::server", session_id = %params.session_id, role = ?params.role, "replacing existing peer");
	}
	*slot.peer(params.role) = Some(tx.clone());

	let counterpart_connected = slot.peer(params.role.counterpart()).is_some();
	let mut reply = Envelope::new(
		kind::LOGGED_IN,
		json!({
			"sessionId": params.session_id,
			"role": params.role,
			"appConnected": params.role == Role::App || counterpart_connected,
		}),
	);
	reply.message_id = envelope.message_id;
	let _ = tx.send(Message::Text(envelope_text(&reply).into()));

	for queued in slot.backlog(params.role).drain(..) {
		let _ = tx.send(Message::Text(queued.into()));
	}
	if params.role == Role::App {
		if let Some(tester) = slot.tester.as_ref() {
			let _ = tester.send(Message::Text(
				envelope_text(&Envelope::new(kind::APP_CONNECTED, json!({}))).into(),
			));
		}
	}

	debug!(target: "dtx::server", session_id = %params.session_id, role = ?params.role, "peer logged in");
	Ok(params)
}

fn relay(state: &SharedState, from: &LoginParams, text: String) {
	let mut relay_state = state.state.lock();
	let Some(slot) = relay_state.sessions.get_mut(&from.session_id) else {
		return;
	};
	let to = from.role.counterpart();
	trace!(target: "dtx::server", session_id = %from.session_id, from = ?from.role, len = text.len(), "relaying frame");
	match slot.peer(to).as_ref() {
		Some(peer) => {
			let _ = peer.send(Message::Text(text.into()));
		}
		None => {
			debug!(target: "dtx::server", session_id = %from.session_id, to = ?to, "queueing frame for absent peer");
			slot.backlog(to).push_back(text);
		}
	}
}

fn disconnect(state: &SharedState, params: &LoginParams, tx: &PeerTx) {
	let mut relay_state = state.state.lock();
	let Some(slot) = relay_state.sessions.get_mut(&params.session_id) else {
		return;
	};
	// a newer login for the same role owns the slot now
	if !slot.peer(params.role).as_ref().is_some_and(|peer| peer.same_channel(tx)) {
		return;
	}
	*slot.peer(params.role) = None;
	if params.role == Role::App {
		if let Some(tester) = slot.tester.as_ref() {
			let _ = tester.send(Message::Text(
				envelope_text(&Envelope::new(kind::APP_DISCONNECTED, json!({}))).into(),
			));
		}
	}
	if slot.is_empty() {
		relay_state.sessions.remove(&params.session_id);
	}
	debug!(target: "dtx::server", session_id = %params.session_id, role = ?params.role, "peer disconnected");
}

fn envelope_text(envelope: &Envelope) -> String {
	serde_json::to_string(envelope).unwrap_or_else(|_| format!("{{\"type\":\"{}\"}}", envelope.kind))
}
