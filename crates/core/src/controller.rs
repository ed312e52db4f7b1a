//! [`SessionController`]: session lifecycle and test-boundary hooks.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init──▶ Initializing ──ok──▶ Ready
//!       ▲                      │
//!       └──────── failure ─────┘
//!
//! any state ──cleanup──▶ CleaningUp ──▶ Terminated ──init──▶ Initializing
//! ```
//!
//! `init` is single-flight: concurrent callers share one run of the init
//! body and its outcome. `cleanup` may overtake a pending `init`; waiters are
//! released with [`Error::AbortedInit`] while the body keeps running in the
//! background. Every cycle carries an epoch, so a body that outlives its
//! cycle releases whatever it still creates instead of handing it to the
//! controller.
//!
//! # Cleanup order
//!
//! 1. abort a pending init
//! 2. flush the artifacts manager
//! 3. dump pending requests and close the control client
//! 4. release the device
//! 5. close the control server, if this controller started it
//!
//! Every step runs even when an earlier one fails. Failures are logged and
//! returned together as [`Error::Cleanup`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dtx_protocol::{InitOptions, InitOverrides, LaunchOptions, SessionConfig, SessionEndpoint, SuiteInfo};
use dtx_runtime::{
	ControlClient, ControlClientFactory, ControlServer, ControlServerFactory, Error, ErrorHandler, EventBus,
	EventName, InitGuard, InitStatus, ListenerError, ListenerId, Nonresponsiveness, RelayServerFactory, Result,
	ServerOptions, WsControlClientFactory,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::artifacts::{ArtifactsFactory, ArtifactsManager, NoopArtifactsFactory};
use crate::device::Device;
use crate::driver::{DeviceDriver, DriverContext, Matchers};
use crate::globals;
use crate::registry::DriverRegistry;
use crate::session::{LocalSessionProvider, SessionProvider, endpoint_url, validate_session};
use crate::validate::{self, SummaryInput};

static NEXT_CONTROLLER_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a [`SessionController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Uninitialized,
	Initializing,
	Ready,
	CleaningUp,
	Terminated,
}

/// What a successful `init` hands to test code.
#[derive(Clone)]
pub struct SessionContext {
	pub device: Arc<Device>,
	pub matchers: Matchers,
	pub session: SessionEndpoint,
}

impl std::fmt::Debug for SessionContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionContext")
			.field("device", &self.device)
			.field("matchers", &self.matchers.keys().collect::<Vec<_>>())
			.field("session", &self.session)
			.finish()
	}
}

/// Collaborators owned by one init → cleanup cycle.
#[derive(Default)]
struct Resources {
	artifacts: Option<Arc<dyn ArtifactsManager>>,
	subscriptions: Vec<(EventName, ListenerId)>,
	client: Option<Arc<dyn ControlClient>>,
	driver: Option<Arc<dyn DeviceDriver>>,
	device: Option<Arc<Device>>,
	server: Option<Arc<dyn ControlServer>>,
	context: Option<SessionContext>,
}

impl Resources {
	fn is_empty(&self) -> bool {
		self.artifacts.is_none()
			&& self.subscriptions.is_empty()
			&& self.client.is_none()
			&& self.driver.is_none()
			&& self.device.is_none()
			&& self.server.is_none()
	}
}

struct Inner {
	id: u64,
	config: SessionConfig,
	registry: DriverRegistry,
	clients: Arc<dyn ControlClientFactory>,
	servers: Arc<dyn ControlServerFactory>,
	artifacts: Arc<dyn ArtifactsFactory>,
	sessions: Arc<dyn SessionProvider>,
	bus: Arc<EventBus>,
	state: Mutex<SessionState>,
	epoch: AtomicU64,
	resources: Mutex<Resources>,
	guard: InitGuard<SessionContext>,
	/// Held while resources are being torn down.
	teardown: tokio::sync::Mutex<()>,
}

/// Orchestrates one test session: control channel, device, artifacts.
///
/// Cheap to clone; clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
	inner: Arc<Inner>,
}

impl SessionController {
	/// Creates a controller with the default collaborators.
	pub fn new(config: SessionConfig) -> Self {
		Self::builder(config).build()
	}

	pub fn builder(config: SessionConfig) -> SessionControllerBuilder {
		SessionControllerBuilder::new(config)
	}

	/// Identifier used to scope the globals this controller installs.
	pub fn id(&self) -> u64 {
		self.inner.id
	}

	pub fn state(&self) -> SessionState {
		*self.inner.state.lock()
	}

	pub fn config(&self) -> &SessionConfig {
		&self.inner.config
	}

	/// Event bus the device emits lifecycle events on.
	pub fn bus(&self) -> &Arc<EventBus> {
		&self.inner.bus
	}

	/// Status of the current init handle, if a cycle is running or done.
	pub fn init_status(&self) -> Option<InitStatus> {
		self.inner.guard.status()
	}

	/// Context of the ready session.
	pub fn context(&self) -> Option<SessionContext> {
		self.inner.resources.lock().context.clone()
	}

	/// Initializes the session, or joins the initialization already running.
	///
	/// Callers racing on a fresh controller share a single run of the init
	/// body. After a failed init the controller is back to
	/// [`SessionState::Uninitialized`] and may be initialized again.
	pub async fn init(&self, overrides: InitOverrides) -> Result<SessionContext> {
		// an init never starts while a teardown is running
		drop(self.inner.teardown.lock().await);

		let inner = Arc::clone(&self.inner);
		let handle = self.inner.guard.begin(move || {
			let epoch = inner.epoch.load(Ordering::SeqCst);
			*inner.state.lock() = SessionState::Initializing;
			debug!(target: "dtx::session", controller = inner.id, epoch, "init started");
			inner.run_init(epoch, overrides)
		});
		handle.wait().await
	}

	/// Tears the session down from any state.
	///
	/// A no-op when nothing was initialized since the last cleanup.
	pub async fn cleanup(&self) -> Result<()> {
		let inner = &self.inner;
		let _teardown = inner.teardown.lock().await;

		if inner.guard.abort_if_pending() {
			debug!(target: "dtx::session", controller = inner.id, "aborted pending init");
		}
		let resources = {
			let mut resources = inner.resources.lock();
			inner.epoch.fetch_add(1, Ordering::SeqCst);
			std::mem::take(&mut *resources)
		};
		let had_cycle = inner.guard.reset().is_some();
		if !had_cycle && resources.is_empty() {
			return Ok(());
		}

		*inner.state.lock() = SessionState::CleaningUp;
		let failures = inner.release(resources).await;
		*inner.state.lock() = SessionState::Terminated;
		debug!(target: "dtx::session", controller = inner.id, failures = failures.len(), "cleanup finished");

		if failures.is_empty() {
			Ok(())
		} else {
			Err(Error::Cleanup(failures))
		}
	}

	/// Marks the start of a test.
	pub async fn before_each(&self, summary: impl Into<SummaryInput>) -> Result<()> {
		self.inner.settle_init().await?;
		let summary = validate::test_summary("beforeEach", summary.into())?;
		debug!(target: "dtx::session", event = "BEFORE_EACH", status = %summary.status, "{}", summary.full_name);

		let parts = self.inner.parts("before_each")?;
		parts.report_unhandled(&summary.full_name, false).await?;
		parts.artifacts.on_test_start(&summary).await
	}

	/// Marks the end of a test.
	///
	/// Pending requests are dumped when the test timed out. A crash latched
	/// since the last boundary is logged and the app relaunched.
	pub async fn after_each(&self, summary: impl Into<SummaryInput>) -> Result<()> {
		self.inner.settle_init().await?;
		let summary = validate::test_summary("afterEach", summary.into())?;
		debug!(target: "dtx::session", event = "AFTER_EACH", status = %summary.status, "{}", summary.full_name);

		let parts = self.inner.parts("after_each")?;
		parts.artifacts.on_test_done(&summary).await?;
		parts.report_unhandled(&summary.full_name, summary.timed_out()).await
	}

	pub async fn suite_start(&self, suite: &SuiteInfo) -> Result<()> {
		self.inner.settle_init().await?;
		let parts = self.inner.parts("suite_start")?;
		parts.artifacts.on_suite_start(suite).await
	}

	pub async fn suite_end(&self, suite: &SuiteInfo) -> Result<()> {
		self.inner.settle_init().await?;
		let parts = self.inner.parts("suite_end")?;
		parts.artifacts.on_suite_end(suite).await
	}
}

impl std::fmt::Debug for SessionController {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionController")
			.field("id", &self.inner.id)
			.field("state", &self.state())
			.field("device", &self.inner.config.device.kind)
			.finish()
	}
}

/// Collaborators a test-boundary call needs.
struct BoundaryParts {
	client: Arc<dyn ControlClient>,
	device: Arc<Device>,
	artifacts: Arc<dyn ArtifactsManager>,
}

impl BoundaryParts {
	async fn report_unhandled(&self, test_name: &str, pending_requests: bool) -> Result<()> {
		if pending_requests {
			self.client.dump_pending_requests(Some(test_name));
		}
		if let Some(crash) = self.client.take_pending_crash().filter(|crash| !crash.is_empty()) {
			error!(
				target: "dtx::session",
				event = "APP_CRASH",
				test = test_name,
				"App crashed in test '{test_name}', here's the native stack trace: \n{crash}"
			);
			self.device.launch_app(LaunchOptions::new_instance()).await?;
		}
		Ok(())
	}
}

impl Inner {
	fn is_current(&self, epoch: u64) -> bool {
		self.epoch.load(Ordering::SeqCst) == epoch
	}

	fn ensure_current(&self, epoch: u64) -> Result<()> {
		if self.is_current(epoch) { Ok(()) } else { Err(Error::AbortedInit) }
	}

	/// Stores into the cycle's resources unless a cleanup overtook `epoch`.
	///
	/// Cleanup bumps the epoch under the same lock, so a store either lands
	/// before cleanup takes the resources or fails.
	fn publish(&self, epoch: u64, store: impl FnOnce(&mut Resources)) -> Result<()> {
		let mut resources = self.resources.lock();
		self.ensure_current(epoch)?;
		store(&mut resources);
		Ok(())
	}

	async fn settle_init(&self) -> Result<()> {
		match self.guard.current() {
			Some(handle) => handle.wait().await.map(drop),
			None => Ok(()),
		}
	}

	fn parts(&self, method: &'static str) -> Result<BoundaryParts> {
		let resources = self.resources.lock();
		let context = resources.context.as_ref();
		match (&resources.client, context, &resources.artifacts) {
			(Some(client), Some(context), Some(artifacts)) => Ok(BoundaryParts {
				client: Arc::clone(client),
				device: Arc::clone(&context.device),
				artifacts: Arc::clone(artifacts),
			}),
			_ => Err(Error::NotInitialized(method)),
		}
	}

	async fn run_init(self: Arc<Self>, epoch: u64, overrides: InitOverrides) -> Result<SessionContext> {
		match self.build_session(epoch, overrides).await {
			Ok(context) => Ok(context),
			Err(err) if !self.is_current(epoch) => {
				debug!(target: "dtx::session", controller = self.id, error = %err, "init finished after cleanup");
				Err(Error::AbortedInit)
			}
			Err(err) => {
				error!(target: "dtx::session", controller = self.id, error = %err, "init failed");
				self.rollback(epoch).await;
				Err(err)
			}
		}
	}

	async fn build_session(&self, epoch: u64, overrides: InitOverrides) -> Result<SessionContext> {
		let config = &self.config;
		let options = InitOptions::default()
			.merged(&config.behavior.init)
			.merged(&overrides);

		let session = match config.external_session() {
			Some(endpoint) => {
				validate_session(endpoint)?;
				endpoint.clone()
			}
			None => self.start_server(epoch).await?,
		};

		let client = self.clients.create(&session);
		self.publish(epoch, |resources| resources.client = Some(Arc::clone(&client)))?;
		client.set_nonresponsiveness_listener(Arc::new(log_nonresponsiveness));
		client.connect().await?;
		if !self.is_current(epoch) {
			// cleanup may have closed the client before it finished connecting
			if let Err(err) = client.cleanup().await {
				debug!(target: "dtx::session", error = %err, "closing orphaned control client failed");
			}
			return Err(Error::AbortedInit);
		}

		let factory = self.registry.resolve(&config.device.kind)?;
		let driver = factory.create(
			DriverContext {
				client: Arc::clone(&client),
				bus: Arc::clone(&self.bus),
			},
			&config.device,
		)?;
		if let Err(err) = self.publish(epoch, |resources| resources.driver = Some(Arc::clone(&driver))) {
			if let Err(cleanup_err) = driver.cleanup().await {
				debug!(target: "dtx::session", error = %cleanup_err, "cleaning up orphaned driver failed");
			}
			return Err(err);
		}

		let matchers = driver.matchers();
		let plugins = driver.declare_artifact_plugins();
		let device = Arc::new(
			Device::new(Arc::clone(&driver), Arc::clone(&self.bus), config.device.clone())
				.with_shutdown_on_release(config.behavior.cleanup.shutdown_device),
		);
		self.publish(epoch, |resources| resources.device = Some(Arc::clone(&device)))?;

		let artifacts = self.artifacts.create(&config.artifacts)?;
		self.publish(epoch, |resources| resources.artifacts = Some(Arc::clone(&artifacts)))?;
		let subscriptions = artifacts.subscribe_to_device_events(&self.bus);
		if let Err(err) = self.publish(epoch, |resources| resources.subscriptions.extend(subscriptions.iter().copied())) {
			for (event, id) in subscriptions {
				self.bus.off(event, id);
			}
			return Err(err);
		}
		artifacts.register_artifact_plugins(plugins);

		device.prepare(&options).await?;
		if !self.is_current(epoch) {
			// released by cleanup while preparing; release what prepare brought up since
			if let Err(err) = device.release().await {
				debug!(target: "dtx::session", error = %err, "releasing orphaned device failed");
			}
			return Err(Error::AbortedInit);
		}

		let context = SessionContext {
			device,
			matchers,
			session,
		};
		if options.init_globals {
			globals::install(self.id, &context);
		}
		let published = self.publish(epoch, |resources| {
			resources.context = Some(context.clone());
			*self.state.lock() = SessionState::Ready;
		});
		if let Err(err) = published {
			globals::clear_if_owned(self.id);
			return Err(err);
		}

		info!(
			target: "dtx::session",
			controller = self.id,
			device = %context.device.name(),
			session_id = %context.session.session_id,
			"session ready"
		);
		Ok(context)
	}

	/// Starts the control server for a session the configuration did not supply.
	async fn start_server(&self, epoch: u64) -> Result<SessionEndpoint> {
		let proposed = self.sessions.default_session().await?;
		validate_session(&proposed)?;

		let mut url = endpoint_url(&proposed)?;
		let options = ServerOptions {
			host: url
				.host_str()
				.map(|host| host.trim_start_matches('[').trim_end_matches(']'))
				.unwrap_or("127.0.0.1")
				.to_string(),
			port: url.port_or_known_default().unwrap_or(0),
			standalone: false,
		};
		let server = self.servers.start(options).await?;
		if let Err(err) = self.publish(epoch, |resources| resources.server = Some(Arc::clone(&server))) {
			if let Err(close_err) = server.close().await {
				debug!(target: "dtx::session", error = %close_err, "closing orphaned control server failed");
			}
			return Err(err);
		}

		if url.port() != Some(server.port()) {
			let _ = url.set_port(Some(server.port()));
		}
		let server_url = url.as_str().trim_end_matches('/').to_string();
		debug!(target: "dtx::session", server = %server_url, "control server started");
		Ok(SessionEndpoint::new(server_url, proposed.session_id))
	}

	/// Releases a failed cycle so the controller can be initialized again.
	async fn rollback(&self, epoch: u64) {
		let _teardown = self.teardown.lock().await;
		let resources = {
			let mut resources = self.resources.lock();
			if !self.is_current(epoch) {
				return;
			}
			self.epoch.fetch_add(1, Ordering::SeqCst);
			*self.state.lock() = SessionState::Uninitialized;
			std::mem::take(&mut *resources)
		};
		self.guard.reset();

		let failures = self.release(resources).await;
		if !failures.is_empty() {
			warn!(target: "dtx::session", controller = self.id, failures = failures.len(), "rollback after failed init was incomplete");
		}
	}

	/// Runs the cleanup steps over `resources`, returning each failed step.
	async fn release(&self, resources: Resources) -> Vec<String> {
		let Resources {
			artifacts,
			subscriptions,
			client,
			driver,
			device,
			server,
			context: _,
		} = resources;
		let mut failures = Vec::new();

		if let Some(artifacts) = artifacts {
			record(&mut failures, "artifacts", artifacts.on_before_cleanup().await);
		}
		for (event, id) in subscriptions {
			self.bus.off(event, id);
		}

		if let Some(client) = client {
			client.dump_pending_requests(None);
			record(&mut failures, "control client", client.cleanup().await);
		}

		match (device, driver) {
			(Some(device), _) => record(&mut failures, "device", device.release().await),
			(None, Some(driver)) => record(&mut failures, "device driver", driver.cleanup().await),
			(None, None) => {}
		}
		globals::clear_if_owned(self.id);

		if let Some(server) = server {
			record(&mut failures, "control server", server.close().await);
		}
		failures
	}
}

fn record(failures: &mut Vec<String>, step: &str, outcome: Result<()>) {
	if let Err(err) = outcome {
		error!(target: "dtx::session", step, error = %err, "cleanup step failed");
		failures.push(format!("{step}: {err}"));
	}
}

fn log_nonresponsiveness(report: Nonresponsiveness) {
	warn!(
		target: "dtx::session",
		event = "APP_NONRESPONSIVE",
		"Application nonresponsiveness detected! On Android this may be an ANR dialog, which fails the running test.\n\
		 Main-thread stack trace reported by the device (see the device logs for the full thread dump):\n{}",
		report.thread_dump
	);
}

/// Builder for [`SessionController`].
pub struct SessionControllerBuilder {
	config: SessionConfig,
	registry: DriverRegistry,
	clients: Arc<dyn ControlClientFactory>,
	servers: Arc<dyn ControlServerFactory>,
	artifacts: Arc<dyn ArtifactsFactory>,
	sessions: Arc<dyn SessionProvider>,
	on_listener_error: Option<ErrorHandler>,
}

impl SessionControllerBuilder {
	fn new(config: SessionConfig) -> Self {
		Self {
			config,
			registry: DriverRegistry::new(),
			clients: Arc::new(WsControlClientFactory),
			servers: Arc::new(RelayServerFactory),
			artifacts: Arc::new(NoopArtifactsFactory),
			sessions: Arc::new(LocalSessionProvider::default()),
			on_listener_error: None,
		}
	}

	pub fn registry(mut self, registry: DriverRegistry) -> Self {
		self.registry = registry;
		self
	}

	pub fn client_factory(mut self, factory: Arc<dyn ControlClientFactory>) -> Self {
		self.clients = factory;
		self
	}

	pub fn server_factory(mut self, factory: Arc<dyn ControlServerFactory>) -> Self {
		self.servers = factory;
		self
	}

	pub fn artifacts_factory(mut self, factory: Arc<dyn ArtifactsFactory>) -> Self {
		self.artifacts = factory;
		self
	}

	pub fn session_provider(mut self, provider: Arc<dyn SessionProvider>) -> Self {
		self.sessions = provider;
		self
	}

	/// Routes event listener failures to `handler` instead of the error log.
	pub fn on_listener_error<F>(mut self, handler: F) -> Self
	where
		F: Fn(&ListenerError) + Send + Sync + 'static,
	{
		self.on_listener_error = Some(Arc::new(handler));
		self
	}

	pub fn build(self) -> SessionController {
		let bus = match self.on_listener_error {
			Some(handler) => EventBus::with_error_handler(handler),
			None => EventBus::new(),
		};
		SessionController {
			inner: Arc::new(Inner {
				id: NEXT_CONTROLLER_ID.fetch_add(1, Ordering::SeqCst),
				config: self.config,
				registry: self.registry,
				clients: self.clients,
				servers: self.servers,
				artifacts: self.artifacts,
				sessions: self.sessions,
				bus: Arc::new(bus),
				state: Mutex::new(SessionState::Uninitialized),
				epoch: AtomicU64::new(0),
				resources: Mutex::new(Resources::default()),
				guard: InitGuard::new(),
				teardown: tokio::sync::Mutex::new(()),
			}),
		}
	}
}

impl std::fmt::Debug for SessionControllerBuilder {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionControllerBuilder")
			.field("config", &self.config)
			.field("registry", &self.registry)
			.finish_non_exhaustive()
	}
}
