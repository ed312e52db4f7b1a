// Shared fakes for session controller tests.
//
// Every collaborator writes what it was asked to do into one `Journal`, so
// tests can assert on the interleaving across collaborators.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dtx::{
	ArtifactPlugin, ArtifactPlugins, ArtifactsConfig, ArtifactsManager, ControlClient, ControlClientFactory,
	ControlServer, ControlServerFactory, DeviceConfig, DeviceDriver, DriverContext, DriverRegistry, Error, EventBus,
	EventName, ListenerId, Matcher, Matchers, Result, SessionConfig, SessionController, SessionEndpoint,
	SessionProvider, SuiteInfo, TestSummary, listener,
};
use dtx_runtime::{NonresponsivenessListener, ServerOptions};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::watch;
use tracing_subscriber::fmt::MakeWriter;

pub const DEVICE_TYPE: &str = "fake.device";
pub const SERVER_PORT: u16 = 4321;

/// Ordered record of collaborator calls.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
	pub fn push(&self, entry: impl Into<String>) {
		self.0.lock().push(entry.into());
	}

	pub fn entries(&self) -> Vec<String> {
		self.0.lock().clone()
	}

	pub fn count(&self, entry: &str) -> usize {
		self.0.lock().iter().filter(|e| e.as_str() == entry).count()
	}

	pub fn contains(&self, entry: &str) -> bool {
		self.count(entry) > 0
	}

	pub fn clear(&self) {
		self.0.lock().clear();
	}

	/// Entries starting with `prefix`, in order.
	pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
		self.0
			.lock()
			.iter()
			.filter(|e| e.starts_with(prefix))
			.cloned()
			.collect()
	}

	/// Polls until `entry` shows up.
	pub async fn wait_for(&self, entry: &str) {
		for _ in 0..400 {
			if self.contains(entry) {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("journal never recorded {entry:?}: {:?}", self.entries());
	}
}

/// Blocks callers until opened.
#[derive(Clone)]
pub struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
	pub fn closed() -> Self {
		let (tx, _) = watch::channel(false);
		Self(Arc::new(tx))
	}

	pub fn open(&self) {
		self.0.send_replace(true);
	}

	pub async fn pass(&self) {
		let mut rx = self.0.subscribe();
		let _ = rx.wait_for(|open| *open).await;
	}
}

/// Switches shared by every fake of one harness.
#[derive(Default)]
pub struct Knobs {
	pub connect_gate: Mutex<Option<Gate>>,
	pub acquire_gate: Mutex<Option<Gate>>,
	pub fail_connect: AtomicBool,
	pub fail_flush: AtomicBool,
	pub fail_client_cleanup: AtomicBool,
	pub fail_device_cleanup: AtomicBool,
	pub fail_server_close: AtomicBool,
	pub driver_creations: AtomicUsize,
	pub server_starts: AtomicUsize,
}

pub struct FakeClient {
	journal: Journal,
	knobs: Arc<Knobs>,
	crash: Mutex<Option<String>>,
	nonresponsiveness: Mutex<Option<NonresponsivenessListener>>,
}

impl FakeClient {
	/// Latches a crash report, as the app would before terminating.
	pub fn crash(&self, details: &str) {
		*self.crash.lock() = Some(details.to_string());
	}

	/// Delivers a nonresponsiveness report to the registered listener.
	pub fn report_nonresponsive(&self, thread_dump: &str) {
		let listener = self.nonresponsiveness.lock().clone();
		let listener = listener.expect("no nonresponsiveness listener registered");
		listener(dtx::Nonresponsiveness {
			thread_dump: thread_dump.to_string(),
		});
	}
}

#[async_trait]
impl ControlClient for FakeClient {
	async fn connect(&self) -> Result<()> {
		self.journal.push("client.connect");
		let gate = self.knobs.connect_gate.lock().clone();
		if let Some(gate) = gate {
			gate.pass().await;
		}
		if self.knobs.fail_connect.load(Ordering::SeqCst) {
			return Err(Error::ConnectionFailed("refused".into()));
		}
		Ok(())
	}

	async fn send_action(&self, kind: &str, _params: Value) -> Result<Value> {
		self.journal.push(format!("client.send:{kind}"));
		Ok(json!({}))
	}

	fn set_nonresponsiveness_listener(&self, listener: NonresponsivenessListener) {
		*self.nonresponsiveness.lock() = Some(listener);
	}

	fn dump_pending_requests(&self, test_name: Option<&str>) {
		self.journal.push(format!("client.dump:{}", test_name.unwrap_or("-")));
	}

	fn take_pending_crash(&self) -> Option<String> {
		self.crash.lock().take()
	}

	async fn cleanup(&self) -> Result<()> {
		self.journal.push("client.cleanup");
		if self.knobs.fail_client_cleanup.load(Ordering::SeqCst) {
			return Err(Error::Transport("socket already gone".into()));
		}
		Ok(())
	}
}

struct FakeClientFactory {
	journal: Journal,
	client: Arc<FakeClient>,
}

impl ControlClientFactory for FakeClientFactory {
	fn create(&self, endpoint: &SessionEndpoint) -> Arc<dyn ControlClient> {
		self.journal.push(format!("client.create:{}", endpoint.server));
		Arc::clone(&self.client) as Arc<dyn ControlClient>
	}
}

struct FakeServer {
	journal: Journal,
	knobs: Arc<Knobs>,
	port: u16,
}

#[async_trait]
impl ControlServer for FakeServer {
	fn port(&self) -> u16 {
		self.port
	}

	async fn close(&self) -> Result<()> {
		self.journal.push("server.close");
		if self.knobs.fail_server_close.load(Ordering::SeqCst) {
			return Err(Error::Server("close failed".into()));
		}
		Ok(())
	}
}

struct FakeServerFactory {
	journal: Journal,
	knobs: Arc<Knobs>,
}

#[async_trait]
impl ControlServerFactory for FakeServerFactory {
	async fn start(&self, options: ServerOptions) -> Result<Arc<dyn ControlServer>> {
		self.knobs.server_starts.fetch_add(1, Ordering::SeqCst);
		self.journal.push(format!("server.start:{}", options.port));
		Ok(Arc::new(FakeServer {
			journal: self.journal.clone(),
			knobs: Arc::clone(&self.knobs),
			port: options.port,
		}))
	}
}

struct FakeSessionProvider;

#[async_trait]
impl SessionProvider for FakeSessionProvider {
	async fn default_session(&self) -> Result<SessionEndpoint> {
		Ok(SessionEndpoint::new(format!("ws://127.0.0.1:{SERVER_PORT}"), "fake-session"))
	}
}

pub struct ScreenshotPlugin;

impl ArtifactPlugin for ScreenshotPlugin {
	fn name(&self) -> &str {
		"screenshot"
	}
}

pub struct FakeDriver {
	journal: Journal,
	knobs: Arc<Knobs>,
}

impl FakeDriver {
	pub fn new(journal: Journal, knobs: Arc<Knobs>) -> Self {
		Self { journal, knobs }
	}
}

#[async_trait]
impl DeviceDriver for FakeDriver {
	fn name(&self) -> &str {
		DEVICE_TYPE
	}

	fn matchers(&self) -> Matchers {
		let by_id: Matcher = Arc::new(|query| Ok(json!({ "by": "id", "value": query })));
		Matchers::from([("by.id".to_string(), by_id)])
	}

	fn declare_artifact_plugins(&self) -> ArtifactPlugins {
		ArtifactPlugins::from([(
			"screenshot".to_string(),
			Arc::new(ScreenshotPlugin) as Arc<dyn ArtifactPlugin>,
		)])
	}

	async fn acquire_device(&self, _config: &DeviceConfig) -> Result<String> {
		self.journal.push("driver.acquire");
		let gate = self.knobs.acquire_gate.lock().clone();
		if let Some(gate) = gate {
			gate.pass().await;
		}
		Ok("emulator-5554".into())
	}

	async fn install_app(&self, _device_id: &str) -> Result<()> {
		self.journal.push("driver.install");
		Ok(())
	}

	async fn uninstall_app(&self, _device_id: &str) -> Result<()> {
		self.journal.push("driver.uninstall");
		Ok(())
	}

	async fn launch_app(&self, _device_id: &str, _launch_args: &Map<String, Value>) -> Result<Option<u32>> {
		self.journal.push("driver.launch");
		Ok(Some(4242))
	}

	async fn terminate_app(&self, _device_id: &str) -> Result<()> {
		self.journal.push("driver.terminate");
		Ok(())
	}

	async fn wait_until_ready(&self, _device_id: &str) -> Result<()> {
		self.journal.push("driver.ready");
		Ok(())
	}

	async fn shutdown(&self, _device_id: &str) -> Result<()> {
		self.journal.push("driver.shutdown");
		Ok(())
	}

	async fn take_screenshot(&self, _device_id: &str, name: &str) -> Result<Option<String>> {
		self.journal.push(format!("driver.screenshot:{name}"));
		Ok(Some(format!("/tmp/{name}.png")))
	}

	async fn cleanup(&self) -> Result<()> {
		self.journal.push("driver.cleanup");
		if self.knobs.fail_device_cleanup.load(Ordering::SeqCst) {
			return Err(Error::Device("simulator refused to shut down".into()));
		}
		Ok(())
	}
}

pub struct FakeArtifacts {
	journal: Journal,
	knobs: Arc<Knobs>,
}

#[async_trait]
impl ArtifactsManager for FakeArtifacts {
	fn subscribe_to_device_events(&self, bus: &EventBus) -> Vec<(EventName, ListenerId)> {
		[EventName::BootDevice, EventName::AppReady, EventName::CreateExternalArtifact]
			.into_iter()
			.map(|event| {
				let journal = self.journal.clone();
				let id = bus.subscribe(
					event,
					listener(move |_payload| {
						let journal = journal.clone();
						async move {
							journal.push(format!("artifacts.event:{event}"));
							Ok(())
						}
					}),
				);
				(event, id)
			})
			.collect()
	}

	fn register_artifact_plugins(&self, plugins: ArtifactPlugins) {
		let names: Vec<&str> = plugins.values().map(|plugin| plugin.name()).collect();
		self.journal.push(format!("artifacts.plugins:{}", names.join(",")));
	}

	async fn on_test_start(&self, test: &TestSummary) -> Result<()> {
		self.journal.push(format!("artifacts.test_start:{}", test.full_name));
		Ok(())
	}

	async fn on_test_done(&self, test: &TestSummary) -> Result<()> {
		self.journal.push(format!("artifacts.test_done:{}", test.full_name));
		Ok(())
	}

	async fn on_suite_start(&self, suite: &SuiteInfo) -> Result<()> {
		self.journal.push(format!("artifacts.suite_start:{}", suite.name));
		Ok(())
	}

	async fn on_suite_end(&self, suite: &SuiteInfo) -> Result<()> {
		self.journal.push(format!("artifacts.suite_end:{}", suite.name));
		Ok(())
	}

	async fn on_before_cleanup(&self) -> Result<()> {
		self.journal.push("artifacts.flush");
		if self.knobs.fail_flush.load(Ordering::SeqCst) {
			return Err(Error::Artifacts("disk full".into()));
		}
		Ok(())
	}
}

/// Fakes wired into a controller.
pub struct Harness {
	pub journal: Journal,
	pub knobs: Arc<Knobs>,
	pub client: Arc<FakeClient>,
}

impl Harness {
	pub fn new() -> Self {
		let journal = Journal::default();
		let knobs = Arc::new(Knobs::default());
		let client = Arc::new(FakeClient {
			journal: journal.clone(),
			knobs: Arc::clone(&knobs),
			crash: Mutex::new(None),
			nonresponsiveness: Mutex::new(None),
		});
		Self { journal, knobs, client }
	}

	/// Config for the fake device, without app reinstall.
	pub fn config() -> SessionConfig {
		let mut config = SessionConfig::for_device(DEVICE_TYPE);
		config.behavior.init = config.behavior.init.reinstall_app(false);
		config
	}

	pub fn registry(&self) -> DriverRegistry {
		let journal = self.journal.clone();
		let knobs = Arc::clone(&self.knobs);
		let mut registry = DriverRegistry::new();
		registry
			.register(DEVICE_TYPE, move |_context: DriverContext, _config: &DeviceConfig| {
				knobs.driver_creations.fetch_add(1, Ordering::SeqCst);
				Ok(Arc::new(FakeDriver {
					journal: journal.clone(),
					knobs: Arc::clone(&knobs),
				}) as Arc<dyn DeviceDriver>)
			})
			.expect("fake device type is not built in");
		registry
	}

	pub fn controller(&self, config: SessionConfig) -> SessionController {
		let artifacts_journal = self.journal.clone();
		let artifacts_knobs = Arc::clone(&self.knobs);
		SessionController::builder(config)
			.registry(self.registry())
			.client_factory(Arc::new(FakeClientFactory {
				journal: self.journal.clone(),
				client: Arc::clone(&self.client),
			}))
			.server_factory(Arc::new(FakeServerFactory {
				journal: self.journal.clone(),
				knobs: Arc::clone(&self.knobs),
			}))
			.artifacts_factory(Arc::new(
				move |_config: &ArtifactsConfig| -> Result<Arc<dyn ArtifactsManager>> {
					Ok(Arc::new(FakeArtifacts {
						journal: artifacts_journal.clone(),
						knobs: Arc::clone(&artifacts_knobs),
					}))
				},
			))
			.session_provider(Arc::new(FakeSessionProvider))
			.build()
	}
}

/// Captured formatted log output.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
	pub fn contents(&self) -> String {
		String::from_utf8_lossy(&self.0.lock()).into_owned()
	}
}

pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.0.lock().extend_from_slice(buf);
		Ok(buf.len())
	}

	fn flush(&mut self) -> io::Result<()> {
		Ok(())
	}
}

impl<'a> MakeWriter<'a> for LogBuffer {
	type Writer = LogWriter;

	fn make_writer(&'a self) -> Self::Writer {
		LogWriter(Arc::clone(&self.0))
	}
}

/// Routes this thread's logs into a buffer until the guard drops.
///
/// Only sees events from the current thread, so use it from
/// current-thread runtimes.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
	let buffer = LogBuffer::default();
	let subscriber = tracing_subscriber::fmt()
		.with_writer(buffer.clone())
		.with_ansi(false)
		.with_max_level(tracing::Level::TRACE)
		.finish();
	let guard = tracing::subscriber::set_default(subscriber);
	(buffer, guard)
}
