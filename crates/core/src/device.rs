//! [`Device`] facade over a [`DeviceDriver`].
//!
//! The facade owns the device id and app pid for a session and brackets each
//! driver call with the matching [`EventName`]s on the session bus:
//!
//! | operation         | events                                             |
//! |-------------------|----------------------------------------------------|
//! | `prepare`         | `bootDevice`, `beforeUninstallApp` (on reinstall)  |
//! | `launch_app`      | `beforeLaunchApp`, `launchApp`, `appReady`         |
//! | `terminate_app`   | `beforeTerminateApp`, `terminateApp`               |
//! | `shutdown`        | `beforeShutdownDevice`, `shutdownDevice`           |
//! | `take_screenshot` | `createExternalArtifact`                           |

use std::sync::Arc;

use dtx_protocol::{DeviceConfig, InitOptions, LaunchOptions};
use dtx_runtime::{Error, EventBus, EventName, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::driver::DeviceDriver;

#[derive(Debug, Default)]
struct DeviceState {
	id: Option<String>,
	pid: Option<u32>,
}

/// Device under test, as seen by the session and by test code.
pub struct Device {
	driver: Arc<dyn DeviceDriver>,
	bus: Arc<EventBus>,
	config: DeviceConfig,
	shutdown_on_release: bool,
	state: Mutex<DeviceState>,
}

impl Device {
	pub fn new(driver: Arc<dyn DeviceDriver>, bus: Arc<EventBus>, config: DeviceConfig) -> Self {
		Self {
			driver,
			bus,
			config,
			shutdown_on_release: false,
			state: Mutex::new(DeviceState::default()),
		}
	}

	/// Shuts the device down as part of [`release`](Self::release).
	pub fn with_shutdown_on_release(mut self, shutdown: bool) -> Self {
		self.shutdown_on_release = shutdown;
		self
	}

	/// Device type the driver was resolved for.
	pub fn name(&self) -> &str {
		self.driver.name()
	}

	pub fn driver(&self) -> &Arc<dyn DeviceDriver> {
		&self.driver
	}

	/// Id of the acquired device, once prepared.
	pub fn id(&self) -> Option<String> {
		self.state.lock().id.clone()
	}

	/// Pid of the running app, when the driver reported one.
	pub fn pid(&self) -> Option<u32> {
		self.state.lock().pid
	}

	/// Acquires the device, optionally reinstalls the app, and launches it.
	pub async fn prepare(&self, options: &InitOptions) -> Result<()> {
		let id = self.driver.acquire_device(&self.config).await?;
		self.state.lock().id = Some(id.clone());
		debug!(target: "dtx::device", device_id = %id, kind = %self.config.kind, "device acquired");
		self.emit(EventName::BootDevice, json!({ "deviceId": id, "type": self.config.kind }))
			.await;

		if options.reinstall_app {
			self.emit(EventName::BeforeUninstallApp, self.app_payload(&id)).await;
			self.driver.uninstall_app(&id).await?;
			self.driver.install_app(&id).await?;
		}

		if options.launch_app {
			self.launch_app(LaunchOptions::default()).await?;
		}
		Ok(())
	}

	/// Launches the app and waits until it reports ready.
	///
	/// With `new_instance` a running instance is terminated first.
	pub async fn launch_app(&self, options: LaunchOptions) -> Result<()> {
		let id = self.require_id()?;
		if options.new_instance {
			self.terminate_app().await?;
		}

		let mut launch_args = self.config.launch_args.clone();
		launch_args.extend(options.launch_args);

		let mut payload = self.app_payload(&id);
		payload["launchArgs"] = Value::Object(launch_args.clone());
		self.emit(EventName::BeforeLaunchApp, payload.clone()).await;

		let pid = self.driver.launch_app(&id, &launch_args).await?;
		self.state.lock().pid = pid;
		payload["pid"] = json!(pid);
		self.emit(EventName::LaunchApp, payload).await;

		self.driver.wait_until_ready(&id).await?;
		let mut ready = self.app_payload(&id);
		ready["pid"] = json!(pid);
		self.emit(EventName::AppReady, ready).await;
		debug!(target: "dtx::device", device_id = %id, ?pid, "app ready");
		Ok(())
	}

	pub async fn terminate_app(&self) -> Result<()> {
		let id = self.require_id()?;
		let payload = self.app_payload(&id);
		self.emit(EventName::BeforeTerminateApp, payload.clone()).await;
		self.driver.terminate_app(&id).await?;
		self.state.lock().pid = None;
		self.emit(EventName::TerminateApp, payload).await;
		Ok(())
	}

	/// Shuts the device down; the facade needs a new `prepare` afterwards.
	pub async fn shutdown(&self) -> Result<()> {
		let id = self.require_id()?;
		let payload = json!({ "deviceId": id });
		self.emit(EventName::BeforeShutdownDevice, payload.clone()).await;
		self.driver.shutdown(&id).await?;
		*self.state.lock() = DeviceState::default();
		self.emit(EventName::ShutdownDevice, payload).await;
		Ok(())
	}

	/// Captures a screenshot and announces it as an external artifact.
	pub async fn take_screenshot(&self, name: &str) -> Result<Option<String>> {
		let id = self.require_id()?;
		let path = self.driver.take_screenshot(&id, name).await?;
		if let Some(path) = &path {
			self.emit(
				EventName::CreateExternalArtifact,
				json!({ "pluginId": "screenshot", "artifactName": name, "artifactPath": path }),
			)
			.await;
		}
		Ok(path)
	}

	/// Releases the driver, shutting the device down first when configured.
	///
	/// Both steps run even if the shutdown fails; the first failure is returned.
	pub async fn release(&self) -> Result<()> {
		let shutdown = if self.shutdown_on_release && self.id().is_some() {
			self.shutdown().await
		} else {
			Ok(())
		};
		let cleanup = self.driver.cleanup().await;
		debug!(target: "dtx::device", kind = %self.config.kind, "device released");
		shutdown.and(cleanup)
	}

	fn require_id(&self) -> Result<String> {
		self.id()
			.ok_or_else(|| Error::Device(format!("{} device has not been prepared", self.config.kind)))
	}

	fn app_payload(&self, device_id: &str) -> Value {
		let mut payload = Map::new();
		payload.insert("deviceId".into(), json!(device_id));
		if let Some(bundle_id) = &self.config.bundle_id {
			payload.insert("bundleId".into(), json!(bundle_id));
		}
		Value::Object(payload)
	}

	async fn emit(&self, event: EventName, payload: Value) {
		self.bus.emit(event, payload).await;
	}
}

impl std::fmt::Debug for Device {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Device")
			.field("kind", &self.config.kind)
			.field("state", &*self.state.lock())
			.finish()
	}
}
