//! Manual-attach driver for `ios.none`.
//!
//! No device is booted or installed: a person (or an IDE) launches the app,
//! the app joins the session on its own, and the driver only waits for it to
//! answer `isReady`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dtx_protocol::{DeviceConfig, kind};
use dtx_runtime::{ControlClient, Error, Result};
use serde_json::{Map, Value, json};
use tracing::info;

use crate::driver::{DeviceDriver, DriverContext};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);

/// Driver that leaves device and app management to the user.
pub struct ManualDriver {
	name: String,
	client: Arc<dyn ControlClient>,
	ready_timeout: Duration,
}

impl ManualDriver {
	pub fn new(context: DriverContext, config: &DeviceConfig) -> Self {
		Self {
			name: config.kind.clone(),
			client: context.client,
			ready_timeout: DEFAULT_READY_TIMEOUT,
		}
	}

	/// Overrides how long [`wait_until_ready`](DeviceDriver::wait_until_ready) waits.
	pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
		self.ready_timeout = timeout;
		self
	}
}

#[async_trait]
impl DeviceDriver for ManualDriver {
	fn name(&self) -> &str {
		&self.name
	}

	async fn acquire_device(&self, config: &DeviceConfig) -> Result<String> {
		let id = match &config.device {
			Some(Value::String(name)) => name.clone(),
			Some(query) => query
				.get("name")
				.and_then(Value::as_str)
				.unwrap_or("manual")
				.to_string(),
			None => "manual".to_string(),
		};
		Ok(id)
	}

	async fn install_app(&self, device_id: &str) -> Result<()> {
		info!(target: "dtx::driver", device_id, "app installation is left to the user");
		Ok(())
	}

	async fn launch_app(&self, device_id: &str, launch_args: &Map<String, Value>) -> Result<Option<u32>> {
		let launch_args = serde_json::Value::Object(launch_args.clone());
		info!(
			target: "dtx::driver",
			device_id,
			%launch_args,
			"Waiting for you to manually launch your app. Start it from your IDE and make sure it joins the session"
		);
		Ok(None)
	}

	async fn terminate_app(&self, device_id: &str) -> Result<()> {
		info!(target: "dtx::driver", device_id, "Terminate the app manually if it is still running");
		Ok(())
	}

	async fn wait_until_ready(&self, device_id: &str) -> Result<()> {
		tokio::time::timeout(self.ready_timeout, self.client.send_action(kind::IS_READY, json!({})))
			.await
			.map_err(|_| Error::Timeout(format!("app on '{device_id}' did not report ready")))??;
		Ok(())
	}
}
