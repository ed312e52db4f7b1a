//! Device driver contract.
//!
//! A driver knows how to acquire one kind of device and run the app under
//! test on it. The [`Device`](crate::Device) facade sequences driver calls
//! and emits lifecycle events around them; drivers only do the platform
//! work.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use downcast_rs::{DowncastSync, impl_downcast};
use dtx_protocol::DeviceConfig;
use dtx_runtime::{ControlClient, EventBus, Result};
use serde_json::{Map, Value};

/// Capability callable exposed to test code (`by.id`, `element`, ...).
pub type Matcher = Arc<dyn Fn(Value) -> Result<Value> + Send + Sync>;

/// Matchers keyed by the name test code reaches them under.
pub type Matchers = BTreeMap<String, Matcher>;

/// Artifact plugin declared by a driver, handed to the artifacts manager.
///
/// Managers recover the concrete plugin type with `downcast_arc`.
pub trait ArtifactPlugin: DowncastSync {
	fn name(&self) -> &str;
}
impl_downcast!(sync ArtifactPlugin);

/// Artifact plugins keyed by name (`screenshot`, `log`, `video`, ...).
pub type ArtifactPlugins = BTreeMap<String, Arc<dyn ArtifactPlugin>>;

/// Collaborators handed to a driver factory.
#[derive(Clone)]
pub struct DriverContext {
	pub client: Arc<dyn ControlClient>,
	pub bus: Arc<EventBus>,
}

impl std::fmt::Debug for DriverContext {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DriverContext").field("bus", &self.bus).finish_non_exhaustive()
	}
}

/// Platform operations behind the [`Device`](crate::Device) facade.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
	/// Device type this driver was resolved for.
	fn name(&self) -> &str;

	fn matchers(&self) -> Matchers {
		Matchers::new()
	}

	fn declare_artifact_plugins(&self) -> ArtifactPlugins {
		ArtifactPlugins::new()
	}

	/// Finds or boots a device matching `config`, returning its id.
	async fn acquire_device(&self, config: &DeviceConfig) -> Result<String>;

	async fn install_app(&self, _device_id: &str) -> Result<()> {
		Ok(())
	}

	async fn uninstall_app(&self, _device_id: &str) -> Result<()> {
		Ok(())
	}

	/// Starts the app, returning its process id when the platform exposes one.
	async fn launch_app(&self, device_id: &str, launch_args: &Map<String, Value>) -> Result<Option<u32>>;

	async fn terminate_app(&self, device_id: &str) -> Result<()>;

	/// Resolves once the app answers on the control channel.
	async fn wait_until_ready(&self, device_id: &str) -> Result<()>;

	async fn shutdown(&self, _device_id: &str) -> Result<()> {
		Ok(())
	}

	/// Captures a screenshot, returning the path it was written to.
	async fn take_screenshot(&self, _device_id: &str, _name: &str) -> Result<Option<String>> {
		Ok(None)
	}

	/// Releases driver-held resources; may be called more than once.
	async fn cleanup(&self) -> Result<()> {
		Ok(())
	}
}

/// Builds a driver for a device config.
pub trait DriverFactory: Send + Sync {
	fn create(&self, context: DriverContext, config: &DeviceConfig) -> Result<Arc<dyn DeviceDriver>>;
}

impl<F> DriverFactory for F
where
	F: Fn(DriverContext, &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> + Send + Sync,
{
	fn create(&self, context: DriverContext, config: &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> {
		self(context, config)
	}
}
