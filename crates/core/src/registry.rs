//! Device type → driver factory resolution.
//!
//! Lookup order is the built-in table, then drivers registered by name, then
//! the optional resolver function. A type none of them know is a
//! configuration error naming the type.

use std::collections::HashMap;
use std::sync::Arc;

use dtx_protocol::DeviceConfig;
use dtx_runtime::{Error, Result};
use indexmap::IndexMap;

use crate::driver::{DeviceDriver, DriverContext, DriverFactory};
use crate::manual::ManualDriver;

/// Device types with a reserved slot in every registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinDriver {
	IosSimulator,
	IosNone,
	AndroidEmulator,
	AndroidAttached,
}

impl BuiltinDriver {
	pub const ALL: [BuiltinDriver; 4] = [
		BuiltinDriver::IosSimulator,
		BuiltinDriver::IosNone,
		BuiltinDriver::AndroidEmulator,
		BuiltinDriver::AndroidAttached,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			BuiltinDriver::IosSimulator => "ios.simulator",
			BuiltinDriver::IosNone => "ios.none",
			BuiltinDriver::AndroidEmulator => "android.emulator",
			BuiltinDriver::AndroidAttached => "android.attached",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|builtin| builtin.as_str() == name)
	}
}

impl std::fmt::Display for BuiltinDriver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Fallback consulted for device types nothing was registered under.
pub type DriverResolver = Arc<dyn Fn(&str) -> Option<Arc<dyn DriverFactory>> + Send + Sync>;

/// Maps device types to driver factories.
#[derive(Clone)]
pub struct DriverRegistry {
	builtins: HashMap<BuiltinDriver, Arc<dyn DriverFactory>>,
	plugins: IndexMap<String, Arc<dyn DriverFactory>>,
	resolver: Option<DriverResolver>,
}

impl DriverRegistry {
	/// Creates a registry with the manual-attach driver installed for `ios.none`.
	pub fn new() -> Self {
		let mut registry = Self::empty();
		registry.install_builtin(BuiltinDriver::IosNone, |context: DriverContext, config: &DeviceConfig| {
			Ok(Arc::new(ManualDriver::new(context, config)) as Arc<dyn DeviceDriver>)
		});
		registry
	}

	/// Creates a registry with no driver installed at all.
	pub fn empty() -> Self {
		Self {
			builtins: HashMap::new(),
			plugins: IndexMap::new(),
			resolver: None,
		}
	}

	/// Installs the implementation behind a built-in device type.
	pub fn install_builtin<F>(&mut self, builtin: BuiltinDriver, factory: F) -> &mut Self
	where
		F: Fn(DriverContext, &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> + Send + Sync + 'static,
	{
		self.builtins.insert(builtin, Arc::new(factory));
		self
	}

	/// Registers a plugin driver under `name`.
	///
	/// Built-in names are reserved; use [`install_builtin`](Self::install_builtin) for those.
	pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<&mut Self>
	where
		F: Fn(DriverContext, &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> + Send + Sync + 'static,
	{
		self.register_factory(name, Arc::new(factory))
	}

	pub fn register_factory(&mut self, name: impl Into<String>, factory: Arc<dyn DriverFactory>) -> Result<&mut Self> {
		let name = name.into();
		if BuiltinDriver::from_name(&name).is_some() {
			return Err(Error::Configuration(format!(
				"device type '{name}' is built in and cannot be registered as a plugin driver"
			)));
		}
		if self.plugins.insert(name.clone(), factory).is_some() {
			tracing::debug!(target: "dtx::registry", name, "replaced plugin driver");
		}
		Ok(self)
	}

	/// Sets the resolver consulted after the built-in and plugin tables.
	pub fn with_resolver<F>(mut self, resolver: F) -> Self
	where
		F: Fn(&str) -> Option<Arc<dyn DriverFactory>> + Send + Sync + 'static,
	{
		self.resolver = Some(Arc::new(resolver));
		self
	}

	/// Returns the factory for `device_type`.
	pub fn resolve(&self, device_type: &str) -> Result<Arc<dyn DriverFactory>> {
		let builtin = BuiltinDriver::from_name(device_type);

		if let Some(factory) = builtin.and_then(|builtin| self.builtins.get(&builtin)) {
			return Ok(Arc::clone(factory));
		}
		if let Some(factory) = self.plugins.get(device_type) {
			return Ok(Arc::clone(factory));
		}
		if let Some(factory) = self.resolver.as_ref().and_then(|resolve| resolve(device_type)) {
			tracing::debug!(target: "dtx::registry", device_type, "driver supplied by resolver");
			return Ok(factory);
		}

		Err(match builtin {
			Some(_) => Error::Configuration(format!(
				"device type '{device_type}' is built in, but no driver is installed for it"
			)),
			None => Error::Configuration(format!(
				"unsupported device type '{device_type}'; known types: {}",
				self.names().join(", ")
			)),
		})
	}

	/// Returns every name [`resolve`](Self::resolve) accepts without the resolver.
	pub fn names(&self) -> Vec<String> {
		BuiltinDriver::ALL
			.into_iter()
			.filter(|builtin| self.builtins.contains_key(builtin))
			.map(|builtin| builtin.as_str().to_string())
			.chain(self.plugins.keys().cloned())
			.collect()
	}
}

impl Default for DriverRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for DriverRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("DriverRegistry")
			.field("names", &self.names())
			.field("resolver", &self.resolver.is_some())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	use async_trait::async_trait;
	use serde_json::{Map, Value};

	struct NamedDriver(String);

	#[async_trait]
	impl DeviceDriver for NamedDriver {
		fn name(&self) -> &str {
			&self.0
		}

		async fn acquire_device(&self, _config: &DeviceConfig) -> Result<String> {
			Ok("device".into())
		}

		async fn launch_app(&self, _device_id: &str, _launch_args: &Map<String, Value>) -> Result<Option<u32>> {
			Ok(None)
		}

		async fn terminate_app(&self, _device_id: &str) -> Result<()> {
			Ok(())
		}

		async fn wait_until_ready(&self, _device_id: &str) -> Result<()> {
			Ok(())
		}
	}

	fn named(name: &'static str) -> impl Fn(DriverContext, &DeviceConfig) -> Result<Arc<dyn DeviceDriver>> + Send + Sync {
		move |_context: DriverContext, _config: &DeviceConfig| Ok(Arc::new(NamedDriver(name.into())) as Arc<dyn DeviceDriver>)
	}

	#[test]
	fn builtin_names_round_trip() {
		for builtin in BuiltinDriver::ALL {
			assert_eq!(BuiltinDriver::from_name(builtin.as_str()), Some(builtin));
		}
		assert_eq!(BuiltinDriver::from_name("ios.device"), None);
	}

	#[test]
	fn default_registry_knows_manual_driver() {
		let registry = DriverRegistry::new();
		assert!(registry.resolve("ios.none").is_ok());
		assert_eq!(registry.names(), vec!["ios.none".to_string()]);
	}

	#[test]
	fn uninstalled_builtin_is_configuration_error() {
		let registry = DriverRegistry::new();
		let err = registry.resolve("ios.simulator").err().unwrap();
		assert!(err.is_configuration());
		assert!(err.to_string().contains("ios.simulator"));
	}

	#[test]
	fn unknown_type_names_the_type() {
		let registry = DriverRegistry::new();
		let err = registry.resolve("blackberry.emulator").err().unwrap();
		assert!(err.is_configuration());
		assert!(err.to_string().contains("'blackberry.emulator'"));
	}

	#[test]
	fn plugin_and_resolver_are_consulted_in_order() {
		let mut registry = DriverRegistry::empty().with_resolver(|name| {
			(name == "cloud.farm").then(|| Arc::new(named("cloud.farm")) as Arc<dyn DriverFactory>)
		});
		registry.register("web.stub", named("web.stub")).unwrap();
		registry.install_builtin(BuiltinDriver::AndroidEmulator, named("android.emulator"));

		assert!(registry.resolve("web.stub").is_ok());
		assert!(registry.resolve("cloud.farm").is_ok());
		assert!(registry.resolve("android.emulator").is_ok());
		assert!(registry.resolve("ios.none").is_err());
		assert_eq!(registry.names(), vec!["android.emulator".to_string(), "web.stub".to_string()]);
	}

	#[test]
	fn builtin_names_cannot_be_registered() {
		let mut registry = DriverRegistry::empty();
		let err = registry.register("ios.simulator", named("ios.simulator")).err().unwrap();
		assert!(err.is_configuration());
	}
}
