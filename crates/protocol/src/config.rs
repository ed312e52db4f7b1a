//! Session configuration shapes.
//!
//! Field names follow the camelCase spelling used by the harness
//! configuration files; discovering and parsing those files happens elsewhere.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Endpoint of the control server plus the session both peers log into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEndpoint {
	/// WebSocket URL of the control server (`ws://host:port`)
	pub server: String,
	/// Identifier pairing the tester with the app on the server
	pub session_id: String,
}

impl SessionEndpoint {
	pub fn new(server: impl Into<String>, session_id: impl Into<String>) -> Self {
		Self {
			server: server.into(),
			session_id: session_id.into(),
		}
	}
}

/// Top-level configuration for one session controller.
///
/// Immutable once handed to the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
	#[serde(default)]
	pub artifacts: ArtifactsConfig,
	#[serde(rename = "deviceConfig")]
	pub device: DeviceConfig,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session: Option<SessionEndpoint>,
	#[serde(default)]
	pub behavior: BehaviorConfig,
}

impl SessionConfig {
	/// Creates a config for the given device type with every other field defaulted.
	pub fn for_device(kind: impl Into<String>) -> Self {
		Self {
			device: DeviceConfig::new(kind),
			..Self::default()
		}
	}

	/// Returns the externally supplied session endpoint, if any.
	///
	/// The device-level endpoint wins over the top-level one.
	pub fn external_session(&self) -> Option<&SessionEndpoint> {
		self.device.session.as_ref().or(self.session.as_ref())
	}
}

/// Device selection and app under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfig {
	/// Driver identifier (`ios.simulator`, `android.emulator`, or a plugin name)
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub session: Option<SessionEndpoint>,
	/// Driver-specific device query (name, os version, adb serial...)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub device: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub binary_path: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bundle_id: Option<String>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub launch_args: Map<String, Value>,
	/// Keys the core does not interpret, kept for the driver.
	#[serde(flatten)]
	pub extra: Map<String, Value>,
}

impl DeviceConfig {
	pub fn new(kind: impl Into<String>) -> Self {
		Self {
			kind: kind.into(),
			..Self::default()
		}
	}
}

/// Opaque configuration forwarded to the artifacts collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsConfig {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub root_dir: Option<String>,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub plugins: Map<String, Value>,
}

/// Session behavior knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehaviorConfig {
	/// Defaults for [`InitOptions`], merged under caller overrides.
	#[serde(default)]
	pub init: InitOverrides,
	#[serde(default)]
	pub cleanup: CleanupBehavior,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupBehavior {
	/// Shut the device down when the session releases it.
	#[serde(default)]
	pub shutdown_device: bool,
}

/// Fully resolved options for one `init` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOptions {
	/// Launch the app once the device is prepared.
	pub launch_app: bool,
	/// Install matchers and the device into the process-wide globals shim.
	pub init_globals: bool,
	/// Uninstall and install the app binary before launching.
	pub reinstall_app: bool,
}

impl Default for InitOptions {
	fn default() -> Self {
		Self {
			launch_app: true,
			init_globals: true,
			reinstall_app: true,
		}
	}
}

impl InitOptions {
	/// Returns a copy with every field set in `overrides` replaced.
	pub fn merged(self, overrides: &InitOverrides) -> Self {
		Self {
			launch_app: overrides.launch_app.unwrap_or(self.launch_app),
			init_globals: overrides.init_globals.unwrap_or(self.init_globals),
			reinstall_app: overrides.reinstall_app.unwrap_or(self.reinstall_app),
		}
	}
}

/// Partial [`InitOptions`]; unset fields keep the value underneath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitOverrides {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub launch_app: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub init_globals: Option<bool>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reinstall_app: Option<bool>,
}

impl InitOverrides {
	pub fn launch_app(mut self, value: bool) -> Self {
		self.launch_app = Some(value);
		self
	}

	pub fn init_globals(mut self, value: bool) -> Self {
		self.init_globals = Some(value);
		self
	}

	pub fn reinstall_app(mut self, value: bool) -> Self {
		self.reinstall_app = Some(value);
		self
	}
}

/// Options for launching the app under test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchOptions {
	/// Terminate a running instance before launching.
	#[serde(default)]
	pub new_instance: bool,
	/// Extra launch arguments, merged over the configured ones.
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub launch_args: Map<String, Value>,
}

impl LaunchOptions {
	pub fn new_instance() -> Self {
		Self {
			new_instance: true,
			..Self::default()
		}
	}
}
