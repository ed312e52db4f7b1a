//! Control-channel envelope.
//!
//! Every frame exchanged with the control server is a JSON text frame:
//!
//! ```text
//! { "type": "invoke", "params": { ... }, "messageId": 7 }
//! ```
//!
//! Requests carry a `messageId`; the peer answers with the same id.
//! Frames without a known id are unsolicited notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types with meaning to the tester side of the channel.
pub mod kind {
	pub const LOGIN: &str = "login";
	pub const LOGGED_IN: &str = "loggedIn";
	pub const ERROR: &str = "error";
	pub const APP_CONNECTED: &str = "appConnected";
	pub const APP_DISCONNECTED: &str = "appDisconnected";
	pub const APP_CRASHED: &str = "AppWillTerminateWithError";
	pub const APP_NONRESPONSIVE: &str = "AppNonresponsiveDetected";
	pub const IS_READY: &str = "isReady";
}

/// Role a peer announces when logging into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Tester,
	App,
}

impl Role {
	pub fn counterpart(self) -> Self {
		match self {
			Self::Tester => Self::App,
			Self::App => Self::Tester,
		}
	}
}

/// Parameters of a `login` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginParams {
	pub session_id: String,
	pub role: Role,
}

/// One control-channel frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub params: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub message_id: Option<i64>,
}

impl Envelope {
	pub fn new(kind: impl Into<String>, params: Value) -> Self {
		Self {
			kind: kind.into(),
			params,
			message_id: None,
		}
	}

	pub fn with_id(mut self, message_id: i64) -> Self {
		self.message_id = Some(message_id);
		self
	}

	pub fn is(&self, kind: &str) -> bool {
		self.kind == kind
	}
}
