//! Error types for the dtx runtime.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for runtime and session operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the session core and its collaborators.
///
/// The type is `Clone` so a single init outcome can be handed to every
/// caller waiting on it; non-cloneable sources are held in an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// Unsupported device type, invalid session endpoint, unknown event name.
	#[error("Configuration error: {0}")]
	Configuration(String),

	/// Malformed value handed to a test-boundary call.
	#[error("Validation error: {message}\n{dump}")]
	Validation {
		message: String,
		/// Pretty-printed offending value
		dump: String,
	},

	/// Delivered to callers awaiting an `init` that `cleanup` overtook.
	#[error(
		"Aborted init() execution, and now running cleanup(). Most likely the test runner is tearing down the suite after a timeout"
	)]
	AbortedInit,

	/// Operation requires a session that was never initialized (or was cleaned up).
	#[error("Session is not initialized: cannot run {0}")]
	NotInitialized(&'static str),

	/// Failed to establish the control connection.
	#[error("Failed to connect to control server: {0}")]
	ConnectionFailed(String),

	/// Transport-level error (socket read/write).
	#[error("Transport error: {0}")]
	Transport(String),

	/// Malformed or unexpected control-channel frame.
	#[error("Protocol error: {0}")]
	Protocol(String),

	/// Error reported by the app on the far side of the control channel.
	#[error("Remote error: {0}")]
	Remote(String),

	/// Control channel closed while a request was outstanding.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	/// Failed to start or stop the control server.
	#[error("Control server error: {0}")]
	Server(String),

	/// Device driver operation failed.
	#[error("Device error: {0}")]
	Device(String),

	/// Artifacts collaborator failed.
	#[error("Artifacts error: {0}")]
	Artifacts(String),

	/// One or more cleanup steps failed; every step was still attempted.
	#[error("Cleanup finished with {} failed step(s): {}", .0.len(), .0.join("; "))]
	Cleanup(Vec<String>),

	/// Timeout waiting for an operation.
	#[error("Timeout: {0}")]
	Timeout(String),

	/// I/O error.
	#[error("I/O error: {0}")]
	Io(Arc<std::io::Error>),

	/// JSON serialization/deserialization error.
	#[error("JSON error: {0}")]
	Json(Arc<serde_json::Error>),
}

impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Self::Io(Arc::new(err))
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Json(Arc::new(err))
	}
}

impl Error {
	/// Builds a [`Error::Validation`] carrying a pretty dump of `value`.
	pub fn validation(message: impl Into<String>, value: &serde_json::Value) -> Self {
		Self::Validation {
			message: message.into(),
			dump: serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()),
		}
	}

	/// Returns true if this is the abort delivered by a racing cleanup.
	pub fn is_aborted(&self) -> bool {
		matches!(self, Error::AbortedInit)
	}

	pub fn is_configuration(&self) -> bool {
		matches!(self, Error::Configuration(_))
	}

	pub fn is_validation(&self) -> bool {
		matches!(self, Error::Validation { .. })
	}

	/// Returns true if the control channel went away under a request.
	pub fn is_channel_closed(&self) -> bool {
		matches!(self, Error::ChannelClosed | Error::Transport(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn validation_error_dumps_value() {
		let err = Error::validation("invalid test status", &json!({"status": "bogus"}));
		let text = err.to_string();
		assert!(err.is_validation());
		assert!(text.contains("invalid test status"));
		assert!(text.contains("\"bogus\""));
	}

	#[test]
	fn cleanup_error_lists_steps() {
		let err = Error::Cleanup(vec!["artifacts: disk full".into(), "server: busy".into()]);
		assert_eq!(
			err.to_string(),
			"Cleanup finished with 2 failed step(s): artifacts: disk full; server: busy"
		);
	}

	#[test]
	fn io_errors_stay_cloneable() {
		let err: Error = std::io::Error::other("boom").into();
		let copy = err.clone();
		assert!(copy.to_string().contains("boom"));
	}
}
