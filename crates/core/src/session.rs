//! Session endpoint resolution and validation.

use async_trait::async_trait;
use dtx_protocol::SessionEndpoint;
use dtx_runtime::{Error, Result};
use url::Url;

/// Supplies the session endpoint when the configuration has none.
#[async_trait]
pub trait SessionProvider: Send + Sync {
	async fn default_session(&self) -> Result<SessionEndpoint>;
}

/// Picks a free loopback port and a random session id.
#[derive(Debug, Clone)]
pub struct LocalSessionProvider {
	host: String,
}

impl LocalSessionProvider {
	pub fn new(host: impl Into<String>) -> Self {
		Self { host: host.into() }
	}
}

impl Default for LocalSessionProvider {
	fn default() -> Self {
		Self::new("127.0.0.1")
	}
}

#[async_trait]
impl SessionProvider for LocalSessionProvider {
	async fn default_session(&self) -> Result<SessionEndpoint> {
		let listener = tokio::net::TcpListener::bind((self.host.as_str(), 0)).await?;
		let port = listener.local_addr()?.port();
		drop(listener);

		Ok(SessionEndpoint::new(
			format!("ws://{}:{port}", self.host),
			uuid::Uuid::new_v4().to_string(),
		))
	}
}

/// Checks that `endpoint` names a WebSocket server and a session.
pub fn validate_session(endpoint: &SessionEndpoint) -> Result<()> {
	endpoint_url(endpoint)?;
	if endpoint.session_id.trim().is_empty() {
		return Err(Error::Configuration(format!(
			"session for {} has an empty sessionId",
			endpoint.server
		)));
	}
	Ok(())
}

/// Parses the server URL of a validated-shape endpoint.
pub(crate) fn endpoint_url(endpoint: &SessionEndpoint) -> Result<Url> {
	let url = Url::parse(&endpoint.server)
		.map_err(|e| Error::Configuration(format!("invalid session server '{}': {e}", endpoint.server)))?;

	if !matches!(url.scheme(), "ws" | "wss") {
		return Err(Error::Configuration(format!(
			"session server '{}' must be a ws:// or wss:// URL",
			endpoint.server
		)));
	}
	if url.host_str().is_none_or(str::is_empty) {
		return Err(Error::Configuration(format!(
			"session server '{}' has no host",
			endpoint.server
		)));
	}
	Ok(url)
}
