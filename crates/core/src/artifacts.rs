//! Artifacts collaborator contract.
//!
//! An artifacts manager records screenshots, logs and videos around tests.
//! The session controller only drives its lifecycle; encoding and storage
//! live behind the trait.

use std::sync::Arc;

use async_trait::async_trait;
use dtx_protocol::{ArtifactsConfig, SuiteInfo, TestSummary};
use dtx_runtime::{EventBus, EventName, ListenerId, Result};

use crate::driver::ArtifactPlugins;

/// Records artifacts for one session.
#[async_trait]
pub trait ArtifactsManager: Send + Sync {
	/// Subscribes to device lifecycle events.
	///
	/// The returned subscriptions are removed from the bus when the session
	/// cleans up.
	fn subscribe_to_device_events(&self, _bus: &EventBus) -> Vec<(EventName, ListenerId)> {
		Vec::new()
	}

	fn register_artifact_plugins(&self, _plugins: ArtifactPlugins) {}

	async fn on_test_start(&self, test: &TestSummary) -> Result<()>;

	async fn on_test_done(&self, test: &TestSummary) -> Result<()>;

	async fn on_suite_start(&self, _suite: &SuiteInfo) -> Result<()> {
		Ok(())
	}

	async fn on_suite_end(&self, _suite: &SuiteInfo) -> Result<()> {
		Ok(())
	}

	/// Flushes pending artifact writes before the session tears down.
	async fn on_before_cleanup(&self) -> Result<()>;
}

/// Creates the artifacts manager for a session.
pub trait ArtifactsFactory: Send + Sync {
	fn create(&self, config: &ArtifactsConfig) -> Result<Arc<dyn ArtifactsManager>>;
}

impl<F> ArtifactsFactory for F
where
	F: Fn(&ArtifactsConfig) -> Result<Arc<dyn ArtifactsManager>> + Send + Sync,
{
	fn create(&self, config: &ArtifactsConfig) -> Result<Arc<dyn ArtifactsManager>> {
		self(config)
	}
}

/// Manager that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopArtifacts;

#[async_trait]
impl ArtifactsManager for NoopArtifacts {
	async fn on_test_start(&self, test: &TestSummary) -> Result<()> {
		tracing::trace!(target: "dtx::artifacts", test = %test.full_name, "test start");
		Ok(())
	}

	async fn on_test_done(&self, test: &TestSummary) -> Result<()> {
		tracing::trace!(target: "dtx::artifacts", test = %test.full_name, status = %test.status, "test done");
		Ok(())
	}

	async fn on_before_cleanup(&self) -> Result<()> {
		Ok(())
	}
}

/// Factory producing [`NoopArtifacts`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopArtifactsFactory;

impl ArtifactsFactory for NoopArtifactsFactory {
	fn create(&self, _config: &ArtifactsConfig) -> Result<Arc<dyn ArtifactsManager>> {
		Ok(Arc::new(NoopArtifacts))
	}
}
