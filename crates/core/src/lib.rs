//! dtx - session orchestration for mobile end-to-end tests
//!
//! A [`SessionController`] owns one test session: it stands up (or joins) the
//! control channel between tester and app, resolves a [`DeviceDriver`] from
//! the [`DriverRegistry`], prepares the [`Device`], and keeps the artifacts
//! manager informed at every test boundary.
//!
//! # Example
//!
//! ```ignore
//! use dtx::{InitOverrides, SessionConfig, SessionController, TestStatus, TestSummary};
//!
//! #[tokio::main]
//! async fn main() -> dtx::Result<()> {
//!     let controller = SessionController::new(SessionConfig::for_device("ios.none"));
//!     let session = controller.init(InitOverrides::default()).await?;
//!
//!     let test = TestSummary::new("logs in", "auth logs in", TestStatus::Running);
//!     controller.before_each(&test).await?;
//!     session.device.take_screenshot("login").await?;
//!     controller.after_each(TestSummary { status: TestStatus::Passed, ..test }).await?;
//!
//!     controller.cleanup().await
//! }
//! ```
//!
//! # Events
//!
//! Device operations emit lifecycle events on the controller's
//! [`EventBus`]. Listener failures never reach the emitter; they are
//! reported to the bus error handler (logged by default).

pub mod artifacts;
pub mod controller;
pub mod device;
pub mod driver;
pub mod globals;
pub mod manual;
pub mod registry;
pub mod session;
pub mod validate;

pub use artifacts::{ArtifactsFactory, ArtifactsManager, NoopArtifacts, NoopArtifactsFactory};
pub use controller::{SessionContext, SessionController, SessionControllerBuilder, SessionState};
pub use device::Device;
pub use driver::{ArtifactPlugin, ArtifactPlugins, DeviceDriver, DriverContext, DriverFactory, Matcher, Matchers};
pub use dtx_protocol::{
	ArtifactsConfig, BehaviorConfig, CleanupBehavior, DeviceConfig, InitOptions, InitOverrides, LaunchOptions,
	SessionConfig, SessionEndpoint, SuiteInfo, TestStatus, TestSummary,
};
pub use dtx_runtime::{
	ControlClient, ControlClientFactory, ControlServer, ControlServerFactory, Error, ErrorHandler, EventBus,
	EventName, Listener, ListenerError, ListenerId, Nonresponsiveness, Result, listener,
};
pub use manual::ManualDriver;
pub use registry::{BuiltinDriver, DriverRegistry, DriverResolver};
pub use session::{LocalSessionProvider, SessionProvider, validate_session};
pub use validate::SummaryInput;
