//! Wire and configuration types for dtx sessions.
//!
//! This crate holds the serde-serializable shapes shared by the runtime and
//! the session controller:
//!
//! - **Configuration**: [`SessionConfig`], [`DeviceConfig`], [`BehaviorConfig`]
//! - **Init options**: [`InitOptions`] and caller-side [`InitOverrides`]
//! - **Test boundaries**: [`TestSummary`], [`TestStatus`], [`SuiteInfo`]
//! - **Control channel**: [`Envelope`] and the well-known message types
//!
//! Types here are pure data. Behavior (validation, resolution, transport)
//! lives in `dtx-runtime` and `dtx-rs`.

pub mod config;
pub mod message;
pub mod summary;

pub use config::*;
pub use message::*;
pub use summary::*;
