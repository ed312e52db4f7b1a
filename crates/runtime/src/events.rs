//! Device lifecycle event bus.
//!
//! The bus carries a closed vocabulary of ten [`EventName`]s. Listeners are
//! registered per event and kept in an [`IndexMap`] so delivery follows
//! subscription order while removal stays O(1).
//!
//! # Delivery
//!
//! [`EventBus::emit`] awaits every listener of the event one after another.
//! A listener that returns `Err` or panics is reported to the bus error
//! handler as a [`ListenerError`]; the remaining listeners still run and the
//! emitting call never sees the failure.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Lifecycle events emitted while a device is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventName {
	BootDevice,
	BeforeShutdownDevice,
	ShutdownDevice,
	BeforeTerminateApp,
	TerminateApp,
	BeforeUninstallApp,
	BeforeLaunchApp,
	LaunchApp,
	AppReady,
	CreateExternalArtifact,
}

impl EventName {
	pub const ALL: [EventName; 10] = [
		EventName::BootDevice,
		EventName::BeforeShutdownDevice,
		EventName::ShutdownDevice,
		EventName::BeforeTerminateApp,
		EventName::TerminateApp,
		EventName::BeforeUninstallApp,
		EventName::BeforeLaunchApp,
		EventName::LaunchApp,
		EventName::AppReady,
		EventName::CreateExternalArtifact,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			EventName::BootDevice => "bootDevice",
			EventName::BeforeShutdownDevice => "beforeShutdownDevice",
			EventName::ShutdownDevice => "shutdownDevice",
			EventName::BeforeTerminateApp => "beforeTerminateApp",
			EventName::TerminateApp => "terminateApp",
			EventName::BeforeUninstallApp => "beforeUninstallApp",
			EventName::BeforeLaunchApp => "beforeLaunchApp",
			EventName::LaunchApp => "launchApp",
			EventName::AppReady => "appReady",
			EventName::CreateExternalArtifact => "createExternalArtifact",
		}
	}
}

impl FromStr for EventName {
	type Err = Error;

	fn from_str(name: &str) -> Result<Self> {
		EventName::ALL
			.into_iter()
			.find(|event| event.as_str() == name)
			.ok_or_else(|| {
				Error::Configuration(format!(
					"unknown event '{name}', expected one of: {}",
					EventName::ALL.map(EventName::as_str).join(", ")
				))
			})
	}
}

impl std::fmt::Display for EventName {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Unique identifier for a registered listener.
pub type ListenerId = u64;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Boxed listener future.
pub type ListenerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

/// Listener function: payload → async `anyhow::Result<()>`.
pub type Listener = Arc<dyn Fn(Value) -> ListenerFuture + Send + Sync>;

/// Wraps an async closure into a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
	F: Fn(Value) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
	Arc::new(move |payload: Value| -> ListenerFuture { Box::pin(f(payload)) })
}

/// Failure captured from one listener invocation.
#[derive(Debug)]
pub struct ListenerError {
	pub event: EventName,
	pub listener: ListenerId,
	pub payload: Value,
	pub source: anyhow::Error,
}

impl std::fmt::Display for ListenerError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"Caught an exception in: emit(\"{}\", {})\n\n{:#}",
			self.event, self.payload, self.source
		)
	}
}

/// Receives every [`ListenerError`] raised on a bus.
pub type ErrorHandler = Arc<dyn Fn(&ListenerError) + Send + Sync>;

fn log_listener_error(err: &ListenerError) {
	tracing::error!(target: "dtx::events", event = "EMIT_ERROR", fn_name = %err.event, listener = err.listener, "{err}");
}

type ListenerMap = IndexMap<ListenerId, Listener>;

/// Publish/subscribe hub for device lifecycle events.
pub struct EventBus {
	listeners: Mutex<HashMap<EventName, ListenerMap>>,
	on_error: ErrorHandler,
}

impl EventBus {
	/// Creates a bus whose listener failures are logged at error level.
	pub fn new() -> Self {
		Self::with_error_handler(Arc::new(log_listener_error))
	}

	/// Creates a bus routing listener failures to `on_error`.
	pub fn with_error_handler(on_error: ErrorHandler) -> Self {
		Self {
			listeners: Mutex::new(HashMap::new()),
			on_error,
		}
	}

	/// Subscribes by event name, failing fast on names outside the vocabulary.
	pub fn on(&self, event: &str, listener: Listener) -> Result<ListenerId> {
		Ok(self.subscribe(event.parse()?, listener))
	}

	/// Subscribes `listener` to `event`.
	///
	/// Adding a listener that is already registered for the event returns
	/// its existing id without registering it twice.
	pub fn subscribe(&self, event: EventName, listener: Listener) -> ListenerId {
		let mut listeners = self.listeners.lock();
		let entries = listeners.entry(event).or_default();

		if let Some((&id, _)) = entries
			.iter()
			.find(|(_, existing)| same_listener(existing, &listener))
		{
			return id;
		}

		let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst);
		entries.insert(id, listener);
		id
	}

	/// Removes a listener; unknown ids are ignored.
	pub fn off(&self, event: EventName, id: ListenerId) -> bool {
		self.listeners
			.lock()
			.get_mut(&event)
			.is_some_and(|entries| entries.shift_remove(&id).is_some())
	}

	/// Returns the number of listeners registered for `event`.
	pub fn listener_count(&self, event: EventName) -> usize {
		self.listeners.lock().get(&event).map_or(0, IndexMap::len)
	}

	/// Delivers `payload` to every listener of `event`, sequentially.
	///
	/// Listeners added or removed while an emission is running take effect
	/// from the next emission.
	pub async fn emit(&self, event: EventName, payload: Value) {
		let snapshot: Vec<(ListenerId, Listener)> = self
			.listeners
			.lock()
			.get(&event)
			.map(|entries| entries.iter().map(|(id, l)| (*id, Arc::clone(l))).collect())
			.unwrap_or_default();

		tracing::trace!(target: "dtx::events", %event, listeners = snapshot.len(), "emit");

		for (id, listener) in snapshot {
			let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| listener(payload.clone())))
			{
				Ok(fut) => AssertUnwindSafe(fut)
					.catch_unwind()
					.await
					.unwrap_or_else(|panic| Err(panic_error(panic))),
				Err(panic) => Err(panic_error(panic)),
			};

			if let Err(source) = outcome {
				(self.on_error)(&ListenerError {
					event,
					listener: id,
					payload: payload.clone(),
					source,
				});
			}
		}
	}
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Debug for EventBus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let listeners = self.listeners.lock();
		let counts: Vec<(EventName, usize)> = EventName::ALL
			.into_iter()
			.filter_map(|event| listeners.get(&event).map(|entries| (event, entries.len())))
			.collect();
		f.debug_struct("EventBus").field("listeners", &counts).finish()
	}
}

fn same_listener(a: &Listener, b: &Listener) -> bool {
	std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_error(panic: Box<dyn Any + Send>) -> anyhow::Error {
	let message = panic
		.downcast_ref::<&str>()
		.map(|s| s.to_string())
		.or_else(|| panic.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "non-string panic payload".to_string());
	anyhow::anyhow!("listener panicked: {message}")
}
