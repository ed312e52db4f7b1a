//! Single-flight initialization.
//!
//! [`Deferred`] is a settle-once result cell with an observable
//! [`InitStatus`]; [`InitGuard`] hands every `begin` caller the same deferred
//! and runs the work behind it at most once per handle.
//!
//! Aborting a pending handle releases its waiters immediately. The work
//! itself keeps running on the runtime; its late settlement is discarded.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Settlement state of a [`Deferred`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
	Pending,
	Resolved,
	Rejected,
}

/// Settle-once shared result with separate resolve/reject capabilities.
///
/// Clones share the same cell. The first settlement wins; later ones are
/// ignored and reported as `false`.
pub struct Deferred<T> {
	cell: Arc<watch::Sender<Option<Result<T>>>>,
}

impl<T> Clone for Deferred<T> {
	fn clone(&self) -> Self {
		Self {
			cell: Arc::clone(&self.cell),
		}
	}
}

impl<T: Clone> Deferred<T> {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(None);
		Self { cell: Arc::new(tx) }
	}

	pub fn status(&self) -> InitStatus {
		match &*self.cell.borrow() {
			None => InitStatus::Pending,
			Some(Ok(_)) => InitStatus::Resolved,
			Some(Err(_)) => InitStatus::Rejected,
		}
	}

	pub fn is_pending(&self) -> bool {
		self.status() == InitStatus::Pending
	}

	/// Settles with `outcome` unless already settled.
	pub fn settle(&self, outcome: Result<T>) -> bool {
		let mut outcome = Some(outcome);
		self.cell.send_if_modified(|slot| {
			if slot.is_some() {
				return false;
			}
			*slot = outcome.take();
			true
		})
	}

	pub fn resolve(&self, value: T) -> bool {
		self.settle(Ok(value))
	}

	pub fn reject(&self, error: Error) -> bool {
		self.settle(Err(error))
	}

	/// Waits for settlement and returns a copy of the outcome.
	pub async fn wait(&self) -> Result<T> {
		let mut rx = self.cell.subscribe();
		let outcome = {
			let slot = rx
				.wait_for(Option::is_some)
				.await
				.map_err(|_| Error::ChannelClosed)?;
			slot.clone()
		};
		outcome.unwrap_or(Err(Error::ChannelClosed))
	}
}

impl<T: Clone> Default for Deferred<T> {
	fn default() -> Self {
		Self::new()
	}
}

impl<T: Clone> std::fmt::Debug for Deferred<T> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Deferred")
			.field("status", &self.status())
			.finish()
	}
}

/// Single-flight wrapper around one initialization attempt.
pub struct InitGuard<T> {
	handle: Mutex<Option<Deferred<T>>>,
}

impl<T> InitGuard<T>
where
	T: Clone + Send + Sync + 'static,
{
	pub fn new() -> Self {
		Self {
			handle: Mutex::new(None),
		}
	}

	/// Returns the current handle, starting `work` if there is none.
	///
	/// `work` is only called when a new handle is created; its future is
	/// spawned so it runs to completion even if every waiter goes away.
	/// Must be called from within a Tokio runtime.
	pub fn begin<F, Fut>(&self, work: F) -> Deferred<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = Result<T>> + Send + 'static,
	{
		let deferred = {
			let mut slot = self.handle.lock();
			if let Some(existing) = slot.as_ref() {
				return existing.clone();
			}
			let deferred = Deferred::new();
			*slot = Some(deferred.clone());
			deferred
		};

		let fut = work();
		let settle = deferred.clone();
		tokio::spawn(async move {
			let outcome = fut.await;
			if !settle.settle(outcome) {
				tracing::debug!(target: "dtx::init", "init work finished after abort; outcome discarded");
			}
		});

		deferred
	}

	/// Rejects a pending handle with [`Error::AbortedInit`].
	///
	/// Returns true if waiters were released.
	pub fn abort_if_pending(&self) -> bool {
		match self.handle.lock().as_ref() {
			Some(deferred) if deferred.is_pending() => deferred.reject(Error::AbortedInit),
			_ => false,
		}
	}

	pub fn current(&self) -> Option<Deferred<T>> {
		self.handle.lock().clone()
	}

	pub fn status(&self) -> Option<InitStatus> {
		self.handle.lock().as_ref().map(Deferred::status)
	}

	/// Drops the handle so the next [`begin`](Self::begin) starts a new cycle.
	pub fn reset(&self) -> Option<Deferred<T>> {
		self.handle.lock().take()
	}
}

impl<T> Default for InitGuard<T>
where
	T: Clone + Send + Sync + 'static,
{
	fn default() -> Self {
		Self::new()
	}
}
