//! Process-wide access to the active session.
//!
//! This is shared mutable state for test code that cannot thread a
//! [`SessionContext`] through. A controller installs it only when
//! `init_globals` is set and clears it on cleanup; a controller never clears
//! what another controller installed.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::controller::SessionContext;
use crate::device::Device;
use crate::driver::{Matcher, Matchers};

struct Installed {
	owner: u64,
	context: SessionContext,
}

static GLOBALS: RwLock<Option<Installed>> = parking_lot::const_rwlock(None);

/// Returns the context of the session that installed the globals.
pub fn context() -> Option<SessionContext> {
	GLOBALS.read().as_ref().map(|installed| installed.context.clone())
}

/// Returns the device of the installed session.
pub fn device() -> Option<Arc<Device>> {
	GLOBALS.read().as_ref().map(|installed| Arc::clone(&installed.context.device))
}

/// Returns every installed matcher.
pub fn matchers() -> Option<Matchers> {
	GLOBALS.read().as_ref().map(|installed| installed.context.matchers.clone())
}

/// Returns one installed matcher by name.
pub fn matcher(name: &str) -> Option<Matcher> {
	GLOBALS
		.read()
		.as_ref()
		.and_then(|installed| installed.context.matchers.get(name).cloned())
}

pub fn is_installed() -> bool {
	GLOBALS.read().is_some()
}

pub(crate) fn install(owner: u64, context: &SessionContext) {
	let previous = GLOBALS.write().replace(Installed {
		owner,
		context: context.clone(),
	});
	if let Some(previous) = previous.filter(|previous| previous.owner != owner) {
		tracing::warn!(
			target: "dtx::globals",
			previous_owner = previous.owner,
			owner,
			"replacing globals installed by another session"
		);
	}
}

/// Clears the globals if `owner` installed them.
pub(crate) fn clear_if_owned(owner: u64) -> bool {
	let mut globals = GLOBALS.write();
	if globals.as_ref().is_some_and(|installed| installed.owner == owner) {
		*globals = None;
		return true;
	}
	false
}
