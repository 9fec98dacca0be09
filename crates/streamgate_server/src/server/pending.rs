#![forbid(unsafe_code)]

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

/// What to do with the response that resolves a pending request.
///
/// Small value objects rather than closures: the dispatcher owns the
/// behavior, the registry only remembers which one applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingAction {
	/// Awaiting the `who_are_you` handshake response.
	WhoAreYou,
	/// Awaiting a `server_ping` response.
	ServerPing,
	/// Awaiting a `get_client_info` response.
	GetClientInfo,
	/// Awaiting a chat delivery acknowledgement.
	ChatDelivery,
	/// Relay the response to the bus reply channel, preserving the seq
	/// the external side supplied.
	BusRelay {
		bus_seq: String,
	},
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
	#[error("sequence {0:?} already has a pending request")]
	Duplicate(String),
}

/// Outstanding server-originated requests of one connection, keyed by seq.
#[derive(Debug, Default)]
pub struct PendingRegistry {
	inner: Mutex<HashMap<String, PendingAction>>,
}

impl PendingRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, seq: &str, action: PendingAction) -> Result<(), PendingError> {
		let mut inner = self.inner.lock();
		if inner.contains_key(seq) {
			return Err(PendingError::Duplicate(seq.to_string()));
		}
		inner.insert(seq.to_string(), action);
		Ok(())
	}

	/// Atomic remove-and-return.
	pub fn take(&self, seq: &str) -> Option<PendingAction> {
		self.inner.lock().remove(seq)
	}

	/// Drop every entry without acting on it. Returns how many were dropped.
	pub fn cancel_all(&self) -> usize {
		let mut inner = self.inner.lock();
		let dropped = inner.len();
		inner.clear();
		dropped
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}
