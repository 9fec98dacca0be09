#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use streamgate_domain::{DeviceId, UserId};
use thiserror::Error;

use crate::server::connection::Connection;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegisterError {
	#[error("user {uid} is already connected from device {device}")]
	DoubleConnection {
		uid: UserId,
		device: DeviceId,
	},
}

/// Identity a registered connection is indexed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredUser {
	pub uid: UserId,
	pub device: DeviceId,
	pub login: String,
}

struct ConnEntry {
	conn: Arc<Connection>,
	registered: Option<RegisteredUser>,
}

/// Connection tables owned by the server loop.
///
/// Anonymous connections live only in the id table; registered ones are
/// additionally indexed by login and by `(uid, device)`.
#[derive(Default)]
pub struct ServerState {
	conns: HashMap<u64, ConnEntry>,
	by_login: HashMap<String, u64>,
	by_user_device: HashMap<(UserId, DeviceId), u64>,
}

impl ServerState {
	pub fn insert_conn(&mut self, conn: Arc<Connection>) {
		self.conns.insert(conn.id(), ConnEntry { conn, registered: None });
	}

	/// Index a connection as a registered user. Rejects a second
	/// connection for the same `(uid, device)` without touching the
	/// incumbent.
	pub fn register_user(&mut self, conn_id: u64, user: RegisteredUser) -> Result<(), RegisterError> {
		let key = (user.uid.clone(), user.device.clone());
		if self.by_user_device.contains_key(&key) {
			return Err(RegisterError::DoubleConnection {
				uid: user.uid,
				device: user.device,
			});
		}

		let Some(entry) = self.conns.get_mut(&conn_id) else {
			// Connection already dropped; nothing to index.
			return Ok(());
		};

		self.by_login.insert(user.login.clone(), conn_id);
		self.by_user_device.insert(key, conn_id);
		entry.registered = Some(user);
		Ok(())
	}

	/// Remove a connection from every index. Returns its registration,
	/// if it had completed one.
	pub fn remove_conn(&mut self, conn_id: u64) -> Option<RegisteredUser> {
		let entry = self.conns.remove(&conn_id)?;
		let registered = entry.registered?;

		// Guard against a newer connection having taken the login slot.
		if self.by_login.get(&registered.login) == Some(&conn_id) {
			self.by_login.remove(&registered.login);
		}
		let key = (registered.uid.clone(), registered.device.clone());
		if self.by_user_device.get(&key) == Some(&conn_id) {
			self.by_user_device.remove(&key);
		}

		Some(registered)
	}

	pub fn find_by_login(&self, login: &str) -> Option<Arc<Connection>> {
		let id = self.by_login.get(login)?;
		self.conns.get(id).map(|e| Arc::clone(&e.conn))
	}

	pub fn find_by_user_and_device(&self, uid: &UserId, device: &DeviceId) -> Option<Arc<Connection>> {
		let id = self.by_user_device.get(&(uid.clone(), device.clone()))?;
		self.conns.get(id).map(|e| Arc::clone(&e.conn))
	}

	/// Snapshot of every live connection, for timer sweeps.
	pub fn conns_snapshot(&self) -> Vec<Arc<Connection>> {
		self.conns.values().map(|e| Arc::clone(&e.conn)).collect()
	}

	pub fn len(&self) -> usize {
		self.conns.len()
	}

	pub fn is_empty(&self) -> bool {
		self.conns.is_empty()
	}
}
