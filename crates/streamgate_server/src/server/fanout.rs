#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use streamgate_domain::{ChatMessage, StreamId};
use streamgate_protocol::{Record, commands};
use tracing::{debug, warn};

use crate::server::connection::Connection;
use crate::server::pending::PendingAction;

/// Index of connections by the stream they are currently watching.
///
/// A connection appears under at most one stream id; the index and the
/// connection's own `current_stream` field are updated together under the
/// index lock.
#[derive(Default)]
pub struct ChatFanout {
	inner: Mutex<Index>,
}

#[derive(Default)]
struct Index {
	by_stream: HashMap<StreamId, HashMap<u64, Arc<Connection>>>,
	stream_of: HashMap<u64, StreamId>,
}

impl ChatFanout {
	pub fn new() -> Self {
		Self::default()
	}

	/// Move a connection onto `next` (or off any stream when `None`) and
	/// return the presence messages the transition calls for, in emission
	/// order. The caller decides when to send them.
	pub fn set_current_stream(&self, conn: &Arc<Connection>, next: Option<StreamId>) -> Vec<ChatMessage> {
		let login = conn.login().unwrap_or_default().to_string();
		let mut inner = self.inner.lock();

		let prev = inner.stream_of.get(&conn.id()).cloned();
		if prev == next {
			return Vec::new();
		}

		if let Some(prev_sid) = &prev {
			if let Some(watchers) = inner.by_stream.get_mut(prev_sid) {
				watchers.remove(&conn.id());
				if watchers.is_empty() {
					inner.by_stream.remove(prev_sid);
				}
			}
			inner.stream_of.remove(&conn.id());
		}

		if let Some(next_sid) = &next {
			inner
				.by_stream
				.entry(next_sid.clone())
				.or_default()
				.insert(conn.id(), Arc::clone(conn));
			inner.stream_of.insert(conn.id(), next_sid.clone());
		}

		conn.set_current_stream_id(next.clone());
		drop(inner);

		let mut transitions = Vec::new();
		if let Some(prev_sid) = prev {
			transitions.push(ChatMessage::leave(prev_sid, login.clone()));
		}
		if let Some(next_sid) = next {
			transitions.push(ChatMessage::enter(next_sid, login));
		}
		transitions
	}

	/// Drop a connection from the index without emitting anything.
	/// Returns the stream it was watching, for the caller's leave
	/// broadcast.
	pub fn remove(&self, conn_id: u64) -> Option<StreamId> {
		let mut inner = self.inner.lock();
		let sid = inner.stream_of.remove(&conn_id)?;
		if let Some(watchers) = inner.by_stream.get_mut(&sid) {
			watchers.remove(&conn_id);
			if watchers.is_empty() {
				inner.by_stream.remove(&sid);
			}
		}
		Some(sid)
	}

	pub fn count_watchers(&self, sid: &StreamId) -> usize {
		self.inner.lock().by_stream.get(sid).map(HashMap::len).unwrap_or(0)
	}

	/// Write a `server_send_chat_message` request to every connection
	/// watching the message's stream. Per-connection write failures are
	/// logged, not fatal. Returns how many deliveries were queued.
	pub fn broadcast(&self, msg: &ChatMessage) -> usize {
		let targets = {
			let inner = self.inner.lock();
			match inner.by_stream.get(&msg.channel_id) {
				Some(watchers) => watchers.values().cloned().collect::<Vec<_>>(),
				None => Vec::new(),
			}
		};

		if targets.is_empty() {
			return 0;
		}

		let payload = match serde_json::to_string(msg) {
			Ok(json) => json,
			Err(e) => {
				warn!(error = %e, "failed to serialize chat message; broadcast dropped");
				return 0;
			}
		};

		let mut delivered = 0usize;
		for conn in targets {
			let seq = conn.next_seq();
			if let Err(e) = conn.pending.register(&seq, PendingAction::ChatDelivery) {
				warn!(conn_id = conn.id(), error = %e, "chat delivery seq collision; skipping");
				continue;
			}

			let record = Record::request(seq.clone(), commands::SERVER_SEND_CHAT_MESSAGE, vec![payload.clone()]);
			match conn.write_record(&record) {
				Ok(()) => delivered += 1,
				Err(e) => {
					conn.pending.take(&seq);
					debug!(conn_id = conn.id(), error = %e, "chat broadcast write failed");
				}
			}
		}

		delivered
	}
}
