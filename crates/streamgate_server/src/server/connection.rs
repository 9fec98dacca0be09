#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use serde::Serialize;
use streamgate_domain::{
	AuthInfo, ChannelsInfo, ChatMessage, ClientInfo, ClientPingInfo, DeviceId, RuntimeChannelInfo, ServerInfo,
	ServerPingInfo, StreamId,
};
use streamgate_protocol::{Framer, Record, Status, commands, join_args};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::host::ServerHost;
use crate::server::pending::{PendingAction, PendingRegistry};
use crate::server::state::{RegisterError, RegisteredUser};
use crate::util::time::unix_ms_now;

/// Upper bound on queued-but-unwritten bytes per connection.
pub const MAX_WRITE_QUEUE: usize = 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WriteError {
	#[error("connection is closed")]
	Closed,

	#[error("write queue overflow: queued={queued} max={max}")]
	QueueOverflow {
		queued: usize,
		max: usize,
	},
}

enum WriteOp {
	Frame(Vec<u8>),
	Shutdown,
}

/// Per-socket state: write queue, frozen auth, current stream, seq counter,
/// pending registry.
pub struct Connection {
	id: u64,
	remote: SocketAddr,
	out_tx: mpsc::UnboundedSender<WriteOp>,
	queued_bytes: AtomicUsize,
	auth: OnceLock<AuthInfo>,
	current_stream: Mutex<Option<StreamId>>,
	next_seq: AtomicU64,
	pub(crate) pending: PendingRegistry,
	closed: AtomicBool,
	closed_tx: watch::Sender<bool>,
	// Kept so the watch channel cannot close before anyone waits on it.
	closed_rx: watch::Receiver<bool>,
}

impl Connection {
	/// Allocate a connection and start its writer task over `write_half`.
	pub fn spawn(id: u64, remote: SocketAddr, write_half: OwnedWriteHalf) -> Arc<Self> {
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (closed_tx, closed_rx) = watch::channel(false);

		let conn = Arc::new(Self {
			id,
			remote,
			out_tx,
			queued_bytes: AtomicUsize::new(0),
			auth: OnceLock::new(),
			current_stream: Mutex::new(None),
			next_seq: AtomicU64::new(1),
			pending: PendingRegistry::new(),
			closed: AtomicBool::new(false),
			closed_tx,
			closed_rx,
		});

		tokio::spawn(run_writer(Arc::clone(&conn), write_half, out_rx));
		conn
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn remote(&self) -> SocketAddr {
		self.remote
	}

	/// Fresh per-connection seq, lowercase hex.
	pub fn next_seq(&self) -> String {
		format!("{:x}", self.next_seq.fetch_add(1, Ordering::Relaxed))
	}

	pub fn write_record(&self, record: &Record) -> Result<(), WriteError> {
		self.write_frame(record.encode())
	}

	/// Enqueue raw frame bytes for the writer task.
	pub fn write_frame(&self, frame: Vec<u8>) -> Result<(), WriteError> {
		if self.is_closed() {
			return Err(WriteError::Closed);
		}

		let len = frame.len();
		let queued = self.queued_bytes.fetch_add(len, Ordering::Relaxed) + len;
		if queued > MAX_WRITE_QUEUE {
			self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
			warn!(conn_id = self.id, queued, "write queue overflow; closing connection");
			self.close();
			return Err(WriteError::QueueOverflow {
				queued,
				max: MAX_WRITE_QUEUE,
			});
		}

		if self.out_tx.send(WriteOp::Frame(frame)).is_err() {
			self.queued_bytes.fetch_sub(len, Ordering::Relaxed);
			return Err(WriteError::Closed);
		}
		Ok(())
	}

	/// Freeze the connection's identity. Fails if already set.
	pub fn set_auth(&self, auth: AuthInfo) -> bool {
		self.auth.set(auth).is_ok()
	}

	pub fn auth(&self) -> Option<&AuthInfo> {
		self.auth.get()
	}

	pub fn login(&self) -> Option<&str> {
		self.auth.get().map(|a| a.login.as_str())
	}

	pub fn is_anonymous(&self) -> bool {
		self.auth.get().map(AuthInfo::is_anonymous).unwrap_or(false)
	}

	pub fn current_stream_id(&self) -> Option<StreamId> {
		self.current_stream.lock().clone()
	}

	pub(crate) fn set_current_stream_id(&self, sid: Option<StreamId>) {
		*self.current_stream.lock() = sid;
	}

	/// Idempotent close: cancels pending, stops the writer, wakes the
	/// read loop. Index removal happens in the connection task's cleanup.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}

		let dropped = self.pending.cancel_all();
		if dropped > 0 {
			debug!(conn_id = self.id, dropped, "dropped pending requests on close");
		}

		let _ = self.out_tx.send(WriteOp::Shutdown);
		let _ = self.closed_tx.send(true);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub async fn wait_closed(&self) {
		let mut rx = self.closed_rx.clone();
		loop {
			if *rx.borrow_and_update() {
				return;
			}
			if rx.changed().await.is_err() {
				return;
			}
		}
	}
}

async fn run_writer(conn: Arc<Connection>, mut sock: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
	while let Some(op) = rx.recv().await {
		match op {
			WriteOp::Frame(bytes) => {
				let len = bytes.len();
				let res = sock.write_all(&bytes).await;
				conn.queued_bytes.fetch_sub(len, Ordering::Relaxed);
				if let Err(e) = res {
					debug!(conn_id = conn.id, error = %e, "connection write failed");
					conn.close();
					break;
				}
			}
			WriteOp::Shutdown => break,
		}
	}

	let _ = sock.shutdown().await;
}

/// Drive one accepted socket: send the `who_are_you` challenge, then read
/// and dispatch records until the peer goes away or the connection is
/// closed. Cleanup (index removal, offline publish, leave broadcast) runs
/// exactly once on the way out.
pub async fn handle_connection(host: Arc<ServerHost>, conn: Arc<Connection>, mut read_half: OwnedReadHalf) {
	let seq = conn.next_seq();
	if conn.pending.register(&seq, PendingAction::WhoAreYou).is_ok() {
		let challenge = Record::request(seq, commands::SERVER_WHO_ARE_YOU, Vec::new());
		if let Err(e) = conn.write_record(&challenge) {
			warn!(conn_id = conn.id(), error = %e, "failed to send who_are_you");
			conn.close();
		}
	}

	let mut framer = Framer::new();
	let mut buf = vec![0u8; 4096];

	'outer: while !conn.is_closed() {
		tokio::select! {
			_ = conn.wait_closed() => break,
			res = read_half.read(&mut buf) => match res {
				Ok(0) => break,
				Ok(n) => {
					framer.feed(&buf[..n]);
					loop {
						match framer.next_record() {
							Ok(Some(record)) => dispatch(&host, &conn, record).await,
							Ok(None) => break,
							Err(e) => {
								warn!(conn_id = conn.id(), error = %e, "framing error; dropping connection");
								conn.close();
								break 'outer;
							}
						}
						if conn.is_closed() {
							break 'outer;
						}
					}
				}
				Err(e) => {
					debug!(conn_id = conn.id(), error = %e, "read failed");
					break;
				}
			},
		}
	}

	host.drop_connection(&conn).await;
}

async fn dispatch(host: &Arc<ServerHost>, conn: &Arc<Connection>, record: Record) {
	match record.kind {
		streamgate_protocol::RecordKind::Request => handle_request(host, conn, record).await,
		streamgate_protocol::RecordKind::Response => handle_response(host, conn, record).await,
		streamgate_protocol::RecordKind::Approve => {
			// Acknowledgement only; the exchange is complete.
			debug!(conn_id = conn.id(), seq = %record.seq, command = record.command().unwrap_or(""), "approve received");
		}
	}
}

async fn handle_request(host: &Arc<ServerHost>, conn: &Arc<Connection>, record: Record) {
	let seq = record.seq.clone();
	let command = record.command().unwrap_or_default().to_string();

	// Ping is served even before the handshake completes.
	if command == commands::CLIENT_PING {
		let info = ClientPingInfo {
			timestamp_ms: unix_ms_now(),
		};
		send_ok_response(conn, &seq, commands::CLIENT_PING, &info);
		return;
	}

	let Some(auth) = conn.auth().cloned() else {
		warn!(conn_id = conn.id(), command = %command, "request before handshake completed");
		send_fail_response(conn, &seq, &command, "handshake not completed");
		conn.close();
		return;
	};

	match command.as_str() {
		commands::CLIENT_GET_SERVER_INFO => match host.directory().find_user(&auth).await {
			Ok(_) => {
				let info = ServerInfo {
					bandwidth_host: host.bandwidth_host().to_string(),
				};
				send_ok_response(conn, &seq, commands::CLIENT_GET_SERVER_INFO, &info);
			}
			Err(e) => {
				send_fail_response(conn, &seq, commands::CLIENT_GET_SERVER_INFO, &e.to_string());
				conn.close();
			}
		},

		commands::CLIENT_GET_CHANNELS => {
			if conn.is_anonymous() {
				send_fail_response(conn, &seq, commands::CLIENT_GET_CHANNELS, "anonymous sessions have no channels");
				conn.close();
				return;
			}

			match host.directory().find_user(&auth).await {
				Ok(user) => {
					let channels: ChannelsInfo = user.channels;
					send_ok_response(conn, &seq, commands::CLIENT_GET_CHANNELS, &channels);
				}
				Err(e) => {
					send_fail_response(conn, &seq, commands::CLIENT_GET_CHANNELS, &e.to_string());
					conn.close();
				}
			}
		}

		commands::CLIENT_GET_RUNTIME_CHANNEL_INFO => {
			let sid = match record.payload().map(StreamId::new) {
				Some(Ok(sid)) => sid,
				_ => {
					send_fail_response(conn, &seq, commands::CLIENT_GET_RUNTIME_CHANNEL_INFO, "missing stream id");
					conn.close();
					return;
				}
			};

			let (channel_type, chat_enabled, chat_read_only) = host.channel_policy(&sid, conn.is_anonymous());
			let info = RuntimeChannelInfo {
				channel_id: sid.clone(),
				watchers_count: host.fanout().count_watchers(&sid),
				channel_type,
				chat_enabled,
				chat_read_only,
			};

			// Index moves first so later broadcasts see the new watcher,
			// but the reply goes out before any presence message.
			let transitions = host.fanout().set_current_stream(conn, Some(sid));
			send_ok_response(conn, &seq, commands::CLIENT_GET_RUNTIME_CHANNEL_INFO, &info);
			for msg in &transitions {
				host.fanout().broadcast(msg);
			}
		}

		commands::CLIENT_SEND_CHAT_MESSAGE => {
			let Some(payload) = record.payload() else {
				send_fail_response(conn, &seq, commands::CLIENT_SEND_CHAT_MESSAGE, "missing message payload");
				conn.close();
				return;
			};

			let msg: ChatMessage = match serde_json::from_str(payload) {
				Ok(msg) => msg,
				Err(e) => {
					send_fail_response(conn, &seq, commands::CLIENT_SEND_CHAT_MESSAGE, &format!("invalid message: {e}"));
					conn.close();
					return;
				}
			};
			if !msg.is_valid() {
				send_fail_response(conn, &seq, commands::CLIENT_SEND_CHAT_MESSAGE, "invalid message");
				conn.close();
				return;
			}

			send_ok_response_raw(conn, &seq, commands::CLIENT_SEND_CHAT_MESSAGE, payload.to_string());
			let delivered = host.fanout().broadcast(&msg);
			debug!(conn_id = conn.id(), channel = %msg.channel_id, delivered, "chat message broadcast");
		}

		other => {
			warn!(conn_id = conn.id(), command = %other, "unknown request command; ignoring");
		}
	}
}

async fn handle_response(host: &Arc<ServerHost>, conn: &Arc<Connection>, record: Record) {
	let seq = record.seq.clone();

	let Some(action) = conn.pending.take(&seq) else {
		warn!(conn_id = conn.id(), seq = %seq, "response with no pending request; dropping");
		return;
	};

	let Some(status) = record.status() else {
		warn!(conn_id = conn.id(), seq = %seq, "response with invalid status token");
		conn.close();
		return;
	};
	let Some(command) = record.command().map(str::to_string) else {
		warn!(conn_id = conn.id(), seq = %seq, "response without a command");
		conn.close();
		return;
	};

	match action {
		PendingAction::WhoAreYou => {
			if command != commands::SERVER_WHO_ARE_YOU {
				warn!(conn_id = conn.id(), command = %command, "unexpected command on who_are_you seq");
				conn.close();
				return;
			}
			if !status.is_ok() {
				// The client refused to identify; nothing to retry.
				warn!(conn_id = conn.id(), "client failed who_are_you");
				conn.close();
				return;
			}
			handle_who_are_you(host, conn, &seq, record.payload()).await;
		}

		PendingAction::ServerPing => {
			if command != commands::SERVER_PING {
				warn!(conn_id = conn.id(), command = %command, "unexpected command on server_ping seq");
				conn.close();
				return;
			}
			if !status.is_ok() {
				warn!(conn_id = conn.id(), "client failed server_ping");
				conn.close();
				return;
			}

			match record.payload().map(serde_json::from_str::<ServerPingInfo>) {
				Some(Ok(_)) => send_approve(conn, &seq, Status::Ok, commands::SERVER_PING, None),
				_ => {
					send_approve(conn, &seq, Status::Fail, commands::SERVER_PING, Some("invalid ping payload"));
					conn.close();
				}
			}
		}

		PendingAction::GetClientInfo => {
			if command != commands::SERVER_GET_CLIENT_INFO {
				warn!(conn_id = conn.id(), command = %command, "unexpected command on get_client_info seq");
				conn.close();
				return;
			}
			if !status.is_ok() {
				warn!(conn_id = conn.id(), "client failed get_client_info");
				conn.close();
				return;
			}

			match record.payload().map(serde_json::from_str::<ClientInfo>) {
				Some(Ok(info)) if info.is_valid() => {
					debug!(conn_id = conn.id(), login = %info.login, "client info received");
					send_approve(conn, &seq, Status::Ok, commands::SERVER_GET_CLIENT_INFO, None);
				}
				_ => {
					send_approve(
						conn,
						&seq,
						Status::Fail,
						commands::SERVER_GET_CLIENT_INFO,
						Some("invalid client info payload"),
					);
					conn.close();
				}
			}
		}

		PendingAction::ChatDelivery => {
			if command != commands::SERVER_SEND_CHAT_MESSAGE {
				warn!(conn_id = conn.id(), command = %command, "unexpected command on chat delivery seq");
				conn.close();
				return;
			}
			if !status.is_ok() {
				warn!(conn_id = conn.id(), "client rejected chat delivery");
				conn.close();
				return;
			}
			send_approve(conn, &seq, Status::Ok, commands::SERVER_SEND_CHAT_MESSAGE, None);
		}

		PendingAction::BusRelay { bus_seq } => {
			let body = join_args(&record.args);
			host.publish_bus_reply(format!("{bus_seq} {body}")).await;
		}
	}
}

/// The authentication state machine, entered on the `who_are_you` response.
async fn handle_who_are_you(host: &Arc<ServerHost>, conn: &Arc<Connection>, seq: &str, payload: Option<&str>) {
	let Some(payload) = payload else {
		send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("missing authorization payload"));
		conn.close();
		return;
	};

	let auth: AuthInfo = match serde_json::from_str(payload) {
		Ok(auth) => auth,
		Err(e) => {
			debug!(conn_id = conn.id(), error = %e, "unparsable authorization payload");
			send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("invalid authorization payload"));
			conn.close();
			return;
		}
	};

	if !auth.is_valid() {
		send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("invalid authorization info"));
		conn.close();
		return;
	}

	let user = match host.directory().find_user(&auth).await {
		Ok(user) => user,
		Err(e) => {
			send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some(&e.to_string()));
			conn.close();
			return;
		}
	};

	let device = match DeviceId::new(auth.device_id.clone()) {
		Ok(device) => device,
		Err(_) => {
			send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("invalid device id"));
			conn.close();
			return;
		}
	};
	if !user.devices.contains(&device) {
		send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("Unknown device reject"));
		conn.close();
		return;
	}

	if auth.is_anonymous() {
		if !conn.set_auth(auth) {
			warn!(conn_id = conn.id(), "duplicate who_are_you completion");
			conn.close();
			return;
		}
		send_approve(conn, seq, Status::Ok, commands::SERVER_WHO_ARE_YOU, None);
		info!(conn_id = conn.id(), remote = %conn.remote(), "anonymous session accepted");
		return;
	}

	let registered = RegisteredUser {
		uid: user.uid.clone(),
		device: device.clone(),
		login: auth.login.clone(),
	};
	match host.register_user(conn.id(), registered) {
		Err(RegisterError::DoubleConnection { .. }) => {
			send_approve(conn, seq, Status::Fail, commands::SERVER_WHO_ARE_YOU, Some("Double connection reject"));
			conn.close();
		}
		Ok(()) => {
			if !conn.set_auth(auth.clone()) {
				warn!(conn_id = conn.id(), "duplicate who_are_you completion");
				conn.close();
				return;
			}
			send_approve(conn, seq, Status::Ok, commands::SERVER_WHO_ARE_YOU, None);
			info!(conn_id = conn.id(), login = %auth.login, device = %device, "client registered");
			host.publish_user_state(&user.uid, &device, true).await;
		}
	}
}

fn send_ok_response<T: Serialize>(conn: &Arc<Connection>, seq: &str, command: &str, payload: &T) {
	match serde_json::to_string(payload) {
		Ok(json) => send_ok_response_raw(conn, seq, command, json),
		Err(e) => {
			warn!(conn_id = conn.id(), command, error = %e, "failed to serialize reply payload");
			send_fail_response(conn, seq, command, "internal serialization error");
			conn.close();
		}
	}
}

fn send_ok_response_raw(conn: &Arc<Connection>, seq: &str, command: &str, json: String) {
	let record = Record::response(seq, Status::Ok, command, vec![json]);
	if let Err(e) = conn.write_record(&record) {
		debug!(conn_id = conn.id(), command, error = %e, "failed to write ok response");
		conn.close();
	}
}

fn send_fail_response(conn: &Arc<Connection>, seq: &str, command: &str, reason: &str) {
	let record = Record::response(seq, Status::Fail, command, vec![reason.to_string()]);
	if let Err(e) = conn.write_record(&record) {
		debug!(conn_id = conn.id(), command, error = %e, "failed to write fail response");
		conn.close();
	}
}

fn send_approve(conn: &Arc<Connection>, seq: &str, status: Status, command: &str, reason: Option<&str>) {
	let args = reason.map(|r| vec![r.to_string()]).unwrap_or_default();
	let record = Record::approve(seq, status, command, args);
	if let Err(e) = conn.write_record(&record) {
		debug!(conn_id = conn.id(), command, error = %e, "failed to write approve");
		conn.close();
	}
}
