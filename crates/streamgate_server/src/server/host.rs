#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context as _;
use parking_lot::{Mutex, RwLock};
use streamgate_domain::{ChannelType, ChatMessage, DeviceId, StreamId, UserId, UserStateInfo};
use streamgate_protocol::{Record, commands};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::server::bus::{BusBridge, ExternalBus};
use crate::server::connection::{Connection, handle_connection};
use crate::server::directory::UserDirectory;
use crate::server::fanout::ChatFanout;
use crate::server::pending::PendingAction;
use crate::server::state::{RegisterError, RegisteredUser, ServerState};

/// The server: connection tables, stream index, timers, dispatch context.
pub struct ServerHost {
	cfg: ServerConfig,
	directory: Arc<dyn UserDirectory>,
	bus: Arc<dyn ExternalBus>,
	state: Mutex<ServerState>,
	fanout: ChatFanout,
	chat_channels: RwLock<Arc<HashSet<StreamId>>>,
	next_conn_id: AtomicU64,
	shutdown_tx: watch::Sender<bool>,
}

impl ServerHost {
	pub fn new(cfg: ServerConfig, directory: Arc<dyn UserDirectory>, bus: Arc<dyn ExternalBus>) -> Arc<Self> {
		let (shutdown_tx, _) = watch::channel(false);
		Arc::new(Self {
			cfg,
			directory,
			bus,
			state: Mutex::new(ServerState::default()),
			fanout: ChatFanout::new(),
			chat_channels: RwLock::new(Arc::new(HashSet::new())),
			next_conn_id: AtomicU64::new(1),
			shutdown_tx,
		})
	}

	pub fn directory(&self) -> &dyn UserDirectory {
		self.directory.as_ref()
	}

	pub fn fanout(&self) -> &ChatFanout {
		&self.fanout
	}

	pub fn bandwidth_host(&self) -> &str {
		&self.cfg.bandwidth_host
	}

	pub async fn bind(&self) -> anyhow::Result<TcpListener> {
		TcpListener::bind(&self.cfg.bind_address)
			.await
			.with_context(|| format!("bind {}", self.cfg.bind_address))
	}

	/// Serve until shutdown. Returns an error if the bus listener fails.
	pub async fn run(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
		info!(addr = %listener.local_addr().context("listener local_addr")?, "inner tcp server listening");

		let (inbound_tx, inbound_rx) = mpsc::channel(64);
		let (bus_done_tx, mut bus_done_rx) = mpsc::channel::<anyhow::Result<()>>(1);
		{
			let bus = Arc::clone(&self.bus);
			tokio::spawn(async move {
				let _ = bus_done_tx.send(bus.listen(inbound_tx).await).await;
			});
		}
		tokio::spawn(BusBridge::new(Arc::clone(self)).run(inbound_rx));

		self.refresh_chat_channels().await;
		self.spawn_timers();

		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let mut bus_done = false;

		loop {
			if *shutdown_rx.borrow_and_update() {
				break;
			}

			tokio::select! {
				res = listener.accept() => match res {
					Ok((socket, remote)) => self.accept(socket, remote),
					Err(e) => warn!(error = %e, "accept failed"),
				},
				res = bus_done_rx.recv(), if !bus_done => {
					bus_done = true;
					match res {
						Some(Err(e)) => {
							self.shutdown();
							return Err(e.context("external bus listener failed"));
						}
						_ => warn!("external bus listener stopped"),
					}
				},
				_ = shutdown_rx.changed() => {}
			}
		}

		info!("inner tcp server stopped");
		Ok(())
	}

	/// Stop timers and the accept loop, then close every connection.
	pub fn shutdown(&self) {
		self.shutdown_tx.send_replace(true);
		for conn in self.state.lock().conns_snapshot() {
			conn.close();
		}
	}

	fn accept(self: &Arc<Self>, socket: TcpStream, remote: std::net::SocketAddr) {
		let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
		let (read_half, write_half) = socket.into_split();
		let conn = Connection::spawn(conn_id, remote, write_half);

		self.state.lock().insert_conn(Arc::clone(&conn));
		info!(conn_id, remote = %remote, "accepted connection");

		let host = Arc::clone(self);
		tokio::spawn(handle_connection(host, conn, read_half));
	}

	fn spawn_timers(self: &Arc<Self>) {
		let host = Arc::clone(self);
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(host.cfg.ping_timeout_clients);
			ticker.tick().await;
			loop {
				if *shutdown_rx.borrow_and_update() {
					break;
				}
				tokio::select! {
					_ = ticker.tick() => host.ping_all(),
					_ = shutdown_rx.changed() => {}
				}
			}
		});

		let host = Arc::clone(self);
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(host.cfg.reread_cache_timeout);
			ticker.tick().await;
			loop {
				if *shutdown_rx.borrow_and_update() {
					break;
				}
				tokio::select! {
					_ = ticker.tick() => host.refresh_chat_channels().await,
					_ = shutdown_rx.changed() => {}
				}
			}
		});
	}

	/// One `server_ping` sweep over the connection table.
	pub fn ping_all(&self) {
		let conns = self.state.lock().conns_snapshot();
		let total = conns.len();

		for conn in &conns {
			let seq = conn.next_seq();
			if conn.pending.register(&seq, PendingAction::ServerPing).is_err() {
				continue;
			}

			let ping = Record::request(seq.clone(), commands::SERVER_PING, Vec::new());
			if let Err(e) = conn.write_record(&ping) {
				conn.pending.take(&seq);
				debug!(conn_id = conn.id(), error = %e, "ping write failed; closing connection");
				conn.close();
			}
		}

		info!(clients = total, "pinged connected clients");
	}

	/// Replace the chat-channels snapshot from the directory.
	pub async fn refresh_chat_channels(&self) {
		match self.directory.chat_channels().await {
			Ok(channels) => {
				debug!(count = channels.len(), "chat channels cache refreshed");
				*self.chat_channels.write() = Arc::new(channels);
			}
			Err(e) => warn!(error = %e, "chat channels refresh failed; keeping previous snapshot"),
		}
	}

	pub fn chat_channels_snapshot(&self) -> Arc<HashSet<StreamId>> {
		Arc::clone(&self.chat_channels.read())
	}

	/// Classify a stream for `get_runtime_channel_info` replies:
	/// `(channel_type, chat_enabled, chat_read_only)`.
	pub fn channel_policy(&self, sid: &StreamId, is_anonymous: bool) -> (ChannelType, bool, bool) {
		if is_anonymous {
			return (ChannelType::Official, true, true);
		}
		if self.chat_channels_snapshot().contains(sid) {
			(ChannelType::Official, true, false)
		} else {
			(ChannelType::Private, false, true)
		}
	}

	pub(crate) fn register_user(&self, conn_id: u64, user: RegisteredUser) -> Result<(), RegisterError> {
		self.state.lock().register_user(conn_id, user)
	}

	pub fn find_by_login(&self, login: &str) -> Option<Arc<Connection>> {
		self.state.lock().find_by_login(login)
	}

	pub fn connection_count(&self) -> usize {
		self.state.lock().len()
	}

	/// Request a `get_client_info` report from one connection.
	pub fn request_client_info(&self, conn: &Arc<Connection>) -> bool {
		let seq = conn.next_seq();
		if conn.pending.register(&seq, PendingAction::GetClientInfo).is_err() {
			return false;
		}
		let request = Record::request(seq.clone(), commands::SERVER_GET_CLIENT_INFO, Vec::new());
		if let Err(e) = conn.write_record(&request) {
			conn.pending.take(&seq);
			debug!(conn_id = conn.id(), error = %e, "get_client_info write failed");
			return false;
		}
		true
	}

	/// Unlink a connection from every table; runs exactly once per
	/// connection, from its task's cleanup path.
	pub async fn drop_connection(&self, conn: &Arc<Connection>) {
		conn.close();

		let watched = self.fanout.remove(conn.id());
		let registered = self.state.lock().remove_conn(conn.id());

		match registered {
			Some(user) => {
				info!(conn_id = conn.id(), login = %user.login, "client disconnected");
				self.publish_user_state(&user.uid, &user.device, false).await;
				if let Some(sid) = watched {
					self.fanout.broadcast(&ChatMessage::leave(sid, user.login));
				}
			}
			None => debug!(conn_id = conn.id(), "connection dropped"),
		}
	}

	pub async fn publish_user_state(&self, uid: &UserId, device: &DeviceId, online: bool) {
		let state = UserStateInfo {
			uid: uid.clone(),
			device: device.as_str().to_string(),
			online,
		};
		let payload = match serde_json::to_string(&state) {
			Ok(json) => json,
			Err(e) => {
				warn!(error = %e, "failed to serialize user state");
				return;
			}
		};

		if let Err(e) = self.bus.publish_state(&payload).await {
			warn!(error = %e, uid = %uid, online, "publish_state failed");
		}
	}

	pub async fn publish_bus_reply(&self, payload: String) {
		if let Err(e) = self.bus.publish_out(&payload).await {
			warn!(error = %e, "publish_out failed");
		}
	}
}
