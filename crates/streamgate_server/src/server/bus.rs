#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use streamgate_protocol::{encode_raw_request, split_args};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::BusSettings;
use crate::server::host::ServerHost;
use crate::server::pending::PendingAction;

/// One message received on the bus command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
	pub channel: String,
	pub payload: String,
}

/// External pub/sub transport, referenced by interface only.
///
/// `listen` feeds inbound command messages into `inbound` until the bus
/// shuts down; an `Err` return means the transport failed and the server
/// should stop. Publishes are fire-and-forget from the server's point of
/// view; the bridge logs their errors.
#[async_trait]
pub trait ExternalBus: Send + Sync {
	async fn listen(&self, inbound: mpsc::Sender<BusMessage>) -> anyhow::Result<()>;

	/// Publish on the reply channel.
	async fn publish_out(&self, payload: &str) -> anyhow::Result<()>;

	/// Publish on the client-state channel.
	async fn publish_state(&self, payload: &str) -> anyhow::Result<()>;
}

/// Bus stand-in when no transport is configured: publishes are dropped,
/// the listener idles forever.
#[derive(Debug, Default)]
pub struct NullBus;

#[async_trait]
impl ExternalBus for NullBus {
	async fn listen(&self, _inbound: mpsc::Sender<BusMessage>) -> anyhow::Result<()> {
		std::future::pending::<()>().await;
		Ok(())
	}

	async fn publish_out(&self, payload: &str) -> anyhow::Result<()> {
		debug!(payload, "null bus: publish_out dropped");
		Ok(())
	}

	async fn publish_state(&self, payload: &str) -> anyhow::Result<()> {
		debug!(payload, "null bus: publish_state dropped");
		Ok(())
	}
}

/// In-process bus for tests and demos: inject inbound commands, observe
/// what the server publishes.
pub struct MemoryBus {
	settings: BusSettings,
	inject_tx: mpsc::UnboundedSender<BusMessage>,
	inject_rx: Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
	out_tx: mpsc::UnboundedSender<String>,
	out_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
	state_tx: mpsc::UnboundedSender<String>,
	state_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MemoryBus {
	pub fn new(settings: BusSettings) -> Self {
		let (inject_tx, inject_rx) = mpsc::unbounded_channel();
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (state_tx, state_rx) = mpsc::unbounded_channel();
		Self {
			settings,
			inject_tx,
			inject_rx: Mutex::new(Some(inject_rx)),
			out_tx,
			out_rx: Mutex::new(Some(out_rx)),
			state_tx,
			state_rx: Mutex::new(Some(state_rx)),
		}
	}

	/// Inject one command message, as if published on the command channel.
	pub fn inject(&self, payload: &str) {
		let _ = self.inject_tx.send(BusMessage {
			channel: self.settings.channel_in.clone(),
			payload: payload.to_string(),
		});
	}

	/// Take the reply-channel receiver. Callable once.
	pub fn take_out_rx(&self) -> Option<mpsc::UnboundedReceiver<String>> {
		self.out_rx.lock().take()
	}

	/// Take the state-channel receiver. Callable once.
	pub fn take_state_rx(&self) -> Option<mpsc::UnboundedReceiver<String>> {
		self.state_rx.lock().take()
	}
}

#[async_trait]
impl ExternalBus for MemoryBus {
	async fn listen(&self, inbound: mpsc::Sender<BusMessage>) -> anyhow::Result<()> {
		let mut rx = self
			.inject_rx
			.lock()
			.take()
			.ok_or_else(|| anyhow::anyhow!("memory bus is already being listened on"))?;

		while let Some(msg) = rx.recv().await {
			if inbound.send(msg).await.is_err() {
				break;
			}
		}
		Ok(())
	}

	async fn publish_out(&self, payload: &str) -> anyhow::Result<()> {
		let _ = self.out_tx.send(payload.to_string());
		Ok(())
	}

	async fn publish_state(&self, payload: &str) -> anyhow::Result<()> {
		let _ = self.state_tx.send(payload.to_string());
		Ok(())
	}
}

/// A command injected over the bus: `<login> <seq> <command> <arg>*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InboundCommand<'a> {
	pub login: &'a str,
	pub seq: &'a str,
	/// The request body after the login token, passed through verbatim.
	pub body: &'a str,
	/// First body token, for failure publications.
	pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum InboundParseError<'a> {
	MissingLogin,
	MissingSeq(&'a str),
	MissingCommand(&'a str),
}

pub(crate) fn parse_inbound(payload: &str) -> Result<InboundCommand<'_>, InboundParseError<'_>> {
	let (login, rest) = payload.split_once(' ').ok_or(InboundParseError::MissingLogin)?;
	if login.is_empty() {
		return Err(InboundParseError::MissingLogin);
	}

	let (seq, body) = rest.split_once(' ').ok_or(InboundParseError::MissingSeq(rest))?;
	if seq.is_empty() {
		return Err(InboundParseError::MissingSeq(rest));
	}

	let command = split_args(body)
		.ok()
		.and_then(|args| args.into_iter().next())
		.ok_or(InboundParseError::MissingCommand(rest))?;

	Ok(InboundCommand {
		login,
		seq,
		body,
		command,
	})
}

/// Bridges bus command messages into connections and relays their replies
/// back out. All errors are swallowed and logged; nothing on this path may
/// take the server down.
pub struct BusBridge {
	host: Arc<ServerHost>,
}

impl BusBridge {
	pub fn new(host: Arc<ServerHost>) -> Self {
		Self { host }
	}

	pub async fn run(self, mut inbound: mpsc::Receiver<BusMessage>) {
		while let Some(msg) = inbound.recv().await {
			self.handle_message(&msg.channel, &msg.payload).await;
		}
		debug!("bus bridge stopped");
	}

	pub async fn handle_message(&self, channel: &str, payload: &str) {
		info!(channel, payload, "bus command received");

		let cmd = match parse_inbound(payload) {
			Ok(cmd) => cmd,
			Err(InboundParseError::MissingLogin) => {
				let resp = format!("UNKNOWN COMMAND: {payload}");
				warn!(%resp, "bus command rejected");
				self.host.publish_bus_reply(resp).await;
				return;
			}
			Err(InboundParseError::MissingSeq(rest)) => {
				let resp = format!("PROBLEM EXTRACTING SEQUENCE: {rest}");
				warn!(%resp, "bus command rejected");
				self.host.publish_bus_reply(resp).await;
				return;
			}
			Err(InboundParseError::MissingCommand(rest)) => {
				let resp = format!("PROBLEM EXTRACTING ID: {rest}");
				warn!(%resp, "bus command rejected");
				self.host.publish_bus_reply(resp).await;
				return;
			}
		};

		let Some(conn) = self.host.find_by_login(cmd.login) else {
			self.host
				.publish_bus_reply(format!("fail {} {} not-connected", cmd.seq, cmd.command))
				.await;
			return;
		};

		// Register first so a fast reply cannot slip past the registry;
		// the entry is withdrawn if the write never happens.
		if conn
			.pending
			.register(cmd.seq, PendingAction::BusRelay { bus_seq: cmd.seq.to_string() })
			.is_err()
		{
			self.host
				.publish_bus_reply(format!("fail {} {} duplicate-request", cmd.seq, cmd.command))
				.await;
			return;
		}

		let frame = encode_raw_request(cmd.seq, cmd.body);
		if let Err(e) = conn.write_frame(frame) {
			conn.pending.take(cmd.seq);
			debug!(conn_id = conn.id(), error = %e, "bus command write failed");
			self.host
				.publish_bus_reply(format!("fail {} {} not-handled", cmd.seq, cmd.command))
				.await;
		}
	}
}
