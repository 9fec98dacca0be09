#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{StreamId, UserId};

/// Payload of a successful `client_ping` reply (server local time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPingInfo {
	pub timestamp_ms: i64,
}

/// Payload carried in a `server_ping` response (client local time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPingInfo {
	pub timestamp_ms: i64,
}

/// Payload of a successful `get_server_info` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
	pub bandwidth_host: String,
}

/// Device description a client returns to `get_client_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
	pub login: String,
	pub os: String,
	pub cpu_brand: String,
	pub ram_total: u64,
	pub ram_free: u64,
	pub bandwidth: u64,
}

impl ClientInfo {
	pub fn is_valid(&self) -> bool {
		!self.login.trim().is_empty()
	}
}

/// One entry of a user's channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
	pub id: StreamId,
	pub name: String,
}

/// A user's channel listing, as returned by `get_channels`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelsInfo(pub Vec<ChannelInfo>);

impl ChannelsInfo {
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}
}

/// Chat-enabled writable vs chat-disabled (or readonly) stream classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
	Official,
	Private,
}

/// Payload of a successful `get_runtime_channel_info` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeChannelInfo {
	pub channel_id: StreamId,
	pub watchers_count: usize,
	pub channel_type: ChannelType,
	pub chat_enabled: bool,
	pub chat_read_only: bool,
}

/// What a chat record means to its viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
	Message,
	Enter,
	Leave,
}

/// A chat message scoped to one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub channel_id: StreamId,
	pub login: String,
	pub text: String,
	pub kind: MessageKind,
}

impl ChatMessage {
	pub fn new(channel_id: StreamId, login: impl Into<String>, text: impl Into<String>) -> Self {
		Self {
			channel_id,
			login: login.into(),
			text: text.into(),
			kind: MessageKind::Message,
		}
	}

	/// Presence marker emitted when `login` starts watching `channel_id`.
	pub fn enter(channel_id: StreamId, login: impl Into<String>) -> Self {
		Self {
			channel_id,
			login: login.into(),
			text: String::new(),
			kind: MessageKind::Enter,
		}
	}

	/// Presence marker emitted when `login` stops watching `channel_id`.
	pub fn leave(channel_id: StreamId, login: impl Into<String>) -> Self {
		Self {
			channel_id,
			login: login.into(),
			text: String::new(),
			kind: MessageKind::Leave,
		}
	}

	/// Presence markers carry no text; user messages must.
	pub fn is_valid(&self) -> bool {
		if self.login.trim().is_empty() {
			return false;
		}

		match self.kind {
			MessageKind::Message => !self.text.trim().is_empty(),
			MessageKind::Enter | MessageKind::Leave => true,
		}
	}
}

/// Online/offline notification published on the bus state channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStateInfo {
	pub uid: UserId,
	pub device: String,
	pub online: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sid(s: &str) -> StreamId {
		StreamId::new(s).expect("valid stream id")
	}

	#[test]
	fn chat_message_validity() {
		let msg = ChatMessage::new(sid("s1"), "alice", "hello there");
		assert!(msg.is_valid());

		let blank = ChatMessage::new(sid("s1"), "alice", "   ");
		assert!(!blank.is_valid());

		let no_login = ChatMessage::new(sid("s1"), "", "hi");
		assert!(!no_login.is_valid());

		// Presence markers are valid without text.
		assert!(ChatMessage::enter(sid("s1"), "alice").is_valid());
		assert!(ChatMessage::leave(sid("s1"), "alice").is_valid());
	}

	#[test]
	fn message_kind_serializes_snake_case() {
		let enter = ChatMessage::enter(sid("s1"), "alice");
		let json = serde_json::to_string(&enter).unwrap();
		assert!(json.contains("\"kind\":\"enter\""), "unexpected json: {json}");

		let back: ChatMessage = serde_json::from_str(&json).unwrap();
		assert_eq!(back, enter);
	}

	#[test]
	fn runtime_channel_info_roundtrip() {
		let info = RuntimeChannelInfo {
			channel_id: sid("s1"),
			watchers_count: 3,
			channel_type: ChannelType::Official,
			chat_enabled: true,
			chat_read_only: false,
		};
		let json = serde_json::to_string(&info).unwrap();
		let back: RuntimeChannelInfo = serde_json::from_str(&json).unwrap();
		assert_eq!(back, info);
	}
}
