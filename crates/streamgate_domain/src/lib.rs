#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod messages;

pub use messages::{
	ChannelInfo, ChannelType, ChannelsInfo, ChatMessage, ClientInfo, ClientPingInfo, MessageKind, RuntimeChannelInfo,
	ServerInfo, ServerPingInfo, UserStateInfo,
};

/// Login reported by unauthenticated-but-accepted sessions.
pub const ANONYMOUS_LOGIN: &str = "anonymous";
/// Device id reported by unauthenticated-but-accepted sessions.
pub const ANONYMOUS_DEVICE_ID: &str = "anonymous";
/// Credential reported by unauthenticated-but-accepted sessions.
pub const ANONYMOUS_CREDENTIAL: &str = "anonymous";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
}

/// Opaque identifier of a watchable stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
	/// Create a non-empty `StreamId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for StreamId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		StreamId::new(s.to_string())
	}
}

/// Directory-assigned user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Client device identifier, bound to a user in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DeviceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// The client's self-identification, carried in the `who_are_you` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
	pub login: String,
	pub device_id: String,
	pub credential: String,
}

impl AuthInfo {
	pub fn new(login: impl Into<String>, device_id: impl Into<String>, credential: impl Into<String>) -> Self {
		Self {
			login: login.into(),
			device_id: device_id.into(),
			credential: credential.into(),
		}
	}

	/// The sentinel identifying an unauthenticated-but-accepted session.
	pub fn anonymous() -> Self {
		Self {
			login: ANONYMOUS_LOGIN.to_string(),
			device_id: ANONYMOUS_DEVICE_ID.to_string(),
			credential: ANONYMOUS_CREDENTIAL.to_string(),
		}
	}

	/// All fields non-empty.
	pub fn is_valid(&self) -> bool {
		!self.login.trim().is_empty() && !self.device_id.trim().is_empty() && !self.credential.trim().is_empty()
	}

	pub fn is_anonymous(&self) -> bool {
		*self == Self::anonymous()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_reject_empty() {
		assert!(StreamId::new("").is_err());
		assert!(StreamId::new("   ").is_err());
		assert!(UserId::new("").is_err());
		assert!(DeviceId::new(" ").is_err());
		assert_eq!("s1".parse::<StreamId>().unwrap().as_str(), "s1");
	}

	#[test]
	fn auth_info_validity() {
		let auth = AuthInfo::new("alice", "dev-1", "secret");
		assert!(auth.is_valid());
		assert!(!auth.is_anonymous());

		assert!(!AuthInfo::new("", "dev-1", "secret").is_valid());
		assert!(!AuthInfo::new("alice", " ", "secret").is_valid());
		assert!(!AuthInfo::new("alice", "dev-1", "").is_valid());
	}

	#[test]
	fn anonymous_sentinel_equality() {
		let anon = AuthInfo::anonymous();
		assert!(anon.is_valid());
		assert!(anon.is_anonymous());

		// Same login with a real device is not the sentinel.
		let close = AuthInfo::new(ANONYMOUS_LOGIN, "dev-1", ANONYMOUS_CREDENTIAL);
		assert!(!close.is_anonymous());
	}

	#[test]
	fn auth_info_serde_roundtrip() {
		let auth = AuthInfo::new("alice", "dev-1", "secret");
		let json = serde_json::to_string(&auth).unwrap();
		let back: AuthInfo = serde_json::from_str(&json).unwrap();
		assert_eq!(back, auth);
	}
}
