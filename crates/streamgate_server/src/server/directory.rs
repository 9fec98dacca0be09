#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use streamgate_domain::{
	ANONYMOUS_DEVICE_ID, ANONYMOUS_LOGIN, AuthInfo, ChannelInfo, ChannelsInfo, DeviceId, StreamId, UserId,
};
use thiserror::Error;

use crate::config::DirectorySettings;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
	#[error("unknown user: {0}")]
	UnknownUser(String),

	#[error("invalid credential for user: {0}")]
	InvalidCredential(String),

	#[error("directory unavailable: {0}")]
	Unavailable(String),
}

/// What the directory knows about one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
	pub uid: UserId,
	pub devices: HashSet<DeviceId>,
	pub channels: ChannelsInfo,
}

/// Lookup service for users, their devices, and the official chat channels.
///
/// Implementations must resolve the anonymous sentinel to a synthetic user
/// whose device set contains the anonymous device id.
#[async_trait]
pub trait UserDirectory: Send + Sync {
	async fn find_user(&self, auth: &AuthInfo) -> Result<UserInfo, DirectoryError>;

	/// Streams whose chat is official (writable by registered viewers).
	async fn chat_channels(&self) -> Result<HashSet<StreamId>, DirectoryError>;
}

struct StoredUser {
	credential: String,
	info: UserInfo,
}

/// In-memory directory seeded from config; stands in for the external
/// persistence service.
#[derive(Default)]
pub struct MemoryDirectory {
	users: HashMap<String, StoredUser>,
	official: HashSet<StreamId>,
}

impl MemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_settings(settings: &DirectorySettings) -> anyhow::Result<Self> {
		let mut dir = Self::new();

		for user in &settings.users {
			let uid = UserId::new(user.uid.clone())?;
			let devices = user
				.devices
				.iter()
				.map(|d| DeviceId::new(d.clone()))
				.collect::<Result<HashSet<_>, _>>()?;
			let mut channels = Vec::with_capacity(user.channels.len());
			for c in &user.channels {
				channels.push(ChannelInfo {
					id: StreamId::new(c.id.clone())?,
					name: c.name.clone(),
				});
			}

			dir.insert_user(
				&user.login,
				&user.credential,
				UserInfo {
					uid,
					devices,
					channels: ChannelsInfo(channels),
				},
			);
		}

		for id in &settings.official_channels {
			dir.official.insert(StreamId::new(id.clone())?);
		}

		Ok(dir)
	}

	pub fn insert_user(&mut self, login: &str, credential: &str, info: UserInfo) {
		self.users.insert(
			login.to_string(),
			StoredUser {
				credential: credential.to_string(),
				info,
			},
		);
	}

	pub fn set_official_channels(&mut self, channels: HashSet<StreamId>) {
		self.official = channels;
	}

	fn anonymous_user() -> UserInfo {
		let mut devices = HashSet::new();
		devices.insert(DeviceId::new(ANONYMOUS_DEVICE_ID).expect("anonymous device id is non-empty"));
		UserInfo {
			uid: UserId::new(ANONYMOUS_LOGIN).expect("anonymous uid is non-empty"),
			devices,
			channels: ChannelsInfo::default(),
		}
	}
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
	async fn find_user(&self, auth: &AuthInfo) -> Result<UserInfo, DirectoryError> {
		if auth.is_anonymous() {
			return Ok(Self::anonymous_user());
		}

		let stored = self
			.users
			.get(&auth.login)
			.ok_or_else(|| DirectoryError::UnknownUser(auth.login.clone()))?;
		if stored.credential != auth.credential {
			return Err(DirectoryError::InvalidCredential(auth.login.clone()));
		}

		Ok(stored.info.clone())
	}

	async fn chat_channels(&self) -> Result<HashSet<StreamId>, DirectoryError> {
		Ok(self.official.clone())
	}
}
