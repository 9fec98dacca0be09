#![forbid(unsafe_code)]

//! Command vocabulary of the inner protocol.

// Client -> server requests.
pub const CLIENT_PING: &str = "client_ping";
pub const CLIENT_GET_SERVER_INFO: &str = "get_server_info";
pub const CLIENT_GET_CHANNELS: &str = "get_channels";
pub const CLIENT_GET_RUNTIME_CHANNEL_INFO: &str = "get_runtime_channel_info";
pub const CLIENT_SEND_CHAT_MESSAGE: &str = "client_send_chat_message";

// Server -> client requests.
pub const SERVER_PING: &str = "server_ping";
pub const SERVER_WHO_ARE_YOU: &str = "who_are_you";
pub const SERVER_GET_CLIENT_INFO: &str = "get_client_info";
pub const SERVER_SEND_CHAT_MESSAGE: &str = "server_send_chat_message";
