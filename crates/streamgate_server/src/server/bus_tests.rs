#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::config::BusSettings;
use crate::server::bus::{ExternalBus, InboundParseError, MemoryBus, parse_inbound};

#[test]
fn parse_inbound_splits_login_seq_body() {
	let cmd = parse_inbound("bob abcd get_channels").expect("parses");
	assert_eq!(cmd.login, "bob");
	assert_eq!(cmd.seq, "abcd");
	assert_eq!(cmd.body, "get_channels");
	assert_eq!(cmd.command, "get_channels");
}

#[test]
fn parse_inbound_keeps_body_verbatim() {
	let cmd = parse_inbound(r#"bob ff01 get_runtime_channel_info "stream one""#).expect("parses");
	assert_eq!(cmd.body, r#"get_runtime_channel_info "stream one""#);
	assert_eq!(cmd.command, "get_runtime_channel_info");
}

#[test]
fn parse_inbound_rejects_missing_pieces() {
	assert_eq!(parse_inbound("justonetoken"), Err(InboundParseError::MissingLogin));
	assert_eq!(parse_inbound(" leading"), Err(InboundParseError::MissingLogin));
	assert_eq!(parse_inbound("bob abcd"), Err(InboundParseError::MissingSeq("abcd")));
	assert_eq!(parse_inbound("bob abcd  "), Err(InboundParseError::MissingCommand("abcd  ")));
}

#[tokio::test]
async fn memory_bus_forwards_injected_commands() {
	let bus = Arc::new(MemoryBus::new(BusSettings::default()));
	let (tx, mut rx) = mpsc::channel(8);

	let listener = {
		let bus = Arc::clone(&bus);
		tokio::spawn(async move { bus.listen(tx).await })
	};

	bus.inject("bob abcd get_channels");

	let msg = timeout(Duration::from_secs(2), rx.recv())
		.await
		.expect("timed out")
		.expect("channel open");
	assert_eq!(msg.channel, BusSettings::default().channel_in);
	assert_eq!(msg.payload, "bob abcd get_channels");

	drop(rx);
	bus.inject("ignored after receiver drop");
	let _ = timeout(Duration::from_secs(2), listener).await;
}

#[tokio::test]
async fn memory_bus_captures_publishes() {
	let bus = MemoryBus::new(BusSettings::default());
	let mut out_rx = bus.take_out_rx().expect("first take");
	let mut state_rx = bus.take_state_rx().expect("first take");
	assert!(bus.take_out_rx().is_none());

	bus.publish_out("abcd ok get_channels []").await.unwrap();
	bus.publish_state(r#"{"uid":"7","device":"d","online":true}"#).await.unwrap();

	assert_eq!(out_rx.recv().await.as_deref(), Some("abcd ok get_channels []"));
	assert_eq!(
		state_rx.recv().await.as_deref(),
		Some(r#"{"uid":"7","device":"d","online":true}"#)
	);
}

#[tokio::test]
async fn memory_bus_listen_is_single_shot() {
	let bus = Arc::new(MemoryBus::new(BusSettings::default()));
	let (tx, _rx) = mpsc::channel(1);
	let (tx2, _rx2) = mpsc::channel(1);

	let first = {
		let bus = Arc::clone(&bus);
		tokio::spawn(async move { bus.listen(tx).await })
	};
	// Give the first listener time to take the receiver.
	tokio::time::sleep(Duration::from_millis(20)).await;

	assert!(bus.listen(tx2).await.is_err());
	first.abort();
}
