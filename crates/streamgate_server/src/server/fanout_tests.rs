#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use streamgate_domain::{AuthInfo, ChatMessage, MessageKind, StreamId};
use streamgate_protocol::{Framer, Record, RecordKind, commands};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::server::connection::Connection;
use crate::server::fanout::ChatFanout;

async fn test_conn(id: u64, login: &str) -> (Arc<Connection>, TcpStream) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("addr");
	let client = TcpStream::connect(addr).await.expect("connect");
	let (server_sock, remote) = listener.accept().await.expect("accept");
	let (_read_half, write_half) = server_sock.into_split();

	let conn = Connection::spawn(id, remote, write_half);
	assert!(conn.set_auth(AuthInfo::new(login, "dev-1", "secret")));
	(conn, client)
}

fn sid(s: &str) -> StreamId {
	StreamId::new(s).expect("valid stream id")
}

async fn read_record(stream: &mut TcpStream) -> Record {
	let mut framer = Framer::new();
	let mut buf = [0u8; 1024];
	loop {
		if let Some(rec) = framer.next_record().expect("framing") {
			return rec;
		}
		let n = timeout(Duration::from_secs(2), stream.read(&mut buf))
			.await
			.expect("timed out waiting for record")
			.expect("read");
		assert!(n > 0, "unexpected eof");
		framer.feed(&buf[..n]);
	}
}

async fn assert_no_record(stream: &mut TcpStream) {
	let mut buf = [0u8; 1024];
	let res = timeout(Duration::from_millis(100), stream.read(&mut buf)).await;
	assert!(res.is_err(), "expected no traffic, got {res:?}");
}

#[tokio::test]
async fn connection_is_under_at_most_one_stream() {
	let fanout = ChatFanout::new();
	let (conn, _client) = test_conn(1, "alice").await;

	fanout.set_current_stream(&conn, Some(sid("s1")));
	assert_eq!(fanout.count_watchers(&sid("s1")), 1);

	fanout.set_current_stream(&conn, Some(sid("s2")));
	assert_eq!(fanout.count_watchers(&sid("s1")), 0);
	assert_eq!(fanout.count_watchers(&sid("s2")), 1);
	assert_eq!(conn.current_stream_id(), Some(sid("s2")));
}

#[tokio::test]
async fn transitions_follow_prev_next_rules() {
	let fanout = ChatFanout::new();
	let (conn, _client) = test_conn(1, "alice").await;

	let enter_only = fanout.set_current_stream(&conn, Some(sid("s1")));
	assert_eq!(enter_only.len(), 1);
	assert_eq!(enter_only[0].kind, MessageKind::Enter);
	assert_eq!(enter_only[0].channel_id, sid("s1"));
	assert_eq!(enter_only[0].login, "alice");

	let switch = fanout.set_current_stream(&conn, Some(sid("s2")));
	assert_eq!(switch.len(), 2);
	assert_eq!(switch[0].kind, MessageKind::Leave);
	assert_eq!(switch[0].channel_id, sid("s1"));
	assert_eq!(switch[1].kind, MessageKind::Enter);
	assert_eq!(switch[1].channel_id, sid("s2"));

	let same = fanout.set_current_stream(&conn, Some(sid("s2")));
	assert!(same.is_empty());

	let leave_only = fanout.set_current_stream(&conn, None);
	assert_eq!(leave_only.len(), 1);
	assert_eq!(leave_only[0].kind, MessageKind::Leave);
	assert_eq!(leave_only[0].channel_id, sid("s2"));
	assert_eq!(conn.current_stream_id(), None);
}

#[tokio::test]
async fn broadcast_reaches_exactly_the_watchers() {
	let fanout = ChatFanout::new();
	let (conn_a, mut client_a) = test_conn(1, "a").await;
	let (conn_b, mut client_b) = test_conn(2, "b").await;
	let (conn_c, mut client_c) = test_conn(3, "c").await;

	fanout.set_current_stream(&conn_a, Some(sid("s1")));
	fanout.set_current_stream(&conn_b, Some(sid("s1")));
	fanout.set_current_stream(&conn_c, Some(sid("s2")));

	let msg = ChatMessage::new(sid("s1"), "a", "hello s1");
	let delivered = fanout.broadcast(&msg);
	assert_eq!(delivered, 2);

	for client in [&mut client_a, &mut client_b] {
		let rec = read_record(client).await;
		assert_eq!(rec.kind, RecordKind::Request);
		assert_eq!(rec.command(), Some(commands::SERVER_SEND_CHAT_MESSAGE));
		let got: ChatMessage = serde_json::from_str(rec.payload().expect("payload")).expect("valid json");
		assert_eq!(got, msg);
	}

	assert_no_record(&mut client_c).await;
}

#[tokio::test]
async fn broadcast_skips_closed_connections_without_failing() {
	let fanout = ChatFanout::new();
	let (conn_a, mut client_a) = test_conn(1, "a").await;
	let (conn_b, _client_b) = test_conn(2, "b").await;

	fanout.set_current_stream(&conn_a, Some(sid("s1")));
	fanout.set_current_stream(&conn_b, Some(sid("s1")));
	conn_b.close();

	let delivered = fanout.broadcast(&ChatMessage::new(sid("s1"), "a", "still here"));
	assert_eq!(delivered, 1);

	let rec = read_record(&mut client_a).await;
	assert_eq!(rec.command(), Some(commands::SERVER_SEND_CHAT_MESSAGE));
}

#[tokio::test]
async fn remove_reports_watched_stream_once() {
	let fanout = ChatFanout::new();
	let (conn, _client) = test_conn(1, "alice").await;

	fanout.set_current_stream(&conn, Some(sid("s1")));
	assert_eq!(fanout.remove(conn.id()), Some(sid("s1")));
	assert_eq!(fanout.remove(conn.id()), None);
	assert_eq!(fanout.count_watchers(&sid("s1")), 0);
}
