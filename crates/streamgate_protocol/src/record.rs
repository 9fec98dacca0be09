#![forbid(unsafe_code)]

use core::fmt;

use crate::framing::join_args;

/// The three record kinds of the inner protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
	Request,
	Response,
	Approve,
}

impl RecordKind {
	/// Parse the single wire digit.
	pub const fn from_digit(b: u8) -> Option<Self> {
		match b {
			b'0' => Some(RecordKind::Request),
			b'1' => Some(RecordKind::Response),
			b'2' => Some(RecordKind::Approve),
			_ => None,
		}
	}

	pub const fn as_char(self) -> char {
		match self {
			RecordKind::Request => '0',
			RecordKind::Response => '1',
			RecordKind::Approve => '2',
		}
	}
}

impl fmt::Display for RecordKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RecordKind::Request => "request",
			RecordKind::Response => "response",
			RecordKind::Approve => "approve",
		})
	}
}

/// Literal `ok`/`fail` status token of responses and approves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Ok,
	Fail,
}

impl Status {
	pub const fn as_str(self) -> &'static str {
		match self {
			Status::Ok => "ok",
			Status::Fail => "fail",
		}
	}

	/// Parse a status token; anything but the two literals is `None`.
	pub fn from_token(token: &str) -> Option<Self> {
		match token {
			"ok" => Some(Status::Ok),
			"fail" => Some(Status::Fail),
			_ => None,
		}
	}

	pub const fn is_ok(self) -> bool {
		matches!(self, Status::Ok)
	}
}

impl fmt::Display for Status {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One decoded wire unit: `kind SP seq SP args... CRLF`.
///
/// For requests `args[0]` is the command; for responses and approves
/// `args[0]` is the status token and `args[1]` the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
	pub kind: RecordKind,
	pub seq: String,
	pub args: Vec<String>,
}

impl Record {
	pub fn request(seq: impl Into<String>, command: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
		let mut all = vec![command.into()];
		all.extend(args);
		Self {
			kind: RecordKind::Request,
			seq: seq.into(),
			args: all,
		}
	}

	pub fn response(
		seq: impl Into<String>,
		status: Status,
		command: impl Into<String>,
		args: impl IntoIterator<Item = String>,
	) -> Self {
		let mut all = vec![status.as_str().to_string(), command.into()];
		all.extend(args);
		Self {
			kind: RecordKind::Response,
			seq: seq.into(),
			args: all,
		}
	}

	pub fn approve(
		seq: impl Into<String>,
		status: Status,
		command: impl Into<String>,
		args: impl IntoIterator<Item = String>,
	) -> Self {
		let mut all = vec![status.as_str().to_string(), command.into()];
		all.extend(args);
		Self {
			kind: RecordKind::Approve,
			seq: seq.into(),
			args: all,
		}
	}

	/// The command identifier, independent of the record kind.
	pub fn command(&self) -> Option<&str> {
		match self.kind {
			RecordKind::Request => self.args.first().map(String::as_str),
			RecordKind::Response | RecordKind::Approve => self.args.get(1).map(String::as_str),
		}
	}

	/// The status token of a response/approve; `None` for requests and
	/// for tokens that are neither `ok` nor `fail`.
	pub fn status(&self) -> Option<Status> {
		match self.kind {
			RecordKind::Request => None,
			RecordKind::Response | RecordKind::Approve => self.args.first().and_then(|t| Status::from_token(t)),
		}
	}

	/// Arguments following the command identifier.
	pub fn command_args(&self) -> &[String] {
		let skip = match self.kind {
			RecordKind::Request => 1,
			RecordKind::Response | RecordKind::Approve => 2,
		};
		self.args.get(skip..).unwrap_or(&[])
	}

	/// The single payload argument, when exactly that shape is expected.
	pub fn payload(&self) -> Option<&str> {
		self.command_args().first().map(String::as_str)
	}

	/// Encode into wire bytes, CRLF-terminated, quoting as needed.
	pub fn encode(&self) -> Vec<u8> {
		let mut out = String::with_capacity(self.seq.len() + 32);
		out.push(self.kind.as_char());
		out.push(' ');
		out.push_str(&self.seq);
		if !self.args.is_empty() {
			out.push(' ');
			out.push_str(&join_args(&self.args));
		}
		out.push_str("\r\n");
		out.into_bytes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn request_accessors() {
		let rec = Record::request("1a", "get_runtime_channel_info", vec!["s1".to_string()]);
		assert_eq!(rec.kind, RecordKind::Request);
		assert_eq!(rec.command(), Some("get_runtime_channel_info"));
		assert_eq!(rec.status(), None);
		assert_eq!(rec.payload(), Some("s1"));
	}

	#[test]
	fn response_accessors() {
		let rec = Record::response("1a", Status::Ok, "client_ping", vec!["{}".to_string()]);
		assert_eq!(rec.command(), Some("client_ping"));
		assert_eq!(rec.status(), Some(Status::Ok));
		assert_eq!(rec.payload(), Some("{}"));
	}

	#[test]
	fn unknown_status_token_is_none() {
		let rec = Record {
			kind: RecordKind::Response,
			seq: "1".to_string(),
			args: vec!["OK".to_string(), "client_ping".to_string()],
		};
		assert_eq!(rec.status(), None);
	}

	#[test]
	fn encode_shapes() {
		let req = Record::request("2b", "client_ping", Vec::new());
		assert_eq!(req.encode(), b"0 2b client_ping\r\n");

		let resp = Record::approve("2b", Status::Fail, "who_are_you", vec!["Double connection reject".to_string()]);
		assert_eq!(resp.encode(), b"2 2b fail who_are_you \"Double connection reject\"\r\n");
	}
}
