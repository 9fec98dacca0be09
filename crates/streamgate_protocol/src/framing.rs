#![forbid(unsafe_code)]

use bytes::BytesMut;
use thiserror::Error;

use crate::record::{Record, RecordKind};

/// Maximum size of one CRLF-terminated record, terminator included.
pub const MAX_COMMAND_SIZE: usize = 8 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
	#[error("record exceeds maximum size: len={len} max={max}")]
	RecordTooLarge {
		len: usize,
		max: usize,
	},

	#[error("unrecognized record kind: {0:?}")]
	BadKind(char),

	#[error("record is missing a sequence token")]
	MissingSeq,

	#[error("record has an empty body")]
	EmptyBody,

	#[error("unbalanced quote in record arguments")]
	UnbalancedQuote,

	#[error("record is not valid utf-8")]
	InvalidUtf8,
}

/// Incremental framer: feed raw socket bytes, pop whole records.
///
/// A partial tail stays buffered between calls. Any error returned by
/// [`Framer::next_record`] is fatal for the connection.
#[derive(Debug)]
pub struct Framer {
	buf: BytesMut,
	max_record_bytes: usize,
	scanned: usize,
}

impl Default for Framer {
	fn default() -> Self {
		Self::new()
	}
}

impl Framer {
	pub fn new() -> Self {
		Self::with_max(MAX_COMMAND_SIZE)
	}

	pub fn with_max(max_record_bytes: usize) -> Self {
		Self {
			buf: BytesMut::with_capacity(1024),
			max_record_bytes,
			scanned: 0,
		}
	}

	pub fn feed(&mut self, bytes: &[u8]) {
		self.buf.extend_from_slice(bytes);
	}

	pub fn buffered_len(&self) -> usize {
		self.buf.len()
	}

	/// Pop the next complete record, if one is buffered.
	pub fn next_record(&mut self) -> Result<Option<Record>, FramingError> {
		let start = self.scanned;
		match find_crlf(&self.buf, start) {
			Some(pos) => {
				let len = pos + 2;
				if len > self.max_record_bytes {
					return Err(FramingError::RecordTooLarge {
						len,
						max: self.max_record_bytes,
					});
				}

				let line = self.buf.split_to(len);
				self.scanned = 0;

				let text = std::str::from_utf8(&line[..pos]).map_err(|_| FramingError::InvalidUtf8)?;
				decode_record(text).map(Some)
			}
			None => {
				self.scanned = self.buf.len().saturating_sub(1);
				if self.buf.len() > self.max_record_bytes {
					return Err(FramingError::RecordTooLarge {
						len: self.buf.len(),
						max: self.max_record_bytes,
					});
				}
				Ok(None)
			}
		}
	}
}

// `start` always backs off one byte from the previous scan so a CRLF
// straddling two feeds is still found.
fn find_crlf(buf: &[u8], start: usize) -> Option<usize> {
	if buf.len() < 2 {
		return None;
	}

	let from = start.min(buf.len() - 1);
	buf[from..].windows(2).position(|w| w == b"\r\n").map(|i| from + i)
}

/// Decode one record line (without the CRLF terminator).
pub fn decode_record(line: &str) -> Result<Record, FramingError> {
	let mut chars = line.chars();
	let kind_ch = chars.next().ok_or(FramingError::BadKind('\0'))?;
	let kind = u8::try_from(kind_ch)
		.ok()
		.and_then(RecordKind::from_digit)
		.ok_or(FramingError::BadKind(kind_ch))?;

	let rest = chars.as_str();
	let rest = rest.strip_prefix(' ').ok_or(FramingError::MissingSeq)?;

	let (seq, body) = rest.split_once(' ').ok_or(FramingError::EmptyBody)?;
	if seq.is_empty() {
		return Err(FramingError::MissingSeq);
	}

	let args = split_args(body)?;
	if args.is_empty() {
		return Err(FramingError::EmptyBody);
	}

	Ok(Record {
		kind,
		seq: seq.to_string(),
		args,
	})
}

/// Split a record body into arguments, shell-style.
///
/// Unquoted tokens split on runs of whitespace; double-quoted spans may
/// contain spaces and the escapes `\\ \" \n \r \t`; single-quoted spans are
/// literal except `\'`. A closing quote must be followed by whitespace or
/// the end of the body.
pub fn split_args(body: &str) -> Result<Vec<String>, FramingError> {
	let mut args = Vec::new();
	let mut chars = body.chars().peekable();

	loop {
		while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
			chars.next();
		}
		if chars.peek().is_none() {
			return Ok(args);
		}

		let mut cur = String::new();
		let mut in_double = false;
		let mut in_single = false;

		loop {
			let Some(c) = chars.next() else {
				if in_double || in_single {
					return Err(FramingError::UnbalancedQuote);
				}
				break;
			};

			if in_double {
				match c {
					'\\' => match chars.next() {
						Some('n') => cur.push('\n'),
						Some('r') => cur.push('\r'),
						Some('t') => cur.push('\t'),
						Some('\\') => cur.push('\\'),
						Some('"') => cur.push('"'),
						Some(other) => cur.push(other),
						None => return Err(FramingError::UnbalancedQuote),
					},
					'"' => {
						match chars.peek() {
							None => {}
							Some(next) if next.is_whitespace() => {}
							Some(_) => return Err(FramingError::UnbalancedQuote),
						}
						in_double = false;
					}
					other => cur.push(other),
				}
			} else if in_single {
				match c {
					'\\' if chars.peek() == Some(&'\'') => {
						chars.next();
						cur.push('\'');
					}
					'\'' => {
						match chars.peek() {
							None => {}
							Some(next) if next.is_whitespace() => {}
							Some(_) => return Err(FramingError::UnbalancedQuote),
						}
						in_single = false;
					}
					other => cur.push(other),
				}
			} else {
				match c {
					c if c.is_whitespace() => break,
					'"' => in_double = true,
					'\'' => in_single = true,
					other => cur.push(other),
				}
			}
		}

		args.push(cur);
	}
}

fn needs_quoting(arg: &str) -> bool {
	arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'))
}

fn quote_arg(arg: &str) -> String {
	if !needs_quoting(arg) {
		return arg.to_string();
	}

	let mut out = String::with_capacity(arg.len() + 2);
	out.push('"');
	for c in arg.chars() {
		match c {
			'\\' => out.push_str("\\\\"),
			'"' => out.push_str("\\\""),
			'\n' => out.push_str("\\n"),
			'\r' => out.push_str("\\r"),
			'\t' => out.push_str("\\t"),
			other => out.push(other),
		}
	}
	out.push('"');
	out
}

/// Join arguments into a record body, quoting where needed, so that
/// `split_args(join_args(a)) == a` for well-formed tokens.
pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
	let mut out = String::new();
	for (i, arg) in args.iter().enumerate() {
		if i > 0 {
			out.push(' ');
		}
		out.push_str(&quote_arg(arg.as_ref()));
	}
	out
}

/// Build a request frame from an already-formed body, passed through
/// verbatim. Used by the bus bridge, which must not re-encode what the
/// external side supplied.
pub fn encode_raw_request(seq: &str, body: &str) -> Vec<u8> {
	format!("0 {seq} {body}\r\n").into_bytes()
}
