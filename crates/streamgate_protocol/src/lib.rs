#![forbid(unsafe_code)]

pub mod commands;
pub mod framing;
pub mod record;

pub use framing::{Framer, FramingError, MAX_COMMAND_SIZE, decode_record, encode_raw_request, join_args, split_args};
pub use record::{Record, RecordKind, Status};
