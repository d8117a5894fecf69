//! Protocol module - wire format, command table, and packet codec.
//!
//! This module implements the binary protocol:
//! - 12-byte header encoding/decoding
//! - Command table with per-command arity and data flags
//! - Packet type with NUL-separated argument codec
//!
//! Everything here is pure; the connection engine owns all I/O state.

mod command;
mod packet;
mod wire_format;

pub use command::Command;
pub use packet::{Packet, ARGS_BUFFER_SIZE, MAX_COMMAND_ARGS};
pub use wire_format::{Header, Magic, HEADER_SIZE, MAX_PAYLOAD_SIZE};
