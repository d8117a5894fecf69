//! Packet type: a framed protocol message.
//!
//! A packet is a header plus zero or more NUL-separated textual
//! arguments and, for data-bearing commands, a trailing opaque block.
//! Argument storage uses `bytes::Bytes` so decoded arguments are
//! zero-copy slices of the received payload.
//!
//! The codec here is pure: it holds no I/O state. Partial-read handling
//! lives in the connection's receive state machine.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::command::Command;
use crate::protocol::wire_format::{Header, Magic, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// Cap on the textual argument area of a single packet, separators
/// included. The opaque data block is not counted against this.
pub const ARGS_BUFFER_SIZE: usize = 8192;

/// Upper bound on per-command textual argument count.
pub const MAX_COMMAND_ARGS: usize = 8;

/// A complete protocol packet.
#[derive(Debug, Clone)]
pub struct Packet {
    magic: Magic,
    command: Command,
    args: Vec<Bytes>,
    data: Bytes,
    complete: bool,
}

impl Packet {
    /// Build a request packet (`\0REQ`) from arguments and data.
    ///
    /// Fails with `InvalidCommand` when the argument count does not
    /// match the command table or when `data` is passed to a command
    /// that carries none, `InvalidPacket` when a textual argument
    /// embeds a NUL, and `ArgumentTooLarge` when the argument area
    /// exceeds [`ARGS_BUFFER_SIZE`] or the payload exceeds the wire cap.
    pub fn request(command: Command, args: &[&[u8]], data: Bytes) -> Result<Self> {
        Self::build(Magic::Request, command, args, data)
    }

    /// Build a response packet (`\0RES`). Mostly useful for test
    /// fixtures; the client runtime only sends requests.
    pub fn response(command: Command, args: &[&[u8]], data: Bytes) -> Result<Self> {
        Self::build(Magic::Response, command, args, data)
    }

    fn build(magic: Magic, command: Command, args: &[&[u8]], data: Bytes) -> Result<Self> {
        debug_assert!(command.arg_count() <= MAX_COMMAND_ARGS);

        if args.len() != command.arg_count() {
            return Err(Error::InvalidCommand);
        }
        if !data.is_empty() && !command.has_data() {
            return Err(Error::InvalidCommand);
        }

        let mut args_size = 0;
        for arg in args {
            if arg.contains(&0) {
                return Err(Error::InvalidPacket);
            }
            args_size += arg.len() + 1;
        }
        if args_size > ARGS_BUFFER_SIZE {
            return Err(Error::ArgumentTooLarge);
        }
        if args_size + data.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(Error::ArgumentTooLarge);
        }

        Ok(Self {
            magic,
            command,
            args: args.iter().map(|a| Bytes::copy_from_slice(a)).collect(),
            data,
            complete: true,
        })
    }

    /// Decode a packet from a header and its complete payload.
    ///
    /// Splits on NUL up to the command's declared textual arity; any
    /// remaining bytes become the opaque data block. Fails with
    /// `InvalidPacket` on missing separators, trailing garbage, or a
    /// NUL embedded in a non-data final argument.
    pub fn decode(header: Header, payload: Bytes) -> Result<Self> {
        let command = header.command;
        let arg_count = command.arg_count();
        let has_data = command.has_data();

        if payload.len() != header.payload_length as usize {
            return Err(Error::InvalidPacket);
        }

        let mut args = Vec::with_capacity(arg_count);
        let mut cursor = 0usize;

        for i in 0..arg_count {
            let terminated = i < arg_count - 1 || has_data;
            if terminated {
                let rest = &payload[cursor..];
                let nul = rest
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or(Error::InvalidPacket)?;
                args.push(payload.slice(cursor..cursor + nul));
                cursor += nul + 1;
            } else {
                let rest = &payload[cursor..];
                if rest.contains(&0) {
                    return Err(Error::InvalidPacket);
                }
                args.push(payload.slice(cursor..));
                cursor = payload.len();
            }
        }

        let data = if has_data {
            payload.slice(cursor..)
        } else {
            if cursor != payload.len() {
                return Err(Error::InvalidPacket);
            }
            Bytes::new()
        };

        Ok(Self {
            magic: header.magic,
            command,
            args,
            data,
            complete: true,
        })
    }

    /// Parse a full frame (header plus payload) from one buffer.
    ///
    /// Convenience for callers that already hold the complete frame;
    /// the streaming path decodes the header first and reads the
    /// payload through the receive state machine.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(Error::InvalidPacket);
        }
        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&frame[..HEADER_SIZE]);
        let header = Header::decode(&header_bytes)?;
        if frame.len() - HEADER_SIZE != header.payload_length as usize {
            return Err(Error::InvalidPacket);
        }
        Self::decode(header, Bytes::copy_from_slice(&frame[HEADER_SIZE..]))
    }

    /// The header for this packet, with the payload length computed
    /// from the current arguments and data.
    pub fn header(&self) -> Header {
        Header::new(self.magic, self.command, self.payload_len())
    }

    /// Encode the header and the NUL-separated argument area into one
    /// contiguous image. The opaque data block is intentionally left
    /// out: the send machine streams it from the packet without
    /// copying.
    pub fn encode_image(&self) -> Result<BytesMut> {
        if !self.complete {
            return Err(Error::InvalidPacket);
        }

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.args_len());
        buf.extend_from_slice(&self.header().encode());

        let arg_count = self.args.len();
        for (i, arg) in self.args.iter().enumerate() {
            buf.extend_from_slice(arg);
            if i < arg_count - 1 || self.command.has_data() {
                buf.extend_from_slice(&[0]);
            }
        }
        Ok(buf)
    }

    /// Encode the complete frame, data included. Test fixtures and the
    /// text protocol use this; the send path prefers `encode_image`.
    pub fn to_frame(&self) -> Result<BytesMut> {
        let mut buf = self.encode_image()?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Byte length of the argument area, separators included.
    fn args_len(&self) -> usize {
        let arg_count = self.args.len();
        let mut len: usize = self.args.iter().map(|a| a.len()).sum();
        if arg_count > 0 {
            len += arg_count - 1;
            if self.command.has_data() {
                len += 1;
            }
        }
        len
    }

    /// Total payload length: arguments, separators, and data.
    pub fn payload_len(&self) -> u32 {
        (self.args_len() + self.data.len()) as u32
    }

    /// Frame direction marker.
    #[inline]
    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// Command from the protocol table.
    #[inline]
    pub fn command(&self) -> Command {
        self.command
    }

    /// Textual argument by position.
    #[inline]
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|a| &a[..])
    }

    /// Argument decoded as UTF-8, failing `InvalidPacket` otherwise.
    pub fn arg_str(&self, index: usize) -> Result<&str> {
        let arg = self.args.get(index).ok_or(Error::InvalidPacket)?;
        std::str::from_utf8(arg).map_err(|_| Error::InvalidPacket)
    }

    /// Argument parsed as an ASCII decimal integer.
    pub fn arg_u32(&self, index: usize) -> Result<u32> {
        self.arg_str(index)?
            .parse()
            .map_err(|_| Error::InvalidPacket)
    }

    /// All textual arguments.
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The opaque data block (empty for non-data commands).
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap zero-copy clone of the data block.
    #[inline]
    pub fn data_bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Move the data block out of the packet.
    #[inline]
    pub fn take_data(&mut self) -> Bytes {
        std::mem::take(&mut self.data)
    }

    /// Whether the packet has been fully built or decoded.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.magic == other.magic
            && self.command == other.command
            && self.args == other.args
            && self.data == other.data
    }
}
