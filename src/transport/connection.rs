//! Per-server connection engine.
//!
//! One `Connection` exists per job server. It owns the socket, a short
//! outbound packet queue, and the two protocol state machines:
//!
//! - send: `Idle` → `Writing` (header + argument image) →
//!   `FlushData` (opaque data cursor) → `Idle`
//! - receive: `Read` (12-byte header scratch) → `ReadData` (payload
//!   cursor) → `Read`
//!
//! Both machines suspend at socket boundaries: a would-block arms the
//! matching bit in the desired-event mask and either surfaces `IoWait`
//! (cooperative mode) or polls the single descriptor in place
//! (blocking mode). `EINTR` is always retried. The engine owns no
//! jobs; it operates purely on packets.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::hooks::Hooks;
use crate::protocol::{Header, Packet, HEADER_SIZE};
use crate::session::ConnId;
use crate::transport::poll;
use crate::transport::Events;

/// Per-call I/O context: the session options a connection needs while
/// driving its state machines, plus the session hooks.
pub(crate) struct IoContext<'a> {
    /// Cooperative mode: surface `IoWait` instead of polling in place.
    pub non_blocking: bool,
    /// Poll timeout in milliseconds, −1 for infinite.
    pub timeout_ms: i32,
    /// Session hooks (event watcher, workload allocator).
    pub hooks: &'a Hooks,
}

/// Send machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SendState {
    /// Nothing in flight; the queue front starts the next cycle.
    Idle,
    /// Writing the header + argument image.
    Writing,
    /// Writing the opaque data block.
    FlushData,
}

/// Receive machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvState {
    /// Filling the 12-byte header scratch.
    Read,
    /// Filling the payload cursor.
    ReadData,
}

/// In-flight inbound payload.
struct RecvPending {
    header: Header,
    buf: BytesMut,
    filled: usize,
}

/// Outcome of one raw socket read or write.
enum IoOutcome {
    Did(usize),
    Closed,
    WouldBlock,
    Interrupted,
    Failed(io::Error),
}

fn read_some(stream: &mut TcpStream, buf: &mut [u8]) -> IoOutcome {
    match stream.read(buf) {
        Ok(0) => IoOutcome::Closed,
        Ok(n) => IoOutcome::Did(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoOutcome::Interrupted,
        Err(e) => IoOutcome::Failed(e),
    }
}

fn write_some(stream: &mut TcpStream, buf: &[u8]) -> IoOutcome {
    match stream.write(buf) {
        Ok(0) => IoOutcome::Closed,
        Ok(n) => IoOutcome::Did(n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => IoOutcome::WouldBlock,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => IoOutcome::Interrupted,
        Err(e) => IoOutcome::Failed(e),
    }
}

fn is_lost(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

/// One job-server connection.
pub struct Connection {
    id: ConnId,
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    external_fd: bool,

    send_state: SendState,
    recv_state: RecvState,

    events: Events,
    revents: Events,
    ready: bool,

    ignore_lost_connection: bool,
    close_after_flush: bool,

    send_queue: VecDeque<Packet>,
    send_image: BytesMut,
    send_data_pos: usize,

    recv_header: [u8; HEADER_SIZE],
    recv_header_len: usize,
    recv_pending: Option<RecvPending>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            stream: None,
            external_fd: false,
            send_state: SendState::Idle,
            recv_state: RecvState::Read,
            events: Events::NONE,
            revents: Events::NONE,
            ready: false,
            ignore_lost_connection: false,
            close_after_flush: false,
            send_queue: VecDeque::new(),
            send_image: BytesMut::new(),
            send_data_pos: 0,
            recv_header: [0u8; HEADER_SIZE],
            recv_header_len: 0,
            recv_pending: None,
        }
    }

    /// Wrap a caller-provided, already-connected stream. The connection
    /// never reconnects an external descriptor: once lost, the next
    /// flush reports `NotConnected`.
    pub(crate) fn with_stream(id: ConnId, stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nonblocking(true)?;
        let mut conn = Self::new(id, peer.ip().to_string(), peer.port());
        conn.stream = Some(stream);
        conn.external_fd = true;
        Ok(conn)
    }

    /// Server host this connection targets.
    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port this connection targets.
    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Arena handle for this connection.
    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Suppress `LostConnection` from the send path when nothing else
    /// is queued.
    pub fn set_ignore_lost_connection(&mut self, value: bool) {
        self.ignore_lost_connection = value;
    }

    /// Close the socket once the outbound queue drains. While set, new
    /// sends are refused with `SendInProgress`.
    pub fn set_close_after_flush(&mut self, value: bool) {
        self.close_after_flush = value;
    }

    /// True once a socket is established.
    #[inline]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Raw descriptor, if connected.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    /// Desired-event mask the engine currently wants.
    #[inline]
    pub fn events(&self) -> Events {
        self.events
    }

    /// Events delivered by the most recent poll distribution.
    #[inline]
    pub fn revents(&self) -> Events {
        self.revents
    }

    /// Whether the poll distributor flagged this connection.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn take_ready(&mut self) -> bool {
        std::mem::replace(&mut self.ready, false)
    }

    /// Distribute delivered events: clear them from the desired mask
    /// and flag the connection ready for the caller to drive.
    pub(crate) fn set_revents(&mut self, revents: Events) {
        if !revents.is_empty() {
            self.ready = true;
        }
        self.revents = revents;
        self.events.remove(revents);
    }

    /// True when no packet is queued and nothing is mid-write.
    pub(crate) fn send_idle(&self) -> bool {
        self.send_state == SendState::Idle && self.send_queue.is_empty()
    }

    /// True when an inbound packet is partially received.
    pub(crate) fn recv_in_progress(&self) -> bool {
        self.recv_header_len > 0 || self.recv_pending.is_some()
    }

    /// Drop the socket and all transfer state, including queued
    /// packets. Their workload buffers go with them.
    pub fn disconnect(&mut self) {
        self.stream = None;
        self.send_state = SendState::Idle;
        self.recv_state = RecvState::Read;
        self.send_queue.clear();
        self.send_image.clear();
        self.send_data_pos = 0;
        self.recv_header_len = 0;
        self.recv_pending = None;
        self.events = Events::NONE;
        self.revents = Events::NONE;
        self.ready = false;
    }

    /// Queue a packet; with `flush_now` also drive the send machine.
    pub(crate) fn send(&mut self, packet: Packet, flush_now: bool, ctx: &IoContext) -> Result<()> {
        if self.close_after_flush {
            return Err(Error::SendInProgress);
        }
        if !packet.is_complete() {
            return Err(Error::InvalidPacket);
        }

        self.send_queue.push_back(packet);
        if flush_now {
            self.flush(ctx)
        } else {
            Ok(())
        }
    }

    /// Drive the send machine until the queue drains (or `IoWait` in
    /// cooperative mode).
    pub(crate) fn flush(&mut self, ctx: &IoContext) -> Result<()> {
        loop {
            match self.send_state {
                SendState::Idle => {
                    if self.send_queue.is_empty() {
                        if self.close_after_flush {
                            self.close_after_flush = false;
                            self.disconnect();
                        }
                        return Ok(());
                    }

                    self.ensure_connected(ctx)?;
                    let image = self.send_queue.front().ok_or(Error::UnknownState)?.encode_image()?;
                    self.send_image = image;
                    self.send_data_pos = 0;
                    self.send_state = SendState::Writing;
                }

                SendState::Writing => {
                    while !self.send_image.is_empty() {
                        let outcome = {
                            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
                            write_some(stream, &self.send_image)
                        };
                        self.advance_send(outcome, ctx)?;
                    }

                    let has_data = !self
                        .send_queue
                        .front()
                        .ok_or(Error::UnknownState)?
                        .data()
                        .is_empty();
                    if has_data {
                        self.send_state = SendState::FlushData;
                    } else {
                        self.finish_packet();
                    }
                }

                SendState::FlushData => {
                    let data = self
                        .send_queue
                        .front()
                        .ok_or(Error::UnknownState)?
                        .data_bytes();
                    while self.send_data_pos < data.len() {
                        let outcome = {
                            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
                            write_some(stream, &data[self.send_data_pos..])
                        };
                        self.advance_send(outcome, ctx)?;
                    }
                    self.finish_packet();
                }
            }
        }
    }

    /// Apply one write outcome: move cursors forward, suspend on
    /// would-block, or tear down on a lost peer.
    fn advance_send(&mut self, outcome: IoOutcome, ctx: &IoContext) -> Result<()> {
        match outcome {
            IoOutcome::Did(n) => {
                if self.send_state == SendState::Writing {
                    self.send_image.advance(n);
                } else {
                    self.send_data_pos += n;
                }
                Ok(())
            }
            IoOutcome::Interrupted => Ok(()),
            IoOutcome::WouldBlock => {
                self.arm(Events::WRITABLE, ctx);
                if ctx.non_blocking {
                    Err(Error::IoWait)
                } else {
                    self.wait_socket(Events::WRITABLE, ctx)
                }
            }
            IoOutcome::Closed => self.lost_on_send(),
            IoOutcome::Failed(e) => {
                if is_lost(&e) {
                    self.lost_on_send()
                } else {
                    self.disconnect();
                    Err(Error::Io(e))
                }
            }
        }
    }

    fn lost_on_send(&mut self) -> Result<()> {
        // Only the in-flight packet counts as "queue empty" for the
        // suppression rule.
        let queue_was_empty = self.send_queue.len() <= 1;
        self.disconnect();
        if self.ignore_lost_connection && queue_was_empty {
            tracing::debug!(host = %self.host, port = self.port, "lost connection ignored");
            Ok(())
        } else {
            Err(Error::LostConnection)
        }
    }

    fn finish_packet(&mut self) {
        self.send_queue.pop_front();
        self.send_image.clear();
        self.send_data_pos = 0;
        self.send_state = SendState::Idle;
    }

    /// Drive the receive machine until one complete packet is decoded
    /// (or `IoWait` in cooperative mode).
    pub(crate) fn recv(&mut self, ctx: &IoContext) -> Result<Packet> {
        loop {
            match self.recv_state {
                RecvState::Read => {
                    while self.recv_header_len < HEADER_SIZE {
                        let outcome = {
                            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
                            let filled = self.recv_header_len;
                            read_some(stream, &mut self.recv_header[filled..])
                        };
                        match outcome {
                            IoOutcome::Did(n) => self.recv_header_len += n,
                            IoOutcome::Interrupted => {}
                            IoOutcome::WouldBlock => {
                                self.arm(Events::READABLE, ctx);
                                if ctx.non_blocking {
                                    return Err(Error::IoWait);
                                }
                                self.wait_socket(Events::READABLE, ctx)?;
                            }
                            IoOutcome::Closed => {
                                self.disconnect();
                                return Err(Error::LostConnection);
                            }
                            IoOutcome::Failed(e) => return self.lost_on_recv(e),
                        }
                    }

                    self.recv_header_len = 0;
                    let header = match Header::decode(&self.recv_header) {
                        Ok(header) => header,
                        Err(e) => {
                            // Framing is gone; nothing sane can follow.
                            self.disconnect();
                            return Err(e);
                        }
                    };

                    if header.payload_length == 0 {
                        return Packet::decode(header, Bytes::new());
                    }

                    let size = header.payload_length as usize;
                    let mut buf = if header.command.has_data() {
                        ctx.hooks.workload.allocate(size)?
                    } else {
                        BytesMut::with_capacity(size)
                    };
                    buf.resize(size, 0);
                    self.recv_pending = Some(RecvPending {
                        header,
                        buf,
                        filled: 0,
                    });
                    self.recv_state = RecvState::ReadData;
                }

                RecvState::ReadData => {
                    let mut pending = self.recv_pending.take().ok_or(Error::UnknownState)?;

                    while pending.filled < pending.buf.len() {
                        let outcome = {
                            let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
                            read_some(stream, &mut pending.buf[pending.filled..])
                        };
                        match outcome {
                            IoOutcome::Did(n) => pending.filled += n,
                            IoOutcome::Interrupted => {}
                            IoOutcome::WouldBlock => {
                                self.arm(Events::READABLE, ctx);
                                if ctx.non_blocking {
                                    self.recv_pending = Some(pending);
                                    return Err(Error::IoWait);
                                }
                                if let Err(e) = self.wait_socket(Events::READABLE, ctx) {
                                    self.recv_pending = Some(pending);
                                    return Err(e);
                                }
                            }
                            IoOutcome::Closed => {
                                self.disconnect();
                                return Err(Error::LostConnection);
                            }
                            IoOutcome::Failed(e) => return self.lost_on_recv(e),
                        }
                    }

                    self.recv_state = RecvState::Read;
                    return Packet::decode(pending.header, pending.buf.freeze());
                }
            }
        }
    }

    fn lost_on_recv(&mut self, e: io::Error) -> Result<Packet> {
        self.disconnect();
        if is_lost(&e) {
            Err(Error::LostConnection)
        } else {
            Err(Error::Io(e))
        }
    }

    /// Add bits to the desired-event mask, notifying the watcher when
    /// the mask changes.
    fn arm(&mut self, bits: Events, ctx: &IoContext) {
        if !self.events.contains(bits) {
            self.events.insert(bits);
            if let Some(watch) = &ctx.hooks.event_watch {
                watch(self.id, self.events);
            }
        }
    }

    /// Blocking-mode internal poll on this connection's descriptor.
    fn wait_socket(&mut self, want: Events, ctx: &IoContext) -> Result<()> {
        let fd = self.fd().ok_or(Error::NotConnected)?;
        let got = poll::wait_fd(fd, want, ctx.timeout_ms)?;
        if got.is_empty() {
            return Err(Error::Timeout);
        }
        self.events.remove(got);
        self.revents = got;
        Ok(())
    }

    /// Establish the socket if needed. Connecting is not a suspension
    /// point: resolution and connect run to completion, bounded by the
    /// session timeout when one is set.
    fn ensure_connected(&mut self, ctx: &IoContext) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        if self.external_fd {
            return Err(Error::NotConnected);
        }

        let addrs = match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::debug!(host = %self.host, port = self.port, error = %e, "address resolution failed");
                return Err(Error::CouldNotConnect);
            }
        };

        for addr in addrs {
            let attempt = if ctx.timeout_ms >= 0 {
                TcpStream::connect_timeout(&addr, Duration::from_millis(ctx.timeout_ms as u64))
            } else {
                TcpStream::connect(addr)
            };
            match attempt {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    stream.set_nonblocking(true)?;
                    tracing::debug!(host = %self.host, port = self.port, %addr, "connected");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    tracing::debug!(host = %self.host, port = self.port, %addr, error = %e, "connect failed");
                }
            }
        }

        Err(Error::CouldNotConnect)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("connected", &self.is_connected())
            .field("send_state", &self.send_state)
            .field("recv_state", &self.recv_state)
            .field("events", &self.events)
            .field("queued", &self.send_queue.len())
            .finish()
    }
}
