//! Session: the per-thread aggregator for connections, options, and
//! multi-connection waiting.
//!
//! A session owns its connections in a slot arena addressed by
//! generational [`ConnId`] handles, so removal mid-iteration can never
//! resurrect a stale handle. It carries the I/O mode (blocking vs
//! cooperative), the poll timeout, the bounded error buffer, and the
//! pluggable hooks. A session is single-threaded by design: callers
//! who want parallelism create one session per thread.

use std::net::TcpStream;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::hooks::{EventWatchFn, Hooks, LogFn, Verbosity, WorkloadAllocator};
use crate::protocol::{Command, Packet};
use crate::transport::{poll_fds, poll_with_retry, Connection, Events, IoContext};

/// Bound on the recorded error message, terminator included.
pub const MAX_ERROR_SIZE: usize = 1024;

/// Generational handle to a connection owned by a session.
///
/// Stale handles (the slot was freed or reused) resolve to `None`
/// rather than to a different connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

impl ConnId {
    #[inline]
    pub(crate) fn idx(self) -> usize {
        self.index as usize
    }
}

/// Options settable through [`Session::set_option`].
///
/// The option set is closed by construction; there is no
/// "unknown option" failure mode to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOption {
    /// Cooperative mode: I/O calls surface `IoWait` instead of polling
    /// in place.
    NonBlocking,
    /// Skip the session-level accounting of packets created for its
    /// own operations.
    DontTrackPackets,
}

#[derive(Debug, Clone, Copy, Default)]
struct Options {
    non_blocking: bool,
    dont_track_packets: bool,
    // Only meaningful between a push/pop pair around a self-contained
    // blocking subroutine.
    stored_non_blocking: bool,
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// A client-side protocol session over one or more job servers.
pub struct Session {
    options: Options,
    verbosity: Verbosity,
    timeout_ms: i32,
    slots: Vec<Slot>,
    con_count: usize,
    pfds: Vec<libc::pollfd>,
    // Slot index per pfds entry, refreshed by each wait().
    pfd_slots: Vec<usize>,
    packet_count: usize,
    last_errno: i32,
    last_error: String,
    hooks: Hooks,
}

impl Session {
    /// Create a session with default options: blocking mode, infinite
    /// timeout, packet tracking on.
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            verbosity: Verbosity::Fatal,
            timeout_ms: -1,
            slots: Vec::new(),
            con_count: 0,
            pfds: Vec::new(),
            pfd_slots: Vec::new(),
            packet_count: 0,
            last_errno: 0,
            last_error: String::new(),
            hooks: Hooks::default(),
        }
    }

    /// Clone the session shape: options, timeout, verbosity, and the
    /// server list. Live sockets, packets, and hooks are not cloned.
    pub fn try_clone(&self) -> Session {
        let mut dest = Session::new();
        dest.options.non_blocking = self.options.non_blocking;
        dest.options.dont_track_packets = self.options.dont_track_packets;
        dest.timeout_ms = self.timeout_ms;
        dest.verbosity = self.verbosity;
        for conn in self.connections() {
            let host = conn.host().to_string();
            dest.add_server(host, conn.port());
        }
        dest
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Register a job server. No socket is opened until the first send.
    pub fn add_server(&mut self, host: impl Into<String>, port: u16) -> ConnId {
        let id = self.claim_slot();
        let conn = Connection::new(id, host, port);
        self.slots[id.idx()].conn = Some(conn);
        self.con_count += 1;
        id
    }

    /// Register an already-connected stream as a server connection.
    /// The session never reconnects it.
    pub fn add_stream(&mut self, stream: TcpStream) -> Result<ConnId> {
        let id = self.claim_slot();
        let conn = Connection::with_stream(id, stream)?;
        self.slots[id.idx()].conn = Some(conn);
        self.con_count += 1;
        Ok(id)
    }

    fn claim_slot(&mut self) -> ConnId {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.conn.is_none() {
                return ConnId {
                    index: index as u32,
                    generation: slot.generation,
                };
            }
        }
        self.slots.push(Slot {
            generation: 0,
            conn: None,
        });
        ConnId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Drop a connection; its socket closes and queued packets are
    /// freed. The slot's generation advances so the handle goes stale.
    pub fn remove_server(&mut self, id: ConnId) -> bool {
        match self.slots.get_mut(id.idx()) {
            Some(slot) if slot.generation == id.generation && slot.conn.is_some() => {
                slot.conn = None;
                slot.generation += 1;
                self.con_count -= 1;
                true
            }
            _ => false,
        }
    }

    /// Resolve a handle to its connection, if still live.
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.idx())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    /// Mutable variant of [`Session::connection`].
    pub fn connection_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.idx())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    /// Iterate live connections.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.slots.iter().filter_map(|slot| slot.conn.as_ref())
    }

    /// Handles of all live connections, in slot order.
    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.connections().map(|conn| conn.id()).collect()
    }

    /// Number of live connections.
    #[inline]
    pub fn con_count(&self) -> usize {
        self.con_count
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    /// Toggle a session option.
    pub fn set_option(&mut self, option: SessionOption, value: bool) {
        match option {
            SessionOption::NonBlocking => self.options.non_blocking = value,
            SessionOption::DontTrackPackets => self.options.dont_track_packets = value,
        }
    }

    /// Whether cooperative mode is active.
    #[inline]
    pub fn is_non_blocking(&self) -> bool {
        self.options.non_blocking
    }

    /// Set the poll timeout in milliseconds; −1 means infinite.
    pub fn set_timeout(&mut self, timeout_ms: i32) {
        self.timeout_ms = timeout_ms;
    }

    /// Current poll timeout in milliseconds.
    #[inline]
    pub fn timeout(&self) -> i32 {
        self.timeout_ms
    }

    /// Set the verbosity gate for [`Session::log`].
    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    /// Current verbosity gate.
    #[inline]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    /// Install a log sink. Recorded errors are delivered to it at
    /// `Fatal` instead of being stored in the error buffer.
    pub fn set_log_fn(&mut self, log: LogFn, verbosity: Verbosity) {
        self.hooks.log = Some(log);
        self.verbosity = verbosity;
    }

    /// Install an event watcher, invoked whenever a connection's
    /// desired-event mask gains bits.
    pub fn set_event_watch_fn(&mut self, watch: EventWatchFn) {
        self.hooks.event_watch = Some(watch);
    }

    /// Replace the workload allocator used for opaque data buffers.
    pub fn set_workload_allocator(&mut self, allocator: Box<dyn WorkloadAllocator>) {
        self.hooks.workload = allocator;
    }

    /// Hand a workload buffer back to the allocator hook.
    pub fn release_workload(&self, data: Bytes) {
        self.hooks.workload.release(data);
    }

    // ------------------------------------------------------------------
    // Packet accounting
    // ------------------------------------------------------------------

    /// Packets currently outstanding on behalf of session operations.
    #[inline]
    pub fn packet_count(&self) -> usize {
        self.packet_count
    }

    pub(crate) fn track_packet(&mut self) {
        if !self.options.dont_track_packets {
            self.packet_count += 1;
        }
    }

    pub(crate) fn untrack_packet(&mut self) {
        if !self.options.dont_track_packets {
            self.packet_count = self.packet_count.saturating_sub(1);
        }
    }

    // ------------------------------------------------------------------
    // Errors and logging
    // ------------------------------------------------------------------

    /// The last recorded error message, `function:detail` formatted.
    #[inline]
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// The errno captured by the last failing system call.
    #[inline]
    pub fn last_errno(&self) -> i32 {
        self.last_errno
    }

    /// Record an error. Delivered to the log sink at `Fatal` when one
    /// is installed; otherwise stored, truncated to [`MAX_ERROR_SIZE`].
    pub(crate) fn set_error(&mut self, function: &str, message: &str) {
        let mut formatted = String::with_capacity(function.len() + 1 + message.len());
        formatted.push_str(function);
        formatted.push(':');
        formatted.push_str(message);

        tracing::error!("{formatted}");

        if let Some(log) = &self.hooks.log {
            log(&formatted, Verbosity::Fatal);
        } else {
            if formatted.len() >= MAX_ERROR_SIZE {
                let mut end = MAX_ERROR_SIZE - 1;
                while !formatted.is_char_boundary(end) {
                    end -= 1;
                }
                formatted.truncate(end);
            }
            self.last_error = formatted;
        }
    }

    /// Emit a log message through the sink, gated on the session
    /// verbosity. Without a sink the message goes to `tracing`.
    pub(crate) fn log(&self, verbosity: Verbosity, message: &str) {
        if verbosity > self.verbosity {
            return;
        }
        match &self.hooks.log {
            Some(log) => log(message, verbosity),
            None => match verbosity {
                Verbosity::Fatal | Verbosity::Error => tracing::error!("{message}"),
                Verbosity::Info => tracing::info!("{message}"),
                Verbosity::Debug => tracing::debug!("{message}"),
                Verbosity::Crazy => tracing::trace!("{message}"),
            },
        }
    }

    // ------------------------------------------------------------------
    // I/O driving
    // ------------------------------------------------------------------

    /// Queue a packet on a connection and drive its send machine.
    pub(crate) fn send_packet(
        &mut self,
        id: ConnId,
        packet: Packet,
        flush_now: bool,
    ) -> Result<()> {
        let ctx = IoContext {
            non_blocking: self.options.non_blocking,
            timeout_ms: self.timeout_ms,
            hooks: &self.hooks,
        };
        let conn = match Self::slot_conn(&mut self.slots, id) {
            Some(conn) => conn,
            None => return Err(Error::NotConnected),
        };
        conn.send(packet, flush_now, &ctx)
    }

    /// Drive a connection's receive machine for one packet.
    pub(crate) fn recv_packet(&mut self, id: ConnId) -> Result<Packet> {
        let ctx = IoContext {
            non_blocking: self.options.non_blocking,
            timeout_ms: self.timeout_ms,
            hooks: &self.hooks,
        };
        let conn = match Self::slot_conn(&mut self.slots, id) {
            Some(conn) => conn,
            None => return Err(Error::NotConnected),
        };
        conn.recv(&ctx)
    }

    fn slot_conn(slots: &mut [Slot], id: ConnId) -> Option<&mut Connection> {
        slots
            .get_mut(id.idx())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    /// Flush every connection that is not already waiting for the
    /// socket to become writable. Returns the first terminal error.
    pub fn flush_all(&mut self) -> Result<()> {
        let mut failure = None;

        for index in 0..self.slots.len() {
            let ctx = IoContext {
                non_blocking: self.options.non_blocking,
                timeout_ms: self.timeout_ms,
                hooks: &self.hooks,
            };
            let conn = match self.slots[index].conn.as_mut() {
                Some(conn) => conn,
                None => continue,
            };
            if conn.events().writable() {
                continue;
            }
            match conn.flush(&ctx) {
                Ok(()) | Err(Error::IoWait) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        match failure {
            Some(e) => {
                self.set_error("gearman_flush_all", &e.to_string());
                Err(e)
            }
            None => Ok(()),
        }
    }

    /// Block until at least one connection has readiness, bounded by
    /// the session timeout. Delivered events are distributed to each
    /// connection's revents dispatcher, which sets its `ready` flag.
    pub fn wait(&mut self) -> Result<()> {
        self.pfds.clear();
        self.pfd_slots.clear();

        let wanted: usize = self.connections().filter(|c| !c.events().is_empty()).count();
        if wanted == 0 {
            self.set_error("gearman_wait", "no active file descriptors");
            return Err(Error::NoActiveFds);
        }
        if self.pfds.try_reserve(wanted).is_err() || self.pfd_slots.try_reserve(wanted).is_err() {
            self.set_error("gearman_wait", "pollfd buffer allocation failed");
            return Err(Error::MemoryAllocationFailure);
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let conn = match slot.conn.as_ref() {
                Some(conn) => conn,
                None => continue,
            };
            let events = conn.events();
            if events.is_empty() {
                continue;
            }
            let fd = match conn.fd() {
                Some(fd) => fd,
                None => continue,
            };
            self.pfds.push(libc::pollfd {
                fd,
                events: events.to_poll(),
                revents: 0,
            });
            self.pfd_slots.push(index);
        }

        if self.pfds.is_empty() {
            self.set_error("gearman_wait", "no active file descriptors");
            return Err(Error::NoActiveFds);
        }

        let timeout_ms = self.timeout_ms;
        let pfds = &mut self.pfds;
        let ret = poll_with_retry(|| poll_fds(pfds.as_mut_slice(), timeout_ms));

        let n = match ret {
            Ok(n) => n,
            Err(e) => {
                let errno = e.raw_os_error().unwrap_or(0);
                self.last_errno = errno;
                self.set_error("gearman_wait", &format!("poll:{errno}"));
                return Err(Error::Io(e));
            }
        };
        if n == 0 {
            self.set_error("gearman_wait", "timeout reached");
            return Err(Error::Timeout);
        }

        for (pfd_index, slot_index) in self.pfd_slots.iter().enumerate() {
            let revents = Events::from_poll(self.pfds[pfd_index].revents);
            if let Some(conn) = self.slots[*slot_index].conn.as_mut() {
                conn.set_revents(revents);
            }
        }

        Ok(())
    }

    /// First connection flagged ready, clearing the flag. The scan
    /// restarts from the head each call because connections may be
    /// removed while the caller processes one.
    pub fn ready(&mut self) -> Option<ConnId> {
        for slot in &mut self.slots {
            if let Some(conn) = slot.conn.as_mut() {
                if conn.take_ready() {
                    return Some(conn.id());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Blocking-mode push/pop and echo
    // ------------------------------------------------------------------

    /// Run a self-contained subroutine in blocking mode, restoring the
    /// stored mode on every exit path. This is the only permitted form
    /// of mode re-entry.
    pub(crate) fn run_blocking<T>(
        &mut self,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<T> {
        self.push_blocking();
        let result = f(self);
        self.pop_non_blocking();
        result
    }

    pub(crate) fn push_blocking(&mut self) {
        self.options.stored_non_blocking = self.options.non_blocking;
        self.options.non_blocking = false;
    }

    pub(crate) fn pop_non_blocking(&mut self) {
        self.options.non_blocking = self.options.stored_non_blocking;
    }

    /// Send `workload` to every server and byte-compare each response.
    ///
    /// Runs to completion regardless of the session mode. A connection
    /// with queued sends or a half-received packet is refused
    /// (`SendInProgress` / `RecvInProgress`) so the temporary mode flip
    /// stays confined to this call.
    pub fn echo(&mut self, workload: &[u8]) -> Result<()> {
        let packet = Packet::request(Command::EchoReq, &[], Bytes::copy_from_slice(workload))?;
        self.track_packet();
        let result = self.run_blocking(|session| session.echo_all(&packet));
        self.untrack_packet();
        result
    }

    fn echo_all(&mut self, packet: &Packet) -> Result<()> {
        for id in self.conn_ids() {
            let (send_busy, recv_busy) = match self.connection(id) {
                Some(conn) => (!conn.send_idle(), conn.recv_in_progress()),
                None => continue,
            };
            if send_busy {
                self.set_error("gearman_echo", "send in progress on connection");
                return Err(Error::SendInProgress);
            }
            if recv_busy {
                self.set_error("gearman_echo", "receive in progress on connection");
                return Err(Error::RecvInProgress);
            }

            self.send_packet(id, packet.clone(), true)?;
            let mut response = self.recv_packet(id)?;

            if response.command() != Command::EchoRes || response.data() != packet.data() {
                self.release_workload(response.take_data());
                self.set_error("gearman_echo", "corruption during echo");
                return Err(Error::EchoDataCorruption);
            }
            self.release_workload(response.take_data());
        }

        Ok(())
    }

    /// Record the errno carried by an error, if any, into the session.
    pub(crate) fn capture_errno(&mut self, error: &Error) {
        if let Some(errno) = error.errno() {
            self.last_errno = errno;
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("con_count", &self.con_count)
            .field("non_blocking", &self.options.non_blocking)
            .field("timeout_ms", &self.timeout_ms)
            .field("packet_count", &self.packet_count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read as _, Write as _};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_con_count_tracks_arena() {
        let mut session = Session::new();
        assert_eq!(session.con_count(), 0);

        let a = session.add_server("127.0.0.1", 4730);
        let b = session.add_server("127.0.0.1", 4731);
        assert_eq!(session.con_count(), 2);
        assert_eq!(session.connections().count(), 2);

        assert!(session.remove_server(a));
        assert_eq!(session.con_count(), 1);
        assert_eq!(session.connections().count(), 1);

        assert!(session.remove_server(b));
        assert_eq!(session.con_count(), 0);
        assert_eq!(session.connections().count(), 0);
    }

    #[test]
    fn test_stale_handle_resolves_to_none() {
        let mut session = Session::new();
        let a = session.add_server("127.0.0.1", 4730);
        assert!(session.remove_server(a));
        assert!(!session.remove_server(a));

        // The freed slot is reused with a bumped generation.
        let b = session.add_server("127.0.0.1", 4731);
        assert!(session.connection(a).is_none());
        assert_eq!(session.connection(b).unwrap().port(), 4731);
    }

    #[test]
    fn test_add_server_is_lazy() {
        let mut session = Session::new();
        // Host that cannot resolve; adding must still succeed.
        let id = session.add_server("host.invalid", 4730);
        assert!(!session.connection(id).unwrap().is_connected());
    }

    #[test]
    fn test_set_option_toggles() {
        let mut session = Session::new();
        assert!(!session.is_non_blocking());
        session.set_option(SessionOption::NonBlocking, true);
        assert!(session.is_non_blocking());
        session.set_option(SessionOption::DontTrackPackets, true);
        session.set_option(SessionOption::NonBlocking, false);
        assert!(!session.is_non_blocking());
    }

    #[test]
    fn test_dont_track_packets_skips_accounting() {
        let mut session = Session::new();
        session.track_packet();
        assert_eq!(session.packet_count(), 1);
        session.untrack_packet();
        assert_eq!(session.packet_count(), 0);

        session.set_option(SessionOption::DontTrackPackets, true);
        session.track_packet();
        assert_eq!(session.packet_count(), 0);
    }

    #[test]
    fn test_wait_with_no_connections() {
        let mut session = Session::new();
        let err = session.wait().unwrap_err();
        assert!(matches!(err, Error::NoActiveFds));
        assert_eq!(session.last_error(), "gearman_wait:no active file descriptors");
    }

    #[test]
    fn test_wait_with_eventless_connection() {
        let mut session = Session::new();
        session.add_server("127.0.0.1", 4730);
        let err = session.wait().unwrap_err();
        assert!(matches!(err, Error::NoActiveFds));
    }

    #[test]
    fn test_ready_empty() {
        let mut session = Session::new();
        session.add_server("127.0.0.1", 4730);
        assert!(session.ready().is_none());
    }

    #[test]
    fn test_echo_no_servers_restores_mode() {
        let mut session = Session::new();
        session.set_option(SessionOption::NonBlocking, true);
        session.echo(b"hello").unwrap();
        assert!(session.is_non_blocking());
    }

    #[test]
    fn test_echo_failure_restores_mode() {
        let mut session = Session::new();
        session.set_option(SessionOption::NonBlocking, true);
        session.set_timeout(100);

        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        session.add_server("127.0.0.1", port);

        let err = session.echo(b"hello").unwrap_err();
        assert!(matches!(err, Error::CouldNotConnect));
        assert!(session.is_non_blocking());
    }

    #[test]
    fn test_echo_refuses_queued_sends() {
        let mut session = Session::new();
        let id = session.add_server("127.0.0.1", 4730);
        let packet =
            Packet::request(Command::EchoReq, &[], Bytes::from_static(b"q")).unwrap();
        session.send_packet(id, packet, false).unwrap();

        let err = session.echo(b"hello").unwrap_err();
        assert!(matches!(err, Error::SendInProgress));
        assert!(session.last_error().starts_with("gearman_echo:"));
    }

    #[test]
    fn test_log_sink_receives_errors() {
        let mut session = Session::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_hook = seen.clone();
        session.set_log_fn(
            Box::new(move |message, verbosity| {
                assert!(message.starts_with("gearman_wait:"));
                assert_eq!(verbosity, Verbosity::Fatal);
                seen_hook.fetch_add(1, Ordering::SeqCst);
            }),
            Verbosity::Fatal,
        );

        let _ = session.wait();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        // With a sink installed the buffer stays untouched.
        assert_eq!(session.last_error(), "");
    }

    #[test]
    fn test_error_buffer_is_bounded() {
        let mut session = Session::new();
        let long = "x".repeat(4 * MAX_ERROR_SIZE);
        session.set_error("gearman_test", &long);
        assert!(session.last_error().len() < MAX_ERROR_SIZE);
        assert!(session.last_error().starts_with("gearman_test:"));
    }

    #[test]
    fn test_try_clone_copies_servers_not_sockets() {
        let mut session = Session::new();
        session.set_option(SessionOption::NonBlocking, true);
        session.set_timeout(250);
        session.add_server("a.example", 4730);
        session.add_server("b.example", 4731);

        let clone = session.try_clone();
        assert_eq!(clone.con_count(), 2);
        assert!(clone.is_non_blocking());
        assert_eq!(clone.timeout(), 250);
        assert!(clone.connections().all(|c| !c.is_connected()));
    }

    #[test]
    fn test_wait_distributes_readiness() {
        let mut session = Session::new();
        session.set_option(SessionOption::NonBlocking, true);
        session.set_timeout(2000);

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        // Hold the reply until the test has observed IoWait, so the
        // first cooperative recv deterministically finds an empty
        // socket.
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut frame = [0u8; 13]; // ECHO_REQ header + 1 data byte
            sock.read_exact(&mut frame).unwrap();
            release_rx.recv().unwrap();
            let reply = Packet::response(
                Command::EchoRes,
                &[],
                Bytes::copy_from_slice(&frame[12..]),
            )
            .unwrap()
            .to_frame()
            .unwrap();
            sock.write_all(&reply).unwrap();
            sock
        });

        let id = session.add_server("127.0.0.1", port);
        let packet =
            Packet::request(Command::EchoReq, &[], Bytes::from_static(b"z")).unwrap();
        session.send_packet(id, packet, true).unwrap();

        let err = session.recv_packet(id).unwrap_err();
        assert!(err.is_io_wait());

        release_tx.send(()).unwrap();
        session.wait().unwrap();
        let ready = session.ready().unwrap();
        assert_eq!(ready, id);

        let response = session.recv_packet(id).unwrap();
        assert_eq!(response.command(), Command::EchoRes);
        assert_eq!(response.data(), b"z");
        drop(server.join().unwrap());
    }

    #[test]
    fn test_event_watch_sees_mask_changes() {
        let mut session = Session::new();
        session.set_option(SessionOption::NonBlocking, true);

        let watched = Arc::new(AtomicUsize::new(0));
        let watched_hook = watched.clone();
        session.set_event_watch_fn(Box::new(move |_, events| {
            assert!(events.readable());
            watched_hook.fetch_add(1, Ordering::SeqCst);
        }));

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let id = session.add_server("127.0.0.1", port);
        let packet =
            Packet::request(Command::EchoReq, &[], Bytes::from_static(b"z")).unwrap();
        session.send_packet(id, packet, true).unwrap();

        let _ = session.recv_packet(id);
        assert_eq!(watched.load(Ordering::SeqCst), 1);
    }
}
