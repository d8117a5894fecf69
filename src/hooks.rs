//! Pluggable session hooks: log sink, event watcher, and workload
//! allocator.
//!
//! All hooks are invoked synchronously from the calling thread; a
//! session never runs background work. When no log sink is installed,
//! messages fall through to `tracing` at the mapped level.

use bytes::{Bytes, BytesMut};

use crate::error::Result;
use crate::session::ConnId;
use crate::transport::Events;

/// Log verbosity levels, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Unrecoverable problems; also the level used for recorded errors.
    Fatal,
    /// Recoverable errors.
    Error,
    /// Operational messages.
    Info,
    /// Protocol-level tracing.
    Debug,
    /// Byte-level tracing.
    Crazy,
}

impl Verbosity {
    /// Short uppercase name, as servers print it.
    pub fn name(self) -> &'static str {
        match self {
            Verbosity::Fatal => "FATAL",
            Verbosity::Error => "ERROR",
            Verbosity::Info => "INFO",
            Verbosity::Debug => "DEBUG",
            Verbosity::Crazy => "CRAZY",
        }
    }
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Log sink callback: formatted message plus its verbosity.
pub type LogFn = Box<dyn Fn(&str, Verbosity)>;

/// Event watcher callback: invoked when a connection's desired-event
/// mask gains bits, with the full new mask.
pub type EventWatchFn = Box<dyn Fn(ConnId, Events)>;

/// Allocator for opaque workload buffers.
///
/// The receive path routes payload allocations for data-bearing
/// commands through this hook, so callers can pool or instrument the
/// buffers that end up owning job workloads and results. `release` is a
/// cooperative return point: the runtime hands buffers back where the
/// protocol layer is done with them (echo responses, recycled request
/// packets); buffers that escape to the caller are simply dropped.
pub trait WorkloadAllocator {
    /// Allocate a buffer able to hold `size` bytes.
    fn allocate(&self, size: usize) -> Result<BytesMut>;

    /// Accept a buffer back. The default implementation drops it.
    fn release(&self, data: Bytes) {
        let _ = data;
    }
}

/// Default allocator backed by the system allocator.
#[derive(Debug, Default)]
pub struct SystemAllocator;

impl WorkloadAllocator for SystemAllocator {
    fn allocate(&self, size: usize) -> Result<BytesMut> {
        Ok(BytesMut::with_capacity(size))
    }
}

/// The hook set carried by a session.
pub(crate) struct Hooks {
    pub log: Option<LogFn>,
    pub event_watch: Option<EventWatchFn>,
    pub workload: Box<dyn WorkloadAllocator>,
}

impl Default for Hooks {
    fn default() -> Self {
        Self {
            log: None,
            event_watch: None,
            workload: Box::new(SystemAllocator),
        }
    }
}
