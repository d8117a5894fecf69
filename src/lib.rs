//! # gearman-client
//!
//! Client-side runtime for the Gearman job server protocol.
//!
//! The crate multiplexes one or more job servers behind a single
//! [`Session`]: framing the binary request/response protocol, driving
//! per-connection send/receive state machines, tracking submitted jobs
//! across round-trips and out-of-band pushes, and exposing both a
//! blocking and a cooperative non-blocking completion model over the
//! same state machines.
//!
//! ## Architecture
//!
//! - **Protocol** (`protocol`): the pure codec. 12-byte big-endian
//!   header, command table, NUL-separated argument packets.
//! - **Transport** (`transport`): one connection per server with
//!   explicit send/receive state machines, plus readiness polling.
//! - **Session** ([`Session`]): aggregates connections, owns options,
//!   timeout, hooks, and the `wait` / `ready` / `flush_all` / `echo`
//!   primitives.
//! - **Client** ([`Client`]): job submission, status polling, and
//!   `WORK_*` push dispatch by job handle.
//!
//! ## Example
//!
//! ```ignore
//! use gearman_client::{Client, Priority, SubmitMode, DEFAULT_PORT};
//!
//! let mut client = Client::new();
//! client.add_server("127.0.0.1", DEFAULT_PORT);
//!
//! // Blocking echo sanity check.
//! client.echo(b"hello")?;
//!
//! // Background submit, observed by status polling.
//! let handle = client.do_background(
//!     "reverse",
//!     &b"Hello!"[..],
//!     Priority::Normal,
//!     SubmitMode::Background,
//! )?;
//! loop {
//!     let status = client.job_status(&handle)?;
//!     if !status.known {
//!         break;
//!     }
//! }
//! # Ok::<(), gearman_client::Error>(())
//! ```
//!
//! ## Concurrency
//!
//! A session is single-threaded and cooperative: every I/O-driving call
//! either runs to completion (blocking mode) or returns
//! [`Error::IoWait`] and expects [`Session::wait`] before the retry.
//! Callers wanting parallelism create one session per thread.

pub mod client;
pub mod error;
pub mod hooks;
pub mod protocol;
pub mod session;
pub mod transport;

pub use client::{
    CalendarTime, Client, JobHandle, JobStatus, Priority, SubmitMode, Task, TaskOptions, TaskState,
    WorkFn,
};
pub use error::{failed, should_continue, Error, Result};
pub use hooks::{EventWatchFn, LogFn, SystemAllocator, Verbosity, WorkloadAllocator};
pub use protocol::{Command, Magic, Packet};
pub use session::{ConnId, Session, SessionOption, MAX_ERROR_SIZE};
pub use transport::{Connection, Events};

/// The protocol's registered TCP port.
pub const DEFAULT_PORT: u16 = 4730;
