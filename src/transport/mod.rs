//! Transport module - readiness polling and the per-server connection
//! engine.
//!
//! `poll` wraps the OS readiness primitive; `connection` drives the
//! send/receive state machines over one socket. Multi-connection
//! waiting lives in the session.

mod connection;
mod poll;

pub use connection::Connection;
pub use poll::Events;

pub(crate) use connection::IoContext;
pub(crate) use poll::{poll as poll_fds, poll_with_retry};
