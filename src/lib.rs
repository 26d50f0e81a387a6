//! `loopnet` is a one-loop-per-thread TCP server reactor: a base
//! [`EventLoop`](event_loop::EventLoop) runs an [`Acceptor`](acceptor::Acceptor)
//! and hands each accepted connection to one of a pool of worker loops,
//! each pinned to its own OS thread for its entire lifetime.
//!
//! The pieces:
//!
//! - [`event_loop`] / [`event_loop_pool`] — the reactor itself: epoll-driven
//!   dispatch, cross-thread task posting, and a round-robin worker pool.
//! - [`poller`] / [`channel`] / [`waker`] — the epoll wrapper, the
//!   per-fd callback dispatch table, and the eventfd used to break a loop
//!   out of a blocking `epoll_wait`.
//! - [`timer`] — a timerfd-backed, ordered timer queue.
//! - [`acceptor`] / [`connection`] / [`server`] — the listening socket, the
//!   per-connection state machine, and the façade tying them to a loop pool.
//! - [`buffer`] — the growable read/write buffer and a small fixed-capacity
//!   one used by the logging backend.
//! - [`asynclog`] — a double-buffered async logging backend installed as
//!   the global [`log`] sink.
//! - [`config`] — process configuration: TOML file plus CLI overrides.
//! - [`arena`] / [`db_pool`] — optional collaborators a connection handler
//!   may reach for: scratch-memory allocation and a pooled external
//!   resource (e.g. a database connection), neither touched by the
//!   reactor's own hot path.

pub mod acceptor;
pub mod arena;
pub mod asynclog;
pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod db_pool;
pub mod error;
pub mod event_loop;
pub mod event_loop_pool;
pub mod poller;
pub mod server;
pub mod timer;
pub mod timestamp;
pub mod waker;

pub use config::Config;
pub use connection::TcpConnection;
pub use error::{Error, Result};
pub use event_loop::EventLoop;
pub use event_loop_pool::EventLoopPool;
pub use server::TcpServer;
pub use timestamp::Timestamp;
