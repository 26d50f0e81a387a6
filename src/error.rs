use std::io;

use thiserror::Error;

/// Errors surfaced by constructor-time and configuration-time paths.
///
/// Steady-state per-connection I/O failures are not represented here; they
/// drive the connection state machine through its callbacks instead (see
/// [`crate::connection::TcpConnection`]).
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("loop is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
