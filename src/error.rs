//! Centralized error type for the server crate.
//!
//! Wraps the subsystem errors so `?` propagates naturally across crate
//! boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] concerto_core::Error),

    #[error("protocol: {0}")]
    Wire(#[from] concerto_proto::WireError),

    #[error("server already running")]
    AlreadyRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
