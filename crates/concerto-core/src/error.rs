//! Error types for concerto-core.

use concerto_proto::{ShmError, StreamId};
use thiserror::Error;

/// Error type for engine operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid stream parameters: {0}")]
    InvalidStream(String),

    #[error("device is not open")]
    NotOpen,

    #[error("device {0} not found")]
    NoSuchDevice(u32),

    #[error("node {0} not found")]
    NoSuchNode(concerto_proto::NodeId),

    #[error("stream {0} not found")]
    NoSuchStream(StreamId),

    #[error("no supported format for device {0}")]
    FormatNegotiation(String),

    #[error("engine is not running")]
    EngineDown,

    #[error("drain of stream {0} timed out")]
    DrainTimeout(StreamId),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[cfg(feature = "alsa")]
    #[error("alsa: {0}")]
    Alsa(#[from] alsa::Error),

    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Error {
        Error::Io(std::io::Error::from(err))
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
