//! Protocol surface shared by the concerto server and its clients.
//!
//! # Contents
//!
//! - [`format`]: sample formats, channel positions and [`AudioFormat`]
//! - [`id`]: stream/node identifiers and direction/type enums
//! - [`wire`]: the fixed-layout control-socket messages
//! - [`shm`]: the shared-memory audio ring ([`AudioShm`])
//!
//! The server links this crate through `concerto-core`; a client library
//! links it directly. Nothing here depends on the engine.

pub mod format;
pub mod id;
pub mod shm;
pub mod wire;

pub use format::{
    default_channel_layout, AudioFormat, ChannelLayout, ChannelPosition, SampleFormat,
    CHANNEL_COUNT,
};
pub use id::{ClientType, Direction, NodeId, StreamId, StreamType, NO_DEVICE};
pub use shm::{AudioShm, ShmError, SHM_HEADER_BYTES};
pub use wire::{
    ClientMessage, ConnectStreamMsg, NodeAttr, ServerMessage, WireError, HEADER_BYTES,
    MAX_FRAME_BYTES,
};
