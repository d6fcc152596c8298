//! # Concerto - User-space Audio Server
//!
//! Concerto multiplexes many client playback and capture streams onto a
//! smaller set of physical audio endpoints. Clients connect over a local
//! socket, negotiate a shared-memory stream, and a real-time engine thread
//! pulls from or pushes to those rings on device cadences while converting
//! rates, channel layouts and sample formats and mixing everything
//! together.
//!
//! ## Architecture
//!
//! This is an umbrella crate over:
//! - **concerto-core** - the audio engine: iodev backends (ALSA, empty,
//!   loopback, Bluetooth, test), the deadline-scheduled engine thread,
//!   per-attachment format conversion, routing and volume curves
//! - **concerto-proto** - the client-visible surface: wire protocol,
//!   identifiers, sample formats and the shared-memory ring
//!
//! The control plane lives here: the listening sockets, per-client
//! sessions, message dispatch and the event fan-out back to clients.
//!
//! ## Quick start
//!
//! ```ignore
//! use concerto::ServerBuilder;
//!
//! let mut server = ServerBuilder::default()
//!     .socket_path("/run/concerto/concerto.sock")
//!     .config_dir("/etc/concerto")
//!     .build()?;
//! server.run()?;
//! ```

/// Re-export of concerto-core for direct access.
pub use concerto_core as core;

/// Re-export of concerto-proto for client tooling.
pub use concerto_proto as proto;

// Engine surface
pub use concerto_core::{
    Backend, BtTransportEvent, CardConfig, DevState, DeviceBlocklist, DeviceList, EngineConfig,
    EngineDump, EngineHandle, Iodev, LoopbackType, Node, NodeType, ObserverEvent,
    ObserverRegistry, Stream, StreamParams, VolumeCurve,
};

#[cfg(feature = "alsa")]
pub use concerto_core::AlsaBackend;

// Protocol surface
pub use concerto_proto::{
    AudioFormat, ClientMessage, ClientType, Direction, NodeId, SampleFormat, ServerMessage,
    StreamId, StreamType, NO_DEVICE,
};

mod builder;
mod client;
mod error;
mod server;

pub use builder::ServerBuilder;
pub use error::{Error, Result};
pub use server::Server;
