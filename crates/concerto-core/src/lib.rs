//! Audio engine for the concerto server.
//!
//! # Primary API
//!
//! - [`EngineHandle`]: spawn and command the real-time audio thread
//! - [`DeviceList`]: device registry, routing and the empty-device fallback
//! - [`Iodev`] / [`Backend`]: the device abstraction and its backends
//! - [`Stream`] / [`DevStream`]: client streams and their per-device
//!   conversion adapters
//! - [`ObserverRegistry`]: state-change fan-out
//! - [`config`]: blocklist and per-card volume-curve files
//!
//! The engine thread owns every open device and services them on a
//! deadline schedule; the control plane talks to it exclusively through
//! [`EngineHandle`] commands. See the module docs for the per-cycle rules.

// Error types
pub mod error;
pub use error::{Error, Result};

// Device abstraction and backends
pub mod iodev;
pub use iodev::{
    A2dpBackend, Backend, BtTransportEvent, BtTransportSource, DevShared, DevState, EmptyBackend,
    HfpBackend, HfpCodec, Iodev, LoopbackBackend, LoopbackType, SupportedFormats, TestBackend,
    A2DP_FIX_PACKET_SIZE,
};

#[cfg(feature = "alsa")]
pub use iodev::AlsaBackend;

// Engine thread
pub mod engine;
pub use engine::{DevDump, EngineCommand, EngineConfig, EngineDump, EngineHandle, StreamDump};

// Device list and routing
pub mod devlist;
pub use devlist::DeviceList;

// Streams
pub mod devstream;
pub mod stream;
pub use devstream::DevStream;
pub use stream::{Stream, StreamParams};

// Mixing and conversion
pub mod convert;
pub mod mix;
pub mod resample;
pub use convert::FormatConverter;
pub use resample::LinearResampler;

// Nodes and volume curves
pub mod node;
pub mod volume;
pub use node::{Node, NodeType};
pub use volume::{db_100_to_scaler, VolumeCurve, VOLUME_STEPS};

// Observer registry
pub mod observer;
pub use observer::{ObserverEvent, ObserverRegistry};

// Config files
pub mod config;
pub use config::{CardConfig, DeviceBlocklist};

// Lock-free primitives
pub(crate) mod sync;
pub use sync::{AtomicFlag, AtomicScaler};
