//! Client streams as the engine sees them.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use concerto_proto::{AudioFormat, AudioShm, ClientType, Direction, StreamId, StreamType};
use nix::sys::eventfd::{EfdFlags, EventFd};

use crate::error::{Error, Result};
use crate::sync::AtomicScaler;

/// Everything a `CONNECT_STREAM` request pins down about a stream.
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub id: StreamId,
    pub direction: Direction,
    pub stream_type: StreamType,
    pub client_type: ClientType,
    pub format: AudioFormat,
    /// Ring capacity in frames; becomes the shm `used_size`.
    pub buffer_frames: u32,
    /// Frames between client wakeups.
    pub cb_threshold: u32,
    pub effects: u32,
    /// Device index the stream is pinned to, if any.
    pub pinned_dev: Option<u32>,
}

/// A connected client stream. The shm ring and the wake eventfd are owned
/// here; dev_streams borrow the stream for as long as they are attached.
pub struct Stream {
    pub id: StreamId,
    pub direction: Direction,
    /// Wire encoding of the current [`StreamType`]; switchable at runtime.
    stream_type: AtomicU8,
    pub client_type: ClientType,
    pub format: AudioFormat,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub effects: u32,
    pub pinned_dev: Option<u32>,
    shm: AudioShm,
    wake: EventFd,
    volume: AtomicScaler,
    underruns: AtomicU64,
    overruns: AtomicU64,
}

impl Stream {
    /// Validate parameters and allocate the shared ring.
    ///
    /// The callback threshold is clamped to half the ring so one transfer
    /// window never exceeds `used_size / 2`.
    pub fn new(params: StreamParams) -> Result<Stream> {
        if params.format.frame_rate == 0 || params.format.num_channels == 0 {
            return Err(Error::InvalidFormat(format!(
                "stream {}: {} Hz, {} channels",
                params.id, params.format.frame_rate, params.format.num_channels
            )));
        }
        if params.buffer_frames == 0 || params.buffer_frames % 2 != 0 {
            return Err(Error::InvalidStream(format!(
                "stream {}: buffer of {} frames must be even and non-zero",
                params.id, params.buffer_frames
            )));
        }
        let cb_threshold = params.cb_threshold.clamp(1, params.buffer_frames / 2);
        let shm = AudioShm::create(params.buffer_frames, params.format.frame_bytes() as u32)?;
        let wake = EventFd::from_value_and_flags(
            0,
            EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK,
        )?;
        Ok(Stream {
            id: params.id,
            direction: params.direction,
            stream_type: AtomicU8::new(params.stream_type.to_wire()),
            client_type: params.client_type,
            format: params.format,
            buffer_frames: params.buffer_frames,
            cb_threshold,
            effects: params.effects,
            pinned_dev: params.pinned_dev,
            shm,
            wake,
            volume: AtomicScaler::new(1.0),
            underruns: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        })
    }

    #[inline]
    pub fn shm(&self) -> &AudioShm {
        &self.shm
    }

    pub fn stream_type(&self) -> StreamType {
        StreamType::from_wire(self.stream_type.load(Ordering::Relaxed))
            .unwrap_or(StreamType::Default)
    }

    pub fn set_stream_type(&self, stream_type: StreamType) {
        self.stream_type.store(stream_type.to_wire(), Ordering::Relaxed);
    }

    #[inline]
    pub fn wake_fd(&self) -> &EventFd {
        &self.wake
    }

    /// Buffered duration in nanoseconds, used for drain deadlines.
    pub fn buffered_nanos(&self) -> u64 {
        self.buffer_frames as u64 * 1_000_000_000 / self.format.frame_rate as u64
    }

    /// Nudge the client: mark the callback pending and poke the eventfd.
    /// Failures are ignored; a stalled client only hurts itself.
    pub fn signal_wake(&self) {
        self.shm.set_callback_pending(true);
        let _ = self.wake.write(1);
    }

    #[inline]
    pub fn volume_scaler(&self) -> f32 {
        self.volume.get()
    }

    pub fn set_volume_scaler(&self, scaler: f32) {
        self.volume.set(scaler.max(0.0));
    }

    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}
