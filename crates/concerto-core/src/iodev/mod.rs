//! Device abstraction.
//!
//! An [`Iodev`] pairs the common device bookkeeping (identity, direction,
//! bound format, buffer geometry, state machine) with a [`Backend`] variant
//! that exclusively owns the underlying handle. The engine thread owns every
//! `Iodev` that has been added to it; the control plane keeps only the
//! [`DevShared`] block and talks to the device through engine commands.

mod bluetooth;
mod empty;
mod loopback;
mod test;

#[cfg(feature = "alsa")]
mod alsa_dev;

#[cfg(feature = "alsa")]
pub use alsa_dev::AlsaBackend;
pub use bluetooth::{
    clamp_write_mtu, A2dpBackend, BtTransportEvent, BtTransportSource, HfpBackend, HfpCodec,
    A2DP_FIX_PACKET_SIZE, MAX_WRITE_MTU,
};
pub use empty::EmptyBackend;
pub use loopback::{LoopbackBackend, LoopbackType};
pub use test::TestBackend;

use std::sync::Arc;

use concerto_proto::{AudioFormat, ChannelLayout, Direction, SampleFormat};

use crate::error::{Error, Result};
use crate::node::stable_id;
use crate::sync::{AtomicFlag, AtomicScaler};

/// Default buffer geometry cap, frames.
pub const DEFAULT_BUFFER_FRAMES: u32 = 8192;

/// Control-plane view of a device: identity plus the per-cycle knobs the
/// engine reads without locking.
#[derive(Debug)]
pub struct DevShared {
    pub index: u32,
    pub name: String,
    pub stable_id: u32,
    pub direction: Direction,
    softvol: AtomicScaler,
    mute: AtomicFlag,
    swap_lr: AtomicFlag,
    software_volume: AtomicFlag,
}

impl DevShared {
    pub fn new(index: u32, name: impl Into<String>, direction: Direction) -> Arc<DevShared> {
        let name = name.into();
        Arc::new(DevShared {
            index,
            stable_id: stable_id(&name),
            name,
            direction,
            softvol: AtomicScaler::new(1.0),
            mute: AtomicFlag::new(false),
            swap_lr: AtomicFlag::new(false),
            software_volume: AtomicFlag::new(false),
        })
    }

    /// Software volume scaler the engine applies after mixing, 1.0 when
    /// software volume is off.
    pub fn softvol_scaler(&self) -> f32 {
        if self.software_volume.get() {
            self.softvol.get()
        } else {
            1.0
        }
    }

    pub fn set_softvol(&self, enabled: bool, scaler: f32) {
        self.softvol.set(scaler);
        self.software_volume.set(enabled);
    }

    pub fn muted(&self) -> bool {
        self.mute.get()
    }

    pub fn set_mute(&self, muted: bool) {
        self.mute.set(muted);
    }

    pub fn swap_lr(&self) -> bool {
        self.swap_lr.get()
    }

    pub fn set_swap_lr(&self, swapped: bool) {
        self.swap_lr.set(swapped);
    }
}

/// Device lifecycle. `Open` means a format is bound and buffer geometry is
/// fixed; `Running` means the hardware clock is moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevState {
    Closed,
    Open,
    Running,
    Suspended,
    Draining,
}

/// What a backend can do, reported before configuration. Vectors are in
/// priority order; negotiation picks the first entry satisfying the
/// attached streams.
#[derive(Debug, Clone)]
pub struct SupportedFormats {
    pub rates: Vec<u32>,
    pub channel_counts: Vec<usize>,
    pub formats: Vec<SampleFormat>,
    pub max_buffer_frames: u32,
    /// Backend accepts arbitrary channel orderings, not just the default.
    pub variable_layout: bool,
}

/// Channel-map selection: exact layout match, reorder when the backend
/// allows variable positions, pair-swap match, and otherwise the device
/// default with the conversion matrix making up the difference (for capture
/// this is the first matching channel count).
pub fn select_channel_layout(
    wanted: Option<&ChannelLayout>,
    dev_default: &ChannelLayout,
    variable: bool,
) -> ChannelLayout {
    let Some(wanted) = wanted else {
        return *dev_default;
    };
    if wanted == dev_default {
        return *dev_default;
    }
    if variable {
        return *wanted;
    }
    // Pair-swap and every other mismatch land on the default layout; the
    // per-stream matrix performs the remap.
    *dev_default
}

/// Tagged backend set. Each variant owns its handle exclusively.
pub enum Backend {
    #[cfg(feature = "alsa")]
    Alsa(AlsaBackend),
    Empty(EmptyBackend),
    Loopback(LoopbackBackend),
    A2dp(A2dpBackend),
    Hfp(HfpBackend),
    Test(TestBackend),
}

macro_rules! dispatch {
    ($self:expr, $b:ident => $body:expr) => {
        match $self {
            #[cfg(feature = "alsa")]
            Backend::Alsa($b) => $body,
            Backend::Empty($b) => $body,
            Backend::Loopback($b) => $body,
            Backend::A2dp($b) => $body,
            Backend::Hfp($b) => $body,
            Backend::Test($b) => $body,
        }
    };
}

impl Backend {
    fn supported(&self) -> SupportedFormats {
        dispatch!(self, b => b.supported())
    }

    /// Bind a format. Backends may adjust the proposal to what the hardware
    /// actually accepted; the returned tuple is authoritative.
    fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        dispatch!(self, b => b.configure(fmt, buffer_frames))
    }

    fn close(&mut self) {
        dispatch!(self, b => b.close())
    }

    fn frames_queued(&mut self) -> Result<u32> {
        dispatch!(self, b => b.frames_queued())
    }

    fn delay_frames(&mut self) -> Result<u32> {
        dispatch!(self, b => b.delay_frames())
    }

    fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        dispatch!(self, b => b.get_buffer(frames))
    }

    fn put_buffer(&mut self, frames: u32) -> Result<()> {
        dispatch!(self, b => b.put_buffer(frames))
    }

    fn flush_buffer(&mut self) {
        dispatch!(self, b => b.flush_buffer())
    }

    fn start(&mut self) -> Result<()> {
        dispatch!(self, b => b.start())
    }

    fn recover(&mut self) -> Result<()> {
        dispatch!(self, b => b.recover())
    }

    fn no_stream(&mut self, enable: bool) -> Result<()> {
        dispatch!(self, b => b.no_stream(enable))
    }

    fn update_active_node(&mut self, node_index: u32) {
        dispatch!(self, b => b.update_active_node(node_index))
    }
}

/// One device as the engine owns it.
pub struct Iodev {
    shared: Arc<DevShared>,
    format: Option<AudioFormat>,
    buffer_size: u32,
    state: DevState,
    backend: Backend,
}

impl Iodev {
    pub fn new(index: u32, name: impl Into<String>, direction: Direction, backend: Backend) -> Iodev {
        Iodev {
            shared: DevShared::new(index, name, direction),
            format: None,
            buffer_size: 0,
            state: DevState::Closed,
            backend,
        }
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.shared.index
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    #[inline]
    pub fn shared(&self) -> &Arc<DevShared> {
        &self.shared
    }

    #[inline]
    pub fn state(&self) -> DevState {
        self.state
    }

    /// The bound format. Only present while open.
    #[inline]
    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    /// Buffer geometry in frames; fixed while open.
    #[inline]
    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Negotiate a format against `hint` (usually the union representative
    /// of the attached streams) and bind it. No-op when already open.
    pub fn open(&mut self, hint: Option<&AudioFormat>) -> Result<()> {
        if self.state != DevState::Closed {
            return Ok(());
        }
        let caps = self.backend.supported();
        if caps.rates.is_empty() || caps.channel_counts.is_empty() || caps.formats.is_empty() {
            return Err(Error::FormatNegotiation(self.shared.name.clone()));
        }

        let pick_rate = hint
            .map(|h| h.frame_rate)
            .filter(|r| caps.rates.contains(r))
            .unwrap_or(caps.rates[0]);
        let pick_channels = hint
            .map(|h| h.num_channels)
            .filter(|c| caps.channel_counts.contains(c))
            .unwrap_or(caps.channel_counts[0]);
        let pick_format = hint
            .map(|h| h.sample_format)
            .filter(|f| caps.formats.contains(f))
            .unwrap_or(caps.formats[0]);

        let mut fmt = AudioFormat::new(pick_rate, pick_channels, pick_format);
        let wanted = hint
            .filter(|h| h.num_channels == pick_channels)
            .map(|h| &h.channel_layout);
        fmt.channel_layout =
            select_channel_layout(wanted, &fmt.channel_layout, caps.variable_layout);

        let buffer_frames = caps.max_buffer_frames.min(DEFAULT_BUFFER_FRAMES) & !1;
        if buffer_frames == 0 {
            return Err(Error::FormatNegotiation(self.shared.name.clone()));
        }

        let (bound, bound_frames) = self.backend.configure(&fmt, buffer_frames)?;
        self.format = Some(bound);
        self.buffer_size = bound_frames & !1;
        self.state = DevState::Open;
        Ok(())
    }

    pub fn close(&mut self) {
        if self.state == DevState::Closed {
            return;
        }
        self.backend.close();
        self.format = None;
        self.buffer_size = 0;
        self.state = DevState::Closed;
    }

    fn check_open(&self) -> Result<()> {
        match self.state {
            DevState::Closed => Err(Error::NotOpen),
            _ => Ok(()),
        }
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        self.check_open()?;
        self.backend.frames_queued()
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        self.check_open()?;
        self.backend.delay_frames()
    }

    /// Obtain a transfer window of at most `frames` frames. For output the
    /// slice is to be filled; for input it holds captured samples. The
    /// returned count is the usable whole frames in the slice.
    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        self.check_open()?;
        self.backend.get_buffer(frames)
    }

    /// Commit `frames` of the current window.
    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        self.check_open()?;
        self.backend.put_buffer(frames)
    }

    pub fn flush_buffer(&mut self) {
        if self.state != DevState::Closed {
            self.backend.flush_buffer();
        }
    }

    /// Start the hardware clock once enough data is primed.
    pub fn start(&mut self) -> Result<()> {
        self.check_open()?;
        if self.state == DevState::Running {
            return Ok(());
        }
        self.backend.start()?;
        self.state = DevState::Running;
        Ok(())
    }

    /// Run the backend recovery path after a recoverable error; the device
    /// needs re-priming afterwards.
    pub fn recover(&mut self) -> Result<()> {
        self.check_open()?;
        self.backend.recover()?;
        self.state = DevState::Open;
        Ok(())
    }

    pub fn suspend(&mut self) {
        if self.state == DevState::Running {
            self.backend.flush_buffer();
            self.state = DevState::Suspended;
        }
    }

    /// Leave suspension, falling back to a full re-prepare when a plain
    /// start fails.
    pub fn resume(&mut self) -> Result<()> {
        if self.state != DevState::Suspended {
            return Ok(());
        }
        self.state = DevState::Open;
        if self.backend.start().is_err() {
            self.backend.recover()?;
            self.backend.start()?;
        }
        self.state = DevState::Running;
        Ok(())
    }

    /// Tell the backend whether it is running without any attached streams.
    pub fn no_stream(&mut self, enable: bool) -> Result<()> {
        self.check_open()?;
        self.backend.no_stream(enable)
    }

    /// The control plane switched the device's active node.
    pub fn update_active_node(&mut self, node_index: u32) {
        self.backend.update_active_node(node_index);
    }

    /// Reset the bound layout to the default for its channel count. Used by
    /// backends that force a channel count without a matching map.
    pub fn update_channel_layout(&mut self) {
        if let Some(fmt) = self.format.as_mut() {
            fmt.set_default_channel_layout();
        }
    }

    pub fn as_loopback_mut(&mut self) -> Option<&mut LoopbackBackend> {
        match &mut self.backend {
            Backend::Loopback(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_test_mut(&mut self) -> Option<&mut TestBackend> {
        match &mut self.backend {
            Backend::Test(b) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concerto_proto::default_channel_layout;

    #[test]
    fn test_select_layout_exact_match() {
        let def = default_channel_layout(2);
        assert_eq!(select_channel_layout(Some(&def), &def, false), def);
    }

    #[test]
    fn test_select_layout_reorder_needs_variable() {
        let def = default_channel_layout(2);
        let mut swapped = def;
        swapped.swap(0, 1);
        assert_eq!(select_channel_layout(Some(&swapped), &def, true), swapped);
        assert_eq!(select_channel_layout(Some(&swapped), &def, false), def);
    }

    #[test]
    fn test_open_binds_exactly_one_format() {
        let backend = Backend::Test(TestBackend::new_output());
        let mut dev = Iodev::new(1, "test-out", Direction::Output, backend);
        assert!(dev.format().is_none());
        dev.open(None).unwrap();
        assert!(dev.format().is_some());
        assert_eq!(dev.state(), DevState::Open);
        let bound = *dev.format().unwrap();
        // A second open while bound changes nothing.
        let richer = AudioFormat::new(96000, 6, SampleFormat::S32LE);
        dev.open(Some(&richer)).unwrap();
        assert_eq!(dev.format(), Some(&bound));
    }

    #[test]
    fn test_closed_device_rejects_transfers() {
        let backend = Backend::Test(TestBackend::new_output());
        let mut dev = Iodev::new(1, "test-out", Direction::Output, backend);
        assert!(matches!(dev.frames_queued(), Err(Error::NotOpen)));
        assert!(matches!(dev.get_buffer(16), Err(Error::NotOpen)));
    }

    #[test]
    fn test_buffer_size_forced_even() {
        let mut backend = TestBackend::new_output();
        backend.set_max_buffer_frames(4097);
        let mut dev = Iodev::new(1, "odd", Direction::Output, Backend::Test(backend));
        dev.open(None).unwrap();
        assert_eq!(dev.buffer_size() % 2, 0);
        assert_eq!(dev.buffer_size(), 4096);
    }

    #[test]
    fn test_suspend_resume_cycle() {
        let backend = Backend::Test(TestBackend::new_output());
        let mut dev = Iodev::new(1, "test-out", Direction::Output, backend);
        dev.open(None).unwrap();
        dev.start().unwrap();
        assert_eq!(dev.state(), DevState::Running);
        dev.suspend();
        assert_eq!(dev.state(), DevState::Suspended);
        dev.resume().unwrap();
        assert_eq!(dev.state(), DevState::Running);
    }
}
