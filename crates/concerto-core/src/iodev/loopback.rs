//! Loopback tap devices.
//!
//! A loopback iodev is a virtual input whose samples are copies of an output
//! device's mix, delivered by the engine after the mix (and, for the
//! post-DSP variants, after the processing stage). The byte buffer holds
//! four loopback periods; the tap side is best-effort and drops whatever
//! does not fit.

use std::time::Instant;

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use concerto_proto::{AudioFormat, SampleFormat};

use crate::error::{Error, Result};
use crate::node::NodeType;

use super::SupportedFormats;

/// Ring geometry in frames; one loopback period is a quarter of this.
pub const LOOPBACK_BUFFER_FRAMES: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopbackType {
    /// Copy of the raw mix, before any processing.
    PostMixPreDsp,
    /// Copy of the processed mix.
    PostDsp,
    /// Processed mix behind a hardware-like initial delay.
    PostDspDelayed,
}

impl LoopbackType {
    pub fn node_type(self) -> NodeType {
        match self {
            LoopbackType::PostMixPreDsp => NodeType::PostMixPreDsp,
            LoopbackType::PostDsp => NodeType::PostDsp,
            LoopbackType::PostDspDelayed => NodeType::PostDspDelayed,
        }
    }

    pub fn node_name(self) -> &'static str {
        match self {
            LoopbackType::PostMixPreDsp => "Post Mix Pre DSP Loopback",
            LoopbackType::PostDsp => "Post DSP Loopback",
            LoopbackType::PostDspDelayed => "Post DSP Delayed Loopback",
        }
    }
}

fn frames_since(start: Instant, rate: u32) -> u64 {
    start.elapsed().as_nanos() as u64 * rate as u64 / 1_000_000_000
}

pub struct LoopbackBackend {
    loopback_type: LoopbackType,
    fmt: Option<AudioFormat>,
    buf: Option<HeapRb<u8>>,
    staging: Vec<u8>,
    window: u32,
    /// Frames read since the device was configured.
    read_frames: u64,
    /// True while the tapped output device is running.
    started: bool,
    dev_start: Option<Instant>,
    /// True while no stream is attached; gates `frames_queued` so the
    /// delayed variant's pre-fill survives until a reader arrives.
    no_streams: bool,
}

impl LoopbackBackend {
    pub fn new(loopback_type: LoopbackType) -> LoopbackBackend {
        LoopbackBackend {
            loopback_type,
            fmt: None,
            buf: None,
            staging: Vec::new(),
            window: 0,
            read_frames: 0,
            started: false,
            dev_start: None,
            no_streams: true,
        }
    }

    pub fn loopback_type(&self) -> LoopbackType {
        self.loopback_type
    }

    /// Sender started or stopped producing; called via the sample hook.
    pub fn set_started(&mut self, started: bool) {
        self.started = started;
    }

    /// Tap feed: copy as much of `bytes` as fits, dropping the rest.
    /// Returns the frames actually copied.
    pub fn push_samples(&mut self, bytes: &[u8]) -> u32 {
        let Some(fmt) = self.fmt.as_ref() else { return 0 };
        let fb = fmt.frame_bytes();
        let Some(buf) = self.buf.as_mut() else { return 0 };
        let writable_frames = buf.vacant_len() / fb;
        let take = (bytes.len() / fb).min(writable_frames) * fb;
        let pushed = buf.push_slice(&bytes[..take]);
        (pushed / fb) as u32
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![48000],
            channel_counts: vec![2],
            formats: vec![SampleFormat::S16LE],
            max_buffer_frames: LOOPBACK_BUFFER_FRAMES,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        // Loopback is forced stereo; the layout follows the channel count,
        // not the tapped device.
        let mut fmt = *fmt;
        fmt.set_default_channel_layout();
        let fb = fmt.frame_bytes();
        let mut buf = HeapRb::<u8>::new(LOOPBACK_BUFFER_FRAMES as usize * fb);

        // Pre-fill with silence so readers see the same initial latency a
        // real capture path would have.
        if self.loopback_type == LoopbackType::PostDspDelayed {
            let vacant = buf.vacant_len();
            buf.push_iter(std::iter::repeat(0u8).take(vacant));
        }

        self.staging = vec![0; buffer_frames as usize * fb];
        self.buf = Some(buf);
        self.fmt = Some(fmt);
        self.window = 0;
        self.read_frames = 0;
        self.started = false;
        self.dev_start = Some(Instant::now());
        Ok((fmt, buffer_frames))
    }

    pub fn close(&mut self) {
        self.fmt = None;
        self.buf = None;
        self.staging = Vec::new();
        self.started = false;
        self.no_streams = true;
    }

    fn queued_frames(&self) -> u32 {
        match (self.buf.as_ref(), self.fmt.as_ref()) {
            (Some(buf), Some(fmt)) => (buf.occupied_len() / fmt.frame_bytes()) as u32,
            _ => 0,
        }
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        // Nothing to report until a stream connects; consuming the buffer
        // in that window would delete the delayed variant's initial delay.
        if self.no_streams {
            return Ok(0);
        }
        if !self.started {
            // The sender has not produced yet; synthesize silence at the
            // wall-clock rate so a reader can start without stalling.
            let (Some(fmt), Some(start)) = (self.fmt.as_ref(), self.dev_start) else {
                return Ok(0);
            };
            let rate = fmt.frame_rate;
            let fb = fmt.frame_bytes();
            let owed = frames_since(start, rate)
                .saturating_sub(self.read_frames)
                .saturating_sub(self.queued_frames() as u64);
            if let Some(buf) = self.buf.as_mut() {
                let fill = (owed as usize).min(buf.vacant_len() / fb) * fb;
                if fill > 0 {
                    buf.push_iter(std::iter::repeat(0u8).take(fill));
                }
            }
        }
        Ok(self.queued_frames())
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        Ok(self.queued_frames())
    }

    /// The returned window is consumed when `put_buffer` commits it; the
    /// engine always commits the full returned count.
    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        let n = frames.min(self.queued_frames());
        let bytes = n as usize * fb;
        if let Some(buf) = self.buf.as_mut() {
            buf.pop_slice(&mut self.staging[..bytes]);
        }
        self.window = n;
        Ok((&mut self.staging[..bytes], n))
    }

    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        self.read_frames += frames.min(self.window) as u64;
        self.window = 0;
        Ok(())
    }

    /// Deliberately a no-op: flushing would delete the delayed variant's
    /// initial latency.
    pub fn flush_buffer(&mut self) {}

    pub fn start(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn recover(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn no_stream(&mut self, enable: bool) -> Result<()> {
        self.no_streams = enable;
        Ok(())
    }

    pub fn update_active_node(&mut self, _node_index: u32) {}
}
