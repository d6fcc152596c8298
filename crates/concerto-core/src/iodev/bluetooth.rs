//! Bluetooth PCM devices.
//!
//! Transport negotiation lives outside the engine: a manager task speaks to
//! the platform Bluetooth daemon and reports [`BtTransportEvent`]s. The
//! backends here only move PCM over the transport fd they were handed.
//! A2DP frames drain on the far side's clock, so the queue level is
//! estimated from wall time like the other clocked virtual devices.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::OwnedFd;
use std::time::Instant;

use concerto_proto::{AudioFormat, SampleFormat};

use crate::error::{Error, Result};

use super::SupportedFormats;

/// Fixed A2DP payload size the encoder fills per packet.
pub const A2DP_FIX_PACKET_SIZE: usize = 800;

/// Threshold above which a negotiated write MTU is considered bogus.
/// We have seen transports report an MTU of 65535, which is trivially
/// unreasonable against the common values around 1000.
pub const MAX_WRITE_MTU: usize = 4 * A2DP_FIX_PACKET_SIZE;

/// Events the engine's owner consumes from the Bluetooth manager.
#[derive(Debug)]
pub enum BtTransportEvent {
    TransportAcquired {
        fd: OwnedFd,
        read_mtu: u16,
        write_mtu: u16,
    },
    TransportReleased,
    VolumeChanged {
        volume: u8,
    },
    DeviceAdded {
        addr: String,
        name: String,
    },
    DeviceRemoved {
        addr: String,
    },
}

/// Where transport events come from. The manager speaking to the platform
/// Bluetooth daemon implements this; the server polls it and turns
/// acquisitions into A2DP/HFP devices.
pub trait BtTransportSource: Send {
    fn poll_event(&mut self) -> Option<BtTransportEvent>;
}

/// Clamp an acquired write MTU to something the packet scheduler can use.
pub fn clamp_write_mtu(write_mtu: u16) -> usize {
    let mtu = write_mtu as usize;
    if mtu > MAX_WRITE_MTU {
        A2DP_FIX_PACKET_SIZE
    } else {
        mtu
    }
}

/// Codec negotiated on the HFP service-level connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfpCodec {
    Cvsd,
    Msbc,
}

impl HfpCodec {
    /// PCM rate carried over the SCO link for this codec.
    pub fn frame_rate(self) -> u32 {
        match self {
            HfpCodec::Cvsd => 8000,
            HfpCodec::Msbc => 16000,
        }
    }
}

fn frames_since(start: Instant, rate: u32) -> u64 {
    start.elapsed().as_nanos() as u64 * rate as u64 / 1_000_000_000
}

fn write_nonblocking(file: &File, bytes: &[u8]) -> Result<usize> {
    match (&*file).write(bytes) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(0),
        Err(err) => Err(Error::Io(err)),
    }
}

/// A2DP playback over an acquired transport fd.
pub struct A2dpBackend {
    transport: File,
    write_mtu: usize,
    fmt: Option<AudioFormat>,
    buffer_frames: u32,
    staging: Vec<u8>,
    window: u32,
    /// Bytes accepted from a window but not yet written to the socket.
    pending: Vec<u8>,
    start: Option<Instant>,
    consumed: u64,
}

impl A2dpBackend {
    pub fn new(fd: OwnedFd, _read_mtu: u16, write_mtu: u16) -> A2dpBackend {
        A2dpBackend {
            transport: File::from(fd),
            write_mtu: clamp_write_mtu(write_mtu),
            fmt: None,
            buffer_frames: 0,
            staging: Vec::new(),
            window: 0,
            pending: Vec::new(),
            start: None,
            consumed: 0,
        }
    }

    pub fn write_mtu(&self) -> usize {
        self.write_mtu
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![48000, 44100],
            channel_counts: vec![2],
            formats: vec![SampleFormat::S16LE],
            max_buffer_frames: 8192,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        self.fmt = Some(*fmt);
        self.buffer_frames = buffer_frames;
        self.staging = vec![0; buffer_frames as usize * fmt.frame_bytes()];
        self.pending = Vec::with_capacity(self.write_mtu * 2);
        self.window = 0;
        self.start = None;
        self.consumed = 0;
        Ok((*fmt, buffer_frames))
    }

    pub fn close(&mut self) {
        self.fmt = None;
        self.staging = Vec::new();
        self.pending = Vec::new();
        self.start = None;
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        let queued = match self.start {
            Some(start) => {
                let rate = self.fmt.as_ref().map(|f| f.frame_rate).unwrap_or(48000);
                self.consumed.saturating_sub(frames_since(start, rate))
            }
            None => self.consumed,
        };
        Ok(queued.min(self.buffer_frames as u64) as u32)
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        self.frames_queued()
    }

    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        let free = self.buffer_frames - self.frames_queued()?;
        let n = frames.min(free);
        let bytes = n as usize * fb;
        self.staging[..bytes].fill(0);
        self.window = n;
        Ok((&mut self.staging[..bytes], n))
    }

    /// Push the committed window out in MTU-sized packets. A full socket
    /// keeps the remainder pending for the next cycle; real errors surface.
    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        let frames = frames.min(self.window);
        self.window = 0;
        let fb = self.fmt.as_ref().map(|f| f.frame_bytes()).unwrap_or(4);
        let bytes = frames as usize * fb;

        // Drain what the last cycle could not send before new samples.
        while !self.pending.is_empty() {
            let take = self.pending.len().min(self.write_mtu);
            let sent = write_nonblocking(&self.transport, &self.pending[..take])?;
            if sent == 0 {
                break;
            }
            self.pending.drain(..sent);
        }

        let mut offset = 0;
        if self.pending.is_empty() {
            while offset < bytes {
                let take = (bytes - offset).min(self.write_mtu);
                let sent = write_nonblocking(&self.transport, &self.staging[offset..offset + take])?;
                if sent == 0 {
                    break;
                }
                offset += sent;
            }
        }
        if offset < bytes {
            self.pending.extend_from_slice(&self.staging[offset..bytes]);
        }

        self.consumed += frames as u64;
        Ok(())
    }

    pub fn flush_buffer(&mut self) {
        self.pending.clear();
        if let Some(start) = self.start {
            let rate = self.fmt.as_ref().map(|f| f.frame_rate).unwrap_or(48000);
            self.consumed = frames_since(start, rate);
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        Ok(())
    }

    pub fn recover(&mut self) -> Result<()> {
        self.flush_buffer();
        Ok(())
    }

    pub fn no_stream(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    pub fn update_active_node(&mut self, _node_index: u32) {}
}

/// HFP PCM over the SCO socket, one backend per direction.
pub struct HfpBackend {
    transport: File,
    codec: HfpCodec,
    is_output: bool,
    fmt: Option<AudioFormat>,
    buffer_frames: u32,
    staging: Vec<u8>,
    window: u32,
    /// Capture bytes read off the socket but not yet claimed.
    captured: Vec<u8>,
    start: Option<Instant>,
    consumed: u64,
}

impl HfpBackend {
    pub fn new_output(fd: OwnedFd, codec: HfpCodec) -> HfpBackend {
        Self::new(fd, codec, true)
    }

    pub fn new_input(fd: OwnedFd, codec: HfpCodec) -> HfpBackend {
        Self::new(fd, codec, false)
    }

    fn new(fd: OwnedFd, codec: HfpCodec, is_output: bool) -> HfpBackend {
        HfpBackend {
            transport: File::from(fd),
            codec,
            is_output,
            fmt: None,
            buffer_frames: 0,
            staging: Vec::new(),
            window: 0,
            captured: Vec::new(),
            start: None,
            consumed: 0,
        }
    }

    pub fn codec(&self) -> HfpCodec {
        self.codec
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![self.codec.frame_rate()],
            channel_counts: vec![1],
            formats: vec![SampleFormat::S16LE],
            max_buffer_frames: 4096,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        self.fmt = Some(*fmt);
        self.buffer_frames = buffer_frames;
        let cap = buffer_frames as usize * fmt.frame_bytes();
        self.staging = vec![0; cap];
        self.captured = Vec::with_capacity(cap);
        self.window = 0;
        self.start = None;
        self.consumed = 0;
        Ok((*fmt, buffer_frames))
    }

    pub fn close(&mut self) {
        self.fmt = None;
        self.staging = Vec::new();
        self.captured = Vec::new();
        self.start = None;
    }

    fn drain_socket(&mut self) -> Result<()> {
        let cap = self.staging.len();
        let mut chunk = [0u8; 256];
        loop {
            match (&self.transport).read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    self.captured.extend_from_slice(&chunk[..n]);
                    // A reader that fell behind keeps only the newest window.
                    if self.captured.len() > cap {
                        let excess = self.captured.len() - cap;
                        self.captured.drain(..excess);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        let fb = self.fmt.as_ref().map(|f| f.frame_bytes()).unwrap_or(2);
        if self.is_output {
            let queued = match self.start {
                Some(start) => {
                    let rate = self.codec.frame_rate();
                    self.consumed.saturating_sub(frames_since(start, rate))
                }
                None => self.consumed,
            };
            Ok(queued.min(self.buffer_frames as u64) as u32)
        } else {
            self.drain_socket()?;
            Ok((self.captured.len() / fb) as u32)
        }
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        self.frames_queued()
    }

    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        if self.is_output {
            let free = self.buffer_frames - self.frames_queued()?;
            let n = frames.min(free);
            let bytes = n as usize * fb;
            self.staging[..bytes].fill(0);
            self.window = n;
            Ok((&mut self.staging[..bytes], n))
        } else {
            self.drain_socket()?;
            let n = frames.min((self.captured.len() / fb) as u32);
            let bytes = n as usize * fb;
            self.staging[..bytes].copy_from_slice(&self.captured[..bytes]);
            self.captured.drain(..bytes);
            self.window = n;
            Ok((&mut self.staging[..bytes], n))
        }
    }

    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        let frames = frames.min(self.window);
        self.window = 0;
        if self.is_output {
            let fb = self.fmt.as_ref().map(|f| f.frame_bytes()).unwrap_or(2);
            let bytes = frames as usize * fb;
            let mut offset = 0;
            while offset < bytes {
                let sent = write_nonblocking(&self.transport, &self.staging[offset..bytes])?;
                if sent == 0 {
                    break;
                }
                offset += sent;
            }
            self.consumed += frames as u64;
        }
        Ok(())
    }

    pub fn flush_buffer(&mut self) {
        self.captured.clear();
        if let Some(start) = self.start {
            self.consumed = frames_since(start, self.codec.frame_rate());
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.start.is_none() {
            self.start = Some(Instant::now());
        }
        Ok(())
    }

    pub fn recover(&mut self) -> Result<()> {
        self.flush_buffer();
        Ok(())
    }

    pub fn no_stream(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    pub fn update_active_node(&mut self, _node_index: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    fn socket_fd() -> (OwnedFd, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        (OwnedFd::from(a), b)
    }

    #[test]
    fn test_mtu_clamp() {
        assert_eq!(clamp_write_mtu(1000), 1000);
        assert_eq!(clamp_write_mtu(MAX_WRITE_MTU as u16), MAX_WRITE_MTU);
        assert_eq!(clamp_write_mtu(MAX_WRITE_MTU as u16 + 1), A2DP_FIX_PACKET_SIZE);
        assert_eq!(clamp_write_mtu(u16::MAX), A2DP_FIX_PACKET_SIZE);
    }

    #[test]
    fn test_a2dp_writes_committed_frames() {
        let (fd, far) = socket_fd();
        let mut dev = A2dpBackend::new(fd, 1000, 1000);
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 1024).unwrap();

        let (window, n) = dev.get_buffer(4).unwrap();
        assert_eq!(n, 4);
        window.copy_from_slice(&[7u8; 16]);
        dev.put_buffer(4).unwrap();

        let mut out = [0u8; 32];
        let got = (&far).read(&mut out).unwrap();
        assert_eq!(got, 16);
        assert!(out[..16].iter().all(|&b| b == 7));
    }

    #[test]
    fn test_hfp_capture_reads_socket() {
        let (fd, far) = socket_fd();
        let mut dev = HfpBackend::new_input(fd, HfpCodec::Msbc);
        let fmt = AudioFormat::new(16000, 1, SampleFormat::S16LE);
        dev.configure(&fmt, 1024).unwrap();

        (&far).write_all(&[1, 0, 2, 0, 3, 0]).unwrap();
        assert_eq!(dev.frames_queued().unwrap(), 3);
        let (window, n) = dev.get_buffer(3).unwrap();
        assert_eq!(n, 3);
        assert_eq!(window, &[1, 0, 2, 0, 3, 0]);
        dev.put_buffer(3).unwrap();
        assert_eq!(dev.frames_queued().unwrap(), 0);
    }

    #[test]
    fn test_hfp_codec_rates() {
        assert_eq!(HfpCodec::Cvsd.frame_rate(), 8000);
        assert_eq!(HfpCodec::Msbc.frame_rate(), 16000);
    }
}
