//! Scripted in-memory backend for engine and routing tests.
//!
//! Output commits are recorded verbatim; capture windows replay bytes queued
//! by the test. `frames_queued` returns whatever the test scripted last, and
//! errors can be injected into the next commit to exercise the recovery
//! paths.

use std::collections::VecDeque;
use std::io;

use concerto_proto::{AudioFormat, SampleFormat};

use crate::error::{Error, Result};

use super::SupportedFormats;

pub struct TestBackend {
    is_output: bool,
    fmt: Option<AudioFormat>,
    buffer_frames: u32,
    max_buffer_frames: u32,
    staging: Vec<u8>,
    window: u32,
    queued: u32,
    started: bool,
    recover_count: u32,
    inject_errno: Option<i32>,
    /// Every byte committed through `put_buffer` on an output device.
    committed: Vec<u8>,
    /// Bytes the next capture windows will return.
    capture_data: VecDeque<u8>,
}

impl TestBackend {
    pub fn new_output() -> TestBackend {
        Self::new(true)
    }

    pub fn new_input() -> TestBackend {
        Self::new(false)
    }

    fn new(is_output: bool) -> TestBackend {
        TestBackend {
            is_output,
            fmt: None,
            buffer_frames: 0,
            max_buffer_frames: 4096,
            staging: Vec::new(),
            window: 0,
            queued: 0,
            started: false,
            recover_count: 0,
            inject_errno: None,
            committed: Vec::new(),
            capture_data: VecDeque::new(),
        }
    }

    pub fn set_max_buffer_frames(&mut self, frames: u32) {
        self.max_buffer_frames = frames;
    }

    /// Script the hardware fill level the next `frames_queued` reports.
    pub fn set_frames_queued(&mut self, frames: u32) {
        self.queued = frames;
    }

    /// Queue bytes for capture windows.
    pub fn push_capture_data(&mut self, bytes: &[u8]) {
        self.capture_data.extend(bytes.iter().copied());
    }

    /// Fail the next `put_buffer` with the given errno.
    pub fn inject_errno(&mut self, errno: i32) {
        self.inject_errno = Some(errno);
    }

    pub fn committed(&self) -> &[u8] {
        &self.committed
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn recover_count(&self) -> u32 {
        self.recover_count
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![48000, 44100, 16000],
            channel_counts: vec![2, 1],
            formats: vec![SampleFormat::S16LE, SampleFormat::S32LE],
            max_buffer_frames: self.max_buffer_frames,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        self.fmt = Some(*fmt);
        self.buffer_frames = buffer_frames;
        self.staging = vec![0; buffer_frames as usize * fmt.frame_bytes()];
        self.window = 0;
        self.queued = 0;
        self.started = false;
        Ok((*fmt, buffer_frames))
    }

    pub fn close(&mut self) {
        self.fmt = None;
        self.staging = Vec::new();
        self.started = false;
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        if self.is_output {
            Ok(self.queued)
        } else {
            let fb = self.fmt.as_ref().map(|f| f.frame_bytes()).unwrap_or(1);
            Ok((self.capture_data.len() / fb) as u32)
        }
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        self.frames_queued()
    }

    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        let n = if self.is_output {
            frames.min(self.buffer_frames.saturating_sub(self.queued))
        } else {
            frames.min((self.capture_data.len() / fb) as u32)
        };
        let bytes = n as usize * fb;
        if self.is_output {
            self.staging[..bytes].fill(0);
        } else {
            for slot in self.staging[..bytes].iter_mut() {
                *slot = self.capture_data.pop_front().unwrap_or(0);
            }
        }
        self.window = n;
        Ok((&mut self.staging[..bytes], n))
    }

    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        if let Some(errno) = self.inject_errno.take() {
            return Err(Error::Io(io::Error::from_raw_os_error(errno)));
        }
        let frames = frames.min(self.window);
        if self.is_output {
            if let Some(fmt) = self.fmt.as_ref() {
                let bytes = frames as usize * fmt.frame_bytes();
                self.committed.extend_from_slice(&self.staging[..bytes]);
            }
            self.queued += frames;
        }
        self.window = 0;
        Ok(())
    }

    pub fn flush_buffer(&mut self) {
        self.queued = 0;
    }

    pub fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    pub fn recover(&mut self) -> Result<()> {
        self.recover_count += 1;
        self.queued = 0;
        self.started = false;
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

    #[test]
    fn test_output_records_commits() {
        let mut dev = TestBackend::new_output();
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 1024).unwrap();
        let (window, n) = dev.get_buffer(2).unwrap();
        assert_eq!(n, 2);
        window.copy_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        dev.put_buffer(2).unwrap();
        assert_eq!(dev.committed(), &[1, 0, 2, 0, 3, 0, 4, 0]);
        assert_eq!(dev.frames_queued().unwrap(), 2);
    }

    #[test]
    fn test_capture_replays_pushed_bytes() {
        let mut dev = TestBackend::new_input();
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 1024).unwrap();
        dev.push_capture_data(&[9, 0, 8, 0]);
        assert_eq!(dev.frames_queued().unwrap(), 1);
        let (window, n) = dev.get_buffer(4).unwrap();
        assert_eq!(n, 1);
        assert_eq!(window, &[9, 0, 8, 0]);
        dev.put_buffer(1).unwrap();
        assert_eq!(dev.frames_queued().unwrap(), 0);
    }

    #[test]
    fn test_injected_errno_surfaces_once() {
        let mut dev = TestBackend::new_output();
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 1024).unwrap();
        dev.inject_errno(libc::EPIPE);
        dev.get_buffer(1).unwrap();
        assert!(dev.put_buffer(1).is_err());
        dev.get_buffer(1).unwrap();
        assert!(dev.put_buffer(1).is_ok());
    }
}
