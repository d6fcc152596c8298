//! Fallback silence device.
//!
//! Empty devices are enabled when a direction has no real endpoint left, so
//! attached streams keep a place to live. They sink or source silence on a
//! wall-clock cadence: the simulated hardware level is derived from the
//! frames moved so far versus the time elapsed since configure.

use std::time::Instant;

use concerto_proto::{AudioFormat, SampleFormat};

use crate::error::{Error, Result};

use super::SupportedFormats;

fn frames_since(start: Instant, rate: u32) -> u64 {
    start.elapsed().as_nanos() as u64 * rate as u64 / 1_000_000_000
}

pub struct EmptyBackend {
    is_output: bool,
    fmt: Option<AudioFormat>,
    buffer_frames: u32,
    start: Option<Instant>,
    /// Frames the engine has moved through us since configure.
    consumed: u64,
    staging: Vec<u8>,
    window: u32,
}

impl EmptyBackend {
    pub fn new_output() -> EmptyBackend {
        Self::new(true)
    }

    pub fn new_input() -> EmptyBackend {
        Self::new(false)
    }

    fn new(is_output: bool) -> EmptyBackend {
        EmptyBackend {
            is_output,
            fmt: None,
            buffer_frames: 0,
            start: None,
            consumed: 0,
            staging: Vec::new(),
            window: 0,
        }
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![48000, 44100, 16000, 8000],
            channel_counts: vec![2, 1],
            formats: vec![SampleFormat::S16LE],
            max_buffer_frames: 8192,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        self.fmt = Some(*fmt);
        self.buffer_frames = buffer_frames;
        self.staging = vec![0; buffer_frames as usize * fmt.frame_bytes()];
        self.start = Some(Instant::now());
        self.consumed = 0;
        Ok((*fmt, buffer_frames))
    }

    pub fn close(&mut self) {
        self.fmt = None;
        self.start = None;
        self.staging = Vec::new();
    }

    fn elapsed_frames(&self) -> u64 {
        match (self.start, self.fmt.as_ref()) {
            (Some(start), Some(fmt)) => frames_since(start, fmt.frame_rate),
            _ => 0,
        }
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        let elapsed = self.elapsed_frames();
        let queued = if self.is_output {
            // Output frames drain with time.
            self.consumed.saturating_sub(elapsed)
        } else {
            // Input frames accumulate with time.
            elapsed.saturating_sub(self.consumed)
        };
        Ok(queued.min(self.buffer_frames as u64) as u32)
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        self.frames_queued()
    }

    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        let avail = if self.is_output {
            self.buffer_frames - self.frames_queued()?
        } else {
            self.frames_queued()?
        };
        let n = frames.min(avail).min(self.buffer_frames);
        let window = &mut self.staging[..n as usize * fb];
        // Capture windows are always silence.
        if !self.is_output {
            window.fill(0);
        }
        self.window = n;
        Ok((&mut self.staging[..n as usize * fb], n))
    }

    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        self.consumed += frames.min(self.window) as u64;
        self.window = 0;
        Ok(())
    }

    pub fn flush_buffer(&mut self) {
        // Align the notional level with the clock.
        self.consumed = self.elapsed_frames();
    }

    pub fn start(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn recover(&mut self) -> Result<()> {
        self.consumed = self.elapsed_frames();
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
    fn test_output_level_tracks_commits() {
        let mut dev = EmptyBackend::new_output();
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 4096).unwrap();
        assert_eq!(dev.frames_queued().unwrap(), 0);
        let (_, n) = dev.get_buffer(480).unwrap();
        assert_eq!(n, 480);
        dev.put_buffer(480).unwrap();
        // Level right after the commit is near 480, minus whatever the
        // clock drained in between.
        assert!(dev.frames_queued().unwrap() <= 480);
    }

    #[test]
    fn test_input_produces_silence_over_time() {
        let mut dev = EmptyBackend::new_input();
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        dev.configure(&fmt, 4096).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let queued = dev.frames_queued().unwrap();
        assert!(queued > 0);
        let (window, n) = dev.get_buffer(queued).unwrap();
        assert!(n > 0);
        assert!(window.iter().all(|&b| b == 0));
    }
}
