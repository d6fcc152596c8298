//! ALSA PCM backend.
//!
//! The PCM is opened at configure time in RW-interleaved access. Hardware
//! parameters are negotiated with the `*_near` setters and whatever the
//! device actually accepted is reported back as the bound format. The start
//! threshold is pushed out of reach so the engine always starts the clock
//! explicitly once the buffer is primed.

use alsa::pcm::{Access, Format, Frames, HwParams, State, PCM};
use alsa::{Direction as AlsaDirection, ValueOr};

use concerto_proto::{AudioFormat, SampleFormat};

use crate::error::{Error, Result};

use super::SupportedFormats;

fn alsa_format(fmt: SampleFormat) -> Format {
    match fmt {
        SampleFormat::S16LE => Format::S16LE,
        SampleFormat::S24LE => Format::S24LE,
        SampleFormat::S32LE => Format::S32LE,
    }
}

pub struct AlsaBackend {
    device_name: String,
    is_output: bool,
    pcm: Option<PCM>,
    fmt: Option<AudioFormat>,
    buffer_frames: u32,
    staging: Vec<u8>,
    staging_i16: Vec<i16>,
    staging_i32: Vec<i32>,
    window: u32,
}

impl AlsaBackend {
    pub fn new_output(device_name: impl Into<String>) -> AlsaBackend {
        Self::new(device_name, true)
    }

    pub fn new_input(device_name: impl Into<String>) -> AlsaBackend {
        Self::new(device_name, false)
    }

    fn new(device_name: impl Into<String>, is_output: bool) -> AlsaBackend {
        AlsaBackend {
            device_name: device_name.into(),
            is_output,
            pcm: None,
            fmt: None,
            buffer_frames: 0,
            staging: Vec::new(),
            staging_i16: Vec::new(),
            staging_i32: Vec::new(),
            window: 0,
        }
    }

    fn pcm(&self) -> Result<&PCM> {
        self.pcm.as_ref().ok_or(Error::NotOpen)
    }

    pub fn supported(&self) -> SupportedFormats {
        SupportedFormats {
            rates: vec![48000, 44100, 96000, 32000, 16000, 8000],
            channel_counts: vec![2, 1, 4, 6, 8],
            formats: vec![SampleFormat::S16LE, SampleFormat::S32LE, SampleFormat::S24LE],
            max_buffer_frames: 8192,
            variable_layout: false,
        }
    }

    pub fn configure(&mut self, fmt: &AudioFormat, buffer_frames: u32) -> Result<(AudioFormat, u32)> {
        let direction = if self.is_output {
            AlsaDirection::Playback
        } else {
            AlsaDirection::Capture
        };
        let pcm = PCM::new(&self.device_name, direction, false)?;

        let mut sample_format = fmt.sample_format;
        {
            let hwp = HwParams::any(&pcm)?;
            hwp.set_access(Access::RWInterleaved)?;
            if hwp.set_format(alsa_format(sample_format)).is_err() {
                // Everything speaks S16.
                sample_format = SampleFormat::S16LE;
                hwp.set_format(Format::S16LE)?;
            }
            hwp.set_channels(fmt.num_channels as u32)?;
            hwp.set_rate_near(fmt.frame_rate, ValueOr::Nearest)?;
            hwp.set_buffer_size_near(buffer_frames as Frames)?;
            hwp.set_period_size_near(buffer_frames as Frames / 4, ValueOr::Nearest)?;
            pcm.hw_params(&hwp)?;
        }

        let (rate, channels, actual_buffer) = {
            let hwp = pcm.hw_params_current()?;
            (
                hwp.get_rate()?,
                hwp.get_channels()? as usize,
                hwp.get_buffer_size()? as u32,
            )
        };

        {
            let swp = pcm.sw_params_current()?;
            // Out of reach; the engine calls start once primed.
            swp.set_start_threshold(actual_buffer as Frames * 2)?;
            pcm.sw_params(&swp)?;
        }

        let bound = AudioFormat::new(rate, channels, sample_format);
        let fb = bound.frame_bytes();
        let buffer = actual_buffer & !1;

        self.staging = vec![0; buffer as usize * fb];
        self.staging_i16 = vec![0; buffer as usize * channels];
        self.staging_i32 = vec![0; buffer as usize * channels];
        self.pcm = Some(pcm);
        self.fmt = Some(bound);
        self.buffer_frames = buffer;
        self.window = 0;
        Ok((bound, buffer))
    }

    pub fn close(&mut self) {
        if let Some(pcm) = self.pcm.take() {
            let _ = pcm.drop();
        }
        self.fmt = None;
        self.staging = Vec::new();
        self.staging_i16 = Vec::new();
        self.staging_i32 = Vec::new();
    }

    pub fn frames_queued(&mut self) -> Result<u32> {
        let buffer = self.buffer_frames;
        let pcm = self.pcm()?;
        let avail = pcm.avail_update()?.clamp(0, buffer as Frames) as u32;
        if self.is_output {
            Ok(buffer - avail)
        } else {
            Ok(avail)
        }
    }

    pub fn delay_frames(&mut self) -> Result<u32> {
        let pcm = self.pcm()?;
        Ok(pcm.delay()?.max(0) as u32)
    }

    pub fn get_buffer(&mut self, frames: u32) -> Result<(&mut [u8], u32)> {
        let fmt = *self.fmt.as_ref().ok_or(Error::NotOpen)?;
        let fb = fmt.frame_bytes();
        let n = if self.is_output {
            let free = self.buffer_frames - self.frames_queued()?;
            let n = frames.min(free);
            self.staging[..n as usize * fb].fill(0);
            n
        } else {
            let n = frames.min(self.frames_queued()?);
            if n > 0 {
                self.read_frames_into_staging(&fmt, n)?;
            }
            n
        };
        self.window = n;
        Ok((&mut self.staging[..n as usize * fb], n))
    }

    pub fn put_buffer(&mut self, frames: u32) -> Result<()> {
        let frames = frames.min(self.window);
        self.window = 0;
        if !self.is_output || frames == 0 {
            return Ok(());
        }
        let fmt = *self.fmt.as_ref().ok_or(Error::NotOpen)?;
        self.write_staging_frames(&fmt, frames)
    }

    fn read_frames_into_staging(&mut self, fmt: &AudioFormat, frames: u32) -> Result<()> {
        let samples = frames as usize * fmt.num_channels;
        let pcm = self.pcm.as_ref().ok_or(Error::NotOpen)?;
        match fmt.sample_format {
            SampleFormat::S16LE => {
                let io = pcm.io_i16()?;
                let read = io.readi(&mut self.staging_i16[..samples])?;
                for (chunk, s) in self
                    .staging
                    .chunks_exact_mut(2)
                    .zip(self.staging_i16[..read * fmt.num_channels].iter())
                {
                    chunk.copy_from_slice(&s.to_le_bytes());
                }
            }
            SampleFormat::S24LE | SampleFormat::S32LE => {
                let io = pcm.io_i32()?;
                let read = io.readi(&mut self.staging_i32[..samples])?;
                for (chunk, s) in self
                    .staging
                    .chunks_exact_mut(4)
                    .zip(self.staging_i32[..read * fmt.num_channels].iter())
                {
                    chunk.copy_from_slice(&s.to_le_bytes());
                }
            }
        }
        Ok(())
    }

    fn write_staging_frames(&mut self, fmt: &AudioFormat, frames: u32) -> Result<()> {
        let samples = frames as usize * fmt.num_channels;
        let pcm = self.pcm.as_ref().ok_or(Error::NotOpen)?;
        match fmt.sample_format {
            SampleFormat::S16LE => {
                for (s, chunk) in self.staging_i16[..samples]
                    .iter_mut()
                    .zip(self.staging.chunks_exact(2))
                {
                    *s = i16::from_le_bytes([chunk[0], chunk[1]]);
                }
                let io = pcm.io_i16()?;
                let mut written = 0;
                while written < samples {
                    written += io.writei(&self.staging_i16[written..samples])? * fmt.num_channels;
                }
            }
            SampleFormat::S24LE | SampleFormat::S32LE => {
                for (s, chunk) in self.staging_i32[..samples]
                    .iter_mut()
                    .zip(self.staging.chunks_exact(4))
                {
                    *s = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                let io = pcm.io_i32()?;
                let mut written = 0;
                while written < samples {
                    written += io.writei(&self.staging_i32[written..samples])? * fmt.num_channels;
                }
            }
        }
        Ok(())
    }

    pub fn flush_buffer(&mut self) {
        if let Some(pcm) = self.pcm.as_ref() {
            let _ = pcm.drop();
            let _ = pcm.prepare();
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let pcm = self.pcm()?;
        match pcm.state() {
            State::Running => Ok(()),
            State::Prepared => Ok(pcm.start()?),
            _ => {
                pcm.prepare()?;
                Ok(pcm.start()?)
            }
        }
    }

    /// Recovery path for xruns and suspend: re-prepare and let the engine
    /// re-prime before starting again.
    pub fn recover(&mut self) -> Result<()> {
        let pcm = self.pcm()?;
        if pcm.state() == State::Suspended {
            let _ = pcm.resume();
        }
        pcm.prepare()?;
        Ok(())
    }

    pub fn no_stream(&mut self, _enable: bool) -> Result<()> {
        Ok(())
    }

    /// Mixer-path routing for node switches lives in the enumeration
    /// layer; the PCM itself has nothing to adjust.
    pub fn update_active_node(&mut self, _node_index: u32) {}
}
