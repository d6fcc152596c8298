//! Per-(device, stream) adapters.
//!
//! A `DevStream` is created when a stream is attached to a device and holds
//! everything the service cycle needs for that pairing: the format
//! converter (resampler state included) and pre-sized scratch buffers. The
//! engine thread is the only user.

use std::sync::Arc;

use concerto_proto::{AudioFormat, Direction};

use crate::convert::FormatConverter;
use crate::mix;
use crate::stream::Stream;

pub struct DevStream {
    stream: Arc<Stream>,
    conv: FormatConverter,
    /// Ring-side bytes in the stream's format.
    ring_buf: Vec<u8>,
    /// Device-side bytes in the device's format.
    dev_buf: Vec<u8>,
    last_fetched: u32,
}

impl DevStream {
    /// Build the adapter for `stream` attached to a device running
    /// `dev_format` with at most `max_dev_frames` per service window.
    pub fn new(stream: Arc<Stream>, dev_format: AudioFormat, max_dev_frames: usize) -> DevStream {
        let stream_fmt = stream.format;
        let (conv, ring_frames, dev_frames) = match stream.direction {
            Direction::Output => {
                let conv = FormatConverter::new(stream_fmt, dev_format, max_dev_frames);
                let ring_frames = conv.in_frames_needed(max_dev_frames) + 4;
                (conv, ring_frames, max_dev_frames)
            }
            Direction::Input => {
                let max_out = (max_dev_frames * stream_fmt.frame_rate as usize)
                    .div_ceil(dev_format.frame_rate as usize)
                    + 4;
                let conv = FormatConverter::new(dev_format, stream_fmt, max_out);
                (conv, max_out, max_dev_frames)
            }
        };
        DevStream {
            ring_buf: vec![0; ring_frames * stream_fmt.frame_bytes()],
            dev_buf: vec![0; dev_frames * dev_format.frame_bytes()],
            stream,
            conv,
            last_fetched: 0,
        }
    }

    #[inline]
    pub fn stream(&self) -> &Arc<Stream> {
        &self.stream
    }

    /// Frames delivered by the most recent fetch or capture.
    #[inline]
    pub fn last_fetched(&self) -> u32 {
        self.last_fetched
    }

    /// Pull up to `dev_frames` frames for a playback cycle, converted to the
    /// device format. A shortfall is zero-filled and counted as an underrun.
    /// Returns the window; its length is always `dev_frames` whole frames.
    pub fn fetch(&mut self, dev_frames: usize) -> &[u8] {
        let out_fb = self.conv.out_fmt().frame_bytes();
        let in_fb = self.conv.in_fmt().frame_bytes();
        let dev_frames = dev_frames.min(self.dev_buf.len() / out_fb);

        let need = self.conv.in_frames_needed(dev_frames);
        let shm = self.stream.shm();
        let take = (need as u32).min(shm.level()) as usize;
        let got = shm.copy_out(&mut self.ring_buf[..take * in_fb]) as usize;

        let (consumed, produced) = self
            .conv
            .convert(&self.ring_buf[..got * in_fb], &mut self.dev_buf[..dev_frames * out_fb]);
        shm.advance_read(consumed as u32);

        if produced < dev_frames {
            mix::fill_silence(&mut self.dev_buf[produced * out_fb..dev_frames * out_fb]);
            self.stream.record_underrun();
        }
        self.last_fetched = produced as u32;

        if shm.writable_frames() >= self.stream.cb_threshold {
            self.stream.signal_wake();
        }
        &self.dev_buf[..dev_frames * out_fb]
    }

    /// Push `dev_frames` captured frames into the stream's ring, converting
    /// to the stream format. Frames the ring cannot take are dropped and
    /// counted as an overrun. Zero-length writes are skipped entirely.
    pub fn capture(&mut self, src: &[u8]) {
        let out_fb = self.conv.out_fmt().frame_bytes();
        let (_, produced) = self.conv.convert(src, &mut self.ring_buf);
        if produced == 0 {
            self.last_fetched = 0;
            return;
        }

        let shm = self.stream.shm();
        let copied = shm.copy_in(&self.ring_buf[..produced * out_fb]);
        if copied > 0 {
            shm.advance_write(copied);
        }
        if (copied as usize) < produced {
            self.stream.record_overrun();
        }
        self.last_fetched = copied;

        if shm.level() >= self.stream.cb_threshold {
            self.stream.signal_wake();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamParams;
    use concerto_proto::{ClientType, SampleFormat, StreamId, StreamType};

    fn make_stream(direction: Direction) -> Arc<Stream> {
        Arc::new(
            Stream::new(StreamParams {
                id: StreamId::new(1, 0),
                direction,
                stream_type: StreamType::Default,
                client_type: ClientType::Native,
                format: AudioFormat::new(48000, 2, SampleFormat::S16LE),
                buffer_frames: 480,
                cb_threshold: 240,
                effects: 0,
                pinned_dev: None,
            })
            .unwrap(),
        )
    }

    fn s16(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_fetch_passes_matching_format_through() {
        let stream = make_stream(Direction::Output);
        let dev_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut ds = DevStream::new(stream.clone(), dev_fmt, 256);

        let frames = s16(&[1, 2, 3, 4, 5, 6, 7, 8]);
        stream.shm().copy_in(&frames);
        stream.shm().advance_write(4);

        let out = ds.fetch(4);
        assert_eq!(out, &frames[..]);
        assert_eq!(ds.last_fetched(), 4);
        assert_eq!(stream.underruns(), 0);
        assert_eq!(stream.shm().level(), 0);
    }

    #[test]
    fn test_fetch_shortfall_zero_fills_and_counts() {
        let stream = make_stream(Direction::Output);
        let dev_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut ds = DevStream::new(stream.clone(), dev_fmt, 256);

        stream.shm().copy_in(&s16(&[9, 9]));
        stream.shm().advance_write(1);

        let out = ds.fetch(4);
        assert_eq!(&out[..4], &s16(&[9, 9])[..]);
        assert!(out[4..].iter().all(|&b| b == 0));
        assert_eq!(stream.underruns(), 1);
    }

    #[test]
    fn test_fetch_wakes_producer_when_space_opens() {
        let stream = make_stream(Direction::Output);
        let dev_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut ds = DevStream::new(stream.clone(), dev_fmt, 256);

        // Fill the whole ring, then drain a window; the free space crosses
        // the callback threshold and the client gets poked.
        stream.shm().fill_silence(480);
        stream.shm().advance_write(480);
        ds.fetch(240);
        assert!(stream.shm().callback_pending());
    }

    #[test]
    fn test_capture_fills_ring_and_counts_overrun() {
        let stream = make_stream(Direction::Input);
        let dev_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut ds = DevStream::new(stream.clone(), dev_fmt, 512);

        ds.capture(&s16(&[5, 6, 7, 8]));
        assert_eq!(stream.shm().level(), 2);
        assert_eq!(stream.overruns(), 0);

        // Stuff the ring so the next capture cannot fit.
        stream.shm().fill_silence(478);
        stream.shm().advance_write(478);
        ds.capture(&s16(&[1, 1, 2, 2]));
        assert_eq!(stream.overruns(), 1);
    }

    #[test]
    fn test_capture_resamples_to_stream_rate() {
        let stream = make_stream(Direction::Input);
        let dev_fmt = AudioFormat::new(24000, 2, SampleFormat::S16LE);
        let mut ds = DevStream::new(stream.clone(), dev_fmt, 512);

        ds.capture(&s16(&[0, 0, 100, 100, 200, 200]));
        // 3 frames at 24 kHz become 5 at 48 kHz.
        assert_eq!(stream.shm().level(), 5);
    }
}
