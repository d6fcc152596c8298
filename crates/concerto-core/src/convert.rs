//! Per-attachment format conversion.
//!
//! A `FormatConverter` turns interleaved bytes in one [`AudioFormat`] into
//! another, composing three stages: sample decode to a normalized i32
//! domain, channel remap through a matrix built once from the two channel
//! layouts, and linear resampling. All scratch buffers are sized at
//! construction; `convert` never allocates.

use concerto_proto::{AudioFormat, ChannelPosition, SampleFormat, CHANNEL_COUNT};

use crate::resample::LinearResampler;

/// Attenuation used when folding a center or surround channel into a front
/// pair.
const FOLD: f32 = 0.707;
const FOLD_LFE: f32 = 0.5;

#[inline]
fn decode_sample(fmt: SampleFormat, bytes: &[u8]) -> i32 {
    match fmt {
        SampleFormat::S16LE => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
        SampleFormat::S24LE => {
            let raw = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            ((raw << 8) >> 8) << 8
        }
        SampleFormat::S32LE => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

#[inline]
fn encode_sample(fmt: SampleFormat, bytes: &mut [u8], v: i32) {
    match fmt {
        SampleFormat::S16LE => bytes[..2].copy_from_slice(&((v >> 16) as i16).to_le_bytes()),
        SampleFormat::S24LE => bytes[..4].copy_from_slice(&(v >> 8).to_le_bytes()),
        SampleFormat::S32LE => bytes[..4].copy_from_slice(&v.to_le_bytes()),
    }
}

/// Build the channel conversion matrix `[out_channel][in_channel]`, or
/// `None` when the layouts already agree.
///
/// Matching positions map at unity; a source center folds into the front
/// pair at 0.707, LFE and rear-center at 0.5, and surrounds fold into the
/// same-side front at 0.707. A source front pair with no destination pair
/// folds into a destination center at 0.5 each. When either side carries no
/// layout information the matrix degrades to an index-wise copy.
pub fn channel_conv_matrix(in_fmt: &AudioFormat, out_fmt: &AudioFormat) -> Option<Vec<Vec<f32>>> {
    if in_fmt.num_channels == out_fmt.num_channels && in_fmt.layout_matches(out_fmt) {
        return None;
    }

    let mut matrix = vec![vec![0.0f32; in_fmt.num_channels]; out_fmt.num_channels];

    if !in_fmt.has_channel_layout() || !out_fmt.has_channel_layout() {
        for (o, row) in matrix.iter_mut().enumerate() {
            if o < in_fmt.num_channels {
                row[o] = 1.0;
            }
        }
        return Some(matrix);
    }

    let slot = |fmt: &AudioFormat, pos: ChannelPosition| -> Option<usize> {
        let idx = fmt.channel_layout[pos.index()];
        (idx >= 0).then_some(idx as usize)
    };

    for p in 0..CHANNEL_COUNT {
        let (i, o) = (in_fmt.channel_layout[p], out_fmt.channel_layout[p]);
        if i >= 0 && o >= 0 {
            matrix[o as usize][i as usize] += 1.0;
        }
    }

    use ChannelPosition::*;
    let out_fl = slot(out_fmt, FrontLeft);
    let out_fr = slot(out_fmt, FrontRight);
    let out_fc = slot(out_fmt, FrontCenter);

    for p in [
        FrontLeft,
        FrontRight,
        RearLeft,
        RearRight,
        FrontCenter,
        LowFrequency,
        SideLeft,
        SideRight,
        RearCenter,
        FrontLeftOfCenter,
        FrontRightOfCenter,
    ] {
        let Some(i) = slot(in_fmt, p) else { continue };
        if slot(out_fmt, p).is_some() {
            continue;
        }
        match p {
            FrontCenter => {
                if let Some(o) = out_fl {
                    matrix[o][i] += FOLD;
                }
                if let Some(o) = out_fr {
                    matrix[o][i] += FOLD;
                }
            }
            LowFrequency | RearCenter => {
                if let Some(o) = out_fl {
                    matrix[o][i] += FOLD_LFE;
                }
                if let Some(o) = out_fr {
                    matrix[o][i] += FOLD_LFE;
                }
            }
            RearLeft | SideLeft | FrontLeftOfCenter => {
                if let Some(o) = out_fl {
                    matrix[o][i] += FOLD;
                }
            }
            RearRight | SideRight | FrontRightOfCenter => {
                if let Some(o) = out_fr {
                    matrix[o][i] += FOLD;
                }
            }
            FrontLeft | FrontRight => {
                if let Some(o) = out_fc {
                    matrix[o][i] += FOLD_LFE;
                }
            }
        }
    }

    Some(matrix)
}

/// Converter from one fully specified format to another.
pub struct FormatConverter {
    in_fmt: AudioFormat,
    out_fmt: AudioFormat,
    matrix: Option<Vec<Vec<f32>>>,
    resampler: LinearResampler,
    decoded: Vec<i32>,
    remapped: Vec<i32>,
    resampled: Vec<i32>,
    max_in_frames: usize,
}

impl FormatConverter {
    /// Build a converter able to produce up to `max_out_frames` per call.
    pub fn new(in_fmt: AudioFormat, out_fmt: AudioFormat, max_out_frames: usize) -> FormatConverter {
        let matrix = channel_conv_matrix(&in_fmt, &out_fmt);
        let resampler = LinearResampler::new(in_fmt.frame_rate, out_fmt.frame_rate, out_fmt.num_channels);
        // Worst-case inputs for a full output window, plus slack for the
        // carried phase and the lookahead frame.
        let max_in_frames = (max_out_frames * in_fmt.frame_rate as usize)
            .div_ceil((out_fmt.frame_rate as usize).max(1))
            + 2;
        FormatConverter {
            decoded: vec![0; max_in_frames * in_fmt.num_channels],
            remapped: vec![0; max_in_frames * out_fmt.num_channels],
            resampled: vec![0; max_out_frames * out_fmt.num_channels],
            max_in_frames,
            in_fmt,
            out_fmt,
            matrix,
            resampler,
        }
    }

    #[inline]
    pub fn in_fmt(&self) -> &AudioFormat {
        &self.in_fmt
    }

    #[inline]
    pub fn out_fmt(&self) -> &AudioFormat {
        &self.out_fmt
    }

    /// True when the conversion is a plain byte copy.
    pub fn is_identity(&self) -> bool {
        self.matrix.is_none()
            && self.resampler.is_identity()
            && self.in_fmt.sample_format == self.out_fmt.sample_format
    }

    /// Source frames required to produce `out_frames` frames.
    pub fn in_frames_needed(&self, out_frames: usize) -> usize {
        self.resampler
            .in_frames_needed(out_frames)
            .min(self.max_in_frames)
    }

    /// Convert whole frames from `src` into `dst`. Returns
    /// `(source frames consumed, destination frames produced)`.
    pub fn convert(&mut self, src: &[u8], dst: &mut [u8]) -> (usize, usize) {
        let in_fb = self.in_fmt.frame_bytes();
        let out_fb = self.out_fmt.frame_bytes();
        let in_frames = (src.len() / in_fb).min(self.max_in_frames);
        let out_cap = dst.len() / out_fb;

        if self.is_identity() {
            let n = in_frames.min(out_cap);
            dst[..n * out_fb].copy_from_slice(&src[..n * in_fb]);
            return (n, n);
        }

        let in_ch = self.in_fmt.num_channels;
        let out_ch = self.out_fmt.num_channels;
        let in_sf = self.in_fmt.sample_format;
        let sb = in_sf.sample_bytes();

        for f in 0..in_frames {
            let frame = &src[f * in_fb..(f + 1) * in_fb];
            for c in 0..in_ch {
                self.decoded[f * in_ch + c] = decode_sample(in_sf, &frame[c * sb..]);
            }
        }

        let remap_input: &[i32] = if let Some(matrix) = &self.matrix {
            for f in 0..in_frames {
                let frame = &self.decoded[f * in_ch..(f + 1) * in_ch];
                for (o, row) in matrix.iter().enumerate() {
                    let mut acc = 0i64;
                    for (i, &coeff) in row.iter().enumerate() {
                        if coeff != 0.0 {
                            acc += (frame[i] as f32 * coeff).round() as i64;
                        }
                    }
                    self.remapped[f * out_ch + o] =
                        acc.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
                }
            }
            &self.remapped[..in_frames * out_ch]
        } else {
            &self.decoded[..in_frames * in_ch]
        };

        let out_len = out_cap.min(self.resampled.len() / out_ch) * out_ch;
        let (consumed, produced) = self
            .resampler
            .resample(remap_input, &mut self.resampled[..out_len]);

        let out_sf = self.out_fmt.sample_format;
        let osb = out_sf.sample_bytes();
        for f in 0..produced {
            let frame = &mut dst[f * out_fb..(f + 1) * out_fb];
            for c in 0..out_ch {
                encode_sample(out_sf, &mut frame[c * osb..], self.resampled[f * out_ch + c]);
            }
        }
        (consumed, produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_frames(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn to_s16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_identity_is_copy() {
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut conv = FormatConverter::new(fmt, fmt, 64);
        assert!(conv.is_identity());
        let src = s16_frames(&[1, -1, 2, -2]);
        let mut dst = vec![0u8; src.len()];
        let (consumed, produced) = conv.convert(&src, &mut dst);
        assert_eq!((consumed, produced), (2, 2));
        assert_eq!(dst, src);
    }

    #[test]
    fn test_s16_to_s32_widens() {
        let in_fmt = AudioFormat::new(48000, 1, SampleFormat::S16LE);
        let out_fmt = AudioFormat::new(48000, 1, SampleFormat::S32LE);
        let mut conv = FormatConverter::new(in_fmt, out_fmt, 8);
        let src = s16_frames(&[1, -1]);
        let mut dst = vec![0u8; 8];
        let (_, produced) = conv.convert(&src, &mut dst);
        assert_eq!(produced, 2);
        let out: Vec<i32> = dst
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(out, vec![1 << 16, -(1 << 16)]);
    }

    #[test]
    fn test_mono_to_stereo_fold() {
        let in_fmt = AudioFormat::new(48000, 1, SampleFormat::S16LE);
        let out_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut conv = FormatConverter::new(in_fmt, out_fmt, 8);
        let src = s16_frames(&[10000]);
        let mut dst = vec![0u8; 4];
        let (_, produced) = conv.convert(&src, &mut dst);
        assert_eq!(produced, 1);
        let out = to_s16(&dst);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[0], 7070);
    }

    #[test]
    fn test_stereo_to_mono_fold() {
        let in_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let out_fmt = AudioFormat::new(48000, 1, SampleFormat::S16LE);
        let mut conv = FormatConverter::new(in_fmt, out_fmt, 8);
        let src = s16_frames(&[1000, 3000]);
        let mut dst = vec![0u8; 2];
        let (_, produced) = conv.convert(&src, &mut dst);
        assert_eq!(produced, 1);
        assert_eq!(to_s16(&dst), vec![2000]);
    }

    #[test]
    fn test_swapped_pair_matrix() {
        let in_fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let mut out_fmt = in_fmt;
        out_fmt.channel_layout[ChannelPosition::FrontLeft.index()] = 1;
        out_fmt.channel_layout[ChannelPosition::FrontRight.index()] = 0;
        let mut conv = FormatConverter::new(in_fmt, out_fmt, 8);
        let src = s16_frames(&[111, 222]);
        let mut dst = vec![0u8; 4];
        conv.convert(&src, &mut dst);
        assert_eq!(to_s16(&dst), vec![222, 111]);
    }

    #[test]
    fn test_resampling_chain() {
        let in_fmt = AudioFormat::new(24000, 1, SampleFormat::S16LE);
        let out_fmt = AudioFormat::new(48000, 1, SampleFormat::S16LE);
        let mut conv = FormatConverter::new(in_fmt, out_fmt, 16);
        assert_eq!(conv.in_frames_needed(4), 3);
        let src = s16_frames(&[0, 64, 128]);
        let mut dst = vec![0u8; 2 * 5];
        let (consumed, produced) = conv.convert(&src, &mut dst);
        assert_eq!(consumed, 3);
        assert_eq!(produced, 5);
        assert_eq!(to_s16(&dst), vec![0, 32, 64, 96, 128]);
    }
}
