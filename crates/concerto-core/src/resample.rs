//! Deterministic linear sample-rate conversion.
//!
//! The converter keeps its position as an integer phase (numerator over the
//! reduced output rate), so repeated small conversions produce bit-identical
//! results to one large conversion. Interpolation is first-order between the
//! two neighboring input frames, computed at i64 precision on interleaved
//! i32 samples.

/// Stateful linear resampler over interleaved i32 frames.
#[derive(Debug)]
pub struct LinearResampler {
    channels: usize,
    /// Reduced input rate.
    from: u64,
    /// Reduced output rate.
    to: u64,
    /// Source position fraction, numerator over `to`.
    phase: u64,
    /// The input frame just behind the current position.
    last: Vec<i32>,
    have_last: bool,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: usize) -> LinearResampler {
        let g = gcd(from_rate as u64, to_rate as u64).max(1);
        LinearResampler {
            channels,
            from: from_rate as u64 / g,
            to: to_rate as u64 / g,
            phase: 0,
            last: vec![0; channels],
            have_last: false,
        }
    }

    /// True when no rate conversion happens.
    #[inline]
    pub fn is_identity(&self) -> bool {
        self.from == self.to
    }

    /// Input frames required to produce `out_frames` output frames from the
    /// current state.
    pub fn in_frames_needed(&self, out_frames: usize) -> usize {
        if out_frames == 0 {
            return 0;
        }
        if self.is_identity() {
            return out_frames;
        }
        let p = self.phase + (out_frames as u64 - 1) * self.from;
        let mut need = (p / self.to) as usize;
        if p % self.to != 0 {
            need += 1;
        }
        if !self.have_last {
            need += 1;
        }
        need
    }

    /// Convert as much of `input` as fits in `output`. Both are interleaved
    /// with the configured channel count. Returns
    /// `(input frames consumed, output frames produced)`.
    pub fn resample(&mut self, input: &[i32], output: &mut [i32]) -> (usize, usize) {
        let ch = self.channels;
        let in_frames = input.len() / ch;
        let out_cap = output.len() / ch;

        if self.is_identity() {
            let n = in_frames.min(out_cap);
            output[..n * ch].copy_from_slice(&input[..n * ch]);
            return (n, n);
        }

        let mut consumed = 0usize;
        let mut produced = 0usize;

        if !self.have_last {
            if in_frames == 0 {
                return (0, 0);
            }
            self.last.copy_from_slice(&input[..ch]);
            self.have_last = true;
            consumed = 1;
        }

        while produced < out_cap {
            // Step the window forward until the position is inside it.
            while self.phase >= self.to {
                if consumed >= in_frames {
                    return (consumed, produced);
                }
                self.last
                    .copy_from_slice(&input[consumed * ch..(consumed + 1) * ch]);
                consumed += 1;
                self.phase -= self.to;
            }

            let out = &mut output[produced * ch..(produced + 1) * ch];
            if self.phase == 0 {
                out.copy_from_slice(&self.last);
            } else {
                if consumed >= in_frames {
                    // The frame ahead of the position has not arrived yet.
                    return (consumed, produced);
                }
                let next = &input[consumed * ch..(consumed + 1) * ch];
                for c in 0..ch {
                    let a = self.last[c] as i64;
                    let b = next[c] as i64;
                    out[c] = (a + (b - a) * self.phase as i64 / self.to as i64) as i32;
                }
            }
            produced += 1;
            self.phase += self.from;
        }
        (consumed, produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(r: &mut LinearResampler, input: &[i32], out_frames: usize) -> (usize, Vec<i32>) {
        let mut out = vec![0i32; out_frames * r.channels];
        let (consumed, produced) = r.resample(input, &mut out);
        out.truncate(produced * r.channels);
        (consumed, out)
    }

    #[test]
    fn test_identity_pass_through() {
        let mut r = LinearResampler::new(48000, 48000, 2);
        let input = [1, 2, 3, 4, 5, 6];
        let (consumed, out) = run(&mut r, &input, 3);
        assert_eq!(consumed, 3);
        assert_eq!(out, input);
    }

    #[test]
    fn test_doubling_interpolates_midpoints() {
        let mut r = LinearResampler::new(24000, 48000, 1);
        let (consumed, out) = run(&mut r, &[0, 100, 200], 5);
        assert_eq!(consumed, 3);
        assert_eq!(out, vec![0, 50, 100, 150, 200]);
    }

    #[test]
    fn test_halving_decimates() {
        let mut r = LinearResampler::new(48000, 24000, 1);
        let (consumed, out) = run(&mut r, &[0, 10, 20, 30, 40], 2);
        assert_eq!(consumed, 3);
        assert_eq!(out, vec![0, 20]);
    }

    #[test]
    fn test_in_frames_needed_matches_consumption() {
        for (from, to) in [(44100u32, 48000u32), (48000, 44100), (8000, 48000)] {
            let mut r = LinearResampler::new(from, to, 1);
            for want in [1usize, 7, 64, 480] {
                let need = r.in_frames_needed(want);
                let input: Vec<i32> = (0..need as i32).collect();
                let mut out = vec![0i32; want];
                let (consumed, produced) = r.resample(&input, &mut out);
                assert_eq!(produced, want, "{from}->{to} want {want}");
                assert!(consumed <= need);
            }
        }
    }

    #[test]
    fn test_chunked_equals_whole() {
        let input: Vec<i32> = (0..200).map(|i| i * 31 - 3000).collect();

        let mut whole = LinearResampler::new(44100, 48000, 1);
        let mut out_whole = vec![0i32; 180];
        let (_, produced) = whole.resample(&input, &mut out_whole);
        out_whole.truncate(produced);

        let mut chunked = LinearResampler::new(44100, 48000, 1);
        let mut out_chunked = Vec::new();
        let mut in_pos = 0;
        while out_chunked.len() < produced {
            let want = (produced - out_chunked.len()).min(17);
            let mut out = vec![0i32; want];
            let (c, p) = chunked.resample(&input[in_pos..], &mut out);
            in_pos += c;
            out_chunked.extend_from_slice(&out[..p]);
            if c == 0 && p == 0 {
                break;
            }
        }
        assert_eq!(out_chunked, out_whole);
    }
}
