//! Audio sample formats and channel layouts.

/// Number of channel position slots in a layout.
pub const CHANNEL_COUNT: usize = 11;

/// Speaker position of one channel in an interleaved frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum ChannelPosition {
    FrontLeft = 0,
    FrontRight = 1,
    RearLeft = 2,
    RearRight = 3,
    FrontCenter = 4,
    LowFrequency = 5,
    SideLeft = 6,
    SideRight = 7,
    RearCenter = 8,
    FrontLeftOfCenter = 9,
    FrontRightOfCenter = 10,
}

impl ChannelPosition {
    /// Slot index of this position inside a channel layout array.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// The paired position for L/R swapping, or `self` for center channels.
    pub fn swapped_pair(self) -> ChannelPosition {
        use ChannelPosition::*;
        match self {
            FrontLeft => FrontRight,
            FrontRight => FrontLeft,
            RearLeft => RearRight,
            RearRight => RearLeft,
            SideLeft => SideRight,
            SideRight => SideLeft,
            FrontLeftOfCenter => FrontRightOfCenter,
            FrontRightOfCenter => FrontLeftOfCenter,
            other => other,
        }
    }
}

/// PCM sample encodings the server moves between clients and devices.
///
/// S24LE uses a 4-byte container with 24 significant bits, matching the
/// ALSA `S24_LE` definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    #[default]
    S16LE,
    S24LE,
    S32LE,
}

impl SampleFormat {
    /// Bytes occupied by one sample of this format.
    #[inline]
    pub fn sample_bytes(self) -> usize {
        match self {
            SampleFormat::S16LE => 2,
            SampleFormat::S24LE | SampleFormat::S32LE => 4,
        }
    }

    /// Wire encoding of the format.
    pub fn to_wire(self) -> u8 {
        match self {
            SampleFormat::S16LE => 0,
            SampleFormat::S24LE => 1,
            SampleFormat::S32LE => 2,
        }
    }

    /// Decode the wire encoding, `None` for unknown values.
    pub fn from_wire(raw: u8) -> Option<SampleFormat> {
        match raw {
            0 => Some(SampleFormat::S16LE),
            1 => Some(SampleFormat::S24LE),
            2 => Some(SampleFormat::S32LE),
            _ => None,
        }
    }
}

/// Layout array mapping [`ChannelPosition`] to an interleaved channel index,
/// -1 where the position is absent.
pub type ChannelLayout = [i8; CHANNEL_COUNT];

/// The default layout for a given channel count: mono is front-center,
/// stereo is FL/FR, and larger counts follow the usual 4.0/5.1 orders.
/// Counts beyond 6 map the first six positions and leave the rest unmapped.
pub fn default_channel_layout(num_channels: usize) -> ChannelLayout {
    use ChannelPosition::*;
    let mut layout: ChannelLayout = [-1; CHANNEL_COUNT];
    let positions: &[ChannelPosition] = match num_channels {
        0 => &[],
        1 => &[FrontCenter],
        2 => &[FrontLeft, FrontRight],
        3 => &[FrontLeft, FrontRight, FrontCenter],
        4 => &[FrontLeft, FrontRight, RearLeft, RearRight],
        5 => &[FrontLeft, FrontRight, RearLeft, RearRight, FrontCenter],
        _ => &[
            FrontLeft,
            FrontRight,
            RearLeft,
            RearRight,
            FrontCenter,
            LowFrequency,
        ],
    };
    for (idx, pos) in positions.iter().enumerate() {
        layout[pos.index()] = idx as i8;
    }
    layout
}

/// A fully specified stream or device format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    /// Frames per second.
    pub frame_rate: u32,
    /// Interleaved channels per frame.
    pub num_channels: usize,
    pub sample_format: SampleFormat,
    /// Position-to-channel-index map, -1 for absent positions.
    pub channel_layout: ChannelLayout,
}

impl AudioFormat {
    /// A format with the default layout for `num_channels`.
    pub fn new(frame_rate: u32, num_channels: usize, sample_format: SampleFormat) -> AudioFormat {
        AudioFormat {
            frame_rate,
            num_channels,
            sample_format,
            channel_layout: default_channel_layout(num_channels),
        }
    }

    /// Bytes per interleaved frame.
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.sample_format.sample_bytes() * self.num_channels
    }

    /// Reset the layout to the default for the current channel count.
    pub fn set_default_channel_layout(&mut self) {
        self.channel_layout = default_channel_layout(self.num_channels);
    }

    /// Whether the layout maps any position at all.
    pub fn has_channel_layout(&self) -> bool {
        self.channel_layout.iter().any(|&idx| idx >= 0)
    }

    /// True when `other` maps exactly the same positions to the same indices.
    pub fn layout_matches(&self, other: &AudioFormat) -> bool {
        self.channel_layout == other.channel_layout
    }

    /// True when both formats map the same set of positions, in any order.
    pub fn layout_positions_match(&self, other: &AudioFormat) -> bool {
        self.channel_layout
            .iter()
            .zip(other.channel_layout.iter())
            .all(|(a, b)| (*a >= 0) == (*b >= 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let fmt = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        assert_eq!(fmt.frame_bytes(), 4);
        let fmt = AudioFormat::new(44100, 6, SampleFormat::S32LE);
        assert_eq!(fmt.frame_bytes(), 24);
    }

    #[test]
    fn test_default_stereo_layout() {
        let layout = default_channel_layout(2);
        assert_eq!(layout[ChannelPosition::FrontLeft.index()], 0);
        assert_eq!(layout[ChannelPosition::FrontRight.index()], 1);
        assert_eq!(layout[ChannelPosition::FrontCenter.index()], -1);
    }

    #[test]
    fn test_mono_maps_front_center() {
        let layout = default_channel_layout(1);
        assert_eq!(layout[ChannelPosition::FrontCenter.index()], 0);
        assert_eq!(layout[ChannelPosition::FrontLeft.index()], -1);
    }

    #[test]
    fn test_layout_positions_match_ignores_order() {
        let mut a = AudioFormat::new(48000, 2, SampleFormat::S16LE);
        let b = a;
        a.channel_layout[ChannelPosition::FrontLeft.index()] = 1;
        a.channel_layout[ChannelPosition::FrontRight.index()] = 0;
        assert!(!a.layout_matches(&b));
        assert!(a.layout_positions_match(&b));
    }

    #[test]
    fn test_sample_format_wire_round_trip() {
        for fmt in [SampleFormat::S16LE, SampleFormat::S24LE, SampleFormat::S32LE] {
            assert_eq!(SampleFormat::from_wire(fmt.to_wire()), Some(fmt));
        }
        assert_eq!(SampleFormat::from_wire(9), None);
    }
}
