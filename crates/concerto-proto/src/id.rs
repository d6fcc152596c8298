//! Stream, node and client identifiers.

use std::fmt;

/// Device index value meaning "no device requested".
pub const NO_DEVICE: u32 = u32::MAX;

/// Stream identifier: client id in the high 16 bits, the client's own
/// stream index in the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn new(client_id: u16, stream_index: u16) -> StreamId {
        StreamId(((client_id as u32) << 16) | stream_index as u32)
    }

    #[inline]
    pub fn client_id(self) -> u16 {
        (self.0 >> 16) as u16
    }

    #[inline]
    pub fn stream_index(self) -> u16 {
        (self.0 & 0xffff) as u16
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Node identifier: owning device index in the high 32 bits, node index
/// within the device in the low 32.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(dev_index: u32, node_index: u32) -> NodeId {
        NodeId(((dev_index as u64) << 32) | node_index as u64)
    }

    #[inline]
    pub fn dev_index(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn node_index(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.dev_index(), self.node_index())
    }
}

/// Direction of sample flow, named from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client produces, device consumes.
    Output,
    /// Device produces, client consumes.
    Input,
}

impl Direction {
    pub fn other(self) -> Direction {
        match self {
            Direction::Output => Direction::Input,
            Direction::Input => Direction::Output,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Direction::Output => 0,
            Direction::Input => 1,
        }
    }

    pub fn from_wire(raw: u8) -> Option<Direction> {
        match raw {
            0 => Some(Direction::Output),
            1 => Some(Direction::Input),
            _ => None,
        }
    }
}

/// What kind of program is on the far end of the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Unknown,
    /// Ordinary playback/capture client.
    Native,
    /// Test harness client.
    Test,
    /// System utility (capture-only connections).
    Utility,
}

/// Scheduling class a stream asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamType {
    #[default]
    Default,
    Multimedia,
    Voice,
    SpeechRecognition,
    ProAudio,
    Accessibility,
}

impl StreamType {
    pub fn to_wire(self) -> u8 {
        match self {
            StreamType::Default => 0,
            StreamType::Multimedia => 1,
            StreamType::Voice => 2,
            StreamType::SpeechRecognition => 3,
            StreamType::ProAudio => 4,
            StreamType::Accessibility => 5,
        }
    }

    pub fn from_wire(raw: u8) -> Option<StreamType> {
        match raw {
            0 => Some(StreamType::Default),
            1 => Some(StreamType::Multimedia),
            2 => Some(StreamType::Voice),
            3 => Some(StreamType::SpeechRecognition),
            4 => Some(StreamType::ProAudio),
            5 => Some(StreamType::Accessibility),
            _ => None,
        }
    }
}

// Stream effect bits.
pub const EFFECT_ECHO_CANCELLATION: u32 = 1 << 0;
pub const EFFECT_NOISE_SUPPRESSION: u32 = 1 << 1;
pub const EFFECT_GAIN_CONTROL: u32 = 1 << 2;
pub const EFFECT_VOICE_DETECTION: u32 = 1 << 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_halves() {
        let id = StreamId::new(0x0001, 0x0002);
        assert_eq!(id.0, 0x10002);
        assert_eq!(id.client_id(), 1);
        assert_eq!(id.stream_index(), 2);
    }

    #[test]
    fn test_node_id_halves() {
        let id = NodeId::new(7, 3);
        assert_eq!(id.dev_index(), 7);
        assert_eq!(id.node_index(), 3);
    }

    #[test]
    fn test_direction_round_trip() {
        for dir in [Direction::Output, Direction::Input] {
            assert_eq!(Direction::from_wire(dir.to_wire()), Some(dir));
        }
        assert_eq!(Direction::from_wire(2), None);
        assert_eq!(Direction::Output.other(), Direction::Input);
    }
}
