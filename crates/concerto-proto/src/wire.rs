//! Fixed-layout control messages exchanged over the client socket.
//!
//! Every message is framed as `{ length: u32, id: u32 }` followed by the
//! body, all little-endian. Bodies are packed field sequences read with a
//! cursor, so no alignment is implied by the layout. Shared-memory and wake
//! file descriptors ride as `SCM_RIGHTS` ancillary data on the frame that
//! announces them.

use std::io;
use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use thiserror::Error;

use crate::format::{AudioFormat, ChannelLayout, SampleFormat, CHANNEL_COUNT};
use crate::id::{Direction, NodeId, StreamId, StreamType};

/// Bytes in the `{length, id}` frame header.
pub const HEADER_BYTES: usize = 8;

/// Upper bound on a single control frame; anything larger is a protocol
/// violation and drops the client.
pub const MAX_FRAME_BYTES: usize = 512;

// Client to server.
pub const MSG_CONNECT_STREAM: u32 = 2;
pub const MSG_DISCONNECT_STREAM: u32 = 3;
pub const MSG_SWITCH_STREAM_TYPE: u32 = 4;
pub const MSG_SET_SYSTEM_VOLUME: u32 = 5;
pub const MSG_SET_NODE_ATTR: u32 = 6;
pub const MSG_SELECT_NODE: u32 = 7;
pub const MSG_DUMP_STATE: u32 = 8;

// Server to client.
pub const MSG_CLIENT_CONNECTED: u32 = 100;
pub const MSG_STREAM_CONNECTED: u32 = 101;
pub const MSG_STREAM_REATTACH: u32 = 102;
pub const MSG_OUTPUT_VOLUME_CHANGED: u32 = 103;
pub const MSG_NODES_CHANGED: u32 = 104;
pub const MSG_ACTIVE_NODE_CHANGED: u32 = 105;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("frame length {0} out of range")]
    BadLength(u32),
    #[error("unknown message id {0}")]
    UnknownId(u32),
    #[error("invalid value for {0}")]
    BadValue(&'static str),
}

/// Mutable attributes of a node reachable from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAttr {
    Plugged,
    Volume,
    CaptureGain,
    SwapLeftRight,
}

impl NodeAttr {
    fn to_wire(self) -> u8 {
        match self {
            NodeAttr::Plugged => 0,
            NodeAttr::Volume => 1,
            NodeAttr::CaptureGain => 2,
            NodeAttr::SwapLeftRight => 3,
        }
    }

    fn from_wire(raw: u8) -> Option<NodeAttr> {
        match raw {
            0 => Some(NodeAttr::Plugged),
            1 => Some(NodeAttr::Volume),
            2 => Some(NodeAttr::CaptureGain),
            3 => Some(NodeAttr::SwapLeftRight),
            _ => None,
        }
    }
}

/// Body of `CONNECT_STREAM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectStreamMsg {
    pub stream_id: StreamId,
    pub direction: Direction,
    pub stream_type: StreamType,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub flags: u32,
    pub effects: u32,
    pub format: AudioFormat,
    /// Pinned device index, [`crate::id::NO_DEVICE`] for none.
    pub device_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    ConnectStream(ConnectStreamMsg),
    DisconnectStream { stream_id: StreamId },
    SwitchStreamType { stream_id: StreamId, stream_type: StreamType },
    SetSystemVolume { volume: u32 },
    SetNodeAttr { node_id: NodeId, attr: NodeAttr, value: i32 },
    SelectNode { direction: Direction, node_id: NodeId },
    DumpState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    ClientConnected { client_id: u16 },
    /// Reply to `CONNECT_STREAM`. `err` is 0 on success or a negative errno;
    /// on success the frame carries the shm fd and wake fd as ancillary data.
    StreamConnected {
        err: i32,
        stream_id: StreamId,
        format: AudioFormat,
        used_size: u32,
    },
    StreamReattach { stream_id: StreamId },
    OutputVolumeChanged { volume: u32 },
    NodesChanged,
    ActiveNodeChanged { direction: Direction, node_id: NodeId },
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(id: u32) -> Writer {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&id.to_le_bytes());
        Writer { buf }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn format(&mut self, fmt: &AudioFormat) {
        self.u32(fmt.frame_rate);
        self.u32(fmt.num_channels as u32);
        self.u8(fmt.sample_format.to_wire());
        for &idx in fmt.channel_layout.iter() {
            self.buf.push(idx as u8);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[..4].copy_from_slice(&len.to_le_bytes());
        self.buf
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn format(&mut self) -> Result<AudioFormat, WireError> {
        let frame_rate = self.u32()?;
        let num_channels = self.u32()? as usize;
        let sample_format = SampleFormat::from_wire(self.u8()?)
            .ok_or(WireError::BadValue("sample_format"))?;
        let raw = self.take(CHANNEL_COUNT)?;
        let mut channel_layout: ChannelLayout = [-1; CHANNEL_COUNT];
        for (slot, &b) in channel_layout.iter_mut().zip(raw.iter()) {
            *slot = b as i8;
        }
        Ok(AudioFormat {
            frame_rate,
            num_channels,
            sample_format,
            channel_layout,
        })
    }
}

/// Parse a frame header. Returns `(message id, total frame length)`.
pub fn parse_header(buf: &[u8]) -> Result<(u32, usize), WireError> {
    if buf.len() < HEADER_BYTES {
        return Err(WireError::Truncated {
            need: HEADER_BYTES,
            have: buf.len(),
        });
    }
    let length = u32::from_le_bytes(buf[..4].try_into().unwrap());
    let id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if (length as usize) < HEADER_BYTES || length as usize > MAX_FRAME_BYTES {
        return Err(WireError::BadLength(length));
    }
    Ok((id, length as usize))
}

impl ClientMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ClientMessage::ConnectStream(msg) => {
                let mut w = Writer::new(MSG_CONNECT_STREAM);
                w.u32(msg.stream_id.0);
                w.u8(msg.direction.to_wire());
                w.u8(msg.stream_type.to_wire());
                w.u32(msg.buffer_frames);
                w.u32(msg.cb_threshold);
                w.u32(msg.flags);
                w.u32(msg.effects);
                w.format(&msg.format);
                w.u32(msg.device_index);
                w.finish()
            }
            ClientMessage::DisconnectStream { stream_id } => {
                let mut w = Writer::new(MSG_DISCONNECT_STREAM);
                w.u32(stream_id.0);
                w.finish()
            }
            ClientMessage::SwitchStreamType { stream_id, stream_type } => {
                let mut w = Writer::new(MSG_SWITCH_STREAM_TYPE);
                w.u32(stream_id.0);
                w.u8(stream_type.to_wire());
                w.finish()
            }
            ClientMessage::SetSystemVolume { volume } => {
                let mut w = Writer::new(MSG_SET_SYSTEM_VOLUME);
                w.u32(*volume);
                w.finish()
            }
            ClientMessage::SetNodeAttr { node_id, attr, value } => {
                let mut w = Writer::new(MSG_SET_NODE_ATTR);
                w.u64(node_id.0);
                w.u8(attr.to_wire());
                w.i32(*value);
                w.finish()
            }
            ClientMessage::SelectNode { direction, node_id } => {
                let mut w = Writer::new(MSG_SELECT_NODE);
                w.u8(direction.to_wire());
                w.u64(node_id.0);
                w.finish()
            }
            ClientMessage::DumpState => Writer::new(MSG_DUMP_STATE).finish(),
        }
    }

    /// Decode a client frame body for the given message id.
    pub fn decode(id: u32, body: &[u8]) -> Result<ClientMessage, WireError> {
        let mut r = Reader::new(body);
        match id {
            MSG_CONNECT_STREAM => {
                let stream_id = StreamId(r.u32()?);
                let direction =
                    Direction::from_wire(r.u8()?).ok_or(WireError::BadValue("direction"))?;
                let stream_type =
                    StreamType::from_wire(r.u8()?).ok_or(WireError::BadValue("stream_type"))?;
                let buffer_frames = r.u32()?;
                let cb_threshold = r.u32()?;
                let flags = r.u32()?;
                let effects = r.u32()?;
                let format = r.format()?;
                let device_index = r.u32()?;
                Ok(ClientMessage::ConnectStream(ConnectStreamMsg {
                    stream_id,
                    direction,
                    stream_type,
                    buffer_frames,
                    cb_threshold,
                    flags,
                    effects,
                    format,
                    device_index,
                }))
            }
            MSG_DISCONNECT_STREAM => Ok(ClientMessage::DisconnectStream {
                stream_id: StreamId(r.u32()?),
            }),
            MSG_SWITCH_STREAM_TYPE => {
                let stream_id = StreamId(r.u32()?);
                let stream_type =
                    StreamType::from_wire(r.u8()?).ok_or(WireError::BadValue("stream_type"))?;
                Ok(ClientMessage::SwitchStreamType { stream_id, stream_type })
            }
            MSG_SET_SYSTEM_VOLUME => Ok(ClientMessage::SetSystemVolume { volume: r.u32()? }),
            MSG_SET_NODE_ATTR => {
                let node_id = NodeId(r.u64()?);
                let attr = NodeAttr::from_wire(r.u8()?).ok_or(WireError::BadValue("attr"))?;
                let value = r.i32()?;
                Ok(ClientMessage::SetNodeAttr { node_id, attr, value })
            }
            MSG_SELECT_NODE => {
                let direction =
                    Direction::from_wire(r.u8()?).ok_or(WireError::BadValue("direction"))?;
                let node_id = NodeId(r.u64()?);
                Ok(ClientMessage::SelectNode { direction, node_id })
            }
            MSG_DUMP_STATE => Ok(ClientMessage::DumpState),
            other => Err(WireError::UnknownId(other)),
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ServerMessage::ClientConnected { client_id } => {
                let mut w = Writer::new(MSG_CLIENT_CONNECTED);
                w.u32(*client_id as u32);
                w.finish()
            }
            ServerMessage::StreamConnected {
                err,
                stream_id,
                format,
                used_size,
            } => {
                let mut w = Writer::new(MSG_STREAM_CONNECTED);
                w.i32(*err);
                w.u32(stream_id.0);
                w.format(format);
                w.u32(*used_size);
                w.finish()
            }
            ServerMessage::StreamReattach { stream_id } => {
                let mut w = Writer::new(MSG_STREAM_REATTACH);
                w.u32(stream_id.0);
                w.finish()
            }
            ServerMessage::OutputVolumeChanged { volume } => {
                let mut w = Writer::new(MSG_OUTPUT_VOLUME_CHANGED);
                w.u32(*volume);
                w.finish()
            }
            ServerMessage::NodesChanged => Writer::new(MSG_NODES_CHANGED).finish(),
            ServerMessage::ActiveNodeChanged { direction, node_id } => {
                let mut w = Writer::new(MSG_ACTIVE_NODE_CHANGED);
                w.u8(direction.to_wire());
                w.u64(node_id.0);
                w.finish()
            }
        }
    }

    /// Decode a server frame body for the given message id.
    pub fn decode(id: u32, body: &[u8]) -> Result<ServerMessage, WireError> {
        let mut r = Reader::new(body);
        match id {
            MSG_CLIENT_CONNECTED => Ok(ServerMessage::ClientConnected {
                client_id: r.u32()? as u16,
            }),
            MSG_STREAM_CONNECTED => {
                let err = r.i32()?;
                let stream_id = StreamId(r.u32()?);
                let format = r.format()?;
                let used_size = r.u32()?;
                Ok(ServerMessage::StreamConnected {
                    err,
                    stream_id,
                    format,
                    used_size,
                })
            }
            MSG_STREAM_REATTACH => Ok(ServerMessage::StreamReattach {
                stream_id: StreamId(r.u32()?),
            }),
            MSG_OUTPUT_VOLUME_CHANGED => {
                Ok(ServerMessage::OutputVolumeChanged { volume: r.u32()? })
            }
            MSG_NODES_CHANGED => Ok(ServerMessage::NodesChanged),
            MSG_ACTIVE_NODE_CHANGED => {
                let direction =
                    Direction::from_wire(r.u8()?).ok_or(WireError::BadValue("direction"))?;
                let node_id = NodeId(r.u64()?);
                Ok(ServerMessage::ActiveNodeChanged { direction, node_id })
            }
            other => Err(WireError::UnknownId(other)),
        }
    }
}

/// Send one frame, optionally with file descriptors as `SCM_RIGHTS`.
pub fn send_with_fds(sock: &UnixStream, bytes: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(bytes)];
    let cmsg;
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() {
        &[]
    } else {
        cmsg = [ControlMessage::ScmRights(fds)];
        &cmsg
    };
    sendmsg::<()>(sock.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None)
        .map_err(io::Error::from)
}

/// Receive bytes from the socket, collecting any passed file descriptors.
/// Returns the number of data bytes read (0 on orderly shutdown).
pub fn recv_with_fds(
    sock: &UnixStream,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 4]);
    let msg = recvmsg::<()>(
        sock.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    for cmsg in msg.cmsgs().map_err(io::Error::from)? {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            for fd in received {
                // SAFETY: the kernel just handed us ownership of this fd.
                fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }
    Ok(msg.bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::NO_DEVICE;

    fn round_trip_client(msg: ClientMessage) {
        let bytes = msg.encode();
        let (id, len) = parse_header(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        let decoded = ClientMessage::decode(id, &bytes[HEADER_BYTES..len]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_connect_stream_round_trip() {
        round_trip_client(ClientMessage::ConnectStream(ConnectStreamMsg {
            stream_id: StreamId::new(1, 2),
            direction: Direction::Input,
            stream_type: StreamType::Voice,
            buffer_frames: 480,
            cb_threshold: 240,
            flags: 0,
            effects: crate::id::EFFECT_ECHO_CANCELLATION,
            format: AudioFormat::new(48000, 2, SampleFormat::S16LE),
            device_index: NO_DEVICE,
        }));
    }

    #[test]
    fn test_stream_connected_round_trip() {
        let msg = ServerMessage::StreamConnected {
            err: -libc::EINVAL,
            stream_id: StreamId::new(3, 1),
            format: AudioFormat::new(44100, 1, SampleFormat::S32LE),
            used_size: 960,
        };
        let bytes = msg.encode();
        let (id, len) = parse_header(&bytes).unwrap();
        let decoded = ServerMessage::decode(id, &bytes[HEADER_BYTES..len]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_bad_direction_rejected() {
        let mut bytes = ClientMessage::DisconnectStream {
            stream_id: StreamId(7),
        }
        .encode();
        // Rewrite the id to SELECT_NODE; the one-byte direction is now 0x07.
        bytes[4..8].copy_from_slice(&MSG_SELECT_NODE.to_le_bytes());
        let (id, len) = parse_header(&bytes).unwrap();
        assert!(matches!(
            ClientMessage::decode(id, &bytes[HEADER_BYTES..len]),
            Err(WireError::BadValue(_))
        ));
    }

    #[test]
    fn test_header_length_bounds() {
        let mut bytes = ClientMessage::DumpState.encode();
        bytes[..4].copy_from_slice(&4u32.to_le_bytes());
        assert!(matches!(parse_header(&bytes), Err(WireError::BadLength(4))));
        bytes[..4].copy_from_slice(&(MAX_FRAME_BYTES as u32 + 1).to_le_bytes());
        assert!(matches!(parse_header(&bytes), Err(WireError::BadLength(_))));
    }

    #[test]
    fn test_truncated_body() {
        let bytes = ClientMessage::DisconnectStream {
            stream_id: StreamId(7),
        }
        .encode();
        let err = ClientMessage::decode(MSG_DISCONNECT_STREAM, &bytes[HEADER_BYTES..HEADER_BYTES + 2]);
        assert!(matches!(err, Err(WireError::Truncated { .. })));
    }
}
