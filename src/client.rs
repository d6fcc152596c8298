//! Per-client control sessions.
//!
//! One session per accepted socket. The control thread owns every session
//! and does all parsing here; nothing in this module ever runs on the
//! engine thread. A protocol error in a single message gets an error reply
//! and keeps the client; a framing error drops it.

use std::io::{ErrorKind, Read};
use std::os::unix::io::{AsFd, AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use tracing::{debug, info, warn};

use concerto_core::{DeviceList, Stream, StreamParams};
use concerto_proto::wire::{self, ClientMessage, ConnectStreamMsg, ServerMessage};
use concerto_proto::{
    AudioFormat, ClientType, Direction, SampleFormat, StreamId, NO_DEVICE,
};

/// Shared control-plane state the sessions dispatch into.
pub(crate) struct ServerCtx {
    pub devlist: Arc<DeviceList>,
}

pub(crate) struct ClientSession {
    id: u16,
    sock: UnixStream,
    client_type: ClientType,
    buf: Vec<u8>,
}

impl ClientSession {
    /// Greet the client with its server-assigned id.
    pub fn new(id: u16, sock: UnixStream, client_type: ClientType) -> std::io::Result<ClientSession> {
        sock.set_nonblocking(true)?;
        let session = ClientSession {
            id,
            sock,
            client_type,
            buf: Vec::with_capacity(wire::MAX_FRAME_BYTES),
        };
        session.send(&ServerMessage::ClientConnected { client_id: id }, &[])?;
        info!(client = id, ?client_type, "client connected");
        Ok(session)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn sock(&self) -> &UnixStream {
        &self.sock
    }

    /// Stream directions this connection may open.
    fn supports(&self, direction: Direction) -> bool {
        match self.client_type {
            ClientType::Utility => direction == Direction::Input,
            _ => true,
        }
    }

    pub fn send(&self, msg: &ServerMessage, fds: &[RawFd]) -> std::io::Result<()> {
        let bytes = msg.encode();
        wire::send_with_fds(&self.sock, &bytes, fds)?;
        Ok(())
    }

    /// Drain the socket and dispatch complete frames. Returns false when
    /// the client is gone (EOF, error, or framing violation).
    pub fn handle_readable(&mut self, ctx: &ServerCtx) -> bool {
        let mut chunk = [0u8; 1024];
        loop {
            match (&self.sock).read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(client = self.id, %err, "client socket error");
                    return false;
                }
            }
        }

        loop {
            if self.buf.len() < wire::HEADER_BYTES {
                return true;
            }
            let (msg_id, frame_len) = match wire::parse_header(&self.buf) {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(client = self.id, %err, "bad frame header, dropping client");
                    return false;
                }
            };
            if self.buf.len() < frame_len {
                return true;
            }
            let body = self.buf[wire::HEADER_BYTES..frame_len].to_vec();
            self.buf.drain(..frame_len);
            if !self.handle_frame(msg_id, &body, ctx) {
                return false;
            }
        }
    }

    fn handle_frame(&mut self, msg_id: u32, body: &[u8], ctx: &ServerCtx) -> bool {
        let msg = match ClientMessage::decode(msg_id, body) {
            Ok(msg) => msg,
            Err(wire::WireError::UnknownId(id)) => {
                warn!(client = self.id, id, "unknown message id ignored");
                return true;
            }
            Err(err) => {
                // A malformed CONNECT_STREAM still gets its reply, echoing
                // whatever stream id the client managed to send.
                warn!(client = self.id, %err, "malformed message");
                if msg_id == wire::MSG_CONNECT_STREAM && body.len() >= 4 {
                    let echoed = StreamId(u32::from_le_bytes(body[..4].try_into().unwrap()));
                    self.reply_stream_err(echoed, -libc::EINVAL);
                }
                return true;
            }
        };

        match msg {
            ClientMessage::ConnectStream(req) => self.connect_stream(req, ctx),
            ClientMessage::DisconnectStream { stream_id } => {
                if stream_id.client_id() != self.id {
                    return true;
                }
                if let Err(err) = ctx.devlist.remove_stream(stream_id) {
                    debug!(client = self.id, stream = %stream_id, %err, "disconnect");
                }
                true
            }
            ClientMessage::SwitchStreamType { stream_id, stream_type } => {
                if stream_id.client_id() == self.id {
                    if let Some(stream) = ctx.devlist.stream(stream_id) {
                        stream.set_stream_type(stream_type);
                    }
                }
                true
            }
            ClientMessage::SetSystemVolume { volume } => {
                let _ = ctx.devlist.set_system_volume(volume);
                true
            }
            ClientMessage::SetNodeAttr { node_id, attr, value } => {
                if let Err(err) = ctx.devlist.set_node_attr(node_id, attr, value) {
                    debug!(client = self.id, %node_id, %err, "set node attr");
                }
                true
            }
            ClientMessage::SelectNode { direction, node_id } => {
                if let Err(err) = ctx.devlist.add_active_node(direction, node_id) {
                    warn!(client = self.id, %node_id, %err, "select node failed");
                }
                true
            }
            ClientMessage::DumpState => {
                debug!(client = self.id, "state dump requested");
                true
            }
        }
    }

    fn reply_stream_err(&mut self, stream_id: StreamId, err: i32) {
        let reply = ServerMessage::StreamConnected {
            err,
            stream_id,
            format: AudioFormat::new(0, 0, SampleFormat::S16LE),
            used_size: 0,
        };
        let _ = self.send(&reply, &[]);
    }

    /// The `CONNECT_STREAM` validation ladder. Any failure replies with the
    /// echoed stream id and leaves no state behind.
    fn connect_stream(&mut self, req: ConnectStreamMsg, ctx: &ServerCtx) -> bool {
        let stream_id = req.stream_id;
        if !self.supports(req.direction) {
            self.reply_stream_err(stream_id, -libc::EINVAL);
            return true;
        }
        if stream_id.client_id() != self.id {
            self.reply_stream_err(stream_id, -libc::EINVAL);
            return true;
        }
        if ctx.devlist.stream(stream_id).is_some() {
            self.reply_stream_err(stream_id, -libc::EINVAL);
            return true;
        }

        let pinned_dev = (req.device_index != NO_DEVICE).then_some(req.device_index);
        let params = StreamParams {
            id: stream_id,
            direction: req.direction,
            stream_type: req.stream_type,
            client_type: self.client_type,
            format: req.format,
            buffer_frames: req.buffer_frames,
            cb_threshold: req.cb_threshold,
            effects: req.effects,
            pinned_dev,
        };
        let stream = match Stream::new(params) {
            Ok(stream) => Arc::new(stream),
            Err(err) => {
                debug!(client = self.id, stream = %stream_id, %err, "stream rejected");
                self.reply_stream_err(stream_id, -libc::EINVAL);
                return true;
            }
        };

        let shm_fd = stream.shm().as_raw_fd();
        let wake_fd = stream.wake_fd().as_fd().as_raw_fd();
        let reply = ServerMessage::StreamConnected {
            err: 0,
            stream_id,
            format: stream.format,
            used_size: stream.buffer_frames,
        };
        if self.send(&reply, &[shm_fd, wake_fd]).is_err() {
            return false;
        }

        if let Err(err) = ctx.devlist.add_stream(stream) {
            warn!(client = self.id, stream = %stream_id, %err, "stream add failed");
            let _ = ctx.devlist.remove_stream(stream_id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utility_clients_are_capture_only() {
        let (a, _b) = UnixStream::pair().unwrap();
        let session = ClientSession::new(1, a, ClientType::Utility).unwrap();
        assert!(session.supports(Direction::Input));
        assert!(!session.supports(Direction::Output));

        let (a, _b) = UnixStream::pair().unwrap();
        let session = ClientSession::new(2, a, ClientType::Native).unwrap();
        assert!(session.supports(Direction::Output));
    }
}
