//! Socket-level integration tests.
//!
//! Each test stands up a real server on a temporary socket, speaks the wire
//! protocol as a client would, and observes the engine through its dump
//! interface.

use std::io::Write;
use std::os::unix::io::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use concerto::proto::wire::{self, ClientMessage, ConnectStreamMsg, ServerMessage};
use concerto::proto::{AudioFormat, SampleFormat, StreamId, NO_DEVICE};
use concerto::{
    Backend, Direction, DeviceList, EngineHandle, LoopbackType, Node, NodeId, NodeType,
    ServerBuilder, StreamType,
};
use concerto_core::TestBackend;

struct TestServer {
    engine: Arc<EngineHandle>,
    devlist: Arc<DeviceList>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
    socket_path: std::path::PathBuf,
    capture_socket_path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

impl TestServer {
    fn start() -> TestServer {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("concerto.sock");
        let capture_socket_path = dir.path().join("concerto-capture.sock");
        let mut server = ServerBuilder::default()
            .socket_path(&socket_path)
            .capture_socket_path(&capture_socket_path)
            .rt_priority(None)
            .build()
            .unwrap();
        let engine = server.engine().clone();
        let devlist = server.devlist().clone();
        let stop = server.stop_flag();
        let join = std::thread::spawn(move || {
            server.run().unwrap();
        });
        TestServer {
            engine,
            devlist,
            stop,
            join: Some(join),
            socket_path,
            capture_socket_path,
            _dir: dir,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

struct TestClient {
    sock: UnixStream,
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
    client_id: u16,
}

impl TestClient {
    fn connect(path: &std::path::Path) -> TestClient {
        let sock = UnixStream::connect(path).unwrap();
        sock.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut client = TestClient {
            sock,
            buf: Vec::new(),
            fds: Vec::new(),
            client_id: 0,
        };
        match client.read_msg() {
            ServerMessage::ClientConnected { client_id } => client.client_id = client_id,
            other => panic!("expected ClientConnected, got {other:?}"),
        }
        client
    }

    fn send(&mut self, msg: &ClientMessage) {
        self.sock.write_all(&msg.encode()).unwrap();
    }

    fn read_msg(&mut self) -> ServerMessage {
        loop {
            if self.buf.len() >= wire::HEADER_BYTES {
                let (id, len) = wire::parse_header(&self.buf).unwrap();
                if self.buf.len() >= len {
                    let msg = ServerMessage::decode(id, &self.buf[wire::HEADER_BYTES..len]).unwrap();
                    self.buf.drain(..len);
                    return msg;
                }
            }
            let mut chunk = [0u8; 512];
            let n = wire::recv_with_fds(&self.sock, &mut chunk, &mut self.fds)
                .expect("read from server");
            assert!(n > 0, "server closed the connection");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Skip notification traffic until a STREAM_CONNECTED arrives.
    fn read_stream_connected(&mut self) -> (i32, StreamId, u32) {
        loop {
            if let ServerMessage::StreamConnected {
                err,
                stream_id,
                used_size,
                ..
            } = self.read_msg()
            {
                return (err, stream_id, used_size);
            }
        }
    }
}

fn connect_msg(stream_id: StreamId, direction: Direction) -> ClientMessage {
    ClientMessage::ConnectStream(ConnectStreamMsg {
        stream_id,
        direction,
        stream_type: StreamType::Default,
        buffer_frames: 480,
        cb_threshold: 240,
        flags: 0,
        effects: 0,
        format: AudioFormat::new(48000, 2, SampleFormat::S16LE),
        device_index: NO_DEVICE,
    })
}

fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_connect_and_disconnect_stream() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.socket_path);
    assert_eq!(client.client_id, 1);

    let stream_id = StreamId::new(client.client_id, 2);
    assert_eq!(stream_id.0, 0x10002);
    client.send(&connect_msg(stream_id, Direction::Input));

    let (err, echoed, used_size) = client.read_stream_connected();
    assert_eq!(err, 0);
    assert_eq!(echoed, stream_id);
    assert_eq!(used_size, 480);
    // The shm fd and the wake fd ride along.
    assert_eq!(client.fds.len(), 2);

    assert!(wait_for(
        || server
            .engine
            .dump(Duration::from_secs(1))
            .map(|d| d.streams.len() == 1)
            .unwrap_or(false),
        Duration::from_secs(2)
    ));

    client.send(&ClientMessage::DisconnectStream { stream_id });
    assert!(wait_for(
        || server
            .engine
            .dump(Duration::from_secs(1))
            .map(|d| d.streams.is_empty())
            .unwrap_or(false),
        Duration::from_secs(2)
    ));
}

#[test]
fn test_capture_client_cannot_open_output_stream() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.capture_socket_path);

    let stream_id = StreamId::new(client.client_id, 1);
    client.send(&connect_msg(stream_id, Direction::Output));
    let (err, echoed, _) = client.read_stream_connected();
    assert_eq!(err, -libc::EINVAL);
    assert_eq!(echoed, stream_id);

    // The same connection may still open a capture stream.
    client.send(&connect_msg(StreamId::new(client.client_id, 2), Direction::Input));
    let (err, _, _) = client.read_stream_connected();
    assert_eq!(err, 0);
}

#[test]
fn test_cross_client_stream_id_rejected() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.socket_path);
    assert_eq!(client.client_id, 1);

    // Claims client id 2 while connected as client 1.
    let foreign = StreamId(0x20002);
    client.send(&connect_msg(foreign, Direction::Input));
    let (err, echoed, _) = client.read_stream_connected();
    assert_eq!(err, -libc::EINVAL);
    assert_eq!(echoed, foreign);
}

#[test]
fn test_odd_ring_geometry_rejected() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.socket_path);

    let stream_id = StreamId::new(client.client_id, 1);
    let mut msg = connect_msg(stream_id, Direction::Input);
    if let ClientMessage::ConnectStream(req) = &mut msg {
        req.buffer_frames = 479;
    }
    client.send(&msg);
    let (err, echoed, _) = client.read_stream_connected();
    assert_eq!(err, -libc::EINVAL);
    assert_eq!(echoed, stream_id);
}

#[test]
fn test_client_disconnect_removes_streams() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.socket_path);
    client.send(&connect_msg(StreamId::new(client.client_id, 1), Direction::Input));
    let (err, _, _) = client.read_stream_connected();
    assert_eq!(err, 0);

    drop(client);
    assert!(wait_for(
        || server
            .engine
            .dump(Duration::from_secs(1))
            .map(|d| d.streams.is_empty())
            .unwrap_or(false),
        Duration::from_secs(2)
    ));
}

#[test]
fn test_blocklist_loaded_from_config_dir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("device_blocklist"),
        "[USB_Outputs]\n0d8c_0008_00000012_0 = 1\n",
    )
    .unwrap();
    let server = ServerBuilder::default()
        .socket_path(dir.path().join("concerto.sock"))
        .config_dir(dir.path())
        .rt_priority(None)
        .build()
        .unwrap();

    assert!(server.blocklist().check(0x0d8c, 0x0008, 0x12, 0));
    assert!(!server.blocklist().check(0x0d8d, 0x0008, 0x12, 0));
    assert!(!server.blocklist().check(0x0d8c, 0x0009, 0x12, 0));
    assert!(!server.blocklist().check(0x0d8c, 0x0008, 0x13, 0));
    assert!(!server.blocklist().check(0x0d8c, 0x0008, 0x12, 1));
}

#[test]
fn test_select_node_routes_playback() {
    let server = TestServer::start();
    let mut client = TestClient::connect(&server.socket_path);

    let dev = server.devlist.add_device(
        "card-a",
        Direction::Output,
        Backend::Test(TestBackend::new_output()),
        vec![Node::new("Speaker", NodeType::Speaker).plugged(true)],
    );

    let stream_id = StreamId::new(client.client_id, 1);
    client.send(&connect_msg(stream_id, Direction::Output));
    let (err, _, _) = client.read_stream_connected();
    assert_eq!(err, 0);

    client.send(&ClientMessage::SelectNode {
        direction: Direction::Output,
        node_id: NodeId::new(dev, 0),
    });

    assert!(wait_for(
        || server
            .engine
            .dump(Duration::from_secs(1))
            .map(|d| d
                .streams
                .iter()
                .any(|s| s.id == stream_id && s.attached_devs == vec![dev]))
            .unwrap_or(false),
        Duration::from_secs(2)
    ));

    // Routing change announces the reattach to the stream's owner; the
    // socket read timeout bounds the wait.
    loop {
        match client.read_msg() {
            ServerMessage::StreamReattach { stream_id: id } if id == stream_id => break,
            _ => {}
        }
    }
}

#[test]
fn test_loopback_tap_carries_playback_to_capture() {
    let server = TestServer::start();

    // Real output endpoint.
    let dev = server.devlist.add_device(
        "card-a",
        Direction::Output,
        Backend::Test(TestBackend::new_output()),
        vec![Node::new("Speaker", NodeType::Speaker).plugged(true)],
    );
    server
        .devlist
        .add_active_node(Direction::Output, NodeId::new(dev, 0))
        .unwrap();

    // Make the post-mix loopback the active capture endpoint. The server
    // registers the three loopbacks right after the two empty devices, so
    // the post-mix variant is index 3.
    let mut client = TestClient::connect(&server.socket_path);
    let loopback_name = LoopbackType::PostMixPreDsp.node_name();
    let loopback = 3;
    server
        .devlist
        .add_active_node(Direction::Input, NodeId::new(loopback, 0))
        .unwrap();
    assert_eq!(
        server.devlist.enabled_devices(Direction::Input),
        vec![loopback],
        "{loopback_name} should be the active input"
    );

    // Capture side: a generous ring we keep draining.
    let capture_id = StreamId::new(client.client_id, 1);
    let mut capture_msg = connect_msg(capture_id, Direction::Input);
    if let ClientMessage::ConnectStream(req) = &mut capture_msg {
        req.buffer_frames = 4800;
        req.cb_threshold = 480;
    }
    client.send(&capture_msg);
    let (err, _, _) = client.read_stream_connected();
    assert_eq!(err, 0);
    let mut fds = std::mem::take(&mut client.fds);
    assert_eq!(fds.len(), 2);
    let capture_shm =
        concerto::proto::AudioShm::from_fd(fds.remove(0)).expect("map capture shm");

    // Playback side: a distinctive ramp.
    let playback_id = StreamId::new(client.client_id, 2);
    client.send(&connect_msg(playback_id, Direction::Output));
    let (err, _, _) = client.read_stream_connected();
    assert_eq!(err, 0);
    let mut fds = std::mem::take(&mut client.fds);
    assert_eq!(fds.len(), 2);
    let playback_shm =
        concerto::proto::AudioShm::from_fd(fds.remove(0)).expect("map playback shm");

    let payload: Vec<u8> = (1..=240u32)
        .flat_map(|i| {
            let s = (i as i16) * 100;
            let b = s.to_le_bytes();
            [b[0], b[1], b[0], b[1]]
        })
        .collect();
    assert_eq!(playback_shm.copy_in(&payload), 240);
    playback_shm.advance_write(240);

    // Drain the capture ring until the payload's first frames show up.
    let needle = &payload[..64];
    let mut seen: Vec<u8> = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(3);
    let mut scratch = vec![0u8; 4800 * 4];
    let mut matched = false;
    while Instant::now() < deadline {
        let got = capture_shm.copy_out(&mut scratch);
        if got > 0 {
            capture_shm.advance_read(got);
            seen.extend_from_slice(&scratch[..got as usize * 4]);
            if seen.windows(needle.len()).any(|w| w == needle) {
                matched = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(matched, "tap output never reached the capture stream");
}
