//! The concerto server: socket plumbing and control-plane dispatch.
//!
//! A single control thread owns the listening sockets and every client
//! session, parses all IPC, and forwards work to the device list and the
//! engine command queue. Engine-originated events come back over a
//! channel and are folded into the observer registry and client
//! notifications here; the engine thread never touches a socket.

use std::os::unix::io::AsFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use concerto_core::{
    DeviceBlocklist, DeviceList, EngineConfig, EngineHandle, LoopbackType, ObserverEvent,
    ObserverRegistry,
};
use concerto_proto::wire::ServerMessage;
use concerto_proto::{ClientType, Direction};

use crate::client::{ClientSession, ServerCtx};
use crate::error::{Error, Result};

const POLL_INTERVAL_MS: u16 = 100;

pub(crate) struct ServerOptions {
    pub socket_path: PathBuf,
    pub capture_socket_path: Option<PathBuf>,
    pub config_dir: Option<PathBuf>,
    pub loopback_devices: bool,
    pub engine: EngineConfig,
}

/// The assembled server. `run` drives the control thread until the stop
/// flag flips.
pub struct Server {
    listener: UnixListener,
    capture_listener: Option<UnixListener>,
    socket_path: PathBuf,
    capture_socket_path: Option<PathBuf>,
    clients: Vec<ClientSession>,
    next_client_id: u16,
    devlist: Arc<DeviceList>,
    engine: Arc<EngineHandle>,
    observer: Arc<ObserverRegistry>,
    engine_events: Receiver<ObserverEvent>,
    observer_events: Receiver<ObserverEvent>,
    blocklist: DeviceBlocklist,
    config_dir: Option<PathBuf>,
    stop: Arc<AtomicBool>,
}

fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

impl Server {
    pub(crate) fn new(options: ServerOptions) -> Result<Server> {
        let mut engine = EngineHandle::spawn(options.engine);
        let engine_events = engine.take_events().ok_or(Error::AlreadyRunning)?;
        let engine = Arc::new(engine);
        let observer = Arc::new(ObserverRegistry::new());
        let observer_events = observer.subscribe();
        let devlist = Arc::new(DeviceList::new(engine.clone(), observer.clone())?);

        if options.loopback_devices {
            for loopback_type in [
                LoopbackType::PostMixPreDsp,
                LoopbackType::PostDsp,
                LoopbackType::PostDspDelayed,
            ] {
                devlist.add_loopback_device(loopback_type);
            }
        }

        let blocklist = options
            .config_dir
            .as_deref()
            .map(DeviceBlocklist::load)
            .unwrap_or_default();

        let listener = bind_socket(&options.socket_path)?;
        let capture_listener = options
            .capture_socket_path
            .as_deref()
            .map(bind_socket)
            .transpose()?;

        info!(socket = %options.socket_path.display(), "server listening");
        Ok(Server {
            listener,
            capture_listener,
            socket_path: options.socket_path,
            capture_socket_path: options.capture_socket_path,
            clients: Vec::new(),
            next_client_id: 1,
            devlist,
            engine,
            observer,
            engine_events,
            observer_events,
            blocklist,
            config_dir: options.config_dir,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn devlist(&self) -> &Arc<DeviceList> {
        &self.devlist
    }

    pub fn engine(&self) -> &Arc<EngineHandle> {
        &self.engine
    }

    pub fn observer(&self) -> &Arc<ObserverRegistry> {
        &self.observer
    }

    pub fn blocklist(&self) -> &DeviceBlocklist {
        &self.blocklist
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    /// Flag that stops `run` from another thread or a signal handler.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Serve until the stop flag flips.
    pub fn run(&mut self) -> Result<()> {
        while !self.stop.load(Ordering::Relaxed) {
            self.run_once()?;
        }
        info!("server stopping");
        Ok(())
    }

    /// One poll cycle: accept, read clients, pump events.
    pub fn run_once(&mut self) -> Result<()> {
        let (ready_main, ready_capture, ready_clients) = {
            let mut fds = Vec::with_capacity(self.clients.len() + 2);
            fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
            if let Some(capture) = self.capture_listener.as_ref() {
                fds.push(PollFd::new(capture.as_fd(), PollFlags::POLLIN));
            }
            let first_client = fds.len();
            for client in self.clients.iter() {
                fds.push(PollFd::new(
                    client.sock().as_fd(),
                    PollFlags::POLLIN | PollFlags::POLLHUP,
                ));
            }
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(_) => {}
                // Interrupted by a signal; the stop flag gets checked on
                // the way around.
                Err(nix::errno::Errno::EINTR) => return Ok(()),
                Err(err) => return Err(std::io::Error::from(err).into()),
            }

            let ready = |fd: &PollFd| fd.revents().map_or(false, |r| !r.is_empty());
            let ready_main = ready(&fds[0]);
            let ready_capture = self.capture_listener.is_some() && ready(&fds[1]);
            let ready_clients: Vec<u16> = self
                .clients
                .iter()
                .zip(&fds[first_client..])
                .filter(|(_, fd)| ready(fd))
                .map(|(client, _)| client.id())
                .collect();
            (ready_main, ready_capture, ready_clients)
        };

        if ready_main {
            self.accept_clients(false);
        }
        if ready_capture {
            self.accept_clients(true);
        }
        for id in ready_clients {
            self.service_client(id);
        }
        self.pump_engine_events();
        self.pump_observer_events();
        Ok(())
    }

    fn accept_clients(&mut self, capture: bool) {
        loop {
            let accepted = if capture {
                self.capture_listener.as_ref().map(|l| l.accept())
            } else {
                Some(self.listener.accept())
            };
            let Some(accepted) = accepted else { return };
            match accepted {
                Ok((sock, _)) => self.add_client(sock, capture),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(%err, "accept failed");
                    return;
                }
            }
        }
    }

    fn add_client(&mut self, sock: UnixStream, capture: bool) {
        let id = self.next_client_id;
        self.next_client_id = self.next_client_id.checked_add(1).unwrap_or(1);
        let client_type = if capture {
            ClientType::Utility
        } else {
            ClientType::Native
        };
        match ClientSession::new(id, sock, client_type) {
            Ok(session) => self.clients.push(session),
            Err(err) => warn!(%err, "client handshake failed"),
        }
    }

    fn service_client(&mut self, id: u16) {
        let ctx = ServerCtx {
            devlist: self.devlist.clone(),
        };
        let Some(pos) = self.clients.iter().position(|c| c.id() == id) else {
            return;
        };
        let keep = self.clients[pos].handle_readable(&ctx);
        if !keep {
            self.drop_client(pos);
        }
    }

    /// A disconnect tears down every stream the client owned.
    fn drop_client(&mut self, pos: usize) {
        let session = self.clients.remove(pos);
        let id = session.id();
        for stream_id in self.devlist.stream_ids_for_client(id) {
            if let Err(err) = self.devlist.remove_stream(stream_id) {
                debug!(stream = %stream_id, %err, "cleanup on disconnect");
            }
        }
        info!(client = id, "client disconnected");
    }

    /// Fold engine-side events into the routing state and the registry.
    fn pump_engine_events(&mut self) {
        while let Ok(event) = self.engine_events.try_recv() {
            if let ObserverEvent::DeviceRemoved { dev_index } = &event {
                self.devlist.on_device_failed(*dev_index);
            }
            self.observer.notify(event);
        }
    }

    /// Turn observer events into client notifications.
    fn pump_observer_events(&mut self) {
        while let Ok(event) = self.observer_events.try_recv() {
            match event {
                ObserverEvent::OutputVolumeChanged { volume } => {
                    self.broadcast(&ServerMessage::OutputVolumeChanged { volume });
                }
                ObserverEvent::NodesChanged => {
                    self.broadcast(&ServerMessage::NodesChanged);
                }
                ObserverEvent::ActiveNodeChanged { direction, node_id } => {
                    self.broadcast(&ServerMessage::ActiveNodeChanged { direction, node_id });
                    self.notify_reattach(direction);
                }
                _ => {}
            }
        }
    }

    fn broadcast(&mut self, msg: &ServerMessage) {
        self.clients.retain(|client| client.send(msg, &[]).is_ok());
    }

    /// Routing moved the direction's unpinned streams; tell their owners.
    fn notify_reattach(&mut self, direction: Direction) {
        for stream_id in self.devlist.stream_ids_for_direction(direction) {
            let owner = stream_id.client_id();
            if let Some(client) = self.clients.iter().find(|c| c.id() == owner) {
                let _ = client.send(&ServerMessage::StreamReattach { stream_id }, &[]);
            }
        }
    }

    /// Block the caller until `id`'s ring drains or the deadline passes.
    /// With no explicit timeout the deadline is the stream's buffered
    /// duration plus 20 ms.
    pub fn drain_stream(&self, id: concerto_proto::StreamId, timeout: Option<Duration>) -> i32 {
        let timeout = timeout.unwrap_or_else(|| {
            self.devlist
                .stream(id)
                .map(|s| Duration::from_nanos(s.buffered_nanos()) + Duration::from_millis(20))
                .unwrap_or(Duration::from_millis(20))
        });
        self.engine.drain_stream(id, timeout)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(path) = self.capture_socket_path.as_ref() {
            let _ = std::fs::remove_file(path);
        }
    }
}
