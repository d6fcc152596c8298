//! The audio engine thread.
//!
//! One soft-real-time thread services every open device on a deadline
//! schedule. Control-plane work arrives over a crossbeam channel and is
//! drained at the top of each iteration, so commands never contend with a
//! service cycle. The only blocking points are the timed channel wait and
//! the backend transfer calls themselves.
//!
//! Per-cycle rules: the engine does not allocate, does not take any
//! control-plane lock, and touches no sockets. Everything a cycle needs
//! (mix windows, conversion buffers, tap scratch) is sized when devices and
//! streams are added.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use concerto_proto::{AudioFormat, Direction, StreamId};

use crate::devstream::DevStream;
use crate::error::{Error, Result};
use crate::iodev::{DevState, Iodev};
use crate::mix;
use crate::observer::ObserverEvent;
use crate::stream::Stream;

/// Fallback wait when no device deadline is pending.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Floor for a device's next-wake distance, keeps a hiccup from spinning.
const MIN_SLEEP_FRAMES: u32 = 16;

/// Severe-underrun warnings are limited to one per device per this window.
const SEVERE_WARN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `frames_queued` beyond `buffer_size + threshold` is a severe
    /// underrun and forces a re-prime.
    pub severe_underrun_frames: u32,
    /// Attempt to elevate the thread to SCHED_RR at this priority.
    pub rt_priority: Option<i32>,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            severe_underrun_frames: 480,
            rt_priority: Some(10),
        }
    }
}

/// Commands the control plane sends to the engine.
pub enum EngineCommand {
    AddDevice(Box<Iodev>),
    /// Close and hand the device back; `None` when the index is unknown.
    RemoveDevice {
        index: u32,
        reply: Sender<Option<Box<Iodev>>>,
    },
    AddStream {
        stream: Arc<Stream>,
        dev_indices: Vec<u32>,
    },
    RemoveStream {
        id: StreamId,
    },
    /// The control plane switched a device's active node.
    SetActiveNode {
        index: u32,
        node_index: u32,
    },
    /// Feed the named loopback device from `sender_index`'s finished mix.
    RegisterTap {
        loopback_index: u32,
        sender_index: u32,
    },
    UnregisterTap {
        loopback_index: u32,
    },
    /// Resolved with 0 once the stream's ring is empty, or -ETIMEDOUT.
    Drain {
        id: StreamId,
        deadline: Instant,
        reply: Sender<i32>,
    },
    Suspend,
    Resume,
    Dump {
        reply: Sender<EngineDump>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct DevDump {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    pub state: DevState,
    pub format: Option<AudioFormat>,
    pub buffer_size: u32,
    pub num_streams: usize,
}

#[derive(Debug, Clone)]
pub struct StreamDump {
    pub id: StreamId,
    pub direction: Direction,
    pub attached_devs: Vec<u32>,
    pub level: u32,
    pub underruns: u64,
    pub overruns: u64,
}

#[derive(Debug, Clone, Default)]
pub struct EngineDump {
    pub devices: Vec<DevDump>,
    pub streams: Vec<StreamDump>,
}

struct OpenDev {
    iodev: Box<Iodev>,
    streams: Vec<DevStream>,
    next_wake: Instant,
    last_severe_warn: Option<Instant>,
}

impl OpenDev {
    /// Level the device is kept near: the smallest attached callback
    /// threshold, or a quarter buffer when idle.
    fn target_level(&self) -> u32 {
        let buffer = self.iodev.buffer_size();
        let cap = (buffer / 2).max(1);
        self.streams
            .iter()
            .map(|ds| ds.stream().cb_threshold)
            .min()
            .unwrap_or(buffer / 4)
            .clamp(MIN_SLEEP_FRAMES.min(cap), cap)
    }
}

struct Tap {
    loopback_index: u32,
    sender_index: u32,
}

struct PendingDrain {
    id: StreamId,
    deadline: Instant,
    reply: Sender<i32>,
}

fn frames_to_duration(frames: u32, rate: u32) -> Duration {
    Duration::from_nanos(frames as u64 * 1_000_000_000 / rate.max(1) as u64)
}

fn errno_of(err: &Error) -> Option<i32> {
    match err {
        Error::Io(io) => io.raw_os_error(),
        #[cfg(feature = "alsa")]
        Error::Alsa(e) => Some(e.errno()),
        _ => None,
    }
}

/// EPIPE (xrun) and ESTRPIPE (suspend) self-heal through the backend's
/// recovery path; everything else removes the device.
fn error_is_recoverable(err: &Error) -> bool {
    matches!(errno_of(err), Some(e) if e == libc::EPIPE || e == libc::ESTRPIPE)
}

fn promote_to_rt(priority: i32) {
    // SAFETY: plain syscall on the current thread with a stack-local param.
    let rc = unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        libc::sched_setscheduler(0, libc::SCHED_RR, &param)
    };
    if rc != 0 {
        debug!("engine thread keeps normal scheduling (no RT permission)");
    }
}

struct Engine {
    rx: Receiver<EngineCommand>,
    event_tx: Sender<ObserverEvent>,
    config: EngineConfig,
    devices: Vec<OpenDev>,
    taps: Vec<Tap>,
    drains: Vec<PendingDrain>,
    /// Final-mix copy handed to loopback taps; sized to the largest device
    /// window when devices are added.
    tap_scratch: Vec<u8>,
    suspended: bool,
}

impl Engine {
    fn run(mut self) {
        if let Some(priority) = self.config.rt_priority {
            promote_to_rt(priority);
        }
        info!("audio engine thread running");
        loop {
            let wait = self.next_deadline_wait();
            match self.rx.recv_timeout(wait) {
                Ok(cmd) => {
                    if !self.handle_command(cmd) {
                        break;
                    }
                    // Take whatever else queued up before touching devices.
                    loop {
                        match self.rx.try_recv() {
                            Ok(cmd) => {
                                if !self.handle_command(cmd) {
                                    return;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !self.suspended {
                self.service_due_devices();
            }
            self.resolve_drains();
        }
        info!("audio engine thread exiting");
    }

    fn next_deadline_wait(&self) -> Duration {
        if self.suspended {
            return IDLE_WAIT;
        }
        let now = Instant::now();
        self.devices
            .iter()
            .map(|d| d.next_wake.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_WAIT)
    }

    /// Returns false when the engine should exit.
    fn handle_command(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::AddDevice(iodev) => self.add_device(iodev),
            EngineCommand::RemoveDevice { index, reply } => {
                let dev = self.remove_device(index);
                let _ = reply.send(dev);
            }
            EngineCommand::AddStream { stream, dev_indices } => {
                self.add_stream(stream, &dev_indices);
            }
            EngineCommand::RemoveStream { id } => self.remove_stream(id),
            EngineCommand::SetActiveNode { index, node_index } => {
                if let Some(dev) = self.dev_mut(index) {
                    dev.iodev.update_active_node(node_index);
                }
            }
            EngineCommand::RegisterTap {
                loopback_index,
                sender_index,
            } => self.register_tap(loopback_index, sender_index),
            EngineCommand::UnregisterTap { loopback_index } => {
                self.taps.retain(|t| t.loopback_index != loopback_index);
                if let Some(dev) = self.dev_mut(loopback_index) {
                    if let Some(lb) = dev.iodev.as_loopback_mut() {
                        lb.set_started(false);
                    }
                }
            }
            EngineCommand::Drain { id, deadline, reply } => {
                self.drains.push(PendingDrain { id, deadline, reply });
            }
            EngineCommand::Suspend => {
                self.suspended = true;
                for dev in self.devices.iter_mut() {
                    dev.iodev.suspend();
                }
                let _ = self
                    .event_tx
                    .send(ObserverEvent::SuspendChanged { suspended: true });
            }
            EngineCommand::Resume => {
                self.suspended = false;
                let now = Instant::now();
                for dev in self.devices.iter_mut() {
                    if let Err(err) = dev.iodev.resume() {
                        warn!(dev = dev.iodev.index(), %err, "resume failed");
                    }
                    dev.next_wake = now;
                }
                let _ = self
                    .event_tx
                    .send(ObserverEvent::SuspendChanged { suspended: false });
            }
            EngineCommand::Dump { reply } => {
                let _ = reply.send(self.dump());
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    fn dev_mut(&mut self, index: u32) -> Option<&mut OpenDev> {
        self.devices.iter_mut().find(|d| d.iodev.index() == index)
    }

    fn add_device(&mut self, iodev: Box<Iodev>) {
        if iodev.state() == DevState::Closed {
            warn!(dev = iodev.index(), "refusing to add closed device");
            return;
        }
        let window_bytes = iodev.buffer_size() as usize
            * iodev.format().map(|f| f.frame_bytes()).unwrap_or(4);
        if window_bytes > self.tap_scratch.len() {
            self.tap_scratch.resize(window_bytes, 0);
        }
        debug!(dev = iodev.index(), dir = ?iodev.direction(), "device added");
        self.devices.push(OpenDev {
            iodev,
            streams: Vec::new(),
            next_wake: Instant::now(),
            last_severe_warn: None,
        });
    }

    fn remove_device(&mut self, index: u32) -> Option<Box<Iodev>> {
        let pos = self.devices.iter().position(|d| d.iodev.index() == index)?;
        let mut dev = self.devices.remove(pos);
        self.taps.retain(|t| t.loopback_index != index);
        for tap in self.taps.iter().filter(|t| t.sender_index == index) {
            // Sender gone; its loopbacks fall back to silence synthesis.
            if let Some(ld) = self
                .devices
                .iter_mut()
                .find(|d| d.iodev.index() == tap.loopback_index)
            {
                if let Some(lb) = ld.iodev.as_loopback_mut() {
                    lb.set_started(false);
                }
            }
        }
        dev.iodev.close();
        debug!(dev = index, "device removed");
        Some(dev.iodev)
    }

    fn add_stream(&mut self, stream: Arc<Stream>, dev_indices: &[u32]) {
        let direction = stream.direction;
        for &index in dev_indices {
            let Some(dev) = self.dev_mut(index) else {
                warn!(dev = index, stream = %stream.id, "attach to unknown device");
                continue;
            };
            if dev.iodev.direction() != direction {
                continue;
            }
            let Some(fmt) = dev.iodev.format().copied() else { continue };
            let max_frames = dev.iodev.buffer_size() as usize;
            if dev.streams.is_empty() {
                let _ = dev.iodev.no_stream(false);
            }
            dev.streams
                .push(DevStream::new(stream.clone(), fmt, max_frames));
            dev.next_wake = Instant::now();
        }
        let count = self.stream_count(direction);
        let _ = self.event_tx.send(ObserverEvent::NumActiveStreamsChanged {
            direction,
            count,
        });
    }

    fn remove_stream(&mut self, id: StreamId) {
        let mut direction = None;
        for dev in self.devices.iter_mut() {
            let before = dev.streams.len();
            dev.streams.retain(|ds| {
                if ds.stream().id == id {
                    direction = Some(ds.stream().direction);
                    false
                } else {
                    true
                }
            });
            if before > 0 && dev.streams.is_empty() {
                let _ = dev.iodev.no_stream(true);
            }
        }
        let _ = self.event_tx.send(ObserverEvent::StreamRemoved { stream_id: id });
        if let Some(direction) = direction {
            let count = self.stream_count(direction);
            let _ = self.event_tx.send(ObserverEvent::NumActiveStreamsChanged {
                direction,
                count,
            });
        }
    }

    fn stream_count(&self, direction: Direction) -> u32 {
        let mut seen: SmallVec<[StreamId; 16]> = SmallVec::new();
        for dev in self.devices.iter() {
            for ds in dev.streams.iter() {
                let stream = ds.stream();
                if stream.direction == direction && !seen.contains(&stream.id) {
                    seen.push(stream.id);
                }
            }
        }
        seen.len() as u32
    }

    fn register_tap(&mut self, loopback_index: u32, sender_index: u32) {
        self.taps.retain(|t| t.loopback_index != loopback_index);
        let sender_running = self
            .devices
            .iter()
            .any(|d| d.iodev.index() == sender_index && d.iodev.state() == DevState::Running);
        self.taps.push(Tap {
            loopback_index,
            sender_index,
        });
        if let Some(dev) = self.dev_mut(loopback_index) {
            if let Some(lb) = dev.iodev.as_loopback_mut() {
                lb.set_started(sender_running);
            }
        }
    }

    fn service_due_devices(&mut self) {
        let now = Instant::now();
        let mut due: SmallVec<[(Instant, u32); 8]> = SmallVec::new();
        for dev in self.devices.iter() {
            if dev.next_wake <= now {
                due.push((dev.next_wake, dev.iodev.index()));
            }
        }
        // Strict deadline order across devices. Positions are re-resolved
        // per device: servicing can remove a failed entry.
        due.sort_by_key(|(wake, _)| *wake);
        for (_, index) in due {
            let Some(i) = self.devices.iter().position(|d| d.iodev.index() == index) else {
                continue;
            };
            match self.devices[i].iodev.direction() {
                Direction::Output => self.service_output(i, now),
                Direction::Input => self.service_input(i, now),
            }
        }
    }

    fn service_output(&mut self, i: usize, now: Instant) {
        let severe_threshold = self.config.severe_underrun_frames;
        let dev = &mut self.devices[i];
        let Some(fmt) = dev.iodev.format().copied() else { return };
        let rate = fmt.frame_rate;
        let buffer = dev.iodev.buffer_size();

        let mut queued = match dev.iodev.frames_queued() {
            Ok(q) => q,
            Err(err) => return self.handle_dev_error(i, err),
        };

        // Lost more time than the buffer covers: re-prime from silence.
        if queued > buffer + severe_threshold {
            let index = dev.iodev.index();
            if dev
                .last_severe_warn
                .map_or(true, |t| now.duration_since(t) >= SEVERE_WARN_INTERVAL)
            {
                warn!(dev = index, queued, buffer, "severe underrun, re-priming");
                dev.last_severe_warn = Some(now);
            }
            let _ = self.event_tx.send(ObserverEvent::SevereUnderrun { dev_index: index });
            if let Err(err) = dev.iodev.recover() {
                return self.handle_dev_error(i, err);
            }
            queued = 0;
        }

        let dev = &mut self.devices[i];
        if dev.streams.is_empty() {
            // Nothing to mix; idle at half-buffer cadence rather than
            // committing silence that would sit ahead of a future stream.
            dev.next_wake = now + frames_to_duration(buffer / 2, rate);
            return;
        }
        let target = dev.target_level();
        let free = buffer - queued.min(buffer);
        let fill_target = (target * 2).min(buffer);
        let to_fill = free.min(fill_target.saturating_sub(queued));

        let mut committed = 0u32;
        if to_fill > 0 {
            let fb = fmt.frame_bytes();
            let shared = dev.iodev.shared().clone();
            let (window, got) = match dev.iodev.get_buffer(to_fill) {
                Ok(pair) => pair,
                Err(err) => return self.handle_dev_error(i, err),
            };
            debug_assert!(got <= free);
            let window_bytes = got as usize * fb;

            for ds in dev.streams.iter_mut() {
                let scale = ds.stream().volume_scaler();
                let src = ds.fetch(got as usize);
                mix::mix_add(fmt.sample_format, &mut window[..window_bytes], src, scale);
            }

            let scaler = shared.softvol_scaler();
            if shared.muted() {
                mix::fill_silence(&mut window[..window_bytes]);
            } else if scaler != 1.0 {
                mix::scale_buffer(fmt.sample_format, &mut window[..window_bytes], scaler);
            }
            if shared.swap_lr() && fmt.num_channels == 2 {
                mix::swap_lr(fmt.sample_format, &mut window[..window_bytes]);
            }

            // Taps see the finished mix exactly as committed.
            self.tap_scratch[..window_bytes].copy_from_slice(&window[..window_bytes]);

            let dev = &mut self.devices[i];
            if let Err(err) = dev.iodev.put_buffer(got) {
                if error_is_recoverable(&err) {
                    let index = dev.iodev.index();
                    debug!(dev = index, %err, "recoverable backend error");
                    let _ = self.event_tx.send(ObserverEvent::Underrun { dev_index: index });
                    if let Err(err) = dev.iodev.recover() {
                        return self.handle_dev_error(i, err);
                    }
                    dev.next_wake = now + frames_to_duration(MIN_SLEEP_FRAMES, rate);
                    self.set_tap_senders_started(index, false);
                    return;
                }
                return self.handle_dev_error(i, err);
            }
            committed = got;
            self.feed_taps(i, window_bytes);
        }

        let dev = &mut self.devices[i];
        let level = queued + committed;
        if dev.iodev.state() == DevState::Open && level >= target {
            let index = dev.iodev.index();
            if let Err(err) = dev.iodev.start() {
                return self.handle_dev_error(i, err);
            }
            self.set_tap_senders_started(index, true);
        }

        let dev = &mut self.devices[i];
        let sleep_frames = level.saturating_sub(target).max(MIN_SLEEP_FRAMES);
        dev.next_wake = now + frames_to_duration(sleep_frames, rate);
    }

    fn service_input(&mut self, i: usize, now: Instant) {
        let dev = &mut self.devices[i];
        let Some(fmt) = dev.iodev.format().copied() else { return };
        let rate = fmt.frame_rate;
        let target = dev.target_level();

        if dev.streams.is_empty() {
            dev.next_wake = now + frames_to_duration(dev.iodev.buffer_size() / 2, rate);
            return;
        }

        if dev.iodev.state() == DevState::Open {
            if let Err(err) = dev.iodev.start() {
                return self.handle_dev_error(i, err);
            }
        }

        let queued = match dev.iodev.frames_queued() {
            Ok(q) => q,
            Err(err) => return self.handle_dev_error(i, err),
        };

        if queued > 0 {
            let fb = fmt.frame_bytes();
            let (window, got) = match dev.iodev.get_buffer(queued) {
                Ok(pair) => pair,
                Err(err) => return self.handle_dev_error(i, err),
            };
            let window_bytes = got as usize * fb;
            if got > 0 {
                for ds in dev.streams.iter_mut() {
                    ds.capture(&window[..window_bytes]);
                }
            }
            let dev = &mut self.devices[i];
            if let Err(err) = dev.iodev.put_buffer(got) {
                if error_is_recoverable(&err) {
                    let index = dev.iodev.index();
                    let _ = self.event_tx.send(ObserverEvent::Underrun { dev_index: index });
                    if let Err(err) = dev.iodev.recover() {
                        return self.handle_dev_error(i, err);
                    }
                } else {
                    return self.handle_dev_error(i, err);
                }
            }
        }

        let dev = &mut self.devices[i];
        dev.next_wake = now + frames_to_duration(target.max(MIN_SLEEP_FRAMES), rate);
    }

    /// Push the finished mix of `self.devices[i]` into every loopback
    /// registered against it.
    fn feed_taps(&mut self, i: usize, window_bytes: usize) {
        let sender_index = self.devices[i].iodev.index();
        for t in 0..self.taps.len() {
            if self.taps[t].sender_index != sender_index {
                continue;
            }
            let loopback_index = self.taps[t].loopback_index;
            if let Some(dev) = self
                .devices
                .iter_mut()
                .find(|d| d.iodev.index() == loopback_index)
            {
                if let Some(lb) = dev.iodev.as_loopback_mut() {
                    lb.push_samples(&self.tap_scratch[..window_bytes]);
                }
            }
        }
    }

    fn set_tap_senders_started(&mut self, sender_index: u32, started: bool) {
        for t in 0..self.taps.len() {
            if self.taps[t].sender_index != sender_index {
                continue;
            }
            let loopback_index = self.taps[t].loopback_index;
            if let Some(dev) = self
                .devices
                .iter_mut()
                .find(|d| d.iodev.index() == loopback_index)
            {
                if let Some(lb) = dev.iodev.as_loopback_mut() {
                    lb.set_started(started);
                }
            }
        }
    }

    fn handle_dev_error(&mut self, i: usize, err: Error) {
        if error_is_recoverable(&err) {
            let index = self.devices[i].iodev.index();
            debug!(dev = index, %err, "recovering device");
            let _ = self.event_tx.send(ObserverEvent::Underrun { dev_index: index });
            if self.devices[i].iodev.recover().is_ok() {
                self.set_tap_senders_started(index, false);
                self.devices[i].next_wake = Instant::now() + Duration::from_millis(1);
                return;
            }
        }
        let index = self.devices[i].iodev.index();
        warn!(dev = index, %err, "device failed, removing");
        let mut dev = self.devices.remove(i);
        dev.iodev.close();
        self.taps.retain(|t| t.loopback_index != index);
        let _ = self.event_tx.send(ObserverEvent::DeviceRemoved { dev_index: index });
    }

    fn resolve_drains(&mut self) {
        if self.drains.is_empty() {
            return;
        }
        let now = Instant::now();
        let devices = &self.devices;
        self.drains.retain(|drain| {
            let mut attached = false;
            let mut level = 0;
            for dev in devices.iter() {
                for ds in dev.streams.iter() {
                    if ds.stream().id == drain.id {
                        attached = true;
                        level = ds.stream().shm().level();
                    }
                }
            }
            if !attached || level == 0 {
                let _ = drain.reply.send(0);
                return false;
            }
            if now >= drain.deadline {
                let _ = drain.reply.send(-libc::ETIMEDOUT);
                return false;
            }
            true
        });
    }

    fn dump(&self) -> EngineDump {
        let mut dump = EngineDump::default();
        for dev in self.devices.iter() {
            dump.devices.push(DevDump {
                index: dev.iodev.index(),
                name: dev.iodev.shared().name.clone(),
                direction: dev.iodev.direction(),
                state: dev.iodev.state(),
                format: dev.iodev.format().copied(),
                buffer_size: dev.iodev.buffer_size(),
                num_streams: dev.streams.len(),
            });
        }
        for dev in self.devices.iter() {
            for ds in dev.streams.iter() {
                let stream = ds.stream();
                if let Some(existing) = dump.streams.iter_mut().find(|s| s.id == stream.id) {
                    existing.attached_devs.push(dev.iodev.index());
                    continue;
                }
                dump.streams.push(StreamDump {
                    id: stream.id,
                    direction: stream.direction,
                    attached_devs: vec![dev.iodev.index()],
                    level: stream.shm().level(),
                    underruns: stream.underruns(),
                    overruns: stream.overruns(),
                });
            }
        }
        dump
    }
}

/// Control-plane handle to the engine thread.
pub struct EngineHandle {
    tx: Sender<EngineCommand>,
    events: Option<Receiver<ObserverEvent>>,
    join: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Spawn the engine thread.
    pub fn spawn(config: EngineConfig) -> EngineHandle {
        let (tx, rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let engine = Engine {
            rx,
            event_tx,
            config,
            devices: Vec::new(),
            taps: Vec::new(),
            drains: Vec::new(),
            tap_scratch: Vec::new(),
            suspended: false,
        };
        let join = std::thread::Builder::new()
            .name("concerto-engine".into())
            .spawn(move || engine.run())
            .ok();
        EngineHandle {
            tx,
            events: Some(event_rx),
            join,
        }
    }

    /// Engine-originated events; may be taken once by the control thread.
    pub fn take_events(&mut self) -> Option<Receiver<ObserverEvent>> {
        self.events.take()
    }

    fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::EngineDown)
    }

    pub fn add_device(&self, dev: Box<Iodev>) -> Result<()> {
        self.send(EngineCommand::AddDevice(dev))
    }

    /// Synchronous: blocks the caller (never the engine) on the reply.
    pub fn remove_device(&self, index: u32, timeout: Duration) -> Result<Option<Box<Iodev>>> {
        let (reply, rx) = bounded(1);
        self.send(EngineCommand::RemoveDevice { index, reply })?;
        rx.recv_timeout(timeout).map_err(|_| Error::EngineDown)
    }

    pub fn add_stream(&self, stream: Arc<Stream>, dev_indices: Vec<u32>) -> Result<()> {
        self.send(EngineCommand::AddStream { stream, dev_indices })
    }

    pub fn remove_stream(&self, id: StreamId) -> Result<()> {
        self.send(EngineCommand::RemoveStream { id })
    }

    pub fn set_active_node(&self, index: u32, node_index: u32) -> Result<()> {
        self.send(EngineCommand::SetActiveNode { index, node_index })
    }

    pub fn register_tap(&self, loopback_index: u32, sender_index: u32) -> Result<()> {
        self.send(EngineCommand::RegisterTap {
            loopback_index,
            sender_index,
        })
    }

    pub fn unregister_tap(&self, loopback_index: u32) -> Result<()> {
        self.send(EngineCommand::UnregisterTap { loopback_index })
    }

    /// Block until the stream drains or `timeout` passes. Returns 0 or a
    /// negative errno.
    pub fn drain_stream(&self, id: StreamId, timeout: Duration) -> i32 {
        let (reply, rx) = bounded(1);
        let deadline = Instant::now() + timeout;
        if self
            .send(EngineCommand::Drain { id, deadline, reply })
            .is_err()
        {
            return -libc::EPIPE;
        }
        rx.recv_timeout(timeout + Duration::from_millis(50))
            .unwrap_or(-libc::ETIMEDOUT)
    }

    pub fn suspend(&self) -> Result<()> {
        self.send(EngineCommand::Suspend)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(EngineCommand::Resume)
    }

    pub fn dump(&self, timeout: Duration) -> Result<EngineDump> {
        let (reply, rx) = bounded(1);
        self.send(EngineCommand::Dump { reply })?;
        rx.recv_timeout(timeout).map_err(|_| Error::EngineDown)
    }

    /// Stop the engine and join the thread.
    pub fn shutdown(mut self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.tx.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iodev::{Backend, TestBackend};
    use crate::stream::StreamParams;
    use concerto_proto::{ClientType, SampleFormat, StreamType};

    fn test_config() -> EngineConfig {
        EngineConfig {
            severe_underrun_frames: 480,
            rt_priority: None,
        }
    }

    fn output_dev(index: u32) -> Box<Iodev> {
        let mut dev = Box::new(Iodev::new(
            index,
            format!("test-out-{index}"),
            Direction::Output,
            Backend::Test(TestBackend::new_output()),
        ));
        dev.open(None).unwrap();
        dev
    }

    fn make_stream(id: StreamId, direction: Direction) -> Arc<Stream> {
        Arc::new(
            Stream::new(StreamParams {
                id,
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

    fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_playback_reaches_backend() {
        let handle = EngineHandle::spawn(test_config());
        handle.add_device(output_dev(1)).unwrap();

        let stream = make_stream(StreamId::new(1, 0), Direction::Output);
        let frames: Vec<u8> = (0..480u32)
            .flat_map(|i| {
                let s = (i % 1000) as i16;
                let b = s.to_le_bytes();
                [b[0], b[1], b[0], b[1]]
            })
            .collect();
        stream.shm().copy_in(&frames);
        stream.shm().advance_write(480);

        handle.add_stream(stream.clone(), vec![1]).unwrap();
        assert!(wait_for(|| stream.shm().level() == 0, Duration::from_secs(2)));

        // The device was closed on removal, but the recorded commits
        // survive on the backend.
        let mut dev = handle
            .remove_device(1, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        let committed = dev.as_test_mut().unwrap().committed();
        assert_eq!(&committed[..frames.len()], &frames[..]);
        handle.shutdown();
    }

    #[test]
    fn test_stream_count_returns_to_zero() {
        let handle = EngineHandle::spawn(test_config());
        handle.add_device(output_dev(1)).unwrap();
        let stream = make_stream(StreamId::new(1, 0), Direction::Output);
        handle.add_stream(stream, vec![1]).unwrap();
        assert!(wait_for(
            || handle
                .dump(Duration::from_secs(1))
                .map(|d| d.streams.len() == 1)
                .unwrap_or(false),
            Duration::from_secs(1)
        ));
        handle.remove_stream(StreamId::new(1, 0)).unwrap();
        assert!(wait_for(
            || handle
                .dump(Duration::from_secs(1))
                .map(|d| d.streams.is_empty())
                .unwrap_or(false),
            Duration::from_secs(1)
        ));
        handle.shutdown();
    }

    #[test]
    fn test_drain_empty_stream_resolves_immediately() {
        let handle = EngineHandle::spawn(test_config());
        handle.add_device(output_dev(1)).unwrap();
        let stream = make_stream(StreamId::new(1, 0), Direction::Output);
        handle.add_stream(stream, vec![1]).unwrap();
        assert_eq!(
            handle.drain_stream(StreamId::new(1, 0), Duration::from_millis(500)),
            0
        );
        handle.shutdown();
    }

    #[test]
    fn test_drain_unknown_stream_resolves_zero() {
        let handle = EngineHandle::spawn(test_config());
        assert_eq!(
            handle.drain_stream(StreamId::new(9, 9), Duration::from_millis(200)),
            0
        );
        handle.shutdown();
    }

    #[test]
    fn test_capture_flows_to_stream() {
        let handle = EngineHandle::spawn(test_config());
        let mut dev = Box::new(Iodev::new(
            2,
            "test-in",
            Direction::Input,
            Backend::Test(TestBackend::new_input()),
        ));
        dev.open(None).unwrap();
        dev.as_test_mut()
            .unwrap()
            .push_capture_data(&[1u8; 4 * 100]);
        handle.add_device(dev).unwrap();

        let stream = make_stream(StreamId::new(1, 1), Direction::Input);
        handle.add_stream(stream.clone(), vec![2]).unwrap();
        assert!(wait_for(
            || stream.shm().level() >= 100,
            Duration::from_secs(2)
        ));
        handle.shutdown();
    }

    #[test]
    fn test_severe_underrun_triggers_recover() {
        let mut handle = EngineHandle::spawn(test_config());
        let events = handle.take_events().unwrap();
        let mut dev = output_dev(3);
        let buffer = dev.buffer_size();
        // One frame past the boundary: recovery must fire.
        dev.as_test_mut().unwrap().set_frames_queued(buffer + 481);
        handle.add_device(dev).unwrap();

        assert!(wait_for(
            || events
                .try_iter()
                .any(|e| matches!(e, ObserverEvent::SevereUnderrun { dev_index: 3 })),
            Duration::from_secs(1)
        ));

        let mut dev = handle
            .remove_device(3, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert!(dev.as_test_mut().unwrap().recover_count() >= 1);
        handle.shutdown();
    }

    #[test]
    fn test_severe_underrun_boundary_accepted() {
        let handle = EngineHandle::spawn(test_config());
        let mut dev = output_dev(4);
        let buffer = dev.buffer_size();
        // Exactly at the boundary: no recovery.
        dev.as_test_mut().unwrap().set_frames_queued(buffer + 480);
        handle.add_device(dev).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let mut dev = handle
            .remove_device(4, Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(dev.as_test_mut().unwrap().recover_count(), 0);
        handle.shutdown();
    }

    #[test]
    fn test_fatal_error_removes_device() {
        let mut handle = EngineHandle::spawn(test_config());
        let events = handle.take_events().unwrap();
        let mut dev = output_dev(5);
        dev.as_test_mut().unwrap().inject_errno(libc::ENODEV);
        handle.add_device(dev).unwrap();
        let stream = make_stream(StreamId::new(1, 0), Direction::Output);
        stream.shm().fill_silence(480);
        stream.shm().advance_write(480);
        handle.add_stream(stream, vec![5]).unwrap();

        assert!(wait_for(
            || events
                .try_iter()
                .any(|e| matches!(e, ObserverEvent::DeviceRemoved { dev_index: 5 })),
            Duration::from_secs(1)
        ));
        handle.shutdown();
    }
}
