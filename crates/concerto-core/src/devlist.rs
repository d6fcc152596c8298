//! Device list and stream routing.
//!
//! The list is owned by the control thread and guarded by a mutex the
//! engine never takes; devices themselves live on the engine thread and are
//! reached through [`EngineHandle`] commands. Each direction keeps an
//! insertion-ordered set of enabled devices, with the primary at the front,
//! and falls back to the built-in empty device whenever the last real
//! endpoint disappears, so attached streams always have somewhere to live.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use concerto_proto::{AudioFormat, Direction, NodeId, StreamId};

use crate::engine::EngineHandle;
use crate::error::{Error, Result};
use crate::iodev::{Backend, EmptyBackend, Iodev, LoopbackBackend, LoopbackType};
use crate::node::{Node, NodeType};
use crate::observer::{ObserverEvent, ObserverRegistry};
use crate::stream::Stream;

const ENGINE_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

struct DevEntry {
    index: u32,
    name: String,
    direction: Direction,
    /// Per-cycle knobs shared with the engine; valid wherever the device
    /// object currently lives.
    shared: Arc<crate::iodev::DevShared>,
    nodes: Vec<Node>,
    active_node: usize,
    /// The device object while it is not on the engine thread.
    parked: Option<Box<Iodev>>,
    open: bool,
    is_empty_dev: bool,
    is_a2dp: bool,
    loopback: Option<LoopbackType>,
}

impl DevEntry {
    fn active_node(&self) -> Option<&Node> {
        self.nodes.get(self.active_node)
    }
}

struct StreamEntry {
    stream: Arc<Stream>,
    attached: Vec<u32>,
}

struct TapEntry {
    loopback_index: u32,
    sender_index: Option<u32>,
}

struct Inner {
    devices: Vec<DevEntry>,
    next_index: u32,
    enabled_output: Vec<u32>,
    enabled_input: Vec<u32>,
    streams: HashMap<StreamId, StreamEntry>,
    stream_order: Vec<StreamId>,
    taps: Vec<TapEntry>,
    system_volume: u8,
}

impl Inner {
    fn enabled(&self, direction: Direction) -> &Vec<u32> {
        match direction {
            Direction::Output => &self.enabled_output,
            Direction::Input => &self.enabled_input,
        }
    }

    fn enabled_mut(&mut self, direction: Direction) -> &mut Vec<u32> {
        match direction {
            Direction::Output => &mut self.enabled_output,
            Direction::Input => &mut self.enabled_input,
        }
    }

    fn entry(&self, index: u32) -> Option<&DevEntry> {
        self.devices.iter().find(|d| d.index == index)
    }

    fn entry_mut(&mut self, index: u32) -> Option<&mut DevEntry> {
        self.devices.iter_mut().find(|d| d.index == index)
    }

    fn empty_dev_index(&self, direction: Direction) -> Option<u32> {
        self.devices
            .iter()
            .find(|d| d.is_empty_dev && d.direction == direction)
            .map(|d| d.index)
    }

    /// Format hint for opening a device: the first stream headed there.
    fn open_hint(&self, direction: Direction, index: u32) -> Option<AudioFormat> {
        self.stream_order.iter().find_map(|id| {
            let entry = self.streams.get(id)?;
            if entry.stream.direction != direction {
                return None;
            }
            match entry.stream.pinned_dev {
                Some(pin) if pin == index => Some(entry.stream.format),
                Some(_) => None,
                None => Some(entry.stream.format),
            }
        })
    }
}

/// The routing brain, shared between the control thread and event pump.
pub struct DeviceList {
    inner: Mutex<Inner>,
    engine: Arc<EngineHandle>,
    observer: Arc<ObserverRegistry>,
}

impl DeviceList {
    /// Build the list with its two always-present empty devices enabled.
    pub fn new(engine: Arc<EngineHandle>, observer: Arc<ObserverRegistry>) -> Result<DeviceList> {
        let list = DeviceList {
            inner: Mutex::new(Inner {
                devices: Vec::new(),
                next_index: 1,
                enabled_output: Vec::new(),
                enabled_input: Vec::new(),
                streams: HashMap::new(),
                stream_order: Vec::new(),
                taps: Vec::new(),
                system_volume: 100,
            }),
            engine,
            observer,
        };
        {
            let mut inner = list.inner.lock();
            for direction in [Direction::Output, Direction::Input] {
                let name = match direction {
                    Direction::Output => "Silent Playback",
                    Direction::Input => "Silent Capture",
                };
                let backend = match direction {
                    Direction::Output => Backend::Empty(EmptyBackend::new_output()),
                    Direction::Input => Backend::Empty(EmptyBackend::new_input()),
                };
                let node = Node::new(name, NodeType::Empty).plugged(true);
                let index = list.insert_device(&mut inner, name, direction, backend, vec![node], true, None);
                list.enable_locked(&mut inner, index)?;
            }
        }
        Ok(list)
    }

    fn insert_device(
        &self,
        inner: &mut Inner,
        name: &str,
        direction: Direction,
        backend: Backend,
        nodes: Vec<Node>,
        is_empty_dev: bool,
        loopback: Option<LoopbackType>,
    ) -> u32 {
        let index = inner.next_index;
        inner.next_index += 1;
        let is_a2dp = matches!(backend, Backend::A2dp(_));
        let iodev = Box::new(Iodev::new(index, name, direction, backend));
        let shared = iodev.shared().clone();
        inner.devices.push(DevEntry {
            index,
            name: name.to_string(),
            direction,
            shared,
            nodes,
            active_node: 0,
            parked: Some(iodev),
            open: false,
            is_empty_dev,
            is_a2dp,
            loopback,
        });
        index
    }

    /// Register a new device. It stays parked until a node on it is
    /// selected (or a stream pins it). Only one A2DP device exists at a
    /// time: adding a second destroys the older one.
    pub fn add_device(
        &self,
        name: &str,
        direction: Direction,
        backend: Backend,
        nodes: Vec<Node>,
    ) -> u32 {
        if matches!(backend, Backend::A2dp(_)) {
            let older = self
                .inner
                .lock()
                .devices
                .iter()
                .find(|d| d.is_a2dp)
                .map(|d| d.index);
            if let Some(older) = older {
                info!(dev = older, "replacing older A2DP device");
                let _ = self.remove_device(older);
            }
        }
        let mut inner = self.inner.lock();
        let index = self.insert_device(&mut inner, name, direction, backend, nodes, false, None);
        drop(inner);
        info!(dev = index, name, ?direction, "device registered");
        self.observer.notify(ObserverEvent::NodesChanged);
        index
    }

    /// Create one of the three loopback tap devices.
    pub fn add_loopback_device(&self, loopback_type: LoopbackType) -> u32 {
        let mut inner = self.inner.lock();
        let name = loopback_type.node_name();
        let node = Node::new(name, loopback_type.node_type()).plugged(true);
        let index = self.insert_device(
            &mut inner,
            name,
            Direction::Input,
            Backend::Loopback(LoopbackBackend::new(loopback_type)),
            vec![node],
            false,
            Some(loopback_type),
        );
        inner.taps.push(TapEntry {
            loopback_index: index,
            sender_index: None,
        });
        drop(inner);
        self.observer.notify(ObserverEvent::NodesChanged);
        index
    }

    /// Tear a device down. Enabled devices fall back to the direction's
    /// empty device and their streams are reattached there.
    pub fn remove_device(&self, index: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry(index).ok_or(Error::NoSuchDevice(index))?;
        if entry.is_empty_dev {
            return Err(Error::NoSuchDevice(index));
        }
        let direction = entry.direction;
        info!(dev = index, name = entry.name.as_str(), "removing device");
        let was_enabled = inner.enabled(direction).contains(&index);
        if was_enabled {
            self.disable_locked(&mut inner, index);
            self.ensure_fallback_locked(&mut inner, direction)?;
            self.reattach_unpinned_locked(&mut inner, direction)?;
            self.update_taps_locked(&mut inner);
        } else if let Some(pos) = inner.devices.iter().position(|d| d.index == index) {
            let entry = inner.devices.remove(pos);
            if entry.open {
                let _ = self.engine.remove_device(index, ENGINE_REPLY_TIMEOUT);
            }
        }
        inner.devices.retain(|d| d.index != index);
        inner.taps.retain(|t| t.loopback_index != index);
        drop(inner);
        self.observer.notify(ObserverEvent::NodesChanged);
        self.observer
            .notify(ObserverEvent::DeviceRemoved { dev_index: index });
        Ok(())
    }

    /// Engine reported the device dead: drop our record and reroute.
    pub fn on_device_failed(&self, index: u32) {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.devices.iter().position(|d| d.index == index) else {
            return;
        };
        let direction = inner.devices[pos].direction;
        inner.devices.remove(pos);
        inner.enabled_mut(direction).retain(|&i| i != index);
        inner.taps.retain(|t| t.loopback_index != index);
        if self.ensure_fallback_locked(&mut inner, direction).is_err() {
            warn!(dev = index, "no fallback device after failure");
        }
        let _ = self.reattach_unpinned_locked(&mut inner, direction);
        self.update_taps_locked(&mut inner);
        drop(inner);
        self.observer.notify(ObserverEvent::NodesChanged);
    }

    /// Make `node_id` the active endpoint of its direction: open the owning
    /// device, move unpinned streams over, fire the enabled/disabled hooks
    /// and keep the empty-device fallback invariant.
    pub fn add_active_node(&self, direction: Direction, node_id: NodeId) -> Result<()> {
        let index = node_id.dev_index();
        let mut inner = self.inner.lock();
        {
            let entry = inner.entry_mut(index).ok_or(Error::NoSuchDevice(index))?;
            if entry.direction != direction {
                return Err(Error::NoSuchNode(node_id));
            }
            let node_index = node_id.node_index() as usize;
            if node_index >= entry.nodes.len() {
                return Err(Error::NoSuchNode(node_id));
            }
            entry.active_node = node_index;
        }

        let previously_enabled: Vec<u32> = inner
            .enabled(direction)
            .iter()
            .copied()
            .filter(|&i| i != index)
            .collect();

        self.enable_locked(&mut inner, index)?;
        let _ = self.engine.set_active_node(index, node_id.node_index());
        for old in previously_enabled {
            self.disable_locked(&mut inner, old);
        }
        self.reattach_unpinned_locked(&mut inner, direction)?;
        self.push_volume_locked(&mut inner, index);
        self.update_taps_locked(&mut inner);
        drop(inner);

        self.observer.notify(ObserverEvent::ActiveNodeChanged {
            direction,
            node_id,
        });
        Ok(())
    }

    fn enable_locked(&self, inner: &mut Inner, index: u32) -> Result<()> {
        if inner.enabled_of(index).is_some() {
            // Already enabled; move it to the front.
            let entry = inner.entry(index).ok_or(Error::NoSuchDevice(index))?;
            let direction = entry.direction;
            let enabled = inner.enabled_mut(direction);
            enabled.retain(|&i| i != index);
            enabled.insert(0, index);
            return Ok(());
        }
        self.open_locked(inner, index)?;
        let direction = inner
            .entry(index)
            .ok_or(Error::NoSuchDevice(index))?
            .direction;
        inner.enabled_mut(direction).insert(0, index);

        // A real endpoint displaces the empty fallback.
        let is_real = inner.entry(index).map(|e| !e.is_empty_dev).unwrap_or(false);
        if is_real {
            if let Some(empty_idx) = inner.empty_dev_index(direction) {
                if inner.enabled(direction).contains(&empty_idx) {
                    self.disable_locked(inner, empty_idx);
                }
            }
        }
        debug!(dev = index, ?direction, "device enabled");
        Ok(())
    }

    /// Open the device and move it onto the engine thread.
    fn open_locked(&self, inner: &mut Inner, index: u32) -> Result<()> {
        let entry = inner.entry(index).ok_or(Error::NoSuchDevice(index))?;
        if entry.open {
            return Ok(());
        }
        let direction = entry.direction;
        let hint = inner.open_hint(direction, index);
        let entry = inner.entry_mut(index).ok_or(Error::NoSuchDevice(index))?;
        let mut iodev = entry.parked.take().ok_or(Error::NoSuchDevice(index))?;
        if let Err(err) = iodev.open(hint.as_ref()) {
            entry.parked = Some(iodev);
            return Err(err);
        }
        entry.open = true;
        self.engine.add_device(iodev)?;
        Ok(())
    }

    fn disable_locked(&self, inner: &mut Inner, index: u32) {
        let Some(entry) = inner.entry(index) else { return };
        let direction = entry.direction;
        inner.enabled_mut(direction).retain(|&i| i != index);
        if let Some(entry) = inner.entry_mut(index) {
            if entry.open {
                entry.open = false;
                match self.engine.remove_device(index, ENGINE_REPLY_TIMEOUT) {
                    Ok(Some(iodev)) => entry.parked = Some(iodev),
                    Ok(None) | Err(_) => warn!(dev = index, "device not returned by engine"),
                }
            }
        }
        debug!(dev = index, "device disabled");
    }

    /// Removing the last enabled device of a direction leaves exactly the
    /// empty device enabled there.
    fn ensure_fallback_locked(&self, inner: &mut Inner, direction: Direction) -> Result<()> {
        if !inner.enabled(direction).is_empty() {
            return Ok(());
        }
        let empty_idx = inner
            .empty_dev_index(direction)
            .ok_or(Error::NoSuchDevice(0))?;
        self.enable_locked(inner, empty_idx)
    }

    /// Reattach every unpinned stream of `direction` to the currently
    /// enabled devices. Pinned streams follow their pinned device only.
    fn reattach_unpinned_locked(&self, inner: &mut Inner, direction: Direction) -> Result<()> {
        let targets = inner.enabled(direction).clone();
        let order = inner.stream_order.clone();
        for id in order {
            let Some(entry) = inner.streams.get_mut(&id) else { continue };
            if entry.stream.direction != direction || entry.stream.pinned_dev.is_some() {
                continue;
            }
            if entry.attached == targets {
                continue;
            }
            self.engine.remove_stream(id)?;
            self.engine.add_stream(entry.stream.clone(), targets.clone())?;
            entry.attached = targets.clone();
            debug!(stream = %id, ?targets, "stream reattached");
        }
        Ok(())
    }

    fn update_taps_locked(&self, inner: &mut Inner) {
        let sender = inner.enabled_output.first().copied();
        for t in 0..inner.taps.len() {
            let loopback_index = inner.taps[t].loopback_index;
            let loopback_open = inner
                .entry(loopback_index)
                .map(|e| e.open && e.loopback.is_some())
                .unwrap_or(false);
            let wanted = if loopback_open { sender } else { None };
            if inner.taps[t].sender_index == wanted {
                continue;
            }
            let _ = self.engine.unregister_tap(loopback_index);
            if let Some(sender_index) = wanted {
                let _ = self.engine.register_tap(loopback_index, sender_index);
            }
            inner.taps[t].sender_index = wanted;
        }
    }

    /// Add a connected stream and attach it to the devices its direction
    /// and pinning imply.
    pub fn add_stream(&self, stream: Arc<Stream>) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = stream.id;
        if inner.streams.contains_key(&id) {
            return Err(Error::InvalidStream(format!("stream {id} already exists")));
        }
        let targets = match stream.pinned_dev {
            Some(pin) => {
                inner.entry(pin).ok_or(Error::NoSuchDevice(pin))?;
                self.open_locked(&mut inner, pin)?;
                vec![pin]
            }
            None => {
                let targets = inner.enabled(stream.direction).clone();
                if targets.is_empty() {
                    self.ensure_fallback_locked(&mut inner, stream.direction)?;
                    inner.enabled(stream.direction).clone()
                } else {
                    targets
                }
            }
        };
        self.engine.add_stream(stream.clone(), targets.clone())?;
        inner.streams.insert(id, StreamEntry { stream, attached: targets });
        inner.stream_order.push(id);
        Ok(())
    }

    pub fn remove_stream(&self, id: StreamId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.streams.remove(&id).ok_or(Error::NoSuchStream(id))?;
        inner.stream_order.retain(|&s| s != id);
        self.engine.remove_stream(id)
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<Stream>> {
        self.inner.lock().streams.get(&id).map(|e| e.stream.clone())
    }

    pub fn stream_ids_for_client(&self, client_id: u16) -> Vec<StreamId> {
        self.inner
            .lock()
            .stream_order
            .iter()
            .copied()
            .filter(|id| id.client_id() == client_id)
            .collect()
    }

    /// Streams of a direction, insertion-ordered, for reattach broadcasts.
    pub fn stream_ids_for_direction(&self, direction: Direction) -> Vec<StreamId> {
        let inner = self.inner.lock();
        inner
            .stream_order
            .iter()
            .copied()
            .filter(|id| {
                inner
                    .streams
                    .get(id)
                    .map(|e| e.stream.direction == direction && e.stream.pinned_dev.is_none())
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn enabled_devices(&self, direction: Direction) -> Vec<u32> {
        self.inner.lock().enabled(direction).clone()
    }

    /// Apply a node attribute change and republish the derived engine-side
    /// state.
    pub fn set_node_attr(
        &self,
        node_id: NodeId,
        attr: concerto_proto::NodeAttr,
        value: i32,
    ) -> Result<()> {
        use concerto_proto::NodeAttr;
        let index = node_id.dev_index();
        let mut inner = self.inner.lock();
        {
            let entry = inner.entry_mut(index).ok_or(Error::NoSuchDevice(index))?;
            let node = entry
                .nodes
                .get_mut(node_id.node_index() as usize)
                .ok_or(Error::NoSuchNode(node_id))?;
            match attr {
                NodeAttr::Plugged => node.plugged = value != 0,
                NodeAttr::Volume => node.volume = value.clamp(0, 100) as u8,
                NodeAttr::CaptureGain => node.capture_gain = value,
                NodeAttr::SwapLeftRight => node.left_right_swapped = value != 0,
            }
        }
        self.push_volume_locked(&mut inner, index);
        drop(inner);
        match attr {
            NodeAttr::Volume => self.observer.notify(ObserverEvent::NodeVolumeChanged {
                node_id,
                volume: value.clamp(0, 100) as u8,
            }),
            NodeAttr::SwapLeftRight => {
                self.observer.notify(ObserverEvent::NodeLeftRightSwapped {
                    node_id,
                    swapped: value != 0,
                })
            }
            _ => self.observer.notify(ObserverEvent::NodesChanged),
        }
        Ok(())
    }

    pub fn set_system_volume(&self, volume: u32) -> Result<()> {
        let volume = volume.min(100) as u8;
        let mut inner = self.inner.lock();
        inner.system_volume = volume;
        let outputs = inner.enabled_output.clone();
        for index in outputs {
            self.push_volume_locked(&mut inner, index);
        }
        drop(inner);
        self.observer.notify(ObserverEvent::OutputVolumeChanged {
            volume: volume as u32,
        });
        Ok(())
    }

    pub fn system_volume(&self) -> u8 {
        self.inner.lock().system_volume
    }

    /// Recompute the device's engine-visible volume state from its active
    /// node and the system volume.
    fn push_volume_locked(&self, inner: &mut Inner, index: u32) {
        let system_volume = inner.system_volume;
        let Some(entry) = inner.entry(index) else { return };
        let Some(node) = entry.active_node() else { return };
        let step = node.volume.min(system_volume);
        let scaler = node.volume_curve().scaler_at_step(step) * node.ui_gain_scaler;
        let software = node.software_volume_needed || entry.direction == Direction::Output;
        // The engine reads these without locking, wherever the device
        // object currently lives.
        entry.shared.set_softvol(software, scaler);
        entry.shared.set_swap_lr(node.left_right_swapped);
    }
}

impl Inner {
    fn enabled_of(&self, index: u32) -> Option<Direction> {
        if self.enabled_output.contains(&index) {
            Some(Direction::Output)
        } else if self.enabled_input.contains(&index) {
            Some(Direction::Input)
        } else {
            None
        }
    }
}
