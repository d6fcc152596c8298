//! Logical endpoints on a device.

use arc_swap::ArcSwap;
use std::sync::Arc;

use crate::volume::VolumeCurve;

/// What kind of endpoint a node is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Speaker,
    Headphone,
    Hdmi,
    Usb,
    Mic,
    InternalMic,
    Bluetooth,
    /// Loopback of the output mix before any processing.
    PostMixPreDsp,
    /// Loopback of the processed output mix.
    PostDsp,
    /// Processed loopback with a hardware-like initial delay.
    PostDspDelayed,
    /// Node of the fallback silence device.
    Empty,
    Unknown,
}

/// Stable identity derived from a node name. FNV-1a, so the id is a pure
/// function of the name and survives re-enumeration.
pub fn stable_id(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for b in name.as_bytes() {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// One logical endpoint of a device. Owned by the device list; the engine
/// sees only the derived scaler/mute state published through
/// [`crate::iodev::DevShared`].
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub node_type: NodeType,
    pub plugged: bool,
    /// User volume step, 0..=100.
    pub volume: u8,
    /// Capture gain in centi-dB, input nodes only.
    pub capture_gain: i32,
    pub ui_gain_scaler: f32,
    pub left_right_swapped: bool,
    pub software_volume_needed: bool,
    pub stable_id: u32,
    volume_curve: Arc<ArcSwap<VolumeCurve>>,
}

impl Node {
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Node {
        let name = name.into();
        let stable_id = stable_id(&name);
        Node {
            name,
            node_type,
            plugged: false,
            volume: 100,
            capture_gain: 0,
            ui_gain_scaler: 1.0,
            left_right_swapped: false,
            software_volume_needed: false,
            stable_id,
            volume_curve: Arc::new(ArcSwap::from_pointee(VolumeCurve::default())),
        }
    }

    pub fn plugged(mut self, plugged: bool) -> Node {
        self.plugged = plugged;
        self
    }

    /// Swap in a new volume curve; takes effect on the next scaler read.
    pub fn set_volume_curve(&self, curve: VolumeCurve) {
        self.volume_curve.store(Arc::new(curve));
    }

    pub fn volume_curve(&self) -> Arc<VolumeCurve> {
        self.volume_curve.load_full()
    }

    /// Linear scaler for the node's current volume step and UI gain.
    pub fn softvol_scaler(&self) -> f32 {
        self.volume_curve.load().scaler_at_step(self.volume) * self.ui_gain_scaler
    }
}
