//! Per-card volume curve configuration.
//!
//! One INI file per ALSA card name. Each section is a node label (resolved
//! by the caller in priority order: UCM device name, then jack name, then
//! mixer control name) and configures that node's volume curve:
//!
//! ```ini
//! [Headphone Jack]
//! volume_curve = simple_step
//! max_volume = -300
//! volume_step = 75
//! ```
//!
//! Explicit curves carry `dB_at_0` through `dB_at_100`. All values are
//! centi-dB. A malformed section logs and falls back to the default curve.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::Path;

use tracing::warn;

use crate::volume::{VolumeCurve, VOLUME_STEPS};

use super::ini::IniFile;

/// Parsed card config: node label to volume curve.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CardConfig {
    curves: HashMap<String, VolumeCurve>,
}

fn curve_from_section(entries: &[(String, String)]) -> Option<VolumeCurve> {
    let get = |key: &str| -> Option<&str> {
        entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    };
    match get("volume_curve")? {
        "simple_step" => {
            let max_volume = get("max_volume")?.parse().ok()?;
            let volume_step = get("volume_step")?.parse().ok()?;
            Some(VolumeCurve::SimpleStep {
                max_volume,
                volume_step,
            })
        }
        "explicit" => {
            let mut db_at = [0i32; VOLUME_STEPS];
            for (step, slot) in db_at.iter_mut().enumerate() {
                *slot = get(&format!("dB_at_{step}"))?.parse().ok()?;
            }
            Some(VolumeCurve::explicit(db_at))
        }
        _ => None,
    }
}

impl CardConfig {
    /// Load `<config_dir>/<card_name>`. A missing file configures nothing.
    pub fn load(config_dir: &Path, card_name: &str) -> CardConfig {
        match std::fs::read_to_string(config_dir.join(card_name)) {
            Ok(text) => Self::parse(&text),
            Err(_) => CardConfig::default(),
        }
    }

    pub fn parse(text: &str) -> CardConfig {
        let ini = IniFile::parse(text);
        let mut curves = HashMap::new();
        for name in ini.section_names() {
            if name.is_empty() {
                continue;
            }
            let entries = ini.section(name).unwrap_or(&[]);
            match curve_from_section(entries) {
                Some(curve) => {
                    curves.insert(name.to_string(), curve);
                }
                None => warn!(section = name, "bad volume curve, using default"),
            }
        }
        CardConfig { curves }
    }

    /// Curve for a node label, if the config names it.
    pub fn curve_for(&self, label: &str) -> Option<&VolumeCurve> {
        self.curves.get(label)
    }

    /// First configured label from a priority-ordered candidate list.
    pub fn curve_for_candidates<'a>(&self, labels: &[&'a str]) -> Option<(&'a str, &VolumeCurve)> {
        labels
            .iter()
            .find_map(|label| self.curve_for(label).map(|curve| (*label, curve)))
    }

    /// Canonical text form: sections sorted by label, fixed key order.
    /// `parse(emit(cfg)) == cfg` for any parsed config.
    pub fn emit(&self) -> String {
        let mut labels: Vec<&String> = self.curves.keys().collect();
        labels.sort();
        let mut out = String::new();
        for label in labels {
            let _ = writeln!(out, "[{label}]");
            match &self.curves[label] {
                VolumeCurve::SimpleStep {
                    max_volume,
                    volume_step,
                } => {
                    let _ = writeln!(out, "volume_curve = simple_step");
                    let _ = writeln!(out, "max_volume = {max_volume}");
                    let _ = writeln!(out, "volume_step = {volume_step}");
                }
                VolumeCurve::Explicit { db_at } => {
                    let _ = writeln!(out, "volume_curve = explicit");
                    for (step, db) in db_at.iter().enumerate() {
                        let _ = writeln!(out, "dB_at_{step} = {db}");
                    }
                }
            }
            out.push('\n');
        }
        out
    }
}
