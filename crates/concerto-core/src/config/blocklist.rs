//! USB device blocklist.
//!
//! The file carries one `[USB_Outputs]` section whose keys name a device as
//! `vendor_product_checksum_index`: vendor and product as lowercase hex
//! without a `0x` prefix, the checksum as eight hex digits (the POSIX
//! `cksum` of the USB `descriptors` sysfs file), and the device index in
//! decimal. A key set to `1` blocks that output.

use std::path::Path;

use super::ini::IniFile;

const USB_OUTPUTS_SECTION: &str = "USB_Outputs";

/// Parsed blocklist. `check` is a pure function of the parsed entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeviceBlocklist {
    entries: Vec<BlockEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockEntry {
    vendor_id: u32,
    product_id: u32,
    checksum: u32,
    device_index: u32,
}

fn parse_key(key: &str) -> Option<BlockEntry> {
    let mut parts = key.split('_');
    let vendor_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let product_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let checksum_str = parts.next()?;
    if checksum_str.len() != 8 {
        return None;
    }
    let checksum = u32::from_str_radix(checksum_str, 16).ok()?;
    let device_index = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(BlockEntry {
        vendor_id,
        product_id,
        checksum,
        device_index,
    })
}

impl DeviceBlocklist {
    /// Load `device_blocklist` from `config_dir`. A missing file is an
    /// empty blocklist; unparsable keys are skipped.
    pub fn load(config_dir: &Path) -> DeviceBlocklist {
        match std::fs::read_to_string(config_dir.join("device_blocklist")) {
            Ok(text) => Self::parse(&text),
            Err(_) => DeviceBlocklist::default(),
        }
    }

    pub fn parse(text: &str) -> DeviceBlocklist {
        let ini = IniFile::parse(text);
        let mut entries = Vec::new();
        if let Some(section) = ini.section(USB_OUTPUTS_SECTION) {
            for (key, value) in section {
                if value != "1" {
                    continue;
                }
                match parse_key(key) {
                    Some(entry) => entries.push(entry),
                    None => tracing::warn!(key, "ignoring malformed blocklist entry"),
                }
            }
        }
        DeviceBlocklist { entries }
    }

    /// Whether the identified USB output is blocked.
    pub fn check(&self, vendor_id: u32, product_id: u32, checksum: u32, device_index: u32) -> bool {
        self.entries.iter().any(|e| {
            e.vendor_id == vendor_id
                && e.product_id == product_id
                && e.checksum == checksum
                && e.device_index == device_index
        })
    }
}
