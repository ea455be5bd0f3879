use std::collections::BTreeMap;
use std::path::Path;

use super::{log_enumerated, run_tool, Bindings, DeviceHandler};
use crate::device::{DeviceRecord, DeviceType, DriverMetadata};

/// USB devices as listed by `lsusb`.
pub struct UsbHandler {
    program: String,
    bindings: Bindings,
}

impl UsbHandler {
    pub fn new() -> Self {
        Self::with_program("lsusb")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        UsbHandler {
            program: program.into(),
            bindings: Bindings::default(),
        }
    }

    /// Look up one device by its hex ids, case-insensitively.
    pub fn device_info(&self, vendor_id: &str, product_id: &str) -> Option<DeviceRecord> {
        self.enumerate().into_iter().find(|d| {
            d.vendor_id.eq_ignore_ascii_case(vendor_id) && d.product_id.eq_ignore_ascii_case(product_id)
        })
    }
}

impl Default for UsbHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// A device matches when its `vendor:product` pair is listed, or when the
/// driver lists nothing at all.
fn matches(device: &DeviceRecord, metadata: &DriverMetadata) -> bool {
    if metadata.compatible_ids.is_empty() {
        return true;
    }
    let key = format!("{}:{}", device.vendor_id, device.product_id);
    metadata
        .compatible_ids
        .iter()
        .any(|id| id.eq_ignore_ascii_case(&key))
}

impl DeviceHandler for UsbHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Usb
    }

    fn load(&mut self, driver_path: &Path, metadata: &DriverMetadata) -> bool {
        let matched: Vec<_> = self
            .enumerate()
            .into_iter()
            .filter(|d| matches(d, metadata))
            .collect();
        self.bindings.bind(DeviceType::Usb, driver_path, matched);
        true
    }

    fn unload(&mut self, driver_name: &str) -> bool {
        self.bindings.release(DeviceType::Usb, driver_name)
    }

    fn enumerate(&self) -> Vec<DeviceRecord> {
        let devices = run_tool(&self.program, &[])
            .map(|out| parse_lsusb(&out))
            .unwrap_or_default();
        log_enumerated(DeviceType::Usb, &devices);
        devices
    }

    fn bound_devices(&self, driver_name: &str) -> Option<&[DeviceRecord]> {
        self.bindings.devices(driver_name)
    }
}

/// Parse `lsusb` lines of the form
/// `Bus 001 Device 004: ID 046d:c52b Logitech, Inc. Unifying Receiver`.
/// Lines that do not fit are skipped.
pub fn parse_lsusb(output: &str) -> Vec<DeviceRecord> {
    output.lines().filter_map(parse_lsusb_line).collect()
}

fn parse_lsusb_line(line: &str) -> Option<DeviceRecord> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 6 || parts[0] != "Bus" || parts[4] != "ID" {
        return None;
    }
    let bus = parts[1];
    let device = parts[3].trim_end_matches(':');
    let (vendor_id, product_id) = parts[5].split_once(':')?;

    let mut capabilities = BTreeMap::new();
    capabilities.insert("bus_number".to_string(), bus.to_string());
    capabilities.insert("device_number".to_string(), device.to_string());

    Some(DeviceRecord {
        bus: "usb".into(),
        id: format!("{bus}-{device}"),
        vendor_id: vendor_id.to_string(),
        product_id: product_id.to_string(),
        category: "usb".into(),
        name: parts[6..].join(" "),
        capabilities,
    })
}
