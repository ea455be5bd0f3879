use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::error;

use super::{log_enumerated, run_tool, Bindings, DeviceHandler};
use crate::device::{DeviceRecord, DeviceType, DriverMetadata};

const LSBLK_ARGS: &[&str] = &["-J", "-o", "NAME,SIZE,TYPE,MOUNTPOINT,VENDOR,MODEL,SERIAL"];

/// Block devices (whole disks and partitions) as reported by `lsblk`.
pub struct StorageHandler {
    program: String,
    bindings: Bindings,
}

impl StorageHandler {
    pub fn new() -> Self {
        Self::with_program("lsblk")
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        StorageHandler {
            program: program.into(),
            bindings: Bindings::default(),
        }
    }

    /// Find a device by its `/dev` path, e.g. `/dev/sda1`.
    pub fn device_by_path(&self, path: &str) -> Option<DeviceRecord> {
        self.enumerate().into_iter().find(|d| d.id == path)
    }

    pub fn mounted_devices(&self) -> Vec<DeviceRecord> {
        self.enumerate()
            .into_iter()
            .filter(|d| d.capabilities.contains_key("mountpoint"))
            .collect()
    }
}

impl Default for StorageHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHandler for StorageHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Storage
    }

    fn load(&mut self, driver_path: &Path, _metadata: &DriverMetadata) -> bool {
        let devices = self.enumerate();
        self.bindings.bind(DeviceType::Storage, driver_path, devices);
        true
    }

    fn unload(&mut self, driver_name: &str) -> bool {
        self.bindings.release(DeviceType::Storage, driver_name)
    }

    fn enumerate(&self) -> Vec<DeviceRecord> {
        let Some(output) = run_tool(&self.program, LSBLK_ARGS) else {
            return Vec::new();
        };
        let devices = match parse_lsblk(&output) {
            Ok(devices) => devices,
            Err(e) => {
                error!(error = %e, "failed to parse lsblk output");
                Vec::new()
            }
        };
        log_enumerated(DeviceType::Storage, &devices);
        devices
    }

    fn bound_devices(&self, driver_name: &str) -> Option<&[DeviceRecord]> {
        self.bindings.devices(driver_name)
    }
}

#[derive(Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<BlockDevice>,
}

#[derive(Deserialize)]
struct BlockDevice {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    mountpoint: Option<String>,
    #[serde(default)]
    vendor: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    serial: Option<String>,
    #[serde(default)]
    children: Vec<BlockDevice>,
}

/// Parse `lsblk -J` output into disk and partition records. Nested
/// partitions are flattened after their parent disk; loop devices, ROM
/// drives and the like are dropped.
pub fn parse_lsblk(json: &str) -> Result<Vec<DeviceRecord>, serde_json::Error> {
    let output: LsblkOutput = serde_json::from_str(json)?;
    let mut devices = Vec::new();
    flatten(&output.blockdevices, &mut devices);
    Ok(devices)
}

fn flatten(nodes: &[BlockDevice], out: &mut Vec<DeviceRecord>) {
    for node in nodes {
        if node.kind == "disk" || node.kind == "part" {
            out.push(to_record(node));
        }
        flatten(&node.children, out);
    }
}

fn to_record(dev: &BlockDevice) -> DeviceRecord {
    let field = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut capabilities = BTreeMap::new();
    capabilities.insert(
        "size".to_string(),
        field(&dev.size).unwrap_or_else(|| "unknown".into()),
    );
    if let Some(mountpoint) = field(&dev.mountpoint) {
        capabilities.insert("mountpoint".to_string(), mountpoint);
    }
    if let Some(serial) = field(&dev.serial) {
        capabilities.insert("serial".to_string(), serial);
    }

    let model = field(&dev.model);
    DeviceRecord {
        bus: "block".into(),
        id: format!("/dev/{}", dev.name),
        vendor_id: field(&dev.vendor).unwrap_or_else(|| "unknown".into()),
        product_id: model.clone().unwrap_or_else(|| "unknown".into()),
        category: dev.kind.clone(),
        name: model.unwrap_or_else(|| dev.name.clone()),
        capabilities,
    }
}
