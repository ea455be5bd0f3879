use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Usb,
    Hid,
    Storage,
    Network,
    Audio,
}

impl DeviceType {
    pub const ALL: [DeviceType; 5] = [
        DeviceType::Usb,
        DeviceType::Hid,
        DeviceType::Storage,
        DeviceType::Network,
        DeviceType::Audio,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceType::Usb => "usb",
            DeviceType::Hid => "hid",
            DeviceType::Storage => "storage",
            DeviceType::Network => "network",
            DeviceType::Audio => "audio",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown device type: {0}")]
pub struct ParseDeviceTypeError(pub String);

impl FromStr for DeviceType {
    type Err = ParseDeviceTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseDeviceTypeError(s.to_string()))
    }
}

/// Guess the device class of a driver from its file name.
///
/// Checked in order, first hit wins: `hid|keyboard|mouse`, then
/// `storage|disk|usb_stor`, then `net|ethernet|wifi`, then `audio|sound`.
/// Anything else is treated as USB.
pub fn infer_device_type(filename: &str) -> DeviceType {
    const RULES: [(DeviceType, &[&str]); 4] = [
        (DeviceType::Hid, &["hid", "keyboard", "mouse"]),
        (DeviceType::Storage, &["storage", "disk", "usb_stor"]),
        (DeviceType::Network, &["net", "ethernet", "wifi"]),
        (DeviceType::Audio, &["audio", "sound"]),
    ];

    let lower = filename.to_lowercase();
    RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
        .map(|(device_type, _)| *device_type)
        .unwrap_or(DeviceType::Usb)
}

/// One piece of hardware as seen by a single enumeration. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub bus: String,
    pub id: String,
    pub vendor_id: String,
    pub product_id: String,
    pub category: String,
    pub name: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, String>,
}

/// What the emulator knows about a driver file before handing it to a handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverMetadata {
    pub device_type: DeviceType,
    pub vendor: String,
    pub version: String,
    pub compatible_ids: BTreeSet<String>,
}

/// Optional `<driver>.json` next to the driver file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Sidecar {
    vendor: Option<String>,
    version: Option<String>,
    compatible_ids: Vec<String>,
}

impl DriverMetadata {
    pub fn for_type(device_type: DeviceType) -> Self {
        DriverMetadata {
            device_type,
            vendor: "unknown".into(),
            version: "1.0.0".into(),
            compatible_ids: BTreeSet::new(),
        }
    }

    /// Infer metadata for `path`. The device type always comes from the
    /// file name; a sidecar may fill in vendor, version and compatible ids.
    pub fn from_driver_file(path: &Path) -> Self {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut metadata = DriverMetadata::for_type(infer_device_type(&filename));

        let sidecar_path = sidecar_path(path);
        let contents = match std::fs::read_to_string(&sidecar_path) {
            Ok(contents) => contents,
            Err(_) => return metadata,
        };
        match serde_json::from_str::<Sidecar>(&contents) {
            Ok(sidecar) => {
                debug!(path = %sidecar_path.display(), "applying driver sidecar");
                if let Some(vendor) = sidecar.vendor {
                    metadata.vendor = vendor;
                }
                if let Some(version) = sidecar.version {
                    metadata.version = version;
                }
                metadata.compatible_ids.extend(sidecar.compatible_ids);
            }
            Err(e) => {
                warn!(path = %sidecar_path.display(), error = %e, "ignoring unparsable driver sidecar");
            }
        }
        metadata
    }
}

fn sidecar_path(driver: &Path) -> PathBuf {
    let mut name = driver.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverRecord {
    pub name: String,
    pub source_path: PathBuf,
    #[serde(flatten)]
    pub metadata: DriverMetadata,
}

impl DriverRecord {
    pub fn device_type(&self) -> DeviceType {
        self.metadata.device_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_type_from_filename_keywords() {
        let cases = [
            ("usb_device.sys", DeviceType::Usb),
            ("hid_keyboard.sys", DeviceType::Hid),
            ("LogiMouse.SYS", DeviceType::Hid),
            ("storage_driver.sys", DeviceType::Storage),
            ("usb_stor.sys", DeviceType::Storage),
            ("network_adapter.sys", DeviceType::Network),
            ("wifi6e.sys", DeviceType::Network),
            ("audio_device.sys", DeviceType::Audio),
            ("realtek_sound.sys", DeviceType::Audio),
            ("mystery.sys", DeviceType::Usb),
        ];
        for (filename, expected) in cases {
            assert_eq!(infer_device_type(filename), expected, "{filename}");
        }
    }

    #[test]
    fn earlier_rule_wins_on_overlap() {
        // "hid" beats "disk"; "disk" beats "net".
        assert_eq!(infer_device_type("hid_diskpad.sys"), DeviceType::Hid);
        assert_eq!(infer_device_type("netdisk.sys"), DeviceType::Storage);
    }

    #[test]
    fn device_type_parses_case_insensitively() {
        assert_eq!("HID".parse::<DeviceType>().unwrap(), DeviceType::Hid);
        assert_eq!(
            "serial".parse::<DeviceType>(),
            Err(ParseDeviceTypeError("serial".into()))
        );
        assert_eq!(
            serde_json::to_string(&DeviceType::Storage).unwrap(),
            "\"storage\""
        );
    }

    #[test]
    fn sidecar_overrides_metadata_but_not_type() {
        let dir = tempfile::tempdir().unwrap();
        let driver = dir.path().join("acme_hid.sys");
        std::fs::write(&driver, b"MZ").unwrap();
        std::fs::write(
            dir.path().join("acme_hid.sys.json"),
            r#"{"vendor": "Acme", "compatible_ids": ["046d:c52b"], "device_type": "storage"}"#,
        )
        .unwrap();

        let metadata = DriverMetadata::from_driver_file(&driver);
        assert_eq!(metadata.device_type, DeviceType::Hid);
        assert_eq!(metadata.vendor, "Acme");
        assert_eq!(metadata.version, "1.0.0");
        assert!(metadata.compatible_ids.contains("046d:c52b"));
    }

    #[test]
    fn broken_sidecar_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let driver = dir.path().join("thing.sys");
        std::fs::write(&driver, b"MZ").unwrap();
        std::fs::write(dir.path().join("thing.sys.json"), "{not json").unwrap();

        assert_eq!(
            DriverMetadata::from_driver_file(&driver),
            DriverMetadata::for_type(DeviceType::Usb)
        );
    }
}
