use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error};

use super::{log_enumerated, Bindings, DeviceHandler};
use crate::device::{DeviceRecord, DeviceType, DriverMetadata};

/// Sub-class of an input device, derived from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HidKind {
    Keyboard,
    Mouse,
    Touchpad,
    Touchscreen,
    Gamepad,
    Stylus,
    Generic,
}

impl HidKind {
    const RULES: [(HidKind, &'static [&'static str]); 6] = [
        (HidKind::Keyboard, &["keyboard", "kbd"]),
        (HidKind::Mouse, &["mouse", "pointing"]),
        (HidKind::Touchpad, &["touchpad", "trackpad"]),
        (HidKind::Touchscreen, &["touchscreen", "touch screen"]),
        (HidKind::Gamepad, &["gamepad", "joystick", "controller"]),
        (HidKind::Stylus, &["stylus", "pen"]),
    ];

    /// Case-insensitive substring match on the device name, first rule wins.
    pub fn classify(device_name: &str) -> HidKind {
        let lower = device_name.to_lowercase();
        Self::RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(kind, _)| *kind)
            .unwrap_or(HidKind::Generic)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HidKind::Keyboard => "keyboard",
            HidKind::Mouse => "mouse",
            HidKind::Touchpad => "touchpad",
            HidKind::Touchscreen => "touchscreen",
            HidKind::Gamepad => "gamepad",
            HidKind::Stylus => "stylus",
            HidKind::Generic => "generic",
        }
    }
}

impl fmt::Display for HidKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input devices discovered through `<sysfs>/class/input/event*`.
pub struct HidHandler {
    sysfs_root: PathBuf,
    bindings: Bindings,
}

impl HidHandler {
    pub fn new() -> Self {
        Self::with_sysfs_root("/sys")
    }

    pub fn with_sysfs_root(root: impl Into<PathBuf>) -> Self {
        HidHandler {
            sysfs_root: root.into(),
            bindings: Bindings::default(),
        }
    }

    pub fn devices_of_kind(&self, kind: HidKind) -> Vec<DeviceRecord> {
        self.enumerate()
            .into_iter()
            .filter(|d| d.category == kind.as_str())
            .collect()
    }

    fn read_event_device(&self, event_dir: &Path, event: &str) -> Option<DeviceRecord> {
        let device_dir = event_dir.join("device");
        let name = read_attr(&device_dir.join("name"))?;

        let mut capabilities = BTreeMap::new();
        if let Some(ev) = read_attr(&device_dir.join("capabilities/ev")) {
            capabilities.insert("ev".to_string(), ev);
        }

        Some(DeviceRecord {
            bus: "input".into(),
            id: format!("/dev/input/{event}"),
            vendor_id: read_attr(&device_dir.join("id/vendor")).unwrap_or_default(),
            product_id: read_attr(&device_dir.join("id/product")).unwrap_or_default(),
            category: HidKind::classify(&name).as_str().into(),
            name,
            capabilities,
        })
    }
}

impl Default for HidHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceHandler for HidHandler {
    fn device_type(&self) -> DeviceType {
        DeviceType::Hid
    }

    fn load(&mut self, driver_path: &Path, _metadata: &DriverMetadata) -> bool {
        let devices = self.enumerate();
        self.bindings.bind(DeviceType::Hid, driver_path, devices);
        true
    }

    fn unload(&mut self, driver_name: &str) -> bool {
        self.bindings.release(DeviceType::Hid, driver_name)
    }

    fn enumerate(&self) -> Vec<DeviceRecord> {
        let class_dir = self.sysfs_root.join("class/input");
        let entries = match fs::read_dir(&class_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(path = %class_dir.display(), error = %e, "cannot list input devices");
                return Vec::new();
            }
        };

        let mut events: Vec<(u32, String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let index = name.strip_prefix("event")?.parse().ok()?;
                Some((index, name, entry.path()))
            })
            .collect();
        events.sort();

        let devices: Vec<_> = events
            .iter()
            .filter_map(|(_, event, dir)| {
                let device = self.read_event_device(dir, event);
                if device.is_none() {
                    debug!(event, "skipping input device without a name");
                }
                device
            })
            .collect();
        log_enumerated(DeviceType::Hid, &devices);
        devices
    }

    fn bound_devices(&self, driver_name: &str) -> Option<&[DeviceRecord]> {
        self.bindings.devices(driver_name)
    }
}

fn read_attr(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_event(root: &Path, event: &str, name: Option<&str>, ev: &str) {
        let device = root.join("class/input").join(event).join("device");
        fs::create_dir_all(device.join("capabilities")).unwrap();
        fs::create_dir_all(device.join("id")).unwrap();
        if let Some(name) = name {
            fs::write(device.join("name"), format!("{name}\n")).unwrap();
        }
        fs::write(device.join("capabilities/ev"), format!("{ev}\n")).unwrap();
        fs::write(device.join("id/vendor"), "046d\n").unwrap();
        fs::write(device.join("id/product"), "c52b\n").unwrap();
    }

    #[test]
    fn classifies_by_name_in_rule_order() {
        let cases = [
            ("AT Translated Set 2 keyboard", HidKind::Keyboard),
            ("Logitech USB Optical Mouse", HidKind::Mouse),
            ("TrackPoint pointing stick", HidKind::Mouse),
            ("SynPS/2 Synaptics TouchPad", HidKind::Touchpad),
            ("ELAN Touch Screen", HidKind::Touchscreen),
            ("Xbox Wireless Controller", HidKind::Gamepad),
            ("Wacom Pen", HidKind::Stylus),
            ("Power Button", HidKind::Generic),
            // keyboard rule runs before the touchpad rule
            ("Keyboard with Touchpad", HidKind::Keyboard),
        ];
        for (name, expected) in cases {
            assert_eq!(HidKind::classify(name), expected, "{name}");
        }
    }

    #[test]
    fn enumerates_fake_sysfs() {
        let root = tempfile::tempdir().unwrap();
        fake_event(root.path(), "event10", Some("Wacom Pen"), "1b");
        fake_event(root.path(), "event2", Some("AT Translated Set 2 keyboard"), "120013");
        fake_event(root.path(), "event3", None, "3");
        fs::create_dir_all(root.path().join("class/input/mouse0")).unwrap();

        let handler = HidHandler::with_sysfs_root(root.path());
        let devices = handler.enumerate();
        assert_eq!(devices.len(), 2);

        assert_eq!(devices[0].id, "/dev/input/event2");
        assert_eq!(devices[0].category, "keyboard");
        assert_eq!(devices[0].capabilities["ev"], "120013");
        assert_eq!(devices[0].vendor_id, "046d");
        assert_eq!(devices[1].category, "stylus");

        let keyboards = handler.devices_of_kind(HidKind::Keyboard);
        assert_eq!(keyboards.len(), 1);
        assert!(handler.devices_of_kind(HidKind::Gamepad).is_empty());
    }

    #[test]
    fn load_binds_every_input_device() {
        let root = tempfile::tempdir().unwrap();
        fake_event(root.path(), "event0", Some("Logitech USB Optical Mouse"), "17");

        let mut handler = HidHandler::with_sysfs_root(root.path());
        let metadata = DriverMetadata::for_type(DeviceType::Hid);
        assert!(handler.load(Path::new("/tmp/hid_mouse.sys"), &metadata));
        assert_eq!(handler.bound_devices("hid_mouse.sys").unwrap().len(), 1);
    }

    #[test]
    fn missing_sysfs_enumerates_nothing() {
        let handler = HidHandler::with_sysfs_root("/nonexistent/drvm-sysfs");
        assert!(handler.enumerate().is_empty());
    }
}
