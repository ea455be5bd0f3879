use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use drvm_emulator::handlers::HidHandler;
use drvm_emulator::{
    DeviceHandler, DeviceRecord, DeviceType, DriverEmulator, DriverMetadata, EmulatorConfig,
    EmulatorError, HandlerRegistry,
};
use tempfile::TempDir;

/// Handler with a fixed device list that records what it was asked to do.
struct FakeHandler {
    device_type: DeviceType,
    devices: Vec<DeviceRecord>,
    bound: BTreeMap<String, Vec<DeviceRecord>>,
    panic_on_load: bool,
}

impl FakeHandler {
    fn new(device_type: DeviceType) -> Self {
        FakeHandler {
            device_type,
            devices: vec![DeviceRecord {
                bus: "usb".into(),
                id: "001-002".into(),
                vendor_id: "046d".into(),
                product_id: "c52b".into(),
                category: "usb".into(),
                name: "Unifying Receiver".into(),
                capabilities: BTreeMap::new(),
            }],
            bound: BTreeMap::new(),
            panic_on_load: false,
        }
    }

    fn panicking(device_type: DeviceType) -> Self {
        FakeHandler {
            panic_on_load: true,
            ..FakeHandler::new(device_type)
        }
    }
}

impl DeviceHandler for FakeHandler {
    fn device_type(&self) -> DeviceType {
        self.device_type
    }

    fn load(&mut self, driver_path: &Path, _metadata: &DriverMetadata) -> bool {
        if self.panic_on_load {
            panic!("device exploded");
        }
        let name = driver_path.file_name().unwrap().to_string_lossy().into_owned();
        self.bound.insert(name, self.devices.clone());
        true
    }

    fn unload(&mut self, driver_name: &str) -> bool {
        self.bound.remove(driver_name).is_some()
    }

    fn enumerate(&self) -> Vec<DeviceRecord> {
        self.devices.clone()
    }

    fn bound_devices(&self, driver_name: &str) -> Option<&[DeviceRecord]> {
        self.bound.get(driver_name).map(Vec::as_slice)
    }
}

fn fake_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(FakeHandler::new(DeviceType::Usb)));
    registry.register(Box::new(FakeHandler::new(DeviceType::Hid)));
    registry.register(Box::new(FakeHandler::new(DeviceType::Storage)));
    registry
}

fn config_with(dir: &TempDir, max_drivers: usize) -> EmulatorConfig {
    let mut config = EmulatorConfig::default();
    config.driver_search_paths = vec![dir.path().display().to_string()];
    config.security.max_drivers = max_drivers;
    config
}

fn driver_file(dir: &TempDir, name: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, b"MZ\x90\x00").unwrap();
    path
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn load_list_unload() {
    let dir = tempfile::tempdir().unwrap();
    let hid = driver_file(&dir, "hid_keyboard.sys");
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());

    assert!(emulator.list().is_empty());
    assert!(emulator.load(path_str(&hid)));

    let listed = emulator.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "hid_keyboard.sys");
    assert_eq!(listed[0].device_type(), DeviceType::Hid);
    assert_eq!(listed[0].metadata.vendor, "unknown");
    assert_eq!(listed[0].metadata.version, "1.0.0");
    assert_eq!(listed[0].source_path, hid);
    assert_eq!(emulator.bound_devices("hid_keyboard.sys").unwrap().len(), 1);

    assert!(emulator.unload("hid_keyboard.sys"));
    assert!(emulator.list().is_empty());
    assert!(emulator.bound_devices("hid_keyboard.sys").is_none());
}

#[test]
fn capacity_limit_leaves_registry_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mut emulator = DriverEmulator::new(config_with(&dir, 2), fake_registry());

    for name in ["a_usb.sys", "b_usb.sys"] {
        assert!(emulator.load(path_str(&driver_file(&dir, name))));
    }
    let third = driver_file(&dir, "c_usb.sys");
    assert!(matches!(
        emulator.try_load(path_str(&third)),
        Err(EmulatorError::CapacityExceeded(2))
    ));
    let names: Vec<_> = emulator.list().iter().map(|r| r.name.clone()).collect();
    assert_eq!(names, ["a_usb.sys", "b_usb.sys"]);
}

#[test]
fn unloading_unknown_name_fails_without_mutation() {
    let dir = tempfile::tempdir().unwrap();
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());
    assert!(emulator.load(path_str(&driver_file(&dir, "usb_cam.sys"))));

    assert!(!emulator.unload("never_loaded.sys"));
    assert!(matches!(
        emulator.try_unload("never_loaded.sys"),
        Err(EmulatorError::NotFound(_))
    ));
    assert_eq!(emulator.list().len(), 1);
}

#[test]
fn duplicate_file_name_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let other = tempfile::tempdir().unwrap();
    let first = driver_file(&dir, "usb_cam.sys");
    let second = driver_file(&other, "usb_cam.sys");
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());

    assert!(emulator.load(path_str(&first)));
    assert!(matches!(
        emulator.try_load(path_str(&second)),
        Err(EmulatorError::AlreadyLoaded(name)) if name == "usb_cam.sys"
    ));
    assert_eq!(emulator.get("usb_cam.sys").unwrap().source_path, first);
}

#[test]
fn missing_file_and_unhandled_type_fail_fast() {
    let dir = tempfile::tempdir().unwrap();
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());

    assert!(matches!(
        emulator.try_load("/nonexistent/dir/hid_mouse.sys"),
        Err(EmulatorError::NotFound(_))
    ));

    let net = driver_file(&dir, "intel_ethernet.sys");
    assert!(matches!(
        emulator.try_load(path_str(&net)),
        Err(EmulatorError::Unsupported(DeviceType::Network))
    ));
    assert!(emulator.list().is_empty());
}

#[test]
fn disabled_device_type_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(&dir, 32);
    config.supported_device_types = vec![DeviceType::Usb];
    let mut emulator = DriverEmulator::new(config, fake_registry());

    let hid = driver_file(&dir, "hid_mouse.sys");
    assert!(matches!(
        emulator.try_load(path_str(&hid)),
        Err(EmulatorError::Unsupported(DeviceType::Hid))
    ));
    let usb = driver_file(&dir, "usb_hub.sys");
    assert!(emulator.load(path_str(&usb)));
}

#[test]
fn handler_panic_is_contained() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(FakeHandler::panicking(DeviceType::Storage)));
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), registry);

    let path = driver_file(&dir, "disk_ctrl.sys");
    match emulator.try_load(path_str(&path)) {
        Err(EmulatorError::HandlerFailure { driver, reason }) => {
            assert_eq!(driver, "disk_ctrl.sys");
            assert!(reason.contains("device exploded"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(emulator.list().is_empty());
}

#[test]
fn bare_names_are_found_in_search_paths() {
    let dir = tempfile::tempdir().unwrap();
    driver_file(&dir, "drvm_search_probe_usb.sys");
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());

    assert!(emulator.load("drvm_search_probe_usb.sys"));
    assert_eq!(
        emulator.get("drvm_search_probe_usb.sys").unwrap().source_path,
        dir.path().join("drvm_search_probe_usb.sys")
    );
}

#[test]
fn sidecar_ids_reach_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = driver_file(&dir, "webcam.sys");
    fs::write(
        dir.path().join("webcam.sys.json"),
        r#"{"vendor": "Logitech", "version": "2.1", "compatible_ids": ["046d:0825"]}"#,
    )
    .unwrap();
    let mut emulator = DriverEmulator::new(config_with(&dir, 32), fake_registry());

    let record = emulator.try_load(path_str(&path)).unwrap();
    assert_eq!(record.metadata.vendor, "Logitech");
    assert_eq!(record.metadata.version, "2.1");
    assert!(record.metadata.compatible_ids.contains("046d:0825"));
}

#[test]
fn hid_keyboard_driver_is_compatible() {
    let dir = tempfile::tempdir().unwrap();
    let path = driver_file(&dir, "hid_keyboard.sys");
    let emulator = DriverEmulator::new(
        config_with(&dir, 32),
        HandlerRegistry::with_defaults(),
    );

    let report = emulator.check_compatibility(path_str(&path));
    assert!(report.compatible);
    assert_eq!(report.device_type, Some(DeviceType::Hid));
    assert!(report.issues.is_empty());
    assert!(report.warnings.is_empty());

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["device_type"], "hid");
}

#[test]
fn compatibility_issues_and_warnings() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_with(&dir, 32);
    config.supported_device_types.retain(|t| *t != DeviceType::Audio);
    let emulator = DriverEmulator::new(config, fake_registry());

    let missing = emulator.check_compatibility("/nonexistent/hid.sys");
    assert!(!missing.compatible);
    assert_eq!(missing.issues, ["Driver file not found: /nonexistent/hid.sys"]);
    assert_eq!(missing.device_type, None);

    let inf = driver_file(&dir, "usb_hub.inf");
    let report = emulator.check_compatibility(path_str(&inf));
    assert!(report.compatible);
    assert_eq!(report.warnings, ["Driver file should have .sys extension"]);

    let audio = driver_file(&dir, "sound_blaster.sys");
    let report = emulator.check_compatibility(path_str(&audio));
    assert!(!report.compatible);
    assert_eq!(report.issues, ["Unsupported device type: audio"]);

    let net = driver_file(&dir, "wifi_adapter.sys");
    let report = emulator.check_compatibility(path_str(&net));
    assert!(!report.compatible);
    assert_eq!(
        report.issues,
        ["No handler registered for device type: network"]
    );
}

#[test]
fn enumerate_delegates_to_handler() {
    let dir = tempfile::tempdir().unwrap();
    let sysfs = tempfile::tempdir().unwrap();
    let device = sysfs.path().join("class/input/event0/device");
    fs::create_dir_all(&device).unwrap();
    fs::write(device.join("name"), "Logitech USB Optical Mouse\n").unwrap();

    let mut registry = HandlerRegistry::new();
    registry.register(Box::new(HidHandler::with_sysfs_root(sysfs.path())));
    let emulator = DriverEmulator::new(config_with(&dir, 32), registry);

    let devices = emulator.enumerate(DeviceType::Hid);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].category, "mouse");
    assert!(emulator.enumerate(DeviceType::Audio).is_empty());
}
