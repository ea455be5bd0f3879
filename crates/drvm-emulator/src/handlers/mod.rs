//! Per-class device handlers and the registry the emulator dispatches into.

mod hid;
mod storage;
mod usb;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::device::{DeviceRecord, DeviceType, DriverMetadata};

pub use hid::{HidHandler, HidKind};
pub use storage::{parse_lsblk, StorageHandler};
pub use usb::{parse_lsusb, UsbHandler};

/// A device class the emulator can bind drivers to.
///
/// `enumerate` must not fail on a host without the relevant tools; it logs
/// and returns an empty list instead.
pub trait DeviceHandler: Send {
    fn device_type(&self) -> DeviceType;

    /// Bind a driver to whatever devices it matches right now. Succeeds even
    /// when nothing matches so later hot-plugged devices can be picked up.
    fn load(&mut self, driver_path: &Path, metadata: &DriverMetadata) -> bool;

    /// Release a driver by file name. Fails for names this handler never loaded.
    fn unload(&mut self, driver_name: &str) -> bool;

    fn enumerate(&self) -> Vec<DeviceRecord>;

    /// Devices captured when `driver_name` was loaded.
    fn bound_devices(&self, driver_name: &str) -> Option<&[DeviceRecord]>;
}

/// Handlers keyed by the device class they serve. The emulator never builds
/// its own handlers; callers hand it a registry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<DeviceType, Box<dyn DeviceHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// USB, HID and storage handlers probing the real host.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(UsbHandler::new()));
        registry.register(Box::new(HidHandler::new()));
        registry.register(Box::new(StorageHandler::new()));
        registry
    }

    /// Add a handler, replacing any previous one for the same device type.
    pub fn register(&mut self, handler: Box<dyn DeviceHandler>) -> Option<Box<dyn DeviceHandler>> {
        let device_type = handler.device_type();
        info!(%device_type, "registered device handler");
        self.handlers.insert(device_type, handler)
    }

    pub fn get(&self, device_type: DeviceType) -> Option<&dyn DeviceHandler> {
        self.handlers.get(&device_type).map(|h| h.as_ref())
    }

    pub fn get_mut(&mut self, device_type: DeviceType) -> Option<&mut (dyn DeviceHandler + 'static)> {
        self.handlers.get_mut(&device_type).map(|h| h.as_mut())
    }

    pub fn contains(&self, device_type: DeviceType) -> bool {
        self.handlers.contains_key(&device_type)
    }

    pub fn device_types(&self) -> impl Iterator<Item = DeviceType> + '_ {
        self.handlers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// --- Shared handler plumbing ---

struct Binding {
    path: PathBuf,
    devices: Vec<DeviceRecord>,
}

/// Driver name to the devices bound at load time.
#[derive(Default)]
pub(crate) struct Bindings {
    by_driver: BTreeMap<String, Binding>,
}

impl Bindings {
    pub(crate) fn bind(&mut self, device_type: DeviceType, path: &Path, devices: Vec<DeviceRecord>) {
        let name = driver_name(path);
        if devices.is_empty() {
            warn!(%device_type, driver = %name, "no matching devices, driver kept for hot-plug");
        } else {
            info!(%device_type, driver = %name, devices = devices.len(), "driver bound");
        }
        self.by_driver.insert(
            name,
            Binding {
                path: path.to_path_buf(),
                devices,
            },
        );
    }

    pub(crate) fn release(&mut self, device_type: DeviceType, name: &str) -> bool {
        match self.by_driver.remove(name) {
            Some(binding) => {
                info!(%device_type, driver = name, path = %binding.path.display(), "driver released");
                true
            }
            None => {
                error!(%device_type, driver = name, "driver not loaded in handler");
                false
            }
        }
    }

    pub(crate) fn devices(&self, name: &str) -> Option<&[DeviceRecord]> {
        self.by_driver.get(name).map(|b| b.devices.as_slice())
    }
}

pub(crate) fn driver_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Run a host tool and return its stdout, or `None` (logged) if the tool is
/// missing or exits non-zero.
pub(crate) fn run_tool(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            error!(
                program,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "enumeration tool failed"
            );
            None
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            error!(program, "enumeration tool not installed");
            None
        }
        Err(e) => {
            error!(program, error = %e, "could not run enumeration tool");
            None
        }
    }
}

fn log_enumerated(device_type: DeviceType, devices: &[DeviceRecord]) {
    debug!(%device_type, count = devices.len(), "enumerated devices");
}
