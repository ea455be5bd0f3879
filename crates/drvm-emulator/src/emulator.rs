use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::EmulatorConfig;
use crate::device::{DeviceRecord, DeviceType, DriverMetadata, DriverRecord};
use crate::error::{EmulatorError, Result};
use crate::handlers::HandlerRegistry;

/// Result of [`DriverEmulator::check_compatibility`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
}

/// Loaded-driver registry for host-native devices.
///
/// Records are keyed by driver file name. Handlers only know drivers by
/// name; the records themselves live here.
pub struct DriverEmulator {
    config: EmulatorConfig,
    registry: HandlerRegistry,
    loaded: BTreeMap<String, DriverRecord>,
}

impl DriverEmulator {
    pub fn new(config: EmulatorConfig, registry: HandlerRegistry) -> Self {
        info!(
            handlers = registry.len(),
            max_drivers = config.security.max_drivers,
            "driver emulator initialized"
        );
        for setting in config.security.disabled_protections() {
            warn!(setting, "security protection disabled in config");
        }
        DriverEmulator {
            config,
            registry,
            loaded: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn load(&mut self, driver: &str) -> bool {
        match self.try_load(driver) {
            Ok(record) => {
                info!(driver = %record.name, device_type = %record.device_type(), "driver loaded");
                true
            }
            Err(e) => {
                error!(driver, error = %e, "failed to load driver");
                false
            }
        }
    }

    /// Load a driver file. Nothing is recorded unless every step succeeds.
    pub fn try_load(&mut self, driver: &str) -> Result<DriverRecord> {
        let path = self
            .resolve(driver)
            .ok_or_else(|| EmulatorError::NotFound(driver.to_string()))?;
        let name = file_name(&path);

        if self.loaded.contains_key(&name) {
            return Err(EmulatorError::AlreadyLoaded(name));
        }
        let max = self.config.security.max_drivers;
        if self.loaded.len() >= max {
            return Err(EmulatorError::CapacityExceeded(max));
        }

        let metadata = DriverMetadata::from_driver_file(&path);
        let device_type = metadata.device_type;
        if !self.config.supports(device_type) {
            return Err(EmulatorError::Unsupported(device_type));
        }
        let handler = self
            .registry
            .get_mut(device_type)
            .ok_or(EmulatorError::Unsupported(device_type))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler.load(&path, &metadata))) {
            Ok(true) => {}
            Ok(false) => return Err(handler_failure(&name, "handler rejected the driver")),
            Err(payload) => return Err(handler_failure(&name, panic_reason(payload.as_ref()))),
        }

        let record = DriverRecord {
            name: name.clone(),
            source_path: path,
            metadata,
        };
        self.loaded.insert(name, record.clone());
        Ok(record)
    }

    pub fn unload(&mut self, name: &str) -> bool {
        match self.try_unload(name) {
            Ok(_) => {
                info!(driver = name, "driver unloaded");
                true
            }
            Err(e) => {
                error!(driver = name, error = %e, "failed to unload driver");
                false
            }
        }
    }

    /// Unload by file name. The record is only dropped once its handler
    /// has let go of the driver.
    pub fn try_unload(&mut self, name: &str) -> Result<DriverRecord> {
        let device_type = self
            .loaded
            .get(name)
            .map(DriverRecord::device_type)
            .ok_or_else(|| EmulatorError::NotFound(name.to_string()))?;

        let handler = self
            .registry
            .get_mut(device_type)
            .ok_or(EmulatorError::Unsupported(device_type))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler.unload(name))) {
            Ok(true) => {}
            Ok(false) => return Err(handler_failure(name, "handler does not know the driver")),
            Err(payload) => return Err(handler_failure(name, panic_reason(payload.as_ref()))),
        }

        self.loaded
            .remove(name)
            .ok_or_else(|| EmulatorError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<&DriverRecord> {
        self.loaded.values().collect()
    }

    pub fn get(&self, name: &str) -> Option<&DriverRecord> {
        self.loaded.get(name)
    }

    /// Devices bound to a loaded driver at the time it was loaded.
    pub fn bound_devices(&self, name: &str) -> Option<&[DeviceRecord]> {
        let record = self.loaded.get(name)?;
        self.registry.get(record.device_type())?.bound_devices(name)
    }

    /// Snapshot of the devices of one class. Empty if no handler serves it.
    pub fn enumerate(&self, device_type: DeviceType) -> Vec<DeviceRecord> {
        let Some(handler) = self.registry.get(device_type) else {
            warn!(%device_type, "no handler registered, nothing to enumerate");
            return Vec::new();
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler.enumerate())) {
            Ok(devices) => devices,
            Err(payload) => {
                error!(%device_type, reason = %panic_reason(payload.as_ref()), "enumeration panicked");
                Vec::new()
            }
        }
    }

    pub fn check_compatibility(&self, driver: &str) -> CompatibilityReport {
        let mut report = CompatibilityReport::default();

        let Some(path) = self.resolve(driver) else {
            report.issues.push(format!("Driver file not found: {driver}"));
            return report;
        };

        let is_sys = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("sys"));
        if !is_sys {
            report
                .warnings
                .push("Driver file should have .sys extension".into());
        }

        let device_type = DriverMetadata::from_driver_file(&path).device_type;
        if !self.config.supports(device_type) {
            report
                .issues
                .push(format!("Unsupported device type: {device_type}"));
        } else if !self.registry.contains(device_type) {
            report
                .issues
                .push(format!("No handler registered for device type: {device_type}"));
        }

        report.device_type = Some(device_type);
        report.compatible = report.issues.is_empty();
        report
    }

    /// A path that exists is used as is. A bare file name that does not
    /// exist in the working directory is looked up in the search paths.
    fn resolve(&self, driver: &str) -> Option<PathBuf> {
        let path = Path::new(driver);
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        if path.components().count() != 1 {
            return None;
        }
        self.config
            .search_paths()
            .into_iter()
            .map(|dir| dir.join(driver))
            .find(|candidate| candidate.is_file())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn handler_failure(driver: &str, reason: impl Into<String>) -> EmulatorError {
    EmulatorError::HandlerFailure {
        driver: driver.to_string(),
        reason: reason.into(),
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".into()
    }
}
