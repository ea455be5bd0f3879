use std::collections::BTreeSet;

use anyhow::Result;
use drvm_rpc::api::{ActionReply, DriverList, DriverStatus, GuestDriver, GuestStatus};
use tracing::{info, warn};

use crate::backend::DriverBackend;

/// Values reported by `get_status` that the guest cannot discover itself.
#[derive(Debug, Clone)]
pub struct GuestOptions {
    pub vm_type: String,
    pub memory_mb: u64,
    pub cpu_cores: u32,
}

impl Default for GuestOptions {
    fn default() -> Self {
        GuestOptions {
            vm_type: "Windows 10 22H2 Minimal".into(),
            memory_mb: 512,
            cpu_cores: 1,
        }
    }
}

/// Answers the four control-plane operations against a [`DriverBackend`].
///
/// The only state kept here is the set of device ids installed during this
/// run; everything else is re-read from the backend on each call.
pub struct GuestDriverManager {
    backend: Box<dyn DriverBackend>,
    options: GuestOptions,
    installed: BTreeSet<String>,
}

impl GuestDriverManager {
    pub fn new(backend: Box<dyn DriverBackend>, options: GuestOptions) -> Self {
        info!(backend = backend.name(), vm_type = %options.vm_type, "guest driver manager ready");
        GuestDriverManager {
            backend,
            options,
            installed: BTreeSet::new(),
        }
    }

    pub fn options(&self) -> &GuestOptions {
        &self.options
    }

    /// Device ids installed since the service started.
    pub fn installed(&self) -> &BTreeSet<String> {
        &self.installed
    }

    pub fn list_drivers(&mut self, category: Option<&str>) -> Result<DriverList> {
        let mut drivers = self.backend.devices()?;
        if let Some(category) = category {
            drivers.retain(|d| d.category.eq_ignore_ascii_case(category));
        }
        Ok(DriverList::new(drivers))
    }

    pub fn install_driver(&mut self, device_id: &str) -> Result<ActionReply> {
        let device = match self.lookup(device_id)? {
            Ok(device) => device,
            Err(reply) => return Ok(reply),
        };
        let device_id = device.device_id.as_str();
        if device.status == DriverStatus::Installed {
            return Ok(ActionReply::ok(
                device_id,
                format!("Driver already installed for {device_id}"),
            ));
        }

        self.backend.install(device_id)?;
        if self.current_status(device_id)? != Some(DriverStatus::Installed) {
            warn!(device_id, "install completed but no driver is bound");
            return Ok(failed_for(
                device_id,
                format!("No matching driver found for {device_id}"),
            ));
        }
        self.installed.insert(device_id.to_string());
        info!(device_id, "driver installed");
        Ok(ActionReply::ok(device_id, format!("Driver installed for {device_id}")))
    }

    pub fn uninstall_driver(&mut self, device_id: &str) -> Result<ActionReply> {
        let device = match self.lookup(device_id)? {
            Ok(device) => device,
            Err(reply) => return Ok(reply),
        };
        let device_id = device.device_id.as_str();
        if device.status == DriverStatus::NeedsDriver {
            return Ok(ActionReply::ok(
                device_id,
                format!("No driver installed for {device_id}"),
            ));
        }

        self.backend.uninstall(device_id)?;
        if self.current_status(device_id)? == Some(DriverStatus::Installed) {
            warn!(device_id, "uninstall completed but the driver is still bound");
            return Ok(failed_for(
                device_id,
                format!("Driver is still bound to {device_id}"),
            ));
        }
        self.installed.remove(device_id);
        info!(device_id, "driver uninstalled");
        Ok(ActionReply::ok(device_id, format!("Driver uninstalled for {device_id}")))
    }

    pub fn status(&self) -> GuestStatus {
        GuestStatus {
            success: true,
            vm_type: self.options.vm_type.clone(),
            isolated: true,
            installed_drivers_count: self.installed.len(),
            memory_mb: self.options.memory_mb,
            cpu_cores: self.options.cpu_cores,
            processes_count: self.backend.process_count(),
        }
    }

    /// Re-read the device after a backend action; `None` if it went away.
    fn current_status(&mut self, device_id: &str) -> Result<Option<DriverStatus>> {
        Ok(self
            .backend
            .devices()?
            .into_iter()
            .find(|d| d.device_id == device_id)
            .map(|d| d.status))
    }

    /// The backend's entry for `device_id`, or the failure reply to send.
    fn lookup(&mut self, device_id: &str) -> Result<std::result::Result<GuestDriver, ActionReply>> {
        if device_id.trim().is_empty() {
            return Ok(Err(ActionReply::failed("device_id required")));
        }
        let device = self
            .backend
            .devices()?
            .into_iter()
            .find(|d| d.device_id.eq_ignore_ascii_case(device_id));
        Ok(device.ok_or_else(|| {
            warn!(device_id, "request for unknown device");
            ActionReply::failed(format!("Unknown device: {device_id}"))
        }))
    }
}

fn failed_for(device_id: &str, error: String) -> ActionReply {
    ActionReply {
        device_id: Some(device_id.to_string()),
        ..ActionReply::failed(error)
    }
}
