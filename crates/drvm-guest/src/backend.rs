use std::fs;
use std::process::Command;

use anyhow::{bail, Context, Result};
use drvm_rpc::api::{DriverStatus, GuestDriver};
use tracing::{debug, info};

/// The guest OS as seen by the driver service.
pub trait DriverBackend: Send {
    fn name(&self) -> &'static str;

    /// Every device the OS knows about, with its driver state.
    fn devices(&mut self) -> Result<Vec<GuestDriver>>;

    fn install(&mut self, device_id: &str) -> Result<()>;

    fn uninstall(&mut self, device_id: &str) -> Result<()>;

    fn process_count(&self) -> usize;
}

/// `pnputil` on Windows, the in-memory catalog anywhere else.
pub fn default_backend() -> Box<dyn DriverBackend> {
    if cfg!(windows) {
        Box::new(PnpUtilBackend::new())
    } else {
        Box::new(CatalogBackend::default())
    }
}

/// Fixed device catalog. Installs and uninstalls flip the entry's status.
pub struct CatalogBackend {
    devices: Vec<GuestDriver>,
}

impl CatalogBackend {
    pub fn new(devices: Vec<GuestDriver>) -> Self {
        CatalogBackend { devices }
    }

    fn entry_mut(&mut self, device_id: &str) -> Result<&mut GuestDriver> {
        match self.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(entry) => Ok(entry),
            None => bail!("device {device_id} is not in the catalog"),
        }
    }
}

impl Default for CatalogBackend {
    fn default() -> Self {
        CatalogBackend::new(vec![
            GuestDriver {
                device_id: "PCI\\VEN_8086\\DEV_1234".into(),
                device_name: "Intel Network Adapter".into(),
                category: "network".into(),
                status: DriverStatus::Installed,
                driver_version: Some("22.100.0.1".into()),
            },
            GuestDriver {
                device_id: "PCI\\VEN_10DE\\DEV_1234".into(),
                device_name: "NVIDIA Graphics Adapter".into(),
                category: "display".into(),
                status: DriverStatus::NeedsDriver,
                driver_version: None,
            },
        ])
    }
}

impl DriverBackend for CatalogBackend {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn devices(&mut self) -> Result<Vec<GuestDriver>> {
        Ok(self.devices.clone())
    }

    fn install(&mut self, device_id: &str) -> Result<()> {
        let entry = self.entry_mut(device_id)?;
        entry.status = DriverStatus::Installed;
        entry.driver_version.get_or_insert_with(|| "1.0.0".into());
        Ok(())
    }

    fn uninstall(&mut self, device_id: &str) -> Result<()> {
        let entry = self.entry_mut(device_id)?;
        entry.status = DriverStatus::NeedsDriver;
        entry.driver_version = None;
        Ok(())
    }

    fn process_count(&self) -> usize {
        proc_process_count()
    }
}

/// Counts `/proc/<pid>` entries; zero where there is no procfs.
fn proc_process_count() -> usize {
    let Ok(entries) = fs::read_dir("/proc") else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_name()
                .to_str()
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}

/// Drives the Windows PnP manager through `pnputil` and `tasklist`.
pub struct PnpUtilBackend {
    pnputil: String,
    tasklist: String,
}

impl PnpUtilBackend {
    pub fn new() -> Self {
        PnpUtilBackend::with_tools("pnputil", "tasklist")
    }

    /// Use the given executables instead of the ones on `PATH`.
    pub fn with_tools(pnputil: impl Into<String>, tasklist: impl Into<String>) -> Self {
        PnpUtilBackend {
            pnputil: pnputil.into(),
            tasklist: tasklist.into(),
        }
    }

    fn pnputil(&self, args: &[&str]) -> Result<String> {
        run(&self.pnputil, args)
    }

    fn enumerate(&self) -> Result<Vec<PnpDevice>> {
        let out = self.pnputil(&["/enum-devices", "/drivers"])?;
        Ok(parse_enum_devices(&out))
    }
}

impl Default for PnpUtilBackend {
    fn default() -> Self {
        PnpUtilBackend::new()
    }
}

impl DriverBackend for PnpUtilBackend {
    fn name(&self) -> &'static str {
        "pnputil"
    }

    fn devices(&mut self) -> Result<Vec<GuestDriver>> {
        let devices = self.enumerate()?;
        debug!(count = devices.len(), "enumerated PnP devices");
        Ok(devices.into_iter().map(|d| d.driver).collect())
    }

    fn install(&mut self, device_id: &str) -> Result<()> {
        self.pnputil(&["/scan-devices", "/instanceid", device_id])?;
        info!(device_id, "rescanned device for driver install");
        Ok(())
    }

    /// Deletes the bound `oemN.inf` package. Removing only the device node
    /// would let the next rescan bind the same package again.
    fn uninstall(&mut self, device_id: &str) -> Result<()> {
        let inf = self
            .enumerate()?
            .into_iter()
            .find(|d| d.driver.device_id.eq_ignore_ascii_case(device_id))
            .and_then(|d| d.inf);
        let Some(inf) = inf else {
            bail!("no driver package is bound to {device_id}");
        };
        self.pnputil(&["/delete-driver", inf.as_str(), "/uninstall"])?;
        info!(device_id, inf = %inf, "deleted driver package");
        Ok(())
    }

    fn process_count(&self) -> usize {
        match run(&self.tasklist, &["/fo", "csv", "/nh"]) {
            Ok(out) => out.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(e) => {
                debug!(error = %e, "tasklist unavailable");
                0
            }
        }
    }
}

fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to run {program}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        bail!("{program} {} failed: {}", args.join(" "), detail.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// One `pnputil` device block: the reported entry plus the published name
/// (`oemN.inf`) of the package bound to it.
pub(crate) struct PnpDevice {
    pub driver: GuestDriver,
    pub inf: Option<String>,
}

/// Parse `pnputil /enum-devices /drivers` output. Each device block starts
/// at an `Instance ID:` line; a top-level `Driver Name:` names the bound
/// package, and the first `Driver Version:` in the block supplies the version.
pub(crate) fn parse_enum_devices(output: &str) -> Vec<PnpDevice> {
    let mut devices = Vec::new();
    let mut current: Option<PnpBlock> = None;

    for line in output.lines() {
        let indented = line.starts_with(char::is_whitespace);
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();

        if key == "Instance ID" && !indented {
            devices.extend(current.take().map(PnpBlock::finish));
            current = Some(PnpBlock::new(value));
            continue;
        }
        let Some(block) = current.as_mut() else {
            continue;
        };
        match key {
            "Device Description" => block.name = value.to_string(),
            "Class Name" if !block.in_matching => block.category = value.to_lowercase(),
            "Driver Name" if !block.in_matching && !value.is_empty() => {
                block.inf = Some(value.to_string());
            }
            "Matching Drivers" => block.in_matching = true,
            "Driver Version" if block.version.is_none() => {
                // "09/06/2012 8.4.1.0": the version is the last token.
                block.version = value.split_whitespace().last().map(str::to_string);
            }
            _ => {}
        }
    }
    devices.extend(current.map(PnpBlock::finish));
    devices
}

struct PnpBlock {
    id: String,
    name: String,
    category: String,
    inf: Option<String>,
    version: Option<String>,
    in_matching: bool,
}

impl PnpBlock {
    fn new(id: &str) -> Self {
        PnpBlock {
            id: id.to_string(),
            name: String::new(),
            category: String::new(),
            inf: None,
            version: None,
            in_matching: false,
        }
    }

    fn finish(self) -> PnpDevice {
        let name = if self.name.is_empty() {
            self.id.clone()
        } else {
            self.name
        };
        let bound = self.inf.is_some();
        PnpDevice {
            driver: GuestDriver {
                device_id: self.id,
                device_name: name,
                category: self.category,
                status: if bound {
                    DriverStatus::Installed
                } else {
                    DriverStatus::NeedsDriver
                },
                driver_version: if bound { self.version } else { None },
            },
            inf: self.inf,
        }
    }
}
