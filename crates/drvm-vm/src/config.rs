use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VmError};

pub const MIN_MEMORY_MB: u64 = 128;
pub const MAX_MEMORY_MB: u64 = 2048;
pub const MAX_CPU_CORES: u32 = 2;

const RPC_SERVICE: &str = "rpc";

/// Driver VM settings. Every key is optional; missing keys take the defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    #[serde(alias = "vm_name")]
    pub name: String,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    #[serde(alias = "vm_image")]
    pub disk_path: PathBuf,
    pub disk_size_gb: u64,
    pub network: NetworkConfig,
    /// Installer ISO booted by `start(true)`.
    #[serde(alias = "windows_iso")]
    pub guest_image: Option<PathBuf>,
    pub headless: bool,
    pub vnc_display: String,
    pub enable_kvm: bool,
    pub qemu_binary: String,
    pub qemu_img_binary: String,
    /// Port the guest service listens on inside the VM.
    pub guest_rpc_port: u16,
    pub shutdown_timeout_secs: u64,
    pub startup_grace_ms: u64,
    /// Guest console output. Defaults to `<disk_path>.console.log`.
    pub console_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host ports forwarded into the guest, keyed by service. Only `rpc` is used.
    pub port_forward: BTreeMap<String, u16>,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            name: "drvm-driver-vm".into(),
            memory_mb: 512,
            cpu_cores: 1,
            disk_path: PathBuf::from(crate::default_data_dir()).join("driver-vm.qcow2"),
            disk_size_gb: 8,
            network: NetworkConfig::default(),
            guest_image: None,
            headless: true,
            vnc_display: ":1".into(),
            enable_kvm: true,
            qemu_binary: "qemu-system-x86_64".into(),
            qemu_img_binary: "qemu-img".into(),
            guest_rpc_port: default_rpc_port(),
            shutdown_timeout_secs: 10,
            startup_grace_ms: 2000,
            console_log: None,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            port_forward: BTreeMap::from([(RPC_SERVICE.to_string(), default_rpc_port())]),
        }
    }
}

const fn default_rpc_port() -> u16 {
    9999
}

impl VmConfig {
    /// Enforce the resource budget. Called by [`crate::VmManager::new`].
    pub fn validate(&self) -> Result<()> {
        if !(MIN_MEMORY_MB..=MAX_MEMORY_MB).contains(&self.memory_mb) {
            return Err(VmError::InvalidConfig(format!(
                "memory_mb must be between {MIN_MEMORY_MB} and {MAX_MEMORY_MB}, got {}",
                self.memory_mb
            )));
        }
        if !(1..=MAX_CPU_CORES).contains(&self.cpu_cores) {
            return Err(VmError::InvalidConfig(format!(
                "cpu_cores must be between 1 and {MAX_CPU_CORES}, got {}",
                self.cpu_cores
            )));
        }
        if self.disk_size_gb == 0 {
            return Err(VmError::InvalidConfig("disk_size_gb must be at least 1".into()));
        }
        if self.disk_path.as_os_str().is_empty() {
            return Err(VmError::InvalidConfig("disk_path must not be empty".into()));
        }
        if self.rpc_port() == 0 || self.guest_rpc_port == 0 {
            return Err(VmError::InvalidConfig("RPC ports must be non-zero".into()));
        }
        Ok(())
    }

    /// Host side of the RPC forward.
    pub fn rpc_port(&self) -> u16 {
        self.network
            .port_forward
            .get(RPC_SERVICE)
            .copied()
            .unwrap_or_else(default_rpc_port)
    }

    /// Forward entries other than `rpc`; these are not applied.
    pub fn ignored_forwards(&self) -> impl Iterator<Item = (&str, u16)> {
        self.network
            .port_forward
            .iter()
            .filter(|(service, _)| service.as_str() != RPC_SERVICE)
            .map(|(service, port)| (service.as_str(), *port))
    }

    pub fn pid_path(&self) -> PathBuf {
        with_suffix(&self.disk_path, ".pid")
    }

    pub fn console_log_path(&self) -> PathBuf {
        self.console_log
            .clone()
            .unwrap_or_else(|| with_suffix(&self.disk_path, ".console.log"))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
