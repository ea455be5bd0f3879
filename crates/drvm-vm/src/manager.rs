use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::VmConfig;
use crate::error::{Result, VmError};
use crate::process;
use crate::usage::{self, ResourceUsage};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Running,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VmState::Stopped => "stopped",
            VmState::Running => "running",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub running: bool,
    pub pid: Option<u32>,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub disk_size_gb: u64,
    pub rpc_port: u16,
    pub install_mode: bool,
}

/// The emulator process, either spawned by this manager or picked up from
/// the pid file left by an earlier one.
enum GuestProcess {
    Child(Child),
    Adopted(u32),
}

impl GuestProcess {
    fn pid(&self) -> u32 {
        match self {
            GuestProcess::Child(child) => child.id(),
            GuestProcess::Adopted(pid) => *pid,
        }
    }

    fn is_alive(&mut self) -> bool {
        match self {
            GuestProcess::Child(child) => matches!(child.try_wait(), Ok(None)),
            GuestProcess::Adopted(pid) => process::is_alive(*pid),
        }
    }

    fn signal(&self, sig: libc::c_int) -> io::Result<()> {
        process::signal(self.pid(), sig)
    }

    /// Poll until the process exits or `timeout` passes. True if it exited.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Owns the driver VM's emulator process.
///
/// ```text
/// stopped --start(install_mode)--> running --stop--> stopped
/// ```
///
/// Whether the VM is running is re-checked against the process on every
/// query. Dropping the manager does NOT stop the VM; a later manager built
/// from the same config adopts it through the pid file.
pub struct VmManager {
    config: VmConfig,
    process: Option<GuestProcess>,
    install_mode: bool,
}

impl VmManager {
    pub fn new(config: VmConfig) -> Result<Self> {
        config.validate()?;
        for (service, port) in config.ignored_forwards() {
            warn!(service, port, "only the rpc port is forwarded, ignoring entry");
        }

        let mut manager = VmManager {
            config,
            process: None,
            install_mode: false,
        };
        manager.adopt_existing();
        info!(name = %manager.config.name, "VM manager initialized");
        Ok(manager)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Create the qcow2 disk image. An existing image is left alone.
    pub fn create_disk(&self) -> Result<()> {
        let disk = &self.config.disk_path;
        if disk.exists() {
            info!(disk = %disk.display(), "VM disk already exists");
            return Ok(());
        }
        if let Some(parent) = disk.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tool = &self.config.qemu_img_binary;
        let size = format!("{}G", self.config.disk_size_gb);
        let output = Command::new(tool)
            .args(["create", "-f", "qcow2"])
            .arg(disk)
            .arg(&size)
            .output()
            .map_err(|e| tool_error(tool, e))?;

        if !output.status.success() {
            return Err(VmError::ToolFailed {
                tool: tool.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(disk = %disk.display(), size, "created VM disk");
        Ok(())
    }

    /// Boot the VM. Succeeds without doing anything if it is already running.
    pub fn start(&mut self, install_mode: bool) -> Result<()> {
        if self.is_running() {
            info!(pid = ?self.pid(), "VM already running");
            return Ok(());
        }

        if install_mode {
            let image = self.config.guest_image.as_deref().ok_or_else(|| {
                VmError::InstallMediaMissing("no guest_image configured".into())
            })?;
            if !image.is_file() {
                return Err(VmError::InstallMediaMissing(format!(
                    "{} does not exist",
                    image.display()
                )));
            }
            self.create_disk()?;
        } else if !self.config.disk_path.exists() {
            return Err(VmError::DiskMissing(self.config.disk_path.clone()));
        }

        let args = qemu_args(&self.config, install_mode);
        let console_log = self.config.console_log_path();
        let console = open_console_log(&console_log)?;
        let console_err = console.try_clone()?;

        info!(
            command = %format!("{} {}", self.config.qemu_binary, args.join(" ")),
            install_mode,
            "starting VM"
        );
        let mut child = Command::new(&self.config.qemu_binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(console)
            .stderr(console_err)
            .spawn()
            .map_err(|e| tool_error(&self.config.qemu_binary, e))?;

        thread::sleep(self.config.startup_grace());
        if let Some(status) = child.try_wait()? {
            error!(%status, log = %console_log.display(), "VM failed to start");
            return Err(VmError::ExitedEarly { status, console_log });
        }

        let pid = child.id();
        if let Err(e) = fs::write(self.config.pid_path(), pid.to_string()) {
            warn!(error = %e, "could not write pid file, later invocations cannot adopt this VM");
        }
        self.process = Some(GuestProcess::Child(child));
        self.install_mode = install_mode;
        info!(pid, rpc_port = self.config.rpc_port(), "VM started");
        Ok(())
    }

    /// SIGTERM, wait up to `shutdown_timeout_secs`, then SIGKILL. A no-op
    /// when the VM is not running.
    pub fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            info!("VM not running");
            return Ok(());
        }
        let Some(mut guest) = self.process.take() else {
            return Ok(());
        };
        let pid = guest.pid();

        info!(pid, "stopping VM");
        if let Err(e) = guest.signal(libc::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM failed");
        }

        if guest.wait_for_exit(self.config.shutdown_timeout()) {
            info!(pid, "VM stopped gracefully");
        } else {
            warn!(pid, "VM did not stop gracefully, forcing");
            if let Err(e) = guest.signal(libc::SIGKILL) {
                warn!(pid, error = %e, "SIGKILL failed");
            }
            if !guest.wait_for_exit(KILL_TIMEOUT) {
                self.process = Some(guest);
                return Err(VmError::Timeout(pid));
            }
            info!(pid, "VM stopped forcefully");
        }

        self.install_mode = false;
        self.remove_pid_file();
        Ok(())
    }

    /// Re-checks the process. A VM that died on its own is forgotten here.
    pub fn is_running(&mut self) -> bool {
        let Some(guest) = self.process.as_mut() else {
            return false;
        };
        if guest.is_alive() {
            return true;
        }
        warn!(pid = guest.pid(), "VM process exited");
        self.process = None;
        self.install_mode = false;
        self.remove_pid_file();
        false
    }

    pub fn state(&mut self) -> VmState {
        if self.is_running() {
            VmState::Running
        } else {
            VmState::Stopped
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(GuestProcess::pid)
    }

    pub fn info(&mut self) -> VmInfo {
        let state = self.state();
        VmInfo {
            name: self.config.name.clone(),
            state,
            running: state == VmState::Running,
            pid: self.pid(),
            memory_mb: self.config.memory_mb,
            cpu_cores: self.config.cpu_cores,
            disk_size_gb: self.config.disk_size_gb,
            rpc_port: self.config.rpc_port(),
            install_mode: self.install_mode,
        }
    }

    pub fn resource_usage(&mut self) -> ResourceUsage {
        if !self.is_running() {
            return ResourceUsage::default();
        }
        match self.pid() {
            Some(pid) => usage::sample(pid, self.config.memory_mb),
            None => ResourceUsage::default(),
        }
    }

    fn adopt_existing(&mut self) {
        let pid_path = self.config.pid_path();
        let Ok(contents) = fs::read_to_string(&pid_path) else {
            return;
        };
        let disk = self.config.disk_path.to_string_lossy();
        match contents.trim().parse::<u32>() {
            Ok(pid) if process::is_alive(pid) && process::cmdline_mentions(pid, &disk) => {
                info!(pid, "adopted running VM");
                self.process = Some(GuestProcess::Adopted(pid));
            }
            _ => {
                debug!(path = %pid_path.display(), "removing stale pid file");
                self.remove_pid_file();
            }
        }
    }

    fn remove_pid_file(&self) {
        let path = self.config.pid_path();
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "could not remove pid file");
            }
        }
    }
}

/// The emulator command line for `config`, without the program name.
pub fn qemu_args(config: &VmConfig, install_mode: bool) -> Vec<String> {
    let mut args = Vec::new();
    if config.enable_kvm {
        args.push("-enable-kvm".to_string());
    }
    args.extend([
        "-name".to_string(),
        config.name.clone(),
        "-m".to_string(),
        config.memory_mb.to_string(),
        "-smp".to_string(),
        config.cpu_cores.to_string(),
        "-drive".to_string(),
        format!("file={},format=qcow2,if=virtio", config.disk_path.display()),
        "-netdev".to_string(),
        format!(
            "user,id=net0,hostfwd=tcp::{}-:{}",
            config.rpc_port(),
            config.guest_rpc_port
        ),
        "-device".to_string(),
        "virtio-net-pci,netdev=net0".to_string(),
        "-serial".to_string(),
        "stdio".to_string(),
    ]);

    if config.headless {
        args.extend(["-display".to_string(), "none".to_string()]);
    } else {
        args.extend(["-vnc".to_string(), config.vnc_display.clone()]);
    }

    if install_mode {
        if let Some(image) = &config.guest_image {
            args.extend([
                "-cdrom".to_string(),
                image.display().to_string(),
                "-boot".to_string(),
                "d".to_string(),
            ]);
        }
    }
    args
}

fn open_console_log(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn tool_error(tool: &str, err: io::Error) -> VmError {
    if err.kind() == io::ErrorKind::NotFound {
        VmError::ToolMissing(tool.to_string())
    } else {
        VmError::Io(err)
    }
}
