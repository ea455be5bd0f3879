use std::path::PathBuf;
use std::process::ExitStatus;

/// Errors raised while managing the driver VM.
#[derive(thiserror::Error, Debug)]
pub enum VmError {
    /// The disk image is missing and install mode was not requested.
    #[error("VM disk not found: {0}. Create it first or use install mode")]
    DiskMissing(PathBuf),

    /// Install mode needs a guest image that is configured and present.
    #[error("Install media unavailable: {0}")]
    InstallMediaMissing(String),

    /// A QEMU executable could not be found.
    #[error("{0} not found. Install QEMU (e.g. apt install qemu-system-x86 qemu-utils)")]
    ToolMissing(String),

    /// A QEMU helper ran but reported failure.
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    /// The emulator process died inside the startup grace period.
    #[error("VM exited during startup ({status}); see {console_log}")]
    ExitedEarly { status: ExitStatus, console_log: PathBuf },

    /// The process survived SIGKILL.
    #[error("VM process {0} did not exit")]
    Timeout(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The configuration violates the resource budget or is inconsistent.
    #[error("Invalid VM configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse VM configuration: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VmError>;
