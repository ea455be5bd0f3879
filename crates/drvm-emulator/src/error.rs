use crate::device::DeviceType;

/// Reasons a driver operation on the emulator can fail.
#[derive(thiserror::Error, Debug)]
pub enum EmulatorError {
    /// The driver file (on load) or the driver name (on unload) is unknown.
    #[error("Driver not found: {0}")]
    NotFound(String),

    /// The inferred device type is disabled in the config or has no
    /// registered handler.
    #[error("No handler available for device type: {0}")]
    Unsupported(DeviceType),

    /// The configured `max_drivers` limit has been reached.
    #[error("Maximum number of drivers reached ({0})")]
    CapacityExceeded(usize),

    /// A driver with the same file name is already loaded.
    #[error("Driver already loaded: {0}")]
    AlreadyLoaded(String),

    /// The device handler refused the operation or panicked.
    #[error("Handler failed for {driver}: {reason}")]
    HandlerFailure { driver: String, reason: String },
}

pub type Result<T> = std::result::Result<T, EmulatorError>;
