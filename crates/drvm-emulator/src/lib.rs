//! Host-local driver emulation: a registry of loaded driver records and a
//! set of pluggable device handlers that enumerate host hardware.

mod config;
mod device;
mod emulator;
mod error;
pub mod handlers;

pub use config::{EmulatorConfig, LoggingConfig, SecurityConfig};
pub use device::{
    infer_device_type, DeviceRecord, DeviceType, DriverMetadata, DriverRecord,
    ParseDeviceTypeError,
};
pub use emulator::{CompatibilityReport, DriverEmulator};
pub use error::{EmulatorError, Result};
pub use handlers::{DeviceHandler, HandlerRegistry};
