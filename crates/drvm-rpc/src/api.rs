//! Method names and payload shapes of the guest control plane.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

pub const LIST_DRIVERS: &str = "list_drivers";
pub const INSTALL_DRIVER: &str = "install_driver";
pub const UNINSTALL_DRIVER: &str = "uninstall_driver";
pub const GET_STATUS: &str = "get_status";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListDriversParams {
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceParams {
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Installed,
    NeedsDriver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDriver {
    pub device_id: String,
    pub device_name: String,
    pub category: String,
    pub status: DriverStatus,
    pub driver_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverList {
    pub success: bool,
    pub drivers: Vec<GuestDriver>,
    pub count: usize,
}

impl DriverList {
    pub fn new(drivers: Vec<GuestDriver>) -> Self {
        DriverList {
            success: true,
            count: drivers.len(),
            drivers,
        }
    }
}

/// Reply to `install_driver` / `uninstall_driver`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl ActionReply {
    pub fn ok(device_id: &str, message: impl Into<String>) -> Self {
        ActionReply {
            success: true,
            message: Some(message.into()),
            error: None,
            device_id: Some(device_id.to_string()),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        ActionReply {
            success: false,
            message: None,
            error: Some(error.into()),
            device_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestStatus {
    pub success: bool,
    pub vm_type: String,
    pub isolated: bool,
    pub installed_drivers_count: usize,
    pub memory_mb: u64,
    pub cpu_cores: u32,
    pub processes_count: usize,
}

/// `{"success": false, "error": ..}`
pub fn failure(error: impl Into<String>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("success".into(), Value::Bool(false));
    map.insert("error".into(), Value::String(error.into()));
    map
}

/// Serialize a value that must come out as a JSON object.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Map<String, Value>, serde_json::Error> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        _ => Err(<serde_json::Error as serde::ser::Error>::custom(
            "payload must serialize to a JSON object",
        )),
    }
}

pub fn from_payload<T: DeserializeOwned>(payload: Map<String, Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(payload))
}

/// Turn a `success: false` reply into [`Error::Remote`].
pub fn ensure_success(payload: &Map<String, Value>) -> Result<(), Error> {
    match payload.get("success") {
        Some(Value::Bool(true)) => Ok(()),
        _ => {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed without an error message");
            Err(Error::Remote(error.to_string()))
        }
    }
}
