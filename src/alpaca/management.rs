//! The Alpaca management API.
//!
//! Management responses are not sequenced, their transaction ids are always 0.

use axum::{response::IntoResponse, Extension};
use serde::{Deserialize, Serialize};

use super::{envelope::Envelope, switch::DEVICE_NUMBER, DEVICE_NAME, UNIQUE_ID};
use crate::gateway::Gateway;

/// The Alpaca API versions served.
pub const API_VERSIONS: [u32; 1] = [1];

/// Describes the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerDescription {
    /// Name of this server.
    pub server_name: String,

    /// Who made it.
    pub manufacturer: String,

    /// Its version.
    pub manufacturer_version: String,

    /// Where it runs.
    pub location: String,
}

/// Describes a device the server serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescription {
    /// A name for humans.
    #[serde(rename = "DeviceName")]
    pub device_name: String,

    /// The Alpaca device type.
    #[serde(rename = "DeviceType")]
    pub device_type: String,

    /// The Alpaca device number.
    #[serde(rename = "DeviceNumber")]
    pub device_number: u32,

    /// Stays the same across restarts.
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
}

pub(crate) async fn api_versions() -> impl IntoResponse {
    Envelope::unsequenced(API_VERSIONS.to_vec())
}

pub(crate) async fn description(Extension(gateway): Extension<Gateway>) -> impl IntoResponse {
    Envelope::unsequenced(ServerDescription {
        server_name: format!("{DEVICE_NAME} Alpaca gateway"),
        manufacturer: env!("CARGO_PKG_NAME").into(),
        manufacturer_version: env!("CARGO_PKG_VERSION").into(),
        location: gateway.config().serial.port.clone(),
    })
}

pub(crate) async fn configured_devices() -> impl IntoResponse {
    Envelope::unsequenced(vec![DeviceDescription {
        device_name: DEVICE_NAME.into(),
        device_type: "Switch".into(),
        device_number: DEVICE_NUMBER,
        unique_id: UNIQUE_ID.into(),
    }])
}
