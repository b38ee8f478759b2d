//! The Alpaca HTTP surface.
//!
//! Every device response is wrapped in an [`envelope::Envelope`].
//! Errors are reported inside the envelope with HTTP 200,
//! only requests for devices which do not exist get an HTTP error.

/// Response envelopes and transaction ids.
pub mod envelope;

/// Case insensitive request parameters.
pub mod params;

/// The switch device.
pub mod switch;

/// The management API.
pub mod management;

/// What the device calls itself.
pub const DEVICE_NAME: &str = "SV241";

/// The ASCOM ISwitch interface version implemented.
pub const INTERFACE_VERSION: i32 = 2;

/// The device's Alpaca unique id.
pub const UNIQUE_ID: &str = "5a8f3b1e-2c4d-4e6f-9a0b-241c0ffee241";
