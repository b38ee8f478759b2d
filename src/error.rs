use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ASCOM error numbers used in Alpaca envelopes.
pub mod ascom {
    /// The member is not implemented.
    pub const NOT_IMPLEMENTED: i32 = 0x400;

    /// An argument was missing or out of range.
    pub const INVALID_VALUE: i32 = 0x401;

    /// The device is not connected.
    pub const NOT_CONNECTED: i32 = 0x407;

    /// The operation is not valid in the current state.
    pub const INVALID_OPERATION: i32 = 0x40B;

    /// The device did not answer in time.
    pub const DRIVER_TIMEOUT: i32 = 0x500;

    /// The device answered with something we could not use.
    pub const DRIVER_PROTOCOL: i32 = 0x501;

    /// The device configuration could not be interpreted.
    pub const DRIVER_CONFIG: i32 = 0x502;

    /// Anything else.
    pub const UNSPECIFIED: i32 = 0x4FF;
}

/// Errors thay may occur in this library.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum Error {
    /// The serial link to the device is down.
    /// Every command pending while the link failed gets this error.
    #[error("The device is not connected")]
    LinkDown,

    /// The device did not respond before the deadline.
    #[error("No response from the device within {0} ms")]
    Timeout(u64),

    /// The device responded with something malformed or unexpected.
    #[error("Device protocol error: {0}")]
    Protocol(String),

    /// The device configuration was fetched but could not be interpreted.
    #[error("Could not interpret the device configuration: {0}")]
    ConfigParse(String),

    /// A hub subscriber could not keep up and was dropped.
    #[error("Subscriber could not keep up with the log stream")]
    SubscriberOverrun,

    /// A request argument was missing or invalid.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The requested member is not implemented.
    #[error("{0} is not implemented")]
    NotImplemented(String),

    /// The operation is not valid right now.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// The configuration is not valid.
    #[error("Bad configuration: {0}")]
    BadConfig(String),

    /// The HTTP server or discovery responder could not run.
    #[error("Server problem: {0}")]
    Server(String),
}

impl Error {
    /// The ASCOM error number reported in the Alpaca envelope.
    pub fn error_number(&self) -> i32 {
        match self {
            Error::LinkDown => ascom::NOT_CONNECTED,
            Error::Timeout(_) => ascom::DRIVER_TIMEOUT,
            Error::Protocol(_) => ascom::DRIVER_PROTOCOL,
            Error::ConfigParse(_) => ascom::DRIVER_CONFIG,
            Error::InvalidValue(_) => ascom::INVALID_VALUE,
            Error::NotImplemented(_) => ascom::NOT_IMPLEMENTED,
            Error::InvalidOperation(_) => ascom::INVALID_OPERATION,
            Error::SubscriberOverrun | Error::BadConfig(_) | Error::Server(_) => {
                ascom::UNSPECIFIED
            }
        }
    }

    /// Get the message of a bad configuration error, if that is what this is.
    pub fn try_into_bad_config(self) -> Result<String, Self> {
        if let Self::BadConfig(v) = self {
            Ok(v)
        } else {
            Err(self)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_numbers_are_nonzero() {
        let errors = [
            Error::LinkDown,
            Error::Timeout(10),
            Error::Protocol("x".into()),
            Error::ConfigParse("x".into()),
            Error::SubscriberOverrun,
            Error::InvalidValue("x".into()),
            Error::NotImplemented("x".into()),
            Error::InvalidOperation("x".into()),
            Error::BadConfig("x".into()),
            Error::Server("x".into()),
        ];

        for error in errors {
            assert_ne!(error.error_number(), 0, "{error}");
        }
    }

    #[test]
    fn link_down_is_not_connected() {
        assert_eq!(Error::LinkDown.error_number(), 0x407);
    }
}
