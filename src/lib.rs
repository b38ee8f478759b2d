#![deny(missing_docs)]

//! This crate puts an SV241 power box on the network as an ASCOM Alpaca switch device.
//!
//! The SV241 talks newline delimited JSON over a serial port.
//! The protocol has no request ids, so every command goes through a single
//! [`correlator`] worker which keeps one command on the wire at a time,
//! and which also reconnects when the port goes away.
//!
//! Which switches exist depends on the firmware configuration (dew heaters may be disabled),
//! so after every connect the [`topology`] is fetched and the switch table rebuilt.
//!
//! Log output and connection events are fanned out by the [`hub`] to websocket subscribers.
//!
//! Clients find the gateway through Alpaca [`discovery`].

/// The Alpaca HTTP surface.
pub mod alpaca;

/// Code relating to setting up a server.
pub mod server;

/// Possible errors in this library.
pub mod error;

/// Setting up logging.
pub mod logging;

/// The command line interface.
pub mod cli;

/// The server configuration.
pub mod config;

/// The line based link to the device.
pub mod link;

/// Serialized access to the device.
pub mod correlator;

/// Connection state and its transitions.
pub mod status;

/// The switch table.
pub mod topology;

/// Fan out of log lines and events.
pub mod hub;

/// Shared state tying everything together.
pub mod gateway;

/// Answering Alpaca discovery.
pub mod discovery;

/// A simulated device.
pub mod mock;

mod websocket;
