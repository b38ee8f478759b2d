use std::io;

use thiserror::Error;

/// Problems with the serial link itself.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The device path could not be opened.
    #[error("Could not open `{path}`: {problem}")]
    Open {
        /// The path we tried.
        path: String,

        /// Why it did not work.
        problem: String,
    },

    /// IO related errors.
    #[error("Underlying IO problem")]
    IO(#[from] io::Error),

    /// The other end went away.
    #[error("Link closed by the device")]
    Closed,
}
