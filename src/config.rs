use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::Error, hub::DEFAULT_QUEUE_CAPACITY, logging};

/// The Alpaca HTTP port used unless configured otherwise.
pub const DEFAULT_NETWORK_PORT: u16 = 32241;

/// The port the Alpaca discovery protocol uses.
pub const DEFAULT_DISCOVERY_PORT: u16 = 32227;

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Likely "/dev/ttyUSBx" or "COMx".
    pub port: String,

    /// Baud rate. The SV241 talks at 115200.
    pub baud: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: if cfg!(windows) {
                "COM3".into()
            } else {
                "/dev/ttyUSB0".into()
            },
            baud: 115_200,
        }
    }
}

/// Timeouts and delays, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// How long an Alpaca request waits for the device.
    pub command_timeout_ms: u64,

    /// How long the firmware config query waits for the device.
    pub sync_timeout_ms: u64,

    /// Wait this long after connecting before asking for the firmware config.
    pub settle_delay_ms: u64,

    /// Wait this long between attempts to open the serial port.
    pub reconnect_interval_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            command_timeout_ms: 2000,
            sync_timeout_ms: 5000,
            settle_delay_ms: 1000,
            reconnect_interval_ms: 3000,
        }
    }
}

impl Timing {
    /// See [`Timing::command_timeout_ms`].
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// See [`Timing::sync_timeout_ms`].
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// See [`Timing::settle_delay_ms`].
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// See [`Timing::reconnect_interval_ms`].
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

/// Where and how much to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level for stdout and the log websocket, e.g. "info".
    pub level: String,

    /// Level for the log file.
    pub file_level: String,

    /// Write daily rotated log files here.
    /// No file logging if absent.
    pub directory: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file_level: "debug".into(),
            directory: None,
        }
    }
}

/// The configuration used for running the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The Alpaca HTTP port.
    pub network_port: u16,

    /// The UDP port answering Alpaca discovery.
    pub discovery_port: u16,

    /// See [`SerialConfig`].
    pub serial: SerialConfig,

    /// See [`Timing`].
    pub timing: Timing,

    /// Queue capacity per log stream subscriber.
    pub hub_queue_capacity: usize,

    /// Display names, keyed by internal switch name (e.g. "dc1" or "pwm2").
    /// Switches not listed here show their internal name.
    pub switch_names: BTreeMap<String, String>,

    /// See [`LogConfig`].
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network_port: DEFAULT_NETWORK_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            serial: SerialConfig::default(),
            timing: Timing::default(),
            hub_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            switch_names: BTreeMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    pub fn deserialize(input: &str) -> Result<Self, Error> {
        Self::ron()
            .from_str::<Config>(input)
            .map_err(|e| Error::BadConfig(format!("Could not parse configuration: {e}")))
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            switch_names: BTreeMap::from([
                ("dc1".to_string(), "Mount".to_string()),
                ("dc2".to_string(), "Camera".to_string()),
                ("pwm1".to_string(), "Main scope dew strap".to_string()),
            ]),
            log: LogConfig {
                directory: Some("logs".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap_or_else(|e| format!("Could not serialize configuration: {e}"))
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Result<Self, Error> {
        let path = p.as_ref();

        let s = std::fs::read_to_string(path)
            .map_err(|e| Error::BadConfig(format!("Could not read {path:?}: {e}")))?;

        Self::deserialize(&s)
    }

    fn check_ports(&self) -> Result<(), Error> {
        if self.network_port == 0 {
            return Err(Error::BadConfig(
                "The network port must be set, 0 is not a valid Alpaca port".into(),
            ));
        }

        if self.discovery_port == 0 {
            return Err(Error::BadConfig(
                "The discovery port must be set, 0 is not a valid discovery port".into(),
            ));
        }

        Ok(())
    }

    fn check_nonzero(&self) -> Result<(), Error> {
        let timings = [
            ("command_timeout_ms", self.timing.command_timeout_ms),
            ("sync_timeout_ms", self.timing.sync_timeout_ms),
            ("reconnect_interval_ms", self.timing.reconnect_interval_ms),
            ("hub_queue_capacity", self.hub_queue_capacity as u64),
            ("serial.baud", self.serial.baud as u64),
        ];

        for (name, value) in timings {
            if value == 0 {
                return Err(Error::BadConfig(format!("`{name}` must be larger than 0")));
            }
        }

        Ok(())
    }

    fn check_log_levels(&self) -> Result<(), Error> {
        let levels = [
            ("log.level", &self.log.level),
            ("log.file_level", &self.log.file_level),
        ];

        for (name, level) in levels {
            if logging::parse_level(level).is_none() {
                return Err(Error::BadConfig(format!(
                    "`{name}` is `{level}`, expected one of trace, debug, info, warn, error"
                )));
            }
        }

        Ok(())
    }

    /// Check the configuration makes sense.
    pub fn validate(&self) -> Result<(), Error> {
        self.check_ports()?;
        self.check_nonzero()?;
        self.check_log_levels()?;

        Ok(())
    }
}
